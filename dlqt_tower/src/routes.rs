use std::collections::HashMap;

use dlqt_oauth2::Access;
use http::Method;

/// The static table of what each protected route requires
///
/// Routes are matched by method and exact path. A request for a route that
/// is not in the table is refused once its token has been verified.
#[derive(Clone, Debug, Default)]
#[must_use]
pub struct RouteTable {
    routes: HashMap<(Method, String), Access>,
}

impl RouteTable {
    /// An empty table, refusing every route
    pub fn new() -> Self {
        Self::default()
    }

    /// Requires `access` for `method` requests to `path`
    ///
    /// A later requirement for the same route replaces the earlier one.
    pub fn with_route(mut self, method: Method, path: impl Into<String>, access: Access) -> Self {
        self.insert(method, path, access);
        self
    }

    /// Requires `access` for `method` requests to `path`
    pub fn insert(&mut self, method: Method, path: impl Into<String>, access: Access) {
        self.routes.insert((method, path.into()), access);
    }

    /// The requirement for a route, if it is mapped
    #[must_use]
    pub fn access(&self, method: &Method, path: &str) -> Option<&Access> {
        // The key is owned, so lookups build one
        self.routes.get(&(method.clone(), path.to_owned()))
    }

    /// The number of mapped routes
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether no routes are mapped
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RouteTable {
        RouteTable::new()
            .with_route(Method::GET, "/fetch", Access::grant_from_static("dlq.fetch"))
            .with_route(Method::POST, "/check-auth", Access::Identified)
    }

    #[test]
    fn matches_method_and_exact_path() {
        let table = table();

        assert_eq!(
            table.access(&Method::GET, "/fetch"),
            Some(&Access::grant_from_static("dlq.fetch"))
        );
        assert_eq!(table.access(&Method::POST, "/fetch"), None);
        assert_eq!(table.access(&Method::GET, "/fetch/"), None);
        assert_eq!(table.access(&Method::GET, "/FETCH"), None);
    }

    #[test]
    fn later_requirement_replaces_earlier() {
        let table = table().with_route(Method::POST, "/check-auth", Access::Authenticated);

        assert_eq!(table.len(), 2);
        assert_eq!(
            table.access(&Method::POST, "/check-auth"),
            Some(&Access::Authenticated)
        );
    }
}
