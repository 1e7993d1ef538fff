use std::{collections::HashSet, convert::Infallible, fmt, str::FromStr};

use aliri_braid::braid;
use dlqt_auth::ClaimSet;
use thiserror::Error;

use crate::Principal;

/// An invalid grant token
#[derive(Debug, Error)]
pub enum InvalidGrant {
    /// The grant was the empty string
    #[error("grant cannot be empty")]
    EmptyString,
    /// The grant contained an invalid byte
    #[error("invalid grant byte at position {position}: 0x{value:02x}")]
    InvalidByte {
        /// The index in the grant where the invalid byte was found
        position: usize,
        /// The invalid byte value
        value: u8,
    },
}

impl From<Infallible> for InvalidGrant {
    #[inline(always)]
    fn from(x: Infallible) -> Self {
        match x {}
    }
}

/// A single scope or role name, such as `dlq.fetch`
///
/// A grant must be composed of printable ASCII characters excluding
/// ` ` (space), `"` (double quote), and `\` (backslash), as OAuth2 scope
/// tokens are.
#[braid(serde, validator, ref_doc = "A borrowed reference to a [`Grant`]")]
pub struct Grant;

impl aliri_braid::Validator for Grant {
    type Error = InvalidGrant;

    fn validate(s: &str) -> Result<(), Self::Error> {
        if s.is_empty() {
            Err(InvalidGrant::EmptyString)
        } else if let Some((position, &value)) = s
            .as_bytes()
            .iter()
            .enumerate()
            .find(|(_, &b)| b <= 0x20 || b == 0x22 || b == 0x5C || 0x7F <= b)
        {
            Err(InvalidGrant::InvalidByte { position, value })
        } else {
            Ok(())
        }
    }
}

/// The grants held by a verified caller
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Grants(HashSet<Grant>);

impl Grants {
    /// Produces an empty set of grants
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Adds a grant
    pub fn insert(&mut self, grant: Grant) {
        self.0.insert(grant);
    }

    /// Whether `grant` is held, by exact comparison
    #[must_use]
    pub fn contains(&self, grant: &GrantRef) -> bool {
        self.0.contains(grant)
    }

    /// Iterates over the held grants in no particular order
    pub fn iter(&self) -> impl Iterator<Item = &GrantRef> {
        self.0.iter().map(|g| &**g)
    }

    /// The number of grants held
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no grants are held
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<Grant> for Grants {
    fn from_iter<I: IntoIterator<Item = Grant>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Extend<Grant> for Grants {
    fn extend<I: IntoIterator<Item = Grant>>(&mut self, iter: I) {
        self.0.extend(iter);
    }
}

/// The claim from which a deployment reads grants
///
/// A deployment reads exactly one of these. The other claim is ignored even
/// when present, so a role can never satisfy a scope requirement or the
/// reverse.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum GrantClaim {
    /// Delegated scopes, a space-separated `scp` string
    #[default]
    Scope,

    /// Application roles, a `roles` list
    Roles,
}

impl GrantClaim {
    /// The claim name as it appears in a token
    #[must_use]
    pub const fn claim_name(self) -> &'static str {
        match self {
            Self::Scope => "scp",
            Self::Roles => "roles",
        }
    }

    /// Reads the grants from verified claims
    ///
    /// Scope strings are split on whitespace. Entries that are not valid
    /// grants are skipped.
    #[must_use]
    pub fn grants(self, claims: &ClaimSet) -> Grants {
        let parse = |raw: &str| match Grant::new(raw.to_owned()) {
            Ok(grant) => Some(grant),
            Err(error) => {
                let error: &dyn std::error::Error = &error;
                tracing::debug!(claim = self.claim_name(), error, "ignoring invalid grant");
                None
            }
        };

        match self {
            Self::Scope => claims
                .scp
                .as_deref()
                .map(|scp| scp.split_whitespace().filter_map(parse).collect())
                .unwrap_or_default(),
            Self::Roles => claims.roles.iter().map(String::as_str).filter_map(parse).collect(),
        }
    }
}

impl fmt::Display for GrantClaim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.claim_name())
    }
}

/// An unrecognized grant claim name
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("unknown grant claim '{0}'; expected 'scp' or 'roles'")]
pub struct UnknownGrantClaim(String);

impl FromStr for GrantClaim {
    type Err = UnknownGrantClaim;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scp" | "scope" => Ok(Self::Scope),
            "roles" => Ok(Self::Roles),
            other => Err(UnknownGrantClaim(other.to_owned())),
        }
    }
}

/// What a route requires of a verified caller
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Access {
    /// Any verified token
    Authenticated,

    /// A verified token naming a known principal
    Identified,

    /// A known principal holding this grant
    Grant(Grant),
}

impl Access {
    /// Requires the named grant
    ///
    /// # Panics
    ///
    /// Panics if `grant` is not a valid grant.
    #[must_use]
    pub fn grant_from_static(grant: &'static str) -> Self {
        Self::Grant(Grant::from_static(grant))
    }

    /// The required grant, if any
    #[must_use]
    pub fn grant(&self) -> Option<&GrantRef> {
        match self {
            Self::Grant(grant) => Some(grant),
            Self::Authenticated | Self::Identified => None,
        }
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Authenticated => f.write_str("authenticated"),
            Self::Identified => f.write_str("identified"),
            Self::Grant(grant) => write!(f, "grant({grant})"),
        }
    }
}

/// A verified caller lacks what a route requires
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum GrantDenied {
    /// The required scope or role is not held
    #[error("missing required {claim}: {grant}")]
    MissingScope {
        /// The required grant
        grant: Grant,
        /// The claim grants were read from
        claim: GrantClaim,
    },

    /// The token does not name a known principal
    #[error("token does not identify a principal")]
    UnknownPrincipal,
}

/// Decides whether verified claims satisfy a route's [`Access`] requirement
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[must_use]
pub struct GrantAuthorizer {
    claim: GrantClaim,
}

impl GrantAuthorizer {
    /// Reads grants from `claim`
    pub const fn new(claim: GrantClaim) -> Self {
        Self { claim }
    }

    /// The claim grants are read from
    #[must_use]
    pub const fn claim(&self) -> GrantClaim {
        self.claim
    }

    /// Authorizes `access` for a verified caller
    ///
    /// # Errors
    ///
    /// * [`GrantDenied::UnknownPrincipal`] if `access` needs a known principal
    ///   and there is none
    /// * [`GrantDenied::MissingScope`] if the required grant is not held
    pub fn authorize(
        &self,
        claims: &ClaimSet,
        principal: &Principal,
        access: &Access,
    ) -> Result<(), GrantDenied> {
        let required = match access {
            Access::Authenticated => return Ok(()),
            Access::Identified | Access::Grant(_) if !principal.is_known() => {
                return Err(GrantDenied::UnknownPrincipal)
            }
            Access::Identified => return Ok(()),
            Access::Grant(grant) => grant,
        };

        if self.claim.grants(claims).contains(required) {
            Ok(())
        } else {
            tracing::debug!(claim = %self.claim, %required, "required grant not held");
            Err(GrantDenied::MissingScope {
                grant: required.clone(),
                claim: self.claim,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use dlqt_auth::{testing, UnixTime};

    use super::*;

    fn claims() -> ClaimSet {
        testing::claims(UnixTime(1_700_000_000))
    }

    fn authorize(claim: GrantClaim, claims: &ClaimSet, access: &Access) -> Result<(), GrantDenied> {
        let principal = Principal::from_claims(claims);
        GrantAuthorizer::new(claim).authorize(claims, &principal, access)
    }

    #[test]
    fn held_scope_is_granted() {
        let access = Access::grant_from_static("dlq.fetch");
        assert_eq!(authorize(GrantClaim::Scope, &claims(), &access), Ok(()));
    }

    #[test]
    fn missing_scope_is_denied() {
        let access = Access::grant_from_static("dlq.purge");
        let err = authorize(GrantClaim::Scope, &claims(), &access).unwrap_err();

        assert_eq!(err.to_string(), "missing required scp: dlq.purge");
    }

    #[test]
    fn scope_match_is_by_whole_token() {
        let claims = claims().with_scp("dlq.fetched_elsewhere xdlq.fetch");
        let access = Access::grant_from_static("dlq.fetch");

        assert!(matches!(
            authorize(GrantClaim::Scope, &claims, &access),
            Err(GrantDenied::MissingScope { .. })
        ));
    }

    #[test]
    fn scope_match_is_case_sensitive() {
        let claims = claims().with_scp("DLQ.FETCH");
        let access = Access::grant_from_static("dlq.fetch");

        assert!(authorize(GrantClaim::Scope, &claims, &access).is_err());
    }

    #[test]
    fn scopes_split_on_any_whitespace() {
        let claims = claims().with_scp("  dlq.purge\tdlq.fetch\n");
        let grants = GrantClaim::Scope.grants(&claims);

        assert_eq!(grants.len(), 2);
        assert!(grants.contains(GrantRef::from_static("dlq.fetch")));
    }

    #[test]
    fn roles_deployment_ignores_scopes() {
        let access = Access::grant_from_static("dlq.fetch");
        assert!(authorize(GrantClaim::Roles, &claims(), &access).is_err());

        let claims = claims().with_roles(["dlq.fetch"]);
        assert_eq!(authorize(GrantClaim::Roles, &claims, &access), Ok(()));
    }

    #[test]
    fn scope_deployment_ignores_roles() {
        let claims = claims().with_scp("").with_roles(["dlq.purge"]);
        let access = Access::grant_from_static("dlq.purge");

        assert!(authorize(GrantClaim::Scope, &claims, &access).is_err());
    }

    #[test]
    fn grants_require_known_principal() {
        let claims = claims().without_object_id();

        assert_eq!(
            authorize(GrantClaim::Scope, &claims, &Access::grant_from_static("dlq.fetch")),
            Err(GrantDenied::UnknownPrincipal)
        );
        assert_eq!(
            authorize(GrantClaim::Scope, &claims, &Access::Identified),
            Err(GrantDenied::UnknownPrincipal)
        );
        assert_eq!(
            authorize(GrantClaim::Scope, &claims, &Access::Authenticated),
            Ok(())
        );
    }

    #[test]
    fn parses_grant_claim_names() {
        assert_eq!("scp".parse(), Ok(GrantClaim::Scope));
        assert_eq!("scope".parse(), Ok(GrantClaim::Scope));
        assert_eq!("roles".parse(), Ok(GrantClaim::Roles));
        assert!("groups".parse::<GrantClaim>().is_err());
    }

    #[test]
    fn rejects_grants_with_whitespace() {
        assert!(Grant::new("dlq fetch".to_owned()).is_err());
        assert!(Grant::new(String::new()).is_err());
    }

    #[test]
    fn validated_grant_conversions() {
        let parsed = "dlq.fetch".parse::<Grant>().ok();
        assert_eq!(parsed, Some(Grant::from_static("dlq.fetch")));
        assert!("dlq fetch".parse::<Grant>().is_err());
        assert!(GrantRef::from_str("dlq.purge").is_ok());
        assert!(GrantRef::from_str("dlq\\purge").is_err());
    }
}
