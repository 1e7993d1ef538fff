use std::{fmt, future::Future, pin::Pin, sync::Arc};

use dlqt_auth::{ClaimSet, Token};
use dlqt_oauth2::{
    Access, Authority, AuthorityError, FailureClass, GrantRef, Principal, TenantIdRef, Verified,
};
use http::{Request, Response, StatusCode};
use thiserror::Error;
use tracing::Instrument;
use tower_http::auth::{AsyncAuthorizeRequest, AsyncRequireAuthorizationLayer};

use crate::{
    bearer_token,
    util::{forbidden, unauthorized, unavailable},
    CredentialError, RouteTable, TerseErrorHandler,
};

/// The verified caller of a request that passed the gateway
///
/// Inserted into the request extensions; downstream handlers read it from
/// there instead of looking at the token again.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Authenticated {
    verified: Verified,
    access: Access,
}

impl Authenticated {
    /// The caller
    #[must_use]
    pub fn principal(&self) -> &Principal {
        self.verified.principal()
    }

    /// The verified claims
    #[must_use]
    pub fn claims(&self) -> &ClaimSet {
        self.verified.claims()
    }

    /// The tenant whose key verified the token
    #[must_use]
    pub fn tenant(&self) -> &TenantIdRef {
        self.verified.tenant()
    }

    /// The requirement the route imposed
    #[must_use]
    pub fn access(&self) -> &Access {
        &self.access
    }

    /// The grant the route required, if any
    #[must_use]
    pub fn grant(&self) -> Option<&GrantRef> {
        self.access.grant()
    }
}

/// Why the gateway turned a request away
#[derive(Debug, Error)]
pub enum Rejection {
    /// The request carried no usable bearer credential
    #[error(transparent)]
    Credential(#[from] CredentialError),

    /// The token failed verification or authorization
    #[error(transparent)]
    Authority(#[from] AuthorityError),

    /// The route is not in the route table
    #[error("route not permitted")]
    RouteNotPermitted,
}

impl Rejection {
    /// The response status for this rejection
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Credential(_) => StatusCode::UNAUTHORIZED,
            Self::Authority(err) => match err.class() {
                FailureClass::Unauthenticated => StatusCode::UNAUTHORIZED,
                FailureClass::Forbidden => StatusCode::FORBIDDEN,
                FailureClass::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            },
            Self::RouteNotPermitted => StatusCode::FORBIDDEN,
        }
    }

    /// The grant that was required but not held, if that was the failure
    #[must_use]
    pub fn missing_grant(&self) -> Option<&GrantRef> {
        match self {
            Self::Authority(err) => err.missing_grant(),
            Self::Credential(_) | Self::RouteNotPermitted => None,
        }
    }
}

/// Handler for responding to requests the gateway turned away
pub trait OnAuthError {
    /// The body type returned on an error
    type Body;

    /// Response for a rejected request
    fn on_rejection(&self, rejection: &Rejection) -> Response<Self::Body>;
}

macro_rules! delegate_impls {
    ($($ty:ty)*) => {
        $(
            impl<T> OnAuthError for $ty
            where
                T: OnAuthError + ?Sized,
            {
                type Body = T::Body;

                fn on_rejection(&self, rejection: &Rejection) -> Response<Self::Body> {
                    T::on_rejection(self, rejection)
                }
            }
        )*
    }
}

delegate_impls!(
    &'_ T
    Box<T>
    Arc<T>
);

/// Responds with the status code, a `www-authenticate` challenge, and a
/// short fixed body; never with failure detail
impl<ResBody> OnAuthError for TerseErrorHandler<ResBody>
where
    ResBody: From<&'static str>,
{
    type Body = ResBody;

    #[inline]
    fn on_rejection(&self, rejection: &Rejection) -> Response<Self::Body> {
        match rejection.status() {
            StatusCode::FORBIDDEN => forbidden("", rejection.missing_grant()),
            StatusCode::SERVICE_UNAVAILABLE => unavailable(),
            _ => unauthorized(""),
        }
    }
}

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Authenticates and authorizes every request before it reaches the inner
/// service
///
/// For each request the gateway
///
/// 1. extracts the bearer token
/// 2. verifies it with the [`Authority`]
/// 3. refuses routes missing from the [`RouteTable`]
/// 4. checks the route's [`Access`] requirement
///
/// On success an [`Authenticated`] record is added to the request
/// extensions. On failure the inner service is never called.
#[must_use]
pub struct Gateway<OnError> {
    authority: Authority,
    routes: Arc<RouteTable>,
    on_error: OnError,
}

impl<OnError> Clone for Gateway<OnError>
where
    OnError: Clone,
{
    #[inline]
    fn clone(&self) -> Self {
        Self {
            authority: self.authority.clone(),
            routes: Arc::clone(&self.routes),
            on_error: self.on_error.clone(),
        }
    }
}

impl<OnError> fmt::Debug for Gateway<OnError>
where
    OnError: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Gateway")
            .field("authority", &self.authority)
            .field("routes", &self.routes)
            .field("on_error", &self.on_error)
            .finish()
    }
}

impl<ResBody> Gateway<TerseErrorHandler<ResBody>> {
    /// A gateway verifying tokens with `authority` against `routes`
    #[inline]
    pub fn new(authority: Authority, routes: RouteTable) -> Self {
        Self {
            authority,
            routes: Arc::new(routes),
            on_error: TerseErrorHandler::new(),
        }
    }
}

impl<OnError> Gateway<OnError> {
    /// Attaches a custom error handler to generate responses
    /// in the event of a rejection
    #[inline]
    pub fn with_error_handler<E>(self, on_error: E) -> Gateway<E> {
        Gateway {
            authority: self.authority,
            routes: self.routes,
            on_error,
        }
    }

    /// Wraps the gateway into a layer
    pub fn into_layer(self) -> AsyncRequireAuthorizationLayer<Self> {
        AsyncRequireAuthorizationLayer::new(self)
    }

    async fn admit(
        authority: Authority,
        credential: Result<Token, CredentialError>,
        access: Option<Access>,
    ) -> Result<Authenticated, Rejection> {
        let token = credential?;
        let verified = authority.verify(&token).await?;

        let access = access.ok_or(Rejection::RouteNotPermitted)?;
        authority.authorize(&verified, &access)?;

        Ok(Authenticated { verified, access })
    }
}

impl<ReqBody, OnError> AsyncAuthorizeRequest<ReqBody> for Gateway<OnError>
where
    ReqBody: Send + 'static,
    OnError: OnAuthError + Clone + Send + Sync + 'static,
    OnError::Body: Send + 'static,
{
    type RequestBody = ReqBody;
    type ResponseBody = OnError::Body;
    type Future = BoxFuture<Result<Request<ReqBody>, Response<OnError::Body>>>;

    fn authorize(&mut self, mut request: Request<ReqBody>) -> Self::Future {
        let credential = bearer_token(request.headers()).map(ToOwned::to_owned);
        let access = self
            .routes
            .access(request.method(), request.uri().path())
            .cloned();

        let authority = self.authority.clone();
        let on_error = self.on_error.clone();

        let span = tracing::debug_span!(
            "gateway",
            http.method = %request.method(),
            http.path = request.uri().path(),
        );

        Box::pin(
            async move {
                match Self::admit(authority, credential, access).await {
                    Ok(authenticated) => {
                        tracing::trace!(principal = %authenticated.principal(), "request admitted");
                        request.extensions_mut().insert(authenticated);
                        Ok(request)
                    }
                    Err(rejection) => {
                        let status = rejection.status();
                        let error: &dyn std::error::Error = &rejection;
                        if status == StatusCode::SERVICE_UNAVAILABLE {
                            tracing::warn!(error, http.status_code = status.as_u16(), "request rejected");
                        } else {
                            tracing::debug!(error, http.status_code = status.as_u16(), "request rejected");
                        }
                        Err(on_error.on_rejection(&rejection))
                    }
                }
            }
            .instrument(span),
        )
    }
}
