use std::{fmt, sync::Arc, time::Duration};

use dlqt_auth::{
    error::{ClaimsRejected, MalformedToken, TokenVerifyError, UnsupportedAlgorithm},
    jwa::Algorithm,
    jwt::{Decomposed, TemporalValidator},
    ClaimSet, Clock, System, TokenRef,
};
use thiserror::Error;

use crate::{
    Access, ClaimsDenied, ClaimsValidator, GrantAuthorizer, GrantClaim, GrantDenied, KeyError,
    KeyResolver, Principal, TenantId, TenantSelector,
};

/// Why a presented token was not accepted for a route
#[derive(Debug, Error)]
pub enum AuthorityError {
    /// The token is not a well-formed signed token
    #[error("malformed token")]
    Malformed(#[from] MalformedToken),

    /// The token header does not name a signing key
    #[error("malformed token: no key id in header")]
    MissingKeyId,

    /// The token names an algorithm outside the RSA family
    #[error(transparent)]
    UnsupportedAlgorithm(#[from] UnsupportedAlgorithm),

    /// No verification key could be obtained for the token
    #[error("verification key unavailable")]
    KeyUnavailable(#[from] KeyError),

    /// The signature does not verify under the published key
    #[error("token signature invalid")]
    SignatureInvalid,

    /// The token is outside its validity window
    #[error("token rejected")]
    TokenRejected(#[from] ClaimsRejected),

    /// The token was issued for another audience or by an untrusted issuer
    #[error("token not accepted by this service")]
    ClaimsDenied(#[from] ClaimsDenied),

    /// The caller is not entitled to the route
    #[error("access denied")]
    GrantDenied(#[from] GrantDenied),
}

impl From<TokenVerifyError> for AuthorityError {
    fn from(err: TokenVerifyError) -> Self {
        match err {
            TokenVerifyError::Malformed(err) => Self::Malformed(err),
            TokenVerifyError::UnsupportedAlgorithm(err) => Self::UnsupportedAlgorithm(err),
            TokenVerifyError::SignatureMismatch(_) => Self::SignatureInvalid,
            TokenVerifyError::ClaimsRejected(err) => Self::TokenRejected(err),
        }
    }
}

/// The broad outcome class of a pipeline failure
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// No trustworthy identity could be established
    Unauthenticated,

    /// The identity is trustworthy but not entitled
    Forbidden,

    /// The identity provider could not be reached
    Unavailable,
}

impl AuthorityError {
    /// Classifies the failure for the response
    #[must_use]
    pub fn class(&self) -> FailureClass {
        match self {
            Self::KeyUnavailable(err) if err.is_provider_outage() => FailureClass::Unavailable,
            Self::Malformed(_)
            | Self::MissingKeyId
            | Self::UnsupportedAlgorithm(_)
            | Self::KeyUnavailable(_)
            | Self::SignatureInvalid
            | Self::TokenRejected(_) => FailureClass::Unauthenticated,
            Self::ClaimsDenied(_) | Self::GrantDenied(_) => FailureClass::Forbidden,
        }
    }

    /// The grant that was required but not held, if that was the failure
    #[must_use]
    pub fn missing_grant(&self) -> Option<&crate::GrantRef> {
        match self {
            Self::GrantDenied(GrantDenied::MissingScope { grant, .. }) => Some(grant),
            _ => None,
        }
    }
}

/// A token whose signature, validity window, audience, and issuer have all
/// been checked
#[derive(Clone, Debug, PartialEq, Eq)]
#[must_use]
pub struct Verified {
    claims: ClaimSet,
    principal: Principal,
    tenant: TenantId,
    algorithm: Algorithm,
}

impl Verified {
    /// The verified claims
    pub fn claims(&self) -> &ClaimSet {
        &self.claims
    }

    /// The caller
    #[must_use]
    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    /// The tenant whose key verified the token
    #[must_use]
    pub fn tenant(&self) -> &crate::TenantIdRef {
        &self.tenant
    }

    /// The algorithm the token was signed with
    #[must_use]
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Decomposes into claims and principal
    #[must_use]
    pub fn into_parts(self) -> (ClaimSet, Principal) {
        (self.claims, self.principal)
    }
}

/// The terminal outcome of authorizing one request
#[derive(Debug)]
#[must_use]
pub enum Decision {
    /// The caller may proceed
    Granted(Verified),

    /// The caller is turned away
    Denied {
        /// The caller, if the token was verified before the denial
        principal: Option<Principal>,
        /// Why access was denied
        reason: AuthorityError,
    },
}

impl Decision {
    /// The caller, if one was established
    #[must_use]
    pub fn principal(&self) -> Option<&Principal> {
        match self {
            Self::Granted(verified) => Some(verified.principal()),
            Self::Denied { principal, .. } => principal.as_ref(),
        }
    }

    /// Whether access was granted
    #[must_use]
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted(_))
    }

    /// The reason for a denial
    #[must_use]
    pub fn denial(&self) -> Option<&AuthorityError> {
        match self {
            Self::Granted(_) => None,
            Self::Denied { reason, .. } => Some(reason),
        }
    }

    /// Converts into a result
    ///
    /// # Errors
    ///
    /// Returns the denial reason if access was not granted.
    pub fn into_result(self) -> Result<Verified, AuthorityError> {
        match self {
            Self::Granted(verified) => Ok(verified),
            Self::Denied { reason, .. } => Err(reason),
        }
    }
}

struct Inner {
    resolver: KeyResolver,
    claims: ClaimsValidator,
    selector: TenantSelector,
    authorizer: GrantAuthorizer,
    temporal: TemporalValidator,
    clock: Arc<dyn Clock + Send + Sync>,
}

impl fmt::Debug for Inner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inner")
            .field("resolver", &self.resolver)
            .field("claims", &self.claims)
            .field("selector", &self.selector)
            .field("authorizer", &self.authorizer)
            .field("temporal", &self.temporal)
            .finish_non_exhaustive()
    }
}

/// Verifies presented tokens and authorizes them for routes
///
/// Cloning is cheap; clones share the key cache.
#[derive(Debug, Clone)]
#[must_use]
pub struct Authority {
    inner: Arc<Inner>,
}

/// Configures an [`Authority`]
#[must_use]
pub struct AuthorityBuilder {
    resolver: KeyResolver,
    claims: ClaimsValidator,
    selector: Option<TenantSelector>,
    authorizer: GrantAuthorizer,
    temporal: TemporalValidator,
    clock: Arc<dyn Clock + Send + Sync>,
}

impl fmt::Debug for AuthorityBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorityBuilder")
            .field("resolver", &self.resolver)
            .field("claims", &self.claims)
            .field("selector", &self.selector)
            .field("authorizer", &self.authorizer)
            .field("temporal", &self.temporal)
            .finish_non_exhaustive()
    }
}

impl AuthorityBuilder {
    /// Chooses how the verifying tenant is selected
    ///
    /// Defaults to [`TenantSelector::FromIssuer`].
    pub fn with_tenant_selector(mut self, selector: TenantSelector) -> Self {
        self.selector = Some(selector);
        self
    }

    /// Chooses the claim grants are read from
    pub fn with_grant_claim(mut self, claim: GrantClaim) -> Self {
        self.authorizer = GrantAuthorizer::new(claim);
        self
    }

    /// Tolerates clock skew on either side of the validity window
    pub fn with_leeway(mut self, leeway: Duration) -> Self {
        self.temporal = self.temporal.with_leeway(leeway);
        self
    }

    /// Replaces the system clock
    pub fn with_clock<C>(mut self, clock: C) -> Self
    where
        C: Clock + Send + Sync + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    /// Builds the authority
    pub fn build(self) -> Authority {
        Authority {
            inner: Arc::new(Inner {
                resolver: self.resolver,
                claims: self.claims,
                selector: self.selector.unwrap_or(TenantSelector::FromIssuer),
                authorizer: self.authorizer,
                temporal: self.temporal,
                clock: self.clock,
            }),
        }
    }
}

impl Authority {
    /// Starts configuring an authority over the given key cache and claims
    /// policy
    pub fn builder(resolver: KeyResolver, claims: ClaimsValidator) -> AuthorityBuilder {
        AuthorityBuilder {
            resolver,
            claims,
            selector: None,
            authorizer: GrantAuthorizer::default(),
            temporal: TemporalValidator::default(),
            clock: Arc::new(System),
        }
    }

    /// The shared key cache
    pub fn resolver(&self) -> &KeyResolver {
        &self.inner.resolver
    }

    /// The claim grants are read from
    #[must_use]
    pub fn grant_claim(&self) -> GrantClaim {
        self.inner.authorizer.claim()
    }

    /// Verifies a presented token
    ///
    /// Structural and algorithm checks run before any key is fetched.
    ///
    /// # Errors
    ///
    /// Returns the first check the token fails.
    #[tracing::instrument(
        skip_all,
        fields(
            jwt.alg = tracing::field::Empty,
            jwt.kid = tracing::field::Empty,
            tenant = tracing::field::Empty,
        ),
    )]
    pub async fn verify(&self, token: &TokenRef) -> Result<Verified, AuthorityError> {
        let span = tracing::Span::current();

        let decomposed = token.decompose()?;
        let algorithm = decomposed.algorithm()?;
        span.record("jwt.alg", algorithm.as_str());

        let kid = decomposed.kid().ok_or(AuthorityError::MissingKeyId)?;
        span.record("jwt.kid", kid.as_str());

        let tenant = self.select_tenant(&decomposed)?;
        span.record("tenant", tenant.as_str());

        let key = self.inner.resolver.resolve(&tenant, kid).await?;

        let claims = decomposed.verify(&key, algorithm)?;

        self.inner
            .temporal
            .validate_with_clock(&claims, &*self.inner.clock)?;

        let issuer_tenant = self.inner.claims.validate(&claims)?;
        if issuer_tenant != &*tenant {
            tracing::debug!(%issuer_tenant, "issuer belongs to a different tenant than the verifying key");
            return Err(ClaimsDenied::WrongIssuer.into());
        }

        let principal = Principal::from_claims(&claims);
        tracing::trace!(%principal, "token verified");

        Ok(Verified {
            claims,
            principal,
            tenant,
            algorithm,
        })
    }

    /// Checks a verified token against a route requirement
    ///
    /// # Errors
    ///
    /// Returns [`AuthorityError::GrantDenied`] if the caller is not entitled.
    pub fn authorize(&self, verified: &Verified, access: &Access) -> Result<(), AuthorityError> {
        self.inner
            .authorizer
            .authorize(&verified.claims, &verified.principal, access)?;
        Ok(())
    }

    /// Verifies a presented token and authorizes it for `access`
    ///
    /// # Errors
    ///
    /// Returns the first check the token fails.
    pub async fn check(&self, token: &TokenRef, access: &Access) -> Result<Verified, AuthorityError> {
        let verified = self.verify(token).await?;
        self.authorize(&verified, access)?;
        Ok(verified)
    }

    /// Runs the full pipeline and reports the terminal decision
    pub async fn decide(&self, token: &TokenRef, access: &Access) -> Decision {
        let verified = match self.verify(token).await {
            Ok(verified) => verified,
            Err(reason) => {
                return Decision::Denied {
                    principal: None,
                    reason,
                }
            }
        };

        match self.authorize(&verified, access) {
            Ok(()) => Decision::Granted(verified),
            Err(reason) => Decision::Denied {
                principal: Some(verified.principal),
                reason,
            },
        }
    }

    fn select_tenant(&self, decomposed: &Decomposed<'_>) -> Result<TenantId, AuthorityError> {
        match &self.inner.selector {
            TenantSelector::Fixed(tenant) => Ok(tenant.clone()),
            TenantSelector::FromIssuer => {
                let untrusted = decomposed.untrusted_claims()?;
                untrusted
                    .iss
                    .as_deref()
                    .and_then(|iss| self.inner.claims.issuers().tenant_for(iss))
                    .map(ToOwned::to_owned)
                    .ok_or_else(|| {
                        tracing::debug!(iss = ?untrusted.iss, "token issuer not on the allow-list; not fetching keys");
                        KeyError::UntrustedTenant.into()
                    })
            }
        }
    }
}
