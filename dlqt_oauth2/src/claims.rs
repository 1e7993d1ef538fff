use std::fmt;

use dlqt_auth::{
    jwt::{Audience, AudienceRef, ObjectId, ObjectIdRef},
    ClaimSet,
};
use thiserror::Error;

use crate::{TenantIdRef, TrustedIssuers};

/// A verified token was issued for someone else
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ClaimsDenied {
    /// The token was not issued for this service
    #[error("token not issued for this audience")]
    WrongAudience,

    /// The token was not issued by a trusted issuer
    #[error("token not issued by a trusted issuer")]
    WrongIssuer,
}

/// Checks the audience and issuer of verified claims
#[derive(Clone, Debug)]
#[must_use]
pub struct ClaimsValidator {
    audience: Audience,
    issuers: TrustedIssuers,
}

impl ClaimsValidator {
    /// Accepts tokens for `audience` from any of `issuers`
    pub fn new(audience: Audience, issuers: TrustedIssuers) -> Self {
        Self { audience, issuers }
    }

    /// The audience this service answers to
    #[must_use]
    pub fn audience(&self) -> &AudienceRef {
        &self.audience
    }

    /// The trusted issuers
    #[must_use]
    pub fn issuers(&self) -> &TrustedIssuers {
        &self.issuers
    }

    /// Validates the audience, then the issuer, returning the tenant bound
    /// to the issuer
    ///
    /// The audience matches if any `aud` entry equals the expected audience
    /// exactly.
    ///
    /// # Errors
    ///
    /// * [`ClaimsDenied::WrongAudience`] if no `aud` entry matches
    /// * [`ClaimsDenied::WrongIssuer`] if `iss` is absent or not trusted
    pub fn validate<'a>(&'a self, claims: &ClaimSet) -> Result<&'a TenantIdRef, ClaimsDenied> {
        if !claims.aud.iter().any(|aud| aud == &*self.audience) {
            tracing::debug!(expected = %self.audience, "token audience mismatch");
            return Err(ClaimsDenied::WrongAudience);
        }

        claims
            .iss
            .as_deref()
            .and_then(|iss| self.issuers.tenant_for(iss))
            .ok_or_else(|| {
                tracing::debug!(iss = ?claims.iss, "token issuer not trusted");
                ClaimsDenied::WrongIssuer
            })
    }
}

/// The caller a verified token speaks for
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Principal {
    /// A directory object, identified by its `oid` claim
    Known(ObjectId),

    /// A verified caller without an `oid` claim
    Anonymous,
}

impl Principal {
    /// Extracts the principal from verified claims
    #[must_use]
    pub fn from_claims(claims: &ClaimSet) -> Self {
        claims
            .oid
            .clone()
            .map_or(Self::Anonymous, Self::Known)
    }

    /// The object id, if the caller is known
    #[must_use]
    pub fn object_id(&self) -> Option<&ObjectIdRef> {
        match self {
            Self::Known(oid) => Some(oid),
            Self::Anonymous => None,
        }
    }

    /// Whether the caller is a known directory object
    #[must_use]
    pub fn is_known(&self) -> bool {
        matches!(self, Self::Known(_))
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Known(oid) => fmt::Display::fmt(oid, f),
            Self::Anonymous => f.write_str("anonymous"),
        }
    }
}
