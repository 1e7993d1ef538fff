//! Common errors

#![allow(missing_copy_implementations)]

use std::error::Error as StdError;

use thiserror::Error;

/// The token cannot be parsed out into header, payload, and signature sections
#[derive(Debug, Error)]
#[error("malformed token: {part}")]
pub struct MalformedToken {
    part: &'static str,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

impl MalformedToken {
    /// The part of the token which could not be parsed
    #[must_use]
    pub fn part(&self) -> &'static str {
        self.part
    }
}

pub(crate) fn malformed_token(part: &'static str) -> MalformedToken {
    MalformedToken { part, source: None }
}

pub(crate) fn malformed_token_part(
    part: &'static str,
    source: impl Into<Box<dyn StdError + Send + Sync + 'static>>,
) -> MalformedToken {
    MalformedToken {
        part,
        source: Some(source.into()),
    }
}

/// The token header names an algorithm outside the accepted RSA family
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("'{alg}' is not an accepted signing algorithm")]
pub struct UnsupportedAlgorithm {
    alg: String,
}

impl UnsupportedAlgorithm {
    /// The algorithm name as presented in the token header
    #[must_use]
    pub fn alg(&self) -> &str {
        &self.alg
    }
}

pub(crate) fn unsupported_algorithm(alg: impl Into<String>) -> UnsupportedAlgorithm {
    UnsupportedAlgorithm { alg: alg.into() }
}

/// The signature did not match
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Error)]
#[error("signature mismatch")]
pub struct SignatureMismatch {
    _p: (),
}

pub(crate) const fn signature_mismatch() -> SignatureMismatch {
    SignatureMismatch { _p: () }
}

/// A published key record could not be turned into a verification key
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum KeyRejected {
    /// The key is not an RSA key
    #[error("unsupported key type '{kty}'")]
    UnsupportedKeyType {
        /// The `kty` member of the published key
        kty: String,
    },

    /// The modulus or exponent could not be decoded into a usable value
    #[error("malformed key: {_0}")]
    MalformedKey(&'static str),
}

/// An error occurring when validating the temporal claims of a token
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ClaimsRejected {
    /// The token is expired according to the `exp` claim
    #[error("token expired")]
    TokenExpired,

    /// The token is not yet valid according to the `nbf` claim
    #[error("token not yet valid")]
    TokenNotYetValid,

    /// A required claim is missing
    #[error("required {_0} claim missing")]
    MissingRequiredClaim(&'static str),
}

/// An error occurring while verifying a token against a known key
#[derive(Debug, Error)]
pub enum TokenVerifyError {
    /// The token is malformed
    #[error(transparent)]
    Malformed(#[from] MalformedToken),

    /// The token names an algorithm that is not accepted
    #[error(transparent)]
    UnsupportedAlgorithm(#[from] UnsupportedAlgorithm),

    /// The signature does not verify under the selected key
    #[error(transparent)]
    SignatureMismatch(#[from] SignatureMismatch),

    /// The token was rejected by the temporal validator
    #[error("token rejected by claims validator")]
    ClaimsRejected(#[from] ClaimsRejected),
}

impl TokenVerifyError {
    /// Whether the error is due to a signature mismatch
    #[must_use]
    pub fn is_signature_mismatch(&self) -> bool {
        matches!(self, Self::SignatureMismatch(_))
    }
}
