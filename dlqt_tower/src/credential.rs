use dlqt_auth::TokenRef;
use http::{header, HeaderMap};
use thiserror::Error;

/// The request does not present a bearer credential
///
/// The variants are distinguished in logs only; callers always receive the
/// same `401` response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum CredentialError {
    /// No `Authorization` header
    #[error("authorization header missing")]
    MissingHeader,

    /// The `Authorization` header uses a scheme other than `Bearer`
    #[error("authorization header does not use the bearer scheme")]
    WrongScheme,

    /// The `Authorization` header names the bearer scheme without a token
    #[error("bearer token empty")]
    EmptyToken,
}

/// Extracts the bearer token from the `Authorization` header
///
/// The scheme is matched case-insensitively and surrounding whitespace is
/// trimmed from the token.
///
/// ```
/// use dlqt_tower::{bearer_token, CredentialError};
/// use http::{header::AUTHORIZATION, HeaderMap, HeaderValue};
///
/// let mut headers = HeaderMap::new();
/// assert_eq!(bearer_token(&headers).unwrap_err(), CredentialError::MissingHeader);
///
/// headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
/// assert_eq!(bearer_token(&headers).unwrap_err(), CredentialError::WrongScheme);
///
/// headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer a.b.c"));
/// assert_eq!(bearer_token(&headers).unwrap().as_str(), "a.b.c");
/// ```
///
/// # Errors
///
/// Returns an error unless exactly one non-empty bearer token is presented.
pub fn bearer_token(headers: &HeaderMap) -> Result<&TokenRef, CredentialError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or(CredentialError::MissingHeader)?
        .to_str()
        .map_err(|_| CredentialError::WrongScheme)?;

    let (scheme, token) = value.split_once(' ').unwrap_or((value, ""));
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(CredentialError::WrongScheme);
    }

    let token = token.trim();
    if token.is_empty() {
        return Err(CredentialError::EmptyToken);
    }

    Ok(TokenRef::from_str(token))
}
