//! Presented bearer tokens and their claims
//!
//! A token arrives as three base64url segments separated by `.`:
//!
//! ```text
//! <header>.<payload>.<signature>
//! ```
//!
//! The header names the signing algorithm and key. It is consulted to
//! select a key, but nothing in it (or in the payload) may be trusted until
//! the signature has been verified with [`Decomposed::verify`].

use std::{fmt, time::Duration};

use aliri_braid::braid;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};

use crate::{
    clock::{Clock, System, UnixTime},
    error, jwa,
    jwk::{KeyId, KeyIdRef, VerificationKey},
};

/// An audience
#[braid(serde, ref_doc = "A borrowed reference to an [`Audience`]")]
pub struct Audience;

/// An issuer of tokens
#[braid(serde, ref_doc = "A borrowed reference to an [`Issuer`]")]
pub struct Issuer;

/// The subject of a token
#[braid(serde, ref_doc = "A borrowed reference to a [`Subject`]")]
pub struct Subject;

/// The directory object identifier of the caller (`oid` claim)
#[braid(serde, ref_doc = "A borrowed reference to an [`ObjectId`]")]
pub struct ObjectId;

/// A presented bearer token
///
/// This type provides custom implementations of [`Display`][TokenRef#impl-Display] and
/// [`Debug`][TokenRef#impl-Debug] so that tokens cannot leak into logs by accident.
#[braid(
    serde,
    debug = "owned",
    display = "owned",
    ord = "omit",
    ref_doc = "\
    A borrowed reference to a presented bearer token ([`Token`])\n\
    \n\
    This type provides custom implementations of [`Display`][Self#impl-Display] and \
    [`Debug`][Self#impl-Debug] to prevent unintentional disclosures of sensitive values.
    "
)]
#[must_use]
pub struct Token;

/// Prints a placeholder unless the alternate form (`{:#?}`) is requested, in
/// which case header and payload are printed and the signature is elided.
///
/// ```
/// # use dlqt_auth::jwt::TokenRef;
/// let token = TokenRef::from_str("eyJhbGciOiJSUzI1NiJ9.e30.c2lnbmF0dXJl");
///
/// assert_eq!(format!("{:?}", token), "***TOKEN***");
/// assert_eq!(format!("{:#?}", token), "\"eyJhbGciOiJSUzI1NiJ9.e30.…\"");
/// assert_eq!(format!("{:#5?}", token), "\"eyJhbGciOiJSUzI1NiJ9.e30.c2ln…\"");
/// ```
impl fmt::Debug for TokenRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if f.alternate() {
            f.write_str("\"")?;
            if let Some(last_period) = self.0.rfind('.') {
                f.write_str(&self.0[..=last_period])?;
                limited_reveal(&self.0[last_period + 1..], &mut *f, 0)?;
            } else {
                limited_reveal(&self.0, &mut *f, 0)?;
            }
            f.write_str("\"")
        } else {
            f.write_str(concat!("***", "TOKEN", "***"))
        }
    }
}

/// Prints a placeholder unless the alternate form (`{:#}`) is requested.
///
/// ```
/// # use dlqt_auth::jwt::TokenRef;
/// let token = TokenRef::from_str("eyJhbGciOiJSUzI1NiJ9.e30.c2lnbmF0dXJl");
///
/// assert_eq!(format!("{}", token), "***TOKEN***");
/// assert_eq!(format!("{:#}", token), "eyJhbGciOiJSUzI1NiJ9.e30.c2lnbmF0dXJl");
/// ```
impl fmt::Display for TokenRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if f.alternate() {
            if let Some(last_period) = self.0.rfind('.') {
                f.write_str(&self.0[..=last_period])?;
                limited_reveal(&self.0[last_period + 1..], &mut *f, usize::MAX)
            } else {
                limited_reveal(&self.0, &mut *f, usize::MAX)
            }
        } else {
            f.write_str(concat!("***", "TOKEN", "***"))
        }
    }
}

fn limited_reveal(unprotected: &str, f: &mut fmt::Formatter, default_len: usize) -> fmt::Result {
    let max_len = f.width().unwrap_or(default_len);
    if max_len <= 1 {
        f.write_str("…")
    } else if max_len > unprotected.len() {
        f.write_str(unprotected)
    } else {
        match unprotected.char_indices().nth(max_len - 2) {
            Some((idx, c)) if idx + c.len_utf8() < unprotected.len() => {
                f.write_str(&unprotected[0..idx + c.len_utf8()])?;
                f.write_str("…")
            }
            _ => f.write_str(unprotected),
        }
    }
}

/// The protected header of a token
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Name of the signing algorithm, not yet checked against the accepted set
    pub alg: String,

    /// Identifier of the signing key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<KeyId>,

    /// Media type of the token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typ: Option<String>,
}

/// A set of zero or more [`Audience`]s
///
/// The `aud` claim may be a single string or an array of strings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "OneOrMany<Audience>", into = "OneOrMany<Audience>")]
#[must_use]
pub struct Audiences(Vec<Audience>);

impl Audiences {
    /// An empty audience set
    #[inline]
    pub const fn empty() -> Self {
        Self(Vec::new())
    }

    /// An audience set with a single audience
    #[inline]
    pub fn single(aud: impl Into<Audience>) -> Self {
        Self(vec![aud.into()])
    }

    /// Indicates whether the audience set is empty
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates through references to the audiences in the set
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &AudienceRef> {
        self.0.iter().map(AsRef::as_ref)
    }
}

impl From<OneOrMany<Audience>> for Audiences {
    #[inline]
    fn from(vals: OneOrMany<Audience>) -> Self {
        match vals {
            OneOrMany::One(x) => Self(vec![x]),
            OneOrMany::Many(v) => Self(v),
        }
    }
}

impl From<Audiences> for OneOrMany<Audience> {
    #[inline]
    fn from(mut vec: Audiences) -> Self {
        match vec.0.len() {
            1 => vec.0.pop().map_or_else(|| Self::Many(Vec::new()), Self::One),
            _ => Self::Many(vec.0),
        }
    }
}

impl From<Vec<Audience>> for Audiences {
    #[inline]
    fn from(vals: Vec<Audience>) -> Self {
        Self(vals)
    }
}

/// A type representing one or more items, primarily for serialization
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    /// A single item
    One(T),

    /// Zero or more items, to be serialized/deserialized as an array
    Many(Vec<T>),
}

/// The claims carried by an access token
///
/// Only the claims consulted by the gateway are modelled; others are ignored.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[must_use]
pub struct ClaimSet {
    /// Issuer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<Issuer>,

    /// Intended audience(s)
    #[serde(default, skip_serializing_if = "Audiences::is_empty")]
    pub aud: Audiences,

    /// Expiration time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<UnixTime>,

    /// Not before
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<UnixTime>,

    /// Issued at
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<UnixTime>,

    /// Object identifier of the caller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oid: Option<ObjectId>,

    /// Subject
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<Subject>,

    /// Tenant the token was issued in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tid: Option<String>,

    /// Delegated scopes, space separated
    #[serde(default, alias = "scope", skip_serializing_if = "Option::is_none")]
    pub scp: Option<String>,

    /// Application roles
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,

    /// Human readable account name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_username: Option<String>,
}

impl ClaimSet {
    /// Produces an empty claim set
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the issuer
    pub fn with_issuer(mut self, iss: impl Into<Issuer>) -> Self {
        self.iss = Some(iss.into());
        self
    }

    /// Sets a single audience
    pub fn with_audience(mut self, aud: impl Into<Audience>) -> Self {
        self.aud = Audiences::single(aud);
        self
    }

    /// Sets the audience set
    pub fn with_audiences(mut self, aud: impl Into<Audiences>) -> Self {
        self.aud = aud.into();
        self
    }

    /// Sets the expiration time
    pub fn with_expiration(mut self, exp: UnixTime) -> Self {
        self.exp = Some(exp);
        self
    }

    /// Sets the not-before time
    pub fn with_not_before(mut self, nbf: UnixTime) -> Self {
        self.nbf = Some(nbf);
        self
    }

    /// Sets the issued-at time
    pub fn with_issued_at(mut self, iat: UnixTime) -> Self {
        self.iat = Some(iat);
        self
    }

    /// Sets the caller's object identifier
    pub fn with_object_id(mut self, oid: impl Into<ObjectId>) -> Self {
        self.oid = Some(oid.into());
        self
    }

    /// Sets the delegated scopes from a space-separated string
    pub fn with_scp(mut self, scp: impl Into<String>) -> Self {
        self.scp = Some(scp.into());
        self
    }

    /// Sets the application roles
    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    /// Removes the expiration time
    pub fn without_expiration(mut self) -> Self {
        self.exp = None;
        self
    }

    /// Removes the caller's object identifier
    pub fn without_object_id(mut self) -> Self {
        self.oid = None;
        self
    }
}

/// A decomposed token
///
/// The header has been parsed and the signature decoded, but nothing has
/// been verified yet.
#[derive(Clone, Debug, PartialEq, Eq)]
#[must_use]
pub struct Decomposed<'a> {
    header: Header,
    message: &'a str,
    payload: &'a str,
    signature: Vec<u8>,
}

impl<'a> Decomposed<'a> {
    /// The signing algorithm named in the header, if it is accepted
    ///
    /// # Errors
    ///
    /// Returns an error if the header names anything outside the RSA family.
    pub fn algorithm(&self) -> Result<jwa::Algorithm, error::UnsupportedAlgorithm> {
        self.header.alg.parse()
    }

    /// The key identifier named in the header
    #[must_use]
    pub fn kid(&self) -> Option<&KeyIdRef> {
        self.header.kid.as_deref()
    }

    /// The untrusted header of the token
    ///
    /// **WARNING:** *This header has not been validated and should not be trusted.*
    /// An adversary can place arbitrary data into the header and payload of a token.
    /// Use it only to select a key, then call [`verify()`][Self::verify].
    #[must_use]
    pub fn untrusted_header(&self) -> &Header {
        &self.header
    }

    /// Decodes the claims without checking the signature
    ///
    /// **WARNING:** *These claims have not been validated and should not be trusted.*
    /// They may only be used to choose where to look for a verification key,
    /// never to grant access.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not base64url-encoded JSON.
    pub fn untrusted_claims(&self) -> Result<ClaimSet, error::MalformedToken> {
        decode_claims(self.payload)
    }

    /// The untrusted message of the token
    ///
    /// This contains the encoded header and payload, separated by a `.`.
    #[must_use]
    pub fn untrusted_message(&self) -> &'a str {
        self.message
    }

    /// The raw signature of the token
    #[must_use]
    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// Verifies the signature with `key` and decodes the claims
    ///
    /// Temporal claims are not checked here; see [`TemporalValidator`].
    ///
    /// # Errors
    ///
    /// Returns an error if the signature does not match or the payload
    /// cannot be decoded.
    pub fn verify(
        self,
        key: &VerificationKey,
        alg: jwa::Algorithm,
    ) -> Result<ClaimSet, error::TokenVerifyError> {
        key.verify(alg, self.message.as_bytes(), &self.signature)?;

        Ok(decode_claims(self.payload)?)
    }
}

fn decode_claims(payload: &str) -> Result<ClaimSet, error::MalformedToken> {
    let raw = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| error::malformed_token_part("payload", e))?;

    serde_json::from_slice(&raw).map_err(|e| error::malformed_token_part("payload", e))
}

impl TokenRef {
    /// Decomposes the token into its parts, preparing it for later processing
    ///
    /// # Errors
    ///
    /// Returns an error unless the token has exactly three segments with a
    /// decodable header and signature.
    pub fn decompose(&self) -> Result<Decomposed<'_>, error::MalformedToken> {
        let mut segments = self.as_str().split('.');
        let (h_str, payload, s_str) = match (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) {
            (Some(h), Some(p), Some(s), None) => (h, p, s),
            _ => return Err(error::malformed_token("segment count")),
        };

        if h_str.is_empty() || payload.is_empty() {
            return Err(error::malformed_token("empty segment"));
        }

        let message = &self.as_str()[..h_str.len() + 1 + payload.len()];

        let h_raw = URL_SAFE_NO_PAD
            .decode(h_str)
            .map_err(|e| error::malformed_token_part("header", e))?;
        let header: Header =
            serde_json::from_slice(&h_raw).map_err(|e| error::malformed_token_part("header", e))?;
        let signature = URL_SAFE_NO_PAD
            .decode(s_str)
            .map_err(|e| error::malformed_token_part("signature", e))?;

        Ok(Decomposed {
            header,
            message,
            payload,
            signature,
        })
    }
}

/// Checks the `exp` and `nbf` claims of a verified token
///
/// `exp` is required and must lie in the future; `nbf`, when present, must
/// lie in the past. No clock skew is tolerated unless a leeway is set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[must_use]
pub struct TemporalValidator {
    leeway: Duration,
}

impl TemporalValidator {
    /// Sets the clock skew tolerated on either side of the validity window
    pub fn with_leeway(self, leeway: Duration) -> Self {
        Self { leeway }
    }

    /// The tolerated clock skew
    #[must_use]
    pub fn leeway(&self) -> Duration {
        self.leeway
    }

    /// Validates against the system clock
    ///
    /// # Errors
    ///
    /// Returns an error if the token is outside its validity window.
    pub fn validate(&self, claims: &ClaimSet) -> Result<(), error::ClaimsRejected> {
        self.validate_with_clock(claims, &System)
    }

    /// Validates against the given clock
    ///
    /// # Errors
    ///
    /// Returns an error if the token is outside its validity window.
    pub fn validate_with_clock<C: Clock + ?Sized>(
        &self,
        claims: &ClaimSet,
        clock: &C,
    ) -> Result<(), error::ClaimsRejected> {
        let now = clock.now();
        let leeway = self.leeway.as_secs();

        match claims.exp {
            Some(exp) if exp <= now.saturating_sub(leeway) => {
                return Err(error::ClaimsRejected::TokenExpired)
            }
            Some(_) => {}
            None => return Err(error::ClaimsRejected::MissingRequiredClaim("exp")),
        }

        if let Some(nbf) = claims.nbf {
            if nbf > now.saturating_add(leeway) {
                return Err(error::ClaimsRejected::TokenNotYetValid);
            }
        }

        Ok(())
    }
}
