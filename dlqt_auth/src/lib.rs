//! Primitives for verifying RSA-signed JSON Web Tokens (JWT) against keys
//! published by an identity provider as a JSON Web Key Set.
//!
//! This crate covers the provider-independent half of bearer-token
//! verification:
//!
//! * decomposing a presented token into header, payload, and signature
//! * pinning the signing algorithm to the RSA family before any key is used
//! * converting a published key record into a usable RSA public key
//! * checking the signature and the `exp`/`nbf` window against a [`Clock`]
//!
//! Key retrieval, issuer/audience checks and scope decisions live in
//! `dlqt_oauth2`.
//!
//! ```
//! use dlqt_auth::{clock::{TestClock, UnixTime}, jwk::KeySet, jwt::{TemporalValidator, TokenRef}};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! # let jwks = include_str!("../data/rsa/jwks.json");
//! # let raw = include_str!("../data/rsa/known-answer.jwt");
//! let keys: KeySet = serde_json::from_str(jwks)?;
//! let token = TokenRef::from_str(raw);
//!
//! let decomposed = token.decompose()?;
//! let alg = decomposed.algorithm()?;
//! let kid = decomposed.kid().ok_or("token has no kid")?;
//! let key = keys.find_signing_key(kid).ok_or("unknown key")?.to_verification_key()?;
//!
//! let claims = decomposed.verify(&key, alg)?;
//! TemporalValidator::default()
//!     .validate_with_clock(&claims, &TestClock::new(UnixTime(1_700_001_000)))?;
//! # Ok(())
//! # }
//! ```

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

pub mod clock;
pub mod error;
pub mod jwa;
pub mod jwk;
pub mod jwt;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

#[doc(inline)]
pub use clock::{Clock, System, UnixTime};
#[doc(inline)]
pub use jwk::{KeySet, PublishedKey, VerificationKey};
#[doc(inline)]
pub use jwt::{ClaimSet, Token, TokenRef};
