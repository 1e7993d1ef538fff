//! Bearer token verification and scope authorization for tenants of a
//! multi-tenant identity provider
//!
//! The [`Authority`] runs one fixed pipeline for every presented token:
//!
//! 1. decompose the token and pin its algorithm to the RSA family
//! 2. choose the tenant whose keys may have signed it ([`TenantSelector`])
//! 3. resolve the signing key through the shared [`KeyResolver`] cache
//! 4. verify the signature and the `exp`/`nbf` window
//! 5. check audience and issuer ([`ClaimsValidator`])
//! 6. check the route's [`Access`] requirement against granted scopes or roles
//!
//! Every step short-circuits. Structural and algorithm checks run before
//! any key is fetched.
//!
//! # Feature flags
//!
//! The `reqwest` feature (on by default) provides [`HttpKeySource`]. It does
//! not enable TLS in `reqwest` by itself; enable `rustls-tls` or
//! `default-tls` unless the application already does.

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

mod authority;
mod claims;
mod grant;
mod issuer;
mod keys;
pub mod source;

pub use authority::{
    Authority, AuthorityBuilder, AuthorityError, Decision, FailureClass, Verified,
};
pub use claims::{ClaimsDenied, ClaimsValidator, Principal};
pub use grant::{
    Access, Grant, GrantAuthorizer, GrantClaim, GrantDenied, GrantRef, Grants, InvalidGrant,
    UnknownGrantClaim,
};
pub use issuer::{InvalidTenantId, TenantId, TenantIdRef, TenantSelector, TrustedIssuers};
pub use keys::{KeyError, KeyResolver, ResolverConfig};
#[cfg(feature = "reqwest")]
pub use source::HttpKeySource;
pub use source::{FetchError, KeySource, StaticKeySource};
