//! A `tower_http` authorization gateway that verifies bearer tokens and
//! enforces a static per-route scope table, for use with `axum` and other
//! `tower`-based servers.
//!
//! ```
//! # use std::sync::Arc;
//! use axum::{body::Body, routing::get, Extension, Router};
//! use dlqt_oauth2::{
//!     Access, Authority, ClaimsValidator, KeyResolver, ResolverConfig, StaticKeySource,
//!     TenantId, TrustedIssuers,
//! };
//! use dlqt_tower::{Authenticated, Gateway, RouteTable, TerseErrorHandler};
//! use http::Method;
//!
//! # fn construct_authority() -> Authority {
//! #     let tenant = TenantId::from_static("contoso");
//! #     let issuers = TrustedIssuers::for_tenants("login.microsoftonline.com", [tenant.clone()]);
//! #     let resolver = KeyResolver::new(
//! #         StaticKeySource::new(Default::default()),
//! #         [tenant],
//! #         ResolverConfig::default(),
//! #     );
//! #     let claims = ClaimsValidator::new("api://my-api".into(), issuers);
//! #     Authority::builder(resolver, claims).build()
//! # }
//! #
//! let authority = construct_authority();
//!
//! let routes = RouteTable::new()
//!     .with_route(Method::GET, "/fetch", Access::grant_from_static("dlq.fetch"))
//!     .with_route(Method::POST, "/check-auth", Access::Identified);
//!
//! let gateway: Gateway<TerseErrorHandler<Body>> = Gateway::new(authority, routes);
//!
//! let app: Router = Router::new()
//!     .route("/fetch", get(fetch))
//!     .layer(gateway.into_layer());
//!
//! async fn fetch(Extension(caller): Extension<Authenticated>) -> String {
//!     format!("hello, {}", caller.principal())
//! }
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

use std::{fmt, marker::PhantomData};

mod credential;
mod gateway;
mod routes;
pub mod util;

pub use crate::credential::{bearer_token, CredentialError};
pub use crate::gateway::{Authenticated, Gateway, OnAuthError, Rejection};
pub use crate::routes::RouteTable;

/// Terse responders for authentication and authorization failures
///
/// Responses carry the status code, a `www-authenticate` challenge, and a
/// short fixed body, so failure detail never reaches the caller.
pub struct TerseErrorHandler<ResBody> {
    _ty: PhantomData<fn() -> ResBody>,
}

impl<ResBody> TerseErrorHandler<ResBody> {
    /// Instantiates a new instance over a given body type
    #[inline]
    pub fn new() -> Self {
        Self { _ty: PhantomData }
    }
}

impl<ResBody> fmt::Debug for TerseErrorHandler<ResBody> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("TerseErrorHandler")
    }
}

impl<ResBody> Default for TerseErrorHandler<ResBody> {
    #[inline]
    fn default() -> Self {
        Self { _ty: PhantomData }
    }
}

impl<ResBody> Clone for TerseErrorHandler<ResBody> {
    #[inline]
    fn clone(&self) -> Self {
        Self { _ty: PhantomData }
    }
}

impl<ResBody> Copy for TerseErrorHandler<ResBody> {}
