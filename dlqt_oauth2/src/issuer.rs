use std::{convert::Infallible, fmt};

use aliri_braid::braid;
use dlqt_auth::jwt::{Issuer, IssuerRef};
use thiserror::Error;

/// An invalid tenant identifier
#[derive(Debug, Error)]
pub enum InvalidTenantId {
    /// The tenant identifier was the empty string
    #[error("tenant id cannot be empty")]
    EmptyString,
    /// The tenant identifier contained a byte that cannot appear in a path segment
    #[error("invalid tenant id byte at position {position}: 0x{value:02x}")]
    InvalidByte {
        /// The index in the tenant id where the invalid byte was found
        position: usize,
        /// The invalid byte value
        value: u8,
    },
}

impl From<Infallible> for InvalidTenantId {
    #[inline(always)]
    fn from(x: Infallible) -> Self {
        match x {}
    }
}

/// A directory tenant at the identity provider
///
/// Tenant ids are interpolated into key set URLs, so only ASCII
/// alphanumerics, `-`, and `.` are accepted.
#[braid(serde, validator, ref_doc = "A borrowed reference to a [`TenantId`]")]
pub struct TenantId;

impl aliri_braid::Validator for TenantId {
    type Error = InvalidTenantId;

    fn validate(s: &str) -> Result<(), Self::Error> {
        if s.is_empty() {
            Err(InvalidTenantId::EmptyString)
        } else if let Some((position, &value)) = s
            .as_bytes()
            .iter()
            .enumerate()
            .find(|(_, &b)| !(b.is_ascii_alphanumeric() || b == b'-' || b == b'.'))
        {
            Err(InvalidTenantId::InvalidByte { position, value })
        } else {
            Ok(())
        }
    }
}

/// The issuers whose tokens are accepted, each bound to the tenant whose
/// published keys sign its tokens
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TrustedIssuers {
    entries: Vec<(Issuer, TenantId)>,
}

impl TrustedIssuers {
    /// An empty allow-list, trusting no one
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Trusts the standard v2.0 issuer of each tenant at `host`
    ///
    /// The issuer for tenant `t` is `https://{host}/{t}/v2.0`.
    #[must_use]
    pub fn for_tenants<I>(host: &str, tenants: I) -> Self
    where
        I: IntoIterator<Item = TenantId>,
    {
        let mut trusted = Self::new();
        for tenant in tenants {
            let issuer = Issuer::new(format!("https://{host}/{tenant}/v2.0"));
            trusted.trust(issuer, tenant);
        }
        trusted
    }

    /// Trusts an exact issuer string, bound to `tenant`
    pub fn trust(&mut self, issuer: Issuer, tenant: TenantId) {
        if !self.entries.iter().any(|(i, _)| *i == issuer) {
            self.entries.push((issuer, tenant));
        }
    }

    /// Trusts an exact issuer string, bound to `tenant`
    #[must_use]
    pub fn with_issuer(mut self, issuer: Issuer, tenant: TenantId) -> Self {
        self.trust(issuer, tenant);
        self
    }

    /// The tenant bound to `issuer`, if the issuer is trusted
    ///
    /// Matching is exact; no normalization of case or trailing slashes.
    #[must_use]
    pub fn tenant_for(&self, issuer: &IssuerRef) -> Option<&TenantIdRef> {
        self.entries
            .iter()
            .find(|(i, _)| &**i == issuer)
            .map(|(_, t)| &**t)
    }

    /// Whether `issuer` is trusted
    #[must_use]
    pub fn is_trusted(&self, issuer: &IssuerRef) -> bool {
        self.tenant_for(issuer).is_some()
    }

    /// Every tenant referenced by a trusted issuer, without duplicates
    pub fn tenants(&self) -> impl Iterator<Item = &TenantIdRef> {
        let mut seen: Vec<&TenantIdRef> = Vec::with_capacity(self.entries.len());
        for (_, tenant) in &self.entries {
            let tenant: &TenantIdRef = tenant;
            if !seen.contains(&tenant) {
                seen.push(tenant);
            }
        }
        seen.into_iter()
    }

    /// Whether no issuer is trusted
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// How the tenant whose keys verify a token is chosen
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TenantSelector {
    /// Always use this tenant's keys
    Fixed(TenantId),

    /// Use the tenant bound to the token's (unverified) issuer
    ///
    /// The issuer must be on the allow-list; otherwise no keys are fetched
    /// and the token is rejected.
    FromIssuer,
}

impl fmt::Display for TenantSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(tenant) => write!(f, "fixed({tenant})"),
            Self::FromIssuer => f.write_str("from-issuer"),
        }
    }
}

#[cfg(test)]
mod tests {
    use color_eyre::Result;
    use dlqt_auth::testing;

    use super::*;

    #[test]
    fn rejects_tenant_ids_that_could_escape_the_path() {
        for bad in ["", "a/b", "..%2f", "tenant?x", "ten ant"] {
            assert!(TenantId::new(bad.to_owned()).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn validated_tenant_conversions() -> Result<()> {
        let tenant: TenantId = testing::TENANT.parse()?;
        assert_eq!(tenant.as_str(), TenantIdRef::from_str(testing::TENANT)?.as_str());
        assert!("a/b".parse::<TenantId>().is_err());
        assert!(TenantIdRef::from_str("..%2f").is_err());
        Ok(())
    }

    #[test]
    fn derives_v2_issuer_per_tenant() -> Result<()> {
        let trusted = TrustedIssuers::for_tenants(
            testing::AUTHORITY_HOST,
            [TenantId::new(testing::TENANT.to_owned())?],
        );

        let tenant = trusted.tenant_for(IssuerRef::from_str(testing::ISSUER));
        assert_eq!(tenant.map(TenantIdRef::as_str), Some(testing::TENANT));
        Ok(())
    }

    #[test]
    fn issuer_match_is_exact() -> Result<()> {
        let trusted = TrustedIssuers::for_tenants(
            testing::AUTHORITY_HOST,
            [TenantId::new(testing::TENANT.to_owned())?],
        );

        let trailing_slash = format!("{}/", testing::ISSUER);
        let upper = testing::ISSUER.to_uppercase();
        let v1 = format!("https://sts.windows.net/{}/", testing::TENANT);

        for issuer in [trailing_slash, upper, v1] {
            assert!(!trusted.is_trusted(IssuerRef::from_str(&issuer)), "{issuer}");
        }
        Ok(())
    }

    #[test]
    fn lists_each_tenant_once() -> Result<()> {
        let tenant = TenantId::new(testing::TENANT.to_owned())?;
        let trusted = TrustedIssuers::for_tenants(testing::AUTHORITY_HOST, [tenant.clone()])
            .with_issuer(
                Issuer::new(format!("https://sts.windows.net/{tenant}/")),
                tenant.clone(),
            );

        assert_eq!(trusted.tenants().collect::<Vec<_>>(), [&*tenant]);
        Ok(())
    }
}
