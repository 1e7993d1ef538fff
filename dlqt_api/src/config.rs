use std::{net::SocketAddr, str::FromStr, time::Duration};

use clap::Parser;
use dlqt_auth::jwt::{Audience, Issuer};
use dlqt_oauth2::{
    Grant, GrantClaim, InvalidGrant, InvalidTenantId, ResolverConfig, TenantId, TenantSelector,
    TrustedIssuers,
};
use thiserror::Error;

#[derive(Debug, Parser)]
#[command(name = "dlqt-api", version, about = "Dead-letter queue tooling API")]
pub struct Opts {
    /// The address to listen on
    #[arg(long, env = "DLQT_LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// The identity provider host that issues tokens and publishes keys
    #[arg(long, env = "DLQT_AUTHORITY_HOST", default_value = "login.microsoftonline.com")]
    pub authority_host: String,

    /// A tenant whose tokens are accepted; repeat or comma-separate for several
    #[arg(
        long = "tenant",
        env = "DLQT_TENANTS",
        value_delimiter = ',',
        value_parser = parse_tenant,
        required = true
    )]
    pub tenants: Vec<TenantId>,

    /// Select the verifying tenant from the token's issuer instead of using the first tenant
    #[arg(long, env = "DLQT_TENANT_FROM_ISSUER")]
    pub tenant_from_issuer: bool,

    /// An extra exact issuer, as `tenant=issuer`
    #[arg(long = "trusted-issuer", env = "DLQT_TRUSTED_ISSUERS", value_delimiter = ',')]
    pub trusted_issuers: Vec<IssuerBinding>,

    /// The client identifier tokens must be issued for
    #[arg(long, env = "DLQT_AUDIENCE")]
    pub audience: Audience,

    /// The claim grants are read from, `scp` or `roles`
    #[arg(long, env = "DLQT_GRANT_CLAIM", default_value = "scp")]
    pub grant_claim: GrantClaim,

    /// The grant required to fetch dead-lettered messages
    #[arg(long, env = "DLQT_FETCH_SCOPE", default_value = "dlq.fetch", value_parser = parse_grant)]
    pub fetch_scope: Grant,

    /// The grant required to retrigger a dead-lettered message
    #[arg(long, env = "DLQT_RETRIGGER_SCOPE", default_value = "dlq.retrigger", value_parser = parse_grant)]
    pub retrigger_scope: Grant,

    /// The grant required to purge dead-lettered messages
    #[arg(long, env = "DLQT_PURGE_SCOPE", default_value = "dlq.purge", value_parser = parse_grant)]
    pub purge_scope: Grant,

    /// Seconds a fetched key set is served before it is refreshed
    #[arg(long, env = "DLQT_KEY_FRESHNESS_SECS", default_value = "3600")]
    pub key_freshness_secs: u64,

    /// Minimum seconds between two fetches of one tenant's key set
    #[arg(long, env = "DLQT_KEY_MIN_REFRESH_SECS", default_value = "30")]
    pub key_min_refresh_secs: u64,

    /// Seconds a key set fetch may take before it is abandoned
    #[arg(long, env = "DLQT_KEY_FETCH_TIMEOUT_SECS", default_value = "5")]
    pub key_fetch_timeout_secs: u64,

    /// Clock skew tolerated when checking `exp` and `nbf`, in seconds
    #[arg(long, env = "DLQT_LEEWAY_SECS", default_value = "0")]
    pub leeway_secs: u64,

    /// Refresh every tenant's key set in the background at this interval, in seconds
    #[arg(long, env = "DLQT_BACKGROUND_REFRESH_SECS")]
    pub background_refresh_secs: Option<u64>,
}

fn parse_tenant(s: &str) -> Result<TenantId, InvalidTenantId> {
    TenantId::new(s.trim().to_owned())
}

fn parse_grant(s: &str) -> Result<Grant, InvalidGrant> {
    Grant::new(s.trim().to_owned())
}

/// An exact issuer trusted in addition to the standard per-tenant issuers
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IssuerBinding {
    pub tenant: TenantId,
    pub issuer: Issuer,
}

#[derive(Debug, Error)]
pub enum InvalidIssuerBinding {
    #[error("expected `tenant=issuer`")]
    MissingSeparator,
    #[error("issuer cannot be empty")]
    EmptyIssuer,
    #[error(transparent)]
    Tenant(#[from] InvalidTenantId),
}

impl FromStr for IssuerBinding {
    type Err = InvalidIssuerBinding;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (tenant, issuer) = s
            .split_once('=')
            .ok_or(InvalidIssuerBinding::MissingSeparator)?;

        let issuer = issuer.trim();
        if issuer.is_empty() {
            return Err(InvalidIssuerBinding::EmptyIssuer);
        }

        Ok(Self {
            tenant: parse_tenant(tenant)?,
            issuer: Issuer::new(issuer.to_owned()),
        })
    }
}

/// The grants each protected operation requires
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Scopes {
    pub fetch: Grant,
    pub retrigger: Grant,
    pub purge: Grant,
}

impl Default for Scopes {
    fn default() -> Self {
        Self {
            fetch: Grant::from_static("dlq.fetch"),
            retrigger: Grant::from_static("dlq.retrigger"),
            purge: Grant::from_static("dlq.purge"),
        }
    }
}

impl Opts {
    pub fn trusted_issuers(&self) -> TrustedIssuers {
        let mut trusted =
            TrustedIssuers::for_tenants(&self.authority_host, self.tenants.iter().cloned());
        for binding in &self.trusted_issuers {
            trusted.trust(binding.issuer.clone(), binding.tenant.clone());
        }
        trusted
    }

    /// Every tenant whose keys may be fetched
    pub fn key_tenants(&self) -> Vec<TenantId> {
        self.trusted_issuers()
            .tenants()
            .map(ToOwned::to_owned)
            .collect()
    }

    pub fn tenant_selector(&self) -> TenantSelector {
        match self.tenants.first() {
            Some(tenant) if !self.tenant_from_issuer => TenantSelector::Fixed(tenant.clone()),
            _ => TenantSelector::FromIssuer,
        }
    }

    pub fn resolver_config(&self) -> ResolverConfig {
        ResolverConfig::default()
            .with_freshness(Duration::from_secs(self.key_freshness_secs))
            .with_min_refresh_interval(Duration::from_secs(self.key_min_refresh_secs))
            .with_fetch_timeout(Duration::from_secs(self.key_fetch_timeout_secs))
    }

    pub fn leeway(&self) -> Duration {
        Duration::from_secs(self.leeway_secs)
    }

    pub fn background_refresh(&self) -> Option<Duration> {
        self.background_refresh_secs
            .filter(|&secs| secs > 0)
            .map(Duration::from_secs)
    }

    pub fn scopes(&self) -> Scopes {
        Scopes {
            fetch: self.fetch_scope.clone(),
            retrigger: self.retrigger_scope.clone(),
            purge: self.purge_scope.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use dlqt_auth::jwt::IssuerRef;
    use dlqt_oauth2::TenantIdRef;

    use super::*;

    const TENANT: &str = "11111111-2222-3333-4444-555555555555";
    const OTHER: &str = "99999999-8888-7777-6666-555555555555";

    fn parse(extra: &[&str]) -> Result<Opts, clap::Error> {
        let mut args = vec!["dlqt-api", "--audience", "api://dlqt", "--tenant", TENANT];
        args.extend_from_slice(extra);
        Opts::try_parse_from(args)
    }

    #[test]
    fn defaults() -> color_eyre::Result<()> {
        let opts = parse(&[])?;

        assert_eq!(opts.listen, "0.0.0.0:8080".parse::<SocketAddr>()?);
        assert_eq!(opts.grant_claim, GrantClaim::Scope);
        assert_eq!(opts.scopes(), Scopes::default());
        assert_eq!(opts.leeway(), Duration::ZERO);
        assert_eq!(opts.background_refresh(), None);

        let config = opts.resolver_config();
        assert_eq!(config.freshness(), Duration::from_secs(3600));
        assert_eq!(config.min_refresh_interval(), Duration::from_secs(30));
        assert_eq!(config.fetch_timeout(), Duration::from_secs(5));
        Ok(())
    }

    #[test]
    fn audience_and_tenant_are_required() {
        assert!(Opts::try_parse_from(["dlqt-api", "--tenant", TENANT]).is_err());
        assert!(Opts::try_parse_from(["dlqt-api", "--audience", "api://dlqt"]).is_err());
    }

    #[test]
    fn first_tenant_is_fixed_unless_selected_from_issuer() -> color_eyre::Result<()> {
        let opts = parse(&["--tenant", OTHER])?;
        assert_eq!(
            opts.tenant_selector(),
            TenantSelector::Fixed(TenantId::from_static(TENANT))
        );

        let opts = parse(&["--tenant", OTHER, "--tenant-from-issuer"])?;
        assert_eq!(opts.tenant_selector(), TenantSelector::FromIssuer);
        Ok(())
    }

    #[test]
    fn tenants_may_be_comma_separated() -> color_eyre::Result<()> {
        let opts = Opts::try_parse_from([
            "dlqt-api",
            "--audience",
            "api://dlqt",
            "--tenant",
            &format!("{TENANT},{OTHER}"),
        ])?;

        assert_eq!(opts.tenants.len(), 2);
        assert_eq!(opts.key_tenants().len(), 2);
        Ok(())
    }

    #[test]
    fn invalid_tenant_is_refused() {
        assert!(parse(&["--tenant", "../etc"]).is_err());
    }

    #[test]
    fn extra_issuers_are_trusted_exactly() -> color_eyre::Result<()> {
        let opts = parse(&["--trusted-issuer", &format!("{OTHER}=https://sts.example.com/{OTHER}/")])?;
        let trusted = opts.trusted_issuers();

        let standard = format!("https://login.microsoftonline.com/{TENANT}/v2.0");
        let extra = format!("https://sts.example.com/{OTHER}/");
        assert_eq!(
            trusted.tenant_for(IssuerRef::from_str(&standard)),
            Some(TenantIdRef::from_static(TENANT))
        );
        assert_eq!(
            trusted.tenant_for(IssuerRef::from_str(&extra)),
            Some(TenantIdRef::from_static(OTHER))
        );
        assert!(!trusted.is_trusted(IssuerRef::from_str(extra.trim_end_matches('/'))));
        assert_eq!(opts.key_tenants().len(), 2);
        Ok(())
    }

    #[test]
    fn issuer_binding_needs_both_halves() {
        assert!(matches!(
            "https://sts.example.com".parse::<IssuerBinding>(),
            Err(InvalidIssuerBinding::MissingSeparator)
        ));
        assert!(matches!(
            format!("{TENANT}=").parse::<IssuerBinding>(),
            Err(InvalidIssuerBinding::EmptyIssuer)
        ));
        assert!(matches!(
            "=https://sts.example.com".parse::<IssuerBinding>(),
            Err(InvalidIssuerBinding::Tenant(_))
        ));
    }

    #[test]
    fn grant_claim_and_scopes_are_configurable() -> color_eyre::Result<()> {
        let opts = parse(&[
            "--grant-claim",
            "roles",
            "--fetch-scope",
            "Queue.Read",
            "--background-refresh-secs",
            "600",
        ])?;

        assert_eq!(opts.grant_claim, GrantClaim::Roles);
        assert_eq!(opts.scopes().fetch, Grant::from_static("Queue.Read"));
        assert_eq!(opts.scopes().purge, Grant::from_static("dlq.purge"));
        assert_eq!(opts.background_refresh(), Some(Duration::from_secs(600)));

        assert!(parse(&["--grant-claim", "groups"]).is_err());
        assert!(parse(&["--fetch-scope", "two words"]).is_err());
        Ok(())
    }
}
