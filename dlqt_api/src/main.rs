use clap::Parser;
use color_eyre::Result;
use dlqt_oauth2::{Authority, ClaimsValidator, HttpKeySource, KeyResolver};
use tracing_subscriber::EnvFilter;

mod config;
mod routes;

use crate::config::Opts;

fn authority(opts: &Opts) -> Result<Authority> {
    let source = HttpKeySource::new(&opts.authority_host)?;
    let resolver = KeyResolver::new(source, opts.key_tenants(), opts.resolver_config());
    let claims = ClaimsValidator::new(opts.audience.clone(), opts.trusted_issuers());

    Ok(Authority::builder(resolver, claims)
        .with_tenant_selector(opts.tenant_selector())
        .with_grant_claim(opts.grant_claim)
        .with_leeway(opts.leeway())
        .build())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "unable to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let opts = Opts::parse();
    let authority = authority(&opts)?;

    tracing::info!(
        tenants = opts.tenants.len(),
        selector = %opts.tenant_selector(),
        grant_claim = %opts.grant_claim,
        "token authority configured"
    );

    let _refresh = opts
        .background_refresh()
        .map(|interval| authority.resolver().spawn_refresh(interval));

    let app = routes::router(authority, &opts.scopes());

    let listener = tokio::net::TcpListener::bind(opts.listen).await?;
    tracing::info!(address = %opts.listen, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
