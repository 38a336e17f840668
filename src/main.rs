#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use boltgate::backend::Backend;
use boltgate::config::Args;
use boltgate::{auth, tls};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.debug { "boltgate=debug,info" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    // Both the listener and upstream `+s` schemes go through rustls; pin the
    // process-wide crypto provider before either is built.
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        tracing::debug!("rustls crypto provider already installed");
    }

    let authenticator = auth::from_env().context("authenticator configuration")?;
    if authenticator.is_none() {
        info!("no AUTH_METHOD configured, accepting all clients");
    }

    let backend = Backend::connect(&args.uri, &args.username, &args.password, authenticator)
        .await
        .with_context(|| format!("connecting to backend {}", args.uri))?;
    info!(uri = %args.uri, version = %backend.version(), "connected to backend");
    let backend = Arc::new(backend);

    let acceptor = match (&args.cert_file, &args.key_file) {
        (Some(cert), Some(key)) => Some(tls::load_acceptor(cert, key)?),
        (None, None) => None,
        _ => bail!("--cert and --key must be given together"),
    };

    let listener = TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("binding {}", args.bind))?;
    info!(bind = %args.bind, tls = acceptor.is_some(), "listening for bolt clients");

    tokio::select! {
        () = boltgate::serve(listener, acceptor, backend) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
    }
    Ok(())
}
