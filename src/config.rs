//! Proxy configuration: CLI flags with environment-variable defaults.

use std::path::PathBuf;

use clap::Parser;

/// CLI arguments for the proxy.
#[derive(Parser, Debug, Clone)]
#[command(name = "boltgate")]
#[command(about = "Transparent Bolt proxy for Neo4j- and Memgraph-compatible databases")]
#[command(version)]
pub struct Args {
    /// host:port to bind to.
    #[arg(long, default_value = "localhost:8888", env = "BOLT_PROXY_BIND")]
    pub bind: String,

    /// Bolt URI of the upstream database.
    #[arg(long, default_value = "bolt://localhost:7687", env = "BOLT_PROXY_URI")]
    pub uri: String,

    /// Username for the startup probe against the upstream.
    #[arg(long = "user", default_value = "neo4j", env = "BOLT_PROXY_USER")]
    pub username: String,

    /// Password for the startup probe against the upstream.
    #[arg(long = "pass", default_value = "", env = "BOLT_PROXY_PASSWORD")]
    pub password: String,

    /// x509 certificate (PEM). Together with --key, enables TLS on the
    /// listener.
    #[arg(long = "cert", env = "BOLT_PROXY_CERT")]
    pub cert_file: Option<PathBuf>,

    /// x509 private key (PEM).
    #[arg(long = "key", env = "BOLT_PROXY_KEY")]
    pub key_file: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(long, env = "BOLT_PROXY_DEBUG")]
    pub debug: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let args = Args::parse_from(["boltgate"]);
        assert_eq!(args.bind, "localhost:8888");
        assert_eq!(args.uri, "bolt://localhost:7687");
        assert_eq!(args.username, "neo4j");
        assert!(args.password.is_empty());
        assert!(args.cert_file.is_none());
        assert!(!args.debug);
    }

    #[test]
    fn flags_override() {
        let args = Args::parse_from([
            "boltgate",
            "--bind",
            "0.0.0.0:9999",
            "--uri",
            "neo4j+s://db:7688",
            "--user",
            "svc",
            "--pass",
            "hunter2",
            "--debug",
        ]);
        assert_eq!(args.bind, "0.0.0.0:9999");
        assert_eq!(args.uri, "neo4j+s://db:7688");
        assert_eq!(args.username, "svc");
        assert_eq!(args.password, "hunter2");
        assert!(args.debug);
    }
}
