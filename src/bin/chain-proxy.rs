use std::{net::SocketAddr, path::PathBuf, time::Duration};

use chain_proxy::{
    LocalProxyServer, ProxyConfigFile, ServerOpts, Upstream, UpstreamConfig, UpstreamKind,
    config::DEFAULT_UPSTREAM_PORT,
};
use clap::Parser;
use n0_error::{Result, StackResultExt, StdResultExt, anyerr};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Local HTTP proxy that chains all connections through an upstream proxy.
#[derive(Parser, Debug)]
#[clap(version, about)]
struct Cli {
    /// JSON config file with a `proxy` section. Overrides the upstream flags.
    #[clap(short, long)]
    config: Option<PathBuf>,
    /// Upstream proxy protocol.
    #[clap(long = "type", default_value_t = UpstreamKind::Http)]
    kind: UpstreamKind,
    /// Upstream proxy host.
    #[clap(long)]
    host: Option<String>,
    /// Upstream proxy port.
    #[clap(long, default_value_t = DEFAULT_UPSTREAM_PORT)]
    port: u16,
    /// Username for the upstream proxy.
    #[clap(long, default_value = "")]
    username: String,
    /// Password for the upstream proxy.
    #[clap(long, default_value = "")]
    password: String,
    /// Local address to listen on.
    #[clap(short, long, default_value = "127.0.0.1:18080")]
    listen: SocketAddr,
    /// Timeout in seconds for connecting to the upstream proxy.
    #[clap(long, default_value_t = 15)]
    connect_timeout: u64,
}

impl Cli {
    fn upstream_config(&self) -> Result<UpstreamConfig> {
        if let Some(path) = &self.config {
            let file = ProxyConfigFile::load(path)?;
            if !file.default_packages.is_empty() {
                info!(packages = ?file.default_packages, "default packages from config");
            }
            return file
                .proxy
                .ok_or_else(|| anyerr!("config file {} has no proxy section", path.display()));
        }
        let host = self
            .host
            .clone()
            .context("either --config or --host is required")?;
        Ok(UpstreamConfig::new(self.kind, host, self.port)
            .with_credentials(self.username.clone(), self.password.clone()))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();

    let config = cli.upstream_config()?;
    config.validate()?;
    info!(?config, "using upstream proxy");

    let upstream =
        Upstream::from_config(&config).with_connect_timeout(Duration::from_secs(cli.connect_timeout));
    let server = LocalProxyServer::new(upstream, ServerOpts::default().listen(cli.listen));
    let addr = server.start().await?;
    println!("proxy listening on {addr}");

    tokio::signal::ctrl_c()
        .await
        .std_context("failed to wait for ctrl-c")?;
    if server.active_connections() > 0 {
        warn!(
            active = server.active_connections(),
            "stopping with open connections"
        );
    }
    server.stop().await;
    Ok(())
}
