use tracing_subscriber::EnvFilter;

/// `RUST_LOG` overrides the default `leaflens=info` directive.
pub fn init() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("leaflens=info,tower_http=info"))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))
}
