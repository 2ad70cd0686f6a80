use aggregator::config::AggregatorConfig;
use clap::Parser;

#[derive(Debug, Parser)]
#[command(version, about = "Coalesces keyed lookups into windowed downstream batch calls")]
struct Args {
    /// YAML config file. Without it, defaults apply and `SERVICES_HOST` selects the downstream.
    #[arg(long, env = "AGGREGATOR_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let cfg = match &args.config {
        Some(path) => {
            tracing::info!(config = %path, "loading config");
            AggregatorConfig::load(path).await?
        }
        None => AggregatorConfig::from_env()?,
    };

    aggregator::server::run(cfg).await
}
