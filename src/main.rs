use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use govwatch::analyzer::provider::{AnalysisProvider, OpenAiProvider};
use govwatch::analyzer::HybridAnalyzer;
use govwatch::chain::client::ChainClient;
use govwatch::config::Config;
use govwatch::delivery::LogNotifier;
use govwatch::scheduler::Scheduler;
use govwatch::subscribers::FileDirectory;

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    if config.logging.json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    init_tracing(&config);
    info!(
        config = %config_path.display(),
        chains = config.chains.len(),
        providers = config.analyzer.providers.len(),
        "govwatch starting"
    );

    let descriptors: Vec<_> = config.chains.iter().map(|c| c.descriptor()).collect();
    let querier = Arc::new(ChainClient::new(
        descriptors.clone(),
        Duration::from_secs(config.watcher.request_timeout_secs),
    ));

    let providers: Vec<Arc<dyn AnalysisProvider>> = config
        .analyzer
        .providers
        .iter()
        .map(|p| {
            Arc::new(OpenAiProvider::new(
                p,
                Config::provider_api_key(p),
                config.analyzer.temperature,
                Duration::from_secs(config.analyzer.llm_timeout_secs),
            )) as Arc<dyn AnalysisProvider>
        })
        .collect();
    let analyzer = Arc::new(HybridAnalyzer::new(providers));

    let directory = Arc::new(FileDirectory::new(
        config.storage.data_dir.join("subscribers.json"),
    ));

    let scheduler = Scheduler::start(
        descriptors,
        querier,
        directory,
        Arc::new(LogNotifier),
        analyzer,
        &config.storage.data_dir,
        config.watcher.clone(),
        config.scheduler.clone(),
    )?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown signal received");
    scheduler.shutdown().await;
    Ok(())
}
