//! Hostwatch Agent - process root of the monitoring engine
//!
//! This agent:
//! - Loads the agent configuration and the YAML connector library
//! - Registers the protocol extensions available in this binary
//! - Runs detection, discovery, collect and protocol health per host on a timer
//! - Keeps hosts independent: a failing host never stops the others

mod config;
mod execution;
mod extension;

use anyhow::{Context, Result};
use config::AgentConfig;
use extension::LocalCommandExtension;
use hostwatch_engine::{
    load_settings, CollectStrategy, ConnectorStore, DetectionStrategy, DiscoveryStrategy, EngineSettings,
    ExtensionManager, ProtocolHealthCheckStrategy, StrategyContext, TelemetryManager,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// One monitored host and its cycle counter.
struct HostRunner {
    telemetry_manager: Arc<TelemetryManager>,
    extension_manager: Arc<ExtensionManager>,
    cycles: u64,
}

impl HostRunner {
    fn context(&self, strategy_time: i64) -> StrategyContext {
        StrategyContext::new(self.telemetry_manager.clone(), self.extension_manager.clone(), strategy_time)
    }

    /// Detection and discovery run on the first cycle and then every
    /// `rediscovery_every` cycles; collect and protocol health every cycle.
    async fn run_cycle(&mut self, rediscovery_every: u64) {
        let strategy_time = now_millis();
        let hostname = self.telemetry_manager.hostname().to_string();
        let tm = self.telemetry_manager.clone();

        if self.cycles % rediscovery_every.max(1) == 0 {
            match tm.run_strategy(&DetectionStrategy::new(self.context(strategy_time))).await {
                Ok(detected) => info!("Hostname {} - {} connector(s) detected", hostname, detected.len()),
                Err(e) => warn!("Hostname {} - detection aborted: {}", hostname, e),
            }
            if let Err(e) = tm.run_strategy(&DiscoveryStrategy::new(self.context(strategy_time))).await {
                warn!("Hostname {} - discovery aborted: {}", hostname, e);
            }
        }

        if let Err(e) = tm.run_strategy(&CollectStrategy::new(self.context(strategy_time))).await {
            warn!("Hostname {} - collect aborted: {}", hostname, e);
        }
        if let Ok(checks) = tm.run_strategy(&ProtocolHealthCheckStrategy::new(self.context(strategy_time))).await {
            for (protocol, up) in checks {
                debug!("Hostname {} - protocol {} up: {:?}", hostname, protocol, up);
            }
        }

        self.cycles += 1;
        match tm.to_json() {
            Ok(json) => debug!("Hostname {} - telemetry: {}", hostname, json),
            Err(e) => error!("Hostname {} - cannot serialize telemetry: {}", hostname, e),
        }
    }
}

fn now_millis() -> i64 {
    let now = time::OffsetDateTime::now_utc();
    (now.unix_timestamp_nanos() / 1_000_000) as i64
}

fn config_path_from_args() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(PathBuf::from(path));
        }
    }
    None
}

fn build_runners(
    config: &AgentConfig,
    store: Arc<ConnectorStore>,
    extensions: Arc<ExtensionManager>,
    settings: &EngineSettings,
) -> Vec<HostRunner> {
    config
        .hosts
        .iter()
        .filter_map(|entry| match entry.to_host_configuration(&extensions) {
            Ok(host) => Some(HostRunner {
                telemetry_manager: Arc::new(TelemetryManager::new(host, store.clone()).with_settings(settings.clone())),
                extension_manager: extensions.clone(),
                cycles: 0,
            }),
            Err(e) => {
                error!("Skipping host {}: {:#}", entry.hostname, e);
                None
            }
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hostwatch=info,info")))
        .init();

    info!("Hostwatch Agent v{} starting...", env!("CARGO_PKG_VERSION"));

    let config = AgentConfig::load(config_path_from_args()).await.context("Failed to load agent configuration")?;
    let settings = load_settings().await;

    let connectors_dir = config.connectors_dir.clone();
    let store = tokio::task::spawn_blocking(move || ConnectorStore::load_dir(&connectors_dir))
        .await
        .context("connector loading panicked")?
        .context("Failed to load connector library")?;
    info!("Loaded {} connector(s) from {}", store.len(), config.connectors_dir.display());

    let extensions = Arc::new(ExtensionManager::new().with_extension(LocalCommandExtension::new()));
    info!("Protocol extensions: {:?}", extensions.list_extensions());

    let runners = build_runners(&config, Arc::new(store), extensions, &settings);
    if runners.is_empty() {
        anyhow::bail!("no host to monitor");
    }

    // Re-run detection and discovery about once an hour
    let rediscovery_every = (3_600 / config.interval_secs.max(1)).max(1);
    let mut ticker = interval(Duration::from_secs(config.interval_secs.max(1)));
    let mut runners: Vec<Option<HostRunner>> = runners.into_iter().map(Some).collect();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let mut cycle = JoinSet::new();
                for (index, slot) in runners.iter_mut().enumerate() {
                    if let Some(mut runner) = slot.take() {
                        cycle.spawn(async move {
                            runner.run_cycle(rediscovery_every).await;
                            (index, runner)
                        });
                    }
                }
                while let Some(joined) = cycle.join_next().await {
                    match joined {
                        Ok((index, runner)) => runners[index] = Some(runner),
                        Err(e) => error!("host cycle panicked: {}", e),
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unparsable_hosts_are_skipped() {
        let config: AgentConfig = toml::from_str(
            r#"
[[hosts]]
hostname = "good"
[hosts.configurations.commandline]

[[hosts]]
hostname = "bad"
[hosts.configurations.wmi]
"#,
        )
        .unwrap();
        let extensions = Arc::new(ExtensionManager::new().with_extension(LocalCommandExtension::new()));
        let runners = build_runners(&config, Arc::new(ConnectorStore::new()), extensions, &EngineSettings::default());
        assert_eq!(runners.len(), 1);
        assert_eq!(runners[0].telemetry_manager.hostname(), "good");
    }

    #[tokio::test]
    async fn cycle_on_empty_library_marks_host_present() {
        let extensions = Arc::new(ExtensionManager::new().with_extension(LocalCommandExtension::new()));
        let mut runners =
            build_runners(&AgentConfig::default(), Arc::new(ConnectorStore::new()), extensions, &EngineSettings::default());
        let runner = &mut runners[0];

        runner.run_cycle(10).await;

        assert_eq!(runner.cycles, 1);
        let host = runner.telemetry_manager.endpoint_host_monitor().unwrap();
        assert_eq!(host.attribute("location"), Some("local"));
    }
}
