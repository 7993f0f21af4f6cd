//! Reachability check of every protocol the host is configured for.

use super::{Strategy, StrategyContext};
use crate::constants::protocol_up_metric_name;
use crate::error::EngineError;
use crate::extension::ExtensionManager;
use crate::telemetry::MetricFactory;
use tracing::debug;

pub struct ProtocolHealthCheckStrategy {
    context: StrategyContext,
}

impl ProtocolHealthCheckStrategy {
    pub fn new(context: StrategyContext) -> Self {
        Self { context }
    }
}

impl Strategy for ProtocolHealthCheckStrategy {
    /// Check result per extension identifier. `None` means the extension
    /// had nothing to check.
    type Output = Vec<(String, Option<bool>)>;

    fn name(&self) -> &'static str {
        "protocol health check"
    }

    fn strategy_time(&self) -> i64 {
        self.context.strategy_time
    }

    async fn run(&self) -> Result<Self::Output, EngineError> {
        let telemetry_manager = self.context.telemetry_manager.clone();
        let extension_manager = self.context.extension_manager.clone();

        let checks = tokio::task::spawn_blocking(move || {
            extension_manager
                .extensions()
                .iter()
                .filter(|extension| ExtensionManager::has_valid_configuration(extension.as_ref(), &telemetry_manager))
                .map(|extension| (extension.identifier().to_string(), extension.check_protocol(&telemetry_manager)))
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| EngineError::Join(e.to_string()))?;

        let factory = MetricFactory::new(self.context.hostname());
        let mut store = self.context.telemetry_manager.monitors();
        let Some(host) = store.endpoint_host_mut() else {
            debug!("Hostname {} - No endpoint host monitor, protocol status not recorded", self.context.hostname());
            return Ok(checks);
        };

        for (protocol, up) in &checks {
            let Some(up) = up else { continue };
            debug!("Hostname {} - Protocol {} is {}", self.context.hostname(), protocol, if *up { "up" } else { "down" });
            factory.collect_number_metric(
                host,
                &protocol_up_metric_name(protocol),
                if *up { 1.0 } else { 0.0 },
                self.context.strategy_time,
            );
        }
        Ok(checks)
    }
}
