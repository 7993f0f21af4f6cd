/**
 * STRATEGIES - detection, discovery, collect and protocol health
 *
 * LIFECYCLE (per host, driven by `TelemetryManager::run_strategy`):
 *   prepare -> run -> post, all at one strategy time
 *
 * MONITOR JOBS:
 * - fixed-priority types (host, enclosure, blade, disk_controller, cpu)
 *   run first, one after the other, in that order
 * - the remainder runs on a pool bounded by `max_threads`, or sequentially
 *   when the host asks for it
 * - the pool is awaited for `job_timeout`; stragglers are cancelled
 *   through a `CancellationToken` checked between sources
 * - jobs are blocking (extension calls) and run on `spawn_blocking`
 *
 * ERRORS:
 * - fatal errors (no extension for a declared type) leave the run
 * - anything else is logged and confined to its job or connector
 */
pub mod collect;
pub mod columns;
pub mod compute;
pub mod detection;
pub mod discovery;
pub mod mapping;
pub mod protocol_health;
pub mod sources;

pub use collect::CollectStrategy;
pub use detection::{ConnectorTestResult, CriterionOutcome, DetectionStrategy};
pub use discovery::DiscoveryStrategy;
pub use mapping::MappingProcessor;
pub use protocol_health::ProtocolHealthCheckStrategy;
pub use sources::SourceProcessor;

use crate::connector::Connector;
use crate::constants::{
    monitor_job_priority, CONNECTOR_MONITOR_TYPE, CONNECTOR_STATUS_METRIC_KEY, STATE_SET_METRIC_FAILED,
};
use crate::error::EngineError;
use crate::extension::ExtensionManager;
use crate::telemetry::{Metric, TelemetryManager};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

pub trait Strategy: Send + Sync {
    type Output: Send;

    fn name(&self) -> &'static str;

    /// Epoch milliseconds stamped on everything the strategy collects.
    fn strategy_time(&self) -> i64;

    fn prepare(&self) -> impl Future<Output = Result<(), EngineError>> + Send {
        async { Ok(()) }
    }

    fn run(&self) -> impl Future<Output = Result<Self::Output, EngineError>> + Send;

    fn post(&self) -> impl Future<Output = Result<(), EngineError>> + Send {
        async { Ok(()) }
    }
}

/// What every strategy works with: the host's telemetry, the protocol
/// extensions and the time of the run.
#[derive(Debug, Clone)]
pub struct StrategyContext {
    pub telemetry_manager: Arc<TelemetryManager>,
    pub extension_manager: Arc<ExtensionManager>,
    pub strategy_time: i64,
}

impl StrategyContext {
    pub fn new(
        telemetry_manager: Arc<TelemetryManager>,
        extension_manager: Arc<ExtensionManager>,
        strategy_time: i64,
    ) -> Self {
        Self { telemetry_manager, extension_manager, strategy_time }
    }

    pub fn hostname(&self) -> &str {
        self.telemetry_manager.hostname()
    }
}

/// One monitor job of a connector: `(context, connector, monitor type, cancel)`.
pub type JobFn = fn(&StrategyContext, &Connector, &str, &CancellationToken) -> Result<(), EngineError>;

/// Monitor types of `connector` split into the fixed-priority types, in
/// priority order, and the remainder in declaration order.
pub fn order_monitor_jobs(connector: &Connector) -> (Vec<String>, Vec<String>) {
    let (mut priority, remainder): (Vec<String>, Vec<String>) = connector
        .monitors
        .keys()
        .map(str::to_string)
        .partition(|monitor_type| monitor_job_priority(monitor_type).is_some());
    priority.sort_by_key(|monitor_type| monitor_job_priority(monitor_type));
    (priority, remainder)
}

/// Runs the `beforeAll` sources of `connector`, then `job` for each of its
/// monitor types following the priority rules.
pub(crate) async fn run_connector_jobs(
    context: &StrategyContext,
    connector: &Arc<Connector>,
    job: JobFn,
) -> Result<(), EngineError> {
    let hostname = context.hostname().to_string();
    let cancel = CancellationToken::new();

    if !connector.before_all.is_empty() {
        let result = spawn_job(context, connector, &cancel, None, |context, connector, _, cancel| {
            SourceProcessor::new(
                &context.telemetry_manager,
                &context.extension_manager,
                connector,
                sources::BEFORE_ALL_PREFIX,
            )
            .run_all(sources::BEFORE_ALL_PREFIX, &connector.before_all, &[], &Default::default(), cancel)
        })
        .await;
        if !job_completed(&hostname, &connector.id, sources::BEFORE_ALL_PREFIX, result)? {
            return Ok(());
        }
    }

    let (priority, remainder) = order_monitor_jobs(connector);
    let sequential = context.telemetry_manager.host_configuration().sequential;

    for monitor_type in &priority {
        let result = spawn_job(context, connector, &cancel, Some(monitor_type.clone()), job).await;
        job_completed(&hostname, &connector.id, monitor_type, result)?;
    }

    if sequential {
        for monitor_type in &remainder {
            let result = spawn_job(context, connector, &cancel, Some(monitor_type.clone()), job).await;
            job_completed(&hostname, &connector.id, monitor_type, result)?;
        }
        return Ok(());
    }

    run_pool(context, connector, &cancel, remainder, job).await
}

async fn run_pool(
    context: &StrategyContext,
    connector: &Arc<Connector>,
    cancel: &CancellationToken,
    monitor_types: Vec<String>,
    job: JobFn,
) -> Result<(), EngineError> {
    if monitor_types.is_empty() {
        return Ok(());
    }

    let settings = context.telemetry_manager.settings();
    let semaphore = Arc::new(Semaphore::new(settings.max_threads.max(1)));
    let job_timeout = settings.job_timeout();
    let hostname = context.hostname().to_string();

    let mut pool = JoinSet::new();
    for monitor_type in monitor_types {
        let semaphore = semaphore.clone();
        let context = context.clone();
        let connector = connector.clone();
        let cancel = cancel.clone();
        pool.spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return (monitor_type, Ok(Err(EngineError::Cancelled)));
            };
            let result = spawn_job(&context, &connector, &cancel, Some(monitor_type.clone()), job).await;
            (monitor_type, result)
        });
    }

    let drain = async {
        while let Some(joined) = pool.join_next().await {
            let (monitor_type, result) = match joined {
                Ok(outcome) => outcome,
                Err(e) => (String::from("<unknown>"), Err(e)),
            };
            if let Err(fatal) = job_completed(&hostname, &connector.id, &monitor_type, result) {
                return Err(fatal);
            }
        }
        Ok(())
    };

    let outcome = tokio::time::timeout(job_timeout, drain).await;
    match outcome {
        Ok(Ok(())) => Ok(()),
        Ok(Err(fatal)) => {
            cancel.cancel();
            pool.abort_all();
            Err(fatal)
        }
        Err(_) => {
            cancel.cancel();
            error!(
                "Hostname {} - Connector {}: {}. {} monitor job(s) cancelled",
                hostname,
                connector.id,
                EngineError::Timeout(job_timeout.as_secs()),
                pool.len()
            );
            // Only the async wrappers are aborted. A blocking job already
            // running stops at its next cancel check and may still store
            // source tables after this returns.
            pool.abort_all();
            Ok(())
        }
    }
}

async fn spawn_job(
    context: &StrategyContext,
    connector: &Arc<Connector>,
    cancel: &CancellationToken,
    monitor_type: Option<String>,
    job: JobFn,
) -> Result<Result<(), EngineError>, JoinError> {
    let context = context.clone();
    let connector = connector.clone();
    let cancel = cancel.clone();
    tokio::task::spawn_blocking(move || {
        let monitor_type = monitor_type.unwrap_or_default();
        job(&context, &connector, &monitor_type, &cancel)
    })
    .await
}

/// Logs the outcome of a job. Only fatal errors are returned; `Ok(false)`
/// means the job failed and the caller may skip what depends on it.
fn job_completed(
    hostname: &str,
    connector_id: &str,
    monitor_type: &str,
    result: Result<Result<(), EngineError>, JoinError>,
) -> Result<bool, EngineError> {
    match result {
        Ok(Ok(())) => Ok(true),
        Ok(Err(e)) if e.is_fatal() => {
            error!("Hostname {} - Connector {} - {}: {}", hostname, connector_id, monitor_type, e);
            Err(e)
        }
        Ok(Err(EngineError::Cancelled)) => {
            warn!("Hostname {} - Connector {} - {} job cancelled", hostname, connector_id, monitor_type);
            Ok(false)
        }
        Ok(Err(e)) => {
            error!("Hostname {} - Connector {} - {} job failed: {}", hostname, connector_id, monitor_type, e);
            Ok(false)
        }
        Err(e) => {
            error!(
                "Hostname {} - Connector {} - {}: {}",
                hostname,
                connector_id,
                monitor_type,
                EngineError::Join(e.to_string())
            );
            Ok(false)
        }
    }
}

/// Detected connectors, read back from the `connector` monitors whose
/// status is not `failed`.
pub fn detected_connectors(telemetry_manager: &TelemetryManager) -> Vec<Arc<Connector>> {
    let ids: Vec<String> = telemetry_manager
        .find_monitors_by_type(CONNECTOR_MONITOR_TYPE)
        .values()
        .filter(|monitor| match monitor.get_metric(CONNECTOR_STATUS_METRIC_KEY) {
            Some(Metric::StateSet(status)) => status.value != STATE_SET_METRIC_FAILED,
            Some(Metric::Number(status)) => status.value != 0.0,
            None => true,
        })
        .filter_map(|monitor| monitor.connector_id().map(str::to_string))
        .collect();

    ids.iter()
        .filter_map(|id| {
            let connector = telemetry_manager.connector(id);
            if connector.is_none() {
                debug!("Hostname {} - Connector {} is no longer in the store", telemetry_manager.hostname(), id);
            }
            connector
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::MonitorJob;

    #[test]
    fn priority_types_come_first_in_fixed_order() {
        let mut connector = Connector::default();
        for monitor_type in ["fan", "cpu", "custom1", "enclosure", "host"] {
            connector.monitors.insert(monitor_type, MonitorJob::default());
        }

        let (priority, remainder) = order_monitor_jobs(&connector);
        assert_eq!(priority, vec!["host", "enclosure", "cpu"]);
        assert_eq!(remainder, vec!["fan", "custom1"]);
    }
}
