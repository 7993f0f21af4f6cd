/*!
 * HOSTWATCH ENGINE - connector-driven monitoring strategies
 *
 * ROLE: Turns declarative connectors into monitors and metrics for one host.
 * The engine never talks to a device itself: every protocol call goes
 * through a `ProtocolExtension` registered in the `ExtensionManager`.
 *
 * FLOW (per host, one `TelemetryManager` each):
 *   DetectionStrategy -> DiscoveryStrategy -> CollectStrategy
 *   sources (ordering) -> extensions -> computes -> source table registry
 *   -> mapping -> monitor store
 *
 * The process root (agent, tests) owns the `ConnectorStore` and the
 * extensions and hands them to each host.
 */
pub mod collections;
pub mod config;
pub mod connector;
pub mod constants;
pub mod error;
pub mod extension;
pub mod macros;
pub mod ordering;
pub mod source_table;
pub mod state;
pub mod strategy;
pub mod telemetry;
pub mod text_table;

pub use config::{load_settings, EngineSettings, HostConfiguration};
pub use connector::{Connector, ConnectorStore, DeviceKind};
pub use error::{EngineError, ExtensionError};
pub use extension::{Configuration, ExtensionManager, ProtocolExtension};
pub use source_table::SourceTable;
pub use strategy::{
    CollectStrategy, DetectionStrategy, DiscoveryStrategy, ProtocolHealthCheckStrategy, Strategy, StrategyContext,
};
pub use telemetry::{Metric, Monitor, TelemetryManager};
