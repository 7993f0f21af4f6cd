/*!
# Hostwatch DevKit - test doubles for the strategy engine

Library used by the engine's scenario tests:
- Recording mock protocol extension with canned answers
- Simulated SNMP agent backed by an in-memory MIB
- Connector builders
- Test harness wiring one host and running the strategies
*/

pub mod connector_builder;
pub mod mock_extension;
pub mod snmp_sim;
pub mod test_utils;

pub use connector_builder::{ConnectorBuilder, JobBuilder, StageBuilder};
pub use mock_extension::{CallKind, MockConfiguration, MockExtension, RecordedCall};
pub use snmp_sim::{SnmpConfiguration, SnmpSimulator};
pub use test_utils::{TestHarness, TestStats};
