use super::metric::{extract_attributes, extract_name, Metric, NumberMetric, StateSetMetric};
use super::monitor::Monitor;
use crate::collections::OrderedMap;
use crate::connector::{Connector, MetricKind};
use crate::constants::MONITOR_ATTRIBUTE_ID;
use tracing::warn;

/// Writes mapped values into a monitor, choosing the metric kind from the
/// connector's `metrics` section.
#[derive(Debug, Clone)]
pub struct MetricFactory {
    hostname: String,
}

impl MetricFactory {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self { hostname: hostname.into() }
    }

    pub fn collect_number_metric(&self, monitor: &mut Monitor, name: &str, value: f64, collect_time: i64) {
        match monitor.get_metric_mut(name).and_then(Metric::as_number_mut) {
            Some(metric) => metric.update(value, collect_time),
            None => monitor.add_metric(name, Metric::Number(NumberMetric::new(name, value, collect_time))),
        }
    }

    pub fn collect_state_set_metric(
        &self,
        monitor: &mut Monitor,
        name: &str,
        value: &str,
        state_set: &[String],
        collect_time: i64,
    ) {
        match monitor.get_metric_mut(name).and_then(Metric::as_state_set_mut) {
            Some(metric) => metric.update(value, collect_time),
            None => monitor.add_metric(
                name,
                Metric::StateSet(StateSetMetric::new(name, value, state_set.to_vec(), collect_time)),
            ),
        }
    }

    /// Collects one metric. A name carrying a `state` attribute is always
    /// numeric; otherwise a `stateSet` definition yields a state-set metric.
    /// Returns `false` when the value could not be parsed.
    pub fn collect_metric(
        &self,
        connector: &Connector,
        monitor: &mut Monitor,
        name: &str,
        value: &str,
        collect_time: i64,
    ) -> bool {
        let has_state_attribute = extract_attributes(name).contains_key("state");
        let definition = connector.metrics.get(extract_name(name));

        if let (false, Some(MetricKind::StateSet(states))) = (has_state_attribute, definition.map(|d| &d.metric_type)) {
            self.collect_state_set_metric(monitor, name, value, states, collect_time);
            return true;
        }

        match value.trim().parse::<f64>() {
            Ok(number) => {
                self.collect_number_metric(monitor, name, number, collect_time);
                true
            }
            Err(_) => {
                warn!(
                    "Hostname {} - Cannot parse the {} value '{}' for monitor id {}. {} won't be collected",
                    self.hostname,
                    name,
                    value,
                    monitor.attribute(MONITOR_ATTRIBUTE_ID).unwrap_or_default(),
                    name
                );
                false
            }
        }
    }

    /// Collects every mapped metric of a monitor. Discovery marks them with
    /// `reset_metric_time` so that `prepare` re-arms them at each cycle.
    pub fn collect_monitor_metrics(
        &self,
        connector: &Connector,
        monitor: &mut Monitor,
        metrics: &OrderedMap<String>,
        collect_time: i64,
        is_discovery: bool,
    ) {
        for (name, value) in metrics.iter() {
            if self.collect_metric(connector, monitor, name, value, collect_time) && is_discovery {
                if let Some(metric) = monitor.get_metric_mut(name) {
                    metric.set_reset_metric_time(true);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::MetricDefinition;

    fn connector() -> Connector {
        let mut connector = Connector::default();
        connector.metrics.insert(
            "hw.status",
            MetricDefinition {
                metric_type: MetricKind::StateSet(vec!["ok".into(), "degraded".into(), "failed".into()]),
                ..MetricDefinition::default()
            },
        );
        connector
    }

    #[test]
    fn state_set_definition_creates_state_set_metric() {
        let factory = MetricFactory::new("srv-01");
        let mut monitor = Monitor::new("fan", "f1");

        assert!(factory.collect_metric(&connector(), &mut monitor, "hw.status{hw.type=\"fan\"}", "degraded", 10));
        let metric = monitor.get_state_set_metric("hw.status{hw.type=\"fan\"}").unwrap();
        assert_eq!(metric.value, "degraded");
        assert_eq!(metric.state_set.len(), 3);
        assert_eq!(metric.attributes.get("hw.type").map(String::as_str), Some("fan"));
    }

    #[test]
    fn state_attribute_forces_number_metric() {
        let factory = MetricFactory::new("srv-01");
        let mut monitor = Monitor::new("fan", "f1");
        let name = "hw.status{hw.type=\"fan\", state=\"ok\"}";

        assert!(factory.collect_metric(&connector(), &mut monitor, name, "1", 10));
        assert_eq!(monitor.get_number_metric(name).unwrap().value, 1.0);
    }

    #[test]
    fn unparseable_value_is_skipped() {
        let factory = MetricFactory::new("srv-01");
        let mut monitor = Monitor::new("fan", "f1");

        assert!(!factory.collect_metric(&connector(), &mut monitor, "hw.fan.speed", "n/a", 10));
        assert!(monitor.metrics.is_empty());
    }

    #[test]
    fn discovery_flags_reset_metric_time() {
        let factory = MetricFactory::new("srv-01");
        let mut monitor = Monitor::new("fan", "f1");
        let metrics: OrderedMap<String> = [("hw.fan.speed.limit", "500".to_string())].into_iter().collect();

        factory.collect_monitor_metrics(&connector(), &mut monitor, &metrics, 10, true);
        assert!(monitor.get_metric("hw.fan.speed.limit").unwrap().reset_metric_time());

        factory.collect_monitor_metrics(&connector(), &mut monitor, &metrics, 20, false);
        let metric = monitor.get_number_metric("hw.fan.speed.limit").unwrap();
        assert!(metric.reset_metric_time);
        assert_eq!(metric.previous_collect_time, Some(10));
    }
}
