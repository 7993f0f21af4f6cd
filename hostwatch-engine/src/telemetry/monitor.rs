use super::metric::{Metric, NumberMetric, StateSetMetric};
use crate::collections::OrderedMap;
use crate::constants::{IS_ENDPOINT, MONITOR_ATTRIBUTE_CONNECTOR_ID, MONITOR_ATTRIBUTE_ID};
use serde::Serialize;
use std::collections::BTreeMap;

/// One monitored component (host, enclosure, fan...). Key = (type, id).
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Monitor {
    pub id: String,
    #[serde(rename = "type")]
    pub monitor_type: String,
    pub is_endpoint: bool,
    pub attributes: OrderedMap<String>,
    pub metrics: BTreeMap<String, Metric>,
    pub legacy_text_parameters: OrderedMap<String>,
    pub discovery_time: Option<i64>,
    /// Raw samples behind `rate` and `fakeCounter`, per metric name.
    #[serde(skip)]
    pub counter_samples: BTreeMap<String, NumberMetric>,
}

impl Monitor {
    pub fn new(monitor_type: impl Into<String>, id: impl Into<String>) -> Self {
        let id = id.into();
        let mut attributes = OrderedMap::new();
        attributes.insert(MONITOR_ATTRIBUTE_ID, id.clone());
        Self { id, monitor_type: monitor_type.into(), attributes, ..Self::default() }
    }

    /// Root host monitor of the host.
    pub fn endpoint(monitor_type: impl Into<String>, id: impl Into<String>) -> Self {
        let mut monitor = Self::new(monitor_type, id);
        monitor.is_endpoint = true;
        monitor.add_attribute(IS_ENDPOINT, "true");
        monitor
    }

    pub fn add_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(key, value.into());
    }

    pub fn add_attributes<'a>(&mut self, attributes: impl IntoIterator<Item = (&'a str, &'a String)>) {
        for (key, value) in attributes {
            self.attributes.insert(key, value.clone());
        }
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn connector_id(&self) -> Option<&str> {
        self.attribute(MONITOR_ATTRIBUTE_CONNECTOR_ID)
    }

    pub fn get_metric(&self, name: &str) -> Option<&Metric> {
        self.metrics.get(name)
    }

    pub fn get_metric_mut(&mut self, name: &str) -> Option<&mut Metric> {
        self.metrics.get_mut(name)
    }

    pub fn get_number_metric(&self, name: &str) -> Option<&NumberMetric> {
        self.get_metric(name).and_then(Metric::as_number)
    }

    pub fn get_state_set_metric(&self, name: &str) -> Option<&StateSetMetric> {
        self.get_metric(name).and_then(Metric::as_state_set)
    }

    pub fn add_metric(&mut self, name: impl Into<String>, metric: Metric) {
        self.metrics.insert(name.into(), metric);
    }

    /// Records `value` as the latest raw sample behind `name` and returns
    /// the sample with its previous value and time.
    pub fn record_counter_sample(&mut self, name: &str, value: f64, collect_time: i64) -> &NumberMetric {
        self.counter_samples
            .entry(name.to_string())
            .and_modify(|sample| sample.update(value, collect_time))
            .or_insert_with(|| NumberMetric::new(name, value, collect_time))
    }

    pub fn add_legacy_text_parameter(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.legacy_text_parameters.insert(key, value.into());
    }

    /// Whether every `keys` attribute equals the one in `attributes`.
    /// A key missing on either side never matches.
    pub fn matches_keys(&self, keys: &[String], attributes: &OrderedMap<String>) -> bool {
        keys.iter().all(|key| match (self.attribute(key), attributes.get(key)) {
            (Some(mine), Some(theirs)) => mine == theirs,
            _ => false,
        })
    }
}

/// Monitors of one host: type -> id -> monitor, sorted for stable output.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct MonitorStore {
    monitors: BTreeMap<String, BTreeMap<String, Monitor>>,
}

impl MonitorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `monitor`, replacing any monitor with the same type and id.
    pub fn add_monitor(&mut self, monitor: Monitor) {
        self.monitors
            .entry(monitor.monitor_type.clone())
            .or_default()
            .insert(monitor.id.clone(), monitor);
    }

    /// Existing monitor, or a fresh one registered under (type, id).
    pub fn get_or_create(&mut self, monitor_type: &str, id: &str) -> &mut Monitor {
        self.monitors
            .entry(monitor_type.to_string())
            .or_default()
            .entry(id.to_string())
            .or_insert_with(|| Monitor::new(monitor_type, id))
    }

    pub fn find_by_type(&self, monitor_type: &str) -> Option<&BTreeMap<String, Monitor>> {
        self.monitors.get(monitor_type)
    }

    pub fn find_by_type_mut(&mut self, monitor_type: &str) -> Option<&mut BTreeMap<String, Monitor>> {
        self.monitors.get_mut(monitor_type)
    }

    pub fn find(&self, monitor_type: &str, id: &str) -> Option<&Monitor> {
        self.monitors.get(monitor_type)?.get(id)
    }

    pub fn find_mut(&mut self, monitor_type: &str, id: &str) -> Option<&mut Monitor> {
        self.monitors.get_mut(monitor_type)?.get_mut(id)
    }

    pub fn remove(&mut self, monitor_type: &str, id: &str) -> Option<Monitor> {
        let by_type = self.monitors.get_mut(monitor_type)?;
        let removed = by_type.remove(id);
        if by_type.is_empty() {
            self.monitors.remove(monitor_type);
        }
        removed
    }

    pub fn endpoint_host(&self) -> Option<&Monitor> {
        self.iter().find(|m| m.is_endpoint)
    }

    pub fn endpoint_host_mut(&mut self) -> Option<&mut Monitor> {
        self.iter_mut().find(|m| m.is_endpoint)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Monitor> {
        self.monitors.values().flat_map(BTreeMap::values)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Monitor> {
        self.monitors.values_mut().flat_map(BTreeMap::values_mut)
    }

    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.monitors.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.monitors.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_matching_is_exact_on_every_key() {
        let mut fan = Monitor::new("fan", "dell_fan_1");
        fan.add_attribute("id", "1");
        fan.add_attribute("controller", "A");

        let row: OrderedMap<String> = [("id", "1".to_string()), ("controller", "A".to_string())].into_iter().collect();
        let keys = vec!["id".to_string(), "controller".to_string()];
        assert!(fan.matches_keys(&keys, &row));

        let other: OrderedMap<String> = [("id", "1".to_string()), ("controller", "a".to_string())].into_iter().collect();
        assert!(!fan.matches_keys(&keys, &other));

        let partial: OrderedMap<String> = [("id", "1".to_string())].into_iter().collect();
        assert!(!fan.matches_keys(&keys, &partial));
    }

    #[test]
    fn counter_samples_stay_out_of_metrics_and_json() {
        let mut nic = Monitor::new("network", "eth0");
        nic.record_counter_sample("hw.network.io", 100.0, 1_000);
        let sample = nic.record_counter_sample("hw.network.io", 300.0, 2_000);
        assert_eq!(sample.previous_value, Some(100.0));

        assert!(nic.metrics.is_empty());
        let json = serde_json::to_string(&nic).unwrap();
        assert!(!json.contains("hw.network.io"));
    }

    #[test]
    fn store_is_keyed_by_type_and_id() {
        let mut store = MonitorStore::new();
        store.add_monitor(Monitor::endpoint("host", "srv-01"));
        store.get_or_create("fan", "f1").add_attribute("name", "Fan 1");
        store.get_or_create("fan", "f1").add_attribute("location", "front");

        assert_eq!(store.len(), 2);
        assert_eq!(store.find("fan", "f1").unwrap().attribute("name"), Some("Fan 1"));
        assert_eq!(store.endpoint_host().unwrap().id, "srv-01");
        assert_eq!(store.types().collect::<Vec<_>>(), vec!["fan", "host"]);

        assert!(store.remove("fan", "f1").is_some());
        assert!(store.find_by_type("fan").is_none());
    }
}
