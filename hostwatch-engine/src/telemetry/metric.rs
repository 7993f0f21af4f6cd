use serde::Serialize;
use std::collections::BTreeMap;

/// Numeric sample. Collect times are epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NumberMetric {
    pub name: String,
    pub attributes: BTreeMap<String, String>,
    pub value: f64,
    pub previous_value: Option<f64>,
    pub collect_time: i64,
    pub previous_collect_time: Option<i64>,
    /// Set for metrics created at discovery: `prepare` re-arms their collect
    /// time at every cycle.
    pub reset_metric_time: bool,
}

/// Enumerated state among a fixed `state_set`.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSetMetric {
    pub name: String,
    pub attributes: BTreeMap<String, String>,
    pub state_set: Vec<String>,
    pub value: String,
    pub previous_value: Option<String>,
    pub collect_time: i64,
    pub previous_collect_time: Option<i64>,
    pub reset_metric_time: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Metric {
    Number(NumberMetric),
    StateSet(StateSetMetric),
}

impl NumberMetric {
    pub fn new(name: impl Into<String>, value: f64, collect_time: i64) -> Self {
        let name = name.into();
        Self {
            attributes: extract_attributes(&name),
            name,
            value,
            collect_time,
            ..Self::default()
        }
    }

    /// New sample. The current value and time become the previous ones.
    pub fn update(&mut self, value: f64, collect_time: i64) {
        self.previous_value = Some(self.value);
        self.previous_collect_time = Some(self.collect_time);
        self.value = value;
        self.collect_time = collect_time;
    }
}

impl StateSetMetric {
    pub fn new(name: impl Into<String>, value: impl Into<String>, state_set: Vec<String>, collect_time: i64) -> Self {
        let name = name.into();
        Self {
            attributes: extract_attributes(&name),
            name,
            state_set,
            value: value.into(),
            collect_time,
            ..Self::default()
        }
    }

    pub fn update(&mut self, value: impl Into<String>, collect_time: i64) {
        self.previous_value = Some(std::mem::replace(&mut self.value, value.into()));
        self.previous_collect_time = Some(self.collect_time);
        self.collect_time = collect_time;
    }
}

impl Metric {
    pub fn name(&self) -> &str {
        match self {
            Metric::Number(m) => &m.name,
            Metric::StateSet(m) => &m.name,
        }
    }

    pub fn attributes(&self) -> &BTreeMap<String, String> {
        match self {
            Metric::Number(m) => &m.attributes,
            Metric::StateSet(m) => &m.attributes,
        }
    }

    pub fn collect_time(&self) -> i64 {
        match self {
            Metric::Number(m) => m.collect_time,
            Metric::StateSet(m) => m.collect_time,
        }
    }

    /// Moves the collect time without touching the value.
    pub fn set_collect_time(&mut self, collect_time: i64) {
        match self {
            Metric::Number(m) => m.collect_time = collect_time,
            Metric::StateSet(m) => m.collect_time = collect_time,
        }
    }

    pub fn reset_metric_time(&self) -> bool {
        match self {
            Metric::Number(m) => m.reset_metric_time,
            Metric::StateSet(m) => m.reset_metric_time,
        }
    }

    pub fn set_reset_metric_time(&mut self, reset: bool) {
        match self {
            Metric::Number(m) => m.reset_metric_time = reset,
            Metric::StateSet(m) => m.reset_metric_time = reset,
        }
    }

    pub fn as_number(&self) -> Option<&NumberMetric> {
        match self {
            Metric::Number(m) => Some(m),
            Metric::StateSet(_) => None,
        }
    }

    pub fn as_number_mut(&mut self) -> Option<&mut NumberMetric> {
        match self {
            Metric::Number(m) => Some(m),
            Metric::StateSet(_) => None,
        }
    }

    pub fn as_state_set(&self) -> Option<&StateSetMetric> {
        match self {
            Metric::StateSet(m) => Some(m),
            Metric::Number(_) => None,
        }
    }

    pub fn as_state_set_mut(&mut self) -> Option<&mut StateSetMetric> {
        match self {
            Metric::StateSet(m) => Some(m),
            Metric::Number(_) => None,
        }
    }

    /// Whether the metric was collected at `strategy_time`.
    pub fn is_updated(&self, strategy_time: i64) -> bool {
        self.collect_time() == strategy_time
    }
}

/// Metric name without its `{...}` attribute part.
pub fn extract_name(name: &str) -> &str {
    name.split_once('{').map_or(name, |(base, _)| base).trim_end()
}

/// Attributes encoded in a metric name: `hw.status{hw.type="fan", state="ok"}`.
pub fn extract_attributes(name: &str) -> BTreeMap<String, String> {
    let Some(inner) = name
        .split_once('{')
        .and_then(|(_, rest)| rest.split_once('}'))
        .map(|(inner, _)| inner)
    else {
        return BTreeMap::new();
    };

    inner
        .split(',')
        .filter_map(|pair| {
            let (key, value) = pair.trim().split_once('=')?;
            Some((key.trim().to_string(), value.trim().replace('"', "")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_attributes_are_parsed() {
        let name = "hw.status{hw.type=\"fan\", state=\"present\"}";
        assert_eq!(extract_name(name), "hw.status");
        assert_eq!(
            extract_attributes(name),
            BTreeMap::from([("hw.type".to_string(), "fan".to_string()), ("state".to_string(), "present".to_string())])
        );
        assert!(extract_attributes("hw.fan.speed").is_empty());
        assert_eq!(extract_name("hw.fan.speed"), "hw.fan.speed");
    }

    #[test]
    fn update_keeps_previous_sample() {
        let mut metric = NumberMetric::new("hw.fan.speed", 3500.0, 1_000);
        metric.update(3600.0, 2_000);
        assert_eq!(metric.previous_value, Some(3500.0));
        assert_eq!(metric.previous_collect_time, Some(1_000));
        assert_eq!((metric.value, metric.collect_time), (3600.0, 2_000));

        let mut status = StateSetMetric::new("hw.status", "ok", vec!["ok".into(), "failed".into()], 1_000);
        status.update("failed", 2_000);
        assert_eq!(status.previous_value.as_deref(), Some("ok"));
        assert_eq!(status.value, "failed");
    }
}
