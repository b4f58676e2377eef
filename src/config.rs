//! Session configuration loaded from a JSON file.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::metrics::{DevInfo, MetricSet};

/// Session configuration, loaded from JSON.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Length of a graph window. Default: 60ms.
    #[serde(default = "default_aggregation_period_ns")]
    pub aggregation_period_ns: u64,

    /// Requested OA sampling period, clamped to the aggregation period.
    /// Default: 1ms.
    #[serde(default = "default_sampling_period_ns")]
    pub sampling_period_ns: u64,

    /// How much history each track keeps, in seconds. Default: 7.
    #[serde(default = "default_visible_window_s")]
    pub visible_window_s: f64,

    /// CPUs to open tracepoint streams on.
    #[serde(default = "default_n_cpus")]
    pub n_cpus: u32,

    /// Sample records carry a CPU timestamp.
    #[serde(default)]
    pub cpu_timestamps: bool,

    /// Sample records carry a GPU timestamp.
    #[serde(default)]
    pub gpu_timestamps: bool,

    /// Log every lost report at warn level.
    #[serde(default)]
    pub warn_report_loss: bool,

    #[serde(default)]
    pub devinfo: DevInfo,

    /// Metric catalog.
    #[serde(default)]
    pub metric_sets: Vec<MetricSet>,

    /// Symbol name of the metric set to sample with.
    #[serde(default)]
    pub metric_set: Option<String>,

    /// Tracepoints to correlate processes with.
    #[serde(default = "default_tracepoints")]
    pub tracepoints: Vec<String>,
}

fn default_aggregation_period_ns() -> u64 {
    60_000_000
}

fn default_sampling_period_ns() -> u64 {
    1_000_000
}

fn default_visible_window_s() -> f64 {
    7.0
}

fn default_n_cpus() -> u32 {
    1
}

fn default_tracepoints() -> Vec<String> {
    vec!["i915/i915_request_add".to_string()]
}

impl Default for Config {
    fn default() -> Self {
        Config {
            aggregation_period_ns: default_aggregation_period_ns(),
            sampling_period_ns: default_sampling_period_ns(),
            visible_window_s: default_visible_window_s(),
            n_cpus: default_n_cpus(),
            cpu_timestamps: false,
            gpu_timestamps: false,
            warn_report_loss: false,
            devinfo: DevInfo::default(),
            metric_sets: Vec::new(),
            metric_set: None,
            tracepoints: default_tracepoints(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_json::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.devinfo.timestamp_frequency == 0 {
            bail!("devinfo.timestamp_frequency must be positive");
        }

        if self.aggregation_period_ns == 0 {
            bail!("aggregation_period_ns must be positive");
        }

        if self.sampling_period_ns == 0 {
            bail!("sampling_period_ns must be positive");
        }

        if !(self.visible_window_s > 0.0) {
            bail!("visible_window_s must be positive");
        }

        if let Some(symbol) = &self.metric_set {
            if self.find_metric_set(symbol).is_none() {
                bail!("metric_set {} is not in metric_sets", symbol);
            }
        }

        Ok(())
    }

    pub fn visible_window_ns(&self) -> u64 {
        (self.visible_window_s * 1_000_000_000.0) as u64
    }

    pub fn find_metric_set(&self, symbol_name: &str) -> Option<&MetricSet> {
        self.metric_sets
            .iter()
            .find(|set| set.symbol_name == symbol_name)
    }

    pub fn find_metric_set_by_guid(&self, guid: &str) -> Option<&MetricSet> {
        self.metric_sets.iter().find(|set| set.hw_config_guid == guid)
    }

    /// The selected metric set, ready to hand to a session.
    pub fn selected_metric_set(&self) -> Option<Arc<MetricSet>> {
        let symbol = self.metric_set.as_deref()?;
        self.find_metric_set(symbol).cloned().map(Arc::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::OaFormat;

    #[test]
    fn test_defaults() {
        let cfg: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.aggregation_period_ns, 60_000_000);
        assert_eq!(cfg.sampling_period_ns, 1_000_000);
        assert_eq!(cfg.visible_window_ns(), 7_000_000_000);
        assert_eq!(cfg.devinfo.timestamp_frequency, 12_000_000);
        assert!(cfg.metric_set.is_none());
        cfg.validate().unwrap();
    }

    #[test]
    fn test_metric_catalog() {
        let cfg: Config = serde_json::from_str(
            r#"{
                "metric_set": "RenderBasic",
                "metric_sets": [{
                    "name": "Render Metrics Basic",
                    "symbol_name": "RenderBasic",
                    "hw_config_guid": "b541bd57-0e0f-4154-b4c0-5858010a2bf7",
                    "format": "A32u40_A4u32_B8_C8",
                    "counters": [{
                        "name": "GPU Time Elapsed",
                        "symbol_name": "GpuTime",
                        "units": "ns",
                        "equation": { "kind": "gpu_time" }
                    }]
                }]
            }"#,
        )
        .unwrap();
        cfg.validate().unwrap();

        let set = cfg.selected_metric_set().unwrap();
        assert_eq!(set.format, OaFormat::A32u40A4u32B8C8);
        assert_eq!(set.counters.len(), 1);
        assert!(cfg
            .find_metric_set_by_guid("b541bd57-0e0f-4154-b4c0-5858010a2bf7")
            .is_some());
    }

    #[test]
    fn test_validate_rejects() {
        let mut cfg = Config::default();
        cfg.devinfo.timestamp_frequency = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.visible_window_s = 0.0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.metric_set = Some("Missing".to_string());
        assert!(cfg.validate().is_err());
    }
}
