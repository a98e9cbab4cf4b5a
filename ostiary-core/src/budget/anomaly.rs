use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

/// Anomaly heuristics configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyConfig {
    /// Run the heuristics at all
    pub enabled: bool,

    /// Deny flagged reservations instead of only recording the flags
    pub block: bool,

    /// Samples kept per tenant
    pub history: usize,

    /// Samples required before anything is flagged
    pub min_samples: usize,

    /// Standard deviations above the mean that count as a spike
    pub spike_sigma: f64,

    /// Multiple of the mean that counts as a ratio anomaly
    pub ratio: f64,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            block: false,
            history: 50,
            min_samples: 5,
            spike_sigma: 3.0,
            ratio: 10.0,
        }
    }
}

/// Kind of anomaly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    /// Cost above mean + k·σ of the tenant's history
    CostSpike,
    /// Cost above a fixed multiple of the tenant's mean
    CostRatio,
}

impl AnomalyKind {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyKind::CostSpike => "cost_spike",
            AnomalyKind::CostRatio => "cost_ratio",
        }
    }
}

/// An advisory anomaly flag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyFlag {
    /// What was detected
    pub kind: AnomalyKind,
    /// The cost that was assessed
    pub cost: u64,
    /// Historical mean
    pub mean: f64,
    /// Threshold that was crossed
    pub threshold: f64,
}

impl std::fmt::Display for AnomalyFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: cost {} above threshold {:.2} (mean {:.2})",
            self.kind.as_str(),
            self.cost,
            self.threshold,
            self.mean
        )
    }
}

/// Rolling per-tenant cost history
#[derive(Debug, Default)]
pub struct AnomalyDetector {
    config: AnomalyConfig,
    history: Mutex<HashMap<String, VecDeque<u64>>>,
}

impl AnomalyDetector {
    /// Create a detector
    pub fn new(config: AnomalyConfig) -> Self {
        Self {
            config,
            history: Mutex::new(HashMap::new()),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &AnomalyConfig {
        &self.config
    }

    /// Flag `cost` against the tenant's history; never mutates the history
    pub fn assess(&self, tenant: &str, cost: u64) -> Vec<AnomalyFlag> {
        if !self.config.enabled {
            return Vec::new();
        }

        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(samples) = history.get(tenant) else {
            return Vec::new();
        };
        if samples.len() < self.config.min_samples.max(1) {
            return Vec::new();
        }

        let n = samples.len() as f64;
        let mean = samples.iter().map(|&c| c as f64).sum::<f64>() / n;
        let variance = samples
            .iter()
            .map(|&c| {
                let d = c as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / n;
        let stddev = variance.sqrt();
        drop(history);

        let cost_f = cost as f64;
        let mut flags = Vec::new();

        let spike = mean + self.config.spike_sigma * stddev;
        if stddev > 0.0 && cost_f > spike {
            flags.push(AnomalyFlag {
                kind: AnomalyKind::CostSpike,
                cost,
                mean,
                threshold: spike,
            });
        }

        let ratio = mean * self.config.ratio;
        if mean > 0.0 && cost_f > ratio {
            flags.push(AnomalyFlag {
                kind: AnomalyKind::CostRatio,
                cost,
                mean,
                threshold: ratio,
            });
        }

        if !flags.is_empty() {
            tracing::info!(tenant, cost, mean, stddev, flags = flags.len(), "Cost anomaly detected");
        }
        flags
    }

    /// Append a settled cost to the tenant's history
    pub fn record(&self, tenant: &str, cost: u64) {
        if !self.config.enabled || self.config.history == 0 {
            return;
        }
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        let samples = history.entry(tenant.to_string()).or_default();
        if samples.len() == self.config.history {
            samples.pop_front();
        }
        samples.push_back(cost);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(costs: &[u64]) -> AnomalyDetector {
        let detector = AnomalyDetector::new(AnomalyConfig::default());
        for &c in costs {
            detector.record("acme", c);
        }
        detector
    }

    #[test]
    fn needs_minimum_history() {
        let detector = seeded(&[1, 1, 1, 1]);
        assert!(detector.assess("acme", 10_000).is_empty());
        assert!(detector.assess("unknown", 10_000).is_empty());
    }

    #[test]
    fn flags_spike_and_ratio() {
        let detector = seeded(&[10, 12, 9, 11, 10, 8]);
        let flags = detector.assess("acme", 500);
        let kinds: Vec<AnomalyKind> = flags.iter().map(|f| f.kind).collect();
        assert!(kinds.contains(&AnomalyKind::CostSpike));
        assert!(kinds.contains(&AnomalyKind::CostRatio));

        assert!(detector.assess("acme", 12).is_empty());
    }

    #[test]
    fn constant_history_only_uses_ratio() {
        let detector = seeded(&[5, 5, 5, 5, 5]);
        assert!(detector.assess("acme", 6).is_empty());

        let flags = detector.assess("acme", 51);
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].kind, AnomalyKind::CostRatio);
    }

    #[test]
    fn history_is_bounded() {
        let detector = AnomalyDetector::new(AnomalyConfig {
            history: 5,
            ..Default::default()
        });
        for _ in 0..5 {
            detector.record("acme", 1_000);
        }
        for _ in 0..5 {
            detector.record("acme", 1);
        }
        // Old expensive samples have rolled out
        assert!(!detector.assess("acme", 100).is_empty());
    }

    #[test]
    fn disabled_detector_flags_nothing() {
        let detector = AnomalyDetector::new(AnomalyConfig {
            enabled: false,
            ..Default::default()
        });
        detector.record("acme", 1);
        assert!(detector.assess("acme", u64::MAX).is_empty());
    }
}
