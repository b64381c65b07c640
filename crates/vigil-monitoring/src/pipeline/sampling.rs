//! Retention sampling.
//!
//! Decides whether a captured occurrence is kept. The rate is configured, and
//! optionally scaled down under resource pressure reported by a
//! [`PressureSource`] (the resource manager). Categories on the bypass list
//! are always retained.

use rand::Rng;
use std::sync::Arc;
use tracing::debug;

/// Reports resource pressure as a fraction of capacity.
///
/// Values are expected in `[0, 1]`; a negative value means "no opinion" and
/// leaves the configured rate untouched.
pub trait PressureSource: Send + Sync {
    fn pressure(&self) -> f64;
}

/// Sampling configuration.
#[derive(Debug, Clone)]
pub struct SamplingConfig {
    /// Probability a capture is retained, clamped to `[0, 1]`. Default 1.0.
    pub base_rate: f64,
    /// Floor the adaptive scaling never goes below. Default 0.1.
    pub min_rate: f64,
    /// Whether pressure scales the rate down. Default true.
    pub adaptive: bool,
    /// Feature categories that bypass sampling entirely.
    pub always_retain: Vec<String>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            base_rate: 1.0,
            min_rate: 0.1,
            adaptive: true,
            always_retain: vec!["error".to_string(), "security".to_string()],
        }
    }
}

impl SamplingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_rate(mut self, rate: f64) -> Self {
        self.base_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_min_rate(mut self, rate: f64) -> Self {
        self.min_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_adaptive(mut self, adaptive: bool) -> Self {
        self.adaptive = adaptive;
        self
    }

    pub fn with_always_retain(mut self, feature: impl Into<String>) -> Self {
        self.always_retain.push(feature.into());
        self
    }
}

/// Decides whether a captured occurrence is retained.
pub struct SamplingManager {
    config: SamplingConfig,
    pressure: Option<Arc<dyn PressureSource>>,
}

impl SamplingManager {
    pub fn new(config: SamplingConfig) -> Self {
        Self {
            config,
            pressure: None,
        }
    }

    /// Attach the load-adaptive pressure source.
    pub fn with_pressure_source(mut self, source: Arc<dyn PressureSource>) -> Self {
        self.pressure = Some(source);
        self
    }

    /// The rate currently in force: the configured base rate, halved under
    /// high pressure (≥ 0.7) and floored at `min_rate` under severe pressure
    /// (≥ 0.9).
    pub fn effective_rate(&self) -> f64 {
        let base = self.config.base_rate;
        if !self.config.adaptive {
            return base;
        }
        let pressure = self.pressure.as_ref().map(|p| p.pressure()).unwrap_or(-1.0);
        if pressure < 0.0 {
            return base;
        }
        if pressure >= 0.9 {
            self.config.min_rate.min(base)
        } else if pressure >= 0.7 {
            (base / 2.0).max(self.config.min_rate.min(base))
        } else {
            base
        }
    }

    /// Whether a capture in `feature` should be retained.
    pub fn should_retain(&self, feature: &str) -> bool {
        if self.config.always_retain.iter().any(|f| f == feature) {
            return true;
        }
        let rate = self.effective_rate();
        if rate >= 1.0 {
            return true;
        }
        if rate <= 0.0 {
            debug!(feature, "sampling rate is zero, dropping capture");
            return false;
        }
        rand::thread_rng().r#gen::<f64>() < rate
    }
}
