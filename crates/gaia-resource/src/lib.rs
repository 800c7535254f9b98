//! ResourceProbe (C2): samples CPU and GPU utilization and memory, and
//! turns a stream of samples into a debounced "sustained high
//! utilization" flag consumed by the sleep manager's DISTRACTED
//! transition.
//!
//! The hysteresis is symmetric: a window of `W` consecutive samples all
//! at or above `T` sets the flag; a window of `W` consecutive samples all
//! below `T` clears it. A single sample on the wrong side of `T` mid-window
//! changes nothing — this is what keeps intermittent training bursts from
//! flapping the flag.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResourceSample {
    pub gpu_util_pct: f32,
    pub cpu_util_pct: f32,
    pub gpu_mem_used_mb: u64,
    pub sampled_at: DateTime<Utc>,
}

/// Source of utilization samples, polled roughly every 5s by the owning
/// service. Implementations wrap whatever GPU/CPU telemetry is locally
/// available; this crate provides only a scripted double.
#[async_trait]
pub trait ResourceSampler: Send + Sync {
    async fn sample(&self) -> ResourceSample;
}

#[derive(Debug, Clone, Copy)]
pub struct DistractionConfig {
    pub threshold_pct: f32,
    pub window_samples: usize,
}

impl Default for DistractionConfig {
    fn default() -> Self {
        Self { threshold_pct: 25.0, window_samples: 1 }
    }
}

/// Tracks a fixed-capacity window of over/under-threshold observations
/// and derives the debounced distracted flag from it.
pub struct DistractionDetector {
    config: DistractionConfig,
    window: Mutex<VecDeque<bool>>,
    distracted: Mutex<bool>,
}

impl DistractionDetector {
    pub fn new(config: DistractionConfig) -> Self {
        Self {
            config,
            window: Mutex::new(VecDeque::with_capacity(config.window_samples.max(1))),
            distracted: Mutex::new(false),
        }
    }

    /// Treats the higher of CPU/GPU utilization as the signal; either
    /// resource alone sustaining load should mark the service distracted.
    fn over_threshold(&self, sample: &ResourceSample) -> bool {
        sample.gpu_util_pct.max(sample.cpu_util_pct) >= self.config.threshold_pct
    }

    /// Folds one new sample into the window and returns the (possibly
    /// unchanged) distracted flag.
    pub fn observe(&self, sample: &ResourceSample) -> bool {
        let over = self.over_threshold(sample);
        let mut window = self.window.lock();
        if window.len() == self.config.window_samples.max(1) {
            window.pop_front();
        }
        window.push_back(over);

        if window.len() < self.config.window_samples.max(1) {
            return *self.distracted.lock();
        }

        let mut distracted = self.distracted.lock();
        if window.iter().all(|&o| o) {
            *distracted = true;
        } else if window.iter().all(|&o| !o) {
            *distracted = false;
        }
        *distracted
    }

    /// Treats probe unavailability as "not distracted" (fail-open), per
    /// the failure semantics of the sleep manager.
    pub fn observe_unavailable(&self) -> bool {
        *self.distracted.lock() = false;
        false
    }

    pub fn is_distracted(&self) -> bool {
        *self.distracted.lock()
    }
}
