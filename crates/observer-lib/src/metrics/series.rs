//! Bounded per-series sample window

use crate::models::Sample;
use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;

/// Samples of one (name, labels) key within a retention window
#[derive(Debug, Clone)]
pub struct MetricSeries {
    samples: VecDeque<Sample>,
    window: Duration,
    max_samples: usize,
}

impl MetricSeries {
    pub fn new(window: Duration, max_samples: usize) -> Self {
        Self {
            samples: VecDeque::new(),
            window,
            max_samples: max_samples.max(1),
        }
    }

    /// Append a sample, evicting those that fell out of the window.
    /// Samples older than the newest one are rejected to keep the series ordered.
    pub fn push(&mut self, sample: Sample) -> bool {
        if let Some(last) = self.samples.back() {
            if sample.timestamp < last.timestamp {
                return false;
            }
        }

        let cutoff = sample.timestamp - self.window;
        self.samples.push_back(sample);

        while let Some(front) = self.samples.front() {
            if front.timestamp < cutoff || self.samples.len() > self.max_samples {
                self.samples.pop_front();
            } else {
                break;
            }
        }

        true
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn latest_timestamp(&self) -> Option<DateTime<Utc>> {
        self.samples.back().map(|s| s.timestamp)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sample> {
        self.samples.iter()
    }
}
