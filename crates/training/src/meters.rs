//! Running statistics for scalar training metrics.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

pub const DEFAULT_WINDOW: usize = 20;

/// Tracks a series of values: smoothed over a window, and averaged over the whole run.
#[derive(Debug, Clone)]
pub struct SmoothedValue {
    window: VecDeque<f64>,
    window_size: usize,
    total: f64,
    count: usize,
}

impl Default for SmoothedValue {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl SmoothedValue {
    pub fn new(window_size: usize) -> Self {
        let window_size = window_size.max(1);
        Self {
            window: VecDeque::with_capacity(window_size),
            window_size,
            total: 0.0,
            count: 0,
        }
    }

    pub fn update(&mut self, value: f64) {
        if self.window.len() == self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(value);
        self.total += value;
        self.count += 1;
    }

    /// Lower median of the window.
    pub fn median(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.window.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        sorted[(sorted.len() - 1) / 2]
    }

    pub fn avg(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.window.iter().sum::<f64>() / self.window.len() as f64
    }

    pub fn global_avg(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.total / self.count as f64
    }

    pub fn value(&self) -> Option<f64> {
        self.window.back().copied()
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

/// Named meters rendered as `name: median (global_avg)`.
#[derive(Debug, Clone)]
pub struct MetricLogger {
    meters: BTreeMap<String, SmoothedValue>,
    delimiter: String,
    window_size: usize,
}

impl Default for MetricLogger {
    fn default() -> Self {
        Self::new("  ")
    }
}

impl MetricLogger {
    pub fn new(delimiter: impl Into<String>) -> Self {
        Self {
            meters: BTreeMap::new(),
            delimiter: delimiter.into(),
            window_size: DEFAULT_WINDOW,
        }
    }

    pub fn delimiter(&self) -> &str {
        &self.delimiter
    }

    pub fn update(&mut self, name: &str, value: f64) {
        let window_size = self.window_size;
        self.meters
            .entry(name.to_string())
            .or_insert_with(|| SmoothedValue::new(window_size))
            .update(value);
    }

    pub fn update_values<'a, I>(&mut self, values: I)
    where
        I: IntoIterator<Item = (&'a String, &'a f32)>,
    {
        for (name, value) in values {
            self.update(name, f64::from(*value));
        }
    }

    pub fn get(&self, name: &str) -> Option<&SmoothedValue> {
        self.meters.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.meters.keys().map(String::as_str)
    }
}

impl fmt::Display for MetricLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .meters
            .iter()
            .map(|(name, meter)| format!("{name}: {:.4} ({:.4})", meter.median(), meter.global_avg()))
            .collect();
        f.write_str(&parts.join(&self.delimiter))
    }
}
