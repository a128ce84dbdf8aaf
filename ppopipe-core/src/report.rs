use crate::stats::AvgTracker;
use std::collections::BTreeMap;
use std::fmt;

/// Named scalar metrics for one training iteration.
#[derive(Debug, Clone, Default)]
pub struct Report {
    values: BTreeMap<String, f64>,
    averages: BTreeMap<String, AvgTracker>,
}

impl Report {
    pub fn set(&mut self, key: impl Into<String>, value: f64) {
        let key = key.into();
        self.averages.remove(&key);
        self.values.insert(key, value);
    }

    /// Folds `value` into a running average stored under `key`.
    pub fn add_avg(&mut self, key: impl Into<String>, value: f64) {
        let key = key.into();
        let avg = self.averages.entry(key.clone()).or_default();
        avg.add(value);
        match avg.get() {
            Some(mean) => {
                self.values.insert(key, mean);
            }
            None => {
                self.values.remove(&key);
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.values.get(key).copied()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(key, value)| (key.as_str(), *value))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in &self.values {
            writeln!(f, "{key}: {value:.6}")?;
        }
        Ok(())
    }
}
