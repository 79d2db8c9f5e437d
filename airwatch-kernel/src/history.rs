//! Bounded history of the tracked series (time, temperature, humidity, AQI).
//!
//! The four series are parallel: every push appends to all of them and every
//! eviction removes the oldest entry of all of them, so they always have the
//! same length.

use crate::models::SensorValues;
use serde::Serialize;
use std::collections::VecDeque;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub const DEFAULT_CAPACITY: usize = 100;

#[derive(Debug, Clone)]
pub struct HistoryWindow {
    capacity: usize,
    time: VecDeque<OffsetDateTime>,
    temperature: VecDeque<f64>,
    humidity: VecDeque<f64>,
    aqi: VecDeque<i64>,
}

/// Read-only copy handed to the rendering side.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct HistorySnapshot {
    pub capacity: usize,
    pub time: Vec<String>,
    pub temperature: Vec<f64>,
    pub humidity: Vec<f64>,
    pub aqi: Vec<i64>,
}

impl HistoryWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            time: VecDeque::with_capacity(capacity),
            temperature: VecDeque::with_capacity(capacity),
            humidity: VecDeque::with_capacity(capacity),
            aqi: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, at: OffsetDateTime, values: SensorValues) {
        if self.time.len() == self.capacity {
            self.time.pop_front();
            self.temperature.pop_front();
            self.humidity.pop_front();
            self.aqi.pop_front();
        }
        self.time.push_back(at);
        self.temperature.push_back(values.temperature);
        self.humidity.push_back(values.humidity);
        self.aqi.push_back(values.aqi);
    }

    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Copies the newest `limit` entries (all of them when `None`), oldest first.
    pub fn snapshot(&self, limit: Option<usize>) -> HistorySnapshot {
        let skip = limit.map_or(0, |n| self.len().saturating_sub(n));
        HistorySnapshot {
            capacity: self.capacity,
            time: self
                .time
                .iter()
                .skip(skip)
                .map(|t| t.format(&Rfc3339).unwrap_or_default())
                .collect(),
            temperature: self.temperature.iter().skip(skip).copied().collect(),
            humidity: self.humidity.iter().skip(skip).copied().collect(),
            aqi: self.aqi.iter().skip(skip).copied().collect(),
        }
    }

    #[cfg(test)]
    pub(crate) fn series_lengths(&self) -> [usize; 4] {
        [self.time.len(), self.temperature.len(), self.humidity.len(), self.aqi.len()]
    }
}

impl HistorySnapshot {
    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    /// Newest `n` entries of an existing copy.
    pub fn tail(&self, n: usize) -> HistorySnapshot {
        let skip = self.len().saturating_sub(n);
        HistorySnapshot {
            capacity: self.capacity,
            time: self.time[skip..].to_vec(),
            temperature: self.temperature[skip..].to_vec(),
            humidity: self.humidity[skip..].to_vec(),
            aqi: self.aqi[skip..].to_vec(),
        }
    }
}

impl Default for HistoryWindow {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
