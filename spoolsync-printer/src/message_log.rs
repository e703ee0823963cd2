//! Bounded diagnostic log of the MQTT traffic of one printer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub topic: String,
    pub direction: Direction,
    pub payload: Value,
}

/// Ring buffer; disabled by default, oldest entries fall off first.
#[derive(Debug)]
pub struct MessageLog {
    enabled: bool,
    capacity: usize,
    entries: VecDeque<LogEntry>,
}

impl MessageLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            enabled: false,
            capacity: capacity.max(1),
            entries: VecDeque::new(),
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn record(&mut self, topic: &str, direction: Direction, payload: &Value) {
        if !self.enabled {
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(LogEntry {
            timestamp: Utc::now(),
            topic: topic.to_string(),
            direction,
            payload: payload.clone(),
        });
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn disabled_log_records_nothing() {
        let mut log = MessageLog::new(10);
        log.record("t", Direction::Inbound, &json!({}));
        assert!(log.is_empty());
    }

    #[test]
    fn oldest_entries_are_evicted() {
        let mut log = MessageLog::new(3);
        log.set_enabled(true);
        for i in 0..5 {
            log.record("device/S/report", Direction::Inbound, &json!({ "n": i }));
        }
        let entries = log.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].payload["n"], 2);
        assert_eq!(entries[2].payload["n"], 4);

        log.clear();
        assert_eq!(log.len(), 0);
    }
}
