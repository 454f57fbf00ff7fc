use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};
use uuid::Uuid;

/// One run-level telemetry event (restart, convergence, evaluation
/// failure, checkpoint). Not authoritative state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub category: String,
    pub message: String,
    pub severity: String,
    pub context: serde_json::Value,
}

impl RunEvent {
    pub fn new(
        category: impl Into<String>,
        message: impl Into<String>,
        severity: impl Into<String>,
        context: Option<serde_json::Value>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().simple().to_string()[..16].to_string(),
            timestamp: Utc::now(),
            category: category.into(),
            message: message.into(),
            severity: severity.into(),
            context: context.unwrap_or(serde_json::json!({})),
        }
    }
}

/// Bounded in-memory event log.
pub struct EventLog {
    events: Arc<Mutex<VecDeque<RunEvent>>>,
    max_events: usize,
}

impl EventLog {
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::with_capacity(max_events))),
            max_events,
        }
    }

    pub fn record(
        &self,
        category: &str,
        message: &str,
        severity: &str,
        context: Option<serde_json::Value>,
    ) -> RunEvent {
        let event = RunEvent::new(category, message, severity, context);

        if let Ok(mut lock) = self.events.lock() {
            if lock.len() >= self.max_events {
                lock.pop_front();
            }
            lock.push_back(event.clone());
        }

        match severity {
            "warning" | "WARN" => warn!("Run Event [{}]: {}", category, message),
            "error" | "ERROR" => error!("Run Event [{}]: {}", category, message),
            _ => info!("Run Event [{}]: {}", category, message),
        }

        event
    }

    pub fn recent(&self, n: usize) -> Vec<RunEvent> {
        match self.events.lock() {
            Ok(lock) => lock.iter().rev().take(n).cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_is_bounded() {
        let log = EventLog::new(3);
        for i in 0..5 {
            log.record("test", &format!("event {}", i), "info", None);
        }
        assert_eq!(log.len(), 3);
        let recent = log.recent(3);
        assert_eq!(recent[0].message, "event 4");
        assert_eq!(recent[2].message, "event 2");
    }

    #[test]
    fn event_ids_are_unique() {
        let a = RunEvent::new("c", "m", "info", None);
        let b = RunEvent::new("c", "m", "info", None);
        assert_ne!(a.event_id, b.event_id);
        assert_eq!(a.event_id.len(), 16);
    }
}
