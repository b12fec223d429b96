// =============================================================================
// Events — structured records emitted by the engine task
// =============================================================================
//
// A stable, serializable schema so the GUI task (or any other reader of the
// published snapshot) can render a timeline without re-deriving meaning from
// log lines. The engine task is the only writer; everything else only reads
// the bounded ring buffer in `AppState`.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    DecisionMade,
    OrderSubmitted,
    OrderRejected,
    PositionClosed,
    RecoveryExecuted,
    WeightAdjusted,
    SlowCycle,
    StaleSnapshot,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::DecisionMade => "DecisionMade",
            Self::OrderSubmitted => "OrderSubmitted",
            Self::OrderRejected => "OrderRejected",
            Self::PositionClosed => "PositionClosed",
            Self::RecoveryExecuted => "RecoveryExecuted",
            Self::WeightAdjusted => "WeightAdjusted",
            Self::SlowCycle => "SlowCycle",
            Self::StaleSnapshot => "StaleSnapshot",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub severity: Severity,
    pub payload: String,
}

impl Event {
    pub fn new(kind: EventKind, severity: Severity, payload: impl Into<String>) -> Self {
        Self { timestamp: Utc::now(), kind, severity, payload: payload.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_carries_the_kind_and_severity_it_was_built_with() {
        let ev = Event::new(EventKind::OrderSubmitted, Severity::Info, "ticket=1");
        assert_eq!(ev.kind, EventKind::OrderSubmitted);
        assert_eq!(ev.severity, Severity::Info);
        assert_eq!(ev.payload, "ticket=1");
    }

    #[test]
    fn severities_order_info_below_critical() {
        assert!(Severity::Info < Severity::Warning);
        assert!(Severity::Warning < Severity::Critical);
    }
}
