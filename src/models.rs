use serde::Serialize;
use time::OffsetDateTime;

/// Last value seen on a watched topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicState {
    pub topic: String,
    pub value: String,
    pub updated_at: OffsetDateTime,
}

/// A watched topic changed its value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AlertEvent {
    pub topic: String,
    pub old_value: String,
    pub new_value: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// Outcome of feeding one inbound message to the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// First value on the topic; stored without alerting.
    Seeded,
    Unchanged,
    Changed(AlertEvent),
}
