use crate::models::{AlertEvent, Observation, TopicState};
use log::debug;
use std::collections::HashMap;
use std::str::Utf8Error;
use thiserror::Error;
use time::OffsetDateTime;

#[derive(Debug, Error)]
#[error("payload on topic '{topic}' is not valid UTF-8: {source}")]
pub struct MalformedPayload {
    pub topic: String,
    #[source]
    pub source: Utf8Error,
}

/// Last-value table for the watched topics.
///
/// Owned by the task that polls the MQTT event loop and lent to the message
/// handler, so updates never need a lock.
#[derive(Debug, Default)]
pub struct TopicTracker {
    topics: HashMap<String, TopicState>,
}

impl TopicTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `payload` for `topic` and report whether it changed.
    ///
    /// The first value on a topic only seeds the table. Malformed payloads
    /// leave the table untouched.
    pub fn observe(
        &mut self,
        topic: &str,
        payload: &[u8],
        at: OffsetDateTime,
    ) -> Result<Observation, MalformedPayload> {
        let value = std::str::from_utf8(payload).map_err(|source| MalformedPayload {
            topic: topic.to_string(),
            source,
        })?;

        match self.topics.get_mut(topic) {
            None => {
                debug!("Seeding topic '{}' with '{}'.", topic, value);
                self.topics.insert(
                    topic.to_string(),
                    TopicState {
                        topic: topic.to_string(),
                        value: value.to_string(),
                        updated_at: at,
                    },
                );
                Ok(Observation::Seeded)
            }
            Some(state) if state.value == value => {
                state.updated_at = at;
                Ok(Observation::Unchanged)
            }
            Some(state) => {
                let old_value = std::mem::replace(&mut state.value, value.to_string());
                state.updated_at = at;
                Ok(Observation::Changed(AlertEvent {
                    topic: topic.to_string(),
                    old_value,
                    new_value: value.to_string(),
                    timestamp: at,
                }))
            }
        }
    }

    pub fn get(&self, topic: &str) -> Option<&TopicState> {
        self.topics.get(topic)
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const TOPIC: &str = "summit/lab4/group0/completed";

    #[test]
    fn first_value_seeds_without_alert() {
        let mut tracker = TopicTracker::new();
        let at = datetime!(2024-03-01 08:00:00 UTC);

        let observation = tracker.observe(TOPIC, b"False", at).unwrap();

        assert_eq!(observation, Observation::Seeded);
        let state = tracker.get(TOPIC).unwrap();
        assert_eq!(state.value, "False");
        assert_eq!(state.updated_at, at);
    }

    #[test]
    fn repeated_value_does_not_alert_but_refreshes_timestamp() {
        let mut tracker = TopicTracker::new();
        tracker.observe(TOPIC, b"False", datetime!(2024-03-01 08:00:00 UTC)).unwrap();

        let later = datetime!(2024-03-01 08:05:00 UTC);
        let observation = tracker.observe(TOPIC, b"False", later).unwrap();

        assert_eq!(observation, Observation::Unchanged);
        assert_eq!(tracker.get(TOPIC).unwrap().updated_at, later);
    }

    #[test]
    fn changed_value_alerts_with_old_and_new() {
        let mut tracker = TopicTracker::new();
        tracker.observe(TOPIC, b"False", datetime!(2024-03-01 08:00:00 UTC)).unwrap();

        let at = datetime!(2024-03-01 09:15:00 UTC);
        let observation = tracker.observe(TOPIC, b"True", at).unwrap();

        assert_eq!(
            observation,
            Observation::Changed(AlertEvent {
                topic: TOPIC.to_string(),
                old_value: "False".to_string(),
                new_value: "True".to_string(),
                timestamp: at,
            })
        );
        assert_eq!(tracker.get(TOPIC).unwrap().value, "True");
    }

    #[test]
    fn alerts_fire_only_on_transitions() {
        let mut tracker = TopicTracker::new();
        let at = datetime!(2024-03-01 10:00:00 UTC);
        let sequence = ["a", "a", "b", "b", "b", "a", "c", "c"];

        let alerts: Vec<_> = sequence
            .iter()
            .filter_map(|value| match tracker.observe(TOPIC, value.as_bytes(), at).unwrap() {
                Observation::Changed(alert) => Some((alert.old_value, alert.new_value)),
                _ => None,
            })
            .collect();

        assert_eq!(
            alerts,
            vec![
                ("a".to_string(), "b".to_string()),
                ("b".to_string(), "a".to_string()),
                ("a".to_string(), "c".to_string()),
            ]
        );
    }

    #[test]
    fn topics_are_tracked_independently() {
        let mut tracker = TopicTracker::new();
        let at = datetime!(2024-03-01 10:00:00 UTC);
        let other = "summit/lab4/group1/completed";

        tracker.observe(TOPIC, b"False", at).unwrap();
        assert_eq!(tracker.observe(other, b"True", at).unwrap(), Observation::Seeded);
        assert_eq!(tracker.observe(TOPIC, b"False", at).unwrap(), Observation::Unchanged);
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn malformed_payload_is_rejected_and_state_kept() {
        let mut tracker = TopicTracker::new();
        let at = datetime!(2024-03-01 10:00:00 UTC);
        tracker.observe(TOPIC, b"False", at).unwrap();

        let err = tracker.observe(TOPIC, &[0xff, 0xfe, 0x00], at).unwrap_err();

        assert_eq!(err.topic, TOPIC);
        assert_eq!(tracker.get(TOPIC).unwrap().value, "False");
        assert_eq!(tracker.observe(TOPIC, b"False", at).unwrap(), Observation::Unchanged);
    }

    #[test]
    fn malformed_first_payload_does_not_seed() {
        let mut tracker = TopicTracker::new();
        let at = datetime!(2024-03-01 10:00:00 UTC);

        assert!(tracker.observe(TOPIC, &[0xc3, 0x28], at).is_err());
        assert_eq!(tracker.len(), 0);
        assert_eq!(tracker.observe(TOPIC, b"True", at).unwrap(), Observation::Seeded);
    }
}
