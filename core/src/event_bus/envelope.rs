/// Envelope construction: publishers supply topic + data, the bus injects metadata.
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;

use crate::model::{Envelope, EventMetadata};

static SEQUENCE: AtomicU64 = AtomicU64::new(1);

pub fn build(topic: impl Into<String>, data: serde_json::Value, publisher_id: Option<String>) -> Envelope {
    Envelope {
        topic: topic.into(),
        data,
        metadata: EventMetadata {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            publisher_id,
            sequence_number: SEQUENCE.fetch_add(1, Ordering::Relaxed),
        },
    }
}
