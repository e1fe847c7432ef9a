use sha2::{Digest, Sha256};

use crate::models::EventRecord;

/// Stable, order-independent signature of a pipeline run's inputs, for an
/// external caching layer to key on. Events are hashed in id order, so any
/// permutation of the same events and parameters produces the same hex
/// digest, and any change to either changes it.
pub fn input_signature(events: &[EventRecord], params: &serde_json::Value) -> String {
    let mut lines: Vec<String> = events
        .iter()
        .map(|event| {
            let attrs =
                serde_json::to_string(&event.attributes).expect("attributes serialize");
            format!("{}|{}|{}|{}", event.id, event.entity, event.occurred_at, attrs)
        })
        .collect();
    lines.sort();

    let mut hasher = Sha256::new();
    for line in &lines {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    // serde_json maps are sorted by key, so this is canonical.
    hasher.update(params.to_string().as_bytes());
    hex::encode(hasher.finalize())
}
