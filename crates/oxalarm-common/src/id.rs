//! Snowflake ids for alarm events.
//!
//! Every emitted [`crate::types::AlarmEvent`] gets an id from here so the
//! notification layer can deduplicate at-least-once deliveries.

use snowflake::SnowflakeIdBucket;
use std::sync::Mutex;

static EVENT_IDS: Mutex<Option<SnowflakeIdBucket>> = Mutex::new(None);

/// Configure the generator for this process.
///
/// `machine_id` and `node_id` must each be in `0..=31`. Calling this again
/// replaces the generator; ids already handed out stay valid.
pub fn init(machine_id: i32, node_id: i32) {
    let mut slot = EVENT_IDS.lock().unwrap_or_else(|e| e.into_inner());
    *slot = Some(SnowflakeIdBucket::new(machine_id, node_id));
}

/// Next event id. Falls back to machine 1 / node 1 when [`init`] was never called.
pub fn next_event_id() -> String {
    let mut slot = EVENT_IDS.lock().unwrap_or_else(|e| e.into_inner());
    slot.get_or_insert_with(|| SnowflakeIdBucket::new(1, 1))
        .get_id()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn event_ids_do_not_repeat_across_threads() {
        init(3, 7);
        let handles: Vec<_> = (0..4)
            .map(|_| std::thread::spawn(|| (0..250).map(|_| next_event_id()).collect::<Vec<_>>()))
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate event id");
            }
        }
        assert_eq!(seen.len(), 1000);
    }

    #[test]
    fn event_id_parses_as_i64() {
        let id = next_event_id();
        assert!(id.parse::<i64>().is_ok(), "not an i64: {id}");
    }
}
