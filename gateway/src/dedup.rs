use std::time::Duration;

use metrics::counter;
use moka::sync::Cache;

use crate::event::{caller_message_id, EventRecord};

/// Remembers the message ids callers sent, per write key.
///
/// An id is claimed atomically before its record is dispatched, so concurrent requests
/// carrying the same id cannot both get through. Claims are released when the job store
/// rejects the job, letting the caller retry.
#[derive(Clone)]
pub struct Deduplicator {
    seen: Cache<String, ()>,
}

impl std::fmt::Debug for Deduplicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deduplicator")
            .field("seen", &"<moka cache>")
            .finish()
    }
}

/// Ids claimed by one request.
#[derive(Debug, Default)]
pub struct Reservation {
    keys: Vec<String>,
}

impl Reservation {
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl Deduplicator {
    pub fn new(max_entries: u64, window: Duration) -> Self {
        let seen = Cache::builder()
            .time_to_live(window)
            .max_capacity(max_entries)
            .build();
        Self { seen }
    }

    fn make_key(write_key: &str, message_id: &str) -> String {
        format!("{write_key}:{message_id}")
    }

    /// Keeps the records whose caller-supplied id is claimed by this call. Records that
    /// were sent without an id are kept and never remembered. Ids already claimed, by an
    /// earlier request or earlier in this batch, drop their record.
    pub fn reserve(&self, write_key: &str, records: &mut Vec<EventRecord>) -> Reservation {
        let before = records.len();
        let mut keys = Vec::new();

        records.retain(|record| {
            let Some(id) = caller_message_id(record) else {
                return true;
            };
            let key = Self::make_key(write_key, &id);
            let claimed = self.seen.entry(key.clone()).or_insert(()).is_fresh();
            if claimed {
                keys.push(key);
            }
            claimed
        });

        let dropped = before - records.len();
        if dropped > 0 {
            counter!("gateway_dedup_dropped_events_total").increment(dropped as u64);
        }
        Reservation { keys }
    }

    /// Forgets the ids of a request whose job was not stored.
    pub fn release(&self, reservation: Reservation) {
        for key in reservation.keys {
            self.seen.invalidate(&key);
        }
    }
}
