//! Durable session cache: identity, room, and join code survive page
//! reloads through whatever storage the embedder provides.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;

/// Keys the session client persists under.
pub mod key {
    pub const USER_ID: &str = "userId";
    pub const ROOM_ID: &str = "roomId";
    pub const JOIN_CODE: &str = "joinCode";
}

/// Abstraction over a keyed cache with optional expiry.
///
/// Backed by profile storage in an embedding application and an in-memory
/// map in tests. Failures are the implementation's concern; a cache that
/// cannot persist behaves as if the entry were absent.
#[async_trait]
pub trait SessionCache: Send + Sync {
    /// Load an entry, if present and not expired.
    async fn load(&self, key: &str) -> Option<Value>;

    /// Store an entry, expiring it after `expiration_mins` when given.
    async fn save(&self, key: &str, data: Value, expiration_mins: Option<u64>);

    /// Drop an entry.
    async fn remove(&self, key: &str);
}

// ---------------------------------------------------------------------------
// In-memory implementation (for tests and short-lived embedders)
// ---------------------------------------------------------------------------

struct Slot {
    data: Value,
    expires_at: Option<Instant>,
}

#[derive(Default)]
pub struct MemoryCache {
    slots: Mutex<HashMap<String, Slot>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionCache for MemoryCache {
    async fn load(&self, key: &str) -> Option<Value> {
        let mut slots = self.slots.lock();
        let expired = slots
            .get(key)
            .and_then(|slot| slot.expires_at)
            .is_some_and(|at| at <= Instant::now());
        if expired {
            slots.remove(key);
            return None;
        }
        slots.get(key).map(|slot| slot.data.clone())
    }

    async fn save(&self, key: &str, data: Value, expiration_mins: Option<u64>) {
        let expires_at =
            expiration_mins.map(|mins| Instant::now() + Duration::from_secs(mins * 60));
        self.slots
            .lock()
            .insert(key.to_string(), Slot { data, expires_at });
    }

    async fn remove(&self, key: &str) {
        self.slots.lock().remove(key);
    }
}
