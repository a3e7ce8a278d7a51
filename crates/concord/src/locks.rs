//! Per-room mutual exclusion.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use concord_core::RoomId;

type LockMap = HashMap<RoomId, Arc<AsyncMutex<()>>>;

/// One async lock per room.
///
/// Work on different rooms never contends. A room's entry is dropped when
/// its last guard is released with nobody waiting.
#[derive(Default)]
pub struct RoomLocks {
    locks: Mutex<LockMap>,
}

impl RoomLocks {
    pub fn new() -> Self {
        Self::default()
    }

    // Entries are never left half-written, so a poisoned map is usable.
    fn map(&self) -> MutexGuard<'_, LockMap> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for exclusive access to a room.
    pub async fn lock(&self, room_id: &RoomId) -> RoomGuard<'_> {
        let lock = Arc::clone(self.map().entry(room_id.clone()).or_default());
        RoomGuard {
            locks: self,
            room_id: room_id.clone(),
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Number of rooms currently locked or waited on.
    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exclusive access to one room, released on drop.
pub struct RoomGuard<'a> {
    locks: &'a RoomLocks,
    room_id: RoomId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for RoomGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Waiters clone the Arc under the map lock, so a count of one here
        // means only the map still refers to it.
        let mut locks = self.locks.map();
        if locks.get(&self.room_id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(&self.room_id);
        }
    }
}
