//! Per-app pipeline locks

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

/// At most one holder per app; different apps never contend
#[derive(Default)]
pub struct AppLocks {
    inflight: Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
}

impl AppLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, app_id: Uuid) -> Arc<AsyncMutex<()>> {
        let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(inflight.entry(app_id).or_default())
    }

    /// Wait for the app's lock
    pub async fn acquire(&self, app_id: Uuid) -> OwnedMutexGuard<()> {
        self.lock_for(app_id).lock_owned().await
    }

    /// Take the app's lock only if nobody holds it
    pub fn try_acquire(&self, app_id: Uuid) -> Option<OwnedMutexGuard<()>> {
        self.lock_for(app_id).try_lock_owned().ok()
    }

    /// Forget a deleted app's lock
    pub fn remove(&self, app_id: Uuid) {
        self.inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&app_id);
    }
}
