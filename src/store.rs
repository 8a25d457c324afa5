use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

pub type RefreshCallback = Arc<dyn Fn() + Send + Sync>;

/// Persistence layer for operator edits.
pub trait ChargingStore: Send + Sync {
    /// Set the price of the session that started at `start_at`.
    /// Returns `Ok(false)` when no such session exists.
    fn update_price_by_start_time(&self, start_at: DateTime<Utc>, price: Option<f64>)
    -> Result<bool>;

    /// Register a callback fired whenever the store has new data.
    fn register_refresh_callback(&self, callback: RefreshCallback);
}

/// Callback list shared by store implementations.
#[derive(Default)]
pub struct RefreshCallbacks {
    callbacks: Mutex<Vec<RefreshCallback>>,
}

impl RefreshCallbacks {
    pub fn register(&self, callback: RefreshCallback) {
        self.callbacks.lock().push(callback);
    }

    /// Fire every callback. The list is cloned first so a callback may
    /// register further callbacks without deadlocking.
    pub fn notify_all(&self) -> usize {
        let callbacks: Vec<RefreshCallback> = self.callbacks.lock().clone();
        for callback in &callbacks {
            callback();
        }
        callbacks.len()
    }
}

impl std::fmt::Debug for RefreshCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshCallbacks")
            .field("registered", &self.callbacks.lock().len())
            .finish()
    }
}
