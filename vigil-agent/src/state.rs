//! Shared mutable registries
//!
//! The session registry and the bridge's pending-request table are both
//! keyed maps touched from several tasks; neither lock is held across an await.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

pub type Shared<T> = Arc<Mutex<T>>;

/// Keyed registry shared between tasks
pub type SharedMap<K, V> = Shared<HashMap<K, V>>;

pub fn new_registry<K, V>() -> SharedMap<K, V> {
    Arc::new(Mutex::new(HashMap::new()))
}
