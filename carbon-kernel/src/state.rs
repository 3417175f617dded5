use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// Read-mostly value replaced wholesale (config snapshots, datasets).
/// Readers clone the inner `Arc` and never hold the lock while working.
#[derive(Debug)]
pub struct Snapshot<T> {
    inner: Arc<RwLock<Arc<T>>>,
}

impl<T> Clone for Snapshot<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> Snapshot<T> {
    pub fn new(value: T) -> Self {
        Self { inner: Arc::new(RwLock::new(Arc::new(value))) }
    }

    pub fn load(&self) -> Arc<T> {
        self.inner.read().clone()
    }

    /// Swap in a new value, returning the previous one
    pub fn swap(&self, value: T) -> Arc<T> {
        std::mem::replace(&mut *self.inner.write(), Arc::new(value))
    }
}
