/*!
Scripted sources

`ScriptedSource` plays back a queue of fetch results, then keeps returning
the last successful snapshot, the way a real provider keeps listing the same
machines between changes.
*/

use async_trait::async_trait;
use carbon_kernel::models::Instance;
use carbon_kernel::source::{InstanceMap, Source, SourceError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

enum Step {
    Snapshot(InstanceMap),
    Fail(String),
}

pub struct ScriptedSource {
    name: String,
    steps: Mutex<VecDeque<Step>>,
    last: Mutex<InstanceMap>,
    delay: Duration,
    fetches: AtomicUsize,
    stopped: AtomicBool,
}

impl ScriptedSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Mutex::new(VecDeque::new()),
            last: Mutex::new(InstanceMap::new()),
            delay: Duration::ZERO,
            fetches: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
        }
    }

    /// Every fetch takes at least `delay`
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn then_return(self, instances: impl IntoIterator<Item = Instance>) -> Self {
        let map = instances.into_iter().map(|i| (i.id.clone(), i)).collect();
        self.steps.lock().push_back(Step::Snapshot(map));
        self
    }

    pub fn then_fail(self, reason: impl Into<String>) -> Self {
        self.steps.lock().push_back(Step::Fail(reason.into()));
        self
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Source for ScriptedSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, cancel: &CancellationToken) -> Result<InstanceMap, SourceError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(SourceError::Cancelled),
                _ = tokio::time::sleep(self.delay) => {}
            }
        }
        let step = self.steps.lock().pop_front();
        match step {
            Some(Step::Snapshot(map)) => {
                *self.last.lock() = map.clone();
                Ok(map)
            }
            Some(Step::Fail(reason)) => Err(SourceError::Unavailable(reason)),
            None => Ok(self.last.lock().clone()),
        }
    }

    async fn stop(&self, _cancel: &CancellationToken) -> Result<(), SourceError> {
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }
}
