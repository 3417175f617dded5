/**
 * SOURCES - Anything that yields periodic utilization samples
 *
 * The scheduler only knows this trait: a cloud poller, a local agent, a
 * fixture file or a source plugin all look the same.
 *
 * CANCELLATION :
 * `fetch` and `stop` get a token the caller cancels once its deadline has
 * passed. Work a source hands off to other tasks must watch it; work done
 * inside the future itself is also dropped by the caller's timeout.
 */

mod fixture;
mod host;
mod plugin;

pub use fixture::FixtureSource;
pub use host::HostSource;
pub use plugin::PluginSource;

use crate::models::Instance;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid fixture {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("source unavailable: {0}")]
    Unavailable(String),
    #[error("invalid payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("cancelled by the caller")]
    Cancelled,
}

/// Instances of one fetch keyed by instance id
pub type InstanceMap = BTreeMap<String, Instance>;

#[async_trait]
pub trait Source: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn fetch(&self, cancel: &CancellationToken) -> Result<InstanceMap, SourceError>;

    /// Teardown on shutdown, after the last fetch returned
    async fn stop(&self, _cancel: &CancellationToken) -> Result<(), SourceError> {
        Ok(())
    }
}
