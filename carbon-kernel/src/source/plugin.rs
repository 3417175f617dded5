use super::{InstanceMap, Source, SourceError};
use crate::config::MqttConf;
use crate::models::Instance;
use crate::mqtt::create_mqtt_client;
use crate::state::{new_state, Shared};
use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, QoS};
use serde::Deserialize;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One instance or a batch, as published by a source plugin
#[derive(Deserialize)]
#[serde(untagged)]
enum Batch {
    One(Box<Instance>),
    Many(Vec<Instance>),
}

/// Samples pushed by source plugins on the metrics topic.
///
/// Payloads land in an inbox between ticks; each fetch hands out the inbox
/// and empties it. A later sample of the same instance replaces the earlier
/// one within a tick.
pub struct PluginSource {
    name: String,
    topic: String,
    inbox: Shared<InstanceMap>,
    client: Option<AsyncClient>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl PluginSource {
    /// Inbox only, filled through `ingest`
    pub fn new(name: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            topic: topic.into(),
            inbox: new_state(InstanceMap::new()),
            client: None,
            listener: Mutex::new(None),
        }
    }

    /// Subscribes to `conf.metrics_topic` and fills the inbox from the broker
    pub fn connect(name: impl Into<String>, conf: &MqttConf) -> Self {
        let mut source = Self::new(name, &conf.metrics_topic);
        let (client, eventloop) = create_mqtt_client(conf, &format!("carbon-kernel-{}", source.name));
        let listener = spawn_listener(
            eventloop,
            client.clone(),
            source.name.clone(),
            source.topic.clone(),
            source.inbox.clone(),
        );
        source.client = Some(client);
        source.listener = Mutex::new(Some(listener));
        source
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Samples waiting for the next fetch
    pub fn pending(&self) -> usize {
        self.inbox.lock().len()
    }

    pub fn ingest(&self, payload: &[u8]) -> Result<usize, SourceError> {
        ingest(&self.inbox, payload)
    }
}

fn ingest(inbox: &Shared<InstanceMap>, payload: &[u8]) -> Result<usize, SourceError> {
    let instances = match serde_json::from_slice(payload)? {
        Batch::One(instance) => vec![*instance],
        Batch::Many(instances) => instances,
    };
    let count = instances.len();
    let mut inbox = inbox.lock();
    for instance in instances {
        inbox.insert(instance.id.clone(), instance);
    }
    Ok(count)
}

fn spawn_listener(
    mut eventloop: EventLoop,
    client: AsyncClient,
    name: String,
    topic: String,
    inbox: Shared<InstanceMap>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    // clean session: subscribe again after every reconnect
                    match client.subscribe(&topic, QoS::AtLeastOnce).await {
                        Ok(()) => info!(source = %name, topic = %topic, "listening for plugin samples"),
                        Err(e) => warn!(source = %name, error = %e, "subscribe failed"),
                    }
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) if publish.topic == topic => {
                    match ingest(&inbox, &publish.payload) {
                        Ok(count) => debug!(source = %name, count, "plugin samples received"),
                        Err(e) => warn!(source = %name, error = %e, "invalid plugin payload"),
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(source = %name, error = %e, "mqtt connection error, retrying");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    })
}

#[async_trait]
impl Source for PluginSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, cancel: &CancellationToken) -> Result<InstanceMap, SourceError> {
        if cancel.is_cancelled() {
            return Err(SourceError::Cancelled);
        }
        Ok(std::mem::take(&mut *self.inbox.lock()))
    }

    async fn stop(&self, cancel: &CancellationToken) -> Result<(), SourceError> {
        let disconnected = match &self.client {
            Some(client) => tokio::select! {
                _ = cancel.cancelled() => Err(SourceError::Cancelled),
                res = client.disconnect() => res.map_err(|e| SourceError::Unavailable(e.to_string())),
            },
            None => Ok(()),
        };
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
        disconnected
    }
}
