use super::{ExportError, Exporter};
use crate::models::Instance;
use async_trait::async_trait;
use rumqttc::{AsyncClient, QoS};
use tracing::warn;

/// JSON snapshot of every calculated instance on the emissions topic.
/// Out-of-process exporter plugins subscribe there.
pub struct MqttExporter {
    client: AsyncClient,
    topic: String,
}

impl MqttExporter {
    pub fn new(client: AsyncClient, topic: impl Into<String>) -> Self {
        Self { client, topic: topic.into() }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait]
impl Exporter for MqttExporter {
    fn name(&self) -> &str {
        "mqtt"
    }

    async fn send(&self, instance: &Instance) -> Result<(), ExportError> {
        let payload = serde_json::to_vec(instance)?;
        self.client
            .publish(&self.topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| ExportError::Transport(e.to_string()))
    }

    async fn stop(&self) {
        if let Err(e) = self.client.disconnect().await {
            warn!(topic = %self.topic, error = %e, "mqtt disconnect failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MqttConf;
    use crate::models::Provider;
    use crate::mqtt::create_mqtt_client;

    #[tokio::test]
    async fn test_publish_is_queued_until_event_loop_goes_away() {
        let (client, eventloop) = create_mqtt_client(&MqttConf::default(), "carbon-test");
        let exporter = MqttExporter::new(client, "carbon/emissions@v1");
        let i = Instance::new("vm-1", Provider::Gcp, "europe-west4", "e2-medium");

        // no broker needed, the request sits in the client queue
        exporter.send(&i).await.unwrap();

        drop(eventloop);
        assert!(matches!(exporter.send(&i).await, Err(ExportError::Transport(_))));
    }

    #[tokio::test]
    async fn test_stop_without_event_loop_returns() {
        let (client, eventloop) = create_mqtt_client(&MqttConf::default(), "carbon-test");
        let exporter = MqttExporter::new(client, "carbon/emissions@v1");
        drop(eventloop);

        // disconnect fails, stop logs it and returns
        tokio::time::timeout(std::time::Duration::from_secs(1), exporter.stop()).await.unwrap();
        assert!(exporter.client.disconnect().await.is_err());
    }
}
