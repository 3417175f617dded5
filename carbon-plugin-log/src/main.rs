/**
 * CARBON PLUGIN LOG - Minimal out-of-process exporter
 *
 * ROLE :
 * Subscribes to the emissions topic and logs one line per calculated
 * instance. Started and supervised by the kernel's plugin manager.
 *
 * ENVIRONMENT (set by the kernel) :
 * - CARBON_MQTT_HOST / CARBON_MQTT_PORT   broker, default localhost:1883
 * - CARBON_EMISSIONS_TOPIC                default carbon/emissions@v1
 * - CARBON_PLUGIN_NAME / CARBON_PLUGIN_INSTANCE_ID
 */

use carbon_kernel::models::Instance;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, PartialEq)]
struct PluginEnv {
    host: String,
    port: u16,
    topic: String,
    name: String,
    instance_id: String,
}

impl PluginEnv {
    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            host: get("CARBON_MQTT_HOST").unwrap_or_else(|| "localhost".into()),
            port: get("CARBON_MQTT_PORT").and_then(|p| p.parse().ok()).unwrap_or(1883),
            topic: get("CARBON_EMISSIONS_TOPIC").unwrap_or_else(|| "carbon/emissions@v1".into()),
            name: get("CARBON_PLUGIN_NAME").unwrap_or_else(|| "carbon-plugin-log".into()),
            instance_id: get("CARBON_PLUGIN_INSTANCE_ID").unwrap_or_else(|| "standalone".into()),
        }
    }

    fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn client_id(&self) -> String {
        format!("{}-{}", self.name, self.instance_id)
    }
}

fn handle_payload(payload: &[u8]) -> Result<Instance, serde_json::Error> {
    let instance: Instance = serde_json::from_slice(payload)?;
    info!(
        instance = %instance.correlation_key(),
        kind = %instance.kind,
        status = instance.status.as_str(),
        operational_kg = instance.operational_emissions().value(),
        embodied_kg = instance.embodied_emissions.value(),
        "emissions"
    );
    Ok(instance)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let env = PluginEnv::from_env();
    info!(plugin = %env.name, instance = %env.instance_id, broker = %format!("{}:{}", env.host, env.port), "starting");

    let mut opts = MqttOptions::new(env.client_id(), &env.host, env.port);
    opts.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(opts, 10);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            polled = eventloop.poll() => match polled {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    // clean session: subscribe again after every reconnect
                    client.subscribe(&env.topic, QoS::AtLeastOnce).await?;
                    info!(topic = %env.topic, "subscribed");
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) if publish.topic == env.topic => {
                    if let Err(e) = handle_payload(&publish.payload) {
                        warn!(error = %e, "invalid emissions payload");
                    }
                }
                Ok(other) => debug!(event = ?other, "mqtt"),
                Err(e) => {
                    warn!(error = %e, "mqtt connection error, retrying");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    }

    if let Err(e) = client.disconnect().await {
        warn!(error = %e, "mqtt disconnect failed");
    }
    info!("stopped");
    Ok(())
}
