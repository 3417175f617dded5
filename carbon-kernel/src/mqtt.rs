use crate::config::MqttConf;
use crate::health::HealthTracker;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions};
use std::time::Duration;
use tokio::task::{self, JoinHandle};
use tracing::{debug, warn};

pub fn create_mqtt_client(conf: &MqttConf, client_id: &str) -> (AsyncClient, EventLoop) {
    let mut opts = MqttOptions::new(client_id, &conf.host, conf.port);
    opts.set_keep_alive(Duration::from_secs(15));
    AsyncClient::new(opts, 64)
}

/// Drives the event loop forever; rumqttc reconnects on the next poll after an error
pub fn spawn_event_loop(mut eventloop: EventLoop, health: HealthTracker) -> JoinHandle<()> {
    task::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    debug!("mqtt connected");
                    health.mark_mqtt_connected();
                }
                Ok(Event::Incoming(Incoming::Disconnect)) => health.mark_mqtt_disconnected(),
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "mqtt connection error, retrying");
                    health.increment_reconnects();
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    })
}
