use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubscribeReasonCode,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tracing::{debug, info, warn};

use crate::{Connection, Delivery, Link, DEFAULT_INBOX_CAPACITY};
use gust_core::{GustError, Result};

pub const DEFAULT_MQTT_PORT: u16 = 1883;

const KEEP_ALIVE: Duration = Duration::from_secs(5);
const REQUEST_CAPACITY: usize = 100;
const CLOSE_TIMEOUT: Duration = Duration::from_millis(500);

/// Something that can open sessions with a messaging endpoint
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, client_id: &str) -> Result<Connection>;

    /// Human readable endpoint description for logs and reports
    fn describe(&self) -> String;
}

/// Split `host:port`, with an optional `mqtt://` or `tcp://` scheme.
/// A missing port means the standard MQTT port.
pub fn parse_endpoint(endpoint: &str) -> Result<(String, u16)> {
    let bare = endpoint
        .strip_prefix("mqtt://")
        .or_else(|| endpoint.strip_prefix("tcp://"))
        .unwrap_or(endpoint);

    let (host, port) = match bare.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| GustError::Config(format!("Invalid port in endpoint {}", endpoint)))?;
            (host, port)
        }
        None => (bare, DEFAULT_MQTT_PORT),
    };
    if host.is_empty() {
        return Err(GustError::Config(format!("Missing host in endpoint {}", endpoint)));
    }
    Ok((host.to_string(), port))
}

/// MQTT 3.1.1 client transport; every connection is its own clean session
#[derive(Debug, Clone)]
pub struct MqttTransport {
    address: String,
}

impl MqttTransport {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&self, client_id: &str) -> Result<Connection> {
        let (host, port) = parse_endpoint(&self.address)?;
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_session(true);

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

        // Drive the event loop until the broker answers the CONNECT
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if matches!(ack.code, ConnectReturnCode::Success) {
                        break;
                    }
                    return Err(GustError::Connection(format!(
                        "{} refused {}: {:?}",
                        self.address, client_id, ack.code
                    )));
                }
                Ok(_) => {}
                Err(e) => {
                    return Err(GustError::Connection(format!(
                        "Failed to connect to {}: {}",
                        self.address, e
                    )));
                }
            }
        }
        info!("Client {} connected to {}", client_id, self.address);

        let (tx, rx) = mpsc::channel(DEFAULT_INBOX_CAPACITY);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let pump = tokio::spawn(pump_events(client_id.to_string(), eventloop, tx, cancel_rx));

        let link = MqttLink {
            client,
            cancel: Some(cancel_tx),
            pump: Some(pump),
        };
        Ok(Connection::new(client_id.to_string(), Box::new(link), rx))
    }

    fn describe(&self) -> String {
        format!("mqtt://{}", self.address)
    }
}

struct MqttLink {
    client: AsyncClient,
    cancel: Option<oneshot::Sender<()>>,
    pump: Option<JoinHandle<()>>,
}

fn client_error(e: rumqttc::ClientError) -> GustError {
    GustError::Connection(format!("MQTT session closed: {}", e))
}

#[async_trait]
impl Link for MqttLink {
    async fn subscribe(&mut self, filter: &str) -> Result<()> {
        self.client
            .subscribe(filter, QoS::AtMostOnce)
            .await
            .map_err(client_error)
    }

    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .await
            .map_err(client_error)
    }

    async fn close(&mut self) -> Result<()> {
        if let Err(e) = self.client.disconnect().await {
            debug!("DISCONNECT not queued: {}", e);
        }
        if let Some(mut pump) = self.pump.take() {
            // The pump exits once DISCONNECT is on the wire
            if time::timeout(CLOSE_TIMEOUT, &mut pump).await.is_err() {
                if let Some(cancel) = self.cancel.take() {
                    let _ = cancel.send(());
                }
                let _ = pump.await;
            }
        }
        Ok(())
    }
}

async fn pump_events(
    client_id: String,
    mut eventloop: EventLoop,
    tx: mpsc::Sender<Delivery>,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut cancel_rx => {
                debug!("Event loop for {} cancelled", client_id);
                break;
            }

            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let delivery = Delivery {
                        topic: publish.topic,
                        payload: publish.payload,
                    };
                    match tx.try_send(delivery) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            debug!("Inbox full for {}, delivery dropped", client_id);
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => break,
                    }
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    if ack
                        .return_codes
                        .iter()
                        .any(|code| matches!(code, SubscribeReasonCode::Failure))
                    {
                        warn!("{} subscription rejected by broker", client_id);
                    }
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                Ok(_) => {}
                // No reconnect: a lost session shows up as packet loss
                Err(e) => {
                    debug!("Connection for {} closed: {}", client_id, e);
                    break;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoint() {
        assert_eq!(
            parse_endpoint("127.0.0.1:1883").unwrap(),
            ("127.0.0.1".to_string(), 1883)
        );
        assert_eq!(
            parse_endpoint("mqtt://broker.local:7883").unwrap(),
            ("broker.local".to_string(), 7883)
        );
        assert_eq!(
            parse_endpoint("broker.local").unwrap(),
            ("broker.local".to_string(), DEFAULT_MQTT_PORT)
        );
        assert!(matches!(
            parse_endpoint("host:notaport"),
            Err(GustError::Config(_))
        ));
        assert!(parse_endpoint(":1883").is_err());
    }

    #[test]
    fn test_describe_names_the_scheme() {
        assert_eq!(MqttTransport::new("10.0.0.1:1883").describe(), "mqtt://10.0.0.1:1883");
    }
}
