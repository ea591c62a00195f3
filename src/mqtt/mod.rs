pub mod ha_interface;

use std::time::Duration;

use crate::config::Config;
use crate::mqtt::ha_interface::HaDiscover;
use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet, QoS};
use thiserror::Error;
use tokio::sync::mpsc::{Receiver, Sender};

const DEFAULT_PORT: u16 = 1883;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const ONLINE: &str = "online";
const OFFLINE: &str = "offline";

#[derive(Debug, Clone, PartialEq)]
pub struct PublishData {
    pub topic: String,
    pub payload: String,
    pub qos: u8,
    pub retain: bool,
}

#[derive(Debug)]
pub enum Transmission {
    Publish(PublishData),
    /* Serialized by the manager and published retained */
    AutoDiscovery(HaDiscover),
    Shutdown,
}

#[derive(Error, Debug)]
pub enum MqttError {
    #[error("No MQTT server configured")]
    NoServers,
    #[error("Invalid MQTT server {0}")]
    InvalidServer(String),
    #[error("Failed to connect to {server}: {reason}")]
    Connect { server: String, reason: String },
}

pub fn to_qos(qos: u8) -> QoS {
    return match qos {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    };
}

/// Accepts tcp://host:port, mqtt://host:port, host:port and host
pub fn parse_server(server: &str) -> Result<(String, u16), MqttError> {
    let address = server.split_once("://").map(|(_, rest)| rest).unwrap_or(server);
    let (host, port) = match address.rsplit_once(':') {
        Some((host, port)) => (host, port.parse::<u16>().map_err(|_| MqttError::InvalidServer(server.to_string()))?),
        None => (address, DEFAULT_PORT),
    };

    if host.is_empty() {
        return Err(MqttError::InvalidServer(server.to_string()));
    }
    return Ok((host.to_string(), port));
}

pub struct MqttManager {
    rx: Receiver<Transmission>,
    client: AsyncClient,
    status_topic: String,
}

impl MqttManager {
    /// Connects to the first server that accepts us, there is no bridge without a broker
    pub async fn connect(config: &Config) -> Result<(Self, Sender<Transmission>), MqttError> {
        let mut last_error = MqttError::NoServers;

        for server in config.servers.iter() {
            info!("MQTT connection to {server} starting up");
            match Self::connect_server(config, server).await {
                Ok((client, eventloop)) => {
                    let status_topic = config.status_topic();
                    Self::spawn_eventloop(client.clone(), eventloop, status_topic.clone());

                    let (mtx, mrx) = tokio::sync::mpsc::channel(100);
                    return Ok((MqttManager { rx: mrx, client, status_topic }, mtx));
                }
                Err(e) => {
                    warn!("{e}");
                    last_error = e;
                }
            }
        }

        return Err(last_error);
    }

    async fn connect_server(config: &Config, server: &str) -> Result<(AsyncClient, EventLoop), MqttError> {
        let (host, port) = parse_server(server)?;

        let mut mqttoptions = MqttOptions::new(config.client_id.clone(), host, port);
        mqttoptions.set_keep_alive(Duration::from_secs(5));
        if !config.user.is_empty() {
            mqttoptions.set_credentials(config.user.clone(), config.password.clone());
        }
        mqttoptions.set_last_will(LastWill::new(config.status_topic(), OFFLINE, QoS::AtLeastOnce, true));

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

        /* Drive the event loop until the broker accepted the connection */
        let connected = tokio::time::timeout(CONNECT_TIMEOUT, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
                    Ok(_) => continue,
                    Err(e) => return Err(e.to_string()),
                }
            }
        })
        .await;

        return match connected {
            Ok(Ok(())) => Ok((client, eventloop)),
            Ok(Err(reason)) => Err(MqttError::Connect { server: server.to_string(), reason }),
            Err(_) => Err(MqttError::Connect { server: server.to_string(), reason: format!("no answer within {CONNECT_TIMEOUT:?}") }),
        };
    }

    fn spawn_eventloop(client: AsyncClient, mut eventloop: EventLoop, status_topic: String) {
        info!("Connected to the broker");
        let online = client.clone();
        let topic = status_topic.clone();
        tokio::spawn(async move {
            let _ = online.publish(topic, QoS::AtLeastOnce, true, ONLINE).await;
        });

        tokio::spawn(async move {
            info!("MQTT Eventloop started");
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Reconnected to the broker");
                        /* The broker may have published our last will in between */
                        let c = client.clone();
                        let topic = status_topic.clone();
                        tokio::spawn(async move {
                            let _ = c.publish(topic, QoS::AtLeastOnce, true, ONLINE).await;
                        });
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("Error in MQTT {:?}, reconnecting", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });
    }

    /* Hands the message to the event loop without waiting, a full request queue loses it */
    fn publish(&self, data: PublishData) {
        debug!("Publishing to {}: {}", data.topic, data.payload);
        if let Err(e) = self.client.try_publish(data.topic, to_qos(data.qos), data.retain, data.payload) {
            error!("Error publishing: {}", e);
        }
    }

    pub async fn start_thread(&mut self) {
        while let Some(transmission) = self.rx.recv().await {
            match transmission {
                Transmission::Publish(publish_data) => {
                    self.publish(publish_data);
                }
                Transmission::AutoDiscovery(disc) => match serde_json::to_string(&disc) {
                    Ok(payload) => {
                        self.publish(PublishData { topic: disc.discover_topic.clone(), payload, qos: 0, retain: true });
                    }
                    Err(e) => {
                        error!("Error marshaling config payload for {}: {}", disc.unique_id, e);
                    }
                },
                Transmission::Shutdown => {
                    info!("Shutting down the MQTT connection");
                    self.publish(PublishData { topic: self.status_topic.clone(), payload: OFFLINE.to_string(), qos: 1, retain: true });
                    if let Err(e) = self.client.try_disconnect() {
                        error!("Error disconnecting: {}", e);
                    }
                    return;
                }
            }
        }

        info!("All senders are gone, MQTT thread exits");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_server() {
        assert_eq!(parse_server("tcp://broker.local:1884").unwrap(), ("broker.local".to_string(), 1884));
        assert_eq!(parse_server("mqtt://10.0.0.2").unwrap(), ("10.0.0.2".to_string(), 1883));
        assert_eq!(parse_server("broker:1883").unwrap(), ("broker".to_string(), 1883));
        assert!(matches!(parse_server("tcp://broker:port"), Err(MqttError::InvalidServer(_))));
        assert!(matches!(parse_server("tcp://:1883"), Err(MqttError::InvalidServer(_))));
    }

    #[test]
    fn test_to_qos() {
        assert_eq!(to_qos(0), QoS::AtMostOnce);
        assert_eq!(to_qos(2), QoS::ExactlyOnce);
        assert_eq!(to_qos(9), QoS::AtMostOnce);
    }

    #[tokio::test]
    async fn test_unreachable_broker_does_not_block_the_queue() {
        /* Nobody polls the event loop, so the client request queue stays full */
        let (client, _eventloop) = AsyncClient::new(MqttOptions::new("test", "127.0.0.1", 9), 1);
        let (tx, rx) = tokio::sync::mpsc::channel(16);
        let mut manager = MqttManager { rx, client, status_topic: "home/meters/status".to_string() };

        for n in 0..5 {
            let data = PublishData { topic: format!("home/meters/m{n}/volume/state"), payload: "1.000000".to_string(), qos: 0, retain: false };
            tx.send(Transmission::Publish(data)).await.unwrap();
        }
        tx.send(Transmission::Shutdown).await.unwrap();

        tokio::time::timeout(Duration::from_millis(500), manager.start_thread()).await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_without_servers_fails() {
        let config = Config::parse("meters: []").unwrap();
        assert!(matches!(MqttManager::connect(&config).await, Err(MqttError::NoServers)));
    }

    #[tokio::test]
    async fn test_connect_refused_is_fatal() {
        /* Nothing listens on the discard port of localhost */
        let config = Config::parse("servers: [\"tcp://127.0.0.1:9\"]").unwrap();
        assert!(matches!(MqttManager::connect(&config).await, Err(MqttError::Connect { .. })));
    }
}
