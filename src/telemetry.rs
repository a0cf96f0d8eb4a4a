// Copyright 2024, F. Stan
//
// Licensed under the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// This file may not be copied, modified, or distributed
// except according to those terms.

//! Publish boundary to the remote telemetry endpoint.
//!
//! A [`TelemetrySink`] is connected once at startup and yields a
//! [`Publish`] handle that lives for the rest of the run. [`MqttSink`]
//! talks to an MQTT broker (Adafruit IO style `<account>/feeds/<feed>`
//! topics) with the blocking `rumqttc` client.

use log::{debug, info, warn};
use rumqttc::{
    Client, ConnectReturnCode, Connection, Event, MqttOptions, Outgoing, Packet, QoS,
};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Connection to the telemetry endpoint could not be established
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("broker refused connection: {0}")]
    Refused(String),
    #[error("connection failed: {0}")]
    Transport(String),
    #[error("no answer from broker within {0:?}")]
    Timeout(Duration),
}

/// A single measurement could not be published
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    #[error("publish to {topic} rejected: {message}")]
    Rejected { topic: String, message: String },
    #[error("publish to {topic} not acknowledged within {timeout:?}")]
    Timeout { topic: String, timeout: Duration },
    #[error("connection lost while publishing to {topic}: {message}")]
    Connection { topic: String, message: String },
}

/// Established connection, publishes named values
pub trait Publish {
    fn publish(&mut self, topic: &str, value: &str) -> Result<(), PublishError>;

    /// Waits `duration` between cycles. Connections that need servicing
    /// (keep-alive pings) do it here.
    fn idle(&mut self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Something that can be connected to once
pub trait TelemetrySink {
    type Handle: Publish;

    fn connect(self) -> Result<Self::Handle, ConnectError>;
}

/// The two logical channels of the node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub temperature: String,
    pub humidity: String,
}

impl Topics {
    /// `<account>/feeds/<feed>` for each channel
    pub fn for_account(account: &str, temperature_feed: &str, humidity_feed: &str) -> Topics {
        Topics {
            temperature: format!("{}/feeds/{}", account, temperature_feed),
            humidity: format!("{}/feeds/{}", account, humidity_feed),
        }
    }
}

/// Broker parameters
#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub publish_timeout: Duration,
}

/// MQTT broker, not yet connected
pub struct MqttSink {
    settings: MqttSettings,
}

impl MqttSink {
    pub fn new(settings: MqttSettings) -> MqttSink {
        MqttSink { settings }
    }
}

impl TelemetrySink for MqttSink {
    type Handle = MqttHandle;

    /// Connects and waits for the broker's CONNACK
    fn connect(self) -> Result<MqttHandle, ConnectError> {
        let s = self.settings;
        let mut options = MqttOptions::new(s.client_id.clone(), s.host.clone(), s.port);
        options.set_credentials(s.username.clone(), s.password.clone());
        options.set_keep_alive(s.keep_alive);

        let (client, mut connection) = Client::new(options, 10);
        let deadline = Instant::now() + s.connect_timeout;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match connection.recv_timeout(left) {
                Ok(Ok(Event::Incoming(Packet::ConnAck(ack)))) => {
                    if ack.code == ConnectReturnCode::Success {
                        info!("connected to {}:{}", s.host, s.port);
                        return Ok(MqttHandle {
                            client,
                            connection,
                            publish_timeout: s.publish_timeout,
                            acks: AckTracker::default(),
                        });
                    }
                    return Err(ConnectError::Refused(format!("{:?}", ack.code)));
                }
                Ok(Ok(event)) => debug!("mqtt event before connack: {:?}", event),
                Ok(Err(e)) => return Err(ConnectError::Transport(e.to_string())),
                Err(_) => return Err(ConnectError::Timeout(s.connect_timeout)),
            }
        }
    }
}

/// Matches PUBACKs to the publish that is being waited for.
///
/// Publishes leave the client queue in order, so the outgoing publish that
/// empties the queue is the latest one. Acks for older publishes that
/// already timed out are ignored.
#[derive(Debug, Default)]
struct AckTracker {
    queued: usize,
    awaiting: Option<u16>,
}

impl AckTracker {
    fn queue(&mut self) {
        self.queued += 1;
        self.awaiting = None;
    }

    /// Returns true when `event` acknowledges the latest publish
    fn observe(&mut self, event: &Event) -> bool {
        match event {
            Event::Outgoing(Outgoing::Publish(pkid)) => {
                self.queued = self.queued.saturating_sub(1);
                if self.queued == 0 {
                    self.awaiting = Some(*pkid);
                }
                false
            }
            Event::Incoming(Packet::PubAck(ack)) => {
                if self.awaiting == Some(ack.pkid) {
                    self.awaiting = None;
                    return true;
                }
                false
            }
            _ => false,
        }
    }
}

/// Live MQTT connection.
///
/// The event loop is driven inline while waiting for acknowledgements and
/// while idling between cycles, so keep-alive pings go out without a
/// background thread. Dropping the handle disconnects.
pub struct MqttHandle {
    client: Client,
    connection: Connection,
    publish_timeout: Duration,
    acks: AckTracker,
}

impl Publish for MqttHandle {
    fn publish(&mut self, topic: &str, value: &str) -> Result<(), PublishError> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, value.as_bytes().to_vec())
            .map_err(|e| PublishError::Rejected {
                topic: topic.to_string(),
                message: e.to_string(),
            })?;
        self.acks.queue();

        let deadline = Instant::now() + self.publish_timeout;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.connection.recv_timeout(left) {
                Ok(Ok(event)) => {
                    if self.acks.observe(&event) {
                        debug!("published {} = {}", topic, value);
                        return Ok(());
                    }
                }
                Ok(Err(e)) => {
                    return Err(PublishError::Connection {
                        topic: topic.to_string(),
                        message: e.to_string(),
                    })
                }
                Err(_) => {
                    return Err(PublishError::Timeout {
                        topic: topic.to_string(),
                        timeout: self.publish_timeout,
                    })
                }
            }
        }
    }

    fn idle(&mut self, duration: Duration) {
        let deadline = Instant::now() + duration;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return;
            }
            match self.connection.recv_timeout(left) {
                Ok(Ok(event)) => {
                    self.acks.observe(&event);
                }
                Ok(Err(e)) => {
                    // The event loop reconnects on the next poll
                    warn!("mqtt connection error while idle: {}", e);
                    thread::sleep(left.min(Duration::from_secs(1)));
                }
                Err(_) => return,
            }
        }
    }
}

impl Drop for MqttHandle {
    fn drop(&mut self) {
        if let Err(e) = self.client.disconnect() {
            warn!("mqtt disconnect failed: {}", e);
            return;
        }
        // Let the event loop flush the DISCONNECT packet
        let _ = self.connection.recv_timeout(Duration::from_millis(500));
    }
}
