//! ROS bridge transport
//!
//! [`RosBridgeTransport`] owns one session with a bridge endpoint. The session
//! itself is provided by a [`Connector`] (a real websocket, or the in-memory
//! loopback used in tests and replays). Inbound frames are buffered by the
//! link and only handed to topic handlers from [`RosBridgeTransport::pump_events`],
//! so handlers always run on the thread driving the transport.

use crate::protocol::{ControlFrame, InboundFrame, Protocol, ProtocolError};
use serde_json::value::RawValue;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

/// Errors that can occur on the bridge connection
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Websocket handshake failed: {0}")]
    Handshake(String),

    #[error("Connection refused by {0}")]
    Refused(String),

    #[error("Link closed")]
    LinkClosed,

    #[error("Transport is faulted; create a new transport to reconnect")]
    Faulted,
}

/// Lifecycle of a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Faulted,
}

/// Events produced by a frame link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A text frame from the bridge
    Text(String),
    /// The remote side closed the session
    Closed(Option<String>),
    /// The session failed
    Failed(String),
}

/// A bidirectional text-frame session with a bridge
pub trait FrameLink {
    /// Queue a text frame for sending
    fn send_text(&mut self, text: String) -> Result<(), ConnectionError>;

    /// Take the next buffered event without blocking
    fn try_next(&mut self) -> Option<LinkEvent>;

    /// Close the session. Must be safe to call more than once.
    fn close(&mut self);
}

/// Opens frame links to a bridge endpoint
pub trait Connector {
    type Link: FrameLink;

    fn open(&self, host: &str, port: u16) -> Result<Self::Link, ConnectionError>;
}

/// Callback receiving the topic and raw `msg` body of a publication
pub type TopicHandler = Box<dyn FnMut(&str, Box<RawValue>) + Send>;

struct Subscription {
    msg_type: Option<String>,
    handler: TopicHandler,
    /// Whether a subscribe frame was sent on the current session
    announced: bool,
}

/// Counters for frames passing through the transport
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub messages_dispatched: u64,
    pub frames_unrouted: u64,
    pub frames_malformed: u64,
}

/// Publish/subscribe client for one ROS bridge session
pub struct RosBridgeTransport<C: Connector> {
    connector: C,
    link: Option<C::Link>,
    protocol: Protocol,
    state: ConnectionState,
    endpoint: Option<String>,
    subscriptions: HashMap<String, Subscription>,
    stats: TransportStats,
}

impl<C: Connector> RosBridgeTransport<C> {
    pub fn new(connector: C) -> Self {
        Self::with_protocol(connector, Protocol::default())
    }

    pub fn with_protocol(connector: C, protocol: Protocol) -> Self {
        Self {
            connector,
            link: None,
            protocol,
            state: ConnectionState::Disconnected,
            endpoint: None,
            subscriptions: HashMap::new(),
            stats: TransportStats::default(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// The `host:port` of the last connection attempt
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    pub fn stats(&self) -> TransportStats {
        self.stats
    }

    /// Open the session. Subscriptions registered while disconnected are
    /// announced once the handshake completes.
    pub fn connect(&mut self, host: &str, port: u16) -> Result<(), ConnectionError> {
        match self.state {
            ConnectionState::Faulted => return Err(ConnectionError::Faulted),
            ConnectionState::Connected => {
                warn!("Transport already connected to {:?}", self.endpoint);
                return Ok(());
            }
            _ => {}
        }

        let endpoint = format!("{host}:{port}");
        info!("Connecting to ROS bridge at {}", endpoint);
        self.endpoint = Some(endpoint.clone());
        self.state = ConnectionState::Connecting;

        let link = match self.connector.open(host, port) {
            Ok(link) => link,
            Err(e) => {
                error!("Failed to connect to {}: {}", endpoint, e);
                self.state = ConnectionState::Faulted;
                return Err(e);
            }
        };
        self.link = Some(link);
        self.state = ConnectionState::Connected;
        info!("Connected to ROS bridge at {}", endpoint);

        let mut pending: Vec<(String, Option<String>)> = self
            .subscriptions
            .iter()
            .filter(|(_, sub)| !sub.announced)
            .map(|(topic, sub)| (topic.clone(), sub.msg_type.clone()))
            .collect();
        pending.sort();

        for (topic, msg_type) in pending {
            self.send_control(&ControlFrame::subscribe(topic.as_str(), msg_type.as_deref()))?;
            if let Some(sub) = self.subscriptions.get_mut(&topic) {
                sub.announced = true;
            }
        }

        Ok(())
    }

    /// Register a handler for a topic and subscribe to it.
    ///
    /// Subscribing to a topic that already has a handler replaces the handler
    /// and sends nothing.
    pub fn add_subscriber(
        &mut self,
        topic: &str,
        msg_type: Option<&str>,
        handler: TopicHandler,
    ) -> Result<(), ConnectionError> {
        if self.state == ConnectionState::Faulted {
            return Err(ConnectionError::Faulted);
        }

        if let Some(existing) = self.subscriptions.get_mut(topic) {
            debug!("Already subscribed to {}, replacing handler", topic);
            existing.handler = handler;
            return Ok(());
        }

        self.subscriptions.insert(
            topic.to_string(),
            Subscription {
                msg_type: msg_type.map(str::to_string),
                handler,
                announced: false,
            },
        );

        if self.is_connected() {
            self.send_control(&ControlFrame::subscribe(topic, msg_type))?;
            if let Some(sub) = self.subscriptions.get_mut(topic) {
                sub.announced = true;
            }
        } else {
            debug!("Subscription to {} deferred until connected", topic);
        }

        Ok(())
    }

    /// Drop the handler for a topic and unsubscribe from it
    pub fn remove_subscriber(&mut self, topic: &str) -> Result<(), ConnectionError> {
        let Some(sub) = self.subscriptions.remove(topic) else {
            warn!("No such subscriber exists: {}", topic);
            return Ok(());
        };

        if sub.announced && self.is_connected() {
            self.send_control(&ControlFrame::unsubscribe(topic))?;
        }

        Ok(())
    }

    /// Dispatch all buffered inbound frames to their topic handlers.
    ///
    /// Returns the number of messages handed to handlers.
    pub fn pump_events(&mut self) -> usize {
        let Some(link) = self.link.as_mut() else {
            return 0;
        };

        let mut dispatched = 0;
        let mut ended = None;

        while let Some(event) = link.try_next() {
            match event {
                LinkEvent::Text(text) => {
                    self.stats.frames_received += 1;
                    if dispatch_frame(
                        &self.protocol,
                        &mut self.subscriptions,
                        &mut self.stats,
                        &text,
                    ) {
                        dispatched += 1;
                    }
                }
                LinkEvent::Closed(reason) => {
                    info!("ROS bridge closed the connection: {:?}", reason);
                    ended = Some(ConnectionState::Disconnected);
                    break;
                }
                LinkEvent::Failed(reason) => {
                    error!("ROS bridge connection failed: {}", reason);
                    ended = Some(ConnectionState::Faulted);
                    break;
                }
            }
        }

        if let Some(state) = ended {
            self.drop_link();
            self.state = state;
        }

        dispatched
    }

    /// Close the session. Safe to call repeatedly; a faulted transport
    /// stays faulted.
    pub fn disconnect(&mut self) {
        if self.link.is_none() || self.state == ConnectionState::Faulted {
            self.drop_link();
            return;
        }

        debug!("Disconnecting from {:?}", self.endpoint);
        self.state = ConnectionState::Closing;
        self.drop_link();
        self.state = ConnectionState::Disconnected;

        info!(
            "Disconnected from ROS bridge. Sent {} frames, received {}",
            self.stats.frames_sent, self.stats.frames_received
        );
    }

    fn drop_link(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.close();
        }
        for sub in self.subscriptions.values_mut() {
            sub.announced = false;
        }
    }

    fn send_control(&mut self, frame: &ControlFrame) -> Result<(), ConnectionError> {
        let text = self.protocol.encode_control(frame)?;
        let link = self.link.as_mut().ok_or(ConnectionError::LinkClosed)?;

        if let Err(e) = link.send_text(text) {
            error!("Failed to send {:?}: {}", frame, e);
            self.drop_link();
            self.state = ConnectionState::Faulted;
            return Err(e);
        }

        self.stats.frames_sent += 1;
        debug!("Sent {:?}", frame);
        Ok(())
    }
}

impl<C: Connector> Drop for RosBridgeTransport<C> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn dispatch_frame(
    protocol: &Protocol,
    subscriptions: &mut HashMap<String, Subscription>,
    stats: &mut TransportStats,
    text: &str,
) -> bool {
    match protocol.parse_inbound(text) {
        Ok(InboundFrame::Publish { topic, payload }) => match subscriptions.get_mut(&topic) {
            Some(sub) => {
                trace!("Dispatching {} bytes on {}", payload.get().len(), topic);
                (sub.handler)(&topic, payload);
                stats.messages_dispatched += 1;
                true
            }
            None => {
                warn!("Topic not subscribed: {}", topic);
                stats.frames_unrouted += 1;
                false
            }
        },
        Ok(InboundFrame::Other { op }) => {
            debug!("Ignoring bridge operation: {}", op);
            stats.frames_unrouted += 1;
            false
        }
        Err(e) => {
            warn!("Dropping malformed frame: {}", e);
            stats.frames_malformed += 1;
            false
        }
    }
}
