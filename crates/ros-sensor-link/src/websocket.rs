//! Websocket frame link
//!
//! The socket is owned by a dedicated I/O thread. The transport talks to it
//! through two channels: outbound commands and inbound [`LinkEvent`]s. The
//! socket read timeout doubles as the interval at which queued outbound
//! frames are flushed.

use crate::protocol::DEFAULT_MAX_FRAME_SIZE;
use crate::transport::{ConnectionError, Connector, FrameLink, LinkEvent};
use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use std::io::ErrorKind;
use std::net::{TcpStream, ToSocketAddrs};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};
use tungstenite::client::client_with_config;
use tungstenite::protocol::WebSocketConfig;
use tungstenite::{Message, WebSocket};

/// Configuration for websocket connections
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Timeout for establishing the TCP connection
    pub connect_timeout: Option<Duration>,
    /// Socket read timeout; bounds the latency of outbound frames
    pub poll_interval: Duration,
    /// TCP no-delay setting
    pub tcp_nodelay: bool,
    /// Maximum inbound message size in bytes
    pub max_message_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Some(Duration::from_secs(10)),
            poll_interval: Duration::from_millis(20),
            tcp_nodelay: true,
            max_message_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// Strips a websocket scheme and trailing slash from a host
fn bare_host(host: &str) -> &str {
    host.trim_start_matches("ws://")
        .trim_start_matches("wss://")
        .trim_end_matches('/')
}

/// Builds the bridge URL, accepting hosts given with or without a scheme
pub fn bridge_url(host: &str, port: u16) -> String {
    format!("ws://{}:{port}", bare_host(host))
}

/// Connector for real ROS bridge websocket sessions
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector {
    config: TransportConfig,
}

impl WebSocketConnector {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }
}

impl Connector for WebSocketConnector {
    type Link = WebSocketLink;

    fn open(&self, host: &str, port: u16) -> Result<Self::Link, ConnectionError> {
        let url = bridge_url(host, port);
        let host = bare_host(host);
        if host.is_empty() {
            return Err(ConnectionError::InvalidEndpoint(url));
        }

        let stream = if let Some(timeout) = self.config.connect_timeout {
            let socket_addr = (host, port)
                .to_socket_addrs()?
                .next()
                .ok_or_else(|| ConnectionError::InvalidEndpoint(url.clone()))?;
            TcpStream::connect_timeout(&socket_addr, timeout)?
        } else {
            TcpStream::connect((host, port))?
        };
        stream.set_nodelay(self.config.tcp_nodelay)?;

        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(self.config.max_message_size);

        let (socket, response) = client_with_config(url.as_str(), stream, Some(ws_config))
            .map_err(|e| ConnectionError::Handshake(e.to_string()))?;
        debug!("Handshake with {} complete: {}", url, response.status());

        socket
            .get_ref()
            .set_read_timeout(Some(self.config.poll_interval))?;

        WebSocketLink::spawn(socket, &url)
    }
}

enum LinkCommand {
    Send(String),
    Close,
}

/// Websocket session driven by a background I/O thread
pub struct WebSocketLink {
    commands: Sender<LinkCommand>,
    events: Receiver<LinkEvent>,
    io_thread: Option<thread::JoinHandle<()>>,
}

impl WebSocketLink {
    fn spawn(socket: WebSocket<TcpStream>, url: &str) -> Result<Self, ConnectionError> {
        let (command_tx, command_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();

        let io_thread = thread::Builder::new()
            .name(format!("rosbridge-io {url}"))
            .spawn(move || run_io_loop(socket, command_rx, event_tx))?;

        Ok(Self {
            commands: command_tx,
            events: event_rx,
            io_thread: Some(io_thread),
        })
    }
}

impl FrameLink for WebSocketLink {
    fn send_text(&mut self, text: String) -> Result<(), ConnectionError> {
        self.commands
            .send(LinkCommand::Send(text))
            .map_err(|_| ConnectionError::LinkClosed)
    }

    fn try_next(&mut self) -> Option<LinkEvent> {
        self.events.try_recv().ok()
    }

    fn close(&mut self) {
        let Some(io_thread) = self.io_thread.take() else {
            return;
        };
        let _ = self.commands.send(LinkCommand::Close);
        if io_thread.join().is_err() {
            error!("Websocket I/O thread panicked");
        }
    }
}

impl Drop for WebSocketLink {
    fn drop(&mut self) {
        self.close();
    }
}

fn close_socket(socket: &mut WebSocket<TcpStream>) {
    let _ = socket.close(None);
    let _ = socket.flush();
}

fn run_io_loop(
    mut socket: WebSocket<TcpStream>,
    commands: Receiver<LinkCommand>,
    events: Sender<LinkEvent>,
) {
    debug!("Websocket I/O thread started");

    loop {
        // Flush queued outbound frames
        loop {
            match commands.try_recv() {
                Ok(LinkCommand::Send(text)) => {
                    trace!("Sending frame ({} bytes)", text.len());
                    if let Err(e) = socket.send(Message::text(text)) {
                        let _ = events.send(LinkEvent::Failed(e.to_string()));
                        return;
                    }
                }
                Ok(LinkCommand::Close) | Err(TryRecvError::Disconnected) => {
                    debug!("Closing websocket");
                    close_socket(&mut socket);
                    return;
                }
                Err(TryRecvError::Empty) => break,
            }
        }

        let event = match socket.read() {
            Ok(Message::Text(text)) => LinkEvent::Text(text.to_string()),
            Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(text) => LinkEvent::Text(text),
                Err(_) => {
                    warn!("Ignoring non-UTF-8 binary frame ({} bytes)", data.len());
                    continue;
                }
            },
            Ok(Message::Close(frame)) => {
                info!("Websocket closed by peer");
                LinkEvent::Closed(frame.map(|f| f.reason.to_string()))
            }
            Ok(_) => continue,
            Err(tungstenite::Error::Io(e))
                if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
            {
                continue;
            }
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                LinkEvent::Closed(None)
            }
            Err(e) => LinkEvent::Failed(e.to_string()),
        };

        let finished = !matches!(event, LinkEvent::Text(_));
        if events.send(event).is_err() || finished {
            close_socket(&mut socket);
            return;
        }
    }
}
