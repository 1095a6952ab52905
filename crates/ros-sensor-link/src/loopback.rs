//! In-memory frame link
//!
//! A [`LoopbackConnector`] hands out links whose inbound frames are fed from a
//! [`LoopbackHandle`] instead of a socket. Everything sent over the link is
//! recorded on the handle. Used for tests and for replaying captured bridge
//! traffic.

use crate::protocol::ControlFrame;
use crate::transport::{ConnectionError, Connector, FrameLink, LinkEvent};
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

#[derive(Default)]
struct Shared {
    sent: Mutex<Vec<String>>,
    refuse: AtomicBool,
    closed: AtomicBool,
}

/// Create a connected connector/handle pair
pub fn loopback() -> (LoopbackConnector, LoopbackHandle) {
    let (tx, rx) = unbounded();
    let shared = Arc::new(Shared::default());

    (
        LoopbackConnector {
            inbound: rx,
            shared: shared.clone(),
        },
        LoopbackHandle { inbound: tx, shared },
    )
}

/// Connector producing in-memory links
#[derive(Clone)]
pub struct LoopbackConnector {
    inbound: Receiver<LinkEvent>,
    shared: Arc<Shared>,
}

impl Connector for LoopbackConnector {
    type Link = LoopbackLink;

    fn open(&self, host: &str, port: u16) -> Result<Self::Link, ConnectionError> {
        if self.shared.refuse.load(Ordering::SeqCst) {
            return Err(ConnectionError::Refused(format!("{host}:{port}")));
        }

        debug!("Opening loopback link for {}:{}", host, port);
        self.shared.closed.store(false, Ordering::SeqCst);

        Ok(LoopbackLink {
            inbound: self.inbound.clone(),
            shared: self.shared.clone(),
        })
    }
}

/// Link end owned by the transport
pub struct LoopbackLink {
    inbound: Receiver<LinkEvent>,
    shared: Arc<Shared>,
}

impl FrameLink for LoopbackLink {
    fn send_text(&mut self, text: String) -> Result<(), ConnectionError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(ConnectionError::LinkClosed);
        }
        self.shared
            .sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(text);
        Ok(())
    }

    fn try_next(&mut self) -> Option<LinkEvent> {
        self.inbound.try_recv().ok()
    }

    fn close(&mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
    }
}

/// Remote side of a loopback link
#[derive(Clone)]
pub struct LoopbackHandle {
    inbound: Sender<LinkEvent>,
    shared: Arc<Shared>,
}

impl LoopbackHandle {
    /// Queue a raw text frame for the transport
    pub fn push_text(&self, text: impl Into<String>) {
        let _ = self.inbound.send(LinkEvent::Text(text.into()));
    }

    /// Queue a publish frame for a topic
    pub fn publish(&self, topic: &str, msg: &Value) {
        let frame = json!({"op": "publish", "topic": topic, "msg": msg});
        self.push_text(frame.to_string());
    }

    pub fn close_from_remote(&self, reason: Option<&str>) {
        let _ = self
            .inbound
            .send(LinkEvent::Closed(reason.map(str::to_string)));
    }

    pub fn fail(&self, reason: &str) {
        let _ = self.inbound.send(LinkEvent::Failed(reason.to_string()));
    }

    /// Make subsequent connection attempts fail
    pub fn refuse_connections(&self, refuse: bool) {
        self.shared.refuse.store(refuse, Ordering::SeqCst);
    }

    /// All text frames sent by the transport, oldest first
    pub fn sent_frames(&self) -> Vec<String> {
        self.shared
            .sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Sent frames that parse as control frames
    pub fn control_frames(&self) -> Vec<ControlFrame> {
        self.sent_frames()
            .iter()
            .filter_map(|text| serde_json::from_str(text).ok())
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}
