//! Sensor connection
//!
//! [`SensorConnection`] ties one bridge transport, its topic registry and a
//! decode worker together. Messages flow through two queues:
//!
//! ```text
//! pump_events() -> topic handler -> raw queue -> decode worker -> decoded queue -> poll_decoded()
//! ```
//!
//! The driving thread only moves unparsed message bodies onto the raw queue;
//! all JSON and geometry decoding happens on the worker thread.

use crate::config::SensorConfig;
use crate::mesh_map::MeshSink;
use crate::protocol::Protocol;
use crate::registry::{SubscriptionError, TopicRegistry};
use crate::transport::{
    ConnectionError, ConnectionState, Connector, RosBridgeTransport, TopicHandler, TransportStats,
};
use crate::types::{MeshDelta, RawMessage, SensorPose};
use crate::websocket::WebSocketConnector;
use crate::worker::{DecodeWorker, PipelineCounters, WorkerConfig, WorkerStats};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors returned by [`SensorConnection`]
#[derive(Error, Debug)]
pub enum SensorError {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Subscription error: {0}")]
    Subscription(#[from] SubscriptionError),

    #[error("Sensor is already initialized")]
    AlreadyInitialized,

    #[error("Sensor is not initialized")]
    NotInitialized,

    #[error("Sensor has been shut down")]
    ShutDown,

    #[error("Failed to start decode worker: {0}")]
    WorkerSpawn(#[source] std::io::Error),
}

/// Outcome of [`SensorConnection::initialize`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitReport {
    /// Topics subscribed to, in configuration order
    pub topics: Vec<String>,
    /// Aliases that did not resolve to any topic
    pub unknown_aliases: Vec<String>,
}

struct Pipeline {
    raw_tx: Sender<RawMessage>,
    decoded_rx: Receiver<MeshDelta>,
    next_sequence: Arc<AtomicU64>,
    worker: Option<DecodeWorker>,
}

/// A mesh sensor reached through a ROS bridge
pub struct SensorConnection<C: Connector = WebSocketConnector> {
    transport: RosBridgeTransport<C>,
    registry: TopicRegistry,
    worker_config: WorkerConfig,
    counters: Arc<PipelineCounters>,
    pipeline: Option<Pipeline>,
    name: String,
    unique_id: Option<String>,
    pose: SensorPose,
    initialized: bool,
    shut_down: bool,
}

impl SensorConnection<WebSocketConnector> {
    /// Websocket-backed sensor described by `config`
    pub fn from_config(config: &SensorConfig) -> Self {
        Self::with_config(WebSocketConnector::new(config.transport_config()), config)
    }
}

impl<C: Connector> SensorConnection<C> {
    pub fn new(connector: C, worker_config: WorkerConfig) -> Self {
        Self::with_transport(RosBridgeTransport::new(connector), worker_config)
    }

    /// Sensor over `connector`, taking name, pose and limits from `config`
    pub fn with_config(connector: C, config: &SensorConfig) -> Self {
        let protocol = Protocol::default().with_max_frame_size(config.max_frame_size);
        let mut sensor = Self::with_transport(
            RosBridgeTransport::with_protocol(connector, protocol),
            config.worker_config(),
        )
        .with_name(config.name.clone());
        sensor.pose = config.pose;
        sensor
    }

    fn with_transport(transport: RosBridgeTransport<C>, worker_config: WorkerConfig) -> Self {
        Self {
            transport,
            registry: TopicRegistry::new(),
            worker_config,
            counters: Arc::new(PipelineCounters::default()),
            pipeline: None,
            name: "Mesh Sensor".to_string(),
            unique_id: None,
            pose: SensorPose::default(),
            initialized: false,
            shut_down: false,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Resolve `aliases`, subscribe to their topics, connect to the bridge
    /// and start decoding.
    ///
    /// Returns once the handshake has completed or failed. Unknown aliases
    /// are reported in the [`InitReport`] rather than failing the call.
    pub fn initialize<S: AsRef<str>>(
        &mut self,
        unique_id: &str,
        host: &str,
        port: u16,
        aliases: &[S],
    ) -> Result<InitReport, SensorError> {
        if self.shut_down {
            return Err(SensorError::ShutDown);
        }
        if self.initialized {
            return Err(SensorError::AlreadyInitialized);
        }
        self.initialized = true;
        self.unique_id = Some(unique_id.to_string());

        info!(
            "Initializing sensor {} ({}) at {}:{}",
            self.name, unique_id, host, port
        );

        let (raw_tx, raw_rx) = match self.worker_config.inbound_capacity {
            Some(capacity) => bounded(capacity),
            None => unbounded(),
        };
        let (decoded_tx, decoded_rx) = unbounded();
        self.pipeline = Some(Pipeline {
            raw_tx,
            decoded_rx,
            next_sequence: Arc::new(AtomicU64::new(0)),
            worker: None,
        });

        let resolution = self.registry.configure(aliases);
        if resolution.topics.is_empty() {
            warn!("Sensor {} has no subscribers configured", self.name);
        }
        for topic in &resolution.topics {
            let handler = self.enqueue_handler()?;
            self.registry.subscribe(topic, &mut self.transport, handler)?;
        }

        if let Err(e) = self.transport.connect(host, port) {
            self.sync_fault();
            return Err(e.into());
        }

        let worker = DecodeWorker::spawn(
            unique_id,
            raw_rx,
            decoded_tx,
            &self.worker_config,
            self.counters.clone(),
        )
        .map_err(SensorError::WorkerSpawn)?;
        if let Some(pipeline) = self.pipeline.as_mut() {
            pipeline.worker = Some(worker);
        }

        info!("Sensor {} connected", self.name);
        Ok(InitReport {
            unknown_aliases: resolution.unknown_aliases(),
            topics: resolution.topics,
        })
    }

    fn enqueue_handler(&self) -> Result<TopicHandler, SensorError> {
        let pipeline = self.pipeline.as_ref().ok_or(SensorError::NotInitialized)?;
        let raw_tx = pipeline.raw_tx.clone();
        let next_sequence = pipeline.next_sequence.clone();
        let counters = self.counters.clone();

        Ok(Box::new(move |topic, payload| {
            let sequence = next_sequence.fetch_add(1, Ordering::Relaxed);
            match raw_tx.try_send(RawMessage::new(topic, sequence, payload)) {
                Ok(()) => {
                    counters.queued.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Full(raw)) => {
                    counters.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Decode queue full, dropping message {} on {}",
                        raw.sequence, raw.topic
                    );
                }
                Err(TrySendError::Disconnected(raw)) => {
                    counters.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        "Decode worker gone, dropping message {} on {}",
                        raw.sequence, raw.topic
                    );
                }
            }
        }))
    }

    /// Dispatch buffered bridge frames. Never blocks.
    pub fn pump_events(&mut self) -> usize {
        if self.shut_down {
            return 0;
        }
        let dispatched = self.transport.pump_events();
        self.sync_fault();
        dispatched
    }

    /// Take every delta decoded so far, oldest first. Never blocks.
    pub fn poll_decoded(&mut self) -> Vec<MeshDelta> {
        self.pipeline
            .as_ref()
            .map(|pipeline| pipeline.decoded_rx.try_iter().collect())
            .unwrap_or_default()
    }

    /// Hand every decoded delta to `sink`, returning how many were applied
    pub fn drain_into<S: MeshSink + ?Sized>(&mut self, sink: &mut S) -> usize {
        let Some(pipeline) = self.pipeline.as_ref() else {
            return 0;
        };

        let mut applied = 0;
        for delta in pipeline.decoded_rx.try_iter() {
            sink.apply_delta(delta);
            applied += 1;
        }
        applied
    }

    /// Resume a configured topic
    pub fn subscribe(&mut self, topic: &str) -> Result<(), SensorError> {
        if self.shut_down {
            return Err(SensorError::ShutDown);
        }
        let handler = self.enqueue_handler()?;
        let result = self.registry.subscribe(topic, &mut self.transport, handler);
        self.sync_fault();
        result.map_err(SensorError::from)
    }

    /// Pause a configured topic
    pub fn unsubscribe(&mut self, topic: &str) -> Result<(), SensorError> {
        if self.shut_down {
            return Err(SensorError::ShutDown);
        }
        let result = self.registry.unsubscribe(topic, &mut self.transport);
        self.sync_fault();
        result.map_err(SensorError::from)
    }

    fn sync_fault(&mut self) {
        if self.transport.state() == ConnectionState::Faulted {
            self.registry.deactivate_all();
        }
    }

    pub fn active_topics(&self) -> Vec<String> {
        self.registry.list_active()
    }

    /// Every configured topic with whether it is subscribed
    pub fn subscribers(&self) -> BTreeMap<String, bool> {
        self.registry.subscribers()
    }

    pub fn message_type(&self, topic: &str) -> Option<&str> {
        self.registry.message_type(topic)
    }

    pub fn state(&self) -> ConnectionState {
        self.transport.state()
    }

    pub fn stats(&self) -> WorkerStats {
        self.counters.snapshot()
    }

    pub fn transport_stats(&self) -> TransportStats {
        self.transport.stats()
    }

    pub fn sensor_name(&self) -> &str {
        &self.name
    }

    pub fn unique_id(&self) -> Option<&str> {
        self.unique_id.as_deref()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    pub fn set_local_position(&mut self, position: [f32; 3]) {
        self.pose.position = position;
    }

    /// Set the orientation as an (x, y, z, w) quaternion
    pub fn set_local_orientation(&mut self, orientation: [f32; 4]) {
        self.pose.orientation = orientation;
    }

    pub fn set_local_scale(&mut self, scale: [f32; 3]) {
        self.pose.scale = scale;
    }

    pub fn pose(&self) -> SensorPose {
        self.pose
    }

    /// Close the bridge session but keep decoding what was already queued
    pub fn disconnect(&mut self) {
        self.transport.disconnect();
    }

    /// Stop the decode worker and close the bridge session.
    ///
    /// The worker gets at most the configured shutdown timeout to exit.
    /// Deltas not yet polled are discarded. Safe to call more than once and
    /// after a failed initialization.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        debug!("Shutting down sensor {}", self.name);

        if let Some(worker) = self.pipeline.as_mut().and_then(|p| p.worker.take()) {
            if !worker.stop(self.worker_config.shutdown_timeout) {
                warn!("Sensor {} shut down with a detached decode worker", self.name);
            }
        }
        self.transport.disconnect();
        self.pipeline = None;

        let stats = self.stats();
        info!(
            "Sensor {} shut down: {} messages decoded, {} failed, {} dropped",
            self.name, stats.messages_decoded, stats.messages_failed, stats.messages_dropped
        );
    }
}

impl<C: Connector> Drop for SensorConnection<C> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{loopback, LoopbackConnector};
    use crate::mesh_map::MeshMap;
    use crate::protocol::ControlFrame;
    use crate::types::BlockKey;
    use serde_json::json;
    use std::time::{Duration, Instant};

    const MESH_TOPIC: &str = "/voxblox_node/mesh";

    fn sensor(connector: LoopbackConnector) -> SensorConnection<LoopbackConnector> {
        SensorConnection::new(connector, WorkerConfig::default())
    }

    fn removal(x: i64) -> serde_json::Value {
        json!({
            "block_edge_length": 0.25,
            "mesh_blocks": [{"index": [x, 0, 0], "x": [], "y": [], "z": []}]
        })
    }

    fn poll_until(
        sensor: &mut SensorConnection<LoopbackConnector>,
        count: usize,
    ) -> Vec<MeshDelta> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut deltas = Vec::new();
        while deltas.len() < count && Instant::now() < deadline {
            sensor.pump_events();
            deltas.extend(sensor.poll_decoded());
            std::thread::sleep(Duration::from_millis(1));
        }
        deltas
    }

    #[test]
    fn test_initialize_subscribes_resolved_topics() {
        let (connector, handle) = loopback();
        let mut sensor = sensor(connector).with_name("Front");

        let report = sensor
            .initialize("7", "10.0.0.5", 9090, &["mesh", "thermal"])
            .unwrap();
        assert_eq!(report.topics, vec![MESH_TOPIC.to_string()]);
        assert_eq!(report.unknown_aliases, vec!["thermal".to_string()]);

        assert_eq!(sensor.state(), ConnectionState::Connected);
        assert_eq!(sensor.sensor_name(), "Front");
        assert_eq!(sensor.unique_id(), Some("7"));
        assert_eq!(sensor.active_topics(), vec![MESH_TOPIC.to_string()]);
        assert_eq!(sensor.message_type(MESH_TOPIC), Some("voxblox_msgs/Mesh"));
        assert_eq!(
            handle.control_frames(),
            vec![ControlFrame::subscribe(MESH_TOPIC, Some("voxblox_msgs/Mesh"))]
        );

        assert!(matches!(
            sensor.initialize("7", "10.0.0.5", 9090, &["mesh"]),
            Err(SensorError::AlreadyInitialized)
        ));
    }

    #[test]
    fn test_messages_decoded_in_order() {
        let (connector, handle) = loopback();
        let mut sensor = sensor(connector);
        sensor.initialize("1", "localhost", 9090, &["mesh"]).unwrap();

        for x in 0..5 {
            handle.publish(MESH_TOPIC, &removal(x));
        }

        let deltas = poll_until(&mut sensor, 5);
        let keys: Vec<BlockKey> = deltas
            .iter()
            .flat_map(|delta| delta.removed.iter().copied())
            .collect();
        assert_eq!(keys, (0..5).map(|x| BlockKey::new(x, 0, 0)).collect::<Vec<_>>());
        assert_eq!(
            deltas.iter().map(|d| d.sequence).collect::<Vec<_>>(),
            vec![0, 1, 2, 3, 4]
        );
        assert_eq!(sensor.stats().messages_decoded, 5);
    }

    #[test]
    fn test_drain_into_mesh_map() {
        let (connector, handle) = loopback();
        let mut sensor = sensor(connector);
        sensor.initialize("1", "localhost", 9090, &["mesh"]).unwrap();

        handle.publish(
            MESH_TOPIC,
            &json!({
                "block_edge_length": 1.0,
                "mesh_blocks": [{"index": [0, 0, 0], "x": [0, 0, 0], "y": [0, 100, 0], "z": [0, 0, 100]}]
            }),
        );

        let mut map = MeshMap::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while map.deltas_applied() == 0 && Instant::now() < deadline {
            sensor.pump_events();
            sensor.drain_into(&mut map);
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(map.block_count(), 1);
        assert_eq!(map.triangle_count(), 1);
    }

    #[test]
    fn test_subscribe_requires_initialize() {
        let (connector, _handle) = loopback();
        let mut sensor = sensor(connector);
        assert!(matches!(
            sensor.subscribe(MESH_TOPIC),
            Err(SensorError::NotInitialized)
        ));
        assert!(sensor.poll_decoded().is_empty());
    }

    #[test]
    fn test_unsubscribe_and_resubscribe() {
        let (connector, handle) = loopback();
        let mut sensor = sensor(connector);
        sensor.initialize("1", "localhost", 9090, &["mesh"]).unwrap();

        sensor.unsubscribe(MESH_TOPIC).unwrap();
        assert!(sensor.active_topics().is_empty());
        assert_eq!(sensor.subscribers().get(MESH_TOPIC), Some(&false));
        assert!(matches!(
            sensor.unsubscribe(MESH_TOPIC),
            Err(SensorError::Subscription(SubscriptionError::Redundant { .. }))
        ));

        sensor.subscribe(MESH_TOPIC).unwrap();
        assert_eq!(handle.control_frames().len(), 3);
        assert!(matches!(
            sensor.subscribe("/unknown"),
            Err(SensorError::Subscription(SubscriptionError::UnknownTopic(_)))
        ));
    }

    #[test]
    fn test_failed_connect_then_shutdown() {
        let (connector, handle) = loopback();
        handle.refuse_connections(true);

        let mut sensor = sensor(connector);
        assert!(matches!(
            sensor.initialize("1", "localhost", 9090, &["mesh"]),
            Err(SensorError::Connection(_))
        ));
        assert_eq!(sensor.state(), ConnectionState::Faulted);
        assert!(sensor.active_topics().is_empty());
        assert_eq!(sensor.subscribers().get(MESH_TOPIC), Some(&false));
        assert!(handle.control_frames().is_empty());

        sensor.shutdown();
        sensor.shutdown();
        assert_eq!(sensor.state(), ConnectionState::Faulted);
        assert!(sensor.is_shut_down());
        assert!(matches!(
            sensor.initialize("1", "localhost", 9090, &["mesh"]),
            Err(SensorError::ShutDown)
        ));
    }

    #[test]
    fn test_link_failure_clears_active_topics() {
        let (connector, handle) = loopback();
        let mut sensor = sensor(connector);
        sensor.initialize("1", "localhost", 9090, &["mesh"]).unwrap();
        assert_eq!(sensor.active_topics(), vec![MESH_TOPIC.to_string()]);

        handle.fail("socket reset");
        sensor.pump_events();
        assert_eq!(sensor.state(), ConnectionState::Faulted);
        assert!(sensor.active_topics().is_empty());

        assert!(matches!(
            sensor.subscribe(MESH_TOPIC),
            Err(SensorError::Subscription(SubscriptionError::Connection(
                ConnectionError::Faulted
            )))
        ));
        assert!(sensor.active_topics().is_empty());
    }

    #[test]
    fn test_shutdown_is_bounded_and_final() {
        let (connector, handle) = loopback();
        let mut sensor = sensor(connector);
        sensor.initialize("1", "localhost", 9090, &["mesh"]).unwrap();

        handle.publish(MESH_TOPIC, &removal(0));
        sensor.pump_events();

        let start = Instant::now();
        sensor.shutdown();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(sensor.state(), ConnectionState::Disconnected);
        assert!(handle.is_closed());

        handle.publish(MESH_TOPIC, &removal(1));
        assert_eq!(sensor.pump_events(), 0);
        assert!(sensor.poll_decoded().is_empty());
        assert!(matches!(
            sensor.subscribe(MESH_TOPIC),
            Err(SensorError::ShutDown)
        ));
    }

    #[test]
    fn test_bounded_queue_accounts_for_every_message() {
        let (connector, handle) = loopback();
        let config = WorkerConfig {
            inbound_capacity: Some(2),
            ..Default::default()
        };
        let mut sensor = SensorConnection::new(connector, config);
        sensor.initialize("1", "localhost", 9090, &["mesh"]).unwrap();

        for x in 0..50 {
            handle.publish(MESH_TOPIC, &removal(x));
        }
        assert_eq!(sensor.pump_events(), 50);

        let stats = sensor.stats();
        assert_eq!(stats.messages_queued + stats.messages_dropped, 50);

        let deltas = poll_until(&mut sensor, stats.messages_queued as usize);
        assert_eq!(deltas.len() as u64, stats.messages_queued);
        assert!(deltas.windows(2).all(|w| w[0].sequence < w[1].sequence));
    }

    #[test]
    fn test_pose_setters() {
        let (connector, _handle) = loopback();
        let mut sensor = sensor(connector);
        assert_eq!(sensor.pose(), SensorPose::default());

        sensor.set_local_position([1.98, 0.0, -6.65]);
        sensor.set_local_orientation([0.0, 0.5, 0.0, 0.866]);
        sensor.set_local_scale([2.0, 2.0, 2.0]);

        let pose = sensor.pose();
        assert_eq!(pose.position, [1.98, 0.0, -6.65]);
        assert_eq!(pose.orientation, [0.0, 0.5, 0.0, 0.866]);
        assert_eq!(pose.scale, [2.0, 2.0, 2.0]);
    }

    #[test]
    fn test_with_config() {
        let (connector, _handle) = loopback();
        let config = SensorConfig {
            name: "Rear".to_string(),
            pose: SensorPose {
                position: [0.0, 1.0, 0.0],
                ..Default::default()
            },
            ..Default::default()
        };

        let sensor = SensorConnection::with_config(connector, &config);
        assert_eq!(sensor.sensor_name(), "Rear");
        assert_eq!(sensor.pose().position, [0.0, 1.0, 0.0]);
        assert_eq!(sensor.state(), ConnectionState::Disconnected);
    }
}
