//! ROS bridge sensor connection with background mesh decoding
//!
//! This crate connects to a ROS bridge over a websocket, subscribes to the
//! topics behind a sensor's subscriber aliases and turns voxblox mesh
//! messages into sparse [`MeshDelta`] updates on a background thread. The
//! owning thread drives everything through non-blocking calls:
//!
//! ```no_run
//! use ros_sensor_link::{MeshMap, SensorConnection, SensorConfig};
//!
//! let config = SensorConfig::default();
//! let mut sensor = SensorConnection::from_config(&config);
//! sensor.initialize("1", "localhost", 9090, &["mesh"])?;
//!
//! let mut map = MeshMap::new();
//! loop {
//!     sensor.pump_events();
//!     sensor.drain_into(&mut map);
//! #   break;
//! }
//! # Ok::<(), ros_sensor_link::SensorError>(())
//! ```

pub mod codec;
pub mod config;
pub mod connection;
pub mod loopback;
pub mod mesh_map;
pub mod protocol;
pub mod registry;
pub mod transport;
pub mod types;
pub mod websocket;
pub mod worker;

// Re-export commonly used types
pub use codec::DecodeError;
pub use config::{ConfigError, SensorConfig};
pub use connection::{InitReport, SensorConnection, SensorError};
pub use mesh_map::{MeshMap, MeshSink};
pub use protocol::{ControlFrame, Protocol, ProtocolError};
pub use registry::{SubscriptionError, TopicRegistry};
pub use transport::{ConnectionError, ConnectionState, Connector, FrameLink, RosBridgeTransport};
pub use types::{BlockAction, BlockKey, MeshBlock, MeshDelta, RawMessage, SensorPose};
pub use websocket::{TransportConfig, WebSocketConnector};
pub use worker::{WorkerConfig, WorkerStats};

/// Result type for sensor operations
pub type Result<T> = std::result::Result<T, SensorError>;
