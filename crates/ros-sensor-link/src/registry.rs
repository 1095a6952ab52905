//! Topic subscription registry
//!
//! Maps human-readable subscriber aliases to wire topics and tracks which
//! topics are currently subscribed. Topics stay in the registry once seen;
//! subscribing and unsubscribing only flip their active flag.

use crate::transport::{ConnectionError, Connector, RosBridgeTransport, TopicHandler};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info, warn};

/// A concrete wire topic behind an alias
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopicSpec {
    pub topic: &'static str,
    pub msg_type: &'static str,
}

/// Aliases understood by [`TopicRegistry::configure`]
pub const ALIAS_TABLE: &[(&str, &[TopicSpec])] = &[(
    "mesh",
    &[TopicSpec {
        topic: "/voxblox_node/mesh",
        msg_type: "voxblox_msgs/Mesh",
    }],
)];

/// Look up the wire topics for an alias
pub fn resolve_alias(alias: &str) -> Result<&'static [TopicSpec], SubscriptionError> {
    ALIAS_TABLE
        .iter()
        .find(|(name, _)| *name == alias)
        .map(|(_, specs)| *specs)
        .ok_or_else(|| SubscriptionError::UnknownAlias(alias.to_string()))
}

fn activity(active: &bool) -> &'static str {
    if *active {
        "active"
    } else {
        "inactive"
    }
}

/// Errors reported by subscription operations
#[derive(Error, Debug)]
pub enum SubscriptionError {
    #[error("Subscriber not defined: {0}")]
    UnknownAlias(String),

    #[error("No such subscriber exists: {0}")]
    UnknownTopic(String),

    #[error("Subscriber {topic} is already {}", activity(.active))]
    Redundant { topic: String, active: bool },

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
}

impl SubscriptionError {
    /// Whether this only reports a request that changed nothing
    pub fn is_redundant(&self) -> bool {
        matches!(self, Self::Redundant { .. })
    }
}

/// Registry state for one topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicEntry {
    pub msg_type: String,
    pub active: bool,
}

/// Result of resolving a list of aliases
#[derive(Debug, Default)]
pub struct AliasResolution {
    /// Newly registered topics, in configuration order
    pub topics: Vec<String>,
    /// Aliases that could not be resolved
    pub errors: Vec<SubscriptionError>,
}

impl AliasResolution {
    pub fn unknown_aliases(&self) -> Vec<String> {
        self.errors
            .iter()
            .filter_map(|e| match e {
                SubscriptionError::UnknownAlias(alias) => Some(alias.clone()),
                _ => None,
            })
            .collect()
    }
}

/// Per-sensor table of topics and their subscription state
#[derive(Debug, Default)]
pub struct TopicRegistry {
    topics: BTreeMap<String, TopicEntry>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the topics behind each alias as inactive entries.
    ///
    /// Unknown aliases are logged and reported, never fatal.
    pub fn configure<S: AsRef<str>>(&mut self, aliases: &[S]) -> AliasResolution {
        let mut resolution = AliasResolution::default();

        for alias in aliases.iter().map(AsRef::as_ref) {
            let specs = match resolve_alias(alias) {
                Ok(specs) => specs,
                Err(e) => {
                    warn!("{}", e);
                    resolution.errors.push(e);
                    continue;
                }
            };

            for spec in specs {
                if self.topics.contains_key(spec.topic) {
                    debug!("Topic {} already configured", spec.topic);
                    continue;
                }
                info!("Registering topic {} for alias {}", spec.topic, alias);
                self.topics.insert(
                    spec.topic.to_string(),
                    TopicEntry {
                        msg_type: spec.msg_type.to_string(),
                        active: false,
                    },
                );
                resolution.topics.push(spec.topic.to_string());
            }
        }

        resolution
    }

    /// Activate a topic, subscribing on the transport if it was inactive
    pub fn subscribe<C: Connector>(
        &mut self,
        topic: &str,
        transport: &mut RosBridgeTransport<C>,
        handler: TopicHandler,
    ) -> Result<(), SubscriptionError> {
        let entry = self
            .topics
            .get_mut(topic)
            .ok_or_else(|| SubscriptionError::UnknownTopic(topic.to_string()))?;

        if entry.active {
            info!("Subscriber already registered: {}", topic);
            return Err(SubscriptionError::Redundant {
                topic: topic.to_string(),
                active: true,
            });
        }

        transport.add_subscriber(topic, Some(entry.msg_type.as_str()), handler)?;
        entry.active = true;
        info!("Subscribed to {}", topic);
        Ok(())
    }

    /// Deactivate a topic, unsubscribing on the transport if it was active
    pub fn unsubscribe<C: Connector>(
        &mut self,
        topic: &str,
        transport: &mut RosBridgeTransport<C>,
    ) -> Result<(), SubscriptionError> {
        let entry = self
            .topics
            .get_mut(topic)
            .ok_or_else(|| SubscriptionError::UnknownTopic(topic.to_string()))?;

        if !entry.active {
            info!("Subscriber already inactive: {}", topic);
            return Err(SubscriptionError::Redundant {
                topic: topic.to_string(),
                active: false,
            });
        }

        transport.remove_subscriber(topic)?;
        entry.active = false;
        info!("Unsubscribed from {}", topic);
        Ok(())
    }

    /// Mark every topic inactive without touching the transport.
    ///
    /// Used once the transport has faulted and no frame can be sent anymore.
    pub fn deactivate_all(&mut self) {
        for (topic, entry) in self.topics.iter_mut().filter(|(_, entry)| entry.active) {
            debug!("Deactivating {}", topic);
            entry.active = false;
        }
    }

    /// Active topics, sorted
    pub fn list_active(&self) -> Vec<String> {
        self.topics
            .iter()
            .filter(|(_, entry)| entry.active)
            .map(|(topic, _)| topic.clone())
            .collect()
    }

    /// Every known topic with its active flag
    pub fn subscribers(&self) -> BTreeMap<String, bool> {
        self.topics
            .iter()
            .map(|(topic, entry)| (topic.clone(), entry.active))
            .collect()
    }

    pub fn message_type(&self, topic: &str) -> Option<&str> {
        self.topics.get(topic).map(|entry| entry.msg_type.as_str())
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::loopback;
    use crate::protocol::ControlFrame;

    const MESH_TOPIC: &str = "/voxblox_node/mesh";

    fn noop_handler() -> TopicHandler {
        Box::new(|_, _| {})
    }

    #[test]
    fn test_resolve_alias() {
        let specs = resolve_alias("mesh").unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].topic, MESH_TOPIC);
        assert_eq!(specs[0].msg_type, "voxblox_msgs/Mesh");

        assert!(matches!(
            resolve_alias("lidar"),
            Err(SubscriptionError::UnknownAlias(alias)) if alias == "lidar"
        ));
    }

    #[test]
    fn test_configure_skips_unknown_aliases() {
        let mut registry = TopicRegistry::new();
        let resolution = registry.configure(&["lidar", "mesh", "mesh"]);

        assert_eq!(resolution.topics, vec![MESH_TOPIC.to_string()]);
        assert_eq!(resolution.unknown_aliases(), vec!["lidar".to_string()]);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.message_type(MESH_TOPIC), Some("voxblox_msgs/Mesh"));

        // Configured topics start inactive
        assert!(registry.list_active().is_empty());
        assert_eq!(registry.subscribers().get(MESH_TOPIC), Some(&false));
    }

    #[test]
    fn test_subscribe_twice_sends_one_frame() {
        let (connector, handle) = loopback();
        let mut transport = RosBridgeTransport::new(connector);
        transport.connect("localhost", 9090).unwrap();

        let mut registry = TopicRegistry::new();
        registry.configure(&["mesh"]);

        registry
            .subscribe(MESH_TOPIC, &mut transport, noop_handler())
            .unwrap();
        let second = registry.subscribe(MESH_TOPIC, &mut transport, noop_handler());
        assert!(second.unwrap_err().is_redundant());

        assert_eq!(
            handle.control_frames(),
            vec![ControlFrame::subscribe(MESH_TOPIC, Some("voxblox_msgs/Mesh"))]
        );
        assert_eq!(registry.list_active(), vec![MESH_TOPIC.to_string()]);
    }

    #[test]
    fn test_unsubscribe_and_resubscribe() {
        let (connector, handle) = loopback();
        let mut transport = RosBridgeTransport::new(connector);
        transport.connect("localhost", 9090).unwrap();

        let mut registry = TopicRegistry::new();
        registry.configure(&["mesh"]);

        // Inactive topics cannot be unsubscribed
        let err = registry.unsubscribe(MESH_TOPIC, &mut transport).unwrap_err();
        assert!(matches!(err, SubscriptionError::Redundant { active: false, .. }));
        assert_eq!(err.to_string(), format!("Subscriber {MESH_TOPIC} is already inactive"));

        registry
            .subscribe(MESH_TOPIC, &mut transport, noop_handler())
            .unwrap();
        registry.unsubscribe(MESH_TOPIC, &mut transport).unwrap();
        assert!(registry.list_active().is_empty());

        // The topic is kept, only flagged inactive
        assert_eq!(registry.subscribers().get(MESH_TOPIC), Some(&false));

        registry
            .subscribe(MESH_TOPIC, &mut transport, noop_handler())
            .unwrap();
        assert_eq!(
            handle.control_frames(),
            vec![
                ControlFrame::subscribe(MESH_TOPIC, Some("voxblox_msgs/Mesh")),
                ControlFrame::unsubscribe(MESH_TOPIC),
                ControlFrame::subscribe(MESH_TOPIC, Some("voxblox_msgs/Mesh")),
            ]
        );
    }

    #[test]
    fn test_unknown_topic() {
        let (connector, _handle) = loopback();
        let mut transport = RosBridgeTransport::new(connector);
        let mut registry = TopicRegistry::new();

        assert!(matches!(
            registry.subscribe("/other", &mut transport, noop_handler()),
            Err(SubscriptionError::UnknownTopic(_))
        ));
        assert!(matches!(
            registry.unsubscribe("/other", &mut transport),
            Err(SubscriptionError::UnknownTopic(_))
        ));
    }

    #[test]
    fn test_deactivate_all_after_fault() {
        let (connector, handle) = loopback();
        let mut transport = RosBridgeTransport::new(connector);
        transport.connect("localhost", 9090).unwrap();

        let mut registry = TopicRegistry::new();
        registry.configure(&["mesh"]);
        registry
            .subscribe(MESH_TOPIC, &mut transport, noop_handler())
            .unwrap();

        handle.fail("socket reset");
        transport.pump_events();
        registry.deactivate_all();
        assert!(registry.list_active().is_empty());
        assert_eq!(registry.subscribers().get(MESH_TOPIC), Some(&false));

        // A faulted transport cannot be subscribed through again
        assert!(matches!(
            registry.subscribe(MESH_TOPIC, &mut transport, noop_handler()),
            Err(SubscriptionError::Connection(ConnectionError::Faulted))
        ));
        assert!(registry.list_active().is_empty());
    }
}
