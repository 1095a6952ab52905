//! Shared types for sensor messages and decoded mesh geometry

use crate::codec::DecodeError;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

/// Integer coordinate of a spatial mesh block
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockKey {
    pub x: i64,
    pub y: i64,
    pub z: i64,
}

impl BlockKey {
    pub fn new(x: i64, y: i64, z: i64) -> Self {
        Self { x, y, z }
    }

    pub fn as_array(&self) -> [i64; 3] {
        [self.x, self.y, self.z]
    }
}

impl From<[i64; 3]> for BlockKey {
    fn from([x, y, z]: [i64; 3]) -> Self {
        Self { x, y, z }
    }
}

impl std::fmt::Display for BlockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// Geometry of one mesh block
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeshBlock {
    /// Vertex positions in sensor space
    pub positions: Vec<[f32; 3]>,
    /// Triangle list indices into `positions`
    pub indices: Vec<u32>,
    /// Optional per-vertex RGB colors
    pub colors: Option<Vec<[u8; 3]>>,
}

impl MeshBlock {
    /// Get the number of vertices in the block
    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    /// Get the number of triangles in the block
    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    pub fn has_colors(&self) -> bool {
        self.colors.is_some()
    }

    /// Validate the block data consistency
    pub fn validate(&self) -> Result<(), DecodeError> {
        if self.indices.len() % 3 != 0 {
            return Err(DecodeError::IndexStride {
                len: self.indices.len(),
            });
        }

        if let Some(&max_index) = self.indices.iter().max() {
            if max_index as usize >= self.vertex_count() {
                return Err(DecodeError::IndexOutOfRange {
                    index: max_index,
                    vertex_count: self.vertex_count(),
                });
            }
        }

        if let Some(colors) = &self.colors {
            if colors.len() != self.vertex_count() {
                return Err(DecodeError::ColorLength {
                    expected: self.vertex_count(),
                    received: colors.len(),
                });
            }
        }

        Ok(())
    }
}

/// How a block change affects a consumer's mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockAction {
    Add,
    Update,
    Remove,
}

/// A mesh block that failed validation while decoding a delta
#[derive(Debug, Clone, PartialEq)]
pub struct BlockRejection {
    /// Position of the block inside the wire message
    pub position: usize,
    /// Block key, when the key itself was readable
    pub key: Option<BlockKey>,
    pub error: DecodeError,
}

/// Sparse update of mesh blocks decoded from one sensor message
#[derive(Debug, Clone, Default)]
pub struct MeshDelta {
    /// Topic the message arrived on
    pub topic: String,
    /// Arrival sequence number assigned when the message was queued
    pub sequence: u64,
    /// Edge length of a block in meters
    pub block_edge_length: f32,
    /// Blocks to add or replace
    pub blocks: BTreeMap<BlockKey, MeshBlock>,
    /// Blocks to remove
    pub removed: BTreeSet<BlockKey>,
    /// Blocks excluded from this delta because they were malformed
    pub rejected: Vec<BlockRejection>,
}

impl MeshDelta {
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty() && self.removed.is_empty()
    }

    pub fn vertex_count(&self) -> usize {
        self.blocks.values().map(MeshBlock::vertex_count).sum()
    }

    pub fn triangle_count(&self) -> usize {
        self.blocks.values().map(MeshBlock::triangle_count).sum()
    }
}

/// Un-decoded message body received on a topic
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub topic: String,
    pub sequence: u64,
    pub received_at: Instant,
    /// The `msg` object of the publish frame, kept as unparsed JSON
    pub payload: Box<RawValue>,
}

impl RawMessage {
    pub fn new(topic: impl Into<String>, sequence: u64, payload: Box<RawValue>) -> Self {
        Self {
            topic: topic.into(),
            sequence,
            received_at: Instant::now(),
            payload,
        }
    }
}

/// Local placement of a sensor relative to its parent frame
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorPose {
    pub position: [f32; 3],
    /// Quaternion as (x, y, z, w)
    pub orientation: [f32; 4],
    pub scale: [f32; 3],
}

impl Default for SensorPose {
    fn default() -> Self {
        Self {
            position: [0.0, 0.0, 0.0],
            orientation: [0.0, 0.0, 0.0, 1.0],
            scale: [1.0, 1.0, 1.0],
        }
    }
}
