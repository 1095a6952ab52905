//! Mesh delta codec for voxblox `Mesh` messages
//!
//! A message carries a list of mesh blocks. Each block is keyed by an integer
//! block index and stores its vertices compressed to `u16` offsets inside the
//! block, laid out in triangle order (every three vertices form a face).
//! Blocks with no vertices tell the consumer to drop that block.
//!
//! Blocks are decoded independently: a malformed block is reported in
//! [`MeshDelta::rejected`] and the remaining blocks are still returned.

use crate::types::{BlockKey, BlockRejection, MeshBlock, MeshDelta, RawMessage};
use serde::Deserialize;
use serde_json::value::RawValue;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, trace};

/// Scale from a compressed `u16` coordinate to block units
pub const POINT_CONV_FACTOR: f32 = 2.0 / u16::MAX as f32;

/// Number of vertices per triangle in the wire layout
pub const VERTICES_PER_TRIANGLE: usize = 3;

/// Errors produced while decoding a mesh message or one of its blocks
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("Malformed message: {0}")]
    Json(String),

    #[error("Invalid block edge length: {0}")]
    InvalidEdgeLength(f32),

    #[error("Malformed block: {0}")]
    InvalidBlock(String),

    #[error("Block index must have 3 components, got {0}")]
    IndexArity(usize),

    #[error("Coordinate arrays differ in length: x={x}, y={y}, z={z}")]
    AxisLengthMismatch { x: usize, y: usize, z: usize },

    #[error("Vertex count {len} is not divisible by 3")]
    VertexStride { len: usize },

    #[error("Index count {len} is not divisible by 3")]
    IndexStride { len: usize },

    #[error("Index {index} exceeds vertex count {vertex_count}")]
    IndexOutOfRange { index: u32, vertex_count: usize },

    #[error("Color count {received} doesn't match vertex count {expected}")]
    ColorLength { expected: usize, received: usize },

    #[error("Color channels must be all present or all absent")]
    PartialColors,
}

#[derive(Deserialize)]
struct WireMesh<'a> {
    block_edge_length: f32,
    #[serde(borrow)]
    mesh_blocks: Vec<&'a RawValue>,
}

#[derive(Deserialize)]
struct WireBlock {
    index: Vec<i64>,
    #[serde(default)]
    x: Vec<u16>,
    #[serde(default)]
    y: Vec<u16>,
    #[serde(default)]
    z: Vec<u16>,
    #[serde(default)]
    r: Option<Vec<u8>>,
    #[serde(default)]
    g: Option<Vec<u8>>,
    #[serde(default)]
    b: Option<Vec<u8>>,
}

/// Only the key of a block, used to label rejected blocks
#[derive(Deserialize)]
struct WireBlockKey {
    index: Vec<i64>,
}

/// Outcome of decoding one wire block
#[derive(Debug, PartialEq)]
enum DecodedBlock {
    Upsert(BlockKey, MeshBlock),
    Remove(BlockKey),
}

/// Decode a queued raw message into a mesh delta
pub fn decode(raw: &RawMessage) -> Result<MeshDelta, DecodeError> {
    decode_payload(&raw.topic, raw.sequence, raw.payload.get())
}

/// Decode the JSON body of a mesh message
pub fn decode_payload(
    topic: &str,
    sequence: u64,
    payload: &str,
) -> Result<MeshDelta, DecodeError> {
    trace!("Decoding mesh message from {} bytes", payload.len());

    let wire: WireMesh<'_> =
        serde_json::from_str(payload).map_err(|e| DecodeError::Json(e.to_string()))?;

    if !wire.block_edge_length.is_finite() || wire.block_edge_length <= 0.0 {
        return Err(DecodeError::InvalidEdgeLength(wire.block_edge_length));
    }

    let mut delta = MeshDelta {
        topic: topic.to_string(),
        sequence,
        block_edge_length: wire.block_edge_length,
        ..Default::default()
    };

    for (position, raw_block) in wire.mesh_blocks.iter().enumerate() {
        match decode_block(raw_block.get(), wire.block_edge_length) {
            Ok(DecodedBlock::Upsert(key, block)) => {
                delta.removed.remove(&key);
                delta.blocks.insert(key, block);
            }
            Ok(DecodedBlock::Remove(key)) => {
                delta.blocks.remove(&key);
                delta.removed.insert(key);
            }
            Err(error) => {
                let key = serde_json::from_str::<WireBlockKey>(raw_block.get())
                    .ok()
                    .and_then(|probe| block_key(&probe.index).ok());
                debug!("Rejected mesh block {} ({:?}): {}", position, key, error);
                delta.rejected.push(BlockRejection {
                    position,
                    key,
                    error,
                });
            }
        }
    }

    debug!(
        "Decoded mesh message {} on {}: {} blocks, {} removed, {} rejected",
        sequence,
        topic,
        delta.blocks.len(),
        delta.removed.len(),
        delta.rejected.len()
    );

    Ok(delta)
}

fn block_key(index: &[i64]) -> Result<BlockKey, DecodeError> {
    match *index {
        [x, y, z] => Ok(BlockKey::new(x, y, z)),
        _ => Err(DecodeError::IndexArity(index.len())),
    }
}

fn decode_block(raw: &str, edge_length: f32) -> Result<DecodedBlock, DecodeError> {
    let wire: WireBlock =
        serde_json::from_str(raw).map_err(|e| DecodeError::InvalidBlock(e.to_string()))?;
    let key = block_key(&wire.index)?;

    let (nx, ny, nz) = (wire.x.len(), wire.y.len(), wire.z.len());
    if nx != ny || ny != nz {
        return Err(DecodeError::AxisLengthMismatch {
            x: nx,
            y: ny,
            z: nz,
        });
    }

    if nx == 0 {
        return Ok(DecodedBlock::Remove(key));
    }

    if nx % VERTICES_PER_TRIANGLE != 0 {
        return Err(DecodeError::VertexStride { len: nx });
    }

    let colors = match (wire.r, wire.g, wire.b) {
        (None, None, None) => None,
        (Some(r), Some(g), Some(b)) => {
            if r.len() != nx || g.len() != nx || b.len() != nx {
                let received = if r.len() != nx {
                    r.len()
                } else if g.len() != nx {
                    g.len()
                } else {
                    b.len()
                };
                return Err(DecodeError::ColorLength {
                    expected: nx,
                    received,
                });
            }
            Some(
                r.iter()
                    .zip(&g)
                    .zip(&b)
                    .map(|((&r, &g), &b)| [r, g, b])
                    .collect(),
            )
        }
        _ => return Err(DecodeError::PartialColors),
    };

    let origin = [key.x as f32, key.y as f32, key.z as f32];
    let positions = (0..nx)
        .map(|i| {
            [
                (wire.x[i] as f32 * POINT_CONV_FACTOR + origin[0]) * edge_length,
                (wire.y[i] as f32 * POINT_CONV_FACTOR + origin[1]) * edge_length,
                (wire.z[i] as f32 * POINT_CONV_FACTOR + origin[2]) * edge_length,
            ]
        })
        .collect();

    let block = MeshBlock {
        positions,
        indices: (0..nx as u32).collect(),
        colors,
    };
    // Axis, stride and color lengths were checked on the wire arrays above
    debug_assert!(block.validate().is_ok());

    Ok(DecodedBlock::Upsert(key, block))
}

/// Compress one coordinate into the block-relative `u16` representation
fn compress(value: f32, block_origin: i64, edge_length: f32) -> u16 {
    let offset = (value / edge_length - block_origin as f32) / POINT_CONV_FACTOR;
    offset.round().clamp(0.0, u16::MAX as f32) as u16
}

/// Encode a block as a wire block object
///
/// Vertices are emitted in index order, so indexed blocks are expanded into
/// the triangle-ordered wire layout. Positions outside the block's
/// representable range are clamped.
pub fn encode_block(key: BlockKey, block: &MeshBlock, edge_length: f32) -> Value {
    let mut x = Vec::with_capacity(block.indices.len());
    let mut y = Vec::with_capacity(block.indices.len());
    let mut z = Vec::with_capacity(block.indices.len());
    let mut rgb: Option<(Vec<u8>, Vec<u8>, Vec<u8>)> =
        block.colors.as_ref().map(|_| Default::default());

    for &index in &block.indices {
        let Some(p) = block.positions.get(index as usize) else {
            continue;
        };
        x.push(compress(p[0], key.x, edge_length));
        y.push(compress(p[1], key.y, edge_length));
        z.push(compress(p[2], key.z, edge_length));

        if let (Some((r, g, b)), Some(colors)) = (rgb.as_mut(), block.colors.as_ref()) {
            let c = colors.get(index as usize).copied().unwrap_or([0, 0, 0]);
            r.push(c[0]);
            g.push(c[1]);
            b.push(c[2]);
        }
    }

    let mut wire = json!({
        "index": key.as_array(),
        "x": x,
        "y": y,
        "z": z,
    });
    if let (Some((r, g, b)), Some(object)) = (rgb, wire.as_object_mut()) {
        object.insert("r".to_string(), json!(r));
        object.insert("g".to_string(), json!(g));
        object.insert("b".to_string(), json!(b));
    }
    wire
}

/// Encode a block removal as a wire block object
pub fn encode_removal(key: BlockKey) -> Value {
    json!({
        "index": key.as_array(),
        "x": [],
        "y": [],
        "z": [],
    })
}

/// Encode a delta as a voxblox mesh message body
pub fn encode_delta(delta: &MeshDelta) -> Value {
    let mut mesh_blocks: Vec<Value> = delta
        .blocks
        .iter()
        .map(|(&key, block)| encode_block(key, block, delta.block_edge_length))
        .collect();
    mesh_blocks.extend(delta.removed.iter().map(|&key| encode_removal(key)));

    json!({
        "block_edge_length": delta.block_edge_length,
        "mesh_blocks": mesh_blocks,
    })
}
