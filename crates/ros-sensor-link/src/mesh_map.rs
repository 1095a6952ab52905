//! Consumer-side mesh accumulation

use crate::types::{BlockAction, BlockKey, MeshBlock, MeshDelta};
use std::collections::HashMap;
use tracing::{debug, trace};

/// Something that consumes decoded mesh deltas
pub trait MeshSink {
    fn apply_delta(&mut self, delta: MeshDelta);
}

impl MeshSink for Vec<MeshDelta> {
    fn apply_delta(&mut self, delta: MeshDelta) {
        self.push(delta);
    }
}

/// The current set of mesh blocks built up from applied deltas
#[derive(Debug, Default)]
pub struct MeshMap {
    blocks: HashMap<BlockKey, MeshBlock>,
    block_edge_length: Option<f32>,
    deltas_applied: u64,
    last_sequence: Option<u64>,
}

impl MeshMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a delta and report what happened to each block it touched.
    ///
    /// Removing a block that is not present is not reported.
    pub fn apply(&mut self, delta: MeshDelta) -> Vec<(BlockKey, BlockAction)> {
        let mut actions = Vec::with_capacity(delta.blocks.len() + delta.removed.len());

        for key in delta.removed {
            if self.blocks.remove(&key).is_some() {
                trace!("Removed block {}", key);
                actions.push((key, BlockAction::Remove));
            }
        }

        for (key, block) in delta.blocks {
            let action = if self.blocks.insert(key, block).is_some() {
                BlockAction::Update
            } else {
                BlockAction::Add
            };
            trace!("{:?} block {}", action, key);
            actions.push((key, action));
        }

        self.block_edge_length = Some(delta.block_edge_length);
        self.deltas_applied += 1;
        self.last_sequence = Some(delta.sequence);

        debug!(
            "Applied delta {}: {} block changes, {} blocks total",
            delta.sequence,
            actions.len(),
            self.blocks.len()
        );
        actions
    }

    pub fn get(&self, key: &BlockKey) -> Option<&MeshBlock> {
        self.blocks.get(key)
    }

    pub fn contains(&self, key: &BlockKey) -> bool {
        self.blocks.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &BlockKey> {
        self.blocks.keys()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn vertex_count(&self) -> usize {
        self.blocks.values().map(MeshBlock::vertex_count).sum()
    }

    pub fn triangle_count(&self) -> usize {
        self.blocks.values().map(MeshBlock::triangle_count).sum()
    }

    /// Edge length reported by the most recent delta
    pub fn block_edge_length(&self) -> Option<f32> {
        self.block_edge_length
    }

    pub fn deltas_applied(&self) -> u64 {
        self.deltas_applied
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.last_sequence
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
    }
}

impl MeshSink for MeshMap {
    fn apply_delta(&mut self, delta: MeshDelta) {
        self.apply(delta);
    }
}
