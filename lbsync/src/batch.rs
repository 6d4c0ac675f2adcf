//! Batcher - splits target sets into provider-sized chunks.

use crate::clients::MutationOp;
use crate::diff::TargetDiff;
use crate::error::ChunkRef;
use crate::model::Target;

/// Maximum number of targets the provider accepts in one mutating call.
pub const DEFAULT_CHUNK_SIZE: usize = 20;

/// Split `items` into `ceil(len / limit)` chunks of at most `limit` items.
///
/// A zero limit is treated as one; configuration validation rejects it earlier.
pub fn chunk<T: Clone>(items: &[T], limit: usize) -> Vec<Vec<T>> {
    items.chunks(limit.max(1)).map(<[T]>::to_vec).collect()
}

/// One chunk of a reconciliation plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedChunk {
    pub op: MutationOp,
    /// Position of the chunk within its operation, starting at 0.
    pub index: usize,
    pub targets: Vec<Target>,
}

impl PlannedChunk {
    pub fn to_ref(&self) -> ChunkRef {
        ChunkRef {
            op: self.op,
            index: self.index,
            targets: self.targets.iter().map(Target::key).collect(),
        }
    }
}

/// Order a diff into dispatchable chunks: removals, then additions, then
/// weight updates.
pub fn plan(diff: &TargetDiff, limit: usize) -> Vec<PlannedChunk> {
    [
        (MutationOp::Remove, &diff.remove),
        (MutationOp::Add, &diff.add),
        (MutationOp::UpdateWeight, &diff.update),
    ]
    .into_iter()
    .flat_map(|(op, targets)| {
        chunk(targets, limit)
            .into_iter()
            .enumerate()
            .map(move |(index, targets)| PlannedChunk { op, index, targets })
    })
    .collect()
}
