//! # Voxel partitioning
//!
//! Splits the analysis volume into the pieces the rest of the engine works on:
//!
//! 1.  Mask index: the ascending list of analysis-mask voxels. A voxel's
//!     position in this list (its mask rank) is the row it occupies in every
//!     intermediate product store.
//! 2.  Blocks: contiguous, near-equal slices of the mask index handed to
//!     independent process invocations.
//! 3.  Groups: contiguous slices of a block small enough that one group's
//!     working set fits in the memory budget.
//! 4.  Ring and inner split: within a group, voxels observed in every study
//!     (inner) share a single design, while voxels with missing studies (ring)
//!     each carry their own.

use crate::types::{VoxelRef, VoxelSubset};
use thiserror::Error;

/// Number of q×q sized buffers kept live per voxel while a group is processed.
const LIVE_MATRICES_PER_VOXEL: u64 = 10;
const BYTES_PER_VALUE: u64 = 8;

#[derive(Debug, Error)]
pub enum PartitionError {
    #[error("{what} covers {found} voxels but the analysis mask covers {expected}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("voxel block {block} is out of range for {n_blocks} blocks")]
    IndexOutOfRange { block: usize, n_blocks: usize },
}

/// Ascending full-volume indices of the analysis-mask voxels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaskIndex {
    volume_indices: Vec<usize>,
}

impl MaskIndex {
    pub fn from_mask(mask: &[bool]) -> Self {
        let volume_indices = mask
            .iter()
            .enumerate()
            .filter_map(|(index, &inside)| inside.then_some(index))
            .collect();
        Self { volume_indices }
    }

    pub fn len(&self) -> usize {
        self.volume_indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.volume_indices.is_empty()
    }

    pub fn volume_indices(&self) -> &[usize] {
        &self.volume_indices
    }

    /// Mask rank of a full-volume index, if the voxel is in the mask.
    pub fn rank_of(&self, volume: usize) -> Option<usize> {
        self.volume_indices.binary_search(&volume).ok()
    }

    /// Every mask voxel, paired with its rank.
    pub fn voxels(&self) -> Vec<VoxelRef> {
        self.volume_indices
            .iter()
            .enumerate()
            .map(|(mask_rank, &volume)| VoxelRef { volume, mask_rank })
            .collect()
    }

    /// Block `block` (0-based) of `n_blocks` near-equal contiguous blocks.
    pub fn block(&self, block: usize, n_blocks: usize) -> Result<Vec<VoxelRef>, PartitionError> {
        if n_blocks == 0 || block >= n_blocks {
            return Err(PartitionError::IndexOutOfRange { block, n_blocks });
        }
        let voxels = self.voxels();
        Ok(array_split(&voxels, n_blocks)[block].to_vec())
    }
}

/// Splits `items` into `parts` contiguous chunks whose lengths differ by at most
/// one; the first `len % parts` chunks take the extra element.
pub fn array_split<T>(items: &[T], parts: usize) -> Vec<&[T]> {
    if parts == 0 {
        return Vec::new();
    }
    let base = items.len() / parts;
    let extra = items.len() % parts;
    let mut chunks = Vec::with_capacity(parts);
    let mut start = 0;
    for part in 0..parts {
        let len = base + usize::from(part < extra);
        chunks.push(&items[start..start + len]);
        start += len;
    }
    chunks
}

/// Voxels whose working set fits in `max_memory` bytes at once.
pub fn voxels_per_group(max_memory: u64, q: usize) -> usize {
    let q = q.max(1) as u64;
    let per_voxel = LIVE_MATRICES_PER_VOXEL * BYTES_PER_VALUE * q * q;
    usize::try_from(max_memory / per_voxel).unwrap_or(usize::MAX).max(1)
}

/// A memory-bounded batch of voxels from one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoxelGroup {
    pub index: usize,
    pub voxels: Vec<VoxelRef>,
}

/// The two subsets of a group.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupSplit {
    pub ring: VoxelSubset,
    pub inner: VoxelSubset,
    /// Observation count of each ring voxel, in ring order.
    pub ring_counts: Vec<usize>,
}

/// Computes blocks, groups and the ring/inner split for one analysis.
#[derive(Debug, Clone)]
pub struct VoxelPartitioner {
    mask_index: MaskIndex,
    n_sv: Vec<usize>,
    data_mask: Option<Vec<bool>>,
    n: usize,
}

impl VoxelPartitioner {
    /// `analysis_mask` and `n_sv` are full-volume maps; `n` is the number of
    /// observations in the complete design.
    pub fn new(analysis_mask: &[bool], n_sv: Vec<usize>, n: usize) -> Result<Self, PartitionError> {
        if n_sv.len() != analysis_mask.len() {
            return Err(PartitionError::ShapeMismatch {
                what: "the observation-count map",
                expected: analysis_mask.len(),
                found: n_sv.len(),
            });
        }
        Ok(Self {
            mask_index: MaskIndex::from_mask(analysis_mask),
            n_sv,
            data_mask: None,
            n,
        })
    }

    /// Restricts processing to voxels the upstream stage flagged as usable.
    pub fn with_data_mask(mut self, data_mask: Vec<bool>) -> Result<Self, PartitionError> {
        if data_mask.len() != self.n_sv.len() {
            return Err(PartitionError::ShapeMismatch {
                what: "the data mask",
                expected: self.n_sv.len(),
                found: data_mask.len(),
            });
        }
        self.data_mask = Some(data_mask);
        Ok(self)
    }

    pub fn mask_index(&self) -> &MaskIndex {
        &self.mask_index
    }

    /// Splits a block into groups that fit in `max_memory` bytes.
    pub fn groups(&self, block: &[VoxelRef], max_memory: u64, q: usize) -> Vec<VoxelGroup> {
        if block.is_empty() {
            return Vec::new();
        }
        let per_group = voxels_per_group(max_memory, q);
        let n_groups = block.len().div_ceil(per_group);
        array_split(block, n_groups)
            .into_iter()
            .enumerate()
            .map(|(index, voxels)| VoxelGroup {
                index,
                voxels: voxels.to_vec(),
            })
            .collect()
    }

    /// Ring voxels have between one and `n - 1` observations; inner voxels have
    /// exactly `n`. Voxels with no observations or more than `n` are skipped.
    pub fn split(&self, group: &VoxelGroup) -> GroupSplit {
        let mut ring = Vec::new();
        let mut ring_counts = Vec::new();
        let mut inner = Vec::new();
        for voxel in &group.voxels {
            let usable = self
                .data_mask
                .as_ref()
                .is_none_or(|mask| mask[voxel.volume]);
            if !usable {
                continue;
            }
            let count = self.n_sv[voxel.volume];
            if count == 0 {
                log::warn!("Voxel {} has no observations; skipping it", voxel.volume);
            } else if count < self.n {
                ring.push(*voxel);
                ring_counts.push((voxel.volume, count));
            } else if count == self.n {
                inner.push(*voxel);
            } else {
                log::warn!(
                    "Voxel {} reports {count} observations but the design only has {}; skipping it",
                    voxel.volume,
                    self.n
                );
            }
        }
        ring_counts.sort_by_key(|(volume, _)| *volume);
        GroupSplit {
            ring: VoxelSubset::new(ring),
            inner: VoxelSubset::new(inner),
            ring_counts: ring_counts.into_iter().map(|(_, count)| count).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn array_split_front_loads_remainder() {
        let items: Vec<usize> = (0..10).collect();
        let lengths: Vec<usize> = array_split(&items, 4).iter().map(|c| c.len()).collect();
        assert_eq!(lengths, vec![3, 3, 2, 2]);
    }

    #[test]
    fn blocks_cover_the_mask_without_overlap() {
        let mask: Vec<bool> = (0..50).map(|i| i % 3 != 0).collect();
        let index = MaskIndex::from_mask(&mask);
        let mut seen = Vec::new();
        for block in 0..4 {
            seen.extend(index.block(block, 4).unwrap());
        }
        assert_eq!(seen, index.voxels());
        assert!(matches!(
            index.block(4, 4),
            Err(PartitionError::IndexOutOfRange { block: 4, n_blocks: 4 })
        ));
    }

    #[test]
    fn mask_ranks_track_volume_indices() {
        let mask = vec![false, true, false, true, true];
        let index = MaskIndex::from_mask(&mask);
        assert_eq!(index.volume_indices(), &[1, 3, 4]);
        assert_eq!(index.rank_of(3), Some(1));
        assert_eq!(index.rank_of(2), None);
    }

    #[test]
    fn memory_budget_fixes_group_count() {
        let q = 50;
        let max_memory = 10 * 8 * (q as u64).pow(2) * 250;
        let mask = vec![true; 1000];
        let partitioner = VoxelPartitioner::new(&mask, vec![20; 1000], 20).unwrap();
        let block = partitioner.mask_index().voxels();
        let groups = partitioner.groups(&block, max_memory, q);
        assert_eq!(groups.len(), 4);
        let mut covered = HashSet::new();
        for group in &groups {
            assert_eq!(group.voxels.len(), 250);
            for voxel in &group.voxels {
                assert!(covered.insert(voxel.volume));
            }
        }
        assert_eq!(covered.len(), 1000);
    }

    #[test]
    fn tiny_budget_still_makes_progress() {
        assert_eq!(voxels_per_group(1, 100), 1);
    }

    #[test]
    fn ring_boundary_is_strict() {
        let mask = vec![true; 6];
        let n_sv = vec![10, 9, 10, 1, 11, 10];
        let partitioner = VoxelPartitioner::new(&mask, n_sv, 10).unwrap();
        let block = partitioner.mask_index().voxels();
        let group = &partitioner.groups(&block, u64::MAX, 1)[0];
        let split = partitioner.split(group);
        assert_eq!(split.inner.volume_indices(), vec![0, 2, 5]);
        assert_eq!(split.ring.volume_indices(), vec![1, 3]);
        assert_eq!(split.ring_counts, vec![9, 1]);
    }

    #[test]
    fn voxels_without_observations_are_skipped_without_a_data_mask() {
        let mask = vec![true; 5];
        let partitioner = VoxelPartitioner::new(&mask, vec![0, 4, 0, 2, 4], 4).unwrap();
        let block = partitioner.mask_index().voxels();
        let split = partitioner.split(&partitioner.groups(&block, u64::MAX, 1)[0]);
        assert_eq!(split.ring.volume_indices(), vec![3]);
        assert_eq!(split.ring_counts, vec![2]);
        assert_eq!(split.inner.volume_indices(), vec![1, 4]);
    }

    #[test]
    fn data_mask_excludes_unusable_voxels() {
        let mask = vec![true, true, true, false];
        let partitioner = VoxelPartitioner::new(&mask, vec![4, 3, 4, 4], 4)
            .unwrap()
            .with_data_mask(vec![true, false, true, true])
            .unwrap();
        let block = partitioner.mask_index().voxels();
        let split = partitioner.split(&partitioner.groups(&block, u64::MAX, 2)[0]);
        assert_eq!(split.inner.volume_indices(), vec![0, 2]);
        assert!(split.ring.is_empty());
        assert_eq!(split.inner.mask_ranks(), vec![0, 2]);
    }

    #[test]
    fn mismatched_maps_are_rejected() {
        let err = VoxelPartitioner::new(&[true, true], vec![1], 1).unwrap_err();
        assert!(matches!(
            err,
            PartitionError::ShapeMismatch { expected: 2, found: 1, .. }
        ));
    }
}
