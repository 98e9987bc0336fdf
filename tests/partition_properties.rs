use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;
use voxlmm::partition::{VoxelPartitioner, voxels_per_group};
use voxlmm::types::{Contrast, ContrastPlan};

#[test]
fn every_group_splits_into_disjoint_ring_and_inner_subsets() {
    let mut rng = StdRng::seed_from_u64(99);
    let n = 30;
    let n_voxels = 5_000;
    let mask: Vec<bool> = (0..n_voxels).map(|_| rng.r#gen::<f64>() < 0.6).collect();
    let n_sv: Vec<usize> = (0..n_voxels).map(|_| rng.gen_range(n - 5..=n)).collect();
    let partitioner = VoxelPartitioner::new(&mask, n_sv.clone(), n).unwrap();

    let q = 20;
    let budget = 10 * 8 * (q * q) as u64 * 97;
    let mut covered = BTreeSet::new();
    for block in 0..3 {
        let voxels = partitioner.mask_index().block(block, 3).unwrap();
        for group in partitioner.groups(&voxels, budget, q) {
            assert!(group.voxels.len() <= 97);
            let split = partitioner.split(&group);
            let ring: BTreeSet<usize> = split.ring.volume_indices().into_iter().collect();
            let inner: BTreeSet<usize> = split.inner.volume_indices().into_iter().collect();
            let all: BTreeSet<usize> = group.voxels.iter().map(|voxel| voxel.volume).collect();

            assert!(ring.is_disjoint(&inner));
            assert_eq!(ring.union(&inner).copied().collect::<BTreeSet<_>>(), all);
            assert!(ring.iter().all(|&voxel| n_sv[voxel] < n));
            assert!(inner.iter().all(|&voxel| n_sv[voxel] == n));
            assert_eq!(split.ring_counts.len(), ring.len());
            for (voxel, count) in split.ring.iter().zip(&split.ring_counts) {
                assert_eq!(n_sv[voxel.volume], *count);
                assert_eq!(partitioner.mask_index().rank_of(voxel.volume), Some(voxel.mask_rank));
            }
            covered.extend(all);
        }
    }
    let masked: BTreeSet<usize> = (0..n_voxels).filter(|&voxel| mask[voxel]).collect();
    assert_eq!(covered, masked);
}

#[test]
fn large_random_effects_bound_the_group_size() {
    let q = 50;
    let budget = (10 * 8 * q * q * 250) as u64;
    assert_eq!(voxels_per_group(budget, q), 250);

    let mask = vec![true; 1000];
    let partitioner = VoxelPartitioner::new(&mask, vec![10; 1000], 10).unwrap();
    let voxels = partitioner.mask_index().voxels();
    let groups = partitioner.groups(&voxels, budget, q);
    assert_eq!(groups.len(), 4);
    let total: usize = groups.iter().map(|group| group.voxels.len()).sum();
    assert_eq!(total, 1000);
    assert!(groups.iter().all(|group| group.voxels.len() == 250));
}

#[test]
fn frames_follow_declaration_order_within_each_type() {
    let names = ["a", "b", "c", "d", "e", "f"];
    let rows = [1, 3, 1, 2, 1, 4];
    let contrasts = names
        .iter()
        .zip(rows)
        .map(|(name, r)| {
            let matrix = ndarray::Array2::from_shape_fn((r, 4), |(i, j)| if i == j { 1.0 } else { 0.0 });
            Contrast::from_matrix(*name, matrix)
        })
        .collect();
    let plan = ContrastPlan::new(contrasts);
    assert_eq!((plan.n_t(), plan.n_f()), (3, 3));
    let frames: Vec<(&str, usize)> = plan
        .slots()
        .iter()
        .map(|slot| (slot.contrast.name(), slot.frame))
        .collect();
    assert_eq!(
        frames,
        vec![("a", 0), ("b", 0), ("c", 1), ("d", 1), ("e", 2), ("f", 2)]
    );
}
