// ========================================================================================
//
//                    voxlmm estimation and inference path benchmark
//
// ========================================================================================
//
// Measures the per-subset cost of Fisher-scoring estimation followed by the full set of
// inference statistics, for shared (inner) and per-voxel (ring) designs.
//
// ========================================================================================

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use ndarray::{Array, Array1, Array2, array};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use voxlmm::estimate::{Estimator, FisherScoring};
use voxlmm::inference::{InferenceEngine, InferenceSettings};
use voxlmm::products::{DesignProducts, ProductBlock};
use voxlmm::types::{Contrast, ContrastPlan, RandomEffectsLayout, SampleSize};

// --- Benchmark Tuning Parameters ---

/// Observations per voxel.
const N: usize = 60;
/// Subjects, each contributing a random intercept.
const SUBJECTS: usize = 12;
const VOXEL_COUNTS: [usize; 3] = [16, 64, 256];

fn flat(matrix: Array2<f64>) -> Array2<f64> {
    let len = matrix.len();
    matrix
        .into_shape_with_order((1, len))
        .expect("contiguous product matrix")
}

/// Simulated product block; `per_voxel` repeats the design once per voxel.
fn simulated_block(voxels: usize, per_voxel: bool) -> ProductBlock {
    let mut rng = StdRng::seed_from_u64(42);
    let per_subject = N / SUBJECTS;
    let x = Array::from_shape_fn((N, 3), |(i, j)| match j {
        0 => 1.0,
        1 => (i % per_subject) as f64,
        _ => rng.r#gen::<f64>(),
    });
    let z = Array::from_shape_fn((N, SUBJECTS), |(i, j)| if i / per_subject == j { 1.0 } else { 0.0 });
    let copies = if per_voxel { voxels } else { 1 };
    let repeat = |row: Array2<f64>| {
        let row = flat(row);
        Array2::from_shape_fn((copies, row.ncols()), |(_, j)| row[[0, j]])
    };
    let design = DesignProducts::from_rows(
        repeat(x.t().dot(&x)),
        repeat(z.t().dot(&x)),
        repeat(z.t().dot(&z)),
        3,
        SUBJECTS,
    )
    .expect("consistent design products");

    let mut xty = Array2::zeros((voxels, 3));
    let mut zty = Array2::zeros((voxels, SUBJECTS));
    let mut yty = Array1::zeros(voxels);
    for voxel in 0..voxels {
        let intercepts: Vec<f64> = (0..SUBJECTS).map(|_| rng.r#gen::<f64>() - 0.5).collect();
        let y = Array::from_shape_fn(N, |i| {
            0.3 * x[[i, 1]] + intercepts[i / per_subject] + rng.r#gen::<f64>()
        });
        xty.row_mut(voxel).assign(&x.t().dot(&y));
        zty.row_mut(voxel).assign(&z.t().dot(&y));
        yty[voxel] = y.dot(&y);
    }
    ProductBlock::new(design, xty, zty, yty, SampleSize::Uniform(N as f64))
        .expect("consistent response products")
}

fn bench_inference_path(c: &mut Criterion) {
    let layout = RandomEffectsLayout::new(vec![SUBJECTS], vec![1]).expect("valid layout");
    let plan = ContrastPlan::new(vec![
        Contrast::from_matrix("slope", array![[0.0, 1.0, 0.0]]),
        Contrast::from_matrix("effects", array![[0.0, 1.0, 0.0], [0.0, 0.0, 1.0]]),
    ]);
    let settings = InferenceSettings::default();
    let engine = InferenceEngine::new(&layout, &plan, &settings);
    let estimator = FisherScoring::default();

    let mut group = c.benchmark_group("InferencePath");
    for &voxels in &VOXEL_COUNTS {
        group.throughput(Throughput::Elements(voxels as u64));
        for (label, per_voxel) in [("inner", false), ("ring", true)] {
            let block = simulated_block(voxels, per_voxel);
            group.bench_with_input(BenchmarkId::new(label, voxels), &block, |b, block| {
                b.iter(|| {
                    let fit = estimator.estimate(block, &layout).expect("estimation");
                    let stats = engine.compute(&fit, block).expect("inference");
                    black_box(stats.llh.sum())
                })
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_inference_path);
criterion_main!(benches);
