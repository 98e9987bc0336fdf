//! Orchestrates one run: load the intermediate inputs, partition the requested
//! block into memory-bounded groups and push every ring and inner subset through
//! estimation, inference and the volume writer.

use crate::config::{ConfigError, RunConfig};
use crate::estimate::{EstimationError, Estimator, FisherScoring};
use crate::inference::{InferenceEngine, InferenceError};
use crate::partition::{MaskIndex, PartitionError, VoxelPartitioner};
use crate::products::{ProductBlock, ProductError};
use crate::resolve::{
    ProductMatrixResolver, ResolveError, UniqueDesignTables, UniqueProductTable, UniquenessMask,
};
use crate::shared::store::{NpyRowStore, StoreError};
use crate::shared::volume::{
    NiftiVolumeWriter, VolumeData, VolumeError, VolumeGeometry, VolumeWriter, read_volume,
};
use crate::types::{SampleSize, SubsetKind, VoxelRef, VoxelSubset};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use ndarray::Array1;
use std::io::IsTerminal;
use std::path::Path;
use std::time::Instant;
use thiserror::Error;

pub const SAMPLE_COUNT_VOLUME: &str = "lmm_vox_n.nii";
pub const DATA_MASK_VOLUME: &str = "lmm_vox_mask.nii";
pub const UNIQUENESS_VOLUME: &str = "lmm_vox_uniqueM.nii";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Partition(#[from] PartitionError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Product(#[from] ProductError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Volume(#[from] VolumeError),
    #[error(transparent)]
    Estimation(#[from] EstimationError),
    #[error(transparent)]
    Inference(#[from] InferenceError),
    #[error("voxel block {block} does not exist; valid blocks are 1 to {n_blocks}")]
    BlockOutOfRange { block: i64, n_blocks: usize },
    #[error("invalid progress bar template: {0}")]
    Progress(#[from] indicatif::style::TemplateError),
    #[error("{what}: expected {expected}, found {found}")]
    ShapeMismatch {
        what: String,
        expected: usize,
        found: usize,
    },
}

/// Totals reported at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub groups: usize,
    pub ring_voxels: usize,
    pub inner_voxels: usize,
    pub degenerate_voxels: usize,
}

/// Per-voxel product stores written by the batching stage.
struct ResponseStores {
    xty: NpyRowStore,
    zty: NpyRowStore,
    yty: NpyRowStore,
}

impl ResponseStores {
    fn open(tmp: &Path, mask_voxels: usize) -> Result<Self, PipelineError> {
        let stores = Self {
            xty: NpyRowStore::open(&tmp.join("XtY.npy"))?,
            zty: NpyRowStore::open(&tmp.join("ZtY.npy"))?,
            yty: NpyRowStore::open(&tmp.join("YtY.npy"))?,
        };
        for store in [&stores.xty, &stores.zty, &stores.yty] {
            if store.rows() != mask_voxels {
                return Err(PipelineError::ShapeMismatch {
                    what: format!("rows of {}", store.path().display()),
                    expected: mask_voxels,
                    found: store.rows(),
                });
            }
        }
        Ok(stores)
    }
}

fn open_design_tables(tmp: &Path) -> Result<UniqueDesignTables, PipelineError> {
    let table = |name: &str| -> Result<UniqueProductTable, PipelineError> {
        let store = NpyRowStore::open(&tmp.join(format!("{name}.npy")))?;
        Ok(UniqueProductTable::new(name, store.read_all()))
    };
    Ok(UniqueDesignTables {
        xtx: table("XtX")?,
        ztx: table("ZtX")?,
        ztz: table("ZtZ")?,
    })
}

fn create_progress_bar(len: u64, message: &str) -> Result<ProgressBar, PipelineError> {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    pb.set_style(
        ProgressStyle::with_template(
            "\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        )?
        .progress_chars("█▉▊▋▌▍▎▏  "),
    );
    pb.set_message(message.to_string());

    Ok(pb)
}

/// Reads a volume that must share the reference geometry.
fn read_matching(path: &Path, geometry: &VolumeGeometry) -> Result<VolumeData, PipelineError> {
    let volume = read_volume(path)?;
    if volume.geometry.dims != geometry.dims {
        return Err(VolumeError::GeometryMismatch {
            path: path.to_path_buf(),
            expected: geometry.dims,
            found: volume.geometry.dims,
        }
        .into());
    }
    Ok(volume)
}

/// Maps the CLI block identifier onto a 0-based block and a block count.
pub fn block_selection(block: i64, voxel_blocks: usize) -> (usize, usize) {
    if block <= 0 {
        (0, 1)
    } else {
        (usize::try_from(block - 1).unwrap_or(usize::MAX), voxel_blocks)
    }
}

/// Voxels of the block named by the CLI identifier.
fn select_block(
    index: &MaskIndex,
    block: i64,
    voxel_blocks: usize,
) -> Result<Vec<VoxelRef>, PipelineError> {
    let (block_index, n_blocks) = block_selection(block, voxel_blocks);
    index
        .block(block_index, n_blocks)
        .map_err(|err| match err {
            PartitionError::IndexOutOfRange { n_blocks, .. } => {
                PipelineError::BlockOutOfRange { block, n_blocks }
            }
            other => other.into(),
        })
}

/// Everything loaded once per run and shared by every subset.
struct RunInputs {
    geometry: VolumeGeometry,
    partitioner: VoxelPartitioner,
    uniqueness: UniquenessMask,
    tables: UniqueDesignTables,
    responses: ResponseStores,
}

impl RunInputs {
    fn load(config: &RunConfig) -> Result<Self, PipelineError> {
        let reference = read_volume(&config.reference_volume)?;
        let geometry = reference.geometry.clone();
        log::info!(
            "Reference volume {} has shape {:?}",
            config.reference_volume.display(),
            geometry.dims
        );

        let analysis_mask = match &config.analysis_mask {
            Some(path) => read_matching(path, &geometry)?.nonzero_mask(),
            None => vec![true; geometry.n_voxels()],
        };
        let n_sv = read_matching(&config.outdir.join(SAMPLE_COUNT_VOLUME), &geometry)?.counts();
        let mut partitioner = VoxelPartitioner::new(&analysis_mask, n_sv, config.n)?;

        let data_mask_path = config.outdir.join(DATA_MASK_VOLUME);
        if data_mask_path.exists() {
            log::debug!("Restricting to voxels flagged in {}", data_mask_path.display());
            let data_mask = read_matching(&data_mask_path, &geometry)?.nonzero_mask();
            partitioner = partitioner.with_data_mask(data_mask)?;
        }

        let tmp = config.tmp_dir();
        let labels = read_matching(&tmp.join(UNIQUENESS_VOLUME), &geometry)?;
        let uniqueness = UniquenessMask::from_values(labels.frame(0));
        let tables = open_design_tables(&tmp)?;
        let responses = ResponseStores::open(&tmp, partitioner.mask_index().len())?;
        log::info!(
            "{} analysis-mask voxels, {} unique designs",
            partitioner.mask_index().len(),
            tables.xtx.n_unique()
        );

        Ok(Self {
            geometry,
            partitioner,
            uniqueness,
            tables,
            responses,
        })
    }
}

/// Runs the analysis for one CLI block identifier and writes NIfTI outputs to
/// the configured output directory.
pub fn run(config: &RunConfig, block: i64) -> Result<RunSummary, PipelineError> {
    let inputs = RunInputs::load(config)?;
    let mut writer = NiftiVolumeWriter::new(config.outdir.clone(), inputs.geometry.clone());
    process(config, &inputs, block, &mut writer)
}

/// Runs the analysis, sending every map to `writer` instead of disk.
pub fn run_with_writer(
    config: &RunConfig,
    block: i64,
    writer: &mut dyn VolumeWriter,
) -> Result<RunSummary, PipelineError> {
    let inputs = RunInputs::load(config)?;
    process(config, &inputs, block, writer)
}

/// Geometry of the volume every output copies.
pub fn output_geometry(config: &RunConfig) -> Result<VolumeGeometry, PipelineError> {
    Ok(read_volume(&config.reference_volume)?.geometry)
}

fn process(
    config: &RunConfig,
    inputs: &RunInputs,
    block: i64,
    writer: &mut dyn VolumeWriter,
) -> Result<RunSummary, PipelineError> {
    let start = Instant::now();
    let (block_index, n_blocks) = block_selection(block, config.voxel_blocks);
    let voxels = select_block(inputs.partitioner.mask_index(), block, config.voxel_blocks)?;
    let groups = inputs
        .partitioner
        .groups(&voxels, config.max_memory, config.layout.q());
    log::info!(
        "Block {} of {n_blocks}: {} voxels in {} groups",
        block_index + 1,
        voxels.len(),
        groups.len()
    );

    let estimator = FisherScoring::new(config.estimation.clone());
    let engine = InferenceEngine::new(&config.layout, &config.contrasts, &config.inference);
    let resolver = ProductMatrixResolver::new(&inputs.uniqueness);
    let subsets = SubsetRunner {
        config,
        inputs,
        estimator: &estimator,
        engine,
        resolver,
    };

    let pb = create_progress_bar(groups.len() as u64, "Fitting voxel groups")?;
    let mut summary = RunSummary {
        groups: groups.len(),
        ..RunSummary::default()
    };
    for group in &groups {
        let split = inputs.partitioner.split(group);
        log::debug!(
            "Group {}: {} ring and {} inner voxels",
            group.index,
            split.ring.len(),
            split.inner.len()
        );

        // Ring voxels first, each with its own design and observation count.
        let counts = Array1::from_iter(split.ring_counts.iter().map(|&count| count as f64));
        summary.degenerate_voxels += subsets.run(
            SubsetKind::Ring,
            &split.ring,
            SampleSize::PerVoxel(counts),
            writer,
        )?;
        summary.ring_voxels += split.ring.len();

        summary.degenerate_voxels += subsets.run(
            SubsetKind::Inner,
            &split.inner,
            SampleSize::Uniform(config.n as f64),
            writer,
        )?;
        summary.inner_voxels += split.inner.len();
        pb.inc(1);
    }
    pb.finish_with_message("Voxel groups complete");

    log::info!(
        "Processed {} ring and {} inner voxels in {:.2?}",
        summary.ring_voxels,
        summary.inner_voxels,
        start.elapsed()
    );
    if summary.degenerate_voxels > 0 {
        log::warn!(
            "{} voxels produced non-finite statistics",
            summary.degenerate_voxels
        );
    }
    Ok(summary)
}

/// Pushes one subset through resolution, estimation, inference and writing.
struct SubsetRunner<'a> {
    config: &'a RunConfig,
    inputs: &'a RunInputs,
    estimator: &'a dyn Estimator,
    engine: InferenceEngine<'a>,
    resolver: ProductMatrixResolver<'a>,
}

impl SubsetRunner<'_> {
    /// Returns the number of degenerate voxels in the subset.
    fn run(
        &self,
        kind: SubsetKind,
        subset: &VoxelSubset,
        n: SampleSize,
        writer: &mut dyn VolumeWriter,
    ) -> Result<usize, PipelineError> {
        if subset.is_empty() {
            return Ok(0);
        }
        let ranks = subset.mask_ranks();
        let responses = &self.inputs.responses;
        let design = self.resolver.resolve_design(
            &self.inputs.tables,
            subset,
            kind.spatially_varying(),
            self.config.p,
            self.config.layout.q(),
        )?;
        let block = ProductBlock::new(
            design,
            responses.xty.read_rows(&ranks)?,
            responses.zty.read_rows(&ranks)?,
            responses.yty.read_column(&ranks)?,
            n,
        )?;

        let fit = self.estimator.estimate(&block, &self.config.layout)?;
        let stats = self.engine.compute(&fit, &block)?;
        self.engine.write(&stats, subset, writer)?;
        log::debug!(
            "Wrote {} {kind} voxels ({} degenerate)",
            subset.len(),
            stats.degenerate
        );
        Ok(stats.degenerate)
    }
}
