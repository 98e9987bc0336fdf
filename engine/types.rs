// ========================================================================================
//                             High-Level Data Contracts
// ========================================================================================

// This file is only for types that are shared between files.

use crate::linalg::matrix_rank;
use ndarray::{Array1, Array2};
use std::fmt;
use std::ops::Range;
use thiserror::Error;

/// A voxel addressed in both coordinate spaces at once.
///
/// `volume` is the flat index into the full (x, y, z) volume in C order and
/// `mask_rank` is the voxel's position in the ascending list of analysis-mask
/// voxels, which is the row index used by every intermediate product store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VoxelRef {
    pub volume: usize,
    pub mask_rank: usize,
}

/// An ordered set of voxels, ascending in full-volume index.
///
/// The group-local position of a voxel is its position in this list; values
/// produced for a subset are always laid out in this order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VoxelSubset {
    voxels: Vec<VoxelRef>,
}

impl VoxelSubset {
    /// Builds a subset, sorting by full-volume index.
    pub fn new(mut voxels: Vec<VoxelRef>) -> Self {
        voxels.sort_by_key(|voxel| voxel.volume);
        Self { voxels }
    }

    pub fn len(&self) -> usize {
        self.voxels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voxels.is_empty()
    }

    pub fn voxels(&self) -> &[VoxelRef] {
        &self.voxels
    }

    pub fn volume_indices(&self) -> Vec<usize> {
        self.voxels.iter().map(|voxel| voxel.volume).collect()
    }

    pub fn mask_ranks(&self) -> Vec<usize> {
        self.voxels.iter().map(|voxel| voxel.mask_rank).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &VoxelRef> {
        self.voxels.iter()
    }
}

/// Which subset of a voxel group is being processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubsetKind {
    /// Voxels with fewer observations than the full design.
    Ring,
    /// Voxels observed in every study.
    Inner,
}

impl SubsetKind {
    /// Ring voxels carry one design per voxel; inner voxels share one.
    pub fn spatially_varying(self) -> bool {
        matches!(self, Self::Ring)
    }
}

impl fmt::Display for SubsetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ring => f.write_str("ring"),
            Self::Inner => f.write_str("inner"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LayoutError {
    #[error("{levels} factors have level counts but {params} have parameter counts")]
    FactorCountMismatch { levels: usize, params: usize },
    #[error("at least one random factor is required")]
    NoFactors,
    #[error("random factor {factor} needs at least one level and one parameter")]
    EmptyFactor { factor: usize },
}

/// Layout of the random-effects design: one entry per grouping factor.
///
/// The columns of Z are ordered factor by factor, then level by level, then by
/// parameter within the level, so level `j` of factor `k` occupies a contiguous
/// run of `params[k]` columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RandomEffectsLayout {
    levels: Vec<usize>,
    params: Vec<usize>,
}

impl RandomEffectsLayout {
    pub fn new(levels: Vec<usize>, params: Vec<usize>) -> Result<Self, LayoutError> {
        if levels.len() != params.len() {
            return Err(LayoutError::FactorCountMismatch {
                levels: levels.len(),
                params: params.len(),
            });
        }
        if levels.is_empty() {
            return Err(LayoutError::NoFactors);
        }
        if let Some(factor) = levels
            .iter()
            .zip(&params)
            .position(|(&levels, &params)| levels == 0 || params == 0)
        {
            return Err(LayoutError::EmptyFactor { factor });
        }
        Ok(Self { levels, params })
    }

    pub fn n_factors(&self) -> usize {
        self.levels.len()
    }

    pub fn levels(&self, factor: usize) -> usize {
        self.levels[factor]
    }

    pub fn params(&self, factor: usize) -> usize {
        self.params[factor]
    }

    /// Total number of random-effect coefficients.
    pub fn q(&self) -> usize {
        self.levels
            .iter()
            .zip(&self.params)
            .map(|(levels, params)| levels * params)
            .sum()
    }

    /// Number of unique covariance parameters across all factor blocks.
    pub fn q_unique(&self) -> usize {
        self.params.iter().map(|params| params * (params + 1) / 2).sum()
    }

    /// First column of factor `factor` in Z.
    pub fn factor_offset(&self, factor: usize) -> usize {
        self.levels[..factor]
            .iter()
            .zip(&self.params[..factor])
            .map(|(levels, params)| levels * params)
            .sum()
    }

    /// Columns of Z belonging to level `level` of factor `factor`.
    pub fn level_range(&self, factor: usize, level: usize) -> Range<usize> {
        let start = self.factor_offset(factor) + level * self.params[factor];
        start..start + self.params[factor]
    }

    /// Position of each factor's vech block inside the stacked vector of unique
    /// covariance parameters.
    pub fn vech_range(&self, factor: usize) -> Range<usize> {
        let start: usize = self.params[..factor]
            .iter()
            .map(|params| params * (params + 1) / 2)
            .sum();
        start..start + self.params[factor] * (self.params[factor] + 1) / 2
    }
}

/// Number of observations behind each voxel of a subset.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleSize {
    /// Inner voxels: every voxel saw all `n` observations.
    Uniform(f64),
    /// Ring voxels: one count per voxel.
    PerVoxel(Array1<f64>),
}

impl SampleSize {
    #[inline]
    pub fn at(&self, voxel: usize) -> f64 {
        match self {
            Self::Uniform(n) => *n,
            Self::PerVoxel(counts) => counts[voxel],
        }
    }
}

/// A hypothesis test on the fixed effects, classified once by shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Contrast {
    T { name: String, row: Array1<f64> },
    F { name: String, matrix: Array2<f64>, rank: usize },
}

impl Contrast {
    /// Classifies a contrast purely by shape: one row is a T contrast, more
    /// than one row is an F contrast.
    pub fn from_matrix(name: impl Into<String>, matrix: Array2<f64>) -> Self {
        let name = name.into();
        if matrix.nrows() == 1 {
            Self::T {
                name,
                row: matrix.row(0).to_owned(),
            }
        } else {
            let rank = matrix_rank(&matrix.view());
            Self::F { name, matrix, rank }
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::T { name, .. } | Self::F { name, .. } => name,
        }
    }

    /// Number of fixed effects the contrast is written against.
    pub fn width(&self) -> usize {
        match self {
            Self::T { row, .. } => row.len(),
            Self::F { matrix, .. } => matrix.ncols(),
        }
    }
}

/// A contrast together with the output frame it writes to.
#[derive(Debug, Clone, PartialEq)]
pub struct ContrastSlot {
    pub contrast: Contrast,
    pub frame: usize,
}

/// Contrasts in declaration order with per-type frame numbering.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContrastPlan {
    slots: Vec<ContrastSlot>,
    n_t: usize,
    n_f: usize,
}

impl ContrastPlan {
    pub fn new(contrasts: Vec<Contrast>) -> Self {
        let mut current_nt = 0;
        let mut current_nf = 0;
        let slots = contrasts
            .into_iter()
            .map(|contrast| {
                let frame = match contrast {
                    Contrast::T { .. } => {
                        current_nt += 1;
                        current_nt - 1
                    }
                    Contrast::F { .. } => {
                        current_nf += 1;
                        current_nf - 1
                    }
                };
                ContrastSlot { contrast, frame }
            })
            .collect();
        Self {
            slots,
            n_t: current_nt,
            n_f: current_nf,
        }
    }

    pub fn slots(&self) -> &[ContrastSlot] {
        &self.slots
    }

    /// Frames in each T-statistic volume.
    pub fn n_t(&self) -> usize {
        self.n_t
    }

    /// Frames in each F-statistic volume.
    pub fn n_f(&self) -> usize {
        self.n_f
    }
}
