//! Expands deduplicated design products back to per-voxel form.
//!
//! The upstream batching stage stores X'X, Z'X and Z'Z once per distinct design
//! and records, for every voxel, the label of the design it uses. Labels run
//! from 1 to M; label 0 marks a voxel that was never computed.

use crate::products::{DesignProducts, ProductError};
use crate::types::VoxelSubset;
use ndarray::{Array2, ArrayView1};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(
        "uniqueness mask is inconsistent for {name}: voxel {first_voxel} has label {first_label} but voxel {voxel} has label {label}"
    )]
    InconsistentUniquenessMask {
        name: String,
        first_voxel: usize,
        first_label: u32,
        voxel: usize,
        label: u32,
    },
    #[error("voxel {voxel} has no uniqueness label for {name}")]
    UnlabelledVoxel { name: String, voxel: usize },
    #[error("voxel {voxel} has label {label} but only {n_unique} unique {name} matrices are stored")]
    LabelOutOfRange {
        name: String,
        voxel: usize,
        label: u32,
        n_unique: usize,
    },
    #[error("cannot resolve {name} for an empty voxel subset")]
    EmptySubset { name: String },
    #[error("voxel {voxel} lies outside the uniqueness mask of {n_voxels} voxels")]
    ShapeMismatch { voxel: usize, n_voxels: usize },
    #[error(transparent)]
    Product(#[from] ProductError),
}

/// The distinct rows of one product matrix, addressed by label.
#[derive(Debug, Clone)]
pub struct UniqueProductTable {
    name: String,
    rows: Array2<f64>,
}

impl UniqueProductTable {
    /// `rows[m - 1]` is the flattened matrix carried by label `m`.
    pub fn new(name: impl Into<String>, rows: Array2<f64>) -> Self {
        Self {
            name: name.into(),
            rows,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn n_unique(&self) -> usize {
        self.rows.nrows()
    }

    pub fn row_len(&self) -> usize {
        self.rows.ncols()
    }

    pub fn row(&self, label: u32) -> Option<ArrayView1<'_, f64>> {
        let index = usize::try_from(label).ok()?.checked_sub(1)?;
        (index < self.rows.nrows()).then(|| self.rows.row(index))
    }
}

/// The three deduplicated design tables.
#[derive(Debug, Clone)]
pub struct UniqueDesignTables {
    pub xtx: UniqueProductTable,
    pub ztx: UniqueProductTable,
    pub ztz: UniqueProductTable,
}

/// Label of every voxel of the full volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniquenessMask {
    labels: Vec<u32>,
}

impl UniquenessMask {
    pub fn new(labels: Vec<u32>) -> Self {
        Self { labels }
    }

    /// Labels stored as floating point volume data; anything that is not a
    /// positive finite number becomes 0.
    pub fn from_values(values: &[f64]) -> Self {
        let labels = values
            .iter()
            .map(|&value| {
                if value.is_finite() && value >= 0.5 {
                    value.round() as u32
                } else {
                    0
                }
            })
            .collect();
        Self { labels }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn label(&self, volume: usize) -> Option<u32> {
        self.labels.get(volume).copied()
    }
}

/// Resolves unique product rows for a subset of voxels.
#[derive(Debug, Clone, Copy)]
pub struct ProductMatrixResolver<'a> {
    mask: &'a UniquenessMask,
}

impl<'a> ProductMatrixResolver<'a> {
    pub fn new(mask: &'a UniquenessMask) -> Self {
        Self { mask }
    }

    fn label_of(&self, volume: usize) -> Result<u32, ResolveError> {
        self.mask.label(volume).ok_or(ResolveError::ShapeMismatch {
            voxel: volume,
            n_voxels: self.mask.len(),
        })
    }

    /// One row per voxel when `spatially_varying`, otherwise a single shared row.
    ///
    /// On the spatially varying path a voxel with label 0 keeps a zero row; the
    /// caller is expected to have excluded such voxels already.
    pub fn resolve(
        &self,
        table: &UniqueProductTable,
        voxels: &VoxelSubset,
        spatially_varying: bool,
    ) -> Result<Array2<f64>, ResolveError> {
        if spatially_varying {
            self.resolve_per_voxel(table, voxels)
        } else {
            self.resolve_shared(table, voxels)
        }
    }

    fn resolve_per_voxel(
        &self,
        table: &UniqueProductTable,
        voxels: &VoxelSubset,
    ) -> Result<Array2<f64>, ResolveError> {
        let mut resolved = Array2::zeros((voxels.len(), table.row_len()));
        for (position, voxel) in voxels.iter().enumerate() {
            let label = self.label_of(voxel.volume)?;
            if label == 0 {
                continue;
            }
            let row = table.row(label).ok_or_else(|| ResolveError::LabelOutOfRange {
                name: table.name().to_string(),
                voxel: voxel.volume,
                label,
                n_unique: table.n_unique(),
            })?;
            resolved.row_mut(position).assign(&row);
        }
        Ok(resolved)
    }

    fn resolve_shared(
        &self,
        table: &UniqueProductTable,
        voxels: &VoxelSubset,
    ) -> Result<Array2<f64>, ResolveError> {
        let first = voxels.voxels().first().ok_or_else(|| ResolveError::EmptySubset {
            name: table.name().to_string(),
        })?;
        let first_label = self.label_of(first.volume)?;
        for voxel in voxels.iter().skip(1) {
            let label = self.label_of(voxel.volume)?;
            if label != first_label {
                return Err(ResolveError::InconsistentUniquenessMask {
                    name: table.name().to_string(),
                    first_voxel: first.volume,
                    first_label,
                    voxel: voxel.volume,
                    label,
                });
            }
        }
        if first_label == 0 {
            return Err(ResolveError::UnlabelledVoxel {
                name: table.name().to_string(),
                voxel: first.volume,
            });
        }
        let row = table
            .row(first_label)
            .ok_or_else(|| ResolveError::LabelOutOfRange {
                name: table.name().to_string(),
                voxel: first.volume,
                label: first_label,
                n_unique: table.n_unique(),
            })?;
        Ok(row.insert_axis(ndarray::Axis(0)).to_owned())
    }

    /// Resolves X'X, Z'X and Z'Z together and reshapes them into matrices.
    pub fn resolve_design(
        &self,
        tables: &UniqueDesignTables,
        voxels: &VoxelSubset,
        spatially_varying: bool,
        p: usize,
        q: usize,
    ) -> Result<DesignProducts, ResolveError> {
        let xtx = self.resolve(&tables.xtx, voxels, spatially_varying)?;
        let ztx = self.resolve(&tables.ztx, voxels, spatially_varying)?;
        let ztz = self.resolve(&tables.ztz, voxels, spatially_varying)?;
        Ok(DesignProducts::from_rows(xtx, ztx, ztz, p, q)?)
    }
}
