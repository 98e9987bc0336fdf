//! Per-voxel design-product matrices, the sufficient statistics of the model.

use crate::types::SampleSize;
use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, Axis};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProductError {
    #[error("{name} rows hold {found} values but {expected} were expected")]
    RowWidth {
        name: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("{name} covers {found} voxels but the block has {expected}")]
    VoxelCount {
        name: &'static str,
        expected: usize,
        found: usize,
    },
}

fn reshape_rows(
    name: &'static str,
    rows: Array2<f64>,
    shape: (usize, usize),
) -> Result<Array3<f64>, ProductError> {
    let expected = shape.0 * shape.1;
    if rows.ncols() != expected {
        return Err(ProductError::RowWidth {
            name,
            expected,
            found: rows.ncols(),
        });
    }
    let count = rows.nrows();
    let flat: Vec<f64> = rows.iter().copied().collect();
    Array3::from_shape_vec((count, shape.0, shape.1), flat).map_err(|_| ProductError::RowWidth {
        name,
        expected,
        found: rows.ncols(),
    })
}

/// X'X, Z'X and Z'Z for a subset: one copy per voxel, or a single copy shared
/// by every voxel.
#[derive(Debug, Clone)]
pub struct DesignProducts {
    xtx: Array3<f64>,
    ztx: Array3<f64>,
    ztz: Array3<f64>,
}

impl DesignProducts {
    /// Builds the design products from flattened (row-major) rows.
    pub fn from_rows(
        xtx: Array2<f64>,
        ztx: Array2<f64>,
        ztz: Array2<f64>,
        p: usize,
        q: usize,
    ) -> Result<Self, ProductError> {
        let xtx = reshape_rows("X'X", xtx, (p, p))?;
        let ztx = reshape_rows("Z'X", ztx, (q, p))?;
        let ztz = reshape_rows("Z'Z", ztz, (q, q))?;
        for (name, found) in [("Z'X", ztx.len_of(Axis(0))), ("Z'Z", ztz.len_of(Axis(0)))] {
            if found != xtx.len_of(Axis(0)) {
                return Err(ProductError::VoxelCount {
                    name,
                    expected: xtx.len_of(Axis(0)),
                    found,
                });
            }
        }
        Ok(Self { xtx, ztx, ztz })
    }

    pub fn copies(&self) -> usize {
        self.xtx.len_of(Axis(0))
    }
}

/// Everything the estimator and the inference engine need for one subset.
#[derive(Debug, Clone)]
pub struct ProductBlock {
    design: DesignProducts,
    xty: Array2<f64>,
    zty: Array2<f64>,
    yty: Array1<f64>,
    n: SampleSize,
}

/// Borrowed products of a single voxel.
#[derive(Debug, Clone, Copy)]
pub struct VoxelProducts<'a> {
    pub xtx: ArrayView2<'a, f64>,
    pub ztx: ArrayView2<'a, f64>,
    pub ztz: ArrayView2<'a, f64>,
    pub xty: ArrayView1<'a, f64>,
    pub zty: ArrayView1<'a, f64>,
    pub yty: f64,
    pub n: f64,
}

impl ProductBlock {
    pub fn new(
        design: DesignProducts,
        xty: Array2<f64>,
        zty: Array2<f64>,
        yty: Array1<f64>,
        n: SampleSize,
    ) -> Result<Self, ProductError> {
        let voxels = xty.nrows();
        let p = design.xtx.len_of(Axis(1));
        let q = design.ztz.len_of(Axis(1));
        if xty.ncols() != p {
            return Err(ProductError::RowWidth {
                name: "X'Y",
                expected: p,
                found: xty.ncols(),
            });
        }
        if zty.ncols() != q {
            return Err(ProductError::RowWidth {
                name: "Z'Y",
                expected: q,
                found: zty.ncols(),
            });
        }
        for (name, found) in [("Z'Y", zty.nrows()), ("Y'Y", yty.len())] {
            if found != voxels {
                return Err(ProductError::VoxelCount {
                    name,
                    expected: voxels,
                    found,
                });
            }
        }
        if design.copies() != 1 && design.copies() != voxels {
            return Err(ProductError::VoxelCount {
                name: "X'X",
                expected: voxels,
                found: design.copies(),
            });
        }
        if let SampleSize::PerVoxel(counts) = &n {
            if counts.len() != voxels {
                return Err(ProductError::VoxelCount {
                    name: "observation counts",
                    expected: voxels,
                    found: counts.len(),
                });
            }
        }
        Ok(Self {
            design,
            xty,
            zty,
            yty,
            n,
        })
    }

    pub fn n_voxels(&self) -> usize {
        self.xty.nrows()
    }

    pub fn p(&self) -> usize {
        self.xty.ncols()
    }

    pub fn q(&self) -> usize {
        self.zty.ncols()
    }

    pub fn voxel(&self, voxel: usize) -> VoxelProducts<'_> {
        let design = if self.design.copies() == 1 { 0 } else { voxel };
        VoxelProducts {
            xtx: self.design.xtx.index_axis(Axis(0), design),
            ztx: self.design.ztx.index_axis(Axis(0), design),
            ztz: self.design.ztz.index_axis(Axis(0), design),
            xty: self.xty.row(voxel),
            zty: self.zty.row(voxel),
            yty: self.yty[voxel],
            n: self.n.at(voxel),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn shared_design_is_reused_for_every_voxel() {
        let design = DesignProducts::from_rows(
            array![[4.0, 1.0, 1.0, 3.0]],
            array![[1.0, 0.0, 0.0, 1.0]],
            array![[2.0, 0.0, 0.0, 2.0]],
            2,
            2,
        )
        .unwrap();
        let block = ProductBlock::new(
            design,
            array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]],
            array![[0.5, 0.5], [1.0, 1.0], [1.5, 1.5]],
            array![10.0, 20.0, 30.0],
            SampleSize::Uniform(8.0),
        )
        .unwrap();
        let last = block.voxel(2);
        assert_eq!(last.xtx, array![[4.0, 1.0], [1.0, 3.0]]);
        assert_eq!(last.xty, array![5.0, 6.0]);
        assert_eq!(last.yty, 30.0);
        assert_eq!(last.n, 8.0);
    }

    #[test]
    fn wrong_row_width_is_reported() {
        let err = DesignProducts::from_rows(
            array![[1.0, 0.0, 0.0]],
            array![[1.0]],
            array![[1.0]],
            2,
            1,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ProductError::RowWidth { name: "X'X", expected: 4, found: 3 }
        ));
    }
}
