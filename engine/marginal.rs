//! Marginal-covariance algebra for one voxel.
//!
//! The model is `Y = Xβ + Zb + e` with `Var(b) = σ² D` and `Var(e) = σ² I`, so
//! `Var(Y) = σ² V` with `V = I + Z D Z'`. Everything below is expressed through
//! the product matrices only, using the Woodbury identity
//! `V⁻¹ = I − Z M Z'` with `M = D (I + Z'Z D)⁻¹`.

use crate::linalg::{duplication_matrix, invert_or_nan, kron, log_det, solve_or_nan, vec_columns};
use crate::products::VoxelProducts;
use crate::types::RandomEffectsLayout;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, s};

/// Quantities derived from the product matrices and the current `D`.
#[derive(Debug, Clone)]
pub struct MarginalTerms {
    /// The Woodbury factor `D (I + Z'Z D)⁻¹`.
    pub m: Array2<f64>,
    /// `log |I + Z'Z D|`, equal to `log |V|`.
    pub log_det_v: f64,
    pub xtivx: Array2<f64>,
    pub xtivx_inv: Array2<f64>,
    pub ztivx: Array2<f64>,
    pub ztivz: Array2<f64>,
}

impl MarginalTerms {
    pub fn new(products: &VoxelProducts<'_>, d: &ArrayView2<f64>) -> Self {
        let q = d.nrows();
        let iplus = Array2::<f64>::eye(q) + products.ztz.dot(d);
        let m = d.dot(&invert_or_nan(&iplus.view()));
        let log_det_v = log_det(&iplus.view());
        let xtz = products.ztx.t();
        let xtivx = &products.xtx - &xtz.dot(&m).dot(&products.ztx);
        let xtivx_inv = invert_or_nan(&xtivx.view());
        let ztz_m = products.ztz.dot(&m);
        let ztivx = &products.ztx - &ztz_m.dot(&products.ztx);
        let ztivz = &products.ztz - &ztz_m.dot(&products.ztz);
        Self {
            m,
            log_det_v,
            xtivx,
            xtivx_inv,
            ztivx,
            ztivz,
        }
    }

    /// Generalised least squares estimate of β for the current `D`.
    pub fn gls_beta(&self, products: &VoxelProducts<'_>) -> Array1<f64> {
        let xtivy = &products.xty - &products.ztx.t().dot(&self.m.dot(&products.zty));
        solve_or_nan(&self.xtivx.view(), &xtivy.view())
    }
}

/// `e'e` and `Z'e` for residuals `e = Y − Xβ`.
pub fn residual_terms(products: &VoxelProducts<'_>, beta: &ArrayView1<f64>) -> (f64, Array1<f64>) {
    let ete = products.yty - 2.0 * beta.dot(&products.xty) + beta.dot(&products.xtx.dot(beta));
    let zte = &products.zty - &products.ztx.dot(beta);
    (ete, zte)
}

/// `e'V⁻¹e`.
pub fn weighted_residual(ete: f64, zte: &ArrayView1<f64>, terms: &MarginalTerms) -> f64 {
    ete - zte.dot(&terms.m.dot(zte))
}

/// Log-likelihood without the Gaussian normalising constant.
pub fn log_likelihood(
    n: f64,
    sigma2: f64,
    ete: f64,
    zte: &ArrayView1<f64>,
    terms: &MarginalTerms,
    reml: bool,
) -> f64 {
    let quadratic = weighted_residual(ete, zte, terms);
    let mut llh = -0.5 * (n * sigma2.ln() + terms.log_det_v + quadratic / sigma2);
    if reml {
        let p = terms.xtivx.nrows() as f64;
        llh += 0.5 * p * sigma2.ln() - 0.5 * log_det(&terms.xtivx.view());
    }
    llh
}

/// Builds the full q×q `D` from one covariance block per factor.
pub fn expand_blocks(layout: &RandomEffectsLayout, blocks: &[Array2<f64>]) -> Array2<f64> {
    let q = layout.q();
    let mut d = Array2::zeros((q, q));
    for (factor, block) in blocks.iter().enumerate() {
        for level in 0..layout.levels(factor) {
            let range = layout.level_range(factor, level);
            d.slice_mut(s![range.clone(), range]).assign(block);
        }
    }
    d
}

/// The per-factor covariance blocks of `D`, read from each factor's first level.
pub fn factor_blocks(layout: &RandomEffectsLayout, d: &ArrayView2<f64>) -> Vec<Array2<f64>> {
    (0..layout.n_factors())
        .map(|factor| {
            let range = layout.level_range(factor, 0);
            d.slice(s![range.clone(), range]).to_owned()
        })
        .collect()
}

/// Expected information of the stacked `vech(D_k)` parameters.
pub fn d_information(layout: &RandomEffectsLayout, ztivz: &ArrayView2<f64>) -> Array2<f64> {
    let size = layout.q_unique();
    let mut info = Array2::zeros((size, size));
    for k1 in 0..layout.n_factors() {
        let dup1 = duplication_matrix(layout.params(k1));
        for k2 in 0..layout.n_factors() {
            let dup2 = duplication_matrix(layout.params(k2));
            let width1 = layout.params(k1) * layout.params(k1);
            let width2 = layout.params(k2) * layout.params(k2);
            let mut acc = Array2::<f64>::zeros((width1, width2));
            for i in 0..layout.levels(k1) {
                let rows = layout.level_range(k1, i);
                for j in 0..layout.levels(k2) {
                    let cols = layout.level_range(k2, j);
                    let block = ztivz.slice(s![rows.clone(), cols]);
                    acc += &kron(&block, &block);
                }
            }
            let value = dup1.t().dot(&acc).dot(&dup2) * 0.5;
            info.slice_mut(s![layout.vech_range(k1), layout.vech_range(k2)])
                .assign(&value);
        }
    }
    info
}

/// Expected information of `(σ², vech D_1, …, vech D_r)`.
pub fn covariance_information(
    layout: &RandomEffectsLayout,
    ztivz: &ArrayView2<f64>,
    sigma2: f64,
    n: f64,
) -> Array2<f64> {
    let size = 1 + layout.q_unique();
    let mut info = Array2::zeros((size, size));
    info[[0, 0]] = n / (2.0 * sigma2 * sigma2);
    for factor in 0..layout.n_factors() {
        let params = layout.params(factor);
        let mut acc = Array2::<f64>::zeros((params, params));
        for level in 0..layout.levels(factor) {
            let range = layout.level_range(factor, level);
            acc += &ztivz.slice(s![range.clone(), range]);
        }
        let cross = duplication_matrix(params).t().dot(&vec_columns(&acc.view())) / (2.0 * sigma2);
        let range = layout.vech_range(factor);
        let offset = 1 + range.start..1 + range.end;
        info.slice_mut(s![0, offset.clone()]).assign(&cross);
        info.slice_mut(s![offset, 0]).assign(&cross);
    }
    info.slice_mut(s![1.., 1..])
        .assign(&d_information(layout, ztivz));
    info
}
