//! # Voxel-wise inference
//!
//! Turns a fitted subset into statistic maps: log-likelihood, residual mean
//! square, the covariance of β and, for every contrast, either a T or an F test
//! with Satterthwaite degrees of freedom.
//!
//! Nothing in here fails on bad numbers. A voxel whose matrices cannot be
//! inverted simply carries NaN (or an IEEE infinity) in its own outputs.

use crate::estimate::ModelFit;
use crate::linalg::{duplication_matrix, invert_or_nan, try_invert, vec_columns, vech};
use crate::marginal::{
    MarginalTerms, covariance_information, factor_blocks, log_likelihood, residual_terms,
};
use crate::products::{ProductBlock, VoxelProducts};
use crate::shared::volume::{Frame, VolumeError, VolumeWriter};
use crate::types::{Contrast, ContrastPlan, RandomEffectsLayout, VoxelSubset};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, s};
use statrs::distribution::{ContinuousCDF, FisherSnedecor, StudentsT};
use std::f64::consts::PI;
use thiserror::Error;

/// log10 of the smallest positive subnormal double.
pub const DEFAULT_MINLOG: f64 = -323.3062153431158;

pub const LLH_MAP: &str = "lmm_vox_llh";
pub const RESMS_MAP: &str = "lmm_vox_resms";
pub const SIGMA2_MAP: &str = "lmm_vox_sigma2";
pub const BETA_MAP: &str = "lmm_vox_beta";
pub const D_MAP: &str = "lmm_vox_D";
pub const COV_MAP: &str = "lmm_vox_cov";
pub const CON_MAP: &str = "lmm_vox_con";
pub const CON_SE_MAP: &str = "lmm_vox_conSE";
pub const T_DF_MAP: &str = "lmm_vox_conT_swedf";
pub const T_MAP: &str = "lmm_vox_conT";
pub const T_LOGP_MAP: &str = "lmm_vox_conTlp";
pub const F_DF_MAP: &str = "lmm_vox_conF_swedf";
pub const F_MAP: &str = "lmm_vox_conF";
pub const F_LOGP_MAP: &str = "lmm_vox_conFlp";
pub const R2_MAP: &str = "lmm_vox_conR2";

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("{what} covers {found} but the product block has {expected}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct InferenceSettings {
    /// Adds the restricted-likelihood correction to the log-likelihood.
    pub reml: bool,
    pub output_cov_b: bool,
    /// Floor applied to log10 p-values that underflow.
    pub minlog: f64,
}

impl Default for InferenceSettings {
    fn default() -> Self {
        Self {
            reml: false,
            output_cov_b: true,
            minlog: DEFAULT_MINLOG,
        }
    }
}

/// Per-contrast maps for one subset, one entry per voxel.
#[derive(Debug, Clone)]
pub enum ContrastStatistics {
    T {
        frame: usize,
        estimate: Array1<f64>,
        se: Array1<f64>,
        df: Array1<f64>,
        t: Array1<f64>,
        log_p: Array1<f64>,
    },
    F {
        frame: usize,
        df: Array1<f64>,
        f: Array1<f64>,
        log_p: Array1<f64>,
        r2: Array1<f64>,
    },
}

/// Every statistic for one subset, rows in subset order.
#[derive(Debug, Clone)]
pub struct SubsetStatistics {
    pub llh: Array1<f64>,
    pub resms: Array1<f64>,
    pub sigma2: Array1<f64>,
    pub beta: Array2<f64>,
    /// Unique elements of each factor's covariance block, stacked.
    pub d_vech: Array2<f64>,
    /// Row-major flattening of Cov(β), when requested.
    pub cov_b: Option<Array2<f64>>,
    pub contrasts: Vec<ContrastStatistics>,
    /// Voxels with at least one non-finite statistic.
    pub degenerate: usize,
}

impl ContrastStatistics {
    /// Per-voxel columns in the order the test functions return them.
    fn columns_mut(&mut self) -> Vec<&mut Array1<f64>> {
        match self {
            Self::T {
                estimate,
                se,
                df,
                t,
                log_p,
                ..
            } => vec![estimate, se, df, t, log_p],
            Self::F {
                df, f, log_p, r2, ..
            } => vec![df, f, log_p, r2],
        }
    }
}

impl SubsetStatistics {
    pub fn n_voxels(&self) -> usize {
        self.llh.len()
    }
}

/// Converts an upper-tail probability into `-log10 p`, clamping underflow.
pub fn neg_log10_p(p: f64, minlog: f64) -> f64 {
    if p.is_nan() {
        return f64::NAN;
    }
    (-p.log10()).min(-minlog)
}

/// One-sided upper tail of Student's t.
pub fn t_upper_tail(t: f64, df: f64) -> f64 {
    if t.is_nan() {
        return f64::NAN;
    }
    match StudentsT::new(0.0, 1.0, df) {
        Ok(dist) => dist.sf(t),
        Err(_) => f64::NAN,
    }
}

pub fn f_upper_tail(f: f64, df1: f64, df2: f64) -> f64 {
    if f.is_nan() {
        return f64::NAN;
    }
    match FisherSnedecor::new(df1, df2) {
        Ok(dist) => dist.sf(f),
        Err(_) => f64::NAN,
    }
}

fn column(values: &Array1<f64>) -> ArrayView2<'_, f64> {
    values.view().insert_axis(Axis(1))
}

/// Quantities shared by every contrast at one voxel.
struct VoxelInference<'a> {
    layout: &'a RandomEffectsLayout,
    terms: MarginalTerms,
    beta: ArrayView1<'a, f64>,
    sigma2: f64,
    info_inv: Array2<f64>,
}

impl VoxelInference<'_> {
    /// `L (X'V⁻¹X)⁻¹ L'` for a single row.
    fn quadratic(&self, l: &ArrayView1<f64>) -> (f64, Array1<f64>) {
        let xl = self.terms.xtivx_inv.dot(l);
        (l.dot(&xl), xl)
    }

    /// Satterthwaite degrees of freedom of `L Cov(β) L'` for a single row.
    fn satterthwaite(&self, l: &ArrayView1<f64>) -> f64 {
        let layout = self.layout;
        let (quadratic, xl) = self.quadratic(l);
        let s2 = self.sigma2 * quadratic;

        let mut gradient = Array1::zeros(1 + layout.q_unique());
        gradient[0] = quadratic;
        let k = self.terms.ztivx.dot(&xl);
        for factor in 0..layout.n_factors() {
            let params = layout.params(factor);
            let mut acc = Array2::<f64>::zeros((params, params));
            for level in 0..layout.levels(factor) {
                let kj = k.slice(s![layout.level_range(factor, level)]);
                acc += &kj
                    .view()
                    .insert_axis(Axis(1))
                    .dot(&kj.view().insert_axis(Axis(0)));
            }
            let block = duplication_matrix(params).t().dot(&vec_columns(&acc.view())) * self.sigma2;
            let range = layout.vech_range(factor);
            gradient
                .slice_mut(s![1 + range.start..1 + range.end])
                .assign(&block);
        }
        2.0 * s2 * s2 / gradient.dot(&self.info_inv.dot(&gradient))
    }

    fn t_test(&self, row: &Array1<f64>, minlog: f64) -> [f64; 5] {
        let l = row.view();
        let estimate = l.dot(&self.beta);
        let (quadratic, _) = self.quadratic(&l);
        let se = (self.sigma2 * quadratic).sqrt();
        let t = estimate / se;
        let df = self.satterthwaite(&l);
        let log_p = neg_log10_p(t_upper_tail(t, df), minlog);
        [estimate, se, df, t, log_p]
    }

    /// A singular `L (X'V⁻¹X)⁻¹ L'` leaves every F output of the voxel NaN.
    fn f_test(&self, matrix: &Array2<f64>, rank: usize, minlog: f64) -> [f64; 4] {
        let rank_f = rank as f64;
        let lb = matrix.dot(&self.beta);
        let middle = matrix.dot(&self.terms.xtivx_inv).dot(&matrix.t());
        let Some(middle_inv) = try_invert(&middle.view()) else {
            return [f64::NAN; 4];
        };
        let f = lb.dot(&middle_inv.dot(&lb)) / (rank_f * self.sigma2);

        let sum: f64 = matrix
            .rows()
            .into_iter()
            .take(rank)
            .map(|row| {
                let df = self.satterthwaite(&row);
                df / (df - 2.0)
            })
            .sum();
        let df = 2.0 * sum / (sum - rank_f);
        let log_p = neg_log10_p(f_upper_tail(f, rank_f, df), minlog);
        let r2 = rank_f * f / (rank_f * f + df);
        [df, f, log_p, r2]
    }
}

/// Computes and writes the statistic maps of one subset.
#[derive(Debug, Clone, Copy)]
pub struct InferenceEngine<'a> {
    layout: &'a RandomEffectsLayout,
    plan: &'a ContrastPlan,
    settings: &'a InferenceSettings,
}

impl<'a> InferenceEngine<'a> {
    pub fn new(
        layout: &'a RandomEffectsLayout,
        plan: &'a ContrastPlan,
        settings: &'a InferenceSettings,
    ) -> Self {
        Self {
            layout,
            plan,
            settings,
        }
    }

    fn check_shapes(&self, fit: &ModelFit, block: &ProductBlock) -> Result<(), InferenceError> {
        let checks = [
            ("the fit's voxel count", block.n_voxels(), fit.n_voxels()),
            ("the fit's fixed effects", block.p(), fit.beta.ncols()),
            ("the fit's random effects", block.q(), fit.d.len_of(Axis(1))),
            ("the layout's random effects", block.q(), self.layout.q()),
        ];
        for (what, expected, found) in checks {
            if expected != found {
                return Err(InferenceError::ShapeMismatch {
                    what,
                    expected,
                    found,
                });
            }
        }
        Ok(())
    }

    fn voxel_inference<'v>(
        &'v self,
        products: &VoxelProducts<'_>,
        fit: &'v ModelFit,
        voxel: usize,
    ) -> (VoxelInference<'v>, f64, f64) {
        let beta = fit.beta.row(voxel);
        let sigma2 = fit.sigma2[voxel];
        let d = fit.d.index_axis(Axis(0), voxel);
        let terms = MarginalTerms::new(products, &d);
        let (ete, zte) = residual_terms(products, &beta);
        let n = products.n;
        let llh = log_likelihood(n, sigma2, ete, &zte.view(), &terms, self.settings.reml)
            - 0.5 * n * (2.0 * PI).ln();
        let resms = ete / (n - beta.len() as f64);
        let info = covariance_information(self.layout, &terms.ztivz.view(), sigma2, n);
        let inference = VoxelInference {
            layout: self.layout,
            terms,
            beta,
            sigma2,
            info_inv: invert_or_nan(&info.view()),
        };
        (inference, llh, resms)
    }

    pub fn compute(
        &self,
        fit: &ModelFit,
        block: &ProductBlock,
    ) -> Result<SubsetStatistics, InferenceError> {
        self.check_shapes(fit, block)?;
        let voxels = block.n_voxels();
        let p = block.p();
        let mut stats = SubsetStatistics {
            llh: Array1::zeros(voxels),
            resms: Array1::zeros(voxels),
            sigma2: fit.sigma2.clone(),
            beta: fit.beta.clone(),
            d_vech: Array2::zeros((voxels, self.layout.q_unique())),
            cov_b: self
                .settings
                .output_cov_b
                .then(|| Array2::zeros((voxels, p * p))),
            contrasts: self
                .plan
                .slots()
                .iter()
                .map(|slot| match slot.contrast {
                    Contrast::T { .. } => ContrastStatistics::T {
                        frame: slot.frame,
                        estimate: Array1::zeros(voxels),
                        se: Array1::zeros(voxels),
                        df: Array1::zeros(voxels),
                        t: Array1::zeros(voxels),
                        log_p: Array1::zeros(voxels),
                    },
                    Contrast::F { .. } => ContrastStatistics::F {
                        frame: slot.frame,
                        df: Array1::zeros(voxels),
                        f: Array1::zeros(voxels),
                        log_p: Array1::zeros(voxels),
                        r2: Array1::zeros(voxels),
                    },
                })
                .collect(),
            degenerate: 0,
        };

        for voxel in 0..voxels {
            let products = block.voxel(voxel);
            let (inference, llh, resms) = self.voxel_inference(&products, fit, voxel);
            let mut finite = llh.is_finite() && resms.is_finite();
            stats.llh[voxel] = llh;
            stats.resms[voxel] = resms;

            let d = fit.d.index_axis(Axis(0), voxel);
            for (factor, factor_block) in factor_blocks(self.layout, &d).iter().enumerate() {
                stats
                    .d_vech
                    .slice_mut(s![voxel, self.layout.vech_range(factor)])
                    .assign(&vech(&factor_block.view()));
            }
            if let Some(cov_b) = stats.cov_b.as_mut() {
                let cov = &inference.terms.xtivx_inv * inference.sigma2;
                cov_b
                    .row_mut(voxel)
                    .assign(&Array1::from_iter(cov.iter().copied()));
            }

            for (slot, output) in self.plan.slots().iter().zip(stats.contrasts.iter_mut()) {
                let values = match &slot.contrast {
                    Contrast::T { row, .. } => {
                        inference.t_test(row, self.settings.minlog).to_vec()
                    }
                    Contrast::F { matrix, rank, .. } => {
                        inference.f_test(matrix, *rank, self.settings.minlog).to_vec()
                    }
                };
                finite &= values.iter().all(|value| value.is_finite());
                for (column, value) in output.columns_mut().into_iter().zip(values) {
                    column[voxel] = value;
                }
            }
            if !finite {
                stats.degenerate += 1;
            }
        }
        if stats.degenerate > 0 {
            log::debug!(
                "{} of {voxels} voxels produced non-finite statistics",
                stats.degenerate
            );
        }
        Ok(stats)
    }

    /// Writes every map of `stats` at the full-volume positions of `voxels`.
    pub fn write(
        &self,
        stats: &SubsetStatistics,
        voxels: &VoxelSubset,
        writer: &mut dyn VolumeWriter,
    ) -> Result<(), VolumeError> {
        if voxels.len() != stats.n_voxels() {
            return Err(VolumeError::BlockShape {
                name: LLH_MAP.to_string(),
                reason: format!(
                    "{} statistics for {} voxels",
                    stats.n_voxels(),
                    voxels.len()
                ),
            });
        }
        let indices = voxels.volume_indices();
        let mut scalar = |name: &str, values: &Array1<f64>| -> Result<(), VolumeError> {
            writer.write_block(name, &column(values), &indices, Frame::Index(0), 1)
        };
        scalar(LLH_MAP, &stats.llh)?;
        scalar(RESMS_MAP, &stats.resms)?;
        scalar(SIGMA2_MAP, &stats.sigma2)?;

        let mut all_frames = |name: &str, values: &ArrayView2<f64>| -> Result<(), VolumeError> {
            writer.write_block(name, values, &indices, Frame::All, values.ncols())
        };
        all_frames(BETA_MAP, &stats.beta.view())?;
        all_frames(D_MAP, &stats.d_vech.view())?;
        if let Some(cov_b) = &stats.cov_b {
            all_frames(COV_MAP, &cov_b.view())?;
        }

        let n_t = self.plan.n_t();
        let n_f = self.plan.n_f();
        for output in &stats.contrasts {
            match output {
                ContrastStatistics::T {
                    frame,
                    estimate,
                    se,
                    df,
                    t,
                    log_p,
                } => {
                    for (name, values) in [
                        (CON_MAP, estimate),
                        (CON_SE_MAP, se),
                        (T_DF_MAP, df),
                        (T_MAP, t),
                        (T_LOGP_MAP, log_p),
                    ] {
                        writer.write_block(name, &column(values), &indices, Frame::Index(*frame), n_t)?;
                    }
                }
                ContrastStatistics::F {
                    frame,
                    df,
                    f,
                    log_p,
                    r2,
                } => {
                    for (name, values) in [
                        (F_DF_MAP, df),
                        (F_MAP, f),
                        (F_LOGP_MAP, log_p),
                        (R2_MAP, r2),
                    ] {
                        writer.write_block(name, &column(values), &indices, Frame::Index(*frame), n_f)?;
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::products::DesignProducts;
    use crate::shared::volume::{MemoryVolumeWriter, VolumeGeometry};
    use crate::types::{SampleSize, VoxelRef};
    use approx::assert_relative_eq;
    use ndarray::{Array, Array3, array};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn flat(matrix: Array2<f64>) -> Array2<f64> {
        let len = matrix.len();
        matrix.into_shape_with_order((1, len)).unwrap()
    }

    /// Products of a shared design with one voxel per response vector.
    fn block_from_data(x: &Array2<f64>, z: &Array2<f64>, responses: &[Array1<f64>]) -> ProductBlock {
        let design = DesignProducts::from_rows(
            flat(x.t().dot(x)),
            flat(z.t().dot(x)),
            flat(z.t().dot(z)),
            x.ncols(),
            z.ncols(),
        )
        .unwrap();
        let voxels = responses.len();
        let xty = Array::from_shape_fn((voxels, x.ncols()), |(v, j)| x.column(j).dot(&responses[v]));
        let zty = Array::from_shape_fn((voxels, z.ncols()), |(v, j)| z.column(j).dot(&responses[v]));
        let yty = Array1::from_iter(responses.iter().map(|y| y.dot(y)));
        ProductBlock::new(design, xty, zty, yty, SampleSize::Uniform(x.nrows() as f64)).unwrap()
    }

    fn fit_of(beta: Array2<f64>, sigma2: Array1<f64>, d: Array2<f64>) -> ModelFit {
        let voxels = sigma2.len();
        let q = d.nrows();
        let d = Array3::from_shape_fn((voxels, q, q), |(_, i, j)| d[[i, j]]);
        ModelFit { beta, sigma2, d }
    }

    fn t_values(stats: &SubsetStatistics, slot: usize) -> (Array1<f64>, Array1<f64>, Array1<f64>) {
        match &stats.contrasts[slot] {
            ContrastStatistics::T { df, t, log_p, .. } => (df.clone(), t.clone(), log_p.clone()),
            other => panic!("expected a T contrast, found {other:?}"),
        }
    }

    #[test]
    fn single_cluster_confounded_with_intercept_has_one_df() {
        let n = 10;
        let x = Array2::ones((n, 1));
        let z = Array2::ones((n, 1));
        let y = Array1::from_iter((0..n).map(|i| i as f64 * 0.3));
        let block = block_from_data(&x, &z, &[y]);
        let layout = RandomEffectsLayout::new(vec![1], vec![1]).unwrap();
        let plan = ContrastPlan::new(vec![Contrast::from_matrix("mean", array![[1.0]])]);
        let settings = InferenceSettings::default();
        let fit = fit_of(array![[1.2]], array![2.0], Array2::zeros((1, 1)));
        let stats = InferenceEngine::new(&layout, &plan, &settings)
            .compute(&fit, &block)
            .unwrap();
        let (df, _, _) = t_values(&stats, 0);
        assert_relative_eq!(df[0], 1.0, epsilon = 1e-8);
    }

    #[test]
    fn contrast_orthogonal_to_random_effects_has_n_minus_one_df() {
        let n = 12;
        let centre = (n - 1) as f64 / 2.0;
        let x = Array::from_shape_fn((n, 2), |(i, j)| if j == 0 { 1.0 } else { i as f64 - centre });
        let z = Array2::ones((n, 1));
        let y = Array1::from_iter((0..n).map(|i| (i as f64).sin()));
        let block = block_from_data(&x, &z, &[y]);
        let layout = RandomEffectsLayout::new(vec![1], vec![1]).unwrap();
        let plan = ContrastPlan::new(vec![Contrast::from_matrix("slope", array![[0.0, 1.0]])]);
        let settings = InferenceSettings::default();
        let fit = fit_of(array![[0.1, 0.05]], array![0.8], Array2::zeros((1, 1)));
        let stats = InferenceEngine::new(&layout, &plan, &settings)
            .compute(&fit, &block)
            .unwrap();
        let (df, _, _) = t_values(&stats, 0);
        assert_relative_eq!(df[0], (n - 1) as f64, epsilon = 1e-8);
    }

    #[test]
    fn likelihood_at_zero_d_is_the_gaussian_likelihood() {
        let n = 15;
        let mut rng = StdRng::seed_from_u64(4);
        let x = Array::from_shape_fn((n, 2), |(i, j)| if j == 0 { 1.0 } else { i as f64 });
        let z = Array::from_shape_fn((n, 3), |(i, j)| if i % 3 == j { 1.0 } else { 0.0 });
        let y = Array1::from_iter((0..n).map(|_| rng.r#gen::<f64>()));
        let beta = array![0.4, 0.02];
        let residual = &y - &x.dot(&beta);
        let block = block_from_data(&x, &z, &[y]);
        let layout = RandomEffectsLayout::new(vec![3], vec![1]).unwrap();
        let plan = ContrastPlan::default();
        let settings = InferenceSettings::default();
        let sigma2 = 0.3;
        let fit = fit_of(beta.insert_axis(Axis(0)), array![sigma2], Array2::zeros((3, 3)));
        let stats = InferenceEngine::new(&layout, &plan, &settings)
            .compute(&fit, &block)
            .unwrap();
        let ete = residual.dot(&residual);
        let expected = -0.5 * n as f64 * (2.0 * PI * sigma2).ln() - ete / (2.0 * sigma2);
        assert_relative_eq!(stats.llh[0], expected, epsilon = 1e-9);
        assert_relative_eq!(stats.resms[0], ete / (n - 2) as f64, epsilon = 1e-9);
    }

    #[test]
    fn residual_mean_square_ignores_random_effects() {
        let n = 18;
        let mut rng = StdRng::seed_from_u64(8);
        let x = Array::from_shape_fn((n, 2), |(i, j)| if j == 0 { 1.0 } else { (i % 6) as f64 });
        let z = Array::from_shape_fn((n, 3), |(i, j)| if i / 6 == j { 1.0 } else { 0.0 });
        let y = Array1::from_iter((0..n).map(|i| (i / 6) as f64 + rng.r#gen::<f64>()));
        let block = block_from_data(&x, &z, &[y]);
        let layout = RandomEffectsLayout::new(vec![3], vec![1]).unwrap();
        let plan = ContrastPlan::default();
        let settings = InferenceSettings::default();
        let fit = fit_of(array![[1.0, 0.1]], array![0.25], Array2::eye(3) * 0.9);
        let stats = InferenceEngine::new(&layout, &plan, &settings)
            .compute(&fit, &block)
            .unwrap();
        assert!(stats.resms[0].is_finite());
        assert!((stats.resms[0] - stats.sigma2[0]).abs() > 1e-6);
        assert_relative_eq!(stats.d_vech[[0, 0]], 0.9);
        assert_eq!(stats.cov_b.as_ref().map(|cov| cov.ncols()), Some(4));
    }

    fn grouped_design(n: usize, seed: u64, voxels: usize) -> (ProductBlock, RandomEffectsLayout) {
        let mut rng = StdRng::seed_from_u64(seed);
        let x = Array::from_shape_fn((n, 3), |(i, j)| match j {
            0 => 1.0,
            1 => (i % 4) as f64,
            _ => rng.r#gen::<f64>(),
        });
        let z = Array::from_shape_fn((n, 4), |(i, j)| if i / 6 == j { 1.0 } else { 0.0 });
        let responses: Vec<Array1<f64>> = (0..voxels)
            .map(|_| Array1::from_iter((0..n).map(|i| 0.5 * (i % 4) as f64 + rng.r#gen::<f64>())))
            .collect();
        let layout = RandomEffectsLayout::new(vec![4], vec![1]).unwrap();
        (block_from_data(&x, &z, &responses), layout)
    }

    #[test]
    fn f_test_matches_the_wald_quadratic_form() {
        let (block, layout) = grouped_design(24, 21, 1);
        let plan = ContrastPlan::new(vec![
            Contrast::from_matrix("t", array![[0.0, 1.0, 0.0]]),
            Contrast::from_matrix("f", array![[0.0, 1.0, 0.0], [0.0, 0.0, 1.0]]),
        ]);
        let settings = InferenceSettings::default();
        let fit = fit_of(array![[0.2, 0.45, 0.1]], array![0.09], Array2::eye(4) * 0.4);
        let stats = InferenceEngine::new(&layout, &plan, &settings)
            .compute(&fit, &block)
            .unwrap();

        let cov = stats
            .cov_b
            .as_ref()
            .unwrap()
            .row(0)
            .to_owned()
            .into_shape_with_order((3, 3))
            .unwrap();
        let (a, b, c) = (cov[[1, 1]], cov[[1, 2]], cov[[2, 2]]);
        let (l1, l2) = (0.45, 0.1);
        let expected = (c * l1 * l1 - 2.0 * b * l1 * l2 + a * l2 * l2) / (a * c - b * b) / 2.0;

        let (_, t, _) = t_values(&stats, 0);
        assert_relative_eq!(t[0] * t[0], l1 * l1 / a, max_relative = 1e-10);
        match &stats.contrasts[1] {
            ContrastStatistics::F { df, f, r2, frame, log_p } => {
                assert_eq!(*frame, 0);
                assert_relative_eq!(f[0], expected, max_relative = 1e-8);
                assert!(df[0].is_finite() && df[0] > 0.0);
                assert!(log_p[0].is_finite());
                assert_relative_eq!(r2[0], 2.0 * f[0] / (2.0 * f[0] + df[0]), max_relative = 1e-12);
            }
            other => panic!("expected an F contrast, found {other:?}"),
        }
        assert_eq!(stats.degenerate, 0);
    }

    #[test]
    fn singular_f_contrast_only_blanks_its_own_outputs() {
        let (block, layout) = grouped_design(24, 5, 2);
        let plan = ContrastPlan::new(vec![
            Contrast::from_matrix("repeated", array![[0.0, 1.0, 0.0], [0.0, 1.0, 0.0]]),
            Contrast::from_matrix("slope", array![[0.0, 1.0, 0.0]]),
        ]);
        let settings = InferenceSettings::default();
        let fit = fit_of(
            array![[0.2, 0.45, 0.1], [0.1, 0.5, 0.0]],
            array![0.09, 0.2],
            Array2::eye(4) * 0.4,
        );
        let stats = InferenceEngine::new(&layout, &plan, &settings)
            .compute(&fit, &block)
            .unwrap();

        match &stats.contrasts[0] {
            ContrastStatistics::F { df, f, log_p, r2, .. } => {
                for values in [df, f, log_p, r2] {
                    assert!(values.iter().all(|value| value.is_nan()));
                }
            }
            other => panic!("expected an F contrast, found {other:?}"),
        }
        let (df, t, log_p) = t_values(&stats, 1);
        for voxel in 0..2 {
            assert!(stats.llh[voxel].is_finite());
            assert!(df[voxel].is_finite() && t[voxel].is_finite() && log_p[voxel].is_finite());
        }
        assert_eq!(stats.degenerate, 2);
    }

    #[test]
    fn degenerate_voxel_only_affects_its_own_outputs() {
        let n = 12;
        let x = Array::from_shape_fn((n, 2), |(i, j)| if j == 0 { 1.0 } else { i as f64 });
        let z = Array::from_shape_fn((n, 2), |(i, j)| if i % 2 == j { 1.0 } else { 0.0 });
        let good = Array1::from_iter((0..n).map(|i| (i as f64 * 0.7).cos()));
        let bad = Array1::from_iter((0..n).map(|i| 1.0 + 2.0 * i as f64));
        let block = block_from_data(&x, &z, &[good, bad]);
        let layout = RandomEffectsLayout::new(vec![2], vec![1]).unwrap();
        let plan = ContrastPlan::new(vec![Contrast::from_matrix("slope", array![[0.0, 1.0]])]);
        let settings = InferenceSettings::default();
        let fit = fit_of(
            array![[0.1, 0.0], [1.0, 2.0]],
            array![0.5, 0.0],
            Array2::eye(2) * 0.2,
        );
        let stats = InferenceEngine::new(&layout, &plan, &settings)
            .compute(&fit, &block)
            .unwrap();
        let (df, t, log_p) = t_values(&stats, 0);
        assert!(stats.llh[0].is_finite());
        assert!(df[0].is_finite() && t[0].is_finite() && log_p[0].is_finite());
        assert!(!stats.llh[1].is_finite());
        assert!(!t[1].is_finite());
        assert_eq!(stats.degenerate, 1);
    }

    #[test]
    fn mismatched_fit_is_rejected() {
        let x = Array2::ones((4, 1));
        let z = Array2::ones((4, 1));
        let block = block_from_data(&x, &z, &[Array1::ones(4)]);
        let layout = RandomEffectsLayout::new(vec![1], vec![1]).unwrap();
        let plan = ContrastPlan::default();
        let settings = InferenceSettings::default();
        let fit = fit_of(Array2::zeros((2, 1)), Array1::ones(2), Array2::zeros((1, 1)));
        let result = InferenceEngine::new(&layout, &plan, &settings).compute(&fit, &block);
        assert!(matches!(
            result,
            Err(InferenceError::ShapeMismatch { expected: 1, found: 2, .. })
        ));
    }

    #[test]
    fn log_p_values_are_clamped_at_underflow() {
        assert_relative_eq!(neg_log10_p(0.01, DEFAULT_MINLOG), 2.0, epsilon = 1e-12);
        assert_eq!(neg_log10_p(0.0, DEFAULT_MINLOG), -DEFAULT_MINLOG);
        assert!(neg_log10_p(f64::NAN, DEFAULT_MINLOG).is_nan());
        let huge = neg_log10_p(t_upper_tail(1e8, 30.0), DEFAULT_MINLOG);
        assert!(huge <= -DEFAULT_MINLOG && huge > 100.0);
        assert!(t_upper_tail(1.0, -1.0).is_nan());
        assert_relative_eq!(t_upper_tail(0.0, 7.0), 0.5, epsilon = 1e-12);
        assert_relative_eq!(f_upper_tail(0.0, 2.0, 9.0), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn write_numbers_frames_per_statistic_type() {
        let n = 16;
        let mut rng = StdRng::seed_from_u64(2);
        let x = Array::from_shape_fn((n, 2), |(i, j)| if j == 0 { 1.0 } else { (i % 4) as f64 });
        let z = Array::from_shape_fn((n, 2), |(i, j)| if i / 8 == j { 1.0 } else { 0.0 });
        let responses: Vec<Array1<f64>> = (0..2)
            .map(|_| Array1::from_iter((0..n).map(|_| rng.r#gen::<f64>())))
            .collect();
        let block = block_from_data(&x, &z, &responses);
        let layout = RandomEffectsLayout::new(vec![2], vec![1]).unwrap();
        let plan = ContrastPlan::new(vec![
            Contrast::from_matrix("a", array![[1.0, 0.0]]),
            Contrast::from_matrix("both", array![[1.0, 0.0], [0.0, 1.0]]),
            Contrast::from_matrix("b", array![[0.0, 1.0]]),
        ]);
        let settings = InferenceSettings {
            output_cov_b: false,
            ..InferenceSettings::default()
        };
        let fit = fit_of(
            array![[0.5, 0.0], [0.4, 0.1]],
            array![0.1, 0.2],
            Array2::eye(2) * 0.3,
        );
        let engine = InferenceEngine::new(&layout, &plan, &settings);
        let stats = engine.compute(&fit, &block).unwrap();
        let subset = VoxelSubset::new(vec![
            VoxelRef { volume: 3, mask_rank: 1 },
            VoxelRef { volume: 1, mask_rank: 0 },
        ]);
        let mut writer = MemoryVolumeWriter::new(VolumeGeometry::with_dims([2, 2, 1]));
        engine.write(&stats, &subset, &mut writer).unwrap();

        let t_map = writer.volume(T_MAP).unwrap();
        assert_eq!(t_map.n_frames, 2);
        let (_, t_b, _) = t_values(&stats, 2);
        assert_eq!(t_map.frame(1)[1], t_b[0]);
        assert_eq!(t_map.frame(1)[3], t_b[1]);
        assert_eq!(t_map.frame(1)[0], 0.0);
        assert_eq!(writer.volume(F_MAP).unwrap().n_frames, 1);
        assert_eq!(writer.volume(BETA_MAP).unwrap().n_frames, 2);
        assert_eq!(writer.volume(BETA_MAP).unwrap().frame(1)[3], 0.1);
        assert_eq!(writer.volume(D_MAP).unwrap().n_frames, 1);
        assert!(writer.volume(COV_MAP).is_none());
    }
}
