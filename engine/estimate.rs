//! # Variance-component estimation
//!
//! The inference engine only needs β, σ² and D at every voxel; how they are found
//! is behind the [`Estimator`] trait. [`FisherScoring`] is the estimator the
//! binary uses. It works entirely from the product matrices:
//!
//! 1.  Start from ordinary least squares with `D = 0`.
//! 2.  For the current `D`, profile out β by generalised least squares and σ² from
//!     the weighted residual sum of squares.
//! 3.  Take a Fisher-scoring step on every `vech(D_k)`, halving it until the
//!     log-likelihood stops decreasing, and project each `D_k` back onto the
//!     positive semi-definite cone.
//! 4.  Stop once the relative change in log-likelihood falls below the tolerance.

use crate::linalg::{duplication_matrix, project_psd, solve_or_nan, unvech, vec_columns, vech};
use crate::marginal::{
    MarginalTerms, d_information, expand_blocks, factor_blocks, log_likelihood, residual_terms,
    weighted_residual,
};
use crate::products::{ProductBlock, VoxelProducts};
use crate::types::RandomEffectsLayout;
use ndarray::{Array1, Array2, Array3, Axis, s};
use thiserror::Error;

const MAX_STEP_HALVINGS: usize = 10;

#[derive(Debug, Error)]
pub enum EstimationError {
    #[error("the product block has q = {found} random effects but the layout describes {expected}")]
    LayoutMismatch { expected: usize, found: usize },
}

/// Fitted parameters for every voxel of a subset, in subset order.
#[derive(Debug, Clone)]
pub struct ModelFit {
    /// (voxels × p)
    pub beta: Array2<f64>,
    pub sigma2: Array1<f64>,
    /// (voxels × q × q)
    pub d: Array3<f64>,
}

impl ModelFit {
    pub fn n_voxels(&self) -> usize {
        self.sigma2.len()
    }
}

pub trait Estimator {
    fn estimate(
        &self,
        block: &ProductBlock,
        layout: &RandomEffectsLayout,
    ) -> Result<ModelFit, EstimationError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct FisherScoringOptions {
    pub max_iterations: usize,
    /// Relative log-likelihood change that counts as converged.
    pub tolerance: f64,
    pub reml: bool,
}

impl Default for FisherScoringOptions {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            tolerance: 1e-6,
            reml: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FisherScoring {
    options: FisherScoringOptions,
}

/// β and σ² profiled at a fixed `D`.
struct Profile {
    d: Array2<f64>,
    beta: Array1<f64>,
    sigma2: f64,
    llh: f64,
    terms: MarginalTerms,
    /// `Z'V⁻¹e`
    ztive: Array1<f64>,
}

impl FisherScoring {
    pub fn new(options: FisherScoringOptions) -> Self {
        Self { options }
    }

    fn profile(&self, products: &VoxelProducts<'_>, d: Array2<f64>) -> Profile {
        let terms = MarginalTerms::new(products, &d.view());
        let beta = terms.gls_beta(products);
        let (ete, zte) = residual_terms(products, &beta.view());
        let p = beta.len() as f64;
        let denominator = if self.options.reml { products.n - p } else { products.n };
        let sigma2 = weighted_residual(ete, &zte.view(), &terms) / denominator;
        let llh = log_likelihood(products.n, sigma2, ete, &zte.view(), &terms, self.options.reml);
        let ztive = &zte - &products.ztz.dot(&terms.m.dot(&zte));
        Profile {
            d,
            beta,
            sigma2,
            llh,
            terms,
            ztive,
        }
    }

    /// Score of the stacked `vech(D_k)` at the current profile.
    fn score(&self, layout: &RandomEffectsLayout, current: &Profile) -> Array1<f64> {
        let mut score = Array1::zeros(layout.q_unique());
        for factor in 0..layout.n_factors() {
            let params = layout.params(factor);
            let mut acc = Array2::<f64>::zeros((params, params));
            for level in 0..layout.levels(factor) {
                let range = layout.level_range(factor, level);
                let u = current.ztive.slice(s![range.clone()]);
                let outer = u
                    .view()
                    .insert_axis(Axis(1))
                    .dot(&u.view().insert_axis(Axis(0)));
                acc += &(outer / current.sigma2);
                acc -= &current.terms.ztivz.slice(s![range.clone(), range]);
            }
            let value = duplication_matrix(params).t().dot(&vec_columns(&acc.view())) * 0.5;
            score.slice_mut(s![layout.vech_range(factor)]).assign(&value);
        }
        score
    }

    fn fit_voxel(&self, products: &VoxelProducts<'_>, layout: &RandomEffectsLayout) -> Profile {
        let q = layout.q();
        let mut current = self.profile(products, Array2::zeros((q, q)));

        for iteration in 0..self.options.max_iterations {
            if !current.llh.is_finite() {
                break;
            }
            let blocks = factor_blocks(layout, &current.d.view());
            let mut theta = Array1::zeros(layout.q_unique());
            for (factor, block) in blocks.iter().enumerate() {
                theta
                    .slice_mut(s![layout.vech_range(factor)])
                    .assign(&vech(&block.view()));
            }
            let score = self.score(layout, &current);
            let info = d_information(layout, &current.terms.ztivz.view());
            let step = solve_or_nan(&info.view(), &score.view());
            if step.iter().any(|value| !value.is_finite()) {
                break;
            }

            let mut accepted = None;
            let mut scale = 1.0;
            for _ in 0..MAX_STEP_HALVINGS {
                let candidate_theta = &theta + &(&step * scale);
                let candidate_blocks: Vec<Array2<f64>> = (0..layout.n_factors())
                    .map(|factor| {
                        let values = candidate_theta.slice(s![layout.vech_range(factor)]);
                        project_psd(&unvech(&values, layout.params(factor)).view())
                    })
                    .collect();
                let candidate = self.profile(products, expand_blocks(layout, &candidate_blocks));
                if candidate.llh.is_finite() && candidate.llh >= current.llh {
                    accepted = Some(candidate);
                    break;
                }
                scale *= 0.5;
            }
            let Some(next) = accepted else {
                break;
            };

            let change = (next.llh - current.llh).abs() / current.llh.abs().max(1.0);
            current = next;
            if change < self.options.tolerance {
                log::trace!("Voxel converged after {} iterations", iteration + 1);
                break;
            }
        }
        current
    }
}

impl Estimator for FisherScoring {
    fn estimate(
        &self,
        block: &ProductBlock,
        layout: &RandomEffectsLayout,
    ) -> Result<ModelFit, EstimationError> {
        if block.q() != layout.q() {
            return Err(EstimationError::LayoutMismatch {
                expected: layout.q(),
                found: block.q(),
            });
        }
        let voxels = block.n_voxels();
        let q = layout.q();
        let mut fit = ModelFit {
            beta: Array2::zeros((voxels, block.p())),
            sigma2: Array1::zeros(voxels),
            d: Array3::zeros((voxels, q, q)),
        };
        for voxel in 0..voxels {
            let result = self.fit_voxel(&block.voxel(voxel), layout);
            fit.beta.row_mut(voxel).assign(&result.beta);
            fit.sigma2[voxel] = result.sigma2;
            fit.d.index_axis_mut(Axis(0), voxel).assign(&result.d);
        }
        Ok(fit)
    }
}
