use faer::{Mat, Side};
use itertools::izip;
use multiversion::multiversion;
use rand::Rng;
use rand_distr::StandardNormal;

use crate::{
    math::{multiply, vector_dot},
    state::InnerState,
};

/// Settings for mass matrix adaptation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MassMatrixAdaptOptions {
    /// Size of the initial fast window where only the step size is tuned.
    pub init_buffer: u64,
    /// Size of the final fast window where only the step size is tuned.
    ///
    /// The final step size is calibrated in this window, which needs more
    /// draws than Stan's default of 50.
    pub term_buffer: u64,
    /// Length of the first slow window. Later windows double in size.
    pub base_window: u64,
    /// The estimate is shrunk towards `regularization * I`...
    pub regularization: f64,
    /// ...with the weight of this many pseudo draws.
    pub prior_count: f64,
}

impl Default for MassMatrixAdaptOptions {
    fn default() -> Self {
        Self {
            init_buffer: 75,
            term_buffer: 200,
            base_window: 25,
            regularization: 1e-3,
            prior_count: 5.,
        }
    }
}

/// Which kind of mass matrix a chain uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MassMatrixKind {
    /// Unit mass matrix, never adapted.
    Identity,
    /// Diagonal mass matrix estimated from posterior variances.
    #[default]
    Diagonal,
    /// Full mass matrix estimated from the posterior covariance.
    Dense,
}

/// The inverse mass matrix at some point of a run.
#[derive(Debug, Clone, PartialEq)]
pub enum MassMatrixSnapshot {
    Identity { dim: usize },
    Diagonal { inv_mass: Box<[f64]> },
    /// Row major `dim x dim` matrix.
    Dense { dim: usize, inv_mass: Box<[f64]> },
}

impl MassMatrixSnapshot {
    /// The diagonal of the inverse mass matrix.
    pub fn diagonal(&self) -> Vec<f64> {
        match self {
            MassMatrixSnapshot::Identity { dim } => vec![1f64; *dim],
            MassMatrixSnapshot::Diagonal { inv_mass } => inv_mass.to_vec(),
            MassMatrixSnapshot::Dense { dim, inv_mass } => {
                (0..*dim).map(|i| inv_mass[i * dim + i]).collect()
            }
        }
    }
}

pub(crate) trait VarianceEstimator {
    fn add_sample(&mut self, value: &[f64]);
    fn count(&self) -> u64;
    fn reset(&mut self);
}

pub(crate) trait MassMatrix {
    type Estimator: VarianceEstimator;

    /// A unit mass matrix of the given dimension.
    fn new(dim: usize) -> Self;

    fn update_velocity(&self, state: &mut InnerState);

    fn update_kinetic_energy(&self, state: &mut InnerState) {
        state.kinetic_energy = 0.5 * vector_dot(&state.p, &state.v);
    }

    /// Draw a momentum from `N(0, M)`.
    fn randomize_momentum<R: Rng + ?Sized>(&self, state: &mut InnerState, rng: &mut R);

    fn new_estimator(&self) -> Self::Estimator;

    /// Replace the mass matrix by the regularized estimate.
    ///
    /// Returns whether the mass matrix changed.
    fn update_from_estimator(
        &mut self,
        estimator: &Self::Estimator,
        options: &MassMatrixAdaptOptions,
    ) -> bool;

    fn snapshot(&self) -> MassMatrixSnapshot;
}

/// Shrinkage weights `(n / (n + k), reg * k / (n + k))`.
fn shrinkage(count: u64, options: &MassMatrixAdaptOptions) -> (f64, f64) {
    let n = count as f64;
    let k = options.prior_count;
    (n / (n + k), options.regularization * k / (n + k))
}

pub(crate) struct NullEstimator {
    count: u64,
}

impl VarianceEstimator for NullEstimator {
    fn add_sample(&mut self, _value: &[f64]) {
        self.count += 1;
    }

    fn count(&self) -> u64 {
        self.count
    }

    fn reset(&mut self) {
        self.count = 0;
    }
}

#[derive(Debug)]
pub(crate) struct IdentityMassMatrix {
    dim: usize,
}

impl MassMatrix for IdentityMassMatrix {
    type Estimator = NullEstimator;

    fn new(dim: usize) -> Self {
        Self { dim }
    }

    fn update_velocity(&self, state: &mut InnerState) {
        state.v.copy_from_slice(&state.p);
    }

    fn randomize_momentum<R: Rng + ?Sized>(&self, state: &mut InnerState, rng: &mut R) {
        state.p.iter_mut().for_each(|p| *p = rng.sample(StandardNormal));
    }

    fn new_estimator(&self) -> Self::Estimator {
        NullEstimator { count: 0 }
    }

    fn update_from_estimator(
        &mut self,
        _estimator: &Self::Estimator,
        _options: &MassMatrixAdaptOptions,
    ) -> bool {
        false
    }

    fn snapshot(&self) -> MassMatrixSnapshot {
        MassMatrixSnapshot::Identity { dim: self.dim }
    }
}

#[derive(Debug)]
pub(crate) struct DiagMassMatrix {
    inv_stds: Box<[f64]>,
    pub(crate) variance: Box<[f64]>,
}

impl DiagMassMatrix {
    pub(crate) fn update_diag(&mut self, new_variance: impl Iterator<Item = f64>) -> bool {
        let new_variance: Vec<f64> = new_variance.collect();
        if new_variance.iter().any(|&x| !x.is_finite() || x <= 0.) {
            log::warn!("Skipping mass matrix update with invalid variance estimate");
            return false;
        }
        update_diag(&mut self.variance, &mut self.inv_stds, &new_variance);
        true
    }
}

#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
fn update_diag(variance_out: &mut [f64], inv_std_out: &mut [f64], new_variance: &[f64]) {
    izip!(variance_out, inv_std_out, new_variance).for_each(|(var, inv_std, &x)| {
        *var = x;
        *inv_std = x.sqrt().recip();
    });
}

impl MassMatrix for DiagMassMatrix {
    type Estimator = WelfordVariance;

    fn new(dim: usize) -> Self {
        Self {
            inv_stds: vec![1f64; dim].into(),
            variance: vec![1f64; dim].into(),
        }
    }

    fn update_velocity(&self, state: &mut InnerState) {
        multiply(&self.variance, &state.p, &mut state.v);
    }

    fn randomize_momentum<R: Rng + ?Sized>(&self, state: &mut InnerState, rng: &mut R) {
        state
            .p
            .iter_mut()
            .zip(self.inv_stds.iter())
            .for_each(|(p, &s)| {
                let norm: f64 = rng.sample(StandardNormal);
                *p = s * norm;
            });
    }

    fn new_estimator(&self) -> Self::Estimator {
        WelfordVariance::new(self.variance.len())
    }

    fn update_from_estimator(
        &mut self,
        estimator: &Self::Estimator,
        options: &MassMatrixAdaptOptions,
    ) -> bool {
        let Some(variance) = estimator.current() else {
            return false;
        };
        let (weight, shift) = shrinkage(estimator.count(), options);
        self.update_diag(variance.iter().map(|&var| weight * var + shift))
    }

    fn snapshot(&self) -> MassMatrixSnapshot {
        MassMatrixSnapshot::Diagonal {
            inv_mass: self.variance.clone(),
        }
    }
}

/// Mass matrix with a full covariance as inverse mass.
///
/// Velocities are `cov * p`. Momenta are sampled as `L^-T z` where
/// `cov = L L^T`, which has covariance `cov^-1`.
#[derive(Debug)]
pub(crate) struct DenseMassMatrix {
    dim: usize,
    /// Row major inverse mass matrix.
    cov: Box<[f64]>,
    /// Column major lower Cholesky factor of `cov`.
    chol: Box<[f64]>,
}

impl DenseMassMatrix {
    fn set_covariance(&mut self, cov: Mat<f64>) -> bool {
        let dim = self.dim;
        let llt = match cov.llt(Side::Lower) {
            Ok(llt) => llt,
            Err(err) => {
                log::warn!(
                    "Skipping mass matrix update, covariance is not positive definite: {err:?}"
                );
                return false;
            }
        };
        let factor = llt.L().to_owned();
        let mut chol = vec![0f64; dim * dim];
        for j in 0..dim {
            // Only the lower triangle of the factor is meaningful.
            let col = factor.col_as_slice(j);
            chol[j * dim + j..(j + 1) * dim].copy_from_slice(&col[j..]);
        }
        if !chol.iter().all(|x| x.is_finite()) {
            log::warn!("Skipping mass matrix update with non-finite Cholesky factor");
            return false;
        }
        let mut flat = vec![0f64; dim * dim];
        for i in 0..dim {
            for j in 0..dim {
                flat[i * dim + j] = cov.col_as_slice(j)[i];
            }
        }
        self.cov = flat.into();
        self.chol = chol.into();
        true
    }
}

impl MassMatrix for DenseMassMatrix {
    type Estimator = WelfordCovariance;

    fn new(dim: usize) -> Self {
        let mut eye = vec![0f64; dim * dim];
        (0..dim).for_each(|i| eye[i * dim + i] = 1.);
        Self {
            dim,
            cov: eye.clone().into(),
            chol: eye.into(),
        }
    }

    fn update_velocity(&self, state: &mut InnerState) {
        let dim = self.dim;
        state
            .v
            .iter_mut()
            .zip(self.cov.chunks_exact(dim))
            .for_each(|(v, row)| *v = vector_dot(row, &state.p));
    }

    fn randomize_momentum<R: Rng + ?Sized>(&self, state: &mut InnerState, rng: &mut R) {
        let dim = self.dim;
        state.p.iter_mut().for_each(|p| *p = rng.sample(StandardNormal));
        // Solve L^T p = z by back substitution. Column i of L is row i of L^T.
        for i in (0..dim).rev() {
            let col = &self.chol[i * dim..(i + 1) * dim];
            let tail: f64 = (i + 1..dim).map(|k| col[k] * state.p[k]).sum();
            state.p[i] = (state.p[i] - tail) / col[i];
        }
    }

    fn new_estimator(&self) -> Self::Estimator {
        WelfordCovariance::new(self.dim)
    }

    fn update_from_estimator(
        &mut self,
        estimator: &Self::Estimator,
        options: &MassMatrixAdaptOptions,
    ) -> bool {
        let Some(cov) = estimator.current() else {
            return false;
        };
        let (weight, shift) = shrinkage(estimator.count(), options);
        let dim = self.dim;
        let cov = Mat::from_fn(dim, dim, |i, j| {
            let val = weight * cov[i * dim + j];
            if i == j {
                val + shift
            } else {
                val
            }
        });
        self.set_covariance(cov)
    }

    fn snapshot(&self) -> MassMatrixSnapshot {
        MassMatrixSnapshot::Dense {
            dim: self.dim,
            inv_mass: self.cov.clone(),
        }
    }
}

/// Welford accumulator for elementwise sample variances.
#[derive(Debug)]
pub(crate) struct WelfordVariance {
    mean: Box<[f64]>,
    m2: Box<[f64]>,
    count: u64,
}

impl WelfordVariance {
    pub(crate) fn new(dim: usize) -> Self {
        Self {
            mean: vec![0f64; dim].into(),
            m2: vec![0f64; dim].into(),
            count: 0,
        }
    }

    /// The unbiased sample variance, if at least three samples were seen.
    pub(crate) fn current(&self) -> Option<Vec<f64>> {
        if self.count < 3 {
            return None;
        }
        let scale = ((self.count - 1) as f64).recip();
        Some(self.m2.iter().map(|m2| m2 * scale).collect())
    }
}

impl VarianceEstimator for WelfordVariance {
    fn add_sample(&mut self, value: &[f64]) {
        self.count += 1;
        let weight = (self.count as f64).recip();
        izip!(self.mean.iter_mut(), self.m2.iter_mut(), value).for_each(|(mean, m2, &x)| {
            let delta = x - *mean;
            *mean += weight * delta;
            *m2 += delta * (x - *mean);
        });
    }

    fn count(&self) -> u64 {
        self.count
    }

    fn reset(&mut self) {
        self.mean.fill(0.);
        self.m2.fill(0.);
        self.count = 0;
    }
}

/// Welford accumulator for the full sample covariance.
#[derive(Debug)]
pub(crate) struct WelfordCovariance {
    dim: usize,
    mean: Box<[f64]>,
    delta: Box<[f64]>,
    /// Row major sum of outer products.
    m2: Box<[f64]>,
    count: u64,
}

impl WelfordCovariance {
    pub(crate) fn new(dim: usize) -> Self {
        Self {
            dim,
            mean: vec![0f64; dim].into(),
            delta: vec![0f64; dim].into(),
            m2: vec![0f64; dim * dim].into(),
            count: 0,
        }
    }

    /// Row major unbiased sample covariance, if at least three samples were seen.
    pub(crate) fn current(&self) -> Option<Vec<f64>> {
        if self.count < 3 {
            return None;
        }
        let scale = ((self.count - 1) as f64).recip();
        Some(self.m2.iter().map(|m2| m2 * scale).collect())
    }
}

impl VarianceEstimator for WelfordCovariance {
    fn add_sample(&mut self, value: &[f64]) {
        self.count += 1;
        let weight = (self.count as f64).recip();
        izip!(self.delta.iter_mut(), self.mean.iter_mut(), value).for_each(
            |(delta, mean, &x)| {
                *delta = x - *mean;
                *mean += weight * *delta;
            },
        );
        for (row, &delta) in self.m2.chunks_exact_mut(self.dim).zip(self.delta.iter()) {
            izip!(row, value, self.mean.iter()).for_each(|(m2, &x, &mean)| {
                *m2 += delta * (x - mean);
            });
        }
    }

    fn count(&self) -> u64 {
        self.count
    }

    fn reset(&mut self) {
        self.mean.fill(0.);
        self.m2.fill(0.);
        self.count = 0;
    }
}
