//! The interface between the sampler and a user supplied posterior density.
//!
//! The sampler never looks at how a log density and its gradient are
//! computed. A [`LogpFunc`] is a capability: evaluate the density at a point
//! in unconstrained space and write the gradient into a buffer. A [`Model`]
//! hands out one such function per chain and chooses initial points.

use std::fmt::Debug;

use anyhow::Result;
use rand::Rng;
use rand_distr::{Distribution, Uniform};

/// Errors that happen when we evaluate the logp and gradient function
pub trait LogpError: std::error::Error + Send + Sync {
    /// Unrecoverable errors during logp computation stop sampling,
    /// recoverable errors are seen as divergences.
    fn is_recoverable(&self) -> bool;
}

/// A log density over an unconstrained real vector.
///
/// Implementations must be deterministic: evaluating the same position twice
/// has to give the same value and gradient, independent of earlier calls.
pub trait LogpFunc {
    type LogpError: LogpError + Debug + 'static;

    /// Compute the unnormalized log probability density and write its
    /// gradient into `gradient`.
    fn logp(&mut self, position: &[f64], gradient: &mut [f64]) -> Result<f64, Self::LogpError>;

    /// The number of unconstrained parameters.
    fn dim(&self) -> usize;

    /// Map an unconstrained draw to the values stored in the trace.
    ///
    /// The default stores the unconstrained position unchanged.
    fn expand_vector(&mut self, position: &[f64]) -> Result<Box<[f64]>, Self::LogpError> {
        Ok(position.into())
    }
}

/// A posterior that can be sampled by several chains at once.
///
/// The model itself is shared between worker threads, every chain gets its
/// own density instance from [`Model::density`].
pub trait Model: Send + Sync {
    type Density<'model>: LogpFunc
    where
        Self: 'model;

    /// Create a density evaluator for one chain.
    fn density(&self) -> Result<Self::Density<'_>>;

    /// The number of unconstrained parameters.
    fn dim(&self) -> usize;

    /// Initializes the starting position for a chain.
    ///
    /// The starting position should be in a region where the log density
    /// is finite. The sampler retries with new random numbers if it is not.
    fn init_position<R: Rng + ?Sized>(&self, rng: &mut R, position: &mut [f64]) -> Result<()>;
}

/// A model built from a cloneable density.
///
/// Each chain receives its own clone. Initial points are drawn uniformly
/// from `[-init_radius, init_radius]` in every dimension.
#[derive(Debug, Clone)]
pub struct DensityModel<F> {
    density: F,
    init_radius: f64,
}

impl<F> DensityModel<F> {
    pub fn new(density: F) -> Self {
        Self {
            density,
            init_radius: 2.,
        }
    }

    pub fn with_init_radius(mut self, init_radius: f64) -> Self {
        self.init_radius = init_radius;
        self
    }
}

impl<F> Model for DensityModel<F>
where
    F: LogpFunc + Clone + Send + Sync,
{
    type Density<'model>
        = F
    where
        Self: 'model;

    fn density(&self) -> Result<Self::Density<'_>> {
        Ok(self.density.clone())
    }

    fn dim(&self) -> usize {
        self.density.dim()
    }

    fn init_position<R: Rng + ?Sized>(&self, rng: &mut R, position: &mut [f64]) -> Result<()> {
        if self.init_radius == 0. {
            position.fill(0.);
            return Ok(());
        }
        let dist = Uniform::new_inclusive(-self.init_radius, self.init_radius)?;
        position.iter_mut().for_each(|x| *x = dist.sample(rng));
        Ok(())
    }
}
