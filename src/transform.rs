//! Bijections between constrained parameters and the unconstrained space
//! the sampler moves in.
//!
//! `forward` maps a constrained value `x` to unconstrained `z`, `backward`
//! maps `z` back and also returns `log |dx/dz|`. A density over `x` becomes a
//! density over `z` by adding that log Jacobian, which is what
//! [`TransformedDensity`] does.

use std::fmt::Debug;

use itertools::izip;
use thiserror::Error;

use crate::math::{log_sigmoid, logit, sigmoid};
use crate::model::{LogpError, LogpFunc};

/// A per-dimension bijection from the real line onto the support of a parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Transform {
    /// `x = z`
    Identity,
    /// `x = lower + exp(z)`
    LowerBounded(f64),
    /// `x = upper - exp(z)`
    UpperBounded(f64),
    /// `x = lower + (upper - lower) * sigmoid(z)`
    Interval(f64, f64),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransformError {
    #[error("Value {value} is outside the support of {transform:?}")]
    OutOfSupport { value: f64, transform: Transform },
    #[error("Invalid interval bounds ({0}, {1})")]
    InvalidBounds(f64, f64),
    #[error("Expected {expected} values but got {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

impl Transform {
    /// Values in `(0, inf)`.
    pub const POSITIVE: Transform = Transform::LowerBounded(0.);

    /// Values in `(0, 1)`.
    pub const UNIT_INTERVAL: Transform = Transform::Interval(0., 1.);

    pub fn interval(lower: f64, upper: f64) -> Result<Self, TransformError> {
        if !(lower < upper) | !lower.is_finite() | !upper.is_finite() {
            return Err(TransformError::InvalidBounds(lower, upper));
        }
        Ok(Transform::Interval(lower, upper))
    }

    /// Whether `x` lies in the open support of the transform.
    pub fn contains(&self, x: f64) -> bool {
        match *self {
            Transform::Identity => !x.is_nan(),
            Transform::LowerBounded(lower) => x > lower,
            Transform::UpperBounded(upper) => x < upper,
            Transform::Interval(lower, upper) => (x > lower) & (x < upper),
        }
    }

    /// Map a constrained value to unconstrained space.
    pub fn forward(&self, x: f64) -> Result<f64, TransformError> {
        if !self.contains(x) {
            return Err(TransformError::OutOfSupport {
                value: x,
                transform: *self,
            });
        }
        let z = match *self {
            Transform::Identity => x,
            Transform::LowerBounded(lower) => (x - lower).ln(),
            Transform::UpperBounded(upper) => (upper - x).ln(),
            Transform::Interval(lower, upper) => logit((x - lower) / (upper - lower)),
        };
        Ok(z)
    }

    /// Map an unconstrained value back, returning `(x, log |dx/dz|)`.
    pub fn backward(&self, z: f64) -> (f64, f64) {
        match *self {
            Transform::Identity => (z, 0.),
            Transform::LowerBounded(lower) => (lower + z.exp(), z),
            Transform::UpperBounded(upper) => (upper - z.exp(), z),
            Transform::Interval(lower, upper) => {
                let width = upper - lower;
                let x = lower + width * sigmoid(z);
                let log_det = width.ln() + log_sigmoid(z) + log_sigmoid(-z);
                (x, log_det)
            }
        }
    }

    /// `dx/dz` at `z`.
    pub fn jacobian(&self, z: f64) -> f64 {
        match *self {
            Transform::Identity => 1.,
            Transform::LowerBounded(_) => z.exp(),
            Transform::UpperBounded(_) => -z.exp(),
            Transform::Interval(lower, upper) => {
                let s = sigmoid(z);
                (upper - lower) * s * (1. - s)
            }
        }
    }

    /// `d/dz log |dx/dz|` at `z`.
    pub fn grad_log_det_jacobian(&self, z: f64) -> f64 {
        match *self {
            Transform::Identity => 0.,
            Transform::LowerBounded(_) | Transform::UpperBounded(_) => 1.,
            Transform::Interval(_, _) => 1. - 2. * sigmoid(z),
        }
    }
}

/// One transform per dimension of the parameter vector.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterTransform {
    transforms: Vec<Transform>,
}

impl ParameterTransform {
    pub fn new(transforms: Vec<Transform>) -> Self {
        Self { transforms }
    }

    pub fn identity(dim: usize) -> Self {
        Self::new(vec![Transform::Identity; dim])
    }

    pub fn dim(&self) -> usize {
        self.transforms.len()
    }

    pub fn transforms(&self) -> &[Transform] {
        &self.transforms
    }

    pub fn forward(&self, constrained: &[f64]) -> Result<Vec<f64>, TransformError> {
        self.check_dim(constrained.len())?;
        self.transforms
            .iter()
            .zip(constrained)
            .map(|(t, &x)| t.forward(x))
            .collect()
    }

    /// Returns the constrained values and the total log Jacobian determinant.
    pub fn backward(&self, unconstrained: &[f64]) -> Result<(Vec<f64>, f64), TransformError> {
        self.check_dim(unconstrained.len())?;
        let mut out = vec![0f64; self.dim()];
        let log_det = self.backward_into(unconstrained, &mut out);
        Ok((out, log_det))
    }

    fn backward_into(&self, unconstrained: &[f64], out: &mut [f64]) -> f64 {
        izip!(&self.transforms, unconstrained, out).fold(0f64, |log_det, (t, &z, x)| {
            let (val, term) = t.backward(z);
            *x = val;
            log_det + term
        })
    }

    fn check_dim(&self, got: usize) -> Result<(), TransformError> {
        if got != self.dim() {
            return Err(TransformError::DimensionMismatch {
                expected: self.dim(),
                got,
            });
        }
        Ok(())
    }
}

/// A log density over constrained parameter values.
pub trait ConstrainedDensity {
    type LogpError: LogpError + Debug + 'static;

    /// Log density at `values`, with the gradient with respect to `values`.
    fn logp(&mut self, values: &[f64], gradient: &mut [f64]) -> Result<f64, Self::LogpError>;

    fn dim(&self) -> usize;
}

/// Adapts a [`ConstrainedDensity`] to unconstrained space.
///
/// The reported log density includes the log Jacobian determinant, so
/// sampling `z` from it and mapping through `backward` samples the original
/// constrained density.
#[derive(Debug, Clone)]
pub struct TransformedDensity<F> {
    density: F,
    transform: ParameterTransform,
    values: Box<[f64]>,
    value_grad: Box<[f64]>,
}

impl<F: ConstrainedDensity> TransformedDensity<F> {
    pub fn new(density: F, transform: ParameterTransform) -> Result<Self, TransformError> {
        let dim = density.dim();
        transform.check_dim(dim)?;
        Ok(Self {
            density,
            transform,
            values: vec![0f64; dim].into(),
            value_grad: vec![0f64; dim].into(),
        })
    }

    pub fn transform(&self) -> &ParameterTransform {
        &self.transform
    }

    pub fn inner(&self) -> &F {
        &self.density
    }
}

impl<F: ConstrainedDensity> LogpFunc for TransformedDensity<F> {
    type LogpError = F::LogpError;

    fn logp(&mut self, position: &[f64], gradient: &mut [f64]) -> Result<f64, Self::LogpError> {
        let log_det = self.transform.backward_into(position, &mut self.values);
        let logp = self.density.logp(&self.values, &mut self.value_grad)?;

        izip!(
            self.transform.transforms(),
            position,
            self.value_grad.iter(),
            gradient.iter_mut()
        )
        .for_each(|(t, &z, &dx, grad)| {
            *grad = dx * t.jacobian(z) + t.grad_log_det_jacobian(z);
        });

        Ok(logp + log_det)
    }

    fn dim(&self) -> usize {
        self.transform.dim()
    }

    fn expand_vector(&mut self, position: &[f64]) -> Result<Box<[f64]>, Self::LogpError> {
        let mut out = vec![0f64; self.dim()];
        self.transform.backward_into(position, &mut out);
        Ok(out.into())
    }
}
