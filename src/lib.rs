//! Sample from posterior densities with the No-U-Turn Sampler.
//!
//! A density is supplied as a [`LogpFunc`], which evaluates the log density
//! and its gradient in unconstrained space. Densities of constrained
//! parameters can be wrapped in a [`TransformedDensity`]. Chains run in
//! parallel, adapt their step size and mass matrix during warmup, and
//! collect their draws in a [`Trace`].
//!
//! ```
//! use nuts_sampler::{sample, DensityModel, LogpError, LogpFunc, NutsSettings};
//! use thiserror::Error;
//!
//! #[derive(Debug, Error)]
//! #[error("never happens")]
//! struct NoError;
//!
//! impl LogpError for NoError {
//!     fn is_recoverable(&self) -> bool {
//!         false
//!     }
//! }
//!
//! #[derive(Clone)]
//! struct StdNormal;
//!
//! impl LogpFunc for StdNormal {
//!     type LogpError = NoError;
//!
//!     fn logp(&mut self, x: &[f64], grad: &mut [f64]) -> Result<f64, NoError> {
//!         grad[0] = -x[0];
//!         Ok(-0.5 * x[0] * x[0])
//!     }
//!
//!     fn dim(&self) -> usize {
//!         1
//!     }
//! }
//!
//! let settings = NutsSettings {
//!     num_chains: 2,
//!     num_warmup: 200,
//!     num_draws: 200,
//!     ..Default::default()
//! };
//! let trace = sample(&DensityModel::new(StdNormal), &settings).unwrap();
//! assert_eq!(trace.samples().count(), 400);
//! ```

mod adapt;
mod chain;
mod hamiltonian;
mod mass_matrix;
mod math;
mod model;
mod nuts;
mod sampler;
mod starting;
mod state;
mod stepsize;
mod trace;
mod transform;

pub use hamiltonian::DivergenceInfo;
pub use mass_matrix::{MassMatrixAdaptOptions, MassMatrixKind, MassMatrixSnapshot};
pub use model::{DensityModel, LogpError, LogpFunc, Model};
pub use nuts::{NutsError, Result};
pub use sampler::{
    sample, sample_sequentially, sample_with_cancel, CancelToken, ChainProgress,
    ConfigurationError, InitStrategy, NutsSettings, Sampler, SamplerWaitResult,
};
pub use starting::{find_map, MapEstimate, MapOptions};
pub use stepsize::DualAverageOptions;
pub use trace::{
    ChainDiagnostics, ChainTrace, Draw, DrawStats, NumericalInstabilityWarning, RunDiagnostics,
    Trace,
};
pub use transform::{
    ConstrainedDensity, ParameterTransform, Transform, TransformError, TransformedDensity,
};
