//! Search for a high density starting point before sampling.

use crate::{
    math::{all_finite, axpy_out, vector_dot},
    model::{LogpError, LogpFunc},
    nuts::{NutsError, Result},
    sampler::ConfigurationError,
};

/// Settings for the maximum a posteriori search.
#[derive(Debug, Clone, PartialEq)]
pub struct MapOptions {
    pub max_iterations: usize,
    /// Stop once the largest absolute gradient entry is below this value.
    pub gradient_tolerance: f64,
    /// Sufficient increase constant of the Armijo condition.
    pub armijo: f64,
    pub max_backtracking: usize,
    /// Indices of the coordinates to optimize. All others keep their
    /// starting values. `None` optimizes every coordinate.
    pub free: Option<Vec<usize>>,
}

impl Default for MapOptions {
    fn default() -> Self {
        Self {
            max_iterations: 1000,
            gradient_tolerance: 1e-8,
            armijo: 1e-4,
            max_backtracking: 30,
            free: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MapEstimate {
    pub position: Box<[f64]>,
    pub logp: f64,
    pub iterations: usize,
    /// Whether the gradient tolerance was reached.
    pub converged: bool,
}

/// Evaluate the density, treating recoverable failures as zero density.
fn evaluate<F: LogpFunc>(density: &mut F, position: &[f64], gradient: &mut [f64]) -> Result<f64> {
    match density.logp(position, gradient) {
        Ok(logp) if logp.is_finite() & all_finite(gradient) => Ok(logp),
        Ok(_) => Ok(f64::NEG_INFINITY),
        Err(err) if err.is_recoverable() => Ok(f64::NEG_INFINITY),
        Err(err) => Err(NutsError::LogpFailure(Box::new(err))),
    }
}

fn max_abs(values: &[f64]) -> f64 {
    values.iter().fold(0f64, |acc, x| acc.max(x.abs()))
}

/// Zero the gradient of coordinates that are held fixed.
fn project(gradient: &mut [f64], fixed: &[bool]) {
    gradient
        .iter_mut()
        .zip(fixed)
        .filter(|(_, is_fixed)| **is_fixed)
        .for_each(|(grad, _)| *grad = 0.);
}

/// Find a local maximum of the log density by gradient ascent with a
/// backtracking line search.
///
/// The step length is doubled after every accepted step and halved until the
/// Armijo condition holds. Positions where the density is not finite are
/// rejected like any other insufficient step. The search stops when the
/// gradient vanishes or no step along the gradient increases the density.
/// Coordinates outside of [`MapOptions::free`] stay exactly at `start`.
pub fn find_map<F: LogpFunc>(
    density: &mut F,
    start: &[f64],
    options: &MapOptions,
) -> Result<MapEstimate> {
    let dim = start.len();
    let fixed: Vec<bool> = match &options.free {
        None => vec![false; dim],
        Some(free) => {
            let mut fixed = vec![true; dim];
            for &index in free {
                let Some(entry) = fixed.get_mut(index) else {
                    return Err(ConfigurationError::MapFreeIndex { index, dim }.into());
                };
                *entry = false;
            }
            fixed
        }
    };
    let mut position: Box<[f64]> = start.into();
    let mut gradient: Box<[f64]> = vec![0f64; dim].into();
    let mut trial: Box<[f64]> = vec![0f64; dim].into();
    let mut trial_gradient: Box<[f64]> = vec![0f64; dim].into();

    let mut logp = evaluate(density, &position, &mut gradient)?;
    if !logp.is_finite() {
        return Err(NutsError::BadInitPoint { tries: 1 });
    }
    project(&mut gradient, &fixed);

    let mut alpha = 1f64;
    let mut iterations = 0;
    let mut converged = false;
    while iterations < options.max_iterations {
        if max_abs(&gradient) < options.gradient_tolerance {
            converged = true;
            break;
        }
        iterations += 1;

        let slope = vector_dot(&gradient, &gradient);
        let mut accepted = false;
        for _ in 0..options.max_backtracking {
            axpy_out(&gradient, &position, alpha, &mut trial);
            let trial_logp = evaluate(density, &trial, &mut trial_gradient)?;
            project(&mut trial_gradient, &fixed);
            if trial_logp >= logp + options.armijo * alpha * slope {
                std::mem::swap(&mut position, &mut trial);
                std::mem::swap(&mut gradient, &mut trial_gradient);
                logp = trial_logp;
                accepted = true;
                break;
            }
            alpha *= 0.5;
        }
        if !accepted {
            break;
        }
        alpha *= 2.;
    }

    log::debug!(
        "MAP search stopped after {iterations} iterations at logp {logp:.4} (converged: {converged})"
    );

    Ok(MapEstimate {
        position,
        logp,
        iterations,
        converged,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::test_logps::{NormalLogp, TestLogpError};
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;

    #[test]
    fn gaussian_mode() {
        let mut density = NormalLogp::new(3, 1.5);
        let estimate = find_map(&mut density, &[0., -2., 4.], &MapOptions::default()).unwrap();
        assert!(estimate.converged);
        for &x in estimate.position.iter() {
            assert_abs_diff_eq!(x, 1.5, epsilon = 1e-8);
        }
        assert_abs_diff_eq!(estimate.logp, 0., epsilon = 1e-12);
    }

    /// Gamma(2, 1) log density, undefined for x <= 0.
    struct GammaLogp;

    impl LogpFunc for GammaLogp {
        type LogpError = TestLogpError;

        fn logp(
            &mut self,
            position: &[f64],
            gradient: &mut [f64],
        ) -> std::result::Result<f64, TestLogpError> {
            let x = position[0];
            if x <= 0. {
                return Err(TestLogpError::new(true));
            }
            gradient[0] = 1. / x - 1.;
            Ok(x.ln() - x)
        }

        fn dim(&self) -> usize {
            1
        }
    }

    #[test]
    fn respects_support() {
        let estimate = find_map(&mut GammaLogp, &[0.05], &MapOptions::default()).unwrap();
        assert!(estimate.converged);
        assert_abs_diff_eq!(estimate.position[0], 1., epsilon = 1e-6);
    }

    #[test]
    fn start_outside_support() {
        assert!(matches!(
            find_map(&mut GammaLogp, &[-1.], &MapOptions::default()),
            Err(NutsError::BadInitPoint { .. })
        ));
    }

    #[test]
    fn fixed_coordinates_keep_their_start() {
        let mut density = NormalLogp::new(3, 1.5);
        let start = [0.25, -2., 4.];
        let options = MapOptions {
            free: Some(vec![1]),
            ..Default::default()
        };
        let estimate = find_map(&mut density, &start, &options).unwrap();
        assert!(estimate.converged);
        assert_eq!(estimate.position[0].to_bits(), start[0].to_bits());
        assert_eq!(estimate.position[2].to_bits(), start[2].to_bits());
        assert_abs_diff_eq!(estimate.position[1], 1.5, epsilon = 1e-8);

        let everything_fixed = MapOptions {
            free: Some(vec![]),
            ..Default::default()
        };
        let estimate = find_map(&mut density, &start, &everything_fixed).unwrap();
        assert!(estimate.converged);
        assert_eq!(estimate.iterations, 0);
        assert_eq!(&estimate.position[..], &start[..]);
    }

    #[test]
    fn free_index_out_of_range() {
        let options = MapOptions {
            free: Some(vec![0, 3]),
            ..Default::default()
        };
        assert!(matches!(
            find_map(&mut NormalLogp::new(3, 0.), &[0.; 3], &options),
            Err(NutsError::Configuration(ConfigurationError::MapFreeIndex {
                index: 3,
                dim: 3
            }))
        ));
    }

    #[test]
    fn unrecoverable_error_stops_search() {
        let mut density = NormalLogp::new(1, 0.).with_error_outside(0.5, false);
        let result = find_map(&mut density, &[0.4], &MapOptions::default());
        assert!(result.is_ok());
        let result = find_map(&mut density, &[5.], &MapOptions::default());
        assert!(matches!(result, Err(NutsError::LogpFailure(_))));
    }
}
