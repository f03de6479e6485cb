use approx::assert_abs_diff_eq;
use nuts_sampler::{
    sample, ConstrainedDensity, DensityModel, InitStrategy, LogpError, MapOptions,
    NutsSettings, ParameterTransform, Transform, TransformedDensity,
};
use thiserror::Error;

#[derive(Error, Debug)]
#[error("Value outside of the support")]
struct OutsideSupport;

impl LogpError for OutsideSupport {
    fn is_recoverable(&self) -> bool {
        true
    }
}

/// Exponential(rate) on the first value and Beta(2, 2) on the second.
#[derive(Clone, Debug)]
struct ExpBeta {
    rate: f64,
}

impl ConstrainedDensity for ExpBeta {
    type LogpError = OutsideSupport;

    fn logp(&mut self, values: &[f64], gradient: &mut [f64]) -> Result<f64, OutsideSupport> {
        let (x, y) = (values[0], values[1]);
        if (x <= 0.) | (y <= 0.) | (y >= 1.) {
            return Err(OutsideSupport);
        }
        gradient[0] = -self.rate;
        gradient[1] = 1. / y - 1. / (1. - y);
        Ok(self.rate.ln() - self.rate * x + 6f64.ln() + y.ln() + (1. - y).ln())
    }

    fn dim(&self) -> usize {
        2
    }
}

fn model() -> DensityModel<TransformedDensity<ExpBeta>> {
    let transform = ParameterTransform::new(vec![Transform::POSITIVE, Transform::UNIT_INTERVAL]);
    let density =
        TransformedDensity::new(ExpBeta { rate: 2. }, transform).expect("Dimensions must match");
    DensityModel::new(density)
}

#[test]
fn constrained_draws_follow_the_density() -> nuts_sampler::Result<()> {
    let settings = NutsSettings {
        num_chains: 4,
        num_warmup: 1000,
        num_draws: 1000,
        seed: 5,
        ..Default::default()
    };
    let trace = sample(&model(), &settings)?;

    let n = trace.samples().count() as f64;
    assert!(trace
        .samples()
        .all(|d| (d.values[0] > 0.) & (d.values[1] > 0.) & (d.values[1] < 1.)));

    // Exponential(2) has mean 0.5, Beta(2, 2) has mean 0.5 and variance 0.05.
    let mean_x = trace.samples().map(|d| d.values[0]).sum::<f64>() / n;
    let mean_y = trace.samples().map(|d| d.values[1]).sum::<f64>() / n;
    let var_y = trace
        .samples()
        .map(|d| (d.values[1] - mean_y).powi(2))
        .sum::<f64>()
        / (n - 1.);
    assert_abs_diff_eq!(mean_x, 0.5, epsilon = 0.05);
    assert_abs_diff_eq!(mean_y, 0.5, epsilon = 0.03);
    assert_abs_diff_eq!(var_y, 0.05, epsilon = 0.01);

    // Positions stay in unconstrained space.
    assert!(trace.samples().any(|d| d.position[0] < 0.));
    Ok(())
}

#[test]
fn map_initialization() -> nuts_sampler::Result<()> {
    let settings = NutsSettings {
        num_chains: 2,
        num_warmup: 200,
        num_draws: 100,
        init: InitStrategy::Map(MapOptions::default()),
        ..Default::default()
    };
    let trace = sample(&model(), &settings)?;
    assert!(trace.chains().iter().all(|chain| chain.len() == 300));
    Ok(())
}
