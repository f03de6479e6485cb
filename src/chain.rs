use rand::Rng;

use crate::{
    adapt::WarmupAdaptation,
    hamiltonian::EuclideanHamiltonian,
    mass_matrix::{MassMatrix, MassMatrixSnapshot},
    model::LogpFunc,
    nuts::{draw, NutsError, NutsOptions, Result},
    sampler::{ConfigurationError, NutsSettings},
    state::{State, StatePool},
    stepsize::AcceptanceRateCollector,
    trace::{Draw, DrawStats},
};

/// Draw samples from the posterior distribution using Hamiltonian MCMC.
///
/// A chain owns everything it mutates: density, mass matrix, adaptation
/// state and random number generator.
pub(crate) struct NutsChain<F, M, R>
where
    F: LogpFunc,
    M: MassMatrix,
    R: Rng,
{
    pool: StatePool,
    hamiltonian: EuclideanHamiltonian<F, M>,
    collector: AcceptanceRateCollector,
    options: NutsOptions,
    rng: R,
    state: State,
    chain: u64,
    draw_count: u64,
    adaptation: WarmupAdaptation<M>,
    initial_step_size: Option<f64>,
}

impl<F, M, R> NutsChain<F, M, R>
where
    F: LogpFunc,
    M: MassMatrix,
    R: Rng,
{
    pub(crate) fn new(logp: F, settings: &NutsSettings, rng: R, chain: u64) -> Self {
        let dim = logp.dim();
        let mass_matrix = M::new(dim);
        let adaptation = WarmupAdaptation::new(
            &mass_matrix,
            settings.num_warmup,
            settings.target_accept,
            settings.step_size_adapt,
            settings.mass_matrix_adapt,
        );
        let hamiltonian =
            EuclideanHamiltonian::new(logp, mass_matrix, settings.max_energy_error, 0.1);
        let pool_size = settings.maxdepth.saturating_mul(2).try_into().unwrap_or(usize::MAX);
        let pool = hamiltonian.new_pool(pool_size);
        let state = pool.new_state();
        NutsChain {
            pool,
            hamiltonian,
            collector: AcceptanceRateCollector::new(),
            options: NutsOptions {
                maxdepth: settings.maxdepth,
                store_divergences: settings.store_divergences,
            },
            rng,
            state,
            chain,
            draw_count: 0,
            adaptation,
            initial_step_size: settings.initial_step_size,
        }
    }

    /// Initialize the sampler to a position. This should be called
    /// before calling draw.
    ///
    /// This fails if the logp function returns an error or a non-finite
    /// value at `position`.
    pub(crate) fn set_position(&mut self, position: &[f64]) -> Result<()> {
        if position.len() != self.dim() {
            return Err(ConfigurationError::InitDimension {
                expected: self.dim(),
                got: position.len(),
            }
            .into());
        }
        self.state = self.hamiltonian.init_state(&self.pool, position)?;
        self.adaptation.step_size.init(
            &mut self.hamiltonian,
            &self.state,
            &mut self.rng,
            self.initial_step_size,
        );
        Ok(())
    }

    /// Draw a new sample, adapt if still in warmup, and return the draw.
    pub(crate) fn draw(&mut self) -> Result<Draw> {
        let step_size = self.hamiltonian.step_size();
        let tuning = self.adaptation.is_tuning(self.draw_count);

        let (state, info) = draw(
            &self.pool,
            &mut self.state,
            &mut self.rng,
            &mut self.hamiltonian,
            &self.options,
            &mut self.collector,
        )?;

        self.adaptation.adapt(
            &mut self.hamiltonian,
            self.draw_count,
            &self.collector,
            &state,
        );

        let values = self
            .hamiltonian
            .logp
            .expand_vector(&state.q)
            .map_err(|err| NutsError::LogpFailure(Box::new(err)))?;

        let mut position: Box<[f64]> = vec![0f64; self.dim()].into();
        state.write_position(&mut position);

        let mut divergence_info = info.divergence_info;
        if !self.options.store_divergences {
            if let Some(info) = divergence_info.as_mut() {
                info.strip_locations();
            }
        }

        let stats = DrawStats {
            chain: self.chain,
            draw: self.draw_count,
            tuning,
            logp: state.logp(),
            energy: state.energy(),
            energy_error: state.energy() - info.initial_energy,
            depth: info.depth,
            maxdepth_reached: info.reached_maxdepth,
            n_steps: self.collector.mean.count(),
            step_size,
            mean_tree_accept: self.collector.mean.current(),
            diverging: divergence_info.is_some(),
            index_in_trajectory: state.index_in_trajectory(),
            divergence_info,
        };

        self.draw_count += 1;
        self.state = state;

        Ok(Draw {
            position,
            values,
            stats,
        })
    }

    pub(crate) fn dim(&self) -> usize {
        self.hamiltonian.dim()
    }

    pub(crate) fn mass_matrix(&self) -> MassMatrixSnapshot {
        self.hamiltonian.mass_matrix.snapshot()
    }

    pub(crate) fn rng_mut(&mut self) -> &mut R {
        &mut self.rng
    }

    pub(crate) fn density_mut(&mut self) -> &mut F {
        &mut self.hamiltonian.logp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mass_matrix::{DiagMassMatrix, IdentityMassMatrix},
        sampler::test_logps::NormalLogp,
    };
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn draws_are_numbered() {
        let settings = NutsSettings {
            num_warmup: 30,
            num_draws: 10,
            ..Default::default()
        };
        let rng = ChaCha8Rng::seed_from_u64(1);
        let mut chain: NutsChain<_, DiagMassMatrix, _> =
            NutsChain::new(NormalLogp::new(3, 1.), &settings, rng, 2);
        chain.set_position(&[0.5, 1., 1.5]).unwrap();

        for i in 0..40 {
            let draw = chain.draw().unwrap();
            assert_eq!(draw.stats.chain, 2);
            assert_eq!(draw.stats.draw, i);
            assert_eq!(draw.stats.tuning, i < 30);
            assert_eq!(&draw.values[..], &draw.position[..]);
            assert!(draw.stats.n_steps >= 1);
            assert!(draw.stats.logp.is_finite());
        }
        assert!(matches!(
            chain.mass_matrix(),
            MassMatrixSnapshot::Diagonal { .. }
        ));
    }

    #[test]
    fn step_size_is_fixed_after_warmup() {
        let settings = NutsSettings {
            num_warmup: 50,
            num_draws: 20,
            ..Default::default()
        };
        let rng = ChaCha8Rng::seed_from_u64(4);
        let mut chain: NutsChain<_, IdentityMassMatrix, _> =
            NutsChain::new(NormalLogp::new(2, 0.), &settings, rng, 0);
        chain.set_position(&[0.1, -0.1]).unwrap();

        let draws: Vec<Draw> = (0..70).map(|_| chain.draw().unwrap()).collect();
        let final_step = draws[50].stats.step_size;
        assert!(draws[50..].iter().all(|d| d.stats.step_size == final_step));
        assert!(draws[..50].iter().any(|d| d.stats.step_size != final_step));
    }

    #[test]
    fn wrong_dimension_is_rejected() {
        let settings = NutsSettings::default();
        let rng = ChaCha8Rng::seed_from_u64(1);
        let mut chain: NutsChain<_, DiagMassMatrix, _> =
            NutsChain::new(NormalLogp::new(3, 1.), &settings, rng, 0);
        assert!(matches!(
            chain.set_position(&[0.]),
            Err(NutsError::Configuration(ConfigurationError::InitDimension {
                expected: 3,
                got: 1
            }))
        ));
    }

    #[test]
    fn divergence_locations_are_optional() {
        for store_divergences in [false, true] {
            let settings = NutsSettings {
                num_warmup: 10,
                num_draws: 10,
                initial_step_size: Some(1.),
                store_divergences,
                ..Default::default()
            };
            let rng = ChaCha8Rng::seed_from_u64(9);
            let mut chain: NutsChain<_, IdentityMassMatrix, _> = NutsChain::new(
                NormalLogp::new(2, 0.).with_error_outside(1e-6, true),
                &settings,
                rng,
                0,
            );
            chain.set_position(&[0., 0.]).unwrap();
            let draw = chain.draw().unwrap();
            assert!(draw.stats.diverging);
            let info = draw.stats.divergence_info.unwrap();
            assert!(info.logp_function_error.is_some());
            assert_eq!(info.start_location.is_some(), store_divergences);
        }
    }
}
