use std::sync::Arc;

use rand::{
    distr::{Distribution, StandardUniform},
    Rng,
};

use crate::{
    mass_matrix::MassMatrix,
    math::all_finite,
    model::{LogpError, LogpFunc},
    nuts::{Collector, NutsError, Result},
    state::{State, StatePool},
};

/// Details about a divergent leapfrog step.
#[derive(Debug, Clone)]
pub struct DivergenceInfo {
    /// The position where the diverging leapfrog started
    pub start_location: Option<Box<[f64]>>,
    /// The position where the diverging leapfrog ended
    pub end_location: Option<Box<[f64]>>,
    /// The difference between the energy at the initial location of the trajectory and
    /// the energy at the end of the diverging leapfrog step.
    ///
    /// This is not available if the divergence was caused by a logp function error
    pub energy_error: Option<f64>,
    pub start_idx_in_trajectory: Option<i64>,
    pub end_idx_in_trajectory: Option<i64>,
    /// The logp function error that caused the divergence if there was any
    pub logp_function_error: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl DivergenceInfo {
    pub(crate) fn strip_locations(&mut self) {
        self.start_location = None;
        self.end_location = None;
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

impl Distribution<Direction> for StandardUniform {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Direction {
        if rng.random::<bool>() {
            Direction::Forward
        } else {
            Direction::Backward
        }
    }
}

pub(crate) enum LeapfrogResult {
    Ok(State),
    Divergence(DivergenceInfo),
    Err(NutsError),
}

/// Hamiltonian with a position independent (Euclidean) kinetic energy.
///
/// The potential energy is `-logp(q)`, the kinetic energy `p^T M^-1 p / 2`.
pub(crate) struct EuclideanHamiltonian<F: LogpFunc, Mass: MassMatrix> {
    pub(crate) logp: F,
    pub(crate) mass_matrix: Mass,
    max_energy_error: f64,
    step_size: f64,
}

impl<F: LogpFunc, Mass: MassMatrix> EuclideanHamiltonian<F, Mass> {
    pub(crate) fn new(logp: F, mass_matrix: Mass, max_energy_error: f64, step_size: f64) -> Self {
        EuclideanHamiltonian {
            logp,
            mass_matrix,
            max_energy_error,
            step_size,
        }
    }

    pub(crate) fn dim(&self) -> usize {
        self.logp.dim()
    }

    pub(crate) fn step_size(&self) -> f64 {
        self.step_size
    }

    pub(crate) fn step_size_mut(&mut self) -> &mut f64 {
        &mut self.step_size
    }

    fn update_potential_gradient(
        &mut self,
        state: &mut State,
    ) -> std::result::Result<(), F::LogpError> {
        let inner = state.try_mut_inner().expect("State already in use");
        let logp = self.logp.logp(&inner.q, &mut inner.grad)?;
        inner.potential_energy = -logp;
        Ok(())
    }

    /// Perform one leapfrog step.
    ///
    /// Return either an unrecoverable error, a new state or a divergence.
    pub(crate) fn leapfrog<C: Collector>(
        &mut self,
        pool: &StatePool,
        start: &State,
        dir: Direction,
        initial_energy: f64,
        collector: &mut C,
    ) -> LeapfrogResult {
        let mut out = pool.new_state();

        let sign = match dir {
            Direction::Forward => 1,
            Direction::Backward => -1,
        };

        let epsilon = (sign as f64) * self.step_size;

        start.first_momentum_halfstep(&mut out, epsilon);
        self.mass_matrix
            .update_velocity(out.try_mut_inner().expect("State already in use"));

        start.position_step(&mut out, epsilon);
        if let Err(logp_error) = self.update_potential_gradient(&mut out) {
            if !logp_error.is_recoverable() {
                return LeapfrogResult::Err(NutsError::LogpFailure(Box::new(logp_error)));
            }
            let divergence_info = DivergenceInfo {
                logp_function_error: Some(Arc::new(logp_error)),
                start_location: Some(start.q.clone()),
                end_location: None,
                start_idx_in_trajectory: Some(start.index_in_trajectory()),
                end_idx_in_trajectory: None,
                energy_error: None,
            };
            collector.register_leapfrog(start, &out, Some(&divergence_info));
            return LeapfrogResult::Divergence(divergence_info);
        }

        out.second_momentum_halfstep(epsilon);

        {
            let inner = out.try_mut_inner().expect("State already in use");
            self.mass_matrix.update_velocity(inner);
            self.mass_matrix.update_kinetic_energy(inner);
            inner.idx_in_trajectory = start.index_in_trajectory() + sign;
        }

        start.set_psum(&mut out);

        let energy_error = out.energy() - initial_energy;
        if !energy_error.is_finite()
            | (energy_error.abs() > self.max_energy_error)
            | !all_finite(&out.grad)
        {
            let divergence_info = DivergenceInfo {
                logp_function_error: None,
                start_location: Some(start.q.clone()),
                end_location: Some(out.q.clone()),
                start_idx_in_trajectory: Some(start.index_in_trajectory()),
                end_idx_in_trajectory: Some(out.index_in_trajectory()),
                energy_error: Some(energy_error),
            };
            collector.register_leapfrog(start, &out, Some(&divergence_info));
            return LeapfrogResult::Divergence(divergence_info);
        }

        collector.register_leapfrog(start, &out, None);

        LeapfrogResult::Ok(out)
    }

    /// Initialize a state at a new location.
    ///
    /// The momentum is left at zero, it is set later with
    /// [`EuclideanHamiltonian::randomize_momentum`].
    pub(crate) fn init_state(&mut self, pool: &StatePool, init: &[f64]) -> Result<State> {
        let mut state = pool.new_state();
        {
            let inner = state.try_mut_inner().expect("State already in use");
            inner.q.copy_from_slice(init);
            inner.p.fill(0.);
            inner.v.fill(0.);
            inner.p_sum.fill(0.);
            inner.idx_in_trajectory = 0;
            inner.kinetic_energy = 0.;
        }
        if let Err(error) = self.update_potential_gradient(&mut state) {
            if error.is_recoverable() {
                log::debug!("Logp function failed at initial point: {error}");
                return Err(NutsError::BadInitPoint { tries: 1 });
            }
            return Err(NutsError::LogpFailure(Box::new(error)));
        }
        if !state.potential_energy.is_finite() || !all_finite(&state.grad) {
            return Err(NutsError::BadInitPoint { tries: 1 });
        }
        Ok(state)
    }

    /// Randomize the momentum part of a state
    pub(crate) fn randomize_momentum<R: Rng + ?Sized>(&self, state: &mut State, rng: &mut R) {
        let inner = state.try_mut_inner().expect("State already in use");
        self.mass_matrix.randomize_momentum(inner, rng);
        self.mass_matrix.update_velocity(inner);
        self.mass_matrix.update_kinetic_energy(inner);
    }

    pub(crate) fn new_pool(&self, capacity: usize) -> StatePool {
        StatePool::new(self.dim(), capacity)
    }
}
