use rand::Rng;

use crate::{
    hamiltonian::{Direction, DivergenceInfo, EuclideanHamiltonian, LeapfrogResult},
    mass_matrix::MassMatrix,
    model::LogpFunc,
    nuts::{Collector, NutsOptions},
    state::State,
};

const MIN_INITIAL_STEP: f64 = 1e-10;
const MAX_INITIAL_STEP: f64 = 1e5;
const INITIAL_STEP_GUESS: f64 = 0.1;

/// Settings for step size adaptation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DualAverageOptions {
    pub k: f64,
    pub t0: f64,
    pub gamma: f64,
    /// Shrinkage of the run in the terminal warmup buffer. Larger values
    /// keep the iterates closer to the step size that is finally used.
    pub final_gamma: f64,
}

impl Default for DualAverageOptions {
    fn default() -> DualAverageOptions {
        DualAverageOptions {
            k: 0.75,
            t0: 10.,
            gamma: 0.05,
            final_gamma: 0.5,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct DualAverage {
    log_step: f64,
    log_step_adapted: f64,
    hbar: f64,
    mu: f64,
    count: u64,
    settings: DualAverageOptions,
}

impl DualAverage {
    pub(crate) fn new(settings: DualAverageOptions, initial_step: f64) -> DualAverage {
        DualAverage {
            log_step: initial_step.ln(),
            log_step_adapted: initial_step.ln(),
            hbar: 0.,
            mu: (10. * initial_step).ln(),
            count: 1,
            settings,
        }
    }

    pub(crate) fn advance(&mut self, accept_stat: f64, target: f64) {
        let w = 1. / (self.count as f64 + self.settings.t0);
        self.hbar = (1. - w) * self.hbar + w * (target - accept_stat);
        self.log_step = self.mu - self.hbar * (self.count as f64).sqrt() / self.settings.gamma;
        let mk = (self.count as f64).powf(-self.settings.k);
        self.log_step_adapted = mk * self.log_step + (1. - mk) * self.log_step_adapted;
        self.count += 1;
    }

    pub(crate) fn current_step_size(&self) -> f64 {
        self.log_step.exp()
    }

    pub(crate) fn current_step_size_adapted(&self) -> f64 {
        self.log_step_adapted.exp()
    }

    pub(crate) fn reset(&mut self, initial_step: f64, bias_factor: f64) {
        self.log_step = initial_step.ln();
        self.log_step_adapted = initial_step.ln();
        self.hbar = 0f64;
        self.mu = (bias_factor * initial_step).ln();
        self.count = 1;
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RunningMean {
    sum: f64,
    count: u64,
}

impl RunningMean {
    fn new() -> RunningMean {
        RunningMean { sum: 0., count: 0 }
    }

    fn add(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    pub(crate) fn current(&self) -> f64 {
        self.sum / self.count as f64
    }

    pub(crate) fn reset(&mut self) {
        self.sum = 0f64;
        self.count = 0;
    }

    pub(crate) fn count(&self) -> u64 {
        self.count
    }
}

/// Mean Metropolis acceptance probability over the leapfrog steps of a
/// trajectory, relative to its initial point.
#[derive(Debug, Clone)]
pub(crate) struct AcceptanceRateCollector {
    initial_energy: f64,
    pub(crate) mean: RunningMean,
}

impl AcceptanceRateCollector {
    pub(crate) fn new() -> AcceptanceRateCollector {
        AcceptanceRateCollector {
            initial_energy: 0.,
            mean: RunningMean::new(),
        }
    }

    fn start_trajectory(&mut self, initial_energy: f64) {
        self.initial_energy = initial_energy;
        self.mean.reset();
    }
}

impl Collector for AcceptanceRateCollector {
    fn register_leapfrog(
        &mut self,
        _start: &State,
        end: &State,
        divergence_info: Option<&DivergenceInfo>,
    ) {
        match divergence_info {
            Some(_) => self.mean.add(0.),
            None => {
                let diff = self.initial_energy - end.energy();
                self.mean.add(diff.min(0.).exp());
            }
        }
    }

    fn register_init(&mut self, state: &State, _options: &NutsOptions) {
        self.start_trajectory(state.energy());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StepSizePhase {
    Adapting,
    /// The mass matrix is final and the step size is calibrated against it.
    Final,
    Frozen,
}

/// Dual averaging step size control for one chain.
///
/// While adapting, the hamiltonian uses the current dual averaging iterate.
/// [`StepSizeAdapter::start_final_phase`] begins a calmer run for the last
/// part of warmup, and after [`StepSizeAdapter::freeze`] the averaged step
/// size is used for the rest of the run.
#[derive(Debug, Clone)]
pub(crate) struct StepSizeAdapter {
    dual_average: DualAverage,
    params: DualAverageOptions,
    target_accept: f64,
    phase: StepSizePhase,
}

impl StepSizeAdapter {
    pub(crate) fn new(params: DualAverageOptions, target_accept: f64) -> Self {
        Self {
            dual_average: DualAverage::new(params, INITIAL_STEP_GUESS),
            params,
            target_accept,
            phase: StepSizePhase::Adapting,
        }
    }

    pub(crate) fn phase(&self) -> StepSizePhase {
        self.phase
    }

    /// Choose the first step size of the chain.
    ///
    /// A fixed `initial_step` is used as is. Otherwise the step size is
    /// doubled or halved until the acceptance probability of a single
    /// leapfrog step from `state` crosses the target.
    pub(crate) fn init<F, M, R>(
        &mut self,
        hamiltonian: &mut EuclideanHamiltonian<F, M>,
        state: &State,
        rng: &mut R,
        initial_step: Option<f64>,
    ) where
        F: LogpFunc,
        M: MassMatrix,
        R: Rng + ?Sized,
    {
        let step = match initial_step {
            Some(step) => step,
            None => self.find_initial_step(hamiltonian, state, rng),
        };
        log::debug!("Initial step size {step}");
        *hamiltonian.step_size_mut() = step;
        self.dual_average = DualAverage::new(self.params, step);
    }

    fn find_initial_step<F, M, R>(
        &self,
        hamiltonian: &mut EuclideanHamiltonian<F, M>,
        state: &State,
        rng: &mut R,
    ) -> f64
    where
        F: LogpFunc,
        M: MassMatrix,
        R: Rng + ?Sized,
    {
        let pool = hamiltonian.new_pool(2);
        let mut state = pool.copy_state(state);
        state
            .try_mut_inner()
            .expect("New state should have only one reference")
            .idx_in_trajectory = 0;
        hamiltonian.randomize_momentum(&mut state, rng);
        state.make_init_point();

        let accept_stat = |hamiltonian: &mut EuclideanHamiltonian<F, M>, dir| {
            let mut collector = AcceptanceRateCollector::new();
            collector.start_trajectory(state.energy());
            match hamiltonian.leapfrog(&pool, &state, dir, state.energy(), &mut collector) {
                LeapfrogResult::Err(_) => None,
                _ => Some(collector.mean.current()),
            }
        };

        *hamiltonian.step_size_mut() = INITIAL_STEP_GUESS;
        let Some(accept) = accept_stat(hamiltonian, Direction::Forward) else {
            return INITIAL_STEP_GUESS;
        };

        let grow = accept > self.target_accept;

        for _ in 0..100 {
            let step = hamiltonian.step_size();
            if grow {
                if step > MAX_INITIAL_STEP {
                    return MAX_INITIAL_STEP;
                }
                *hamiltonian.step_size_mut() *= 2.;
            } else {
                if step < MIN_INITIAL_STEP {
                    return MIN_INITIAL_STEP;
                }
                *hamiltonian.step_size_mut() /= 2.;
            }

            let Some(accept) = accept_stat(hamiltonian, Direction::Forward) else {
                return INITIAL_STEP_GUESS;
            };
            let crossed = if grow {
                accept <= self.target_accept
            } else {
                accept >= self.target_accept
            };
            if crossed {
                return hamiltonian.step_size();
            }
        }
        // If we don't find something better, use the default guess
        INITIAL_STEP_GUESS
    }

    /// Update the step size after a warmup draw.
    pub(crate) fn adapt<F: LogpFunc, M: MassMatrix>(
        &mut self,
        hamiltonian: &mut EuclideanHamiltonian<F, M>,
        collector: &AcceptanceRateCollector,
    ) {
        if (self.phase == StepSizePhase::Frozen) | (collector.mean.count() == 0) {
            return;
        }
        self.dual_average
            .advance(collector.mean.current(), self.target_accept);
        *hamiltonian.step_size_mut() = self.dual_average.current_step_size();
    }

    /// Start a new dual averaging run from the current averaged step size.
    pub(crate) fn restart<F: LogpFunc, M: MassMatrix>(
        &mut self,
        hamiltonian: &mut EuclideanHamiltonian<F, M>,
    ) {
        if self.phase != StepSizePhase::Adapting {
            return;
        }
        let step = self.dual_average.current_step_size_adapted();
        self.dual_average.reset(step, 10.);
        *hamiltonian.step_size_mut() = step;
    }

    /// Start the last dual averaging run of warmup.
    ///
    /// The run starts at the averaged step size, is centered on it instead
    /// of a ten times larger step, and uses `final_gamma`. The averaged
    /// step size it produces must hit the target acceptance rate on its own.
    pub(crate) fn start_final_phase<F: LogpFunc, M: MassMatrix>(
        &mut self,
        hamiltonian: &mut EuclideanHamiltonian<F, M>,
    ) {
        if self.phase != StepSizePhase::Adapting {
            return;
        }
        let step = self.dual_average.current_step_size_adapted();
        let options = DualAverageOptions {
            gamma: self.params.final_gamma,
            ..self.params
        };
        self.dual_average = DualAverage::new(options, step);
        self.dual_average.reset(step, 1.);
        *hamiltonian.step_size_mut() = step;
        self.phase = StepSizePhase::Final;
    }

    /// Switch to the averaged step size for good.
    pub(crate) fn freeze<F: LogpFunc, M: MassMatrix>(
        &mut self,
        hamiltonian: &mut EuclideanHamiltonian<F, M>,
    ) {
        *hamiltonian.step_size_mut() = self.dual_average.current_step_size_adapted();
        self.phase = StepSizePhase::Frozen;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mass_matrix::IdentityMassMatrix,
        sampler::test_logps::{NormalLogp, TestLogpError},
    };
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn dual_average_direction() {
        let mut high = DualAverage::new(DualAverageOptions::default(), 0.01);
        let mut low = DualAverage::new(DualAverageOptions::default(), 1.);
        for _ in 0..200 {
            high.advance(0.99, 0.8);
            low.advance(0.1, 0.8);
        }
        assert!(high.current_step_size_adapted() > 0.01);
        assert!(low.current_step_size_adapted() < 1.);
        assert!(high.current_step_size_adapted() > low.current_step_size_adapted());
    }

    #[test]
    fn dual_average_first_update() {
        let options = DualAverageOptions::default();
        let mut da = DualAverage::new(options, 1.);
        da.advance(0.5, 0.8);
        // hbar = 0.3 / 11, log eps = ln(10) - hbar / gamma, weight of the new iterate is 1.
        let hbar = 0.3 / 11.;
        let expected = 10f64.ln() - hbar / 0.05;
        assert_abs_diff_eq!(da.current_step_size().ln(), expected, epsilon = 1e-12);
        assert_abs_diff_eq!(da.current_step_size_adapted().ln(), expected, epsilon = 1e-12);

        da.reset(0.5, 10.);
        assert_abs_diff_eq!(da.current_step_size(), 0.5, epsilon = 1e-12);
        assert_eq!(da.count, 1);
    }

    #[test]
    fn heuristic_on_standard_normal() {
        let mut hamiltonian = EuclideanHamiltonian::new(
            NormalLogp::new(5, 0.),
            IdentityMassMatrix::new(5),
            1000.,
            1.,
        );
        let pool = hamiltonian.new_pool(2);
        let state = hamiltonian.init_state(&pool, &[0.5; 5]).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(7);

        let mut adapter = StepSizeAdapter::new(DualAverageOptions::default(), 0.8);
        adapter.init(&mut hamiltonian, &state, &mut rng, None);
        let step = hamiltonian.step_size();
        assert!(step > 0.1 && step < 8., "step {step}");

        adapter.init(&mut hamiltonian, &state, &mut rng, Some(0.3));
        assert_eq!(hamiltonian.step_size(), 0.3);
    }

    /// Standard normal that counts its evaluations.
    struct CountingLogp {
        inner: NormalLogp,
        evaluations: usize,
    }

    impl LogpFunc for CountingLogp {
        type LogpError = TestLogpError;

        fn logp(&mut self, position: &[f64], gradient: &mut [f64]) -> Result<f64, TestLogpError> {
            self.evaluations += 1;
            self.inner.logp(position, gradient)
        }

        fn dim(&self) -> usize {
            self.inner.dim()
        }
    }

    #[test]
    fn heuristic_evaluates_each_step_once() {
        let logp = CountingLogp {
            inner: NormalLogp::new(1, 0.),
            evaluations: 0,
        };
        let mut hamiltonian =
            EuclideanHamiltonian::new(logp, IdentityMassMatrix::new(1), 1000., 1.);
        let pool = hamiltonian.new_pool(2);
        let state = hamiltonian.init_state(&pool, &[0.3]).unwrap();
        hamiltonian.logp.evaluations = 0;

        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut adapter = StepSizeAdapter::new(DualAverageOptions::default(), 0.8);
        adapter.init(&mut hamiltonian, &state, &mut rng, None);

        // A single leapfrog step at 0.1 is accepted almost surely, so the
        // heuristic doubles from 0.1 and tries each step size exactly once.
        let step = hamiltonian.step_size();
        let doublings = (step / INITIAL_STEP_GUESS).log2().round() as usize;
        assert!(doublings >= 1);
        assert_eq!(hamiltonian.logp.evaluations, doublings + 1);
    }

    #[test]
    fn final_phase_starts_at_averaged_step() {
        let mut hamiltonian = EuclideanHamiltonian::new(
            NormalLogp::new(1, 0.),
            IdentityMassMatrix::new(1),
            1000.,
            1.,
        );
        let mut adapter = StepSizeAdapter::new(DualAverageOptions::default(), 0.8);
        let pool = hamiltonian.new_pool(2);
        let state = hamiltonian.init_state(&pool, &[0.]).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        adapter.init(&mut hamiltonian, &state, &mut rng, Some(0.5));

        let mut collector = AcceptanceRateCollector::new();
        collector.start_trajectory(0.);
        collector.mean.add(0.6);
        for _ in 0..20 {
            adapter.adapt(&mut hamiltonian, &collector);
        }
        let averaged = adapter.dual_average.current_step_size_adapted();

        adapter.start_final_phase(&mut hamiltonian);
        assert_eq!(adapter.phase(), StepSizePhase::Final);
        assert_eq!(hamiltonian.step_size(), averaged);
        assert_eq!(adapter.dual_average.settings.gamma, 0.5);

        // Centered on the averaged step, a draw at the target keeps the step.
        let mut on_target = AcceptanceRateCollector::new();
        on_target.start_trajectory(0.);
        on_target.mean.add(0.8);
        adapter.adapt(&mut hamiltonian, &on_target);
        assert_abs_diff_eq!(hamiltonian.step_size(), averaged, epsilon = 1e-12);

        // Mass matrix updates no longer restart the run.
        adapter.adapt(&mut hamiltonian, &collector);
        let step = hamiltonian.step_size();
        adapter.restart(&mut hamiltonian);
        assert_eq!(hamiltonian.step_size(), step);

        adapter.freeze(&mut hamiltonian);
        assert_eq!(adapter.phase(), StepSizePhase::Frozen);
    }

    #[test]
    fn frozen_step_size_stays() {
        let mut hamiltonian = EuclideanHamiltonian::new(
            NormalLogp::new(1, 0.),
            IdentityMassMatrix::new(1),
            1000.,
            1.,
        );
        let mut adapter = StepSizeAdapter::new(DualAverageOptions::default(), 0.8);
        let pool = hamiltonian.new_pool(2);
        let state = hamiltonian.init_state(&pool, &[0.]).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        adapter.init(&mut hamiltonian, &state, &mut rng, Some(0.5));

        let mut collector = AcceptanceRateCollector::new();
        collector.start_trajectory(0.);
        collector.mean.add(0.3);

        adapter.adapt(&mut hamiltonian, &collector);
        assert!(hamiltonian.step_size() != 0.5);
        adapter.freeze(&mut hamiltonian);
        assert_eq!(adapter.phase(), StepSizePhase::Frozen);
        let frozen = hamiltonian.step_size();

        adapter.adapt(&mut hamiltonian, &collector);
        adapter.restart(&mut hamiltonian);
        assert_eq!(hamiltonian.step_size(), frozen);
    }
}
