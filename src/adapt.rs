use crate::{
    hamiltonian::EuclideanHamiltonian,
    mass_matrix::{MassMatrix, MassMatrixAdaptOptions, VarianceEstimator},
    model::LogpFunc,
    state::State,
    stepsize::{AcceptanceRateCollector, DualAverageOptions, StepSizeAdapter},
};

/// Warmups shorter than this only tune the step size.
const MIN_WINDOWED_WARMUP: u64 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WindowKind {
    /// Only the step size is adapted.
    Fast,
    /// Draws are collected for a new mass matrix estimate.
    Slow,
}

/// A half open range `[start, end)` of warmup draws.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Window {
    pub start: u64,
    pub end: u64,
    pub kind: WindowKind,
}

/// Stan's windowed warmup: a fast initial buffer, slow windows that double
/// in size, and a fast terminal buffer.
#[derive(Debug, Clone)]
pub(crate) struct WarmupSchedule {
    windows: Vec<Window>,
}

impl WarmupSchedule {
    pub(crate) fn new(num_warmup: u64, options: &MassMatrixAdaptOptions) -> Self {
        Self {
            windows: compute_windows(num_warmup, options),
        }
    }

    #[cfg(test)]
    fn windows(&self) -> &[Window] {
        &self.windows
    }

    fn window(&self, draw: u64) -> Option<&Window> {
        self.windows
            .iter()
            .find(|window| (window.start <= draw) & (draw < window.end))
    }

    /// First draw of the terminal buffer, if it follows a slow window.
    pub(crate) fn terminal_start(&self) -> Option<u64> {
        match self.windows.as_slice() {
            [.., previous, last] => {
                let follows_slow =
                    (previous.kind == WindowKind::Slow) & (last.kind == WindowKind::Fast);
                follows_slow.then_some(last.start)
            }
            _ => None,
        }
    }

    pub(crate) fn is_slow(&self, draw: u64) -> bool {
        matches!(
            self.window(draw),
            Some(Window {
                kind: WindowKind::Slow,
                ..
            })
        )
    }

    /// Whether `draw` is the last draw of a slow window.
    pub(crate) fn ends_slow_window(&self, draw: u64) -> bool {
        match self.window(draw) {
            Some(window) => (window.kind == WindowKind::Slow) & (window.end == draw + 1),
            None => false,
        }
    }
}

fn compute_windows(num_warmup: u64, options: &MassMatrixAdaptOptions) -> Vec<Window> {
    let fast = |start, end| Window {
        start,
        end,
        kind: WindowKind::Fast,
    };

    if num_warmup < MIN_WINDOWED_WARMUP {
        return vec![fast(0, num_warmup)];
    }

    let (init_buffer, term_buffer, base_window) =
        if options.init_buffer + options.term_buffer + options.base_window > num_warmup {
            let init_buffer = (0.15 * num_warmup as f64) as u64;
            let term_buffer = (0.2 * num_warmup as f64) as u64;
            (
                init_buffer,
                term_buffer,
                num_warmup - init_buffer - term_buffer,
            )
        } else {
            (options.init_buffer, options.term_buffer, options.base_window)
        };

    let slow_end = num_warmup - term_buffer;
    let mut windows = vec![fast(0, init_buffer)];

    let mut start = init_buffer;
    let mut size = base_window;
    while start < slow_end {
        let mut end = start + size;
        // A window that would leave too little room for the next one
        // absorbs the rest of the slow phase.
        if end + 2 * size > slow_end {
            end = slow_end;
        }
        windows.push(Window {
            start,
            end,
            kind: WindowKind::Slow,
        });
        start = end;
        size *= 2;
    }

    windows.push(fast(slow_end, num_warmup));
    windows.retain(|window| window.start < window.end);
    windows
}

/// Step size and mass matrix adaptation of one chain during warmup.
pub(crate) struct WarmupAdaptation<M: MassMatrix> {
    pub(crate) step_size: StepSizeAdapter,
    estimator: M::Estimator,
    schedule: WarmupSchedule,
    options: MassMatrixAdaptOptions,
    num_warmup: u64,
    mass_matrix_updates: u64,
}

impl<M: MassMatrix> WarmupAdaptation<M> {
    pub(crate) fn new(
        mass_matrix: &M,
        num_warmup: u64,
        target_accept: f64,
        step_size_options: DualAverageOptions,
        options: MassMatrixAdaptOptions,
    ) -> Self {
        Self {
            step_size: StepSizeAdapter::new(step_size_options, target_accept),
            estimator: mass_matrix.new_estimator(),
            schedule: WarmupSchedule::new(num_warmup, &options),
            options,
            num_warmup,
            mass_matrix_updates: 0,
        }
    }

    pub(crate) fn is_tuning(&self, draw: u64) -> bool {
        draw < self.num_warmup
    }

    #[cfg(test)]
    fn mass_matrix_updates(&self) -> u64 {
        self.mass_matrix_updates
    }

    /// Update the sampler after draw number `draw` was taken.
    pub(crate) fn adapt<F: LogpFunc>(
        &mut self,
        hamiltonian: &mut EuclideanHamiltonian<F, M>,
        draw: u64,
        collector: &AcceptanceRateCollector,
        state: &State,
    ) {
        if !self.is_tuning(draw) {
            return;
        }

        self.step_size.adapt(hamiltonian, collector);

        if self.schedule.is_slow(draw) {
            self.estimator.add_sample(&state.q);
        }

        if self.schedule.ends_slow_window(draw) {
            let changed = hamiltonian
                .mass_matrix
                .update_from_estimator(&self.estimator, &self.options);
            if changed {
                self.mass_matrix_updates += 1;
                log::debug!(
                    "Updated mass matrix after draw {draw} from {} samples",
                    self.estimator.count()
                );
            }
            self.estimator.reset();

            if self.schedule.terminal_start() == Some(draw + 1) {
                self.step_size.start_final_phase(hamiltonian);
            } else if changed {
                self.step_size.restart(hamiltonian);
            }
        }

        if draw + 1 == self.num_warmup {
            self.step_size.freeze(hamiltonian);
            log::debug!(
                "Warmup finished with step size {} after {} mass matrix updates",
                hamiltonian.step_size(),
                self.mass_matrix_updates
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mass_matrix::{DiagMassMatrix, IdentityMassMatrix},
        sampler::test_logps::NormalLogp,
        stepsize::StepSizePhase,
    };
    use pretty_assertions::assert_eq;

    fn windows(num_warmup: u64) -> Vec<(u64, u64, WindowKind)> {
        WarmupSchedule::new(num_warmup, &MassMatrixAdaptOptions::default())
            .windows()
            .iter()
            .map(|w| (w.start, w.end, w.kind))
            .collect()
    }

    #[test]
    fn windows_for_1000() {
        use WindowKind::*;
        assert_eq!(
            windows(1000),
            vec![
                (0, 75, Fast),
                (75, 100, Slow),
                (100, 150, Slow),
                (150, 250, Slow),
                (250, 800, Slow),
                (800, 1000, Fast),
            ]
        );
    }

    #[test]
    fn short_warmup_windows() {
        use WindowKind::*;
        assert_eq!(windows(10), vec![(0, 10, Fast)]);
        assert_eq!(windows(100), vec![(0, 15, Fast), (15, 80, Slow), (80, 100, Fast)]);
    }

    #[test]
    fn terminal_buffer_start() {
        let schedule =
            |num_warmup| WarmupSchedule::new(num_warmup, &MassMatrixAdaptOptions::default());
        assert_eq!(schedule(1000).terminal_start(), Some(800));
        assert_eq!(schedule(100).terminal_start(), Some(80));
        assert_eq!(schedule(10).terminal_start(), None);

        let no_buffer = MassMatrixAdaptOptions {
            term_buffer: 0,
            ..Default::default()
        };
        assert_eq!(WarmupSchedule::new(1000, &no_buffer).terminal_start(), None);
    }

    #[test]
    fn windows_are_contiguous() {
        for num_warmup in [20, 21, 50, 149, 150, 151, 300, 1234, 5000] {
            let windows = windows(num_warmup);
            assert_eq!(windows[0].0, 0);
            assert_eq!(windows.last().unwrap().1, num_warmup);
            for pair in windows.windows(2) {
                assert_eq!(pair[0].1, pair[1].0, "Gap in windows for {num_warmup}");
            }
            assert!(windows.iter().any(|w| w.2 == WindowKind::Slow));
        }
    }

    #[test]
    fn schedule_queries() {
        let schedule = WarmupSchedule::new(1000, &MassMatrixAdaptOptions::default());
        assert!(!schedule.is_slow(74));
        assert!(schedule.is_slow(75));
        assert!(schedule.ends_slow_window(99));
        assert!(!schedule.ends_slow_window(100));
        assert!(schedule.ends_slow_window(799));
        assert!(!schedule.is_slow(800));
        assert!(!schedule.is_slow(1000));
    }

    #[test]
    fn identity_is_never_updated() {
        let mut hamiltonian = EuclideanHamiltonian::new(
            NormalLogp::new(1, 0.),
            IdentityMassMatrix::new(1),
            1000.,
            0.5,
        );
        let pool = hamiltonian.new_pool(2);
        let state = hamiltonian.init_state(&pool, &[0.]).unwrap();
        let mut adapt = WarmupAdaptation::new(
            &hamiltonian.mass_matrix,
            100,
            0.8,
            DualAverageOptions::default(),
            MassMatrixAdaptOptions::default(),
        );
        let collector = AcceptanceRateCollector::new();
        for draw in 0..120 {
            adapt.adapt(&mut hamiltonian, draw, &collector, &state);
        }
        assert_eq!(adapt.mass_matrix_updates(), 0);
        assert_eq!(adapt.step_size.phase(), StepSizePhase::Frozen);
    }

    #[test]
    fn diag_is_updated_per_slow_window() {
        let mut hamiltonian =
            EuclideanHamiltonian::new(NormalLogp::new(1, 0.), DiagMassMatrix::new(1), 1000., 0.5);
        let pool = hamiltonian.new_pool(2);
        let mut adapt = WarmupAdaptation::new(
            &hamiltonian.mass_matrix,
            1000,
            0.8,
            DualAverageOptions::default(),
            MassMatrixAdaptOptions::default(),
        );
        let collector = AcceptanceRateCollector::new();
        for draw in 0..1000 {
            let x = (draw % 7) as f64 - 3.;
            let state = hamiltonian.init_state(&pool, &[x]).unwrap();
            adapt.adapt(&mut hamiltonian, draw, &collector, &state);
            if draw == 798 {
                assert_eq!(adapt.step_size.phase(), StepSizePhase::Adapting);
            }
            if draw == 799 {
                assert_eq!(adapt.step_size.phase(), StepSizePhase::Final);
            }
        }
        assert_eq!(adapt.mass_matrix_updates(), 4);
        assert_eq!(adapt.step_size.phase(), StepSizePhase::Frozen);
        assert!(hamiltonian.mass_matrix.variance[0] > 3.);
    }
}
