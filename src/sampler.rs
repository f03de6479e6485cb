use anyhow::{anyhow, Context};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::{prelude::*, ThreadPoolBuilder};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{channel, Receiver, RecvTimeoutError},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread::{spawn, JoinHandle},
    time::{Duration, Instant},
};
use thiserror::Error;

use crate::{
    chain::NutsChain,
    mass_matrix::{
        DenseMassMatrix, DiagMassMatrix, IdentityMassMatrix, MassMatrix, MassMatrixAdaptOptions,
        MassMatrixKind,
    },
    model::{LogpFunc, Model},
    nuts::{NutsError, Result},
    starting::{find_map, MapOptions},
    stepsize::DualAverageOptions,
    trace::{ChainTrace, Draw, DrawStats, Trace},
};

/// Invalid settings, detected before any chain starts.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigurationError {
    #[error("At least one chain is required")]
    NoChains,
    #[error("The number of warmup draws must be positive")]
    NoWarmup,
    #[error("The number of draws must be positive")]
    NoDraws,
    #[error("Target acceptance rate {0} is not in (0, 1)")]
    TargetAccept(f64),
    #[error("The maximum tree depth must be between 1 and 64")]
    MaxDepth,
    #[error("Initial step size {0} is not a positive finite number")]
    StepSize(f64),
    #[error("Maximum energy error {0} must be positive")]
    MaxEnergyError(f64),
    #[error("Initial position has length {got}, but the model has dimension {expected}")]
    InitDimension { expected: usize, got: usize },
    #[error("Got {got} initial positions for {expected} chains")]
    InitChainCount { expected: usize, got: usize },
    #[error("MAP search frees coordinate {index}, but the model has dimension {dim}")]
    MapFreeIndex { index: usize, dim: usize },
}

/// Trajectories longer than `2^64` leapfrog steps can not be counted.
const MAX_TREE_DEPTH: u64 = 64;

/// How the chains choose their first position.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum InitStrategy {
    /// Ask the model for random initial points until one has finite density.
    #[default]
    Model,
    /// All chains start at the same position.
    Fixed(Vec<f64>),
    /// One position per chain.
    PerChain(Vec<Vec<f64>>),
    /// Start from a model initial point and climb to a mode of the density.
    Map(MapOptions),
}

/// Settings for the NUTS sampler
#[derive(Debug, Clone, PartialEq)]
pub struct NutsSettings {
    pub num_chains: usize,
    /// The number of tuning steps, where we fit the step size and mass matrix.
    pub num_warmup: u64,
    /// The number of draws after tuning
    pub num_draws: u64,
    /// Mean acceptance rate the step size adaptation aims for.
    pub target_accept: f64,
    /// The maximum tree depth during sampling. The number of leapfrog steps
    /// is smaller than 2 ^ maxdepth.
    pub maxdepth: u64,
    /// Use this step size instead of searching for one at the initial point.
    pub initial_step_size: Option<f64>,
    pub mass_matrix: MassMatrixKind,
    /// If the energy error is larger than this threshold we treat the leapfrog
    /// step as a divergence.
    pub max_energy_error: f64,
    pub seed: u64,
    /// Number of worker threads. Zero uses one thread per core.
    pub num_cores: usize,
    pub init: InitStrategy,
    /// How often a chain asks the model for a new initial point.
    pub max_init_tries: usize,
    /// Store the start and end location of each divergent trajectory.
    pub store_divergences: bool,
    /// Warn about chains with a larger fraction of divergent warmup draws.
    pub divergence_warning_threshold: f64,
    pub step_size_adapt: DualAverageOptions,
    pub mass_matrix_adapt: MassMatrixAdaptOptions,
}

impl Default for NutsSettings {
    fn default() -> Self {
        Self {
            num_chains: 4,
            num_warmup: 1000,
            num_draws: 1000,
            target_accept: 0.8,
            maxdepth: 10,
            initial_step_size: None,
            mass_matrix: MassMatrixKind::default(),
            max_energy_error: 1000f64,
            seed: 0,
            num_cores: 0,
            init: InitStrategy::default(),
            max_init_tries: 500,
            store_divergences: false,
            divergence_warning_threshold: 0.1,
            step_size_adapt: DualAverageOptions::default(),
            mass_matrix_adapt: MassMatrixAdaptOptions::default(),
        }
    }
}

impl NutsSettings {
    /// Check the settings for a model with `dim` parameters.
    pub fn validate(&self, dim: usize) -> std::result::Result<(), ConfigurationError> {
        if self.num_chains == 0 {
            return Err(ConfigurationError::NoChains);
        }
        if self.num_warmup == 0 {
            return Err(ConfigurationError::NoWarmup);
        }
        if self.num_draws == 0 {
            return Err(ConfigurationError::NoDraws);
        }
        if !((self.target_accept > 0.) & (self.target_accept < 1.)) {
            return Err(ConfigurationError::TargetAccept(self.target_accept));
        }
        if (self.maxdepth == 0) | (self.maxdepth > MAX_TREE_DEPTH) {
            return Err(ConfigurationError::MaxDepth);
        }
        if let Some(step) = self.initial_step_size {
            if !((step > 0.) & step.is_finite()) {
                return Err(ConfigurationError::StepSize(step));
            }
        }
        if !(self.max_energy_error > 0.) {
            return Err(ConfigurationError::MaxEnergyError(self.max_energy_error));
        }

        let check_dim = |position: &[f64]| {
            if position.len() == dim {
                Ok(())
            } else {
                Err(ConfigurationError::InitDimension {
                    expected: dim,
                    got: position.len(),
                })
            }
        };
        match &self.init {
            InitStrategy::Model => Ok(()),
            InitStrategy::Map(options) => match options.free.as_deref() {
                Some(free) => match free.iter().find(|&&index| index >= dim) {
                    Some(&index) => Err(ConfigurationError::MapFreeIndex { index, dim }),
                    None => Ok(()),
                },
                None => Ok(()),
            },
            InitStrategy::Fixed(position) => check_dim(position.as_slice()),
            InitStrategy::PerChain(positions) => {
                if positions.len() != self.num_chains {
                    return Err(ConfigurationError::InitChainCount {
                        expected: self.num_chains,
                        got: positions.len(),
                    });
                }
                positions
                    .iter()
                    .try_for_each(|position| check_dim(position.as_slice()))
            }
        }
    }

    fn total_draws(&self) -> u64 {
        self.num_warmup + self.num_draws
    }
}

/// Stops running chains between two draws.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[non_exhaustive]
#[derive(Clone, Debug)]
pub struct ChainProgress {
    pub finished_draws: usize,
    pub total_draws: usize,
    /// Divergences after warmup.
    pub divergences: usize,
    pub tuning: bool,
    pub started: bool,
    pub latest_num_steps: usize,
    pub total_num_steps: usize,
    pub step_size: f64,
    pub runtime: Duration,
    pub divergent_draws: Vec<usize>,
}

impl ChainProgress {
    fn new(total: usize) -> Self {
        Self {
            finished_draws: 0,
            total_draws: total,
            divergences: 0,
            tuning: true,
            started: false,
            latest_num_steps: 0,
            step_size: 0f64,
            total_num_steps: 0,
            runtime: Duration::ZERO,
            divergent_draws: Vec::new(),
        }
    }

    fn update(&mut self, stats: &DrawStats, draw_duration: Duration) {
        if stats.diverging & !stats.tuning {
            self.divergences += 1;
            self.divergent_draws.push(self.finished_draws);
        }
        self.finished_draws += 1;
        self.tuning = stats.tuning;

        self.latest_num_steps = stats.n_steps as usize;
        self.total_num_steps += stats.n_steps as usize;
        self.step_size = stats.step_size;
        self.runtime += draw_duration;
    }
}

/// The output of one chain, written only by the thread running it.
struct ChainSlot {
    trace: Mutex<ChainTrace>,
    progress: Mutex<ChainProgress>,
}

impl ChainSlot {
    fn new(chain: u64, total: u64) -> Self {
        Self {
            trace: Mutex::new(ChainTrace::new(chain)),
            progress: Mutex::new(ChainProgress::new(total as usize)),
        }
    }
}

fn new_slots(settings: &NutsSettings) -> Vec<ChainSlot> {
    (0..settings.num_chains)
        .map(|chain| ChainSlot::new(chain as u64, settings.total_draws()))
        .collect()
}

// A panicking chain leaves its draws intact, so poisoned locks are still usable.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn collect_trace(slots: &[ChainSlot], divergence_threshold: f64) -> Trace {
    let chains = slots.iter().map(|slot| lock(&slot.trace).clone()).collect();
    Trace::new(chains, divergence_threshold)
}

fn finish_trace(slots: &[ChainSlot], divergence_threshold: f64) -> Trace {
    let trace = collect_trace(slots, divergence_threshold);
    for warning in trace.warnings() {
        log::warn!("{warning}");
    }
    log::info!(
        "Finished sampling {} chains with {} divergences",
        trace.chains().len(),
        trace.diagnostics().total_divergences()
    );
    trace
}

fn chain_rng(seed: u64, chain: u64) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream(chain);
    rng
}

/// Draw initial points from the model until one has a finite density.
fn init_from_model<M, F, Mass>(
    model: &M,
    sampler: &mut NutsChain<F, Mass, ChaCha8Rng>,
    max_tries: usize,
) -> Result<Box<[f64]>>
where
    M: Model,
    F: LogpFunc,
    Mass: MassMatrix,
{
    let mut position = vec![0f64; sampler.dim()];
    for attempt in 0..max_tries {
        model
            .init_position(sampler.rng_mut(), &mut position)
            .context("Failed to generate a new initial position")?;
        match sampler.set_position(&position) {
            Ok(()) => return Ok(position.into()),
            Err(NutsError::BadInitPoint { .. }) => {
                log::debug!("Initial point {attempt} has no finite density");
            }
            Err(err) => return Err(err),
        }
    }
    log::warn!("All {max_tries} initial points failed");
    Err(NutsError::BadInitPoint { tries: max_tries })
}

fn initialize<M, F, Mass>(
    model: &M,
    sampler: &mut NutsChain<F, Mass, ChaCha8Rng>,
    settings: &NutsSettings,
    chain: u64,
) -> Result<()>
where
    M: Model,
    F: LogpFunc,
    Mass: MassMatrix,
{
    match &settings.init {
        InitStrategy::Model => {
            init_from_model(model, sampler, settings.max_init_tries)?;
            Ok(())
        }
        InitStrategy::Fixed(position) => sampler.set_position(position),
        InitStrategy::PerChain(positions) => {
            let position =
                positions
                    .get(chain as usize)
                    .ok_or(ConfigurationError::InitChainCount {
                        expected: settings.num_chains,
                        got: positions.len(),
                    })?;
            sampler.set_position(position)
        }
        InitStrategy::Map(options) => {
            let start = init_from_model(model, sampler, settings.max_init_tries)?;
            let estimate = find_map(sampler.density_mut(), &start, options)?;
            if !estimate.converged {
                log::warn!(
                    "MAP search of chain {chain} did not converge after {} iterations",
                    estimate.iterations
                );
            }
            sampler.set_position(&estimate.position)
        }
    }
}

fn run_chain_with<M, Mass>(
    model: &M,
    settings: &NutsSettings,
    chain: u64,
    slot: &ChainSlot,
    cancel: &CancelToken,
) -> Result<()>
where
    M: Model,
    Mass: MassMatrix,
{
    let density = model
        .density()
        .with_context(|| format!("Could not create the density of chain {chain}"))?;
    let mut sampler: NutsChain<_, Mass, _> =
        NutsChain::new(density, settings, chain_rng(settings.seed, chain), chain);
    initialize(model, &mut sampler, settings, chain)?;
    lock(&slot.progress).started = true;
    log::debug!("Chain {chain} started");

    let mut result = Ok(());
    for _ in 0..settings.total_draws() {
        if cancel.is_cancelled() {
            log::debug!("Chain {chain} was cancelled");
            break;
        }
        let now = Instant::now();
        match sampler.draw() {
            Ok(draw) => {
                lock(&slot.progress).update(&draw.stats, now.elapsed());
                lock(&slot.trace).push(draw);
            }
            Err(err) => {
                log::warn!("Chain {chain} failed: {err}");
                result = Err(err);
                break;
            }
        }
    }
    lock(&slot.trace).set_mass_matrix(sampler.mass_matrix());
    log::debug!(
        "Chain {chain} stopped after {} draws",
        lock(&slot.progress).finished_draws
    );
    result
}

fn run_chain<M: Model>(
    model: &M,
    settings: &NutsSettings,
    chain: u64,
    slot: &ChainSlot,
    cancel: &CancelToken,
) -> Result<()> {
    match settings.mass_matrix {
        MassMatrixKind::Identity => {
            run_chain_with::<M, IdentityMassMatrix>(model, settings, chain, slot, cancel)
        }
        MassMatrixKind::Diagonal => {
            run_chain_with::<M, DiagMassMatrix>(model, settings, chain, slot, cancel)
        }
        MassMatrixKind::Dense => {
            run_chain_with::<M, DenseMassMatrix>(model, settings, chain, slot, cancel)
        }
    }
}

/// Run all chains on a thread pool and return the first error.
fn run_chains<M: Model>(
    model: &M,
    settings: &NutsSettings,
    slots: &[ChainSlot],
    cancel: &CancelToken,
) -> Result<()> {
    let pool = ThreadPoolBuilder::new()
        .num_threads(settings.num_cores)
        .thread_name(|i| format!("nuts-worker-{i}"))
        .build()
        .context("Could not start thread pool")?;

    let results: Vec<Result<()>> = pool.install(|| {
        slots
            .par_iter()
            .enumerate()
            .map(|(chain, slot)| run_chain(model, settings, chain as u64, slot, cancel))
            .collect()
    });
    results.into_iter().collect()
}

/// Sample all chains and wait for them to finish.
pub fn sample<M: Model>(model: &M, settings: &NutsSettings) -> Result<Trace> {
    sample_with_cancel(model, settings, &CancelToken::new())
}

/// Sample all chains, stopping early if `cancel` is triggered.
///
/// A cancelled run still returns the draws that were finished.
pub fn sample_with_cancel<M: Model>(
    model: &M,
    settings: &NutsSettings,
    cancel: &CancelToken,
) -> Result<Trace> {
    settings.validate(model.dim())?;
    let slots = new_slots(settings);
    run_chains(model, settings, &slots, cancel)?;
    Ok(finish_trace(&slots, settings.divergence_warning_threshold))
}

fn sequential_chain<'model, M, Mass>(
    model: &'model M,
    settings: &NutsSettings,
    chain: u64,
) -> Result<Box<dyn Iterator<Item = Result<Draw>> + 'model>>
where
    M: Model,
    M::Density<'model>: 'model,
    Mass: MassMatrix + 'model,
{
    let density: M::Density<'model> = model
        .density()
        .context("Could not create the density of the chain")?;
    let mut sampler: NutsChain<_, Mass, _> =
        NutsChain::new(density, settings, chain_rng(settings.seed, chain), chain);
    initialize(model, &mut sampler, settings, chain)?;

    let mut failed = false;
    Ok(Box::new((0..settings.total_draws()).map_while(
        move |_| {
            if failed {
                return None;
            }
            let draw = sampler.draw();
            failed = draw.is_err();
            Some(draw)
        },
    )))
}

/// Sample a single chain lazily on the current thread.
///
/// The draws are identical to those of chain `chain` in [`sample`] with the
/// same settings. The iterator stops after the first error.
pub fn sample_sequentially<'model, M>(
    model: &'model M,
    settings: &NutsSettings,
    chain: u64,
) -> Result<Box<dyn Iterator<Item = Result<Draw>> + 'model>>
where
    M: Model,
    M::Density<'model>: 'model,
{
    settings.validate(model.dim())?;
    match settings.mass_matrix {
        MassMatrixKind::Identity => {
            sequential_chain::<M, IdentityMassMatrix>(model, settings, chain)
        }
        MassMatrixKind::Diagonal => sequential_chain::<M, DiagMassMatrix>(model, settings, chain),
        MassMatrixKind::Dense => sequential_chain::<M, DenseMassMatrix>(model, settings, chain),
    }
}

pub enum SamplerWaitResult {
    Trace(Trace),
    Timeout(Sampler),
    Err(NutsError, Trace),
}

/// A sampling run on a background thread.
///
/// The handle can look at the draws finished so far, report progress and
/// stop the run.
pub struct Sampler {
    main_thread: JoinHandle<()>,
    results: Receiver<Result<()>>,
    slots: Arc<[ChainSlot]>,
    cancel: CancelToken,
    divergence_threshold: f64,
}

impl Sampler {
    pub fn new<M: Model + 'static>(model: M, settings: NutsSettings) -> Result<Self> {
        settings.validate(model.dim())?;
        let slots: Arc<[ChainSlot]> = new_slots(&settings).into();
        let cancel = CancelToken::new();
        let divergence_threshold = settings.divergence_warning_threshold;
        let (results_tx, results_rx) = channel();

        let main_thread = {
            let slots = slots.clone();
            let cancel = cancel.clone();
            spawn(move || {
                let result = run_chains(&model, &settings, &slots, &cancel);
                // Nobody is waiting if the handle was dropped.
                let _ = results_tx.send(result);
            })
        };

        Ok(Self {
            main_thread,
            results: results_rx,
            slots,
            cancel,
            divergence_threshold,
        })
    }

    /// A copy of the draws finished so far.
    pub fn inspect_trace(&self) -> Trace {
        collect_trace(&self.slots, self.divergence_threshold)
    }

    pub fn progress(&self) -> Box<[ChainProgress]> {
        self.slots
            .iter()
            .map(|slot| lock(&slot.progress).clone())
            .collect()
    }

    pub fn is_finished(&self) -> bool {
        self.main_thread.is_finished()
    }

    /// Stop all chains after their current draw.
    pub fn abort(self) -> (Result<()>, Trace) {
        self.cancel.cancel();
        self.wait()
    }

    pub fn wait(self) -> (Result<()>, Trace) {
        let result = self.results.recv().ok();
        self.finish(result)
    }

    pub fn wait_timeout(self, timeout: Duration) -> SamplerWaitResult {
        let result = match self.results.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => return SamplerWaitResult::Timeout(self),
            Err(RecvTimeoutError::Disconnected) => None,
        };
        match self.finish(result) {
            (Ok(()), trace) => SamplerWaitResult::Trace(trace),
            (Err(err), trace) => SamplerWaitResult::Err(err, trace),
        }
    }

    fn finish(self, result: Option<Result<()>>) -> (Result<()>, Trace) {
        if let Err(payload) = self.main_thread.join() {
            std::panic::resume_unwind(payload);
        }
        let result = result
            .unwrap_or_else(|| Err(anyhow!("Sampler thread stopped without a result").into()));
        (result, finish_trace(&self.slots, self.divergence_threshold))
    }
}

#[cfg(test)]
pub mod test_logps {
    use thiserror::Error;

    use crate::model::{LogpError, LogpFunc};

    /// Independent normal distributions with mean `mu` and unit variance.
    #[derive(Clone, Debug)]
    pub struct NormalLogp {
        dim: usize,
        mu: f64,
        error_outside: Option<(f64, bool)>,
    }

    impl NormalLogp {
        pub fn new(dim: usize, mu: f64) -> NormalLogp {
            NormalLogp {
                dim,
                mu,
                error_outside: None,
            }
        }

        /// Fail at positions further than `bound` from the mean in any dimension.
        pub fn with_error_outside(mut self, bound: f64, recoverable: bool) -> NormalLogp {
            self.error_outside = Some((bound, recoverable));
            self
        }
    }

    #[derive(Error, Debug)]
    #[error("Position is outside of the supported region")]
    pub struct TestLogpError {
        recoverable: bool,
    }

    impl TestLogpError {
        pub fn new(recoverable: bool) -> Self {
            Self { recoverable }
        }
    }

    impl LogpError for TestLogpError {
        fn is_recoverable(&self) -> bool {
            self.recoverable
        }
    }

    impl LogpFunc for NormalLogp {
        type LogpError = TestLogpError;

        fn logp(&mut self, position: &[f64], gradient: &mut [f64]) -> Result<f64, TestLogpError> {
            assert!(position.len() == self.dim);
            assert!(gradient.len() == self.dim);

            if let Some((bound, recoverable)) = self.error_outside {
                if position.iter().any(|x| (x - self.mu).abs() > bound) {
                    return Err(TestLogpError::new(recoverable));
                }
            }

            let mut logp = 0f64;
            for (p, g) in position.iter().zip(gradient.iter_mut()) {
                let val = self.mu - p;
                logp -= val * val / 2.;
                *g = val;
            }
            Ok(logp)
        }

        fn dim(&self) -> usize {
            self.dim
        }
    }
}
