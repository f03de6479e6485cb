use thiserror::Error;

use crate::{
    hamiltonian::{Direction, DivergenceInfo, EuclideanHamiltonian, LeapfrogResult},
    mass_matrix::MassMatrix,
    math::logaddexp,
    model::LogpFunc,
    sampler::ConfigurationError,
    state::{State, StatePool},
};

#[derive(Error, Debug)]
pub enum NutsError {
    #[error("Logp function returned unrecoverable error")]
    LogpFailure(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Could not find a finite initial point after {tries} tries")]
    BadInitPoint { tries: usize },

    #[error("Invalid sampler configuration")]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Model(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, NutsError>;

/// Callbacks for various events during a Nuts sampling step.
///
/// Collectors can compute statistics like the mean acceptance rate
/// or collect data for mass matrix adaptation.
pub(crate) trait Collector {
    fn register_leapfrog(
        &mut self,
        _start: &State,
        _end: &State,
        _divergence_info: Option<&DivergenceInfo>,
    ) {
    }
    fn register_draw(&mut self, _state: &State, _info: &SampleInfo) {}
    fn register_init(&mut self, _state: &State, _options: &NutsOptions) {}
}

/// Information about a draw, exported as part of the sampler stats
#[derive(Debug)]
pub(crate) struct SampleInfo {
    /// The depth of the trajectory that this point was sampled from
    pub depth: u64,

    /// More detailed information about a divergence that might have
    /// occured in the trajectory.
    pub divergence_info: Option<DivergenceInfo>,

    /// Whether the trajectory was terminated because it reached
    /// the maximum tree depth.
    pub reached_maxdepth: bool,

    /// Energy of the initial point after momentum resampling.
    pub initial_energy: f64,
}

/// A part of the trajectory tree during NUTS sampling.
struct NutsTree {
    /// The left position of the tree.
    ///
    /// The left side always has the smaller index_in_trajectory.
    /// Leapfrogs in backward direction will replace the left.
    left: State,
    right: State,

    /// A draw from the trajectory between left and right using
    /// multinomial sampling.
    draw: State,
    log_size: f64,
    depth: u64,
    initial_energy: f64,

    /// A tree is the main tree if it contains the initial point
    /// of the trajectory.
    is_main: bool,
}

enum ExtendResult {
    /// The tree extension succeeded properly, and the termination
    /// criterion was not reached.
    Ok(NutsTree),
    /// An unrecoverable error happend during a leapfrog step
    Err(NutsError),
    /// Tree extension succeeded and the termination criterion
    /// was reached.
    Turning(NutsTree),
    /// A divergence happend during tree extension.
    Diverging(NutsTree, DivergenceInfo),
}

impl NutsTree {
    fn new(state: State) -> NutsTree {
        let initial_energy = state.energy();
        NutsTree {
            right: state.clone(),
            left: state.clone(),
            draw: state,
            depth: 0,
            log_size: 0.,
            initial_energy,
            is_main: true,
        }
    }

    #[inline]
    fn extend<F, M, R, C>(
        mut self,
        pool: &StatePool,
        rng: &mut R,
        hamiltonian: &mut EuclideanHamiltonian<F, M>,
        direction: Direction,
        collector: &mut C,
    ) -> ExtendResult
    where
        F: LogpFunc,
        M: MassMatrix,
        R: rand::Rng + ?Sized,
        C: Collector,
    {
        let mut other = match self.single_step(pool, hamiltonian, direction, collector) {
            Ok(Ok(tree)) => tree,
            Ok(Err(info)) => return ExtendResult::Diverging(self, info),
            Err(err) => return ExtendResult::Err(err),
        };

        while other.depth < self.depth {
            use ExtendResult::*;
            other = match other.extend(pool, rng, hamiltonian, direction, collector) {
                Ok(tree) => tree,
                Turning(_) => {
                    return Turning(self);
                }
                Diverging(_, info) => {
                    return Diverging(self, info);
                }
                Err(error) => {
                    return Err(error);
                }
            };
        }

        let (first, last) = match direction {
            Direction::Forward => (&self.left, &other.right),
            Direction::Backward => (&other.left, &self.right),
        };

        let mut turning = first.is_turning(last);
        if self.depth > 0 {
            if !turning {
                turning = self.right.is_turning(&other.right);
            }
            if !turning {
                turning = self.left.is_turning(&other.left);
            }
        }

        self.merge_into(other, rng, direction);

        if turning {
            ExtendResult::Turning(self)
        } else {
            ExtendResult::Ok(self)
        }
    }

    #[inline]
    fn merge_into<R: rand::Rng + ?Sized>(
        &mut self,
        other: NutsTree,
        rng: &mut R,
        direction: Direction,
    ) {
        assert!(self.depth == other.depth);
        assert!(self.left.index_in_trajectory() <= self.right.index_in_trajectory());
        match direction {
            Direction::Forward => {
                self.right = other.right;
            }
            Direction::Backward => {
                self.left = other.left;
            }
        }
        let log_size = logaddexp(self.log_size, other.log_size);

        // The main tree prefers the new subtree (biased progressive sampling),
        // subtrees sample uniformly.
        let self_log_size = if self.is_main {
            assert!(self.left.index_in_trajectory() <= 0);
            assert!(self.right.index_in_trajectory() >= 0);
            self.log_size
        } else {
            log_size
        };

        if (other.log_size >= self_log_size)
            || rng.random_bool((other.log_size - self_log_size).exp())
        {
            self.draw = other.draw;
        }

        self.depth += 1;
        self.log_size = log_size;
    }

    #[inline]
    fn single_step<F, M, C>(
        &self,
        pool: &StatePool,
        hamiltonian: &mut EuclideanHamiltonian<F, M>,
        direction: Direction,
        collector: &mut C,
    ) -> Result<std::result::Result<NutsTree, DivergenceInfo>>
    where
        F: LogpFunc,
        M: MassMatrix,
        C: Collector,
    {
        let start = match direction {
            Direction::Forward => &self.right,
            Direction::Backward => &self.left,
        };
        let end = match hamiltonian.leapfrog(pool, start, direction, self.initial_energy, collector)
        {
            LeapfrogResult::Ok(end) => end,
            LeapfrogResult::Divergence(info) => return Ok(Err(info)),
            LeapfrogResult::Err(error) => return Err(error),
        };

        let log_size = self.initial_energy - end.energy();
        Ok(Ok(NutsTree {
            right: end.clone(),
            left: end.clone(),
            draw: end,
            depth: 0,
            log_size,
            initial_energy: self.initial_energy,
            is_main: false,
        }))
    }

    fn info(&self, maxdepth: bool, divergence_info: Option<DivergenceInfo>) -> SampleInfo {
        SampleInfo {
            depth: self.depth,
            divergence_info,
            reached_maxdepth: maxdepth,
            initial_energy: self.initial_energy,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct NutsOptions {
    pub maxdepth: u64,
    pub store_divergences: bool,
}

/// Draw the next point of a chain, starting the trajectory at `init`.
pub(crate) fn draw<F, M, R, C>(
    pool: &StatePool,
    init: &mut State,
    rng: &mut R,
    hamiltonian: &mut EuclideanHamiltonian<F, M>,
    options: &NutsOptions,
    collector: &mut C,
) -> Result<(State, SampleInfo)>
where
    F: LogpFunc,
    M: MassMatrix,
    R: rand::Rng + ?Sized,
    C: Collector,
{
    hamiltonian.randomize_momentum(init, rng);
    init.make_init_point();
    collector.register_init(init, options);

    let mut tree = NutsTree::new(init.clone());
    while tree.depth < options.maxdepth {
        let direction: Direction = rng.random();
        tree = match tree.extend(pool, rng, hamiltonian, direction, collector) {
            ExtendResult::Ok(tree) => tree,
            ExtendResult::Turning(tree) => {
                let info = tree.info(false, None);
                collector.register_draw(&tree.draw, &info);
                return Ok((tree.draw, info));
            }
            ExtendResult::Diverging(tree, info) => {
                let info = tree.info(false, Some(info));
                collector.register_draw(&tree.draw, &info);
                return Ok((tree.draw, info));
            }
            ExtendResult::Err(error) => {
                return Err(error);
            }
        };
    }
    let info = tree.info(true, None);
    collector.register_draw(&tree.draw, &info);
    Ok((tree.draw, info))
}
