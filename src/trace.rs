//! Storage for finished draws and the diagnostics derived from them.

use std::sync::Arc;

use arrow::array::{
    ArrayBuilder, ArrayRef, BooleanBuilder, Float64Builder, Int64Builder, LargeListBuilder,
    RecordBatch, UInt64Builder,
};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::error::ArrowError;
use thiserror::Error;

use crate::{hamiltonian::DivergenceInfo, mass_matrix::MassMatrixSnapshot};

/// Sampler statistics of a single draw.
#[derive(Debug, Clone)]
pub struct DrawStats {
    pub chain: u64,
    /// Index of the draw in the chain, warmup included.
    pub draw: u64,
    pub tuning: bool,
    pub logp: f64,
    pub energy: f64,
    /// Energy difference between the draw and the start of its trajectory.
    pub energy_error: f64,
    pub depth: u64,
    pub maxdepth_reached: bool,
    /// Number of leapfrog steps (and gradient evaluations) of the trajectory.
    pub n_steps: u64,
    /// The step size the trajectory was built with.
    pub step_size: f64,
    pub mean_tree_accept: f64,
    pub diverging: bool,
    pub index_in_trajectory: i64,
    pub divergence_info: Option<DivergenceInfo>,
}

#[derive(Debug, Clone)]
pub struct Draw {
    /// Position in unconstrained space.
    pub position: Box<[f64]>,
    /// The values reported by the density for this position.
    pub values: Box<[f64]>,
    pub stats: DrawStats,
}

/// The draws of one chain in the order they were taken.
#[derive(Debug, Clone)]
pub struct ChainTrace {
    chain: u64,
    draws: Vec<Draw>,
    mass_matrix: Option<MassMatrixSnapshot>,
}

impl ChainTrace {
    pub fn new(chain: u64) -> Self {
        Self {
            chain,
            draws: Vec::new(),
            mass_matrix: None,
        }
    }

    pub fn chain(&self) -> u64 {
        self.chain
    }

    pub(crate) fn push(&mut self, draw: Draw) {
        assert!(draw.stats.chain == self.chain);
        assert!(draw.stats.draw == self.draws.len() as u64);
        self.draws.push(draw);
    }

    pub(crate) fn set_mass_matrix(&mut self, mass_matrix: MassMatrixSnapshot) {
        self.mass_matrix = Some(mass_matrix);
    }

    pub fn draws(&self) -> &[Draw] {
        &self.draws
    }

    pub fn len(&self) -> usize {
        self.draws.len()
    }

    pub fn is_empty(&self) -> bool {
        self.draws.is_empty()
    }

    pub fn warmup(&self) -> impl Iterator<Item = &Draw> {
        self.draws.iter().filter(|draw| draw.stats.tuning)
    }

    /// Draws taken after warmup.
    pub fn samples(&self) -> impl Iterator<Item = &Draw> {
        self.draws.iter().filter(|draw| !draw.stats.tuning)
    }

    pub fn diagnostics(&self) -> ChainDiagnostics {
        let num_samples = self.samples().count();
        let mean_tree_depth = if num_samples == 0 {
            0.
        } else {
            self.samples().map(|d| d.stats.depth as f64).sum::<f64>() / num_samples as f64
        };

        ChainDiagnostics {
            chain: self.chain,
            num_warmup: self.warmup().count(),
            num_samples,
            divergences_warmup: self.warmup().filter(|d| d.stats.diverging).count(),
            divergences_sampling: self.samples().filter(|d| d.stats.diverging).count(),
            mean_tree_depth,
            final_step_size: self.draws.last().map(|d| d.stats.step_size),
            mass_matrix: self.mass_matrix.clone(),
        }
    }

    /// Export the draws and their statistics as one arrow record batch.
    pub fn to_arrow(&self) -> Result<RecordBatch, ArrowError> {
        let n = self.draws.len();
        let list_builder = || {
            LargeListBuilder::new(Float64Builder::new())
                .with_field(Field::new("item", DataType::Float64, false))
        };

        let mut chain = UInt64Builder::with_capacity(n);
        let mut draw = UInt64Builder::with_capacity(n);
        let mut tuning = BooleanBuilder::with_capacity(n);
        let mut logp = Float64Builder::with_capacity(n);
        let mut energy = Float64Builder::with_capacity(n);
        let mut energy_error = Float64Builder::with_capacity(n);
        let mut depth = UInt64Builder::with_capacity(n);
        let mut maxdepth_reached = BooleanBuilder::with_capacity(n);
        let mut n_steps = UInt64Builder::with_capacity(n);
        let mut step_size = Float64Builder::with_capacity(n);
        let mut mean_tree_accept = Float64Builder::with_capacity(n);
        let mut diverging = BooleanBuilder::with_capacity(n);
        let mut index_in_trajectory = Int64Builder::with_capacity(n);
        let mut position = list_builder();
        let mut values = list_builder();

        for item in self.draws.iter() {
            let stats = &item.stats;
            chain.append_value(stats.chain);
            draw.append_value(stats.draw);
            tuning.append_value(stats.tuning);
            logp.append_value(stats.logp);
            energy.append_value(stats.energy);
            energy_error.append_value(stats.energy_error);
            depth.append_value(stats.depth);
            maxdepth_reached.append_value(stats.maxdepth_reached);
            n_steps.append_value(stats.n_steps);
            step_size.append_value(stats.step_size);
            mean_tree_accept.append_value(stats.mean_tree_accept);
            diverging.append_value(stats.diverging);
            index_in_trajectory.append_value(stats.index_in_trajectory);
            position.values().append_slice(&item.position);
            position.append(true);
            values.values().append_slice(&item.values);
            values.append(true);
        }

        let list_type =
            DataType::LargeList(Arc::new(Field::new("item", DataType::Float64, false)));
        let schema = Schema::new(vec![
            Field::new("chain", DataType::UInt64, false),
            Field::new("draw", DataType::UInt64, false),
            Field::new("tuning", DataType::Boolean, false),
            Field::new("logp", DataType::Float64, false),
            Field::new("energy", DataType::Float64, false),
            Field::new("energy_error", DataType::Float64, false),
            Field::new("depth", DataType::UInt64, false),
            Field::new("maxdepth_reached", DataType::Boolean, false),
            Field::new("n_steps", DataType::UInt64, false),
            Field::new("step_size", DataType::Float64, false),
            Field::new("mean_tree_accept", DataType::Float64, false),
            Field::new("diverging", DataType::Boolean, false),
            Field::new("index_in_trajectory", DataType::Int64, false),
            Field::new("position", list_type.clone(), false),
            Field::new("values", list_type, false),
        ]);

        let columns: Vec<ArrayRef> = vec![
            ArrayBuilder::finish(&mut chain),
            ArrayBuilder::finish(&mut draw),
            ArrayBuilder::finish(&mut tuning),
            ArrayBuilder::finish(&mut logp),
            ArrayBuilder::finish(&mut energy),
            ArrayBuilder::finish(&mut energy_error),
            ArrayBuilder::finish(&mut depth),
            ArrayBuilder::finish(&mut maxdepth_reached),
            ArrayBuilder::finish(&mut n_steps),
            ArrayBuilder::finish(&mut step_size),
            ArrayBuilder::finish(&mut mean_tree_accept),
            ArrayBuilder::finish(&mut diverging),
            ArrayBuilder::finish(&mut index_in_trajectory),
            ArrayBuilder::finish(&mut position),
            ArrayBuilder::finish(&mut values),
        ];

        RecordBatch::try_new(Arc::new(schema), columns)
    }
}

/// Summary statistics of one chain.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainDiagnostics {
    pub chain: u64,
    pub num_warmup: usize,
    pub num_samples: usize,
    pub divergences_warmup: usize,
    pub divergences_sampling: usize,
    /// Mean tree depth of the draws after warmup.
    pub mean_tree_depth: f64,
    pub final_step_size: Option<f64>,
    /// The inverse mass matrix the chain ended with.
    pub mass_matrix: Option<MassMatrixSnapshot>,
}

impl ChainDiagnostics {
    pub fn warmup_divergence_rate(&self) -> f64 {
        if self.num_warmup == 0 {
            return 0.;
        }
        self.divergences_warmup as f64 / self.num_warmup as f64
    }
}

/// Too many divergences during warmup of a chain.
///
/// The draws of the chain may not represent the posterior.
#[derive(Debug, Clone, PartialEq, Error)]
#[error(
    "Chain {chain} diverged in {divergences} of {num_warmup} warmup draws ({:.1}%), above the threshold of {:.1}%",
    100. * .rate,
    100. * .threshold
)]
pub struct NumericalInstabilityWarning {
    pub chain: u64,
    pub divergences: usize,
    pub num_warmup: usize,
    pub rate: f64,
    pub threshold: f64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RunDiagnostics {
    pub chains: Vec<ChainDiagnostics>,
    pub warnings: Vec<NumericalInstabilityWarning>,
}

impl RunDiagnostics {
    pub(crate) fn from_chains(chains: &[ChainTrace], divergence_threshold: f64) -> Self {
        let chains: Vec<ChainDiagnostics> = chains.iter().map(|c| c.diagnostics()).collect();
        let warnings = chains
            .iter()
            .filter(|diag| diag.warmup_divergence_rate() > divergence_threshold)
            .map(|diag| NumericalInstabilityWarning {
                chain: diag.chain,
                divergences: diag.divergences_warmup,
                num_warmup: diag.num_warmup,
                rate: diag.warmup_divergence_rate(),
                threshold: divergence_threshold,
            })
            .collect();
        Self { chains, warnings }
    }

    pub fn total_divergences(&self) -> usize {
        self.chains
            .iter()
            .map(|c| c.divergences_sampling + c.divergences_warmup)
            .sum()
    }
}

/// The result of a sampling run: one trace per chain, ordered by chain id.
#[derive(Debug, Clone)]
pub struct Trace {
    chains: Vec<ChainTrace>,
    diagnostics: RunDiagnostics,
}

impl Trace {
    pub(crate) fn new(mut chains: Vec<ChainTrace>, divergence_threshold: f64) -> Self {
        chains.sort_by_key(|chain| chain.chain());
        let diagnostics = RunDiagnostics::from_chains(&chains, divergence_threshold);
        Self {
            chains,
            diagnostics,
        }
    }

    pub fn chains(&self) -> &[ChainTrace] {
        &self.chains
    }

    pub fn chain(&self, chain: u64) -> Option<&ChainTrace> {
        self.chains.iter().find(|c| c.chain() == chain)
    }

    pub fn diagnostics(&self) -> &RunDiagnostics {
        &self.diagnostics
    }

    pub fn warnings(&self) -> &[NumericalInstabilityWarning] {
        &self.diagnostics.warnings
    }

    /// All draws after warmup, chain by chain.
    pub fn samples(&self) -> impl Iterator<Item = &Draw> {
        self.chains.iter().flat_map(|chain| chain.samples())
    }

    pub fn into_chains(self) -> Vec<ChainTrace> {
        self.chains
    }
}
