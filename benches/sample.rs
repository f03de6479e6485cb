use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use nuts_sampler::{
    sample, sample_sequentially, DensityModel, LogpError, LogpFunc, NutsSettings,
};
use thiserror::Error;

#[derive(Clone, Debug)]
struct NormalLogp {
    dim: usize,
    mu: f64,
}

#[derive(Error, Debug)]
enum NormalLogpError {}

impl LogpError for NormalLogpError {
    fn is_recoverable(&self) -> bool {
        false
    }
}

impl LogpFunc for NormalLogp {
    type LogpError = NormalLogpError;

    fn logp(&mut self, position: &[f64], gradient: &mut [f64]) -> Result<f64, NormalLogpError> {
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

fn settings() -> NutsSettings {
    NutsSettings {
        num_chains: 1,
        num_warmup: 100,
        num_draws: 100,
        num_cores: 1,
        seed: 42,
        ..Default::default()
    }
}

fn criterion_benchmark(c: &mut Criterion) {
    for dim in [10, 1000] {
        let model = DensityModel::new(NormalLogp { dim, mu: 3. });

        c.bench_function(&format!("sequential chain normal {dim}"), |b| {
            b.iter_batched(
                settings,
                |settings| {
                    let draws = sample_sequentially(black_box(&model), &settings, 0)
                        .expect("Could not start chain");
                    for draw in draws {
                        black_box(draw.expect("Sampling failed"));
                    }
                },
                BatchSize::SmallInput,
            )
        });
    }

    let model = DensityModel::new(NormalLogp { dim: 100, mu: 3. });
    let parallel = NutsSettings {
        num_chains: 4,
        num_cores: 4,
        ..settings()
    };
    c.bench_function("four chains normal 100", |b| {
        b.iter(|| sample(black_box(&model), &parallel).expect("Sampling failed"))
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
