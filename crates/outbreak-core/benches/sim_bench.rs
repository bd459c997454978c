use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use outbreak_core::{OutbreakConfig, Simulation};

fn bench_simulation_steps(c: &mut Criterion) {
    let mut group = c.benchmark_group("simulation_step");
    let steps: usize = std::env::var("OUTBREAK_BENCH_STEPS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(32);
    let populations: Vec<usize> = std::env::var("OUTBREAK_BENCH_AGENTS")
        .ok()
        .map(|s| {
            s.split(',')
                .filter_map(|t| t.trim().parse::<usize>().ok())
                .collect::<Vec<_>>()
        })
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| vec![2_000, 10_000]);

    for &population in &populations {
        group.bench_function(format!("steps{steps}_agents{population}"), |b| {
            b.iter_batched(
                || {
                    // Small grid relative to the population to stress the
                    // per-cell list insertions.
                    let config = OutbreakConfig {
                        width: 64,
                        height: 64,
                        infection_chance: 0.5,
                        infection_duration: 16,
                        immunity_duration: 32,
                        initial_normal: population - population / 10,
                        initial_infected: population / 10,
                        initial_immune: 0,
                        tick_budget: -1,
                        rng_seed: Some(0xBEEF),
                    };
                    Simulation::new(config).expect("simulation")
                },
                |mut sim| {
                    for _ in 0..steps {
                        if sim.step().is_none() {
                            break;
                        }
                    }
                },
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_simulation_steps);
criterion_main!(benches);
