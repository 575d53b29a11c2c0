//! Peeling kernel benchmark: scalar vs vector engines across alphabet sizes.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use felsen_core::{InstanceSizing, LikelihoodBackend, PartialsOp};
use felsen_cpu::CpuBackend;

fn sizing(state_count: usize) -> InstanceSizing {
    InstanceSizing {
        state_count,
        pattern_count: 2000,
        category_count: 4,
        tip_count: 2,
        partials_buffer_count: 4,
        compact_buffer_count: 2,
        eigen_buffer_count: 1,
        matrix_buffer_count: 2,
    }
}

fn prepare(backend: &mut CpuBackend, sizing: &InstanceSizing) {
    let states = sizing.state_count;
    let mut matrix = vec![0.0; sizing.matrix_len()];
    for (i, entry) in matrix.iter_mut().enumerate() {
        *entry = ((i * 31 % 17) as f64 + 1.0) / (17.0 * states as f64);
    }
    backend.set_transition_matrix(0, &matrix).unwrap();
    backend.set_transition_matrix(1, &matrix).unwrap();

    let partials: Vec<f64> = (0..sizing.partials_len())
        .map(|i| ((i * 13 % 29) as f64 + 0.5) / 30.0)
        .collect();
    backend.set_partials(0, &partials).unwrap();
    backend.set_partials(1, &partials).unwrap();
}

fn bench_peeling(c: &mut Criterion) {
    let mut group = c.benchmark_group("peel");
    // Nucleotide and amino-acid alphabets; codons are omitted to keep the
    // default run short.
    for state_count in [4usize, 20] {
        let sizing = sizing(state_count);
        let op = [PartialsOp::new(2, 0, 0, 1, 1)];

        let mut scalar = CpuBackend::scalar(sizing).unwrap();
        prepare(&mut scalar, &sizing);
        group.bench_with_input(
            BenchmarkId::new("scalar", state_count),
            &state_count,
            |b, _| b.iter(|| scalar.update_partials(&op, false).unwrap()),
        );

        let mut vector = CpuBackend::vectorized(sizing).unwrap();
        prepare(&mut vector, &sizing);
        group.bench_with_input(
            BenchmarkId::new("vector", state_count),
            &state_count,
            |b, _| b.iter(|| vector.update_partials(&op, false).unwrap()),
        );
    }
    group.finish();
}

criterion_group!(benches, bench_peeling);
criterion_main!(benches);
