//! Benchmarks for execution-order resolution.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use scribeflow::core::StageResult;
use scribeflow::pipeline::{ExecutionPlan, StageDefinition, StageRegistry, Targets};
use scribeflow::stages::FnStage;

/// `layers` layers of `width` stages; every stage depends on two stages of
/// the previous layer.
fn layered_registry(layers: usize, width: usize) -> StageRegistry {
    let mut registry = StageRegistry::new();
    for layer in 0..layers {
        for i in 0..width {
            let name = format!("s{layer}_{i}");
            let mut def = StageDefinition::new(
                name.clone(),
                FnStage::new(name, |_, _| Ok(StageResult::text("ok"))),
            );
            if layer > 0 {
                def = def
                    .with_dependency(format!("s{}_{i}", layer - 1))
                    .with_dependency(format!("s{}_{}", layer - 1, (i + 1) % width));
            }
            registry.register(def).expect("generated names are unique");
        }
    }
    registry
}

fn execution_order_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("build_execution_order");
    for (layers, width) in [(5, 4), (20, 10), (50, 20)] {
        let registry = layered_registry(layers, width);
        let target = format!("s{}_0", layers - 1);
        group.bench_with_input(
            BenchmarkId::new("closure", layers * width),
            &target,
            |b, target| b.iter(|| black_box(registry.build_execution_order([target.as_str()]))),
        );
        group.bench_with_input(BenchmarkId::new("all", layers * width), &registry, |b, registry| {
            b.iter(|| black_box(registry.resolve(&Targets::All)))
        });
    }
    group.finish();
}

fn plan_benchmark(c: &mut Criterion) {
    let registry = layered_registry(50, 20);
    c.bench_function("plan_parallel_1000", |b| {
        b.iter(|| {
            let order = registry.resolve(&Targets::All).unwrap_or_default();
            black_box(ExecutionPlan::from_order(order, true))
        })
    });
}

criterion_group!(benches, execution_order_benchmark, plan_benchmark);
criterion_main!(benches);
