/*!
 * Call-out Benchmark
 * Wire encoding and CPU selection round trips through the simulation backend
 */

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use schedctl::core::{DomainArg, TaskCpuArg, WireRecord};
use schedctl::{
    CpuSelection, MemoryResidency, ObjectArtifact, QueuedTask, ResidencyPolicy, SchedulerConfig,
    SchedulerController, SimulatedObjectBuilder,
};
use std::sync::Arc;

fn benchmark_encoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("wire_encoding");
    group.throughput(Throughput::Elements(1));

    let task = TaskCpuArg {
        pid: 4242,
        cpu: 3,
        flags: 0x8,
    };
    let domain = DomainArg {
        level_id: 1,
        cpu_id: 2,
        sibling_cpu_id: 3,
    };
    let task_bytes = task.encode().unwrap();

    group.bench_function("task_cpu_encode", |b| {
        b.iter(|| black_box(black_box(&task).encode().unwrap()));
    });
    group.bench_function("task_cpu_decode", |b| {
        b.iter(|| black_box(TaskCpuArg::decode(black_box(&task_bytes)).unwrap()));
    });
    group.bench_function("domain_encode", |b| {
        b.iter(|| black_box(black_box(&domain).encode().unwrap()));
    });

    group.finish();
}

fn benchmark_selection_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("selection_decode");

    for raw in [0u64, 63, i32::MAX as u64, u32::MAX as u64].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(raw), raw, |b, raw| {
            b.iter(|| black_box(CpuSelection::from_raw(black_box(*raw))));
        });
    }

    group.finish();
}

fn benchmark_select_cpu(c: &mut Criterion) {
    let (loader, _kernel) = SimulatedObjectBuilder::default().build();
    let residency = MemoryResidency::establish(ResidencyPolicy::Disabled).unwrap();
    let controller =
        SchedulerController::new(Arc::new(loader), SchedulerConfig::default(), residency);
    let mut handle = controller
        .load(&ObjectArtifact::Path("bench.bpf.o".into()))
        .unwrap();
    let invoker = handle.invoker();

    let task = QueuedTask {
        pid: 1,
        cpu: 2,
        flags: 0,
    };
    c.bench_function("select_cpu_simulated", |b| {
        b.iter(|| black_box(invoker.select_cpu(black_box(&task)).unwrap()));
    });

    handle.close();
}

criterion_group!(
    benches,
    benchmark_encoding,
    benchmark_selection_decode,
    benchmark_select_cpu
);
criterion_main!(benches);
