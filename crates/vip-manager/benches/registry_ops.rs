// Benchmarks for instance registry operations under the exclusive lock

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;
use vip_manager::InstanceRegistry;
use vip_manager::types::{Instance, VipService};

fn instance(i: usize) -> Instance {
    let service = VipService {
        uid: format!("uid-{}", i),
        namespace: "default".to_string(),
        name: format!("svc-{}", i),
        vips: vec![format!("10.0.{}.{}", i / 256, i % 256).parse().unwrap()],
    };
    Instance::new(service, CancellationToken::new())
}

fn bench_registry(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("registry");

    for size in [10, 100, 1000] {
        let registry = InstanceRegistry::new();
        rt.block_on(async {
            for i in 0..size {
                registry.upsert(instance(i)).await;
            }
        });

        group.bench_with_input(BenchmarkId::new("find", size), &size, |b, &size| {
            let uid = format!("uid-{}", size - 1);
            b.iter(|| rt.block_on(registry.find(black_box(&uid))));
        });

        group.bench_with_input(BenchmarkId::new("upsert_existing", size), &size, |b, &size| {
            let existing = instance(size / 2);
            b.iter(|| rt.block_on(registry.upsert(black_box(existing.clone()))));
        });

        group.bench_with_input(BenchmarkId::new("remove_insert", size), &size, |b, &size| {
            let uid = format!("uid-{}", size / 2);
            let replacement = instance(size / 2);
            b.iter(|| {
                rt.block_on(async {
                    registry.remove(black_box(&uid)).await;
                    registry.upsert(replacement.clone()).await;
                })
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_registry);
criterion_main!(benches);
