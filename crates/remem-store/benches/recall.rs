use std::sync::Arc;

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use remem_core::{FitConfig, HashEmbedder, Signal};
use remem_store::{CellStore, Memory};

fn bench_recall(c: &mut Criterion) {
    let dir = tempfile::TempDir::new().unwrap();
    let store = CellStore::open(dir.path()).unwrap();
    let fit = FitConfig {
        max_epochs: 5,
        seed: Some(42),
        ..FitConfig::default()
    };
    let memory = Memory::new(store, Arc::new(HashEmbedder::default()), fit);
    for i in 0..50 {
        memory
            .learn(
                &Signal::Keywords(vec![format!("topic{i}"), "shared".into()]),
                &format!("memory number {i}"),
            )
            .unwrap();
    }

    c.bench_function("recall_50_cells", |b| {
        b.iter(|| memory.recall(black_box("topic7 shared"), 3).unwrap())
    });
}

criterion_group!(benches, bench_recall);
criterion_main!(benches);
