//! Benchmarks for thread detection.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use kbflow::core::ContentItem;
use kbflow::testing::thread_batch;
use kbflow::threads::ThreadDetector;

fn thread_detection_benchmark(c: &mut Criterion) {
    let detector = ThreadDetector::default();
    let mut group = c.benchmark_group("detect_threads");
    for (authors, chain_len) in [(10, 10), (50, 20), (200, 25)] {
        let items: Vec<ContentItem> = thread_batch(authors, chain_len)
            .into_iter()
            .map(ContentItem::from_raw)
            .collect();
        group.bench_with_input(
            BenchmarkId::from_parameter(items.len()),
            &items,
            |b, items| b.iter(|| detector.detect_threads(black_box(items))),
        );
    }
    group.finish();
}

criterion_group!(benches, thread_detection_benchmark);
criterion_main!(benches);
