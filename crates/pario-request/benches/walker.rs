use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use pario_dist::{DistributionView, SimpleStripe};
use pario_request::{OutputMode, Request, RequestTree, RequestWalker, SegmentBudget, TraversalState};

/// Strided pattern: `count` blocks of 512 bytes, 4 KiB apart
fn strided(count: u64) -> RequestTree {
    Request::hvector(count, 512, 4096, &Request::byte())
        .expect("valid pattern")
        .commit()
}

/// Two-level pattern: rows of strided columns
fn nested(rows: u64) -> RequestTree {
    let byte = Request::byte();
    let row = Request::hvector(64, 8, 64, &byte).expect("valid row");
    Request::hvector(rows, 1, 8192, &row)
        .expect("valid pattern")
        .commit()
}

fn bench_contiguous(c: &mut Criterion) {
    let mut group = c.benchmark_group("contiguous");
    let dist = SimpleStripe::new(64 * 1024).expect("valid strip");

    for (len, name) in [(1 << 20, "1MB"), (64 << 20, "64MB")] {
        let tree = RequestTree::contiguous(len).expect("valid request");
        group.throughput(Throughput::Bytes(len));
        group.bench_with_input(BenchmarkId::new("target_relative", name), &tree, |b, tree| {
            let walker = RequestWalker::new(tree, &dist);
            b.iter(|| {
                let mut state = TraversalState::new(tree);
                let mut view = DistributionView::new(1, 4).with_extend(true);
                black_box(
                    walker
                        .drain(
                            &mut state,
                            &mut view,
                            SegmentBudget::default(),
                            OutputMode::TargetRelative,
                        )
                        .expect("walk"),
                )
            });
        });
    }

    group.finish();
}

fn bench_patterns(c: &mut Criterion) {
    let mut group = c.benchmark_group("patterns");
    let dist = SimpleStripe::new(64 * 1024).expect("valid strip");

    for (name, tree) in [("strided_4k", strided(4096)), ("nested_256", nested(256))] {
        group.throughput(Throughput::Elements(tree.root().contiguous_chunks));
        group.bench_with_input(BenchmarkId::new("client_relative", name), &tree, |b, tree| {
            let walker = RequestWalker::new(tree, &dist);
            b.iter(|| {
                let mut state = TraversalState::new(tree);
                let mut view = DistributionView::new(0, 4).with_extend(true);
                black_box(
                    walker
                        .drain(
                            &mut state,
                            &mut view,
                            SegmentBudget::default(),
                            OutputMode::ClientRelative,
                        )
                        .expect("walk"),
                )
            });
        });
        group.bench_with_input(BenchmarkId::new("count_only", name), &tree, |b, tree| {
            let walker = RequestWalker::new(tree, &dist);
            let state = TraversalState::new(tree);
            let view = DistributionView::new(0, 4).with_extend(true);
            b.iter(|| black_box(walker.count(&state, &view, SegmentBudget::unlimited()).expect("count")));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_contiguous, bench_patterns);
criterion_main!(benches);
