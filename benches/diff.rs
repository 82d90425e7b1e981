//! Diff engine benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use liveview::live::{diff, Node};

/// A list of keyed rows, one per id.
fn keyed_list(ids: impl IntoIterator<Item = usize>) -> Node {
    Node::element("ul").children(ids.into_iter().map(|id| {
        Node::element("li")
            .key(id.to_string())
            .attr("class", "row")
            .child(Node::text(format!("row {}", id)))
    }))
}

fn unkeyed_list(texts: impl IntoIterator<Item = String>) -> Node {
    Node::element("ul").children(
        texts
            .into_iter()
            .map(|text| Node::element("li").child(Node::text(text))),
    )
}

fn keyed_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("keyed");

    for size in [10, 100, 1000] {
        let before = keyed_list(0..size);
        let reversed = keyed_list((0..size).rev());
        group.bench_with_input(BenchmarkId::new("reverse", size), &size, |b, _| {
            b.iter(|| diff(black_box(Some(&before)), black_box(&reversed)))
        });

        let rotated = keyed_list((1..size).chain(0..1));
        group.bench_with_input(BenchmarkId::new("rotate", size), &size, |b, _| {
            b.iter(|| diff(black_box(Some(&before)), black_box(&rotated)))
        });

        let unchanged = keyed_list(0..size);
        group.bench_with_input(BenchmarkId::new("unchanged", size), &size, |b, _| {
            b.iter(|| diff(black_box(Some(&before)), black_box(&unchanged)))
        });
    }

    group.finish();
}

fn unkeyed_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("unkeyed");

    for size in [10, 100, 1000] {
        let before = unkeyed_list((0..size).map(|i| format!("item {}", i)));
        let edited = unkeyed_list((0..size).map(|i| {
            if i % 10 == 0 {
                format!("edited {}", i)
            } else {
                format!("item {}", i)
            }
        }));
        group.bench_with_input(BenchmarkId::new("text_edits", size), &size, |b, _| {
            b.iter(|| diff(black_box(Some(&before)), black_box(&edited)))
        });

        let appended = unkeyed_list((0..size + size / 10).map(|i| format!("item {}", i)));
        group.bench_with_input(BenchmarkId::new("append", size), &size, |b, _| {
            b.iter(|| diff(black_box(Some(&before)), black_box(&appended)))
        });
    }

    group.finish();
}

fn first_paint_benchmarks(c: &mut Criterion) {
    let page = keyed_list(0..1000);
    c.bench_function("full_render_1000", |b| {
        b.iter(|| diff(None, black_box(&page)))
    });
}

criterion_group!(
    benches,
    keyed_benchmarks,
    unkeyed_benchmarks,
    first_paint_benchmarks
);
criterion_main!(benches);
