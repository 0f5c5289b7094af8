//! Content codec benchmarks, JSON against MessagePack.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use dbwire_protocol::{ContentCodec, ContentSerde, ContentType, DocumentMeta};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Order {
    #[serde(flatten)]
    meta: DocumentMeta,
    customer: String,
    lines: Vec<Line>,
    total_cents: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Line {
    sku: String,
    quantity: u32,
    price_cents: u64,
}

fn create_order(lines: usize) -> Order {
    Order {
        meta: DocumentMeta::with_key("order-1"),
        customer: "customer-42".to_string(),
        lines: (0..lines)
            .map(|i| Line {
                sku: format!("sku-{i:05}"),
                quantity: (i % 7) as u32 + 1,
                price_cents: 199 + i as u64,
            })
            .collect(),
        total_cents: 0,
    }
}

fn codecs() -> [(&'static str, ContentSerde); 2] {
    [
        ("json", ContentSerde::new(ContentType::Json)),
        ("pack", ContentSerde::new(ContentType::Pack)),
    ]
}

fn bench_serialize(c: &mut Criterion) {
    let mut group = c.benchmark_group("content_serialize");

    for lines in [10, 1000] {
        let order = create_order(lines);
        for (name, codec) in codecs() {
            group.bench_with_input(BenchmarkId::new(name, lines), &order, |b, order| {
                b.iter(|| black_box(codec.serialize(order).unwrap()));
            });
        }
    }

    group.finish();
}

fn bench_deserialize(c: &mut Criterion) {
    let mut group = c.benchmark_group("content_deserialize");

    for lines in [10, 1000] {
        let order = create_order(lines);
        for (name, codec) in codecs() {
            let bytes = codec.serialize(&order).unwrap();
            group.bench_with_input(BenchmarkId::new(name, lines), &bytes, |b, bytes| {
                b.iter(|| black_box(codec.deserialize::<Order>(bytes).unwrap()));
            });
        }
    }

    group.finish();
}

fn bench_deserialize_at_path(c: &mut Criterion) {
    let mut group = c.benchmark_group("content_deserialize_at_path");

    for lines in [10, 1000] {
        let order = create_order(lines);
        for (name, codec) in codecs() {
            let bytes = codec.serialize(&order).unwrap();
            group.bench_with_input(BenchmarkId::new(name, lines), &bytes, |b, bytes| {
                b.iter(|| black_box(codec.deserialize_at_path::<String>(bytes, "/customer").unwrap()));
            });
        }
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_serialize,
    bench_deserialize,
    bench_deserialize_at_path,
);

criterion_main!(benches);
