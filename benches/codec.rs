//! Benchmarks for the wire codec
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use sensorlink::{Layout, Value};

fn bench_vector_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("vector_decode");

    for lanes in [3u8, 4, 8].iter() {
        let layout = Layout::vector(2, *lanes, true);
        let buffer: Vec<u8> = (0..layout.payload_len()).map(|i| i as u8).collect();
        group.throughput(Throughput::Bytes(buffer.len() as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(lanes),
            &buffer,
            |b, buffer| {
                b.iter(|| {
                    sensorlink::codec::decode(black_box(buffer), &layout, 16384.0).unwrap()
                });
            },
        );
    }
    group.finish();
}

fn bench_scalar_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("scalar_decode");

    let scaled = Layout::scalar(2, true);
    group.bench_function("scaled_float", |b| {
        b.iter(|| sensorlink::codec::decode(black_box(&[0xAC, 0x00]), &scaled, 8.0).unwrap());
    });

    let raw = Layout::scalar(4, false);
    group.bench_function("unit_scale", |b| {
        b.iter(|| {
            sensorlink::codec::decode(black_box(&[1, 2, 3, 4]), &raw, 1.0).unwrap()
        });
    });
    group.finish();
}

fn bench_vector_encode(c: &mut Criterion) {
    let layout = Layout::vector(2, 3, true);
    let value = Value::Vector(vec![0.5, -0.25, 1.0]);
    c.bench_function("vector_encode", |b| {
        b.iter(|| sensorlink::codec::encode(black_box(&value), &layout, 16384.0).unwrap());
    });
}

criterion_group!(
    benches,
    bench_vector_decode,
    bench_scalar_decode,
    bench_vector_encode
);
criterion_main!(benches);
