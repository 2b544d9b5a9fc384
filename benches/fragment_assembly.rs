//! Benchmarks for the image path
//!
//! Covers the work done per received image set:
//! - Fragmenting an encoded image block into wire frames
//! - Frame encoding and checksum verification through the codec
//! - Reassembly from in-order and interleaved fragments

use bytes::BytesMut;
use criterion::{BatchSize, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;
use stereolink::StalePolicy;
use stereolink::protocol::{Assembled, FragmentAssembler, WireCodec, fragment_image_set};
use stereolink::test_utils::test_image_set;
use tokio_util::codec::{Decoder, Encoder};

const PAYLOAD: usize = 1452;

fn bench_fragmentation(c: &mut Criterion) {
    let set = test_image_set(1, 640, 480);

    let mut group = c.benchmark_group("fragmentation");
    group.throughput(Throughput::Bytes(set.payload_len() as u64));
    group.bench_function("vga_left_disparity", |b| {
        b.iter(|| black_box(fragment_image_set(black_box(&set), PAYLOAD).expect("fragment")))
    });
    group.finish();
}

fn bench_codec(c: &mut Criterion) {
    let frames = fragment_image_set(&test_image_set(1, 640, 480), PAYLOAD).expect("fragment");
    let mut encoded = BytesMut::new();
    for frame in &frames {
        WireCodec.encode(frame.clone(), &mut encoded).expect("encode");
    }

    let mut group = c.benchmark_group("codec");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("decode_stream", |b| {
        b.iter_batched(
            || encoded.clone(),
            |mut buf| {
                let mut count = 0;
                while let Some(frame) = WireCodec.decode(&mut buf).expect("decode") {
                    black_box(frame);
                    count += 1;
                }
                count
            },
            BatchSize::SmallInput,
        )
    });
    group.finish();
}

fn bench_reassembly(c: &mut Criterion) {
    let frames = fragment_image_set(&test_image_set(1, 640, 480), PAYLOAD).expect("fragment");
    let interleaved: Vec<_> = frames
        .iter()
        .filter(|f| f.fragment_index % 2 == 1)
        .chain(frames.iter().filter(|f| f.fragment_index % 2 == 0))
        .cloned()
        .collect();

    let mut group = c.benchmark_group("reassembly");
    for (name, order) in [("in_order", &frames), ("interleaved", &interleaved)] {
        group.bench_function(name, |b| {
            b.iter_batched(
                || (FragmentAssembler::new(StalePolicy::Drop), order.clone()),
                |(mut assembler, frames)| {
                    let mut complete = None;
                    for frame in frames {
                        if let Ok(Assembled::Complete(set)) = assembler.push(frame) {
                            complete = Some(set);
                        }
                    }
                    black_box(complete.expect("set completes"))
                },
                BatchSize::LargeInput,
            )
        });
    }
    group.finish();
}

criterion_group!(benches, bench_fragmentation, bench_codec, bench_reassembly);
criterion_main!(benches);
