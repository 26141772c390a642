// Tracer packet benchmarks.
//
// Covers body encoding and decoding at growing hop counts, and the merge of
// a full path into the internal map.

use std::net::IpAddr;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use ntk_protocol::map::{BnodeLink, Topology};
use ntk_protocol::tracer::{
    merge_into_map, BcastHeader, BorderBlock, TracerChunk, TracerPacket, BCAST_STARTER,
};

const LEVELS: u8 = 4;

/// A level-0 tracer of `hops` hops (node ids 2..) with one border block.
fn tracer(hops: usize) -> TracerPacket {
    TracerPacket {
        bcast: BcastHeader {
            gnode_id: 0,
            level: 0,
            gnode_ttl: 255,
            sub_id: 2,
            flags: BCAST_STARTER,
        },
        first_open_chunk: 0,
        chunks: (0..hops)
            .map(|i| TracerChunk {
                node: (i % 250 + 2) as u8,
                rtt: 5 + i as u32,
                gcount: 1,
            })
            .collect(),
        blocks: vec![BorderBlock {
            gids: vec![2, 0, 0, 10],
            links: vec![BnodeLink {
                gnode: 7,
                level: 1,
                rtt: 40,
            }],
        }],
    }
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("tracer/encode");
    for hops in [1usize, 16, 128, 250] {
        let pkt = tracer(hops);
        group.throughput(Throughput::Elements(hops as u64));
        group.bench_with_input(BenchmarkId::from_parameter(hops), &pkt, |b, pkt| {
            b.iter(|| pkt.encode(LEVELS));
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("tracer/decode");
    for hops in [1usize, 16, 128, 250] {
        let raw = tracer(hops).encode(LEVELS);
        group.throughput(Throughput::Bytes(raw.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(hops), &raw, |b, raw| {
            b.iter(|| TracerPacket::decode(raw, LEVELS).unwrap());
        });
    }
    group.finish();
}

fn bench_merge(c: &mut Criterion) {
    let me: IpAddr = "10.0.0.1".parse().unwrap();
    let pkt = tracer(250);

    c.bench_function("tracer/merge_250_hops", |b| {
        b.iter_batched(
            || Topology::new(me),
            |topology| {
                let mut w = topology.write();
                merge_into_map(&mut w, 0, &pkt.chunks, 0, 10, 650)
            },
            criterion::BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, bench_encode, bench_decode, bench_merge);
criterion_main!(benches);
