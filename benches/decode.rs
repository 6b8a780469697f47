//! Criterion benchmarks for the per-report hot path.
//!
//! Every report goes through decode, the edge tracker and the chord detector,
//! so these bound how fast the poll loop can keep up with the device.
//!
//! Run with: cargo bench --bench decode

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use keytar_core::{decode, encode, ActiveSet, ChordDetector, EdgeTracker, SwitchIndex, Timestamp};
use std::time::Duration;

fn set_of(keys: &[u8]) -> ActiveSet {
    keys.iter().filter_map(|k| SwitchIndex::new(*k)).collect()
}

/// Decode cost against how many keys are down.
fn decode_reports(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Elements(1));

    let cases = [
        ("none", ActiveSet::empty()),
        ("one", set_of(&[12])),
        ("triad", set_of(&[0, 4, 7])),
        ("all", ActiveSet::from_bits(u32::MAX)),
    ];

    for (name, set) in cases {
        let report = encode(set);
        group.bench_with_input(BenchmarkId::new("report", name), &report, |b, report| {
            b.iter(|| decode(black_box(report)).unwrap());
        });
    }

    group.bench_function("short", |b| {
        let short = [0u8; 6];
        b.iter(|| decode(black_box(&short)).is_err());
    });

    group.finish();
}

/// A simulated performance: chords held for a while, then changed.
fn state_machines(c: &mut Criterion) {
    let progression = [
        set_of(&[0, 4, 7]),
        set_of(&[5, 9, 12]),
        set_of(&[7, 11, 14]),
        ActiveSet::empty(),
    ];
    let reports: Vec<[u8; 27]> = progression
        .iter()
        .flat_map(|set| std::iter::repeat(encode(*set)).take(50))
        .collect();

    let mut group = c.benchmark_group("pipeline");
    group.throughput(Throughput::Elements(reports.len() as u64));

    group.bench_function("edge_and_chord", |b| {
        b.iter(|| {
            let mut tracker = EdgeTracker::new();
            let mut detector = ChordDetector::new(Duration::from_millis(200)).unwrap();
            let mut now = Timestamp::ZERO;
            let mut chords = 0usize;
            let mut edges = 0usize;
            for report in &reports {
                let set = decode(black_box(report)).unwrap();
                edges += tracker.update(set).events().count();
                if detector.update(set, now).is_some() {
                    chords += 1;
                }
                now = now + Duration::from_millis(10);
            }
            black_box((edges, chords))
        });
    });

    group.finish();
}

criterion_group!(benches, decode_reports, state_machines);
criterion_main!(benches);
