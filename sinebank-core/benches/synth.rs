use criterion::{black_box, criterion_group, criterion_main, Criterion};
use sinebank_core::meter::Measurement;
use sinebank_core::rate::SampleRateAdvisor;
use sinebank_core::synth::synthesize;

fn bench_synthesize(c: &mut Criterion) {
    let adv = SampleRateAdvisor::default();
    for f in [10.0_f64, 1_000.0, 5_000.0] {
        let sr = adv.recommend(f).unwrap();
        c.bench_function(&format!("synthesize {f} Hz @ {sr} S/s"), |b| {
            b.iter(|| synthesize(black_box(f), black_box(0.001), black_box(sr)));
        });
    }
}

fn bench_measure(c: &mut Criterion) {
    let batch = synthesize(1_000.0, 1.0, 200_000.0).unwrap().repeat(5);
    c.bench_function("measure 1000-sample batch", |b| {
        b.iter(|| Measurement::of(black_box(&batch)));
    });
}

criterion_group!(benches, bench_synthesize, bench_measure);
criterion_main!(benches);
