use criterion::{criterion_group, criterion_main, Criterion};
use lmtune_core::data::DataRow;
use lmtune_core::objective::{EncodedExample, MaskedObjective, Objective};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn examples(n: usize, objective: &Objective) -> Vec<EncodedExample> {
    (0..n)
        .map(|i| {
            let row = DataRow::new([
                ("question", format!("What is the capital of country number {i}?")),
                ("answer", format!("City {i}, which sits on river {}", i % 17)),
            ]);
            objective.encode(&row).expect("encode")
        })
        .collect()
}

fn bench_collate(c: &mut Criterion) {
    let objective = Objective::Masked(MaskedObjective::new(
        vec!["question".into(), "answer".into()],
        "\n\n".into(),
        0.15,
        256,
    ));
    let data = examples(256, &objective);

    c.bench_function("masked_collate_batch8", |b| {
        let refs: Vec<&EncodedExample> = data.iter().take(8).collect();
        let mut rng = StdRng::seed_from_u64(7);
        b.iter(|| objective.collate(&refs, &mut rng))
    });

    c.bench_function("masked_collate_batch64", |b| {
        let refs: Vec<&EncodedExample> = data.iter().take(64).collect();
        let mut rng = StdRng::seed_from_u64(7);
        b.iter(|| objective.collate(&refs, &mut rng))
    });

    c.bench_function("eval_batches_256x8", |b| {
        b.iter(|| objective.eval_batches(&data, 8, 42))
    });
}

criterion_group!(benches, bench_collate);
criterion_main!(benches);
