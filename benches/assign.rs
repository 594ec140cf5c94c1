use criterion::{Criterion, black_box, criterion_group, criterion_main};
use model_ci::queue::assign_models_to_queues;

fn make_models(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("org/model-{i}")).collect()
}

fn make_workspaces(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("ws-{i}")).collect()
}

fn bench_assign(c: &mut Criterion) {
    let workspaces = make_workspaces(8);

    for n in [100, 5_000] {
        let models = make_models(n);
        c.bench_function(&format!("assign n={n} workspaces=8 threads=3"), |bch| {
            bch.iter(|| assign_models_to_queues(black_box(&models), black_box(&workspaces), 3))
        });
    }

    let models = make_models(5_000);
    let assignment = assign_models_to_queues(&models, &workspaces, 3).expect("assignment");
    c.bench_function("queues n=5000", |bch| bch.iter(|| black_box(&assignment).queues()));
}

criterion_group!(benches, bench_assign);
criterion_main!(benches);
