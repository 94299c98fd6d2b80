use beacon::crypto::{sign_hashed, SigningKeyPair};
use beacon::events::{mine, Event};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn benchmark_mining(c: &mut Criterion) {
    let signer = SigningKeyPair::from_seed(&[7u8; 32]).unwrap();
    let data = "benchmark chat line";
    let signature = sign_hashed(&signer, data.as_bytes());

    for difficulty in 1..=2 {
        c.bench_function(&format!("mine event (difficulty {})", difficulty), |b| {
            b.iter(|| {
                let mut event = Event::new(data, signature.clone());
                mine(black_box(&mut event), difficulty).unwrap();
                event
            });
        });
    }
}

fn benchmark_signing(c: &mut Criterion) {
    let signer = SigningKeyPair::from_seed(&[7u8; 32]).unwrap();
    let message = b"Hello, beacon! This is a test message for benchmarking.";

    c.bench_function("sign event", |b| {
        b.iter(|| sign_hashed(black_box(&signer), black_box(message)));
    });
}

criterion_group!(benches, benchmark_mining, benchmark_signing);
criterion_main!(benches);
