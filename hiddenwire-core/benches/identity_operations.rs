use criterion::{black_box, criterion_group, criterion_main, Criterion};
use hiddenwire_core::core_auth::AuthenticationMessage;
use hiddenwire_core::core_identity::{CryptoIdentity, Identifier};

fn bench_identifier(c: &mut Criterion) {
    let mut group = c.benchmark_group("identifier");
    let identity = CryptoIdentity::from_seed(&[7u8; 32]);
    let public_key = identity.public_key().unwrap();
    let text = identity.identifier().unwrap().to_string();

    group.bench_function("derive_from_public_key", |b| {
        b.iter(|| black_box(CryptoIdentity::derive_identifier(black_box(&public_key)).unwrap()));
    });

    group.bench_function("parse", |b| {
        b.iter(|| black_box(Identifier::parse(black_box(&text)).unwrap()));
    });

    group.finish();
}

fn bench_handshake_message(c: &mut Criterion) {
    let mut group = c.benchmark_group("auth_message");
    let identity = CryptoIdentity::from_seed(&[7u8; 32]);
    let destination = CryptoIdentity::from_seed(&[8u8; 32]).identifier().unwrap();

    group.bench_function("sign", |b| {
        b.iter(|| black_box(AuthenticationMessage::signed(&identity, &destination, 1_700_000_000_000).unwrap()));
    });

    let message = AuthenticationMessage::signed(&identity, &destination, 1_700_000_000_000).unwrap();
    let payload = AuthenticationMessage::signing_payload(
        &message.source,
        &message.destination,
        &message.public_key,
        message.timestamp,
    );
    group.bench_function("verify", |b| {
        b.iter(|| {
            black_box(CryptoIdentity::verify(
                black_box(&payload),
                &message.signature,
                &message.public_key,
            ))
        });
    });

    group.finish();
}

criterion_group!(benches, bench_identifier, bench_handshake_message);
criterion_main!(benches);
