//! Hot-path microbenchmarks: cross-shard ring transfer and prompt
//! continuation chains.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use shoal_core::shard::Mailbox;
use shoal_core::Future;

fn mailbox_push_pop(c: &mut Criterion) {
    let ring: Mailbox<u64> = Mailbox::new(1024);
    c.bench_function("mailbox_push_pop", |b| {
        b.iter(|| {
            ring.push(black_box(42)).unwrap();
            black_box(ring.pop())
        });
    });
}

fn mailbox_burst(c: &mut Criterion) {
    let ring: Mailbox<u64> = Mailbox::new(1024);
    c.bench_function("mailbox_burst_256", |b| {
        b.iter(|| {
            for i in 0..256 {
                ring.push(black_box(i)).unwrap();
            }
            while ring.pop().is_some() {}
        });
    });
}

fn ready_future_chain(c: &mut Criterion) {
    c.bench_function("ready_future_chain_x4", |b| {
        b.iter(|| {
            Future::ready(black_box(1u64))
                .then(|n| n + 1)
                .then(|n| n + 1)
                .then(|n| n + 1)
                .then(|n| {
                    black_box(n);
                });
        });
    });
}

criterion_group!(benches, mailbox_push_pop, mailbox_burst, ready_future_chain);
criterion_main!(benches);
