//! Benchmarks for the host mirror of the online-softmax chunk loop.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use half::f16;

use tierkv_core::attention::reference::{chunked_attention, AttnShape};

fn inputs(shape: AttnShape) -> (Vec<f16>, Vec<f16>, Vec<f16>) {
    let fill = |n: usize, seed: u32| -> Vec<f16> {
        (0..n)
            .map(|i| {
                // Cheap deterministic pseudo-noise in [-0.1, 0.1].
                let x = ((i as u32).wrapping_mul(2654435761).wrapping_add(seed) >> 16) as f32;
                f16::from_f32((x / 65536.0 - 0.5) * 0.2)
            })
            .collect()
    };
    (
        fill(shape.batch * shape.q_heads * shape.head_dim, 1),
        fill(shape.seq_len * shape.kv_heads * shape.head_dim, 2),
        fill(shape.seq_len * shape.kv_heads * shape.head_dim, 3),
    )
}

fn bench_chunked(c: &mut Criterion) {
    let shape = AttnShape {
        batch: 1,
        q_heads: 8,
        kv_heads: 8,
        head_dim: 128,
        seq_len: 2048,
    };
    let (q, k, v) = inputs(shape);

    for chunk in [256usize, 512, 2048] {
        c.bench_function(&format!("chunked_attention_seq2048_chunk{chunk}"), |b| {
            b.iter(|| black_box(chunked_attention(&q, &k, &v, shape, chunk)))
        });
    }
}

fn bench_gqa(c: &mut Criterion) {
    let shape = AttnShape {
        batch: 1,
        q_heads: 40,
        kv_heads: 8,
        head_dim: 128,
        seq_len: 512,
    };
    let (q, k, v) = inputs(shape);

    c.bench_function("chunked_attention_gqa40_8", |b| {
        b.iter(|| black_box(chunked_attention(&q, &k, &v, shape, 256)))
    });
}

criterion_group!(benches, bench_chunked, bench_gqa);
criterion_main!(benches);
