//! Host-side mirror of the chunked online-softmax recurrence, plus the f32
//! reference it is validated against.
//!
//! The mirror follows the device kernel step for step (same GQA mapping,
//! same correction factor, same f16 output cast) so tolerance and
//! chunk-invariance properties can be checked on machines without a GPU,
//! and the GPU parity test has a bit-comparable baseline.
//!
//! Layouts match the pipeline buffers:
//!   Q:    [batch, q_heads, head_dim]   f16
//!   K, V: [seq, kv_heads, head_dim]    f16
//!   out:  [batch, q_heads, head_dim]

use half::f16;

/// Result of a host chunked run, including pipeline call counts.
pub struct ChunkedRun {
    pub output: Vec<f16>,
    /// Chunk-kernel invocations (per layer forward, not per head).
    pub chunks: usize,
    /// Normalize invocations.
    pub normalizes: usize,
}

/// Geometry for one forward.
#[derive(Debug, Clone, Copy)]
pub struct AttnShape {
    pub batch: usize,
    pub q_heads: usize,
    pub kv_heads: usize,
    pub head_dim: usize,
    pub seq_len: usize,
}

impl AttnShape {
    pub fn scale(&self) -> f32 {
        1.0 / (self.head_dim as f32).sqrt()
    }

    fn kv_head(&self, q_head: usize) -> usize {
        q_head * self.kv_heads / self.q_heads
    }
}

/// Exact f32 attention over f16-quantized inputs. This is the baseline the
/// chunked algorithm is measured against.
pub fn reference_attention(q: &[f16], k: &[f16], v: &[f16], shape: AttnShape) -> Vec<f32> {
    let d = shape.head_dim;
    let scale = shape.scale();
    let mut out = vec![0f32; shape.batch * shape.q_heads * d];

    for b in 0..shape.batch {
        for h in 0..shape.q_heads {
            let kv = shape.kv_head(h);
            let q_row = &q[(b * shape.q_heads + h) * d..][..d];

            let mut scores = vec![0f32; shape.seq_len];
            let mut max_score = f32::NEG_INFINITY;
            for (j, score) in scores.iter_mut().enumerate() {
                let k_row = &k[(j * shape.kv_heads + kv) * d..][..d];
                let mut dot = 0f32;
                for i in 0..d {
                    dot += q_row[i].to_f32() * k_row[i].to_f32();
                }
                *score = dot * scale;
                max_score = max_score.max(*score);
            }

            let mut denom = 0f32;
            for score in scores.iter_mut() {
                *score = (*score - max_score).exp();
                denom += *score;
            }

            let out_row = &mut out[(b * shape.q_heads + h) * d..][..d];
            for (j, &w) in scores.iter().enumerate() {
                let v_row = &v[(j * shape.kv_heads + kv) * d..][..d];
                for i in 0..d {
                    out_row[i] += w * v_row[i].to_f32();
                }
            }
            if denom > 0.0 {
                for o in out_row.iter_mut() {
                    *o /= denom;
                }
            }
        }
    }
    out
}

/// Chunked online-softmax attention, mirroring the device kernels.
pub fn chunked_attention(
    q: &[f16],
    k: &[f16],
    v: &[f16],
    shape: AttnShape,
    chunk_size: usize,
) -> ChunkedRun {
    assert!(chunk_size > 0, "chunk_size must be >= 1");
    let d = shape.head_dim;
    let scale = shape.scale();
    let rows = shape.batch * shape.q_heads;

    let mut m_state = vec![f32::NEG_INFINITY; rows];
    let mut l_state = vec![0f32; rows];
    let mut o_state = vec![0f32; rows * d];
    let mut chunks = 0usize;

    let mut start = 0usize;
    while start < shape.seq_len {
        let len = chunk_size.min(shape.seq_len - start);
        let is_first = start == 0;
        chunks += 1;

        for b in 0..shape.batch {
            for h in 0..shape.q_heads {
                let row = b * shape.q_heads + h;
                let kv = shape.kv_head(h);
                let q_row = &q[row * d..][..d];

                let mut scores = vec![0f32; len];
                let mut m_chunk = f32::NEG_INFINITY;
                for (jj, score) in scores.iter_mut().enumerate() {
                    let j = start + jj;
                    let k_row = &k[(j * shape.kv_heads + kv) * d..][..d];
                    let mut dot = 0f32;
                    for i in 0..d {
                        dot += q_row[i].to_f32() * k_row[i].to_f32();
                    }
                    *score = dot * scale;
                    m_chunk = m_chunk.max(*score);
                }

                let m_old = if is_first { f32::NEG_INFINITY } else { m_state[row] };
                let l_old = if is_first { 0.0 } else { l_state[row] };
                let m_new = m_old.max(m_chunk);
                let corr = if is_first { 0.0 } else { (m_old - m_new).exp() };

                let mut l_chunk = 0f32;
                for score in scores.iter_mut() {
                    *score = (*score - m_new).exp();
                    l_chunk += *score;
                }

                let o_row = &mut o_state[row * d..][..d];
                for i in 0..d {
                    let mut acc = if is_first { 0.0 } else { o_row[i] * corr };
                    for (jj, &w) in scores.iter().enumerate() {
                        let j = start + jj;
                        let v_row = &v[(j * shape.kv_heads + kv) * d..][..d];
                        acc += w * v_row[i].to_f32();
                    }
                    o_row[i] = acc;
                }

                m_state[row] = m_new;
                l_state[row] = if is_first { l_chunk } else { l_old * corr + l_chunk };
            }
        }
        start += len;
    }

    let mut output = vec![f16::ZERO; rows * d];
    for row in 0..rows {
        let inv = if l_state[row] > 0.0 { 1.0 / l_state[row] } else { 0.0 };
        for i in 0..d {
            output[row * d + i] = f16::from_f32(o_state[row * d + i] * inv);
        }
    }

    ChunkedRun {
        output,
        chunks,
        normalizes: 1,
    }
}

/// Mean and max relative error of `got` against `want`. The denominator is
/// floored so near-zero reference elements do not dominate the ratio.
pub fn relative_error_stats(got: &[f16], want: &[f32]) -> (f64, f64) {
    assert_eq!(got.len(), want.len());
    const FLOOR: f64 = 1e-3;

    let mut sum = 0f64;
    let mut max = 0f64;
    for (a, b) in got.iter().zip(want.iter()) {
        let a = a.to_f32() as f64;
        let b = *b as f64;
        let rel = (a - b).abs() / b.abs().max(FLOOR);
        sum += rel;
        max = max.max(rel);
    }
    (sum / got.len() as f64, max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::StandardNormal;

    const MEAN_TOL: f64 = 0.005;
    const MAX_TOL: f64 = 0.05;

    fn gaussian(rng: &mut StdRng, n: usize, scale: f32) -> Vec<f16> {
        (0..n)
            .map(|_| {
                let x: f32 = rng.sample(StandardNormal);
                f16::from_f32(x * scale)
            })
            .collect()
    }

    fn run_case(shape: AttnShape, chunk_size: usize, seed: u64) -> (ChunkedRun, Vec<f32>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let q = gaussian(&mut rng, shape.batch * shape.q_heads * shape.head_dim, 0.1);
        let k = gaussian(&mut rng, shape.seq_len * shape.kv_heads * shape.head_dim, 0.1);
        let v = gaussian(&mut rng, shape.seq_len * shape.kv_heads * shape.head_dim, 0.1);

        let run = chunked_attention(&q, &k, &v, shape, chunk_size);
        let want = reference_attention(&q, &k, &v, shape);
        (run, want)
    }

    fn assert_tolerance(run: &ChunkedRun, want: &[f32]) {
        let (mean, max) = relative_error_stats(&run.output, want);
        assert!(mean < MEAN_TOL, "mean rel err {mean} >= {MEAN_TOL}");
        assert!(max < MAX_TOL, "max rel err {max} >= {MAX_TOL}");
    }

    #[test]
    fn single_chunk_matches_reference() {
        let shape = AttnShape {
            batch: 1,
            q_heads: 1,
            kv_heads: 1,
            head_dim: 128,
            seq_len: 64,
        };
        let (run, want) = run_case(shape, 64, 1);
        assert_eq!(run.chunks, 1);
        assert_eq!(run.normalizes, 1);
        assert_tolerance(&run, &want);
    }

    #[test]
    fn multi_chunk_partial_tail() {
        let shape = AttnShape {
            batch: 1,
            q_heads: 2,
            kv_heads: 2,
            head_dim: 128,
            seq_len: 300,
        };
        // 300 positions at chunk 128: two full chunks plus a 44-position tail.
        let (run, want) = run_case(shape, 128, 2);
        assert_eq!(run.chunks, 3);
        assert_eq!(run.normalizes, 1);
        assert_tolerance(&run, &want);
    }

    #[test]
    fn grouped_query_attention() {
        let shape = AttnShape {
            batch: 1,
            q_heads: 40,
            kv_heads: 8,
            head_dim: 128,
            seq_len: 512,
        };
        assert_eq!(shape.kv_head(0), 0);
        assert_eq!(shape.kv_head(4), 0);
        assert_eq!(shape.kv_head(5), 1);
        assert_eq!(shape.kv_head(39), 7);

        let (run, want) = run_case(shape, 256, 3);
        assert_eq!(run.chunks, 2);
        assert_tolerance(&run, &want);
    }

    #[test]
    fn chunk_size_invariance() {
        let shape = AttnShape {
            batch: 2,
            q_heads: 4,
            kv_heads: 2,
            head_dim: 64,
            seq_len: 320,
        };
        let mut rng = StdRng::seed_from_u64(4);
        let q = gaussian(&mut rng, shape.batch * shape.q_heads * shape.head_dim, 0.1);
        let k = gaussian(&mut rng, shape.seq_len * shape.kv_heads * shape.head_dim, 0.1);
        let v = gaussian(&mut rng, shape.seq_len * shape.kv_heads * shape.head_dim, 0.1);
        let want = reference_attention(&q, &k, &v, shape);

        for chunk in [128, 64, shape.seq_len] {
            let run = chunked_attention(&q, &k, &v, shape, chunk);
            assert_tolerance(&run, &want);
        }

        // Different chunkings agree with each other to the same tolerance.
        let a = chunked_attention(&q, &k, &v, shape, 128).output;
        let b = chunked_attention(&q, &k, &v, shape, shape.seq_len).output;
        let b_f32: Vec<f32> = b.iter().map(|x| x.to_f32()).collect();
        let (mean, max) = relative_error_stats(&a, &b_f32);
        assert!(mean < MEAN_TOL && max < MAX_TOL, "chunkings diverge: {mean} / {max}");
    }

    #[test]
    fn empty_sequence_yields_zero() {
        let shape = AttnShape {
            batch: 1,
            q_heads: 2,
            kv_heads: 1,
            head_dim: 64,
            seq_len: 0,
        };
        let q = vec![f16::from_f32(0.5); shape.batch * shape.q_heads * shape.head_dim];
        let run = chunked_attention(&q, &[], &[], shape, 16);
        assert_eq!(run.chunks, 0);
        assert!(run.output.iter().all(|x| x.to_f32() == 0.0));
    }

    #[test]
    fn larger_scale_inputs_stay_within_tolerance() {
        // Bigger logit spread exercises the correction path harder.
        let shape = AttnShape {
            batch: 1,
            q_heads: 4,
            kv_heads: 4,
            head_dim: 96,
            seq_len: 200,
        };
        let mut rng = StdRng::seed_from_u64(5);
        let q = gaussian(&mut rng, shape.batch * shape.q_heads * shape.head_dim, 0.5);
        let k = gaussian(&mut rng, shape.seq_len * shape.kv_heads * shape.head_dim, 0.5);
        let v = gaussian(&mut rng, shape.seq_len * shape.kv_heads * shape.head_dim, 0.5);

        let run = chunked_attention(&q, &k, &v, shape, 48);
        let want = reference_attention(&q, &k, &v, shape);
        assert_tolerance(&run, &want);
    }
}
