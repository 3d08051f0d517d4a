use super::softmax_in_place;
use crate::error::{Result, TensorError};

/// Reference scaled dot-product attention over flat head-major buffers.
///
/// See [`crate::ComputeBackend::attention`] for the layout contract.
#[allow(clippy::too_many_arguments)]
pub fn scaled_dot_product(
    q: &[f32],
    k: &[f32],
    v: &[f32],
    mask: &[f32],
    n_heads: usize,
    q_len: usize,
    kv_len: usize,
    head_dim: usize,
) -> Result<Vec<f32>> {
    check_len("q", q.len(), n_heads * q_len * head_dim)?;
    check_len("k", k.len(), n_heads * kv_len * head_dim)?;
    check_len("v", v.len(), n_heads * kv_len * head_dim)?;
    check_len("mask", mask.len(), q_len * kv_len)?;

    let scale = 1.0 / (head_dim as f32).sqrt();
    let mut out = vec![0.0f32; n_heads * q_len * head_dim];
    let mut scores = vec![0.0f32; kv_len];

    for h in 0..n_heads {
        let k_head = &k[h * kv_len * head_dim..(h + 1) * kv_len * head_dim];
        let v_head = &v[h * kv_len * head_dim..(h + 1) * kv_len * head_dim];

        for i in 0..q_len {
            let q_off = (h * q_len + i) * head_dim;
            let q_row = &q[q_off..q_off + head_dim];
            let mask_row = &mask[i * kv_len..(i + 1) * kv_len];

            for (j, score) in scores.iter_mut().enumerate() {
                let k_row = &k_head[j * head_dim..(j + 1) * head_dim];
                let dot: f32 = q_row.iter().zip(k_row).map(|(a, b)| a * b).sum();
                *score = dot * scale + mask_row[j];
            }

            softmax_in_place(&mut scores);

            let out_row = &mut out[q_off..q_off + head_dim];
            for (j, &weight) in scores.iter().enumerate() {
                if weight == 0.0 {
                    continue;
                }
                let v_row = &v_head[j * head_dim..(j + 1) * head_dim];
                for (o, &x) in out_row.iter_mut().zip(v_row) {
                    *o += weight * x;
                }
            }
        }
    }

    Ok(out)
}

fn check_len(name: &str, got: usize, expected: usize) -> Result<()> {
    if got != expected {
        return Err(TensorError::Other(format!(
            "attention: {}.len()={} but expected {}",
            name, got, expected
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_single_key_returns_value() {
        let out = scaled_dot_product(&[1.0, 0.0], &[0.5, 0.5], &[3.0, 4.0], &[0.0], 1, 1, 1, 2)
            .unwrap();
        assert_eq!(out, vec![3.0, 4.0]);
    }

    #[test]
    fn test_masked_key_is_ignored() {
        // two keys, second masked out: output equals the first value
        let q = [1.0, 1.0];
        let k = [1.0, 0.0, 0.0, 1.0];
        let v = [1.0, 2.0, 100.0, 200.0];
        let mask = [0.0, f32::NEG_INFINITY];
        let out = scaled_dot_product(&q, &k, &v, &mask, 1, 1, 2, 2).unwrap();
        assert_relative_eq!(out[0], 1.0);
        assert_relative_eq!(out[1], 2.0);
    }

    #[test]
    fn test_equal_scores_average_values() {
        let q = [0.0, 0.0];
        let k = [1.0, 2.0, 3.0, 4.0];
        let v = [2.0, 0.0, 4.0, 2.0];
        let out = scaled_dot_product(&q, &k, &v, &[0.0, 0.0], 1, 1, 2, 2).unwrap();
        assert_relative_eq!(out[0], 3.0, epsilon = 1e-6);
        assert_relative_eq!(out[1], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_fully_masked_row_is_zero() {
        let mask = [f32::NEG_INFINITY, f32::NEG_INFINITY];
        let out =
            scaled_dot_product(&[1.0], &[1.0, 1.0], &[5.0, 5.0], &mask, 1, 1, 2, 1).unwrap();
        assert_eq!(out, vec![0.0]);
    }

    #[test]
    fn test_length_check() {
        assert!(scaled_dot_product(&[1.0], &[1.0], &[1.0], &[], 1, 1, 1, 1).is_err());
    }
}
