//! C5: MBCn copula/multivariate-rank adjuster via iterated random rotations.
//! Grounded in `utility_functions.py`'s `adjust_copula_mbcn`.

use crate::model::TrendPreservation;
use crate::qm::map_quantiles_non_parametric_trend_preserving;
use crate::error::Diagnostics;
use ndarray::Array2;
use statrs::distribution::{ContinuousCDF, Normal};

/// Zero-indexed ranks of `x` under ascending order, ties broken by original
/// position (stable; matches `np.argsort(np.argsort(x))` for distinct
/// values, which is what every call site here has after randomization).
fn rank_order(x: &[f64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..x.len()).collect();
    order.sort_by(|&a, &b| x[a].partial_cmp(&x[b]).unwrap().then(a.cmp(&b)));
    let mut rank = vec![0usize; x.len()];
    for (r, &i) in order.iter().enumerate() {
        rank[i] = r;
    }
    rank
}

/// Maps `x` to a standard-normal rank space: `Phi^-1((rank + 0.5) / n)`.
fn to_standard_normal_ranks(x: &[f64]) -> Vec<f64> {
    let n = x.len();
    let normal = Normal::new(0.0, 1.0).unwrap();
    rank_order(x)
        .into_iter()
        .map(|r| normal.inverse_cdf((r as f64 + 0.5) / n as f64))
        .collect()
}

fn rotate_rows(rows: &mut [Vec<f64>], o: &Array2<f64>) {
    let n = rows.len();
    let m = rows[0].len();
    let mat = Array2::from_shape_fn((n, m), |(i, j)| rows[i][j]);
    let rotated = o.dot(&mat);
    for i in 0..n {
        for j in 0..m {
            rows[i][j] = rotated[[i, j]];
        }
    }
}

/// Applies the MBCn algorithm (spec §4.5) to adjust the multivariate rank
/// distribution of `sim_fut`, returning the adjusted future series (one per
/// variable, in the original value domain).
pub fn adjust_copula_mbcn(
    obs_hist: &[Vec<f64>],
    sim_hist: &[Vec<f64>],
    sim_fut: &[Vec<f64>],
    rotation_matrices: &[Array2<f64>],
    n_quantiles: usize,
    location: &str,
    diagnostics: &mut Diagnostics,
) -> Vec<Vec<f64>> {
    let n_variables = sim_fut.len();
    assert_eq!(obs_hist.len(), n_variables);
    assert_eq!(sim_hist.len(), n_variables);

    let mut y_obs_hist: Vec<Vec<f64>> = obs_hist.iter().map(|x| to_standard_normal_ranks(x)).collect();
    let mut y_sim_hist: Vec<Vec<f64>> = sim_hist.iter().map(|x| to_standard_normal_ranks(x)).collect();
    let mut y_sim_fut: Vec<Vec<f64>> = sim_fut.iter().map(|x| to_standard_normal_ranks(x)).collect();

    let mut o_total = Array2::eye(n_variables);
    for o in rotation_matrices {
        o_total = o.dot(&o_total);
        rotate_rows(&mut y_obs_hist, o);
        rotate_rows(&mut y_sim_hist, o);
        rotate_rows(&mut y_sim_fut, o);

        for i in 0..n_variables {
            let y_sim_hist_old = y_sim_hist[i].clone();
            y_sim_hist[i] = map_quantiles_non_parametric_trend_preserving(
                &y_obs_hist[i],
                &y_sim_hist_old,
                &y_sim_hist_old,
                TrendPreservation::Additive,
                n_quantiles,
                100.0,
                9.0,
                false,
                None,
                None,
                location,
                diagnostics,
            );
            y_sim_fut[i] = map_quantiles_non_parametric_trend_preserving(
                &y_obs_hist[i],
                &y_sim_hist_old,
                &y_sim_fut[i],
                TrendPreservation::Additive,
                n_quantiles,
                100.0,
                9.0,
                false,
                None,
                None,
                location,
                diagnostics,
            );
        }
    }

    // rotate back to original axes
    let o_total_t = o_total.t().to_owned();
    rotate_rows(&mut y_sim_fut, &o_total_t);

    // shuffle each original x_sim_fut so its ranks equal the ranks of the
    // copula-adjusted standard-normal space
    (0..n_variables)
        .map(|i| {
            let mut sorted = sim_fut[i].clone();
            sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
            rank_order(&y_sim_fut[i]).into_iter().map(|r| sorted[r]).collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::numerics::cre_matrix;
    use rand::SeedableRng;

    #[test]
    fn preserves_length_and_finiteness() {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(3);
        let obs_hist = vec![vec![1.0, 2.0, 3.0, 4.0, 5.0], vec![5.0, 3.0, 1.0, 4.0, 2.0]];
        let sim_hist = vec![vec![2.0, 1.0, 3.0, 5.0, 4.0], vec![1.0, 2.0, 3.0, 4.0, 5.0]];
        let sim_fut = vec![vec![3.0, 2.0, 4.0, 6.0, 5.0], vec![2.0, 3.0, 4.0, 5.0, 6.0]];
        let rotations = vec![cre_matrix(2, &mut rng), cre_matrix(2, &mut rng)];
        let mut diag = Diagnostics::new(false);
        let out = adjust_copula_mbcn(&obs_hist, &sim_hist, &sim_fut, &rotations, 50, "cell", &mut diag);
        assert_eq!(out.len(), 2);
        for series in &out {
            assert_eq!(series.len(), 5);
            assert!(series.iter().all(|v| v.is_finite()));
        }
    }

    #[test]
    fn no_rotations_leaves_ranks_unchanged_in_value_domain() {
        let obs_hist = vec![vec![1.0, 2.0, 3.0]];
        let sim_hist = vec![vec![1.0, 2.0, 3.0]];
        let sim_fut = vec![vec![3.0, 1.0, 2.0]];
        let mut diag = Diagnostics::new(false);
        let out = adjust_copula_mbcn(&obs_hist, &sim_hist, &sim_fut, &[], 50, "cell", &mut diag);
        let mut sorted_fut = sim_fut[0].clone();
        sorted_fut.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(out[0], sorted_fut);
    }
}
