//! C2: randomization of censored (beyond-threshold) values and replacement
//! of invalid (missing/inf/nan) values by sampling from the valid part of
//! the same series. Grounded in `utility_functions.py`'s
//! `randomize_censored_values_core` and `sample_invalid_values_core`.

use crate::error::{Diagnostics, Error, Result};
use crate::numerics::percentile1d;
use rand::Rng;

/// Randomizes (or, in `inverse` mode, de-randomizes) values at or beyond a
/// bound/threshold pair in-place. `lower` selects whether `y <= threshold`
/// (lower bound side) or `y >= threshold` (upper bound side) is censored.
/// Ranks among the censored values are preserved using a random tie
/// breaker, matching the source's `rank(method='first')` over a shuffled
/// copy.
fn randomize_censored_core(
    y: &mut [f64],
    bound: f64,
    threshold: f64,
    inverse: bool,
    power: f64,
    lower: bool,
    rng: &mut impl Rng,
) {
    let idx: Vec<usize> = (0..y.len())
        .filter(|&i| if lower { y[i] <= threshold } else { y[i] >= threshold })
        .collect();
    if idx.is_empty() {
        return;
    }
    if inverse {
        for &i in &idx {
            y[i] = bound;
        }
        return;
    }
    let n = idx.len();
    let mut v: Vec<f64> = (0..n)
        .map(|_| bound + rng.gen::<f64>().powf(power) * (threshold - bound))
        .collect();
    v.sort_by(|a, b| a.partial_cmp(b).unwrap());

    let mut shuffle_order: Vec<usize> = (0..n).collect();
    {
        use rand::seq::SliceRandom;
        shuffle_order.shuffle(rng);
    }
    let mut priority = vec![0usize; n];
    for (order_pos, &i) in shuffle_order.iter().enumerate() {
        priority[i] = order_pos;
    }
    let values: Vec<f64> = idx.iter().map(|&i| y[i]).collect();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| {
        values[a]
            .partial_cmp(&values[b])
            .unwrap()
            .then(priority[a].cmp(&priority[b]))
    });
    let mut rank = vec![0usize; n];
    for (r, &i) in order.iter().enumerate() {
        rank[i] = r;
    }
    for (k, &i) in idx.iter().enumerate() {
        y[i] = v[rank[k]];
    }
}

/// Input parameters for [`randomize_censored`], mirroring
/// `randomize_censored_values`'s optional bound/threshold/power arguments.
#[derive(Debug, Clone, Default)]
pub struct CensorBounds {
    pub lower_bound: Option<f64>,
    pub lower_threshold: Option<f64>,
    pub upper_bound: Option<f64>,
    pub upper_threshold: Option<f64>,
    pub lower_power: f64,
    pub upper_power: f64,
}

/// Randomizes (`inverse = false`) or collapses back to the bound
/// (`inverse = true`) values beyond `bounds`' thresholds in `x`, returning a
/// new vector.
pub fn randomize_censored(
    x: &[f64],
    bounds: &CensorBounds,
    inverse: bool,
    rng: &mut impl Rng,
) -> Vec<f64> {
    let mut y = x.to_vec();
    if let (Some(b), Some(t)) = (bounds.lower_bound, bounds.lower_threshold) {
        randomize_censored_core(&mut y, b, t, inverse, bounds.lower_power, true, rng);
    }
    if let (Some(b), Some(t)) = (bounds.upper_bound, bounds.upper_threshold) {
        randomize_censored_core(&mut y, b, t, inverse, bounds.upper_power, false, rng);
    }
    y
}

/// Average of the valid entries in `values`, with beyond-threshold values
/// first collapsed to their bound (`average_respecting_bounds` /
/// `average_valid_values`), used as the invalid-value fallback mean and as
/// the long-term mean fed into `sample_invalid`.
pub fn average_valid_values(
    values: &[f64],
    invalid: &[bool],
    if_all_invalid_use: f64,
    lower_bound: Option<f64>,
    lower_threshold: Option<f64>,
    upper_bound: Option<f64>,
    upper_threshold: Option<f64>,
) -> f64 {
    let valid: Vec<f64> = values.iter().zip(invalid).filter(|(_, &inv)| !inv).map(|(&v, _)| v).collect();
    if valid.is_empty() {
        return if_all_invalid_use;
    }
    let adjusted: Vec<f64> = valid
        .iter()
        .map(|&v| {
            if let (Some(lb), Some(lt)) = (lower_bound, lower_threshold) {
                if v <= lt {
                    return lb;
                }
            }
            if let (Some(ub), Some(ut)) = (upper_bound, upper_threshold) {
                if v >= ut {
                    return ub;
                }
            }
            v
        })
        .collect();
    adjusted.iter().sum::<f64>() / adjusted.len() as f64
}

/// Zero-indexed rank of each element under ascending order, ties broken by
/// original position (stable).
fn rank_ascending(values: &[f64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].partial_cmp(&values[b]).unwrap().then(a.cmp(&b)));
    let mut rank = vec![0usize; values.len()];
    for (r, &i) in order.iter().enumerate() {
        rank[i] = r;
    }
    rank
}

/// Linear interpolation with linear (not constant) extrapolation beyond the
/// endpoints, matching `scipy.interpolate.interp1d(..., fill_value='extrapolate')`.
fn linear_interp_extrapolate(xs: &[f64], ys: &[f64], x: f64) -> f64 {
    let n = xs.len();
    if n == 1 {
        return ys[0];
    }
    let (i0, i1) = if x <= xs[0] {
        (0, 1)
    } else if x >= xs[n - 1] {
        (n - 2, n - 1)
    } else {
        let mut j = 0;
        while j + 1 < n && xs[j + 1] < x {
            j += 1;
        }
        (j, j + 1)
    };
    let t = (x - xs[i0]) / (xs[i1] - xs[i0]);
    ys[i0] + t * (ys[i1] - ys[i0])
}

/// Replaces invalid entries (flagged by `invalid`) in `d` by sampling from
/// its valid entries, preserving the approximate trend of the valid part by
/// reshuffling sampled values into rank order interpolated from neighboring
/// valid positions. Returns an error only when there are no valid values at
/// all and `if_all_invalid_use` is NaN (matching the source's hard
/// `ValueError`); callers should treat that as a skip-this-cell condition,
/// not abort the run.
pub fn sample_invalid(
    d: &[f64],
    invalid: &[bool],
    if_all_invalid_use: f64,
    rng: &mut impl Rng,
    location: &str,
    diagnostics: &mut Diagnostics,
) -> Result<Vec<f64>> {
    assert_eq!(d.len(), invalid.len());
    let n_invalid = invalid.iter().filter(|&&b| b).count();
    if n_invalid == 0 {
        return Ok(d.to_vec());
    }
    let n = d.len();
    let n_valid = n - n_invalid;
    let mut out = d.to_vec();
    if n_valid == 0 {
        if if_all_invalid_use.is_nan() {
            return Err(Error::Data(format!(
                "{location}: found no valid value(s) and if_all_invalid_use is NaN"
            )));
        }
        diagnostics.warn(
            location,
            format!("found no valid value(s): setting them all to {if_all_invalid_use}"),
        );
        out.iter_mut().for_each(|v| *v = if_all_invalid_use);
        return Ok(out);
    }

    diagnostics.warn(
        location,
        format!("replacing {n_invalid} invalid value(s) by sampling from {n_valid} valid value(s)"),
    );

    let i_valid: Vec<usize> = (0..n).filter(|&i| !invalid[i]).collect();
    let d_valid: Vec<f64> = i_valid.iter().map(|&i| d[i]).collect();
    let p_sampled: Vec<f64> = (0..n_invalid).map(|_| rng.gen::<f64>()).collect();
    let d_sampled = percentile1d(&d_valid, &p_sampled);

    let i_invalid: Vec<usize> = (0..n).filter(|&i| invalid[i]).collect();
    if n_valid == 1 {
        for (k, &i) in i_invalid.iter().enumerate() {
            out[i] = d_sampled[k];
        }
        return Ok(out);
    }

    let r_valid: Vec<f64> = rank_ascending(&d_valid).into_iter().map(|r| r as f64).collect();
    let i_valid_f: Vec<f64> = i_valid.iter().map(|&i| i as f64).collect();
    let interpolated_rank: Vec<f64> = i_invalid
        .iter()
        .map(|&i| linear_interp_extrapolate(&i_valid_f, &r_valid, i as f64))
        .collect();
    let r_sampled = rank_ascending(&interpolated_rank);

    let mut sorted_sampled = d_sampled.clone();
    sorted_sampled.sort_by(|a, b| a.partial_cmp(b).unwrap());
    for (k, &i) in i_invalid.iter().enumerate() {
        out[i] = sorted_sampled[r_sampled[k]];
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn randomize_censored_replaces_only_beyond_threshold() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let x = vec![-1.0, 0.0, 0.5, 1.0, 2.0];
        let bounds = CensorBounds {
            lower_bound: Some(-1.0),
            lower_threshold: Some(0.0),
            lower_power: 1.0,
            ..Default::default()
        };
        let y = randomize_censored(&x, &bounds, false, &mut rng);
        assert_eq!(y[2], 0.5);
        assert_eq!(y[3], 1.0);
        assert_eq!(y[4], 2.0);
        for &v in &y[..2] {
            assert!(v >= -1.0 && v <= 0.0);
        }
    }

    #[test]
    fn randomize_censored_inverse_collapses_to_bound() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let x = vec![-0.3, 5.0];
        let bounds = CensorBounds {
            lower_bound: Some(-1.0),
            lower_threshold: Some(0.0),
            lower_power: 1.0,
            ..Default::default()
        };
        let y = randomize_censored(&x, &bounds, true, &mut rng);
        assert_eq!(y[0], -1.0);
        assert_eq!(y[1], 5.0);
    }

    #[test]
    fn sample_invalid_fills_from_valid_neighbors() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let d = vec![1.0, f64::NAN, 3.0, 4.0, f64::NAN];
        let invalid: Vec<bool> = d.iter().map(|v| v.is_nan()).collect();
        let mut diag = Diagnostics::new(false);
        let out = sample_invalid(&d, &invalid, f64::NAN, &mut rng, "cell", &mut diag).unwrap();
        assert_eq!(out[0], 1.0);
        assert_eq!(out[2], 3.0);
        assert_eq!(out[3], 4.0);
        assert!(out[1].is_finite());
        assert!(out[4].is_finite());
        assert!(!diag.is_empty());
    }

    #[test]
    fn sample_invalid_errors_when_all_invalid_and_fallback_is_nan() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let d = vec![f64::NAN, f64::NAN];
        let invalid = vec![true, true];
        let mut diag = Diagnostics::new(false);
        let err = sample_invalid(&d, &invalid, f64::NAN, &mut rng, "cell", &mut diag).unwrap_err();
        assert!(matches!(err, Error::Data(_)));
    }

    #[test]
    fn sample_invalid_uses_fallback_value_when_all_invalid() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let d = vec![f64::NAN, f64::NAN];
        let invalid = vec![true, true];
        let mut diag = Diagnostics::new(false);
        let out = sample_invalid(&d, &invalid, 0.0, &mut rng, "cell", &mut diag).unwrap();
        assert_eq!(out, vec![0.0, 0.0]);
    }
}
