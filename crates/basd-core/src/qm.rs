//! C4: univariate trend-preserving quantile mapping, parametric and
//! non-parametric. Grounded in `utility_functions.py`'s
//! `map_quantiles_non_parametric_trend_preserving`,
//! `map_quantiles_non_parametric_with_constant_extrapolation`,
//! `map_quantiles_non_parametric_brute_force` and `bias_adjustment.py`'s
//! `map_quantiles_parametric_trend_preserving`.

use crate::error::Diagnostics;
use crate::model::{TrendPreservation, VariableSpec};
use crate::numerics::{ccs_transfer_sim2obs_array, interp1d, percentile1d, transfer_odds_ratio, Distribution};

/// Non-parametric trend-preserving quantile delta mapping (spec §4.4a).
///
/// If `adjust_obs`, returns the mapped `x_obs_hist` (used to build the
/// unconditional CCS-transfer target); otherwise returns the mapped
/// `x_sim_fut`.
#[allow(clippy::too_many_arguments)]
pub fn map_quantiles_non_parametric_trend_preserving(
    x_obs_hist: &[f64],
    x_sim_hist: &[f64],
    x_sim_fut: &[f64],
    trend_preservation: TrendPreservation,
    n_quantiles: usize,
    max_change_factor: f64,
    max_adjustment_factor: f64,
    adjust_obs: bool,
    lower_bound: Option<f64>,
    upper_bound: Option<f64>,
    location: &str,
    diagnostics: &mut Diagnostics,
) -> Vec<f64> {
    let n = [n_quantiles + 1, x_obs_hist.len(), x_sim_hist.len(), x_sim_fut.len()]
        .into_iter()
        .min()
        .unwrap();
    if n < 2 {
        diagnostics.warn(
            location,
            format!(
                "not enough input data: returning {}",
                if adjust_obs { "x_obs_hist" } else { "x_sim_fut" }
            ),
        );
        return if adjust_obs { x_obs_hist.to_vec() } else { x_sim_fut.to_vec() };
    }
    if n < n_quantiles + 1 {
        diagnostics.warn(location, format!("due to little input data: reducing n_quantiles to {}", n - 1));
    }
    let p: Vec<f64> = (0..n).map(|i| i as f64 / (n - 1) as f64).collect();

    let q_obs_hist = percentile1d(x_obs_hist, &p);
    let q_sim_hist = percentile1d(x_sim_hist, &p);
    let q_sim_fut = percentile1d(x_sim_fut, &p);

    let source = if adjust_obs { x_obs_hist } else { x_sim_fut };
    let q_source = if adjust_obs { &q_obs_hist } else { &q_sim_fut };
    let mapped_p: Vec<f64> = source.iter().map(|&x| interp1d(x, q_source, &p)).collect();

    let f_sim_fut_inv: Vec<f64> = mapped_p.iter().map(|&pi| interp1d(pi, &p, &q_sim_fut)).collect();
    let f_sim_hist_inv: Vec<f64> = mapped_p.iter().map(|&pi| interp1d(pi, &p, &q_sim_hist)).collect();
    let f_obs_hist_inv: Vec<f64> = mapped_p.iter().map(|&pi| interp1d(pi, &p, &q_obs_hist)).collect();

    match trend_preservation {
        TrendPreservation::Bounded => {
            let lo = lower_bound.expect("bounded trend preservation requires lower_bound");
            let hi = upper_bound.expect("bounded trend preservation requires upper_bound");
            ccs_transfer_sim2obs_array(&f_obs_hist_inv, &f_sim_hist_inv, &f_sim_fut_inv, lo, hi)
        }
        TrendPreservation::Multiplicative | TrendPreservation::Mixed => {
            let y_mult: Vec<f64> = f_sim_fut_inv
                .iter()
                .zip(&f_sim_hist_inv)
                .zip(&f_obs_hist_inv)
                .map(|((&sf, &sh), &oh)| {
                    let factor = if sh == 0.0 { 1.0 } else { sf / sh };
                    factor.clamp(1.0 / max_change_factor, max_change_factor) * oh
                })
                .collect();
            if trend_preservation == TrendPreservation::Multiplicative {
                return y_mult;
            }
            f_obs_hist_inv
                .iter()
                .zip(&f_sim_hist_inv)
                .zip(&f_sim_fut_inv)
                .zip(&y_mult)
                .map(|(((&oh, &sh), &sf), &ym)| {
                    let y_add = oh + sf - sh;
                    let fraction_mult = if sh >= oh {
                        1.0
                    } else if oh < max_adjustment_factor * sh {
                        0.5 * (1.0 + ((oh / sh - 1.0) * std::f64::consts::PI / (max_adjustment_factor - 1.0)).cos())
                    } else {
                        0.0
                    };
                    fraction_mult * ym + (1.0 - fraction_mult) * y_add
                })
                .collect()
        }
        TrendPreservation::Additive => f_obs_hist_inv
            .iter()
            .zip(&f_sim_fut_inv)
            .zip(&f_sim_hist_inv)
            .map(|((&oh, &sf), &sh)| oh + sf - sh)
            .collect(),
    }
}

/// Quantile maps `x` via quantile-quantile pairs `(q_sim, q_obs)`, extending
/// linearly beyond the pair range rather than clamping to the boundary
/// value (Boe et al. 2007's constant-extrapolation approach).
pub fn map_quantiles_non_parametric_with_constant_extrapolation(x: &[f64], q_sim: &[f64], q_obs: &[f64]) -> Vec<f64> {
    assert_eq!(q_sim.len(), q_obs.len());
    let lo_offset = q_obs[0] - q_sim[0];
    let hi_offset = q_obs[q_obs.len() - 1] - q_sim[q_sim.len() - 1];
    x.iter()
        .map(|&xi| {
            if xi < q_sim[0] {
                xi + lo_offset
            } else if xi > q_sim[q_sim.len() - 1] {
                xi + hi_offset
            } else {
                interp1d(xi, q_sim, q_obs)
            }
        })
        .collect()
}

/// Zero-indexed, average-tie-broken ranks of `x` (`scipy.stats.rankdata`
/// with the default `'average'` method), scaled to `[0, 1)` percent points.
fn percent_points(x: &[f64]) -> Vec<f64> {
    let n = x.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| x[a].partial_cmp(&x[b]).unwrap());
    let mut rank = vec![0.0; n];
    let mut i = 0;
    while i < n {
        let mut j = i;
        while j + 1 < n && x[order[j + 1]] == x[order[i]] {
            j += 1;
        }
        let avg_rank = (i + j) as f64 / 2.0;
        for &k in &order[i..=j] {
            rank[k] = avg_rank;
        }
        i = j + 1;
    }
    rank.into_iter().map(|r| r / n as f64).collect()
}

/// Quantile-maps `x` to `y` using their empirical CDFs directly, without a
/// fixed quantile grid (used to exclude extrapolation before parametric
/// fitting when bounds are present).
pub fn map_quantiles_non_parametric_brute_force(x: &[f64], y: &[f64]) -> Vec<f64> {
    if x.is_empty() {
        return Vec::new();
    }
    let mut unique_y = y.to_vec();
    unique_y.sort_by(|a, b| a.partial_cmp(b).unwrap());
    unique_y.dedup_by(|a, b| a == b);
    if unique_y.len() < 2 {
        return x.to_vec();
    }
    let p_x = percent_points(x);
    let n_y = y.len();
    let p_y: Vec<f64> = (0..n_y).map(|i| i as f64 / (n_y - 1).max(1) as f64).collect();
    let mut sorted_y = y.to_vec();
    sorted_y.sort_by(|a, b| a.partial_cmp(b).unwrap());
    p_x.iter().map(|&px| interp1d(px, &p_y, &sorted_y)).collect()
}

/// Indices where `x` is within the open interval bounded by the
/// lower/upper thresholds (when set).
fn within_thresholds(x: &[f64], spec: &VariableSpec) -> Vec<bool> {
    x.iter()
        .map(|&v| {
            let lower_ok = spec.lower_threshold.map_or(true, |lt| v > lt);
            let upper_ok = spec.upper_threshold.map_or(true, |ut| v < ut);
            lower_ok && upper_ok
        })
        .collect()
}

fn select(x: &[f64], mask: &[bool]) -> Vec<f64> {
    x.iter().zip(mask).filter(|(_, &m)| m).map(|(&v, _)| v).collect()
}

fn fit_words(spec: &VariableSpec) -> (Option<f64>, Option<f64>) {
    let floc = spec.lower_threshold;
    let fscale = match (spec.lower_threshold, spec.upper_threshold, spec.distribution) {
        (Some(lt), Some(ut), Some(Distribution::Beta)) => Some(ut - lt),
        _ => None,
    };
    (floc, fscale)
}

/// The full trend-preserving parametric-or-nonparametric quantile mapping
/// pipeline for one variable at one cell/sub-selection (spec §4.4).
#[allow(clippy::too_many_arguments)]
pub fn map_quantiles_parametric_trend_preserving(
    x_obs_hist: &[f64],
    x_sim_hist: &[f64],
    x_sim_fut: &[f64],
    spec: &VariableSpec,
    n_quantiles: usize,
    p_value_eps: f64,
    max_change_factor: f64,
    max_adjustment_factor: f64,
    location: &str,
    diagnostics: &mut Diagnostics,
) -> Vec<f64> {
    let lower = spec.has_lower();
    let upper = spec.has_upper();

    let i_obs_hist = within_thresholds(x_obs_hist, spec);
    let i_sim_hist = within_thresholds(x_sim_hist, spec);
    let i_sim_fut = within_thresholds(x_sim_fut, spec);

    let mut x_target = x_obs_hist.to_vec();
    if spec.unconditional_ccs_transfer {
        x_target = map_quantiles_non_parametric_trend_preserving(
            x_obs_hist,
            x_sim_hist,
            x_sim_fut,
            spec.trend_preservation,
            n_quantiles,
            max_change_factor,
            max_adjustment_factor,
            true,
            spec.lower_bound,
            spec.upper_bound,
            location,
            diagnostics,
        );
    } else {
        let mapped = map_quantiles_non_parametric_trend_preserving(
            &select(x_obs_hist, &i_obs_hist),
            &select(x_sim_hist, &i_sim_hist),
            &select(x_sim_fut, &i_sim_fut),
            spec.trend_preservation,
            n_quantiles,
            max_change_factor,
            max_adjustment_factor,
            true,
            spec.lower_threshold,
            spec.upper_threshold,
            location,
            diagnostics,
        );
        let mut k = 0;
        for (i, &keep) in i_obs_hist.iter().enumerate() {
            if keep {
                x_target[i] = mapped[k];
                k += 1;
            }
        }
    }

    let p_lower_target = if lower {
        let p_obs = fraction_below(x_obs_hist, spec.lower_threshold.unwrap());
        Some(if spec.trendless_bound_frequency {
            p_obs
        } else {
            let p_sh = fraction_below(x_sim_hist, spec.lower_threshold.unwrap());
            let p_sf = fraction_below(x_sim_fut, spec.lower_threshold.unwrap());
            crate::numerics::ccs_transfer_sim2obs(p_obs, p_sh, p_sf, 0.0, 1.0)
        })
    } else {
        None
    };
    let p_upper_target = if upper {
        let p_obs = fraction_above(x_obs_hist, spec.upper_threshold.unwrap());
        Some(if spec.trendless_bound_frequency {
            p_obs
        } else {
            let p_sh = fraction_above(x_sim_hist, spec.upper_threshold.unwrap());
            let p_sf = fraction_above(x_sim_fut, spec.upper_threshold.unwrap());
            crate::numerics::ccs_transfer_sim2obs(p_obs, p_sh, p_sf, 0.0, 1.0)
        })
    } else {
        None
    };
    let (mut p_lower_target, mut p_upper_target) = (p_lower_target, p_upper_target);
    if let (Some(pl), Some(pu)) = (p_lower_target, p_upper_target) {
        let total = pl + pu;
        if total > 1.0 + 1e-10 {
            diagnostics.warn(location, "sum of p_lower_target and p_upper_target exceeds one: renormalizing");
            p_lower_target = Some(pl / total);
            p_upper_target = Some(pu / total);
        }
    }

    let x_source = x_sim_fut;
    let mut y = x_source.to_vec();
    let mut i_source = vec![true; x_source.len()];
    let mut i_target = vec![true; x_target.len()];

    if lower {
        let pl = p_lower_target.unwrap();
        let lower_threshold_source = if pl > 0.0 {
            percentile1d(x_source, &[pl])[0]
        } else if !upper {
            spec.lower_bound.unwrap()
        } else {
            spec.lower_bound.unwrap() - 1e-10 * (spec.upper_bound.unwrap() - spec.lower_bound.unwrap())
        };
        for (i, &v) in x_source.iter().enumerate() {
            if v <= lower_threshold_source {
                i_source[i] = false;
                y[i] = spec.lower_bound.unwrap();
            }
        }
        let lt = spec.lower_threshold.unwrap();
        for (i, &v) in x_target.iter().enumerate() {
            if v <= lt {
                i_target[i] = false;
            }
        }
    }
    if upper {
        let pu = p_upper_target.unwrap();
        let upper_threshold_source = if pu > 0.0 {
            percentile1d(x_source, &[1.0 - pu])[0]
        } else if !lower {
            spec.upper_bound.unwrap()
        } else {
            spec.upper_bound.unwrap() + 1e-10 * (spec.upper_bound.unwrap() - spec.lower_bound.unwrap())
        };
        for (i, &v) in x_source.iter().enumerate() {
            if v >= upper_threshold_source {
                i_source[i] = false;
                y[i] = spec.upper_bound.unwrap();
            }
        }
        let ut = spec.upper_threshold.unwrap();
        for (i, &v) in x_target.iter().enumerate() {
            if v >= ut {
                i_target[i] = false;
            }
        }
    }

    if !i_source.iter().any(|&b| b) {
        return y;
    }
    if !i_target.iter().any(|&b| b) {
        diagnostics.warn(
            location,
            format!("unable to do any quantile mapping: leaving {} value(s) unadjusted", i_source.iter().filter(|&&b| b).count()),
        );
        return y;
    }

    let x_source_fit = select(x_source, &i_sim_fut);
    let x_target_fit = select(&x_target, &i_target);
    let x_source_map = if spec.distribution.is_some() && (lower || upper) {
        map_quantiles_non_parametric_brute_force(&select(x_source, &i_source), &x_source_fit)
    } else {
        select(x_source, &i_source)
    };

    let Some(distribution) = spec.distribution else {
        return non_parametric_fallback(&y, &i_source, &x_source_map, &x_target_fit, n_quantiles);
    };

    let (floc, fscale) = fit_words(spec);
    let fit_source = distribution.fit(&x_source_fit, floc, fscale);
    let fit_target = distribution.fit(&x_target_fit, floc, fscale);
    let (Some(src_params), Some(tgt_params)) = (fit_source, fit_target) else {
        diagnostics.warn(location, "unable to do parametric quantile mapping: doing non-parametric quantile mapping instead");
        return non_parametric_fallback(&y, &i_source, &x_source_map, &x_target_fit, n_quantiles);
    };

    let limit = |p: f64| p.clamp(p_value_eps, 1.0 - p_value_eps);
    let p_source: Vec<f64> = x_source_map.iter().map(|&x| limit(distribution.cdf(x, &src_params))).collect();

    let p_target = if spec.adjust_p_values {
        let x_obs_hist_fit = select(x_obs_hist, &i_obs_hist);
        let x_sim_hist_fit = select(x_sim_hist, &i_sim_hist);
        let fit_oh = distribution.fit(&x_obs_hist_fit, floc, fscale);
        let fit_sh = distribution.fit(&x_sim_hist_fit, floc, fscale);
        if let (Some(oh), Some(sh)) = (fit_oh, fit_sh) {
            let p_oh: Vec<f64> = x_obs_hist_fit.iter().map(|&x| limit(distribution.cdf(x, &oh))).collect();
            let p_sh: Vec<f64> = x_sim_hist_fit.iter().map(|&x| limit(distribution.cdf(x, &sh))).collect();
            transfer_odds_ratio(&p_oh, &p_sh, &p_source).into_iter().map(limit).collect()
        } else {
            diagnostics.warn(location, "unable to adjust p-values: leaving them unadjusted");
            p_source.clone()
        }
    } else {
        p_source
    };

    let mapped: Vec<f64> = p_target.iter().map(|&p| distribution.ppf(p, &tgt_params)).collect();
    let mut k = 0;
    for (i, &keep) in i_source.iter().enumerate() {
        if keep {
            y[i] = mapped[k];
            k += 1;
        }
    }
    y
}

fn non_parametric_fallback(
    y: &[f64],
    i_source: &[bool],
    x_source_map: &[f64],
    x_target_fit: &[f64],
    n_quantiles: usize,
) -> Vec<f64> {
    let p: Vec<f64> = (0..=n_quantiles).map(|i| i as f64 / n_quantiles as f64).collect();
    let q_source = percentile1d(x_source_map, &p);
    let q_target = percentile1d(x_target_fit, &p);
    let mapped = map_quantiles_non_parametric_with_constant_extrapolation(x_source_map, &q_source, &q_target);
    let mut k = 0;
    let mut out = y.to_vec();
    for (i, &keep) in i_source.iter().enumerate() {
        if keep {
            out[i] = mapped[k];
            k += 1;
        }
    }
    out
}

fn fraction_below(x: &[f64], threshold: f64) -> f64 {
    x.iter().filter(|&&v| v <= threshold).count() as f64 / x.len() as f64
}

fn fraction_above(x: &[f64], threshold: f64) -> f64 {
    x.iter().filter(|&&v| v >= threshold).count() as f64 / x.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn diag() -> Diagnostics {
        Diagnostics::new(false)
    }

    #[test]
    fn identity_when_no_bias() {
        let oh: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let sh = oh.clone();
        let sf: Vec<f64> = (2..12).map(|i| i as f64).collect();
        let mut d = diag();
        let y = map_quantiles_non_parametric_trend_preserving(
            &oh, &sh, &sf, TrendPreservation::Additive, 50, 100.0, 9.0, false, None, None, "c", &mut d,
        );
        for (a, b) in y.iter().zip(&sf) {
            assert_relative_eq!(a, b, epsilon = 1e-9);
        }
    }

    #[test]
    fn additive_shift_is_preserved() {
        let sh: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let oh: Vec<f64> = sh.iter().map(|v| v + 10.0).collect();
        let sf: Vec<f64> = (2..12).map(|i| i as f64).collect();
        let mut d = diag();
        let y = map_quantiles_non_parametric_trend_preserving(
            &oh, &sh, &sf, TrendPreservation::Additive, 50, 100.0, 9.0, false, None, None, "c", &mut d,
        );
        for (a, b) in y.iter().zip(&sf) {
            assert_relative_eq!(*a, b + 10.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn multiplicative_handles_zero_sim_hist_without_nan() {
        let oh = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let sh = vec![0.0, 1.0, 2.0, 3.0, 4.0];
        let sf = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let mut d = diag();
        let y = map_quantiles_non_parametric_trend_preserving(
            &oh, &sh, &sf, TrendPreservation::Multiplicative, 4, 100.0, 9.0, false, None, None, "c", &mut d,
        );
        assert!(y.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn constant_extrapolation_shifts_beyond_range() {
        let q_sim = vec![0.0, 1.0, 2.0];
        let q_obs = vec![10.0, 11.0, 12.0];
        let y = map_quantiles_non_parametric_with_constant_extrapolation(&[-1.0, 3.0], &q_sim, &q_obs);
        assert_relative_eq!(y[0], 9.0);
        assert_relative_eq!(y[1], 13.0);
    }
}
