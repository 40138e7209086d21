//! C6: per-location bias adjuster. Assembles C1-C5 into the full pipeline
//! for one spatial cell, month by month or running-window by running-window.
//! Grounded in `bias_adjustment.py`'s `adjust_bias_one_location` and
//! `adjust_bias_one_month`.

use ndarray::Array2;
use rand::Rng;

use crate::climatology::{self, window_indices};
use crate::copula::adjust_copula_mbcn;
use crate::error::{Diagnostics, Error, Result};
use crate::model::{LocationCube, RunConfig, UpperBoundClimatology, VariableSpec};
use crate::numerics::{add_trend, subtract_trend};
use crate::qm::map_quantiles_parametric_trend_preserving;
use crate::randomize::{average_valid_values, randomize_censored, sample_invalid, CensorBounds};

/// One role's working copy for a single sub-selection (month or window):
/// values per variable plus the years needed for detrending.
struct RoleWindow {
    years: Vec<i32>,
    doys: Vec<u16>,
    variables: Vec<Vec<f64>>,
}

fn select_indices(idx: &[usize], values: &[f64]) -> Vec<f64> {
    idx.iter().map(|&i| values[i]).collect()
}

fn cell_has_missing_dataset(cube: &LocationCube) -> bool {
    [&cube.obs_hist, &cube.sim_hist, &cube.sim_fut]
        .iter()
        .any(|role| role.variables.iter().any(|s| s.all_invalid()))
}

/// Runs the full bias-adjustment pipeline for one spatial cell across all
/// configured variables, returning the adjusted future series per variable
/// in `cube.sim_fut`'s variable order, or `None` if the cell was skipped due
/// to an entirely-missing dataset.
pub fn adjust_bias_one_location(
    cube: &LocationCube,
    specs: &[VariableSpec],
    config: &RunConfig,
    rotation_matrices: &[Array2<f64>],
    location: &str,
    diagnostics: &mut Diagnostics,
    rng: &mut impl Rng,
) -> Result<Option<Vec<Vec<f64>>>> {
    if cell_has_missing_dataset(cube) {
        diagnostics.warn(location, "skipped due to missing data");
        return Ok(None);
    }

    let n_variables = specs.len();
    let mut obs_hist: Vec<Vec<f64>> = cube.obs_hist.variables.iter().map(|s| s.values.clone()).collect();
    let mut sim_hist: Vec<Vec<f64>> = cube.sim_hist.variables.iter().map(|s| s.values.clone()).collect();
    let mut sim_fut: Vec<Vec<f64>> = cube.sim_fut.variables.iter().map(|s| s.values.clone()).collect();
    // Timesteps outside `config.months`/the running window are never visited
    // by the loops below; start them at `fill_value` rather than an
    // unprocessed copy of `sim_fut` so a partial-months run cannot leak raw
    // (or, with climatology scaling on, scaled-into-[0,1]) input values into
    // the saved output (the original only ever writes the processed slice).
    let mut result: Vec<Vec<f64>> = sim_fut.iter().map(|v| vec![config.fill_value; v.len()]).collect();

    // scale into [0, 1] by upper-bound climatology, where requested
    let mut ubc_result: Vec<Option<UpperBoundClimatology>> = vec![None; n_variables];
    for (i, spec) in specs.iter().enumerate() {
        if spec.halfwin_upper_bound_climatology == 0 {
            continue;
        }
        let halfwin = spec.halfwin_upper_bound_climatology;
        let ubc_oh = climatology::upper_bound_climatology(&obs_hist[i], &cube.obs_hist.axis.doy, halfwin, location, diagnostics);
        let ubc_sh = climatology::upper_bound_climatology(&sim_hist[i], &cube.sim_hist.axis.doy, halfwin, location, diagnostics);
        let ubc_sf = climatology::upper_bound_climatology(&sim_fut[i], &cube.sim_fut.axis.doy, halfwin, location, diagnostics);

        climatology::scale_by_upper_bound_climatology(&mut obs_hist[i], &cube.obs_hist.axis.doy, &ubc_oh, true, location, diagnostics);
        climatology::scale_by_upper_bound_climatology(&mut sim_hist[i], &cube.sim_hist.axis.doy, &ubc_sh, true, location, diagnostics);
        climatology::scale_by_upper_bound_climatology(&mut sim_fut[i], &cube.sim_fut.axis.doy, &ubc_sf, true, location, diagnostics);

        let transferred = climatology::ccs_transfer_sim2obs_upper_bound_climatology(&ubc_oh.values, &ubc_sh.values, &ubc_sf.values);
        ubc_result[i] = Some(UpperBoundClimatology { values: transferred, doys: ubc_oh.doys });
    }

    // long-term means, used as invalid-value fallbacks
    let long_term_mean = |role: &crate::model::RoleData, values: &[Vec<f64>]| -> Vec<f64> {
        (0..n_variables)
            .map(|i| {
                average_valid_values(
                    &values[i],
                    &role.variables[i].invalid,
                    specs[i].if_all_invalid_use,
                    specs[i].lower_bound,
                    specs[i].lower_threshold,
                    specs[i].upper_bound,
                    specs[i].upper_threshold,
                )
            })
            .collect()
    };
    let ltm_obs_hist = long_term_mean(&cube.obs_hist, &obs_hist);
    let ltm_sim_hist = long_term_mean(&cube.sim_hist, &sim_hist);
    let ltm_sim_fut = long_term_mean(&cube.sim_fut, &sim_fut);

    if config.step_size == 0 {
        for &month in &config.months {
            let idx_oh = month_indices(&cube.obs_hist.axis.month, month);
            let idx_sh = month_indices(&cube.sim_hist.axis.month, month);
            let idx_sf = month_indices(&cube.sim_fut.axis.month, month);
            if idx_oh.is_empty() || idx_sh.is_empty() || idx_sf.is_empty() {
                return Err(Error::Data(format!("{location}: no data found for month {month}")));
            }

            let window_oh = extract_window(&cube.obs_hist.axis, &idx_oh, &obs_hist);
            let window_sh = extract_window(&cube.sim_hist.axis, &idx_sh, &sim_hist);
            let window_sf = extract_window(&cube.sim_fut.axis, &idx_sf, &sim_fut);

            let (result_month, trend_unused) = adjust_bias_one_month(
                &window_oh,
                &window_sh,
                &window_sf,
                &ltm_obs_hist,
                &ltm_sim_hist,
                &ltm_sim_fut,
                specs,
                config,
                rotation_matrices,
                location,
                diagnostics,
                rng,
            )?;
            let _ = trend_unused;

            for (i, spec) in specs.iter().enumerate() {
                let mut values = result_month[i].clone();
                if let Some(ubc) = &ubc_result[i] {
                    let doys_subset = select_u16(&cube.sim_fut.axis.doy, &idx_sf);
                    climatology::scale_by_upper_bound_climatology(&mut values, &doys_subset, ubc, false, location, diagnostics);
                }
                let _ = spec;
                for (k, &i_out) in idx_sf.iter().enumerate() {
                    result[i][i_out] = values[k];
                }
            }
        }
    } else {
        let doy_max = *cube.sim_fut.axis.doy.iter().max().unwrap_or(&365);
        let centers = climatology::window_centers(doy_max, config.step_size);
        for center in centers {
            let idx_oh = window_indices::for_window(&cube.obs_hist.axis.doy, center, 31, Some(&cube.obs_hist.axis.year));
            let idx_sh = window_indices::for_window(&cube.sim_hist.axis.doy, center, 31, Some(&cube.sim_hist.axis.year));
            let idx_sf = window_indices::for_window(&cube.sim_fut.axis.doy, center, 31, Some(&cube.sim_fut.axis.year));

            let window_oh = extract_window(&cube.obs_hist.axis, &idx_oh, &obs_hist);
            let window_sh = extract_window(&cube.sim_hist.axis, &idx_sh, &sim_hist);
            let window_sf = extract_window(&cube.sim_fut.axis, &idx_sf, &sim_fut);

            let (result_window, _) = adjust_bias_one_month(
                &window_oh,
                &window_sh,
                &window_sf,
                &ltm_obs_hist,
                &ltm_sim_hist,
                &ltm_sim_fut,
                specs,
                config,
                rotation_matrices,
                location,
                diagnostics,
                rng,
            )?;

            let idx_ba = window_indices::for_window(&cube.sim_fut.axis.doy, center, 31, Some(&cube.sim_fut.axis.year));
            let idx_keep = window_indices::for_window(&cube.sim_fut.axis.doy, center, config.step_size, Some(&cube.sim_fut.axis.year));
            let keep_set: std::collections::HashSet<usize> = idx_keep.iter().copied().collect();

            for i in 0..n_variables {
                let mut values = result_window[i].clone();
                if let Some(ubc) = &ubc_result[i] {
                    let doys_ba = select_u16(&cube.sim_fut.axis.doy, &idx_ba);
                    climatology::scale_by_upper_bound_climatology(&mut values, &doys_ba, ubc, false, location, diagnostics);
                }
                for (k, &i_ba) in idx_ba.iter().enumerate() {
                    if keep_set.contains(&i_ba) {
                        result[i][i_ba] = values[k];
                    }
                }
            }
        }
    }

    Ok(Some(result))
}

fn month_indices(months: &[u8], month: u8) -> Vec<usize> {
    months.iter().enumerate().filter(|(_, &m)| m == month).map(|(i, _)| i).collect()
}

fn select_u16(a: &[u16], idx: &[usize]) -> Vec<u16> {
    idx.iter().map(|&i| a[i]).collect()
}

fn extract_window(axis: &crate::model::TimeAxis, idx: &[usize], variables: &[Vec<f64>]) -> RoleWindow {
    RoleWindow {
        years: idx.iter().map(|&i| axis.year[i]).collect(),
        doys: idx.iter().map(|&i| axis.doy[i]).collect(),
        variables: variables.iter().map(|v| select_indices(idx, v)).collect(),
    }
}

/// One month's (or one window's) worth of the pipeline: invalid-value
/// replacement, detrending, censored-value randomization, MBCn copula
/// adjustment, then per-variable parametric-or-nonparametric quantile
/// mapping and trend restoration. Grounded in `adjust_bias_one_month`.
#[allow(clippy::too_many_arguments)]
fn adjust_bias_one_month(
    obs_hist: &RoleWindow,
    sim_hist: &RoleWindow,
    sim_fut: &RoleWindow,
    ltm_obs_hist: &[f64],
    ltm_sim_hist: &[f64],
    ltm_sim_fut: &[f64],
    specs: &[VariableSpec],
    config: &RunConfig,
    rotation_matrices: &[Array2<f64>],
    location: &str,
    diagnostics: &mut Diagnostics,
    rng: &mut impl Rng,
) -> Result<(Vec<Vec<f64>>, Vec<Option<Vec<f64>>>)> {
    let n_variables = specs.len();

    let mut x_obs_hist = Vec::with_capacity(n_variables);
    let mut x_sim_hist = Vec::with_capacity(n_variables);
    let mut x_sim_fut = Vec::with_capacity(n_variables);
    for i in 0..n_variables {
        let invalid_oh: Vec<bool> = obs_hist.variables[i].iter().map(|v| !v.is_finite()).collect();
        let invalid_sh: Vec<bool> = sim_hist.variables[i].iter().map(|v| !v.is_finite()).collect();
        let invalid_sf: Vec<bool> = sim_fut.variables[i].iter().map(|v| !v.is_finite()).collect();
        x_obs_hist.push(sample_invalid(
            &obs_hist.variables[i], &invalid_oh, ltm_obs_hist[i], rng, location, diagnostics,
        )?);
        x_sim_hist.push(sample_invalid(
            &sim_hist.variables[i], &invalid_sh, ltm_sim_hist[i], rng, location, diagnostics,
        )?);
        x_sim_fut.push(sample_invalid(
            &sim_fut.variables[i], &invalid_sf, ltm_sim_fut[i], rng, location, diagnostics,
        )?);
    }

    let mut trend_sim_fut: Vec<Option<Vec<f64>>> = vec![None; n_variables];
    for i in 0..n_variables {
        if specs[i].detrend {
            let (d, _) = subtract_trend(&x_obs_hist[i], &obs_hist.years);
            x_obs_hist[i] = d;
            let (d, _) = subtract_trend(&x_sim_hist[i], &sim_hist.years);
            x_sim_hist[i] = d;
            let (d, t) = subtract_trend(&x_sim_fut[i], &sim_fut.years);
            x_sim_fut[i] = d;
            trend_sim_fut[i] = Some(t);
        }
        let bounds = CensorBounds {
            lower_bound: specs[i].lower_bound,
            lower_threshold: specs[i].lower_threshold,
            upper_bound: specs[i].upper_bound,
            upper_threshold: specs[i].upper_threshold,
            lower_power: 1.0,
            upper_power: 1.0,
        };
        x_obs_hist[i] = randomize_censored(&x_obs_hist[i], &bounds, false, rng);
        x_sim_hist[i] = randomize_censored(&x_sim_hist[i], &bounds, false, rng);
        x_sim_fut[i] = randomize_censored(&x_sim_fut[i], &bounds, false, rng);
    }

    if n_variables > 1 && !rotation_matrices.is_empty() {
        x_sim_fut = adjust_copula_mbcn(&x_obs_hist, &x_sim_hist, &x_sim_fut, rotation_matrices, config.n_quantiles, location, diagnostics);
    }

    let mut result = Vec::with_capacity(n_variables);
    for i in 0..n_variables {
        let mut y = map_quantiles_parametric_trend_preserving(
            &x_obs_hist[i],
            &x_sim_hist[i],
            &x_sim_fut[i],
            &specs[i],
            config.n_quantiles,
            config.p_value_eps,
            config.max_change_factor,
            config.max_adjustment_factor,
            location,
            diagnostics,
        );
        if let Some(trend) = &trend_sim_fut[i] {
            y = add_trend(&y, trend);
        }
        if y.iter().any(|v| !v.is_finite()) {
            return Err(Error::Numerical {
                location: location.to_string(),
                message: format!("non-finite value(s) in bias-adjusted output for variable {i}"),
            });
        }
        result.push(y);
    }

    Ok((result, trend_sim_fut))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RoleData, Series, TimeAxis, TrendPreservation};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn axis(years: Vec<i32>, doys: Vec<u16>) -> TimeAxis {
        let month = doys.iter().map(|&d| (((d - 1) / 30).min(11) + 1) as u8).collect();
        TimeAxis { year: years, doy: doys, month }
    }

    fn single_variable_cube() -> LocationCube {
        let n = 20;
        let years: Vec<i32> = vec![2000; n];
        let doys: Vec<u16> = (1..=n as u16).collect();
        let oh: Vec<f64> = (0..n).map(|i| i as f64).collect();
        let sh = oh.clone();
        let sf: Vec<f64> = (0..n).map(|i| i as f64 + 2.0).collect();
        LocationCube {
            obs_hist: RoleData { axis: axis(years.clone(), doys.clone()), variables: vec![Series::new(oh)] },
            sim_hist: RoleData { axis: axis(years.clone(), doys.clone()), variables: vec![Series::new(sh)] },
            sim_fut: RoleData { axis: axis(years, doys), variables: vec![Series::new(sf)] },
        }
    }

    #[test]
    fn identity_mapping_preserves_additive_shift_across_months() {
        let cube = single_variable_cube();
        let spec = VariableSpec { trend_preservation: TrendPreservation::Additive, ..Default::default() };
        let config = RunConfig { months: vec![1], n_quantiles: 10, ..Default::default() };
        let mut diag = Diagnostics::new(false);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let result = adjust_bias_one_location(&cube, &[spec], &config, &[], "cell", &mut diag, &mut rng).unwrap();
        let result = result.unwrap();
        for (y, sf) in result[0].iter().zip(&cube.sim_fut.variables[0].values) {
            assert!((y - sf).abs() < 1e-6);
        }
    }

    #[test]
    fn unselected_months_are_left_at_fill_value() {
        let n = 60; // doys 1..=30 fall in month 1, 31..=60 in month 2
        let years: Vec<i32> = vec![2000; n];
        let doys: Vec<u16> = (1..=n as u16).collect();
        let oh: Vec<f64> = (0..n).map(|i| i as f64).collect();
        let sh = oh.clone();
        let sf: Vec<f64> = (0..n).map(|i| i as f64 + 2.0).collect();
        let cube = LocationCube {
            obs_hist: RoleData { axis: axis(years.clone(), doys.clone()), variables: vec![Series::new(oh)] },
            sim_hist: RoleData { axis: axis(years.clone(), doys.clone()), variables: vec![Series::new(sh)] },
            sim_fut: RoleData { axis: axis(years, doys.clone()), variables: vec![Series::new(sf)] },
        };
        let spec = VariableSpec { trend_preservation: TrendPreservation::Additive, ..Default::default() };
        let config = RunConfig { months: vec![1], n_quantiles: 10, ..Default::default() };
        let mut diag = Diagnostics::new(false);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let result = adjust_bias_one_location(&cube, &[spec], &config, &[], "cell", &mut diag, &mut rng).unwrap().unwrap();
        for (idx, &doy) in doys.iter().enumerate() {
            if doy <= 30 {
                assert!(result[0][idx].is_finite(), "month 1 entries should be adjusted, not fill_value");
            } else {
                assert_eq!(result[0][idx], config.fill_value, "month 2 was never selected and must stay at fill_value");
            }
        }
    }

    #[test]
    fn skips_cell_with_entirely_missing_dataset() {
        let mut cube = single_variable_cube();
        cube.sim_hist.variables[0] = Series::new(vec![f64::NAN; 20]);
        let spec = VariableSpec::default();
        let config = RunConfig { months: vec![1], ..Default::default() };
        let mut diag = Diagnostics::new(false);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let result = adjust_bias_one_location(&cube, &[spec], &config, &[], "cell", &mut diag, &mut rng).unwrap();
        assert!(result.is_none());
    }
}
