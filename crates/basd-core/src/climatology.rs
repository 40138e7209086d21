//! C3: running-window indexing and upper-bound climatology estimation.
//! Grounded in `utility_functions.py`'s `window_centers_for_running_bias_adjustment`,
//! `window_indices_for_running_bias_adjustment`, `aggregate_periodic`,
//! `get_upper_bound_climatology`, `ccs_transfer_sim2obs_upper_bound_climatology`
//! and `scale_by_upper_bound_climatology`.

use crate::error::Diagnostics;
use crate::model::UpperBoundClimatology;

/// Day-of-year centers of running windows for a given step size, spread so
/// the first and last window differ in length by at most one day.
pub fn window_centers(doy_max: u16, step_size: u32) -> Vec<u16> {
    let step = step_size as i64;
    let doy_mod = doy_max as i64 % step;
    let mut first = 1 + step / 2;
    if doy_mod != 0 {
        first -= (step - doy_mod) / 2;
    }
    let mut centers = Vec::new();
    let mut c = first;
    while c <= doy_max as i64 {
        centers.push(c as u16);
        c += step;
    }
    centers
}

pub mod window_indices {
    /// Indices into `doys` (and any array sharing its time axis) belonging
    /// to a running window of `window_width` days centered on
    /// `window_center`. `doy == 366` is treated as the slot right after the
    /// last `doy == 365` entry. Without `years`, out-of-range wrapped
    /// indices are dropped (single-year truncation); with `years`, wrapped
    /// indices whose year differs from the window center's own year are
    /// dropped (no bleed across year boundaries).
    pub fn for_window(
        doys: &[u16],
        window_center: u16,
        window_width: u32,
        years: Option<&[i32]>,
    ) -> Vec<usize> {
        let n = doys.len() as i64;
        let h = (window_width / 2) as i64;
        let centers: Vec<i64> = if window_center == 366 {
            doys.iter()
                .enumerate()
                .filter(|(_, &d)| d == 365)
                .map(|(i, _)| i as i64 + 1)
                .collect()
        } else {
            doys.iter()
                .enumerate()
                .filter(|(_, &d)| d == window_center)
                .map(|(i, _)| i as i64)
                .collect()
        };

        match years {
            None => {
                if centers.len() != 1 {
                    let mut out: Vec<i64> = centers
                        .iter()
                        .flat_map(|&i| (i - h..=i + h).map(move |j| j.rem_euclid(n)))
                        .collect();
                    out.sort_unstable();
                    return out.into_iter().map(|i| i as usize).collect();
                }
                let i = centers[0];
                (i - h..=i + h)
                    .filter(|&lit| {
                        let wrapped = lit.rem_euclid(n);
                        wrapped == lit
                    })
                    .map(|lit| lit.rem_euclid(n) as usize)
                    .collect()
            }
            Some(years) => {
                let years_unique: std::collections::BTreeSet<i32> = years.iter().copied().collect();
                if years_unique.len() == 1 {
                    let i = centers[0];
                    (i - h..=i + h)
                        .filter(|&lit| lit.rem_euclid(n) == lit)
                        .map(|lit| lit.rem_euclid(n) as usize)
                        .collect()
                } else {
                    let mut out = Vec::new();
                    for &i in &centers {
                        let window_year = years[i.rem_euclid(n) as usize];
                        for lit in i - h..=i + h {
                            let wrapped = lit.rem_euclid(n) as usize;
                            if years[wrapped] == window_year {
                                out.push(wrapped);
                            }
                        }
                    }
                    out
                }
            }
        }
    }
}

/// Aggregates `a` over a periodic running window of length `2*halfwin + 1`
/// using the maximum.
pub fn aggregate_periodic_max(a: &[f64], halfwin: usize) -> Vec<f64> {
    if halfwin == 0 {
        return a.to_vec();
    }
    let n = a.len();
    let window = 2 * halfwin + 1;
    let b: Vec<f64> = a[n - halfwin..]
        .iter()
        .chain(a.iter())
        .chain(a[..halfwin].iter())
        .copied()
        .collect();
    let mut out = vec![0.0; n];
    let mut deque: std::collections::VecDeque<usize> = std::collections::VecDeque::new();
    for i in 0..b.len() {
        while let Some(&back) = deque.back() {
            if b[back] <= b[i] {
                deque.pop_back();
            } else {
                break;
            }
        }
        deque.push_back(i);
        if *deque.front().unwrap() + window <= i {
            deque.pop_front();
        }
        if i + 1 >= window {
            out[i + 1 - window] = b[*deque.front().unwrap()];
        }
    }
    out
}

/// Aggregates `a` over a periodic running window of length `2*halfwin + 1`
/// using the arithmetic mean.
pub fn aggregate_periodic_mean(a: &[f64], halfwin: usize) -> Vec<f64> {
    if halfwin == 0 {
        return a.to_vec();
    }
    let n = a.len();
    let window = 2 * halfwin + 1;
    let b: Vec<f64> = a[n - halfwin..]
        .iter()
        .chain(a.iter())
        .chain(a[..halfwin].iter())
        .copied()
        .collect();
    let mut out = vec![0.0; n];
    let mut sum: f64 = b[..window].iter().sum();
    out[0] = sum / window as f64;
    for i in 0..n - 1 {
        sum += b[i + window] - b[i];
        out[i + 1] = sum / window as f64;
    }
    out
}

/// Estimates an annual cycle of upper bounds as running-mean-of-running-max
/// of multi-year daily maxima. `doys` must be sorted within each year but
/// need not be sorted globally.
pub fn upper_bound_climatology(
    d: &[f64],
    doys: &[u16],
    halfwin: usize,
    location: &str,
    diagnostics: &mut Diagnostics,
) -> UpperBoundClimatology {
    assert_eq!(d.len(), doys.len());
    let mut doys_unique: Vec<u16> = doys.to_vec();
    doys_unique.sort_unstable();
    doys_unique.dedup();
    let n = doys_unique.len();
    if n != 366 {
        diagnostics.warn(
            location,
            format!(
                "upper bound climatology only defined for {n} days of the year: \
                 this may imply an invalid computation of the climatology"
            ),
        );
    }

    let mut order: Vec<usize> = (0..doys.len()).collect();
    order.sort_by_key(|&i| doys[i]);

    let mut mydm = vec![f64::NEG_INFINITY; n];
    let mut doy_to_slot = std::collections::HashMap::new();
    for (slot, &doy) in doys_unique.iter().enumerate() {
        doy_to_slot.insert(doy, slot);
    }
    for &i in &order {
        let slot = doy_to_slot[&doys[i]];
        if d[i] > mydm[slot] {
            mydm[slot] = d[i];
        }
    }

    let mydmrm = aggregate_periodic_max(&mydm, halfwin);
    let ubc = aggregate_periodic_mean(&mydmrm, halfwin);

    UpperBoundClimatology { values: ubc, doys: doys_unique }
}

/// Multiplicatively transfers the simulated climate-change signal between
/// upper-bound climatologies, change factor clamped to `[0.1, 10]`.
pub fn ccs_transfer_sim2obs_upper_bound_climatology(
    obs_hist: &[f64],
    sim_hist: &[f64],
    sim_fut: &[f64],
) -> Vec<f64> {
    assert_eq!(obs_hist.len(), sim_hist.len());
    assert_eq!(obs_hist.len(), sim_fut.len());
    obs_hist
        .iter()
        .zip(sim_hist)
        .zip(sim_fut)
        .map(|((&o, &sh), &sf)| {
            let change_factor = if sh == 0.0 { 1.0 } else { sf / sh };
            o * change_factor.clamp(0.1, 10.0)
        })
        .collect()
}

/// Scales `d` in-place by the upper-bound climatology `ubc`, dividing
/// (`divide = true`) or multiplying. When multiplying, values that end up
/// exceeding the climatology are capped and a warning is recorded.
pub fn scale_by_upper_bound_climatology(
    d: &mut [f64],
    d_doys: &[u16],
    ubc: &UpperBoundClimatology,
    divide: bool,
    location: &str,
    diagnostics: &mut Diagnostics,
) {
    assert_eq!(d.len(), d_doys.len());
    let scaling_factors: Vec<f64> = if divide {
        ubc.values.iter().map(|&u| if u == 0.0 { 1.0 } else { 1.0 / u }).collect()
    } else {
        ubc.values.clone()
    };

    let fast = ubc.values.len() == 366;
    let mut doy_to_slot = std::collections::HashMap::new();
    if !fast {
        for (slot, &doy) in ubc.doys.iter().enumerate() {
            doy_to_slot.insert(doy, slot);
        }
    }

    let mut capped = 0usize;
    for (i, &doy) in d_doys.iter().enumerate() {
        let factor = if fast {
            scaling_factors[(doy - 1) as usize]
        } else {
            scaling_factors[doy_to_slot[&doy]]
        };
        d[i] *= factor;
        if !divide && d[i] > factor {
            d[i] = factor;
            capped += 1;
        }
    }
    if capped > 0 {
        diagnostics.warn(
            location,
            format!("capping {capped} values exceeding the upper bound climatology"),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_centers_covers_full_year_for_step_size_one() {
        let centers = window_centers(365, 1);
        assert_eq!(centers.len(), 365);
        assert_eq!(centers[0], 1);
    }

    #[test]
    fn window_indices_wraps_without_years() {
        let doys: Vec<u16> = (1..=10).collect();
        let idx = window_indices::for_window(&doys, 1, 5, None);
        assert!(idx.contains(&9));
        assert!(idx.contains(&0));
    }

    #[test]
    fn window_indices_stays_within_year_when_multi_year() {
        let doys: Vec<u16> = (1..=5).chain(1..=5).collect();
        let years = vec![2000, 2000, 2000, 2000, 2000, 2001, 2001, 2001, 2001, 2001];
        let idx = window_indices::for_window(&doys, 1, 5, Some(&years));
        assert!(idx.iter().all(|&i| years[i] == 2000));
    }

    #[test]
    fn aggregate_periodic_max_matches_running_window() {
        let a = vec![1.0, 5.0, 2.0, 0.0, 3.0];
        let out = aggregate_periodic_max(&a, 1);
        assert_eq!(out, vec![5.0, 5.0, 5.0, 3.0, 3.0]);
    }

    #[test]
    fn upper_bound_climatology_warns_when_not_366_days() {
        let d = vec![1.0, 2.0, 3.0, 4.0];
        let doys = vec![1u16, 2, 1, 2];
        let mut diag = Diagnostics::new(false);
        let ubc = upper_bound_climatology(&d, &doys, 0, "cell", &mut diag);
        assert!(!diag.is_empty());
        assert_eq!(ubc.values, vec![3.0, 4.0]);
    }

    #[test]
    fn scale_by_ubc_caps_values_exceeding_climatology() {
        let mut d = vec![2.0];
        let d_doys = vec![1u16];
        let ubc = UpperBoundClimatology { values: vec![1.5], doys: vec![1] };
        let mut diag = Diagnostics::new(false);
        scale_by_upper_bound_climatology(&mut d, &d_doys, &ubc, false, "cell", &mut diag);
        assert_eq!(d[0], 1.5);
        assert!(!diag.is_empty());
    }
}
