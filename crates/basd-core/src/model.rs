//! Data model (spec §3): `Series`, per-role time axes, `VariableSpec`,
//! `RunConfig`, `Grid`, and `UpperBoundClimatology`. `RotationMatrix` has no
//! dedicated type: it is the `ndarray::Array2<f64>` produced by
//! [`crate::numerics::cre_matrix`].

use crate::error::{Error, Result};
use crate::numerics::Distribution;
use chrono::{Datelike, NaiveDate};
use std::str::FromStr;

/// Derives the calendar month for a `(year, doy)` pair under the
/// proleptic-Gregorian calendar the engine assumes throughout (spec §6).
/// Returns a data error if `doy` does not exist in `year` (e.g. `366` in a
/// non-leap year), surfacing the "calendar not proleptic-Gregorian" fatal
/// condition from spec §7.
pub fn month_from_year_doy(year: i32, doy: u16) -> Result<u8> {
    NaiveDate::from_yo_opt(year, doy as u32)
        .map(|d| d.month() as u8)
        .ok_or_else(|| {
            Error::Data(format!(
                "day-of-year {doy} does not exist in year {year} under the proleptic-Gregorian calendar"
            ))
        })
}

/// A finite ordered sequence of real values for one variable at one cell,
/// with a per-element invalid flag (missing/inf/nan) replacing masked-array
/// semantics (spec §9 "masked arrays -> value-with-validity").
#[derive(Debug, Clone)]
pub struct Series {
    pub values: Vec<f64>,
    pub invalid: Vec<bool>,
}

impl Series {
    pub fn new(values: Vec<f64>) -> Self {
        let invalid = values.iter().map(|v| !v.is_finite()).collect();
        Self { values, invalid }
    }

    /// Builds a series from raw values plus an explicit missing-value mask
    /// (as would come from a `GridStore`'s masked read), folding inf/nan into
    /// the same invalid flag.
    pub fn with_missing_mask(values: Vec<f64>, missing: &[bool]) -> Self {
        assert_eq!(values.len(), missing.len());
        let invalid = values
            .iter()
            .zip(missing)
            .map(|(v, &m)| m || !v.is_finite())
            .collect();
        Self { values, invalid }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn n_invalid(&self) -> usize {
        self.invalid.iter().filter(|&&b| b).count()
    }

    pub fn all_invalid(&self) -> bool {
        !self.invalid.is_empty() && self.invalid.iter().all(|&b| b)
    }

    /// Values at valid positions only.
    pub fn valid_values(&self) -> Vec<f64> {
        self.values
            .iter()
            .zip(&self.invalid)
            .filter(|(_, &inv)| !inv)
            .map(|(&v, _)| v)
            .collect()
    }
}

/// Shared time axis for one role (`obs_hist`, `sim_hist`, `sim_fut`): years,
/// days-of-year, and derived calendar months, identical across all variables
/// within the role (invariant I1).
#[derive(Debug, Clone)]
pub struct TimeAxis {
    pub year: Vec<i32>,
    pub doy: Vec<u16>,
    pub month: Vec<u8>,
}

impl TimeAxis {
    pub fn len(&self) -> usize {
        self.year.len()
    }

    pub fn is_empty(&self) -> bool {
        self.year.is_empty()
    }

    /// Builds a `TimeAxis` from bare year/day-of-year coordinates, deriving
    /// each element's calendar month via [`month_from_year_doy`]. Used when a
    /// `GridStore`'s coordinate metadata supplies only year and day-of-year,
    /// the common case for chunked scientific-data files.
    pub fn from_year_doy(year: Vec<i32>, doy: Vec<u16>) -> Result<Self> {
        assert_eq!(year.len(), doy.len(), "year and doy must have equal length");
        let month = year
            .iter()
            .zip(&doy)
            .map(|(&y, &d)| month_from_year_doy(y, d))
            .collect::<Result<Vec<u8>>>()?;
        Ok(Self { year, doy, month })
    }

    /// Validates invariant I1: the `(year, doy)` sequence is contiguous, with
    /// no gaps and no repeats, across calendar-year boundaries. Surfaces the
    /// "period gaps" data error from spec §7.
    pub fn validate_contiguous(&self) -> Result<()> {
        for i in 1..self.len() {
            let (y0, d0) = (self.year[i - 1], self.doy[i - 1]);
            let (y1, d1) = (self.year[i], self.doy[i]);
            let expected = if y1 == y0 {
                d0 + 1
            } else if y1 == y0 + 1 {
                1
            } else {
                return Err(Error::Data(format!(
                    "time axis has a gap between year {y0} and year {y1}"
                )));
            };
            if d1 != expected {
                return Err(Error::Data(format!(
                    "time axis has a gap: day-of-year {d0} in year {y0} is followed by \
                     day-of-year {d1} in year {y1}, expected {expected}"
                )));
            }
        }
        Ok(())
    }
}

/// One role's data for a single cell: a shared time axis plus one `Series`
/// per variable.
#[derive(Debug, Clone)]
pub struct RoleData {
    pub axis: TimeAxis,
    pub variables: Vec<Series>,
}

/// The three input roles plus the future bias-adjusted output for one
/// spatial cell and all its variables (spec §3 `LocationCube`).
#[derive(Debug, Clone)]
pub struct LocationCube {
    pub obs_hist: RoleData,
    pub sim_hist: RoleData,
    pub sim_fut: RoleData,
}

/// Distribution-family-independent trend-preservation law (spec §3, §4.4a).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrendPreservation {
    Additive,
    Multiplicative,
    Mixed,
    Bounded,
}

impl FromStr for TrendPreservation {
    type Err = std::convert::Infallible;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "multiplicative" => TrendPreservation::Multiplicative,
            "mixed" => TrendPreservation::Mixed,
            "bounded" => TrendPreservation::Bounded,
            _ => TrendPreservation::Additive,
        })
    }
}

/// Static per-variable configuration (spec §3 `VariableSpec`).
#[derive(Debug, Clone)]
pub struct VariableSpec {
    pub lower_bound: Option<f64>,
    pub lower_threshold: Option<f64>,
    pub upper_bound: Option<f64>,
    pub upper_threshold: Option<f64>,
    pub distribution: Option<Distribution>,
    pub trend_preservation: TrendPreservation,
    pub detrend: bool,
    pub adjust_p_values: bool,
    pub unconditional_ccs_transfer: bool,
    pub trendless_bound_frequency: bool,
    pub halfwin_upper_bound_climatology: usize,
    pub if_all_invalid_use: f64,
}

impl Default for VariableSpec {
    fn default() -> Self {
        Self {
            lower_bound: None,
            lower_threshold: None,
            upper_bound: None,
            upper_threshold: None,
            distribution: None,
            trend_preservation: TrendPreservation::Additive,
            detrend: false,
            adjust_p_values: false,
            unconditional_ccs_transfer: false,
            trendless_bound_frequency: false,
            halfwin_upper_bound_climatology: 0,
            if_all_invalid_use: f64::NAN,
        }
    }
}

impl VariableSpec {
    pub fn has_lower(&self) -> bool {
        self.lower_bound.is_some() && self.lower_threshold.is_some()
    }

    pub fn has_upper(&self) -> bool {
        self.upper_bound.is_some() && self.upper_threshold.is_some()
    }

    /// Validates invariants I2/I3: bound/threshold ordering and
    /// distribution/bounds consistency.
    pub fn validate(&self) -> Result<()> {
        let lower = self.has_lower();
        let upper = self.has_upper();
        if self.lower_bound.is_some() != self.lower_threshold.is_some() {
            return Err(Error::Config(
                "lower_bound and lower_threshold must both be set or both unset".into(),
            ));
        }
        if self.upper_bound.is_some() != self.upper_threshold.is_some() {
            return Err(Error::Config(
                "upper_bound and upper_threshold must both be set or both unset".into(),
            ));
        }
        if lower && self.lower_bound.unwrap() >= self.lower_threshold.unwrap() {
            return Err(Error::Config("lower_bound >= lower_threshold".into()));
        }
        if upper && self.upper_bound.unwrap() <= self.upper_threshold.unwrap() {
            return Err(Error::Config("upper_bound <= upper_threshold".into()));
        }
        if lower && upper && self.lower_threshold.unwrap() >= self.upper_threshold.unwrap() {
            return Err(Error::Config("lower_threshold >= upper_threshold".into()));
        }
        if let Some(d) = self.distribution {
            match d {
                Distribution::Normal => {
                    if lower || upper {
                        return Err(Error::Config("normal distribution can not have bounds".into()));
                    }
                }
                Distribution::Weibull | Distribution::Gamma | Distribution::Rice => {
                    if !lower || upper {
                        return Err(Error::Config(format!(
                            "{d:?} distribution must only have a lower bound"
                        )));
                    }
                }
                Distribution::Beta => {
                    if !lower || !upper {
                        return Err(Error::Config(
                            "beta distribution must have lower and upper bound".into(),
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Global, run-wide configuration (spec §3 `RunConfig`).
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub n_quantiles: usize,
    pub p_value_eps: f64,
    pub max_change_factor: f64,
    pub max_adjustment_factor: f64,
    pub n_iterations: usize,
    /// 0 => calendar-month mode, else an odd value in 1..=31 => running-window mode.
    pub step_size: u32,
    pub months: Vec<u8>,
    pub randomization_seed: Option<u64>,
    pub n_processes: usize,
    pub fill_value: f64,
    pub repeat_warnings: bool,
    pub invalid_value_warnings: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            n_quantiles: 50,
            p_value_eps: 1e-10,
            max_change_factor: 100.0,
            max_adjustment_factor: 9.0,
            n_iterations: 0,
            step_size: 0,
            months: (1..=12).collect(),
            randomization_seed: None,
            n_processes: 1,
            fill_value: 1e20,
            repeat_warnings: false,
            invalid_value_warnings: false,
        }
    }
}

impl RunConfig {
    /// Validates invariants over `step_size` and `months` (spec §7
    /// configuration errors).
    pub fn validate(&self) -> Result<()> {
        if self.step_size != 0 && (self.step_size > 31 || self.step_size % 2 == 0) {
            return Err(Error::Config(format!(
                "step_size {} must be 0 or an odd integer between 1 and 31",
                self.step_size
            )));
        }
        for &m in &self.months {
            if !(1..=12).contains(&m) {
                return Err(Error::Config(format!("invalid month {m}")));
            }
        }
        if self.n_quantiles == 0 {
            return Err(Error::Config("n_quantiles must be > 0".into()));
        }
        Ok(())
    }
}

/// A single coordinate axis of a spatial grid.
#[derive(Debug, Clone)]
pub struct Axis {
    pub name: String,
    pub values: Vec<f64>,
    pub ascending: bool,
    pub circular: bool,
}

/// Ordered spatial axes of a grid (spec §3 `Grid`).
#[derive(Debug, Clone, Default)]
pub struct Grid {
    pub axes: Vec<Axis>,
}

impl Grid {
    pub fn space_shape(&self) -> Vec<usize> {
        self.axes.iter().map(|a| a.values.len()).collect()
    }

    pub fn is_latitude_like(name: &str) -> bool {
        matches!(name.to_lowercase().as_str(), "lat" | "latitude" | "rlat")
    }

    /// Validates invariant I4: `fine` is the expected bilinear refinement of
    /// `coarse` — same axis count, each axis's fine cell count an integer
    /// multiple of the coarse cell count, and fine spacing matching the
    /// expected per-axis refinement factor within `tol` relative tolerance.
    /// Returns the per-axis refinement factors `f_d` on success.
    pub fn nested_refinement_factors(coarse: &Grid, fine: &Grid, tol: f64) -> Result<Vec<usize>> {
        if coarse.axes.len() != fine.axes.len() {
            return Err(Error::Data(
                "coarse and fine grids must have the same number of spatial axes".into(),
            ));
        }
        coarse
            .axes
            .iter()
            .zip(&fine.axes)
            .map(|(c, f)| {
                let nc = c.values.len();
                let nf = f.values.len();
                if nc == 0 || nf % nc != 0 {
                    return Err(Error::Data(format!(
                        "axis {:?}: fine cell count {nf} is not an integer multiple of coarse cell count {nc}",
                        c.name
                    )));
                }
                let factor = nf / nc;
                if factor < 2 {
                    return Err(Error::Data(format!(
                        "axis {:?}: fine grid is not strictly finer than the coarse grid",
                        c.name
                    )));
                }
                if nc > 1 {
                    let c_step = (c.values[1] - c.values[0]).abs();
                    let f_step = (f.values[1] - f.values[0]).abs();
                    let expected = c_step / factor as f64;
                    if c_step > 0.0 && (f_step - expected).abs() > tol * c_step {
                        return Err(Error::Data(format!(
                            "axis {:?}: fine grid spacing {f_step} does not match the expected \
                             refinement factor {factor} of coarse spacing {c_step}",
                            c.name
                        )));
                    }
                }
                Ok(factor)
            })
            .collect()
    }
}

/// A per-doy estimate of a variable's upper envelope (spec §3
/// `UpperBoundClimatology`); `doys` is sorted and typically has length 366.
#[derive(Debug, Clone)]
pub struct UpperBoundClimatology {
    pub values: Vec<f64>,
    pub doys: Vec<u16>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn series_flags_nan_and_inf_as_invalid() {
        let s = Series::new(vec![1.0, f64::NAN, f64::INFINITY, 2.0]);
        assert_eq!(s.invalid, vec![false, true, true, false]);
        assert_eq!(s.valid_values(), vec![1.0, 2.0]);
    }

    #[test]
    fn variable_spec_rejects_inverted_bounds() {
        let mut spec = VariableSpec {
            lower_bound: Some(1.0),
            lower_threshold: Some(0.0),
            ..Default::default()
        };
        assert!(spec.validate().is_err());
        spec.lower_bound = Some(0.0);
        spec.lower_threshold = Some(1.0);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn variable_spec_rejects_bounds_with_normal_distribution() {
        let spec = VariableSpec {
            distribution: Some(Distribution::Normal),
            lower_bound: Some(0.0),
            lower_threshold: Some(1.0),
            ..Default::default()
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn run_config_rejects_even_step_size() {
        let cfg = RunConfig { step_size: 10, ..Default::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn month_from_year_doy_matches_known_dates() {
        assert_eq!(month_from_year_doy(2020, 1).unwrap(), 1);
        assert_eq!(month_from_year_doy(2020, 366).unwrap(), 12); // 2020 is a leap year
        assert!(month_from_year_doy(2021, 366).is_err()); // 2021 is not
    }

    #[test]
    fn time_axis_from_year_doy_derives_month() {
        let axis = TimeAxis::from_year_doy(vec![2021, 2021], vec![1, 32]).unwrap();
        assert_eq!(axis.month, vec![1, 2]);
    }

    #[test]
    fn time_axis_validate_contiguous_accepts_a_full_non_leap_year() {
        let doy: Vec<u16> = (1..=365).collect();
        let year = vec![2021; 365];
        let axis = TimeAxis::from_year_doy(year, doy).unwrap();
        assert!(axis.validate_contiguous().is_ok());
    }

    #[test]
    fn time_axis_validate_contiguous_accepts_a_year_boundary() {
        let axis = TimeAxis {
            year: vec![2020, 2020, 2021],
            doy: vec![364, 366, 1],
            month: vec![12, 12, 1],
        };
        assert!(axis.validate_contiguous().is_ok());
    }

    #[test]
    fn time_axis_validate_contiguous_rejects_a_gap() {
        let axis = TimeAxis { year: vec![2021, 2021], doy: vec![1, 3], month: vec![1, 1] };
        assert!(axis.validate_contiguous().is_err());
    }

    fn axis_1d(name: &str, values: Vec<f64>) -> Axis {
        Axis { name: name.into(), values, ascending: true, circular: false }
    }

    #[test]
    fn nested_refinement_factors_accepts_a_uniform_3x_refinement() {
        let coarse = Grid { axes: vec![axis_1d("lat", vec![0.0, 3.0]), axis_1d("lon", vec![0.0, 3.0])] };
        let fine = Grid {
            axes: vec![
                axis_1d("lat", vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]),
                axis_1d("lon", vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]),
            ],
        };
        let factors = Grid::nested_refinement_factors(&coarse, &fine, 1e-6).unwrap();
        assert_eq!(factors, vec![3, 3]);
    }

    #[test]
    fn nested_refinement_factors_rejects_a_non_multiple_fine_count() {
        let coarse = Grid { axes: vec![axis_1d("lat", vec![0.0, 3.0])] };
        let fine = Grid { axes: vec![axis_1d("lat", vec![0.0, 1.0, 2.0, 3.0, 4.0])] };
        assert!(Grid::nested_refinement_factors(&coarse, &fine, 1e-6).is_err());
    }

    #[test]
    fn nested_refinement_factors_rejects_mismatched_spacing() {
        let coarse = Grid { axes: vec![axis_1d("lat", vec![0.0, 3.0])] };
        // claims a 3x refinement but the fine spacing is actually 2x
        let fine = Grid { axes: vec![axis_1d("lat", vec![0.0, 1.5, 3.0, 4.5, 6.0, 7.5])] };
        assert!(Grid::nested_refinement_factors(&coarse, &fine, 1e-6).is_err());
    }
}
