//! Translates parsed CLI arguments into `basd_core` configuration types
//! (spec §6's "thin external collaborator"). No defaults are invented here
//! beyond what `clap` already applies; `basd_core::model`'s own `Default`
//! impls back every optional numeric knob.

use anyhow::{bail, Context, Result};
use basd_core::{DownscaleSpec, Distribution, RunConfig, TrendPreservation, VariableSpec};

use crate::args::{BiasAdjustArgs, DownscaleArgs, GlobalArgs};

fn parse_optional_f64(field: &str, raw: &str) -> Result<Option<f64>> {
    if raw.eq_ignore_ascii_case("none") {
        Ok(None)
    } else {
        raw.parse::<f64>()
            .map(Some)
            .with_context(|| format!("invalid {field} value {raw:?}"))
    }
}

fn parse_optional_distribution(raw: &str) -> Result<Option<Distribution>> {
    if raw.eq_ignore_ascii_case("none") || raw.is_empty() {
        return Ok(None);
    }
    match raw.to_lowercase().as_str() {
        "normal" | "weibull" | "gamma" | "beta" | "rice" => Ok(Some(raw.parse().unwrap())),
        other => bail!("unknown distribution {other:?}; expected one of none|normal|weibull|gamma|beta|rice"),
    }
}

pub fn run_config_from_global(global: &GlobalArgs) -> RunConfig {
    let defaults = RunConfig::default();
    RunConfig {
        n_quantiles: global.n_quantiles,
        p_value_eps: global.p_value_eps,
        max_change_factor: global.max_change_factor,
        max_adjustment_factor: global.max_adjustment_factor,
        n_iterations: global.n_iterations,
        step_size: global.step_size,
        months: if global.months.is_empty() { defaults.months } else { global.months.clone() },
        randomization_seed: global.randomization_seed,
        n_processes: global.n_processes,
        fill_value: global.fill_value,
        repeat_warnings: global.repeat_warnings,
        invalid_value_warnings: global.invalid_value_warnings,
    }
}

/// Builds one `VariableSpec` per entry in `args.variables`, reading every
/// other per-variable comma-list at the same index (spec §6: "comma-split
/// at the current variable's index for per-variable fields").
pub fn variable_specs_from_bias_adjust(args: &BiasAdjustArgs) -> Result<Vec<VariableSpec>> {
    let n = args.variables.len();
    if n == 0 {
        bail!("--variables must name at least one variable");
    }
    let field_len_ok = |name: &str, len: usize| -> Result<()> {
        if len != 0 && len != n {
            bail!("--{name} has {len} entries but --variables has {n}");
        }
        Ok(())
    };
    field_len_ok("lower-bound", args.lower_bound.len())?;
    field_len_ok("lower-threshold", args.lower_threshold.len())?;
    field_len_ok("upper-bound", args.upper_bound.len())?;
    field_len_ok("upper-threshold", args.upper_threshold.len())?;
    field_len_ok("distribution", args.distribution.len())?;
    field_len_ok("trend-preservation", args.trend_preservation.len())?;
    field_len_ok("detrend", args.detrend.len())?;
    field_len_ok("adjust-p-values", args.adjust_p_values.len())?;
    field_len_ok("unconditional-ccs-transfer", args.unconditional_ccs_transfer.len())?;
    field_len_ok("trendless-bound-frequency", args.trendless_bound_frequency.len())?;
    field_len_ok("halfwin-upper-bound-climatology", args.halfwin_upper_bound_climatology.len())?;
    field_len_ok("if-all-invalid-use", args.if_all_invalid_use.len())?;

    let none_str = "none".to_string();
    let at_str = |list: &[String], i: usize| -> String { list.get(i).cloned().unwrap_or_else(|| none_str.clone()) };
    let defaults = VariableSpec::default();

    (0..n)
        .map(|i| {
            let spec = VariableSpec {
                lower_bound: parse_optional_f64("lower-bound", &at_str(&args.lower_bound, i))?,
                lower_threshold: parse_optional_f64("lower-threshold", &at_str(&args.lower_threshold, i))?,
                upper_bound: parse_optional_f64("upper-bound", &at_str(&args.upper_bound, i))?,
                upper_threshold: parse_optional_f64("upper-threshold", &at_str(&args.upper_threshold, i))?,
                distribution: parse_optional_distribution(&at_str(&args.distribution, i))?,
                trend_preservation: args
                    .trend_preservation
                    .get(i)
                    .map(|s| s.parse().unwrap())
                    .unwrap_or(TrendPreservation::Additive),
                detrend: args.detrend.get(i).copied().unwrap_or(defaults.detrend),
                adjust_p_values: args.adjust_p_values.get(i).copied().unwrap_or(defaults.adjust_p_values),
                unconditional_ccs_transfer: args
                    .unconditional_ccs_transfer
                    .get(i)
                    .copied()
                    .unwrap_or(defaults.unconditional_ccs_transfer),
                trendless_bound_frequency: args
                    .trendless_bound_frequency
                    .get(i)
                    .copied()
                    .unwrap_or(defaults.trendless_bound_frequency),
                halfwin_upper_bound_climatology: args
                    .halfwin_upper_bound_climatology
                    .get(i)
                    .copied()
                    .unwrap_or(defaults.halfwin_upper_bound_climatology),
                if_all_invalid_use: {
                    let raw = at_str(&args.if_all_invalid_use, i);
                    parse_optional_f64("if-all-invalid-use", &raw)?.unwrap_or(f64::NAN)
                },
            };
            spec.validate().with_context(|| format!("variable {:?}", args.variables[i]))?;
            Ok(spec)
        })
        .collect()
}

pub fn downscale_spec_from_args(args: &DownscaleArgs) -> Result<DownscaleSpec> {
    let spec = DownscaleSpec {
        lower_bound: parse_optional_f64("lower-bound", &args.lower_bound)?,
        lower_threshold: parse_optional_f64("lower-threshold", &args.lower_threshold)?,
        upper_bound: parse_optional_f64("upper-bound", &args.upper_bound)?,
        upper_threshold: parse_optional_f64("upper-threshold", &args.upper_threshold)?,
        if_all_invalid_use: parse_optional_f64("if-all-invalid-use", &args.if_all_invalid_use)?.unwrap_or(f64::NAN),
    };
    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::BiasAdjustArgs;

    fn global_args() -> GlobalArgs {
        GlobalArgs {
            months: vec![],
            step_size: 0,
            n_iterations: 0,
            n_quantiles: 50,
            p_value_eps: 1e-10,
            max_change_factor: 100.0,
            max_adjustment_factor: 9.0,
            randomization_seed: None,
            n_processes: 1,
            fill_value: 1e20,
            repeat_warnings: false,
            invalid_value_warnings: false,
        }
    }

    fn bias_adjust_args() -> BiasAdjustArgs {
        BiasAdjustArgs {
            variables: vec!["tas".into(), "pr".into()],
            obs_hist: vec![],
            sim_hist: vec![],
            sim_fut: vec![],
            sim_fut_ba: vec![],
            lower_bound: vec!["none".into(), "0".into()],
            lower_threshold: vec!["none".into(), "0.0000001".into()],
            upper_bound: vec![],
            upper_threshold: vec![],
            distribution: vec!["normal".into(), "gamma".into()],
            trend_preservation: vec!["additive".into(), "mixed".into()],
            detrend: vec![],
            adjust_p_values: vec![],
            unconditional_ccs_transfer: vec![],
            trendless_bound_frequency: vec![],
            halfwin_upper_bound_climatology: vec![],
            if_all_invalid_use: vec![],
            global: global_args(),
        }
    }

    #[test]
    fn builds_one_spec_per_variable_with_per_index_fields() {
        let args = bias_adjust_args();
        let specs = variable_specs_from_bias_adjust(&args).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].distribution, Some(Distribution::Normal));
        assert_eq!(specs[1].distribution, Some(Distribution::Gamma));
        assert_eq!(specs[1].lower_bound, Some(0.0));
        assert!(specs[0].lower_bound.is_none());
    }

    #[test]
    fn mismatched_field_length_is_rejected() {
        let mut args = bias_adjust_args();
        args.lower_bound = vec!["none".into()];
        assert!(variable_specs_from_bias_adjust(&args).is_err());
    }

    #[test]
    fn run_config_falls_back_to_all_months_when_unset() {
        let cfg = run_config_from_global(&global_args());
        assert_eq!(cfg.months, (1..=12).collect::<Vec<u8>>());
    }
}
