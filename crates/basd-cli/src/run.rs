//! Executes the two subcommands by translating parsed arguments into
//! `basd_core` configuration, validating them, and handing the run off to
//! the engine.
//!
//! Reading and writing the self-describing gridded-array file format the
//! source operates on is an external collaborator this crate does not
//! provide (spec §1, §6 Non-goals): `basd_core::GridStore` is the trait a
//! concrete backend implements, but no file-backed implementation ships
//! here, only the in-memory one `basd_core` itself uses for its tests.
//! [`open_store`] is the single seam such a backend plugs into; until one is
//! linked in, both subcommands fail fast naming that gap rather than
//! silently producing incorrect output.

use std::path::Path;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use basd_core::MemoryGridStore;

use crate::args::{BiasAdjustArgs, Command, DownscaleArgs, Opts};
use crate::config::{downscale_spec_from_args, run_config_from_global, variable_specs_from_bias_adjust};

pub fn run(opts: Opts) -> Result<ExitCode> {
    match opts.command {
        Command::BiasAdjust(args) => run_bias_adjust(args),
        Command::Downscale(args) => run_downscale(args),
    }
}

/// The seam a concrete gridded-file backend fills in. `paths` are logged so
/// a future implementation has the list of files it would need to open.
fn open_store(paths: &[&Path]) -> Result<MemoryGridStore> {
    tracing::debug!(?paths, "no file-backed GridStore is linked into this binary");
    bail!(
        "no GridStore backend is linked into this binary; basd-core's engine runs against any \
         type implementing the GridStore trait, but reading and writing the underlying \
         gridded-array file format is an external collaborator this crate does not provide \
         (implement GridStore for your format, e.g. NetCDF, and drive basd_core::run_bias_adjustment \
         or, for downscaling, implement DownscaleStore and drive basd_core::run_downscaling)"
    );
}

fn run_bias_adjust(args: BiasAdjustArgs) -> Result<ExitCode> {
    let config = run_config_from_global(&args.global);
    config.validate().context("invalid configuration")?;
    let specs = variable_specs_from_bias_adjust(&args)?;
    tracing::info!(
        variables = ?args.variables,
        n_variables = specs.len(),
        n_processes = config.n_processes,
        "bias-adjust configuration validated"
    );

    let paths: Vec<&Path> = args
        .obs_hist
        .iter()
        .chain(&args.sim_hist)
        .chain(&args.sim_fut)
        .chain(&args.sim_fut_ba)
        .map(|p| p.as_path())
        .collect();
    let _store = open_store(&paths)?;
    Ok(ExitCode::SUCCESS)
}

fn run_downscale(args: DownscaleArgs) -> Result<ExitCode> {
    let config = run_config_from_global(&args.global);
    config.validate().context("invalid configuration")?;
    let spec = downscale_spec_from_args(&args)?;
    tracing::info!(
        variable = %args.variable,
        n_processes = config.n_processes,
        ?spec,
        "downscale configuration validated"
    );

    let paths = [args.obs_fine.as_path(), args.sim_coarse.as_path(), args.sim_fine.as_path()];
    let _store = open_store(&paths)?;
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::GlobalArgs;

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

    #[test]
    fn bias_adjust_fails_fast_with_no_store_backend_linked_in() {
        let args = BiasAdjustArgs {
            variables: vec!["tas".into()],
            obs_hist: vec!["obs.nc".into()],
            sim_hist: vec!["sim_hist.nc".into()],
            sim_fut: vec!["sim_fut.nc".into()],
            sim_fut_ba: vec!["sim_fut_ba.nc".into()],
            lower_bound: vec![],
            lower_threshold: vec![],
            upper_bound: vec![],
            upper_threshold: vec![],
            distribution: vec![],
            trend_preservation: vec![],
            detrend: vec![],
            adjust_p_values: vec![],
            unconditional_ccs_transfer: vec![],
            trendless_bound_frequency: vec![],
            halfwin_upper_bound_climatology: vec![],
            if_all_invalid_use: vec![],
            global: global_args(),
        };
        let err = run_bias_adjust(args).unwrap_err();
        assert!(err.to_string().contains("GridStore"));
    }

    #[test]
    fn bias_adjust_rejects_an_invalid_config_before_touching_the_store() {
        let mut global = global_args();
        global.step_size = 4; // even, rejected by RunConfig::validate
        let args = BiasAdjustArgs {
            variables: vec!["tas".into()],
            obs_hist: vec![],
            sim_hist: vec![],
            sim_fut: vec![],
            sim_fut_ba: vec![],
            lower_bound: vec![],
            lower_threshold: vec![],
            upper_bound: vec![],
            upper_threshold: vec![],
            distribution: vec![],
            trend_preservation: vec![],
            detrend: vec![],
            adjust_p_values: vec![],
            unconditional_ccs_transfer: vec![],
            trendless_bound_frequency: vec![],
            halfwin_upper_bound_climatology: vec![],
            if_all_invalid_use: vec![],
            global,
        };
        let err = run_bias_adjust(args).unwrap_err();
        assert!(err.to_string().contains("invalid configuration"));
    }

    #[test]
    fn downscale_fails_fast_with_no_store_backend_linked_in() {
        let args = DownscaleArgs {
            variable: "tas".into(),
            obs_fine: "obs_fine.nc".into(),
            sim_coarse: "sim_coarse.nc".into(),
            sim_fine: "sim_fine.nc".into(),
            lower_bound: "none".into(),
            lower_threshold: "none".into(),
            upper_bound: "none".into(),
            upper_threshold: "none".into(),
            if_all_invalid_use: "none".into(),
            global: global_args(),
        };
        let err = run_downscale(args).unwrap_err();
        assert!(err.to_string().contains("GridStore"));
    }
}
