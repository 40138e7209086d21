//! Command-line surface (spec §6): argument parsing only. Translation into
//! `basd_core::{RunConfig, VariableSpec}` lives in [`crate::config`].

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "basd", version, about = "Bias adjustment and statistical downscaling for gridded climate time series")]
pub struct Opts {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Trend-preserving quantile mapping of a simulation onto an observational record.
    BiasAdjust(BiasAdjustArgs),
    /// Weighted-sum-preserving spread of a coarse simulation over a fine observational grid.
    Downscale(DownscaleArgs),
}

/// Per-variable fields are comma-separated lists, one entry per variable in
/// `--variables`, mirroring the source's `optparse` flag set (spec §6,
/// "CLI plumbing kept as a thin, non-authoritative mirror").
#[derive(Parser, Debug)]
pub struct BiasAdjustArgs {
    /// Comma-separated variable names, in the order every other per-variable flag follows.
    #[arg(long, value_delimiter = ',')]
    pub variables: Vec<String>,

    /// Comma-separated input paths, one per variable, for the observed historical period.
    #[arg(long = "obs-hist", value_delimiter = ',')]
    pub obs_hist: Vec<PathBuf>,
    /// Comma-separated input paths, one per variable, for the simulated historical period.
    #[arg(long = "sim-hist", value_delimiter = ',')]
    pub sim_hist: Vec<PathBuf>,
    /// Comma-separated input paths, one per variable, for the simulated future period.
    #[arg(long = "sim-fut", value_delimiter = ',')]
    pub sim_fut: Vec<PathBuf>,
    /// Comma-separated output paths, one per variable, for the bias-adjusted future period.
    #[arg(long = "sim-fut-ba", value_delimiter = ',')]
    pub sim_fut_ba: Vec<PathBuf>,

    /// Comma-separated lower bounds, one per variable ("none" for unset).
    #[arg(long = "lower-bound", value_delimiter = ',')]
    pub lower_bound: Vec<String>,
    /// Comma-separated lower thresholds, one per variable ("none" for unset).
    #[arg(long = "lower-threshold", value_delimiter = ',')]
    pub lower_threshold: Vec<String>,
    /// Comma-separated upper bounds, one per variable ("none" for unset).
    #[arg(long = "upper-bound", value_delimiter = ',')]
    pub upper_bound: Vec<String>,
    /// Comma-separated upper thresholds, one per variable ("none" for unset).
    #[arg(long = "upper-threshold", value_delimiter = ',')]
    pub upper_threshold: Vec<String>,
    /// Comma-separated distribution families, one per variable: none|normal|weibull|gamma|beta|rice.
    #[arg(long, value_delimiter = ',')]
    pub distribution: Vec<String>,
    /// Comma-separated trend-preservation modes, one per variable: additive|multiplicative|mixed|bounded.
    #[arg(long = "trend-preservation", value_delimiter = ',')]
    pub trend_preservation: Vec<String>,
    /// Comma-separated booleans, one per variable: detrend before adjustment.
    #[arg(long, value_delimiter = ',')]
    pub detrend: Vec<bool>,
    /// Comma-separated booleans, one per variable: adjust p-values during parametric QM.
    #[arg(long = "adjust-p-values", value_delimiter = ',')]
    pub adjust_p_values: Vec<bool>,
    /// Comma-separated booleans, one per variable: transfer the climate-change signal unconditionally.
    #[arg(long = "unconditional-ccs-transfer", value_delimiter = ',')]
    pub unconditional_ccs_transfer: Vec<bool>,
    /// Comma-separated booleans, one per variable: keep bound-frequency trendless.
    #[arg(long = "trendless-bound-frequency", value_delimiter = ',')]
    pub trendless_bound_frequency: Vec<bool>,
    /// Comma-separated half-window widths, one per variable, for the upper-bound climatology (0 disables it).
    #[arg(long = "halfwin-upper-bound-climatology", value_delimiter = ',')]
    pub halfwin_upper_bound_climatology: Vec<usize>,
    /// Comma-separated fallback values, one per variable, substituted for an entirely-invalid series.
    #[arg(long = "if-all-invalid-use", value_delimiter = ',')]
    pub if_all_invalid_use: Vec<String>,

    #[command(flatten)]
    pub global: GlobalArgs,
}

#[derive(Parser, Debug)]
pub struct DownscaleArgs {
    /// The single variable being downscaled.
    #[arg(long)]
    pub variable: String,

    /// Fine-resolution observational input path.
    #[arg(long = "obs-fine")]
    pub obs_fine: PathBuf,
    /// Coarse-resolution simulation input path.
    #[arg(long = "sim-coarse")]
    pub sim_coarse: PathBuf,
    /// Fine-resolution simulation output path.
    #[arg(long = "sim-fine")]
    pub sim_fine: PathBuf,

    /// Lower bound ("none" for unset).
    #[arg(long = "lower-bound", default_value = "none")]
    pub lower_bound: String,
    /// Lower threshold ("none" for unset).
    #[arg(long = "lower-threshold", default_value = "none")]
    pub lower_threshold: String,
    /// Upper bound ("none" for unset).
    #[arg(long = "upper-bound", default_value = "none")]
    pub upper_bound: String,
    /// Upper threshold ("none" for unset).
    #[arg(long = "upper-threshold", default_value = "none")]
    pub upper_threshold: String,
    /// Fallback value substituted for an entirely-invalid series ("none" for unset).
    #[arg(long = "if-all-invalid-use", default_value = "none")]
    pub if_all_invalid_use: String,

    #[command(flatten)]
    pub global: GlobalArgs,
}

#[derive(Parser, Debug)]
pub struct GlobalArgs {
    /// Calendar months to process (default: all twelve). Mutually exclusive with `--step-size`.
    #[arg(long, value_delimiter = ',')]
    pub months: Vec<u8>,
    /// Odd running-window width in days; 0 (the default) selects calendar-month mode instead.
    #[arg(long = "step-size", default_value_t = 0)]
    pub step_size: u32,
    /// Number of MBCn copula-adjustment iterations; 0 disables the copula step.
    #[arg(long = "n-iterations", default_value_t = 0)]
    pub n_iterations: usize,
    /// Number of quantiles used by the empirical CDF/inverse-CDF steps.
    #[arg(long = "n-quantiles", default_value_t = 50)]
    pub n_quantiles: usize,
    /// Lower clamp applied to every fitted-distribution CDF/PPF output.
    #[arg(long = "p-value-eps", default_value_t = 1e-10)]
    pub p_value_eps: f64,
    /// Cap on the multiplicative change factor used in CCS transfer.
    #[arg(long = "max-change-factor", default_value_t = 100.0)]
    pub max_change_factor: f64,
    /// Cap on the trend-preservation adjustment factor.
    #[arg(long = "max-adjustment-factor", default_value_t = 9.0)]
    pub max_adjustment_factor: f64,
    /// Seed for reproducible randomization and rotation-matrix generation; unset draws from system entropy.
    #[arg(long = "randomization-seed")]
    pub randomization_seed: Option<u64>,
    /// Worker processes: 1 runs the in-process fast path, N>1 spawns N-1 worker threads plus an I/O coordinator.
    #[arg(long = "n-processes", default_value_t = 1)]
    pub n_processes: usize,
    /// Fill value written to an output file's data variable before per-cell results overwrite it.
    #[arg(long = "fill-value", default_value_t = 1e20)]
    pub fill_value: f64,
    /// Emit duplicate cell-local warnings instead of deduplicating them.
    #[arg(long = "repeat-warnings", default_value_t = false)]
    pub repeat_warnings: bool,
    /// Log every invalid-value substitution, not just a per-cell summary.
    #[arg(long = "invalid-value-warnings", default_value_t = false)]
    pub invalid_value_warnings: bool,
}
