//! Bias-adjustment and statistical-downscaling engine for gridded climate
//! time series.
//!
//! The engine operates one spatial cell at a time: [`bias_adjust`] maps a
//! simulation onto the statistical properties of an observational record
//! (trend-preserving quantile mapping, optional multivariate copula
//! correction), and [`downscale`] spreads a coarse-resolution simulation
//! over a fine observational grid while preserving an area-weighted sum.
//! [`orchestrate`] fans either pipeline out across a `GridStore` and a pool
//! of worker threads.

pub mod bias_adjust;
pub mod climatology;
pub mod copula;
pub mod downscale;
pub mod error;
pub mod model;
pub mod numerics;
pub mod orchestrate;
pub mod qm;
pub mod randomize;
pub mod store;

pub use bias_adjust::adjust_bias_one_location;
pub use climatology::{
    ccs_transfer_sim2obs_upper_bound_climatology, scale_by_upper_bound_climatology,
    upper_bound_climatology, window_centers, window_indices,
};
pub use copula::adjust_copula_mbcn;
pub use downscale::{
    downscale_one_coarse_cell, grid, weighted_sum_preserving_mbcn, DownscaleCell, DownscaleSpec,
};
pub use error::{Diagnostics, Error, Result, Warning};
pub use model::{
    month_from_year_doy, Axis, Grid, LocationCube, RoleData, RunConfig, Series, TimeAxis,
    TrendPreservation, UpperBoundClimatology, VariableSpec,
};
pub use numerics::{
    add_trend, ccs_transfer_sim2obs, cre_matrix, fixed_first_axis, generate_rotation_matrices,
    linregress, percentile1d, subtract_trend, Distribution, FittedParams,
};
pub use orchestrate::{run_bias_adjustment, run_downscaling, run_parallel, CellIo, DownscaleStore, IoHandle};
pub use qm::{
    map_quantiles_non_parametric_brute_force, map_quantiles_non_parametric_trend_preserving,
    map_quantiles_non_parametric_with_constant_extrapolation, map_quantiles_parametric_trend_preserving,
};
pub use randomize::{average_valid_values, randomize_censored, sample_invalid, CensorBounds};
pub use store::{CellIndex, CellPayload, GridStore, MemoryGridStore};
