//! C9: parallel orchestrator. A pool of worker threads iterates over cell
//! indices; a single I/O coordinator thread owns all [`GridStore`] access
//! and replies to workers over per-call reply channels, so the store never
//! sees concurrent reads or writes. Grounded in `bias_adjustment.py`'s
//! `adjust_bias`/`load_or_save_one_location` and
//! `statistical_downscaling.py`'s `downscale`/`load_or_save_one_location`.
//!
//! The source signals coordinator shutdown with an explicit sentinel
//! message on a shared queue. Here, dropping every worker's [`IoHandle`]
//! closes the underlying `mpsc` channel, which the coordinator's `for`
//! loop observes as end-of-stream — the same shutdown semantics without a
//! sentinel value to construct or match on.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::bias_adjust::adjust_bias_one_location;
use crate::downscale::{downscale_one_coarse_cell, DownscaleCell, DownscaleSpec};
use crate::error::{Diagnostics, Error, Result};
use crate::model::{LocationCube, RoleData, RunConfig, Series, VariableSpec};
use crate::store::{CellIndex, CellPayload, GridStore};

/// Abstraction a per-cell job uses to reach the `GridStore`, whether that
/// means sending a message to the I/O coordinator thread (parallel mode) or
/// calling directly into an owned store (the `n_processes <= 1` fast path).
pub trait CellIo {
    fn load(&self, role: &str, cell: &CellIndex, variables: &[String]) -> Result<CellPayload>;
    fn save(&self, role: &str, cell: &CellIndex, variables: &[String], payload: CellPayload) -> Result<()>;
}

enum IoRequest {
    Load { role: String, cell: CellIndex, variables: Vec<String>, reply: Sender<Result<CellPayload>> },
    Save { role: String, cell: CellIndex, variables: Vec<String>, payload: CellPayload, reply: Sender<Result<()>> },
}

/// A worker's handle to the I/O coordinator thread: send a request, block
/// on a fresh per-call reply channel. Cheap to clone (an `mpsc::Sender`
/// clone) once per worker thread.
#[derive(Clone)]
pub struct IoHandle {
    requests: Sender<IoRequest>,
}

impl CellIo for IoHandle {
    fn load(&self, role: &str, cell: &CellIndex, variables: &[String]) -> Result<CellPayload> {
        let (reply, reply_rx) = mpsc::channel();
        self.requests
            .send(IoRequest::Load {
                role: role.to_string(),
                cell: cell.clone(),
                variables: variables.to_vec(),
                reply,
            })
            .map_err(|_| Error::Store("I/O coordinator has shut down".into()))?;
        reply_rx
            .recv()
            .map_err(|_| Error::Store("I/O coordinator dropped the reply channel".into()))?
    }

    fn save(&self, role: &str, cell: &CellIndex, variables: &[String], payload: CellPayload) -> Result<()> {
        let (reply, reply_rx) = mpsc::channel();
        self.requests
            .send(IoRequest::Save {
                role: role.to_string(),
                cell: cell.clone(),
                variables: variables.to_vec(),
                payload,
                reply,
            })
            .map_err(|_| Error::Store("I/O coordinator has shut down".into()))?;
        reply_rx
            .recv()
            .map_err(|_| Error::Store("I/O coordinator dropped the reply channel".into()))?
    }
}

/// Owns `store` and answers [`IoRequest`]s until every [`IoHandle`] sender
/// has been dropped. All writes sync before replying, so a worker observing
/// a successful save knows the cell's output is durable (spec §4.9).
fn run_io_coordinator(mut store: impl GridStore, requests: Receiver<IoRequest>) {
    for request in requests {
        match request {
            IoRequest::Load { role, cell, variables, reply } => {
                let result = store.read_cell(&role, &cell, &variables);
                let _ = reply.send(result);
            }
            IoRequest::Save { role, cell, variables, payload, reply } => {
                let result = store.write_cell(&role, &cell, &variables, &payload).and_then(|()| store.sync());
                let _ = reply.send(result);
            }
        }
    }
}

/// In-process `CellIo` used when `n_processes <= 1`: calls straight into an
/// owned store on the calling thread, with no channel round-trip.
struct DirectIo<S: GridStore> {
    store: RefCell<S>,
}

impl<S: GridStore> CellIo for DirectIo<S> {
    fn load(&self, role: &str, cell: &CellIndex, variables: &[String]) -> Result<CellPayload> {
        self.store.borrow().read_cell(role, cell, variables)
    }

    fn save(&self, role: &str, cell: &CellIndex, variables: &[String], payload: CellPayload) -> Result<()> {
        let mut store = self.store.borrow_mut();
        store.write_cell(role, cell, variables, payload)?;
        store.sync()
    }
}

/// Derives a reproducible per-cell RNG seed from the run's global seed and
/// the cell's own index, so results do not depend on the thread count or
/// scheduling order (spec §5: "the seed [must be] used inside the cell's
/// computation, not as a global state").
fn seed_rng_for_cell(base_seed: Option<u64>, cell: &CellIndex) -> ChaCha8Rng {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    base_seed.unwrap_or(0).hash(&mut hasher);
    cell.hash(&mut hasher);
    ChaCha8Rng::seed_from_u64(hasher.finish())
}

/// Runs `job` once for every cell in `cells`, either in-process
/// (`config.n_processes <= 1`) or across `config.n_processes - 1` worker
/// threads coordinated by a dedicated I/O thread that owns `store` (spec
/// §4.9, §5). `job` receives the cell index, a [`CellIo`] handle, a
/// per-cell seeded RNG, and a [`Diagnostics`] sink to record cell-local
/// warnings into; its `Result` return propagates fatal errors (spec §7).
///
/// Returns the merged [`Diagnostics`] from every cell that ran. If any cell
/// returns a fatal error, that error is returned once all already-dispatched
/// cells have finished (cells not yet started are not run).
pub fn run_parallel<S>(
    store: S,
    cells: Vec<CellIndex>,
    config: &RunConfig,
    job: impl Fn(&CellIndex, &dyn CellIo, &mut ChaCha8Rng, &mut Diagnostics) -> Result<()> + Send + Sync + 'static,
) -> Result<Diagnostics>
where
    S: GridStore + Send + 'static,
{
    let mut diagnostics = Diagnostics::new(config.repeat_warnings);

    if config.n_processes <= 1 {
        let io = DirectIo { store: RefCell::new(store) };
        let mut first_error = None;
        for cell in &cells {
            let mut rng = seed_rng_for_cell(config.randomization_seed, cell);
            let mut cell_diag = Diagnostics::new(config.repeat_warnings);
            match job(cell, &io, &mut rng, &mut cell_diag) {
                Ok(()) => diagnostics.merge(cell_diag),
                Err(e) => {
                    diagnostics.merge(cell_diag);
                    first_error = Some(e);
                    break;
                }
            }
        }
        return match first_error {
            Some(e) => Err(e),
            None => Ok(diagnostics),
        };
    }

    let n_workers = config.n_processes - 1;
    let (io_tx, io_rx) = mpsc::channel::<IoRequest>();
    let io_thread = thread::spawn(move || run_io_coordinator(store, io_rx));

    let work_queue: Arc<Mutex<VecDeque<CellIndex>>> = Arc::new(Mutex::new(cells.into_iter().collect()));
    let job = Arc::new(job);
    let base_seed = config.randomization_seed;
    let repeat_warnings = config.repeat_warnings;

    let mut worker_handles = Vec::with_capacity(n_workers);
    for _ in 0..n_workers {
        let queue = Arc::clone(&work_queue);
        let job = Arc::clone(&job);
        let io = IoHandle { requests: io_tx.clone() };
        worker_handles.push(thread::spawn(move || -> (Diagnostics, Option<Error>) {
            let mut worker_diag = Diagnostics::new(repeat_warnings);
            loop {
                let cell = {
                    let mut q = queue.lock().expect("work queue mutex poisoned");
                    q.pop_front()
                };
                let Some(cell) = cell else { break };
                let mut rng = seed_rng_for_cell(base_seed, &cell);
                let mut cell_diag = Diagnostics::new(repeat_warnings);
                match (*job)(&cell, &io, &mut rng, &mut cell_diag) {
                    Ok(()) => worker_diag.merge(cell_diag),
                    Err(e) => {
                        worker_diag.merge(cell_diag);
                        return (worker_diag, Some(e));
                    }
                }
            }
            (worker_diag, None)
        }));
    }
    drop(io_tx);

    let mut first_error = None;
    for handle in worker_handles {
        let (worker_diag, err) = handle.join().expect("worker thread panicked");
        diagnostics.merge(worker_diag);
        if first_error.is_none() {
            first_error = err;
        }
    }
    io_thread.join().expect("I/O coordinator thread panicked");

    match first_error {
        Some(e) => Err(e),
        None => Ok(diagnostics),
    }
}

/// Assembles C9 with C6: generates the run's rotation matrices once (spec
/// §3 Lifecycle, §5), then for every cell loads `obs_hist`/`sim_hist`/
/// `sim_fut` under `variable_names`, runs [`adjust_bias_one_location`], and
/// saves the adjusted series back under `output_role` — a cell skipped by
/// C6 (missing input data) is simply not saved. Grounded in
/// `bias_adjustment.py`'s `adjust_bias`, which does the same three-role
/// load, per-location adjust, single-role save around its own worker pool.
pub fn run_bias_adjustment<S>(
    store: S,
    cells: Vec<CellIndex>,
    variable_names: Vec<String>,
    specs: Vec<VariableSpec>,
    config: RunConfig,
    output_role: String,
) -> Result<Diagnostics>
where
    S: GridStore + Send + 'static,
{
    let rotation_matrices =
        crate::numerics::generate_rotation_matrices(specs.len(), config.n_iterations, config.randomization_seed);
    let run_config = config.clone();

    run_parallel(store, cells, &run_config, move |cell, io, rng, diagnostics| {
        let location = format!("{cell:?}");
        let obs_hist = io.load("obs_hist", cell, &variable_names)?;
        let sim_hist = io.load("sim_hist", cell, &variable_names)?;
        let sim_fut = io.load("sim_fut", cell, &variable_names)?;
        let sim_fut_axis = sim_fut.role.axis.clone();
        let cube = LocationCube { obs_hist: obs_hist.role, sim_hist: sim_hist.role, sim_fut: sim_fut.role };

        let adjusted =
            adjust_bias_one_location(&cube, &specs, &config, &rotation_matrices, &location, diagnostics, rng)?;
        if let Some(values) = adjusted {
            let variables: Vec<Series> = values.into_iter().map(Series::new).collect();
            let payload = CellPayload { role: RoleData { axis: sim_fut_axis, variables } };
            io.save(&output_role, cell, &variable_names, payload)?;
        }
        Ok(())
    })
}

/// Assembles one coarse cell's C8 inputs: the enclosed fine-resolution
/// observations, the coarse simulation, its bilinear pre-fill onto the fine
/// patch (spec §4.8's `extended_load`/`remapbil`/`xipm1`), and that patch's
/// area weights (`grid::grid_cell_weights`). A concrete backend implements
/// this because only it holds the coarse and fine grids' coordinate axes
/// that the pre-fill needs — the same reason `GridStore` itself does not
/// read real files here (spec §6 Non-goals).
pub trait DownscaleStore {
    /// Every coarse cell index to downscale, in the order they should run.
    fn cell_indices(&self) -> Vec<CellIndex>;

    /// One coarse cell's prepared [`DownscaleCell`] plus its fine patch's
    /// per-point area weights, in the same order as `DownscaleCell`'s
    /// `obs_fine`.
    fn load_cell(&self, cell: &CellIndex) -> Result<(DownscaleCell, Vec<f64>)>;

    /// Writes the downscaled fine-resolution series back for one coarse
    /// cell, one entry per enclosed fine cell, in `obs_fine` order.
    fn save_cell(&mut self, cell: &CellIndex, result: Vec<Series>) -> Result<()>;

    /// Flushes buffered writes. A no-op for stores that write eagerly.
    fn sync(&mut self) -> Result<()> {
        Ok(())
    }
}

enum DownscaleIoRequest {
    Load { cell: CellIndex, reply: Sender<Result<(DownscaleCell, Vec<f64>)>> },
    Save { cell: CellIndex, result: Vec<Series>, reply: Sender<Result<()>> },
}

fn run_downscale_io_coordinator(mut store: impl DownscaleStore, requests: Receiver<DownscaleIoRequest>) {
    for request in requests {
        match request {
            DownscaleIoRequest::Load { cell, reply } => {
                let _ = reply.send(store.load_cell(&cell));
            }
            DownscaleIoRequest::Save { cell, result, reply } => {
                let outcome = store.save_cell(&cell, result).and_then(|()| store.sync());
                let _ = reply.send(outcome);
            }
        }
    }
}

/// Assembles C9 with C8: mirrors [`run_bias_adjustment`]'s shape against a
/// [`DownscaleStore`] instead of a [`GridStore`], since a coarse cell's C8
/// inputs (a fine patch, its bilinearly pre-filled coarse neighborhood, and
/// that patch's area weights) are not the plain three-role `LocationCube`
/// C6 works with. Grounded in `statistical_downscaling.py`'s `downscale`.
pub fn run_downscaling<S>(
    store: S,
    n_fine_per_coarse: usize,
    spec: DownscaleSpec,
    months: Vec<u8>,
    config: RunConfig,
) -> Result<Diagnostics>
where
    S: DownscaleStore + Send + 'static,
{
    let rotation_matrices =
        crate::numerics::generate_rotation_matrices(n_fine_per_coarse, config.n_iterations, config.randomization_seed);
    let cells = store.cell_indices();
    let mut diagnostics = Diagnostics::new(config.repeat_warnings);
    let n_quantiles = config.n_quantiles;

    let job = move |cell: &CellIndex,
                     load: &dyn Fn(&CellIndex) -> Result<(DownscaleCell, Vec<f64>)>,
                     save: &dyn Fn(&CellIndex, Vec<Series>) -> Result<()>,
                     rng: &mut ChaCha8Rng,
                     cell_diag: &mut Diagnostics|
          -> Result<()> {
        let location = format!("{cell:?}");
        let (cell_data, weights) = load(cell)?;
        let adjusted = downscale_one_coarse_cell(
            &cell_data,
            &spec,
            &months,
            &weights,
            &rotation_matrices,
            n_quantiles,
            &location,
            cell_diag,
            rng,
        )?;
        if let Some(values) = adjusted {
            let result: Vec<Series> = values.into_iter().map(Series::new).collect();
            save(cell, result)?;
        }
        Ok(())
    };

    if config.n_processes <= 1 {
        let store = RefCell::new(store);
        let mut first_error = None;
        for cell in &cells {
            let mut rng = seed_rng_for_cell(config.randomization_seed, cell);
            let mut cell_diag = Diagnostics::new(config.repeat_warnings);
            let load = |c: &CellIndex| -> Result<(DownscaleCell, Vec<f64>)> { store.borrow().load_cell(c) };
            let save = |c: &CellIndex, result: Vec<Series>| -> Result<()> {
                let mut s = store.borrow_mut();
                s.save_cell(c, result)?;
                s.sync()
            };
            match job(cell, &load, &save, &mut rng, &mut cell_diag) {
                Ok(()) => diagnostics.merge(cell_diag),
                Err(e) => {
                    diagnostics.merge(cell_diag);
                    first_error = Some(e);
                    break;
                }
            }
        }
        return match first_error {
            Some(e) => Err(e),
            None => Ok(diagnostics),
        };
    }

    let n_workers = config.n_processes - 1;
    let (io_tx, io_rx) = mpsc::channel::<DownscaleIoRequest>();
    let io_thread = thread::spawn(move || run_downscale_io_coordinator(store, io_rx));

    let work_queue: Arc<Mutex<VecDeque<CellIndex>>> = Arc::new(Mutex::new(cells.into_iter().collect()));
    let job = Arc::new(job);
    let base_seed = config.randomization_seed;
    let repeat_warnings = config.repeat_warnings;

    let mut worker_handles = Vec::with_capacity(n_workers);
    for _ in 0..n_workers {
        let queue = Arc::clone(&work_queue);
        let job = Arc::clone(&job);
        let requests = io_tx.clone();
        worker_handles.push(thread::spawn(move || -> (Diagnostics, Option<Error>) {
            let load = |cell: &CellIndex| -> Result<(DownscaleCell, Vec<f64>)> {
                let (reply, reply_rx) = mpsc::channel();
                requests
                    .send(DownscaleIoRequest::Load { cell: cell.clone(), reply })
                    .map_err(|_| Error::Store("I/O coordinator has shut down".into()))?;
                reply_rx
                    .recv()
                    .map_err(|_| Error::Store("I/O coordinator dropped the reply channel".into()))?
            };
            let save = |cell: &CellIndex, result: Vec<Series>| -> Result<()> {
                let (reply, reply_rx) = mpsc::channel();
                requests
                    .send(DownscaleIoRequest::Save { cell: cell.clone(), result, reply })
                    .map_err(|_| Error::Store("I/O coordinator has shut down".into()))?;
                reply_rx
                    .recv()
                    .map_err(|_| Error::Store("I/O coordinator dropped the reply channel".into()))?
            };
            let mut worker_diag = Diagnostics::new(repeat_warnings);
            loop {
                let cell = {
                    let mut q = queue.lock().expect("work queue mutex poisoned");
                    q.pop_front()
                };
                let Some(cell) = cell else { break };
                let mut rng = seed_rng_for_cell(base_seed, &cell);
                let mut cell_diag = Diagnostics::new(repeat_warnings);
                match (*job)(&cell, &load, &save, &mut rng, &mut cell_diag) {
                    Ok(()) => worker_diag.merge(cell_diag),
                    Err(e) => {
                        worker_diag.merge(cell_diag);
                        return (worker_diag, Some(e));
                    }
                }
            }
            (worker_diag, None)
        }));
    }
    drop(io_tx);

    let mut first_error = None;
    for handle in worker_handles {
        let (worker_diag, err) = handle.join().expect("worker thread panicked");
        diagnostics.merge(worker_diag);
        if first_error.is_none() {
            first_error = err;
        }
    }
    io_thread.join().expect("I/O coordinator thread panicked");

    match first_error {
        Some(e) => Err(e),
        None => Ok(diagnostics),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Grid, RoleData, Series, TimeAxis};
    use crate::store::MemoryGridStore;

    fn axis(n: usize) -> TimeAxis {
        TimeAxis { year: vec![2000; n], doy: (1..=n as u16).collect(), month: vec![1; n] }
    }

    fn seeded_store(n_cells: usize) -> MemoryGridStore {
        let mut store = MemoryGridStore::new(Grid { axes: vec![] });
        for i in 0..n_cells {
            let payload = CellPayload {
                role: RoleData { axis: axis(3), variables: vec![Series::new(vec![i as f64; 3])] },
            };
            store.insert("obs_hist", vec![i], payload);
        }
        store
    }

    #[test]
    fn in_process_path_runs_every_cell_and_merges_diagnostics() {
        let store = seeded_store(4);
        let cells: Vec<CellIndex> = (0..4).map(|i| vec![i]).collect();
        let config = RunConfig { n_processes: 1, ..Default::default() };
        let diag = run_parallel(store, cells, &config, |cell, io, _rng, diagnostics| {
            let payload = io.load("obs_hist", cell, &["tas".to_string()])?;
            diagnostics.warn(format!("{cell:?}"), "visited");
            io.save("sim_fut", cell, &["tas".to_string()], payload)
        })
        .unwrap();
        assert_eq!(diag.warnings().len(), 4);
    }

    #[test]
    fn parallel_path_visits_every_cell_across_worker_threads() {
        let store = seeded_store(8);
        let cells: Vec<CellIndex> = (0..8).map(|i| vec![i]).collect();
        let config = RunConfig { n_processes: 4, ..Default::default() };
        let diag = run_parallel(store, cells, &config, |cell, io, _rng, diagnostics| {
            let payload = io.load("obs_hist", cell, &["tas".to_string()])?;
            diagnostics.warn(format!("{cell:?}"), "visited");
            io.save("sim_fut", cell, &["tas".to_string()], payload)
        })
        .unwrap();
        assert_eq!(diag.warnings().len(), 8);
    }

    #[test]
    fn fatal_error_from_a_cell_is_propagated() {
        let store = seeded_store(2);
        let cells: Vec<CellIndex> = vec![vec![0], vec![99]];
        let config = RunConfig { n_processes: 1, ..Default::default() };
        let err = run_parallel(store, cells, &config, |cell, io, _rng, _diagnostics| {
            io.load("obs_hist", cell, &["tas".to_string()]).map(|_| ())
        })
        .unwrap_err();
        assert!(matches!(err, Error::Store(_)));
    }

    #[test]
    fn same_seed_and_cell_yield_the_same_rng_stream_regardless_of_worker_count() {
        let a = seed_rng_for_cell(Some(7), &vec![2, 3]);
        let b = seed_rng_for_cell(Some(7), &vec![2, 3]);
        use rand::RngCore;
        let mut a = a;
        let mut b = b;
        assert_eq!(a.next_u64(), b.next_u64());
    }

    fn bias_adjust_specs() -> Vec<VariableSpec> {
        vec![VariableSpec::default()]
    }

    fn single_month_axis(n: usize) -> TimeAxis {
        TimeAxis { year: vec![2000; n], doy: (1..=n as u16).collect(), month: vec![1; n] }
    }

    #[test]
    fn run_bias_adjustment_adjusts_and_saves_every_well_formed_cell() {
        let n = 20;
        let mut store = MemoryGridStore::new(Grid { axes: vec![] });
        for i in 0..2u32 {
            let oh: Vec<f64> = (0..n).map(|v| v as f64 + i as f64).collect();
            let sh = oh.clone();
            let sf: Vec<f64> = (0..n).map(|v| v as f64 + i as f64 + 2.0).collect();
            store.insert(
                "obs_hist",
                vec![i as usize],
                CellPayload { role: RoleData { axis: single_month_axis(n), variables: vec![Series::new(oh)] } },
            );
            store.insert(
                "sim_hist",
                vec![i as usize],
                CellPayload { role: RoleData { axis: single_month_axis(n), variables: vec![Series::new(sh)] } },
            );
            store.insert(
                "sim_fut",
                vec![i as usize],
                CellPayload { role: RoleData { axis: single_month_axis(n), variables: vec![Series::new(sf)] } },
            );
        }
        let cells: Vec<CellIndex> = (0..2).map(|i| vec![i]).collect();
        let config = RunConfig { n_processes: 1, months: vec![1], n_quantiles: 10, ..Default::default() };
        let diag = run_bias_adjustment(
            store,
            cells,
            vec!["tas".to_string()],
            bias_adjust_specs(),
            config,
            "sim_fut_ba".to_string(),
        )
        .unwrap();
        assert!(diag.is_empty());
    }

    #[test]
    fn run_bias_adjustment_skips_a_cell_with_an_entirely_invalid_role_without_failing() {
        let n = 20;
        let mut store = MemoryGridStore::new(Grid { axes: vec![] });
        let values: Vec<f64> = (0..n).map(|v| v as f64).collect();
        for role in ["obs_hist", "sim_fut"] {
            store.insert(
                role,
                vec![0],
                CellPayload {
                    role: RoleData { axis: single_month_axis(n), variables: vec![Series::new(values.clone())] },
                },
            );
        }
        // sim_hist entirely invalid for cell 0, so C6 skips the cell outright.
        store.insert(
            "sim_hist",
            vec![0],
            CellPayload {
                role: RoleData { axis: single_month_axis(n), variables: vec![Series::new(vec![f64::NAN; n])] },
            },
        );
        let config = RunConfig { n_processes: 1, months: vec![1], n_quantiles: 10, ..Default::default() };
        let diag = run_bias_adjustment(
            store,
            vec![vec![0]],
            vec!["tas".to_string()],
            bias_adjust_specs(),
            config,
            "sim_fut_ba".to_string(),
        )
        .unwrap();
        assert_eq!(diag.warnings().len(), 1);
    }

    fn downscale_fixture() -> (DownscaleCell, Vec<f64>) {
        let axis = TimeAxis { year: vec![2000; 5], doy: (1..=5).collect(), month: vec![1; 5] };
        let cell = DownscaleCell {
            fine_axis: axis.clone(),
            coarse_axis: axis,
            obs_fine: vec![
                Series::new(vec![1.0, 2.0, 3.0, 4.0, 5.0]),
                Series::new(vec![2.0, 1.0, 4.0, 3.0, 5.0]),
            ],
            sim_coarse: Series::new(vec![3.0, 3.0, 7.0, 7.0, 10.0]),
            sim_coarse_remapbil: vec![
                Series::new(vec![1.5, 2.5, 3.5, 4.5, 5.5]),
                Series::new(vec![2.5, 1.5, 4.5, 3.5, 5.5]),
            ],
        };
        (cell, vec![0.5, 0.5])
    }

    #[derive(Default)]
    struct MemoryDownscaleStore {
        indices: Vec<CellIndex>,
        cells: std::collections::HashMap<CellIndex, (DownscaleCell, Vec<f64>)>,
    }

    impl MemoryDownscaleStore {
        fn insert(&mut self, cell: CellIndex, data: (DownscaleCell, Vec<f64>)) {
            self.cells.insert(cell.clone(), data);
            self.indices.push(cell);
        }
    }

    impl DownscaleStore for MemoryDownscaleStore {
        fn cell_indices(&self) -> Vec<CellIndex> {
            self.indices.clone()
        }

        fn load_cell(&self, cell: &CellIndex) -> Result<(DownscaleCell, Vec<f64>)> {
            self.cells
                .get(cell)
                .cloned()
                .ok_or_else(|| Error::Store(format!("no such cell: {cell:?}")))
        }

        fn save_cell(&mut self, _cell: &CellIndex, _result: Vec<Series>) -> Result<()> {
            Ok(())
        }
    }

    fn downscale_spec() -> DownscaleSpec {
        DownscaleSpec {
            lower_bound: None,
            lower_threshold: None,
            upper_bound: None,
            upper_threshold: None,
            if_all_invalid_use: f64::NAN,
        }
    }

    #[test]
    fn run_downscaling_in_process_path_visits_every_cell() {
        let mut store = MemoryDownscaleStore::default();
        for i in 0..2 {
            store.insert(vec![i], downscale_fixture());
        }
        let config = RunConfig { n_processes: 1, n_quantiles: 20, ..Default::default() };
        let diag = run_downscaling(store, 2, downscale_spec(), vec![1], config).unwrap();
        assert!(diag.is_empty());
    }

    #[test]
    fn run_downscaling_parallel_path_visits_every_cell_across_worker_threads() {
        let mut store = MemoryDownscaleStore::default();
        for i in 0..4 {
            store.insert(vec![i], downscale_fixture());
        }
        let config = RunConfig { n_processes: 3, n_quantiles: 20, ..Default::default() };
        let diag = run_downscaling(store, 2, downscale_spec(), vec![1], config).unwrap();
        assert!(diag.is_empty());
    }

    #[test]
    fn run_downscaling_propagates_a_fatal_error_from_a_missing_cell() {
        let mut store = MemoryDownscaleStore::default();
        store.insert(vec![0], downscale_fixture());
        store.indices.push(vec![99]); // listed but never inserted
        let config = RunConfig { n_processes: 1, n_quantiles: 20, ..Default::default() };
        let err = run_downscaling(store, 2, downscale_spec(), vec![1], config).unwrap_err();
        assert!(matches!(err, Error::Store(_)));
    }
}
