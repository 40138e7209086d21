//! `GridStore`: the external collaborator spec §6 names for reading and
//! writing gridded time series. Real NetCDF I/O is out of scope (spec
//! Non-goals); this module carries the trait plus an in-memory reference
//! implementation used by tests and by the CLI's dry-run path.

use crate::error::{Error, Result};
use crate::model::{Grid, RoleData};

/// Index of a single spatial cell, one entry per `Grid` axis, in axis order.
pub type CellIndex = Vec<usize>;

/// A named variable's data for one role, as read from or written to a
/// `GridStore`.
#[derive(Debug, Clone)]
pub struct CellPayload {
    pub role: RoleData,
}

/// Abstraction over a gridded-dataset backend. Implementations own the
/// concrete file format; the engine only calls this trait.
pub trait GridStore {
    /// The spatial grid shared by all roles and variables in this store.
    fn grid(&self) -> &Grid;

    /// Reads one role's full time series for one cell, across all of that
    /// role's configured variables, in the order `variable_names` lists.
    fn read_cell(
        &self,
        role: &str,
        cell: &CellIndex,
        variable_names: &[String],
    ) -> Result<CellPayload>;

    /// Writes an adjusted/downscaled result back for one cell.
    fn write_cell(
        &mut self,
        role: &str,
        cell: &CellIndex,
        variable_names: &[String],
        data: &CellPayload,
    ) -> Result<()>;

    /// Flushes buffered writes. A no-op for stores that write eagerly.
    fn sync(&mut self) -> Result<()> {
        Ok(())
    }

    /// Enumerates every cell index in the store's spatial domain, in a
    /// deterministic row-major order over `grid().axes`.
    fn cell_indices(&self) -> Vec<CellIndex> {
        let shape = self.grid().space_shape();
        let mut out = vec![Vec::new()];
        for &len in &shape {
            let mut next = Vec::with_capacity(out.len() * len.max(1));
            for idx in &out {
                for i in 0..len {
                    let mut v = idx.clone();
                    v.push(i);
                    next.push(v);
                }
            }
            out = next;
        }
        out
    }
}

/// In-memory `GridStore` keyed by `(role, cell)`, used by tests and by the
/// in-process synchronous orchestration path (spec §5, `n_processes <= 1`).
#[derive(Debug, Default)]
pub struct MemoryGridStore {
    grid: Grid,
    cells: std::collections::HashMap<(String, CellIndex), CellPayload>,
}

impl MemoryGridStore {
    pub fn new(grid: Grid) -> Self {
        Self { grid, cells: Default::default() }
    }

    pub fn insert(&mut self, role: impl Into<String>, cell: CellIndex, payload: CellPayload) {
        self.cells.insert((role.into(), cell), payload);
    }
}

impl GridStore for MemoryGridStore {
    fn grid(&self) -> &Grid {
        &self.grid
    }

    fn read_cell(
        &self,
        role: &str,
        cell: &CellIndex,
        _variable_names: &[String],
    ) -> Result<CellPayload> {
        self.cells
            .get(&(role.to_string(), cell.clone()))
            .cloned()
            .ok_or_else(|| Error::Store(format!("no data for role {role} at cell {cell:?}")))
    }

    fn write_cell(
        &mut self,
        role: &str,
        cell: &CellIndex,
        _variable_names: &[String],
        data: &CellPayload,
    ) -> Result<()> {
        self.cells.insert((role.to_string(), cell.clone()), data.clone());
        Ok(())
    }
}
