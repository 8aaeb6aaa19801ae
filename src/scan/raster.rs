//! Raster map: a grid of rate samples over a physical area, and the
//! boustrophedon cursor used to fill it.

use crate::core::{Cell, GridShape, Vector2};
use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};

/// Grid of rate samples (kHz) laid over a physical area (µm).
///
/// Cell `(row, col)` sits at
/// `centre - 0.5 * (shape - 1) * step + (col, row) * step`, so column index
/// maps to `x` and row index to `y`. Data is stored row-major.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RasterMap {
    shape: GridShape,
    step: Vector2,
    centre: Vector2,
    data: Vec<f64>,
}

/// Largest number of cells a single map may hold.
pub const MAX_CELLS: usize = 1 << 24;

impl RasterMap {
    /// Creates a zero-filled map.
    ///
    /// # Errors
    /// Returns [`DaqError::InvalidMap`] for an empty shape, a shape with more
    /// than [`MAX_CELLS`] cells, or a non-finite step/centre.
    pub fn new(shape: GridShape, step: Vector2, centre: Vector2) -> AppResult<Self> {
        if shape.is_empty() {
            return Err(DaqError::InvalidMap(format!("shape {shape} has no cells")));
        }
        let cells = match shape.checked_len() {
            Some(cells) if cells <= MAX_CELLS => cells,
            _ => {
                return Err(DaqError::InvalidMap(format!(
                    "shape {shape} exceeds {MAX_CELLS} cells"
                )))
            }
        };
        if !step.is_finite() || !centre.is_finite() {
            return Err(DaqError::InvalidMap(format!(
                "step {step} and centre {centre} must be finite"
            )));
        }
        Ok(Self {
            shape,
            step,
            centre,
            data: vec![0.0; cells],
        })
    }

    /// Square map of `size × size` cells with isotropic `step`.
    pub fn square(size: usize, step: f64, centre: Vector2) -> AppResult<Self> {
        Self::new(GridShape::square(size), Vector2::splat(step), centre)
    }

    /// Grid dimensions.
    pub fn shape(&self) -> GridShape {
        self.shape
    }

    /// Spacing between neighbouring cells.
    pub fn step(&self) -> Vector2 {
        self.step
    }

    /// Physical centre of the grid.
    pub fn centre(&self) -> Vector2 {
        self.centre
    }

    /// Row-major samples.
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    /// Coordinate of cell `(0, 0)`.
    pub fn start(&self) -> Vector2 {
        self.centre
            - Vector2::new(
                0.5 * (self.shape.cols as f64 - 1.0) * self.step.x,
                0.5 * (self.shape.rows as f64 - 1.0) * self.step.y,
            )
    }

    /// Coordinate of the last cell.
    pub fn stop(&self) -> Vector2 {
        self.centre
            + Vector2::new(
                0.5 * (self.shape.cols as f64 - 1.0) * self.step.x,
                0.5 * (self.shape.rows as f64 - 1.0) * self.step.y,
            )
    }

    /// Outer edges of the imaged area as `(min, max)` corners, i.e. the cell
    /// centres extended by half a step.
    pub fn extents(&self) -> (Vector2, Vector2) {
        let half = Vector2::new(
            0.5 * self.shape.cols as f64 * self.step.x,
            0.5 * self.shape.rows as f64 * self.step.y,
        );
        (self.centre - half, self.centre + half)
    }

    /// Physical coordinate of `cell`. Cells outside the grid extrapolate.
    pub fn coordinate(&self, cell: Cell) -> Vector2 {
        self.start() + Vector2::new(cell.col as f64 * self.step.x, cell.row as f64 * self.step.y)
    }

    /// Sample at `cell`.
    pub fn get(&self, cell: Cell) -> Option<f64> {
        self.shape.index(cell).map(|i| self.data[i])
    }

    /// Writes `value` at `cell`.
    ///
    /// # Errors
    /// Returns [`DaqError::InvalidMap`] if `cell` is outside the grid.
    pub fn set(&mut self, cell: Cell, value: f64) -> AppResult<()> {
        let index = self
            .shape
            .index(cell)
            .ok_or_else(|| DaqError::InvalidMap(format!("cell {cell} outside {}", self.shape)))?;
        self.data[index] = value;
        Ok(())
    }

    /// Iterates `(cell, coordinate, value)` in row-major order.
    pub fn samples(&self) -> impl Iterator<Item = (Cell, Vector2, f64)> + '_ {
        let cols = self.shape.cols;
        self.data.iter().enumerate().map(move |(i, &value)| {
            let cell = Cell::new(i / cols, i % cols);
            (cell, self.coordinate(cell), value)
        })
    }

    /// Smallest sample.
    pub fn min(&self) -> f64 {
        self.data.iter().copied().fold(f64::INFINITY, f64::min)
    }

    /// Largest sample.
    pub fn max(&self) -> f64 {
        self.data.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }

    /// Mean of all samples.
    pub fn mean(&self) -> f64 {
        self.data.iter().sum::<f64>() / self.data.len() as f64
    }
}

// =============================================================================
// Boustrophedon cursor
// =============================================================================

/// Write position during a scan.
///
/// Starts at `(0, -1)` ("not yet started") and walks even rows left→right and
/// odd rows right→left. The cursor is exhausted once its row index reaches
/// `rows`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScanCursor {
    shape: GridShape,
    row: usize,
    col: isize,
}

impl ScanCursor {
    /// Fresh cursor at the `(0, -1)` sentinel.
    pub fn new(shape: GridShape) -> Self {
        Self { shape, row: 0, col: -1 }
    }

    /// True before the first cell has been reached.
    pub fn is_unstarted(&self) -> bool {
        self.col < 0
    }

    /// True once every cell has been visited.
    pub fn is_complete(&self) -> bool {
        self.row >= self.shape.rows
    }

    /// Current cell, if the cursor is on the grid.
    pub fn cell(&self) -> Option<Cell> {
        (!self.is_unstarted() && !self.is_complete()).then(|| Cell::new(self.row, self.col as usize))
    }

    /// Raw `(row, col)` including the `-1` sentinel.
    pub fn position(&self) -> (usize, isize) {
        (self.row, self.col)
    }

    /// Steps to the next cell in serpentine order and returns it, or `None`
    /// when the grid is exhausted.
    pub fn advance(&mut self) -> Option<Cell> {
        if self.is_complete() {
            return None;
        }
        let last_col = self.shape.cols as isize - 1;
        if self.row % 2 == 1 {
            if self.col > 0 {
                self.col -= 1;
            } else {
                self.row += 1;
            }
        } else if self.col < last_col {
            self.col += 1;
        } else {
            self.row += 1;
        }
        self.cell()
    }
}

/// All cells of `shape` in boustrophedon order.
pub fn boustrophedon(shape: GridShape) -> impl Iterator<Item = Cell> {
    let mut cursor = ScanCursor::new(shape);
    std::iter::from_fn(move || cursor.advance())
}
