//! Core data types shared by the scan orchestrator, the raster map and the
//! hardware collaborators.
//!
//! All physical coordinates are expressed in micrometres. `x` runs along the
//! columns of a raster map and `y` along its rows.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Mul, Sub, SubAssign};

// =============================================================================
// Vector2
// =============================================================================

/// Physical 2-vector in micrometres.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Vector2 {
    /// Horizontal component (map columns)
    pub x: f64,
    /// Vertical component (map rows)
    pub y: f64,
}

impl Vector2 {
    /// The origin.
    pub const ZERO: Vector2 = Vector2 { x: 0.0, y: 0.0 };

    /// Creates a vector from its components.
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Creates a vector with both components set to `v`.
    pub const fn splat(v: f64) -> Self {
        Self { x: v, y: v }
    }

    /// Euclidean length.
    pub fn norm(&self) -> f64 {
        self.x.hypot(self.y)
    }

    /// Euclidean distance to `other`.
    pub fn distance(&self, other: Vector2) -> f64 {
        (*self - other).norm()
    }

    /// True if both components are finite.
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

impl Add for Vector2 {
    type Output = Vector2;
    fn add(self, rhs: Vector2) -> Vector2 {
        Vector2::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl AddAssign for Vector2 {
    fn add_assign(&mut self, rhs: Vector2) {
        self.x += rhs.x;
        self.y += rhs.y;
    }
}

impl Sub for Vector2 {
    type Output = Vector2;
    fn sub(self, rhs: Vector2) -> Vector2 {
        Vector2::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl SubAssign for Vector2 {
    fn sub_assign(&mut self, rhs: Vector2) {
        self.x -= rhs.x;
        self.y -= rhs.y;
    }
}

impl Mul<f64> for Vector2 {
    type Output = Vector2;
    fn mul(self, rhs: f64) -> Vector2 {
        Vector2::new(self.x * rhs, self.y * rhs)
    }
}

impl fmt::Display for Vector2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.3}, {:.3}) um", self.x, self.y)
    }
}

impl From<(f64, f64)> for Vector2 {
    fn from((x, y): (f64, f64)) -> Self {
        Self { x, y }
    }
}

// =============================================================================
// Grid addressing
// =============================================================================

/// Dimensions of a raster map.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridShape {
    /// Number of rows (y direction)
    pub rows: usize,
    /// Number of columns (x direction)
    pub cols: usize,
}

impl GridShape {
    /// Creates a shape.
    pub const fn new(rows: usize, cols: usize) -> Self {
        Self { rows, cols }
    }

    /// Square shape of `n × n` cells.
    pub const fn square(n: usize) -> Self {
        Self { rows: n, cols: n }
    }

    /// Total number of cells, saturating at `usize::MAX`.
    pub const fn len(&self) -> usize {
        self.rows.saturating_mul(self.cols)
    }

    /// Total number of cells, or `None` if it does not fit in a `usize`.
    pub const fn checked_len(&self) -> Option<usize> {
        self.rows.checked_mul(self.cols)
    }

    /// True if the shape has no cells.
    pub const fn is_empty(&self) -> bool {
        self.rows == 0 || self.cols == 0
    }

    /// Row-major index of `cell`, or `None` if it lies outside the grid.
    pub fn index(&self, cell: Cell) -> Option<usize> {
        (cell.row < self.rows && cell.col < self.cols).then(|| cell.row * self.cols + cell.col)
    }
}

impl fmt::Display for GridShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.rows, self.cols)
    }
}

/// Address of a single grid cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cell {
    /// Row index
    pub row: usize,
    /// Column index
    pub col: usize,
}

impl Cell {
    /// Creates a cell address.
    pub const fn new(row: usize, col: usize) -> Self {
        Self { row, col }
    }

    /// True if `other` shares an edge with this cell.
    pub fn is_adjacent(&self, other: Cell) -> bool {
        self.row.abs_diff(other.row) + self.col.abs_diff(other.col) == 1
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.row, self.col)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_arithmetic() {
        let a = Vector2::new(1.0, 2.0);
        let b = Vector2::new(0.5, -1.0);
        assert_eq!(a + b, Vector2::new(1.5, 1.0));
        assert_eq!(a - b, Vector2::new(0.5, 3.0));
        assert_eq!(a * 2.0, Vector2::new(2.0, 4.0));
        assert!((Vector2::new(3.0, 4.0).norm() - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_grid_index_rejects_out_of_range() {
        let shape = GridShape::new(2, 3);
        assert_eq!(shape.index(Cell::new(1, 2)), Some(5));
        assert_eq!(shape.index(Cell::new(2, 0)), None);
        assert_eq!(shape.index(Cell::new(0, 3)), None);
    }

    #[test]
    fn test_adjacency_is_edge_sharing() {
        let c = Cell::new(1, 1);
        assert!(c.is_adjacent(Cell::new(1, 2)));
        assert!(c.is_adjacent(Cell::new(0, 1)));
        assert!(!c.is_adjacent(Cell::new(2, 2)));
        assert!(!c.is_adjacent(c));
    }
}
