//! Seeded region growing: assign every masked pixel the label of the
//! nearest seed under a combined intensity/distance metric.
//!
//! Distances are cumulative along a path. The cost of one step between
//! neighboring pixels `p` and `q` is
//!
//! ```text
//! sqrt(height_diff(p, q)^2 + (manhattan(p, q) * weight)^2)
//! ```
//!
//! where `height_diff` sums the absolute intensity differences of the two
//! 3x3 neighborhoods centered on `p` and `q` (edge pixels are clamped), so a
//! single noisy pixel cannot open or close a path on its own. `weight`
//! trades spatial distance against intensity: large values favor x/y
//! distance, small values favor intensity.
//!
//! # Algorithm
//!
//! Multi-source Dijkstra. Every labeled, masked pixel enters a min-heap at
//! distance 0. Heap entries are ordered by `(distance, label, row, col)`
//! using [`f64::total_cmp`], so among equal-cost arrivals the lower label
//! wins regardless of insertion order. The first pop of a pixel finalizes
//! it; later pops of the same pixel are skipped.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use crate::grid::Grid;

/// Neighborhood used when expanding a pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Connectivity {
    /// Horizontal and vertical neighbors only.
    Four,
    /// Horizontal, vertical and diagonal neighbors.
    #[default]
    Eight,
}

impl Connectivity {
    const FOUR: [(isize, isize); 4] = [(-1, 0), (0, -1), (0, 1), (1, 0)];
    const EIGHT: [(isize, isize); 8] = [
        (-1, -1),
        (-1, 0),
        (-1, 1),
        (0, -1),
        (0, 1),
        (1, -1),
        (1, 0),
        (1, 1),
    ];

    const fn offsets(self) -> &'static [(isize, isize)] {
        match self {
            Self::Four => &Self::FOUR,
            Self::Eight => &Self::EIGHT,
        }
    }
}

/// Output of [`propagate`].
#[derive(Debug, Clone, PartialEq)]
pub struct Propagation {
    /// Label of the nearest seed for every reached pixel, 0 elsewhere.
    pub labels: Grid<u32>,
    /// Accumulated path cost, or -1 for pixels outside the mask or never
    /// reached.
    pub distances: Grid<f64>,
}

/// Invalid input to [`propagate`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PropagateError {
    /// `labels` or `mask` does not have the shape of `image`.
    #[error("{what} shape {actual:?} does not match image shape {expected:?}")]
    ShapeMismatch {
        /// Which input is mismatched (`"labels"` or `"mask"`).
        what: &'static str,
        /// Shape of the intensity image.
        expected: (usize, usize),
        /// Shape of the offending input.
        actual: (usize, usize),
    },

    /// The weight or an intensity value is NaN or infinite.
    #[error("non-finite {what} at {location:?}")]
    NonFiniteInput {
        /// `"weight"` or `"image"`.
        what: &'static str,
        /// Pixel coordinates for image values, `None` for the weight.
        location: Option<(usize, usize)>,
    },

    /// A path cost overflowed to infinity.
    #[error("non-finite path cost reaching pixel ({row}, {col})")]
    NonFiniteCost {
        /// Row of the pixel being reached.
        row: usize,
        /// Column of the pixel being reached.
        col: usize,
    },
}

/// Heap entry, ordered by `(distance, label, row, col)`.
#[derive(Debug, Clone, Copy)]
struct Entry {
    distance: f64,
    label: u32,
    row: usize,
    col: usize,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then(self.label.cmp(&other.label))
            .then(self.row.cmp(&other.row))
            .then(self.col.cmp(&other.col))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

/// Propagate `labels` across `image` within `mask` using 8-connectivity.
///
/// # Errors
///
/// Returns [`PropagateError::ShapeMismatch`] if the three grids differ in
/// shape, [`PropagateError::NonFiniteInput`] for a NaN/infinite weight or
/// intensity, and [`PropagateError::NonFiniteCost`] if an accumulated cost
/// overflows.
pub fn propagate(
    image: &Grid<f64>,
    labels: &Grid<u32>,
    mask: &Grid<bool>,
    weight: f64,
) -> Result<Propagation, PropagateError> {
    propagate_with(image, labels, mask, weight, Connectivity::Eight)
}

/// [`propagate`] with an explicit neighborhood.
///
/// # Errors
///
/// See [`propagate`].
pub fn propagate_with(
    image: &Grid<f64>,
    labels: &Grid<u32>,
    mask: &Grid<bool>,
    weight: f64,
    connectivity: Connectivity,
) -> Result<Propagation, PropagateError> {
    validate(image, labels, mask, weight)?;

    let (rows, cols) = image.shape();
    let mut labels_out = Grid::new(rows, cols, 0u32);
    let mut distances = Grid::new(rows, cols, -1.0f64);
    let mut heap = BinaryHeap::new();

    for ((row, col), &label) in labels.indexed_iter() {
        if label != 0 && mask[(row, col)] {
            heap.push(Reverse(Entry {
                distance: 0.0,
                label,
                row,
                col,
            }));
        }
    }

    while let Some(Reverse(entry)) = heap.pop() {
        let here = (entry.row, entry.col);
        if distances[here] >= 0.0 {
            continue;
        }
        distances[here] = entry.distance;
        labels_out[here] = entry.label;

        for &(dr, dc) in connectivity.offsets() {
            let (Some(row), Some(col)) = (
                entry.row.checked_add_signed(dr),
                entry.col.checked_add_signed(dc),
            ) else {
                continue;
            };
            if row >= rows || col >= cols || !mask[(row, col)] || distances[(row, col)] >= 0.0 {
                continue;
            }
            let manhattan = (dr.unsigned_abs() + dc.unsigned_abs()) as f64;
            let height = height_diff(image, here, (row, col));
            let distance = entry.distance + height.hypot(manhattan * weight);
            if !distance.is_finite() {
                return Err(PropagateError::NonFiniteCost { row, col });
            }
            heap.push(Reverse(Entry {
                distance,
                label: entry.label,
                row,
                col,
            }));
        }
    }

    Ok(Propagation {
        labels: labels_out,
        distances,
    })
}

fn validate(
    image: &Grid<f64>,
    labels: &Grid<u32>,
    mask: &Grid<bool>,
    weight: f64,
) -> Result<(), PropagateError> {
    let expected = image.shape();
    if labels.shape() != expected {
        return Err(PropagateError::ShapeMismatch {
            what: "labels",
            expected,
            actual: labels.shape(),
        });
    }
    if mask.shape() != expected {
        return Err(PropagateError::ShapeMismatch {
            what: "mask",
            expected,
            actual: mask.shape(),
        });
    }
    if !weight.is_finite() {
        return Err(PropagateError::NonFiniteInput {
            what: "weight",
            location: None,
        });
    }
    if let Some((location, _)) = image.indexed_iter().find(|(_, v)| !v.is_finite()) {
        return Err(PropagateError::NonFiniteInput {
            what: "image",
            location: Some(location),
        });
    }
    Ok(())
}

/// Sum of absolute differences between the clamped 3x3 neighborhoods
/// centered on `a` and `b`.
fn height_diff(image: &Grid<f64>, a: (usize, usize), b: (usize, usize)) -> f64 {
    let (rows, cols) = image.shape();
    let fetch = |(row, col): (usize, usize), dr: isize, dc: isize| {
        let r = row.saturating_add_signed(dr).min(rows - 1);
        let c = col.saturating_add_signed(dc).min(cols - 1);
        image[(r, c)]
    };
    let mut total = 0.0;
    for dr in -1..=1 {
        for dc in -1..=1 {
            total += (fetch(a, dr, dc) - fetch(b, dr, dc)).abs();
        }
    }
    total
}
