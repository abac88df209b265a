//! Row-major 2D grids shared by images, masks, label maps and distance maps.
//!
//! A [`Grid`] is indexed by `(row, column)`. Conversions to and from the
//! `image` crate's buffers live here so the rest of the crate never touches
//! pixel layouts directly.

use std::ops::{Index, IndexMut};

use image::{GrayImage, ImageBuffer, Luma};
use serde::{Deserialize, Serialize};

/// A 32-bit label image as produced by `imageproc` connected components.
pub type LabelImage = ImageBuffer<Luma<u32>, Vec<u32>>;

/// Floating-point grayscale buffer (`image::DynamicImage::to_luma32f`).
pub type FloatImage = ImageBuffer<Luma<f32>, Vec<f32>>;

/// A dense row-major 2D array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grid<T> {
    rows: usize,
    cols: usize,
    data: Vec<T>,
}

impl<T: Clone> Grid<T> {
    /// Create a grid with every cell set to `fill`.
    #[must_use]
    pub fn new(rows: usize, cols: usize, fill: T) -> Self {
        Self {
            rows,
            cols,
            data: vec![fill; rows * cols],
        }
    }
}

impl<T> Grid<T> {
    /// Wrap an existing row-major buffer.
    ///
    /// Returns `None` when `data.len() != rows * cols`.
    #[must_use]
    pub fn from_vec(rows: usize, cols: usize, data: Vec<T>) -> Option<Self> {
        (data.len() == rows * cols).then_some(Self { rows, cols, data })
    }

    /// Build a grid by evaluating `f(row, col)` for every cell.
    pub fn from_fn(rows: usize, cols: usize, mut f: impl FnMut(usize, usize) -> T) -> Self {
        let mut data = Vec::with_capacity(rows * cols);
        for row in 0..rows {
            for col in 0..cols {
                data.push(f(row, col));
            }
        }
        Self { rows, cols, data }
    }

    /// Number of rows.
    #[must_use]
    pub const fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns.
    #[must_use]
    pub const fn cols(&self) -> usize {
        self.cols
    }

    /// `(rows, cols)`.
    #[must_use]
    pub const fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Returns `true` if the grid has no cells.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Cell at `(row, col)`, or `None` when out of bounds.
    #[must_use]
    pub fn get(&self, row: usize, col: usize) -> Option<&T> {
        if row < self.rows && col < self.cols {
            self.data.get(row * self.cols + col)
        } else {
            None
        }
    }

    /// The underlying row-major buffer.
    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    /// Consume the grid, returning the row-major buffer.
    #[must_use]
    pub fn into_vec(self) -> Vec<T> {
        self.data
    }

    /// Iterate `((row, col), &value)` in row-major order.
    pub fn indexed_iter(&self) -> impl Iterator<Item = ((usize, usize), &T)> {
        let cols = self.cols.max(1);
        self.data
            .iter()
            .enumerate()
            .map(move |(i, v)| ((i / cols, i % cols), v))
    }

    /// Apply `f` to every cell, producing a grid of the same shape.
    pub fn map<U>(&self, f: impl FnMut(&T) -> U) -> Grid<U> {
        Grid {
            rows: self.rows,
            cols: self.cols,
            data: self.data.iter().map(f).collect(),
        }
    }
}

impl<T> Index<(usize, usize)> for Grid<T> {
    type Output = T;

    fn index(&self, (row, col): (usize, usize)) -> &T {
        &self.data[row * self.cols + col]
    }
}

impl<T> IndexMut<(usize, usize)> for Grid<T> {
    fn index_mut(&mut self, (row, col): (usize, usize)) -> &mut T {
        &mut self.data[row * self.cols + col]
    }
}

impl Grid<f64> {
    /// Intensity grid scaled to `[0, 1]` from an 8-bit grayscale image.
    #[must_use]
    pub fn from_gray_image(image: &GrayImage) -> Self {
        Self::from_fn(image.height() as usize, image.width() as usize, |row, col| {
            #[allow(clippy::cast_possible_truncation)]
            let Luma([v]) = *image.get_pixel(col as u32, row as u32);
            f64::from(v) / 255.0
        })
    }

    /// Intensity grid from a floating-point grayscale image.
    #[must_use]
    pub fn from_float_image(image: &FloatImage) -> Self {
        Self::from_fn(image.height() as usize, image.width() as usize, |row, col| {
            #[allow(clippy::cast_possible_truncation)]
            let Luma([v]) = *image.get_pixel(col as u32, row as u32);
            f64::from(v)
        })
    }
}

impl Grid<u32> {
    /// Label grid from a 32-bit label image.
    #[must_use]
    pub fn from_label_image(image: &LabelImage) -> Self {
        Self::from_fn(image.height() as usize, image.width() as usize, |row, col| {
            #[allow(clippy::cast_possible_truncation)]
            let Luma([v]) = *image.get_pixel(col as u32, row as u32);
            v
        })
    }

    /// Convert back into a 32-bit label image.
    ///
    /// Returns `None` if either dimension exceeds `u32::MAX`.
    #[must_use]
    pub fn to_label_image(&self) -> Option<LabelImage> {
        let width = u32::try_from(self.cols).ok()?;
        let height = u32::try_from(self.rows).ok()?;
        LabelImage::from_raw(width, height, self.data.clone())
    }

    /// Largest label present (0 when the grid is all background).
    #[must_use]
    pub fn max_label(&self) -> u32 {
        self.data.iter().copied().max().unwrap_or(0)
    }
}

impl Grid<bool> {
    /// Binary grid from a grayscale image: nonzero pixels are `true`.
    #[must_use]
    pub fn from_binary_image(image: &GrayImage) -> Self {
        Self::from_fn(image.height() as usize, image.width() as usize, |row, col| {
            #[allow(clippy::cast_possible_truncation)]
            let Luma([v]) = *image.get_pixel(col as u32, row as u32);
            v != 0
        })
    }

    /// Convert into a 0/255 grayscale image.
    ///
    /// Returns `None` if either dimension exceeds `u32::MAX`.
    #[must_use]
    pub fn to_binary_image(&self) -> Option<GrayImage> {
        let width = u32::try_from(self.cols).ok()?;
        let height = u32::try_from(self.rows).ok()?;
        let raw = self.data.iter().map(|&b| if b { 255 } else { 0 }).collect();
        GrayImage::from_raw(width, height, raw)
    }

    /// Number of `true` cells.
    #[must_use]
    pub fn count(&self) -> usize {
        self.data.iter().filter(|&&b| b).count()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn from_vec_rejects_wrong_length() {
        assert!(Grid::from_vec(2, 3, vec![0u8; 5]).is_none());
        assert!(Grid::from_vec(2, 3, vec![0u8; 6]).is_some());
    }

    #[test]
    fn indexing_is_row_major() {
        let grid = Grid::from_fn(2, 3, |r, c| r * 10 + c);
        assert_eq!(grid[(1, 2)], 12);
        assert_eq!(grid.as_slice(), &[0, 1, 2, 10, 11, 12]);
        assert_eq!(grid.get(2, 0), None);
        assert_eq!(grid.get(0, 3), None);
    }

    #[test]
    fn indexed_iter_reports_coordinates() {
        let grid = Grid::from_fn(2, 2, |r, c| (r, c));
        for ((r, c), v) in grid.indexed_iter() {
            assert_eq!((r, c), *v);
        }
    }

    #[test]
    fn gray_image_is_scaled_to_unit_range() {
        let mut img = GrayImage::new(3, 2);
        img.put_pixel(2, 1, Luma([255]));
        let grid = Grid::from_gray_image(&img);
        assert_eq!(grid.shape(), (2, 3));
        assert!((grid[(1, 2)] - 1.0).abs() < f64::EPSILON);
        assert!(grid[(0, 0)].abs() < f64::EPSILON);
    }

    #[test]
    fn label_image_round_trip_preserves_layout() {
        let grid = Grid::from_fn(3, 4, |r, c| u32::try_from(r * 4 + c).unwrap());
        let img = grid.to_label_image().unwrap();
        assert_eq!(img.dimensions(), (4, 3));
        assert_eq!(Grid::from_label_image(&img), grid);
        assert_eq!(grid.max_label(), 11);
    }

    #[test]
    fn binary_count() {
        let grid = Grid::from_fn(3, 3, |r, c| r == c);
        assert_eq!(grid.count(), 3);
        let img = grid.to_binary_image().unwrap();
        assert_eq!(Grid::from_binary_image(&img), grid);
    }
}
