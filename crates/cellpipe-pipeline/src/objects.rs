//! Segmented objects produced during one image set.

use std::collections::BTreeMap;

use crate::grid::Grid;

/// A label map where 0 is background and `1..=count` identify objects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Objects {
    segmented: Grid<u32>,
    unedited_segmented: Option<Grid<u32>>,
    parent_image: Option<String>,
}

impl Objects {
    /// Wrap a final label map.
    #[must_use]
    pub const fn new(segmented: Grid<u32>) -> Self {
        Self {
            segmented,
            unedited_segmented: None,
            parent_image: None,
        }
    }

    /// Keep the labels as they were before size or border filtering.
    #[must_use]
    pub fn with_unedited(mut self, unedited: Grid<u32>) -> Self {
        self.unedited_segmented = Some(unedited);
        self
    }

    /// Record which image the objects were segmented from.
    #[must_use]
    pub fn with_parent_image(mut self, name: impl Into<String>) -> Self {
        self.parent_image = Some(name.into());
        self
    }

    /// The final label map.
    #[must_use]
    pub const fn segmented(&self) -> &Grid<u32> {
        &self.segmented
    }

    /// Labels before filtering, falling back to the final labels.
    #[must_use]
    pub fn unedited_segmented(&self) -> &Grid<u32> {
        self.unedited_segmented.as_ref().unwrap_or(&self.segmented)
    }

    /// Source image name.
    #[must_use]
    pub fn parent_image(&self) -> Option<&str> {
        self.parent_image.as_deref()
    }

    /// Number of objects (the highest label).
    #[must_use]
    pub fn count(&self) -> usize {
        self.segmented.max_label() as usize
    }

    /// Pixel area of each object, indexed by `label - 1`.
    #[must_use]
    pub fn areas(&self) -> Vec<usize> {
        let mut areas = vec![0; self.count()];
        for &label in self.segmented.as_slice() {
            if label > 0 {
                areas[label as usize - 1] += 1;
            }
        }
        areas
    }

    /// Centroid `(row, col)` of each object, indexed by `label - 1`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn centers(&self) -> Vec<(f64, f64)> {
        let n = self.count();
        let mut sums = vec![(0.0, 0.0, 0usize); n];
        for ((row, col), &label) in self.segmented.indexed_iter() {
            if label > 0 {
                let entry = &mut sums[label as usize - 1];
                entry.0 += row as f64;
                entry.1 += col as f64;
                entry.2 += 1;
            }
        }
        sums.into_iter()
            .map(|(r, c, count)| {
                if count == 0 {
                    (f64::NAN, f64::NAN)
                } else {
                    (r / count as f64, c / count as f64)
                }
            })
            .collect()
    }
}

/// All object sets segmented so far in the current image set.
#[derive(Debug, Clone, Default)]
pub struct ObjectSet {
    objects: BTreeMap<String, Objects>,
}

impl ObjectSet {
    /// An empty object set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) objects under `name`.
    pub fn add_objects(&mut self, name: impl Into<String>, objects: Objects) {
        self.objects.insert(name.into(), objects);
    }

    /// Objects named `name`.
    #[must_use]
    pub fn get_objects(&self, name: &str) -> Option<&Objects> {
        self.objects.get(name)
    }

    /// Names of all object sets, sorted.
    pub fn object_names(&self) -> impl Iterator<Item = &str> {
        self.objects.keys().map(String::as_str)
    }

    /// Whether no objects were added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn areas_and_centers() {
        let labels = Grid::from_vec(2, 3, vec![1, 1, 0, 0, 2, 2]).unwrap();
        let objects = Objects::new(labels);
        assert_eq!(objects.count(), 2);
        assert_eq!(objects.areas(), vec![2, 2]);
        let centers = objects.centers();
        assert!((centers[0].0 - 0.0).abs() < 1e-12);
        assert!((centers[0].1 - 0.5).abs() < 1e-12);
        assert!((centers[1].0 - 1.0).abs() < 1e-12);
        assert!((centers[1].1 - 1.5).abs() < 1e-12);
    }

    #[test]
    fn objects_compare_by_labels_and_parent() {
        fn assert_eq_impl<T: Eq>(_: &T) {}
        let a = Objects::new(Grid::new(2, 2, 1)).with_parent_image("DNA");
        assert_eq_impl(&a);
        assert_eq!(a, a.clone());
        assert_ne!(a, Objects::new(Grid::new(2, 2, 1)));
        assert_ne!(a, Objects::new(Grid::new(2, 2, 2)).with_parent_image("DNA"));
    }

    #[test]
    fn unedited_falls_back_to_final_labels() {
        let labels = Grid::new(1, 2, 1);
        let objects = Objects::new(labels.clone()).with_parent_image("DNA");
        assert_eq!(objects.unedited_segmented(), &labels);
        assert_eq!(objects.parent_image(), Some("DNA"));
    }

    #[test]
    fn object_set_lists_names() {
        let mut set = ObjectSet::new();
        set.add_objects("Nuclei", Objects::new(Grid::new(1, 1, 0)));
        set.add_objects("Cells", Objects::new(Grid::new(1, 1, 0)));
        assert_eq!(set.object_names().collect::<Vec<_>>(), vec!["Cells", "Nuclei"]);
        assert!(set.get_objects("Nuclei").is_some());
    }
}
