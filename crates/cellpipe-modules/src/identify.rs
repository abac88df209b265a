//! `IdentifyPrimaryObjects`: threshold, label, and grow objects.
//!
//! Pixels brighter than the threshold are labelled as connected components
//! ([`imageproc::region_labelling::connected_components`]). The components
//! then seed [`cellpipe_pipeline::propagate()`], which grows them into the
//! dimmer surroundings (pixels above a fraction of the threshold) so that
//! touching objects split along intensity valleys. Objects smaller than the
//! minimum size are discarded and the survivors renumbered.

use std::fmt;
use std::str::FromStr;

use cellpipe_pipeline::grid::Grid;
use cellpipe_pipeline::measurements::{C_COUNT, ColumnType, IMAGE};
use cellpipe_pipeline::{
    MeasurementColumn, MeasurementValue, Module, ModuleError, Namespace, Objects, Pipeline, Setting, Workspace,
    propagate,
};
use image::{GrayImage, Luma};
use imageproc::region_labelling::{Connectivity, connected_components};
use tracing::debug;

use crate::values::{expect_count, parse};

/// Registered module name.
pub const MODULE_NAME: &str = "IdentifyPrimaryObjects";

/// Revision 2 added the regularization factor.
const REVISION: u32 = 2;

const DEFAULT_REGULARIZATION: f64 = 0.05;

/// Object measurement: pixel area.
pub const F_AREA: &str = "AreaShape_Area";
/// Object measurement: centroid column.
pub const F_CENTER_X: &str = "Location_Center_X";
/// Object measurement: centroid row.
pub const F_CENTER_Y: &str = "Location_Center_Y";

/// How the foreground threshold is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThresholdMethod {
    /// Otsu's method on the smoothed image.
    #[default]
    Otsu,
    /// The fixed value of the manual threshold setting.
    Manual,
}

impl fmt::Display for ThresholdMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Otsu => "Otsu",
            Self::Manual => "Manual",
        })
    }
}

impl FromStr for ThresholdMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Otsu" => Ok(Self::Otsu),
            "Manual" => Ok(Self::Manual),
            other => Err(format!("unknown threshold method {other:?}")),
        }
    }
}

/// Segments objects from one grayscale image.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentifyPrimaryObjects {
    /// Image to segment.
    pub image_name: String,
    /// Name of the object set produced.
    pub objects_name: String,
    /// Threshold selection.
    pub method: ThresholdMethod,
    /// Threshold used by [`ThresholdMethod::Manual`], in `[0, 1]`.
    pub manual_threshold: f64,
    /// Gaussian sigma applied before thresholding; 0 disables smoothing.
    pub smoothing: f64,
    /// Objects with fewer pixels are discarded.
    pub min_size: usize,
    /// Objects grow into pixels brighter than `threshold * expansion`.
    pub expansion: f64,
    /// Weight of intensity differences against distance when growing.
    pub regularization: f64,
}

impl Default for IdentifyPrimaryObjects {
    fn default() -> Self {
        Self {
            image_name: "DNA".to_string(),
            objects_name: "Nuclei".to_string(),
            method: ThresholdMethod::Otsu,
            manual_threshold: 0.5,
            smoothing: 1.0,
            min_size: 10,
            expansion: 0.5,
            regularization: DEFAULT_REGULARIZATION,
        }
    }
}

impl IdentifyPrimaryObjects {
    fn count_feature(&self) -> String {
        format!("{C_COUNT}_{}", self.objects_name)
    }

    fn threshold_feature(&self) -> String {
        format!("Threshold_FinalThreshold_{}", self.objects_name)
    }

    fn outline_name(&self) -> String {
        format!("{}Outlines", self.objects_name)
    }

    /// Segment `pixels` within `mask`. Returns the threshold used, the
    /// final labels, and the labels before size filtering.
    ///
    /// # Errors
    ///
    /// Returns [`ModuleError::Propagate`] if the intensities are not finite.
    pub fn segment(&self, pixels: &Grid<f64>, mask: &Grid<bool>) -> Result<(f64, Grid<u32>, Grid<u32>), ModuleError> {
        let gray = to_gray(pixels);
        #[allow(clippy::cast_possible_truncation)]
        let smoothed = if self.smoothing > 0.0 {
            imageproc::filter::gaussian_blur_f32(&gray, self.smoothing as f32)
        } else {
            gray
        };
        let threshold = match self.method {
            ThresholdMethod::Otsu => f64::from(imageproc::contrast::otsu_level(&smoothed)) / 255.0,
            ThresholdMethod::Manual => self.manual_threshold,
        };
        let intensity = Grid::from_gray_image(&smoothed);

        let foreground = GrayImage::from_fn(smoothed.width(), smoothed.height(), |x, y| {
            let at = (y as usize, x as usize);
            Luma([if mask[at] && intensity[at] > threshold { 255 } else { 0 }])
        });
        let seeds = Grid::from_label_image(&connected_components(&foreground, Connectivity::Eight, Luma([0u8])));

        let floor = threshold * self.expansion;
        let (rows, cols) = intensity.shape();
        let reach = Grid::from_fn(rows, cols, |r, c| mask[(r, c)] && intensity[(r, c)] > floor);
        let grown = propagate(&intensity, &seeds, &reach, self.regularization)?.labels;

        let filtered = filter_small(&grown, self.min_size);
        debug!(
            threshold,
            seeds = seeds.max_label(),
            kept = filtered.max_label(),
            "objects segmented"
        );
        Ok((threshold, filtered, grown))
    }
}

/// Scale `[0, 1]` intensities to 8 bits.
fn to_gray(pixels: &Grid<f64>) -> GrayImage {
    #[allow(clippy::cast_possible_truncation)]
    let width = pixels.cols() as u32;
    #[allow(clippy::cast_possible_truncation)]
    let height = pixels.rows() as u32;
    GrayImage::from_fn(width, height, |x, y| {
        let v = pixels[(y as usize, x as usize)].clamp(0.0, 1.0) * 255.0;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Luma([v.round() as u8])
    })
}

/// Drop objects smaller than `min_size` pixels and renumber the rest
/// `1..=n` in label order.
fn filter_small(labels: &Grid<u32>, min_size: usize) -> Grid<u32> {
    let max = labels.max_label() as usize;
    let mut areas = vec![0usize; max + 1];
    for &label in labels.as_slice() {
        areas[label as usize] += 1;
    }
    let mut renumber = vec![0u32; max + 1];
    let mut next = 0u32;
    for (label, &area) in areas.iter().enumerate().skip(1) {
        if area > 0 && area >= min_size {
            next += 1;
            renumber[label] = next;
        }
    }
    labels.map(|&label| renumber[label as usize])
}

/// Pixels of an object that touch a different label (4-connected).
fn outlines(labels: &Grid<u32>) -> Grid<bool> {
    let (rows, cols) = labels.shape();
    Grid::from_fn(rows, cols, |r, c| {
        let label = labels[(r, c)];
        if label == 0 {
            return false;
        }
        let differs = |rr: Option<usize>, cc: Option<usize>| match (rr, cc) {
            (Some(rr), Some(cc)) => labels.get(rr, cc).is_none_or(|&other| other != label),
            _ => true,
        };
        differs(r.checked_sub(1), Some(c))
            || differs(Some(r + 1), Some(c))
            || differs(Some(r), c.checked_sub(1))
            || differs(Some(r), Some(c + 1))
    })
}

impl Module for IdentifyPrimaryObjects {
    fn module_name(&self) -> &str {
        MODULE_NAME
    }

    fn variable_revision_number(&self) -> u32 {
        REVISION
    }

    fn settings(&self) -> Vec<Setting> {
        vec![
            Setting::subscriber(Namespace::Image, "Select the input image", self.image_name.clone()),
            Setting::provider(Namespace::Object, "Name the primary objects", self.objects_name.clone()),
            Setting::new("Threshold method", self.method.to_string()),
            Setting::new("Manual threshold", self.manual_threshold.to_string()),
            Setting::new("Smoothing scale", self.smoothing.to_string()),
            Setting::new("Minimum object size", self.min_size.to_string()),
            Setting::new("Expansion threshold fraction", self.expansion.to_string()),
            Setting::new("Regularization factor", self.regularization.to_string()),
        ]
    }

    fn visible_settings(&self) -> Vec<Setting> {
        let mut settings = self.settings();
        if self.method != ThresholdMethod::Manual {
            settings.remove(3);
        }
        settings
    }

    fn set_settings_from_values(&mut self, values: &[String], revision: u32) -> Result<(), ModuleError> {
        let mut values = values.to_vec();
        match revision {
            1 => {
                expect_count(&values, 7)?;
                values.push(DEFAULT_REGULARIZATION.to_string());
            }
            REVISION => expect_count(&values, 8)?,
            other => return Err(ModuleError::UnsupportedRevision(other)),
        }
        let parsed = Self {
            image_name: values[0].clone(),
            objects_name: values[1].clone(),
            method: parse(&values, 2, "Threshold method")?,
            manual_threshold: parse(&values, 3, "Manual threshold")?,
            smoothing: parse(&values, 4, "Smoothing scale")?,
            min_size: parse(&values, 5, "Minimum object size")?,
            expansion: parse(&values, 6, "Expansion threshold fraction")?,
            regularization: parse(&values, 7, "Regularization factor")?,
        };
        *self = parsed;
        Ok(())
    }

    fn run(&mut self, workspace: &mut Workspace<'_>) -> Result<(), ModuleError> {
        let image = workspace.get_image(&self.image_name)?;
        let pixels = image.pixels().clone();
        let mask = image.effective_mask();
        let (threshold, labels, unedited) = self.segment(&pixels, &mask)?;

        let objects = Objects::new(labels)
            .with_unedited(unedited)
            .with_parent_image(self.image_name.clone());
        #[allow(clippy::cast_precision_loss)]
        let areas: Vec<f64> = objects.areas().into_iter().map(|a| a as f64).collect();
        let centers = objects.centers();
        let count = i64::try_from(objects.count()).unwrap_or(i64::MAX);

        let store = workspace.measurements_mut();
        store.add_measurement(IMAGE, &self.count_feature(), MeasurementValue::Integer(count), false)?;
        store.add_measurement(IMAGE, &self.threshold_feature(), MeasurementValue::Float(threshold), false)?;
        store.add_measurement(&self.objects_name, F_AREA, areas.into(), false)?;
        store.add_measurement(
            &self.objects_name,
            F_CENTER_X,
            centers.iter().map(|&(_, x)| x).collect::<Vec<_>>().into(),
            false,
        )?;
        store.add_measurement(
            &self.objects_name,
            F_CENTER_Y,
            centers.iter().map(|&(y, _)| y).collect::<Vec<_>>().into(),
            false,
        )?;

        workspace
            .outlines_mut()
            .insert(self.outline_name(), outlines(objects.segmented()));
        workspace.object_set_mut().add_objects(self.objects_name.clone(), objects);
        Ok(())
    }

    fn get_measurement_columns(&self, _pipeline: &Pipeline) -> Vec<MeasurementColumn> {
        vec![
            MeasurementColumn::new(IMAGE, self.count_feature(), ColumnType::Integer),
            MeasurementColumn::new(IMAGE, self.threshold_feature(), ColumnType::Float),
            MeasurementColumn::new(self.objects_name.clone(), F_AREA, ColumnType::Float),
            MeasurementColumn::new(self.objects_name.clone(), F_CENTER_X, ColumnType::Float),
            MeasurementColumn::new(self.objects_name.clone(), F_CENTER_Y, ColumnType::Float),
        ]
    }

    fn test_valid(&self, _pipeline: &Pipeline) -> Result<(), ModuleError> {
        let invalid = |index: usize, message: &str| {
            Err(ModuleError::Validation {
                index: Some(index),
                message: message.to_string(),
            })
        };
        if !(0.0..=1.0).contains(&self.manual_threshold) {
            return invalid(3, "the manual threshold must be between 0 and 1");
        }
        if !self.smoothing.is_finite() || self.smoothing < 0.0 {
            return invalid(4, "the smoothing scale must not be negative");
        }
        if !(self.expansion > 0.0 && self.expansion <= 1.0) {
            return invalid(6, "the expansion threshold fraction must be in (0, 1]");
        }
        if !self.regularization.is_finite() || self.regularization < 0.0 {
            return invalid(7, "the regularization factor must not be negative");
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    /// Two bright 3x3 squares joined by a dim bridge, plus a single bright
    /// speck, on a dark 7x13 background.
    fn two_blobs() -> Grid<f64> {
        Grid::from_fn(7, 13, |r, c| {
            let in_left = (2..5).contains(&r) && (1..4).contains(&c);
            let in_right = (2..5).contains(&r) && (8..11).contains(&c);
            if in_left || in_right || (r, c) == (0, 12) {
                0.9
            } else if r == 3 && (4..8).contains(&c) {
                0.3
            } else {
                0.0
            }
        })
    }

    fn manual() -> IdentifyPrimaryObjects {
        IdentifyPrimaryObjects {
            method: ThresholdMethod::Manual,
            manual_threshold: 0.5,
            smoothing: 0.0,
            min_size: 2,
            expansion: 0.25,
            ..IdentifyPrimaryObjects::default()
        }
    }

    #[test]
    fn bridge_is_split_between_the_two_objects() {
        let pixels = two_blobs();
        let mask = Grid::new(7, 13, true);
        let (threshold, labels, unedited) = manual().segment(&pixels, &mask).unwrap();
        assert!((threshold - 0.5).abs() < f64::EPSILON);
        assert_eq!(unedited.max_label(), 3);
        assert_eq!(labels.max_label(), 2);
        assert_eq!(labels[(0, 12)], 0);

        let left = labels[(3, 2)];
        let right = labels[(3, 9)];
        assert_ne!(left, right);
        assert_eq!(labels[(3, 4)], left);
        assert_eq!(labels[(3, 7)], right);
        assert_eq!(labels[(0, 0)], 0);
    }

    #[test]
    fn otsu_separates_bright_from_dark() {
        let pixels = two_blobs();
        let mask = Grid::new(7, 13, true);
        let module = IdentifyPrimaryObjects {
            method: ThresholdMethod::Otsu,
            ..manual()
        };
        let (threshold, labels, _) = module.segment(&pixels, &mask).unwrap();
        assert!(threshold > 0.0 && threshold < 0.9);
        assert!(labels.max_label() >= 2);
    }

    #[test]
    fn masked_pixels_never_join_objects() {
        let pixels = two_blobs();
        let mask = Grid::from_fn(7, 13, |_, c| c < 6);
        let (_, labels, _) = manual().segment(&pixels, &mask).unwrap();
        assert_eq!(labels.max_label(), 1);
        assert!((6..13).all(|c| labels[(3, c)] == 0));
    }

    #[test]
    fn small_objects_are_removed_and_renumbered() {
        let labels = Grid::from_vec(1, 6, vec![1, 1, 2, 3, 3, 3]).unwrap();
        let filtered = filter_small(&labels, 2);
        assert_eq!(filtered.as_slice(), &[1, 1, 0, 2, 2, 2]);
    }

    #[test]
    fn outlines_mark_object_borders() {
        let labels = Grid::from_fn(3, 3, |_, _| 1u32);
        let outline = outlines(&labels);
        assert!(!outline[(1, 1)]);
        assert_eq!(outline.count(), 8);
    }

    #[test]
    fn revision_one_settings_gain_default_regularization() {
        let mut module = IdentifyPrimaryObjects::default();
        let values: Vec<String> = ["GFP", "Cells", "Manual", "0.3", "0", "5", "0.5"]
            .iter()
            .map(|s| (*s).to_string())
            .collect();
        module.set_settings_from_values(&values, 1).unwrap();
        assert_eq!(module.objects_name, "Cells");
        assert_eq!(module.method, ThresholdMethod::Manual);
        assert!((module.regularization - DEFAULT_REGULARIZATION).abs() < f64::EPSILON);
        assert_eq!(module.settings().len(), 8);
        assert_eq!(module.visible_settings().len(), 8);
        assert_eq!(IdentifyPrimaryObjects::default().visible_settings().len(), 7);
    }

    #[test]
    fn bad_values_are_rejected_without_partial_update() {
        let mut module = IdentifyPrimaryObjects::default();
        let mut values: Vec<String> = module.settings().into_iter().map(|s| s.value).collect();
        values[1] = "Cells".to_string();
        values[2] = "Adaptive".to_string();
        let err = module.set_settings_from_values(&values, REVISION).unwrap_err();
        assert!(err.to_string().contains("Adaptive"));
        assert_eq!(module.objects_name, "Nuclei");
    }

    #[test]
    fn validation_points_at_the_offending_setting() {
        let module = IdentifyPrimaryObjects {
            expansion: 1.5,
            ..IdentifyPrimaryObjects::default()
        };
        let pipeline = Pipeline::default();
        assert!(matches!(
            module.test_valid(&pipeline),
            Err(ModuleError::Validation { index: Some(6), .. })
        ));
        assert!(IdentifyPrimaryObjects::default().test_valid(&pipeline).is_ok());
    }
}
