//! `MeasureImageIntensity`: whole-image intensity statistics.

use cellpipe_pipeline::grid::Grid;
use cellpipe_pipeline::measurements::{ColumnType, IMAGE};
use cellpipe_pipeline::{MeasurementColumn, MeasurementValue, Module, ModuleError, Namespace, Pipeline, Setting, Workspace};

use crate::values::expect_count;

/// Registered module name.
pub const MODULE_NAME: &str = "MeasureImageIntensity";

const REVISION: u32 = 1;

/// Measurement category.
pub const C_INTENSITY: &str = "Intensity";

/// Features recorded per image, in column order.
pub const FEATURES: [&str; 6] = [
    "TotalIntensity",
    "MeanIntensity",
    "StdIntensity",
    "MinIntensity",
    "MaxIntensity",
    "TotalArea",
];

/// Statistics over the unmasked pixels of one image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntensityStats {
    /// Sum of intensities.
    pub total: f64,
    /// Mean intensity.
    pub mean: f64,
    /// Population standard deviation.
    pub std: f64,
    /// Smallest intensity.
    pub min: f64,
    /// Largest intensity.
    pub max: f64,
    /// Number of pixels measured.
    pub area: usize,
}

impl IntensityStats {
    /// Measure `pixels` where `mask` is set. All-masked images measure as
    /// zero.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn measure(pixels: &Grid<f64>, mask: &Grid<bool>) -> Self {
        let values: Vec<f64> = pixels
            .as_slice()
            .iter()
            .zip(mask.as_slice())
            .filter(|&(_, &m)| m)
            .map(|(&v, _)| v)
            .collect();
        if values.is_empty() {
            return Self {
                total: 0.0,
                mean: 0.0,
                std: 0.0,
                min: 0.0,
                max: 0.0,
                area: 0,
            };
        }
        let n = values.len() as f64;
        let total: f64 = values.iter().sum();
        let mean = total / n;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        Self {
            total,
            mean,
            std: variance.sqrt(),
            min: values.iter().copied().fold(f64::INFINITY, f64::min),
            max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            area: values.len(),
        }
    }

    #[allow(clippy::cast_precision_loss)]
    const fn values(&self) -> [f64; 6] {
        [self.total, self.mean, self.std, self.min, self.max, self.area as f64]
    }
}

/// Records [`FEATURES`] for one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeasureImageIntensity {
    /// Image to measure.
    pub image_name: String,
}

impl Default for MeasureImageIntensity {
    fn default() -> Self {
        Self {
            image_name: "DNA".to_string(),
        }
    }
}

impl MeasureImageIntensity {
    /// Feature name of `feature` for the selected image.
    #[must_use]
    pub fn feature_name(&self, feature: &str) -> String {
        format!("{C_INTENSITY}_{feature}_{}", self.image_name)
    }
}

impl Module for MeasureImageIntensity {
    fn module_name(&self) -> &str {
        MODULE_NAME
    }

    fn variable_revision_number(&self) -> u32 {
        REVISION
    }

    fn settings(&self) -> Vec<Setting> {
        vec![Setting::subscriber(
            Namespace::Image,
            "Select the image to measure",
            self.image_name.clone(),
        )]
    }

    fn set_settings_from_values(&mut self, values: &[String], revision: u32) -> Result<(), ModuleError> {
        if revision != REVISION {
            return Err(ModuleError::UnsupportedRevision(revision));
        }
        expect_count(values, 1)?;
        self.image_name.clone_from(&values[0]);
        Ok(())
    }

    fn run(&mut self, workspace: &mut Workspace<'_>) -> Result<(), ModuleError> {
        let image = workspace.get_image(&self.image_name)?;
        let stats = IntensityStats::measure(image.pixels(), &image.effective_mask());
        for (feature, value) in FEATURES.iter().zip(stats.values()) {
            workspace.measurements_mut().add_measurement(
                IMAGE,
                &self.feature_name(feature),
                MeasurementValue::Float(value),
                false,
            )?;
        }
        Ok(())
    }

    fn get_measurement_columns(&self, _pipeline: &Pipeline) -> Vec<MeasurementColumn> {
        FEATURES
            .iter()
            .map(|f| MeasurementColumn::new(IMAGE, self.feature_name(f), ColumnType::Float))
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn statistics_respect_the_mask() {
        let pixels = Grid::from_vec(2, 2, vec![0.2, 0.4, 0.6, 1.0]).unwrap();
        let mask = Grid::from_vec(2, 2, vec![true, true, true, false]).unwrap();
        let stats = IntensityStats::measure(&pixels, &mask);
        assert_eq!(stats.area, 3);
        assert!((stats.total - 1.2).abs() < 1e-12);
        assert!((stats.mean - 0.4).abs() < 1e-12);
        assert!((stats.min - 0.2).abs() < 1e-12);
        assert!((stats.max - 0.6).abs() < 1e-12);
        assert!((stats.std - (0.08f64 / 3.0).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn fully_masked_image_measures_zero() {
        let pixels = Grid::new(2, 2, 0.5);
        let mask = Grid::new(2, 2, false);
        let stats = IntensityStats::measure(&pixels, &mask);
        assert_eq!(stats.area, 0);
        assert!(stats.mean.abs() < f64::EPSILON);
    }

    #[test]
    fn columns_name_the_image() {
        let module = MeasureImageIntensity {
            image_name: "GFP".to_string(),
        };
        let columns = module.get_measurement_columns(&Pipeline::default());
        assert_eq!(columns.len(), FEATURES.len());
        assert_eq!(columns[1].feature, "Intensity_MeanIntensity_GFP");
    }
}
