//! `FlagImage`: mark image sets whose measurement falls outside a range.

use cellpipe_pipeline::measurements::{C_METADATA, ColumnType, EXPERIMENT, IMAGE};
use cellpipe_pipeline::setting::format_binary;
use cellpipe_pipeline::{
    Disposition, MeasurementColumn, MeasurementValue, Module, ModuleError, Pipeline, Setting, Workspace,
};
use tracing::{debug, info};

use crate::values::{expect_count, format_optional, parse_flag, parse_optional};

/// Registered module name.
pub const MODULE_NAME: &str = "FlagImage";

const REVISION: u32 = 1;

/// Flags an image set when an image measurement is below `min` or above
/// `max`, and optionally skips the rest of the pipeline for it.
#[derive(Debug, Clone, PartialEq)]
pub struct FlagImage {
    /// Name of the flag; recorded as `Metadata_<flag>`.
    pub flag_name: String,
    /// Image feature to check.
    pub feature: String,
    /// Lower bound, if any.
    pub min: Option<f64>,
    /// Upper bound, if any.
    pub max: Option<f64>,
    /// Skip the remaining modules for flagged image sets.
    pub skip_flagged: bool,
    flagged: usize,
}

impl Default for FlagImage {
    fn default() -> Self {
        Self {
            flag_name: "QCFlag".to_string(),
            feature: "Intensity_MeanIntensity_DNA".to_string(),
            min: None,
            max: None,
            skip_flagged: false,
            flagged: 0,
        }
    }
}

impl FlagImage {
    fn flag_feature(&self) -> String {
        format!("{C_METADATA}_{}", self.flag_name)
    }

    fn count_feature(&self) -> String {
        format!("{}_FlaggedCount", self.flag_name)
    }

    /// Whether `value` is out of range.
    #[must_use]
    pub fn is_flagged(&self, value: f64) -> bool {
        self.min.is_some_and(|min| value < min) || self.max.is_some_and(|max| value > max)
    }
}

impl Module for FlagImage {
    fn module_name(&self) -> &str {
        MODULE_NAME
    }

    fn variable_revision_number(&self) -> u32 {
        REVISION
    }

    fn settings(&self) -> Vec<Setting> {
        vec![
            Setting::new("Name the flag", self.flag_name.clone()),
            Setting::measurement(IMAGE, "Measurement to check", self.feature.clone()),
            Setting::new("Minimum value", format_optional(self.min)),
            Setting::new("Maximum value", format_optional(self.max)),
            Setting::new("Skip image set if flagged", format_binary(self.skip_flagged)),
        ]
    }

    fn set_settings_from_values(&mut self, values: &[String], revision: u32) -> Result<(), ModuleError> {
        if revision != REVISION {
            return Err(ModuleError::UnsupportedRevision(revision));
        }
        expect_count(values, 5)?;
        let min = parse_optional(values, 2, "Minimum value")?;
        let max = parse_optional(values, 3, "Maximum value")?;
        let skip_flagged = parse_flag(values, 4, "Skip image set if flagged")?;
        self.flag_name.clone_from(&values[0]);
        self.feature.clone_from(&values[1]);
        self.min = min;
        self.max = max;
        self.skip_flagged = skip_flagged;
        Ok(())
    }

    fn prepare_run(&mut self, _workspace: &mut Workspace<'_>) -> Result<bool, ModuleError> {
        self.flagged = 0;
        Ok(true)
    }

    fn run(&mut self, workspace: &mut Workspace<'_>) -> Result<(), ModuleError> {
        let value = workspace
            .measurements()
            .get_current_measurement(IMAGE, &self.feature)
            .and_then(MeasurementValue::as_float)
            .ok_or_else(|| ModuleError::MissingMeasurement {
                object: IMAGE.to_string(),
                feature: self.feature.clone(),
            })?;
        let flagged = self.is_flagged(value);
        workspace.measurements_mut().add_measurement(
            IMAGE,
            &self.flag_feature(),
            MeasurementValue::Integer(i64::from(flagged)),
            false,
        )?;
        if flagged {
            self.flagged += 1;
            debug!(flag = %self.flag_name, value, image = ?workspace.image_number(), "image set flagged");
            if self.skip_flagged {
                workspace.set_disposition(Disposition::Skip);
            }
        }
        Ok(())
    }

    fn post_run(&mut self, workspace: &mut Workspace<'_>) -> Result<(), ModuleError> {
        info!(flag = %self.flag_name, flagged = self.flagged, "flagging finished");
        let count = i64::try_from(self.flagged).unwrap_or(i64::MAX);
        workspace
            .measurements_mut()
            .add_experiment_measurement(&self.count_feature(), MeasurementValue::Integer(count))?;
        Ok(())
    }

    fn get_measurement_columns(&self, _pipeline: &Pipeline) -> Vec<MeasurementColumn> {
        vec![
            MeasurementColumn::new(IMAGE, self.flag_feature(), ColumnType::Integer),
            MeasurementColumn::new(EXPERIMENT, self.count_feature(), ColumnType::Integer),
        ]
    }

    fn test_valid(&self, pipeline: &Pipeline) -> Result<(), ModuleError> {
        if let (Some(min), Some(max)) = (self.min, self.max)
            && min > max
        {
            return Err(ModuleError::Validation {
                index: Some(3),
                message: format!("the maximum ({max}) is below the minimum ({min})"),
            });
        }
        let available = pipeline
            .get_measurement_columns(None)
            .iter()
            .any(|c| c.object_name == IMAGE && c.feature == self.feature);
        if !available {
            return Err(ModuleError::Validation {
                index: Some(1),
                message: format!("no module measures {IMAGE}.{}", self.feature),
            });
        }
        Ok(())
    }
}
