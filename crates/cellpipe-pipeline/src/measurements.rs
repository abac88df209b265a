//! The measurements store contract and an in-memory implementation.
//!
//! Measurements are keyed by `(object_name, feature_name, image_number)`.
//! Image-level values use the object name [`IMAGE`]; run-wide values use
//! [`EXPERIMENT`] and ignore the image number.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Object name for per-image measurements.
pub const IMAGE: &str = "Image";
/// Object name for run-wide measurements.
pub const EXPERIMENT: &str = "Experiment";
/// Image feature listing the image numbers in the run.
pub const IMAGE_NUMBER: &str = "ImageNumber";
/// Image feature recording the one-based group number.
pub const GROUP_NUMBER: &str = "Group_Number";
/// Image feature recording the one-based index within the group.
pub const GROUP_INDEX: &str = "Group_Index";
/// Experiment feature recording how the run ended.
pub const EXIT_STATUS: &str = "Exit_Status";
/// Experiment feature holding the pipeline's text serialization.
pub const M_PIPELINE: &str = "Pipeline_Pipeline";
/// Category prefix of metadata features.
pub const C_METADATA: &str = "Metadata";
/// Category prefix of per-image file names.
pub const C_FILE_NAME: &str = "FileName";
/// Category prefix of per-image file paths.
pub const C_PATH_NAME: &str = "PathName";
/// Category prefix of object counts.
pub const C_COUNT: &str = "Count";

/// Errors raised by a measurements store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MeasurementsError {
    /// The value exists and the caller did not allow overwriting it.
    #[error("measurement {object}.{feature} already recorded for image {image_number}")]
    AlreadyRecorded {
        /// Object name.
        object: String,
        /// Feature name.
        feature: String,
        /// Image number.
        image_number: usize,
    },

    /// A current-image operation was attempted before `next_image_set`.
    #[error("no image set is current")]
    NoCurrentImageSet,

    /// The backing storage could not be flushed.
    #[error("failed to flush measurements: {0}")]
    Flush(String),
}

/// A single measurement value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MeasurementValue {
    /// An integer (counts, flags, indices).
    Integer(i64),
    /// A floating-point scalar.
    Float(f64),
    /// Text (file names, metadata, blobs).
    Text(String),
    /// One value per object.
    Array(Vec<f64>),
}

impl MeasurementValue {
    /// The value as an integer, if it is one.
    #[must_use]
    pub const fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(v) => Some(*v),
            _ => None,
        }
    }

    /// The value as a float. Integers widen.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Integer(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// The value as text, if it is text.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for MeasurementValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(s) => f.write_str(s),
            Self::Array(values) => {
                f.write_str("[")?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{v}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<i64> for MeasurementValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<f64> for MeasurementValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<String> for MeasurementValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&str> for MeasurementValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<Vec<f64>> for MeasurementValue {
    fn from(v: Vec<f64>) -> Self {
        Self::Array(v)
    }
}

/// Storage type of a measurement column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    /// `integer`
    Integer,
    /// `float`
    Float,
    /// `varchar(n)`
    Varchar(usize),
    /// `longblob`
    LongBlob,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer => f.write_str("integer"),
            Self::Float => f.write_str("float"),
            Self::Varchar(n) => write!(f, "varchar({n})"),
            Self::LongBlob => f.write_str("longblob"),
        }
    }
}

/// A declared `(object, feature, type)` output of a module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeasurementColumn {
    /// Object name, [`IMAGE`] or [`EXPERIMENT`].
    pub object_name: String,
    /// Feature name as passed to `add_measurement`.
    pub feature: String,
    /// Storage type.
    pub coltype: ColumnType,
    /// Optional tags, e.g. `available_post_group`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

impl MeasurementColumn {
    /// A column without attributes.
    pub fn new(object_name: impl Into<String>, feature: impl Into<String>, coltype: ColumnType) -> Self {
        Self {
            object_name: object_name.into(),
            feature: feature.into(),
            coltype,
            attributes: BTreeMap::new(),
        }
    }
}

/// Append-mostly, column-oriented storage for run results.
///
/// Exactly one module step writes at a time, so implementations need no
/// internal locking; `Send` lets a step run on a worker thread.
pub trait MeasurementsStore: Send {
    /// The current image number (0 before the first `next_image_set`).
    fn image_set_number(&self) -> usize;

    /// Make `image_number` the current image set.
    fn next_image_set(&mut self, image_number: usize);

    /// Record a value for an explicit image number.
    ///
    /// # Errors
    ///
    /// Returns [`MeasurementsError::AlreadyRecorded`] if the value exists
    /// and `can_overwrite` is false.
    fn add_measurement_for(
        &mut self,
        object_name: &str,
        feature: &str,
        image_number: usize,
        value: MeasurementValue,
        can_overwrite: bool,
    ) -> Result<(), MeasurementsError>;

    /// Record a run-wide value, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Implementations backed by storage may fail to write.
    fn add_experiment_measurement(
        &mut self,
        feature: &str,
        value: MeasurementValue,
    ) -> Result<(), MeasurementsError>;

    /// Value for an explicit image number.
    fn get_measurement(
        &self,
        object_name: &str,
        feature: &str,
        image_number: usize,
    ) -> Option<&MeasurementValue>;

    /// Run-wide value.
    fn get_experiment_measurement(&self, feature: &str) -> Option<&MeasurementValue>;

    /// Feature names recorded for `object_name`, sorted.
    fn get_feature_names(&self, object_name: &str) -> Vec<String>;

    /// Object names with at least one feature, sorted.
    fn get_object_names(&self) -> Vec<String>;

    /// Remove one value; absent values are ignored.
    fn remove_measurement(&mut self, object_name: &str, feature: &str, image_number: usize);

    /// Persist buffered values.
    ///
    /// # Errors
    ///
    /// Returns [`MeasurementsError::Flush`] if the backing storage fails.
    fn flush(&mut self) -> Result<(), MeasurementsError>;

    /// Record a value for the current image set.
    ///
    /// # Errors
    ///
    /// Returns [`MeasurementsError::NoCurrentImageSet`] before the first
    /// `next_image_set`, or [`MeasurementsError::AlreadyRecorded`].
    fn add_measurement(
        &mut self,
        object_name: &str,
        feature: &str,
        value: MeasurementValue,
        can_overwrite: bool,
    ) -> Result<(), MeasurementsError> {
        let image_number = self.image_set_number();
        if image_number == 0 {
            return Err(MeasurementsError::NoCurrentImageSet);
        }
        self.add_measurement_for(object_name, feature, image_number, value, can_overwrite)
    }

    /// Value for the current image set.
    fn get_current_measurement(&self, object_name: &str, feature: &str) -> Option<&MeasurementValue> {
        self.get_measurement(object_name, feature, self.image_set_number())
    }

    /// Whether any value exists for `(object_name, feature)`.
    fn has_feature(&self, object_name: &str, feature: &str) -> bool {
        self.get_feature_names(object_name).iter().any(|f| f == feature)
    }

    /// Register `image_number` as part of the run.
    ///
    /// # Errors
    ///
    /// Propagates write failures.
    fn add_image_number(&mut self, image_number: usize) -> Result<(), MeasurementsError> {
        let value = i64::try_from(image_number).unwrap_or(i64::MAX);
        self.add_measurement_for(IMAGE, IMAGE_NUMBER, image_number, value.into(), true)
    }

    /// Image numbers registered under `Image/ImageNumber`, ascending.
    fn get_image_numbers(&self) -> Vec<usize>;
}

type FeatureColumn = BTreeMap<usize, MeasurementValue>;

/// In-memory [`MeasurementsStore`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Measurements {
    current: usize,
    experiment: BTreeMap<String, MeasurementValue>,
    objects: BTreeMap<String, BTreeMap<String, FeatureColumn>>,
    #[serde(skip)]
    flush_count: usize,
}

impl Measurements {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times [`flush`](MeasurementsStore::flush) was called.
    #[must_use]
    pub const fn flush_count(&self) -> usize {
        self.flush_count
    }

    /// All values of one feature, keyed by image number.
    #[must_use]
    pub fn column(&self, object_name: &str, feature: &str) -> Option<&BTreeMap<usize, MeasurementValue>> {
        self.objects.get(object_name)?.get(feature)
    }
}

impl MeasurementsStore for Measurements {
    fn image_set_number(&self) -> usize {
        self.current
    }

    fn next_image_set(&mut self, image_number: usize) {
        self.current = image_number;
    }

    fn add_measurement_for(
        &mut self,
        object_name: &str,
        feature: &str,
        image_number: usize,
        value: MeasurementValue,
        can_overwrite: bool,
    ) -> Result<(), MeasurementsError> {
        if object_name == EXPERIMENT {
            return self.add_experiment_measurement(feature, value);
        }
        let column = self
            .objects
            .entry(object_name.to_string())
            .or_default()
            .entry(feature.to_string())
            .or_default();
        if !can_overwrite && column.contains_key(&image_number) {
            return Err(MeasurementsError::AlreadyRecorded {
                object: object_name.to_string(),
                feature: feature.to_string(),
                image_number,
            });
        }
        column.insert(image_number, value);
        Ok(())
    }

    fn add_experiment_measurement(
        &mut self,
        feature: &str,
        value: MeasurementValue,
    ) -> Result<(), MeasurementsError> {
        self.experiment.insert(feature.to_string(), value);
        Ok(())
    }

    fn get_measurement(
        &self,
        object_name: &str,
        feature: &str,
        image_number: usize,
    ) -> Option<&MeasurementValue> {
        if object_name == EXPERIMENT {
            return self.experiment.get(feature);
        }
        self.column(object_name, feature)?.get(&image_number)
    }

    fn get_experiment_measurement(&self, feature: &str) -> Option<&MeasurementValue> {
        self.experiment.get(feature)
    }

    fn get_feature_names(&self, object_name: &str) -> Vec<String> {
        if object_name == EXPERIMENT {
            return self.experiment.keys().cloned().collect();
        }
        self.objects
            .get(object_name)
            .map(|features| {
                features
                    .iter()
                    .filter(|(_, column)| !column.is_empty())
                    .map(|(name, _)| name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn get_object_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .objects
            .iter()
            .filter(|(_, features)| features.values().any(|c| !c.is_empty()))
            .map(|(name, _)| name.clone())
            .collect();
        if !self.experiment.is_empty() {
            names.push(EXPERIMENT.to_string());
            names.sort();
        }
        names
    }

    fn remove_measurement(&mut self, object_name: &str, feature: &str, image_number: usize) {
        if object_name == EXPERIMENT {
            self.experiment.remove(feature);
        } else if let Some(column) = self
            .objects
            .get_mut(object_name)
            .and_then(|features| features.get_mut(feature))
        {
            column.remove(&image_number);
        }
    }

    fn flush(&mut self) -> Result<(), MeasurementsError> {
        self.flush_count += 1;
        Ok(())
    }

    fn get_image_numbers(&self) -> Vec<usize> {
        self.column(IMAGE, IMAGE_NUMBER)
            .map(|column| column.keys().copied().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn current_image_measurement_requires_image_set() {
        let mut m = Measurements::new();
        let err = m.add_measurement(IMAGE, "Count_Nuclei", MeasurementValue::Integer(3), false);
        assert_eq!(err, Err(MeasurementsError::NoCurrentImageSet));
        m.next_image_set(2);
        m.add_measurement(IMAGE, "Count_Nuclei", MeasurementValue::Integer(3), false)
            .unwrap();
        assert_eq!(
            m.get_current_measurement(IMAGE, "Count_Nuclei"),
            Some(&MeasurementValue::Integer(3))
        );
        assert_eq!(m.get_measurement(IMAGE, "Count_Nuclei", 1), None);
    }

    #[test]
    fn overwrite_is_opt_in() {
        let mut m = Measurements::new();
        m.add_measurement_for(IMAGE, "F", 1, 1.0.into(), false).unwrap();
        assert!(matches!(
            m.add_measurement_for(IMAGE, "F", 1, 2.0.into(), false),
            Err(MeasurementsError::AlreadyRecorded { image_number: 1, .. })
        ));
        m.add_measurement_for(IMAGE, "F", 1, 2.0.into(), true).unwrap();
        assert_eq!(m.get_measurement(IMAGE, "F", 1), Some(&MeasurementValue::Float(2.0)));
    }

    #[test]
    fn image_numbers_come_from_image_number_feature() {
        let mut m = Measurements::new();
        for n in [3, 1, 2] {
            m.add_image_number(n).unwrap();
        }
        assert_eq!(m.get_image_numbers(), vec![1, 2, 3]);
        m.remove_measurement(IMAGE, IMAGE_NUMBER, 2);
        assert_eq!(m.get_image_numbers(), vec![1, 3]);
    }

    #[test]
    fn experiment_measurements_are_listed_as_an_object() {
        let mut m = Measurements::new();
        m.add_experiment_measurement(EXIT_STATUS, "Complete".into()).unwrap();
        m.add_measurement_for("Nuclei", "AreaShape_Area", 1, vec![4.0, 9.0].into(), false)
            .unwrap();
        assert_eq!(m.get_object_names(), vec!["Experiment", "Nuclei"]);
        assert_eq!(m.get_feature_names(EXPERIMENT), vec![EXIT_STATUS]);
        assert!(m.has_feature("Nuclei", "AreaShape_Area"));
        assert_eq!(
            m.get_measurement(EXPERIMENT, EXIT_STATUS, 99).and_then(MeasurementValue::as_text),
            Some("Complete")
        );
    }

    #[test]
    fn value_display_and_json() {
        assert_eq!(MeasurementValue::Array(vec![1.0, 2.5]).to_string(), "[1, 2.5]");
        assert_eq!(ColumnType::Varchar(255).to_string(), "varchar(255)");
        let json = serde_json::to_string(&MeasurementValue::Integer(4)).unwrap();
        assert_eq!(json, "4");
        let back: MeasurementValue = serde_json::from_str(&json).unwrap();
        assert_eq!(back, MeasurementValue::Integer(4));
    }
}
