//! Error types shared across the crate.

use std::path::PathBuf;

use crate::events::Direction;
use crate::literal::LiteralError;
use crate::measurements::MeasurementsError;
use crate::propagate::PropagateError;

/// Errors raised by a module lifecycle hook.
///
/// These are recoverable: the pipeline reports them to listeners as a
/// run exception and lets the host decide whether to cancel, skip the
/// current image set, or continue.
#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    /// A setting value could not be parsed.
    #[error("setting {index} ({text}) has invalid value {value:?}: {reason}")]
    InvalidSetting {
        /// Zero-based index into the settings list.
        index: usize,
        /// The setting's label.
        text: String,
        /// The rejected value.
        value: String,
        /// What was wrong with it.
        reason: String,
    },

    /// The stored settings list has the wrong length for this revision.
    #[error("expected {expected} settings, got {actual}")]
    SettingCount {
        /// Number the module expects.
        expected: usize,
        /// Number supplied.
        actual: usize,
    },

    /// Settings were saved by a revision this module cannot upgrade from.
    #[error("unsupported variable revision number {0}")]
    UnsupportedRevision(u32),

    /// The hook needs an image set but was called outside of one.
    #[error("no image set is active")]
    NoImageSet,

    /// A named image is neither cached nor provided in the image set.
    #[error("image {0:?} is not available in this image set")]
    MissingImage(String),

    /// A named object set was never added to the object set.
    #[error("objects {0:?} are not available in this image set")]
    MissingObjects(String),

    /// A measurement this module depends on was never recorded.
    #[error("measurement {object}.{feature} is not available")]
    MissingMeasurement {
        /// Object name (or `"Image"`).
        object: String,
        /// Feature name.
        feature: String,
    },

    /// Two grids the module combines have different shapes.
    #[error("image {name:?} is {actual:?} but {expected:?} was expected")]
    ShapeMismatch {
        /// Name of the offending image or objects.
        name: String,
        /// Expected `(rows, cols)`.
        expected: (usize, usize),
        /// Actual `(rows, cols)`.
        actual: (usize, usize),
    },

    /// The image could not be decoded.
    #[error("failed to decode image: {0}")]
    Image(#[from] image::ImageError),

    /// Filesystem access failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Writing or reading a measurement failed.
    #[error(transparent)]
    Measurements(#[from] MeasurementsError),

    /// Seeded propagation rejected its input.
    #[error(transparent)]
    Propagate(#[from] PropagateError),

    /// The module panicked while running on a background worker.
    #[error("module panicked: {0}")]
    Panicked(String),

    /// The pipeline configuration is invalid for this module.
    #[error("{message}")]
    Validation {
        /// Index of the offending setting, if known.
        index: Option<usize>,
        /// Human-readable description.
        message: String,
    },

    /// Any other failure reported by a module.
    #[error("{0}")]
    Failed(String),
}

/// Errors raised while reading a pipeline file.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// The first line is not the pipeline cookie.
    #[error("invalid header: {0:?}")]
    BadCookie(String),

    /// Input ended inside the header block.
    #[error("pipeline file unexpectedly truncated before module section")]
    Truncated,

    /// The file declares a format version newer than this reader.
    #[error(
        "pipeline file version is {found}; only version {supported} or less can be read"
    )]
    UnsupportedVersion {
        /// Version declared by the file.
        found: u32,
        /// Highest version this reader understands.
        supported: u32,
    },

    /// A header line is not `key:value` or its value is malformed.
    #[error("line {line}: invalid header entry {text:?}")]
    MalformedHeader {
        /// One-based line number.
        line: usize,
        /// The offending line.
        text: String,
    },

    /// A module header has no `name:` prefix.
    #[error("line {line}: invalid format for module header {text:?}")]
    MalformedModuleHeader {
        /// One-based line number.
        line: usize,
        /// The offending line.
        text: String,
    },

    /// The bracketed attribute list or one of its entries is malformed.
    #[error("line {line}: invalid attribute string {text:?}")]
    MalformedAttribute {
        /// One-based line number.
        line: usize,
        /// The offending attribute text.
        text: String,
    },

    /// An attribute value is not a valid literal.
    #[error("line {line}: attribute {name}: {source}")]
    Literal {
        /// One-based line number.
        line: usize,
        /// Attribute name.
        name: String,
        /// Parser failure.
        source: LiteralError,
    },

    /// An attribute literal has the wrong type.
    #[error("line {line}: attribute {name} must be {expected}")]
    AttributeType {
        /// One-based line number.
        line: usize,
        /// Attribute name.
        name: String,
        /// Description of the accepted type.
        expected: &'static str,
    },

    /// The mandatory `variable_revision_number` attribute is absent.
    #[error("module {module_name} did not have a variable revision number attribute")]
    MissingRevision {
        /// Module whose header lacked the attribute.
        module_name: String,
    },

    /// A setting line does not split into exactly `label:value`.
    #[error("line {line}: invalid format for setting {text:?}")]
    MalformedSetting {
        /// One-based line number.
        line: usize,
        /// The offending line.
        text: String,
    },

    /// A backslash escape is truncated or has bad hex digits.
    #[error("invalid escape sequence in {0:?}")]
    BadEscape(String),

    /// Decoded bytes are not UTF-8.
    #[error("decoded text is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// No factory is registered under this module name.
    #[error("unknown module {0:?}")]
    UnknownModule(String),

    /// The module rejected its stored settings.
    #[error("module {module_name}: {source}")]
    Settings {
        /// Module being restored.
        module_name: String,
        /// Why the settings were rejected.
        source: ModuleError,
    },

    /// Reading the file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Structural and configuration errors raised directly to the caller.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// A module number does not address a module (or insertion slot).
    #[error("module number {module_num} is out of range for a pipeline of {len} modules")]
    ModuleOutOfRange {
        /// Requested one-based module number.
        module_num: usize,
        /// Current number of modules.
        len: usize,
    },

    /// The first module cannot move up and the last cannot move down.
    #[error("module {module_num} cannot move {direction}")]
    CannotMove {
        /// One-based module number.
        module_num: usize,
        /// Requested direction.
        direction: Direction,
    },

    /// More than one module supplies image groupings.
    #[error(
        "the pipeline has two grouping modules: #{first} ({first_name}) and #{second} ({second_name})"
    )]
    DuplicateGroupingModules {
        /// First grouping module number.
        first: usize,
        /// First grouping module name.
        first_name: String,
        /// Second grouping module number.
        second: usize,
        /// Second grouping module name.
        second_name: String,
    },

    /// A requested grouping does not use the pipeline's grouping keys.
    #[error(
        "the requested grouping keys ({}) must be the same as those defined by the modules in the pipeline ({})",
        .requested.join(", "),
        .computed.join(", ")
    )]
    GroupingMismatch {
        /// Keys supplied by the caller.
        requested: Vec<String>,
        /// Keys reported by the grouping module.
        computed: Vec<String>,
    },

    /// Image providers must be added in `prepare_group`, not `prepare_run`.
    #[error(
        "image providers were added to image set {image_number} during prepare_run; add them in prepare_group instead"
    )]
    ProvidersAddedInPrepareRun {
        /// Image set holding the stray providers.
        image_number: usize,
    },

    /// No module with this name is registered.
    #[error("unknown module {0:?}")]
    UnknownModule(String),

    /// A module hook failed outside of a run (validation, undo replay).
    #[error("module #{module_num} ({module_name}): {source}")]
    Module {
        /// One-based module number.
        module_num: usize,
        /// Module name.
        module_name: String,
        /// Underlying failure.
        source: ModuleError,
    },

    /// No measurement column matches a synthesized name.
    #[error(
        "no such measurement in pipeline: category = {category}, feature = {feature}, image (optional) = {image}, scale (optional) = {scale}"
    )]
    NoSuchMeasurement {
        /// Measurement category (e.g. `Intensity`).
        category: String,
        /// Feature name.
        feature: String,
        /// Image name component.
        image: String,
        /// Scale component.
        scale: String,
    },

    /// Run options are inconsistent.
    #[error("invalid run options: {0}")]
    InvalidConfig(String),

    /// A plugin preset manifest could not be used.
    #[error("plugin preset {}: {reason}", .path.display())]
    Plugin {
        /// Manifest path.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// Reading or writing a pipeline failed.
    #[error(transparent)]
    Load(#[from] LoadError),

    /// The measurements store rejected a write.
    #[error(transparent)]
    Measurements(#[from] MeasurementsError),

    /// Filesystem access failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grouping_mismatch_lists_both_key_sets() {
        let err = PipelineError::GroupingMismatch {
            requested: vec!["Metadata_Well".to_string()],
            computed: vec!["Metadata_Plate".to_string(), "Metadata_Site".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("(Metadata_Well)"));
        assert!(msg.contains("(Metadata_Plate, Metadata_Site)"));
    }

    #[test]
    fn cannot_move_names_direction() {
        let err = PipelineError::CannotMove {
            module_num: 1,
            direction: Direction::Up,
        };
        assert_eq!(err.to_string(), "module 1 cannot move up");
    }

    #[test]
    fn unsupported_version_display() {
        let err = LoadError::UnsupportedVersion {
            found: 3,
            supported: 2,
        };
        assert_eq!(
            err.to_string(),
            "pipeline file version is 3; only version 2 or less can be read"
        );
    }

    #[test]
    fn module_error_wraps_into_load_error() {
        let err = LoadError::Settings {
            module_name: "FlagImage".to_string(),
            source: ModuleError::SettingCount {
                expected: 4,
                actual: 2,
            },
        };
        assert_eq!(
            err.to_string(),
            "module FlagImage: expected 4 settings, got 2"
        );
    }
}
