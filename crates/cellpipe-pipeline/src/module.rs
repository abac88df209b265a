//! The module contract and the per-module metadata the pipeline keeps.
//!
//! Every pipeline step implements [`Module`]. Only `module_name`,
//! `variable_revision_number`, `settings`, `set_settings_from_values`, and
//! `run` are required; the remaining hooks default to doing nothing.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::grouping::{GroupKey, Groupings};
use crate::measurements::MeasurementColumn;
use crate::pipeline::Pipeline;
use crate::setting::{Namespace, Setting};
use crate::types::ModuleError;
use crate::workspace::Workspace;

/// Control-flow request a module (or the host) leaves on the workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Disposition {
    /// Carry on with the next module.
    #[default]
    Continue,
    /// Suspend the run until it is resumed.
    Pause,
    /// Abandon the remaining modules of this image set.
    Skip,
    /// Abandon the whole run.
    Cancel,
}

/// A pipeline step.
pub trait Module: Send {
    /// Stable identifier used for instantiation and serialization.
    fn module_name(&self) -> &str;

    /// Revision of the settings layout produced by [`settings`](Self::settings).
    fn variable_revision_number(&self) -> u32;

    /// The ordered settings list.
    fn settings(&self) -> Vec<Setting>;

    /// The settings currently shown to the user; defaults to all of them.
    fn visible_settings(&self) -> Vec<Setting> {
        self.settings()
    }

    /// Restore settings from stored values saved at `variable_revision_number`.
    ///
    /// # Errors
    ///
    /// Returns a [`ModuleError`] if the values cannot be interpreted.
    fn set_settings_from_values(
        &mut self,
        values: &[String],
        variable_revision_number: u32,
    ) -> Result<(), ModuleError>;

    /// Process the current image set.
    ///
    /// # Errors
    ///
    /// Any error is reported to listeners as a run exception.
    fn run(&mut self, workspace: &mut Workspace<'_>) -> Result<(), ModuleError>;

    /// Set up the run: register image numbers and metadata.
    ///
    /// Returning `Ok(false)` aborts the run. Image providers must not be
    /// added here.
    ///
    /// # Errors
    ///
    /// Any error is reported to listeners as a run exception.
    fn prepare_run(&mut self, _workspace: &mut Workspace<'_>) -> Result<bool, ModuleError> {
        Ok(true)
    }

    /// Set up a group before its first image set; attach image providers.
    ///
    /// # Errors
    ///
    /// Any error is reported to listeners as a run exception.
    fn prepare_group(
        &mut self,
        _workspace: &mut Workspace<'_>,
        _key: &GroupKey,
        _image_numbers: &[usize],
    ) -> Result<bool, ModuleError> {
        Ok(true)
    }

    /// Finish a group after its last image set.
    ///
    /// # Errors
    ///
    /// Any error is reported to listeners as a run exception.
    fn post_group(&mut self, _workspace: &mut Workspace<'_>, _key: &GroupKey) -> Result<bool, ModuleError> {
        Ok(true)
    }

    /// Aggregate after the last group.
    ///
    /// # Errors
    ///
    /// Any error is reported to listeners as a run exception.
    fn post_run(&mut self, _workspace: &mut Workspace<'_>) -> Result<(), ModuleError> {
        Ok(())
    }

    /// Columns this module writes.
    fn get_measurement_columns(&self, _pipeline: &Pipeline) -> Vec<MeasurementColumn> {
        Vec::new()
    }

    /// Groups of image numbers, if this module defines them.
    fn get_groupings(&self, _workspace: &Workspace<'_>) -> Option<Groupings> {
        None
    }

    /// Whether this module loads `image_name` from a file.
    fn is_image_from_file(&self, _image_name: &str) -> bool {
        false
    }

    /// Names provided without a dedicated provider setting.
    fn other_providers(&self, _namespace: Namespace) -> Vec<String> {
        Vec::new()
    }

    /// Whether this and later modules skip the per-module bookkeeping columns.
    fn should_stop_writing_measurements(&self) -> bool {
        false
    }

    /// Called once the whole pipeline has been loaded.
    fn post_pipeline_load(&mut self) {}

    /// Check the settings against the rest of the pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`ModuleError::Validation`] describing the problem.
    fn test_valid(&self, _pipeline: &Pipeline) -> Result<(), ModuleError> {
        Ok(())
    }

    /// Rewrite stored paths for a batch run on another host.
    ///
    /// # Errors
    ///
    /// Any error is reported to listeners as a run exception.
    fn prepare_to_create_batch(&mut self, _alter_path: &dyn Fn(&str) -> String) -> Result<(), ModuleError> {
        Ok(())
    }

    /// `Some(true)` if this module marks the pipeline as a batch pipeline.
    fn in_batch_mode(&self) -> Option<bool> {
        None
    }

    /// Restore an editable state after loading a batch pipeline.
    fn turn_off_batch_mode(&mut self) {}
}

/// Metadata persisted with each module in the pipeline file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleAttributes {
    /// One-based position in the pipeline.
    pub module_num: usize,
    /// Source revision marker written for compatibility.
    pub svn_version: String,
    /// Whether the module's display window is shown.
    pub show_window: bool,
    /// Free-text notes, one entry per line.
    pub notes: Vec<String>,
    /// Opaque state used by batch runs.
    pub batch_state: Vec<u8>,
}

impl Default for ModuleAttributes {
    fn default() -> Self {
        Self {
            module_num: 0,
            svn_version: "Unknown".to_string(),
            show_window: true,
            notes: Vec::new(),
            batch_state: Vec::new(),
        }
    }
}

/// A module owned by a pipeline, with its persisted attributes.
pub struct PipelineModule {
    /// Persisted metadata.
    pub attributes: ModuleAttributes,
    module: Box<dyn Module>,
}

impl PipelineModule {
    /// Wrap a module with default attributes.
    #[must_use]
    pub fn new(module: Box<dyn Module>) -> Self {
        Self {
            attributes: ModuleAttributes::default(),
            module,
        }
    }

    /// Wrap a module with explicit attributes.
    #[must_use]
    pub const fn with_attributes(module: Box<dyn Module>, attributes: ModuleAttributes) -> Self {
        Self { attributes, module }
    }

    /// One-based position.
    #[must_use]
    pub const fn module_num(&self) -> usize {
        self.attributes.module_num
    }

    /// The module's name.
    #[must_use]
    pub fn module_name(&self) -> &str {
        self.module.module_name()
    }

    /// Current setting values in order.
    #[must_use]
    pub fn setting_values(&self) -> Vec<String> {
        self.module.settings().into_iter().map(|s| s.value).collect()
    }

    /// The wrapped module.
    #[must_use]
    pub fn module(&self) -> &dyn Module {
        self.module.as_ref()
    }

    /// The wrapped module, mutably.
    pub fn module_mut(&mut self) -> &mut dyn Module {
        self.module.as_mut()
    }

    /// Bookkeeping column name recording whether the module failed.
    #[must_use]
    pub fn error_feature(&self) -> String {
        format!("ModuleError_{:02}{}", self.module_num(), self.module_name())
    }

    /// Bookkeeping column name recording the module's execution time.
    #[must_use]
    pub fn execution_time_feature(&self) -> String {
        format!("ExecutionTime_{:02}{}", self.module_num(), self.module_name())
    }
}

impl From<Box<dyn Module>> for PipelineModule {
    fn from(module: Box<dyn Module>) -> Self {
        Self::new(module)
    }
}

impl fmt::Debug for PipelineModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineModule")
            .field("module_name", &self.module_name())
            .field("attributes", &self.attributes)
            .field("settings", &self.setting_values())
            .finish()
    }
}
