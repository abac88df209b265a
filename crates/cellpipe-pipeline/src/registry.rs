//! Name → factory table used to instantiate modules when loading pipelines.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::grouping::{GroupKey, Groupings};
use crate::measurements::MeasurementColumn;
use crate::module::Module;
use crate::pipeline::Pipeline;
use crate::plugins::{PluginPreset, plugin_list};
use crate::setting::{Namespace, Setting};
use crate::types::{ModuleError, PipelineError};
use crate::workspace::Workspace;

/// Creates a module with default settings.
pub type ModuleFactory = Arc<dyn Fn() -> Box<dyn Module> + Send + Sync>;

/// Registered module types.
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    factories: BTreeMap<String, ModuleFactory>,
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.factories.keys()).finish()
    }
}

impl ModuleRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` under `name`, replacing any earlier entry.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Module> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.factories.insert(name.clone(), Arc::new(factory)).is_some() {
            warn!(module = %name, "module registration replaced");
        } else {
            debug!(module = %name, "module registered");
        }
    }

    /// A fresh module, or `None` if `name` is not registered.
    #[must_use]
    pub fn create(&self, name: &str) -> Option<Box<dyn Module>> {
        self.factories.get(name).map(|factory| factory())
    }

    /// Whether `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Register every preset manifest in `dir`.
    ///
    /// Each preset must name a registered base module and carry settings
    /// that base accepts. Returns the number of presets registered.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Io`] if `dir` cannot be listed and
    /// [`PipelineError::Plugin`] for the first unusable manifest.
    pub fn load_plugins(&mut self, dir: &Path) -> Result<usize, PipelineError> {
        let paths = plugin_list(dir)?;
        let mut count = 0;
        for path in paths {
            let plugin_error = |reason: String| PipelineError::Plugin {
                path: path.clone(),
                reason,
            };
            let preset = PluginPreset::from_path(&path).map_err(|e| plugin_error(e.to_string()))?;
            let base = self
                .factories
                .get(&preset.base)
                .cloned()
                .ok_or_else(|| plugin_error(format!("unknown base module {:?}", preset.base)))?;

            let mut probe = base();
            if !preset.settings.is_empty() {
                let revision = probe.variable_revision_number();
                probe
                    .set_settings_from_values(&preset.settings, revision)
                    .map_err(|e| plugin_error(e.to_string()))?;
            }

            let name = preset.name.clone();
            let settings = preset.settings.clone();
            let factory_name = name.clone();
            self.register(name.clone(), move || {
                let mut inner = base();
                if !settings.is_empty() {
                    let revision = inner.variable_revision_number();
                    if let Err(err) = inner.set_settings_from_values(&settings, revision) {
                        warn!(module = %factory_name, %err, "preset settings rejected");
                    }
                }
                Box::new(PresetModule {
                    name: factory_name.clone(),
                    inner,
                })
            });
            info!(module = %name, base = %preset.base, path = %path.display(), "registered plugin preset");
            count += 1;
        }
        Ok(count)
    }
}

/// A base module registered under a preset's name.
struct PresetModule {
    name: String,
    inner: Box<dyn Module>,
}

impl Module for PresetModule {
    fn module_name(&self) -> &str {
        &self.name
    }

    fn variable_revision_number(&self) -> u32 {
        self.inner.variable_revision_number()
    }

    fn settings(&self) -> Vec<Setting> {
        self.inner.settings()
    }

    fn visible_settings(&self) -> Vec<Setting> {
        self.inner.visible_settings()
    }

    fn set_settings_from_values(&mut self, values: &[String], revision: u32) -> Result<(), ModuleError> {
        self.inner.set_settings_from_values(values, revision)
    }

    fn run(&mut self, workspace: &mut Workspace<'_>) -> Result<(), ModuleError> {
        self.inner.run(workspace)
    }

    fn prepare_run(&mut self, workspace: &mut Workspace<'_>) -> Result<bool, ModuleError> {
        self.inner.prepare_run(workspace)
    }

    fn prepare_group(
        &mut self,
        workspace: &mut Workspace<'_>,
        key: &GroupKey,
        image_numbers: &[usize],
    ) -> Result<bool, ModuleError> {
        self.inner.prepare_group(workspace, key, image_numbers)
    }

    fn post_group(&mut self, workspace: &mut Workspace<'_>, key: &GroupKey) -> Result<bool, ModuleError> {
        self.inner.post_group(workspace, key)
    }

    fn post_run(&mut self, workspace: &mut Workspace<'_>) -> Result<(), ModuleError> {
        self.inner.post_run(workspace)
    }

    fn get_measurement_columns(&self, pipeline: &Pipeline) -> Vec<MeasurementColumn> {
        self.inner.get_measurement_columns(pipeline)
    }

    fn get_groupings(&self, workspace: &Workspace<'_>) -> Option<Groupings> {
        self.inner.get_groupings(workspace)
    }

    fn is_image_from_file(&self, image_name: &str) -> bool {
        self.inner.is_image_from_file(image_name)
    }

    fn other_providers(&self, namespace: Namespace) -> Vec<String> {
        self.inner.other_providers(namespace)
    }

    fn should_stop_writing_measurements(&self) -> bool {
        self.inner.should_stop_writing_measurements()
    }

    fn post_pipeline_load(&mut self) {
        self.inner.post_pipeline_load();
    }

    fn test_valid(&self, pipeline: &Pipeline) -> Result<(), ModuleError> {
        self.inner.test_valid(pipeline)
    }

    fn prepare_to_create_batch(&mut self, alter_path: &dyn Fn(&str) -> String) -> Result<(), ModuleError> {
        self.inner.prepare_to_create_batch(alter_path)
    }

    fn in_batch_mode(&self) -> Option<bool> {
        self.inner.in_batch_mode()
    }

    fn turn_off_batch_mode(&mut self) {
        self.inner.turn_off_batch_mode();
    }
}
