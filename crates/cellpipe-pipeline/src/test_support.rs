//! Configurable module used by the unit tests.

#![allow(clippy::panic)]

use std::sync::{Arc, Mutex};

use crate::grouping::{GroupKey, Groupings};
use crate::measurements::{ColumnType, IMAGE, MeasurementColumn, MeasurementValue};
use crate::module::{Disposition, Module, PipelineModule};
use crate::pipeline::Pipeline;
use crate::registry::ModuleRegistry;
use crate::setting::{Namespace, Setting, SettingRole};
use crate::types::ModuleError;
use crate::workspace::Workspace;

pub const MOCK_REVISION: u32 = 3;

pub type CallLog = Arc<Mutex<Vec<String>>>;

#[derive(Clone, Default)]
pub struct MockModule {
    name: String,
    values: Vec<String>,
    roles: Vec<SettingRole>,
    columns: Vec<(String, String)>,
    other_providers: Vec<(Namespace, String)>,
    image_count: usize,
    group_by: Option<Vec<String>>,
    fail_on: Option<Option<usize>>,
    disposition_on: Option<(Option<usize>, Disposition)>,
    writes: Option<String>,
    stop_writing: bool,
    invalid: Option<String>,
    reject_prepare_run: bool,
    provider_in_prepare_run: bool,
    fail_post_group: bool,
    panics: bool,
    log: Option<CallLog>,
}

impl MockModule {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn boxed(name: &str) -> Box<dyn Module> {
        Self::new(name).into_box()
    }

    pub fn into_box(self) -> Box<dyn Module> {
        Box::new(self)
    }

    pub fn with_values(mut self, values: &[&str]) -> Self {
        self.values = values.iter().map(|v| (*v).to_string()).collect();
        self.roles = vec![SettingRole::Plain; values.len()];
        self
    }

    pub fn with_setting(mut self, role: SettingRole, value: &str) -> Self {
        self.values.push(value.to_string());
        self.roles.push(role);
        self
    }

    pub fn providing(self, namespace: Namespace, name: &str) -> Self {
        self.with_setting(SettingRole::Provider(namespace), name)
    }

    pub fn subscribing(self, namespace: Namespace, name: &str) -> Self {
        self.with_setting(SettingRole::Subscriber(namespace), name)
    }

    pub fn with_column(mut self, object_name: &str, feature: &str) -> Self {
        self.columns.push((object_name.to_string(), feature.to_string()));
        self
    }

    pub fn with_other_provider(mut self, namespace: Namespace, name: &str) -> Self {
        self.other_providers.push((namespace, name.to_string()));
        self
    }

    /// Registers image numbers `1..=count` in `prepare_run`.
    pub fn with_images(mut self, count: usize) -> Self {
        self.image_count = count;
        self
    }

    pub fn grouped_by(mut self, keys: &[&str]) -> Self {
        self.group_by = Some(keys.iter().map(|k| (*k).to_string()).collect());
        self
    }

    /// Fails `run` for every image set, or only for `image_number`.
    pub fn failing(mut self, image_number: Option<usize>) -> Self {
        self.fail_on = Some(image_number);
        self
    }

    pub fn with_disposition(mut self, image_number: Option<usize>, disposition: Disposition) -> Self {
        self.disposition_on = Some((image_number, disposition));
        self
    }

    /// Records the image number under `Image/<feature>` in `run`.
    pub fn writing(mut self, feature: &str) -> Self {
        self.writes = Some(feature.to_string());
        self
    }

    pub fn stop_writing(mut self) -> Self {
        self.stop_writing = true;
        self
    }

    pub fn invalid(mut self, message: &str) -> Self {
        self.invalid = Some(message.to_string());
        self
    }

    pub fn rejecting_prepare_run(mut self) -> Self {
        self.reject_prepare_run = true;
        self
    }

    pub fn adding_provider_in_prepare_run(mut self) -> Self {
        self.provider_in_prepare_run = true;
        self
    }

    pub fn failing_post_group(mut self) -> Self {
        self.fail_post_group = true;
        self
    }

    pub fn panicking(mut self) -> Self {
        self.panics = true;
        self
    }

    pub fn logging_to(mut self, log: &CallLog) -> Self {
        self.log = Some(Arc::clone(log));
        self
    }

    fn record(&self, entry: String) {
        if let Some(log) = &self.log
            && let Ok(mut log) = log.lock()
        {
            log.push(format!("{}:{entry}", self.name));
        }
    }

    fn applies(filter: Option<usize>, workspace: &Workspace<'_>) -> bool {
        filter.is_none() || filter == workspace.image_number()
    }
}

struct NullProvider;

impl crate::image_set::ImageProvider for NullProvider {
    fn name(&self) -> &str {
        "Null"
    }

    fn provide_image(&mut self) -> Result<crate::image_set::Image, ModuleError> {
        Ok(crate::image_set::Image::new(crate::grid::Grid::new(1, 1, 0.0)))
    }
}

impl Module for MockModule {
    fn module_name(&self) -> &str {
        &self.name
    }

    fn variable_revision_number(&self) -> u32 {
        MOCK_REVISION
    }

    fn settings(&self) -> Vec<Setting> {
        self.values
            .iter()
            .enumerate()
            .map(|(i, value)| Setting {
                text: format!("Setting {}", i + 1),
                value: value.clone(),
                role: self.roles.get(i).cloned().unwrap_or(SettingRole::Plain),
            })
            .collect()
    }

    fn set_settings_from_values(&mut self, values: &[String], revision: u32) -> Result<(), ModuleError> {
        if revision > MOCK_REVISION {
            return Err(ModuleError::UnsupportedRevision(revision));
        }
        self.values = values.to_vec();
        self.roles.resize(values.len(), SettingRole::Plain);
        Ok(())
    }

    fn run(&mut self, workspace: &mut Workspace<'_>) -> Result<(), ModuleError> {
        self.record(format!("run:{}", workspace.image_number().unwrap_or(0)));
        if self.panics {
            panic!("mock panic");
        }
        if let Some(filter) = self.fail_on
            && Self::applies(filter, workspace)
        {
            return Err(ModuleError::Failed(format!("{} failed", self.name)));
        }
        if let Some(feature) = &self.writes {
            let n = workspace.image_number().unwrap_or(0);
            workspace.measurements_mut().add_measurement(
                IMAGE,
                feature,
                MeasurementValue::Integer(i64::try_from(n).unwrap_or(0)),
                false,
            )?;
        }
        if let Some((filter, disposition)) = self.disposition_on
            && Self::applies(filter, workspace)
        {
            workspace.set_disposition(disposition);
        }
        Ok(())
    }

    fn prepare_run(&mut self, workspace: &mut Workspace<'_>) -> Result<bool, ModuleError> {
        self.record("prepare_run".to_string());
        for n in 1..=self.image_count {
            workspace.measurements_mut().add_image_number(n)?;
            let plate = if n % 2 == 1 { "P1" } else { "P2" };
            workspace.measurements_mut().add_measurement_for(
                IMAGE,
                "Metadata_Plate",
                n,
                MeasurementValue::from(plate),
                true,
            )?;
        }
        if self.provider_in_prepare_run {
            workspace
                .image_set_list_mut()
                .get_image_set(1)
                .add_provider(Box::new(NullProvider));
        }
        Ok(!self.reject_prepare_run)
    }

    fn prepare_group(
        &mut self,
        _workspace: &mut Workspace<'_>,
        key: &GroupKey,
        image_numbers: &[usize],
    ) -> Result<bool, ModuleError> {
        let key: Vec<&str> = key.values().map(String::as_str).collect();
        self.record(format!("prepare_group:{}:{image_numbers:?}", key.join(",")));
        Ok(true)
    }

    fn post_group(&mut self, _workspace: &mut Workspace<'_>, key: &GroupKey) -> Result<bool, ModuleError> {
        let key: Vec<&str> = key.values().map(String::as_str).collect();
        self.record(format!("post_group:{}", key.join(",")));
        if self.fail_post_group {
            return Err(ModuleError::Failed("post_group failed".into()));
        }
        Ok(true)
    }

    fn post_run(&mut self, _workspace: &mut Workspace<'_>) -> Result<(), ModuleError> {
        self.record("post_run".to_string());
        Ok(())
    }

    fn get_measurement_columns(&self, _pipeline: &Pipeline) -> Vec<MeasurementColumn> {
        let mut columns: Vec<MeasurementColumn> = self
            .columns
            .iter()
            .map(|(object, feature)| MeasurementColumn::new(object.clone(), feature.clone(), ColumnType::Float))
            .collect();
        if let Some(feature) = &self.writes {
            columns.push(MeasurementColumn::new(IMAGE, feature.clone(), ColumnType::Integer));
        }
        columns
    }

    fn get_groupings(&self, workspace: &Workspace<'_>) -> Option<Groupings> {
        self.group_by
            .as_ref()
            .map(|keys| Groupings::by_image_features(workspace.measurements(), keys))
    }

    fn other_providers(&self, namespace: Namespace) -> Vec<String> {
        self.other_providers
            .iter()
            .filter(|(ns, _)| *ns == namespace)
            .map(|(_, name)| name.clone())
            .collect()
    }

    fn should_stop_writing_measurements(&self) -> bool {
        self.stop_writing
    }

    fn test_valid(&self, _pipeline: &Pipeline) -> Result<(), ModuleError> {
        match &self.invalid {
            Some(message) => Err(ModuleError::Validation {
                index: Some(0),
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }
}

/// Registry with plain mock modules named Alpha, Beta, Gamma, and Delta.
pub fn mock_registry() -> Arc<ModuleRegistry> {
    let mut registry = ModuleRegistry::new();
    for name in ["Alpha", "Beta", "Gamma", "Delta"] {
        registry.register(name, move || MockModule::boxed(name));
    }
    Arc::new(registry)
}

/// A pipeline of plain mock modules with the given setting values and an
/// empty undo stack.
pub fn mock_pipeline(modules: &[(&str, &[&str])]) -> Pipeline {
    let mut pipeline = Pipeline::new(mock_registry());
    pipeline.install_modules(
        modules
            .iter()
            .map(|(name, values)| PipelineModule::new(MockModule::new(name).with_values(values).into_box()))
            .collect(),
    );
    pipeline
}

/// A pipeline built from configured mocks, with an empty undo stack.
pub fn pipeline_of(modules: Vec<MockModule>) -> Pipeline {
    let mut pipeline = Pipeline::new(mock_registry());
    pipeline.install_modules(
        modules
            .into_iter()
            .map(|m| PipelineModule::new(m.into_box()))
            .collect(),
    );
    pipeline
}
