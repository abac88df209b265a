//! The ordered module list: editing, undo, listeners, and measurement
//! column bookkeeping.
//!
//! Running lives in [`crate::run`], dependency analysis in
//! [`crate::dependency`], and the text format in [`crate::codec`]; all
//! three extend [`Pipeline`] with further `impl` blocks.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hasher as _;
use std::sync::Arc;

use siphasher::sip128::{Hasher128 as _, SipHasher13};
use tracing::{debug, error};

use crate::codec::LoadOptions;
use crate::events::{Direction, ListenerId, PipelineEvent, RunExceptionEvent};
use crate::measurements::{
    ColumnType, EXPERIMENT, GROUP_INDEX, GROUP_NUMBER, IMAGE, M_PIPELINE, MeasurementColumn,
};
use crate::module::PipelineModule;
use crate::registry::ModuleRegistry;
use crate::types::{LoadError, ModuleError, PipelineError};

/// Label reported by [`Pipeline::undo_action`] when the stack is empty.
pub const NOTHING_TO_UNDO: &str = "Nothing to undo";

/// Position on the undo stack returned by
/// [`Pipeline::start_undoable_action`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UndoMark(usize);

/// Inverse of one edit, with the snapshot needed to apply it.
enum UndoAction {
    Remove {
        module_num: usize,
    },
    Insert {
        module: PipelineModule,
    },
    Move {
        module_num: usize,
        direction: Direction,
    },
    RestoreSettings {
        module_num: usize,
        values: Vec<String>,
        revision: u32,
    },
    Restore {
        modules: Vec<PipelineModule>,
    },
    Composite(Vec<UndoEntry>),
}

struct UndoEntry {
    message: String,
    action: UndoAction,
}

#[derive(Default)]
struct ColumnCache {
    settings_hash: Option<u128>,
    by_terminator: HashMap<Option<usize>, Vec<MeasurementColumn>>,
}

/// An ordered list of modules with persistent settings.
pub struct Pipeline {
    modules: Vec<PipelineModule>,
    settings: Vec<Vec<String>>,
    listeners: crate::events::Listeners,
    undo_stack: Vec<UndoEntry>,
    column_cache: RefCell<ColumnCache>,
    test_mode: bool,
    registry: Arc<ModuleRegistry>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new(Arc::new(ModuleRegistry::new()))
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("modules", &self.modules)
            .field("listeners", &self.listeners)
            .field("undo_depth", &self.undo_stack.len())
            .field("test_mode", &self.test_mode)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// An empty pipeline that instantiates modules from `registry` when
    /// loading.
    #[must_use]
    pub fn new(registry: Arc<ModuleRegistry>) -> Self {
        Self {
            modules: Vec::new(),
            settings: Vec::new(),
            listeners: crate::events::Listeners::default(),
            undo_stack: Vec::new(),
            column_cache: RefCell::new(ColumnCache::default()),
            test_mode: false,
            registry,
        }
    }

    /// The registry used by [`loadtxt`](Self::loadtxt).
    #[must_use]
    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    /// Modules in execution order; `modules()[i].module_num() == i + 1`.
    #[must_use]
    pub fn modules(&self) -> &[PipelineModule] {
        &self.modules
    }

    pub(crate) fn modules_mut(&mut self) -> &mut [PipelineModule] {
        &mut self.modules
    }

    /// The module numbered `module_num`.
    #[must_use]
    pub fn module(&self, module_num: usize) -> Option<&PipelineModule> {
        module_num.checked_sub(1).and_then(|i| self.modules.get(i))
    }

    /// The module numbered `module_num`, mutably.
    ///
    /// Call [`edit_module`](Self::edit_module) after changing its settings
    /// so the change can be undone.
    pub fn module_mut(&mut self, module_num: usize) -> Option<&mut PipelineModule> {
        module_num.checked_sub(1).and_then(|i| self.modules.get_mut(i))
    }

    /// Number of modules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Whether the pipeline has no modules.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Whether runs process only a sample of the images.
    #[must_use]
    pub const fn test_mode(&self) -> bool {
        self.test_mode
    }

    /// Switch test mode on or off.
    pub const fn set_test_mode(&mut self, test_mode: bool) {
        self.test_mode = test_mode;
    }

    /// Register a listener; it is called synchronously for every event.
    pub fn add_listener<F>(&mut self, listener: F) -> ListenerId
    where
        F: FnMut(&mut PipelineEvent<'_>) + Send + 'static,
    {
        self.listeners.add(listener)
    }

    /// Unregister a listener. Returns `false` if `id` was unknown.
    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    pub(crate) fn notify(&mut self, event: &mut PipelineEvent<'_>) {
        self.listeners.notify(event);
    }

    /// Report a failed module hook; returns `(cancel_run, skip_thisset)`.
    pub(crate) fn report_run_exception(
        &mut self,
        module_num: usize,
        module_name: &str,
        error: &ModuleError,
    ) -> (bool, bool) {
        error!(module_num, module = module_name, %error, "module failed");
        let mut event = PipelineEvent::RunException(RunExceptionEvent::new(error, module_num, module_name));
        self.notify(&mut event);
        match event {
            PipelineEvent::RunException(e) => (e.cancel_run, e.skip_thisset),
            _ => (true, false),
        }
    }

    /// Insert a module at `module_num` (1 to `len() + 1`), shifting later
    /// modules down.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::ModuleOutOfRange`] for any other position.
    pub fn add_module(&mut self, module_num: usize, module: impl Into<PipelineModule>) -> Result<(), PipelineError> {
        if module_num == 0 || module_num > self.modules.len() + 1 {
            return Err(self.out_of_range(module_num));
        }
        let module = module.into();
        let name = module.module_name().to_string();
        let idx = module_num - 1;
        self.settings.insert(idx, module.setting_values());
        self.modules.insert(idx, module);
        self.renumber();
        debug!(module_num, module = %name, "module added");
        self.notify(&mut PipelineEvent::ModuleAdded { module_num });
        self.push_undo(format!("Add {name} module"), UndoAction::Remove { module_num });
        Ok(())
    }

    /// Remove the module numbered `module_num`, shifting later modules up.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::ModuleOutOfRange`] if there is no such module.
    pub fn remove_module(&mut self, module_num: usize) -> Result<(), PipelineError> {
        self.check_module_num(module_num)?;
        let idx = module_num - 1;
        let module = self.modules.remove(idx);
        self.settings.remove(idx);
        self.renumber();
        let name = module.module_name().to_string();
        debug!(module_num, module = %name, "module removed");
        self.notify(&mut PipelineEvent::ModuleRemoved { module_num });
        self.push_undo(format!("Remove {name} module"), UndoAction::Insert { module });
        Ok(())
    }

    /// Swap the module with its neighbour in `direction`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::CannotMove`] when moving the first module up
    /// or the last module down, and [`PipelineError::ModuleOutOfRange`] if
    /// there is no such module.
    pub fn move_module(&mut self, module_num: usize, direction: Direction) -> Result<(), PipelineError> {
        self.check_module_num(module_num)?;
        let new_num = match direction {
            Direction::Up if module_num > 1 => module_num - 1,
            Direction::Down if module_num < self.modules.len() => module_num + 1,
            _ => {
                return Err(PipelineError::CannotMove {
                    module_num,
                    direction,
                });
            }
        };
        self.modules.swap(module_num - 1, new_num - 1);
        self.settings.swap(module_num - 1, new_num - 1);
        self.renumber();
        let name = self.modules[new_num - 1].module_name().to_string();
        debug!(from = module_num, to = new_num, module = %name, "module moved");
        self.notify(&mut PipelineEvent::ModuleMoved {
            module_num: new_num,
            direction,
        });
        self.push_undo(
            format!("Move {name} {direction}"),
            UndoAction::Move {
                module_num: new_num,
                direction: direction.opposite(),
            },
        );
        Ok(())
    }

    /// Record that the settings of `module_num` changed.
    ///
    /// The previous snapshot is kept so [`undo`](Self::undo) can restore it.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::ModuleOutOfRange`] if there is no such module.
    pub fn edit_module(&mut self, module_num: usize) -> Result<(), PipelineError> {
        self.check_module_num(module_num)?;
        let idx = module_num - 1;
        let pm = &self.modules[idx];
        let name = pm.module_name().to_string();
        let revision = pm.module().variable_revision_number();
        let values = std::mem::replace(&mut self.settings[idx], pm.setting_values());
        debug!(module_num, module = %name, "module edited");
        self.notify(&mut PipelineEvent::ModuleEdited { module_num });
        self.push_undo(
            format!("Edited {name}"),
            UndoAction::RestoreSettings {
                module_num,
                values,
                revision,
            },
        );
        Ok(())
    }

    /// Apply new setting values to `module_num` and record the edit.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::ModuleOutOfRange`] or, if the module rejects
    /// the values, [`PipelineError::Module`].
    pub fn set_module_settings(&mut self, module_num: usize, values: &[String]) -> Result<(), PipelineError> {
        self.check_module_num(module_num)?;
        let pm = &mut self.modules[module_num - 1];
        let revision = pm.module().variable_revision_number();
        pm.module_mut()
            .set_settings_from_values(values, revision)
            .map_err(|source| PipelineError::Module {
                module_num,
                module_name: pm.module_name().to_string(),
                source,
            })?;
        self.edit_module(module_num)
    }

    /// Remove every module.
    pub fn clear(&mut self) {
        let modules = std::mem::take(&mut self.modules);
        self.settings.clear();
        debug!(removed = modules.len(), "pipeline cleared");
        self.notify(&mut PipelineEvent::Cleared);
        self.push_undo("Undo clear".to_string(), UndoAction::Restore { modules });
    }

    /// Replace the module list wholesale, as a load does.
    pub(crate) fn install_modules(&mut self, modules: Vec<PipelineModule>) {
        self.modules = modules;
        self.renumber();
        self.settings = self.modules.iter().map(PipelineModule::setting_values).collect();
        for pm in &mut self.modules {
            pm.module_mut().post_pipeline_load();
        }
        self.notify(&mut PipelineEvent::Loaded);
        self.undo_stack.clear();
    }

    /// Whether there is anything to undo.
    #[must_use]
    pub fn has_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    /// Label of the edit [`undo`](Self::undo) would reverse.
    #[must_use]
    pub fn undo_action(&self) -> &str {
        self.undo_stack
            .last()
            .map_or(NOTHING_TO_UNDO, |entry| entry.message.as_str())
    }

    /// Reverse the most recent edit. Does nothing if the stack is empty.
    ///
    /// The inverse is applied with the stack detached, so it does not record
    /// an undo entry of its own.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Module`] if a module rejects its restored
    /// settings.
    pub fn undo(&mut self) -> Result<(), PipelineError> {
        let Some(entry) = self.undo_stack.pop() else {
            return Ok(());
        };
        debug!(action = %entry.message, "undo");
        let saved = std::mem::take(&mut self.undo_stack);
        let result = self.apply_undo(entry.action);
        self.undo_stack = saved;
        result
    }

    /// Begin a group of edits that [`stop_undoable_action`](Self::stop_undoable_action)
    /// collapses into one undo entry.
    #[must_use]
    pub fn start_undoable_action(&self) -> UndoMark {
        UndoMark(self.undo_stack.len())
    }

    /// Collapse the edits since `mark` into one entry labelled `label`.
    ///
    /// Fewer than two edits are left as they are.
    pub fn stop_undoable_action(&mut self, mark: UndoMark, label: impl Into<String>) {
        if self.undo_stack.len() < mark.0 + 2 {
            return;
        }
        let entries = self.undo_stack.split_off(mark.0);
        self.push_undo(label.into(), UndoAction::Composite(entries));
    }

    fn push_undo(&mut self, message: String, action: UndoAction) {
        self.undo_stack.push(UndoEntry { message, action });
    }

    fn apply_undo(&mut self, action: UndoAction) -> Result<(), PipelineError> {
        match action {
            UndoAction::Remove { module_num } => self.remove_module(module_num),
            UndoAction::Insert { module } => {
                let module_num = module.module_num();
                self.add_module(module_num, module)
            }
            UndoAction::Move { module_num, direction } => self.move_module(module_num, direction),
            UndoAction::RestoreSettings {
                module_num,
                values,
                revision,
            } => {
                self.check_module_num(module_num)?;
                let pm = &mut self.modules[module_num - 1];
                pm.module_mut()
                    .set_settings_from_values(&values, revision)
                    .map_err(|source| PipelineError::Module {
                        module_num,
                        module_name: pm.module_name().to_string(),
                        source,
                    })?;
                self.settings[module_num - 1] = values;
                self.notify(&mut PipelineEvent::ModuleEdited { module_num });
                Ok(())
            }
            UndoAction::Restore { modules } => {
                for (i, module) in modules.into_iter().enumerate() {
                    self.add_module(i + 1, module)?;
                }
                Ok(())
            }
            UndoAction::Composite(entries) => {
                for entry in entries.into_iter().rev() {
                    self.apply_undo(entry.action)?;
                }
                Ok(())
            }
        }
    }

    fn renumber(&mut self) {
        for (i, pm) in self.modules.iter_mut().enumerate() {
            pm.attributes.module_num = i + 1;
        }
    }

    fn out_of_range(&self, module_num: usize) -> PipelineError {
        PipelineError::ModuleOutOfRange {
            module_num,
            len: self.modules.len(),
        }
    }

    fn check_module_num(&self, module_num: usize) -> Result<(), PipelineError> {
        if module_num == 0 || module_num > self.modules.len() {
            return Err(self.out_of_range(module_num));
        }
        Ok(())
    }

    /// 128-bit hash of every module name and setting value.
    #[must_use]
    pub fn settings_hash(&self) -> u128 {
        let mut hasher = SipHasher13::new();
        let mut write = |text: &str| {
            hasher.write(&(text.len() as u64).to_le_bytes());
            hasher.write(text.as_bytes());
        };
        for pm in &self.modules {
            write(pm.module_name());
            for value in pm.setting_values() {
                write(&value);
            }
        }
        hasher.finish128().as_u128()
    }

    /// Columns the pipeline writes, in module order.
    ///
    /// The group and pipeline bookkeeping columns come first. Each module
    /// contributes its own columns and then its failure-flag and timing
    /// columns, until a module stops measurement writing. With
    /// `terminating_module`, modules from that number on are ignored.
    #[must_use]
    pub fn get_measurement_columns(&self, terminating_module: Option<usize>) -> Vec<MeasurementColumn> {
        let hash = self.settings_hash();
        {
            let cache = self.column_cache.borrow();
            if cache.settings_hash == Some(hash)
                && let Some(columns) = cache.by_terminator.get(&terminating_module)
            {
                return columns.clone();
            }
        }

        let mut columns = vec![
            MeasurementColumn::new(EXPERIMENT, M_PIPELINE, ColumnType::LongBlob),
            MeasurementColumn::new(IMAGE, GROUP_NUMBER, ColumnType::Integer),
            MeasurementColumn::new(IMAGE, GROUP_INDEX, ColumnType::Integer),
        ];
        let mut write_bookkeeping = true;
        for pm in &self.modules {
            if terminating_module.is_some_and(|t| t <= pm.module_num()) {
                break;
            }
            columns.extend(pm.module().get_measurement_columns(self));
            if pm.module().should_stop_writing_measurements() {
                write_bookkeeping = false;
            }
            if write_bookkeeping {
                columns.push(MeasurementColumn::new(IMAGE, pm.error_feature(), ColumnType::Integer));
                columns.push(MeasurementColumn::new(
                    IMAGE,
                    pm.execution_time_feature(),
                    ColumnType::Float,
                ));
            }
        }

        let mut cache = self.column_cache.borrow_mut();
        if cache.settings_hash != Some(hash) {
            cache.settings_hash = Some(hash);
            cache.by_terminator.clear();
        }
        cache.by_terminator.insert(terminating_module, columns.clone());
        columns
    }

    /// Find the measurement a module before `module_num` writes for
    /// `object_name`, trying `category_feature_image_scale`,
    /// `category_feature_image`, `category_feature_scale`, then
    /// `category_feature`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::NoSuchMeasurement`] if none is written.
    pub fn synthesize_measurement_name(
        &self,
        module_num: usize,
        object_name: &str,
        category: &str,
        feature: &str,
        image: &str,
        scale: &str,
    ) -> Result<String, PipelineError> {
        let columns = self.get_measurement_columns(Some(module_num));
        let candidates = [
            format!("{category}_{feature}_{image}_{scale}"),
            format!("{category}_{feature}_{image}"),
            format!("{category}_{feature}_{scale}"),
            format!("{category}_{feature}"),
        ];
        candidates
            .into_iter()
            .find(|name| {
                columns
                    .iter()
                    .any(|c| c.object_name == object_name && c.feature == *name)
            })
            .ok_or_else(|| PipelineError::NoSuchMeasurement {
                category: category.to_string(),
                feature: feature.to_string(),
                image: image.to_string(),
                scale: scale.to_string(),
            })
    }

    /// Ask every module to validate itself; the first failure is returned.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Module`] naming the invalid module.
    pub fn test_valid(&self) -> Result<(), PipelineError> {
        for pm in &self.modules {
            pm.module().test_valid(self).map_err(|source| PipelineError::Module {
                module_num: pm.module_num(),
                module_name: pm.module_name().to_string(),
                source,
            })?;
        }
        Ok(())
    }

    /// Whether any module loads `image_name` from a file.
    #[must_use]
    pub fn is_image_from_file(&self, image_name: &str) -> bool {
        self.modules
            .iter()
            .any(|pm| pm.module().is_image_from_file(image_name))
    }

    /// Whether the pipeline is configured for a batch run.
    #[must_use]
    pub fn in_batch_mode(&self) -> bool {
        self.modules
            .iter()
            .find_map(|pm| pm.module().in_batch_mode())
            .unwrap_or(false)
    }

    /// Return every module to an editable state.
    pub fn turn_off_batch_mode(&mut self) {
        for pm in &mut self.modules {
            pm.module_mut().turn_off_batch_mode();
        }
    }

    /// Let each module rewrite stored paths for a batch run.
    ///
    /// Failures are reported as run exceptions; returns `false` if a
    /// listener cancelled.
    pub fn prepare_to_create_batch(&mut self, alter_path: &dyn Fn(&str) -> String) -> bool {
        for idx in 0..self.modules.len() {
            let pm = &mut self.modules[idx];
            if let Err(err) = pm.module_mut().prepare_to_create_batch(alter_path) {
                let module_num = pm.module_num();
                let name = pm.module_name().to_string();
                let (cancel, _) = self.report_run_exception(module_num, &name, &err);
                if cancel {
                    return false;
                }
            }
        }
        true
    }

    /// An independent pipeline with the same modules, rebuilt through the
    /// text format and the registry.
    ///
    /// # Errors
    ///
    /// Returns the [`LoadError`] if a module cannot be rebuilt.
    pub fn copy(&self) -> Result<Self, LoadError> {
        let mut copy = Self::new(Arc::clone(&self.registry));
        copy.test_mode = self.test_mode;
        copy.load_str(&self.to_text(), LoadOptions { raise_on_error: true })?;
        Ok(copy)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::test_support::{MockModule, mock_pipeline, mock_registry};

    fn names(p: &Pipeline) -> Vec<String> {
        p.modules().iter().map(|m| m.module_name().to_string()).collect()
    }

    fn assert_numbered(p: &Pipeline) {
        for (i, pm) in p.modules().iter().enumerate() {
            assert_eq!(pm.module_num(), i + 1);
        }
    }

    #[test]
    fn add_remove_renumber() {
        let mut p = mock_pipeline(&[("Alpha", &[]), ("Beta", &[])]);
        p.add_module(1, MockModule::new("Gamma").into_box())
            .unwrap();
        assert_eq!(names(&p), vec!["Gamma", "Alpha", "Beta"]);
        assert_numbered(&p);
        p.remove_module(2).unwrap();
        assert_eq!(names(&p), vec!["Gamma", "Beta"]);
        assert_numbered(&p);
    }

    #[test]
    fn positions_are_range_checked() {
        let mut p = mock_pipeline(&[("Alpha", &[])]);
        let err = p.add_module(3, MockModule::boxed("Beta")).unwrap_err();
        assert!(matches!(err, PipelineError::ModuleOutOfRange { module_num: 3, len: 1 }));
        assert!(p.remove_module(0).is_err());
        assert!(p.edit_module(2).is_err());
    }

    #[test]
    fn move_limits() {
        let mut p = mock_pipeline(&[("Alpha", &[]), ("Beta", &[])]);
        assert!(matches!(
            p.move_module(1, Direction::Up),
            Err(PipelineError::CannotMove { module_num: 1, direction: Direction::Up })
        ));
        assert!(matches!(
            p.move_module(2, Direction::Down),
            Err(PipelineError::CannotMove { module_num: 2, .. })
        ));
        p.move_module(1, Direction::Down).unwrap();
        assert_eq!(names(&p), vec!["Beta", "Alpha"]);
        assert_eq!(p.undo_action(), "Move Alpha down");
        assert_numbered(&p);
    }

    #[test]
    fn each_edit_is_undoable() {
        let mut p = mock_pipeline(&[("Alpha", &["a"]), ("Beta", &["b"]), ("Gamma", &["c"])]);
        let before = names(&p);

        p.add_module(2, MockModule::boxed("Delta")).unwrap();
        assert_eq!(p.undo_action(), "Add Delta module");
        p.undo().unwrap();
        assert_eq!(names(&p), before);

        p.remove_module(1).unwrap();
        assert_eq!(p.undo_action(), "Remove Alpha module");
        p.undo().unwrap();
        assert_eq!(names(&p), before);
        assert_eq!(p.modules()[0].setting_values(), vec!["a"]);

        p.move_module(3, Direction::Up).unwrap();
        p.undo().unwrap();
        assert_eq!(names(&p), before);

        p.set_module_settings(2, &["changed".to_string()]).unwrap();
        assert_eq!(p.undo_action(), "Edited Beta");
        p.undo().unwrap();
        assert_eq!(p.modules()[1].setting_values(), vec!["b"]);

        p.clear();
        assert!(p.is_empty());
        assert_eq!(p.undo_action(), "Undo clear");
        p.undo().unwrap();
        assert_eq!(names(&p), before);
        assert_numbered(&p);
        assert!(!p.has_undo());
        assert_eq!(p.undo_action(), NOTHING_TO_UNDO);
    }

    #[test]
    fn composite_action_undoes_in_one_step() {
        let mut p = mock_pipeline(&[("Alpha", &[]), ("Beta", &[])]);
        let before = names(&p);
        let mark = p.start_undoable_action();
        p.add_module(3, MockModule::boxed("Gamma")).unwrap();
        p.move_module(3, Direction::Up).unwrap();
        p.remove_module(1).unwrap();
        p.stop_undoable_action(mark, "Rearrange");
        assert_eq!(p.undo_action(), "Rearrange");
        assert_eq!(names(&p), vec!["Gamma", "Beta"]);
        p.undo().unwrap();
        assert_eq!(names(&p), before);
        assert!(!p.has_undo());
    }

    #[test]
    fn single_action_is_not_collapsed() {
        let mut p = mock_pipeline(&[("Alpha", &[])]);
        let mark = p.start_undoable_action();
        p.add_module(2, MockModule::boxed("Beta")).unwrap();
        p.stop_undoable_action(mark, "Composite edit");
        assert_eq!(p.undo_action(), "Add Beta module");
    }

    #[test]
    fn events_are_emitted_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut p = mock_pipeline(&[("Alpha", &[])]);
        let sink = Arc::clone(&seen);
        p.add_listener(move |event| {
            if let Ok(mut s) = sink.lock() {
                s.push(event.event_type());
            }
        });
        p.add_module(2, MockModule::boxed("Beta")).unwrap();
        p.move_module(2, Direction::Up).unwrap();
        p.edit_module(1).unwrap();
        p.remove_module(1).unwrap();
        p.clear();
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["Module Added", "Module moved", "Module edited", "Module deleted", "PipelineCleared"]
        );
    }

    #[test]
    fn bookkeeping_columns() {
        let p = mock_pipeline(&[("Alpha", &[]), ("Beta", &[])]);
        let features: Vec<String> = p
            .get_measurement_columns(None)
            .into_iter()
            .map(|c| format!("{}.{}", c.object_name, c.feature))
            .collect();
        assert_eq!(
            features,
            vec![
                "Experiment.Pipeline_Pipeline",
                "Image.Group_Number",
                "Image.Group_Index",
                "Image.ModuleError_01Alpha",
                "Image.ExecutionTime_01Alpha",
                "Image.ModuleError_02Beta",
                "Image.ExecutionTime_02Beta",
            ]
        );
        assert_eq!(p.get_measurement_columns(Some(2)).len(), 5);
    }

    #[test]
    fn stopping_module_suppresses_later_bookkeeping() {
        let mut p = mock_pipeline(&[("Alpha", &[])]);
        p.add_module(2, MockModule::new("Beta").stop_writing().into_box())
            .unwrap();
        p.add_module(3, MockModule::boxed("Gamma")).unwrap();
        let columns = p.get_measurement_columns(None);
        assert!(columns.iter().any(|c| c.feature == "ModuleError_01Alpha"));
        assert!(!columns.iter().any(|c| c.feature == "ModuleError_02Beta"));
        assert!(!columns.iter().any(|c| c.feature == "ExecutionTime_03Gamma"));
    }

    #[test]
    fn column_cache_follows_settings() {
        let mut p = mock_pipeline(&[("Alpha", &["Nuclei"])]);
        let hash = p.settings_hash();
        let first = p.get_measurement_columns(None);
        p.set_module_settings(1, &["Cells".to_string()]).unwrap();
        assert_ne!(p.settings_hash(), hash);
        assert_eq!(p.get_measurement_columns(None).len(), first.len());
    }

    #[test]
    fn synthesizes_most_specific_measurement() {
        let mut p = mock_pipeline(&[]);
        p.add_module(
            1,
            MockModule::new("Alpha")
                .with_column("Nuclei", "Intensity_MeanIntensity_DNA")
                .with_column("Nuclei", "Texture_Contrast_DNA_3")
                .into_box(),
        )
        .unwrap();
        p.add_module(2, MockModule::boxed("Beta")).unwrap();
        assert_eq!(
            p.synthesize_measurement_name(2, "Nuclei", "Texture", "Contrast", "DNA", "3")
                .unwrap(),
            "Texture_Contrast_DNA_3"
        );
        assert_eq!(
            p.synthesize_measurement_name(2, "Nuclei", "Intensity", "MeanIntensity", "DNA", "1")
                .unwrap(),
            "Intensity_MeanIntensity_DNA"
        );
        assert!(matches!(
            p.synthesize_measurement_name(1, "Nuclei", "Intensity", "MeanIntensity", "DNA", ""),
            Err(PipelineError::NoSuchMeasurement { .. })
        ));
    }

    #[test]
    fn copy_is_independent() {
        let p = mock_pipeline(&[("Alpha", &["a"]), ("Beta", &["b"])]);
        let mut copy = p.copy().unwrap();
        assert_eq!(names(&copy), names(&p));
        copy.set_module_settings(1, &["z".to_string()]).unwrap();
        assert_eq!(p.modules()[0].setting_values(), vec!["a"]);
    }

    #[test]
    fn validation_and_batch_queries() {
        let mut p = Pipeline::new(mock_registry());
        p.add_module(1, MockModule::new("Alpha").invalid("needs an input").into_box())
            .unwrap();
        let err = p.test_valid().unwrap_err();
        assert!(matches!(err, PipelineError::Module { module_num: 1, .. }));
        assert!(!p.in_batch_mode());
        assert!(p.prepare_to_create_batch(&|path: &str| path.replace("/local", "/cluster")));
    }
}
