//! Pipeline events and the synchronous listener registry.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{LoadError, ModuleError};

/// Direction of a module move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Towards module 1.
    Up,
    /// Towards the end of the pipeline.
    Down,
}

impl Direction {
    /// The reverse direction.
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Up => Self::Down,
            Self::Down => Self::Up,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Up => "up",
            Self::Down => "down",
        })
    }
}

/// A module hook failed during a run.
///
/// Listeners set `cancel_run` to abort the run or `skip_thisset` to abandon
/// the current image set. Both default to the values shown by
/// [`RunExceptionEvent::new`].
#[derive(Debug)]
pub struct RunExceptionEvent<'a> {
    /// The failure.
    pub error: &'a ModuleError,
    /// One-based number of the failing module.
    pub module_num: usize,
    /// Name of the failing module.
    pub module_name: &'a str,
    /// Abort the whole run.
    pub cancel_run: bool,
    /// Abandon only the current image set.
    pub skip_thisset: bool,
}

impl<'a> RunExceptionEvent<'a> {
    /// A new event; cancels the run unless a listener says otherwise.
    #[must_use]
    pub const fn new(error: &'a ModuleError, module_num: usize, module_name: &'a str) -> Self {
        Self {
            error,
            module_num,
            module_name,
            cancel_run: true,
            skip_thisset: false,
        }
    }
}

/// A module record could not be loaded.
#[derive(Debug)]
pub struct LoadExceptionEvent<'a> {
    /// The failure.
    pub error: &'a LoadError,
    /// Module name, when the header was readable.
    pub module_name: Option<&'a str>,
    /// Setting values read so far.
    pub settings: &'a [String],
    /// Stop loading the remaining modules.
    pub cancel_run: bool,
}

impl<'a> LoadExceptionEvent<'a> {
    /// A new event; stops the load unless a listener says otherwise.
    #[must_use]
    pub const fn new(error: &'a LoadError, module_name: Option<&'a str>, settings: &'a [String]) -> Self {
        Self {
            error,
            module_name,
            settings,
            cancel_run: true,
        }
    }
}

/// Something that happened to a pipeline.
#[derive(Debug)]
pub enum PipelineEvent<'a> {
    /// The module list was replaced by a load.
    Loaded,
    /// Every module was removed.
    Cleared,
    /// A module was inserted at `module_num`.
    ModuleAdded {
        /// Position of the new module.
        module_num: usize,
    },
    /// The module at `module_num` was removed.
    ModuleRemoved {
        /// Former position.
        module_num: usize,
    },
    /// A module moved to `module_num`.
    ModuleMoved {
        /// New position.
        module_num: usize,
        /// Direction of travel.
        direction: Direction,
    },
    /// A module's settings changed.
    ModuleEdited {
        /// Position of the edited module.
        module_num: usize,
    },
    /// A module hook failed during a run.
    RunException(RunExceptionEvent<'a>),
    /// A module record failed to load.
    LoadException(LoadExceptionEvent<'a>),
    /// A run finished, successfully or not.
    EndRun,
}

impl PipelineEvent<'_> {
    /// Short human-readable event name.
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::Loaded => "PipelineLoaded",
            Self::Cleared => "PipelineCleared",
            Self::ModuleAdded { .. } => "Module Added",
            Self::ModuleRemoved { .. } => "Module deleted",
            Self::ModuleMoved { .. } => "Module moved",
            Self::ModuleEdited { .. } => "Module edited",
            Self::RunException(_) => "Pipeline run exception",
            Self::LoadException(_) => "Pipeline load exception",
            Self::EndRun => "Run ended",
        }
    }
}

/// Handle returned by [`Listeners::add`] for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// A listener callback.
pub type Listener = Box<dyn FnMut(&mut PipelineEvent<'_>) + Send>;

/// Callbacks invoked synchronously, in registration order.
#[derive(Default)]
pub struct Listeners {
    next_id: u64,
    entries: Vec<(ListenerId, Listener)>,
}

impl fmt::Debug for Listeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("count", &self.entries.len())
            .finish()
    }
}

impl Listeners {
    /// Register a callback.
    pub fn add<F>(&mut self, listener: F) -> ListenerId
    where
        F: FnMut(&mut PipelineEvent<'_>) + Send + 'static,
    {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.entries.push((id, Box::new(listener)));
        id
    }

    /// Unregister a callback. Returns `false` if `id` was unknown.
    pub fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry_id, _)| *entry_id != id);
        self.entries.len() != before
    }

    /// Deliver `event` to every listener.
    pub fn notify(&mut self, event: &mut PipelineEvent<'_>) {
        for (_, listener) in &mut self.entries {
            listener(event);
        }
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no listeners are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[test]
    fn listeners_run_in_registration_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut listeners = Listeners::default();
        for tag in ["first", "second"] {
            let seen = Arc::clone(&seen);
            listeners.add(move |event| {
                if let Ok(mut seen) = seen.lock() {
                    seen.push(format!("{tag}:{}", event.event_type()));
                }
            });
        }
        listeners.notify(&mut PipelineEvent::Cleared);
        let seen = seen.lock().map(|s| s.clone()).unwrap_or_default();
        assert_eq!(seen, vec!["first:PipelineCleared", "second:PipelineCleared"]);
    }

    #[test]
    fn removed_listener_is_not_called() {
        let count = Arc::new(Mutex::new(0));
        let mut listeners = Listeners::default();
        let counter = Arc::clone(&count);
        let id = listeners.add(move |_| {
            if let Ok(mut c) = counter.lock() {
                *c += 1;
            }
        });
        assert!(listeners.remove(id));
        assert!(!listeners.remove(id));
        listeners.notify(&mut PipelineEvent::EndRun);
        assert_eq!(count.lock().map(|c| *c).unwrap_or(99), 0);
    }

    #[test]
    fn listener_can_downgrade_run_exception() {
        let mut listeners = Listeners::default();
        listeners.add(|event| {
            if let PipelineEvent::RunException(e) = event {
                e.cancel_run = false;
                e.skip_thisset = true;
            }
        });
        let error = ModuleError::Failed("boom".into());
        let mut event = PipelineEvent::RunException(RunExceptionEvent::new(&error, 2, "Crop"));
        listeners.notify(&mut event);
        let PipelineEvent::RunException(e) = event else {
            unreachable!("event kind does not change");
        };
        assert!(!e.cancel_run);
        assert!(e.skip_thisset);
    }

    #[test]
    fn direction_opposite_and_display() {
        assert_eq!(Direction::Up.opposite(), Direction::Down);
        assert_eq!(Direction::Down.to_string(), "down");
    }
}
