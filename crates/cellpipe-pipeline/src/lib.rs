//! cellpipe-pipeline: execution core for image-analysis pipelines.
//!
//! A [`Pipeline`] is an ordered list of [`Module`]s. It can be edited with
//! undo, saved to and loaded from the text pipeline format, analysed for
//! provider/consumer dependencies, and run over grouped image sets:
//!
//! prepare_run -> groupings -> (prepare_group -> per image set: modules ->
//! post_group)* -> post_run
//!
//! Every module failure is reported to listeners and recorded as
//! measurements. The crate also carries the seeded watershed-style label
//! propagation ([`propagate()`]) used to grow objects from seeds.
//!
//! Concrete modules live in `cellpipe-modules`; this crate only defines
//! the contract they implement.

pub mod codec;
pub mod dependency;
pub mod events;
pub mod grid;
pub mod grouping;
pub mod image_set;
pub mod literal;
pub mod measurements;
pub mod module;
pub mod objects;
pub mod pipeline;
pub mod plugins;
pub mod propagate;
pub mod registry;
pub mod run;
pub mod setting;
pub mod types;
pub mod workspace;

#[cfg(test)]
mod test_support;

pub use codec::LoadOptions;
pub use dependency::{Dependency, DependencyKind, Provider, ProviderKey};
pub use events::{Direction, ListenerId, PipelineEvent};
pub use grid::Grid;
pub use grouping::{GroupKey, Groupings};
pub use image_set::{Image, ImageProvider, ImageSet, ImageSetList};
pub use measurements::{MeasurementColumn, MeasurementValue, Measurements, MeasurementsStore};
pub use module::{Disposition, Module, PipelineModule};
pub use objects::{ObjectSet, Objects};
pub use pipeline::Pipeline;
pub use propagate::{Connectivity, Propagation, propagate};
pub use registry::ModuleRegistry;
pub use run::{ExecutionMode, ExitStatus, RunControl, RunOptions, RunStatus, RunWithYield};
pub use setting::{Namespace, Setting, SettingRole};
pub use types::{LoadError, ModuleError, PipelineError};
pub use workspace::Workspace;
