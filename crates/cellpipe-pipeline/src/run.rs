//! The run lifecycle: prepare, grouped iteration over image sets, and
//! post-run aggregation.
//!
//! [`Pipeline::run_with_yield`] returns an iterator that executes one
//! module step per call to `next`, so a host can refresh, pause, or cancel
//! between steps. [`Pipeline::run`] drives it to completion.
//!
//! ```text
//! prepare_run ─► get_groupings ─┬─► prepare_group ─► (run modules per image set) ─► post_group ─┐
//!                               └──────────────────────────── next group ◄────────────────────────┘
//!                                                              post_run ─► flush ─► EndRun
//! ```

use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::events::PipelineEvent;
use crate::grouping::{GroupKey, Groupings};
use crate::image_set::ImageSetList;
use crate::measurements::{
    EXIT_STATUS, GROUP_INDEX, GROUP_NUMBER, IMAGE, IMAGE_NUMBER, M_PIPELINE, Measurements,
    MeasurementValue, MeasurementsStore,
};
use crate::module::{Disposition, Module};
use crate::objects::ObjectSet;
use crate::pipeline::Pipeline;
use crate::types::{ModuleError, PipelineError};
use crate::workspace::{Outlines, Workspace};

/// Serde support for `Duration` as fractional seconds, for use with
/// `#[serde(with = "cellpipe_pipeline::run::duration_serde")]`.
pub mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    /// Write `duration` as an `f64` number of seconds.
    ///
    /// # Errors
    ///
    /// Propagates serializer errors.
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs_f64().serialize(serializer)
    }

    /// Read an `f64` number of seconds.
    ///
    /// # Errors
    ///
    /// Fails on negative or non-finite values.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs)
            .map_err(|_| serde::de::Error::custom("duration seconds must be finite and non-negative"))
    }
}

/// Where module `run` hooks execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// On the calling thread.
    #[default]
    Foreground,
    /// On a scoped worker thread; the caller waits for it, and a panic
    /// becomes a [`ModuleError::Panicked`] run exception.
    Background,
}

/// Options for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    /// First image number to process.
    pub image_set_start: usize,
    /// Last image number to process; `None` runs to the end.
    pub image_set_end: Option<usize>,
    /// Process only the group with exactly these key values.
    pub grouping: Option<GroupKey>,
    /// Where module `run` hooks execute.
    pub execution: ExecutionMode,
    /// Whether a [`Disposition::Pause`] request suspends the run.
    pub honor_pause: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            image_set_start: 1,
            image_set_end: None,
            grouping: None,
            execution: ExecutionMode::Foreground,
            honor_pause: true,
        }
    }
}

/// Outcome recorded as the `Exit_Status` experiment measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitStatus {
    /// Every group and `post_run` finished.
    Complete,
    /// The run was cancelled or a lifecycle hook aborted it.
    Failure,
}

impl ExitStatus {
    /// The recorded text.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Complete => "Complete",
            Self::Failure => "Failure",
        }
    }
}

/// What a yielded [`RunStatus`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RunPhase {
    /// A module step finished.
    #[default]
    Running,
    /// The run is suspended; resume it through [`RunControl`].
    Paused,
}

/// Progress report yielded after each module step.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RunStatus {
    /// Step kind.
    pub phase: RunPhase,
    /// Image number of the step.
    pub image_number: usize,
    /// One-based module number.
    pub module_num: usize,
    /// Module name.
    pub module_name: String,
    /// One-based group number.
    pub group_number: usize,
    /// One-based position of the image within its group.
    pub group_index: usize,
    /// Whether the module's `run` hook failed.
    pub failed: bool,
    /// Wall-clock time of the module's `run` hook.
    #[serde(with = "duration_serde")]
    pub elapsed: Duration,
}

const RUNNING: u8 = 0;
const PAUSED: u8 = 1;
const CANCELLED: u8 = 2;

/// Shared handle for pausing, resuming, and cancelling a run from outside
/// the iterator.
#[derive(Debug, Clone, Default)]
pub struct RunControl(Arc<AtomicU8>);

impl RunControl {
    /// Suspend the run before its next module step.
    pub fn pause(&self) {
        let _ = self
            .0
            .compare_exchange(RUNNING, PAUSED, Ordering::SeqCst, Ordering::SeqCst);
    }

    /// Resume a paused run.
    pub fn resume(&self) {
        let _ = self
            .0
            .compare_exchange(PAUSED, RUNNING, Ordering::SeqCst, Ordering::SeqCst);
    }

    /// Stop the run before its next module step; it ends with
    /// [`ExitStatus::Failure`].
    pub fn cancel(&self) {
        self.0.store(CANCELLED, Ordering::SeqCst);
    }

    /// Whether the run is paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.0.load(Ordering::SeqCst) == PAUSED
    }

    /// Whether the run was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst) == CANCELLED
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Prepare,
    NextImage,
    Module { image_number: usize, index: usize },
    PostRun,
    Done,
}

/// A group still to be processed.
struct PlannedGroup {
    key: GroupKey,
    number: usize,
    image_numbers: Vec<usize>,
    /// In-range `(image_number, group_index)` pairs not yet started.
    pending: VecDeque<(usize, usize)>,
    prepared: bool,
}

/// A run in progress; see [`Pipeline::run_with_yield`].
///
/// Dropping the iterator early still flushes the measurements and emits
/// [`PipelineEvent::EndRun`].
pub struct RunWithYield<'a> {
    pipeline: &'a mut Pipeline,
    measurements: &'a mut dyn MeasurementsStore,
    options: RunOptions,
    control: RunControl,
    image_set_list: ImageSetList,
    object_set: ObjectSet,
    outlines: Outlines,
    plan: VecDeque<PlannedGroup>,
    step: Step,
    group_position: (usize, usize),
    last_image: Option<usize>,
    write_bookkeeping: bool,
    last_status: Option<RunStatus>,
    exit_status: Option<ExitStatus>,
    finished: bool,
}

impl<'a> RunWithYield<'a> {
    fn new(pipeline: &'a mut Pipeline, measurements: &'a mut dyn MeasurementsStore, options: RunOptions) -> Self {
        let mut image_set_list = ImageSetList::new();
        image_set_list.set_test_mode(pipeline.test_mode());
        Self {
            pipeline,
            measurements,
            options,
            control: RunControl::default(),
            image_set_list,
            object_set: ObjectSet::new(),
            outlines: Outlines::new(),
            plan: VecDeque::new(),
            step: Step::Prepare,
            group_position: (0, 0),
            last_image: None,
            write_bookkeeping: true,
            last_status: None,
            exit_status: None,
            finished: false,
        }
    }

    /// A handle for pausing, resuming, or cancelling this run.
    #[must_use]
    pub fn control(&self) -> RunControl {
        self.control.clone()
    }

    /// Measurements recorded so far.
    #[must_use]
    pub fn measurements(&self) -> &dyn MeasurementsStore {
        &*self.measurements
    }

    /// The exit status, once the run has ended.
    #[must_use]
    pub const fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    fn prepare(&mut self) -> Result<(), PipelineError> {
        let start = self.options.image_set_start;
        let end = self.options.image_set_end.unwrap_or(usize::MAX);
        if end < start {
            return Err(PipelineError::InvalidConfig(format!(
                "image_set_end ({end}) is before image_set_start ({start})"
            )));
        }

        let mut ws = Workspace::new(
            &mut *self.measurements,
            &mut self.image_set_list,
            &mut self.object_set,
            &mut self.outlines,
        );
        if !self.pipeline.prepare_run(&mut ws)? {
            drop(ws);
            info!("prepare_run stopped the run");
            self.conclude(ExitStatus::Failure);
            return Ok(());
        }
        let groupings = self.pipeline.get_groupings(&ws)?;
        drop(ws);

        if let Some(request) = &self.options.grouping
            && !groupings.accepts_request(request)
        {
            return Err(PipelineError::GroupingMismatch {
                requested: request.keys().cloned().collect(),
                computed: groupings.key_names,
            });
        }

        for (i, group) in groupings.groups.into_iter().enumerate() {
            let selected = self.options.grouping.as_ref().is_none_or(|r| *r == group.key);
            let mut pending = VecDeque::new();
            for (j, &image_number) in group.image_numbers.iter().enumerate() {
                if selected && (start..=end).contains(&image_number) {
                    pending.push_back((image_number, j + 1));
                } else {
                    self.measurements.remove_measurement(IMAGE, IMAGE_NUMBER, image_number);
                }
            }
            if !pending.is_empty() {
                self.plan.push_back(PlannedGroup {
                    key: group.key,
                    number: i + 1,
                    image_numbers: group.image_numbers,
                    pending,
                    prepared: false,
                });
            }
        }
        info!(
            groups = self.plan.len(),
            image_sets = self.plan.iter().map(|g| g.pending.len()).sum::<usize>(),
            "run prepared"
        );
        self.step = Step::NextImage;
        Ok(())
    }

    fn next_image(&mut self) -> Result<(), PipelineError> {
        loop {
            let Some(group) = self.plan.front_mut() else {
                self.step = Step::PostRun;
                return Ok(());
            };
            if let Some((image_number, group_index)) = group.pending.pop_front() {
                let group_number = group.number;
                if !group.prepared {
                    group.prepared = true;
                    let key = group.key.clone();
                    let image_numbers = group.image_numbers.clone();
                    let mut ws = Workspace::new(
                        &mut *self.measurements,
                        &mut self.image_set_list,
                        &mut self.object_set,
                        &mut self.outlines,
                    );
                    if !self.pipeline.prepare_group(&mut ws, &key, &image_numbers) {
                        drop(ws);
                        self.conclude(ExitStatus::Failure);
                        return Ok(());
                    }
                }
                self.start_image_set(image_number, group_number, group_index)?;
                return Ok(());
            }
            if let Some(group) = self.plan.pop_front()
                && group.prepared
            {
                let mut ws = Workspace::new(
                    &mut *self.measurements,
                    &mut self.image_set_list,
                    &mut self.object_set,
                    &mut self.outlines,
                );
                if !self.pipeline.post_group(&mut ws, &group.key) {
                    drop(ws);
                    self.conclude(ExitStatus::Failure);
                    return Ok(());
                }
            }
        }
    }

    fn start_image_set(&mut self, image_number: usize, group_number: usize, group_index: usize) -> Result<(), PipelineError> {
        if let Some(previous) = self.last_image.replace(image_number) {
            self.image_set_list.purge_image_set(previous);
        }
        self.measurements.next_image_set(image_number);
        self.measurements
            .add_measurement(IMAGE, GROUP_NUMBER, count_value(group_number), true)?;
        self.measurements
            .add_measurement(IMAGE, GROUP_INDEX, count_value(group_index), true)?;
        self.object_set = ObjectSet::new();
        self.outlines.clear();
        self.write_bookkeeping = true;
        self.group_position = (group_number, group_index);
        debug!(image_number, group_number, group_index, "image set started");
        self.step = Step::Module {
            image_number,
            index: 0,
        };
        Ok(())
    }

    fn module_step(&mut self, image_number: usize, index: usize) -> Result<Option<RunStatus>, PipelineError> {
        let Some(pm) = self.pipeline.modules_mut().get_mut(index) else {
            self.step = Step::NextImage;
            return Ok(None);
        };
        let module_num = pm.module_num();
        let module_name = pm.module_name().to_string();
        let error_feature = pm.error_feature();
        let time_feature = pm.execution_time_feature();
        if pm.module().should_stop_writing_measurements() {
            self.write_bookkeeping = false;
        }

        let mut ws = Workspace::new(
            &mut *self.measurements,
            &mut self.image_set_list,
            &mut self.object_set,
            &mut self.outlines,
        )
        .for_image(image_number);
        ws.set_module(module_num);
        let started = Instant::now();
        let result = execute(pm.module_mut(), &mut ws, self.options.execution);
        let elapsed = started.elapsed();
        let disposition = ws.disposition();
        drop(ws);

        let failed = result.is_err();
        let (mut cancel, mut skip) = (false, false);
        if let Err(err) = &result {
            (cancel, skip) = self.pipeline.report_run_exception(module_num, &module_name, err);
        }
        if self.write_bookkeeping {
            self.measurements
                .add_measurement(IMAGE, &error_feature, MeasurementValue::Integer(i64::from(failed)), true)?;
            self.measurements.add_measurement(
                IMAGE,
                &time_feature,
                MeasurementValue::Float(elapsed.as_secs_f64().max(0.0)),
                true,
            )?;
        }
        info!(
            module = %module_name,
            module_num,
            image_number,
            seconds = elapsed.as_secs_f64(),
            failed,
            "module finished"
        );

        let (group_number, group_index) = self.group_position;
        let status = RunStatus {
            phase: RunPhase::Running,
            image_number,
            module_num,
            module_name,
            group_number,
            group_index,
            failed,
            elapsed,
        };

        if cancel || disposition == Disposition::Cancel {
            warn!(module_num, image_number, "run cancelled");
            self.conclude(ExitStatus::Failure);
        } else if skip || disposition == Disposition::Skip {
            debug!(module_num, image_number, "skipping rest of image set");
            self.step = Step::NextImage;
        } else {
            if disposition == Disposition::Pause && self.options.honor_pause {
                self.control.pause();
            }
            self.step = Step::Module {
                image_number,
                index: index + 1,
            };
        }
        Ok(Some(status))
    }

    fn post_run(&mut self) {
        let mut ws = Workspace::new(
            &mut *self.measurements,
            &mut self.image_set_list,
            &mut self.object_set,
            &mut self.outlines,
        );
        let status = self.pipeline.post_run(&mut ws);
        drop(ws);
        self.conclude(status);
    }

    /// Record the exit status and clean up.
    fn conclude(&mut self, status: ExitStatus) {
        if let Err(err) = self
            .measurements
            .add_experiment_measurement(EXIT_STATUS, MeasurementValue::from(status.as_str()))
        {
            error!(%err, "failed to record exit status");
        }
        self.exit_status = Some(status);
        self.step = Step::Done;
        self.finish();
        info!(status = status.as_str(), "run ended");
    }

    /// Flush and emit `EndRun`, once.
    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let Some(last) = self.last_image.take() {
            self.image_set_list.purge_image_set(last);
        }
        if let Err(err) = self.measurements.flush() {
            error!(%err, "failed to flush measurements");
        }
        self.pipeline.notify(&mut PipelineEvent::EndRun);
    }

    fn paused_status(&self) -> RunStatus {
        RunStatus {
            phase: RunPhase::Paused,
            ..self.last_status.clone().unwrap_or_default()
        }
    }
}

impl Iterator for RunWithYield<'_> {
    type Item = Result<RunStatus, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.step == Step::Done {
                return None;
            }
            if self.control.is_cancelled() {
                warn!("run cancelled by host");
                self.conclude(ExitStatus::Failure);
                return None;
            }
            if self.options.honor_pause && self.control.is_paused() {
                return Some(Ok(self.paused_status()));
            }
            let outcome = match self.step {
                Step::Prepare => self.prepare().map(|()| None),
                Step::NextImage => self.next_image().map(|()| None),
                Step::Module { image_number, index } => self.module_step(image_number, index),
                Step::PostRun => {
                    self.post_run();
                    Ok(None)
                }
                Step::Done => return None,
            };
            match outcome {
                Ok(Some(status)) => {
                    self.last_status = Some(status.clone());
                    return Some(Ok(status));
                }
                Ok(None) => {}
                Err(err) => {
                    error!(%err, "run aborted");
                    self.conclude(ExitStatus::Failure);
                    return Some(Err(err));
                }
            }
        }
    }
}

impl Drop for RunWithYield<'_> {
    fn drop(&mut self) {
        self.finish();
    }
}

fn count_value(n: usize) -> MeasurementValue {
    MeasurementValue::Integer(i64::try_from(n).unwrap_or(i64::MAX))
}

fn execute(module: &mut dyn Module, workspace: &mut Workspace<'_>, mode: ExecutionMode) -> Result<(), ModuleError> {
    match mode {
        ExecutionMode::Foreground => module.run(workspace),
        ExecutionMode::Background => std::thread::scope(|scope| {
            scope
                .spawn(|| module.run(workspace))
                .join()
                .unwrap_or_else(|payload| Err(ModuleError::Panicked(panic_message(payload.as_ref()))))
        }),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

impl Pipeline {
    /// Start a run that executes one module step per `next()`.
    ///
    /// The caller owns `measurements` and can read it once the iterator is
    /// dropped. Structural problems (two grouping modules, a grouping
    /// request with the wrong keys, an invalid image range) are yielded as
    /// `Err` and end the run; module failures are reported to listeners
    /// and recorded as measurements instead.
    pub fn run_with_yield<'a>(
        &'a mut self,
        measurements: &'a mut dyn MeasurementsStore,
        options: RunOptions,
    ) -> RunWithYield<'a> {
        RunWithYield::new(self, measurements, options)
    }

    /// Run to completion, ignoring pause requests.
    ///
    /// # Errors
    ///
    /// Returns the first structural error yielded by
    /// [`run_with_yield`](Self::run_with_yield).
    pub fn run(&mut self, options: RunOptions) -> Result<Measurements, PipelineError> {
        let mut measurements = Measurements::new();
        let options = RunOptions {
            honor_pause: false,
            ..options
        };
        for status in self.run_with_yield(&mut measurements, options) {
            status?;
        }
        Ok(measurements)
    }

    /// Record the pipeline itself, then call every module's `prepare_run`.
    ///
    /// Returns `Ok(false)` if a module declined or a listener cancelled
    /// after a module error.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::ProvidersAddedInPrepareRun`] if a module
    /// attached image providers, or a measurements error.
    pub fn prepare_run(&mut self, workspace: &mut Workspace<'_>) -> Result<bool, PipelineError> {
        workspace
            .measurements_mut()
            .add_experiment_measurement(M_PIPELINE, MeasurementValue::Text(self.to_text()))?;
        for index in 0..self.len() {
            let pm = &mut self.modules_mut()[index];
            let module_num = pm.module_num();
            workspace.set_module(module_num);
            match pm.module_mut().prepare_run(workspace) {
                Ok(true) => {}
                Ok(false) => {
                    info!(module_num, module = pm.module_name(), "module declined to run");
                    return Ok(false);
                }
                Err(err) => {
                    let name = pm.module_name().to_string();
                    if self.report_run_exception(module_num, &name, &err).0 {
                        return Ok(false);
                    }
                }
            }
        }
        if let Some(image_number) = workspace.image_set_list().first_with_providers() {
            return Err(PipelineError::ProvidersAddedInPrepareRun { image_number });
        }
        Ok(true)
    }

    /// Clear the group's image providers, then call every module's
    /// `prepare_group`. Returns `false` if the run should stop.
    pub fn prepare_group(&mut self, workspace: &mut Workspace<'_>, key: &GroupKey, image_numbers: &[usize]) -> bool {
        for &image_number in image_numbers {
            workspace.image_set_list_mut().get_image_set(image_number).clear_providers();
        }
        for index in 0..self.len() {
            let pm = &mut self.modules_mut()[index];
            let module_num = pm.module_num();
            workspace.set_module(module_num);
            match pm.module_mut().prepare_group(workspace, key, image_numbers) {
                Ok(true) => {}
                Ok(false) => {
                    info!(module_num, module = pm.module_name(), "module stopped the group");
                    return false;
                }
                Err(err) => {
                    let name = pm.module_name().to_string();
                    if self.report_run_exception(module_num, &name, &err).0 {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Call every module's `post_group`. Returns `false` if the run should
    /// stop.
    pub fn post_group(&mut self, workspace: &mut Workspace<'_>, key: &GroupKey) -> bool {
        for index in 0..self.len() {
            let pm = &mut self.modules_mut()[index];
            let module_num = pm.module_num();
            workspace.set_module(module_num);
            match pm.module_mut().post_group(workspace, key) {
                Ok(true) => {}
                Ok(false) => return false,
                Err(err) => {
                    let name = pm.module_name().to_string();
                    if self.report_run_exception(module_num, &name, &err).0 {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Call every module's `post_run`.
    pub fn post_run(&mut self, workspace: &mut Workspace<'_>) -> ExitStatus {
        for index in 0..self.len() {
            let pm = &mut self.modules_mut()[index];
            let module_num = pm.module_num();
            workspace.set_module(module_num);
            if let Err(err) = pm.module_mut().post_run(workspace) {
                let name = pm.module_name().to_string();
                if self.report_run_exception(module_num, &name, &err).0 {
                    return ExitStatus::Failure;
                }
            }
        }
        ExitStatus::Complete
    }

    /// The groups of the run.
    ///
    /// Without a grouping module, one group holds every registered image
    /// number.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::DuplicateGroupingModules`] if two modules
    /// supply groupings.
    pub fn get_groupings(&self, workspace: &Workspace<'_>) -> Result<Groupings, PipelineError> {
        let mut found: Option<(usize, &str, Groupings)> = None;
        for pm in self.modules() {
            let Some(groupings) = pm.module().get_groupings(workspace) else {
                continue;
            };
            if let Some((first, first_name, _)) = &found {
                return Err(PipelineError::DuplicateGroupingModules {
                    first: *first,
                    first_name: (*first_name).to_string(),
                    second: pm.module_num(),
                    second_name: pm.module_name().to_string(),
                });
            }
            found = Some((pm.module_num(), pm.module_name(), groupings));
        }
        Ok(found.map_or_else(
            || Groupings::single(workspace.measurements().get_image_numbers()),
            |(_, _, groupings)| groupings,
        ))
    }
}
