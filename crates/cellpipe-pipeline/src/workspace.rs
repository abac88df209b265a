//! The execution context handed to module lifecycle hooks.

use std::collections::BTreeMap;

use crate::grid::Grid;
use crate::image_set::{Image, ImageSet, ImageSetList};
use crate::measurements::MeasurementsStore;
use crate::module::Disposition;
use crate::objects::ObjectSet;
use crate::types::ModuleError;

/// Object outlines accumulated for display, keyed by outline name.
pub type Outlines = BTreeMap<String, Grid<bool>>;

/// Borrowed view of the run state for one module step.
///
/// A workspace is rebuilt for every hook call; the run loop keeps the
/// owned state and reads back the disposition afterwards.
pub struct Workspace<'a> {
    measurements: &'a mut dyn MeasurementsStore,
    image_set_list: &'a mut ImageSetList,
    object_set: &'a mut ObjectSet,
    outlines: &'a mut Outlines,
    module_num: usize,
    image_number: Option<usize>,
    disposition: Disposition,
}

impl<'a> Workspace<'a> {
    /// A workspace outside of any image set (prepare/post hooks).
    pub fn new(
        measurements: &'a mut dyn MeasurementsStore,
        image_set_list: &'a mut ImageSetList,
        object_set: &'a mut ObjectSet,
        outlines: &'a mut Outlines,
    ) -> Self {
        Self {
            measurements,
            image_set_list,
            object_set,
            outlines,
            module_num: 0,
            image_number: None,
            disposition: Disposition::Continue,
        }
    }

    /// Bind the workspace to an image set.
    #[must_use]
    pub const fn for_image(mut self, image_number: usize) -> Self {
        self.image_number = Some(image_number);
        self
    }

    /// Set the module the next hook call belongs to.
    pub const fn set_module(&mut self, module_num: usize) {
        self.module_num = module_num;
    }

    /// One-based number of the module being called.
    #[must_use]
    pub const fn module_num(&self) -> usize {
        self.module_num
    }

    /// The current image number, if an image set is active.
    #[must_use]
    pub const fn image_number(&self) -> Option<usize> {
        self.image_number
    }

    /// The measurements store.
    #[must_use]
    pub fn measurements(&self) -> &dyn MeasurementsStore {
        &*self.measurements
    }

    /// The measurements store, mutably.
    pub fn measurements_mut(&mut self) -> &mut dyn MeasurementsStore {
        &mut *self.measurements
    }

    /// All image sets of the run.
    #[must_use]
    pub fn image_set_list(&self) -> &ImageSetList {
        &*self.image_set_list
    }

    /// All image sets of the run, mutably.
    pub fn image_set_list_mut(&mut self) -> &mut ImageSetList {
        &mut *self.image_set_list
    }

    /// The active image set.
    ///
    /// # Errors
    ///
    /// Returns [`ModuleError::NoImageSet`] outside of an image set.
    pub fn image_set(&mut self) -> Result<&mut ImageSet, ModuleError> {
        let number = self.image_number.ok_or(ModuleError::NoImageSet)?;
        Ok(self.image_set_list.get_image_set(number))
    }

    /// Shorthand for fetching an image from the active image set.
    ///
    /// # Errors
    ///
    /// See [`ImageSet::get_image`].
    pub fn get_image(&mut self, name: &str) -> Result<&Image, ModuleError> {
        self.image_set()?.get_image(name)
    }

    /// Objects segmented so far in this image set.
    #[must_use]
    pub fn object_set(&self) -> &ObjectSet {
        &*self.object_set
    }

    /// Objects segmented so far in this image set, mutably.
    pub fn object_set_mut(&mut self) -> &mut ObjectSet {
        &mut *self.object_set
    }

    /// Outlines for display.
    pub fn outlines_mut(&mut self) -> &mut Outlines {
        &mut *self.outlines
    }

    /// How the run should continue after this step.
    #[must_use]
    pub const fn disposition(&self) -> Disposition {
        self.disposition
    }

    /// Request a change of control flow.
    pub const fn set_disposition(&mut self, disposition: Disposition) {
        self.disposition = disposition;
    }

    /// Whether the run processes only a sample of the images.
    #[must_use]
    pub fn is_test_mode(&self) -> bool {
        self.image_set_list.test_mode()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::measurements::{IMAGE, Measurements, MeasurementValue};

    #[test]
    fn image_set_requires_binding() {
        let mut m = Measurements::new();
        let mut list = ImageSetList::new();
        let mut objects = ObjectSet::new();
        let mut outlines = Outlines::new();
        let mut ws = Workspace::new(&mut m, &mut list, &mut objects, &mut outlines);
        assert!(matches!(ws.image_set(), Err(ModuleError::NoImageSet)));

        let mut ws = ws.for_image(4);
        assert_eq!(ws.image_set().unwrap().image_number(), 4);
    }

    #[test]
    fn writes_reach_the_borrowed_store() {
        let mut m = Measurements::new();
        m.next_image_set(1);
        let mut list = ImageSetList::new();
        let mut objects = ObjectSet::new();
        let mut outlines = Outlines::new();
        {
            let mut ws = Workspace::new(&mut m, &mut list, &mut objects, &mut outlines).for_image(1);
            ws.measurements_mut()
                .add_measurement(IMAGE, "Count_Cells", MeasurementValue::Integer(2), false)
                .unwrap();
            ws.set_disposition(Disposition::Skip);
            assert_eq!(ws.disposition(), Disposition::Skip);
        }
        assert_eq!(
            m.get_current_measurement(IMAGE, "Count_Cells"),
            Some(&MeasurementValue::Integer(2))
        );
    }
}
