//! cellpipe-modules: the compiled-in analysis modules.
//!
//! Each module implements [`cellpipe_pipeline::Module`] and is registered by
//! name in [`default_registry`]:
//!
//! - [`LoadImages`] lists image files and provides one image per set
//! - [`IdentifyPrimaryObjects`] thresholds, labels, and grows objects
//! - [`MeasureImageIntensity`] records whole-image intensity statistics
//! - [`FlagImage`] flags (and optionally skips) out-of-range image sets

pub mod flag_image;
pub mod identify;
pub mod load_images;
pub mod measure_intensity;
mod values;

use cellpipe_pipeline::{Module, ModuleRegistry};

pub use flag_image::FlagImage;
pub use identify::{IdentifyPrimaryObjects, ThresholdMethod};
pub use load_images::LoadImages;
pub use measure_intensity::MeasureImageIntensity;

/// A registry holding every compiled-in module under its module name.
#[must_use]
pub fn default_registry() -> ModuleRegistry {
    let mut registry = ModuleRegistry::new();
    registry.register(load_images::MODULE_NAME, || Box::new(LoadImages::default()) as Box<dyn Module>);
    registry.register(identify::MODULE_NAME, || {
        Box::new(IdentifyPrimaryObjects::default()) as Box<dyn Module>
    });
    registry.register(measure_intensity::MODULE_NAME, || {
        Box::new(MeasureImageIntensity::default()) as Box<dyn Module>
    });
    registry.register(flag_image::MODULE_NAME, || Box::new(FlagImage::default()) as Box<dyn Module>);
    registry
}
