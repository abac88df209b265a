//! Images, lazily-evaluated image providers, and per-image-number image sets.

use std::collections::BTreeMap;
use std::fmt;

use crate::grid::Grid;
use crate::types::ModuleError;

/// A grayscale intensity image with an optional validity mask.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    pixels: Grid<f64>,
    mask: Option<Grid<bool>>,
}

impl Image {
    /// An unmasked image.
    #[must_use]
    pub const fn new(pixels: Grid<f64>) -> Self {
        Self { pixels, mask: None }
    }

    /// An image restricted to `mask`.
    ///
    /// Returns `None` if the mask shape differs from the image's.
    #[must_use]
    pub fn with_mask(pixels: Grid<f64>, mask: Grid<bool>) -> Option<Self> {
        (pixels.shape() == mask.shape()).then_some(Self {
            pixels,
            mask: Some(mask),
        })
    }

    /// Pixel intensities.
    #[must_use]
    pub const fn pixels(&self) -> &Grid<f64> {
        &self.pixels
    }

    /// The explicit mask, if any.
    #[must_use]
    pub const fn mask(&self) -> Option<&Grid<bool>> {
        self.mask.as_ref()
    }

    /// The mask, or an all-true grid when the image is unmasked.
    #[must_use]
    pub fn effective_mask(&self) -> Grid<bool> {
        self.mask.clone().unwrap_or_else(|| {
            let (rows, cols) = self.pixels.shape();
            Grid::new(rows, cols, true)
        })
    }

    /// `(rows, cols)`.
    #[must_use]
    pub const fn shape(&self) -> (usize, usize) {
        self.pixels.shape()
    }
}

/// Produces a named image on first request.
///
/// Providers are attached to an image set during group preparation and
/// are dropped when the image set is purged.
pub trait ImageProvider: Send {
    /// The image name this provider answers for.
    fn name(&self) -> &str;

    /// Load or compute the image.
    ///
    /// # Errors
    ///
    /// Returns a [`ModuleError`] if the image cannot be produced.
    fn provide_image(&mut self) -> Result<Image, ModuleError>;

    /// Drop any cached data.
    fn release_memory(&mut self) {}
}

/// The images belonging to one image number.
#[derive(Default)]
pub struct ImageSet {
    image_number: usize,
    keys: BTreeMap<String, String>,
    providers: Vec<Box<dyn ImageProvider>>,
    images: BTreeMap<String, Image>,
}

impl fmt::Debug for ImageSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageSet")
            .field("image_number", &self.image_number)
            .field("keys", &self.keys)
            .field(
                "providers",
                &self.providers.iter().map(|p| p.name()).collect::<Vec<_>>(),
            )
            .field("images", &self.images.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ImageSet {
    fn new(image_number: usize) -> Self {
        Self {
            image_number,
            ..Self::default()
        }
    }

    /// The one-based image number.
    #[must_use]
    pub const fn image_number(&self) -> usize {
        self.image_number
    }

    /// Metadata keys identifying this image set.
    #[must_use]
    pub const fn keys(&self) -> &BTreeMap<String, String> {
        &self.keys
    }

    /// Set a metadata key.
    pub fn set_key(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.keys.insert(key.into(), value.into());
    }

    /// Attach a provider.
    pub fn add_provider(&mut self, provider: Box<dyn ImageProvider>) {
        self.providers.push(provider);
    }

    /// Names answered by the attached providers.
    pub fn provider_names(&self) -> impl Iterator<Item = &str> {
        self.providers.iter().map(|p| p.name())
    }

    /// Number of attached providers.
    #[must_use]
    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    /// Detach every provider.
    pub fn clear_providers(&mut self) {
        self.providers.clear();
    }

    /// Store a computed image under `name`, replacing any previous one.
    pub fn add(&mut self, name: impl Into<String>, image: Image) {
        self.images.insert(name.into(), image);
    }

    /// Names of cached and provided images.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.images.keys().cloned().collect();
        for name in self.provider_names() {
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
        names
    }

    /// Fetch an image, asking its provider the first time.
    ///
    /// # Errors
    ///
    /// Returns [`ModuleError::MissingImage`] if nothing provides `name`, or
    /// the provider's own error.
    pub fn get_image(&mut self, name: &str) -> Result<&Image, ModuleError> {
        if !self.images.contains_key(name) {
            let provider = self
                .providers
                .iter_mut()
                .find(|p| p.name() == name)
                .ok_or_else(|| ModuleError::MissingImage(name.to_string()))?;
            let image = provider.provide_image()?;
            self.images.insert(name.to_string(), image);
        }
        self.images
            .get(name)
            .ok_or_else(|| ModuleError::MissingImage(name.to_string()))
    }

    fn release(&mut self) {
        for provider in &mut self.providers {
            provider.release_memory();
        }
        self.providers.clear();
        self.images.clear();
    }
}

/// Image sets for a run, keyed by image number.
#[derive(Debug, Default)]
pub struct ImageSetList {
    sets: BTreeMap<usize, ImageSet>,
    test_mode: bool,
}

impl ImageSetList {
    /// An empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The image set for `image_number`, created on first access.
    pub fn get_image_set(&mut self, image_number: usize) -> &mut ImageSet {
        self.sets
            .entry(image_number)
            .or_insert_with(|| ImageSet::new(image_number))
    }

    /// The image set for `image_number` if it exists.
    #[must_use]
    pub fn image_set(&self, image_number: usize) -> Option<&ImageSet> {
        self.sets.get(&image_number)
    }

    /// Number of image sets created so far.
    #[must_use]
    pub fn count(&self) -> usize {
        self.sets.len()
    }

    /// Release the providers and cached images of one image set.
    pub fn purge_image_set(&mut self, image_number: usize) {
        if let Some(set) = self.sets.get_mut(&image_number) {
            set.release();
        }
    }

    /// The first image number whose set has providers attached.
    #[must_use]
    pub fn first_with_providers(&self) -> Option<usize> {
        self.sets
            .values()
            .find(|set| set.provider_count() > 0)
            .map(ImageSet::image_number)
    }

    /// Whether the run processes only a sample of the images.
    #[must_use]
    pub const fn test_mode(&self) -> bool {
        self.test_mode
    }

    /// Set test mode.
    pub const fn set_test_mode(&mut self, test_mode: bool) {
        self.test_mode = test_mode;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    struct Counting {
        name: String,
        calls: usize,
    }

    impl ImageProvider for Counting {
        fn name(&self) -> &str {
            &self.name
        }

        fn provide_image(&mut self) -> Result<Image, ModuleError> {
            self.calls += 1;
            Ok(Image::new(Grid::new(2, 2, 0.5)))
        }
    }

    #[test]
    fn provider_is_called_once() {
        let mut list = ImageSetList::new();
        let set = list.get_image_set(1);
        set.add_provider(Box::new(Counting {
            name: "DNA".into(),
            calls: 0,
        }));
        assert_eq!(set.get_image("DNA").unwrap().shape(), (2, 2));
        assert_eq!(set.get_image("DNA").unwrap().shape(), (2, 2));
        assert!(matches!(
            set.get_image("Actin"),
            Err(ModuleError::MissingImage(name)) if name == "Actin"
        ));
    }

    #[test]
    fn purge_releases_providers_and_cache() {
        let mut list = ImageSetList::new();
        list.get_image_set(3).add_provider(Box::new(Counting {
            name: "DNA".into(),
            calls: 0,
        }));
        list.get_image_set(3).get_image("DNA").unwrap();
        assert_eq!(list.first_with_providers(), Some(3));
        list.purge_image_set(3);
        assert_eq!(list.first_with_providers(), None);
        assert!(list.get_image_set(3).names().is_empty());
    }

    #[test]
    fn mask_shape_must_match() {
        assert!(Image::with_mask(Grid::new(2, 2, 0.0), Grid::new(2, 3, true)).is_none());
        let image = Image::new(Grid::new(2, 3, 0.0));
        assert_eq!(image.effective_mask().count(), 6);
    }
}
