//! `LoadImages`: one image per file in a folder.
//!
//! Files are listed once in `prepare_run`, which registers an image number
//! per file together with its name, folder, and plate metadata. Pixels are
//! only read when a later module asks for the image, through a provider
//! attached in `prepare_group`.

use std::fs;
use std::path::{Path, PathBuf};

use cellpipe_pipeline::grid::Grid;
use cellpipe_pipeline::measurements::{C_FILE_NAME, C_METADATA, C_PATH_NAME, ColumnType, IMAGE};
use cellpipe_pipeline::setting::format_binary;
use cellpipe_pipeline::{
    GroupKey, Groupings, Image, ImageProvider, MeasurementColumn, Module, ModuleError, Namespace, Pipeline,
    Setting, Workspace,
};
use tracing::{debug, info};

use crate::values::{expect_count, parse_flag};

/// Registered module name.
pub const MODULE_NAME: &str = "LoadImages";

const REVISION: u32 = 1;

/// Metadata key taken from the file name, up to the first underscore.
pub const PLATE_KEY: &str = "Plate";

/// Lists the image files of a folder and provides them as a named image.
#[derive(Debug, Clone)]
pub struct LoadImages {
    /// Folder to scan.
    pub folder: PathBuf,
    /// File extension to accept, without the dot. Matched case-insensitively.
    pub extension: String,
    /// Name the loaded images are provided under.
    pub image_name: String,
    /// Process each plate as its own group.
    pub group_by_plate: bool,
    files: Vec<PathBuf>,
}

impl Default for LoadImages {
    fn default() -> Self {
        Self {
            folder: PathBuf::from("."),
            extension: "png".to_string(),
            image_name: "DNA".to_string(),
            group_by_plate: false,
            files: Vec::new(),
        }
    }
}

impl LoadImages {
    fn plate_feature() -> String {
        format!("{C_METADATA}_{PLATE_KEY}")
    }

    fn file_name_feature(&self) -> String {
        format!("{C_FILE_NAME}_{}", self.image_name)
    }

    fn path_name_feature(&self) -> String {
        format!("{C_PATH_NAME}_{}", self.image_name)
    }

    fn list_files(&self) -> Result<Vec<PathBuf>, ModuleError> {
        let mut files: Vec<PathBuf> = fs::read_dir(&self.folder)?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .filter(|path| {
                path.extension()
                    .is_some_and(|ext| ext.to_string_lossy().eq_ignore_ascii_case(&self.extension))
            })
            .collect();
        files.sort();
        Ok(files)
    }
}

/// The plate a file belongs to: its name up to the first underscore.
fn plate_of(path: &Path) -> String {
    let stem = path.file_stem().map(|s| s.to_string_lossy()).unwrap_or_default();
    stem.split('_').next().unwrap_or_default().to_string()
}

/// Reads one file on first request.
struct FileImageProvider {
    name: String,
    path: PathBuf,
}

impl ImageProvider for FileImageProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn provide_image(&mut self) -> Result<Image, ModuleError> {
        let decoded = image::open(&self.path)?;
        debug!(path = %self.path.display(), "image decoded");
        Ok(Image::new(Grid::from_gray_image(&decoded.to_luma8())))
    }
}

impl Module for LoadImages {
    fn module_name(&self) -> &str {
        MODULE_NAME
    }

    fn variable_revision_number(&self) -> u32 {
        REVISION
    }

    fn settings(&self) -> Vec<Setting> {
        vec![
            Setting::new("Input image folder", self.folder.to_string_lossy()),
            Setting::new("File extension", self.extension.clone()),
            Setting::provider(Namespace::Image, "Name this loaded image", self.image_name.clone()),
            Setting::new("Group images by plate", format_binary(self.group_by_plate)),
        ]
    }

    fn set_settings_from_values(&mut self, values: &[String], revision: u32) -> Result<(), ModuleError> {
        if revision != REVISION {
            return Err(ModuleError::UnsupportedRevision(revision));
        }
        expect_count(values, 4)?;
        self.group_by_plate = parse_flag(values, 3, "Group images by plate")?;
        self.folder = PathBuf::from(&values[0]);
        self.extension = values[1].trim_start_matches('.').to_string();
        self.image_name.clone_from(&values[2]);
        Ok(())
    }

    fn prepare_run(&mut self, workspace: &mut Workspace<'_>) -> Result<bool, ModuleError> {
        let mut files = self.list_files()?;
        if files.is_empty() {
            return Err(ModuleError::Failed(format!(
                "no .{} files found in {}",
                self.extension,
                self.folder.display()
            )));
        }
        if workspace.is_test_mode() {
            files.truncate(1);
        }
        let file_name_feature = self.file_name_feature();
        let path_name_feature = self.path_name_feature();
        let plate_feature = Self::plate_feature();
        let store = workspace.measurements_mut();
        for (i, path) in files.iter().enumerate() {
            let n = i + 1;
            let file_name = path.file_name().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
            let folder = path.parent().map(|p| p.to_string_lossy().into_owned()).unwrap_or_default();
            store.add_image_number(n)?;
            store.add_measurement_for(IMAGE, &file_name_feature, n, file_name.into(), true)?;
            store.add_measurement_for(IMAGE, &path_name_feature, n, folder.into(), true)?;
            store.add_measurement_for(IMAGE, &plate_feature, n, plate_of(path).into(), true)?;
        }
        info!(folder = %self.folder.display(), files = files.len(), "image files listed");
        self.files = files;
        Ok(true)
    }

    fn prepare_group(
        &mut self,
        workspace: &mut Workspace<'_>,
        _key: &GroupKey,
        image_numbers: &[usize],
    ) -> Result<bool, ModuleError> {
        for &n in image_numbers {
            let Some(path) = n.checked_sub(1).and_then(|i| self.files.get(i)) else {
                continue;
            };
            let image_set = workspace.image_set_list_mut().get_image_set(n);
            image_set.set_key(PLATE_KEY, plate_of(path));
            image_set.add_provider(Box::new(FileImageProvider {
                name: self.image_name.clone(),
                path: path.clone(),
            }));
        }
        Ok(true)
    }

    fn run(&mut self, workspace: &mut Workspace<'_>) -> Result<(), ModuleError> {
        let (rows, cols) = workspace.get_image(&self.image_name)?.shape();
        debug!(image = %self.image_name, rows, cols, "image loaded");
        Ok(())
    }

    fn get_measurement_columns(&self, _pipeline: &Pipeline) -> Vec<MeasurementColumn> {
        vec![
            MeasurementColumn::new(IMAGE, self.file_name_feature(), ColumnType::Varchar(128)),
            MeasurementColumn::new(IMAGE, self.path_name_feature(), ColumnType::Varchar(256)),
            MeasurementColumn::new(IMAGE, Self::plate_feature(), ColumnType::Varchar(64)),
        ]
    }

    fn get_groupings(&self, workspace: &Workspace<'_>) -> Option<Groupings> {
        self.group_by_plate
            .then(|| Groupings::by_image_features(workspace.measurements(), &[Self::plate_feature()]))
    }

    fn is_image_from_file(&self, image_name: &str) -> bool {
        image_name == self.image_name
    }

    fn prepare_to_create_batch(&mut self, alter_path: &dyn Fn(&str) -> String) -> Result<(), ModuleError> {
        self.folder = PathBuf::from(alter_path(&self.folder.to_string_lossy()));
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn plate_is_the_first_name_token() {
        assert_eq!(plate_of(Path::new("/data/P1_A01_s1.png")), "P1");
        assert_eq!(plate_of(Path::new("single.png")), "single");
    }

    #[test]
    fn settings_round_trip_through_values() {
        let mut module = LoadImages::default();
        let values = vec![
            "/images".to_string(),
            ".TIF".to_string(),
            "GFP".to_string(),
            "Yes".to_string(),
        ];
        module.set_settings_from_values(&values, REVISION).unwrap();
        assert_eq!(module.extension, "TIF");
        assert!(module.group_by_plate);
        let stored: Vec<String> = module.settings().into_iter().map(|s| s.value).collect();
        assert_eq!(stored, vec!["/images", "TIF", "GFP", "Yes"]);
        assert!(module.is_image_from_file("GFP"));
        assert_eq!(module.settings()[2].provided(), Some(Namespace::Image));
    }

    #[test]
    fn wrong_revision_or_count_is_rejected() {
        let mut module = LoadImages::default();
        assert!(matches!(
            module.set_settings_from_values(&[], 2),
            Err(ModuleError::UnsupportedRevision(2))
        ));
        assert!(matches!(
            module.set_settings_from_values(&["a".to_string()], REVISION),
            Err(ModuleError::SettingCount { expected: 4, actual: 1 })
        ));
    }

    #[test]
    fn batch_preparation_rewrites_the_folder() {
        let mut module = LoadImages {
            folder: PathBuf::from("/local/images"),
            ..LoadImages::default()
        };
        module
            .prepare_to_create_batch(&|p: &str| p.replace("/local", "/cluster"))
            .unwrap();
        assert_eq!(module.folder, PathBuf::from("/cluster/images"));
    }
}
