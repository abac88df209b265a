//! Plugin preset manifests.
//!
//! A plugin directory holds `*.json` files, each describing a new module
//! type derived from a compiled-in one:
//!
//! ```json
//! {
//!   "name": "IdentifyNuclei",
//!   "base": "IdentifyPrimaryObjects",
//!   "settings": ["DNA", "Nuclei", "Otsu", "0.5", "1.5", "20", "0.5", "0.05"],
//!   "description": "Nuclei from a DNA stain"
//! }
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// One preset manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginPreset {
    /// Module name the preset registers under.
    pub name: String,
    /// Registered module the preset derives from.
    pub base: String,
    /// Setting values applied to a fresh base module; empty keeps its defaults.
    #[serde(default)]
    pub settings: Vec<String>,
    /// Free-text description.
    #[serde(default)]
    pub description: Option<String>,
}

impl PluginPreset {
    /// Read and parse a manifest.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be read, or
    /// [`io::ErrorKind::InvalidData`] if it is not a valid manifest.
    pub fn from_path(path: &Path) -> io::Result<Self> {
        let text = fs::read_to_string(path)?;
        let preset: Self = serde_json::from_str(&text).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if preset.name.trim().is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "preset name is empty"));
        }
        Ok(preset)
    }
}

/// Manifest paths in `dir`, sorted by file name.
///
/// # Errors
///
/// Propagates directory read failures.
pub fn plugin_list(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("json")) {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn lists_only_json_files_in_order() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.json", "a.JSON", "notes.txt"] {
            fs::write(dir.path().join(name), "{}").unwrap();
        }
        fs::create_dir(dir.path().join("c.json")).unwrap();
        let names: Vec<String> = plugin_list(dir.path())
            .unwrap()
            .iter()
            .filter_map(|p| p.file_name()?.to_str().map(str::to_string))
            .collect();
        assert_eq!(names, vec!["a.JSON", "b.json"]);
    }

    #[test]
    fn settings_and_description_are_optional() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.json");
        fs::write(&path, r#"{"name": "Renamed", "base": "Alpha"}"#).unwrap();
        let preset = PluginPreset::from_path(&path).unwrap();
        assert_eq!(preset.base, "Alpha");
        assert!(preset.settings.is_empty());
        assert!(preset.description.is_none());
    }

    #[test]
    fn malformed_manifest_is_invalid_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, r#"{"name": ""}"#).unwrap();
        let err = PluginPreset::from_path(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
