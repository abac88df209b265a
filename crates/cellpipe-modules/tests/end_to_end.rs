//! Integration test: segment and measure PNG fixtures through the default
//! registry, grouped by plate.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::path::Path;
use std::sync::Arc;

use cellpipe_modules::{FlagImage, IdentifyPrimaryObjects, LoadImages, MeasureImageIntensity, ThresholdMethod, default_registry};
use cellpipe_pipeline::measurements::{EXIT_STATUS, IMAGE};
use cellpipe_pipeline::{LoadOptions, MeasurementValue, Measurements, MeasurementsStore, Module, Pipeline, RunOptions};
use image::{GrayImage, Luma};

/// Write a 24x24 image with `squares` bright 4x4 squares along the diagonal.
fn write_fixture(dir: &Path, name: &str, squares: u32) {
    let image = GrayImage::from_fn(24, 24, |x, y| {
        let bright = (0..squares).any(|i| {
            let origin = 2 + i * 7;
            (origin..origin + 4).contains(&x) && (origin..origin + 4).contains(&y)
        });
        Luma([if bright { 230 } else { 0 }])
    });
    image.save(dir.join(name)).unwrap();
}

fn boxed(module: impl Module + 'static) -> Box<dyn Module> {
    Box::new(module)
}

fn build(folder: &Path) -> Pipeline {
    let mut load = LoadImages::default();
    load.folder = folder.to_path_buf();
    load.group_by_plate = true;

    let identify = IdentifyPrimaryObjects {
        method: ThresholdMethod::Manual,
        manual_threshold: 0.5,
        smoothing: 0.0,
        min_size: 4,
        expansion: 0.9,
        ..IdentifyPrimaryObjects::default()
    };

    let mut flag = FlagImage::default();
    flag.feature = "Count_Nuclei".to_string();
    flag.max = Some(2.5);
    flag.skip_flagged = true;

    let mut pipeline = Pipeline::new(Arc::new(default_registry()));
    pipeline.add_module(1, boxed(load)).unwrap();
    pipeline.add_module(2, boxed(identify)).unwrap();
    pipeline.add_module(3, boxed(flag)).unwrap();
    pipeline.add_module(4, boxed(MeasureImageIntensity::default())).unwrap();
    pipeline
}

fn int(m: &Measurements, feature: &str, n: usize) -> Option<i64> {
    m.get_measurement(IMAGE, feature, n).and_then(MeasurementValue::as_integer)
}

#[test]
fn plates_are_segmented_measured_and_flagged() {
    let dir = tempfile::tempdir().unwrap();
    write_fixture(dir.path(), "P1_01.png", 1);
    write_fixture(dir.path(), "P1_02.png", 2);
    write_fixture(dir.path(), "P2_01.png", 3);

    let mut pipeline = build(dir.path());
    pipeline.test_valid().unwrap();
    let m = pipeline.run(RunOptions::default()).unwrap();

    assert_eq!(m.get_image_numbers(), vec![1, 2, 3]);
    assert_eq!(
        m.get_measurement(IMAGE, "FileName_DNA", 2).and_then(MeasurementValue::as_text),
        Some("P1_02.png")
    );
    let counts: Vec<Option<i64>> = (1..=3).map(|n| int(&m, "Count_Nuclei", n)).collect();
    assert_eq!(counts, vec![Some(1), Some(2), Some(3)]);
    assert_eq!(
        m.get_measurement("Nuclei", "AreaShape_Area", 2),
        Some(&MeasurementValue::Array(vec![16.0, 16.0]))
    );

    assert_eq!(int(&m, "Group_Number", 3), Some(2));
    assert_eq!(int(&m, "Group_Index", 2), Some(2));
    assert_eq!(int(&m, "Group_Index", 3), Some(1));

    let flags: Vec<Option<i64>> = (1..=3).map(|n| int(&m, "Metadata_QCFlag", n)).collect();
    assert_eq!(flags, vec![Some(0), Some(0), Some(1)]);
    assert_eq!(
        m.get_experiment_measurement("QCFlag_FlaggedCount").and_then(MeasurementValue::as_integer),
        Some(1)
    );

    let mean = m
        .get_measurement(IMAGE, "Intensity_MeanIntensity_DNA", 1)
        .and_then(MeasurementValue::as_float)
        .unwrap();
    assert!((mean - 16.0 * (230.0 / 255.0) / 576.0).abs() < 1e-9);
    assert!(m.get_measurement(IMAGE, "Intensity_MeanIntensity_DNA", 3).is_none());
    assert_eq!(int(&m, "ModuleError_04MeasureImageIntensity", 3), None);
    assert_eq!(int(&m, "ModuleError_02IdentifyPrimaryObjects", 3), Some(0));

    assert_eq!(
        m.get_experiment_measurement(EXIT_STATUS).and_then(MeasurementValue::as_text),
        Some("Complete")
    );
}

#[test]
fn dependencies_follow_settings_and_columns() {
    let pipeline = build(Path::new("/unused"));
    let edges: Vec<(usize, usize, String)> = pipeline
        .get_dependency_graph()
        .into_iter()
        .map(|d| (d.source, d.destination, d.to_string()))
        .collect();
    assert_eq!(
        edges,
        vec![
            (1, 2, "Image: DNA".to_string()),
            (2, 3, "Measurement: Image.Count_Nuclei".to_string()),
            (1, 4, "Image: DNA".to_string()),
        ]
    );
    assert!(pipeline.is_image_from_file("DNA"));
}

#[test]
fn saved_pipeline_reloads_with_the_default_registry() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = build(dir.path());
    let path = dir.path().join("analysis.cppipe");
    pipeline.save(&path).unwrap();

    let mut reloaded = Pipeline::new(Arc::new(default_registry()));
    reloaded.load(&path, LoadOptions { raise_on_error: true }).unwrap();
    assert_eq!(reloaded.to_text(), pipeline.to_text());
    assert_eq!(reloaded.settings_hash(), pipeline.settings_hash());
}

#[test]
fn missing_folder_fails_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let mut pipeline = build(&dir.path().join("absent"));
    let m = pipeline.run(RunOptions::default()).unwrap();
    assert!(m.get_image_numbers().is_empty());
    assert_eq!(
        m.get_experiment_measurement(EXIT_STATUS).and_then(MeasurementValue::as_text),
        Some("Failure")
    );
}
