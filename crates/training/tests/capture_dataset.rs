use std::fs;
use std::path::Path;

use image::{Rgb, RgbImage};
use training::{DatasetError, DatasetPathConfig, DetectionDataset};

fn write_frame(root: &Path, id: u64, labels: serde_json::Value) {
    let mut img = RgbImage::new(10, 5);
    img.put_pixel(0, 0, Rgb([255, 0, 0]));
    img.save(root.join(format!("frame_{id:05}.png"))).unwrap();
    let meta = serde_json::json!({
        "frame_id": id,
        "image": format!("frame_{id:05}.png"),
        "labels": labels,
    });
    fs::write(
        root.join("labels").join(format!("frame_{id:05}.json")),
        serde_json::to_vec(&meta).unwrap(),
    )
    .unwrap();
}

fn paths(root: &Path) -> DatasetPathConfig {
    DatasetPathConfig {
        root: root.to_path_buf(),
        labels_subdir: "labels".into(),
        images_subdir: ".".into(),
    }
}

#[test]
fn loads_frames_and_normalizes_pixel_boxes() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("labels")).unwrap();
    write_frame(
        dir.path(),
        1,
        serde_json::json!([{ "bbox_px": [2.0, 1.0, 7.0, 4.0] }]),
    );
    write_frame(
        dir.path(),
        0,
        serde_json::json!([{ "bbox_norm": [0.0, 0.0, 0.5, 0.5], "source": "human" }]),
    );
    fs::write(dir.path().join("labels").join("notes.txt"), "ignored").unwrap();

    let ds = paths(dir.path()).open().unwrap();
    assert_eq!(ds.len(), 2);

    let first = ds.get(0).unwrap();
    assert_eq!((first.width, first.height), (10, 5));
    assert_eq!(first.image_chw.len(), 3 * 10 * 5);
    assert_eq!(first.image_chw[0], 1.0);
    assert_eq!(first.image_chw[50], 0.0);
    assert_eq!(first.boxes, vec![[0.0, 0.0, 0.5, 0.5]]);

    let second = ds.get(1).unwrap();
    assert_eq!(second.boxes, vec![[0.2, 0.2, 0.7, 0.8]]);
    assert!(matches!(ds.get(2), Err(DatasetError::Index { index: 2, len: 2 })));
}

#[test]
fn invalid_labels_fail_on_open() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("labels")).unwrap();
    write_frame(
        dir.path(),
        3,
        serde_json::json!([{ "bbox_norm": [0.8, 0.1, 0.2, 0.5] }]),
    );
    let err = paths(dir.path()).open().unwrap_err();
    assert!(matches!(err, DatasetError::Validation { .. }));
}

#[test]
fn missing_label_dir_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = paths(dir.path()).open().unwrap_err();
    assert!(matches!(err, DatasetError::Io { .. }));
}
