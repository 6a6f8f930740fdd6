use std::io::Write;
use std::sync::{Arc, Mutex};

use data_contracts::{BoxLabel, FrameAnnotation, ValidationError};

fn frame(labels: Vec<BoxLabel>) -> FrameAnnotation {
    FrameAnnotation {
        frame_id: 0,
        image: "images/frame.png".into(),
        image_present: true,
        labels,
    }
}

fn label(px: Option<[f32; 4]>, norm: Option<[f32; 4]>) -> BoxLabel {
    BoxLabel {
        bbox_px: px,
        bbox_norm: norm,
        source: None,
        source_confidence: None,
    }
}

#[test]
fn invalid_bbox_norm_rejected() {
    let meta = frame(vec![label(None, Some([0.8, 0.2, 0.1, 0.9]))]);
    let err = meta.validate().unwrap_err();
    assert!(matches!(err, ValidationError::InvalidBboxNorm(_)));
}

#[test]
fn label_without_box_rejected() {
    let meta = frame(vec![label(None, None)]);
    assert!(matches!(
        meta.validate().unwrap_err(),
        ValidationError::MissingBox
    ));
}

#[test]
fn present_frame_needs_image_path() {
    let mut meta = frame(Vec::new());
    meta.image = "  ".into();
    assert!(matches!(
        meta.validate().unwrap_err(),
        ValidationError::MissingImage
    ));
}

#[test]
fn valid_bbox_passes() {
    let meta = frame(vec![label(
        Some([0.0, 0.0, 10.0, 10.0]),
        Some([0.1, 0.1, 0.2, 0.2]),
    )]);
    assert!(meta.validate().is_ok());
}

#[test]
fn pixel_boxes_normalize_against_image_size() {
    let l = label(Some([10.0, 20.0, 30.0, 40.0]), None);
    assert_eq!(l.normalized(100, 80), Some([0.1, 0.25, 0.3, 0.5]));
    assert_eq!(l.normalized(0, 80), None);
}

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
fn out_of_frame_pixel_boxes_clamp_with_a_debug_line() {
    let logs = Captured::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();

    let l = label(Some([50.0, 20.0, 120.0, 40.0]), None);
    let norm = tracing::subscriber::with_default(subscriber, || l.normalized(100, 80));
    assert_eq!(norm, Some([0.5, 0.25, 1.0, 0.5]));
    let out = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
    assert!(out.contains("clamped"), "{out}");

    // In-range boxes stay quiet.
    let logs = Captured::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_writer(move || writer.clone())
        .finish();
    let inside = label(Some([10.0, 20.0, 30.0, 40.0]), None);
    tracing::subscriber::with_default(subscriber, || inside.normalized(100, 80));
    assert!(logs.0.lock().unwrap().is_empty());
}

#[test]
fn annotation_parses_with_defaults() {
    let raw = r#"{"frame_id": 7, "image": "frame_00007.png"}"#;
    let meta: FrameAnnotation = serde_json::from_str(raw).unwrap();
    assert!(meta.image_present);
    assert!(meta.labels.is_empty());
    assert!(meta.validate().is_ok());
}
