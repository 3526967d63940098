//! End-to-end matching flow: encode synthetic eyes through the built-in
//! pipeline, enroll into a gallery snapshot, match probes against it.

use std::sync::Arc;

use analysis::pipeline::EncoderConfig;
use analysis::{
    best_match, AnalysisPipeline, AnalyzeOptions, EncoderPipeline, Gallery, GalleryCodes,
    GalleryEntry,
};
use image::GrayImage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use uuid::Uuid;
use wire::EyeSide;

/// Deterministic per-subject texture. Independent seeds give independent
/// codes (expected distance around 0.5), while the same seed always
/// reproduces the same image bit for bit.
fn subject_eye(seed: u64) -> GrayImage {
    let mut rng = StdRng::seed_from_u64(seed);
    let size = 160u32;
    let noise: Vec<u8> = (0..size * size).map(|_| rng.gen_range(20..236)).collect();
    GrayImage::from_fn(size, size, |x, y| {
        image::Luma([noise[(y * size + x) as usize]])
    })
}

fn enroll(gallery: &Gallery, pipeline: &mut EncoderPipeline, name: &str, image: &GrayImage) {
    let probe = pipeline
        .analyze(image, &AnalyzeOptions::default())
        .expect("pipeline should encode the synthetic eye");
    gallery.append(GalleryEntry {
        template_id: Uuid::new_v4(),
        identity_id: Uuid::new_v4(),
        identity_name: name.to_string(),
        eye_side: EyeSide::Left,
        codes: GalleryCodes::Plain(probe.codes),
    });
}

#[test]
fn reanalyzed_image_matches_its_enrollment() {
    let gallery = Gallery::new();
    let mut pipeline = EncoderPipeline::new(EncoderConfig::default());

    enroll(&gallery, &mut pipeline, "alice", &subject_eye(1));
    enroll(&gallery, &mut pipeline, "bob", &subject_eye(2));

    let probe = pipeline
        .analyze(&subject_eye(1), &AnalyzeOptions::default())
        .unwrap();
    let snapshot = gallery.snapshot();
    let best = best_match(&probe.codes, &snapshot, 0.32, 15).expect("should match");

    assert_eq!(best.identity_name, "alice");
    assert!(
        best.distance < 1e-9,
        "identical image should have zero distance, got {}",
        best.distance
    );
    assert_eq!(best.rotation, 0);
}

#[test]
fn unrelated_texture_does_not_match() {
    let gallery = Gallery::new();
    let mut pipeline = EncoderPipeline::new(EncoderConfig::default());
    enroll(&gallery, &mut pipeline, "alice", &subject_eye(1));

    let probe = pipeline
        .analyze(&subject_eye(99), &AnalyzeOptions::default())
        .unwrap();

    let snapshot = gallery.snapshot();
    // Dedup threshold: a stranger must never collide.
    assert!(best_match(&probe.codes, &snapshot, 0.26, 15).is_none());
}

#[test]
fn deletion_publishes_a_smaller_snapshot() {
    let gallery = Gallery::new();
    let mut pipeline = EncoderPipeline::new(EncoderConfig::default());
    enroll(&gallery, &mut pipeline, "alice", &subject_eye(1));

    let before = gallery.snapshot();
    assert_eq!(before.len(), 1);
    let victim = before.entries[0].identity_id;

    gallery.remove_identity(victim);
    let after = gallery.snapshot();
    assert!(after.is_empty());
    assert!(after.version > before.version);

    // Old snapshot holders keep reading their copy.
    assert_eq!(before.len(), 1);
    let _still_there: &Arc<GalleryEntry> = &before.entries[0];
}
