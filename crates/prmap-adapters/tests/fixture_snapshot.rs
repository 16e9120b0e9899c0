use std::fs;
use std::path::{Path, PathBuf};

use prmap_adapters::{
    CoursePageExtractor, ExtractErrorKind, Extractor, KmlTrackExtractor, WikiFacts,
    WikiSummaryExtractor,
};
use prmap_core::Track;
use serde::Deserialize;

#[derive(Debug, PartialEq, Deserialize)]
struct GoldenEvent {
    wiki: WikiFacts,
    map_id: Option<String>,
    tracks: Vec<Track>,
}

fn fixture_dir(event_id: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures")
        .join(event_id)
}

fn read_snapshot(event_id: &str) -> GoldenEvent {
    let text = fs::read_to_string(fixture_dir(event_id).join("snapshot.json")).expect("read snapshot");
    serde_json::from_str(&text).expect("parse snapshot")
}

fn extract_fixture(event_id: &str) -> GoldenEvent {
    let dir = fixture_dir(event_id);
    let wiki = fs::read(dir.join("wiki.html")).expect("read wiki fixture");
    let course = fs::read(dir.join("course.html")).expect("read course fixture");

    let wiki = WikiSummaryExtractor.extract(event_id, &wiki).expect("wiki facts");
    let map_id = match CoursePageExtractor.extract(event_id, &course) {
        Ok(mid) => Some(mid),
        Err(err) => {
            assert_eq!(err.kind, ExtractErrorKind::MapReferenceNotFound);
            None
        }
    };
    let tracks = match &map_id {
        Some(_) => {
            let kml = fs::read(dir.join("track.kml")).expect("read kml fixture");
            KmlTrackExtractor::default()
                .extract(event_id, &kml)
                .expect("kml facts")
                .tracks
        }
        None => Vec::new(),
    };
    GoldenEvent {
        wiki,
        map_id,
        tracks,
    }
}

#[test]
fn golden_snapshot_nidda() {
    assert_eq!(extract_fixture("nidda"), read_snapshot("nidda"));
}

#[test]
fn golden_snapshot_event_without_runs_or_map() {
    assert_eq!(extract_fixture("neu"), read_snapshot("neu"));
}
