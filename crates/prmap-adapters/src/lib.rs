//! Source parsers: bulk index, curated overrides and the per-event extractors.

use std::collections::{BTreeMap, HashSet};

use chrono::NaiveDate;
use prmap_core::{
    parse_date, simplify_track, Coordinates, EventRef, OverrideRecord, ParseError, Run,
    SimplifyConfig, SourceKind, SummaryStats, Track,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "prmap-adapters";

const SUMMARY_MARKER: &str = "Most_Recent_Event_Summary";
const STATS_TABLE_START: &str = "<th>Past Week";
const STATS_TABLE_END: &str = "</table>";
const STATS_HEADERS: [&str; 5] = [
    "<th>Registrations",
    "<th>Runs",
    "<th>Participants",
    "<th>Volunteer Occasions",
    "<th>Volunteers",
];
const MAPS_IFRAME_PREFIX: &str = "<iframe src=\"https://www.google.";
const COORDINATES_OPEN: &str = "<coordinates>";
const COORDINATES_CLOSE: &str = "</coordinates>";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExtractErrorKind {
    #[error("summary table not found")]
    SummaryTableNotFound,
    #[error(transparent)]
    Date(#[from] ParseError),
    #[error("cannot parse {field}: {value:?}")]
    BadNumber { field: &'static str, value: String },
    #[error("map reference not found")]
    MapReferenceNotFound,
    #[error("unterminated coordinates list")]
    UnterminatedCoordinates,
    #[error("malformed coordinate tuple {0:?}")]
    MalformedCoordinate(String),
    #[error("payload unavailable: {0}")]
    Payload(String),
}

/// Per-event failure; never fatal for the whole run.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{event_id} ({source_kind}): {kind}")]
pub struct ExtractError {
    pub event_id: String,
    pub source_kind: SourceKind,
    pub kind: ExtractErrorKind,
}

impl ExtractError {
    pub fn new(event_id: &str, source_kind: SourceKind, kind: ExtractErrorKind) -> Self {
        Self {
            event_id: event_id.to_string(),
            source_kind,
            kind,
        }
    }
}

/// Failures in the build-time inputs; these abort the run.
#[derive(Debug, Error)]
pub enum StructuralError {
    #[error("invalid JSON in {what}: {source}")]
    Json {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("bulk index feature #{position} is missing {field}")]
    MissingField { position: usize, field: &'static str },
    #[error("duplicate identifier {id:?} in {what}")]
    DuplicateId { what: &'static str, id: String },
}

/// Turns one source's raw payload for an event into a partial fact set.
pub trait Extractor: Send + Sync {
    type Facts;

    fn source_kind(&self) -> SourceKind;

    fn extract(&self, event_id: &str, payload: &[u8]) -> Result<Self::Facts, ExtractError>;
}

#[derive(Debug, Deserialize)]
struct RawBulkIndex {
    #[serde(default)]
    countries: BTreeMap<String, RawCountry>,
    events: Option<RawFeatureCollection>,
}

#[derive(Debug, Deserialize)]
struct RawCountry {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawFeatureCollection {
    #[serde(default)]
    features: Vec<RawFeature>,
}

#[derive(Debug, Deserialize)]
struct RawFeature {
    id: Option<u64>,
    geometry: Option<RawGeometry>,
    properties: Option<RawProperties>,
}

#[derive(Debug, Deserialize)]
struct RawGeometry {
    coordinates: Option<Vec<f64>>,
}

#[derive(Debug, Deserialize)]
struct RawProperties {
    eventname: Option<String>,
    #[serde(rename = "EventLongName")]
    long_name: Option<String>,
    #[serde(rename = "EventLocation")]
    location: Option<String>,
    countrycode: Option<u32>,
}

/// One event as listed in the bulk index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkEvent {
    pub feature_id: u64,
    pub id: String,
    pub long_name: String,
    pub location: String,
    pub country_code: u32,
    pub country_host: String,
    pub coords: Coordinates,
}

/// Parse the bulk index, keeping only features whose country code is in
/// `country_codes` (all of them when the filter is empty).
pub fn parse_bulk_index(
    payload: &[u8],
    country_codes: &[u32],
) -> Result<Vec<BulkEvent>, StructuralError> {
    let raw: RawBulkIndex = serde_json::from_slice(payload).map_err(|source| {
        StructuralError::Json {
            what: "bulk index",
            source,
        }
    })?;
    let features = raw
        .events
        .ok_or(StructuralError::MissingField {
            position: 0,
            field: "events",
        })?
        .features;

    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(features.len());
    for (position, feature) in features.into_iter().enumerate() {
        let missing = |field| StructuralError::MissingField { position, field };
        let feature_id = feature.id.ok_or_else(|| missing("id"))?;
        let props = feature.properties.ok_or_else(|| missing("properties"))?;
        let country_code = props.countrycode.ok_or_else(|| missing("countrycode"))?;
        if !country_codes.is_empty() && !country_codes.contains(&country_code) {
            continue;
        }
        let id = props.eventname.ok_or_else(|| missing("eventname"))?;
        let long_name = props.long_name.ok_or_else(|| missing("EventLongName"))?;
        let coordinates = feature
            .geometry
            .and_then(|g| g.coordinates)
            .ok_or_else(|| missing("geometry.coordinates"))?;
        let [lon, lat] = coordinates[..] else {
            return Err(missing("[longitude, latitude] pair"));
        };
        if !seen.insert(id.clone()) {
            return Err(StructuralError::DuplicateId {
                what: "bulk index",
                id,
            });
        }
        let country_host = raw
            .countries
            .get(&country_code.to_string())
            .and_then(|c| c.url.clone())
            .unwrap_or_default();

        out.push(BulkEvent {
            feature_id,
            id,
            long_name,
            location: props.location.unwrap_or_default(),
            country_code,
            country_host,
            coords: Coordinates::new(lat, lon),
        });
    }
    Ok(out)
}

pub fn parse_overrides(payload: &[u8]) -> Result<Vec<OverrideRecord>, StructuralError> {
    serde_json::from_slice(payload).map_err(|source| StructuralError::Json {
        what: "override records",
        source,
    })
}

/// Date, index and attendance of the most recent run, before it is tied to an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub index: u32,
    pub date: NaiveDate,
    pub runner_count: u32,
}

impl RunSummary {
    pub fn into_run(self, event: EventRef) -> Run {
        Run {
            event,
            index: self.index,
            date: self.date,
            runner_count: self.runner_count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WikiFacts {
    /// `None` when the event has not been run yet.
    pub latest: Option<RunSummary>,
    pub summary: Option<SummaryStats>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WikiState {
    Start,
    Date,
    Index,
    Runners,
    End,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WikiSummaryExtractor;

impl Extractor for WikiSummaryExtractor {
    type Facts = WikiFacts;

    fn source_kind(&self) -> SourceKind {
        SourceKind::Wiki
    }

    fn extract(&self, event_id: &str, payload: &[u8]) -> Result<WikiFacts, ExtractError> {
        let fail = |kind| ExtractError::new(event_id, SourceKind::Wiki, kind);
        let text = String::from_utf8_lossy(payload);
        let lines: Vec<&str> = text.lines().collect();

        let mut state = WikiState::Start;
        let (mut date, mut index, mut runners) = ("", "", "");
        for line in &lines {
            state = match state {
                WikiState::Start if line.contains(SUMMARY_MARKER) => WikiState::Date,
                WikiState::Date => match table_cell(line) {
                    Some(cell) => {
                        date = cell;
                        WikiState::Index
                    }
                    None => state,
                },
                WikiState::Index => match table_cell(line) {
                    Some(cell) => {
                        index = cell;
                        WikiState::Runners
                    }
                    None => state,
                },
                WikiState::Runners => match table_cell(line) {
                    Some(cell) => {
                        runners = cell;
                        WikiState::End
                    }
                    None => state,
                },
                _ => state,
            };
            if state == WikiState::End {
                break;
            }
        }
        if state != WikiState::End {
            return Err(fail(ExtractErrorKind::SummaryTableNotFound));
        }

        if date.is_empty() {
            debug!(event_id, "no run recorded yet");
            return Ok(WikiFacts::default());
        }

        let date = parse_date(date).map_err(|e| fail(e.into()))?;
        let index = parse_count("run index", index).map_err(fail)?;
        let runner_count = if runners.is_empty() {
            0
        } else {
            parse_count("runner count", runners).map_err(fail)?
        };

        let summary = match stats_table(&lines) {
            Some(table) => match parse_stats_table(&table) {
                Ok(stats) => Some(stats),
                Err(reason) => {
                    warn!(event_id, %reason, "ignoring wiki statistics table");
                    None
                }
            },
            None => None,
        };

        Ok(WikiFacts {
            latest: Some(RunSummary {
                index,
                date,
                runner_count,
            }),
            summary,
        })
    }
}

/// Content of a `<td>` line, trimmed, with an optional closing tag removed.
fn table_cell(line: &str) -> Option<&str> {
    let cell = line.trim_start().strip_prefix("<td>")?.trim();
    Some(cell.strip_suffix("</td>").unwrap_or(cell).trim())
}

fn parse_count(field: &'static str, value: &str) -> Result<u32, ExtractErrorKind> {
    value.parse().map_err(|_| ExtractErrorKind::BadNumber {
        field,
        value: value.to_string(),
    })
}

fn stats_table<'a>(lines: &[&'a str]) -> Option<Vec<&'a str>> {
    let start = lines.iter().position(|l| *l == STATS_TABLE_START)?;
    let len = lines[start..].iter().position(|l| *l == STATS_TABLE_END)?;
    Some(lines[start..=start + len].to_vec())
}

fn parse_stats_table(lines: &[&str]) -> Result<SummaryStats, String> {
    let mut values = [0u32; 5];
    let mut header: Option<usize> = None;
    let mut has_value = false;
    let mut complete = false;

    for line in lines {
        let next = header.map_or(0, |h| h + 1);
        let expected = STATS_HEADERS.get(next).copied().unwrap_or(STATS_TABLE_END);
        if *line == expected {
            if next == STATS_HEADERS.len() {
                complete = true;
                break;
            }
            header = Some(next);
            has_value = false;
            continue;
        }
        let Some(current) = header else { continue };
        if has_value {
            continue;
        }
        if let Some(digits) = line.strip_prefix("<td>") {
            if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
                values[current] = digits
                    .parse()
                    .map_err(|e| format!("cannot parse value {digits:?}: {e}"))?;
                has_value = true;
            }
        }
    }

    if !complete {
        return Err("cannot find all fields".to_string());
    }
    let [registrations, runs, individual_runners, volunteer_occasions, individual_volunteers] =
        values;
    Ok(SummaryStats {
        registrations,
        runs,
        individual_runners,
        volunteer_occasions,
        individual_volunteers,
    })
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CoursePageExtractor;

impl Extractor for CoursePageExtractor {
    type Facts = String;

    fn source_kind(&self) -> SourceKind {
        SourceKind::Course
    }

    /// Embedded map id of the course; the last matching line wins.
    fn extract(&self, event_id: &str, payload: &[u8]) -> Result<String, ExtractError> {
        let text = String::from_utf8_lossy(payload);
        text.lines()
            .filter_map(embedded_map_id)
            .last()
            .map(str::to_string)
            .ok_or_else(|| {
                ExtractError::new(
                    event_id,
                    SourceKind::Course,
                    ExtractErrorKind::MapReferenceNotFound,
                )
            })
    }
}

/// First `<iframe src="https://www.google.<tld>/maps/...mid=<id>` on the line.
fn embedded_map_id(line: &str) -> Option<&str> {
    let mut rest = line;
    while let Some(pos) = rest.find(MAPS_IFRAME_PREFIX) {
        rest = &rest[pos + MAPS_IFRAME_PREFIX.len()..];
        if let Some(id) = map_id_in_src(rest) {
            return Some(id);
        }
    }
    None
}

fn map_id_in_src(src: &str) -> Option<&str> {
    let slash = src.find('/')?;
    if slash == 0 || src[..slash].contains('"') {
        return None;
    }
    let path = src[slash..].strip_prefix("/maps/")?;
    let (value, quoted) = match path.find('"') {
        Some(end) => (&path[..end], true),
        None => (path, false),
    };
    let id_start = value.rfind("mid=")? + "mid=".len();
    let tail = &value[id_start..];
    let (id, terminated) = match tail.find('&') {
        Some(end) => (&tail[..end], true),
        None => (tail, quoted),
    };
    if id.is_empty() || !terminated {
        None
    } else {
        Some(id)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct KmlFacts {
    pub tracks: Vec<Track>,
    /// Point count before simplification, summed over all kept tracks.
    pub raw_points: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct KmlTrackExtractor {
    pub simplify: SimplifyConfig,
}

impl KmlTrackExtractor {
    pub fn new(simplify: SimplifyConfig) -> Self {
        Self { simplify }
    }
}

impl Extractor for KmlTrackExtractor {
    type Facts = KmlFacts;

    fn source_kind(&self) -> SourceKind {
        SourceKind::Kml
    }

    fn extract(&self, event_id: &str, payload: &[u8]) -> Result<KmlFacts, ExtractError> {
        let fail = |kind| ExtractError::new(event_id, SourceKind::Kml, kind);
        let text = String::from_utf8_lossy(payload);

        let mut tracks: Vec<Track> = Vec::new();
        let mut open: Option<Track> = None;
        for line in text.lines() {
            let trimmed = line.trim();
            if open.is_none() {
                if trimmed == COORDINATES_OPEN {
                    open = Some(Track::new());
                }
                continue;
            }
            if trimmed == COORDINATES_CLOSE {
                if let Some(done) = open.take().filter(|t| t.len() > 1) {
                    tracks.push(done);
                }
            } else if let Some(track) = open.as_mut() {
                for tuple in trimmed.split_whitespace() {
                    track.push(parse_kml_tuple(tuple).map_err(fail)?);
                }
            }
        }
        if open.is_some() {
            return Err(fail(ExtractErrorKind::UnterminatedCoordinates));
        }

        let raw_points = tracks.iter().map(Vec::len).sum();
        let tracks = tracks
            .iter()
            .map(|track| simplify_track(track, &self.simplify).points)
            .collect();
        Ok(KmlFacts { tracks, raw_points })
    }
}

/// `lon,lat,alt` to coordinates; altitude is discarded and the position must be on the globe.
fn parse_kml_tuple(tuple: &str) -> Result<Coordinates, ExtractErrorKind> {
    let malformed = || ExtractErrorKind::MalformedCoordinate(tuple.to_string());
    let parts: Vec<&str> = tuple.split(',').collect();
    let [lon, lat, _alt] = parts[..] else {
        return Err(malformed());
    };
    let lon: f64 = lon.parse().map_err(|_| malformed())?;
    let lat: f64 = lat.parse().map_err(|_| malformed())?;
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return Err(malformed());
    }
    Ok(Coordinates::new(lat, lon))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wiki_page(cells: [&str; 3]) -> String {
        format!(
            "<html>\n<h2><span id=\"{SUMMARY_MARKER}\">Most Recent Event Summary</span></h2>\n\
             <table>\n<tr>\n<th>Date\n<th>Event\n<th>Runners\n</tr>\n<tr>\n\
             <td>{}\n<td>{}\n<td>{}\n</tr>\n</table>\n</html>\n",
            cells[0], cells[1], cells[2]
        )
    }

    fn stats_block(values: [&str; 5]) -> String {
        format!(
            "<th>Past Week\n<th>Registrations\n<td>{}\n<th>Runs\n<td>{}\n<th>Participants\n<td>{}\n\
             <th>Volunteer Occasions\n<td>{}\n<th>Volunteers\n<td>{}\n</table>\n",
            values[0], values[1], values[2], values[3], values[4]
        )
    }

    #[test]
    fn wiki_extracts_latest_run_triple() {
        let page = wiki_page(["17th February 2024", "191", "43"]);
        let facts = WikiSummaryExtractor.extract("nidda", page.as_bytes()).unwrap();
        assert_eq!(
            facts.latest,
            Some(RunSummary {
                index: 191,
                date: NaiveDate::from_ymd_opt(2024, 2, 17).unwrap(),
                runner_count: 43,
            })
        );
        assert_eq!(facts.summary, None);
    }

    #[test]
    fn wiki_empty_date_means_not_run_yet() {
        let page = wiki_page(["", "", ""]);
        let facts = WikiSummaryExtractor.extract("neu", page.as_bytes()).unwrap();
        assert_eq!(facts, WikiFacts::default());
    }

    #[test]
    fn wiki_without_marker_is_an_error() {
        let page = "<html>\n<td>17th February 2024\n<td>191\n<td>43\n</html>\n";
        let err = WikiSummaryExtractor.extract("nidda", page.as_bytes()).unwrap_err();
        assert_eq!(err.event_id, "nidda");
        assert_eq!(err.source_kind, SourceKind::Wiki);
        assert_eq!(err.kind, ExtractErrorKind::SummaryTableNotFound);
    }

    #[test]
    fn wiki_truncated_table_is_an_error() {
        let page = format!("<h2 id=\"{SUMMARY_MARKER}\"></h2>\n<td>17th February 2024\n<td>191\n");
        let err = WikiSummaryExtractor.extract("x", page.as_bytes()).unwrap_err();
        assert_eq!(err.kind, ExtractErrorKind::SummaryTableNotFound);
    }

    #[test]
    fn wiki_bad_cells_are_typed_errors() {
        let page = wiki_page(["17 Feb 2024", "191", "43"]);
        let err = WikiSummaryExtractor.extract("x", page.as_bytes()).unwrap_err();
        assert!(matches!(err.kind, ExtractErrorKind::Date(_)));

        let page = wiki_page(["17th February 2024", "#191", "43"]);
        let err = WikiSummaryExtractor.extract("x", page.as_bytes()).unwrap_err();
        assert_eq!(
            err.kind,
            ExtractErrorKind::BadNumber {
                field: "run index",
                value: "#191".into()
            }
        );
    }

    #[test]
    fn wiki_cells_tolerate_closing_tags_and_unknown_runner_count() {
        let page = wiki_page(["03.10.2024</td>", " 12 </td>", ""]);
        let facts = WikiSummaryExtractor.extract("x", page.as_bytes()).unwrap();
        let latest = facts.latest.unwrap();
        assert_eq!(latest.index, 12);
        assert_eq!(latest.runner_count, 0);
        assert_eq!(latest.date, NaiveDate::from_ymd_opt(2024, 10, 3).unwrap());
    }

    #[test]
    fn wiki_reads_statistics_table_when_complete() {
        let page = wiki_page(["17th February 2024", "191", "43"])
            + &stats_block(["1200", "9100", "1500", "1700", "210"]);
        let facts = WikiSummaryExtractor.extract("x", page.as_bytes()).unwrap();
        assert_eq!(
            facts.summary,
            Some(SummaryStats {
                registrations: 1200,
                runs: 9100,
                individual_runners: 1500,
                volunteer_occasions: 1700,
                individual_volunteers: 210,
            })
        );
    }

    #[test]
    fn wiki_incomplete_statistics_table_is_ignored() {
        let broken = "<th>Past Week\n<th>Registrations\n<td>1200\n<th>Runs\n<td>9100\n</table>\n";
        let page = wiki_page(["17th February 2024", "191", "43"]) + broken;
        let facts = WikiSummaryExtractor.extract("x", page.as_bytes()).unwrap();
        assert!(facts.latest.is_some());
        assert_eq!(facts.summary, None);
    }

    #[test]
    fn course_page_finds_last_embedded_map() {
        let page = "<p>intro</p>\n\
            <iframe src=\"https://www.google.com/maps/d/embed?t=h&mid=FIRST\" width=\"450\"></iframe>\n\
            <iframe src=\"https://www.google.de/maps/d/u/0/embed?mid=1jzu9KWQBw__FbZHD3RW6KqLY9CxMzQAa&ehbc=2E312F\"></iframe>\n";
        let mid = CoursePageExtractor.extract("x", page.as_bytes()).unwrap();
        assert_eq!(mid, "1jzu9KWQBw__FbZHD3RW6KqLY9CxMzQAa");
    }

    #[test]
    fn course_page_without_map_is_an_error() {
        let page = "<iframe src=\"https://www.youtube.com/embed/abc\"></iframe>\n\
                    <iframe src=\"https://www.google.com/search?mid=nope\"></iframe>\n";
        let err = CoursePageExtractor.extract("x", page.as_bytes()).unwrap_err();
        assert_eq!(err.source_kind, SourceKind::Course);
        assert_eq!(err.kind, ExtractErrorKind::MapReferenceNotFound);
    }

    #[test]
    fn map_src_needs_a_terminated_id() {
        assert_eq!(map_id_in_src("com/maps/d/embed?mid=abc\""), Some("abc"));
        assert_eq!(map_id_in_src("com/maps/d/embed?mid=abc&x=1"), Some("abc"));
        assert_eq!(map_id_in_src("com/maps/d/embed?mid=abc"), None);
        assert_eq!(map_id_in_src("com/maps/d/embed?mid=\""), None);
        assert_eq!(map_id_in_src("/maps/d/embed?mid=abc\""), None);
    }

    const KML: &str = "<kml>\n<Placemark>\n<Point><coordinates>8.1,50.1,0</coordinates></Point>\n\
        </Placemark>\n<LineString>\n  <coordinates>\n    8.10,50.10,0\n    8.11,50.11,0\n\n    8.12,50.10,0\n  </coordinates>\n\
        </LineString>\n<LineString>\n<coordinates>\n8.2,50.2,0\n</coordinates>\n</LineString>\n</kml>\n";

    #[test]
    fn kml_collects_closed_blocks_and_drops_single_points() {
        let facts = KmlTrackExtractor::default().extract("x", KML.as_bytes()).unwrap();
        assert_eq!(facts.raw_points, 3);
        assert_eq!(
            facts.tracks,
            vec![vec![
                Coordinates::new(50.10, 8.10),
                Coordinates::new(50.11, 8.11),
                Coordinates::new(50.10, 8.12),
            ]]
        );
    }

    #[test]
    fn kml_unterminated_block_fails() {
        let payload = "<coordinates>\n8.1,50.1,0\n8.2,50.2,0\n";
        let err = KmlTrackExtractor::default().extract("x", payload.as_bytes()).unwrap_err();
        assert_eq!(err.kind, ExtractErrorKind::UnterminatedCoordinates);

        let empty_open = "<coordinates>\n";
        let err = KmlTrackExtractor::default().extract("x", empty_open.as_bytes()).unwrap_err();
        assert_eq!(err.kind, ExtractErrorKind::UnterminatedCoordinates);
    }

    #[test]
    fn kml_malformed_tuples_fail() {
        for bad in [
            "8.1,50.1",
            "8.1,north,0",
            "NaN,50.1,0",
            "8.1,1e12,0",
            "8.1,-90.5,0",
            "181,50.1,0",
        ] {
            let payload = format!("<coordinates>\n{bad}\n</coordinates>\n");
            let err = KmlTrackExtractor::default().extract("x", payload.as_bytes()).unwrap_err();
            assert_eq!(err.kind, ExtractErrorKind::MalformedCoordinate(bad.to_string()));
        }
    }

    #[test]
    fn kml_accepts_space_separated_tuples_and_simplifies() {
        let tuples = (0..400)
            .map(|i| {
                let lon = 8.0 + f64::from(i) * 0.0001;
                let lat = if i % 2 == 0 { 50.0 } else { 50.0003 };
                format!("{lon},{lat},0")
            })
            .collect::<Vec<_>>()
            .join(" ");
        let payload = format!("<coordinates>\n{tuples}\n</coordinates>\n");
        let facts = KmlTrackExtractor::default().extract("x", payload.as_bytes()).unwrap();
        assert_eq!(facts.raw_points, 400);
        assert_eq!(facts.tracks.len(), 1);
        assert!(facts.tracks[0].len() <= 100);
    }

    #[test]
    fn bulk_index_is_filtered_by_country() {
        let payload = br#"{
            "countries": {"32": {"url": "www.parkrun.com.de"}, "97": {"url": "www.parkrun.org.uk"}},
            "events": {"type": "FeatureCollection", "features": [
                {"id": 1, "type": "Feature",
                 "geometry": {"type": "Point", "coordinates": [-0.335791, 51.410992]},
                 "properties": {"eventname": "bushy", "EventLongName": "Bushy parkrun",
                                "EventLocation": "Bushy Park, Teddington", "countrycode": 97}},
                {"id": 2, "type": "Feature",
                 "geometry": {"type": "Point", "coordinates": [8.99, 50.41]},
                 "properties": {"eventname": "nidda", "EventLongName": "Nidda parkrun",
                                "EventLocation": "Nidda", "countrycode": 32}}
            ]}
        }"#;
        let all = parse_bulk_index(payload, &[]).unwrap();
        assert_eq!(all.len(), 2);

        let german = parse_bulk_index(payload, &[32]).unwrap();
        assert_eq!(german.len(), 1);
        let nidda = &german[0];
        assert_eq!(nidda.id, "nidda");
        assert_eq!(nidda.country_host, "www.parkrun.com.de");
        assert_eq!(nidda.coords, Coordinates::new(50.41, 8.99));
    }

    #[test]
    fn bulk_index_missing_fields_fail_closed() {
        let payload = br#"{"countries": {}, "events": {"features": [
            {"id": 5, "geometry": {"coordinates": [1.0, 2.0]},
             "properties": {"EventLongName": "X", "countrycode": 32}}]}}"#;
        match parse_bulk_index(payload, &[]) {
            Err(StructuralError::MissingField { position, field }) => {
                assert_eq!(position, 0);
                assert_eq!(field, "eventname");
            }
            other => panic!("expected missing field, got {other:?}"),
        }

        let payload = br#"{"countries": {}, "events": {"features": [
            {"id": 5, "geometry": {"coordinates": [1.0]},
             "properties": {"eventname": "x", "EventLongName": "X", "countrycode": 32}}]}}"#;
        assert!(matches!(
            parse_bulk_index(payload, &[]),
            Err(StructuralError::MissingField { .. })
        ));

        assert!(matches!(
            parse_bulk_index(b"{\"countries\": {}}", &[]),
            Err(StructuralError::MissingField { field: "events", .. })
        ));
        assert!(matches!(
            parse_bulk_index(b"not json", &[]),
            Err(StructuralError::Json { .. })
        ));
    }

    #[test]
    fn overrides_parse_as_plain_array() {
        let payload = br#"[{"id": "nidda", "city": "Nidda", "status": "", "coordinates": "50.41 8.99"},
                           {"id": "neu", "name": "Neu parkrun", "status": "geplant"}]"#;
        let records = parse_overrides(payload).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].status, "geplant");
        assert!(parse_overrides(br#"{"id": "x"}"#).is_err());
    }
}
