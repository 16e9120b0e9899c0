//! Core domain model, temporal parsing and track simplification for prmap.

use std::fmt;
use std::time::Duration;

use chrono::NaiveDate;
use geo::{Coord, LineString, Simplify};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "prmap-core";

/// Host used for events that carry no country url of their own.
pub const DEFAULT_EVENT_HOST: &str = "www.parkrun.com.de";

/// Status literal marking an event that has been announced but not started.
pub const PLANNED_STATUS: &str = "geplant";

pub const DEFAULT_TRACK_POINT_CAP: usize = 100;
pub const DEFAULT_INITIAL_TOLERANCE: f64 = 0.00001;
pub const DEFAULT_TOLERANCE_STEP: f64 = 0.000001;
/// Smallest tolerance step accepted from configuration.
pub const MIN_TOLERANCE_STEP: f64 = 1e-9;

/// Passes that grow the tolerance by the fixed step before it starts doubling.
const STEPPED_PASS_LIMIT: usize = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinates {
    /// Sentinel for "no known position". Anything with `lat > 90` is invalid.
    pub const INVALID: Coordinates = Coordinates { lat: 100.0, lon: 0.0 };

    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    pub fn is_valid(&self) -> bool {
        self.lat <= 90.0
    }
}

impl Default for Coordinates {
    fn default() -> Self {
        Self::INVALID
    }
}

pub type Track = Vec<Coordinates>;

/// Kind of per-event payload the pipeline extracts facts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Wiki,
    Course,
    Kml,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Wiki => "wiki",
            SourceKind::Course => "course",
            SourceKind::Kml => "kml",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed classification derived from the curated status string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    #[default]
    Active,
    Planned,
    Archived,
}

impl EventStatus {
    /// Empty means active, the planned literal means planned, anything else is archived.
    pub fn from_status(status: &str) -> Self {
        match status {
            "" => EventStatus::Active,
            PLANNED_STATUS => EventStatus::Planned,
            _ => EventStatus::Archived,
        }
    }
}

/// Non-owning pointer from a run back to its event; only used to build urls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRef {
    pub id: String,
    pub host: String,
}

impl EventRef {
    pub fn base_url(&self) -> String {
        let host = if self.host.is_empty() {
            DEFAULT_EVENT_HOST
        } else {
            self.host.as_str()
        };
        format!("https://{host}/{}", self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub event: EventRef,
    pub index: u32,
    pub date: NaiveDate,
    /// 0 means the count is unknown, not that nobody showed up.
    pub runner_count: u32,
}

impl Run {
    pub fn url(&self) -> String {
        format!("{}/results/{}/", self.event.base_url(), self.index)
    }

    pub fn date_label(&self) -> String {
        self.date.format("%d.%m.%Y").to_string()
    }

    pub fn runners_label(&self) -> String {
        if self.runner_count == 0 {
            "?".to_string()
        } else {
            self.runner_count.to_string()
        }
    }
}

/// Aggregate attendance figures from the wiki statistics table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SummaryStats {
    pub registrations: u32,
    pub runs: u32,
    pub individual_runners: u32,
    pub volunteer_occasions: u32,
    pub individual_volunteers: u32,
}

impl SummaryStats {
    pub fn runners_per_run(&self, run: &Run) -> f64 {
        per_run(self.runs, run.index)
    }

    pub fn volunteers_per_run(&self, run: &Run) -> f64 {
        per_run(self.volunteer_occasions, run.index)
    }
}

fn per_run(total: u32, runs: u32) -> f64 {
    if runs == 0 {
        0.0
    } else {
        f64::from(total) / f64::from(runs)
    }
}

/// Canonical per-location record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Event {
    pub id: String,
    pub name: String,
    pub location: String,
    pub specific_location: String,
    pub coords: Coordinates,
    pub country_host: String,
    pub route_type: String,
    pub status: EventStatus,
    pub map_id: Option<String>,
    pub tracks: Vec<Track>,
    pub latest_run: Option<Run>,
    pub summary: Option<SummaryStats>,
    pub current: bool,
    pub order: u32,
}

impl Event {
    pub fn event_ref(&self) -> EventRef {
        EventRef {
            id: self.id.clone(),
            host: self.country_host.clone(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == EventStatus::Active
    }

    pub fn is_planned(&self) -> bool {
        self.status == EventStatus::Planned
    }

    pub fn is_archived(&self) -> bool {
        self.status == EventStatus::Archived
    }

    pub fn url(&self) -> String {
        self.event_ref().base_url()
    }

    pub fn course_page_url(&self) -> String {
        format!("{}/course", self.url())
    }

    pub fn results_url(&self) -> String {
        format!("{}/results/eventhistory", self.url())
    }

    pub fn wiki_url(&self) -> String {
        format!(
            "https://wiki.parkrun.com/index.php/{}",
            self.name.replace(' ', "_")
        )
    }

    pub fn kml_url(&self) -> Option<String> {
        self.map_id
            .as_deref()
            .map(|mid| format!("https://www.google.com/maps/d/kml?mid={mid}&forcekml=1"))
    }

    pub fn course_map_url(&self) -> Option<String> {
        self.map_id
            .as_deref()
            .map(|mid| format!("https://www.google.com/maps/d/viewer?mid={mid}"))
    }

    pub fn map_search_url(&self) -> String {
        format!(
            "https://www.google.com/maps/search/?api=1&query={:.6}%2C{:.6}",
            self.coords.lat, self.coords.lon
        )
    }

    /// Human readable summary of the latest run, e.g. `#191 am 17.02.2024 mit 43 Teilnehmern`.
    pub fn last_run_label(&self) -> String {
        match &self.latest_run {
            Some(run) => format!(
                "#{} am {} mit {} Teilnehmern",
                run.index,
                run.date_label(),
                run.runners_label()
            ),
            None => "n/a".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Link {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub url: String,
}

impl Link {
    pub fn is_valid(&self) -> bool {
        !self.name.is_empty() && !self.url.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Cafe {
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "googlemaps", alias = "googleMaps", alias = "GoogleMaps")]
    pub google_maps: String,
}

/// Hand-maintained corrections for one event, keyed by the event identifier.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OverrideRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub location: String,
    #[serde(default, rename = "routetype", alias = "routeType", alias = "RouteType")]
    pub route_type: String,
    #[serde(default, rename = "googlemaps", alias = "googleMaps", alias = "GoogleMaps")]
    pub google_maps: String,
    #[serde(default)]
    pub first: String,
    #[serde(default)]
    pub status: String,
    /// Free text `"lat lon"`; empty means no curated position.
    #[serde(default)]
    pub coordinates: String,
    #[serde(default)]
    pub cafe: Cafe,
    #[serde(default)]
    pub strava: Vec<Link>,
    #[serde(default)]
    pub social: Vec<Link>,
}

impl OverrideRecord {
    pub fn parse_coordinates(&self) -> Result<Coordinates, ParseError> {
        parse_coordinate_pair(&self.coordinates)
    }

    pub fn valid_social_links(&self) -> Vec<Link> {
        self.social.iter().filter(|l| l.is_valid()).cloned().collect()
    }
}

/// Parse `"lat lon"`. An empty string is the sentinel, anything else malformed is an error.
pub fn parse_coordinate_pair(input: &str) -> Result<Coordinates, ParseError> {
    if input.is_empty() {
        return Ok(Coordinates::INVALID);
    }
    let fail = || ParseError::MalformedCoordinates(input.to_string());
    let mut parts = input.split_whitespace();
    let (lat, lon) = (parts.next().ok_or_else(fail)?, parts.next().ok_or_else(fail)?);
    if parts.next().is_some() {
        return Err(fail());
    }
    let number = |s: &str| -> Result<f64, ParseError> {
        let unsigned = s.strip_prefix('-').unwrap_or(s);
        if unsigned.is_empty() || !unsigned.bytes().all(|b| b.is_ascii_digit() || b == b'.') {
            return Err(fail());
        }
        s.parse::<f64>().map_err(|_| fail())
    };
    Ok(Coordinates::new(number(lat)?, number(lon)?))
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("unparseable date: {0:?}")]
    UnparseableDate(String),
    #[error("unparseable race time: {0:?}")]
    UnparseableDuration(String),
    #[error("cannot parse coordinates: {0:?}")]
    MalformedCoordinates(String),
}

const MONTH_NAMES: [&str; 12] = [
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
];

/// Parse `3rd October 2024` or `03.10.2024` into a calendar date.
pub fn parse_date(input: &str) -> Result<NaiveDate, ParseError> {
    let fail = || ParseError::UnparseableDate(input.to_string());
    let trimmed = input.trim();
    let (day, month, year) = split_ordinal_date(trimmed)
        .or_else(|| split_numeric_date(trimmed))
        .ok_or_else(fail)?;

    let day: u32 = day.parse().map_err(|_| fail())?;
    let year: i32 = year.parse().map_err(|_| fail())?;
    let month = resolve_month(month).ok_or_else(fail)?;
    NaiveDate::from_ymd_opt(year, month, day).ok_or_else(fail)
}

fn split_ordinal_date(s: &str) -> Option<(&str, &str, &str)> {
    let mut parts = s.split_whitespace();
    let (day_part, month, year) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }
    let digits_end = day_part
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(day_part.len());
    let (day, suffix) = day_part.split_at(digits_end);
    if day.is_empty() || !matches!(suffix, "st" | "nd" | "rd" | "th") {
        return None;
    }
    if year.len() != 4 || !year.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((day, month, year))
}

fn split_numeric_date(s: &str) -> Option<(&str, &str, &str)> {
    let mut parts = s.split('.');
    let (day, month, year) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }
    let all_digits = |p: &str, len: usize| p.len() == len && p.bytes().all(|b| b.is_ascii_digit());
    if all_digits(day, 2) && all_digits(month, 2) && all_digits(year, 4) {
        Some((day, month, year))
    } else {
        None
    }
}

fn resolve_month(token: &str) -> Option<u32> {
    if let Some(pos) = MONTH_NAMES.iter().position(|name| *name == token) {
        return Some(pos as u32 + 1);
    }
    token.parse::<u32>().ok()
}

/// Parse a finishing time given as `M:SS` or `H:MM:SS`.
pub fn parse_race_time(input: &str) -> Result<Duration, ParseError> {
    let fail = || ParseError::UnparseableDuration(input.to_string());
    let fields = input
        .trim()
        .split(':')
        .map(|part| {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                None
            } else {
                part.parse::<u64>().ok()
            }
        })
        .collect::<Option<Vec<_>>>()
        .ok_or_else(fail)?;

    let (hours, minutes, seconds) = match fields.as_slice() {
        [m, s] => (0, *m, *s),
        [h, m, s] => {
            if *m >= 60 {
                return Err(fail());
            }
            (*h, *m, *s)
        }
        _ => return Err(fail()),
    };
    if seconds >= 60 {
        return Err(fail());
    }
    Ok(Duration::from_secs(hours * 3600 + minutes * 60 + seconds))
}

/// Render a race time as `MM:SS`, or `H:MM:SS` once it reaches an hour.
pub fn format_race_time(duration: Duration) -> String {
    let total = duration.as_secs() + u64::from(duration.subsec_millis() >= 500);
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h == 0 {
        format!("{m:02}:{s:02}")
    } else {
        format!("{h}:{m:02}:{s:02}")
    }
}

/// Tolerance schedule for [`simplify_track`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimplifyConfig {
    pub max_points: usize,
    pub initial_tolerance: f64,
    pub tolerance_step: f64,
}

impl Default for SimplifyConfig {
    fn default() -> Self {
        Self {
            max_points: DEFAULT_TRACK_POINT_CAP,
            initial_tolerance: DEFAULT_INITIAL_TOLERANCE,
            tolerance_step: DEFAULT_TOLERANCE_STEP,
        }
    }
}

/// Outcome of a simplification, with the number of Douglas-Peucker passes it took.
#[derive(Debug, Clone, PartialEq)]
pub struct Simplified {
    pub points: Track,
    pub passes: usize,
    pub tolerance: f64,
}

/// Reduce `track` to at most `config.max_points` points.
///
/// Each pass runs Douglas-Peucker on the original track; the tolerance grows by a
/// fixed step until the budget is met. The tolerance strictly increases on every
/// pass: once the step no longer moves it, or after a bounded number of stepped
/// passes, it doubles instead. It never exceeds the bounding box diagonal of the
/// track, and a pass at that tolerance keeps only the two endpoints, so the cap
/// is clamped to 2 and the loop always ends.
pub fn simplify_track(track: &[Coordinates], config: &SimplifyConfig) -> Simplified {
    let max_points = config.max_points.max(2);
    let step = if config.tolerance_step.is_finite() && config.tolerance_step > 0.0 {
        config.tolerance_step
    } else {
        DEFAULT_TOLERANCE_STEP
    };
    let mut tolerance = config.initial_tolerance.max(0.0);

    if track.len() <= max_points {
        return Simplified {
            points: track.to_vec(),
            passes: 0,
            tolerance,
        };
    }

    let line = LineString::new(
        track
            .iter()
            .map(|c| Coord { x: c.lon, y: c.lat })
            .collect(),
    );
    let diagonal = bounding_diagonal(track);

    let mut passes = 0;
    loop {
        let reduced = line.simplify(&tolerance);
        passes += 1;
        if reduced.0.len() <= max_points {
            return Simplified {
                points: reduced
                    .coords()
                    .map(|c| Coordinates::new(c.y, c.x))
                    .collect(),
                passes,
                tolerance,
            };
        }
        if diagonal.is_nan() || tolerance >= diagonal {
            return Simplified {
                points: vec![track[0], track[track.len() - 1]],
                passes,
                tolerance,
            };
        }
        tolerance = next_tolerance(tolerance, step, passes).min(diagonal);
    }
}

fn next_tolerance(tolerance: f64, step: f64, passes: usize) -> f64 {
    let stepped = tolerance + step;
    if passes < STEPPED_PASS_LIMIT && stepped > tolerance {
        stepped
    } else {
        stepped.max(tolerance * 2.0)
    }
}

/// Diagonal of the lat/lon bounding box; NaN when a coordinate is not finite.
fn bounding_diagonal(track: &[Coordinates]) -> f64 {
    if track.iter().any(|c| !c.lat.is_finite() || !c.lon.is_finite()) {
        return f64::NAN;
    }
    let (mut min_lat, mut max_lat) = (f64::INFINITY, f64::NEG_INFINITY);
    let (mut min_lon, mut max_lon) = (f64::INFINITY, f64::NEG_INFINITY);
    for c in track {
        min_lat = min_lat.min(c.lat);
        max_lat = max_lat.max(c.lat);
        min_lon = min_lon.min(c.lon);
        max_lon = max_lon.max(c.lon);
    }
    (max_lat - min_lat).hypot(max_lon - min_lon)
}
