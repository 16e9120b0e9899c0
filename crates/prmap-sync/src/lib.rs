//! Run orchestration: override table, merge, derive, serialize and report writing.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use prmap_adapters::{
    parse_bulk_index, parse_overrides, BulkEvent, CoursePageExtractor, ExtractError,
    ExtractErrorKind, Extractor, KmlFacts, KmlTrackExtractor, StructuralError, WikiFacts,
    WikiSummaryExtractor,
};
use prmap_core::{
    Coordinates, Event, EventStatus, OverrideRecord, SimplifyConfig, SourceKind,
    DEFAULT_INITIAL_TOLERANCE, DEFAULT_TOLERANCE_STEP, DEFAULT_TRACK_POINT_CAP, MIN_TOLERANCE_STEP,
};
use prmap_storage::{DownloadStore, HttpClientConfig, HttpFetcher, PayloadRequest, PayloadSource};
use serde::{ser, Deserialize, Serialize, Serializer};
use serde_json::value::RawValue;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "prmap-sync";

const PIPELINE_FILE: &str = "pipeline.yaml";
const DATA_JS_FILE: &str = "data.js";
const EVENTS_JSON_FILE: &str = "events.json";
const BRIEF_FILE: &str = "brief.md";
const SUMMARY_FILE: &str = "summary.json";
const MANIFEST_FILE: &str = "manifest.json";

/// Per-workspace pipeline knobs, read from `<data_dir>/pipeline.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub bulk_index_url: String,
    /// Download key of the bulk index; a `.gz` suffix stores it compressed.
    pub bulk_index_file: String,
    pub overrides_file: String,
    /// Numeric country codes to keep; empty keeps every country.
    pub country_codes: Vec<u32>,
    pub track_point_cap: usize,
    pub initial_tolerance: f64,
    pub tolerance_step: f64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            bulk_index_url: "https://images.parkrun.com/events.json".to_string(),
            bulk_index_file: "parkrun/events.json.gz".to_string(),
            overrides_file: "parkruns.json".to_string(),
            country_codes: vec![32],
            track_point_cap: DEFAULT_TRACK_POINT_CAP,
            initial_tolerance: DEFAULT_INITIAL_TOLERANCE,
            tolerance_step: DEFAULT_TOLERANCE_STEP,
        }
    }
}

impl PipelineSettings {
    pub async fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(PIPELINE_FILE);
        match fs::read_to_string(&path).await {
            Ok(text) => {
                let settings: Self = serde_yaml::from_str(&text)
                    .with_context(|| format!("parsing {}", path.display()))?;
                settings
                    .validate()
                    .with_context(|| format!("validating {}", path.display()))?;
                Ok(settings)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no pipeline settings, using defaults");
                Ok(Self::default())
            }
            Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.tolerance_step.is_finite() || self.tolerance_step < MIN_TOLERANCE_STEP {
            bail!(
                "tolerance_step {} is below the minimum {}",
                self.tolerance_step,
                MIN_TOLERANCE_STEP
            );
        }
        if !self.initial_tolerance.is_finite() || self.initial_tolerance < 0.0 {
            bail!("initial_tolerance {} must be a non-negative number", self.initial_tolerance);
        }
        Ok(())
    }

    pub fn simplify_config(&self) -> SimplifyConfig {
        SimplifyConfig {
            max_points: self.track_point_cap,
            initial_tolerance: self.initial_tolerance,
            tolerance_step: self.tolerance_step,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    pub download_dir: PathBuf,
    pub output_dir: PathBuf,
    pub offline: bool,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub courtesy_delay_ms: u64,
    pub max_age_hours: u64,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            data_dir: std::env::var("PRMAP_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            download_dir: std::env::var("PRMAP_DOWNLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./.download")),
            output_dir: std::env::var("PRMAP_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./.output")),
            offline: std::env::var("PRMAP_OFFLINE")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            user_agent: std::env::var("PRMAP_USER_AGENT")
                .unwrap_or_else(|_| "prmap-bot/0.1".to_string()),
            http_timeout_secs: env_number("PRMAP_HTTP_TIMEOUT_SECS", 20),
            courtesy_delay_ms: env_number("PRMAP_COURTESY_DELAY_MS", 1000),
            max_age_hours: env_number("PRMAP_MAX_AGE_HOURS", 24),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            courtesy_delay: Duration::from_millis(self.courtesy_delay_ms),
            ..Default::default()
        }
    }

    pub fn payload_source(&self) -> Result<DownloadStore> {
        if self.offline {
            return Ok(DownloadStore::offline(self.download_dir.clone()));
        }
        let http = HttpFetcher::new(self.http_client_config())?;
        Ok(DownloadStore::online(
            self.download_dir.clone(),
            http,
            Duration::from_secs(self.max_age_hours.saturating_mul(3600)),
        ))
    }
}

fn env_number(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Curated override records keyed by event id. Built once, read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct OverrideTable {
    records: BTreeMap<String, OverrideRecord>,
}

impl OverrideTable {
    pub fn from_records(records: Vec<OverrideRecord>) -> Result<Self, StructuralError> {
        let mut map = BTreeMap::new();
        for record in records {
            if map.contains_key(&record.id) {
                return Err(StructuralError::DuplicateId {
                    what: "override records",
                    id: record.id,
                });
            }
            map.insert(record.id.clone(), record);
        }
        Ok(Self { records: map })
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let records = parse_overrides(&bytes).with_context(|| format!("parsing {}", path.display()))?;
        Self::from_records(records).with_context(|| format!("loading {}", path.display()))
    }

    pub fn get(&self, id: &str) -> Option<&OverrideRecord> {
        self.records.get(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &OverrideRecord> {
        self.records.values()
    }
}

/// Join bulk-index events with override records into one event per id, sorted by id.
pub fn merge_events(bulk: &[BulkEvent], overrides: &OverrideTable) -> Result<Vec<Event>> {
    let mut curated_coords = BTreeMap::new();
    for record in overrides.iter() {
        let coords = record
            .parse_coordinates()
            .with_context(|| format!("override record {:?} has malformed coordinates", record.id))?;
        curated_coords.insert(record.id.as_str(), coords);
    }

    let mut merged: BTreeMap<String, Event> = BTreeMap::new();
    for item in bulk {
        if merged.contains_key(&item.id) {
            bail!("duplicate bulk index event {:?}", item.id);
        }
        let mut event = Event {
            id: item.id.clone(),
            name: item.long_name.clone(),
            location: item.location.clone(),
            coords: item.coords,
            country_host: item.country_host.clone(),
            ..Default::default()
        };
        if let Some(record) = overrides.get(&item.id) {
            event.status = EventStatus::from_status(&record.status);
            event.specific_location = record.location.clone();
            event.route_type = record.route_type.clone();
            if let Some(coords) = curated_coords.get(item.id.as_str()) {
                if coords.is_valid() {
                    event.coords = *coords;
                }
            }
        }
        merged.insert(item.id.clone(), event);
    }

    for record in overrides.iter() {
        if merged.contains_key(&record.id) {
            continue;
        }
        debug!(event_id = %record.id, "event only known from overrides");
        let coords = curated_coords
            .get(record.id.as_str())
            .copied()
            .unwrap_or(Coordinates::INVALID);
        merged.insert(
            record.id.clone(),
            Event {
                id: record.id.clone(),
                name: record.name.clone(),
                location: record.city.clone(),
                specific_location: record.location.clone(),
                coords,
                route_type: record.route_type.clone(),
                status: EventStatus::from_status(&record.status),
                ..Default::default()
            },
        );
    }

    Ok(merged.into_values().collect())
}

pub fn apply_wiki_facts(event: &mut Event, facts: WikiFacts) {
    event.latest_run = facts.latest.map(|run| run.into_run(event.event_ref()));
    event.summary = facts.summary;
}

pub fn apply_course_facts(event: &mut Event, map_id: String) {
    event.map_id = Some(map_id);
}

pub fn apply_kml_facts(event: &mut Event, facts: KmlFacts) {
    event.tracks = facts.tracks;
}

/// Recompute `current` and `order` over the whole set.
///
/// Returns the reference date: the newest latest-run date among non-archived
/// events. Ranks are competition ranks by runner count over current active
/// events; everything else gets 0.
pub fn derive_status(events: &mut [Event]) -> Option<NaiveDate> {
    let reference = events
        .iter()
        .filter(|e| !e.is_archived())
        .filter_map(|e| e.latest_run.as_ref().map(|r| r.date))
        .max();

    for event in events.iter_mut() {
        event.order = 0;
        event.current = !event.is_archived()
            && matches!((&event.latest_run, reference), (Some(run), Some(date)) if run.date == date);
    }

    let mut ranked: Vec<usize> = (0..events.len())
        .filter(|&i| events[i].current && events[i].is_active())
        .collect();
    ranked.sort_by(|&a, &b| {
        runners(&events[b])
            .cmp(&runners(&events[a]))
            .then_with(|| events[a].id.cmp(&events[b].id))
    });

    let mut previous: Option<(u32, u32)> = None;
    for (position, &index) in ranked.iter().enumerate() {
        let count = runners(&events[index]);
        let rank = match previous {
            Some((prev_count, prev_rank)) if prev_count == count => prev_rank,
            _ => position as u32 + 1,
        };
        events[index].order = rank;
        previous = Some((count, rank));
    }
    reference
}

fn runners(event: &Event) -> u32 {
    event.latest_run.as_ref().map_or(0, |r| r.runner_count)
}

/// Ranked events in rank order, ties by id.
pub fn ranking(events: &[Event]) -> Vec<&Event> {
    let mut ranked: Vec<&Event> = events.iter().filter(|e| e.order > 0).collect();
    ranked.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.id.cmp(&b.id)));
    ranked
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRun {
    pub index: u32,
    pub url: String,
    pub date: String,
    pub runners: u32,
}

/// One element of the `data.js` interchange array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    pub id: String,
    pub url: String,
    pub name: String,
    pub lat: Fixed5,
    pub lon: Fixed5,
    pub location: String,
    #[serde(rename = "googleMapsUrl")]
    pub google_maps_url: String,
    pub tracks: Vec<Vec<[Fixed5; 2]>>,
    pub active: bool,
    pub planned: bool,
    pub latest: Option<CanonicalRun>,
}

/// Coordinate written to JSON with exactly five decimals (`50.00000`).
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct Fixed5(pub f64);

impl Serialize for Fixed5 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if !self.0.is_finite() {
            return serializer.serialize_none();
        }
        let raw = RawValue::from_string(format!("{:.5}", self.0)).map_err(ser::Error::custom)?;
        raw.serialize(serializer)
    }
}

fn curated_or(value: Option<&str>, fallback: &str) -> String {
    match value {
        Some(v) if !v.is_empty() => v.to_string(),
        _ => fallback.to_string(),
    }
}

/// Override name when one is curated, else the bulk-index name.
pub fn display_name(event: &Event, overrides: &OverrideTable) -> String {
    curated_or(overrides.get(&event.id).map(|o| o.name.as_str()), &event.name)
}

pub fn serialize_events(events: &[Event], overrides: &OverrideTable) -> Vec<CanonicalEvent> {
    let mut sorted: Vec<&Event> = events.iter().collect();
    sorted.sort_by(|a, b| a.id.cmp(&b.id));
    sorted
        .into_iter()
        .map(|event| {
            let curated = overrides.get(&event.id);
            let map_search = event.map_search_url();
            CanonicalEvent {
                id: event.id.clone(),
                url: event.url(),
                name: display_name(event, overrides),
                lat: Fixed5(event.coords.lat),
                lon: Fixed5(event.coords.lon),
                location: curated_or(curated.map(|o| o.city.as_str()), &event.location),
                google_maps_url: curated_or(curated.map(|o| o.google_maps.as_str()), &map_search),
                tracks: event
                    .tracks
                    .iter()
                    .map(|track| {
                        track
                            .iter()
                            .map(|c| [Fixed5(c.lat), Fixed5(c.lon)])
                            .collect()
                    })
                    .collect(),
                active: event.is_active(),
                planned: event.is_planned(),
                latest: event.latest_run.as_ref().map(|run| CanonicalRun {
                    index: run.index,
                    url: run.url(),
                    date: run.date_label(),
                    runners: run.runner_count,
                }),
            }
        })
        .collect()
}

pub fn render_data_js(events: &[CanonicalEvent]) -> Result<String> {
    let json = serde_json::to_string(events).context("serializing canonical events")?;
    Ok(format!("var parkruns = {json};\n"))
}

/// Extraction failure as recorded in the run summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub event_id: String,
    pub source: SourceKind,
    pub message: String,
}

impl From<&ExtractError> for FailureRecord {
    fn from(err: &ExtractError) -> Self {
        Self {
            event_id: err.event_id.clone(),
            source: err.source_kind,
            message: err.kind.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub events: usize,
    pub active_events: usize,
    pub planned_events: usize,
    pub archived_events: usize,
    pub events_with_runs: usize,
    pub current_events: usize,
    pub tracks: usize,
    pub reference_date: Option<NaiveDate>,
    pub failures: Vec<FailureRecord>,
    pub output_dir: String,
    pub manifest: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub files: Vec<RunManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

pub struct SyncPipeline<P> {
    config: SyncConfig,
    settings: PipelineSettings,
    source: P,
    wiki: WikiSummaryExtractor,
    course: CoursePageExtractor,
    kml: KmlTrackExtractor,
}

impl SyncPipeline<DownloadStore> {
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let settings = PipelineSettings::load(&config.data_dir).await?;
        let source = config.payload_source()?;
        Ok(Self::with_source(config, settings, source))
    }
}

impl<P: PayloadSource> SyncPipeline<P> {
    pub fn with_source(config: SyncConfig, settings: PipelineSettings, source: P) -> Self {
        let kml = KmlTrackExtractor::new(settings.simplify_config());
        Self {
            config,
            settings,
            source,
            wiki: WikiSummaryExtractor,
            course: CoursePageExtractor,
            kml,
        }
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        let bulk = self.load_bulk_index().await?;
        let overrides_path = self.config.data_dir.join(&self.settings.overrides_file);
        let overrides = OverrideTable::load(&overrides_path).await?;
        let mut events = merge_events(&bulk, &overrides)?;
        info!(
            bulk = bulk.len(),
            overrides = overrides.len(),
            events = events.len(),
            "merged event sources"
        );

        let mut failures = Vec::new();
        for event in events.iter_mut() {
            self.refresh_event(event, &mut failures).await;
        }

        let reference_date = derive_status(&mut events);
        let canonical = serialize_events(&events, &overrides);
        let data_js = render_data_js(&canonical)?;

        let finished_at = Utc::now();
        let mut summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at,
            events: events.len(),
            active_events: events.iter().filter(|e| e.is_active()).count(),
            planned_events: events.iter().filter(|e| e.is_planned()).count(),
            archived_events: events.iter().filter(|e| e.is_archived()).count(),
            events_with_runs: events.iter().filter(|e| e.latest_run.is_some()).count(),
            current_events: events.iter().filter(|e| e.current).count(),
            tracks: events.iter().map(|e| e.tracks.len()).sum(),
            reference_date,
            failures: failures.iter().map(FailureRecord::from).collect(),
            output_dir: self.config.output_dir.display().to_string(),
            manifest: String::new(),
        };
        let manifest_path = self
            .write_outputs(&mut summary, &events, &overrides, &data_js)
            .await?;
        info!(
            events = summary.events,
            failures = summary.failures.len(),
            manifest = %manifest_path.display(),
            "sync run complete"
        );
        Ok(summary)
    }

    async fn load_bulk_index(&self) -> Result<Vec<BulkEvent>> {
        let request = PayloadRequest::new(
            self.settings.bulk_index_file.clone(),
            self.settings.bulk_index_url.clone(),
        );
        let bytes = self
            .source
            .fetch(&request)
            .await
            .with_context(|| format!("fetching bulk index {}", request.url))?;
        let bulk = parse_bulk_index(&bytes, &self.settings.country_codes)
            .with_context(|| format!("parsing bulk index {}", request.key))?;
        info!(events = bulk.len(), countries = ?self.settings.country_codes, "loaded bulk index");
        Ok(bulk)
    }

    /// Fetch and apply wiki, course and KML facts; failures only touch their own fields.
    async fn refresh_event(&self, event: &mut Event, failures: &mut Vec<ExtractError>) {
        match self.extract(&self.wiki, &event.id, event.wiki_url()).await {
            Ok(facts) => apply_wiki_facts(event, facts),
            Err(err) => record_failure(failures, err),
        }

        match self
            .extract(&self.course, &event.id, event.course_page_url())
            .await
        {
            Ok(map_id) => apply_course_facts(event, map_id),
            Err(err) => record_failure(failures, err),
        }

        let Some(kml_url) = event.kml_url() else {
            return;
        };
        match self.extract(&self.kml, &event.id, kml_url).await {
            Ok(facts) => {
                debug!(
                    event_id = %event.id,
                    raw_points = facts.raw_points,
                    tracks = facts.tracks.len(),
                    "course tracks"
                );
                apply_kml_facts(event, facts)
            }
            Err(err) => record_failure(failures, err),
        }
    }

    async fn extract<E: Extractor>(
        &self,
        extractor: &E,
        event_id: &str,
        url: String,
    ) -> Result<E::Facts, ExtractError> {
        let kind = extractor.source_kind();
        let request = PayloadRequest::for_event(event_id, kind, url);
        let payload = self.source.fetch(&request).await.map_err(|err| {
            ExtractError::new(event_id, kind, ExtractErrorKind::Payload(err.to_string()))
        })?;
        extractor.extract(event_id, &payload)
    }

    async fn write_outputs(
        &self,
        summary: &mut SyncRunSummary,
        events: &[Event],
        overrides: &OverrideTable,
        data_js: &str,
    ) -> Result<PathBuf> {
        let output_dir = &self.config.output_dir;
        let run_dir = output_dir.join("reports").join(summary.run_id.to_string());
        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("creating {}", run_dir.display()))?;

        let data_js_path = output_dir.join(DATA_JS_FILE);
        fs::write(&data_js_path, data_js)
            .await
            .with_context(|| format!("writing {}", data_js_path.display()))?;

        let events_path = output_dir.join(EVENTS_JSON_FILE);
        let events_json = serde_json::to_vec_pretty(events).context("serializing events")?;
        fs::write(&events_path, events_json)
            .await
            .with_context(|| format!("writing {}", events_path.display()))?;

        let brief_path = run_dir.join(BRIEF_FILE);
        fs::write(&brief_path, render_brief(summary, events, overrides))
            .await
            .with_context(|| format!("writing {}", brief_path.display()))?;

        let manifest = RunManifest {
            schema_version: 1,
            run_id: summary.run_id,
            files: vec![
                manifest_entry("data_js", output_dir, &data_js_path)?,
                manifest_entry("events", output_dir, &events_path)?,
                manifest_entry("brief", output_dir, &brief_path)?,
            ],
        };
        let manifest_path = run_dir.join(MANIFEST_FILE);
        let bytes = serde_json::to_vec_pretty(&manifest).context("serializing run manifest")?;
        fs::write(&manifest_path, bytes)
            .await
            .with_context(|| format!("writing {}", manifest_path.display()))?;

        summary.manifest = manifest_path.display().to_string();
        let summary_path = run_dir.join(SUMMARY_FILE);
        let bytes = serde_json::to_vec_pretty(&*summary).context("serializing run summary")?;
        fs::write(&summary_path, bytes)
            .await
            .with_context(|| format!("writing {}", summary_path.display()))?;

        Ok(manifest_path)
    }
}

fn record_failure(failures: &mut Vec<ExtractError>, err: ExtractError) {
    warn!(
        event_id = %err.event_id,
        source = %err.source_kind,
        error = %err.kind,
        "extraction failed"
    );
    failures.push(err);
}

fn render_brief(summary: &SyncRunSummary, events: &[Event], overrides: &OverrideTable) -> String {
    let mut lines = vec![
        "# parkrun map brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!(
            "- Events: {} (active {}, planned {}, archived {})",
            summary.events, summary.active_events, summary.planned_events, summary.archived_events
        ),
        format!(
            "- Reference date: {}",
            summary
                .reference_date
                .map(|d| d.format("%d.%m.%Y").to_string())
                .unwrap_or_else(|| "n/a".to_string())
        ),
        format!("- Course tracks: {}", summary.tracks),
        format!("- Extraction failures: {}", summary.failures.len()),
        String::new(),
        "## Ranking".to_string(),
        String::new(),
    ];

    let ranked = ranking(events);
    if ranked.is_empty() {
        lines.push("No current events.".to_string());
    }
    for event in ranked {
        let mut line = format!(
            "{}. {} ({}): {}",
            event.order,
            display_name(event, overrides),
            event.id,
            event.last_run_label()
        );
        if let (Some(stats), Some(run)) = (&event.summary, &event.latest_run) {
            line.push_str(&format!(
                ", {:.1} runners and {:.1} volunteers per run",
                stats.runners_per_run(run),
                stats.volunteers_per_run(run)
            ));
        }
        line.push_str(&format!(" [results]({})", event.results_url()));
        if let Some(map) = event.course_map_url() {
            line.push_str(&format!(" [course map]({map})"));
        }
        lines.push(line);
    }

    let mut planned: Vec<&Event> = events.iter().filter(|e| e.is_planned()).collect();
    if !planned.is_empty() {
        planned.sort_by(|a, b| a.id.cmp(&b.id));
        lines.push(String::new());
        lines.push("## Planned".to_string());
        lines.push(String::new());
        for event in planned {
            let first = overrides
                .get(&event.id)
                .map(|o| o.first.as_str())
                .filter(|f| !f.is_empty())
                .unwrap_or("n/a");
            lines.push(format!(
                "- {} ({}): first run {}",
                display_name(event, overrides),
                event.id,
                first
            ));
        }
    }

    if !summary.failures.is_empty() {
        lines.push(String::new());
        lines.push("## Failures".to_string());
        lines.push(String::new());
        let mut seen = HashSet::new();
        for failure in &summary.failures {
            if seen.insert((&failure.event_id, failure.source)) {
                lines.push(format!(
                    "- {} ({}): {}",
                    failure.event_id, failure.source, failure.message
                ));
            }
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

fn manifest_entry(name: &str, base: &Path, path: &Path) -> Result<RunManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path.strip_prefix(base).unwrap_or(path).display().to_string();
    Ok(RunManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env();
    let pipeline = SyncPipeline::from_config(config).await?;
    pipeline.run_once().await
}

/// Markdown overview of the most recent `runs` sync runs below `output_dir/reports`.
pub fn report_markdown(runs: usize, output_dir: Option<PathBuf>) -> Result<String> {
    let root = output_dir.unwrap_or_else(|| SyncConfig::from_env().output_dir);
    let reports_root = root.join("reports");
    let mut summaries = Vec::new();
    for entry in std::fs::read_dir(&reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
    {
        let path = entry.path().join(SUMMARY_FILE);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "skipping run without summary");
                continue;
            }
        };
        let summary: SyncRunSummary =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        summaries.push((summary, entry.path()));
    }
    summaries.sort_by(|a, b| b.0.started_at.cmp(&a.0.started_at));

    let mut lines = vec!["# parkrun map sync runs".to_string(), String::new()];
    for (summary, dir) in summaries.into_iter().take(runs.max(1)) {
        lines.push(format!("## Run `{}`", summary.run_id));
        lines.push(format!("- started: {}", summary.started_at));
        lines.push(format!(
            "- events: {} (current {}, with runs {})",
            summary.events, summary.current_events, summary.events_with_runs
        ));
        lines.push(format!("- failures: {}", summary.failures.len()));
        let brief = dir.join(BRIEF_FILE);
        if brief.exists() {
            lines.push(format!("- brief: `{}`", brief.display()));
        }
        lines.push(format!("- manifest: `{}`", summary.manifest));
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}
