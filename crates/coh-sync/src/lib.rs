//! Harvest run orchestration: configuration, record assembly, the worker
//! pool that drives search → detail → download → export, and run reports.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{RecordBatch, StringArray, UInt32Array, UInt64Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use coh_adapters::{
    AttachmentDownloader, DetailFetcher, PdfTextExtractor, SamEndpoints, SearchPaginator,
    TextExtractor,
};
use coh_core::{
    sam_gov_link, Attachment, AttachmentText, DetailRecord, DownloadStatus, FailureStage,
    FetchOutcome, FieldOutcome, Opportunity, OpportunityDetail, OpportunitySummary,
    SearchFilters,
};
use coh_storage::{
    sha256_hex, DatasetSink, FsKeyValueStore, HttpClientConfig, HttpFetcher, JsonlDataset,
    KeyValueStore,
};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "coh-sync";

const PROGRESS_EVERY: usize = 10;

#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub filters: SearchFilters,
    pub download_attachments: bool,
    pub extract_text: bool,
    pub max_opportunities: usize,
    pub workers: usize,
    pub storage_dir: PathBuf,
    pub dataset_path: PathBuf,
    /// `None` skips writing run reports.
    pub reports_dir: Option<PathBuf>,
    pub filters_file: Option<PathBuf>,
    pub endpoints: SamEndpoints,
    pub http: HttpClientConfig,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            filters: SearchFilters::default(),
            download_attachments: true,
            extract_text: false,
            max_opportunities: 100,
            workers: 4,
            storage_dir: PathBuf::from("./storage"),
            dataset_path: PathBuf::from("./storage/dataset.jsonl"),
            reports_dir: Some(PathBuf::from("./reports")),
            filters_file: None,
            endpoints: SamEndpoints::default(),
            http: HttpClientConfig::default(),
        }
    }
}

fn split_list(value: Option<String>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl HarvestConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from any key lookup; unparseable values keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let number = |key: &str| var(key).and_then(|v| v.parse::<u64>().ok());

        let mut config = Self::default();

        config.filters.keywords = var("COH_KEYWORDS");
        config.filters.naics_codes = split_list(var("COH_NAICS"));
        config.filters.set_aside_types = split_list(var("COH_SET_ASIDES"));
        config.filters.states = split_list(var("COH_STATES"));
        config.filters.opportunity_types = split_list(var("COH_OPP_TYPES"));
        if let Some(days) = number("COH_POSTED_WITHIN_DAYS") {
            config.filters.posted_within_days = u32::try_from(days).ok().filter(|d| *d > 0);
        }
        if let Some(size) = number("COH_PAGE_SIZE").and_then(|v| u32::try_from(v).ok()) {
            config.filters.page_size = size.max(1);
        }

        if let Some(flag) = var("COH_DOWNLOAD_ATTACHMENTS").and_then(|v| parse_flag(&v)) {
            config.download_attachments = flag;
        }
        if let Some(flag) = var("COH_EXTRACT_TEXT").and_then(|v| parse_flag(&v)) {
            config.extract_text = flag;
        }
        if let Some(max) = number("COH_MAX_OPPORTUNITIES") {
            config.max_opportunities = max as usize;
        }
        if let Some(workers) = number("COH_WORKERS") {
            config.workers = (workers as usize).max(1);
        }

        if let Some(dir) = var("COH_STORAGE_DIR") {
            config.storage_dir = PathBuf::from(dir);
        }
        if let Some(path) = var("COH_DATASET_PATH") {
            config.dataset_path = PathBuf::from(path);
        }
        if let Some(dir) = var("COH_REPORTS_DIR") {
            config.reports_dir = (!dir.eq_ignore_ascii_case("off")).then(|| PathBuf::from(dir));
        }
        config.filters_file = var("COH_FILTERS_FILE").map(PathBuf::from);

        if let Some(url) = var("COH_SEARCH_URL") {
            config.endpoints.search_url = url;
        }
        if let Some(url) = var("COH_DETAILS_URL") {
            config.endpoints.details_url = url;
        }
        if let Some(url) = var("COH_RESOURCES_URL") {
            config.endpoints.resources_url = url;
        }
        if let Some(url) = var("COH_DOWNLOAD_URL") {
            config.endpoints.download_url = url;
        }

        config.http.api_key = var("SAM_API_KEY");
        if let Some(agent) = var("COH_USER_AGENT") {
            config.http.user_agent = Some(agent);
        }
        if let Some(secs) = number("COH_HTTP_TIMEOUT_SECS") {
            config.http.timeout = std::time::Duration::from_secs(secs.max(1));
        }
        if let Some(attempts) = number("COH_MAX_ATTEMPTS") {
            config.http.max_attempts = (attempts as usize).max(1);
        }
        if let Some(ms) = number("COH_MIN_INTERVAL_MS") {
            config.http.rate_limit.min_interval = std::time::Duration::from_millis(ms);
        }
        if let Some(secs) = number("COH_MAX_BACKOFF_SECS") {
            config.http.rate_limit.max_backoff = std::time::Duration::from_secs(secs);
        }
        config.http.rate_limit.jitter = config.workers > 1;

        config
    }

    pub fn apply_filters_file(&mut self, path: &Path) -> Result<()> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading filter file {}", path.display()))?;
        self.apply_filters_yaml(&text)
            .with_context(|| format!("parsing filter file {}", path.display()))
    }

    pub fn apply_filters_yaml(&mut self, text: &str) -> Result<()> {
        let file: FilterFile = serde_yaml::from_str(text)?;
        file.apply(self);
        Ok(())
    }
}

/// Optional YAML overlay; only keys present in the file replace config values.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FilterFile {
    pub keywords: Option<String>,
    pub naics_codes: Option<Vec<String>>,
    pub set_aside_types: Option<Vec<String>>,
    pub states: Option<Vec<String>>,
    pub opportunity_types: Option<Vec<String>>,
    pub posted_within_days: Option<u32>,
    pub page_size: Option<u32>,
    pub max_opportunities: Option<usize>,
    pub download_attachments: Option<bool>,
    pub extract_text: Option<bool>,
}

impl FilterFile {
    pub fn apply(self, config: &mut HarvestConfig) {
        let filters = &mut config.filters;
        if let Some(keywords) = self.keywords {
            filters.keywords = Some(keywords).filter(|k| !k.trim().is_empty());
        }
        if let Some(codes) = self.naics_codes {
            filters.naics_codes = codes;
        }
        if let Some(types) = self.set_aside_types {
            filters.set_aside_types = types;
        }
        if let Some(states) = self.states {
            filters.states = states;
        }
        if let Some(types) = self.opportunity_types {
            filters.opportunity_types = types;
        }
        if let Some(days) = self.posted_within_days {
            filters.posted_within_days = (days > 0).then_some(days);
        }
        if let Some(size) = self.page_size {
            filters.page_size = size.max(1);
        }
        if let Some(max) = self.max_opportunities {
            config.max_opportunities = max;
        }
        if let Some(flag) = self.download_attachments {
            config.download_attachments = flag;
        }
        if let Some(flag) = self.extract_text {
            config.extract_text = flag;
        }
    }
}

/// Pure merge of everything gathered for one opportunity.
pub struct RecordAssembler;

impl RecordAssembler {
    pub fn assemble(
        summary: OpportunitySummary,
        detail: DetailRecord,
        attachments: FieldOutcome<Vec<Attachment>>,
        attachment_texts: Vec<AttachmentText>,
        scraped_at: DateTime<Utc>,
    ) -> Opportunity {
        let hierarchy = &summary.organization_hierarchy;
        let agency_name = hierarchy.first().cloned();
        let sub_agency_name = hierarchy.get(1).cloned();
        let office_name = hierarchy.last().cloned();

        Opportunity {
            sam_gov_link: sam_gov_link(&summary.opportunity_id),
            opportunity_id: summary.opportunity_id,
            solicitation_number: summary.solicitation_number,
            title: summary.title,
            description: summary.description,
            notice_type: summary.notice_type,
            notice_type_code: summary.notice_type_code,
            posted_date: summary.posted_date,
            modified_date: summary.modified_date,
            response_deadline: summary.response_deadline,
            response_time_zone: summary.response_time_zone,
            is_active: summary.is_active,
            is_canceled: summary.is_canceled,
            agency_name,
            sub_agency_name,
            office_name,
            naics_code: detail.naics_code,
            psc_code: detail.psc_code,
            set_aside_type: detail.set_aside_type,
            set_aside_description: detail.set_aside_description,
            place_of_performance: detail.place_of_performance,
            contacts: detail.contacts,
            award: detail.award,
            attachments,
            attachment_texts,
            scraped_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RunState {
    Idle,
    Paginating,
    Exporting,
    Done,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StopReason {
    Exhausted,
    CapReached,
    SearchFailed,
    Shutdown,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTally {
    pub opportunities_succeeded: usize,
    pub opportunities_failed: usize,
    pub attachments_downloaded: usize,
    pub attachments_failed: usize,
    pub attachments_skipped: usize,
    pub attachment_listings_failed: usize,
    pub texts_extracted: usize,
    pub downloaded_bytes: u64,
    pub failures_by_stage: BTreeMap<String, usize>,
}

impl RunTally {
    pub fn record_exported(&mut self, record: &Opportunity) {
        self.opportunities_succeeded += 1;
        self.texts_extracted += record.attachment_texts.len();
        if record.attachments.is_failed() {
            self.attachment_listings_failed += 1;
            *self
                .failures_by_stage
                .entry(FailureStage::Listing.to_string())
                .or_default() += 1;
        }
        for attachment in record.attachment_list() {
            match &attachment.download {
                DownloadStatus::Downloaded {
                    downloaded_size, ..
                } => {
                    self.attachments_downloaded += 1;
                    self.downloaded_bytes += downloaded_size;
                }
                DownloadStatus::Failed { stage, .. } => {
                    self.attachments_failed += 1;
                    *self.failures_by_stage.entry(stage.to_string()).or_default() += 1;
                }
                DownloadStatus::Skipped { .. } => self.attachments_skipped += 1,
                DownloadStatus::NotRequested => {}
            }
        }
    }

    pub fn record_failed(&mut self, stage: Option<FailureStage>) {
        self.opportunities_failed += 1;
        let label = stage.map_or_else(|| "task".to_string(), |s| s.to_string());
        *self.failures_by_stage.entry(label).or_default() += 1;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub state: RunState,
    pub stop_reason: StopReason,
    pub search_error: Option<String>,
    pub max_opportunities: usize,
    pub pages_fetched: u32,
    pub duplicates_skipped: usize,
    pub tally: RunTally,
    pub reports_dir: Option<String>,
}

impl RunSummary {
    pub fn exported(&self) -> usize {
        self.tally.opportunities_succeeded
    }

    pub fn is_aborted(&self) -> bool {
        self.state == RunState::Aborted
    }
}

/// Flat per-record row for the Parquet snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotRow {
    pub opportunity_id: String,
    pub solicitation_number: Option<String>,
    pub title: Option<String>,
    pub notice_type: Option<String>,
    pub agency_name: Option<String>,
    pub naics_code: Option<String>,
    pub set_aside_type: Option<String>,
    pub response_deadline: Option<String>,
    pub attachments: u32,
    pub downloaded_bytes: u64,
    pub scraped_at: String,
}

impl From<&Opportunity> for SnapshotRow {
    fn from(record: &Opportunity) -> Self {
        let attachments = record.attachment_list();
        Self {
            opportunity_id: record.opportunity_id.clone(),
            solicitation_number: record.solicitation_number.clone(),
            title: record.title.clone(),
            notice_type: record.notice_type.clone(),
            agency_name: record.agency_name.clone(),
            naics_code: record.naics_code.clone(),
            set_aside_type: record.set_aside_type.clone(),
            response_deadline: record.response_deadline.clone(),
            attachments: u32::try_from(attachments.len()).unwrap_or(u32::MAX),
            downloaded_bytes: attachments
                .iter()
                .filter_map(|a| a.download.downloaded_size())
                .sum(),
            scraped_at: record.scraped_at.to_rfc3339(),
        }
    }
}

#[derive(Debug)]
enum ItemOutcome {
    Assembled(Box<Opportunity>),
    Failed {
        opportunity_id: String,
        stage: FailureStage,
        reason: String,
    },
}

/// Per-opportunity work: detail, sequential attachment downloads, optional
/// text extraction, assembly.
struct OpportunityWorker {
    details: DetailFetcher,
    downloader: AttachmentDownloader,
    extractor: Option<Arc<dyn TextExtractor>>,
    download_attachments: bool,
}

impl OpportunityWorker {
    async fn process(self: Arc<Self>, summary: OpportunitySummary) -> ItemOutcome {
        let opportunity_id = summary.opportunity_id.clone();
        let span = info_span!("opportunity", opportunity_id = %opportunity_id);
        async move {
            debug!(step = "fetching", "fetching detail");
            let detail = match self
                .details
                .fetch(&opportunity_id, self.download_attachments)
                .await
            {
                FetchOutcome::Success(detail) => detail,
                failed => {
                    let reason = failed
                        .failure_reason()
                        .unwrap_or("detail unavailable")
                        .to_string();
                    return ItemOutcome::Failed {
                        opportunity_id,
                        stage: FailureStage::Detail,
                        reason,
                    };
                }
            };

            let OpportunityDetail {
                record,
                attachments,
            } = detail;
            let mut texts = Vec::new();
            let attachments = match attachments {
                FieldOutcome::Fetched(descriptors) => {
                    debug!(step = "downloading", count = descriptors.len(), "acquiring attachments");
                    let mut acquired_list = Vec::with_capacity(descriptors.len());
                    for descriptor in &descriptors {
                        let acquired = self.downloader.acquire(&opportunity_id, descriptor).await;
                        if let (Some(extractor), Some(body)) = (&self.extractor, acquired.body) {
                            if extractor
                                .supports(&descriptor.filename, descriptor.content_type.as_deref())
                            {
                                let content_type = descriptor.content_type.as_deref();
                                match extractor.extract(body, content_type).await {
                                    Ok(text) => texts.push(AttachmentText {
                                        resource_id: descriptor.resource_id.clone(),
                                        filename: descriptor.filename.clone(),
                                        text,
                                    }),
                                    Err(err) => warn!(
                                        resource_id = %descriptor.resource_id,
                                        error = %err,
                                        "text extraction failed"
                                    ),
                                }
                            }
                        }
                        acquired_list.push(acquired.attachment);
                    }
                    FieldOutcome::Fetched(acquired_list)
                }
                FieldOutcome::NotRequested => FieldOutcome::NotRequested,
                FieldOutcome::Failed { reason } => FieldOutcome::Failed { reason },
            };

            debug!(step = "assembling", "assembling record");
            ItemOutcome::Assembled(Box::new(RecordAssembler::assemble(
                summary,
                record,
                attachments,
                texts,
                Utc::now(),
            )))
        }
        .instrument(span)
        .await
    }
}

fn transition(state: &mut RunState, next: RunState) {
    if *state != next {
        info!(from = ?*state, to = ?next, "run state changed");
        *state = next;
    }
}

pub struct HarvestPipeline {
    config: HarvestConfig,
    fetcher: Arc<HttpFetcher>,
    store: Arc<dyn KeyValueStore>,
    dataset: Arc<dyn DatasetSink>,
    extractor: Arc<dyn TextExtractor>,
}

impl HarvestPipeline {
    pub fn new(
        config: HarvestConfig,
        fetcher: Arc<HttpFetcher>,
        store: Arc<dyn KeyValueStore>,
        dataset: Arc<dyn DatasetSink>,
    ) -> Self {
        Self {
            config,
            fetcher,
            store,
            dataset,
            extractor: Arc::new(PdfTextExtractor::default()),
        }
    }

    /// Production wiring: reqwest transport, filesystem store, JSON Lines dataset.
    pub async fn from_config(config: HarvestConfig) -> Result<Self> {
        let fetcher = HttpFetcher::from_config(&config.http).context("building HTTP client")?;
        let store = FsKeyValueStore::new(config.storage_dir.clone());
        let dataset = JsonlDataset::create(config.dataset_path.clone())
            .await
            .with_context(|| format!("opening dataset {}", config.dataset_path.display()))?;
        Ok(Self::new(
            config,
            Arc::new(fetcher),
            Arc::new(store),
            Arc::new(dataset),
        ))
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn TextExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn config(&self) -> &HarvestConfig {
        &self.config
    }

    pub async fn run_to_completion(&self) -> Result<RunSummary> {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        self.run(shutdown_rx).await
    }

    /// One harvest run. Flipping `shutdown` to `true` stops admission; in-flight
    /// opportunities still finish and are exported.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("harvest_run", %run_id);
        self.run_inner(run_id, shutdown).instrument(span).await
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<RunSummary> {
        let started_at = Utc::now();
        let limit = self.config.max_opportunities;
        let workers = self.config.workers.max(1);
        info!(
            max_opportunities = limit,
            workers,
            download_attachments = self.config.download_attachments,
            extract_text = self.config.extract_text,
            "starting harvest"
        );

        let worker = Arc::new(OpportunityWorker {
            details: DetailFetcher::new(self.fetcher.clone(), self.config.endpoints.clone()),
            downloader: AttachmentDownloader::new(
                self.fetcher.clone(),
                self.config.endpoints.clone(),
                self.store.clone(),
            ),
            extractor: self.config.extract_text.then(|| self.extractor.clone()),
            download_attachments: self.config.download_attachments,
        });
        let mut paginator = SearchPaginator::new(
            self.fetcher.clone(),
            self.config.endpoints.clone(),
            self.config.filters.clone(),
        );

        let mut state = RunState::Idle;
        let mut tasks: JoinSet<ItemOutcome> = JoinSet::new();
        let mut tally = RunTally::default();
        let mut rows = Vec::new();
        let mut stop: Option<StopReason> = None;
        let mut search_error = None;
        let mut shutdown_armed = true;

        transition(&mut state, RunState::Paginating);
        loop {
            if stop.is_none() {
                if *shutdown.borrow() {
                    info!(in_flight = tasks.len(), "shutdown requested; admitting no new work");
                    stop = Some(StopReason::Shutdown);
                } else if tally.opportunities_succeeded >= limit {
                    info!(exported = tally.opportunities_succeeded, "opportunity cap reached");
                    stop = Some(StopReason::CapReached);
                }
                if stop.is_some() {
                    paginator.close();
                }
            }

            let admitting = stop.is_none()
                && tasks.len() < workers
                && tally.opportunities_succeeded + tasks.len() < limit;
            if admitting {
                match paginator.next().await {
                    Ok(Some(summary)) => {
                        debug!(opportunity_id = %summary.opportunity_id, "admitted");
                        let worker = worker.clone();
                        tasks.spawn(async move { worker.process(summary).await });
                    }
                    Ok(None) => {
                        info!(pages = paginator.pages_fetched(), "search exhausted");
                        stop = Some(StopReason::Exhausted);
                    }
                    Err(err) => {
                        error!(stage = %FailureStage::Search, error = %err, "search failed; finishing in-flight work");
                        search_error = Some(err.to_string());
                        stop = Some(StopReason::SearchFailed);
                    }
                }
                continue;
            }

            if stop.is_some() {
                transition(&mut state, RunState::Exporting);
            }
            if tasks.is_empty() {
                break;
            }

            tokio::select! {
                Some(joined) = tasks.join_next() => {
                    self.settle(joined, &mut tally, &mut rows).await;
                }
                changed = shutdown.changed(), if shutdown_armed => {
                    if changed.is_err() {
                        shutdown_armed = false;
                    }
                }
                else => break,
            }
        }

        let stop_reason = stop.unwrap_or(StopReason::Exhausted);
        transition(&mut state, RunState::Exporting);
        let final_state = if stop_reason == StopReason::SearchFailed {
            RunState::Aborted
        } else {
            RunState::Done
        };

        let mut summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            state: final_state,
            stop_reason,
            search_error,
            max_opportunities: limit,
            pages_fetched: paginator.pages_fetched(),
            duplicates_skipped: paginator.duplicates_skipped(),
            tally,
            reports_dir: None,
        };

        if let Some(root) = &self.config.reports_dir {
            let dir = write_run_reports(root, &mut summary, &rows).await?;
            info!(reports_dir = %dir.display(), "run reports written");
        }

        transition(&mut state, final_state);
        info!(
            exported = summary.tally.opportunities_succeeded,
            failed = summary.tally.opportunities_failed,
            attachments_downloaded = summary.tally.attachments_downloaded,
            attachments_failed = summary.tally.attachments_failed,
            attachments_skipped = summary.tally.attachments_skipped,
            stop_reason = ?summary.stop_reason,
            "harvest finished"
        );
        Ok(summary)
    }

    async fn settle(
        &self,
        joined: Result<ItemOutcome, JoinError>,
        tally: &mut RunTally,
        rows: &mut Vec<SnapshotRow>,
    ) {
        match joined {
            Ok(ItemOutcome::Assembled(record)) => match self.dataset.append(&record).await {
                Ok(()) => {
                    tally.record_exported(&record);
                    rows.push(SnapshotRow::from(record.as_ref()));
                    if tally.opportunities_succeeded % PROGRESS_EVERY == 0 {
                        info!(exported = tally.opportunities_succeeded, "progress");
                    }
                }
                Err(err) => {
                    warn!(
                        opportunity_id = %record.opportunity_id,
                        stage = %FailureStage::Store,
                        error = %err,
                        "dataset append failed"
                    );
                    tally.record_failed(Some(FailureStage::Store));
                }
            },
            Ok(ItemOutcome::Failed {
                opportunity_id,
                stage,
                reason,
            }) => {
                warn!(%opportunity_id, %stage, %reason, "opportunity skipped");
                tally.record_failed(Some(stage));
            }
            Err(err) => {
                warn!(error = %err, "opportunity task did not complete");
                tally.record_failed(None);
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Writes `summary.json`, `run_brief.md`, `opportunities.parquet` and
/// `manifest.json` under `{root}/{run_id}` and records the directory in `summary`.
pub async fn write_run_reports(
    root: &Path,
    summary: &mut RunSummary,
    rows: &[SnapshotRow],
) -> Result<PathBuf> {
    let run_dir = root.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;
    summary.reports_dir = Some(run_dir.display().to_string());

    let parquet_path = run_dir.join("opportunities.parquet");
    write_opportunities_parquet(&parquet_path, rows)?;
    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![manifest_entry("opportunities", &run_dir, &parquet_path)?],
    };
    let manifest_bytes =
        serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(run_dir.join("manifest.json"), manifest_bytes)
        .await
        .context("writing manifest.json")?;

    fs::write(run_dir.join("run_brief.md"), run_brief_markdown(summary))
        .await
        .context("writing run_brief.md")?;

    let summary_bytes = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(run_dir.join("summary.json"), summary_bytes)
        .await
        .context("writing summary.json")?;

    Ok(run_dir)
}

pub fn run_brief_markdown(summary: &RunSummary) -> String {
    let tally = &summary.tally;
    let stages = if tally.failures_by_stage.is_empty() {
        "- none".to_string()
    } else {
        tally
            .failures_by_stage
            .iter()
            .map(|(stage, count)| format!("- {stage}: {count}"))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let search_error = summary
        .search_error
        .as_deref()
        .map(|err| format!("\n- Search error: {err}"))
        .unwrap_or_default();

    format!(
        "# Contract Opportunity Harvest\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Final state: {:?}\n- Stop reason: {:?}{}\n- Pages fetched: {}\n- Duplicate hits skipped: {}\n\n## Opportunities\n- Exported: {} of max {}\n- Failed: {}\n\n## Attachments\n- Downloaded: {} ({} bytes)\n- Failed: {}\n- Skipped (non-public): {}\n- Listings failed: {}\n- Texts extracted: {}\n\n## Failures by stage\n{}\n",
        summary.run_id,
        summary.started_at,
        summary.finished_at,
        summary.state,
        summary.stop_reason,
        search_error,
        summary.pages_fetched,
        summary.duplicates_skipped,
        tally.opportunities_succeeded,
        summary.max_opportunities,
        tally.opportunities_failed,
        tally.attachments_downloaded,
        tally.downloaded_bytes,
        tally.attachments_failed,
        tally.attachments_skipped,
        tally.attachment_listings_failed,
        tally.texts_extracted,
        stages
    )
}

/// Markdown digest of the newest `runs` run directories under `reports_root`.
pub fn report_recent_runs(reports_root: &Path, runs: usize) -> Result<String> {
    let mut dirs = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .filter(|entry| entry.path().join("summary.json").exists())
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();

    let mut lines = vec!["# Recent Harvest Runs".to_string(), String::new()];
    for dir in dirs.into_iter().take(runs.max(1)) {
        let summary_path = dir.path().join("summary.json");
        let summary: RunSummary = serde_json::from_str(
            &std::fs::read_to_string(&summary_path)
                .with_context(|| format!("reading {}", summary_path.display()))?,
        )
        .with_context(|| format!("parsing {}", summary_path.display()))?;

        lines.push(format!("## Run `{}`", summary.run_id));
        lines.push(format!("- finished: {}", summary.finished_at));
        lines.push(format!(
            "- state: {:?} ({:?})",
            summary.state, summary.stop_reason
        ));
        lines.push(format!(
            "- opportunities: {} exported, {} failed",
            summary.tally.opportunities_succeeded, summary.tally.opportunities_failed
        ));
        lines.push(format!(
            "- attachments: {} downloaded, {} failed, {} skipped",
            summary.tally.attachments_downloaded,
            summary.tally.attachments_failed,
            summary.tally.attachments_skipped
        ));
        let manifest_path = dir.path().join("manifest.json");
        if manifest_path.exists() {
            lines.push(format!("- parquet manifest: `{}`", manifest_path.display()));
        }
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn optional_column<'a>(
    rows: &'a [SnapshotRow],
    pick: impl Fn(&'a SnapshotRow) -> Option<&'a String>,
) -> StringArray {
    StringArray::from(
        rows.iter()
            .map(|row| pick(row).map(String::as_str))
            .collect::<Vec<_>>(),
    )
}

fn write_opportunities_parquet(path: &Path, rows: &[SnapshotRow]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("opportunity_id", DataType::Utf8, false),
        ArrowField::new("solicitation_number", DataType::Utf8, true),
        ArrowField::new("title", DataType::Utf8, true),
        ArrowField::new("notice_type", DataType::Utf8, true),
        ArrowField::new("agency_name", DataType::Utf8, true),
        ArrowField::new("naics_code", DataType::Utf8, true),
        ArrowField::new("set_aside_type", DataType::Utf8, true),
        ArrowField::new("response_deadline", DataType::Utf8, true),
        ArrowField::new("attachments", DataType::UInt32, false),
        ArrowField::new("downloaded_bytes", DataType::UInt64, false),
        ArrowField::new("scraped_at", DataType::Utf8, false),
    ]));

    let ids = StringArray::from(
        rows.iter()
            .map(|r| Some(r.opportunity_id.as_str()))
            .collect::<Vec<_>>(),
    );
    let scraped_at = StringArray::from(
        rows.iter()
            .map(|r| Some(r.scraped_at.as_str()))
            .collect::<Vec<_>>(),
    );
    let attachments = UInt32Array::from(rows.iter().map(|r| r.attachments).collect::<Vec<_>>());
    let bytes = UInt64Array::from(rows.iter().map(|r| r.downloaded_bytes).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(ids),
            Arc::new(optional_column(rows, |r| r.solicitation_number.as_ref())),
            Arc::new(optional_column(rows, |r| r.title.as_ref())),
            Arc::new(optional_column(rows, |r| r.notice_type.as_ref())),
            Arc::new(optional_column(rows, |r| r.agency_name.as_ref())),
            Arc::new(optional_column(rows, |r| r.naics_code.as_ref())),
            Arc::new(optional_column(rows, |r| r.set_aside_type.as_ref())),
            Arc::new(optional_column(rows, |r| r.response_deadline.as_ref())),
            Arc::new(attachments),
            Arc::new(bytes),
            Arc::new(scraped_at),
        ],
    )
    .context("building opportunities record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, run_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let rel = path
        .strip_prefix(run_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: sha256_hex(&bytes),
        bytes: bytes.len() as u64,
    })
}
