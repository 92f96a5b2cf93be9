//! SAM.gov source wiring: search pagination, detail and attachment-listing
//! fetches, attachment downloads and document text extraction.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use coh_core::{
    storage_key, Attachment, AttachmentDescriptor, Award, AwardAmount, Contact, DetailRecord,
    DownloadStatus, FailureStage, FetchOutcome, FieldOutcome, OpportunityDetail,
    OpportunitySummary, PlaceOfPerformance, SearchFilters,
};
use coh_storage::{HttpFetcher, HttpRequest, KeyValueStore};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "coh-adapters";

/// Guards against a search backend that never returns an empty page.
pub const MAX_SEARCH_PAGES: u32 = 10_000;

pub const MAX_EXTRACTED_CHARS: usize = 50_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SamEndpoints {
    pub search_url: String,
    pub details_url: String,
    pub resources_url: String,
    pub download_url: String,
}

impl Default for SamEndpoints {
    fn default() -> Self {
        Self::with_base("https://sam.gov")
    }
}

impl SamEndpoints {
    /// Endpoint set rooted at another host, e.g. a mirror or a local replay server.
    pub fn with_base(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            search_url: format!("{base}/api/prod/sgs/v1/search/"),
            details_url: format!("{base}/api/prod/opps/v2/opportunities"),
            resources_url: format!("{base}/api/prod/opps/v3/opportunities"),
            download_url: format!("{base}/api/prod/opps/v3/opportunities/resources/files"),
        }
    }

    pub fn detail_url(&self, opportunity_id: &str) -> String {
        format!("{}/{}", self.details_url.trim_end_matches('/'), opportunity_id)
    }

    pub fn resources_url(&self, opportunity_id: &str) -> String {
        format!(
            "{}/{}/resources",
            self.resources_url.trim_end_matches('/'),
            opportunity_id
        )
    }

    pub fn download_url(&self, resource_id: &str) -> String {
        format!(
            "{}/{}/download",
            self.download_url.trim_end_matches('/'),
            resource_id
        )
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Message(String),
}

fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    if cur.is_null() {
        None
    } else {
        Some(cur)
    }
}

fn json_str(value: &JsonValue, path: &[&str]) -> Option<String> {
    match json_at(value, path)? {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn json_bool(value: &JsonValue, path: &[&str]) -> Option<bool> {
    match json_at(value, path)? {
        JsonValue::Bool(b) => Some(*b),
        JsonValue::String(s) if s.eq_ignore_ascii_case("true") => Some(true),
        JsonValue::String(s) if s.eq_ignore_ascii_case("false") => Some(false),
        _ => None,
    }
}

fn json_u64(value: &JsonValue, path: &[&str]) -> Option<u64> {
    match json_at(value, path)? {
        JsonValue::Number(n) => n.as_u64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn json_array<'a>(value: &'a JsonValue, path: &[&str]) -> &'a [JsonValue] {
    json_at(value, path)
        .and_then(JsonValue::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn parse_object(body: &[u8], what: &str) -> Result<JsonValue, AdapterError> {
    let value: JsonValue = serde_json::from_slice(body)?;
    if !value.is_object() {
        return Err(AdapterError::Message(format!("{what} is not a JSON object")));
    }
    Ok(value)
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SearchPage {
    pub summaries: Vec<OpportunitySummary>,
    /// Hits on the page, including ones dropped for lacking an id.
    pub raw_count: usize,
    pub total_pages: Option<u64>,
}

pub fn parse_summary(hit: &JsonValue) -> Option<OpportunitySummary> {
    let opportunity_id = json_str(hit, &["_id"]).filter(|id| !id.trim().is_empty())?;
    Some(OpportunitySummary {
        opportunity_id,
        solicitation_number: json_str(hit, &["solicitationNumber"]),
        title: json_str(hit, &["title"]),
        description: json_array(hit, &["descriptions"])
            .first()
            .and_then(|d| json_str(d, &["content"])),
        notice_type: json_str(hit, &["type", "value"]),
        notice_type_code: json_str(hit, &["type", "code"]),
        posted_date: json_str(hit, &["publishDate"]),
        modified_date: json_str(hit, &["modifiedDate"]),
        response_deadline: json_str(hit, &["responseDate"]),
        response_time_zone: json_str(hit, &["responseTimeZone"]),
        is_active: json_bool(hit, &["isActive"]),
        is_canceled: json_bool(hit, &["isCanceled"]),
        organization_hierarchy: json_array(hit, &["organizationHierarchy"])
            .iter()
            .filter_map(|org| json_str(org, &["name"]))
            .collect(),
    })
}

pub fn parse_search_page(body: &[u8]) -> Result<SearchPage, AdapterError> {
    let value = parse_object(body, "search response")?;
    let hits = json_array(&value, &["_embedded", "results"]);
    Ok(SearchPage {
        summaries: hits.iter().filter_map(parse_summary).collect(),
        raw_count: hits.len(),
        total_pages: json_u64(&value, &["page", "totalPages"]),
    })
}

fn first_naics_code(data: &JsonValue) -> Option<String> {
    let entry = json_array(data, &["naics"]).first()?;
    match json_at(entry, &["code"])? {
        JsonValue::Array(codes) => codes.first().and_then(|c| json_str(c, &[])),
        other => json_str(other, &[]),
    }
}

pub fn parse_detail(body: &[u8]) -> Result<DetailRecord, AdapterError> {
    let value = parse_object(body, "detail response")?;
    let Some(data) = json_at(&value, &["data2"]) else {
        return Ok(DetailRecord::default());
    };

    let (set_aside_type, set_aside_description) = match json_at(data, &["typeOfSetAside"]) {
        Some(set_aside) if set_aside.is_object() => (
            json_str(set_aside, &["code"]),
            json_str(set_aside, &["value"]),
        ),
        _ => (None, None),
    };

    let place_of_performance = json_at(data, &["placeOfPerformance"])
        .filter(|pop| pop.is_object())
        .map(|pop| PlaceOfPerformance {
            city: json_str(pop, &["city", "name"]),
            state: json_str(pop, &["state", "name"]),
            state_code: json_str(pop, &["state", "code"]),
            country: json_str(pop, &["country", "name"]),
            country_code: json_str(pop, &["country", "code"]),
        });

    let contacts = json_array(data, &["pointOfContact"])
        .iter()
        .filter(|c| c.is_object())
        .map(|c| Contact {
            name: json_str(c, &["fullName"]),
            email: json_str(c, &["email"]),
            phone: json_str(c, &["phone"]),
            fax: json_str(c, &["fax"]),
            title: json_str(c, &["title"]),
            contact_type: json_str(c, &["type"]),
        })
        .collect();

    let award = json_at(data, &["award"])
        .filter(|a| a.is_object())
        .map(|award| Award {
            amount: match json_at(award, &["amount"]) {
                Some(JsonValue::Number(n)) => n.as_f64().map(AwardAmount::Number),
                Some(JsonValue::String(s)) => Some(AwardAmount::Text(s.clone())),
                _ => None,
            },
            awardee: json_str(award, &["awardee", "name"]),
            awardee_uei: json_str(award, &["awardee", "ueiSAM"]),
        });

    Ok(DetailRecord {
        naics_code: first_naics_code(data),
        psc_code: json_str(data, &["classificationCode"]),
        set_aside_type,
        set_aside_description,
        place_of_performance,
        contacts,
        award,
    })
}

/// Listing entries in order; deleted entries and entries without a resource id are dropped.
pub fn parse_attachment_listing(body: &[u8]) -> Result<Vec<AttachmentDescriptor>, AdapterError> {
    let value = parse_object(body, "attachment listing")?;
    let mut descriptors = Vec::new();
    for list in json_array(&value, &["_embedded", "opportunityAttachmentList"]) {
        for entry in json_array(list, &["attachments"]) {
            if !entry.is_object() {
                continue;
            }
            if json_str(entry, &["deletedFlag"]).as_deref() == Some("1") {
                continue;
            }
            let Some(resource_id) = json_str(entry, &["resourceId"]) else {
                continue;
            };
            descriptors.push(AttachmentDescriptor {
                resource_id,
                filename: json_str(entry, &["name"]).unwrap_or_else(|| "unknown".to_string()),
                content_type: json_str(entry, &["mimeType"]),
                size: json_u64(entry, &["size"]).filter(|size| *size > 0),
                access_level: json_str(entry, &["accessLevel"])
                    .unwrap_or_else(|| "public".to_string()),
                posted_date: json_str(entry, &["postedDate"]),
            });
        }
    }
    Ok(descriptors)
}

/// `postedFrom` value (`MM/DD/YYYY`) for a lookback window ending at `now`.
pub fn posted_from(now: DateTime<Utc>, days: u32) -> String {
    (now - ChronoDuration::days(i64::from(days)))
        .format("%m/%d/%Y")
        .to_string()
}

pub fn build_search_request(
    endpoints: &SamEndpoints,
    filters: &SearchFilters,
    page: u32,
    posted_from: Option<&str>,
    now: DateTime<Utc>,
) -> HttpRequest {
    let mut request = HttpRequest::json(endpoints.search_url.clone())
        .with_query("random", now.timestamp().to_string())
        .with_query("index", "opp")
        .with_query("page", page.to_string())
        .with_query("mode", "search")
        .with_query("sort", "-modifiedDate")
        .with_query("size", filters.page_size.max(1).to_string())
        .with_query("is_active", "true");

    if let Some(keywords) = filters.keywords.as_deref().map(str::trim) {
        if !keywords.is_empty() {
            request = request.with_query("q", keywords);
        }
    }
    for (key, values) in [
        ("naics", &filters.naics_codes),
        ("typeOfSetAside", &filters.set_aside_types),
        ("state", &filters.states),
        ("opp_type", &filters.opportunity_types),
    ] {
        if !values.is_empty() {
            request = request.with_query(key, values.join(","));
        }
    }
    if let Some(from) = posted_from {
        request = request.with_query("postedFrom", from);
    }
    request
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("search page {page} failed: {reason}")]
    Request { page: u32, reason: String },
    #[error("search page {page} was malformed: {reason}")]
    Malformed { page: u32, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cursor {
    Open,
    LastPage,
    Closed,
}

/// Lazy walk over search result pages.
///
/// Pages are requested one at a time and only once the previous page has been
/// drained, so a caller that stops pulling never triggers another request.
/// Once finished (exhausted, capped, or failed) it stays finished.
#[derive(Debug)]
pub struct SearchPaginator {
    fetcher: Arc<HttpFetcher>,
    endpoints: SamEndpoints,
    filters: SearchFilters,
    posted_from: Option<String>,
    next_page: u32,
    buffer: VecDeque<OpportunitySummary>,
    seen: HashSet<String>,
    emitted: usize,
    duplicates: usize,
    pages_fetched: u32,
    cursor: Cursor,
}

impl SearchPaginator {
    pub fn new(fetcher: Arc<HttpFetcher>, endpoints: SamEndpoints, filters: SearchFilters) -> Self {
        Self::starting_at(fetcher, endpoints, filters, Utc::now())
    }

    pub fn starting_at(
        fetcher: Arc<HttpFetcher>,
        endpoints: SamEndpoints,
        filters: SearchFilters,
        now: DateTime<Utc>,
    ) -> Self {
        let posted_from = filters
            .posted_within_days
            .filter(|days| *days > 0)
            .map(|days| posted_from(now, days));
        Self {
            fetcher,
            endpoints,
            filters,
            posted_from,
            next_page: 0,
            buffer: VecDeque::new(),
            seen: HashSet::new(),
            emitted: 0,
            duplicates: 0,
            pages_fetched: 0,
            cursor: Cursor::Open,
        }
    }

    pub fn emitted(&self) -> usize {
        self.emitted
    }

    pub fn pages_fetched(&self) -> u32 {
        self.pages_fetched
    }

    pub fn duplicates_skipped(&self) -> usize {
        self.duplicates
    }

    pub fn is_finished(&self) -> bool {
        self.cursor == Cursor::Closed
    }

    /// Stops the walk; buffered summaries are discarded.
    pub fn close(&mut self) {
        self.cursor = Cursor::Closed;
        self.buffer.clear();
    }

    pub async fn next(&mut self) -> Result<Option<OpportunitySummary>, SearchError> {
        loop {
            if self
                .filters
                .result_cap
                .is_some_and(|cap| self.emitted >= cap)
            {
                self.close();
                return Ok(None);
            }

            if let Some(summary) = self.buffer.pop_front() {
                if !self.seen.insert(summary.opportunity_id.clone()) {
                    self.duplicates += 1;
                    debug!(opportunity_id = %summary.opportunity_id, "duplicate search hit skipped");
                    continue;
                }
                self.emitted += 1;
                return Ok(Some(summary));
            }

            if self.cursor != Cursor::Open {
                self.close();
                return Ok(None);
            }

            if self.next_page >= MAX_SEARCH_PAGES {
                warn!(pages = self.next_page, "search page ceiling reached");
                self.close();
                return Ok(None);
            }

            let page = self.next_page;
            let request = build_search_request(
                &self.endpoints,
                &self.filters,
                page,
                self.posted_from.as_deref(),
                Utc::now(),
            );
            info!(page = page + 1, "fetching search page");

            let resp = match self.fetcher.fetch(&request).await {
                FetchOutcome::Success(resp) => resp,
                FetchOutcome::RetryableFailure(reason) | FetchOutcome::FatalFailure(reason) => {
                    self.close();
                    return Err(SearchError::Request { page, reason });
                }
            };
            let parsed = match parse_search_page(&resp.body) {
                Ok(parsed) => parsed,
                Err(err) => {
                    self.close();
                    return Err(SearchError::Malformed {
                        page,
                        reason: err.to_string(),
                    });
                }
            };

            self.pages_fetched += 1;
            self.next_page += 1;
            info!(page = page + 1, results = parsed.raw_count, "search page received");

            if parsed.raw_count == 0 {
                self.close();
                return Ok(None);
            }
            if parsed.summaries.len() < parsed.raw_count {
                warn!(
                    page = page + 1,
                    skipped = parsed.raw_count - parsed.summaries.len(),
                    "search hits without an id were skipped"
                );
            }
            if parsed
                .total_pages
                .is_some_and(|total| u64::from(page) + 1 >= total)
            {
                self.cursor = Cursor::LastPage;
            }
            self.buffer.extend(parsed.summaries);
        }
    }
}

/// Detail record plus attachment listing for one opportunity.
#[derive(Debug, Clone)]
pub struct DetailFetcher {
    fetcher: Arc<HttpFetcher>,
    endpoints: SamEndpoints,
}

impl DetailFetcher {
    pub fn new(fetcher: Arc<HttpFetcher>, endpoints: SamEndpoints) -> Self {
        Self { fetcher, endpoints }
    }

    /// Both sub-calls run concurrently; only a missing detail record is fatal.
    pub async fn fetch(
        &self,
        opportunity_id: &str,
        include_attachments: bool,
    ) -> FetchOutcome<OpportunityDetail> {
        let detail_request = HttpRequest::json(self.endpoints.detail_url(opportunity_id));
        let listing = async {
            if include_attachments {
                self.fetch_listing(opportunity_id).await
            } else {
                FieldOutcome::NotRequested
            }
        };

        let (detail, attachments) = tokio::join!(self.fetcher.fetch(&detail_request), listing);

        let resp = match detail {
            FetchOutcome::Success(resp) => resp,
            FetchOutcome::RetryableFailure(reason) | FetchOutcome::FatalFailure(reason) => {
                warn!(opportunity_id, stage = %FailureStage::Detail, %reason, "detail fetch failed");
                return FetchOutcome::FatalFailure(reason);
            }
        };

        match parse_detail(&resp.body) {
            Ok(record) => FetchOutcome::Success(OpportunityDetail {
                record,
                attachments,
            }),
            Err(err) => {
                warn!(opportunity_id, stage = %FailureStage::Detail, error = %err, "malformed detail record");
                FetchOutcome::FatalFailure(format!("malformed detail record: {err}"))
            }
        }
    }

    pub async fn fetch_listing(&self, opportunity_id: &str) -> FieldOutcome<Vec<AttachmentDescriptor>> {
        let request = HttpRequest::json(self.endpoints.resources_url(opportunity_id));
        match self.fetcher.fetch_accepting(&request, &[404]).await {
            FetchOutcome::Success(resp) if resp.status == 404 => FieldOutcome::Fetched(Vec::new()),
            FetchOutcome::Success(resp) => match parse_attachment_listing(&resp.body) {
                Ok(descriptors) => FieldOutcome::Fetched(descriptors),
                Err(err) => {
                    warn!(opportunity_id, stage = %FailureStage::Listing, error = %err, "malformed attachment listing");
                    FieldOutcome::failed(format!("malformed attachment listing: {err}"))
                }
            },
            FetchOutcome::RetryableFailure(reason) | FetchOutcome::FatalFailure(reason) => {
                warn!(opportunity_id, stage = %FailureStage::Listing, %reason, "attachment listing failed");
                FieldOutcome::failed(reason)
            }
        }
    }
}

/// An attachment record plus its bytes when the download succeeded.
///
/// The bytes are only kept long enough for optional text extraction.
#[derive(Debug, Clone)]
pub struct AcquiredAttachment {
    pub attachment: Attachment,
    pub body: Option<Vec<u8>>,
}

#[derive(Clone)]
pub struct AttachmentDownloader {
    fetcher: Arc<HttpFetcher>,
    endpoints: SamEndpoints,
    store: Arc<dyn KeyValueStore>,
}

impl std::fmt::Debug for AttachmentDownloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachmentDownloader")
            .field("endpoints", &self.endpoints)
            .finish_non_exhaustive()
    }
}

impl AttachmentDownloader {
    pub fn new(
        fetcher: Arc<HttpFetcher>,
        endpoints: SamEndpoints,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        Self {
            fetcher,
            endpoints,
            store,
        }
    }

    pub fn describe(
        &self,
        opportunity_id: &str,
        descriptor: &AttachmentDescriptor,
        download: DownloadStatus,
    ) -> Attachment {
        Attachment {
            resource_id: descriptor.resource_id.clone(),
            filename: descriptor.filename.clone(),
            content_type: descriptor.content_type.clone(),
            size: descriptor.size,
            access_level: descriptor.access_level.clone(),
            posted_date: descriptor.posted_date.clone(),
            download_url: self.endpoints.download_url(&descriptor.resource_id),
            storage_key: storage_key(opportunity_id, &descriptor.filename),
            download,
        }
    }

    /// Raw body with retries; an empty body is treated as a permanent failure.
    pub async fn fetch_body(&self, descriptor: &AttachmentDescriptor) -> FetchOutcome<Vec<u8>> {
        let request = HttpRequest::binary(self.endpoints.download_url(&descriptor.resource_id));
        match self.fetcher.fetch(&request).await {
            FetchOutcome::Success(resp) if resp.body.is_empty() => {
                FetchOutcome::FatalFailure(format!("empty response body from {}", resp.final_url))
            }
            other => other.map(|resp| resp.body),
        }
    }

    pub async fn acquire(
        &self,
        opportunity_id: &str,
        descriptor: &AttachmentDescriptor,
    ) -> AcquiredAttachment {
        let resource_id = descriptor.resource_id.as_str();
        if !descriptor.is_public() {
            info!(opportunity_id, resource_id, access_level = %descriptor.access_level, "skipping non-public attachment");
            let status = DownloadStatus::Skipped {
                reason: format!("non-public access level: {}", descriptor.access_level),
            };
            return AcquiredAttachment {
                attachment: self.describe(opportunity_id, descriptor, status),
                body: None,
            };
        }

        let failed = |stage: FailureStage, reason: String| {
            warn!(opportunity_id, resource_id, %stage, %reason, "attachment failed");
            AcquiredAttachment {
                attachment: self.describe(
                    opportunity_id,
                    descriptor,
                    DownloadStatus::Failed { reason, stage },
                ),
                body: None,
            }
        };

        let body = match self.fetch_body(descriptor).await {
            FetchOutcome::Success(body) => body,
            FetchOutcome::RetryableFailure(reason) | FetchOutcome::FatalFailure(reason) => {
                return failed(FailureStage::Download, reason);
            }
        };

        let received = body.len() as u64;
        let size_mismatch = descriptor.size.is_some_and(|declared| declared != received);
        if size_mismatch {
            warn!(
                opportunity_id,
                resource_id,
                declared = descriptor.size,
                received,
                "attachment size differs from listing"
            );
        }

        let key = storage_key(opportunity_id, &descriptor.filename);
        match self.store.put(&key, &body).await {
            Ok(stored) => {
                info!(
                    opportunity_id,
                    resource_id,
                    storage_key = %key,
                    bytes = received,
                    deduplicated = stored.deduplicated,
                    "attachment stored"
                );
                let status = DownloadStatus::Downloaded {
                    downloaded_size: received,
                    sha256: stored.content_hash,
                    size_mismatch,
                };
                AcquiredAttachment {
                    attachment: self.describe(opportunity_id, descriptor, status),
                    body: Some(body),
                }
            }
            Err(err) => failed(FailureStage::Store, err.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("document type not supported for text extraction")]
    Unsupported,
    #[error("text extraction failed: {0}")]
    Failed(String),
    #[error("text extraction panicked on a malformed document")]
    Panicked,
    #[error("document contains no extractable text")]
    Empty,
}

/// Bytes in, text or failure out. `content_type` is the listing's mime type, if any.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    fn supports(&self, filename: &str, content_type: Option<&str>) -> bool;
    async fn extract(
        &self,
        bytes: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<String, ExtractError>;
}

pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => text[..cut].to_string(),
        None => text.to_string(),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PdfTextExtractor {
    pub max_chars: usize,
}

impl Default for PdfTextExtractor {
    fn default() -> Self {
        Self {
            max_chars: MAX_EXTRACTED_CHARS,
        }
    }
}

#[async_trait]
impl TextExtractor for PdfTextExtractor {
    fn supports(&self, filename: &str, content_type: Option<&str>) -> bool {
        filename.to_ascii_lowercase().ends_with(".pdf")
            || content_type.is_some_and(|ct| ct.to_ascii_lowercase().contains("pdf"))
    }

    async fn extract(
        &self,
        bytes: Vec<u8>,
        _content_type: Option<&str>,
    ) -> Result<String, ExtractError> {
        // pdf-extract can panic on malformed fonts
        let joined = tokio::task::spawn_blocking(move || {
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                pdf_extract::extract_text_from_mem(&bytes)
            }))
        })
        .await
        .map_err(|err| ExtractError::Failed(err.to_string()))?;

        let text = match joined {
            Ok(Ok(text)) => text,
            Ok(Err(err)) => return Err(ExtractError::Failed(err.to_string())),
            Err(_) => return Err(ExtractError::Panicked),
        };
        let text = text.trim();
        if text.is_empty() {
            return Err(ExtractError::Empty);
        }
        Ok(truncate_chars(text, self.max_chars))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use coh_storage::{
        FsKeyValueStore, MemoryKeyValueStore, RateLimitConfig, RateLimiter, ScriptedTransport,
    };
    use serde_json::json;
    use std::time::Duration;

    const BASE: &str = "https://sam.test";

    fn fetcher(transport: Arc<ScriptedTransport>) -> Arc<HttpFetcher> {
        let limiter = RateLimiter::new(RateLimitConfig {
            min_interval: Duration::from_millis(5),
            max_backoff: Duration::from_millis(50),
            jitter: false,
        });
        Arc::new(HttpFetcher::new(transport, Arc::new(limiter), 3))
    }

    fn hit(id: &str) -> JsonValue {
        json!({
            "_id": id,
            "title": format!("Opportunity {id}"),
            "solicitationNumber": format!("SOL-{id}"),
            "descriptions": [{"content": "Janitorial services"}],
            "type": {"code": "o", "value": "Solicitation"},
            "publishDate": "2026-10-01",
            "isActive": true,
            "isCanceled": false,
            "organizationHierarchy": [
                {"name": "DEPT OF DEFENSE"},
                {"name": "DEPT OF THE ARMY"},
                {"name": "W6QK ACC-APG"}
            ]
        })
    }

    fn page(ids: &[&str]) -> JsonValue {
        json!({"_embedded": {"results": ids.iter().map(|id| hit(id)).collect::<Vec<_>>()}})
    }

    fn descriptor(resource_id: &str, filename: &str, size: Option<u64>) -> AttachmentDescriptor {
        AttachmentDescriptor {
            resource_id: resource_id.to_string(),
            filename: filename.to_string(),
            content_type: Some("application/pdf".to_string()),
            size,
            access_level: "public".to_string(),
            posted_date: None,
        }
    }

    #[test]
    fn search_request_carries_filters() {
        let endpoints = SamEndpoints::with_base(BASE);
        let filters = SearchFilters {
            keywords: Some(" cybersecurity ".into()),
            naics_codes: vec!["541511".into(), "541512".into()],
            states: vec!["VA".into()],
            ..SearchFilters::default()
        };
        let now = Utc.with_ymd_and_hms(2026, 10, 31, 12, 0, 0).single().unwrap();
        let from = posted_from(now, 30);
        let request = build_search_request(&endpoints, &filters, 2, Some(&from), now);

        assert_eq!(request.url, format!("{BASE}/api/prod/sgs/v1/search/"));
        assert_eq!(request.query_value("page"), Some("2"));
        assert_eq!(request.query_value("size"), Some("25"));
        assert_eq!(request.query_value("q"), Some("cybersecurity"));
        assert_eq!(request.query_value("naics"), Some("541511,541512"));
        assert_eq!(request.query_value("state"), Some("VA"));
        assert_eq!(request.query_value("postedFrom"), Some("10/01/2026"));
        assert_eq!(request.query_value("typeOfSetAside"), None);
    }

    #[test]
    fn summary_parsing_maps_hierarchy_and_description() {
        let summary = parse_summary(&hit("abc")).unwrap();
        assert_eq!(summary.opportunity_id, "abc");
        assert_eq!(summary.description.as_deref(), Some("Janitorial services"));
        assert_eq!(summary.notice_type_code.as_deref(), Some("o"));
        assert_eq!(summary.organization_hierarchy.len(), 3);
        assert_eq!(summary.is_active, Some(true));
        assert!(parse_summary(&json!({"title": "no id"})).is_none());
    }

    #[test]
    fn search_page_without_embedded_is_empty() {
        let parsed = parse_search_page(br#"{"page": {"totalPages": 0}}"#).unwrap();
        assert_eq!(parsed.raw_count, 0);
        assert!(parse_search_page(b"[1,2]").is_err());
        assert!(parse_search_page(b"<html>").is_err());
    }

    #[test]
    fn detail_parsing_tolerates_partial_payloads() {
        let body = json!({
            "data2": {
                "naics": [{"code": ["561720"]}],
                "classificationCode": "S201",
                "typeOfSetAside": {"code": "SBA", "value": "Total Small Business Set-Aside"},
                "placeOfPerformance": {
                    "city": {"name": "Aberdeen"},
                    "state": {"code": "MD", "name": "Maryland"},
                    "country": null
                },
                "pointOfContact": [
                    {"fullName": "Pat Doe", "email": "pat@example.mil", "type": "primary"},
                    null,
                    {"fullName": "Sam Roe", "type": "secondary"}
                ],
                "award": {"amount": "125000.00", "awardee": {"name": "ACME", "ueiSAM": "U123"}}
            }
        });
        let record = parse_detail(body.to_string().as_bytes()).unwrap();
        assert_eq!(record.naics_code.as_deref(), Some("561720"));
        assert_eq!(record.psc_code.as_deref(), Some("S201"));
        assert_eq!(record.set_aside_type.as_deref(), Some("SBA"));
        let pop = record.place_of_performance.unwrap();
        assert_eq!(pop.state_code.as_deref(), Some("MD"));
        assert_eq!(pop.country, None);
        assert_eq!(record.contacts.len(), 2);
        assert_eq!(record.contacts[1].name.as_deref(), Some("Sam Roe"));
        let award = record.award.unwrap();
        assert_eq!(award.amount, Some(AwardAmount::Text("125000.00".into())));
        assert_eq!(award.awardee_uei.as_deref(), Some("U123"));

        let sparse = parse_detail(br#"{"data2": {"typeOfSetAside": "none", "award": null}}"#).unwrap();
        assert_eq!(sparse.set_aside_type, None);
        assert!(sparse.award.is_none());
    }

    #[test]
    fn listing_parsing_drops_deleted_and_anonymous_entries() {
        let body = json!({
            "_embedded": {"opportunityAttachmentList": [{"attachments": [
                {"resourceId": "r1", "name": "SOW.pdf", "mimeType": ".pdf", "size": 2048, "accessLevel": "public"},
                {"resourceId": "r2", "name": "old.pdf", "deletedFlag": "1"},
                {"name": "orphan.pdf"},
                {"resourceId": "r3", "name": "Drawings.zip", "size": 0, "accessLevel": "private"}
            ]}]}
        });
        let descriptors = parse_attachment_listing(body.to_string().as_bytes()).unwrap();
        assert_eq!(descriptors.len(), 2);
        assert_eq!(descriptors[0].resource_id, "r1");
        assert_eq!(descriptors[0].size, Some(2048));
        assert_eq!(descriptors[1].size, None);
        assert!(!descriptors[1].is_public());
    }

    #[tokio::test(start_paused = true)]
    async fn paginator_walks_until_an_empty_page() {
        let transport = Arc::new(ScriptedTransport::new());
        let endpoints = SamEndpoints::with_base(BASE);
        transport.push_json(&endpoints.search_url, 200, &page(&["a", "b"]));
        transport.push_json(&endpoints.search_url, 200, &page(&["b", "c"]));
        transport.push_json(&endpoints.search_url, 200, &page(&[]));

        let mut paginator =
            SearchPaginator::new(fetcher(transport.clone()), endpoints.clone(), SearchFilters::default());
        let mut ids = Vec::new();
        while let Some(summary) = paginator.next().await.unwrap() {
            ids.push(summary.opportunity_id);
        }

        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(paginator.duplicates_skipped(), 1);
        assert_eq!(paginator.pages_fetched(), 3);
        assert!(paginator.is_finished());
        assert_eq!(paginator.next().await.unwrap(), None);
        assert_eq!(transport.calls_to(&endpoints.search_url), 3);

        let pages = transport
            .requests()
            .iter()
            .filter_map(|r| r.query_value("page").map(ToString::to_string))
            .collect::<Vec<_>>();
        assert_eq!(pages, vec!["0", "1", "2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn paginator_stops_at_cap_without_requesting_more_pages() {
        let transport = Arc::new(ScriptedTransport::new());
        let endpoints = SamEndpoints::with_base(BASE);
        transport.push_json(&endpoints.search_url, 200, &page(&["a", "b", "c"]));
        transport.push_json(&endpoints.search_url, 200, &page(&["d", "e", "f"]));

        let filters = SearchFilters {
            result_cap: Some(2),
            ..SearchFilters::default()
        };
        let mut paginator = SearchPaginator::new(fetcher(transport.clone()), endpoints.clone(), filters);
        assert!(paginator.next().await.unwrap().is_some());
        assert!(paginator.next().await.unwrap().is_some());
        assert_eq!(paginator.next().await.unwrap(), None);
        assert_eq!(transport.calls_to(&endpoints.search_url), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn paginator_honors_total_pages_metadata() {
        let transport = Arc::new(ScriptedTransport::new());
        let endpoints = SamEndpoints::with_base(BASE);
        let mut body = page(&["a"]);
        body["page"] = json!({"totalPages": 1, "number": 0});
        transport.push_json(&endpoints.search_url, 200, &body);

        let mut paginator =
            SearchPaginator::new(fetcher(transport.clone()), endpoints.clone(), SearchFilters::default());
        assert!(paginator.next().await.unwrap().is_some());
        assert_eq!(paginator.next().await.unwrap(), None);
        assert_eq!(transport.calls_to(&endpoints.search_url), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn paginator_surfaces_fatal_search_errors() {
        let transport = Arc::new(ScriptedTransport::new());
        let endpoints = SamEndpoints::with_base(BASE);
        transport.push_json(&endpoints.search_url, 200, &page(&["a"]));
        transport.push_json(&endpoints.search_url, 400, &json!({"error": "bad filter"}));

        let mut paginator =
            SearchPaginator::new(fetcher(transport.clone()), endpoints.clone(), SearchFilters::default());
        assert!(paginator.next().await.unwrap().is_some());
        let err = paginator.next().await.unwrap_err();
        assert!(matches!(err, SearchError::Request { page: 1, .. }), "{err}");
        assert_eq!(paginator.next().await.unwrap(), None);
        assert_eq!(transport.calls_to(&endpoints.search_url), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn detail_survives_a_failed_listing() {
        let transport = Arc::new(ScriptedTransport::new());
        let endpoints = SamEndpoints::with_base(BASE);
        transport.push_json(&endpoints.detail_url("o1"), 200, &json!({"data2": {"classificationCode": "R425"}}));
        transport.push_json(&endpoints.resources_url("o1"), 500, &json!({}));

        let detail_fetcher = DetailFetcher::new(fetcher(transport.clone()), endpoints.clone());
        let detail = detail_fetcher.fetch("o1", true).await.success().unwrap();

        assert_eq!(detail.record.psc_code.as_deref(), Some("R425"));
        assert!(detail.attachments.is_failed());
        assert_eq!(transport.calls_to(&endpoints.resources_url("o1")), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_listing_means_no_attachments_and_skip_means_not_requested() {
        let transport = Arc::new(ScriptedTransport::new());
        let endpoints = SamEndpoints::with_base(BASE);
        transport.push_json(&endpoints.detail_url("o2"), 200, &json!({}));

        let detail_fetcher = DetailFetcher::new(fetcher(transport.clone()), endpoints.clone());
        let with_listing = detail_fetcher.fetch("o2", true).await.success().unwrap();
        assert_eq!(with_listing.attachments, FieldOutcome::Fetched(Vec::new()));

        let without_listing = detail_fetcher.fetch("o2", false).await.success().unwrap();
        assert_eq!(without_listing.attachments, FieldOutcome::NotRequested);
        assert_eq!(transport.calls_to(&endpoints.resources_url("o2")), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_detail_is_fatal() {
        let transport = Arc::new(ScriptedTransport::new());
        let endpoints = SamEndpoints::with_base(BASE);
        let detail_fetcher = DetailFetcher::new(fetcher(transport), endpoints);
        assert!(matches!(
            detail_fetcher.fetch("gone", true).await,
            FetchOutcome::FatalFailure(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn download_persists_under_storage_key_and_flags_size_mismatch() {
        let transport = Arc::new(ScriptedTransport::new());
        let endpoints = SamEndpoints::with_base(BASE);
        transport.push_bytes(&endpoints.download_url("r1"), 200, b"%PDF-1.7 body".to_vec());

        let store = Arc::new(MemoryKeyValueStore::new());
        let downloader = AttachmentDownloader::new(fetcher(transport), endpoints, store.clone());
        let acquired = downloader
            .acquire("opp-9", &descriptor("r1", "Scope (final).pdf", Some(99)))
            .await;

        let attachment = acquired.attachment;
        let key = storage_key("opp-9", "Scope (final).pdf");
        assert_eq!(attachment.storage_key, key);
        assert!(key.starts_with("opp-9/Scope final-"));
        match &attachment.download {
            DownloadStatus::Downloaded {
                downloaded_size,
                size_mismatch,
                ..
            } => {
                assert_eq!(*downloaded_size, 13);
                assert!(*size_mismatch);
            }
            other => panic!("unexpected status {other:?}"),
        }
        assert_eq!(acquired.body.as_deref(), Some(&b"%PDF-1.7 body"[..]));
        assert_eq!(
            store.get(&key).await.unwrap().as_deref(),
            Some(&b"%PDF-1.7 body"[..])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn download_failures_are_tagged_with_their_stage() {
        let transport = Arc::new(ScriptedTransport::new());
        let endpoints = SamEndpoints::with_base(BASE);
        transport.push_bytes(&endpoints.download_url("empty"), 200, Vec::new());
        transport.push_bytes(&endpoints.download_url("ok"), 200, b"bytes".to_vec());

        let downloader = AttachmentDownloader::new(
            fetcher(transport.clone()),
            endpoints.clone(),
            Arc::new(MemoryKeyValueStore::new()),
        );

        let missing = downloader.acquire("o", &descriptor("gone", "a.pdf", None)).await;
        assert!(matches!(
            missing.attachment.download,
            DownloadStatus::Failed { stage: FailureStage::Download, .. }
        ));
        assert_eq!(transport.calls_to(&endpoints.download_url("gone")), 1);

        let empty = downloader.acquire("o", &descriptor("empty", "b.pdf", None)).await;
        assert!(empty.attachment.download.is_failed());

        let mut private = descriptor("secret", "c.pdf", None);
        private.access_level = "private".into();
        let skipped = downloader.acquire("o", &private).await;
        assert!(matches!(skipped.attachment.download, DownloadStatus::Skipped { .. }));
        assert_eq!(transport.calls_to(&endpoints.download_url("secret")), 0);

        // a regular file as the parent directory makes every store write fail
        let file = tempfile::NamedTempFile::new().unwrap();
        let broken_store = AttachmentDownloader::new(
            fetcher(transport),
            endpoints,
            Arc::new(FsKeyValueStore::new(file.path().join("not-a-dir"))),
        );
        let unstored = broken_store.acquire("o", &descriptor("ok", "d.pdf", None)).await;
        assert!(matches!(
            unstored.attachment.download,
            DownloadStatus::Failed { stage: FailureStage::Store, .. }
        ));
    }

    #[tokio::test]
    async fn pdf_extractor_reports_garbage_as_failure() {
        let extractor = PdfTextExtractor::default();
        assert!(extractor.supports("Statement.PDF", None));
        assert!(extractor.supports("blob", Some("application/pdf")));
        assert!(!extractor.supports("drawings.zip", Some("application/zip")));
        assert!(extractor
            .extract(b"not a pdf at all".to_vec(), Some("application/pdf"))
            .await
            .is_err());
    }

    #[test]
    fn truncation_counts_characters_not_bytes() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }
}
