use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use coh_adapters::{AttachmentDownloader, ExtractError, SamEndpoints, TextExtractor};
use coh_core::{AttachmentDescriptor, DownloadStatus, FailureStage, FieldOutcome};
use coh_storage::{
    HttpFetcher, MemoryDataset, MemoryKeyValueStore, RateLimitConfig, RateLimiter,
    ScriptedTransport,
};
use coh_sync::{HarvestConfig, HarvestPipeline, RunState, StopReason};
use serde_json::{json, Value};
use tokio::sync::watch;

const BASE: &str = "https://sam.test";

fn endpoints() -> SamEndpoints {
    SamEndpoints::with_base(BASE)
}

fn fetcher(transport: Arc<ScriptedTransport>) -> Arc<HttpFetcher> {
    let limiter = RateLimiter::new(RateLimitConfig {
        min_interval: Duration::from_millis(5),
        max_backoff: Duration::from_millis(80),
        jitter: false,
    });
    Arc::new(HttpFetcher::new(transport, Arc::new(limiter), 3))
}

fn config(max_opportunities: usize) -> HarvestConfig {
    HarvestConfig {
        max_opportunities,
        workers: 2,
        reports_dir: None,
        endpoints: endpoints(),
        ..HarvestConfig::default()
    }
}

struct Harness {
    transport: Arc<ScriptedTransport>,
    store: Arc<MemoryKeyValueStore>,
    dataset: Arc<MemoryDataset>,
}

impl Harness {
    fn new() -> Self {
        Self {
            transport: Arc::new(ScriptedTransport::new()),
            store: Arc::new(MemoryKeyValueStore::new()),
            dataset: Arc::new(MemoryDataset::new()),
        }
    }

    fn pipeline(&self, config: HarvestConfig) -> HarvestPipeline {
        HarvestPipeline::new(
            config,
            fetcher(self.transport.clone()),
            self.store.clone(),
            self.dataset.clone(),
        )
    }

    /// Queues search pages in order; the last one keeps answering.
    fn search_pages(&self, pages: &[&[&str]]) {
        for ids in pages {
            let hits = ids
                .iter()
                .map(|id| {
                    json!({
                        "_id": id,
                        "title": format!("Opportunity {id}"),
                        "organizationHierarchy": [{"name": "GENERAL SERVICES ADMINISTRATION"}]
                    })
                })
                .collect::<Vec<_>>();
            self.transport
                .push_json(&endpoints().search_url, 200, &json!({"_embedded": {"results": hits}}));
        }
    }

    fn detail(&self, id: &str) {
        self.transport.push_json(
            &endpoints().detail_url(id),
            200,
            &json!({"data2": {"naics": [{"code": ["561720"]}], "classificationCode": "S201"}}),
        );
    }

    fn listing(&self, id: &str, attachments: &[(&str, &str, usize)]) {
        let entries = attachments
            .iter()
            .map(|(resource_id, name, size)| {
                json!({"resourceId": resource_id, "name": name, "size": size, "accessLevel": "public"})
            })
            .collect::<Vec<Value>>();
        self.transport.push_json(
            &endpoints().resources_url(id),
            200,
            &json!({"_embedded": {"opportunityAttachmentList": [{"attachments": entries}]}}),
        );
    }

    fn file(&self, resource_id: &str, status: u16, body: &[u8]) {
        self.transport
            .push_bytes(&endpoints().download_url(resource_id), status, body.to_vec());
    }
}

/// Reads PDFs as plain UTF-8 and fails on bodies starting with `broken`.
#[derive(Default)]
struct PlainTextExtractor {
    seen_content_types: Mutex<Vec<Option<String>>>,
}

#[async_trait]
impl TextExtractor for PlainTextExtractor {
    fn supports(&self, filename: &str, _content_type: Option<&str>) -> bool {
        filename.ends_with(".pdf")
    }

    async fn extract(
        &self,
        bytes: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<String, ExtractError> {
        self.seen_content_types
            .lock()
            .unwrap()
            .push(content_type.map(ToString::to_string));
        if bytes.starts_with(b"broken") {
            return Err(ExtractError::Failed("unreadable".into()));
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

fn body_for(id: &str) -> Vec<u8> {
    format!("%PDF-1.4 statement of work for {id}").into_bytes()
}

#[tokio::test(start_paused = true)]
async fn two_pages_with_one_attachment_each() {
    let h = Harness::new();
    h.search_pages(&[&["a", "b", "c"], &[]]);
    for id in ["a", "b", "c"] {
        let body = body_for(id);
        let resource_id = format!("r-{id}");
        h.detail(id);
        h.listing(id, &[(resource_id.as_str(), "SOW.pdf", body.len())]);
        h.file(&resource_id, 200, &body);
    }

    let summary = h.pipeline(config(100)).run_to_completion().await.unwrap();

    assert_eq!(summary.state, RunState::Done);
    assert_eq!(summary.stop_reason, StopReason::Exhausted);
    assert_eq!(summary.pages_fetched, 2);
    assert_eq!(summary.exported(), 3);
    assert_eq!(summary.tally.attachments_downloaded, 3);

    let mut records = h.dataset.records().await;
    records.sort_by(|a, b| a.opportunity_id.cmp(&b.opportunity_id));
    assert_eq!(records.len(), 3);
    for record in &records {
        let attachments = record.attachment_list();
        assert_eq!(attachments.len(), 1);
        let attachment = &attachments[0];
        assert_eq!(attachment.storage_key, format!("{}/SOW.pdf", record.opportunity_id));
        assert_eq!(
            attachment.download.downloaded_size(),
            Some(body_for(&record.opportunity_id).len() as u64)
        );
        assert!(record.attachment_texts.is_empty());
        assert_eq!(record.naics_code.as_deref(), Some("561720"));
        assert_eq!(record.agency_name.as_deref(), Some("GENERAL SERVICES ADMINISTRATION"));
    }
    assert_eq!(h.store.keys().await, vec!["a/SOW.pdf", "b/SOW.pdf", "c/SOW.pdf"]);
}

#[tokio::test(start_paused = true)]
async fn download_recovers_after_two_server_errors() {
    let h = Harness::new();
    h.search_pages(&[&["a"], &[]]);
    h.detail("a");
    h.listing("a", &[("r-a", "SOW.pdf", 0)]);
    h.file("r-a", 500, b"");
    h.file("r-a", 500, b"");
    h.file("r-a", 200, b"finally");

    let summary = h.pipeline(config(10)).run_to_completion().await.unwrap();

    assert_eq!(summary.tally.opportunities_failed, 0);
    assert_eq!(summary.tally.attachments_downloaded, 1);
    assert_eq!(h.transport.calls_to(&endpoints().download_url("r-a")), 3);

    let records = h.dataset.records().await;
    assert_eq!(records[0].attachment_list()[0].download.downloaded_size(), Some(7));
}

#[tokio::test(start_paused = true)]
async fn fatal_detail_failure_skips_only_that_opportunity() {
    let h = Harness::new();
    h.search_pages(&[&["a", "gone", "c"], &["d"], &[]]);
    for id in ["a", "c", "d"] {
        h.detail(id);
        h.listing(id, &[]);
    }

    let summary = h.pipeline(config(100)).run_to_completion().await.unwrap();

    assert_eq!(summary.state, RunState::Done);
    assert_eq!(summary.exported(), 3);
    assert_eq!(summary.tally.opportunities_failed, 1);
    assert_eq!(summary.tally.failures_by_stage.get("detail"), Some(&1));
    assert_eq!(summary.pages_fetched, 3);

    let ids = h
        .dataset
        .records()
        .await
        .into_iter()
        .map(|r| r.opportunity_id)
        .collect::<Vec<_>>();
    assert!(!ids.contains(&"gone".to_string()));
}

#[tokio::test(start_paused = true)]
async fn one_failed_attachment_leaves_siblings_intact() {
    let h = Harness::new();
    h.search_pages(&[&["a"], &[]]);
    h.detail("a");
    h.listing(
        "a",
        &[
            ("r1", "one.pdf", 3),
            ("r2", "two.pdf", 3),
            ("r3", "three.pdf", 3),
        ],
    );
    h.file("r1", 200, b"one");
    h.file("r3", 200, b"333");

    let summary = h.pipeline(config(10)).run_to_completion().await.unwrap();
    assert_eq!(summary.tally.attachments_downloaded, 2);
    assert_eq!(summary.tally.attachments_failed, 1);

    let records = h.dataset.records().await;
    let attachments = records[0].attachment_list();
    assert_eq!(attachments.len(), 3);
    let names = attachments.iter().map(|a| a.filename.as_str()).collect::<Vec<_>>();
    assert_eq!(names, vec!["one.pdf", "two.pdf", "three.pdf"]);
    assert!(attachments[0].download.downloaded_size().is_some_and(|s| s > 0));
    assert!(matches!(
        attachments[1].download,
        DownloadStatus::Failed { stage: FailureStage::Download, .. }
    ));
    assert!(attachments[2].download.downloaded_size().is_some_and(|s| s > 0));
}

#[tokio::test(start_paused = true)]
async fn cap_yields_exactly_k_records_without_extra_pages() {
    let h = Harness::new();
    h.search_pages(&[&["a", "b", "c", "d", "e"], &["f", "g"], &[]]);
    for id in ["a", "b", "c", "d", "e", "f", "g"] {
        h.detail(id);
        h.listing(id, &[]);
    }

    let summary = h.pipeline(config(3)).run_to_completion().await.unwrap();

    assert_eq!(summary.stop_reason, StopReason::CapReached);
    assert_eq!(summary.exported(), 3);
    assert_eq!(h.dataset.records().await.len(), 3);
    assert_eq!(h.transport.calls_to(&endpoints().search_url), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_items_are_replaced_until_the_cap_is_met() {
    let h = Harness::new();
    h.search_pages(&[&["a", "gone", "c", "d"], &[]]);
    for id in ["a", "c", "d"] {
        h.detail(id);
        h.listing(id, &[]);
    }

    let summary = h.pipeline(config(3)).run_to_completion().await.unwrap();

    assert_eq!(summary.exported(), 3);
    assert_eq!(summary.tally.opportunities_failed, 1);
    assert_eq!(h.dataset.records().await.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn search_failure_aborts_after_in_flight_work() {
    let h = Harness::new();
    h.search_pages(&[&["a"]]);
    h.transport
        .push_json(&endpoints().search_url, 400, &json!({"message": "bad filter"}));
    h.detail("a");
    h.listing("a", &[]);

    let summary = h.pipeline(config(10)).run_to_completion().await.unwrap();

    assert_eq!(summary.state, RunState::Aborted);
    assert_eq!(summary.stop_reason, StopReason::SearchFailed);
    assert!(summary.search_error.is_some());
    assert_eq!(summary.exported(), 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_before_start_admits_nothing() {
    let h = Harness::new();
    h.search_pages(&[&["a"], &[]]);
    let (_tx, rx) = watch::channel(true);

    let summary = h.pipeline(config(10)).run(rx).await.unwrap();

    assert_eq!(summary.stop_reason, StopReason::Shutdown);
    assert_eq!(summary.state, RunState::Done);
    assert_eq!(summary.exported(), 0);
    assert_eq!(h.transport.calls_to(&endpoints().search_url), 0);
}

#[tokio::test(start_paused = true)]
async fn downloads_disabled_skips_listing_calls() {
    let h = Harness::new();
    h.search_pages(&[&["a"], &[]]);
    h.detail("a");

    let summary = h
        .pipeline(HarvestConfig {
            download_attachments: false,
            ..config(10)
        })
        .run_to_completion()
        .await
        .unwrap();

    assert_eq!(summary.exported(), 1);
    let records = h.dataset.records().await;
    assert_eq!(records[0].attachments, FieldOutcome::NotRequested);
    assert_eq!(h.transport.calls_to(&endpoints().resources_url("a")), 0);
}

#[tokio::test(start_paused = true)]
async fn extracted_text_is_kept_and_extraction_failures_are_not_fatal() {
    let h = Harness::new();
    h.search_pages(&[&["a"], &[]]);
    h.detail("a");
    h.transport.push_json(
        &endpoints().resources_url("a"),
        200,
        &json!({"_embedded": {"opportunityAttachmentList": [{"attachments": [
            {"resourceId": "r1", "name": "good.pdf", "mimeType": "application/pdf", "accessLevel": "public"},
            {"resourceId": "r2", "name": "broken.pdf", "accessLevel": "public"},
            {"resourceId": "r3", "name": "drawings.zip", "mimeType": "application/zip", "accessLevel": "public"}
        ]}]}}),
    );
    h.file("r1", 200, b"scope of work text");
    h.file("r2", 200, b"broken stream");
    h.file("r3", 200, b"PK zip bytes");

    let extractor = Arc::new(PlainTextExtractor::default());
    let summary = h
        .pipeline(HarvestConfig {
            extract_text: true,
            ..config(10)
        })
        .with_extractor(extractor.clone())
        .run_to_completion()
        .await
        .unwrap();

    assert_eq!(summary.exported(), 1);
    assert_eq!(summary.tally.opportunities_failed, 0);
    assert_eq!(summary.tally.texts_extracted, 1);

    let records = h.dataset.records().await;
    let record = &records[0];
    let attachments = record.attachment_list();
    assert_eq!(attachments.len(), 3);
    assert!(attachments.iter().all(|a| a.download.downloaded_size().is_some()));
    assert_eq!(record.attachment_texts.len(), 1);
    assert_eq!(record.attachment_texts[0].resource_id, "r1");
    assert_eq!(record.attachment_texts[0].text, "scope of work text");

    let seen = extractor.seen_content_types.lock().unwrap().clone();
    assert_eq!(seen, vec![Some("application/pdf".to_string()), None]);
}

#[tokio::test(start_paused = true)]
async fn repeated_download_keeps_one_stored_copy() {
    let h = Harness::new();
    h.file("r1", 200, b"same bytes");
    let downloader = AttachmentDownloader::new(
        fetcher(h.transport.clone()),
        endpoints(),
        h.store.clone(),
    );
    let descriptor = AttachmentDescriptor {
        resource_id: "r1".into(),
        filename: "Amendment 1.pdf".into(),
        content_type: None,
        size: Some(10),
        access_level: "public".into(),
        posted_date: None,
    };

    let first = downloader.acquire("opp", &descriptor).await.attachment;
    let second = downloader.acquire("opp", &descriptor).await.attachment;

    assert_eq!(first.storage_key, second.storage_key);
    assert_eq!(first.download, second.download);
    assert_eq!(h.store.keys().await, vec!["opp/Amendment 1.pdf"]);
    assert_eq!(h.store.writes(), 1);
}

#[tokio::test]
async fn run_reports_land_under_the_run_id() {
    let h = Harness::new();
    h.search_pages(&[&["a"], &[]]);
    h.detail("a");
    h.listing("a", &[]);
    let reports = tempfile::tempdir().unwrap();

    let summary = h
        .pipeline(HarvestConfig {
            reports_dir: Some(reports.path().to_path_buf()),
            ..config(10)
        })
        .run_to_completion()
        .await
        .unwrap();

    let run_dir = reports.path().join(summary.run_id.to_string());
    assert_eq!(summary.reports_dir, Some(run_dir.display().to_string()));
    let stored: Value =
        serde_json::from_slice(&std::fs::read(run_dir.join("summary.json")).unwrap()).unwrap();
    assert_eq!(stored["tally"]["opportunitiesSucceeded"], 1);
    assert_eq!(stored["state"], "done");
    assert!(run_dir.join("opportunities.parquet").exists());
}
