//! End-to-end dump ingestion against a mocked dump host
//!
//! Runs the download and processing jobs back to back with in-memory stores
//! and checks the month lands in the catalog.

use flate2::{write::GzEncoder, Compression};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::sync::Arc;
use waxlog_common::types::{EntityType, MonthKey};
use waxlog_server::ingest::{
    fetcher::DumpLayout, models::ProcessingStatus, DownloadAdmin, DownloadJob, DownloadOutcome,
    IngestConfig, IngestError, IngestionStateMachine, IngestionStatus, Job,
    MemoryCatalogWriter, MemoryIngestionRepository, ProcessingJob, SchedulerHandle,
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn month() -> MonthKey {
    "2025-02".parse().unwrap()
}

fn dump_xml(entity: EntityType) -> &'static str {
    match entity {
        EntityType::Artists => {
            "<artists><artist><id>1</id><name>Aphex Twin</name></artist>\
             <artist><id>2</id><name>Autechre</name></artist></artists>"
        },
        EntityType::Labels => "<labels><label><id>23</id><name>Warp</name></label></labels>",
        EntityType::Masters => {
            "<masters><master id=\"5\"><title>Selected Ambient Works</title></master></masters>"
        },
        EntityType::Releases => {
            "<releases><release id=\"7\" status=\"Accepted\"><title>Tri Repetae</title></release>\
             <release id=\"8\" status=\"Accepted\"><title>Amber</title></release>\
             <release id=\"9\" status=\"Accepted\"><title>Incunabula</title></release></releases>"
        },
    }
}

fn gzip(xml: &str) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(xml.as_bytes()).unwrap();
    encoder.finish().unwrap()
}

/// Serve the checksum manifest and all four entity files for the month
async fn publish_month(server: &MockServer) {
    let mut manifest = String::new();
    for entity in EntityType::ALL {
        let body = gzip(dump_xml(entity));
        let name = DumpLayout::file_name(month(), entity);
        manifest.push_str(&format!("{} {}\n", hex::encode(Sha256::digest(&body)), name));

        Mock::given(method("GET"))
            .and(path(format!("/data/2025/{name}")))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .mount(server)
            .await;
    }

    Mock::given(method("GET"))
        .and(path("/data/2025/discogs_20250201_CHECKSUM.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_string(manifest))
        .mount(server)
        .await;
}

struct Pipeline {
    machine: IngestionStateMachine,
    download: Arc<DownloadJob>,
    processing: ProcessingJob,
    writer: Arc<MemoryCatalogWriter>,
    layout: DumpLayout,
    _dir: tempfile::TempDir,
}

fn pipeline(server: &MockServer) -> Pipeline {
    let dir = tempfile::tempdir().unwrap();
    let config = IngestConfig {
        dump_base_url: server.uri(),
        data_dir: dir.path().to_path_buf(),
        batch_size: 2,
        retry_backoff_ms: 1,
        download_attempts: 1,
        ..IngestConfig::default()
    };
    let machine = IngestionStateMachine::new(Arc::new(MemoryIngestionRepository::new()));
    let writer = Arc::new(MemoryCatalogWriter::new());
    Pipeline {
        download: Arc::new(DownloadJob::new(machine.clone(), &config).unwrap()),
        processing: ProcessingJob::new(machine.clone(), writer.clone(), &config),
        layout: DumpLayout::new(&config.dump_base_url, &config.data_dir),
        machine,
        writer,
        _dir: dir,
    }
}

#[tokio::test]
async fn test_published_month_reaches_completed() {
    let server = MockServer::start().await;
    publish_month(&server).await;
    let p = pipeline(&server);

    let outcome = p.download.run_for(month()).await.unwrap();
    assert_eq!(outcome, DownloadOutcome::Downloaded);

    let record = p.machine.repository().find_by_month(month()).await.unwrap().unwrap();
    assert_eq!(record.status, IngestionStatus::ReadyForProcessing);
    assert!(record.download_completed_at.is_some());
    assert_eq!(record.files.len(), 4);
    assert!(record.files.values().all(|f| f.downloaded && f.validated));

    p.processing.run().await.unwrap();

    let record = p.machine.repository().find_by_month(month()).await.unwrap().unwrap();
    assert_eq!(record.status, IngestionStatus::Completed);
    assert!(record.processing_completed_at.is_some());
    assert!(record
        .files
        .values()
        .all(|f| f.processing_status == ProcessingStatus::Completed));
    assert_eq!(record.files[&EntityType::Releases].records_processed, 3);

    assert_eq!(p.writer.count(EntityType::Artists).await, 2);
    assert_eq!(p.writer.count(EntityType::Labels).await, 1);
    assert_eq!(p.writer.count(EntityType::Masters).await, 1);
    assert_eq!(p.writer.count(EntityType::Releases).await, 3);

    // Local copies are gone once the month is in the catalog
    assert!(!p.layout.month_dir(month()).exists());
}

#[tokio::test]
async fn test_completed_month_is_not_downloaded_again() {
    let server = MockServer::start().await;
    publish_month(&server).await;
    let p = pipeline(&server);

    p.download.run_for(month()).await.unwrap();
    p.processing.run().await.unwrap();
    let requests_after_first_run = server.received_requests().await.unwrap().len();

    let outcome = p.download.run_for(month()).await.unwrap();
    assert_eq!(outcome, DownloadOutcome::Skipped(IngestionStatus::Completed));
    assert_eq!(
        server.received_requests().await.unwrap().len(),
        requests_after_first_run
    );

    // A second processing pass finds nothing to do
    assert!(p.processing.candidates().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_reprocess_needs_local_files() {
    let server = MockServer::start().await;
    publish_month(&server).await;
    let p = pipeline(&server);

    p.download.run_for(month()).await.unwrap();
    p.processing.run().await.unwrap();

    let admin = DownloadAdmin::new(p.machine.clone(), p.download.clone(), SchedulerHandle::default());
    let err = admin.reprocess(Some(month())).await.unwrap_err();
    assert!(matches!(err, IngestError::LocalFilesMissing(m) if m == month()));

    let err = admin.reprocess(Some("2024-11".parse().unwrap())).await.unwrap_err();
    assert!(matches!(err, IngestError::NotFound(_)));
}

#[tokio::test]
async fn test_reset_completed_month_ingests_it_again() {
    let server = MockServer::start().await;
    publish_month(&server).await;
    let p = pipeline(&server);

    p.download.run_for(month()).await.unwrap();
    p.processing.run().await.unwrap();
    let first_writes = p.writer.writes(EntityType::Releases).await;
    assert_eq!(first_writes, 3);

    let admin = DownloadAdmin::new(p.machine.clone(), p.download.clone(), SchedulerHandle::default());
    let record = admin.reset(Some(month())).await.unwrap();
    assert_eq!(record.status, IngestionStatus::NotStarted);
    assert!(record.files.is_empty());

    let outcome = p.download.run_for(month()).await.unwrap();
    assert_eq!(outcome, DownloadOutcome::Downloaded);
    p.processing.run().await.unwrap();

    let record = p.machine.repository().find_by_month(month()).await.unwrap().unwrap();
    assert_eq!(record.status, IngestionStatus::Completed);
    assert_eq!(record.files.len(), 4);

    let requests = server.received_requests().await.unwrap();
    for entity in EntityType::ALL {
        let file_path = format!("/data/2025/{}", DumpLayout::file_name(month(), entity));
        let fetched = requests.iter().filter(|r| r.url.path() == file_path).count();
        assert_eq!(fetched, 2, "{entity} fetched {fetched} times");
    }

    assert_eq!(p.writer.writes(EntityType::Releases).await, first_writes * 2);
    assert_eq!(p.writer.writes(EntityType::Artists).await, 4);
    // Upserts, so the catalog itself does not grow
    assert_eq!(p.writer.count(EntityType::Releases).await, 3);
}
