//! Dump manifest and file fetching
//!
//! Dumps are published per month under
//! `{base}/data/{YYYY}/discogs_{YYYYMM01}_{kind}`, where `kind` is
//! `CHECKSUM.txt` or `{entity}.xml.gz`. Files stream straight to disk under
//! `{data_dir}/{YYYY-MM}/` and are verified against the manifest.

use futures::StreamExt;
use reqwest::{Client, StatusCode};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use waxlog_common::{
    checksum,
    types::{EntityType, MonthKey},
    CommonError,
};

use super::config::IngestConfig;
use super::error::FetchError;

const USER_AGENT: &str = concat!("waxlog/", env!("CARGO_PKG_VERSION"));

/// On-disk and remote naming of a month's dump files
#[derive(Debug, Clone)]
pub struct DumpLayout {
    base_url: String,
    data_dir: PathBuf,
}

impl DumpLayout {
    pub fn new(base_url: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            data_dir: data_dir.into(),
        }
    }

    pub fn file_prefix(month: MonthKey) -> String {
        format!("discogs_{}_", month.dump_stamp())
    }

    pub fn file_name(month: MonthKey, entity: EntityType) -> String {
        format!("{}{}.xml.gz", Self::file_prefix(month), entity)
    }

    pub fn manifest_name(month: MonthKey) -> String {
        format!("{}CHECKSUM.txt", Self::file_prefix(month))
    }

    pub fn manifest_url(&self, month: MonthKey) -> String {
        format!("{}/data/{}/{}", self.base_url, month.year(), Self::manifest_name(month))
    }

    pub fn file_url(&self, month: MonthKey, entity: EntityType) -> String {
        format!(
            "{}/data/{}/{}",
            self.base_url,
            month.year(),
            Self::file_name(month, entity)
        )
    }

    pub fn month_dir(&self, month: MonthKey) -> PathBuf {
        self.data_dir.join(month.to_string())
    }

    pub fn local_path(&self, month: MonthKey, entity: EntityType) -> PathBuf {
        self.month_dir(month).join(Self::file_name(month, entity))
    }
}

/// Published checksums of one month, keyed by entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub checksums: BTreeMap<EntityType, String>,
}

impl Manifest {
    /// Parse `CHECKSUM.txt`: one `<sha256> <file name>` pair per line.
    /// Lines for other files (or other months) are ignored.
    pub fn parse(text: &str, month: MonthKey) -> Result<Self, FetchError> {
        let prefix = DumpLayout::file_prefix(month);
        let mut checksums = BTreeMap::new();

        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let mut parts = line.split_whitespace();
            let (Some(digest), Some(name)) = (parts.next(), parts.next()) else {
                return Err(FetchError::Manifest(format!("malformed line '{}'", line)));
            };
            // sha256sum marks binary mode with a leading '*'
            let name = name.trim_start_matches('*');

            let Some(entity) = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(".xml.gz"))
                .and_then(|kind| kind.parse::<EntityType>().ok())
            else {
                debug!(file = name, "Ignoring manifest entry");
                continue;
            };

            if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(FetchError::Manifest(format!(
                    "invalid sha256 '{}' for {}",
                    digest, name
                )));
            }

            checksums.insert(entity, digest.to_lowercase());
        }

        if checksums.is_empty() {
            return Err(FetchError::Manifest(format!(
                "no entity files listed for {}",
                month
            )));
        }

        Ok(Self { checksums })
    }
}

pub struct DumpFetcher {
    client: Client,
    layout: DumpLayout,
    attempts: u32,
    backoff: Duration,
}

impl DumpFetcher {
    pub fn new(config: &IngestConfig) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(config.http_timeout())
            .connect_timeout(Duration::from_secs(30))
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self {
            client,
            layout: DumpLayout::new(&config.dump_base_url, &config.data_dir),
            attempts: config.download_attempts.max(1),
            backoff: Duration::from_millis(config.retry_backoff_ms),
        })
    }

    pub fn layout(&self) -> &DumpLayout {
        &self.layout
    }

    /// Download, parse and delete the month's manifest.
    /// A 404 means the month is not out yet and maps to [`FetchError::NotPublished`].
    pub async fn fetch_manifest(&self, month: MonthKey) -> Result<Manifest, FetchError> {
        let url = self.layout.manifest_url(month);
        let dir = self.layout.month_dir(month);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(DumpLayout::manifest_name(month));

        match self.download_with_retry(&url, &path).await {
            Err(FetchError::Http { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {
                return Err(FetchError::NotPublished(month));
            },
            other => other?,
        }

        let text = tokio::fs::read_to_string(&path).await?;
        let manifest = Manifest::parse(&text, month);
        if let Err(e) = tokio::fs::remove_file(&path).await {
            warn!(path = %path.display(), error = %e, "Failed to delete manifest");
        }

        let manifest = manifest?;
        info!(
            month_key = %month,
            files = manifest.checksums.len(),
            "Fetched dump manifest"
        );
        Ok(manifest)
    }

    /// Make sure the entity file is on disk and matches `expected`.
    /// A previously downloaded file that still verifies is reused.
    pub async fn fetch_file(
        &self,
        month: MonthKey,
        entity: EntityType,
        expected: &str,
    ) -> Result<PathBuf, FetchError> {
        let path = self.layout.local_path(month, entity);

        if tokio::fs::try_exists(&path).await? {
            if verify(&path, expected, entity).await.is_ok() {
                info!(month_key = %month, entity = %entity, "Reusing verified dump file");
                return Ok(path);
            }
            debug!(month_key = %month, entity = %entity, "Stale local file, downloading again");
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let url = self.layout.file_url(month, entity);
        info!(month_key = %month, entity = %entity, url = %url, "Downloading dump file");
        self.download_with_retry(&url, &path).await?;

        if let Err(e) = verify(&path, expected, entity).await {
            if let Err(remove_err) = tokio::fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %remove_err, "Failed to delete corrupt file");
            }
            return Err(e);
        }

        Ok(path)
    }

    /// Retry transient failures with exponential backoff
    async fn download_with_retry(&self, url: &str, dest: &Path) -> Result<(), FetchError> {
        let mut attempt = 1;
        loop {
            match self.download_to(url, dest).await {
                Ok(bytes) => {
                    debug!(url, bytes, attempt, "Download complete");
                    return Ok(());
                },
                Err(e) if e.is_transient() && attempt < self.attempts => {
                    let delay = self.backoff * 2u32.saturating_pow(attempt - 1);
                    warn!(url, attempt, error = %e, delay_ms = delay.as_millis() as u64, "Download failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                },
                Err(e) => return Err(e),
            }
        }
    }

    /// Stream the body to `{dest}.part`, renaming into place once complete
    async fn download_to(&self, url: &str, dest: &Path) -> Result<u64, FetchError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Http {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let partial = partial_path(dest);
        let result = stream_to_disk(response, &partial, dest).await;
        if result.is_err() {
            if let Err(e) = tokio::fs::remove_file(&partial).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %partial.display(), error = %e, "Failed to delete partial download");
                }
            }
        }
        result
    }
}

async fn stream_to_disk(
    response: reqwest::Response,
    partial: &Path,
    dest: &Path,
) -> Result<u64, FetchError> {
    let mut file = tokio::fs::File::create(partial).await?;
    let mut stream = response.bytes_stream();
    let mut written = 0u64;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    drop(file);

    tokio::fs::rename(partial, dest).await?;
    Ok(written)
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

async fn verify(path: &Path, expected: &str, entity: EntityType) -> Result<(), FetchError> {
    let path = path.to_path_buf();
    let expected = expected.to_string();
    let result =
        tokio::task::spawn_blocking(move || checksum::verify_file_checksum(&path, &expected))
            .await?;

    match result {
        Ok(()) => Ok(()),
        Err(CommonError::ChecksumMismatch { expected, actual }) => Err(FetchError::ChecksumMismatch {
            entity,
            expected,
            actual,
        }),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn month() -> MonthKey {
        "2025-02".parse().unwrap()
    }

    fn sha(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    fn fetcher(base_url: &str, data_dir: &Path) -> DumpFetcher {
        let config = IngestConfig {
            dump_base_url: base_url.to_string(),
            data_dir: data_dir.to_path_buf(),
            retry_backoff_ms: 1,
            ..IngestConfig::default()
        };
        DumpFetcher::new(&config).unwrap()
    }

    #[test]
    fn test_layout_urls() {
        let layout = DumpLayout::new("https://dumps.example/", "/srv/dumps");
        assert_eq!(
            layout.manifest_url(month()),
            "https://dumps.example/data/2025/discogs_20250201_CHECKSUM.txt"
        );
        assert_eq!(
            layout.file_url(month(), EntityType::Releases),
            "https://dumps.example/data/2025/discogs_20250201_releases.xml.gz"
        );
        assert_eq!(
            layout.local_path(month(), EntityType::Artists),
            PathBuf::from("/srv/dumps/2025-02/discogs_20250201_artists.xml.gz")
        );
    }

    #[test]
    fn test_manifest_parse() {
        let a = "a".repeat(64);
        let b = "B".repeat(64);
        let text = format!(
            "{a} discogs_20250201_artists.xml.gz\n\
             {b} *discogs_20250201_labels.xml.gz\n\
             {a} discogs_20250201_CHECKSUM.txt\n\
             {a} discogs_20250101_masters.xml.gz\n"
        );

        let manifest = Manifest::parse(&text, month()).unwrap();
        assert_eq!(manifest.checksums.len(), 2);
        assert_eq!(manifest.checksums[&EntityType::Artists], a);
        assert_eq!(manifest.checksums[&EntityType::Labels], "b".repeat(64));
    }

    #[test]
    fn test_manifest_rejects_bad_digest_and_empty() {
        assert!(Manifest::parse("xyz discogs_20250201_artists.xml.gz", month()).is_err());
        assert!(Manifest::parse("", month()).is_err());
    }

    #[tokio::test]
    async fn test_fetch_manifest_not_published() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();

        let err = fetcher(&server.uri(), dir.path())
            .fetch_manifest(month())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::NotPublished(_)));
    }

    #[tokio::test]
    async fn test_fetch_manifest_deletes_file_after_parse() {
        let server = MockServer::start().await;
        let body = format!("{} discogs_20250201_artists.xml.gz\n", "c".repeat(64));
        Mock::given(method("GET"))
            .and(path("/data/2025/discogs_20250201_CHECKSUM.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();
        let fetcher = fetcher(&server.uri(), dir.path());

        let manifest = fetcher.fetch_manifest(month()).await.unwrap();
        assert_eq!(manifest.checksums.len(), 1);
        assert!(!dir
            .path()
            .join("2025-02")
            .join("discogs_20250201_CHECKSUM.txt")
            .exists());
    }

    #[tokio::test]
    async fn test_fetch_file_verifies_and_retries_server_errors() {
        let server = MockServer::start().await;
        let payload = b"not really gzip".to_vec();
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/data/2025/discogs_20250201_labels.xml.gz"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(payload.clone()))
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();

        let local = fetcher(&server.uri(), dir.path())
            .fetch_file(month(), EntityType::Labels, &sha(&payload))
            .await
            .unwrap();

        assert_eq!(std::fs::read(local).unwrap(), payload);
    }

    #[tokio::test]
    async fn test_fetch_file_checksum_mismatch_removes_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"tampered".to_vec()))
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();
        let fetcher = fetcher(&server.uri(), dir.path());

        let err = fetcher
            .fetch_file(month(), EntityType::Masters, &sha(b"original"))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            FetchError::ChecksumMismatch {
                entity: EntityType::Masters,
                ..
            }
        ));
        assert!(!fetcher.layout().local_path(month(), EntityType::Masters).exists());
    }

    #[tokio::test]
    async fn test_fetch_file_reuses_verified_local_copy() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let fetcher = fetcher(&server.uri(), dir.path());
        let local = fetcher.layout().local_path(month(), EntityType::Artists);
        std::fs::create_dir_all(local.parent().unwrap()).unwrap();
        std::fs::write(&local, b"cached").unwrap();

        // No mocks mounted: any request would 404
        let path = fetcher
            .fetch_file(month(), EntityType::Artists, &sha(b"cached"))
            .await
            .unwrap();
        assert_eq!(path, local);
    }

    #[tokio::test]
    async fn test_failed_download_leaves_no_partial_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"payload".to_vec()))
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();
        let fetcher = fetcher(&server.uri(), dir.path());

        // A directory squatting on the destination makes the final rename fail
        let local = fetcher.layout().local_path(month(), EntityType::Releases);
        std::fs::create_dir_all(&local).unwrap();

        let err = fetcher
            .fetch_file(month(), EntityType::Releases, &sha(b"payload"))
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Io(_)), "{err:?}");
        assert!(!partial_path(&local).exists());
    }
}
