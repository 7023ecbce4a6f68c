use std::io::{Cursor, Read};
use std::path::PathBuf;
use std::time::Duration;

use downloader_core::basename;
use engine_logging::{engine_info, engine_warn};
use futures_util::StreamExt;
use thiserror::Error;
use zip::ZipArchive;

use crate::config::DaemonConfig;
use crate::persist::{AtomicFileWriter, PersistError};

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("no download location configured for {0}")]
    NoArchiveUrl(String),
    #[error("download failed: {0}")]
    Download(String),
    #[error("http status {0}")]
    HttpStatus(u16),
    #[error("archive larger than {max_bytes} bytes")]
    TooLarge { max_bytes: u64 },
    #[error("unreadable archive: {0}")]
    Archive(String),
    #[error("{0} not found in archive")]
    EntryNotFound(String),
    #[error(transparent)]
    Persist(#[from] PersistError),
    #[error("download timed out after {0:?}")]
    Timeout(Duration),
}

/// Downloads the daemon archive and installs its executable at the configured path.
///
/// The whole fetch is bounded by the configured timeout.
pub async fn install_daemon(config: &DaemonConfig) -> Result<PathBuf, InstallError> {
    let binary = config.binary_name();
    let url = config
        .archive_url
        .as_deref()
        .filter(|url| !url.trim().is_empty())
        .ok_or_else(|| InstallError::NoArchiveUrl(binary.clone()))?;

    engine_info!("{binary} missing, fetching {url}");
    let timeout = config.fetch_timeout();
    let archive = tokio::time::timeout(timeout, download_archive(url, config.max_archive_bytes))
        .await
        .map_err(|_| InstallError::Timeout(timeout))??;

    let content = extract_entry(&archive, &binary)?;
    let (writer, filename) = AtomicFileWriter::for_target(&config.executable)?;
    let installed = writer.executable().write(&filename, content)?;
    engine_info!("installed {}", installed.display());
    Ok(installed)
}

async fn download_archive(url: &str, max_bytes: u64) -> Result<Vec<u8>, InstallError> {
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(|err| InstallError::Download(err.to_string()))?;

    let response = client
        .get(url)
        .send()
        .await
        .map_err(|err| InstallError::Download(err.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(InstallError::HttpStatus(status.as_u16()));
    }
    if response.content_length().is_some_and(|len| len > max_bytes) {
        return Err(InstallError::TooLarge { max_bytes });
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|err| InstallError::Download(err.to_string()))?;
        if bytes.len() as u64 + chunk.len() as u64 > max_bytes {
            return Err(InstallError::TooLarge { max_bytes });
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(bytes)
}

/// Returns the content of the first file in the zip `archive` named `name`,
/// at any depth. Names compare case-insensitively.
pub fn extract_entry(archive: &[u8], name: &str) -> Result<Vec<u8>, InstallError> {
    let mut zip =
        ZipArchive::new(Cursor::new(archive)).map_err(|err| InstallError::Archive(err.to_string()))?;

    for index in 0..zip.len() {
        let mut file = zip
            .by_index(index)
            .map_err(|err| InstallError::Archive(err.to_string()))?;
        if file.is_dir() {
            continue;
        }
        let matches = basename(file.name()).is_some_and(|entry| entry.eq_ignore_ascii_case(name));
        if !matches {
            continue;
        }
        let mut content = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut content)
            .map_err(|err| InstallError::Archive(err.to_string()))?;
        return Ok(content);
    }

    engine_warn!("archive holds no {name}");
    Err(InstallError::EntryNotFound(name.to_string()))
}
