//! Model acquisition: copy a local file or download a remote one
//!
//! Downloads stream into `<name>.part` beside the destination and are only
//! renamed once the body has been fully received. There is a single attempt
//! and no timeout.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::info;
use url::Url;

use crate::error::{EmbeddingError, Result};

const DEFAULT_MODEL_FILE: &str = "model.pth";

/// Where a model file comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelLocator {
    Local(PathBuf),
    Remote(Url),
}

impl ModelLocator {
    pub fn parse(raw: &str) -> Self {
        match Url::parse(raw) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => ModelLocator::Remote(url),
            Ok(url) if url.scheme() == "file" => match url.to_file_path() {
                Ok(path) => ModelLocator::Local(path),
                Err(()) => ModelLocator::Local(PathBuf::from(raw)),
            },
            _ => ModelLocator::Local(PathBuf::from(raw)),
        }
    }

    /// File name used for the cached copy
    pub fn file_name(&self) -> String {
        let name = match self {
            ModelLocator::Local(path) => path
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_string),
            ModelLocator::Remote(url) => url
                .path_segments()
                .and_then(|mut segments| segments.next_back())
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        };
        name.unwrap_or_else(|| DEFAULT_MODEL_FILE.to_string())
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, ModelLocator::Remote(_))
    }
}

impl std::fmt::Display for ModelLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelLocator::Local(path) => write!(f, "{}", path.display()),
            ModelLocator::Remote(url) => write!(f, "{}", url),
        }
    }
}

/// Materialize the model into `dest_dir`, returning the cached path
pub fn acquire_model(locator: &ModelLocator, dest_dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(dest_dir).map_err(|e| EmbeddingError::file_access(dest_dir, e))?;
    let destination = dest_dir.join(locator.file_name());

    match locator {
        ModelLocator::Local(source) => {
            info!(
                "Copying model {} to {}",
                source.display(),
                destination.display()
            );
            let already_cached = destination.exists()
                && source.canonicalize().ok() == destination.canonicalize().ok();
            if !already_cached {
                fs::copy(source, &destination)
                    .map_err(|e| EmbeddingError::file_access(source, e))?;
            }
        }
        ModelLocator::Remote(url) => download(url, &destination)?,
    }
    Ok(destination)
}

struct ProgressReader<R, F> {
    inner: R,
    callback: F,
    bytes_done: u64,
}

impl<R, F> ProgressReader<R, F> {
    fn new(inner: R, callback: F) -> Self {
        Self {
            inner,
            callback,
            bytes_done: 0,
        }
    }
}

impl<R: Read, F: FnMut(u64)> Read for ProgressReader<R, F> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.bytes_done += n as u64;
        (self.callback)(self.bytes_done);
        Ok(n)
    }
}

fn download(url: &Url, destination: &Path) -> Result<()> {
    let locator = url.as_str();
    info!("Downloading model from {}", locator);

    let client = reqwest::blocking::Client::builder()
        .timeout(None::<std::time::Duration>)
        .build()
        .map_err(|e| EmbeddingError::transfer(locator, e))?;
    let response = client
        .get(url.clone())
        .send()
        .map_err(|e| EmbeddingError::transfer(locator, e))?;
    let status = response.status();
    if !status.is_success() {
        return Err(EmbeddingError::transfer(
            locator,
            format!("server returned {}", status),
        ));
    }
    let total_bytes = response.content_length();

    let mut tmp_os: OsString = destination.as_os_str().to_os_string();
    tmp_os.push(".part");
    let tmp_path = PathBuf::from(tmp_os);
    let file = File::create(&tmp_path).map_err(|e| EmbeddingError::file_access(&tmp_path, e))?;
    let mut writer = BufWriter::new(file);

    let mut last_reported = 0u64;
    let mut progress = ProgressReader::new(response, |done| {
        if let Some(total) = total_bytes.filter(|t| *t > 0) {
            let pct = done * 100 / total;
            if pct >= last_reported + 10 {
                last_reported = pct - pct % 10;
                info!("Downloaded {}% ({} of {} bytes)", last_reported, done, total);
            }
        }
    });

    let copied = std::io::copy(&mut progress, &mut writer)
        .and_then(|n| writer.flush().map(|_| n));
    let copied = match copied {
        Ok(n) => n,
        Err(e) => {
            let _ = fs::remove_file(&tmp_path);
            return Err(EmbeddingError::transfer(locator, e));
        }
    };

    if let Some(total) = total_bytes {
        if copied != total {
            let _ = fs::remove_file(&tmp_path);
            return Err(EmbeddingError::transfer(
                locator,
                format!("incomplete transfer: {} of {} bytes", copied, total),
            ));
        }
    }

    fs::rename(&tmp_path, destination).map_err(|e| EmbeddingError::file_access(destination, e))?;
    info!("Model saved to {} ({} bytes)", destination.display(), copied);
    Ok(())
}
