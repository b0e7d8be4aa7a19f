//! Makes sure the model checkpoint is on disk before the server starts.

use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};

const CHUNK_SIZE: usize = 1024 * 1024;
const MIB: f64 = 1_048_576.0;

/// Returns `path` if it exists, otherwise downloads it from `url`.
///
/// Without a URL a missing checkpoint is [`Error::CheckpointNotFound`].
pub fn ensure_checkpoint_available(path: &Path, url: Option<&str>) -> Result<PathBuf> {
    if path.exists() {
        return Ok(path.to_path_buf());
    }
    let Some(url) = url else {
        return Err(Error::CheckpointNotFound(path.to_path_buf()));
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    info!(path = %path.display(), %url, "Checkpoint not found, downloading");
    download(url, path)?;
    info!(path = %path.display(), "Download complete");
    Ok(path.to_path_buf())
}

fn download(url: &str, path: &Path) -> Result<()> {
    let response = ureq::get(url).call().map_err(|e| Error::Download {
        url: url.to_string(),
        source: Box::new(e),
    })?;
    let total = response
        .header("Content-Length")
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|&n| n > 0);

    save_stream(response.into_reader(), total, path)
}

/// Streams `reader` into `<path>.part` and renames it on success; the partial
/// file is removed on any failure.
fn save_stream(reader: impl Read, total: Option<u64>, path: &Path) -> Result<()> {
    let partial = partial_path(path);
    let result = write_chunks(reader, total, &partial).and_then(|()| Ok(fs::rename(&partial, path)?));
    if result.is_err() && partial.exists() {
        if let Err(e) = fs::remove_file(&partial) {
            warn!(path = %partial.display(), error = %e, "Failed to remove partial download");
        }
    }
    result
}

fn write_chunks(mut reader: impl Read, total: Option<u64>, partial: &Path) -> Result<()> {
    let mut out = BufWriter::new(File::create(partial)?);
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut downloaded: u64 = 0;
    let mut last_decile = 0;

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n])?;
        downloaded += n as u64;

        match total {
            Some(total) => {
                let pct = downloaded as f64 * 100.0 / total as f64;
                let decile = (pct / 10.0) as u32;
                if decile > last_decile {
                    last_decile = decile;
                    info!(
                        "Downloaded {:.1} MB / {:.1} MB ({:.1}%)",
                        downloaded as f64 / MIB,
                        total as f64 / MIB,
                        pct
                    );
                }
            }
            None => debug!("Downloaded {:.1} MB", downloaded as f64 / MIB),
        }
    }
    out.flush()?;
    Ok(())
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    path.with_file_name(name)
}
