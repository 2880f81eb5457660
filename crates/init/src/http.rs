//! Cached downloads and SHA-256 verification for OTA artifacts.

use std::fs::{self, File};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use sha2::{Digest, Sha256};

use crate::CancelToken;

/// Hex SHA-256 of a file, streamed in 128 KiB chunks.
pub fn sha256_file(path: &Path) -> Result<String> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 128 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn cache_path(cache_dir: &Path, url: &str, prefix: &str) -> PathBuf {
    let prefix = prefix.replace('/', "_");
    let url_hash = hex::encode(Sha256::digest(url.as_bytes()));
    cache_dir.join(format!("{prefix}_{url_hash}"))
}

/// Download `url` into the cache directory, keyed by a readable prefix
/// plus the URL hash. With `cache` set an existing file is reused.
pub fn download(
    client: &reqwest::blocking::Client,
    cache_dir: &Path,
    url: &str,
    prefix: &str,
    cache: bool,
    cancel: &CancelToken,
) -> Result<PathBuf> {
    fs::create_dir_all(cache_dir)
        .with_context(|| format!("failed to create {}", cache_dir.display()))?;

    let path = cache_path(cache_dir, url, prefix);
    if path.exists() {
        if cache {
            return Ok(path);
        }
        fs::remove_file(&path)?;
    }

    cancel.check()?;
    tracing::info!("download {url}");
    let mut response = client
        .get(url)
        .send()
        .with_context(|| format!("failed to fetch {url}"))?;
    if !response.status().is_success() {
        bail!("failed to fetch {url}: HTTP {}", response.status());
    }

    let mut file = File::create(&path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    let mut buf = vec![0u8; 128 * 1024];
    loop {
        // Cancellation lands between chunks; the partial file is removed.
        if cancel.is_cancelled() {
            drop(file);
            let _ = fs::remove_file(&path);
            bail!("interrupted");
        }
        let n = response.read(&mut buf)?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n])?;
    }
    Ok(path)
}

/// Fetch and deserialize a JSON document.
pub fn get_json<T: serde::de::DeserializeOwned>(
    client: &reqwest::blocking::Client,
    url: &str,
) -> Result<T> {
    let response = client
        .get(url)
        .send()
        .with_context(|| format!("failed to fetch {url}"))?;
    if !response.status().is_success() {
        bail!("failed to fetch {url}: HTTP {}", response.status());
    }
    response.json().with_context(|| format!("malformed JSON from {url}"))
}

/// Does the URL answer with success? Used for channel probing.
pub fn probe(client: &reqwest::blocking::Client, url: &str) -> bool {
    client
        .get(url)
        .send()
        .map(|r| r.status().is_success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_matches_known_vector() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"abc").unwrap();
        assert_eq!(
            sha256_file(file.path()).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn cache_path_is_stable_and_prefix_safe() {
        let dir = Path::new("/tmp/cache");
        let a = cache_path(dir, "https://ota/x.zip", "system/VANILLA");
        let b = cache_path(dir, "https://ota/x.zip", "system/VANILLA");
        let c = cache_path(dir, "https://ota/y.zip", "system/VANILLA");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(!a.file_name().unwrap().to_string_lossy().contains('/'));
        assert!(a.starts_with(dir));
    }
}
