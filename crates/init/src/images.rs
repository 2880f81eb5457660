//! OTA channel walking and image replacement. A downloaded archive is only
//! ever accepted when its SHA-256 matches the manifest entry; a mismatch
//! deletes the file and aborts the whole operation.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use waydroid_core::{Config, Error, Paths};

use crate::{CancelToken, http};

#[derive(Debug, Deserialize)]
pub struct OtaIndex {
    pub response: Vec<OtaImage>,
}

#[derive(Debug, Deserialize)]
pub struct OtaImage {
    pub datetime: i64,
    pub url: String,
    pub filename: String,
    /// Hex SHA-256 of the archive.
    pub id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    System,
    Vendor,
}

impl Channel {
    fn name(self) -> &'static str {
        match self {
            Channel::System => "system",
            Channel::Vendor => "vendor",
        }
    }
}

fn extract_zip(archive: &Path, dest: &Path) -> Result<()> {
    let file = fs::File::open(archive)
        .with_context(|| format!("failed to open {}", archive.display()))?;
    let mut zip = zip::ZipArchive::new(file).context("not a zip archive")?;
    fs::create_dir_all(dest)?;
    zip.extract(dest)
        .with_context(|| format!("failed to extract into {}", dest.display()))?;
    Ok(())
}

/// Walk one OTA channel and install every build newer than the recorded
/// datetime. Returns true when an image was replaced.
pub fn update_channel(
    paths: &Paths,
    cfg: &mut Config,
    channel: Channel,
    cancel: &CancelToken,
) -> Result<bool> {
    let (ota_url, recorded) = match channel {
        Channel::System => (cfg.waydroid.system_ota.clone(), cfg.waydroid.system_datetime),
        Channel::Vendor => (cfg.waydroid.vendor_ota.clone(), cfg.waydroid.vendor_datetime),
    };
    if ota_url.is_empty() {
        tracing::debug!("no {} OTA channel configured", channel.name());
        return Ok(false);
    }

    let client = reqwest::blocking::Client::new();
    let index: OtaIndex = http::get_json(&client, &ota_url)
        .with_context(|| format!("failed to get {} OTA channel: {ota_url}", channel.name()))?;
    if index.response.is_empty() {
        bail!("no images found on {} channel", channel.name());
    }

    let mut updated = false;
    for image in &index.response {
        if image.datetime <= recorded {
            continue;
        }
        cancel.check()?;

        let archive = http::download(
            &client,
            &paths.http_cache(),
            &image.url,
            &image.filename,
            false,
            cancel,
        )?;
        tracing::info!("validating {} image", channel.name());
        let digest = http::sha256_file(&archive)?;
        if !digest.eq_ignore_ascii_case(&image.id) {
            fs::remove_file(&archive).ok();
            return Err(Error::ImageIntegrity { expected: image.id.clone() }.into());
        }

        tracing::info!("extracting to {}", cfg.waydroid.images_path.display());
        extract_zip(&archive, &cfg.waydroid.images_path)?;
        match channel {
            Channel::System => cfg.waydroid.system_datetime = image.datetime,
            Channel::Vendor => cfg.waydroid.vendor_datetime = image.datetime,
        }
        cfg.save(paths)?;
        fs::remove_file(&archive).ok();
        updated = true;
        break;
    }
    Ok(updated)
}

/// Update both channels.
pub fn get(paths: &Paths, cfg: &mut Config, cancel: &CancelToken) -> Result<()> {
    update_channel(paths, cfg, Channel::System, cancel)?;
    update_channel(paths, cfg, Channel::Vendor, cancel)?;
    Ok(())
}

/// Does this directory hold a usable image pair (files or block-device
/// symlinks)?
pub fn has_image_pair(dir: &Path) -> bool {
    ["system.img", "vendor.img"].iter().all(|img| {
        let path = dir.join(img);
        path.exists() || path.is_symlink()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn manifest_json_parses() {
        let index: OtaIndex = serde_json::from_str(
            r#"{"response": [{"datetime": 1700000000, "url": "https://ota/x.zip",
                "filename": "x.zip",
                "id": "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"}]}"#,
        )
        .unwrap();
        assert_eq!(index.response.len(), 1);
        assert_eq!(index.response[0].datetime, 1_700_000_000);
        assert_eq!(index.response[0].filename, "x.zip");
    }

    #[test]
    fn image_pair_detection() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(!has_image_pair(tmp.path()));
        fs::File::create(tmp.path().join("system.img")).unwrap();
        assert!(!has_image_pair(tmp.path()));
        fs::File::create(tmp.path().join("vendor.img")).unwrap();
        assert!(has_image_pair(tmp.path()));
    }

    #[test]
    fn image_pair_accepts_dangling_block_device_symlinks() {
        let tmp = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink("/dev/sda3", tmp.path().join("system.img")).unwrap();
        std::os::unix::fs::symlink("/dev/sda4", tmp.path().join("vendor.img")).unwrap();
        assert!(has_image_pair(tmp.path()));
    }

    #[test]
    fn zip_extraction_lands_in_images_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("ota.zip");
        {
            let file = fs::File::create(&archive).unwrap();
            let mut zip = zip::ZipWriter::new(file);
            zip.start_file("system.img", zip::write::FileOptions::default())
                .unwrap();
            zip.write_all(b"not really ext4").unwrap();
            zip.finish().unwrap();
        }
        let dest = tmp.path().join("images");
        extract_zip(&archive, &dest).unwrap();
        assert_eq!(
            fs::read(dest.join("system.img")).unwrap(),
            b"not really ext4"
        );
    }
}
