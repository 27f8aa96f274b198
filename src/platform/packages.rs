//! Package download, cache and extraction
//!
//! Packages come from a base URL or a local/UNC directory. A package already
//! present in the destination (with a matching digest, when one is
//! configured) is reused without touching the source.

use super::PackageFetcher;
use anyhow::{Context, Result, bail};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Installers can be a few GB
const MAX_DOWNLOAD_SIZE: u64 = 8 * 1024 * 1024 * 1024;

pub struct PackageCache {
    source: String,
    checksums: BTreeMap<String, String>,
    agent: ureq::Agent,
}

impl PackageCache {
    pub fn new(source: &str, checksums: BTreeMap<String, String>) -> Self {
        Self {
            source: source.trim_end_matches(['/', '\\']).to_string(),
            checksums,
            agent: ureq::Agent::new_with_defaults(),
        }
    }

    fn is_remote(&self) -> bool {
        self.source.starts_with("http://") || self.source.starts_with("https://")
    }

    /// Whether `path` holds the expected content for `name`
    fn verify(&self, name: &str, path: &Path) -> Result<bool> {
        let Some(expected) = self.checksums.get(name) else {
            return Ok(true);
        };
        let bytes = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let actual = blake3::hash(&bytes).to_hex();
        Ok(actual.as_str().eq_ignore_ascii_case(expected.trim()))
    }

    fn fetch_bytes(&self, name: &str) -> Result<Vec<u8>> {
        if self.source.is_empty() {
            bail!("No package source configured (packages.source) for {name}");
        }

        if self.is_remote() {
            let url = format!("{}/{}", self.source, name);
            log::info!("Downloading {url}");
            let mut response = self
                .agent
                .get(&url)
                .header("User-Agent", "hpcnode")
                .call()
                .with_context(|| format!("Failed to download {url}"))?;
            return response
                .body_mut()
                .with_config()
                .limit(MAX_DOWNLOAD_SIZE)
                .read_to_vec()
                .context("Failed to read response body");
        }

        let path = Path::new(&self.source).join(name);
        log::info!("Copying {}", path.display());
        fs::read(&path).with_context(|| format!("Failed to read package {}", path.display()))
    }
}

impl PackageFetcher for PackageCache {
    fn download(&self, name: &str, dest_dir: &Path) -> Result<PathBuf> {
        let dest = dest_dir.join(name);

        if dest.is_file() {
            if self.verify(name, &dest)? {
                log::debug!("Using cached {}", dest.display());
                return Ok(dest);
            }
            log::warn!("Cached {} has the wrong digest, fetching again", dest.display());
        }

        let bytes = self.fetch_bytes(name)?;
        if let Some(expected) = self.checksums.get(name) {
            let actual = blake3::hash(&bytes).to_hex();
            if !actual.as_str().eq_ignore_ascii_case(expected.trim()) {
                bail!("Digest mismatch for {name}: expected {expected}, got {actual}");
            }
        }

        fs::create_dir_all(dest_dir)
            .with_context(|| format!("Failed to create {}", dest_dir.display()))?;
        let tmp = dest_dir.join(format!("{name}.partial"));
        fs::write(&tmp, &bytes).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &dest).with_context(|| format!("Failed to move {}", dest.display()))?;

        log::debug!("Stored {} ({} bytes)", dest.display(), bytes.len());
        Ok(dest)
    }

    fn unpack(&self, archive: &Path, dest_dir: &Path) -> Result<()> {
        let name = archive.to_string_lossy().to_ascii_lowercase();
        fs::create_dir_all(dest_dir)
            .with_context(|| format!("Failed to create {}", dest_dir.display()))?;

        if name.ends_with(".zip") {
            extract_zip(archive, dest_dir)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            extract_targz(archive, dest_dir)
        } else {
            bail!("Unsupported archive format: {}", archive.display())
        }
    }

    fn copy_tree(&self, source: &Path, dest: &Path, entries: &[&str]) -> Result<usize> {
        fs::create_dir_all(dest).with_context(|| format!("Failed to create {}", dest.display()))?;

        let mut copied = 0;
        for entry in entries {
            let from = source.join(entry);
            if from.is_file() {
                fs::copy(&from, dest.join(entry))
                    .with_context(|| format!("Failed to copy {}", from.display()))?;
                copied += 1;
                continue;
            }
            if !from.is_dir() {
                bail!("{} not found", from.display());
            }

            for item in WalkDir::new(&from) {
                let item = item?;
                let relative = item.path().strip_prefix(source)?;
                let target = dest.join(relative);
                if item.file_type().is_dir() {
                    fs::create_dir_all(&target)?;
                } else {
                    fs::copy(item.path(), &target)
                        .with_context(|| format!("Failed to copy {}", item.path().display()))?;
                    copied += 1;
                }
            }
        }

        log::debug!("Copied {copied} files from {}", source.display());
        Ok(copied)
    }
}

fn extract_zip(archive: &Path, dest_dir: &Path) -> Result<()> {
    let data = fs::read(archive).with_context(|| format!("Failed to read {}", archive.display()))?;
    let mut zip = zip::ZipArchive::new(Cursor::new(data))
        .with_context(|| format!("Invalid zip archive {}", archive.display()))?;

    for i in 0..zip.len() {
        let mut file = zip.by_index(i)?;
        // Entries escaping the destination are skipped
        let Some(relative) = file.enclosed_name() else {
            log::warn!("Skipping unsafe entry {} in {}", file.name(), archive.display());
            continue;
        };
        let target = dest_dir.join(relative);

        if file.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)
            .with_context(|| format!("Failed to create {}", target.display()))?;
        std::io::copy(&mut file, &mut out)?;
    }

    log::debug!("Extracted {} entries from {}", zip.len(), archive.display());
    Ok(())
}

fn extract_targz(archive: &Path, dest_dir: &Path) -> Result<()> {
    use flate2::read::GzDecoder;
    use tar::Archive;

    let file = File::open(archive).with_context(|| format!("Failed to open {}", archive.display()))?;
    let mut tar = Archive::new(GzDecoder::new(file));
    tar.unpack(dest_dir)
        .with_context(|| format!("Failed to extract {}", archive.display()))?;
    Ok(())
}
