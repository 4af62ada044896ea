//! Remote-package staging.
//!
//! A downloaded package archive (sdist tarball or zip/wheel) is unpacked
//! into a staging directory and the normal directory scan takes over.
//! Fetching the archive from a registry is an external collaborator; this
//! side of the boundary only stages what is already on disk, with path
//! traversal and size guards on extraction.

use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use std::fs::File;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};

/// Extraction guards: a package archive that blows past these is hostile
/// or broken either way.
const MAX_ARCHIVE_FILES: usize = 10_000;
const MAX_UNPACKED_SIZE: u64 = 512 * 1024 * 1024;

/// Resolve what to scan from a staged folder: an unpacked tree is used
/// as-is; a lone archive is extracted next to itself.
pub fn stage_folder(folder: &Path) -> Result<PathBuf> {
    if folder.is_dir() {
        let archives: Vec<PathBuf> = std::fs::read_dir(folder)
            .with_context(|| format!("reading {}", folder.display()))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| is_package_archive(path))
            .collect();
        match archives.as_slice() {
            [] => Ok(folder.to_path_buf()),
            [archive] => {
                let dest = folder.join("unpacked");
                stage_archive(archive, &dest)?;
                Ok(dest)
            }
            _ => bail!(
                "{} contains multiple package archives; point at one of them",
                folder.display()
            ),
        }
    } else if is_package_archive(folder) {
        let dest = folder
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("unpacked");
        stage_archive(folder, &dest)?;
        Ok(dest)
    } else {
        bail!("{} is neither a directory nor a package archive", folder.display())
    }
}

pub fn is_package_archive(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("").to_lowercase();
    name.ends_with(".tar.gz")
        || name.ends_with(".tgz")
        || name.ends_with(".zip")
        || name.ends_with(".whl")
}

/// Unpack a package archive into `dest`.
pub fn stage_archive(archive: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)
        .with_context(|| format!("creating staging dir {}", dest.display()))?;

    let name = archive.file_name().and_then(|n| n.to_str()).unwrap_or("").to_lowercase();
    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        unpack_tarball(archive, dest)?;
    } else if name.ends_with(".zip") || name.ends_with(".whl") {
        unpack_zip(archive, dest)?;
    } else {
        bail!("unsupported archive type: {}", archive.display());
    }

    info!(archive = %archive.display(), dest = %dest.display(), "package staged");
    Ok(())
}

fn unpack_tarball(archive: &Path, dest: &Path) -> Result<()> {
    let file =
        File::open(archive).with_context(|| format!("opening {}", archive.display()))?;
    let mut tar = tar::Archive::new(GzDecoder::new(file));

    let mut files = 0usize;
    let mut total = 0u64;
    for entry in tar.entries().context("reading tar entries")? {
        let mut entry = entry.context("reading tar entry")?;
        let path = entry.path().context("entry path")?.into_owned();
        validate_entry_path(&path)?;

        files += 1;
        total += entry.size();
        check_limits(files, total)?;

        let target = dest.join(&path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        entry
            .unpack(&target)
            .with_context(|| format!("unpacking {}", path.display()))?;
        debug!(entry = %path.display(), "extracted");
    }
    Ok(())
}

fn unpack_zip(archive: &Path, dest: &Path) -> Result<()> {
    let file =
        File::open(archive).with_context(|| format!("opening {}", archive.display()))?;
    let mut zip = zip::ZipArchive::new(file).context("reading zip directory")?;

    let mut total = 0u64;
    for index in 0..zip.len() {
        let mut entry = zip.by_index(index).context("reading zip entry")?;
        // enclosed_name rejects traversal and absolute paths outright.
        let Some(path) = entry.enclosed_name() else {
            bail!("archive entry escapes the staging directory: {}", entry.name());
        };

        total += entry.size();
        check_limits(index + 1, total)?;

        let target = dest.join(path);
        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)
            .with_context(|| format!("creating {}", target.display()))?;
        std::io::copy(&mut entry, &mut out).context("writing zip entry")?;
    }
    Ok(())
}

fn validate_entry_path(path: &Path) -> Result<()> {
    for component in path.components() {
        match component {
            Component::ParentDir => {
                bail!("archive entry escapes the staging directory: {}", path.display())
            }
            Component::RootDir | Component::Prefix(_) => {
                bail!("archive entry uses an absolute path: {}", path.display())
            }
            _ => {}
        }
    }
    Ok(())
}

fn check_limits(files: usize, total: u64) -> Result<()> {
    if files > MAX_ARCHIVE_FILES {
        bail!("archive holds more than {MAX_ARCHIVE_FILES} files");
    }
    if total > MAX_UNPACKED_SIZE {
        bail!("archive unpacks past the {MAX_UNPACKED_SIZE} byte limit");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn make_tarball(dir: &Path, entries: &[(&str, &str)]) -> PathBuf {
        let archive = dir.join("pkg-1.0.0.tar.gz");
        let file = File::create(&archive).unwrap();
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, content) in entries {
            let mut header = tar::Header::new_gnu();
            if let Err(_) = header.set_path(name) {
                let gnu = header.as_gnu_mut().unwrap();
                gnu.name.fill(0);
                gnu.name[..name.len()].copy_from_slice(name.as_bytes());
            }
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append(&header, content.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
        archive
    }

    #[test]
    fn tarball_staging_recreates_the_tree() {
        let dir = TempDir::new().unwrap();
        let archive = make_tarball(
            dir.path(),
            &[
                ("pkg/setup.py", "from setuptools import setup\nsetup()\n"),
                ("pkg/src/mod.py", "x = 1\n"),
            ],
        );
        let dest = dir.path().join("out");
        stage_archive(&archive, &dest).unwrap();
        assert!(dest.join("pkg/setup.py").exists());
        assert!(dest.join("pkg/src/mod.py").exists());
    }

    #[test]
    fn zip_staging_recreates_the_tree() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("pkg.zip");
        let file = File::create(&archive).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        writer.start_file("pkg/index.js", options).unwrap();
        writer.write_all(b"const x = 1;\n").unwrap();
        writer.finish().unwrap();

        let dest = dir.path().join("out");
        stage_archive(&archive, &dest).unwrap();
        assert!(dest.join("pkg/index.js").exists());
    }

    #[test]
    fn traversal_entries_are_rejected() {
        let dir = TempDir::new().unwrap();
        let archive = make_tarball(dir.path(), &[("../escape.py", "x = 1\n")]);
        let dest = dir.path().join("out");
        assert!(stage_archive(&archive, &dest).is_err());
        assert!(!dir.path().join("escape.py").exists());
    }

    #[test]
    fn folder_with_one_archive_stages_it() {
        let dir = TempDir::new().unwrap();
        make_tarball(dir.path(), &[("pkg/a.py", "a = 1\n")]);
        let staged = stage_folder(dir.path()).unwrap();
        assert!(staged.join("pkg/a.py").exists());
    }

    #[test]
    fn plain_folder_is_scanned_in_place() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.py"), "a = 1\n").unwrap();
        let staged = stage_folder(dir.path()).unwrap();
        assert_eq!(staged, dir.path());
    }
}
