//! Packing of dump directories into a single tar stream.

use std::fs;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Component, Path};

use keeper_types::{ArtifactKind, BackupRecord, Codec};

use crate::compress;
use crate::crypto::{DecryptReader, EncryptionKey};
use crate::error::{KeeperError, Result};

/// Write every regular file and directory under `src` into a tar stream.
///
/// Entries are added in sorted order with paths relative to `src`, so the
/// same tree always produces the same member list.
pub fn pack_dir<W: Write>(src: &Path, writer: W) -> Result<W> {
    let mut builder = tar::Builder::new(writer);
    builder.follow_symlinks(false);
    for entry in walkdir::WalkDir::new(src).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| KeeperError::Other(format!("walk '{}': {e}", src.display())))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| KeeperError::Other(e.to_string()))?;
        let file_type = entry.file_type();
        if file_type.is_dir() {
            builder.append_dir(rel, entry.path())?;
        } else if file_type.is_file() {
            let mut file = fs::File::open(entry.path())?;
            builder.append_file(rel, &mut file)?;
        } else {
            tracing::debug!(path = %entry.path().display(), "skipping non-regular file");
        }
    }
    Ok(builder.into_inner()?)
}

/// Pack `src` into the file `dest`, compressing with `codec` when given.
/// Returns the size of the written file.
pub fn pack_to_file(src: &Path, dest: &Path, codec: Option<(Codec, i32)>) -> Result<u64> {
    let out = BufWriter::new(fs::File::create(dest)?);
    let mut out = match codec {
        Some((codec, level)) => {
            let enc = pack_dir(src, compress::CompressWriter::new(codec, level, out)?)?;
            enc.finish()?
        }
        None => pack_dir(src, out)?,
    };
    out.flush()?;
    out.into_inner()
        .map_err(|e| KeeperError::Io(e.into_error()))?
        .sync_all()?;
    Ok(fs::metadata(dest)?.len())
}

/// Unpack a tar stream into `dest`. Returns the total size of regular files.
///
/// Members with absolute paths or `..` components are rejected.
pub fn unpack<R: Read>(reader: R, dest: &Path) -> Result<u64> {
    fs::create_dir_all(dest)?;
    let mut archive = tar::Archive::new(reader);
    let mut total = 0u64;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            return Err(KeeperError::InvalidKey(format!(
                "archive member escapes destination: '{}'",
                path.display()
            )));
        }
        if entry.header().entry_type().is_file() {
            total += entry.header().size()?;
        }
        entry.unpack_in(dest)?;
    }
    Ok(total)
}

/// Open a packaged artifact as a plain tar stream, undoing encryption and
/// compression in that order.
///
/// The codec is taken from the stream's magic bytes. A stream that doesn't
/// match the codec on the record is a decompression error.
pub fn open_artifact(
    path: &Path,
    record: &BackupRecord,
    key: Option<&EncryptionKey>,
) -> Result<Box<dyn Read + Send>> {
    if record.artifact_kind != ArtifactKind::File {
        return Err(KeeperError::Other(format!(
            "backup '{}' is stored as a plain directory",
            record.id
        )));
    }
    let file = BufReader::new(fs::File::open(path)?);
    let plain: Box<dyn Read + Send> = if record.encrypted {
        let key = key.ok_or_else(|| {
            KeeperError::Config(format!(
                "backup '{}' is encrypted but no encryption key is available",
                record.id
            ))
        })?;
        Box::new(DecryptReader::new(key, file).map_err(|_| KeeperError::DecryptionFailed)?)
    } else {
        Box::new(file)
    };
    let mut plain = BufReader::new(plain);
    let encrypted = record.encrypted;
    let header = plain.fill_buf().map_err(|e| {
        if encrypted {
            KeeperError::DecryptionFailed
        } else {
            KeeperError::Io(e)
        }
    })?;
    match (record.compression, compress::detect_codec(header)) {
        (Some(recorded), Some(found)) if recorded != found => Err(KeeperError::Decompression(
            format!("backup '{}' records {recorded} but the stream is {found}", record.id),
        )),
        (Some(recorded), None) => Err(KeeperError::Decompression(format!(
            "backup '{}' records {recorded} but the stream has no {recorded} header",
            record.id
        ))),
        (_, Some(found)) => compress::decoder(found, plain),
        (None, None) => Ok(Box::new(plain)),
    }
}

/// Restore a stored artifact into `dest`. Returns the unpacked payload size.
pub fn restore_artifact(
    path: &Path,
    record: &BackupRecord,
    key: Option<&EncryptionKey>,
    dest: &Path,
) -> Result<u64> {
    match record.artifact_kind {
        ArtifactKind::File => unpack(open_artifact(path, record, key)?, dest),
        ArtifactKind::Directory => {
            fs::create_dir_all(dest)?;
            copy_tree(path, dest)
        }
    }
}

fn copy_tree(src: &Path, dest: &Path) -> Result<u64> {
    let mut total = 0;
    for entry in walkdir::WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(|e| KeeperError::Other(format!("walk '{}': {e}", src.display())))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| KeeperError::Other(e.to_string()))?;
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            total += fs::copy(entry.path(), &target)?;
        }
    }
    Ok(total)
}

/// Total size of regular files under `path` (or the file itself).
pub fn tree_size(path: &Path) -> Result<u64> {
    let meta = fs::metadata(path)?;
    if meta.is_file() {
        return Ok(meta.len());
    }
    let mut total = 0;
    for entry in walkdir::WalkDir::new(path) {
        let entry = entry.map_err(|e| KeeperError::Other(format!("walk '{}': {e}", path.display())))?;
        if entry.file_type().is_file() {
            total += entry
                .metadata()
                .map_err(|e| KeeperError::Other(e.to_string()))?
                .len();
        }
    }
    Ok(total)
}
