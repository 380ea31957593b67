use std::fs;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use serde::Serialize;

use keeper_types::BackupFormat;

use crate::error::{KeeperError, Result};

/// Smallest well-formed BSON document: 4-byte length plus the terminating NUL.
const MIN_BSON_DOC: usize = 5;
/// BSON's own upper bound on a single document.
const MAX_BSON_DOC: usize = 16 * 1024 * 1024;

/// What a structural pass found.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StructureSummary {
    /// Files checked against the format rules.
    pub files: usize,
    /// Documents or records successfully parsed across all files.
    pub records: u64,
    pub bytes: u64,
}

/// Check the internal shape of an unpacked backup.
///
/// Archive dumps must contain well-formed BSON document sequences in every
/// `.bson` file and parseable JSON in every `.json` file. Structured exports
/// must hold one JSON document per non-blank line in every `.json`/`.jsonl`
/// file; the first malformed line fails the check with its line number.
pub fn verify_structure(root: &Path, format: BackupFormat) -> Result<StructureSummary> {
    let mut summary = StructureSummary::default();
    let mut seen_any = false;

    let mut entries: Vec<_> = walkdir::WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| KeeperError::Other(format!("walk '{}': {e}", root.display())))?;
    entries.retain(|e| e.file_type().is_file());

    for entry in entries {
        seen_any = true;
        let path = entry.path();
        let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
        summary.bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);

        let records = match format {
            BackupFormat::Archive if name.ends_with(".bson") => Some(verify_bson_file(path)?),
            BackupFormat::Archive if name.ends_with(".json") => {
                verify_json_document(path)?;
                Some(0)
            }
            BackupFormat::StructuredExport
                if name.ends_with(".json") || name.ends_with(".jsonl") =>
            {
                Some(verify_json_lines(path)?)
            }
            _ => None,
        };
        if let Some(records) = records {
            summary.files += 1;
            summary.records += records;
        }
    }

    if !seen_any {
        return Err(KeeperError::Structure {
            path: root.display().to_string(),
            line: None,
            message: "backup contains no files".into(),
        });
    }
    if summary.files == 0 {
        return Err(KeeperError::Structure {
            path: root.display().to_string(),
            line: None,
            message: format!("no {format} data files found"),
        });
    }
    Ok(summary)
}

/// Walk a BSON document sequence without decoding fields. Returns the document count.
fn verify_bson_file(path: &Path) -> Result<u64> {
    let malformed = |message: String| KeeperError::Structure {
        path: path.display().to_string(),
        line: None,
        message,
    };

    let mut reader = BufReader::new(fs::File::open(path)?);
    let mut count = 0u64;
    let mut offset = 0u64;
    loop {
        let mut len_buf = [0u8; 4];
        match read_full(&mut reader, &mut len_buf)? {
            0 => break,
            4 => {}
            n => {
                return Err(malformed(format!(
                    "truncated document header at byte {offset} ({n} of 4 bytes)"
                )))
            }
        }
        let len = i32::from_le_bytes(len_buf);
        if len < MIN_BSON_DOC as i32 || len as usize > MAX_BSON_DOC {
            return Err(malformed(format!(
                "invalid document length {len} at byte {offset}"
            )));
        }
        let mut body = vec![0u8; len as usize - 4];
        if read_full(&mut reader, &mut body)? != body.len() {
            return Err(malformed(format!(
                "document at byte {offset} truncated (declared {len} bytes)"
            )));
        }
        if body.last() != Some(&0) {
            return Err(malformed(format!(
                "document at byte {offset} is not NUL-terminated"
            )));
        }
        offset += len as u64;
        count += 1;
    }
    Ok(count)
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

fn verify_json_document(path: &Path) -> Result<()> {
    let data = fs::read(path)?;
    serde_json::from_slice::<serde_json::Value>(&data).map_err(|e| KeeperError::Structure {
        path: path.display().to_string(),
        line: Some(e.line()),
        message: e.to_string(),
    })?;
    Ok(())
}

/// Count line-delimited JSON records, failing on the first malformed line.
fn verify_json_lines(path: &Path) -> Result<u64> {
    let reader = BufReader::new(fs::File::open(path)?);
    let mut count = 0u64;
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        serde_json::from_str::<serde_json::Value>(trimmed).map_err(|e| {
            KeeperError::Structure {
                path: path.display().to_string(),
                line: Some(idx + 1),
                message: e.to_string(),
            }
        })?;
        count += 1;
    }
    Ok(count)
}
