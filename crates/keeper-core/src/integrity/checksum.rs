use std::fs;
use std::io::{self, Read};
use std::path::Path;

use blake2::Blake2b512;
use sha2::{Digest, Sha256, Sha512};

use keeper_types::ChecksumAlgorithm;

use crate::error::{KeeperError, Result};

const READ_BUF: usize = 64 * 1024;

enum Hasher {
    Sha256(Sha256),
    Sha512(Sha512),
    Blake2b(Blake2b512),
}

impl Hasher {
    fn new(algorithm: ChecksumAlgorithm) -> Self {
        match algorithm {
            ChecksumAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
            ChecksumAlgorithm::Sha512 => Hasher::Sha512(Sha512::new()),
            ChecksumAlgorithm::Blake2b => Hasher::Blake2b(Blake2b512::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
            Hasher::Blake2b(h) => h.update(data),
        }
    }

    fn finish_hex(self) -> String {
        match self {
            Hasher::Sha256(h) => hex::encode(h.finalize()),
            Hasher::Sha512(h) => hex::encode(h.finalize()),
            Hasher::Blake2b(h) => hex::encode(h.finalize()),
        }
    }
}

/// Digest of a byte stream as lowercase hex.
pub fn checksum_reader<R: Read>(mut reader: R, algorithm: ChecksumAlgorithm) -> io::Result<String> {
    let mut hasher = Hasher::new(algorithm);
    let mut buf = vec![0u8; READ_BUF];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finish_hex())
}

pub fn checksum_file(path: &Path, algorithm: ChecksumAlgorithm) -> Result<String> {
    let file = fs::File::open(path)?;
    Ok(checksum_reader(file, algorithm)?)
}

/// Order-independent digest of a directory tree.
///
/// Files are sorted by their `/`-separated relative path and each
/// `relative_path:file_digest` pair is folded into one hash. Timestamps and
/// permissions do not contribute.
pub fn checksum_dir(path: &Path, algorithm: ChecksumAlgorithm) -> Result<String> {
    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(path).follow_links(false) {
        let entry =
            entry.map_err(|e| KeeperError::Other(format!("walk '{}': {e}", path.display())))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(path)
            .map_err(|e| KeeperError::Other(e.to_string()))?
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        files.push((rel, entry.into_path()));
    }
    files.sort_by(|a, b| a.0.cmp(&b.0));

    let mut hasher = Hasher::new(algorithm);
    for (rel, file) in files {
        let digest = checksum_file(&file, algorithm)?;
        hasher.update(rel.as_bytes());
        hasher.update(b":");
        hasher.update(digest.as_bytes());
    }
    Ok(hasher.finish_hex())
}

/// Checksum a file or a directory tree.
pub fn checksum_path(path: &Path, algorithm: ChecksumAlgorithm) -> Result<String> {
    if fs::metadata(path)?.is_dir() {
        checksum_dir(path, algorithm)
    } else {
        checksum_file(path, algorithm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_digests() {
        let tmp = tempfile::tempdir().unwrap();
        let f = tmp.path().join("abc.txt");
        fs::write(&f, b"abc").unwrap();
        assert_eq!(
            checksum_file(&f, ChecksumAlgorithm::Sha256).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(checksum_file(&f, ChecksumAlgorithm::Sha512).unwrap().len(), 128);
        assert_eq!(checksum_file(&f, ChecksumAlgorithm::Blake2b).unwrap().len(), 128);
    }

    #[test]
    fn directory_digest_ignores_creation_order() {
        let tmp = tempfile::tempdir().unwrap();
        let a = tmp.path().join("a");
        let b = tmp.path().join("b");
        fs::create_dir_all(a.join("sub")).unwrap();
        fs::create_dir_all(b.join("sub")).unwrap();

        fs::write(a.join("x.bson"), b"1").unwrap();
        fs::write(a.join("sub/y.bson"), b"2").unwrap();
        fs::write(a.join("z.json"), b"3").unwrap();

        fs::write(b.join("z.json"), b"3").unwrap();
        fs::write(b.join("sub/y.bson"), b"2").unwrap();
        fs::write(b.join("x.bson"), b"1").unwrap();

        let da = checksum_dir(&a, ChecksumAlgorithm::Sha256).unwrap();
        let db = checksum_dir(&b, ChecksumAlgorithm::Sha256).unwrap();
        assert_eq!(da, db);
    }

    #[test]
    fn directory_digest_is_stable_across_rename_and_restore() {
        let tmp = tempfile::tempdir().unwrap();
        let d = tmp.path().join("d");
        fs::create_dir_all(&d).unwrap();
        for i in 0..20 {
            fs::write(d.join(format!("f{i:02}.json")), format!("{i}")).unwrap();
        }
        let before = checksum_dir(&d, ChecksumAlgorithm::Blake2b).unwrap();
        for i in 0..20 {
            let from = d.join(format!("f{i:02}.json"));
            let tmp_name = d.join(format!("tmp{i:02}"));
            fs::rename(&from, &tmp_name).unwrap();
            fs::rename(&tmp_name, &from).unwrap();
        }
        assert_eq!(before, checksum_dir(&d, ChecksumAlgorithm::Blake2b).unwrap());
    }

    #[test]
    fn directory_digest_depends_on_path_and_content() {
        let tmp = tempfile::tempdir().unwrap();
        let d = tmp.path().join("d");
        fs::create_dir_all(&d).unwrap();
        fs::write(d.join("a"), b"1").unwrap();
        let original = checksum_path(&d, ChecksumAlgorithm::Sha256).unwrap();

        fs::rename(d.join("a"), d.join("b")).unwrap();
        let renamed = checksum_path(&d, ChecksumAlgorithm::Sha256).unwrap();
        assert_ne!(original, renamed);

        fs::write(d.join("b"), b"2").unwrap();
        assert_ne!(renamed, checksum_path(&d, ChecksumAlgorithm::Sha256).unwrap());
    }
}
