pub mod key;
pub mod stream;

pub use key::{EncryptionKey, KEY_FILE_NAME};
pub use stream::{DecryptReader, EncryptWriter, ENCRYPTED_MAGIC};

use std::fs;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;

use crate::error::Result;

/// Encrypt `src` into `dest`. Returns the size of the encrypted file.
pub fn encrypt_file(src: &Path, dest: &Path, key: &EncryptionKey) -> Result<u64> {
    let mut input = BufReader::new(fs::File::open(src)?);
    let mut writer = EncryptWriter::new(key, BufWriter::new(fs::File::create(dest)?))?;
    io::copy(&mut input, &mut writer)?;
    let mut out = writer.finish()?;
    out.flush()?;
    Ok(fs::metadata(dest)?.len())
}
