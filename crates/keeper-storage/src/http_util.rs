use std::io::Read;

use keeper_types::{KeeperError, Result};

/// Read a response body fully into memory.
pub fn read_body(resp: ureq::Response) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    resp.into_reader().read_to_end(&mut buf)?;
    Ok(buf)
}

/// Extract and parse the `Content-Length` header from an HTTP response.
pub fn content_length(resp: &ureq::Response, context: &str) -> Result<u64> {
    let header = resp.header("Content-Length").ok_or_else(|| {
        KeeperError::Other(format!("{context}: response missing Content-Length header"))
    })?;
    header
        .parse::<u64>()
        .map_err(|_| KeeperError::Other(format!("{context}: invalid Content-Length: {header}")))
}
