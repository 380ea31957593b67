use std::io::{self, BufReader, Read, Write};

use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;

use keeper_types::Codec;

use crate::error::{KeeperError, Result};

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const ZSTD_MAGIC: &[u8] = &[0x28, 0xb5, 0x2f, 0xfd];
const LZ4_FRAME_MAGIC: &[u8] = &[0x04, 0x22, 0x4d, 0x18];

/// Streaming compressor over any writer. Call [`CompressWriter::finish`] to
/// flush the trailer; dropping it leaves a truncated stream.
pub enum CompressWriter<W: Write> {
    Gzip(GzEncoder<W>),
    Zstd(zstd::Encoder<'static, W>),
    Lz4(lz4_flex::frame::FrameEncoder<W>),
}

impl<W: Write> CompressWriter<W> {
    pub fn new(codec: Codec, level: i32, inner: W) -> Result<Self> {
        Ok(match codec {
            Codec::Gzip => CompressWriter::Gzip(GzEncoder::new(
                inner,
                flate2::Compression::new(level.clamp(0, 9) as u32),
            )),
            Codec::Zstd => CompressWriter::Zstd(
                zstd::Encoder::new(inner, level)
                    .map_err(|e| KeeperError::Other(format!("zstd encoder: {e}")))?,
            ),
            Codec::Lz4 => CompressWriter::Lz4(lz4_flex::frame::FrameEncoder::new(inner)),
        })
    }

    /// Write the codec trailer and return the inner writer.
    pub fn finish(self) -> io::Result<W> {
        match self {
            CompressWriter::Gzip(enc) => enc.finish(),
            CompressWriter::Zstd(enc) => enc.finish(),
            CompressWriter::Lz4(enc) => enc
                .finish()
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string())),
        }
    }
}

impl<W: Write> Write for CompressWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            CompressWriter::Gzip(enc) => enc.write(buf),
            CompressWriter::Zstd(enc) => enc.write(buf),
            CompressWriter::Lz4(enc) => enc.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            CompressWriter::Gzip(enc) => enc.flush(),
            CompressWriter::Zstd(enc) => enc.flush(),
            CompressWriter::Lz4(enc) => enc.flush(),
        }
    }
}

/// Wrap `inner` in a streaming decoder for `codec`.
pub fn decoder<'a, R: Read + Send + 'a>(codec: Codec, inner: R) -> Result<Box<dyn Read + Send + 'a>> {
    Ok(match codec {
        Codec::Gzip => Box::new(MultiGzDecoder::new(inner)),
        Codec::Zstd => Box::new(
            zstd::Decoder::new(inner)
                .map_err(|e| KeeperError::Decompression(format!("zstd decoder: {e}")))?,
        ),
        Codec::Lz4 => Box::new(lz4_flex::frame::FrameDecoder::new(BufReader::new(inner))),
    })
}

/// Identify a codec by the magic bytes at the start of a stream.
pub fn detect_codec(header: &[u8]) -> Option<Codec> {
    if header.starts_with(GZIP_MAGIC) {
        Some(Codec::Gzip)
    } else if header.starts_with(ZSTD_MAGIC) {
        Some(Codec::Zstd)
    } else if header.starts_with(LZ4_FRAME_MAGIC) {
        Some(Codec::Lz4)
    } else {
        None
    }
}

/// Drain a decoder into a sink. Returns the number of decompressed bytes.
///
/// Any codec error surfaces as [`KeeperError::Decompression`].
pub fn drain<R: Read>(mut reader: R) -> Result<u64> {
    io::copy(&mut reader, &mut io::sink()).map_err(|e| KeeperError::Decompression(e.to_string()))
}
