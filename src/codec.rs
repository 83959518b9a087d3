//! Body compression shared by the collector transport and the ingest endpoint.

use std::io::{Read, Write};

use anyhow::{Context, Result};

/// Compression algorithms accepted in configuration.
pub const SUPPORTED: &[&str] = &["none", "gzip", "zstd", "zlib", "snappy"];

/// Compresses data using the specified algorithm.
pub fn compress(data: &[u8], algorithm: &str) -> Result<Vec<u8>> {
    match algorithm {
        "none" | "" => Ok(data.to_vec()),
        "gzip" => compress_gzip(data),
        "zstd" => zstd::encode_all(data, 0).context("zstd encode"),
        "zlib" => compress_zlib(data),
        "snappy" => snap::raw::Encoder::new()
            .compress_vec(data)
            .context("snappy encode"),
        other => anyhow::bail!("unsupported compression: {other}"),
    }
}

/// Returns the Content-Encoding header value for the algorithm.
pub fn content_encoding(algorithm: &str) -> Option<&'static str> {
    match algorithm {
        "gzip" => Some("gzip"),
        "zstd" => Some("zstd"),
        "zlib" => Some("deflate"),
        "snappy" => Some("snappy"),
        _ => None,
    }
}

/// Failure to decode a request body.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("decoded body exceeds {limit} bytes")]
    TooLarge { limit: usize },
    #[error("unsupported content encoding: {0}")]
    Unsupported(String),
    #[error("{encoding} decode: {source}")]
    Corrupt {
        encoding: &'static str,
        #[source]
        source: std::io::Error,
    },
}

fn corrupt(encoding: &'static str) -> impl FnOnce(std::io::Error) -> DecodeError {
    move |source| DecodeError::Corrupt { encoding, source }
}

/// Reads at most `limit` bytes, failing if the stream holds more.
fn read_bounded(reader: impl Read, limit: usize, encoding: &'static str) -> Result<Vec<u8>, DecodeError> {
    let mut out = Vec::new();
    reader
        .take(limit as u64 + 1)
        .read_to_end(&mut out)
        .map_err(corrupt(encoding))?;
    if out.len() > limit {
        return Err(DecodeError::TooLarge { limit });
    }
    Ok(out)
}

/// Decodes a request body according to its Content-Encoding header value.
/// The decoded size is capped at `limit` bytes.
pub fn decode_body(data: &[u8], content_encoding: Option<&str>, limit: usize) -> Result<Vec<u8>, DecodeError> {
    let encoding = content_encoding.map(str::trim).unwrap_or("identity");
    match encoding {
        "" | "identity" => read_bounded(data, limit, "identity"),
        "gzip" => read_bounded(flate2::read::GzDecoder::new(data), limit, "gzip"),
        "deflate" => read_bounded(flate2::read::ZlibDecoder::new(data), limit, "zlib"),
        "zstd" => {
            let decoder = zstd::stream::read::Decoder::new(data).map_err(corrupt("zstd"))?;
            read_bounded(decoder, limit, "zstd")
        }
        "snappy" => {
            let to_io = |e: snap::Error| std::io::Error::new(std::io::ErrorKind::InvalidData, e);
            let declared = snap::raw::decompress_len(data)
                .map_err(to_io)
                .map_err(corrupt("snappy"))?;
            if declared > limit {
                return Err(DecodeError::TooLarge { limit });
            }
            snap::raw::Decoder::new()
                .decompress_vec(data)
                .map_err(to_io)
                .map_err(corrupt("snappy"))
        }
        other => Err(DecodeError::Unsupported(other.to_string())),
    }
}

fn compress_gzip(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).context("gzip write")?;
    encoder.finish().context("gzip finish")
}

fn compress_zlib(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::write::ZlibEncoder;
    use flate2::Compression;

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).context("zlib write")?;
    encoder.finish().context("zlib finish")
}
