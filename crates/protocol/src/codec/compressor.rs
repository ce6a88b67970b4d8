//! Built-in compressors.

use super::Compressor;
use crate::error::CodecError;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::io::{Read, Write};

/// Gzip compressor backed by `flate2`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GzipCompressor;

impl Compressor for GzipCompressor {
    fn name(&self) -> &'static str {
        "gzip"
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
        encoder
            .write_all(data)
            .map_err(|e| CodecError::CompressionFailed(e.to_string()))?;
        encoder
            .finish()
            .map_err(|e| CodecError::CompressionFailed(e.to_string()))
    }

    fn decompress(&self, data: &[u8], limit: usize) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        // Read one byte past the limit to detect overflow without inflating further.
        GzDecoder::new(data)
            .take(limit as u64 + 1)
            .read_to_end(&mut out)
            .map_err(|e| CodecError::DecompressionFailed(e.to_string()))?;
        if out.len() > limit {
            return Err(CodecError::DecompressedTooLarge { max: limit });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gzip_roundtrip() {
        let data = "hello ".repeat(500).into_bytes();
        let compressed = GzipCompressor.compress(&data).unwrap();
        assert!(compressed.len() < data.len());

        let restored = GzipCompressor.decompress(&compressed, data.len()).unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn test_decompress_limit() {
        let data = vec![0u8; 64 * 1024];
        let compressed = GzipCompressor.compress(&data).unwrap();

        let result = GzipCompressor.decompress(&compressed, 1024);
        assert!(matches!(
            result,
            Err(CodecError::DecompressedTooLarge { max: 1024 })
        ));
    }

    #[test]
    fn test_corrupt_input() {
        let result = GzipCompressor.decompress(b"definitely not gzip", 1024);
        assert!(matches!(result, Err(CodecError::DecompressionFailed(_))));
    }
}
