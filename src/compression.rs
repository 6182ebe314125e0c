// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Optional compression of L2 payloads.
//!
//! The orchestrator compresses an encoded value before writing it to the
//! distributed store when compression is enabled (globally or per call) and
//! the payload is at least `compress_threshold_bytes`. Reads detect the
//! format by magic bytes, so compressed and plain payloads can coexist in
//! the same namespace.
//!
//! L1 never holds compressed bytes.
//!
//! # Feature Flag
//!
//! [`ZstdCompressor`] requires the `compression` feature (on by default).
//! Any other algorithm plugs in through the [`Compressor`] trait.

/// Zstd frame magic bytes (little-endian 0xFD2FB528)
pub const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Level 3 is zstd's own default: fast with a good ratio on JSON.
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    #[error("compression failed: {0}")]
    CompressFailed(String),

    #[error("decompression failed: {0}")]
    DecompressFailed(String),
}

/// Pluggable byte-level compression for L2 payloads.
pub trait Compressor: Send + Sync {
    /// Short name used in logs and metrics
    fn name(&self) -> &'static str;

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError>;

    /// Decompress if `data` is in this compressor's format, otherwise
    /// return it unchanged.
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError>;

    fn is_compressed(&self, data: &[u8]) -> bool;
}

/// zstd with magic-byte detection.
#[cfg(feature = "compression")]
#[derive(Debug, Clone, Copy)]
pub struct ZstdCompressor {
    level: i32,
}

#[cfg(feature = "compression")]
impl Default for ZstdCompressor {
    fn default() -> Self {
        Self::new(DEFAULT_COMPRESSION_LEVEL)
    }
}

#[cfg(feature = "compression")]
impl ZstdCompressor {
    /// Level 1-22; out-of-range values are clamped.
    #[must_use]
    pub fn new(level: i32) -> Self {
        Self { level: level.clamp(1, 22) }
    }

    #[must_use]
    pub fn level(&self) -> i32 {
        self.level
    }
}

#[cfg(feature = "compression")]
impl Compressor for ZstdCompressor {
    fn name(&self) -> &'static str {
        "zstd"
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        zstd::encode_all(data, self.level).map_err(|e| CompressionError::CompressFailed(e.to_string()))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        if self.is_compressed(data) {
            zstd::decode_all(data).map_err(|e| CompressionError::DecompressFailed(e.to_string()))
        } else {
            Ok(data.to_vec())
        }
    }

    fn is_compressed(&self, data: &[u8]) -> bool {
        is_zstd(data)
    }
}

/// True if `data` starts with a zstd frame header.
#[inline]
#[must_use]
pub fn is_zstd(data: &[u8]) -> bool {
    data.len() >= 4 && data[..4] == ZSTD_MAGIC
}

/// Size accounting for one compression.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompressionStats {
    pub original_bytes: usize,
    pub compressed_bytes: usize,
    /// original / compressed
    pub ratio: f64,
    /// Space saved (0.0 - 1.0)
    pub savings: f64,
}

impl CompressionStats {
    #[must_use]
    pub fn new(original_bytes: usize, compressed_bytes: usize) -> Self {
        let ratio = if compressed_bytes > 0 {
            original_bytes as f64 / compressed_bytes as f64
        } else {
            0.0
        };
        let savings = if original_bytes > 0 {
            1.0 - (compressed_bytes as f64 / original_bytes as f64)
        } else {
            0.0
        };
        Self {
            original_bytes,
            compressed_bytes,
            ratio,
            savings,
        }
    }
}

/// Compress with `compressor` and report the size change.
pub fn compress_with_stats(
    compressor: &dyn Compressor,
    data: &[u8],
) -> Result<(Vec<u8>, CompressionStats), CompressionError> {
    let compressed = compressor.compress(data)?;
    let stats = CompressionStats::new(data.len(), compressed.len());
    Ok((compressed, stats))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_math() {
        let stats = CompressionStats::new(1000, 250);
        assert!((stats.ratio - 4.0).abs() < f64::EPSILON);
        assert!((stats.savings - 0.75).abs() < f64::EPSILON);

        let empty = CompressionStats::new(0, 0);
        assert_eq!(empty.ratio, 0.0);
        assert_eq!(empty.savings, 0.0);
    }

    #[test]
    fn test_magic_detection() {
        assert!(is_zstd(&[0x28, 0xB5, 0x2F, 0xFD, 0x00]));
        assert!(!is_zstd(b"{\"canton\":\"ZH\"}"));
        assert!(!is_zstd(b"abc"));
        assert!(!is_zstd(b""));
    }

    #[cfg(feature = "compression")]
    mod zstd_tests {
        use super::super::*;

        fn company_json(n: usize) -> Vec<u8> {
            let rows: Vec<String> = (0..n)
                .map(|i| format!(r#"{{"uid":"CHE-{i:09}","canton":"ZH","legal_form":"AG","status":"active"}}"#))
                .collect();
            format!("[{}]", rows.join(",")).into_bytes()
        }

        #[test]
        fn test_compress_then_decompress() {
            let c = ZstdCompressor::default();
            let original = company_json(50);
            let packed = c.compress(&original).unwrap();

            assert!(c.is_compressed(&packed));
            assert_eq!(c.decompress(&packed).unwrap(), original);
        }

        #[test]
        fn test_plain_payload_passes_through() {
            let c = ZstdCompressor::default();
            let plain = b"{\"legacy\":true}";
            assert_eq!(c.decompress(plain).unwrap(), plain.to_vec());
        }

        #[test]
        fn test_corrupt_frame_is_error() {
            let c = ZstdCompressor::default();
            let bogus = [0x28, 0xB5, 0x2F, 0xFD, 0xFF, 0xFF, 0xFF];
            assert!(matches!(c.decompress(&bogus), Err(CompressionError::DecompressFailed(_))));
        }

        #[test]
        fn test_repetitive_json_compresses_well() {
            let c = ZstdCompressor::default();
            let (_, stats) = compress_with_stats(&c, &company_json(200)).unwrap();
            assert!(stats.savings > 0.5, "expected >50% savings, got {:.1}%", stats.savings * 100.0);
        }

        #[test]
        fn test_level_clamped() {
            assert_eq!(ZstdCompressor::new(0).level(), 1);
            assert_eq!(ZstdCompressor::new(99).level(), 22);
        }
    }
}
