//! # Streaming Compressors
//!
//! A small capability set shared by every compression algorithm. Each variant
//! is a self-contained type; `compressor_for` picks one by configuration name.
//!
//! The streaming writer and the one-shot `compress` go through the same
//! encoder setup, so identical input and level give identical bytes.

mod gzip_codec;
mod lz4_codec;
mod passthrough;
mod zstd_codec;

pub use gzip_codec::GzipCompressor;
pub use lz4_codec::Lz4Compressor;
pub use passthrough::NoCompressor;
pub use zstd_codec::ZstdCompressor;

use log::debug;
use std::io::{self, Write};
use std::ops::RangeInclusive;

use crate::domain::errors::{ArchiveError, Result};

/// A writer that must be explicitly finished to emit the stream trailer.
pub trait EncodeWriter: Write + Send {
    /// Flushes buffered data and writes the format trailer into the sink.
    fn finish(self: Box<Self>) -> io::Result<()>;
}

/// Capability set for a compression algorithm.
pub trait Compressor: Send + Sync {
    /// Configuration name, e.g. "zstd".
    fn name(&self) -> &'static str;

    /// File extension without the dot; empty for pass-through.
    fn extension(&self) -> &'static str;

    fn default_level(&self) -> i32;

    fn level_range(&self) -> RangeInclusive<i32>;

    /// Wraps `sink` with an encoder at an already-normalized level.
    fn open_encoder<'a>(
        &self,
        sink: Box<dyn Write + Send + 'a>,
        level: i32,
    ) -> io::Result<Box<dyn EncodeWriter + 'a>>;

    /// Out-of-range levels fall back to the algorithm default.
    fn normalize_level(&self, level: i32) -> i32 {
        if self.level_range().contains(&level) {
            level
        } else {
            let default = self.default_level();
            debug!(
                "{} level {} outside {:?}, using default {}",
                self.name(),
                level,
                self.level_range(),
                default
            );
            default
        }
    }

    /// Streaming writer over `sink`.
    fn new_writer<'a>(
        &self,
        sink: Box<dyn Write + Send + 'a>,
        level: i32,
    ) -> Result<Box<dyn EncodeWriter + 'a>> {
        let level = self.normalize_level(level);
        self.open_encoder(sink, level).map_err(ArchiveError::IoError)
    }

    /// One-shot compression for small payloads.
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len() / 2 + 64);
        {
            let mut writer = self.new_writer(Box::new(&mut out), level)?;
            writer.write_all(data)?;
            writer.finish()?;
        }
        Ok(out)
    }
}

/// Factory keyed on the configuration string.
///
/// `workers` is only used by algorithms with a multi-threaded encoder.
pub fn compressor_for(name: &str, workers: u32) -> Result<Box<dyn Compressor>> {
    match name.trim().to_lowercase().as_str() {
        "zstd" | "zst" => Ok(Box::new(ZstdCompressor::new(workers))),
        "lz4" => Ok(Box::new(Lz4Compressor)),
        "gzip" | "gz" => Ok(Box::new(GzipCompressor)),
        "none" | "" => Ok(Box::new(NoCompressor)),
        other => Err(ArchiveError::ConfigError(format!(
            "Unknown compression type '{}' (expected zstd, lz4, gzip or none)",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_payload() -> Vec<u8> {
        let mut data = Vec::new();
        for i in 0..5_000 {
            data.extend_from_slice(
                format!("{{\"id\":{},\"name\":\"row-{}\",\"flag\":{}}}\n", i, i % 97, i % 2 == 0)
                    .as_bytes(),
            );
        }
        data
    }

    fn stream(compressor: &dyn Compressor, data: &[u8], level: i32) -> Vec<u8> {
        let mut out = Vec::new();
        {
            let mut w = compressor.new_writer(Box::new(&mut out), level).unwrap();
            w.write_all(data).unwrap();
            w.finish().unwrap();
        }
        out
    }

    #[test]
    fn test_streaming_matches_one_shot_for_every_algorithm() {
        let data = sample_payload();
        for name in ["zstd", "lz4", "gzip", "none"] {
            let c = compressor_for(name, 0).unwrap();
            for level in [c.default_level(), *c.level_range().end(), -50, 1_000] {
                let streamed = stream(c.as_ref(), &data, level);
                let one_shot = c.compress(&data, level).unwrap();
                assert_eq!(streamed, one_shot, "{} level {}", name, level);
            }
        }
    }

    #[test]
    fn test_multithreaded_zstd_streaming_matches_one_shot() {
        let data = sample_payload().repeat(8);
        let c = compressor_for("zstd", 4).unwrap();
        for level in [1, c.default_level()] {
            let streamed = stream(c.as_ref(), &data, level);
            let one_shot = c.compress(&data, level).unwrap();
            assert_eq!(streamed, one_shot, "level {}", level);
            assert_eq!(zstd::decode_all(&streamed[..]).unwrap(), data);
        }
    }

    #[test]
    fn test_out_of_range_level_uses_default() {
        let c = compressor_for("gzip", 0).unwrap();
        assert_eq!(c.normalize_level(42), c.default_level());
        assert_eq!(c.normalize_level(9), 9);

        let data = sample_payload();
        assert_eq!(
            c.compress(&data, 42).unwrap(),
            c.compress(&data, c.default_level()).unwrap()
        );
    }

    #[test]
    fn test_round_trip() {
        use std::io::Read;
        let data = sample_payload();

        let z = compressor_for("zstd", 0).unwrap().compress(&data, 3).unwrap();
        assert_eq!(zstd::decode_all(&z[..]).unwrap(), data);

        let g = compressor_for("gzip", 0).unwrap().compress(&data, 6).unwrap();
        let mut out = Vec::new();
        flate2::read::GzDecoder::new(&g[..]).read_to_end(&mut out).unwrap();
        assert_eq!(out, data);

        let l = compressor_for("lz4", 0).unwrap().compress(&data, 0).unwrap();
        let mut out = Vec::new();
        lz4::Decoder::new(&l[..]).unwrap().read_to_end(&mut out).unwrap();
        assert_eq!(out, data);

        let n = compressor_for("none", 0).unwrap().compress(&data, 0).unwrap();
        assert_eq!(n, data);
    }

    #[test]
    fn test_factory() {
        assert_eq!(compressor_for("ZSTD", 2).unwrap().extension(), "zst");
        assert_eq!(compressor_for("gzip", 0).unwrap().extension(), "gz");
        assert_eq!(compressor_for("none", 0).unwrap().extension(), "");
        assert!(matches!(
            compressor_for("brotli", 0),
            Err(ArchiveError::ConfigError(_))
        ));
    }
}
