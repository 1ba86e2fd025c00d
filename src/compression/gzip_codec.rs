use flate2::write::GzEncoder;
use flate2::Compression as GzipCompression;
use std::io::{self, Write};
use std::ops::RangeInclusive;

use super::{Compressor, EncodeWriter};

/// Gzip (deflate) using flate2.
#[derive(Debug, Clone, Copy, Default)]
pub struct GzipCompressor;

struct GzipWriter<'a> {
    inner: GzEncoder<Box<dyn Write + Send + 'a>>,
}

impl Write for GzipWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl EncodeWriter for GzipWriter<'_> {
    fn finish(self: Box<Self>) -> io::Result<()> {
        let mut sink = self.inner.finish()?;
        sink.flush()
    }
}

impl Compressor for GzipCompressor {
    fn name(&self) -> &'static str {
        "gzip"
    }

    fn extension(&self) -> &'static str {
        "gz"
    }

    fn default_level(&self) -> i32 {
        6
    }

    fn level_range(&self) -> RangeInclusive<i32> {
        1..=9
    }

    fn open_encoder<'a>(
        &self,
        sink: Box<dyn Write + Send + 'a>,
        level: i32,
    ) -> io::Result<Box<dyn EncodeWriter + 'a>> {
        let inner = GzEncoder::new(sink, GzipCompression::new(level as u32));
        Ok(Box::new(GzipWriter { inner }))
    }
}
