use std::io::{self, Write};
use std::ops::RangeInclusive;

use super::{Compressor, EncodeWriter};

/// Zstandard, block streaming. Optionally encodes with several worker threads.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZstdCompressor {
    workers: u32,
}

impl ZstdCompressor {
    pub fn new(workers: u32) -> Self {
        Self { workers }
    }
}

struct ZstdWriter<'a> {
    inner: zstd::stream::write::Encoder<'static, Box<dyn Write + Send + 'a>>,
}

impl Write for ZstdWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl EncodeWriter for ZstdWriter<'_> {
    fn finish(self: Box<Self>) -> io::Result<()> {
        let mut sink = self.inner.finish()?;
        sink.flush()
    }
}

impl Compressor for ZstdCompressor {
    fn name(&self) -> &'static str {
        "zstd"
    }

    fn extension(&self) -> &'static str {
        "zst"
    }

    fn default_level(&self) -> i32 {
        3
    }

    fn level_range(&self) -> RangeInclusive<i32> {
        1..=22
    }

    fn open_encoder<'a>(
        &self,
        sink: Box<dyn Write + Send + 'a>,
        level: i32,
    ) -> io::Result<Box<dyn EncodeWriter + 'a>> {
        let mut inner = zstd::stream::write::Encoder::new(sink, level)?;
        if self.workers > 1 {
            inner.multithread(self.workers)?;
        }
        Ok(Box::new(ZstdWriter { inner }))
    }
}
