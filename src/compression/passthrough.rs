use std::io::{self, Write};
use std::ops::RangeInclusive;

use super::{Compressor, EncodeWriter};

/// No compression; bytes go straight to the sink.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCompressor;

struct PassthroughWriter<'a> {
    sink: Box<dyn Write + Send + 'a>,
}

impl Write for PassthroughWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sink.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sink.flush()
    }
}

impl EncodeWriter for PassthroughWriter<'_> {
    fn finish(mut self: Box<Self>) -> io::Result<()> {
        self.sink.flush()
    }
}

impl Compressor for NoCompressor {
    fn name(&self) -> &'static str {
        "none"
    }

    fn extension(&self) -> &'static str {
        ""
    }

    fn default_level(&self) -> i32 {
        0
    }

    fn level_range(&self) -> RangeInclusive<i32> {
        0..=0
    }

    fn open_encoder<'a>(
        &self,
        sink: Box<dyn Write + Send + 'a>,
        _level: i32,
    ) -> io::Result<Box<dyn EncodeWriter + 'a>> {
        Ok(Box::new(PassthroughWriter { sink }))
    }
}
