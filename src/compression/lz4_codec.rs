use std::io::{self, Write};
use std::ops::RangeInclusive;

use super::{Compressor, EncodeWriter};

/// LZ4 frame format. Levels above 2 switch to the high-compression encoder.
#[derive(Debug, Clone, Copy, Default)]
pub struct Lz4Compressor;

struct Lz4Writer<'a> {
    inner: lz4::Encoder<Box<dyn Write + Send + 'a>>,
}

impl Write for Lz4Writer<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl EncodeWriter for Lz4Writer<'_> {
    fn finish(self: Box<Self>) -> io::Result<()> {
        let (mut sink, result) = self.inner.finish();
        result?;
        sink.flush()
    }
}

impl Compressor for Lz4Compressor {
    fn name(&self) -> &'static str {
        "lz4"
    }

    fn extension(&self) -> &'static str {
        "lz4"
    }

    fn default_level(&self) -> i32 {
        0
    }

    fn level_range(&self) -> RangeInclusive<i32> {
        0..=12
    }

    fn open_encoder<'a>(
        &self,
        sink: Box<dyn Write + Send + 'a>,
        level: i32,
    ) -> io::Result<Box<dyn EncodeWriter + 'a>> {
        let inner = lz4::EncoderBuilder::new()
            .level(level as u32)
            .build(sink)?;
        Ok(Box::new(Lz4Writer { inner }))
    }
}
