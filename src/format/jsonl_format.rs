use serde::ser::{Serialize, SerializeMap, Serializer};
use std::io::{BufWriter, Write};

use super::{OutputFormat, StreamWriter};
use crate::domain::entities::{ColumnSchema, Record, Value};
use crate::domain::errors::Result;

/// One JSON object per line, keys in column order.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLinesFormat;

/// Serializes a row with exactly the schema's columns; missing keys become `null`.
struct AlignedRow<'r> {
    columns: &'r [String],
    row: &'r Record,
}

impl Serialize for AlignedRow<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        if self.columns.is_empty() {
            return self.row.serialize(serializer);
        }
        let mut map = serializer.serialize_map(Some(self.columns.len()))?;
        for col in self.columns {
            map.serialize_entry(col, self.row.get(col).unwrap_or(&Value::Null))?;
        }
        map.end()
    }
}

struct JsonLinesWriter<'a> {
    out: BufWriter<Box<dyn Write + Send + 'a>>,
    columns: Vec<String>,
}

impl StreamWriter for JsonLinesWriter<'_> {
    fn write_chunk(&mut self, rows: &[Record]) -> Result<()> {
        for row in rows {
            let aligned = AlignedRow {
                columns: &self.columns,
                row,
            };
            serde_json::to_writer(&mut self.out, &aligned)?;
            self.out.write_all(b"\n")?;
        }
        Ok(())
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        // No header or footer; only the local buffer needs draining.
        self.out.flush()?;
        Ok(())
    }
}

impl OutputFormat for JsonLinesFormat {
    fn name(&self) -> &'static str {
        "jsonl"
    }

    fn extension(&self) -> &'static str {
        "jsonl"
    }

    fn mime_type(&self) -> &'static str {
        "application/x-ndjson"
    }

    fn new_writer<'a>(
        &self,
        sink: Box<dyn Write + Send + 'a>,
        schema: &ColumnSchema,
    ) -> Result<Box<dyn StreamWriter + 'a>> {
        Ok(Box::new(JsonLinesWriter {
            out: BufWriter::with_capacity(64 * 1024, sink),
            columns: schema.sorted_names(),
        }))
    }
}
