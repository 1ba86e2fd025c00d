use csv::{QuoteStyle, Writer, WriterBuilder};
use std::io::Write;

use super::{OutputFormat, StreamWriter};
use crate::domain::entities::{ColumnSchema, Record};
use crate::domain::errors::Result;

/// CSV with a header row. Column order is fixed lexicographically up front.
#[derive(Debug, Clone, Copy, Default)]
pub struct CsvFormat;

struct CsvStreamWriter<'a> {
    wtr: Writer<Box<dyn Write + Send + 'a>>,
    /// `None` until the header is known (empty schema: taken from the first row).
    header: Option<Vec<String>>,
    record: Vec<String>,
}

impl CsvStreamWriter<'_> {
    fn write_header(&mut self, columns: Vec<String>) -> Result<()> {
        self.wtr.write_record(&columns)?;
        self.record = Vec::with_capacity(columns.len());
        self.header = Some(columns);
        Ok(())
    }
}

impl StreamWriter for CsvStreamWriter<'_> {
    fn write_chunk(&mut self, rows: &[Record]) -> Result<()> {
        if self.header.is_none() {
            if let Some(first) = rows.first() {
                let columns: Vec<String> = first.keys().cloned().collect();
                self.write_header(columns)?;
            }
        }
        let Some(header) = &self.header else {
            return Ok(());
        };

        for row in rows {
            self.record.clear();
            for col in header {
                // Missing keys render as an empty field so the row never shifts.
                self.record
                    .push(row.get(col).map(|v| v.render()).unwrap_or_default());
            }
            self.wtr.write_record(&self.record)?;
        }
        Ok(())
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        self.wtr.flush()?;
        Ok(())
    }
}

impl OutputFormat for CsvFormat {
    fn name(&self) -> &'static str {
        "csv"
    }

    fn extension(&self) -> &'static str {
        "csv"
    }

    fn mime_type(&self) -> &'static str {
        "text/csv"
    }

    fn new_writer<'a>(
        &self,
        sink: Box<dyn Write + Send + 'a>,
        schema: &ColumnSchema,
    ) -> Result<Box<dyn StreamWriter + 'a>> {
        let wtr = WriterBuilder::new()
            .quote_style(QuoteStyle::Necessary)
            .from_writer(sink);
        let mut writer = CsvStreamWriter {
            wtr,
            header: None,
            record: Vec::new(),
        };
        if !schema.is_empty() {
            writer.write_header(schema.sorted_names())?;
        }
        Ok(Box::new(writer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::{ColumnDef, Value};
    use crate::format::serialize_in_chunks;

    fn schema() -> ColumnSchema {
        ColumnSchema::new(vec![
            ColumnDef { name: "status".into(), declared_type: "text".into() },
            ColumnDef { name: "amount".into(), declared_type: "numeric".into() },
            ColumnDef { name: "id".into(), declared_type: "integer".into() },
        ])
    }

    #[test]
    fn test_missing_key_keeps_alignment() {
        let mut full = Record::new();
        full.insert("id".into(), Value::Int(1));
        full.insert("amount".into(), Value::Text("9.50".into()));
        full.insert("status".into(), Value::Text("paid".into()));

        let mut missing_amount = Record::new();
        missing_amount.insert("id".into(), Value::Int(2));
        missing_amount.insert("status".into(), Value::Text("open".into()));

        let mut null_status = Record::new();
        null_status.insert("id".into(), Value::Int(3));
        null_status.insert("amount".into(), Value::Text("1.00".into()));
        null_status.insert("status".into(), Value::Null);

        let out = serialize_in_chunks(&CsvFormat, &schema(), &[full, missing_amount, null_status], 2);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "amount,id,status\n9.50,1,paid\n,2,open\n1.00,3,\n"
        );
    }

    #[test]
    fn test_header_written_without_rows() {
        let out = serialize_in_chunks(&CsvFormat, &schema(), &[], 10);
        assert_eq!(String::from_utf8(out).unwrap(), "amount,id,status\n");
    }

    #[test]
    fn test_quotes_embedded_delimiters() {
        let mut row = Record::new();
        row.insert("id".into(), Value::Int(1));
        row.insert("status".into(), Value::Text("a,b".into()));
        let out = serialize_in_chunks(&CsvFormat, &schema(), &[row], 1);
        assert_eq!(String::from_utf8(out).unwrap(), "amount,id,status\n,1,\"a,b\"\n");
    }
}
