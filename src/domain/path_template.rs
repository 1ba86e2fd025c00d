//! Destination key rendering.
//!
//! Placeholders `{table}`, `{YYYY}`, `{MM}`, `{DD}` and `{HH}` are resolved
//! from the partition's coverage start.

use crate::domain::entities::{OutputDuration, PartitionInfo};

pub const DEFAULT_PATH_TEMPLATE: &str = "{table}/{YYYY}/{MM}";

/// Expands the template placeholders for one partition.
pub fn render_template(template: &str, partition: &PartitionInfo) -> String {
    let start = partition.coverage_start;
    template
        .replace("{table}", &partition.base_table)
        .replace("{YYYY}", &start.format("%Y").to_string())
        .replace("{MM}", &start.format("%m").to_string())
        .replace("{DD}", &start.format("%d").to_string())
        .replace("{HH}", &start.format("%H").to_string())
}

/// The date stamp used in file names, at the granularity of the output duration.
pub fn date_stamp(partition: &PartitionInfo, duration: OutputDuration) -> String {
    let fmt = match duration {
        OutputDuration::Hourly => "%Y-%m-%d-%H",
        OutputDuration::Daily | OutputDuration::Weekly => "%Y-%m-%d",
        OutputDuration::Monthly => "%Y-%m",
        OutputDuration::Yearly => "%Y",
    };
    partition.coverage_start.format(fmt).to_string()
}

/// Builds the full object key: `<prefix>/<template>/<table>-<stamp>.<ext>`.
pub fn object_key(
    prefix: &str,
    template: &str,
    partition: &PartitionInfo,
    duration: OutputDuration,
    extension: &str,
) -> String {
    let dir = render_template(template, partition);
    let file = format!(
        "{}-{}.{}",
        partition.base_table,
        date_stamp(partition, duration),
        extension
    );

    [prefix.trim_matches('/'), dir.trim_matches('/'), file.as_str()]
        .iter()
        .filter(|s| !s.is_empty())
        .cloned()
        .collect::<Vec<&str>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn partition() -> PartitionInfo {
        PartitionInfo::physical(
            "events_2024_03_07",
            "events",
            Utc.with_ymd_and_hms(2024, 3, 7, 5, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 8, 0, 0, 0).unwrap(),
        )
    }

    #[test]
    fn test_render_template() {
        assert_eq!(
            render_template("{table}/{YYYY}/{MM}/{DD}/{HH}", &partition()),
            "events/2024/03/07/05"
        );
    }

    #[test]
    fn test_object_key() {
        let key = object_key(
            "/archive/",
            DEFAULT_PATH_TEMPLATE,
            &partition(),
            OutputDuration::Daily,
            "jsonl.zst",
        );
        assert_eq!(key, "archive/events/2024/03/events-2024-03-07.jsonl.zst");

        let key = object_key("", "", &partition(), OutputDuration::Monthly, "parquet");
        assert_eq!(key, "events-2024-03.parquet");
    }
}
