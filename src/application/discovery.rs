// Copyright 2026 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # Partition Discovery
//!
//! Turns a base table into the list of units the archiver works on.
//!
//! 1. **Partitioned tables**: the inheritance tree is walked to any depth and
//!    only the leaves are kept. Intermediate partitioned tables hold no rows.
//! 2. **Plain tables**: contiguous time windows are synthesized over a date
//!    column, aligned to the output duration.
//!
//! The coverage of a leaf comes from its declarative bound when it has one,
//! otherwise from a date suffix in its name.

use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use log::{debug, info, warn};
use regex::Regex;
use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

use crate::domain::entities::{OutputDuration, PartitionInfo};
use crate::domain::errors::{ArchiveError, Result};
use crate::ports::catalog_port::{CatalogPort, ChildTable};

/// What to discover.
#[derive(Debug, Clone)]
pub struct DiscoveryRequest {
    pub table: String,
    /// Required for non-partitioned tables.
    pub date_column: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub duration: OutputDuration,
}

pub struct PartitionDiscoverer {
    catalog: Arc<dyn CatalogPort>,
}

impl PartitionDiscoverer {
    pub fn new(catalog: Arc<dyn CatalogPort>) -> Self {
        Self { catalog }
    }

    /// Lists partitions sorted by coverage start, then name.
    pub fn discover(&self, request: &DiscoveryRequest) -> Result<Vec<PartitionInfo>> {
        if !self.catalog.table_exists(&request.table)? {
            return Err(ArchiveError::ConfigError(format!(
                "Table '{}' does not exist",
                request.table
            )));
        }

        let children = self.catalog.child_tables(&request.table)?;
        let mut partitions = if children.is_empty() {
            self.synthesize_windows(request)?
        } else {
            self.leaf_partitions(&request.table, children)?
                .into_iter()
                .filter(|p| p.overlaps(request.start, request.end))
                .collect()
        };

        partitions.sort_by(|a, b| {
            a.coverage_start
                .cmp(&b.coverage_start)
                .then_with(|| a.table_name.cmp(&b.table_name))
        });
        info!(
            "Discovered {} partition(s) for {}",
            partitions.len(),
            request.table
        );
        Ok(partitions)
    }

    fn leaf_partitions(&self, base: &str, children: Vec<ChildTable>) -> Result<Vec<PartitionInfo>> {
        let mut leaves = Vec::new();
        let mut seen = HashSet::new();
        let mut stack = children;

        while let Some(child) = stack.pop() {
            if !seen.insert(child.name.clone()) {
                continue;
            }
            let grandchildren = self.catalog.child_tables(&child.name)?;
            if !grandchildren.is_empty() {
                stack.extend(grandchildren);
                continue;
            }
            if child.is_partitioned {
                debug!("Skipping empty partitioned table {}", child.name);
                continue;
            }

            let coverage = child
                .bound_expr
                .as_deref()
                .and_then(parse_bound_expr)
                .or_else(|| coverage_from_name(&child.name));
            match coverage {
                Some((start, end)) => {
                    leaves.push(PartitionInfo::physical(&child.name, base, start, end))
                }
                None => warn!(
                    "Cannot determine the date range of partition {}; skipping it",
                    child.name
                ),
            }
        }
        Ok(leaves)
    }

    fn synthesize_windows(&self, request: &DiscoveryRequest) -> Result<Vec<PartitionInfo>> {
        let (Some(column), Some(start), Some(end)) =
            (&request.date_column, request.start, request.end)
        else {
            return Err(ArchiveError::ConfigError(format!(
                "Table '{}' is not partitioned; date_column, start_date and end_date are required",
                request.table
            )));
        };

        let schema = self.catalog.column_schema(&request.table)?;
        if !schema.contains(column) {
            return Err(ArchiveError::ConfigError(format!(
                "Column '{}' does not exist in table '{}'",
                column, request.table
            )));
        }

        Ok(time_windows(start, end, request.duration)
            .into_iter()
            .map(|(s, e)| PartitionInfo::window(&request.table, column, s, e))
            .collect())
    }
}

/// Start of the window containing `ts`.
pub fn align_down(ts: DateTime<Utc>, duration: OutputDuration) -> DateTime<Utc> {
    let date = ts.date_naive();
    let naive = match duration {
        OutputDuration::Hourly => date.and_hms_opt(ts.hour(), 0, 0),
        OutputDuration::Daily => date.and_hms_opt(0, 0, 0),
        OutputDuration::Weekly => {
            let monday = date - Duration::days(date.weekday().num_days_from_monday() as i64);
            monday.and_hms_opt(0, 0, 0)
        }
        OutputDuration::Monthly => date.with_day(1).and_then(|d| d.and_hms_opt(0, 0, 0)),
        OutputDuration::Yearly => {
            NaiveDate::from_ymd_opt(date.year(), 1, 1).and_then(|d| d.and_hms_opt(0, 0, 0))
        }
    };
    naive.map(|n| Utc.from_utc_datetime(&n)).unwrap_or(ts)
}

/// Start of the window after the one starting at `ts`.
pub fn next_boundary(ts: DateTime<Utc>, duration: OutputDuration) -> Option<DateTime<Utc>> {
    match duration {
        OutputDuration::Hourly => ts.checked_add_signed(Duration::hours(1)),
        OutputDuration::Daily => ts.checked_add_signed(Duration::days(1)),
        OutputDuration::Weekly => ts.checked_add_signed(Duration::weeks(1)),
        OutputDuration::Monthly => ts.checked_add_months(Months::new(1)),
        OutputDuration::Yearly => ts.checked_add_months(Months::new(12)),
    }
}

/// Contiguous aligned windows covering `[start, end)`.
pub fn time_windows(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    duration: OutputDuration,
) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    let mut windows = Vec::new();
    let mut cursor = align_down(start, duration);
    while cursor < end {
        let Some(next) = next_boundary(cursor, duration) else {
            break;
        };
        windows.push((cursor, next));
        cursor = next;
    }
    windows
}

static BOUND_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)FOR VALUES FROM \('([^']+)'\) TO \('([^']+)'\)").expect("valid regex")
});

fn parse_bound_value(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%#z") {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(Utc.from_utc_datetime(&ts));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|n| Utc.from_utc_datetime(&n))
}

/// Coverage from `FOR VALUES FROM ('…') TO ('…')`. `MINVALUE`/`MAXVALUE` bounds yield `None`.
pub fn parse_bound_expr(expr: &str) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let caps = BOUND_RE.captures(expr)?;
    let start = parse_bound_value(caps.get(1)?.as_str())?;
    let end = parse_bound_value(caps.get(2)?.as_str())?;
    (start < end).then_some((start, end))
}

#[derive(Clone, Copy)]
enum SuffixUnit {
    Day,
    Month,
    Year,
}

static SUFFIX_PATTERNS: LazyLock<Vec<(Regex, SuffixUnit)>> = LazyLock::new(|| {
    [
        (r"_(\d{4})_(\d{2})_(\d{2})$", SuffixUnit::Day),
        (r"_p(\d{4})(\d{2})(\d{2})$", SuffixUnit::Day),
        (r"_(\d{4})(\d{2})(\d{2})$", SuffixUnit::Day),
        (r"_(\d{4})_(\d{2})$", SuffixUnit::Month),
        (r"_(\d{4})(\d{2})$", SuffixUnit::Month),
        (r"_(\d{4})$", SuffixUnit::Year),
    ]
    .into_iter()
    .map(|(p, unit)| (Regex::new(p).expect("valid regex"), unit))
    .collect()
});

/// Coverage from a date suffix such as `_2024_01_31`, `_p20240131` or `_2024`.
pub fn coverage_from_name(name: &str) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    for (re, unit) in SUFFIX_PATTERNS.iter() {
        let Some(caps) = re.captures(name) else {
            continue;
        };
        let num = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<u32>().ok());
        let year = num(1)? as i32;
        let (start, duration) = match unit {
            SuffixUnit::Day => (NaiveDate::from_ymd_opt(year, num(2)?, num(3)?)?, OutputDuration::Daily),
            SuffixUnit::Month => (NaiveDate::from_ymd_opt(year, num(2)?, 1)?, OutputDuration::Monthly),
            SuffixUnit::Year => (NaiveDate::from_ymd_opt(year, 1, 1)?, OutputDuration::Yearly),
        };
        let start = Utc.from_utc_datetime(&start.and_hms_opt(0, 0, 0)?);
        return Some((start, next_boundary(start, duration)?));
    }
    None
}
