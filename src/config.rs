//! Configuration: a YAML or JSON file, overridden by command line flags.

use chrono::{DateTime, NaiveDate, Utc};
use clap::Parser;
use serde::Deserialize;
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

use crate::application::integrity::{DEFAULT_PART_SIZE, MIN_PART_SIZE};
use crate::application::retry::RetryPolicy;
use crate::application::uploader::DEFAULT_MAX_REUPLOADS;
use crate::compression::compressor_for;
use crate::domain::chunk_buffer::{DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};
use crate::domain::entities::OutputDuration;
use crate::domain::errors::{ArchiveError, Result};
use crate::domain::path_template::DEFAULT_PATH_TEMPLATE;
use crate::format::{format_for, FormatOptions};

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub source: SourceConfig,
    pub output: OutputConfig,
    pub destination: DestinationConfig,
    pub retry: RetryConfig,
    pub cache: CacheConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub dbname: String,
    pub schema: String,
    /// Per-statement timeout; `0` disables it.
    pub statement_timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: None,
            dbname: "postgres".to_string(),
            schema: "public".to_string(),
            statement_timeout_secs: 0,
            connect_timeout_secs: 10,
        }
    }
}

impl DatabaseConfig {
    /// Password from the config, falling back to `PGPASSWORD`.
    pub fn resolved_password(&self) -> Option<String> {
        self.password
            .clone()
            .or_else(|| std::env::var("PGPASSWORD").ok())
    }

    /// Client settings for the `postgres` driver.
    pub fn pg_config(&self) -> postgres::Config {
        let mut pg = postgres::Config::new();
        pg.host(&self.host)
            .port(self.port)
            .user(&self.user)
            .dbname(&self.dbname)
            .application_name("pg-archiver");
        if self.connect_timeout_secs > 0 {
            pg.connect_timeout(Duration::from_secs(self.connect_timeout_secs));
        }
        if let Some(pw) = self.resolved_password() {
            pg.password(pw);
        }
        pg
    }

    /// Connection target without credentials, for logs.
    pub fn redacted(&self) -> String {
        format!(
            "postgres://{}@{}:{}/{}",
            self.user, self.host, self.port, self.dbname
        )
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct SourceConfig {
    pub table: String,
    /// Needed only for non-partitioned tables.
    pub date_column: Option<String>,
    /// `YYYY-MM-DD` or RFC 3339. Inclusive.
    pub start_date: Option<String>,
    /// `YYYY-MM-DD` or RFC 3339. Exclusive.
    pub end_date: Option<String>,
    pub duration: Option<String>,
}

impl SourceConfig {
    pub fn start(&self) -> Result<Option<DateTime<Utc>>> {
        self.start_date.as_deref().map(parse_date_arg).transpose()
    }

    pub fn end(&self) -> Result<Option<DateTime<Utc>>> {
        self.end_date.as_deref().map(parse_date_arg).transpose()
    }

    pub fn output_duration(&self) -> Result<OutputDuration> {
        match self.duration.as_deref() {
            None => Ok(OutputDuration::Daily),
            Some(d) => OutputDuration::parse(d).ok_or_else(|| {
                ArchiveError::ConfigError(format!(
                    "Unknown duration '{}' (expected hourly, daily, weekly, monthly or yearly)",
                    d
                ))
            }),
        }
    }
}

/// Parses `YYYY-MM-DD` (midnight UTC) or an RFC 3339 timestamp.
pub fn parse_date_arg(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|n| n.and_utc())
        .ok_or_else(|| ArchiveError::ConfigError(format!("Invalid date '{}'", raw)))
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct OutputConfig {
    pub format: String,
    pub compression: String,
    pub compression_level: Option<i32>,
    /// Encoder threads per stream (zstd only). 0 keeps encoding on the
    /// partition worker.
    pub compression_workers: u32,
    pub chunk_size: usize,
    pub workers: usize,
    pub temp_dir: Option<PathBuf>,
    pub path_template: String,
    pub part_size_mb: u64,
    pub max_reuploads: u32,
    /// Discover and count only; nothing is extracted or uploaded.
    pub dry_run: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: "jsonl".to_string(),
            compression: "zstd".to_string(),
            compression_level: None,
            compression_workers: 0,
            chunk_size: DEFAULT_CHUNK_SIZE,
            workers: 4,
            temp_dir: None,
            path_template: DEFAULT_PATH_TEMPLATE.to_string(),
            part_size_mb: DEFAULT_PART_SIZE / (1024 * 1024),
            max_reuploads: DEFAULT_MAX_REUPLOADS,
            dry_run: false,
        }
    }
}

impl OutputConfig {
    pub fn part_size(&self) -> u64 {
        self.part_size_mb * 1024 * 1024
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    /// Configured level, or the algorithm default when unset.
    pub fn resolved_compression_level(&self) -> i32 {
        self.compression_level.unwrap_or_else(|| {
            compressor_for(&self.compression, 0)
                .map(|c| c.default_level())
                .unwrap_or(0)
        })
    }

    pub fn format_options(&self) -> FormatOptions {
        FormatOptions {
            compression: self.compression.clone(),
            compression_level: self.resolved_compression_level(),
            row_group_size: self.chunk_size,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct DestinationConfig {
    pub bucket: String,
    pub prefix: String,
    pub region: Option<String>,
    /// Custom endpoint for S3-compatible stores (MinIO, R2, ...).
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub allow_http: bool,
}

impl DestinationConfig {
    /// `s3://bucket/prefix`; also the cache namespace key.
    pub fn uri(&self) -> String {
        let prefix = self.prefix.trim_matches('/');
        if prefix.is_empty() {
            format!("s3://{}", self.bucket)
        } else {
            format!("s3://{}/{}", self.bucket, prefix)
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            initial_delay_ms: policy.initial_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            multiplier: policy.multiplier,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.multiplier,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    pub dir: PathBuf,
    pub row_count_ttl_hours: i64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".pg-archiver-cache"),
            row_count_ttl_hours: crate::application::cache::DEFAULT_ROW_COUNT_TTL_HOURS,
        }
    }
}

#[derive(Parser, Debug, Default)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Path to configuration file (YAML or JSON)
    #[arg(short, long)]
    pub config: Option<String>,

    #[arg(long)]
    pub host: Option<String>,
    #[arg(long)]
    pub port: Option<u16>,
    #[arg(long)]
    pub user: Option<String>,
    #[arg(long)]
    pub dbname: Option<String>,
    #[arg(long)]
    pub schema: Option<String>,

    /// Base table to archive
    #[arg(short, long)]
    pub table: Option<String>,
    #[arg(long)]
    pub date_column: Option<String>,
    #[arg(long)]
    pub start_date: Option<String>,
    #[arg(long)]
    pub end_date: Option<String>,
    /// hourly, daily, weekly, monthly or yearly
    #[arg(long)]
    pub duration: Option<String>,

    /// jsonl, csv or parquet
    #[arg(short, long)]
    pub format: Option<String>,
    /// zstd, lz4, gzip or none
    #[arg(long)]
    pub compression: Option<String>,
    #[arg(long)]
    pub compression_level: Option<i32>,
    /// Encoder threads per stream (zstd only)
    #[arg(long)]
    pub compression_workers: Option<u32>,
    #[arg(long)]
    pub chunk_size: Option<usize>,
    #[arg(short, long)]
    pub workers: Option<usize>,
    #[arg(long)]
    pub temp_dir: Option<PathBuf>,

    #[arg(long)]
    pub bucket: Option<String>,
    #[arg(long)]
    pub prefix: Option<String>,
    #[arg(long)]
    pub region: Option<String>,
    #[arg(long)]
    pub endpoint: Option<String>,

    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Discover and count rows without extracting or uploading
    #[arg(long)]
    pub dry_run: bool,
}

impl AppConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ArchiveError::ConfigError(format!("Cannot open {}: {}", path, e)))?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;

        let config: AppConfig = if path.ends_with(".json") {
            serde_json::from_str(&contents)
                .map_err(|e| ArchiveError::ConfigError(format!("{}: {}", path, e)))?
        } else {
            serde_yaml::from_str(&contents)
                .map_err(|e| ArchiveError::ConfigError(format!("{}: {}", path, e)))?
        };

        Ok(config)
    }

    pub fn merge_cli(&mut self, args: &CliArgs) {
        if let Some(v) = &args.host { self.database.host = v.clone(); }
        if let Some(v) = args.port { self.database.port = v; }
        if let Some(v) = &args.user { self.database.user = v.clone(); }
        if let Some(v) = &args.dbname { self.database.dbname = v.clone(); }
        if let Some(v) = &args.schema { self.database.schema = v.clone(); }

        if let Some(v) = &args.table { self.source.table = v.clone(); }
        if let Some(v) = &args.date_column { self.source.date_column = Some(v.clone()); }
        if let Some(v) = &args.start_date { self.source.start_date = Some(v.clone()); }
        if let Some(v) = &args.end_date { self.source.end_date = Some(v.clone()); }
        if let Some(v) = &args.duration { self.source.duration = Some(v.clone()); }

        if let Some(v) = &args.format { self.output.format = v.clone(); }
        if let Some(v) = &args.compression { self.output.compression = v.clone(); }
        if let Some(v) = args.compression_level { self.output.compression_level = Some(v); }
        if let Some(v) = args.compression_workers { self.output.compression_workers = v; }
        if let Some(v) = args.chunk_size { self.output.chunk_size = v; }
        if let Some(v) = args.workers { self.output.workers = v; }
        if let Some(v) = &args.temp_dir { self.output.temp_dir = Some(v.clone()); }
        if args.dry_run { self.output.dry_run = true; }

        if let Some(v) = &args.bucket { self.destination.bucket = v.clone(); }
        if let Some(v) = &args.prefix { self.destination.prefix = v.clone(); }
        if let Some(v) = &args.region { self.destination.region = Some(v.clone()); }
        if let Some(v) = &args.endpoint { self.destination.endpoint = Some(v.clone()); }

        if let Some(v) = &args.cache_dir { self.cache.dir = v.clone(); }
    }

    pub fn validate(&self) -> Result<()> {
        let err = |msg: String| Err(ArchiveError::ConfigError(msg));

        if self.source.table.trim().is_empty() {
            return err("source.table is required".to_string());
        }
        if self.destination.bucket.trim().is_empty() {
            return err("destination.bucket is required".to_string());
        }
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&self.output.chunk_size) {
            return err(format!(
                "output.chunk_size must be between {} and {} (got {})",
                MIN_CHUNK_SIZE, MAX_CHUNK_SIZE, self.output.chunk_size
            ));
        }
        if self.output.workers == 0 {
            return err("output.workers must be at least 1".to_string());
        }
        if self.output.part_size() < MIN_PART_SIZE {
            return err(format!(
                "output.part_size_mb must be at least {}",
                MIN_PART_SIZE / (1024 * 1024)
            ));
        }
        compressor_for(&self.output.compression, 0)?;
        format_for(&self.output.format, &self.output.format_options())?;

        if self.retry.max_attempts == 0 {
            return err("retry.max_attempts must be at least 1".to_string());
        }
        if self.retry.multiplier < 1.0 {
            return err("retry.multiplier must be >= 1.0".to_string());
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return err("retry.initial_delay_ms must not exceed retry.max_delay_ms".to_string());
        }
        if self.cache.row_count_ttl_hours < 0 {
            return err("cache.row_count_ttl_hours must not be negative".to_string());
        }

        self.source.output_duration()?;
        let (start, end) = (self.source.start()?, self.source.end()?);
        if let (Some(s), Some(e)) = (start, end) {
            if s >= e {
                return err(format!("start_date {} must be before end_date {}", s, e));
            }
        }
        if self.source.date_column.is_some() && (start.is_none() || end.is_none()) {
            return err("date_column requires both start_date and end_date".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn valid() -> AppConfig {
        let mut c = AppConfig::default();
        c.source.table = "events".into();
        c.destination.bucket = "archive".into();
        c
    }

    #[test]
    fn test_load_yaml_config() {
        let yaml = r#"
database:
  host: "db.internal"
  user: "archiver"
  dbname: "app"
source:
  table: "events"
  duration: "monthly"
output:
  format: "parquet"
  compression: "gzip"
  workers: 8
destination:
  bucket: "cold"
  prefix: "pg/"
retry:
  max_attempts: 5
"#;
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        write!(file, "{}", yaml).unwrap();
        let path = file.path().to_str().unwrap();

        let config = AppConfig::from_file(path).expect("Failed to parse config");

        assert_eq!(config.database.host, "db.internal");
        assert_eq!(config.database.port, 5432);
        assert_eq!(config.output.workers, 8);
        assert_eq!(config.output.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.multiplier, 2.0);
        assert_eq!(config.destination.uri(), "s3://cold/pg");
        assert_eq!(config.source.output_duration().unwrap(), OutputDuration::Monthly);
        config.validate().unwrap();
    }

    #[test]
    fn test_load_json_config() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"source": {{"table": "t"}}, "destination": {{"bucket": "b"}}}}"#).unwrap();
        let config = AppConfig::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.source.table, "t");
        assert_eq!(config.output.format, "jsonl");
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut config = valid();
        let args = CliArgs {
            table: Some("orders".into()),
            workers: Some(2),
            dry_run: true,
            ..Default::default()
        };
        config.merge_cli(&args);
        assert_eq!(config.source.table, "orders");
        assert_eq!(config.output.workers, 2);
        assert!(config.output.dry_run);
        assert_eq!(config.output.format, "jsonl");
    }

    #[test]
    fn test_compression_workers_independent_of_workers() {
        let mut config = valid();
        assert_eq!(config.output.compression_workers, 0);

        config.merge_cli(&CliArgs { workers: Some(16), ..Default::default() });
        assert_eq!(config.output.workers, 16);
        assert_eq!(config.output.compression_workers, 0);

        config.merge_cli(&CliArgs { compression_workers: Some(3), ..Default::default() });
        assert_eq!(config.output.workers, 16);
        assert_eq!(config.output.compression_workers, 3);
    }

    #[test]
    fn test_validation_rules() {
        valid().validate().unwrap();

        let mut c = valid();
        c.output.chunk_size = 50;
        assert!(matches!(c.validate(), Err(ArchiveError::ConfigError(_))));

        let mut c = valid();
        c.output.part_size_mb = 4;
        assert!(c.validate().is_err());

        let mut c = valid();
        c.output.format = "xml".into();
        assert!(c.validate().is_err());

        let mut c = valid();
        c.output.compression = "brotli".into();
        assert!(c.validate().is_err());

        let mut c = valid();
        c.source.date_column = Some("created_at".into());
        c.source.start_date = Some("2024-01-01".into());
        assert!(c.validate().is_err());
        c.source.end_date = Some("2024-02-01".into());
        c.validate().unwrap();

        let mut c = valid();
        c.source.start_date = Some("2024-02-01".into());
        c.source.end_date = Some("2024-01-01".into());
        assert!(c.validate().is_err());

        let mut c = valid();
        c.retry.max_attempts = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_parse_date_arg() {
        assert_eq!(
            parse_date_arg("2024-03-01").unwrap().to_rfc3339(),
            "2024-03-01T00:00:00+00:00"
        );
        assert_eq!(
            parse_date_arg("2024-03-01T12:00:00+02:00").unwrap().to_rfc3339(),
            "2024-03-01T10:00:00+00:00"
        );
        assert!(parse_date_arg("yesterday").is_err());
    }
}
