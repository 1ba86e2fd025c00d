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

//! # Type Mapping Logic
//!
//! This module is the "Translator" between PostgreSQL's declared column types
//! and the two places that care about them:
//! 1. **Value Kind**: which `Value` variant the extractor decodes a column
//!    into. Types we cannot decode natively are cast to `text` in the SELECT.
//! 2. **Arrow Type**: the column type used by the Parquet writer.

use arrow_schema::{DataType, TimeUnit};

use crate::domain::entities::Value;

/// The decoded shape of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Bool,
    Int,
    Float,
    Text,
    Timestamp,
    TimestampTz,
    Date,
    Json,
    Bytes,
    /// Not decodable natively; selected as `col::text`.
    CastToText,
}

/// Maps an `information_schema` data type to the shape we decode it into.
pub fn value_kind(declared_type: &str) -> ValueKind {
    match declared_type.trim().to_lowercase().as_str() {
        "boolean" | "bool" => ValueKind::Bool,
        "smallint" | "integer" | "bigint" | "int2" | "int4" | "int8" => ValueKind::Int,
        "real" | "double precision" | "float4" | "float8" => ValueKind::Float,
        "text" | "character varying" | "character" | "varchar" | "char" | "bpchar" | "name" => {
            ValueKind::Text
        }
        "timestamp without time zone" | "timestamp" => ValueKind::Timestamp,
        "timestamp with time zone" | "timestamptz" => ValueKind::TimestampTz,
        "date" => ValueKind::Date,
        "json" | "jsonb" => ValueKind::Json,
        "bytea" => ValueKind::Bytes,
        _ => ValueKind::CastToText,
    }
}

/// Returns the Arrow DataType for a declared column type, if it is known.
///
/// `None` means the Parquet writer has to infer the type from the data.
pub fn map_declared_to_arrow(declared_type: &str) -> Option<DataType> {
    if declared_type.trim().is_empty() {
        return None;
    }
    let dt = match value_kind(declared_type) {
        ValueKind::Bool => DataType::Boolean,
        ValueKind::Int => DataType::Int64,
        ValueKind::Float => DataType::Float64,
        ValueKind::Timestamp | ValueKind::TimestampTz => {
            DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()))
        }
        ValueKind::Date => DataType::Date32,
        ValueKind::Bytes => DataType::Binary,
        ValueKind::Text | ValueKind::Json | ValueKind::CastToText => DataType::Utf8,
    };
    Some(dt)
}

/// Infers an Arrow type from an observed value. `Null` yields `None`.
pub fn infer_arrow_from_value(value: &Value) -> Option<DataType> {
    match value {
        Value::Null => None,
        Value::Bool(_) => Some(DataType::Boolean),
        Value::Int(_) => Some(DataType::Int64),
        Value::Float(_) => Some(DataType::Float64),
        Value::Timestamp(_) => Some(DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()))),
        Value::Date(_) => Some(DataType::Date32),
        Value::Bytes(_) => Some(DataType::Binary),
        Value::Text(_) | Value::Json(_) => Some(DataType::Utf8),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_kind() {
        assert_eq!(value_kind("integer"), ValueKind::Int);
        assert_eq!(value_kind("Timestamp With Time Zone"), ValueKind::TimestampTz);
        assert_eq!(value_kind("jsonb"), ValueKind::Json);
        assert_eq!(value_kind("numeric"), ValueKind::CastToText);
        assert_eq!(value_kind("uuid"), ValueKind::CastToText);
    }

    #[test]
    fn test_map_declared_to_arrow() {
        assert_eq!(map_declared_to_arrow("bigint"), Some(DataType::Int64));
        assert_eq!(map_declared_to_arrow("numeric"), Some(DataType::Utf8));
        assert_eq!(map_declared_to_arrow(""), None);
        assert_eq!(
            map_declared_to_arrow("timestamp without time zone"),
            Some(DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())))
        );
    }

    #[test]
    fn test_infer_from_value() {
        assert_eq!(infer_arrow_from_value(&Value::Null), None);
        assert_eq!(infer_arrow_from_value(&Value::Float(1.5)), Some(DataType::Float64));
    }
}
