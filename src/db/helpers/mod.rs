use std::convert::TryFrom;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

use crate::models::RecordKind;

pub fn to_u32(value: i64, field: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| anyhow!("{field} holds out-of-range value {value}"))
}

pub fn format_datetime(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn parse_datetime(value: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("failed to parse {field}"))
}

pub fn parse_kind(value: &str) -> Result<RecordKind> {
    RecordKind::parse(value).ok_or_else(|| anyhow!("unknown record kind {value}"))
}

pub fn parse_key(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).with_context(|| format!("invalid idempotency key {value}"))
}
