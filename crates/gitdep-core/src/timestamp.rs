//! RFC 3339 helpers shared by the lock file and the process registry.

use anyhow::{Context, Result};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

pub fn format_rfc3339(value: &OffsetDateTime) -> Result<String> {
    value
        .format(&Rfc3339)
        .with_context(|| format!("failed formatting timestamp {value}"))
}

pub fn parse_rfc3339(raw: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(raw.trim(), &Rfc3339)
        .with_context(|| format!("invalid RFC 3339 timestamp: '{raw}'"))
}
