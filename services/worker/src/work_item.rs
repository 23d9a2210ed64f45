//! Work items and their Redis Streams wire representation.
//!
//! Every field travels as a string: `sourceId`, `mediaRef`, `durationSeconds`,
//! `attempt` (defaults to `"0"`) and `enqueuedAt` (epoch milliseconds). Fields
//! the worker does not know about are kept verbatim so re-enqueued and
//! dead-lettered copies carry them unchanged.

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

pub const FIELD_SOURCE_ID: &str = "sourceId";
pub const FIELD_MEDIA_REF: &str = "mediaRef";
pub const FIELD_DURATION_SECONDS: &str = "durationSeconds";
pub const FIELD_ATTEMPT: &str = "attempt";
pub const FIELD_ENQUEUED_AT: &str = "enqueuedAt";

/// Errors raised when an entry cannot be decoded into a [`WorkItem`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ItemError {
    #[error("missing field {0}")]
    MissingField(&'static str),

    #[error("invalid value for {field}: {value:?}")]
    InvalidField { field: &'static str, value: String },
}

/// One unit of work read from the stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    /// Originating camera or stream
    pub source_id: String,
    /// Fetchable media reference (HLS URL)
    pub media_ref: String,
    /// Seconds of media to sample
    pub duration_seconds: u32,
    /// Retries performed so far
    pub attempt: u32,
    /// Producer-assigned enqueue time
    pub enqueued_at: DateTime<Utc>,
    /// Producer fields the worker passes through untouched
    #[serde(skip)]
    pub extra: BTreeMap<String, String>,
}

impl WorkItem {
    /// Build a fresh submission at attempt 0
    pub fn new(source_id: impl Into<String>, media_ref: impl Into<String>, duration_seconds: u32) -> Self {
        Self {
            source_id: source_id.into(),
            media_ref: media_ref.into(),
            duration_seconds,
            attempt: 0,
            enqueued_at: Utc::now(),
            extra: BTreeMap::new(),
        }
    }

    /// Decode an item from raw stream fields.
    ///
    /// `entry_id` supplies the enqueue time when the producer omitted it: the
    /// millisecond part of a stream id is the append time.
    pub fn from_fields(fields: &BTreeMap<String, String>, entry_id: &str) -> Result<Self, ItemError> {
        let source_id = required(fields, FIELD_SOURCE_ID)?;
        let media_ref = required(fields, FIELD_MEDIA_REF)?;

        let duration_raw = required(fields, FIELD_DURATION_SECONDS)?;
        let duration_seconds = duration_raw
            .trim()
            .parse::<u32>()
            .ok()
            .filter(|d| *d > 0)
            .ok_or_else(|| ItemError::InvalidField {
                field: FIELD_DURATION_SECONDS,
                value: duration_raw.clone(),
            })?;

        let attempt = match fields.get(FIELD_ATTEMPT).map(|a| a.trim()) {
            None | Some("") => 0,
            Some(raw) => raw.parse::<u32>().map_err(|_| ItemError::InvalidField {
                field: FIELD_ATTEMPT,
                value: raw.to_string(),
            })?,
        };

        let enqueued_at = fields
            .get(FIELD_ENQUEUED_AT)
            .and_then(|raw| parse_millis(raw))
            .or_else(|| entry_id.split('-').next().and_then(parse_millis))
            .unwrap_or_else(Utc::now);

        let extra = fields
            .iter()
            .filter(|(k, _)| !is_schema_field(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(Self {
            source_id,
            media_ref,
            duration_seconds,
            attempt,
            enqueued_at,
            extra,
        })
    }

    /// Encode the item back into stream fields, schema fields first
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            (FIELD_SOURCE_ID.to_string(), self.source_id.clone()),
            (FIELD_MEDIA_REF.to_string(), self.media_ref.clone()),
            (FIELD_DURATION_SECONDS.to_string(), self.duration_seconds.to_string()),
            (FIELD_ATTEMPT.to_string(), self.attempt.to_string()),
            (
                FIELD_ENQUEUED_AT.to_string(),
                self.enqueued_at.timestamp_millis().to_string(),
            ),
        ];
        fields.extend(self.extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        fields
    }

    /// Copy of this item for the next retry
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }
}

/// How a claimed entry reached this consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimSource {
    /// Read as a new entry
    Fresh,
    /// Taken over after sitting unacknowledged past the visibility timeout
    Reclaimed,
}

/// A stream entry owned by this consumer until acknowledged or reclaimed
#[derive(Debug, Clone)]
pub struct ClaimedEntry {
    /// Log-assigned id, unique and ordered within the stream
    pub entry_id: String,
    /// Consumer currently holding the claim
    pub consumer_id: String,
    /// When this consumer claimed it
    pub claimed_at: DateTime<Utc>,
    /// How the claim happened
    pub source: ClaimSource,
    /// Raw wire fields
    pub fields: BTreeMap<String, String>,
}

impl ClaimedEntry {
    /// Decode the work item carried by this entry
    pub fn work_item(&self) -> Result<WorkItem, ItemError> {
        WorkItem::from_fields(&self.fields, &self.entry_id)
    }
}

fn required(fields: &BTreeMap<String, String>, field: &'static str) -> Result<String, ItemError> {
    match fields.get(field) {
        Some(value) if !value.trim().is_empty() => Ok(value.clone()),
        _ => Err(ItemError::MissingField(field)),
    }
}

fn parse_millis(raw: &str) -> Option<DateTime<Utc>> {
    let millis = raw.trim().parse::<i64>().ok()?;
    Utc.timestamp_millis_opt(millis).single()
}

fn is_schema_field(name: &str) -> bool {
    matches!(
        name,
        FIELD_SOURCE_ID | FIELD_MEDIA_REF | FIELD_DURATION_SECONDS | FIELD_ATTEMPT | FIELD_ENQUEUED_AT
    )
}
