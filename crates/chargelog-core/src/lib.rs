//! Core domain model and snapshot field extraction for chargelog.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Provider-assigned identifier of a charging station.
pub type StationId = i64;

/// Latest known attributes of a station, as the provider reported them on the last poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Facility {
    pub station_id: StationId,
    pub title: Option<String>,
    pub operator: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub max_power_kw: Option<f64>,
    pub num_points: Option<i64>,
}

/// The compared part of a status history row.
///
/// Two tuples are equal only when every field is equal; `None == None`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatusTuple {
    pub status: Option<String>,
    pub is_operational: Option<bool>,
    pub comment_type_title: Option<String>,
    pub checkin_status_title: Option<String>,
    pub comment_text: Option<String>,
}

/// Persisted status history row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    /// Insertion sequence. The authoritative order for "latest".
    pub id: i64,
    pub station_id: StationId,
    #[serde(flatten)]
    pub tuple: StatusTuple,
    pub recorded_at: DateTime<Utc>,
    pub raw_json: JsonValue,
}

/// Persisted, deduplicated comment row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentEvent {
    pub id: i64,
    pub station_id: StationId,
    pub comment_id: String,
    pub comment_type_title: Option<String>,
    pub checkin_status_title: Option<String>,
    pub comment_text: Option<String>,
    pub comment_date: Option<String>,
    pub recorded_at: DateTime<Utc>,
    pub raw_json: JsonValue,
}

/// Fields pulled out of one `UserComments` entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedComment {
    pub comment_id: Option<String>,
    pub comment_type_title: Option<String>,
    pub checkin_status_title: Option<String>,
    pub comment_text: Option<String>,
    pub comment_date: Option<String>,
    pub raw: JsonValue,
}

/// Result of looking up the station identifier of a snapshot record.
#[derive(Debug, Clone, PartialEq)]
pub enum StationIdLookup {
    Found(StationId),
    Missing,
    /// Present but neither an integer nor a numeric string.
    Unusable(JsonValue),
}

/// Walk `path` through nested objects.
///
/// Returns `None` as soon as a segment is absent, `null`, or the current value is not an object.
pub fn lookup<'a>(record: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = record;
    for segment in path {
        cur = cur.as_object()?.get(*segment)?;
    }
    if cur.is_null() {
        None
    } else {
        Some(cur)
    }
}

pub fn lookup_str<'a>(record: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    lookup(record, path)?.as_str()
}

pub fn lookup_f64(record: &JsonValue, path: &[&str]) -> Option<f64> {
    lookup(record, path)?.as_f64()
}

pub fn lookup_i64(record: &JsonValue, path: &[&str]) -> Option<i64> {
    lookup(record, path)?.as_i64()
}

pub fn lookup_bool(record: &JsonValue, path: &[&str]) -> Option<bool> {
    lookup(record, path)?.as_bool()
}

/// Array at `path`, or an empty slice when absent or not an array.
pub fn lookup_array<'a>(record: &'a JsonValue, path: &[&str]) -> &'a [JsonValue] {
    lookup(record, path)
        .and_then(JsonValue::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn owned_non_empty(value: Option<&str>) -> Option<String> {
    value.filter(|s| !s.is_empty()).map(ToString::to_string)
}

/// Integer value of a JSON number, accepting integral floats such as `42.0`.
fn integral(n: &serde_json::Number) -> Option<i64> {
    if let Some(i) = n.as_i64() {
        return Some(i);
    }
    let f = n.as_f64()?;
    let in_range = f >= i64::MIN as f64 && f < i64::MAX as f64;
    (f.fract() == 0.0 && in_range).then_some(f as i64)
}

pub fn station_id(record: &JsonValue) -> StationIdLookup {
    match lookup(record, &["ID"]) {
        None => StationIdLookup::Missing,
        Some(value) => match value {
            JsonValue::Number(n) => integral(n)
                .map(StationIdLookup::Found)
                .unwrap_or_else(|| StationIdLookup::Unusable(value.clone())),
            JsonValue::String(s) => s
                .trim()
                .parse()
                .map(StationIdLookup::Found)
                .unwrap_or_else(|_| StationIdLookup::Unusable(value.clone())),
            other => StationIdLookup::Unusable(other.clone()),
        },
    }
}

/// Highest non-zero `PowerKW` across `Connections`.
pub fn max_power_kw(record: &JsonValue) -> Option<f64> {
    lookup_array(record, &["Connections"])
        .iter()
        .filter_map(|conn| lookup_f64(conn, &["PowerKW"]))
        .filter(|kw| *kw != 0.0)
        .fold(None, |best: Option<f64>, kw| {
            Some(best.map_or(kw, |b| b.max(kw)))
        })
}

pub fn extract_facility(station_id: StationId, record: &JsonValue) -> Facility {
    Facility {
        station_id,
        title: lookup_str(record, &["AddressInfo", "Title"]).map(ToString::to_string),
        operator: lookup_str(record, &["OperatorInfo", "Title"]).map(ToString::to_string),
        lat: lookup_f64(record, &["AddressInfo", "Latitude"]),
        lon: lookup_f64(record, &["AddressInfo", "Longitude"]),
        max_power_kw: max_power_kw(record),
        num_points: lookup_i64(record, &["NumberOfPoints"]),
    }
}

/// Raw `UserComments` entries of a snapshot record.
pub fn comment_records(record: &JsonValue) -> &[JsonValue] {
    lookup_array(record, &["UserComments"])
}

/// External id of a comment. Integral numbers render in plain decimal, so `99`,
/// `99.0` and `"99"` share one dedup key.
fn comment_id(raw: &JsonValue) -> Option<String> {
    match lookup(raw, &["ID"])? {
        JsonValue::Number(n) => Some(integral(n).map_or_else(|| n.to_string(), |i| i.to_string())),
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}

/// Extract one comment sub-record. Returns `None` when it is not an object.
pub fn extract_comment(raw: &JsonValue) -> Option<ExtractedComment> {
    if !raw.is_object() {
        return None;
    }
    Some(ExtractedComment {
        comment_id: comment_id(raw),
        comment_type_title: lookup_str(raw, &["CommentType", "Title"]).map(ToString::to_string),
        checkin_status_title: lookup_str(raw, &["CheckinStatusType", "Title"])
            .map(ToString::to_string),
        comment_text: lookup_str(raw, &["Comment"]).map(ToString::to_string),
        comment_date: lookup_str(raw, &["DateCreated"]).map(ToString::to_string),
        raw: raw.clone(),
    })
}

/// Denormalized comment fields carried on a status row.
///
/// Each field independently takes the first non-empty value found in comment order.
pub fn summarize_comments<'a, I>(comments: I) -> (Option<String>, Option<String>, Option<String>)
where
    I: IntoIterator<Item = &'a ExtractedComment>,
{
    let mut comment_type = None;
    let mut checkin_status = None;
    let mut text = None;
    for comment in comments {
        if comment_type.is_none() {
            comment_type = owned_non_empty(comment.comment_type_title.as_deref());
        }
        if checkin_status.is_none() {
            checkin_status = owned_non_empty(comment.checkin_status_title.as_deref());
        }
        if text.is_none() {
            text = owned_non_empty(comment.comment_text.as_deref());
        }
        if comment_type.is_some() && checkin_status.is_some() && text.is_some() {
            break;
        }
    }
    (comment_type, checkin_status, text)
}

pub fn derive_status_tuple<'a, I>(record: &JsonValue, comments: I) -> StatusTuple
where
    I: IntoIterator<Item = &'a ExtractedComment>,
{
    let (comment_type_title, checkin_status_title, comment_text) = summarize_comments(comments);
    StatusTuple {
        status: lookup_str(record, &["StatusType", "Title"]).map(ToString::to_string),
        is_operational: lookup_bool(record, &["StatusType", "IsOperational"]),
        comment_type_title,
        checkin_status_title,
        comment_text,
    }
}
