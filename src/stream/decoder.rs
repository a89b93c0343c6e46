//! Frame decoding and record normalization.
//!
//! Upstream producers disagree on where a metric lives: nested under `metrics`, flattened at the top level,
//! or under an old misspelled key. Every metric is resolved through an ordered list of [`FieldSource`]s and
//! the first usable value wins.

use crate::error::AppError;
use crate::stream::record::{AlertEvent, Metric, TelemetryRecord};
use crate::stream::transport::Frame;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use std::iter;

const HANDSHAKE_TYPE: &str = "hello";
const METRICS_KEY: &str = "metrics";
const EPOCH_SECONDS_LIMIT: f64 = 1e11;

/// A payload as handed over by the transport, before any normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedFrame {
    Json(Value),
    /// Text that did not parse as JSON. Forwarded instead of dropped.
    Raw(String),
}

impl DecodedFrame {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            Self::Raw(_) => None,
        }
    }

    pub fn to_text(&self) -> String {
        match self {
            Self::Json(value) => value.to_string(),
            Self::Raw(text) => text.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldSource {
    Nested(&'static str),
    Flat(&'static str),
}

impl FieldSource {
    fn lookup<'a>(self, object: &'a Map<String, Value>) -> Option<&'a Value> {
        match self {
            Self::Nested(key) => object
                .get(METRICS_KEY)
                .and_then(Value::as_object)
                .and_then(|metrics| metrics.get(key)),
            Self::Flat(key) => object.get(key),
        }
    }
}

/// Extraction rules for `metric`, most specific first.
pub fn extraction_rules(metric: Metric) -> impl Iterator<Item = FieldSource> {
    let name = metric.as_str();
    iter::once(FieldSource::Nested(name))
        .chain(iter::once(FieldSource::Flat(name)))
        .chain(metric.legacy_aliases().iter().copied().map(FieldSource::Flat))
}

pub fn decode_frame(frame: Frame) -> Option<DecodedFrame> {
    match frame {
        Frame::Text(text) => Some(decode_text(text)),
        Frame::Binary(bytes) => {
            let text = match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(error) => String::from_utf8_lossy(error.as_bytes()).into_owned(),
            };
            Some(decode_text(text))
        }
        Frame::Close => None,
    }
}

pub fn decode_text(text: String) -> DecodedFrame {
    // simd-json parses in place, so the original text is kept for the raw fallback.
    let mut scratch = text.as_bytes().to_vec();
    match parse_json_payload(&mut scratch) {
        Ok(value) => DecodedFrame::Json(value),
        Err(error) => match reparse_without_overflow(&text) {
            Some(value) => DecodedFrame::Json(value),
            None => {
                tracing::debug!(%error, "frame is not valid json, forwarding raw text");
                DecodedFrame::Raw(text)
            }
        },
    }
}

/// Second attempt for frames whose only problem is a number outside the `f64` range.
///
/// Those literals become `null`, so the affected field reads as absent and the rest of the frame
/// survives. Returns `None` when nothing was replaced or the frame is still not valid JSON.
fn reparse_without_overflow(text: &str) -> Option<Value> {
    let repaired = replace_overflowing_numbers(text)?;
    let mut scratch = repaired.into_bytes();
    parse_json_payload(&mut scratch).ok()
}

fn replace_overflowing_numbers(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    let mut repaired = String::with_capacity(text.len());
    let mut replaced = false;
    let mut in_string = false;
    let mut escaped = false;
    let mut copied_to = 0;
    let mut index = 0;

    while index < bytes.len() {
        let byte = bytes[index];
        if in_string {
            match byte {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            index += 1;
            continue;
        }

        match byte {
            b'"' => {
                in_string = true;
                index += 1;
            }
            b'-' | b'0'..=b'9' => {
                let start = index;
                while index < bytes.len()
                    && matches!(bytes[index], b'0'..=b'9' | b'-' | b'+' | b'.' | b'e' | b'E')
                {
                    index += 1;
                }
                let literal = &text[start..index];
                if literal.parse::<f64>().is_ok_and(|number| number.is_infinite()) {
                    repaired.push_str(&text[copied_to..start]);
                    repaired.push_str("null");
                    copied_to = index;
                    replaced = true;
                }
            }
            _ => index += 1,
        }
    }

    if !replaced {
        return None;
    }
    repaired.push_str(&text[copied_to..]);
    Some(repaired)
}

pub fn parse_json_payload(payload: &mut [u8]) -> Result<Value, AppError> {
    let value: Value = simd_json::serde::from_slice(payload)?;
    Ok(value)
}

/// True for a `type: "hello"` control frame that carries no telemetry.
pub fn is_handshake(raw: &Value) -> bool {
    raw.as_object()
        .map(|object| is_handshake_object(object) && !has_telemetry_fields(object))
        .unwrap_or(false)
}

fn is_handshake_object(object: &Map<String, Value>) -> bool {
    object.get("type").and_then(Value::as_str) == Some(HANDSHAKE_TYPE)
}

fn has_telemetry_fields(object: &Map<String, Value>) -> bool {
    if object.contains_key(METRICS_KEY) || object.contains_key("anomaly") {
        return true;
    }
    Metric::ALL.into_iter().any(|metric| {
        extraction_rules(metric).any(|source| {
            source
                .lookup(object)
                .map(|value| !value.is_null())
                .unwrap_or(false)
        })
    })
}

/// Maps one upstream payload onto the canonical record shape.
///
/// Returns `None` for anything that is not a JSON object and for handshake frames. `received_at` is only
/// used when the payload has no usable timestamp of its own.
pub fn normalize(raw: &Value, received_at: DateTime<Utc>) -> Option<TelemetryRecord> {
    let object = raw.as_object()?;
    if is_handshake_object(object) && !has_telemetry_fields(object) {
        return None;
    }

    let anomaly = coerce_flag(object.get("anomaly"));
    let mut record = TelemetryRecord {
        timestamp: resolve_timestamp(object.get("timestamp"), received_at),
        equipment: object.get("equipment").and_then(identifier),
        anomaly,
        anomaly_type: None,
        ..TelemetryRecord::default()
    };

    for metric in Metric::ALL {
        record.set_metric(metric, resolve_metric(object, metric));
    }

    if anomaly {
        record.anomaly_type = object
            .get("anomaly_type")
            .and_then(Value::as_str)
            .map(str::to_string);
    }

    Some(record)
}

fn resolve_metric(object: &Map<String, Value>, metric: Metric) -> Option<f64> {
    extraction_rules(metric).find_map(|source| source.lookup(object).and_then(finite_number))
}

/// Finite numbers pass; numeric strings are parsed; everything else counts as absent.
pub fn finite_number(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    number.is_finite().then_some(number)
}

fn coerce_flag(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::Number(number)) => number.as_f64().map(|n| n != 0.0).unwrap_or(false),
        Some(Value::String(text)) => {
            let text = text.trim();
            text.eq_ignore_ascii_case("true") || text == "1" || text.eq_ignore_ascii_case("yes")
        }
        _ => false,
    }
}

fn identifier(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.trim().is_empty() => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn resolve_timestamp(value: Option<&Value>, received_at: DateTime<Utc>) -> String {
    let upstream = match value {
        Some(Value::String(text)) if !text.trim().is_empty() => Some(text.clone()),
        Some(Value::Number(number)) => number
            .as_f64()
            .and_then(epoch_to_datetime)
            .map(format_timestamp),
        _ => None,
    };
    upstream.unwrap_or_else(|| format_timestamp(received_at))
}

/// Epoch values below 1e11 (early 1973 in milliseconds) are read as seconds, anything larger as
/// milliseconds.
fn epoch_to_datetime(epoch: f64) -> Option<DateTime<Utc>> {
    if !epoch.is_finite() {
        return None;
    }
    let millis = if epoch.abs() < EPOCH_SECONDS_LIMIT {
        epoch * 1_000.0
    } else {
        epoch
    };
    DateTime::<Utc>::from_timestamp_millis(millis.round() as i64)
}

pub fn format_timestamp(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Outcome of decoding one alert-stream payload.
#[derive(Debug, Clone, PartialEq)]
pub enum AlertDecode {
    Alert(AlertEvent),
    Handshake,
    Invalid(String),
}

pub fn normalize_alert(raw: &Value) -> AlertDecode {
    let Some(object) = raw.as_object() else {
        return AlertDecode::Invalid("alert payload is not a json object".to_string());
    };
    if is_handshake_object(object) {
        return AlertDecode::Handshake;
    }

    let prob = ["prob", "anomaly_prob"]
        .into_iter()
        .find_map(|key| object.get(key).and_then(finite_number));
    let Some(prob) = prob else {
        return AlertDecode::Invalid("alert payload has no numeric prob".to_string());
    };
    if !(0.0..=1.0).contains(&prob) {
        return AlertDecode::Invalid(format!("alert prob {prob} is outside [0, 1]"));
    }

    let mut metadata = object.clone();
    for key in ["equipment", "prob", "anomaly_prob"] {
        metadata.remove(key);
    }

    AlertDecode::Alert(AlertEvent {
        equipment: object.get("equipment").and_then(identifier),
        prob,
        metadata,
    })
}
