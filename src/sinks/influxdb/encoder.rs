//! Line-protocol point model and encoder for the two bridge measurements:
//! `<prefix>_telemetry` (raw samples) and `<prefix>_analytics` (KPI and
//! anomaly records).

use std::collections::BTreeMap;

use bytes::{BufMut, BytesMut};
use chrono::{DateTime, Utc};
use snafu::{OptionExt, Snafu};

use crate::event::{AnalyticsRecord, Sample, Value};

#[derive(Debug, Snafu)]
pub enum EncodeError {
    #[snafu(display("Point for measurement {measurement} has no fields"))]
    EmptyFields { measurement: String },
    #[snafu(display("Timestamp out of range for nanosecond precision"))]
    TimestampRange,
}

/// A field value in the Influx line protocol. Integer samples are carried
/// as floats so each telemetry point writes exactly one of the three
/// `value_*` field names.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Bool(bool),
    String(String),
}

/// One write-ready point. Tags and fields are kept sorted: identical
/// records must encode to identical lines so the remote store absorbs
/// at-least-once replays.
#[derive(Clone, Debug, PartialEq)]
pub struct Point {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
    pub timestamp_ns: i64,
}

impl Point {
    /// Appends this point as one line-protocol line.
    pub fn encode(&self, buffer: &mut BytesMut) -> Result<(), EncodeError> {
        if self.fields.is_empty() {
            return Err(EncodeError::EmptyFields {
                measurement: self.measurement.clone(),
            });
        }

        encode_string(&self.measurement, buffer);
        for (key, value) in &self.tags {
            if key.is_empty() || value.is_empty() {
                continue;
            }
            buffer.put_u8(b',');
            encode_string(key, buffer);
            buffer.put_u8(b'=');
            encode_string(value, buffer);
        }

        buffer.put_u8(b' ');
        let mut first = true;
        for (key, value) in &self.fields {
            if !first {
                buffer.put_u8(b',');
            }
            first = false;
            encode_string(key, buffer);
            buffer.put_u8(b'=');
            match value {
                FieldValue::Float(v) => buffer.put_slice(v.to_string().as_bytes()),
                FieldValue::Bool(v) => buffer.put_slice(v.to_string().as_bytes()),
                FieldValue::String(v) => {
                    buffer.put_u8(b'"');
                    for ch in v.chars() {
                        if matches!(ch, '\\' | '"') {
                            buffer.put_u8(b'\\');
                        }
                        let mut utf8 = [0u8; 4];
                        buffer.put_slice(ch.encode_utf8(&mut utf8).as_bytes());
                    }
                    buffer.put_u8(b'"');
                }
            }
        }

        buffer.put_u8(b' ');
        buffer.put_slice(self.timestamp_ns.to_string().as_bytes());
        buffer.put_u8(b'\n');
        Ok(())
    }
}

/// Escapes measurement names, tag keys/values, and field keys.
fn encode_string(value: &str, buffer: &mut BytesMut) {
    for ch in value.chars() {
        if matches!(ch, '\\' | ',' | ' ' | '=') {
            buffer.put_u8(b'\\');
        }
        let mut utf8 = [0u8; 4];
        buffer.put_slice(ch.encode_utf8(&mut utf8).as_bytes());
    }
}

fn encode_timestamp(timestamp: DateTime<Utc>) -> Result<i64, EncodeError> {
    timestamp.timestamp_nanos_opt().context(TimestampRangeSnafu)
}

/// Maps a sample onto `<prefix>_telemetry`: the hierarchy, tag, quality,
/// and optional unit as tags; exactly one `value_*` field picked by the
/// value's runtime type.
pub fn sample_point(prefix: &str, sample: &Sample) -> Result<Point, EncodeError> {
    let mut tags = BTreeMap::new();
    tags.insert("enterprise".to_owned(), sample.hierarchy.enterprise.clone());
    tags.insert("site".to_owned(), sample.hierarchy.site.clone());
    tags.insert("area".to_owned(), sample.hierarchy.area.clone());
    tags.insert("line".to_owned(), sample.hierarchy.line.clone());
    tags.insert("machine".to_owned(), sample.hierarchy.machine.clone());
    tags.insert("tag".to_owned(), sample.tag.clone());
    tags.insert("quality".to_owned(), sample.quality.as_str().to_owned());
    if let Some(unit) = &sample.unit {
        tags.insert("unit".to_owned(), unit.clone());
    }

    let mut fields = BTreeMap::new();
    match &sample.value {
        Value::Float(v) => fields.insert("value_float".to_owned(), FieldValue::Float(*v)),
        Value::Integer(v) => fields.insert("value_float".to_owned(), FieldValue::Float(*v as f64)),
        Value::Bool(v) => fields.insert("value_bool".to_owned(), FieldValue::Bool(*v)),
        Value::String(v) => fields.insert("value_string".to_owned(), FieldValue::String(v.clone())),
    };

    Ok(Point {
        measurement: format!("{prefix}_telemetry"),
        tags,
        fields,
        timestamp_ns: encode_timestamp(sample.timestamp)?,
    })
}

/// Maps an analytics record onto `<prefix>_analytics`, one field per
/// metric; anomaly sub-maps flatten to `<outer>_<inner>` keys.
pub fn analytics_point(prefix: &str, record: &AnalyticsRecord) -> Result<Point, EncodeError> {
    let mut tags = BTreeMap::new();
    tags.insert("asset_name".to_owned(), record.asset_name().to_owned());
    tags.insert("analytics_type".to_owned(), record.category().to_owned());

    let mut fields = BTreeMap::new();
    match record {
        AnalyticsRecord::Kpi(kpi) => {
            for (name, value) in &kpi.metrics {
                fields.insert(name.clone(), FieldValue::Float(*value));
            }
        }
        AnalyticsRecord::Anomaly(anomaly) => {
            fields.insert("tag".to_owned(), FieldValue::String(anomaly.tag.clone()));
            fields.insert(
                "current_value".to_owned(),
                FieldValue::Float(anomaly.current_value),
            );
            fields.insert(
                "baseline_mean".to_owned(),
                FieldValue::Float(anomaly.baseline_mean),
            );
            fields.insert("z_score".to_owned(), FieldValue::Float(anomaly.z_score));
            fields.insert(
                "is_anomaly".to_owned(),
                FieldValue::Bool(anomaly.is_anomaly),
            );
            fields.insert(
                "threshold_anomaly".to_owned(),
                FieldValue::Bool(anomaly.threshold_anomaly),
            );
            fields.insert("trend".to_owned(), FieldValue::Float(anomaly.trend));
            fields.insert(
                "maintenance_score".to_owned(),
                FieldValue::Float(anomaly.maintenance_score),
            );
            fields.insert(
                "prediction_horizon_hours".to_owned(),
                FieldValue::Float(f64::from(anomaly.prediction_horizon_hours)),
            );
            for (name, detail) in &anomaly.energy_anomalies {
                fields.insert(
                    format!("{name}_severity"),
                    FieldValue::String(detail.severity.as_str().to_owned()),
                );
                fields.insert(
                    format!("{name}_magnitude"),
                    FieldValue::Float(detail.magnitude),
                );
            }
        }
    }

    Ok(Point {
        measurement: format!("{prefix}_analytics"),
        tags,
        fields,
        timestamp_ns: encode_timestamp(record.timestamp())?,
    })
}

/// Encodes a whole batch into one request body.
pub fn encode_lines(points: &[Point]) -> Result<BytesMut, EncodeError> {
    let mut buffer = BytesMut::new();
    for point in points {
        point.encode(&mut buffer)?;
    }
    Ok(buffer)
}
