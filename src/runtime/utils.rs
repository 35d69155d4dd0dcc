use std::io::Cursor;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::RecordBatch;
use base64::{engine::general_purpose, Engine as _};
use datafusion::common::ScalarValue;
use serde::{Deserialize, Serialize};

/// Type tag of scalars without a text codec. The value is a one-row Arrow
/// IPC stream in standard base64.
pub const ARROW_IPC_TAG: &str = "arrow_ipc";

/// Scalar types with a registered text codec.
///
/// Values of these types are persisted as `(type name, text)` pairs. Every
/// other `ScalarValue` variant goes through [`scalar_to_ipc`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveType {
    Null,
    Boolean,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    Utf8,
    LargeUtf8,
    Date32,
    TimestampMillisecond,
}

impl PrimitiveType {
    pub const ALL: [PrimitiveType; 16] = [
        PrimitiveType::Null,
        PrimitiveType::Boolean,
        PrimitiveType::Int8,
        PrimitiveType::Int16,
        PrimitiveType::Int32,
        PrimitiveType::Int64,
        PrimitiveType::UInt8,
        PrimitiveType::UInt16,
        PrimitiveType::UInt32,
        PrimitiveType::UInt64,
        PrimitiveType::Float32,
        PrimitiveType::Float64,
        PrimitiveType::Utf8,
        PrimitiveType::LargeUtf8,
        PrimitiveType::Date32,
        PrimitiveType::TimestampMillisecond,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            PrimitiveType::Null => "null",
            PrimitiveType::Boolean => "boolean",
            PrimitiveType::Int8 => "int8",
            PrimitiveType::Int16 => "int16",
            PrimitiveType::Int32 => "int32",
            PrimitiveType::Int64 => "int64",
            PrimitiveType::UInt8 => "uint8",
            PrimitiveType::UInt16 => "uint16",
            PrimitiveType::UInt32 => "uint32",
            PrimitiveType::UInt64 => "uint64",
            PrimitiveType::Float32 => "float32",
            PrimitiveType::Float64 => "float64",
            PrimitiveType::Utf8 => "utf8",
            PrimitiveType::LargeUtf8 => "large_utf8",
            PrimitiveType::Date32 => "date32",
            PrimitiveType::TimestampMillisecond => "timestamp_ms",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.name().eq_ignore_ascii_case(name.trim()))
    }

    /// Registered type of `value`, if it has one.
    pub fn of(value: &ScalarValue) -> Option<Self> {
        let t = match value {
            ScalarValue::Null => PrimitiveType::Null,
            ScalarValue::Boolean(_) => PrimitiveType::Boolean,
            ScalarValue::Int8(_) => PrimitiveType::Int8,
            ScalarValue::Int16(_) => PrimitiveType::Int16,
            ScalarValue::Int32(_) => PrimitiveType::Int32,
            ScalarValue::Int64(_) => PrimitiveType::Int64,
            ScalarValue::UInt8(_) => PrimitiveType::UInt8,
            ScalarValue::UInt16(_) => PrimitiveType::UInt16,
            ScalarValue::UInt32(_) => PrimitiveType::UInt32,
            ScalarValue::UInt64(_) => PrimitiveType::UInt64,
            ScalarValue::Float32(_) => PrimitiveType::Float32,
            ScalarValue::Float64(_) => PrimitiveType::Float64,
            ScalarValue::Utf8(_) => PrimitiveType::Utf8,
            ScalarValue::LargeUtf8(_) => PrimitiveType::LargeUtf8,
            ScalarValue::Date32(_) => PrimitiveType::Date32,
            ScalarValue::TimestampMillisecond(_, None) => PrimitiveType::TimestampMillisecond,
            _ => return None,
        };
        Some(t)
    }

    pub fn data_type(&self) -> DataType {
        match self {
            PrimitiveType::Null => DataType::Null,
            PrimitiveType::Boolean => DataType::Boolean,
            PrimitiveType::Int8 => DataType::Int8,
            PrimitiveType::Int16 => DataType::Int16,
            PrimitiveType::Int32 => DataType::Int32,
            PrimitiveType::Int64 => DataType::Int64,
            PrimitiveType::UInt8 => DataType::UInt8,
            PrimitiveType::UInt16 => DataType::UInt16,
            PrimitiveType::UInt32 => DataType::UInt32,
            PrimitiveType::UInt64 => DataType::UInt64,
            PrimitiveType::Float32 => DataType::Float32,
            PrimitiveType::Float64 => DataType::Float64,
            PrimitiveType::Utf8 => DataType::Utf8,
            PrimitiveType::LargeUtf8 => DataType::LargeUtf8,
            PrimitiveType::Date32 => DataType::Date32,
            PrimitiveType::TimestampMillisecond => DataType::Timestamp(TimeUnit::Millisecond, None),
        }
    }

    /// Text form of the inner value, `None` for nulls.
    pub fn to_text(value: &ScalarValue) -> Option<String> {
        match value {
            ScalarValue::Boolean(v) => v.map(|v| v.to_string()),
            ScalarValue::Int8(v) => v.map(|v| v.to_string()),
            ScalarValue::Int16(v) => v.map(|v| v.to_string()),
            ScalarValue::Int32(v) => v.map(|v| v.to_string()),
            ScalarValue::Int64(v) => v.map(|v| v.to_string()),
            ScalarValue::UInt8(v) => v.map(|v| v.to_string()),
            ScalarValue::UInt16(v) => v.map(|v| v.to_string()),
            ScalarValue::UInt32(v) => v.map(|v| v.to_string()),
            ScalarValue::UInt64(v) => v.map(|v| v.to_string()),
            ScalarValue::Float32(v) => v.map(|v| v.to_string()),
            ScalarValue::Float64(v) => v.map(|v| v.to_string()),
            ScalarValue::Utf8(v) | ScalarValue::LargeUtf8(v) => v.clone(),
            ScalarValue::Date32(v) => v.map(|v| v.to_string()),
            ScalarValue::TimestampMillisecond(v, _) => v.map(|v| v.to_string()),
            _ => None,
        }
    }

    pub fn from_text(&self, text: Option<&str>) -> Result<ScalarValue> {
        let name = self.name();
        let value = match self {
            PrimitiveType::Null => ScalarValue::Null,
            PrimitiveType::Boolean => ScalarValue::Boolean(parse(text, name)?),
            PrimitiveType::Int8 => ScalarValue::Int8(parse(text, name)?),
            PrimitiveType::Int16 => ScalarValue::Int16(parse(text, name)?),
            PrimitiveType::Int32 => ScalarValue::Int32(parse(text, name)?),
            PrimitiveType::Int64 => ScalarValue::Int64(parse(text, name)?),
            PrimitiveType::UInt8 => ScalarValue::UInt8(parse(text, name)?),
            PrimitiveType::UInt16 => ScalarValue::UInt16(parse(text, name)?),
            PrimitiveType::UInt32 => ScalarValue::UInt32(parse(text, name)?),
            PrimitiveType::UInt64 => ScalarValue::UInt64(parse(text, name)?),
            PrimitiveType::Float32 => ScalarValue::Float32(parse(text, name)?),
            PrimitiveType::Float64 => ScalarValue::Float64(parse(text, name)?),
            PrimitiveType::Utf8 => ScalarValue::Utf8(text.map(str::to_string)),
            PrimitiveType::LargeUtf8 => ScalarValue::LargeUtf8(text.map(str::to_string)),
            PrimitiveType::Date32 => ScalarValue::Date32(parse(text, name)?),
            PrimitiveType::TimestampMillisecond => {
                ScalarValue::TimestampMillisecond(parse(text, name)?, None)
            }
        };
        Ok(value)
    }
}

fn parse<T>(text: Option<&str>, type_name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    text.map(|t| {
        t.parse::<T>()
            .with_context(|| format!("invalid {type_name} value '{t}'"))
    })
    .transpose()
}

/// A scalar in its persisted `(type, text)` form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaggedScalar {
    pub type_tag: String,
    pub value: Option<String>,
}

impl TaggedScalar {
    pub fn from_scalar(value: &ScalarValue) -> Result<Self> {
        match PrimitiveType::of(value) {
            Some(t) => Ok(Self {
                type_tag: t.name().to_string(),
                value: PrimitiveType::to_text(value),
            }),
            None => Ok(Self {
                type_tag: ARROW_IPC_TAG.to_string(),
                value: Some(scalar_to_ipc(value)?),
            }),
        }
    }

    pub fn to_scalar(&self) -> Result<ScalarValue> {
        if self.type_tag == ARROW_IPC_TAG {
            let payload = self
                .value
                .as_deref()
                .ok_or_else(|| anyhow!("arrow encoded scalar without payload"))?;
            return scalar_from_ipc(payload);
        }
        let t = PrimitiveType::from_name(&self.type_tag)
            .ok_or_else(|| anyhow!("unknown type tag '{}'", self.type_tag))?;
        t.from_text(self.value.as_deref())
    }
}

/// Encodes any scalar as a single-row Arrow IPC stream, base64 wrapped.
pub fn scalar_to_ipc(value: &ScalarValue) -> Result<String> {
    let array = value
        .to_array_of_size(1)
        .with_context(|| format!("cannot build array for {:?}", value.data_type()))?;
    let schema = Arc::new(Schema::new(vec![Field::new(
        "value",
        array.data_type().clone(),
        true,
    )]));
    let batch = RecordBatch::try_new(schema.clone(), vec![array])?;

    let mut buf = Vec::new();
    {
        let cursor = Cursor::new(&mut buf);
        let mut writer = StreamWriter::try_new(cursor, &schema)?;
        writer.write(&batch)?;
        writer.finish()?;
    }
    Ok(general_purpose::STANDARD.encode(buf))
}

pub fn scalar_from_ipc(text: &str) -> Result<ScalarValue> {
    let bytes = general_purpose::STANDARD
        .decode(text.trim())
        .context("arrow payload is not valid base64")?;
    let mut reader = StreamReader::try_new(Cursor::new(bytes), None)
        .context("arrow payload is not an IPC stream")?;
    let batch = reader
        .next()
        .ok_or_else(|| anyhow!("arrow payload holds no batch"))??;
    if batch.num_columns() != 1 || batch.num_rows() != 1 {
        bail!(
            "arrow payload must hold one value, found {} columns and {} rows",
            batch.num_columns(),
            batch.num_rows()
        );
    }
    Ok(ScalarValue::try_from_array(batch.column(0), 0)?)
}

/// Converts a bare JSON scalar into the closest `ScalarValue`.
pub fn scalar_from_json(value: &serde_json::Value) -> Result<ScalarValue> {
    use serde_json::Value;

    match value {
        Value::Null => Ok(ScalarValue::Null),
        Value::Bool(b) => Ok(ScalarValue::Boolean(Some(*b))),
        Value::String(s) => Ok(ScalarValue::Utf8(Some(s.clone()))),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(ScalarValue::Int64(Some(i)))
            } else if let Some(u) = n.as_u64() {
                Ok(ScalarValue::UInt64(Some(u)))
            } else if let Some(f) = n.as_f64() {
                Ok(ScalarValue::Float64(Some(f)))
            } else {
                Err(anyhow!("unrepresentable number {n}"))
            }
        }
        Value::Array(_) | Value::Object(_) => Err(anyhow!("expected a scalar, found {value}")),
    }
}

/// Integer view of timestamp-like scalars.
pub fn scalar_to_millis(value: &ScalarValue) -> Option<i64> {
    match value {
        ScalarValue::TimestampMillisecond(Some(v), _) => Some(*v),
        ScalarValue::TimestampSecond(Some(v), _) => v.checked_mul(1_000),
        ScalarValue::TimestampMicrosecond(Some(v), _) => Some(*v / 1_000),
        ScalarValue::TimestampNanosecond(Some(v), _) => Some(*v / 1_000_000),
        ScalarValue::Int64(Some(v)) => Some(*v),
        ScalarValue::UInt64(Some(v)) => i64::try_from(*v).ok(),
        ScalarValue::Int32(Some(v)) => Some(i64::from(*v)),
        _ => None,
    }
}
