//! Text encoding of cell state.
//!
//! Each part of a cell (offsets, accumulators, derived values) becomes one
//! JSON document wrapped in standard base64, so it can sit in a single text
//! column without escaping.

use std::collections::BTreeMap;

use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose, Engine as _};
use datafusion::scalar::ScalarValue;
use serde::{Deserialize, Serialize};

use crate::common::{Offset, Record, Timestamp};
use crate::runtime::operators::window::aggregates::AccumulatorValue;
use crate::runtime::operators::window::state::cell::StateCell;
use crate::runtime::utils::{scalar_from_json, TaggedScalar};

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EncodedState {
    pub offsets: String,
    pub aggregates: String,
    pub derived: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct AggregateEntry {
    function: String,
    is_primitive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    type_tag: Option<String>,
    payload: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DerivedEntry {
    Tagged(TaggedScalar),
    Bare(serde_json::Value),
}

fn wrap(content: &str) -> String {
    general_purpose::STANDARD.encode(content.as_bytes())
}

fn unwrap(text: &str) -> Result<Option<String>> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    let bytes = general_purpose::STANDARD
        .decode(text)
        .context("state text is not valid base64")?;
    let content = String::from_utf8(bytes).context("state text is not valid UTF-8")?;
    Ok(Some(content))
}

pub fn encode_offsets(offsets: &BTreeMap<String, Offset>) -> Result<String> {
    Ok(wrap(&serde_json::to_string(offsets)?))
}

pub fn decode_offsets(text: &str) -> Result<BTreeMap<String, Offset>> {
    let Some(json) = unwrap(text)? else {
        return Ok(BTreeMap::new());
    };
    let raw: BTreeMap<String, serde_json::Value> =
        serde_json::from_str(&json).context("malformed offsets")?;
    raw.into_iter()
        .map(|(partition, value)| {
            let offset = match value {
                serde_json::Value::String(s) => Offset::new(s),
                serde_json::Value::Number(n) => Offset::new(n.to_string()),
                other => bail!("offset of partition '{}' is not a scalar: {}", partition, other),
            };
            Ok((partition, offset))
        })
        .collect()
}

pub fn encode_aggregates(accs: &BTreeMap<String, AccumulatorValue>) -> Result<String> {
    let mut entries = Vec::with_capacity(accs.len());
    for (column, acc) in accs {
        match acc {
            AccumulatorValue::Primitive(value) => {
                if value.is_null() {
                    continue;
                }
                let tagged = TaggedScalar::from_scalar(value)
                    .with_context(|| format!("cannot encode accumulator '{}'", column))?;
                entries.push(AggregateEntry {
                    function: column.clone(),
                    is_primitive: true,
                    type_tag: Some(tagged.type_tag),
                    payload: tagged.value.unwrap_or_default(),
                });
            }
            AccumulatorValue::Structured(fields) => {
                let tagged = fields
                    .iter()
                    .map(TaggedScalar::from_scalar)
                    .collect::<Result<Vec<_>>>()
                    .with_context(|| format!("cannot encode accumulator '{}'", column))?;
                entries.push(AggregateEntry {
                    function: column.clone(),
                    is_primitive: false,
                    type_tag: None,
                    payload: serde_json::to_string(&tagged)?,
                });
            }
        }
    }
    Ok(wrap(&serde_json::to_string(&entries)?))
}

fn decode_entry(entry: AggregateEntry) -> Result<AccumulatorValue> {
    if entry.is_primitive {
        let type_tag = entry
            .type_tag
            .ok_or_else(|| anyhow!("primitive accumulator without type tag"))?;
        let tagged = TaggedScalar {
            type_tag,
            value: Some(entry.payload),
        };
        Ok(AccumulatorValue::Primitive(tagged.to_scalar()?))
    } else {
        let fields: Vec<TaggedScalar> =
            serde_json::from_str(&entry.payload).context("malformed structured accumulator")?;
        let fields = fields
            .iter()
            .map(TaggedScalar::to_scalar)
            .collect::<Result<Vec<_>>>()?;
        Ok(AccumulatorValue::Structured(fields))
    }
}

pub fn decode_aggregates(text: &str) -> Result<BTreeMap<String, AccumulatorValue>> {
    let Some(json) = unwrap(text)? else {
        return Ok(BTreeMap::new());
    };
    let entries: Vec<AggregateEntry> =
        serde_json::from_str(&json).context("malformed accumulator list")?;
    entries
        .into_iter()
        .map(|entry| {
            let column = entry.function.clone();
            let acc = decode_entry(entry)
                .with_context(|| format!("cannot decode accumulator '{}'", column))?;
            Ok((column, acc))
        })
        .collect()
}

pub fn encode_derived(values: &Record) -> Result<String> {
    let mut tagged = BTreeMap::new();
    for (column, value) in values {
        let entry = TaggedScalar::from_scalar(value)
            .with_context(|| format!("cannot encode derived column '{}'", column))?;
        tagged.insert(column.clone(), entry);
    }
    Ok(wrap(&serde_json::to_string(&tagged)?))
}

/// Accepts both tagged entries and bare JSON scalars per column.
pub fn decode_derived(text: &str) -> Result<Record> {
    let Some(json) = unwrap(text)? else {
        return Ok(Record::new());
    };
    let entries: BTreeMap<String, DerivedEntry> =
        serde_json::from_str(&json).context("malformed derived values")?;
    entries
        .into_iter()
        .map(|(column, entry)| {
            let value: Result<ScalarValue> = match &entry {
                DerivedEntry::Tagged(tagged) => tagged.to_scalar(),
                DerivedEntry::Bare(raw) => scalar_from_json(raw),
            };
            let value =
                value.with_context(|| format!("cannot decode derived column '{}'", column))?;
            Ok((column, value))
        })
        .collect()
}

impl StateCell {
    pub fn encode(&self) -> Result<EncodedState> {
        let encode = || -> Result<EncodedState> {
            Ok(EncodedState {
                offsets: encode_offsets(&self.offsets_snapshot())?,
                aggregates: encode_aggregates(&self.aggregate_snapshot())?,
                derived: encode_derived(&self.derived_snapshot())?,
            })
        };
        encode().with_context(|| format!("{}: encoding state failed", self.identity()))
    }

    /// Replaces offsets, accumulators and derived values with the decoded
    /// ones. Nothing is installed unless all three parts decode.
    pub fn restore(&self, encoded: &EncodedState) -> Result<()> {
        let decode = || -> Result<_> {
            Ok((
                decode_offsets(&encoded.offsets)?,
                decode_aggregates(&encoded.aggregates)?,
                decode_derived(&encoded.derived)?,
            ))
        };
        let (offsets, accs, derived) =
            decode().with_context(|| format!("{}: decoding state failed", self.identity()))?;
        self.ordering.replace(offsets);
        self.replace_aggregate_state(accs);
        self.replace_derived_values(derived);
        Ok(())
    }

    pub fn decode(
        window_start: Timestamp,
        window_end: Timestamp,
        fire_time: Timestamp,
        group_key: impl Into<String>,
        encoded: &EncodedState,
    ) -> Result<StateCell> {
        let cell = StateCell::new(window_start, window_end, fire_time, group_key);
        cell.restore(encoded)?;
        Ok(cell)
    }
}
