// src/record.rs
//
//! Self-describing hierarchical sample records and their compacted wire form.
//!
//! A [`Record`] is an arbitrarily nested key/value tree with typed leaves
//! (scalars, fixed-size numeric arrays, byte blobs). Records are keyed at the
//! top level by sample id so multiple records can be batched into one wire
//! message without id collision.
//!
//! A [`CompactedRecord`] is the contiguous, self-contained rendition required
//! before network transmission or disk spill: a compact schema is derived
//! from the record, serialized as a length-prefixed preamble, and the leaf
//! data copied after it:
//!
//! ```text
//! | schema_len: u64 LE | schema (JSON) | data bytes |
//! ```
//!
//! Receive buffers are decoded without copying: the schema preamble is
//! parsed and leaf accessors hand out slices of the original
//! [`bytes::Bytes`] buffer.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StageError};

/// Typed leaf of a record tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    FloatArray(Vec<f32>),
    DoubleArray(Vec<f64>),
    IntArray(Vec<i64>),
}

/// Interior node of a record tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Node {
    Leaf(Value),
    Map(BTreeMap<String, Node>),
}

/// A hierarchical sample record. Keys are path components; the top-level key
/// is conventionally the sample id rendered as text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    root: BTreeMap<String, Node>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a leaf at a `/`-separated path, creating interior maps as needed.
    pub fn set(&mut self, path: &str, value: Value) {
        let mut parts = path.split('/').filter(|p| !p.is_empty());
        let first = match parts.next() {
            Some(p) => p.to_string(),
            None => return,
        };
        let rest: Vec<&str> = parts.collect();
        if rest.is_empty() {
            self.root.insert(first, Node::Leaf(value));
            return;
        }
        let entry = self
            .root
            .entry(first)
            .or_insert_with(|| Node::Map(BTreeMap::new()));
        let mut cur = entry;
        for (i, part) in rest.iter().enumerate() {
            // replace a leaf in the middle of a path with a map
            if !matches!(cur, Node::Map(_)) {
                *cur = Node::Map(BTreeMap::new());
            }
            let Node::Map(m) = cur else { unreachable!() };
            if i + 1 == rest.len() {
                m.insert(part.to_string(), Node::Leaf(value));
                return;
            }
            cur = m
                .entry(part.to_string())
                .or_insert_with(|| Node::Map(BTreeMap::new()));
        }
    }

    /// Look up a leaf by `/`-separated path.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('/').filter(|p| !p.is_empty());
        let mut cur = self.root.get(parts.next()?)?;
        for part in parts {
            match cur {
                Node::Map(m) => cur = m.get(part)?,
                Node::Leaf(_) => return None,
            }
        }
        match cur {
            Node::Leaf(v) => Some(v),
            Node::Map(_) => None,
        }
    }

    /// Names of the top-level children (for a sample record: the sample id).
    pub fn child_names(&self) -> Vec<&str> {
        self.root.keys().map(|k| k.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Depth-first traversal of all leaves in deterministic (sorted) order.
    fn walk_leaves<'a>(&'a self, out: &mut Vec<(String, &'a Value)>) {
        fn rec<'a>(prefix: &str, node: &'a Node, out: &mut Vec<(String, &'a Value)>) {
            match node {
                Node::Leaf(v) => out.push((prefix.to_string(), v)),
                Node::Map(m) => {
                    for (k, child) in m {
                        let p = if prefix.is_empty() {
                            k.clone()
                        } else {
                            format!("{}/{}", prefix, k)
                        };
                        rec(&p, child, out);
                    }
                }
            }
        }
        for (k, child) in &self.root {
            rec(k, child, out);
        }
    }
}

/// Leaf data type tag carried in the compact schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DType {
    Int,
    Float,
    Str,
    Bytes,
    FloatArray,
    DoubleArray,
    IntArray,
}

/// One leaf in the compact schema: where its bytes live in the data section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDesc {
    pub path: String,
    pub dtype: DType,
    pub offset: usize,
    pub len: usize,
}

/// Compact schema for one record: field table plus total data length.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordSchema {
    pub fields: Vec<FieldDesc>,
    pub data_len: usize,
}

/// Zero-copy view of one leaf inside a compacted record.
#[derive(Debug, Clone, Copy)]
pub struct FieldView<'a> {
    pub dtype: DType,
    pub bytes: &'a [u8],
}

impl<'a> FieldView<'a> {
    pub fn as_i64(&self) -> Option<i64> {
        if self.dtype != DType::Int {
            return None;
        }
        Some(i64::from_le_bytes(self.bytes.try_into().ok()?))
    }

    pub fn as_f64(&self) -> Option<f64> {
        if self.dtype != DType::Float {
            return None;
        }
        Some(f64::from_le_bytes(self.bytes.try_into().ok()?))
    }

    pub fn as_str(&self) -> Option<&'a str> {
        (self.dtype == DType::Str)
            .then(|| std::str::from_utf8(self.bytes).ok())
            .flatten()
    }

    pub fn as_bytes(&self) -> Option<&'a [u8]> {
        (self.dtype == DType::Bytes).then_some(self.bytes)
    }

    pub fn as_f32_vec(&self) -> Option<Vec<f32>> {
        if self.dtype != DType::FloatArray || self.bytes.len() % 4 != 0 {
            return None;
        }
        Some(
            self.bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
                .collect(),
        )
    }
}

fn encode_leaf(buf: &mut BytesMut, v: &Value) -> (DType, usize) {
    let start = buf.len();
    let dtype = match v {
        Value::Int(x) => {
            buf.put_i64_le(*x);
            DType::Int
        }
        Value::Float(x) => {
            buf.put_f64_le(*x);
            DType::Float
        }
        Value::Str(s) => {
            buf.put_slice(s.as_bytes());
            DType::Str
        }
        Value::Bytes(b) => {
            buf.put_slice(b);
            DType::Bytes
        }
        Value::FloatArray(a) => {
            for x in a {
                buf.put_f32_le(*x);
            }
            DType::FloatArray
        }
        Value::DoubleArray(a) => {
            for x in a {
                buf.put_f64_le(*x);
            }
            DType::DoubleArray
        }
        Value::IntArray(a) => {
            for x in a {
                buf.put_i64_le(*x);
            }
            DType::IntArray
        }
    };
    (dtype, buf.len() - start)
}

fn decode_leaf(dtype: DType, bytes: &[u8]) -> Result<Value> {
    let bad = |what: &str| {
        StageError::Invariant(format!(
            "compacted record field has inconsistent {} (dtype {:?}, {} bytes)",
            what,
            dtype,
            bytes.len()
        ))
    };
    Ok(match dtype {
        DType::Int => Value::Int(i64::from_le_bytes(
            bytes.try_into().map_err(|_| bad("length"))?,
        )),
        DType::Float => Value::Float(f64::from_le_bytes(
            bytes.try_into().map_err(|_| bad("length"))?,
        )),
        DType::Str => Value::Str(
            std::str::from_utf8(bytes)
                .map_err(|_| bad("utf8"))?
                .to_string(),
        ),
        DType::Bytes => Value::Bytes(bytes.to_vec()),
        DType::FloatArray => {
            if bytes.len() % 4 != 0 {
                return Err(bad("length"));
            }
            Value::FloatArray(
                bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
                    .collect(),
            )
        }
        DType::DoubleArray => {
            if bytes.len() % 8 != 0 {
                return Err(bad("length"));
            }
            Value::DoubleArray(
                bytes
                    .chunks_exact(8)
                    .map(|c| f64::from_le_bytes(c.try_into().unwrap()))
                    .collect(),
            )
        }
        DType::IntArray => {
            if bytes.len() % 8 != 0 {
                return Err(bad("length"));
            }
            Value::IntArray(
                bytes
                    .chunks_exact(8)
                    .map(|c| i64::from_le_bytes(c.try_into().unwrap()))
                    .collect(),
            )
        }
    })
}

/// A record repacked into contiguous, self-contained form.
#[derive(Debug, Clone)]
pub struct CompactedRecord {
    schema: Arc<RecordSchema>,
    schema_json: Bytes,
    data: Bytes,
    // Full wire blob; pre-populated by `compact`/`from_wire`, built lazily
    // for raw (shared-segment) records, which are never transmitted.
    wire: OnceCell<Bytes>,
}

impl CompactedRecord {
    /// Repack `rec` into compacted form. This is the only place leaf data is
    /// copied; everything downstream (send, spill, decode) reuses the blob.
    pub fn compact(rec: &Record) -> Result<Self> {
        let mut leaves = Vec::new();
        rec.walk_leaves(&mut leaves);

        let mut data = BytesMut::new();
        let mut fields = Vec::with_capacity(leaves.len());
        for (path, v) in leaves {
            let offset = data.len();
            let (dtype, len) = encode_leaf(&mut data, v);
            fields.push(FieldDesc {
                path,
                dtype,
                offset,
                len,
            });
        }
        let schema = RecordSchema {
            fields,
            data_len: data.len(),
        };
        let schema_json = Bytes::from(serde_json::to_vec(&schema)?);

        let mut wire = BytesMut::with_capacity(8 + schema_json.len() + schema.data_len);
        wire.put_u64_le(schema_json.len() as u64);
        wire.put_slice(&schema_json);
        wire.put_slice(&data);
        let wire = wire.freeze();
        let data = wire.slice(8 + schema_json.len()..);

        Ok(Self {
            schema: Arc::new(schema),
            schema_json,
            data,
            wire: OnceCell::with_value(wire),
        })
    }

    /// Decode a received (or reloaded) wire blob. The data section is a
    /// zero-copy slice of `wire`.
    pub fn from_wire(wire: Bytes) -> Result<Self> {
        let fail = |detail: String| StageError::Invariant(detail);
        if wire.len() < 8 {
            return Err(fail(format!(
                "wire blob of {} bytes is too short for a schema preamble",
                wire.len()
            )));
        }
        let schema_len = u64::from_le_bytes(wire[..8].try_into().unwrap()) as usize;
        if wire.len() < 8 + schema_len {
            return Err(fail(format!(
                "wire blob of {} bytes cannot hold a {}-byte schema",
                wire.len(),
                schema_len
            )));
        }
        let schema_json = wire.slice(8..8 + schema_len);
        let schema: RecordSchema = serde_json::from_slice(&schema_json)?;
        let data = wire.slice(8 + schema_len..);
        if data.len() != schema.data_len {
            return Err(fail(format!(
                "schema declares {} data bytes but blob carries {}",
                schema.data_len,
                data.len()
            )));
        }
        Ok(Self {
            schema: Arc::new(schema),
            schema_json,
            data,
            wire: OnceCell::with_value(wire),
        })
    }

    /// Wrap raw sample bytes (e.g. a slice of the node-local shared segment)
    /// as a single-field record `<id>/buffer` without copying the data.
    pub fn from_raw(id: usize, data: Bytes) -> Result<Self> {
        let schema = RecordSchema {
            fields: vec![FieldDesc {
                path: format!("{}/buffer", id),
                dtype: DType::Bytes,
                offset: 0,
                len: data.len(),
            }],
            data_len: data.len(),
        };
        let schema_json = Bytes::from(serde_json::to_vec(&schema)?);
        Ok(Self {
            schema: Arc::new(schema),
            schema_json,
            data,
            wire: OnceCell::new(),
        })
    }

    /// The contiguous `schema_len | schema | data` blob, building (and
    /// caching) it if this record was created from raw bytes.
    pub fn wire_bytes(&self) -> Bytes {
        self.wire
            .get_or_init(|| {
                let mut wire =
                    BytesMut::with_capacity(8 + self.schema_json.len() + self.data.len());
                wire.put_u64_le(self.schema_json.len() as u64);
                wire.put_slice(&self.schema_json);
                wire.put_slice(&self.data);
                wire.freeze()
            })
            .clone()
    }

    /// Total compacted size in bytes; the quantity exchanged in the per-id
    /// size map and used for receive-buffer allocation.
    pub fn size(&self) -> usize {
        8 + self.schema_json.len() + self.data.len()
    }

    /// True once the full wire blob is materialized and the data section
    /// aliases it.
    pub fn is_contiguous(&self) -> bool {
        self.wire.get().is_some()
    }

    pub fn schema(&self) -> &RecordSchema {
        &self.schema
    }

    /// Zero-copy typed view of one leaf.
    pub fn field(&self, path: &str) -> Option<FieldView<'_>> {
        let f = self.schema.fields.iter().find(|f| f.path == path)?;
        Some(FieldView {
            dtype: f.dtype,
            bytes: &self.data[f.offset..f.offset + f.len],
        })
    }

    /// CRC32 over the wire blob; recorded in checkpoint metadata.
    pub fn checksum(&self) -> u32 {
        crc32fast::hash(&self.wire_bytes())
    }

    /// Rebuild the full hierarchical record (copies leaf data).
    pub fn to_record(&self) -> Result<Record> {
        let mut rec = Record::new();
        for f in &self.schema.fields {
            let bytes = self
                .data
                .get(f.offset..f.offset + f.len)
                .ok_or_else(|| {
                    StageError::Invariant(format!(
                        "field '{}' points outside the data section", f.path
                    ))
                })?;
            rec.set(&f.path, decode_leaf(f.dtype, bytes)?);
        }
        Ok(rec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record(id: usize) -> Record {
        let mut r = Record::new();
        r.set(&format!("{}/inputs/shape", id), Value::IntArray(vec![4, 4]));
        r.set(
            &format!("{}/inputs/field", id),
            Value::FloatArray(vec![0.5, 1.5, -2.0]),
        );
        r.set(&format!("{}/outputs/scalar", id), Value::Float(3.25));
        r.set(&format!("{}/meta/name", id), Value::Str("run_001".into()));
        r
    }

    #[test]
    fn set_and_get_paths() {
        let r = sample_record(7);
        assert_eq!(r.get("7/outputs/scalar"), Some(&Value::Float(3.25)));
        assert_eq!(r.get("7/meta/name"), Some(&Value::Str("run_001".into())));
        assert_eq!(r.get("7/outputs"), None); // interior node, not a leaf
        assert_eq!(r.get("8/outputs/scalar"), None);
        assert_eq!(r.child_names(), vec!["7"]);
    }

    #[test]
    fn compact_roundtrip() {
        let r = sample_record(3);
        let c = CompactedRecord::compact(&r).unwrap();
        assert!(c.is_contiguous());
        assert_eq!(c.size(), c.wire_bytes().len());
        let back = c.to_record().unwrap();
        assert_eq!(back, r);
    }

    #[test]
    fn wire_roundtrip_is_zero_copy() {
        let r = sample_record(11);
        let c = CompactedRecord::compact(&r).unwrap();
        let wire = c.wire_bytes();
        let d = CompactedRecord::from_wire(wire.clone()).unwrap();
        assert_eq!(d.size(), wire.len());
        assert_eq!(d.to_record().unwrap(), r);
        // typed view without decode
        let view = d.field("11/inputs/field").unwrap();
        assert_eq!(view.as_f32_vec().unwrap(), vec![0.5, 1.5, -2.0]);
    }

    #[test]
    fn from_raw_wraps_without_copy() {
        let payload = Bytes::from_static(b"raw sample bytes");
        let c = CompactedRecord::from_raw(42, payload.clone()).unwrap();
        assert!(!c.is_contiguous());
        let view = c.field("42/buffer").unwrap();
        assert_eq!(view.as_bytes().unwrap(), payload.as_ref());
        // materializing the wire form makes it self-contained
        let wire = c.wire_bytes();
        let d = CompactedRecord::from_wire(wire).unwrap();
        assert_eq!(
            d.field("42/buffer").unwrap().as_bytes().unwrap(),
            payload.as_ref()
        );
    }

    #[test]
    fn truncated_wire_is_rejected() {
        let r = sample_record(1);
        let wire = CompactedRecord::compact(&r).unwrap().wire_bytes();
        let truncated = wire.slice(..wire.len() - 3);
        assert!(CompactedRecord::from_wire(truncated).is_err());
        assert!(CompactedRecord::from_wire(Bytes::from_static(b"xy")).is_err());
    }
}
