use serde_json::{Map, Value};

use crate::error::FormError;

/// Names of `Object.prototype` members. Forms are routinely round-tripped
/// into JavaScript consumers, where a field named after an inherited member
/// would shadow it; such fields are dropped outright.
const RESERVED_KEYS: &[&str] = &[
    "__defineGetter__",
    "__defineSetter__",
    "__lookupGetter__",
    "__lookupSetter__",
    "__proto__",
    "constructor",
    "hasOwnProperty",
    "isPrototypeOf",
    "propertyIsEnumerable",
    "toLocaleString",
    "toString",
    "valueOf",
];

/// Bracketed integer segments above this are treated as string keys rather
/// than indices, since index growth allocates the whole prefix.
const MAX_INDEX: usize = 10_000;

/// One step of a parsed bracket-notation field name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    /// A `[key]` segment that descends into a mapping.
    Key(String),
    /// A `[3]` segment that descends into a sequence slot.
    Index(usize),
    /// An empty `[]` segment that pushes a fresh sequence slot.
    Append,
}

/// A field name split into its base key and bracketed segments,
/// e.g. `a[b][0][]` becomes base `a` with `Key(b), Index(0), Append`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    pub base: String,
    pub segments: Vec<PathSegment>,
}

impl FieldPath {
    pub fn parse(name: &str) -> Result<Self, FormError> {
        let mut parts = name.split('[');
        let base = parts.next().unwrap_or_default();
        if base.is_empty() {
            return Err(FormError::InvalidFieldName(name.to_string()));
        }

        let segments = parts
            .map(|raw| {
                // Take the run up to the closing bracket; anything after it is
                // discarded and an unclosed bracket is tolerated as a key.
                let seg = raw.split(']').next().unwrap_or(raw);
                if seg.is_empty() {
                    PathSegment::Append
                } else {
                    match seg.parse::<usize>() {
                        Ok(idx) if idx <= MAX_INDEX => PathSegment::Index(idx),
                        _ => PathSegment::Key(seg.to_string()),
                    }
                }
            })
            .collect();

        Ok(FieldPath {
            base: base.to_string(),
            segments,
        })
    }

    fn collides_with_reserved(&self) -> bool {
        RESERVED_KEYS.contains(&self.base.as_str())
            || self.segments.iter().any(|seg| match seg {
                PathSegment::Key(key) => RESERVED_KEYS.contains(&key.as_str()),
                _ => false,
            })
    }
}

/// Accumulates all field events of one request into a nested value tree.
///
/// Repeated names promote scalars to sequences, integer segments grow
/// sequences in place, string segments union key-wise into mappings. The
/// resulting structure depends only on the set and order of inserts.
#[derive(Debug, Default)]
pub struct FieldAccumulator {
    root: Map<String, Value>,
}

impl FieldAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one field event into the tree. Names colliding with reserved
    /// keys are dropped without touching the tree; this is not an error.
    pub fn insert(&mut self, name: &str, value: String) -> Result<(), FormError> {
        let path = FieldPath::parse(name)?;
        if path.collides_with_reserved() {
            log::debug!("dropping field {:?}: reserved key", name);
            return Ok(());
        }

        let slot = self.root.entry(path.base).or_insert(Value::Null);
        merge_at(slot, &path.segments, value);
        Ok(())
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.root
    }
}

fn merge_at(node: &mut Value, segments: &[PathSegment], value: String) {
    match segments.split_first() {
        None => store_leaf(node, value),
        Some((PathSegment::Append, rest)) => {
            let seq = as_sequence(node);
            seq.push(Value::Null);
            if let Some(last) = seq.last_mut() {
                merge_at(last, rest, value);
            }
        }
        Some((PathSegment::Index(idx), rest)) => {
            let seq = as_sequence(node);
            while seq.len() <= *idx {
                seq.push(Value::Null);
            }
            merge_at(&mut seq[*idx], rest, value);
        }
        Some((PathSegment::Key(key), rest)) => {
            let map = as_mapping(node);
            let child = map.entry(key.clone()).or_insert(Value::Null);
            merge_at(child, rest, value);
        }
    }
}

/// Terminal write: empty slots take the scalar, occupied slots promote to a
/// sequence and later repeats append, preserving arrival order.
fn store_leaf(node: &mut Value, value: String) {
    match node {
        Value::Null => *node = Value::String(value),
        Value::Array(seq) => seq.push(Value::String(value)),
        other => {
            let prev = other.take();
            *other = Value::Array(vec![prev, Value::String(value)]);
        }
    }
}

/// Coerce a node to a sequence: a prior scalar becomes its first element.
fn as_sequence(node: &mut Value) -> &mut Vec<Value> {
    if node.is_null() {
        *node = Value::Array(Vec::new());
    } else if !node.is_array() {
        let prev = node.take();
        *node = Value::Array(vec![prev]);
    }
    match node {
        Value::Array(seq) => seq,
        _ => unreachable!(),
    }
}

/// Coerce a node to a mapping; a prior non-mapping value is discarded.
fn as_mapping(node: &mut Value) -> &mut Map<String, Value> {
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    match node {
        Value::Object(map) => map,
        _ => unreachable!(),
    }
}
