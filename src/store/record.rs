// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Namespace slots and their snapshot representation.
//!
//! A slot is either an entity record (field key → `(epoch, value)`) or a
//! collection membership set. In a snapshot each slot is a two-element list
//! tagged by kind:
//!
//! ```text
//! "p1"      => ["entity",     {"hp": [3, 10], "name": [0, "ada"]}]
//! "players" => ["collection", ["p1", "p2"]]
//! ```

use crate::error::{ReplicaError, Result};
use crate::value::{Fields, Value};
use std::collections::{BTreeMap, BTreeSet};

const ENTITY_TAG: &str = "entity";
const COLLECTION_TAG: &str = "collection";

/// One versioned field.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub epoch: u64,
    pub value: Value,
}

impl Field {
    pub fn new(epoch: u64, value: Value) -> Self {
        Self { epoch, value }
    }
}

/// An entity's versioned fields.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EntityRecord {
    fields: BTreeMap<String, Field>,
}

impl EntityRecord {
    /// New record with every initial field at epoch 0.
    pub fn from_initial(initial: Fields) -> Self {
        Self {
            fields: initial
                .into_iter()
                .map(|(k, v)| (k, Field::new(0, v)))
                .collect(),
        }
    }

    pub fn field(&self, key: &str) -> Option<&Field> {
        self.fields.get(key)
    }

    /// Current epoch for `key`; absent keys are at epoch 0.
    pub fn epoch(&self, key: &str) -> u64 {
        self.fields.get(key).map_or(0, |f| f.epoch)
    }

    pub fn value(&self, key: &str) -> Option<&Value> {
        self.fields.get(key).map(|f| &f.value)
    }

    pub(crate) fn put(&mut self, key: impl Into<String>, field: Field) {
        self.fields.insert(key.into(), field);
    }

    /// Field values with epochs stripped.
    pub fn read_all(&self) -> Fields {
        self.fields
            .iter()
            .map(|(k, f)| (k.clone(), f.value.clone()))
            .collect()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &Field)> {
        self.fields.iter().map(|(k, f)| (k.as_str(), f))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// A namespace slot.
#[derive(Debug, Clone, PartialEq)]
pub enum Slot {
    Entity(EntityRecord),
    Collection(BTreeSet<String>),
}

impl Slot {
    pub fn as_entity(&self) -> Option<&EntityRecord> {
        match self {
            Slot::Entity(record) => Some(record),
            Slot::Collection(_) => None,
        }
    }

    pub fn as_collection(&self) -> Option<&BTreeSet<String>> {
        match self {
            Slot::Collection(members) => Some(members),
            Slot::Entity(_) => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Slot::Entity(_) => ENTITY_TAG,
            Slot::Collection(_) => COLLECTION_TAG,
        }
    }

    pub fn to_value(&self) -> Value {
        let body = match self {
            Slot::Entity(record) => Value::Map(
                record
                    .fields
                    .iter()
                    .map(|(k, f)| {
                        let epoch = i64::try_from(f.epoch).unwrap_or(i64::MAX);
                        (
                            k.clone(),
                            Value::List(vec![Value::Int(epoch), f.value.clone()]),
                        )
                    })
                    .collect(),
            ),
            Slot::Collection(members) => {
                Value::List(members.iter().cloned().map(Value::Str).collect())
            }
        };
        Value::List(vec![Value::from(self.kind()), body])
    }

    pub fn from_value(id: &str, value: Value) -> Result<Self> {
        let bad = |what: &str| {
            ReplicaError::ProtocolViolation(format!("snapshot slot `{}`: {}", id, what))
        };

        let mut parts = value
            .into_list()
            .filter(|p| p.len() == 2)
            .ok_or_else(|| bad("expected [kind, body]"))?
            .into_iter();
        let tag = parts.next().unwrap_or_default();
        let body = parts.next().unwrap_or_default();

        match tag.as_str() {
            Some(ENTITY_TAG) => {
                let map = body.into_map().ok_or_else(|| bad("entity body is not a map"))?;
                let mut record = EntityRecord::default();
                for (key, pair) in map {
                    let mut pair = pair
                        .into_list()
                        .filter(|p| p.len() == 2)
                        .ok_or_else(|| bad("field is not [epoch, value]"))?
                        .into_iter();
                    let epoch = pair
                        .next()
                        .and_then(|e| e.as_u64())
                        .ok_or_else(|| bad("field epoch is not a non-negative integer"))?;
                    let value = pair.next().unwrap_or_default();
                    record.put(key, Field::new(epoch, value));
                }
                Ok(Slot::Entity(record))
            }
            Some(COLLECTION_TAG) => {
                let ids = body
                    .into_list()
                    .ok_or_else(|| bad("collection body is not a list"))?;
                let members = ids
                    .into_iter()
                    .map(|v| v.into_string().ok_or_else(|| bad("member id is not a string")))
                    .collect::<Result<BTreeSet<_>>>()?;
                Ok(Slot::Collection(members))
            }
            _ => Err(bad("unknown slot kind")),
        }
    }
}
