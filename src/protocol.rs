// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Wire protocol: method codes, envelopes and typed messages.
//!
//! Every message on a channel is an [`Envelope`] `{method, args}` encoded with
//! the channel's [`Codec`]. The replication methods are parsed into a typed
//! [`Message`]; methods belonging to sibling protocols that share the channel
//! (roster, chat, audio) parse to `None` and are ignored by the core.
//!
//! | Method | Code | Args |
//! |---|---|---|
//! | IMPORT | 0 | `[snapshotBytes]` |
//! | SET | 1 | `[collection, entity, key, epoch, value]` |
//! | ADD | 2 | `[collection, entity, valueMap]` |
//! | REMOVE | 3 | `[collection, entity]` |
//! | ROLLBACK | 4 | `[collection, entity, key, oldEpoch, oldValue]` |

use crate::codec::Codec;
use crate::error::{ReplicaError, Result};
use crate::save::SaveKeys;
use crate::value::{Fields, Value};
use std::fmt;

/// Method codes carried in the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Import,
    Set,
    Add,
    Remove,
    Rollback,
    NetworkInit,
    Join,
    Leave,
    Chat,
    Audio,
    AudioEnd,
}

impl Method {
    pub fn code(self) -> i64 {
        match self {
            Method::Import => 0,
            Method::Set => 1,
            Method::Add => 2,
            Method::Remove => 3,
            Method::Rollback => 4,
            Method::NetworkInit => 5,
            Method::Join => 6,
            Method::Leave => 7,
            Method::Chat => 8,
            Method::Audio => 9,
            Method::AudioEnd => 10,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            0 => Method::Import,
            1 => Method::Set,
            2 => Method::Add,
            3 => Method::Remove,
            4 => Method::Rollback,
            5 => Method::NetworkInit,
            6 => Method::Join,
            7 => Method::Leave,
            8 => Method::Chat,
            9 => Method::Audio,
            10 => Method::AudioEnd,
            _ => return None,
        })
    }

    /// Whether this method is handled by the replication core.
    pub fn is_replication(self) -> bool {
        matches!(
            self,
            Method::Import | Method::Set | Method::Add | Method::Remove | Method::Rollback
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Import => "IMPORT",
            Method::Set => "SET",
            Method::Add => "ADD",
            Method::Remove => "REMOVE",
            Method::Rollback => "ROLLBACK",
            Method::NetworkInit => "NETWORK_INIT",
            Method::Join => "JOIN",
            Method::Leave => "LEAVE",
            Method::Chat => "CHAT",
            Method::Audio => "AUDIO",
            Method::AudioEnd => "AUDIO_END",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded `{method, args}` record.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub method: i64,
    pub args: Vec<Value>,
}

impl Envelope {
    pub fn new(method: Method, args: Vec<Value>) -> Self {
        Self {
            method: method.code(),
            args,
        }
    }

    pub fn to_value(&self) -> Value {
        let mut map = Fields::new();
        map.insert("method".to_string(), Value::Int(self.method));
        map.insert("args".to_string(), Value::List(self.args.clone()));
        Value::Map(map)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        let mut map = value.into_map().ok_or_else(|| {
            ReplicaError::ProtocolViolation("envelope is not a map".to_string())
        })?;
        let method = map
            .get("method")
            .and_then(Value::as_i64)
            .ok_or_else(|| {
                ReplicaError::ProtocolViolation("envelope has no integer method".to_string())
            })?;
        let args = map
            .remove("args")
            .and_then(Value::into_list)
            .ok_or_else(|| {
                ReplicaError::ProtocolViolation("envelope has no args list".to_string())
            })?;
        Ok(Self { method, args })
    }

    pub fn encode(&self, codec: &dyn Codec) -> Result<Vec<u8>> {
        codec.encode(&self.to_value())
    }

    pub fn decode(codec: &dyn Codec, bytes: &[u8]) -> Result<Self> {
        Self::from_value(codec.decode(bytes)?)
    }
}

/// A replication message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Full-state replace.
    Import { snapshot: Vec<u8> },
    /// Field write.
    Set {
        collection: String,
        entity: String,
        key: String,
        epoch: u64,
        value: Value,
    },
    /// Entity creation; every field starts at epoch 0.
    Add {
        collection: String,
        entity: String,
        value: Fields,
    },
    /// Entity deletion.
    Remove { collection: String, entity: String },
    /// Corrective overwrite sent to the loser of an arbitration.
    Rollback {
        collection: String,
        entity: String,
        key: String,
        epoch: u64,
        value: Value,
    },
}

impl Message {
    pub fn method(&self) -> Method {
        match self {
            Message::Import { .. } => Method::Import,
            Message::Set { .. } => Method::Set,
            Message::Add { .. } => Method::Add,
            Message::Remove { .. } => Method::Remove,
            Message::Rollback { .. } => Method::Rollback,
        }
    }

    /// Identifiers an external persistence layer should write after this
    /// message has been applied.
    pub fn save_keys(&self) -> SaveKeys {
        match self {
            Message::Import { .. } => SaveKeys::All,
            Message::Set { entity, .. } | Message::Rollback { entity, .. } => {
                SaveKeys::ids([entity.clone()])
            }
            Message::Add {
                collection, entity, ..
            }
            | Message::Remove { collection, entity } => {
                SaveKeys::ids([entity.clone(), collection.clone()])
            }
        }
    }

    pub fn into_envelope(self) -> Envelope {
        let method = self.method();
        let args = match self {
            Message::Import { snapshot } => vec![Value::Bytes(snapshot)],
            Message::Set {
                collection,
                entity,
                key,
                epoch,
                value,
            }
            | Message::Rollback {
                collection,
                entity,
                key,
                epoch,
                value,
            } => vec![
                Value::Str(collection),
                Value::Str(entity),
                Value::Str(key),
                epoch_value(epoch),
                value,
            ],
            Message::Add {
                collection,
                entity,
                value,
            } => vec![Value::Str(collection), Value::Str(entity), Value::Map(value)],
            Message::Remove { collection, entity } => {
                vec![Value::Str(collection), Value::Str(entity)]
            }
        };
        Envelope::new(method, args)
    }

    /// Parse a replication message.
    ///
    /// Returns `Ok(None)` for methods the core does not handle (sibling
    /// protocols or unknown codes) and `ProtocolViolation` for a known
    /// method whose arguments have the wrong shape.
    pub fn from_envelope(envelope: Envelope) -> Result<Option<Self>> {
        let method = match Method::from_code(envelope.method) {
            Some(m) if m.is_replication() => m,
            _ => return Ok(None),
        };

        let mut args = Args::new(method, envelope.args);
        let message = match method {
            Method::Import => {
                args.expect_len(1)?;
                Message::Import {
                    snapshot: args.bytes("snapshot")?,
                }
            }
            Method::Set | Method::Rollback => {
                args.expect_len(5)?;
                let collection = args.string("collection")?;
                let entity = args.string("entity")?;
                let key = args.string("key")?;
                let epoch = args.epoch()?;
                let value = args.value();
                if method == Method::Set {
                    Message::Set {
                        collection,
                        entity,
                        key,
                        epoch,
                        value,
                    }
                } else {
                    Message::Rollback {
                        collection,
                        entity,
                        key,
                        epoch,
                        value,
                    }
                }
            }
            Method::Add => {
                args.expect_len(3)?;
                Message::Add {
                    collection: args.string("collection")?,
                    entity: args.string("entity")?,
                    value: args.map("value")?,
                }
            }
            Method::Remove => {
                args.expect_len(2)?;
                Message::Remove {
                    collection: args.string("collection")?,
                    entity: args.string("entity")?,
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(message))
    }

    pub fn encode(&self, codec: &dyn Codec) -> Result<Vec<u8>> {
        self.clone().into_envelope().encode(codec)
    }

    /// Decode bytes straight to a replication message.
    pub fn decode(codec: &dyn Codec, bytes: &[u8]) -> Result<Option<Self>> {
        Self::from_envelope(Envelope::decode(codec, bytes)?)
    }
}

fn epoch_value(epoch: u64) -> Value {
    // Epochs beyond i64::MAX never occur in practice; saturate rather than wrap.
    Value::Int(i64::try_from(epoch).unwrap_or(i64::MAX))
}

/// Positional argument reader with shape errors.
struct Args {
    method: Method,
    items: std::vec::IntoIter<Value>,
    len: usize,
}

impl Args {
    fn new(method: Method, items: Vec<Value>) -> Self {
        let len = items.len();
        Self {
            method,
            items: items.into_iter(),
            len,
        }
    }

    fn expect_len(&self, expected: usize) -> Result<()> {
        if self.len != expected {
            return Err(ReplicaError::ProtocolViolation(format!(
                "{} expects {} args, got {}",
                self.method, expected, self.len
            )));
        }
        Ok(())
    }

    fn value(&mut self) -> Value {
        self.items.next().unwrap_or_default()
    }

    fn wrong(&self, name: &str, want: &str, got: &Value) -> ReplicaError {
        ReplicaError::ProtocolViolation(format!(
            "{} arg `{}` must be {}, got {}",
            self.method,
            name,
            want,
            got.type_name()
        ))
    }

    fn string(&mut self, name: &str) -> Result<String> {
        match self.value() {
            Value::Str(s) => Ok(s),
            other => Err(self.wrong(name, "a string", &other)),
        }
    }

    fn bytes(&mut self, name: &str) -> Result<Vec<u8>> {
        match self.value() {
            Value::Bytes(b) => Ok(b),
            other => Err(self.wrong(name, "bytes", &other)),
        }
    }

    fn map(&mut self, name: &str) -> Result<Fields> {
        match self.value() {
            Value::Map(m) => Ok(m),
            other => Err(self.wrong(name, "a map", &other)),
        }
    }

    fn epoch(&mut self) -> Result<u64> {
        let value = self.value();
        value
            .as_u64()
            .ok_or_else(|| self.wrong("epoch", "a non-negative integer", &value))
    }
}
