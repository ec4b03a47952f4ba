//! Message type registry.
//!
//! Maps application payload types to type names and encodes them to bytes.
//! A registry is an ordinary value: build one, register your types, and hand
//! it (behind an `Arc`) to the engine. Nothing here is process-global.
//!
//! # Example
//!
//! ```ignore
//! let mut registry = Registry::new();
//! registry.register::<OrderPlaced>("OrderPlaced")?;
//!
//! let (bytes, content_type) = registry.marshal(&Payload::new(OrderPlaced { .. }))?;
//! assert_eq!(content_type, "application/json;type=OrderPlaced");
//! ```

use crate::error::{Error, Result};
use crate::types::{Message, Record};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

const JSON_MIME: &str = "application/json";
const MSGPACK_MIME: &str = "application/msgpack";
const TYPE_PARAM: &str = "type=";

/// Wire encoding of payloads and snapshots.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Encoding {
    #[default]
    Json,
    MessagePack,
}

impl Encoding {
    pub fn mime(&self) -> &'static str {
        match self {
            Encoding::Json => JSON_MIME,
            Encoding::MessagePack => MSGPACK_MIME,
        }
    }

    pub fn from_mime(mime: &str) -> Result<Self> {
        match mime.trim() {
            JSON_MIME => Ok(Encoding::Json),
            MSGPACK_MIME => Ok(Encoding::MessagePack),
            other => Err(Error::UnknownContentType(other.to_string())),
        }
    }

    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            Encoding::Json => Ok(serde_json::to_vec(value)?),
            Encoding::MessagePack => Ok(rmp_serde::to_vec_named(value)?),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        match self {
            Encoding::Json => Ok(serde_json::from_slice(bytes)?),
            Encoding::MessagePack => Ok(rmp_serde::from_slice(bytes)?),
        }
    }
}

/// Parsed `"<mime>;type=<name>"` content type of a record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContentType {
    pub encoding: Encoding,
    pub type_name: String,
}

impl ContentType {
    pub fn new(encoding: Encoding, type_name: impl Into<String>) -> Self {
        Self {
            encoding,
            type_name: type_name.into(),
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};{}{}", self.encoding.mime(), TYPE_PARAM, self.type_name)
    }
}

impl FromStr for ContentType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (mime, params) = s
            .split_once(';')
            .ok_or_else(|| Error::UnknownContentType(s.to_string()))?;
        let type_name = params
            .trim()
            .strip_prefix(TYPE_PARAM)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| Error::UnknownContentType(s.to_string()))?;

        Ok(Self {
            encoding: Encoding::from_mime(mime)?,
            type_name: type_name.to_string(),
        })
    }
}

/// Shared, type-erased application payload.
#[derive(Clone)]
pub struct Payload(Arc<dyn Any + Send + Sync>);

impl Payload {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Payload(Arc::new(value))
    }

    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    pub fn is<T: 'static>(&self) -> bool {
        self.0.is::<T>()
    }

    fn value_type_id(&self) -> TypeId {
        Any::type_id(&*self.0)
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Payload({:?})", self.value_type_id())
    }
}

type EncodeFn = fn(&Payload, Encoding) -> Result<Vec<u8>>;
type DecodeFn = fn(&[u8], Encoding) -> Result<Payload>;

struct Registration {
    encode: EncodeFn,
    decode: DecodeFn,
}

fn encode_as<T: Serialize + 'static>(payload: &Payload, encoding: Encoding) -> Result<Vec<u8>> {
    let value = payload
        .downcast_ref::<T>()
        .ok_or_else(|| Error::Serialization("payload does not match registered type".into()))?;
    encoding.encode(value)
}

fn decode_as<T: DeserializeOwned + Any + Send + Sync>(
    bytes: &[u8],
    encoding: Encoding,
) -> Result<Payload> {
    Ok(Payload::new(encoding.decode::<T>(bytes)?))
}

/// Registry of message types known to an engine instance.
pub struct Registry {
    encoding: Encoding,
    by_name: HashMap<String, Registration>,
    names: HashMap<TypeId, String>,
}

impl Registry {
    /// Empty registry encoding new payloads as JSON.
    pub fn new() -> Self {
        Self::with_encoding(Encoding::Json)
    }

    pub fn with_encoding(encoding: Encoding) -> Self {
        Self {
            encoding,
            by_name: HashMap::new(),
            names: HashMap::new(),
        }
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Register `T` under `name`.
    ///
    /// Both the name and the type may only be registered once.
    pub fn register<T>(&mut self, name: impl Into<String>) -> Result<()>
    where
        T: Serialize + DeserializeOwned + Any + Send + Sync,
    {
        let name = name.into();
        if name.is_empty() || name.contains(';') {
            return Err(Error::Configuration(format!("invalid type name {:?}", name)));
        }
        if self.by_name.contains_key(&name) {
            return Err(Error::Configuration(format!("type {} already registered", name)));
        }
        let type_id = TypeId::of::<T>();
        if let Some(existing) = self.names.get(&type_id) {
            return Err(Error::Configuration(format!(
                "type already registered as {}",
                existing
            )));
        }

        self.by_name.insert(
            name.clone(),
            Registration {
                encode: encode_as::<T>,
                decode: decode_as::<T>,
            },
        );
        self.names.insert(type_id, name);
        Ok(())
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Registered name of the payload's concrete type.
    pub fn type_name(&self, payload: &Payload) -> Result<&str> {
        self.names
            .get(&payload.value_type_id())
            .map(String::as_str)
            .ok_or_else(|| Error::UnregisteredType(format!("{:?}", payload.value_type_id())))
    }

    /// Encode a payload, returning its bytes and content type.
    pub fn marshal(&self, payload: &Payload) -> Result<(Vec<u8>, String)> {
        let name = self.type_name(payload)?;
        let registration = self
            .by_name
            .get(name)
            .ok_or_else(|| Error::UnregisteredType(name.to_string()))?;
        let bytes = (registration.encode)(payload, self.encoding)?;
        Ok((bytes, ContentType::new(self.encoding, name).to_string()))
    }

    /// Decode bytes written under `content_type`.
    pub fn unmarshal(&self, content_type: &str, bytes: &[u8]) -> Result<(String, Payload)> {
        let content_type: ContentType = content_type.parse()?;
        let registration = self
            .by_name
            .get(&content_type.type_name)
            .ok_or_else(|| Error::UnregisteredType(content_type.type_name.clone()))?;
        let payload = (registration.decode)(bytes, content_type.encoding)?;
        Ok((content_type.type_name, payload))
    }

    /// Decode a stored record into its application view.
    pub fn to_message(&self, record: &Record) -> Result<Message> {
        let (message_type, data) = self.unmarshal(&record.content_type, &record.data)?;
        Ok(Message {
            number: record.number,
            stream: record.stream.clone(),
            group_number: record.group_number,
            message_type,
            data,
            time: record.time,
        })
    }

    pub fn to_messages(&self, records: &[Record]) -> Result<Vec<Message>> {
        records.iter().map(|r| self.to_message(r)).collect()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
