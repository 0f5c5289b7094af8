//! Content codecs translating typed values to and from message bodies.
//!
//! Two content types are supported: JSON (structured text) and MessagePack
//! (compact binary). [`ContentSerde`] picks one by configuration; both
//! implement [`ContentCodec`] and round-trip the same values.

use crate::error::ContentError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Document identity marker assigned by the server.
pub const ID_FIELD: &str = "_id";
/// Document key marker.
pub const KEY_FIELD: &str = "_key";
/// Document revision marker.
pub const REV_FIELD: &str = "_rev";

/// Wire content type of message bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    #[default]
    Json,
    Pack,
}

impl ContentType {
    /// Identifier exchanged in the `content-type` / `accept` headers.
    pub fn identifier(&self) -> &'static str {
        match self {
            ContentType::Json => "application/json",
            ContentType::Pack => "application/x-msgpack",
        }
    }

    pub fn from_identifier(identifier: &str) -> Option<Self> {
        match identifier.split(';').next().map(str::trim) {
            Some("application/json") => Some(ContentType::Json),
            Some("application/x-msgpack") => Some(ContentType::Pack),
            _ => None,
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentType::Json => write!(f, "json"),
            ContentType::Pack => write!(f, "pack"),
        }
    }
}

impl FromStr for ContentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(ContentType::Json),
            "pack" | "msgpack" => Ok(ContentType::Pack),
            other => {
                ContentType::from_identifier(other).ok_or(format!("unknown content type {other:?}"))
            }
        }
    }
}

/// Server-assigned markers of a stored document.
///
/// Flatten it into user types to have `_id`, `_key` and `_rev` populated on
/// decode:
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct User {
///     #[serde(flatten)]
///     meta: DocumentMeta,
///     name: String,
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMeta {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "_key", default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
}

impl DocumentMeta {
    pub fn with_key(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Default::default()
        }
    }

    /// Returns whether the server has assigned an identity.
    pub fn is_assigned(&self) -> bool {
        self.id.is_some() || self.rev.is_some()
    }
}

/// Serialization capability for one content type.
pub trait ContentCodec {
    fn content_type(&self) -> ContentType;

    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, ContentError>;

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, ContentError>;

    /// Decodes only the subtree addressed by an RFC 6901 `pointer`.
    fn deserialize_at_path<T: DeserializeOwned>(
        &self,
        bytes: &[u8],
        pointer: &str,
    ) -> Result<T, ContentError>;
}

/// JSON codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl ContentCodec for JsonCodec {
    fn content_type(&self) -> ContentType {
        ContentType::Json
    }

    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, ContentError> {
        Ok(serde_json::to_vec(value)?)
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, ContentError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn deserialize_at_path<T: DeserializeOwned>(
        &self,
        bytes: &[u8],
        pointer: &str,
    ) -> Result<T, ContentError> {
        let tokens = pointer_tokens(pointer)?;
        let mut current: &RawValue = serde_json::from_slice(bytes)?;

        // Each step only splits the current level into raw slices
        for token in &tokens {
            let text = current.get().trim_start();
            current = if text.starts_with('{') {
                let mut object: HashMap<String, &RawValue> = serde_json::from_str(text)?;
                object
                    .remove(token.as_str())
                    .ok_or_else(|| ContentError::PathNotFound(pointer.to_string()))?
            } else if text.starts_with('[') {
                let array: Vec<&RawValue> = serde_json::from_str(text)?;
                token
                    .parse::<usize>()
                    .ok()
                    .and_then(|i| array.get(i).copied())
                    .ok_or_else(|| ContentError::PathNotFound(pointer.to_string()))?
            } else {
                return Err(ContentError::PathNotFound(pointer.to_string()));
            };
        }

        Ok(serde_json::from_str(current.get())?)
    }
}

/// MessagePack codec. Structs are encoded as maps so field names survive
/// and pointer lookups work.
#[derive(Debug, Clone, Copy, Default)]
pub struct PackCodec;

impl ContentCodec for PackCodec {
    fn content_type(&self) -> ContentType {
        ContentType::Pack
    }

    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, ContentError> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, ContentError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    fn deserialize_at_path<T: DeserializeOwned>(
        &self,
        bytes: &[u8],
        pointer: &str,
    ) -> Result<T, ContentError> {
        let tokens = pointer_tokens(pointer)?;
        let mut rd = bytes;
        // Borrowed view: strings and binaries stay in `bytes`
        let root = rmpv::decode::read_value_ref(&mut rd)?;

        let mut current = &root;
        for token in &tokens {
            current = match current {
                rmpv::ValueRef::Map(entries) => entries
                    .iter()
                    .find(|(k, _)| match k {
                        rmpv::ValueRef::String(s) => s.as_str() == Some(token.as_str()),
                        _ => false,
                    })
                    .map(|(_, v)| v),
                rmpv::ValueRef::Array(items) => {
                    token.parse::<usize>().ok().and_then(|i| items.get(i))
                }
                _ => None,
            }
            .ok_or_else(|| ContentError::PathNotFound(pointer.to_string()))?;
        }

        Ok(rmpv::ext::from_value(current.to_owned())?)
    }
}

/// Content codec selected by configuration.
#[derive(Debug, Clone, Copy)]
pub enum ContentSerde {
    Json(JsonCodec),
    Pack(PackCodec),
}

impl ContentSerde {
    pub fn new(content_type: ContentType) -> Self {
        match content_type {
            ContentType::Json => ContentSerde::Json(JsonCodec),
            ContentType::Pack => ContentSerde::Pack(PackCodec),
        }
    }
}

impl Default for ContentSerde {
    fn default() -> Self {
        Self::new(ContentType::default())
    }
}

impl ContentCodec for ContentSerde {
    fn content_type(&self) -> ContentType {
        match self {
            ContentSerde::Json(c) => c.content_type(),
            ContentSerde::Pack(c) => c.content_type(),
        }
    }

    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, ContentError> {
        match self {
            ContentSerde::Json(c) => c.serialize(value),
            ContentSerde::Pack(c) => c.serialize(value),
        }
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, ContentError> {
        match self {
            ContentSerde::Json(c) => c.deserialize(bytes),
            ContentSerde::Pack(c) => c.deserialize(bytes),
        }
    }

    fn deserialize_at_path<T: DeserializeOwned>(
        &self,
        bytes: &[u8],
        pointer: &str,
    ) -> Result<T, ContentError> {
        match self {
            ContentSerde::Json(c) => c.deserialize_at_path(bytes, pointer),
            ContentSerde::Pack(c) => c.deserialize_at_path(bytes, pointer),
        }
    }
}

/// Splits an RFC 6901 pointer into unescaped reference tokens.
fn pointer_tokens(pointer: &str) -> Result<Vec<String>, ContentError> {
    if pointer.is_empty() {
        return Ok(Vec::new());
    }
    if !pointer.starts_with('/') {
        return Err(ContentError::InvalidPointer(pointer.to_string()));
    }
    Ok(pointer[1..]
        .split('/')
        .map(|t| t.replace("~1", "/").replace("~0", "~"))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct User {
        #[serde(flatten)]
        meta: DocumentMeta,
        name: String,
        age: u32,
        tags: Vec<String>,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Sample {
        id: u64,
        score: i64,
        label: String,
        flags: Vec<bool>,
        attrs: BTreeMap<String, u32>,
        parent: Option<Box<Sample>>,
    }

    fn codecs() -> [ContentSerde; 2] {
        [ContentSerde::new(ContentType::Json), ContentSerde::new(ContentType::Pack)]
    }

    #[test]
    fn test_content_type_identifiers() {
        for ct in [ContentType::Json, ContentType::Pack] {
            assert_eq!(ContentType::from_identifier(ct.identifier()), Some(ct));
            assert_eq!(ct.to_string().parse::<ContentType>().unwrap(), ct);
        }
        assert_eq!(
            ContentType::from_identifier("application/json; charset=utf-8"),
            Some(ContentType::Json)
        );
        assert_eq!(ContentType::from_identifier("text/plain"), None);
    }

    #[test]
    fn test_document_markers_populated_on_decode() {
        let server = serde_json::json!({
            "_id": "users/123",
            "_key": "123",
            "_rev": "_f4a-1--",
            "name": "ada",
            "age": 36,
            "tags": ["admin"],
        });

        for codec in codecs() {
            let bytes = codec.serialize(&server).unwrap();
            let user: User = codec.deserialize(&bytes).unwrap();
            assert_eq!(user.meta.id.as_deref(), Some("users/123"), "{:?}", codec);
            assert_eq!(user.meta.key.as_deref(), Some("123"));
            assert_eq!(user.meta.rev.as_deref(), Some("_f4a-1--"));
            assert!(user.meta.is_assigned());
            assert_eq!(user.name, "ada");
        }
    }

    #[test]
    fn test_unset_markers_are_omitted() {
        let user = User {
            meta: DocumentMeta::with_key("k1"),
            name: "bob".to_string(),
            age: 1,
            tags: vec![],
        };
        let json = String::from_utf8(JsonCodec.serialize(&user).unwrap()).unwrap();
        assert!(json.contains("\"_key\":\"k1\""));
        assert!(!json.contains(ID_FIELD));
        assert!(!json.contains(REV_FIELD));
        assert!(!user.meta.is_assigned());
    }

    #[test]
    fn test_deserialize_at_path() {
        let envelope = serde_json::json!({
            "_id": "users/9",
            "new": {"_key": "9", "name": "eve", "age": 20, "tags": ["x", "y"]},
            "list": [{"a": 1}, {"a": 2}],
            "odd/key": {"~": 5},
        });

        for codec in codecs() {
            let bytes = codec.serialize(&envelope).unwrap();

            let user: User = codec.deserialize_at_path(&bytes, "/new").unwrap();
            assert_eq!(user.meta.key.as_deref(), Some("9"));
            assert_eq!(user.tags, vec!["x", "y"]);

            let a: u32 = codec.deserialize_at_path(&bytes, "/list/1/a").unwrap();
            assert_eq!(a, 2);

            let tag: String = codec.deserialize_at_path(&bytes, "/new/tags/0").unwrap();
            assert_eq!(tag, "x");

            let escaped: u32 = codec.deserialize_at_path(&bytes, "/odd~1key/~0").unwrap();
            assert_eq!(escaped, 5);

            let whole: serde_json::Value = codec.deserialize_at_path(&bytes, "").unwrap();
            assert_eq!(whole, envelope);

            let missing = codec.deserialize_at_path::<u32>(&bytes, "/list/5/a");
            assert!(matches!(missing, Err(ContentError::PathNotFound(_))));

            let missing = codec.deserialize_at_path::<u32>(&bytes, "/_id/deeper");
            assert!(matches!(missing, Err(ContentError::PathNotFound(_))));

            let bad = codec.deserialize_at_path::<u32>(&bytes, "new");
            assert!(matches!(bad, Err(ContentError::InvalidPointer(_))));
        }
    }

    #[test]
    fn test_malformed_input_and_type_mismatch() {
        assert!(matches!(
            JsonCodec.deserialize::<User>(b"{not json"),
            Err(ContentError::Json(_))
        ));
        assert!(matches!(
            PackCodec.deserialize::<User>(&[0xc1]),
            Err(ContentError::PackDecode(_))
        ));

        for codec in codecs() {
            let bytes = codec.serialize(&"a string").unwrap();
            assert!(codec.deserialize::<u64>(&bytes).is_err(), "{:?}", codec);
        }
    }

    #[test]
    fn test_pack_is_more_compact() {
        let value: Vec<u32> = (0..100).collect();
        let json = JsonCodec.serialize(&value).unwrap();
        let pack = PackCodec.serialize(&value).unwrap();
        assert!(pack.len() < json.len());
    }

    fn leaf_strategy() -> impl Strategy<Value = Sample> {
        (
            any::<u64>(),
            any::<i64>(),
            ".{0,16}",
            proptest::collection::vec(any::<bool>(), 0..4),
            proptest::collection::btree_map("[a-z]{1,6}", any::<u32>(), 0..4),
        )
            .prop_map(|(id, score, label, flags, attrs)| Sample {
                id,
                score,
                label,
                flags,
                attrs,
                parent: None,
            })
    }

    fn sample_strategy() -> impl Strategy<Value = Sample> {
        (leaf_strategy(), proptest::option::of(leaf_strategy())).prop_map(|(mut s, parent)| {
            s.parent = parent.map(Box::new);
            s
        })
    }

    proptest! {
        #[test]
        fn prop_roundtrip_all_content_types(sample in sample_strategy()) {
            for codec in codecs() {
                let bytes = codec.serialize(&sample).unwrap();
                let decoded: Sample = codec.deserialize(&bytes).unwrap();
                prop_assert_eq!(&decoded, &sample);
            }
        }
    }
}
