//! Records flowing through the pipeline
//!
//! A [`Record`] is one extracted item: a mapping from field name to
//! [`FieldValue`] plus an identity key fixed at admission. Asset fields start
//! as [`AssetReference::Pending`] and are swapped for a fully resolved
//! reference by the fetch stage; there is no intermediate state.

use harvest_common::checksum::{parse_sha256_hex, sha256_hex, sha256_hex_parts};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::RecordError;

/// Separator byte between identity field values before hashing
pub const IDENTITY_SEPARATOR: u8 = 0x1f;

/// Raw record as produced by the extraction layer
pub type RawRecord = serde_json::Map<String, serde_json::Value>;

/// Stable key identifying the entity a record describes
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityKey(String);

impl IdentityKey {
    /// Derive the key from identity field values, in configured order
    pub fn derive<'a, I>(values: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        Self(sha256_hex_parts(values, IDENTITY_SEPARATOR))
    }

    /// Rehydrate a key read back from storage
    pub fn from_stored(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// SHA-256 of an asset's bytes; the address of the blob
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    /// Hash a byte slice
    pub fn of(bytes: &[u8]) -> Self {
        Self(sha256_hex(bytes))
    }

    /// Parse a hex digest, normalizing to lowercase
    pub fn parse(value: &str) -> harvest_common::Result<Self> {
        parse_sha256_hex(value).map(Self)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for log lines
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Asset that has been fetched, hashed and written to the blob store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedAsset {
    /// Remote locator the bytes were fetched from
    pub locator: String,
    /// Blob store path of the original
    pub path: String,
    pub hash: ContentHash,
    pub size: u64,
    pub content_type: Option<String>,
    /// Thumbnail spec name -> blob store path
    #[serde(default)]
    pub thumbnails: BTreeMap<String, String>,
}

/// Pointer to a binary asset, remote or locally resolved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AssetReference {
    Pending { locator: String },
    Resolved(ResolvedAsset),
}

impl AssetReference {
    pub fn pending(locator: impl Into<String>) -> Self {
        AssetReference::Pending {
            locator: locator.into(),
        }
    }

    pub fn locator(&self) -> &str {
        match self {
            AssetReference::Pending { locator } => locator,
            AssetReference::Resolved(asset) => &asset.locator,
        }
    }

    pub fn resolved(&self) -> Option<&ResolvedAsset> {
        match self {
            AssetReference::Pending { .. } => None,
            AssetReference::Resolved(asset) => Some(asset),
        }
    }
}

/// Value kinds a field can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Text,
    Number,
    Asset,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueKind::Text => write!(f, "text"),
            ValueKind::Number => write!(f, "number"),
            ValueKind::Asset => write!(f, "asset"),
        }
    }
}

/// Value of a single record field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    Number(f64),
    Asset(AssetReference),
}

impl FieldValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            FieldValue::Text(_) => ValueKind::Text,
            FieldValue::Number(_) => ValueKind::Number,
            FieldValue::Asset(_) => ValueKind::Asset,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_asset(&self) -> Option<&AssetReference> {
        match self {
            FieldValue::Asset(asset) => Some(asset),
            _ => None,
        }
    }

    /// Scalar rendering used for identity derivation
    fn identity_text(&self) -> Option<String> {
        match self {
            FieldValue::Text(text) => Some(text.clone()),
            FieldValue::Number(n) => Some(n.to_string()),
            FieldValue::Asset(_) => None,
        }
    }
}

/// Which raw fields form the identity key and which hold asset locators
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSchema {
    pub identity_fields: Vec<String>,
    /// Empty when the asset stage is disabled; asset locators then stay text
    pub asset_fields: Vec<String>,
}

/// One extracted item
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    identity: IdentityKey,
    fields: BTreeMap<String, FieldValue>,
}

impl Record {
    /// Build a record from raw extracted JSON
    ///
    /// `null` values are dropped, booleans become text, nested arrays and
    /// objects are kept as their JSON text.
    pub fn from_raw(raw: RawRecord, schema: &RecordSchema) -> Result<Self, RecordError> {
        let mut fields = BTreeMap::new();

        for (name, value) in raw {
            let is_asset = schema.asset_fields.iter().any(|f| f == &name);
            let value = match value {
                serde_json::Value::Null => continue,
                serde_json::Value::String(text) if is_asset => {
                    FieldValue::Asset(AssetReference::pending(text.trim()))
                },
                serde_json::Value::String(text) => FieldValue::Text(text),
                serde_json::Value::Bool(flag) => FieldValue::Text(flag.to_string()),
                serde_json::Value::Number(n) => match n.as_f64() {
                    Some(n) => FieldValue::Number(n),
                    None => FieldValue::Text(n.to_string()),
                },
                nested => FieldValue::Text(nested.to_string()),
            };
            fields.insert(name, value);
        }

        let mut parts = Vec::with_capacity(schema.identity_fields.len());
        for name in &schema.identity_fields {
            let value = fields
                .get(name)
                .ok_or_else(|| RecordError::MissingIdentityField(name.clone()))?;
            let text = value
                .identity_text()
                .ok_or_else(|| RecordError::InvalidIdentityField(name.clone()))?;
            parts.push(text);
        }

        Ok(Self {
            identity: IdentityKey::derive(parts.iter().map(String::as_str)),
            fields,
        })
    }

    /// Build a record with an explicit key (used when rehydrating)
    pub fn with_fields(identity: IdentityKey, fields: BTreeMap<String, FieldValue>) -> Self {
        Self { identity, fields }
    }

    pub fn identity(&self) -> &IdentityKey {
        &self.identity
    }

    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(FieldValue::as_text)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: FieldValue) -> Option<FieldValue> {
        self.fields.insert(name.into(), value)
    }

    pub fn remove(&mut self, name: &str) -> Option<FieldValue> {
        self.fields.remove(name)
    }

    /// `(field, locator)` for every asset still waiting to be fetched
    pub fn pending_assets(&self) -> Vec<(String, String)> {
        self.fields
            .iter()
            .filter_map(|(name, value)| match value {
                FieldValue::Asset(AssetReference::Pending { locator }) => {
                    Some((name.clone(), locator.clone()))
                },
                _ => None,
            })
            .collect()
    }

    /// Mutable access to the resolved asset held by `field`
    pub fn resolved_asset_mut(&mut self, field: &str) -> Option<&mut ResolvedAsset> {
        match self.fields.get_mut(field) {
            Some(FieldValue::Asset(AssetReference::Resolved(asset))) => Some(asset),
            _ => None,
        }
    }

    pub fn into_fields(self) -> BTreeMap<String, FieldValue> {
        self.fields
    }
}
