//! Unsigned transaction payloads and their canonical byte form.
//!
//! Canonical JSON: object keys sorted by byte order, arrays kept in order,
//! no insignificant whitespace. The SHA-256 of those bytes is what gets
//! signed, by a device or in software.

use crate::core::bip44::DerivationPath;
use crate::core::errors::{CustodyError, CustodyResult};
use crate::core::validation::require_non_empty;
use crate::crypto::{sha256, Signature};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Transaction type written into every payload.
pub const TRANSFER_TYPE: &str = "transfer";

/// Keys callers may not set through `extra`.
pub const RESERVED_KEYS: [&str; 6] = ["type", "from", "to", "amount", "signature", "publicKey"];

/// Caller-supplied transfer fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionFields {
    pub from: String,
    pub to: String,
    pub amount: String,
    #[serde(default)]
    pub extra: Map<String, Value>,
}

/// Canonical payload ready to be signed.
#[derive(Debug, Clone, PartialEq)]
pub struct UnsignedTransaction {
    pub fields: Map<String, Value>,
    pub canonical: Vec<u8>,
    pub hash: [u8; 32],
}

impl UnsignedTransaction {
    /// Build a transfer payload. Sender and recipient are required and
    /// `extra` may not shadow the fixed fields.
    pub fn build(fields: &TransactionFields) -> CustodyResult<Self> {
        require_non_empty("from", &fields.from)?;
        require_non_empty("to", &fields.to)?;
        if let Some(key) = fields.extra.keys().find(|k| RESERVED_KEYS.contains(&k.as_str())) {
            return Err(CustodyError::Validation(format!("reserved field in extra: {}", key)));
        }

        let mut map = fields.extra.clone();
        map.insert("type".to_string(), Value::String(TRANSFER_TYPE.to_string()));
        map.insert("from".to_string(), Value::String(fields.from.clone()));
        map.insert("to".to_string(), Value::String(fields.to.clone()));
        map.insert("amount".to_string(), Value::String(fields.amount.clone()));
        Self::from_map(map)
    }

    /// Wrap an arbitrary JSON object.
    pub fn from_map(fields: Map<String, Value>) -> CustodyResult<Self> {
        let canonical = canonical_json(&Value::Object(fields.clone())).into_bytes();
        let hash = sha256(&canonical);
        Ok(Self {
            fields,
            canonical,
            hash,
        })
    }
}

/// What a signer hands back. Never contains a private key.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureResult {
    pub signature: Signature,
    #[serde(serialize_with = "super::serialize_hex")]
    pub public_key: Vec<u8>,
    pub path: DerivationPath,
    #[serde(serialize_with = "super::serialize_hex")]
    pub payload_hash: Vec<u8>,
}

/// Submittable object: the unsigned fields unchanged plus `signature` and
/// `publicKey`.
pub fn combine_signature(unsigned: &UnsignedTransaction, signed: &SignatureResult) -> CustodyResult<Value> {
    for key in ["signature", "publicKey"] {
        if unsigned.fields.contains_key(key) {
            return Err(CustodyError::Validation(format!("payload already has {}", key)));
        }
    }
    let mut out = unsigned.fields.clone();
    out.insert("signature".to_string(), Value::String(signed.signature.to_hex()));
    out.insert("publicKey".to_string(), Value::String(hex::encode(&signed.public_key)));
    Ok(Value::Object(out))
}

/// Serialize with sorted keys and no whitespace.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => {
            out.push_str(&value.to_string());
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_by(|a, b| a.as_bytes().cmp(b.as_bytes()));
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
    }
}
