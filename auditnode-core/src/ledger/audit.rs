//! Audit records and their canonical encoding.
//!
//! An audit describes one file access, signed by the client that observed
//! it. Signing and Merkle hashing are both defined over the *canonical*
//! encoding: a compact JSON object with the five payload keys in
//! lexicographic order and the `signature`/`public_key` fields excluded.
//! Every node and every client must produce bit-identical canonical bytes
//! for identical field values.

use serde::{Deserialize, Serialize};

use crate::crypto;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub file_id: String,
    pub file_name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub user_id: String,
    pub user_name: String,
}

/// One signed file-access record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Audit {
    /// Opaque unique id; the mempool deduplication key.
    pub req_id: String,
    /// Client-supplied timestamp.
    pub timestamp: i64,
    pub access_type: String,
    pub file_info: FileInfo,
    pub user_info: UserInfo,
    /// Base64 RSA PKCS#1 v1.5 / SHA-256 signature over the canonical bytes.
    pub signature: String,
    /// PEM public key of the signer.
    pub public_key: String,
}

// Canonical form. Field declaration order IS the wire order (serde emits
// struct fields in declaration order), and it is exactly the lexicographic
// order the protocol fixes: access_type, file_info, req_id, timestamp,
// user_info. Signature material never participates.
#[derive(Serialize)]
struct CanonicalAudit<'a> {
    access_type: &'a str,
    file_info: CanonicalFileInfo<'a>,
    req_id: &'a str,
    timestamp: i64,
    user_info: CanonicalUserInfo<'a>,
}

#[derive(Serialize)]
struct CanonicalFileInfo<'a> {
    file_id: &'a str,
    file_name: &'a str,
}

#[derive(Serialize)]
struct CanonicalUserInfo<'a> {
    user_id: &'a str,
    user_name: &'a str,
}

impl Audit {
    /// The byte-exact canonical encoding this audit was (or must be) signed
    /// over. Compact JSON, fixed key order, no signature material.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let canonical = CanonicalAudit {
            access_type: &self.access_type,
            file_info: CanonicalFileInfo {
                file_id: &self.file_info.file_id,
                file_name: &self.file_info.file_name,
            },
            req_id: &self.req_id,
            timestamp: self.timestamp,
            user_info: CanonicalUserInfo {
                user_id: &self.user_info.user_id,
                user_name: &self.user_info.user_name,
            },
        };
        serde_json::to_vec(&canonical).expect("canonical audit form is always serializable")
    }

    /// Merkle leaf digest: hex SHA-256 of the canonical bytes.
    pub fn leaf_hash(&self) -> String {
        crypto::sha256_hex(&self.canonical_bytes())
    }

    /// Check this audit's signature against its own public key.
    pub fn verify(&self) -> bool {
        crypto::verify_signature(&self.canonical_bytes(), &self.signature, &self.public_key)
    }
}
