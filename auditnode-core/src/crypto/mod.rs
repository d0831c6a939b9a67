//! Hashing and signature primitives for the audit ledger.
//!
//! Everything here is pure: bytes in, digest or verdict out. Signature
//! verification in particular holds no state and is safe to call from any
//! number of concurrent RPC handlers.

use std::fs;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::{
    DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding,
};
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

/// Key size for generated client keypairs.
const RSA_BITS: usize = 2048;

/// Lowercase hex SHA-256 digest of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Merkle reduction over an ordered list of hex leaf digests.
///
/// Adjacent digests are concatenated *as hex text* and re-hashed; a level
/// with an odd count duplicates its last element. An empty list reduces to
/// the hash of the empty string, a single leaf to itself. Every peer and the
/// client tooling must use exactly this reduction or roots will disagree.
pub fn merkle_root(leaves: &[String]) -> String {
    if leaves.is_empty() {
        return sha256_hex(b"");
    }
    let mut level: Vec<String> = leaves.to_vec();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| {
                let left = &pair[0];
                let right = pair.get(1).unwrap_or(left);
                sha256_hex(format!("{left}{right}").as_bytes())
            })
            .collect();
    }
    level.remove(0)
}

/// Verify an RSA PKCS#1 v1.5 / SHA-256 signature over `data`.
///
/// `signature_b64` is the base64 signature from the wire, `pubkey_pem` the
/// signer's PEM public key (SPKI or PKCS#1 form). Fails closed: any decode,
/// parse, or cryptographic error is simply `false`.
pub fn verify_signature(data: &[u8], signature_b64: &str, pubkey_pem: &str) -> bool {
    let signature = match BASE64.decode(signature_b64.trim()) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    let key = match parse_public_key_pem(pubkey_pem) {
        Some(key) => key,
        None => return false,
    };
    let digest = Sha256::digest(data);
    key.verify(Pkcs1v15Sign::new::<Sha256>(), &digest, &signature)
        .is_ok()
}

fn parse_public_key_pem(pem: &str) -> Option<RsaPublicKey> {
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .ok()
}

/// Sign `data` with the given private key, returning the base64 signature.
pub fn sign_payload(key: &RsaPrivateKey, data: &[u8]) -> anyhow::Result<String> {
    let digest = Sha256::digest(data);
    let signature = key.sign(Pkcs1v15Sign::new::<Sha256>(), &digest)?;
    Ok(BASE64.encode(signature))
}

/// Generate a fresh client keypair.
pub fn generate_keypair() -> anyhow::Result<RsaPrivateKey> {
    let mut rng = rand::rngs::OsRng;
    Ok(RsaPrivateKey::new(&mut rng, RSA_BITS)?)
}

/// SPKI PEM encoding of the public half of `key`.
pub fn public_key_pem(key: &RsaPrivateKey) -> anyhow::Result<String> {
    Ok(RsaPublicKey::from(key).to_public_key_pem(LineEnding::LF)?)
}

/// Where the public PEM lands for a given private key path
/// (`client.pem` -> `client.pub.pem`).
pub fn public_pem_path(private_path: &Path) -> PathBuf {
    let mut name = private_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "key".to_string());
    name.push_str(".pub.pem");
    private_path.with_file_name(name)
}

/// Write `key` as a PKCS#8 private PEM plus its SPKI public PEM sibling.
pub fn save_keypair(private_path: &Path, key: &RsaPrivateKey) -> anyhow::Result<PathBuf> {
    if let Some(parent) = private_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let private_pem = key.to_pkcs8_pem(LineEnding::LF)?;
    fs::write(private_path, private_pem.as_bytes())?;
    let public_path = public_pem_path(private_path);
    fs::write(&public_path, public_key_pem(key)?)?;
    Ok(public_path)
}

/// Load a PKCS#8 private key PEM from disk.
pub fn load_private_key(path: &Path) -> anyhow::Result<RsaPrivateKey> {
    let pem = fs::read_to_string(path)?;
    Ok(RsaPrivateKey::from_pkcs8_pem(&pem)?)
}
