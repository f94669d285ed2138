use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};

use super::SecurityError;
use crate::manifest::ManifestSignature;

pub const SIGNATURE_ALGORITHM: &str = "ed25519";

/// Verifies `signature` over the bytes of the hex-encoded `checksum`.
pub fn verify_signature(signature: &ManifestSignature, checksum: &str) -> Result<(), SecurityError> {
    if !signature.algorithm.eq_ignore_ascii_case(SIGNATURE_ALGORITHM) {
        return Err(SecurityError::InvalidSignature(format!(
            "unsupported algorithm '{}'",
            signature.algorithm
        )));
    }

    let key_bytes = STANDARD
        .decode(signature.public_key.trim())
        .map_err(|e| SecurityError::InvalidSignature(format!("public key: {e}")))?;
    let key_bytes: [u8; 32] = key_bytes.as_slice().try_into().map_err(|_| {
        SecurityError::InvalidSignature(format!(
            "public key must be 32 bytes, got {}",
            key_bytes.len()
        ))
    })?;
    let verifying_key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| SecurityError::InvalidSignature(format!("public key: {e}")))?;

    let sig_bytes = STANDARD
        .decode(signature.value.trim())
        .map_err(|e| SecurityError::InvalidSignature(format!("signature: {e}")))?;
    let sig = Signature::from_slice(&sig_bytes)
        .map_err(|e| SecurityError::InvalidSignature(format!("signature: {e}")))?;

    verifying_key
        .verify(checksum.as_bytes(), &sig)
        .map_err(|_| SecurityError::SignatureMismatch {
            checksum: checksum.to_string(),
        })
}
