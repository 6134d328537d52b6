//! Plugin artifact signature verification.
//!
//! A plugin may ship a detached `plugin.sig` next to its manifest: the
//! base64-encoded ed25519 signature over the blake3 hash of the entry
//! artifact. Verification succeeds when any configured trusted key accepts
//! the signature.

use autoweave_core::{Error, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};

/// Verifies plugin signatures against the host's trusted key set
#[derive(Debug)]
pub struct SignatureVerifier {
    keys: Vec<VerifyingKey>,
}

impl SignatureVerifier {
    /// Build from base64-encoded 32-byte public keys
    pub fn from_base64_keys(encoded: &[String]) -> Result<Self> {
        let mut keys = Vec::with_capacity(encoded.len());
        for (index, key) in encoded.iter().enumerate() {
            let bytes = BASE64
                .decode(key)
                .map_err(|e| Error::configuration(format!("trusted key {index} is not base64: {e}")))?;
            let bytes: [u8; 32] = bytes.try_into().map_err(|_| {
                Error::configuration(format!("trusted key {index} is not 32 bytes"))
            })?;
            let key = VerifyingKey::from_bytes(&bytes).map_err(|e| {
                Error::configuration(format!("trusted key {index} is not a valid ed25519 key: {e}"))
            })?;
            keys.push(key);
        }
        Ok(Self { keys })
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Verify a detached signature blob over an artifact. The signed message
    /// is the artifact's blake3 hash.
    pub fn verify(&self, plugin_id: &str, artifact: &[u8], signature_blob: &str) -> Result<()> {
        let bytes = BASE64
            .decode(signature_blob.trim())
            .map_err(|e| Error::SignatureInvalid {
                plugin_id: plugin_id.to_string(),
                reason: format!("signature is not base64: {e}"),
            })?;
        let bytes: [u8; 64] = bytes.try_into().map_err(|_| Error::SignatureInvalid {
            plugin_id: plugin_id.to_string(),
            reason: "signature is not 64 bytes".to_string(),
        })?;
        let signature = Signature::from_bytes(&bytes);

        let digest = blake3::hash(artifact);
        let accepted = self
            .keys
            .iter()
            .any(|key| key.verify(digest.as_bytes(), &signature).is_ok());

        if accepted {
            Ok(())
        } else {
            Err(Error::SignatureInvalid {
                plugin_id: plugin_id.to_string(),
                reason: "no trusted key accepts this signature".to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    fn keypair(seed: u8) -> (SigningKey, String) {
        let signing = SigningKey::from_bytes(&[seed; 32]);
        let public = BASE64.encode(signing.verifying_key().as_bytes());
        (signing, public)
    }

    fn sign(signing: &SigningKey, artifact: &[u8]) -> String {
        let digest = blake3::hash(artifact);
        BASE64.encode(signing.sign(digest.as_bytes()).to_bytes())
    }

    #[test]
    fn test_valid_signature() {
        let (signing, public) = keypair(7);
        let verifier = SignatureVerifier::from_base64_keys(&[public]).unwrap();

        let artifact = b"#!/bin/plugin";
        let blob = sign(&signing, artifact);
        assert!(verifier.verify("usb-scanner", artifact, &blob).is_ok());
    }

    #[test]
    fn test_untrusted_key_rejected() {
        let (signing, _) = keypair(7);
        let (_, other_public) = keypair(9);
        let verifier = SignatureVerifier::from_base64_keys(&[other_public]).unwrap();

        let artifact = b"#!/bin/plugin";
        let blob = sign(&signing, artifact);
        let err = verifier.verify("usb-scanner", artifact, &blob).unwrap_err();
        assert_eq!(err.kind(), "signature-invalid");
    }

    #[test]
    fn test_tampered_artifact_rejected() {
        let (signing, public) = keypair(7);
        let verifier = SignatureVerifier::from_base64_keys(&[public]).unwrap();

        let blob = sign(&signing, b"#!/bin/plugin");
        let err = verifier
            .verify("usb-scanner", b"#!/bin/tampered", &blob)
            .unwrap_err();
        assert_eq!(err.kind(), "signature-invalid");
    }

    #[test]
    fn test_garbage_signature_blob() {
        let (_, public) = keypair(7);
        let verifier = SignatureVerifier::from_base64_keys(&[public]).unwrap();

        assert!(verifier.verify("p", b"x", "not base64 !!!").is_err());
        assert!(verifier.verify("p", b"x", &BASE64.encode([0u8; 16])).is_err());
    }

    #[test]
    fn test_bad_trusted_key_config() {
        let err = SignatureVerifier::from_base64_keys(&["zzz".to_string()]).unwrap_err();
        assert_eq!(err.kind(), "config-error");
    }
}
