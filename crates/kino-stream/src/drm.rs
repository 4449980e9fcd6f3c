//! Decryption seam
//!
//! License acquisition and the actual cipher live outside this crate; the
//! pipeline only needs to know whether a fragment decrypted, failed, or is
//! blocked on a license that never arrived.

use crate::types::FragmentDescriptor;
use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Decryption failure classes
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecryptError {
    /// The license/key was not delivered in time
    #[error("key acquisition timed out")]
    KeyAcquisitionTimeout,
    /// Any other decryption failure
    #[error("decryption failed: {0}")]
    Failure(String),
}

/// Decrypts fragment payloads
#[async_trait]
pub trait Decryptor: Send + Sync {
    /// Decrypt `payload`; clear fragments are returned untouched
    async fn decrypt(&self, payload: Bytes, descriptor: &FragmentDescriptor) -> Result<Bytes, DecryptError>;

    /// Release session resources once the track has stopped
    async fn release(&self) {}
}

/// Pass-through decryptor for clear content
#[derive(Debug, Clone, Copy, Default)]
pub struct ClearDecryptor;

#[async_trait]
impl Decryptor for ClearDecryptor {
    async fn decrypt(&self, payload: Bytes, descriptor: &FragmentDescriptor) -> Result<Bytes, DecryptError> {
        if descriptor.encrypted {
            return Err(DecryptError::Failure(format!(
                "fragment {} is encrypted but no decryptor is configured",
                descriptor.sequence
            )));
        }
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    #[tokio::test]
    async fn test_clear_decryptor() {
        let uri = Url::parse("https://cdn.example.com/seg1.m4s").unwrap();
        let mut descriptor = FragmentDescriptor::media(1, uri, 0.0, 2.0);
        let payload = Bytes::from_static(b"clear");

        let out = ClearDecryptor.decrypt(payload.clone(), &descriptor).await.unwrap();
        assert_eq!(out, payload);

        descriptor.encrypted = true;
        assert!(matches!(
            ClearDecryptor.decrypt(payload, &descriptor).await,
            Err(DecryptError::Failure(_))
        ));
        assert_eq!(
            DecryptError::Failure("bad key id".into()).to_string(),
            "decryption failed: bad key id"
        );
    }
}
