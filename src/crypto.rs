//! Signature verification seam consumed by guards
use crate::trade::CounterpartyRef;

/// Verification predicate supplied by the cryptographic collaborator.
/// The engine never holds key material.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, signer: &CounterpartyRef, payload: &[u8], signature: &[u8]) -> bool;
}

/// sha256(signer || payload) commitment. Binds a payload to a peer handle so
/// loopback setups and tests can exercise the signature guards; it is not a
/// signature scheme.
#[derive(Debug, Default, Clone, Copy)]
pub struct DigestCommitment;

impl DigestCommitment {
    pub fn commit(signer: &CounterpartyRef, payload: &[u8]) -> Vec<u8> {
        let digest = sha256::digest(preimage(signer, payload));
        // sha256 returns lowercase hex, which always decodes
        hex::decode(digest).unwrap_or_default()
    }
}

impl SignatureVerifier for DigestCommitment {
    fn verify(&self, signer: &CounterpartyRef, payload: &[u8], signature: &[u8]) -> bool {
        !signature.is_empty() && hex::encode(signature) == sha256::digest(preimage(signer, payload))
    }
}

fn preimage(signer: &CounterpartyRef, payload: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(signer.as_str().len() + 1 + payload.len());
    bytes.extend_from_slice(signer.as_str().as_bytes());
    bytes.push(0);
    bytes.extend_from_slice(payload);
    bytes
}
