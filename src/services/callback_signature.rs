//! Provider callback signatures (VNPay-style HMAC-SHA512).

use hmac::{Hmac, Mac};
use sha2::Sha512;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::errors::ServiceError;

type HmacSha512 = Hmac<Sha512>;

pub const SECURE_HASH_FIELD: &str = "vnp_SecureHash";
pub const SECURE_HASH_TYPE_FIELD: &str = "vnp_SecureHashType";

/// Verifies a provider payload before anything else looks at it.
pub trait CallbackVerifier: Send + Sync {
    fn verify(&self, params: &BTreeMap<String, String>) -> Result<(), ServiceError>;
}

pub type SharedCallbackVerifier = Arc<dyn CallbackVerifier>;

#[derive(Clone)]
pub struct VnpaySignature {
    secret: String,
}

impl std::fmt::Debug for VnpaySignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VnpaySignature").finish_non_exhaustive()
    }
}

impl VnpaySignature {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Signed fields sorted by key, empty values and the hash fields dropped,
    /// each rendered as `key=urlencoded(value)` and joined with `&`.
    pub fn canonicalize(params: &BTreeMap<String, String>) -> String {
        params
            .iter()
            .filter(|(k, v)| {
                !v.is_empty() && k.as_str() != SECURE_HASH_FIELD && k.as_str() != SECURE_HASH_TYPE_FIELD
            })
            .map(|(k, v)| format!("{}={}", encode(k), encode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }

    fn mac(&self) -> Result<HmacSha512, ServiceError> {
        HmacSha512::new_from_slice(self.secret.as_bytes())
            .map_err(|e| ServiceError::InternalError(format!("invalid hash secret: {}", e)))
    }

    /// Lowercase hex HMAC-SHA512 over the canonical string.
    pub fn sign(&self, params: &BTreeMap<String, String>) -> Result<String, ServiceError> {
        let mut mac = self.mac()?;
        mac.update(Self::canonicalize(params).as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

impl CallbackVerifier for VnpaySignature {
    fn verify(&self, params: &BTreeMap<String, String>) -> Result<(), ServiceError> {
        let provided = params
            .get(SECURE_HASH_FIELD)
            .filter(|s| !s.is_empty())
            .ok_or(ServiceError::InvalidSignature)?;
        // hex::decode accepts either case
        let provided = hex::decode(provided).map_err(|_| ServiceError::InvalidSignature)?;

        let mut mac = self.mac()?;
        mac.update(Self::canonicalize(params).as_bytes());
        mac.verify_slice(&provided)
            .map_err(|_| ServiceError::InvalidSignature)
    }
}

fn encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn canonical_form_sorts_encodes_and_skips() {
        let p = params(&[
            ("vnp_TxnRef", "KM1"),
            ("vnp_Amount", "1000000"),
            ("vnp_OrderInfo", "Thanh toan don hang"),
            ("vnp_BankCode", ""),
            ("vnp_SecureHashType", "HmacSHA512"),
            ("vnp_SecureHash", "abc"),
        ]);
        assert_eq!(
            VnpaySignature::canonicalize(&p),
            "vnp_Amount=1000000&vnp_OrderInfo=Thanh+toan+don+hang&vnp_TxnRef=KM1"
        );
    }

    #[test]
    fn signed_payload_verifies_in_either_case() {
        let signer = VnpaySignature::new("test-secret-0123456789");
        let mut p = params(&[("vnp_TxnRef", "KM1"), ("vnp_ResponseCode", "00")]);
        let sig = signer.sign(&p).unwrap();
        assert_eq!(sig.len(), 128);
        assert_eq!(sig, sig.to_lowercase());

        p.insert(SECURE_HASH_FIELD.to_string(), sig.to_uppercase());
        assert!(signer.verify(&p).is_ok());
    }

    #[test]
    fn tampered_or_missing_signature_is_rejected() {
        let signer = VnpaySignature::new("test-secret-0123456789");
        let mut p = params(&[("vnp_TxnRef", "KM1"), ("vnp_Amount", "100")]);
        assert!(matches!(signer.verify(&p), Err(ServiceError::InvalidSignature)));

        let sig = signer.sign(&p).unwrap();
        p.insert(SECURE_HASH_FIELD.to_string(), sig);
        p.insert("vnp_Amount".to_string(), "200".to_string());
        assert!(matches!(signer.verify(&p), Err(ServiceError::InvalidSignature)));

        p.insert(SECURE_HASH_FIELD.to_string(), "not-hex".to_string());
        assert!(matches!(signer.verify(&p), Err(ServiceError::InvalidSignature)));
    }

    #[test]
    fn other_secret_does_not_verify() {
        let mut p = params(&[("vnp_TxnRef", "KM1")]);
        let sig = VnpaySignature::new("secret-one-0123456789").sign(&p).unwrap();
        p.insert(SECURE_HASH_FIELD.to_string(), sig);
        assert!(VnpaySignature::new("secret-two-0123456789").verify(&p).is_err());
    }
}
