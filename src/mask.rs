//! Identifier masking codec
//!
//! A pure utility that hides internal connection identifiers from external
//! tooling: the identifier is XORed with a cyclic seed, base64-encoded,
//! and prefixed with a fixed marker. Unmasking reverses the steps and
//! validates each of them. The seed is a shared secret between the proxy
//! and whatever reads its output; the codec is not cryptography, just
//! reversible obfuscation.

use base64::prelude::{Engine, BASE64_STANDARD};

use crate::error::MaskError;

/// Reversible identifier masker
#[derive(Debug, Clone)]
pub struct IdMasker {
    prefix: String,
    seed: Vec<u8>,
}

impl IdMasker {
    /// Create a masker with the given prefix and XOR seed
    ///
    /// # Errors
    ///
    /// `EmptySeed` when the seed has no bytes.
    pub fn new(prefix: impl Into<String>, seed: &[u8]) -> Result<Self, MaskError> {
        if seed.is_empty() {
            return Err(MaskError::EmptySeed);
        }
        Ok(Self {
            prefix: prefix.into(),
            seed: seed.to_vec(),
        })
    }

    /// Mask an identifier
    #[must_use]
    pub fn mask(&self, id: &str) -> String {
        let xored = self.xor_cycle(id.as_bytes());
        format!("{}{}", self.prefix, BASE64_STANDARD.encode(xored))
    }

    /// Reverse a masked identifier
    ///
    /// # Errors
    ///
    /// `MissingPrefix` when the marker is absent, `InvalidEncoding` when
    /// the payload is not base64 or does not decode to UTF-8.
    pub fn unmask(&self, masked: &str) -> Result<String, MaskError> {
        let payload = masked
            .strip_prefix(&self.prefix)
            .ok_or_else(|| MaskError::MissingPrefix {
                prefix: self.prefix.clone(),
            })?;
        let decoded = BASE64_STANDARD
            .decode(payload)
            .map_err(|e| MaskError::InvalidEncoding(e.to_string()))?;
        let original = self.xor_cycle(&decoded);
        String::from_utf8(original).map_err(|e| MaskError::InvalidEncoding(e.to_string()))
    }

    fn xor_cycle(&self, data: &[u8]) -> Vec<u8> {
        data.iter()
            .enumerate()
            .map(|(i, b)| b ^ self.seed[i % self.seed.len()])
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_roundtrip() {
        let masker = IdMasker::new("CMX", b"s3cr3t").unwrap();
        let masked = masker.mask("1729@192.0.2.1");
        assert!(masked.starts_with("CMX"));
        assert_ne!(masked, "1729@192.0.2.1");
        assert_eq!(masker.unmask(&masked).unwrap(), "1729@192.0.2.1");
    }

    #[test]
    fn test_empty_seed_rejected() {
        assert!(matches!(IdMasker::new("CMX", b""), Err(MaskError::EmptySeed)));
    }

    #[test]
    fn test_missing_prefix_rejected() {
        let masker = IdMasker::new("CMX", b"seed").unwrap();
        assert!(matches!(
            masker.unmask("XYZabcd"),
            Err(MaskError::MissingPrefix { .. })
        ));
    }

    #[test]
    fn test_bad_encoding_rejected() {
        let masker = IdMasker::new("CMX", b"seed").unwrap();
        assert!(matches!(
            masker.unmask("CMX!!!not-base64!!!"),
            Err(MaskError::InvalidEncoding(_))
        ));
    }

    #[test]
    fn test_seed_longer_than_input() {
        let masker = IdMasker::new("T", b"a-seed-much-longer-than-the-id").unwrap();
        assert_eq!(masker.unmask(&masker.mask("9")).unwrap(), "9");
    }

    #[test]
    fn test_different_seeds_differ() {
        let a = IdMasker::new("CMX", b"seed-one").unwrap();
        let b = IdMasker::new("CMX", b"seed-two").unwrap();
        assert_ne!(a.mask("42"), b.mask("42"));
        assert!(b.unmask(&a.mask("42")).map_or(true, |s| s != "42"));
    }
}
