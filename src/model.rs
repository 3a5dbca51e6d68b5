//! Device model assertions and the measurement digests derived from them.

use crate::tpm::pcr::{Digest, HashAlgorithm};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Measurement format generation extended before the model. Bumped whenever
/// what is measured into the model PCR changes.
pub const SYSTEM_EPOCH: u32 = 0;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ModelError {
    #[error("model assertion has no {0}")]
    MissingField(&'static str),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Grade {
    #[default]
    Unset,
    Secured,
    Signed,
    Dangerous,
}

impl Grade {
    pub fn code(self) -> u8 {
        match self {
            Grade::Unset => 0,
            Grade::Secured => 1,
            Grade::Signed => 2,
            Grade::Dangerous => 3,
        }
    }
}

/// A signed model assertion whose signature has already been verified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ModelAssertion {
    pub series: String,
    pub brand_id: String,
    pub model: String,
    #[serde(default)]
    pub grade: Grade,
    /// Identifier of the key that signed the assertion.
    pub sign_key_id: String,
}

impl ModelAssertion {
    pub fn validate(&self) -> Result<(), ModelError> {
        for (name, value) in [
            ("series", &self.series),
            ("brand-id", &self.brand_id),
            ("model", &self.model),
            ("sign-key-id", &self.sign_key_id),
        ] {
            if value.is_empty() {
                return Err(ModelError::MissingField(name));
            }
        }
        Ok(())
    }

    /// Measurement of this model in `bank`:
    ///
    /// ```text
    /// d1 = H(sign-key-id || brand-id)
    /// d2 = H(d1 || model)
    /// d  = H(d2 || series || grade)
    /// ```
    ///
    /// Strings are prefixed with their length as a little endian u32.
    pub fn digest(&self, bank: HashAlgorithm) -> Digest {
        let d1 = bank.hash_parts(&[
            &length_prefixed(&self.sign_key_id),
            &length_prefixed(&self.brand_id),
        ]);
        let d2 = bank.hash_parts(&[d1.as_ref(), &length_prefixed(&self.model)]);
        bank.hash_parts(&[
            d2.as_ref(),
            &length_prefixed(&self.series),
            &[self.grade.code()],
        ])
    }
}

fn length_prefixed(s: &str) -> Vec<u8> {
    let mut buf = (s.len() as u32).to_le_bytes().to_vec();
    buf.extend_from_slice(s.as_bytes());
    buf
}

pub fn system_epoch_digest(bank: HashAlgorithm, epoch: u32) -> Digest {
    bank.hash(&epoch.to_le_bytes())
}

#[cfg(test)]
pub(crate) fn test_model(model: &str) -> ModelAssertion {
    ModelAssertion {
        series: "16".into(),
        brand_id: "canonical".into(),
        model: model.into(),
        grade: Grade::Signed,
        sign_key_id: "9tydnLa6MTJ-jaQTFUXEwHl1yRx7ZS4K5cyFDhYDcPzhS7uyEkDxdUjg9g08BtNn".into(),
    }
}
