//! Decrypting party: exclusive owner of the secret key.

use std::sync::Arc;

use fhe::bfv::Encoding;
use fhe_traits::{FheDecoder, FheDecrypter};
use serde::Serialize;

use crate::aggregator::{AggregationPolicy, SessionOutcome};
use crate::cipher::EncryptedValue;
use crate::codec::RawValue;
use crate::error::{Error, Result};
use crate::scheme::{ContextCore, EncryptionContext, SecretKey};

/// Final, fully decrypted answer of an aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AggregationResult {
    /// Real for approximate sessions, signed integer for exact ones and tallies.
    pub value: RawValue,
    /// Number of raw contributor values behind the result.
    pub provenance: usize,
    /// Set for threshold checks: `value >= 0`.
    pub passed: Option<bool>,
}

impl AggregationResult {
    /// `false` unless this is a threshold result that passed.
    pub fn passed(&self) -> bool {
        self.passed.unwrap_or(false)
    }
}

/// Holder of a session's secret key. Only produces [`AggregationResult`]s.
pub struct Decryptor {
    core: Arc<ContextCore>,
    secret: SecretKey,
}

impl Decryptor {
    /// Binds `secret_key` to the context it was generated with.
    pub fn new(context: &EncryptionContext, secret_key: SecretKey) -> Result<Self> {
        let core = Arc::clone(context.core());
        if secret_key.context != core.id {
            return Err(Error::ContextMismatch {
                left: core.id,
                right: secret_key.context,
            });
        }
        Ok(Self {
            core,
            secret: secret_key,
        })
    }

    fn residues(&self, value: &EncryptedValue) -> Result<Vec<u64>> {
        if !self.core.same_session(&value.core) {
            return Err(Error::ContextMismatch {
                left: self.core.id,
                right: value.core.id,
            });
        }
        let pt = self.secret.inner.try_decrypt(&value.ct)?;
        Ok(Vec::<u64>::try_decode(&pt, Encoding::simd())?)
    }

    /// Every meaningful slot of `value`, decoded.
    pub fn decrypt_slots(&self, value: &EncryptedValue) -> Result<Vec<RawValue>> {
        let codec = &self.core.codec;
        Ok(self
            .residues(value)?
            .into_iter()
            .take(value.slots)
            .map(|r| codec.decode(r, value.scale))
            .collect())
    }

    /// Decodes slot 0.
    pub fn finalize(&self, value: &EncryptedValue) -> Result<AggregationResult> {
        let residue = self.residues(value)?.first().copied().unwrap_or(0);
        Ok(AggregationResult {
            value: self.core.codec.decode(residue, value.scale),
            provenance: value.provenance,
            passed: None,
        })
    }

    /// Decodes slot 0 and reports `passed = value >= 0`.
    pub fn finalize_threshold(&self, value: &EncryptedValue) -> Result<AggregationResult> {
        let mut result = self.finalize(value)?;
        result.passed = Some(result.value.as_f64() >= 0.0);
        Ok(result)
    }

    /// Decodes a combined session according to its policy.
    pub fn finalize_outcome(&self, outcome: SessionOutcome) -> Result<AggregationResult> {
        match outcome.policy {
            AggregationPolicy::Sum | AggregationPolicy::WeightedAverage { .. } => {
                self.finalize(&outcome.value)
            }
            AggregationPolicy::Tally => {
                let mut result = self.finalize(&outcome.value)?;
                if let RawValue::Real(v) = result.value {
                    result.value = RawValue::Integer(v.round() as i64);
                }
                Ok(result)
            }
            AggregationPolicy::ThresholdCheck { .. } => self.finalize_threshold(&outcome.value),
        }
    }
}
