//! Homomorphic add / reduce / scalar-mult / plaintext-sub.
//!
//! Every operation is pure: operands are borrowed and a new
//! [`EncryptedValue`] is returned. Nothing here can reach the secret key.

use std::sync::Arc;

use log::debug;
use rayon::prelude::*;

use crate::cipher::EncryptedValue;
use crate::codec::{Plaintext, RawValue};
use crate::error::{ConfigError, Error, Result};
use crate::params::SESSION_DEPTH;

impl EncryptedValue {
    fn ensure_same_session(&self, other: &EncryptedValue) -> Result<()> {
        if Arc::ptr_eq(&self.core, &other.core) || self.core.same_session(&other.core) {
            Ok(())
        } else {
            Err(Error::ContextMismatch {
                left: self.core.id,
                right: other.core.id,
            })
        }
    }

    fn ensure_scale(&self, other: f64) -> Result<()> {
        if (self.scale - other).abs() <= f64::EPSILON * self.scale.abs().max(1.0) {
            Ok(())
        } else {
            Err(Error::ScaleMismatch {
                left: self.scale,
                right: other,
            })
        }
    }

    /// Slot-wise sum. Commutative and associative.
    pub fn add(&self, other: &EncryptedValue) -> Result<EncryptedValue> {
        self.ensure_same_session(other)?;
        self.ensure_scale(other.scale)?;
        Ok(EncryptedValue {
            ct: &self.ct + &other.ct,
            core: Arc::clone(&self.core),
            scale: self.scale,
            depth: self.depth.max(other.depth),
            slots: self.slots.max(other.slots),
            provenance: self.provenance + other.provenance,
        })
    }

    /// Left fold over `values` in slice order: `((v0 + v1) + v2) + …`.
    ///
    /// The decoded result does not depend on the order; the fixed order only
    /// makes runs reproducible.
    pub fn add_many(values: &[EncryptedValue]) -> Result<EncryptedValue> {
        let (first, rest) = values.split_first().ok_or(Error::EmptyAggregation)?;
        let sum = rest.iter().try_fold(first.clone(), |acc, v| acc.add(v))?;
        debug!("folded {} ciphertext(s), provenance {}", values.len(), sum.provenance);
        Ok(sum)
    }

    /// Tree reduction across the rayon pool. Same result as [`add_many`],
    /// combination order unspecified.
    ///
    /// [`add_many`]: EncryptedValue::add_many
    pub fn add_many_parallel(values: &[EncryptedValue]) -> Result<EncryptedValue> {
        values
            .par_iter()
            .map(|v| Ok(v.clone()))
            .try_reduce_with(|a, b| a.add(&b))
            .unwrap_or(Err(Error::EmptyAggregation))
    }

    /// Multiplies every slot by a clear scalar. Approximate values move to
    /// scale `Δ·Δs`; the scalar itself is never encrypted.
    pub fn scalar_multiply(&self, scalar: impl Into<RawValue>) -> Result<EncryptedValue> {
        if self.depth >= SESSION_DEPTH {
            return Err(ConfigError::DepthExhausted {
                used: self.depth,
                max: SESSION_DEPTH,
            }
            .into());
        }
        let pt = self.core.codec.encode_scalar(scalar.into())?;
        let operand = self.core.lower(&pt)?;
        Ok(EncryptedValue {
            ct: &self.ct * &operand,
            core: Arc::clone(&self.core),
            scale: self.scale * pt.scale(),
            depth: self.depth + 1,
            slots: self.slots,
            provenance: self.provenance,
        })
    }

    /// Slot-wise `self - plaintext`. The plaintext must be encoded at this
    /// value's current scale.
    pub fn subtract_plaintext(&self, plaintext: &Plaintext) -> Result<EncryptedValue> {
        self.ensure_scale(plaintext.scale())?;
        let operand = self.core.lower(plaintext)?;
        Ok(EncryptedValue {
            ct: &self.ct - &operand,
            core: Arc::clone(&self.core),
            scale: self.scale,
            depth: self.depth,
            slots: self.slots.max(plaintext.len()),
            provenance: self.provenance,
        })
    }

    /// Subtracts a clear value from slot 0, e.g. `age - required_age`.
    pub fn subtract_value(&self, value: impl Into<RawValue>) -> Result<EncryptedValue> {
        let pt = self.core.codec.encode_operand(value.into(), self.scale)?;
        self.subtract_plaintext(&pt)
    }

    /// Collapses the packed slots into their sum (rotate-and-add with the
    /// session's Galois keys).
    pub fn sum_elements(&self) -> Result<EncryptedValue> {
        let eval_key = self.core.eval_key.as_ref().ok_or(Error::MissingEvaluationKey)?;
        let ct = eval_key.computes_inner_sum(&self.ct)?;
        Ok(EncryptedValue {
            ct,
            core: Arc::clone(&self.core),
            scale: self.scale,
            depth: self.depth,
            slots: 1,
            provenance: self.provenance,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decryptor::Decryptor;
    use crate::params::{batching_modulus, ContextParams, DEFAULT_MODULUS_CHAIN};
    use crate::scheme::{EncryptionContext, PublicContext};

    fn exact_session(eval_keys: bool) -> (PublicContext, Decryptor) {
        let t = batching_modulus(4096, 20).unwrap();
        let mut params = ContextParams::exact_modular(4096, DEFAULT_MODULUS_CHAIN.to_vec(), t);
        params.evaluation_keys = eval_keys;
        let (ctx, keys) = EncryptionContext::create(params).unwrap();
        let decryptor = Decryptor::new(&ctx, keys.secret_key).unwrap();
        (ctx.derive_public_view(), decryptor)
    }

    fn approx_session() -> (PublicContext, Decryptor) {
        let params =
            ContextParams::approximate(4096, DEFAULT_MODULUS_CHAIN.to_vec(), 65536.0);
        let (ctx, keys) = EncryptionContext::create(params).unwrap();
        let decryptor = Decryptor::new(&ctx, keys.secret_key).unwrap();
        (ctx.derive_public_view(), decryptor)
    }

    fn enc(ctx: &PublicContext, v: i64) -> EncryptedValue {
        ctx.encrypt_values(&[RawValue::from(v)]).unwrap()
    }

    #[test]
    fn test_add_is_exact_and_pure() {
        let (ctx, dec) = exact_session(false);
        let a = enc(&ctx, 40);
        let b = enc(&ctx, -55);
        let sum = a.add(&b).unwrap();
        assert_eq!(dec.finalize(&sum).unwrap().value, RawValue::Integer(-15));
        assert_eq!(sum.provenance(), 2);
        // operands untouched
        assert_eq!(dec.finalize(&a).unwrap().value, RawValue::Integer(40));
    }

    #[test]
    fn test_add_many_empty_fails() {
        assert!(matches!(EncryptedValue::add_many(&[]), Err(Error::EmptyAggregation)));
        assert!(matches!(
            EncryptedValue::add_many_parallel(&[]),
            Err(Error::EmptyAggregation)
        ));
    }

    #[test]
    fn test_parallel_reduction_matches_fold() {
        let (ctx, dec) = exact_session(false);
        let values: Vec<_> = (1..=9).map(|v| enc(&ctx, v)).collect();
        let folded = EncryptedValue::add_many(&values).unwrap();
        let tree = EncryptedValue::add_many_parallel(&values).unwrap();
        assert_eq!(dec.finalize(&folded).unwrap().value, RawValue::Integer(45));
        assert_eq!(dec.finalize(&tree).unwrap().value, RawValue::Integer(45));
        assert_eq!(tree.provenance(), 9);
    }

    #[test]
    fn test_scalar_multiply_consumes_depth() {
        let (ctx, dec) = exact_session(false);
        let doubled = enc(&ctx, 21).scalar_multiply(2).unwrap();
        assert_eq!(doubled.depth(), 1);
        assert_eq!(dec.finalize(&doubled).unwrap().value, RawValue::Integer(42));
        assert!(matches!(
            doubled.scalar_multiply(2),
            Err(Error::Configuration(ConfigError::DepthExhausted { used: 1, max: 1 }))
        ));
    }

    #[test]
    fn test_approximate_average_scale_tracking() {
        let (ctx, dec) = approx_session();
        let a = ctx.encrypt_values(&[RawValue::from(10.5)]).unwrap();
        let b = ctx.encrypt_values(&[RawValue::from(4.5)]).unwrap();
        let avg = a.add(&b).unwrap().scalar_multiply(0.5).unwrap();
        assert_eq!(avg.scale(), 65536.0 * ctx.codec().scalar_scale());
        let got = dec.finalize(&avg).unwrap().value.as_f64();
        assert!((got - 7.5).abs() < 1e-3, "got {got}");

        // mixing scales is refused
        assert!(matches!(avg.add(&a), Err(Error::ScaleMismatch { .. })));
    }

    #[test]
    fn test_approximate_second_multiply_is_refused() {
        let (ctx, dec) = approx_session();
        let third = ctx
            .encrypt_values(&[RawValue::from(90.0)])
            .unwrap()
            .scalar_multiply(1.0 / 3.0)
            .unwrap();
        assert!((dec.finalize(&third).unwrap().value.as_f64() - 30.0).abs() < 1e-3);
        assert!(matches!(
            third.scalar_multiply(0.5),
            Err(Error::Configuration(ConfigError::DepthExhausted { used: 1, max: 1 }))
        ));
    }

    #[test]
    fn test_subtract_value_signed() {
        let (ctx, dec) = exact_session(false);
        let diff = enc(&ctx, 10).subtract_value(18).unwrap();
        assert_eq!(dec.finalize(&diff).unwrap().value, RawValue::Integer(-8));
    }

    #[test]
    fn test_sum_elements_requires_eval_keys() {
        let (ctx, _) = exact_session(false);
        let packed = ctx
            .encrypt_values(&[RawValue::from(1), RawValue::from(2)])
            .unwrap();
        assert!(matches!(packed.sum_elements(), Err(Error::MissingEvaluationKey)));
    }

    #[test]
    fn test_sum_elements_collapses_slots() {
        let (ctx, dec) = exact_session(true);
        let packed = ctx
            .encrypt_values(&[3, 4, 5].map(RawValue::from))
            .unwrap();
        assert_eq!(packed.slot_count(), 3);
        let total = packed.sum_elements().unwrap();
        assert_eq!(total.slot_count(), 1);
        assert_eq!(total.provenance(), 3);
        assert_eq!(dec.finalize(&total).unwrap().value, RawValue::Integer(12));
    }

    #[test]
    fn test_mixing_contexts_is_rejected() {
        let (a_ctx, _) = exact_session(false);
        let (b_ctx, _) = exact_session(false);
        let a = enc(&a_ctx, 1);
        let b = enc(&b_ctx, 1);
        assert!(matches!(a.add(&b), Err(Error::ContextMismatch { .. })));
        assert!(matches!(
            EncryptedValue::add_many(&[a.clone(), a, b]),
            Err(Error::ContextMismatch { .. })
        ));
    }
}
