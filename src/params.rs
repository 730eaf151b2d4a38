//! Scheme parameters and their validation.
//!
//! Both schemes run on batched BFV. `ExactModular` uses the caller's
//! plaintext modulus directly; `Approximate` is fixed-point arithmetic over a
//! plaintext modulus derived from the scale, large enough to hold a value at
//! scale `Δ` times a scalar at scale `2^SCALAR_SCALE_BITS`, plus headroom.
//!
//! The backend lifts plaintexts into every chain modulus, so each modulus of
//! the chain must be wider than the plaintext modulus.

use std::fmt;

use fhe_math::zq::primes::generate_prime;
use fhe_util::is_prime;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Smallest ring degree accepted for a session.
pub const MIN_RING_DEGREE: usize = 4096;
/// Ring degree used by [`ContextParams::default_approximate`] and friends.
pub const DEFAULT_RING_DEGREE: usize = 8192;
/// Modulus chain used by the default parameter sets.
pub const DEFAULT_MODULUS_CHAIN: [usize; 4] = [60, 60, 60, 60];
/// Default fixed-point scale (2^16).
pub const DEFAULT_SCALE: f64 = 65536.0;
/// Bit size of the default exact plaintext modulus.
pub const DEFAULT_PLAINTEXT_BITS: usize = 20;

/// Multiplicative depth every session must support: one scalar multiply.
pub const SESSION_DEPTH: usize = 1;

pub(crate) const MIN_CHAIN_LEN: usize = 2;
pub(crate) const MIN_MODULUS_BITS: usize = 10;
pub(crate) const MAX_MODULUS_BITS: usize = 62;
pub(crate) const MAX_PLAINTEXT_BITS: usize = 60;

/// Fixed-point precision of clear multipliers in approximate sessions.
pub const SCALAR_SCALE_BITS: usize = 24;

/// Magnitude bits reserved for approximate results after a multiply.
const APPROX_HEADROOM_BITS: usize = 18;
/// Noise growth allowance for summing many contributions.
const ADDITION_HEADROOM_BITS: usize = 20;
/// Fresh public-key encryption noise, on top of log2(ring degree).
const FRESH_NOISE_BITS: usize = 8;
/// Extra noise per key switch beyond one modulus and log2(ring degree).
const KEY_SWITCH_SLACK_BITS: usize = 4;

/// Encoding family of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemeKind {
    /// Real numbers, fixed-point, bounded precision loss per operation.
    Approximate,
    /// Integers modulo the plaintext modulus, signed via wraparound.
    ExactModular,
}

impl fmt::Display for SchemeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemeKind::Approximate => f.write_str("approximate"),
            SchemeKind::ExactModular => f.write_str("exact-modular"),
        }
    }
}

/// Parameters of one aggregation session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextParams {
    /// Encoding family.
    pub scheme: SchemeKind,
    /// Polynomial ring degree (power of two, >= 4096). Also the slot count.
    pub ring_degree: usize,
    /// Bit sizes of the ciphertext moduli, in order.
    pub modulus_chain: Vec<usize>,
    /// Fixed-point scale, `Approximate` only.
    #[serde(default)]
    pub scale: Option<f64>,
    /// Plaintext modulus, `ExactModular` only.
    #[serde(default)]
    pub plaintext_modulus: Option<u64>,
    /// Generate Galois keys so packed slots can be summed.
    #[serde(default)]
    pub evaluation_keys: bool,
}

impl ContextParams {
    /// Fixed-point parameters; the plaintext modulus is derived from `scale`.
    pub fn approximate(ring_degree: usize, modulus_chain: Vec<usize>, scale: f64) -> Self {
        Self {
            scheme: SchemeKind::Approximate,
            ring_degree,
            modulus_chain,
            scale: Some(scale),
            plaintext_modulus: None,
            evaluation_keys: false,
        }
    }

    /// Integer parameters over `plaintext_modulus`, which must be a batching
    /// prime for `ring_degree` (see [`batching_modulus`]).
    pub fn exact_modular(
        ring_degree: usize,
        modulus_chain: Vec<usize>,
        plaintext_modulus: u64,
    ) -> Self {
        Self {
            scheme: SchemeKind::ExactModular,
            ring_degree,
            modulus_chain,
            scale: None,
            plaintext_modulus: Some(plaintext_modulus),
            evaluation_keys: false,
        }
    }

    /// Degree 8192, chain `[60, 60, 60, 60]`, scale 2^16.
    pub fn default_approximate() -> Self {
        Self::approximate(
            DEFAULT_RING_DEGREE,
            DEFAULT_MODULUS_CHAIN.to_vec(),
            DEFAULT_SCALE,
        )
    }

    /// Degree 8192, chain `[60, 60, 60, 60]`, 20-bit batching modulus.
    pub fn default_exact_modular() -> Result<Self, ConfigError> {
        let modulus = batching_modulus(DEFAULT_RING_DEGREE, DEFAULT_PLAINTEXT_BITS)?;
        Ok(Self::exact_modular(
            DEFAULT_RING_DEGREE,
            DEFAULT_MODULUS_CHAIN.to_vec(),
            modulus,
        ))
    }

    /// Also generate the inner-sum keys needed by `sum_elements`.
    #[must_use]
    pub fn with_evaluation_keys(mut self) -> Self {
        self.evaluation_keys = true;
        self
    }

    /// Checks every invariant and returns the effective plaintext modulus.
    ///
    /// Nothing may be encrypted under parameters that fail here: the decode
    /// step is total and would silently return wrapped values otherwise.
    pub fn validate(&self) -> Result<u64, ConfigError> {
        if !self.ring_degree.is_power_of_two() || self.ring_degree < MIN_RING_DEGREE {
            return Err(ConfigError::RingDegree(self.ring_degree));
        }
        if self.modulus_chain.len() < MIN_CHAIN_LEN {
            return Err(ConfigError::ChainTooShort {
                min: MIN_CHAIN_LEN,
                got: self.modulus_chain.len(),
            });
        }
        if let Some(&bits) = self
            .modulus_chain
            .iter()
            .find(|&&b| !(MIN_MODULUS_BITS..=MAX_MODULUS_BITS).contains(&b))
        {
            return Err(ConfigError::ModulusSize {
                bits,
                min: MIN_MODULUS_BITS,
                max: MAX_MODULUS_BITS,
            });
        }

        let plaintext_modulus = match self.scheme {
            SchemeKind::Approximate => {
                let scale = self
                    .scale
                    .ok_or(ConfigError::MissingParameter(self.scheme, "scale"))?;
                let bits = approximate_plaintext_bits(scale)?;
                batching_modulus(self.ring_degree, bits)?
            }
            SchemeKind::ExactModular => {
                let modulus = self
                    .plaintext_modulus
                    .ok_or(ConfigError::MissingParameter(self.scheme, "plaintext modulus"))?;
                if !supports_batching(modulus, self.ring_degree) {
                    return Err(ConfigError::PlaintextModulus {
                        modulus,
                        ring_degree: self.ring_degree,
                    });
                }
                modulus
            }
        };

        let plaintext_bits = bit_length(plaintext_modulus);
        let narrowest = self.modulus_chain.iter().copied().min().unwrap_or(0);
        if plaintext_bits >= narrowest {
            return Err(ConfigError::PlaintextExceedsModulus {
                plaintext_bits,
                modulus_bits: narrowest,
            });
        }

        self.check_noise_budget(plaintext_modulus)?;
        Ok(plaintext_modulus)
    }

    /// Rough BFV noise estimate: the chain has to leave room above the
    /// plaintext modulus for fresh noise (or key-switching noise, whichever
    /// dominates) grown by one constant multiplication.
    fn check_noise_budget(&self, plaintext_modulus: u64) -> Result<(), ConfigError> {
        let log_n = self.ring_degree.trailing_zeros() as usize;
        let plain_bits = bit_length(plaintext_modulus);
        let total: usize = self.modulus_chain.iter().sum();
        let available = total.saturating_sub(plain_bits + 1);

        let mut base = log_n + FRESH_NOISE_BITS + ADDITION_HEADROOM_BITS;
        if self.evaluation_keys {
            let widest = self.modulus_chain.iter().copied().max().unwrap_or(0);
            base = base.max(widest + log_n + KEY_SWITCH_SLACK_BITS);
        }
        let required = base + SESSION_DEPTH * plain_bits;

        if available < required {
            return Err(ConfigError::InsufficientDepth {
                depth: SESSION_DEPTH,
                available,
                required,
            });
        }
        Ok(())
    }
}

/// Plaintext modulus size needed for fixed-point values at `scale`.
pub(crate) fn approximate_plaintext_bits(scale: f64) -> Result<usize, ConfigError> {
    if !scale.is_finite() || scale < 2.0 {
        return Err(ConfigError::InvalidScale(scale));
    }
    let scale_bits = scale.log2().ceil() as usize;
    let bits = scale_bits + SCALAR_SCALE_BITS + APPROX_HEADROOM_BITS;
    if bits > MAX_PLAINTEXT_BITS {
        return Err(ConfigError::ScaleTooLarge {
            scale,
            bits,
            max: MAX_PLAINTEXT_BITS,
        });
    }
    Ok(bits)
}

/// Largest prime of `bits` bits congruent to 1 mod `2 * ring_degree`, i.e. a
/// plaintext modulus that supports slot batching.
pub fn batching_modulus(ring_degree: usize, bits: usize) -> Result<u64, ConfigError> {
    let no_prime = ConfigError::NoBatchingPrime { bits, ring_degree };
    if !(MIN_MODULUS_BITS..=MAX_PLAINTEXT_BITS).contains(&bits) || !ring_degree.is_power_of_two()
    {
        return Err(no_prime);
    }
    generate_prime(bits, 2 * ring_degree as u64, 1u64 << bits).ok_or(no_prime)
}

pub(crate) fn supports_batching(modulus: u64, ring_degree: usize) -> bool {
    modulus > 2
        && bit_length(modulus) <= MAX_PLAINTEXT_BITS
        && modulus % (2 * ring_degree as u64) == 1
        && is_prime(modulus)
}

fn bit_length(x: u64) -> usize {
    (u64::BITS - x.leading_zeros()) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_parameter_sets_validate() {
        let approx = ContextParams::default_approximate();
        let t = approx.validate().unwrap();
        assert!(supports_batching(t, approx.ring_degree));
        assert_eq!(bit_length(t), 16 + SCALAR_SCALE_BITS + APPROX_HEADROOM_BITS);
        assert!(bit_length(t) < DEFAULT_MODULUS_CHAIN[1]);

        let exact = ContextParams::default_exact_modular().unwrap();
        let t = exact.validate().unwrap();
        assert_eq!(bit_length(t), DEFAULT_PLAINTEXT_BITS);
        assert_eq!(t % (2 * DEFAULT_RING_DEGREE as u64), 1);
    }

    #[test]
    fn test_ring_degree_must_be_large_power_of_two() {
        let mut params = ContextParams::default_approximate();
        params.ring_degree = 6000;
        assert_eq!(params.validate(), Err(ConfigError::RingDegree(6000)));
        params.ring_degree = 2048;
        assert_eq!(params.validate(), Err(ConfigError::RingDegree(2048)));
    }

    #[test]
    fn test_chain_shape_is_checked() {
        let mut params = ContextParams::default_approximate();
        params.modulus_chain = vec![60];
        assert!(matches!(params.validate(), Err(ConfigError::ChainTooShort { got: 1, .. })));

        params.modulus_chain = vec![60, 8, 60];
        assert!(matches!(params.validate(), Err(ConfigError::ModulusSize { bits: 8, .. })));
    }

    #[test]
    fn test_shallow_chain_is_a_configuration_error() {
        // 20-bit plaintext space leaves no room for a multiply in 60 bits.
        let t = batching_modulus(4096, 20).unwrap();
        let params = ContextParams::exact_modular(4096, vec![30, 30], t);
        assert!(matches!(
            params.validate(),
            Err(ConfigError::InsufficientDepth { depth: 1, .. })
        ));
    }

    #[test]
    fn test_chain_narrower_than_plaintext_is_rejected() {
        // 58-bit approximate plaintext modulus against 40-bit primes.
        let params = ContextParams::approximate(4096, vec![60, 40, 40, 60], DEFAULT_SCALE);
        assert_eq!(
            params.validate(),
            Err(ConfigError::PlaintextExceedsModulus {
                plaintext_bits: 58,
                modulus_bits: 40,
            })
        );
        // equal width is not enough either
        let params = ContextParams::approximate(4096, vec![58, 58, 58, 58], DEFAULT_SCALE);
        assert!(matches!(
            params.validate(),
            Err(ConfigError::PlaintextExceedsModulus { .. })
        ));
        // scale 2^18 fits the 60-bit cap but not a 60-bit chain
        let params = ContextParams::approximate(4096, DEFAULT_MODULUS_CHAIN.to_vec(), 262_144.0);
        assert!(matches!(
            params.validate(),
            Err(ConfigError::PlaintextExceedsModulus { plaintext_bits: 60, .. })
        ));
        let params = ContextParams::approximate(4096, vec![62, 62, 62], 262_144.0);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_scale_bounds() {
        let chain = DEFAULT_MODULUS_CHAIN.to_vec();
        let params = ContextParams::approximate(4096, chain, 2f64.powi(40));
        assert!(matches!(params.validate(), Err(ConfigError::ScaleTooLarge { .. })));

        let params = ContextParams::approximate(4096, DEFAULT_MODULUS_CHAIN.to_vec(), f64::NAN);
        assert!(matches!(params.validate(), Err(ConfigError::InvalidScale(_))));
    }

    #[test]
    fn test_exact_modulus_must_batch() {
        // 65539 is not 1 mod 16384.
        let params = ContextParams::exact_modular(8192, DEFAULT_MODULUS_CHAIN.to_vec(), 65539);
        assert!(matches!(params.validate(), Err(ConfigError::PlaintextModulus { .. })));

        let params = ContextParams {
            plaintext_modulus: None,
            ..ContextParams::exact_modular(8192, DEFAULT_MODULUS_CHAIN.to_vec(), 0)
        };
        assert!(matches!(
            params.validate(),
            Err(ConfigError::MissingParameter(SchemeKind::ExactModular, _))
        ));
    }

    #[test]
    fn test_evaluation_keys_tighten_budget() {
        let params = ContextParams::default_approximate().with_evaluation_keys();
        assert!(params.validate().is_ok());

        let t = batching_modulus(4096, 20).unwrap();
        let params = ContextParams::exact_modular(4096, vec![62, 40], t);
        assert!(params.validate().is_ok());
        let params = params.with_evaluation_keys();
        assert!(matches!(params.validate(), Err(ConfigError::InsufficientDepth { .. })));
    }

    #[test]
    fn test_batching_modulus_congruence() {
        let t = batching_modulus(4096, 20).unwrap();
        assert!(is_prime(t));
        assert_eq!(t % 8192, 1);
        assert!(t < 1 << 20);
        assert!(batching_modulus(4096, 4).is_err());
    }

    #[test]
    fn test_params_deserialize_from_json() {
        let json = r#"{
            "scheme": "exact_modular",
            "ring_degree": 4096,
            "modulus_chain": [60, 40, 60],
            "plaintext_modulus": 1032193
        }"#;
        let params: ContextParams = serde_json::from_str(json).unwrap();
        assert_eq!(params.scheme, SchemeKind::ExactModular);
        assert!(!params.evaluation_keys);
        assert_eq!(params.validate().unwrap(), 1032193);
    }
}
