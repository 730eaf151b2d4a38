//! Application values ⇄ plaintext slots.
//!
//! Every slot is a residue in `[0, m)` where `m` is the session's plaintext
//! modulus. Negative numbers wrap around (`-1 ↦ m - 1`) and decode back
//! through [`decode_signed`]. Approximate values are fixed-point: a real `x`
//! at scale `Δ` is stored as `round(x·Δ)`. Clear multipliers get their own,
//! finer scale `Δs = 2^SCALAR_SCALE_BITS`, so `1/n` keeps its precision for
//! large `n`.

use num_integer::Integer;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Error, Result};
use crate::params::{ContextParams, SchemeKind, SCALAR_SCALE_BITS};

/// A raw application value: a reading, a vote, an age.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    /// Whole number: a vote, an age, an exact-modular result.
    Integer(i64),
    /// Real number, encoded fixed-point.
    Real(f64),
}

impl RawValue {
    /// Lossy for integers beyond 2^53.
    pub fn as_f64(self) -> f64 {
        match self {
            RawValue::Integer(v) => v as f64,
            RawValue::Real(v) => v,
        }
    }

    /// `Some(n)` when the value is an exact integer.
    pub fn as_integer(self) -> Option<i64> {
        match self {
            RawValue::Integer(v) => Some(v),
            RawValue::Real(v) if v.is_finite() && v.fract() == 0.0 && v.abs() < 2f64.powi(63) => {
                Some(v as i64)
            }
            RawValue::Real(_) => None,
        }
    }
}

impl From<f64> for RawValue {
    fn from(v: f64) -> Self {
        RawValue::Real(v)
    }
}

impl From<i64> for RawValue {
    fn from(v: i64) -> Self {
        RawValue::Integer(v)
    }
}

impl From<i32> for RawValue {
    fn from(v: i32) -> Self {
        RawValue::Integer(i64::from(v))
    }
}

impl From<u32> for RawValue {
    fn from(v: u32) -> Self {
        RawValue::Integer(i64::from(v))
    }
}

impl From<bool> for RawValue {
    fn from(v: bool) -> Self {
        RawValue::Integer(i64::from(v))
    }
}

/// How slots map onto the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotLayout {
    /// `slots[i]` goes to slot `i`, remaining slots are zero.
    Packed,
    /// The single residue is repeated in every slot (a constant polynomial).
    Broadcast,
}

/// Encoded, unencrypted slots tagged with scheme and fixed-point scale.
#[derive(Debug, Clone, PartialEq)]
pub struct Plaintext {
    scheme: SchemeKind,
    slots: Vec<u64>,
    scale: f64,
    layout: SlotLayout,
}

impl Plaintext {
    /// Scheme the slots were encoded for.
    pub fn scheme(&self) -> SchemeKind {
        self.scheme
    }

    /// Residues, one per meaningful slot.
    pub fn slots(&self) -> &[u64] {
        &self.slots
    }

    /// Fixed-point scale, 1 for exact plaintexts.
    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Packed vector or broadcast constant.
    pub fn layout(&self) -> SlotLayout {
        self.layout
    }

    /// Number of meaningful slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// No slots at all.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Expands into the full slot vector of a ring of degree `ring_degree`.
    pub(crate) fn expand(&self, ring_degree: usize) -> Vec<u64> {
        match self.layout {
            SlotLayout::Broadcast => vec![self.slots.first().copied().unwrap_or(0); ring_degree],
            SlotLayout::Packed => {
                let mut full = self.slots.clone();
                full.resize(ring_degree, 0);
                full
            }
        }
    }
}

/// Signed reading of a residue: `v` if `v <= m/2`, else `v - m`.
///
/// `v == m/2` is non-negative.
pub fn decode_signed(value: u64, modulus: u64) -> i64 {
    let value = value % modulus;
    if value <= modulus / 2 {
        value as i64
    } else {
        value as i64 - modulus as i64
    }
}

/// Encoder/decoder bound to one plaintext modulus and scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EncodingCodec {
    scheme: SchemeKind,
    modulus: u64,
    scale: f64,
    scalar_scale: f64,
}

impl EncodingCodec {
    /// `scale` is ignored for `ExactModular`.
    pub fn new(scheme: SchemeKind, modulus: u64, scale: f64) -> Self {
        let (scale, scalar_scale) = match scheme {
            SchemeKind::Approximate => (scale, (1u64 << SCALAR_SCALE_BITS) as f64),
            SchemeKind::ExactModular => (1.0, 1.0),
        };
        Self {
            scheme,
            modulus,
            scale,
            scalar_scale,
        }
    }

    /// Codec for validated `params`.
    pub fn for_params(params: &ContextParams) -> std::result::Result<Self, ConfigError> {
        let modulus = params.validate()?;
        Ok(Self::new(params.scheme, modulus, params.scale.unwrap_or(1.0)))
    }

    /// Scheme this codec encodes for.
    pub fn scheme(&self) -> SchemeKind {
        self.scheme
    }

    /// Plaintext modulus `m`.
    pub fn modulus(&self) -> u64 {
        self.modulus
    }

    /// Base fixed-point scale of freshly encoded values.
    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Fixed-point scale of clear multipliers, 1 for exact sessions.
    pub fn scalar_scale(&self) -> f64 {
        self.scalar_scale
    }

    /// Largest residue read back as non-negative.
    pub fn max_signed(&self) -> i64 {
        (self.modulus / 2) as i64
    }

    /// Most negative integer that survives the wraparound.
    pub fn min_signed(&self) -> i64 {
        -((self.modulus - 1 - self.modulus / 2) as i64)
    }

    /// Magnitude limit for a contribution encoded at the base scale.
    ///
    /// Approximate values keep a factor `Δs` in reserve so that one scalar
    /// multiply (with `|scalar| <= 1`) cannot wrap. The same bound applies to
    /// the result of that multiply, e.g. an average.
    pub fn value_bound(&self) -> f64 {
        match self.scheme {
            SchemeKind::Approximate => {
                self.max_signed() as f64 / (self.scale * self.scalar_scale)
            }
            SchemeKind::ExactModular => self.max_signed() as f64,
        }
    }

    /// Encodes contributor values at the base scale, packed from slot 0.
    pub fn encode(&self, values: &[RawValue]) -> Result<Plaintext> {
        let bound = self.value_bound();
        let slots = values
            .iter()
            .map(|&v| self.to_residue(v, self.scale, bound))
            .collect::<Result<Vec<_>>>()?;
        Ok(Plaintext {
            scheme: self.scheme,
            slots,
            scale: self.scale,
            layout: SlotLayout::Packed,
        })
    }

    /// Encodes a single operand at `scale`, for subtraction from a ciphertext
    /// currently at that scale.
    pub fn encode_operand(&self, value: RawValue, scale: f64) -> Result<Plaintext> {
        let bound = self.max_signed() as f64 / scale;
        let residue = self.to_residue(value, scale, bound)?;
        Ok(Plaintext {
            scheme: self.scheme,
            slots: vec![residue],
            scale,
            layout: SlotLayout::Packed,
        })
    }

    /// Encodes a multiplier at the scalar scale, broadcast over every slot.
    /// Approximate scalars are limited to `[-1, 1]`, which is what averaging
    /// needs.
    ///
    /// Rounding `s` to `Δs` costs at most `0.5/Δs` on the scalar, so an
    /// average over `n` values at scale `Δ` errs by at most
    /// `0.5/Δ + n·|mean|·0.5/Δs`.
    pub fn encode_scalar(&self, value: RawValue) -> Result<Plaintext> {
        let bound = match self.scheme {
            SchemeKind::Approximate => 1.0,
            SchemeKind::ExactModular => self.max_signed() as f64,
        };
        let residue = self.to_residue(value, self.scalar_scale, bound)?;
        Ok(Plaintext {
            scheme: self.scheme,
            slots: vec![residue],
            scale: self.scalar_scale,
            layout: SlotLayout::Broadcast,
        })
    }

    /// Decodes one residue held at `scale`. Never fails.
    pub fn decode(&self, residue: u64, scale: f64) -> RawValue {
        let signed = decode_signed(residue, self.modulus);
        match self.scheme {
            SchemeKind::Approximate => RawValue::Real(signed as f64 / scale),
            SchemeKind::ExactModular => RawValue::Integer(signed),
        }
    }

    fn to_residue(&self, value: RawValue, scale: f64, bound: f64) -> Result<u64> {
        let modulus = self.modulus as i64;
        match self.scheme {
            SchemeKind::Approximate => {
                let x = value.as_f64();
                if !x.is_finite() {
                    return Err(Error::UnrepresentableValue {
                        value: x,
                        scheme: self.scheme,
                    });
                }
                if x.abs() > bound {
                    return Err(Error::EncodingOverflow {
                        value: x,
                        min: -bound,
                        max: bound,
                    });
                }
                let fixed = (x * scale).round() as i64;
                Ok(fixed.mod_floor(&modulus) as u64)
            }
            SchemeKind::ExactModular => {
                let n = value.as_integer().ok_or(Error::UnrepresentableValue {
                    value: value.as_f64(),
                    scheme: self.scheme,
                })?;
                let (min, max) = (self.min_signed().max(-(bound as i64)), bound as i64);
                if n < min || n > max {
                    return Err(Error::EncodingOverflow {
                        value: n as f64,
                        min: min as f64,
                        max: max as f64,
                    });
                }
                Ok(n.mod_floor(&modulus) as u64)
            }
        }
    }
}
