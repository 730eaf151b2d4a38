//! Encrypted value container.

use std::fmt;
use std::sync::Arc;

use fhe::bfv::Ciphertext;

use crate::params::SchemeKind;
use crate::scheme::{ContextCore, ContextId};

/// (ciphertext, context, fixed-point scale, depth, slots, provenance)
///
/// Never carries secret material. Homomorphic operations live in
/// [`algebra`](crate::algebra).
#[derive(Clone)]
pub struct EncryptedValue {
    pub(crate) ct: Ciphertext,
    pub(crate) core: Arc<ContextCore>,
    pub(crate) scale: f64, // Δ for fresh approximate values, Δ·Δs after a multiply
    pub(crate) depth: usize, // scalar multiplications applied so far
    pub(crate) slots: usize, // meaningful leading slots
    pub(crate) provenance: usize, // raw inputs folded into this value
}

impl EncryptedValue {
    pub(crate) fn fresh(
        ct: Ciphertext,
        core: Arc<ContextCore>,
        scale: f64,
        slots: usize,
    ) -> Self {
        Self {
            ct,
            core,
            scale,
            depth: 0,
            slots,
            provenance: slots,
        }
    }

    /// Session this value was encrypted under.
    pub fn context_id(&self) -> ContextId {
        self.core.id
    }

    /// Encoding family of the session.
    pub fn scheme(&self) -> SchemeKind {
        self.core.params.scheme
    }

    /// Current fixed-point scale, 1 for exact values.
    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Scalar multiplications applied so far.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Meaningful leading slots.
    pub fn slot_count(&self) -> usize {
        self.slots
    }

    /// Number of raw contributor values combined into this ciphertext.
    pub fn provenance(&self) -> usize {
        self.provenance
    }
}

impl fmt::Debug for EncryptedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedValue")
            .field("context", &self.core.id)
            .field("scheme", &self.core.params.scheme)
            .field("scale", &self.scale)
            .field("depth", &self.depth)
            .field("slots", &self.slots)
            .field("provenance", &self.provenance)
            .finish_non_exhaustive()
    }
}
