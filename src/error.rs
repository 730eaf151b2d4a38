//! Error taxonomy shared by every layer of the aggregation core.

use thiserror::Error;

use crate::params::SchemeKind;
use crate::scheme::ContextId;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Invalid context or session parameters. Always raised before anything is
/// encrypted.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// Ring degree is not a power of two, or too small.
    #[error(
        "ring degree {0} must be a power of two and at least {min}",
        min = crate::params::MIN_RING_DEGREE
    )]
    RingDegree(usize),

    /// Fewer primes than a session needs.
    #[error("modulus chain must contain at least {min} primes, got {got}")]
    ChainTooShort { min: usize, got: usize },

    /// A chain entry outside the bit sizes the backend can generate.
    #[error("modulus chain entry {bits} bits is outside [{min}, {max}]")]
    ModulusSize { bits: usize, min: usize, max: usize },

    /// The chain cannot absorb the noise of a depth-`depth` session.
    #[error(
        "modulus chain provides {available} bits of noise budget, depth {depth} needs {required}"
    )]
    InsufficientDepth {
        depth: usize,
        available: usize,
        required: usize,
    },

    /// A chain modulus no wider than the plaintext modulus.
    #[error(
        "plaintext modulus has {plaintext_bits} bits, every chain modulus must be wider \
         (narrowest has {modulus_bits})"
    )]
    PlaintextExceedsModulus {
        plaintext_bits: usize,
        modulus_bits: usize,
    },

    /// Scheme-specific parameter left unset.
    #[error("{0} scheme requires a {1}")]
    MissingParameter(SchemeKind, &'static str),

    /// Scale is NaN, infinite or below 2.
    #[error("scale {0} must be finite and at least 2")]
    InvalidScale(f64),

    /// Scale would need a plaintext modulus wider than the backend allows.
    #[error(
        "scale {scale} needs a {bits}-bit plaintext modulus, at most {max} bits are supported"
    )]
    ScaleTooLarge { scale: f64, bits: usize, max: usize },

    /// Exact plaintext modulus cannot batch at this ring degree.
    #[error("plaintext modulus {modulus} is not a batching prime for ring degree {ring_degree}")]
    PlaintextModulus { modulus: u64, ring_degree: usize },

    /// No prime `≡ 1 mod 2n` of the requested size.
    #[error("no batching prime of {bits} bits exists for ring degree {ring_degree}")]
    NoBatchingPrime { bits: usize, ring_degree: usize },

    /// A multiply on a value that already used the session depth.
    #[error(
        "multiplicative depth exhausted: value already at depth {used}, session allows {max}"
    )]
    DepthExhausted { used: usize, max: usize },

    /// Policy the scheme cannot evaluate, e.g. averaging exact integers.
    #[error("aggregation policy {policy} is not supported by the {scheme} scheme")]
    UnsupportedPolicy {
        policy: &'static str,
        scheme: SchemeKind,
    },

    /// `WeightedAverage { total_count: 0 }`.
    #[error("weighted average needs a total count greater than zero")]
    ZeroTotalCount,

    /// Malformed or incomplete [`SessionConfig`](crate::config::SessionConfig).
    #[error("invalid session configuration: {0}")]
    Session(String),
}

/// Every failure the aggregation core can report.
#[derive(Debug, Error)]
pub enum Error {
    /// See [`ConfigError`].
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// Value too large for the plaintext space.
    #[error(
        "value {value} cannot be encoded without wraparound (representable range {min}..={max})"
    )]
    EncodingOverflow { value: f64, min: f64, max: f64 },

    /// NaN, infinity, or a fraction in an integer-only context.
    #[error("value {value} is not representable by the {scheme} scheme")]
    UnrepresentableValue { value: f64, scheme: SchemeKind },

    /// Operands (or key and ciphertext) from different sessions.
    #[error("encrypted values belong to different contexts ({left} vs {right})")]
    ContextMismatch { left: ContextId, right: ContextId },

    /// Plaintext encoded for the other scheme.
    #[error("operand encoded for {found} cannot be combined with a {expected} ciphertext")]
    SchemeMismatch {
        expected: SchemeKind,
        found: SchemeKind,
    },

    /// Approximate operands at different fixed-point scales.
    #[error("operands carry different fixed-point scales ({left} vs {right})")]
    ScaleMismatch { left: f64, right: f64 },

    /// `sum_elements` on a context generated without evaluation keys.
    #[error(
        "slot reduction requires evaluation keys, \
         regenerate the context with evaluation keys enabled"
    )]
    MissingEvaluationKey,

    /// Nothing to combine.
    #[error("aggregation requires at least one encrypted value")]
    EmptyAggregation,

    /// Contributor record without values.
    #[error("contributor {contributor:?} supplied no values")]
    EmptyContribution { contributor: String },

    /// More values than one ciphertext has slots.
    #[error("{count} packed values exceed the {capacity} available slots")]
    TooManySlots { count: usize, capacity: usize },

    /// Strict session with at least one rejected contributor.
    #[error("session aborted in strict mode after {} rejected contributor(s)", .0.len())]
    SessionAborted(Vec<ContributorFailure>),

    /// Error raised by the `fhe` backend.
    #[error("homomorphic backend failure: {0}")]
    Backend(#[from] fhe::Error),
}

/// A contributor whose input was rejected, with the reason.
#[derive(Debug)]
pub struct ContributorFailure {
    /// Contributor identifier.
    pub contributor: String,
    /// Why the contribution was refused.
    pub error: Error,
}

impl std::fmt::Display for ContributorFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.contributor, self.error)
    }
}
