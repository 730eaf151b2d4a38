//! Secure aggregation over homomorphically encrypted contributions.
//!
//! Contributors encrypt under a shared public context, the aggregator sums /
//! averages / thresholds ciphertexts, and only the holder of the secret key
//! sees the final figure. The lattice scheme underneath is BFV from the `fhe`
//! crate; this crate is the orchestration layer on top of it.

#![forbid(unsafe_code)]
#![warn(clippy::pedantic, missing_docs)]

pub mod params;
pub mod codec;
pub mod scheme;
pub mod cipher;
pub mod algebra;
pub mod aggregator;
pub mod decryptor;
pub mod config;
pub mod error;

pub use aggregator::{
    AggregationPolicy, Aggregator, AggregatorConfig, ContributorRecord, EncryptedContribution,
    SessionOutcome, SessionReport,
};
pub use cipher::EncryptedValue;
pub use codec::{decode_signed, EncodingCodec, Plaintext, RawValue};
pub use config::SessionConfig;
pub use decryptor::{AggregationResult, Decryptor};
pub use error::{ConfigError, ContributorFailure, Error, Result};
pub use params::{ContextParams, SchemeKind};
pub use scheme::{ContextId, EncryptionContext, KeyPair, PublicContext, SecretKey};
