//! Session configuration as handed over by the embedding application.

use serde::{Deserialize, Serialize};

use crate::aggregator::{AggregationPolicy, AggregatorConfig};
use crate::error::{ConfigError, Result};
use crate::params::{
    batching_modulus, ContextParams, SchemeKind, DEFAULT_MODULUS_CHAIN, DEFAULT_PLAINTEXT_BITS,
    DEFAULT_RING_DEGREE, DEFAULT_SCALE,
};
use crate::scheme::{EncryptionContext, KeyPair};

/// Policy name as written in a configuration file; arguments live in
/// separate fields of [`SessionConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    /// [`AggregationPolicy::Sum`].
    Sum,
    /// [`AggregationPolicy::WeightedAverage`], needs `total_count`.
    WeightedAverage,
    /// [`AggregationPolicy::Tally`].
    Tally,
    /// [`AggregationPolicy::ThresholdCheck`], needs `required_value`.
    ThresholdCheck,
}

/// Flat, serde-friendly description of a session. Missing parameters fall
/// back to the defaults of [`crate::params`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Encoding family.
    pub scheme: SchemeKind,
    /// Defaults to 8192.
    #[serde(default = "default_ring_degree")]
    pub ring_degree: usize,
    /// Defaults to `[60, 60, 60, 60]`.
    #[serde(default = "default_modulus_chain")]
    pub modulus_chain: Vec<usize>,
    /// Approximate only; defaults to 2^16.
    #[serde(default)]
    pub scale: Option<f64>,
    /// Exact only; defaults to a 20-bit batching prime.
    #[serde(default)]
    pub plaintext_modulus: Option<u64>,
    /// Generate inner-sum keys and pack each contributor's record.
    #[serde(default)]
    pub evaluation_keys: bool,
    /// Policy of the session.
    pub aggregation_policy: PolicyKind,
    /// ThresholdCheck only.
    #[serde(default)]
    pub required_value: Option<i64>,
    /// WeightedAverage only.
    #[serde(default)]
    pub total_count: Option<usize>,
    /// Abort the session if any contributor is rejected.
    #[serde(default)]
    pub strict: bool,
    /// Deterministic key generation, for tests and reproducible runs.
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_ring_degree() -> usize {
    DEFAULT_RING_DEGREE
}

fn default_modulus_chain() -> Vec<usize> {
    DEFAULT_MODULUS_CHAIN.to_vec()
}

impl SessionConfig {
    /// Parses a JSON document.
    pub fn from_json(json: &str) -> std::result::Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::Session(e.to_string()))
    }

    /// Validated context parameters.
    pub fn context_params(&self) -> std::result::Result<ContextParams, ConfigError> {
        let params = match self.scheme {
            SchemeKind::Approximate => ContextParams::approximate(
                self.ring_degree,
                self.modulus_chain.clone(),
                self.scale.unwrap_or(DEFAULT_SCALE),
            ),
            SchemeKind::ExactModular => {
                let modulus = match self.plaintext_modulus {
                    Some(m) => m,
                    None => batching_modulus(self.ring_degree, DEFAULT_PLAINTEXT_BITS)?,
                };
                ContextParams::exact_modular(
                    self.ring_degree,
                    self.modulus_chain.clone(),
                    modulus,
                )
            }
        };
        let params = ContextParams {
            evaluation_keys: self.evaluation_keys,
            ..params
        };
        params.validate()?;
        Ok(params)
    }

    /// Aggregator settings; fails if the policy's argument is missing.
    pub fn aggregator_config(&self) -> std::result::Result<AggregatorConfig, ConfigError> {
        let policy = match self.aggregation_policy {
            PolicyKind::Sum => AggregationPolicy::Sum,
            PolicyKind::Tally => AggregationPolicy::Tally,
            PolicyKind::WeightedAverage => AggregationPolicy::WeightedAverage {
                total_count: self.total_count.ok_or_else(|| {
                    ConfigError::Session("weighted_average needs total_count".into())
                })?,
            },
            PolicyKind::ThresholdCheck => AggregationPolicy::ThresholdCheck {
                required_value: self.required_value.ok_or_else(|| {
                    ConfigError::Session("threshold_check needs required_value".into())
                })?,
            },
        };
        Ok(AggregatorConfig {
            policy,
            strict: self.strict,
        })
    }

    /// Runs key generation for this configuration.
    pub fn create_context(&self) -> Result<(EncryptionContext, KeyPair)> {
        let params = self.context_params()?;
        match self.seed {
            Some(seed) => EncryptionContext::create_seeded(params, seed),
            None => EncryptionContext::create(params),
        }
    }
}
