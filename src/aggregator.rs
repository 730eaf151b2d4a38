//! Aggregation session: collect contributions, combine them under one policy.
//!
//! The session moves `Collecting → Combining → Finalized` by ownership: an
//! [`Aggregator`] collects, [`Aggregator::combine`] consumes it, and the
//! resulting [`SessionOutcome`] is handed to the decryptor. Starting another
//! aggregation needs a new `Aggregator`.

use itertools::{Either, Itertools};
use log::{debug, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::cipher::EncryptedValue;
use crate::codec::RawValue;
use crate::error::{ConfigError, ContributorFailure, Error, Result};
use crate::params::SchemeKind;
use crate::scheme::PublicContext;

/// How the collected contributions are combined.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum AggregationPolicy {
    /// Plain sum of every contributed value.
    Sum,
    /// `Sum × 1/total_count`. The count is public metadata supplied by the
    /// caller, not derived from the ciphertexts.
    WeightedAverage { total_count: usize },
    /// Sum of 0/1 (or small non-negative integer) votes, decoded as an integer.
    Tally,
    /// `Sum − required_value`; non-negative means the check passed.
    ThresholdCheck { required_value: i64 },
}

impl AggregationPolicy {
    /// Stable snake_case name, as used in configuration.
    pub fn name(&self) -> &'static str {
        match self {
            AggregationPolicy::Sum => "sum",
            AggregationPolicy::WeightedAverage { .. } => "weighted_average",
            AggregationPolicy::Tally => "tally",
            AggregationPolicy::ThresholdCheck { .. } => "threshold_check",
        }
    }
}

/// Per-session aggregator settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// How contributions are combined.
    pub policy: AggregationPolicy,
    /// Fail the whole session at combine time if any contributor was rejected.
    #[serde(default)]
    pub strict: bool,
}

impl AggregatorConfig {
    /// Best-effort session under `policy`.
    pub fn new(policy: AggregationPolicy) -> Self {
        Self {
            policy,
            strict: false,
        }
    }

    /// Abort at combine time if anyone was rejected.
    #[must_use]
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }
}

/// Raw input of one contributor. Consumed by [`ContributorRecord::encrypt`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContributorRecord {
    /// Contributor identifier.
    pub contributor: String,
    /// Ordered raw values.
    pub values: Vec<RawValue>,
}

impl ContributorRecord {
    /// Record for `contributor` holding `values` in order.
    pub fn new<V: Into<RawValue>>(
        contributor: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Self {
            contributor: contributor.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Encodes and encrypts the record, dropping the raw values.
    ///
    /// With evaluation keys the values are packed into one ciphertext (reduced
    /// later with `sum_elements`); otherwise each value gets its own.
    pub fn encrypt(
        self,
        context: &PublicContext,
    ) -> std::result::Result<EncryptedContribution, ContributorFailure> {
        let ContributorRecord {
            contributor,
            values,
        } = self;
        match encrypt_values(context, &contributor, &values) {
            Ok(values) => Ok(EncryptedContribution {
                contributor,
                values,
            }),
            Err(error) => Err(ContributorFailure { contributor, error }),
        }
    }
}

fn encrypt_values(
    context: &PublicContext,
    contributor: &str,
    values: &[RawValue],
) -> Result<Vec<EncryptedValue>> {
    if values.is_empty() {
        return Err(Error::EmptyContribution {
            contributor: contributor.to_owned(),
        });
    }
    if context.has_evaluation_keys() && values.len() <= context.slot_capacity() {
        Ok(vec![context.encrypt_values(values)?])
    } else {
        values
            .iter()
            .map(|v| context.encrypt_values(std::slice::from_ref(v)))
            .collect()
    }
}

/// Ciphertexts of one contributor, ready for the aggregator.
#[derive(Debug, Clone)]
pub struct EncryptedContribution {
    /// Contributor identifier.
    pub contributor: String,
    /// One packed ciphertext, or one ciphertext per value.
    pub values: Vec<EncryptedValue>,
}

/// Per-session bookkeeping handed back with the outcome.
#[derive(Debug, Default)]
pub struct SessionReport {
    /// Accepted contributors, in collection order.
    pub accepted: Vec<String>,
    /// Rejected contributors with their errors.
    pub rejected: Vec<ContributorFailure>,
    /// Raw values behind the accepted contributions.
    pub provenance: usize,
}

/// Combined ciphertext of a finished session. Only the decryptor can open it.
#[derive(Debug)]
pub struct SessionOutcome {
    /// Combined ciphertext, policy already applied.
    pub value: EncryptedValue,
    /// Policy the value was combined under.
    pub policy: AggregationPolicy,
    /// Who contributed and who was turned away.
    pub report: SessionReport,
}

/// A session in the collecting state.
#[derive(Debug)]
pub struct Aggregator {
    context: PublicContext,
    config: AggregatorConfig,
    accepted: Vec<EncryptedValue>,
    report: SessionReport,
}

impl Aggregator {
    /// Rejects policies the scheme cannot evaluate before anything is
    /// collected.
    pub fn new(context: PublicContext, config: AggregatorConfig) -> Result<Self> {
        match config.policy {
            AggregationPolicy::WeightedAverage { .. }
                if context.scheme() != SchemeKind::Approximate =>
            {
                return Err(ConfigError::UnsupportedPolicy {
                    policy: config.policy.name(),
                    scheme: context.scheme(),
                }
                .into());
            }
            AggregationPolicy::WeightedAverage { total_count: 0 } => {
                return Err(ConfigError::ZeroTotalCount.into());
            }
            AggregationPolicy::ThresholdCheck { required_value } => {
                // must be encodable as a plaintext operand
                let codec = context.codec();
                codec.encode_operand(RawValue::Integer(required_value), codec.scale())?;
            }
            _ => {}
        }
        Ok(Self {
            context,
            config,
            accepted: Vec::new(),
            report: SessionReport::default(),
        })
    }

    /// Settings the session was opened with.
    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// Bookkeeping so far.
    pub fn report(&self) -> &SessionReport {
        &self.report
    }

    /// Encrypts and stores one contributor's record. A rejection is recorded
    /// in the report and returned; the session keeps going.
    pub fn collect(
        &mut self,
        record: ContributorRecord,
    ) -> std::result::Result<(), &ContributorFailure> {
        let result = self
            .validate_record(&record)
            .map_err(|error| ContributorFailure {
                contributor: record.contributor.clone(),
                error,
            })
            .and_then(|()| record.encrypt(&self.context));
        self.admit(result)
    }

    /// Accepts ciphertexts a contributor produced on its own.
    pub fn collect_encrypted(
        &mut self,
        contribution: EncryptedContribution,
    ) -> std::result::Result<(), &ContributorFailure> {
        let result = match self.validate_contribution(&contribution) {
            Ok(()) => Ok(contribution),
            Err(error) => Err(ContributorFailure {
                contributor: contribution.contributor,
                error,
            }),
        };
        self.admit(result)
    }

    /// Encrypts many records in parallel; returns the number rejected.
    pub fn collect_all(&mut self, records: Vec<ContributorRecord>) -> usize {
        let context = &self.context;
        let policy = self.config.policy;
        let scheme = context.scheme();
        let results: Vec<_> = records
            .into_par_iter()
            .map(|record| {
                check_record(policy, scheme, &record).map_err(|error| ContributorFailure {
                    contributor: record.contributor.clone(),
                    error,
                })?;
                record.encrypt(context)
            })
            .collect();

        let (ok, failed): (Vec<_>, Vec<_>) = results.into_iter().partition_map(|r| match r {
            Ok(c) => Either::Left(c),
            Err(f) => Either::Right(f),
        });
        let rejected = failed.len();
        for contribution in ok {
            self.store(contribution);
        }
        for failure in failed {
            self.reject(failure);
        }
        rejected
    }

    fn admit(
        &mut self,
        result: std::result::Result<EncryptedContribution, ContributorFailure>,
    ) -> std::result::Result<(), &ContributorFailure> {
        match result {
            Ok(contribution) => {
                self.store(contribution);
                Ok(())
            }
            Err(failure) => {
                let index = self.report.rejected.len();
                self.reject(failure);
                Err(&self.report.rejected[index])
            }
        }
    }

    fn store(&mut self, contribution: EncryptedContribution) {
        let provenance: usize = contribution.values.iter().map(EncryptedValue::provenance).sum();
        debug!(
            "accepted {} ({} ciphertext(s), {} value(s))",
            contribution.contributor,
            contribution.values.len(),
            provenance
        );
        self.report.provenance += provenance;
        self.report.accepted.push(contribution.contributor);
        self.accepted.extend(contribution.values);
    }

    fn reject(&mut self, failure: ContributorFailure) {
        warn!("rejected contributor {}", failure);
        self.report.rejected.push(failure);
    }

    fn validate_record(&self, record: &ContributorRecord) -> Result<()> {
        check_record(self.config.policy, self.context.scheme(), record)
    }

    fn validate_contribution(&self, contribution: &EncryptedContribution) -> Result<()> {
        if contribution.values.is_empty() {
            return Err(Error::EmptyContribution {
                contributor: contribution.contributor.clone(),
            });
        }
        let own = self.context.core();
        for value in &contribution.values {
            if !own.same_session(&value.core) {
                return Err(Error::ContextMismatch {
                    left: own.id,
                    right: value.core.id,
                });
            }
        }
        Ok(())
    }

    /// Combines everything collected into one ciphertext.
    ///
    /// Packed contributions are reduced with `sum_elements` first, then all
    /// ciphertexts are folded in collection order.
    pub fn combine(self) -> Result<SessionOutcome> {
        let Aggregator {
            config,
            accepted,
            report,
            ..
        } = self;

        if config.strict && !report.rejected.is_empty() {
            return Err(Error::SessionAborted(report.rejected));
        }

        let reduced = accepted
            .iter()
            .map(|v| {
                if v.slot_count() > 1 {
                    v.sum_elements()
                } else {
                    Ok(v.clone())
                }
            })
            .collect::<Result<Vec<_>>>()?;
        let sum = EncryptedValue::add_many(&reduced)?;

        let value = match config.policy {
            AggregationPolicy::Sum | AggregationPolicy::Tally => sum,
            AggregationPolicy::WeightedAverage { total_count } => {
                if total_count != sum.provenance() {
                    warn!(
                        "weighted average uses total count {} but {} value(s) were combined",
                        total_count,
                        sum.provenance()
                    );
                }
                sum.scalar_multiply(1.0 / total_count as f64)?
            }
            AggregationPolicy::ThresholdCheck { required_value } => {
                sum.subtract_value(required_value)?
            }
        };

        info!(
            "combined {} contributor(s), {} value(s) under {} ({} rejected)",
            report.accepted.len(),
            value.provenance(),
            config.policy.name(),
            report.rejected.len()
        );
        Ok(SessionOutcome {
            value,
            policy: config.policy,
            report,
        })
    }
}

fn check_record(
    policy: AggregationPolicy,
    scheme: SchemeKind,
    record: &ContributorRecord,
) -> Result<()> {
    if record.values.is_empty() {
        return Err(Error::EmptyContribution {
            contributor: record.contributor.clone(),
        });
    }
    if policy == AggregationPolicy::Tally {
        if let Some(bad) = record
            .values
            .iter()
            .find(|v| !matches!(v.as_integer(), Some(n) if n >= 0))
        {
            return Err(Error::UnrepresentableValue {
                value: bad.as_f64(),
                scheme,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decryptor::Decryptor;
    use crate::params::{batching_modulus, ContextParams, DEFAULT_MODULUS_CHAIN};
    use crate::scheme::EncryptionContext;

    fn exact() -> (EncryptionContext, Decryptor) {
        let t = batching_modulus(4096, 20).unwrap();
        let params = ContextParams::exact_modular(4096, DEFAULT_MODULUS_CHAIN.to_vec(), t);
        let (ctx, keys) = EncryptionContext::create(params).unwrap();
        let dec = Decryptor::new(&ctx, keys.secret_key).unwrap();
        (ctx, dec)
    }

    #[test]
    fn test_policy_checked_against_scheme() {
        let (ctx, _) = exact();
        let avg = AggregatorConfig::new(AggregationPolicy::WeightedAverage { total_count: 3 });
        assert!(matches!(
            Aggregator::new(ctx.derive_public_view(), avg),
            Err(Error::Configuration(ConfigError::UnsupportedPolicy { .. }))
        ));

        let huge = AggregatorConfig::new(AggregationPolicy::ThresholdCheck {
            required_value: i64::MAX,
        });
        assert!(matches!(
            Aggregator::new(ctx.derive_public_view(), huge),
            Err(Error::EncodingOverflow { .. })
        ));
    }

    #[test]
    fn test_empty_record_is_rejected_but_session_continues() {
        let (ctx, dec) = exact();
        let config = AggregatorConfig::new(AggregationPolicy::Sum);
        let mut agg = Aggregator::new(ctx.derive_public_view(), config).unwrap();

        let failure = agg
            .collect(ContributorRecord::new("nobody", Vec::<i64>::new()))
            .unwrap_err();
        assert_eq!(failure.contributor, "nobody");
        assert!(matches!(failure.error, Error::EmptyContribution { .. }));

        agg.collect(ContributorRecord::new("a", [4, 6])).unwrap();
        agg.collect(ContributorRecord::new("b", [-3])).unwrap();
        assert_eq!(agg.report().accepted, vec!["a", "b"]);
        assert_eq!(agg.report().provenance, 3);

        let outcome = agg.combine().unwrap();
        assert_eq!(outcome.report.rejected.len(), 1);
        let result = dec.finalize_outcome(outcome).unwrap();
        assert_eq!(result.value, RawValue::Integer(7));
        assert_eq!(result.provenance, 3);
    }

    #[test]
    fn test_strict_session_aborts() {
        let (ctx, _) = exact();
        let config = AggregatorConfig::new(AggregationPolicy::Sum).strict();
        let mut agg = Aggregator::new(ctx.derive_public_view(), config).unwrap();
        agg.collect(ContributorRecord::new("a", [1])).unwrap();
        assert!(agg.collect(ContributorRecord::new("b", [2.5])).is_err());
        match agg.combine() {
            Err(Error::SessionAborted(failures)) => assert_eq!(failures[0].contributor, "b"),
            other => panic!("expected abort, got {other:?}"),
        }
    }

    #[test]
    fn test_nothing_collected() {
        let (ctx, _) = exact();
        let tally = AggregatorConfig::new(AggregationPolicy::Tally);
        let agg = Aggregator::new(ctx.derive_public_view(), tally).unwrap();
        assert!(matches!(agg.combine(), Err(Error::EmptyAggregation)));
    }

    #[test]
    fn test_foreign_contribution_rejected() {
        let (ctx, dec) = exact();
        let (other, _) = exact();
        let tally = AggregatorConfig::new(AggregationPolicy::Tally);
        let mut agg = Aggregator::new(ctx.derive_public_view(), tally).unwrap();

        let foreign = ContributorRecord::new("mallory", [1])
            .encrypt(&other.derive_public_view())
            .unwrap();
        let failure = agg.collect_encrypted(foreign).unwrap_err();
        assert!(matches!(failure.error, Error::ContextMismatch { .. }));

        let local = ContributorRecord::new("alice", [1])
            .encrypt(&ctx.derive_public_view())
            .unwrap();
        agg.collect_encrypted(local).unwrap();
        let result = dec.finalize_outcome(agg.combine().unwrap()).unwrap();
        assert_eq!(result.value, RawValue::Integer(1));
    }

    #[test]
    fn test_tally_rejects_negative_votes() {
        let (ctx, dec) = exact();
        let tally = AggregatorConfig::new(AggregationPolicy::Tally);
        let mut agg = Aggregator::new(ctx.derive_public_view(), tally).unwrap();
        let records = vec![
            ContributorRecord::new("v1", [1]),
            ContributorRecord::new("v2", [-1]),
            ContributorRecord::new("v3", [1]),
        ];
        assert_eq!(agg.collect_all(records), 1);
        assert_eq!(agg.report().rejected[0].contributor, "v2");
        let result = dec.finalize_outcome(agg.combine().unwrap()).unwrap();
        assert_eq!(result.value, RawValue::Integer(2));
    }

    #[test]
    fn test_rejected_vote_reports_session_scheme() {
        let params = ContextParams::approximate(4096, DEFAULT_MODULUS_CHAIN.to_vec(), 65536.0);
        let (ctx, _) = EncryptionContext::create(params).unwrap();
        let tally = AggregatorConfig::new(AggregationPolicy::Tally);
        let mut agg = Aggregator::new(ctx.derive_public_view(), tally).unwrap();
        let failure = agg
            .collect(ContributorRecord::new("v", [0.5]))
            .unwrap_err();
        assert!(matches!(
            failure.error,
            Error::UnrepresentableValue {
                scheme: SchemeKind::Approximate,
                ..
            }
        ));
    }

    #[test]
    fn test_policy_serde_shape() {
        let json = r#"{
            "policy": {"policy": "threshold_check", "required_value": 18},
            "strict": true
        }"#;
        let config: AggregatorConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.policy, AggregationPolicy::ThresholdCheck { required_value: 18 });
        assert!(config.strict);
    }
}
