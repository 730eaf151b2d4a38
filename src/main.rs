//! Demo: clinic average, vote tally and age verification, end to end.

use std::error::Error;
use std::time::Instant;

use csv::Writer;
use log::info;
use secagg_core::{
    AggregationPolicy, AggregationResult, Aggregator, AggregatorConfig, ContextParams,
    ContributorRecord, Decryptor, EncryptionContext,
};

fn run(
    params: ContextParams,
    policy: AggregationPolicy,
    records: Vec<ContributorRecord>,
) -> Result<AggregationResult, Box<dyn Error>> {
    // trusted setup
    let (context, keys) = EncryptionContext::create(params)?;
    let decryptor = Decryptor::new(&context, keys.secret_key)?;

    // contributors + aggregator only ever see the public view
    let config = AggregatorConfig::new(policy);
    let mut aggregator = Aggregator::new(context.derive_public_view(), config)?;
    let rejected = aggregator.collect_all(records);
    if rejected > 0 {
        println!("  {rejected} contributor(s) rejected");
    }
    let outcome = aggregator.combine()?;

    Ok(decryptor.finalize_outcome(outcome)?)
}

fn clinics() -> Vec<ContributorRecord> {
    vec![
        ContributorRecord::new("Clinic A", [190.0, 200.5]),
        ContributorRecord::new("Clinic B", [205.3, 199.8]),
        ContributorRecord::new("Clinic C", [202.1]),
    ]
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let mut wtr = Writer::from_path("aggregation_results.csv")?;
    wtr.write_record(["scenario", "policy", "value", "provenance", "passed", "time_ms"])?;

    let patients: usize = clinics().iter().map(|c| c.values.len()).sum();
    let average = AggregationPolicy::WeightedAverage { total_count: patients };

    let exact = ContextParams::default_exact_modular()?;
    let scenarios = vec![
        (
            "cholesterol average (one ciphertext per patient)",
            ContextParams::default_approximate(),
            average,
            clinics(),
        ),
        (
            "cholesterol average (one packed vector per clinic)",
            ContextParams::default_approximate().with_evaluation_keys(),
            average,
            clinics(),
        ),
        (
            "vote tally",
            ContextParams::default_approximate(),
            AggregationPolicy::Tally,
            [1, 0, 1, 1, 0]
                .iter()
                .enumerate()
                .map(|(i, &v)| ContributorRecord::new(format!("voter {i}"), [v]))
                .collect(),
        ),
        (
            "age verification (25)",
            exact.clone(),
            AggregationPolicy::ThresholdCheck { required_value: 18 },
            vec![ContributorRecord::new("user", [25])],
        ),
        (
            "age verification (10)",
            exact,
            AggregationPolicy::ThresholdCheck { required_value: 18 },
            vec![ContributorRecord::new("user", [10])],
        ),
    ];

    for (name, params, policy, records) in scenarios {
        println!("{name}:");
        let start = Instant::now();
        let result = run(params, policy, records)?;
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        info!("{name} finished in {elapsed_ms:.1} ms");

        match result.passed {
            Some(passed) => println!(
                "  decrypted difference {:?} over {} value(s), passed: {passed}",
                result.value, result.provenance
            ),
            None => println!(
                "  decrypted result {:?} over {} value(s)",
                result.value, result.provenance
            ),
        }
        wtr.write_record(&[
            name.to_string(),
            policy.name().to_string(),
            format!("{:.4}", result.value.as_f64()),
            result.provenance.to_string(),
            result.passed.map(|p| p.to_string()).unwrap_or_default(),
            format!("{elapsed_ms:.3}"),
        ])?;
    }

    wtr.flush()?;
    Ok(())
}
