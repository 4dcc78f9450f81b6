//! Epoch score reduction.
//!
//! Each scorer's per-epoch values for a sample are combined by every named
//! reducer into one value per sample, and those are summarised into the
//! log's result metrics.

use std::collections::BTreeMap;

use evalrun_log::{EvalSampleReductions, EvalSampleScore, EvalScore, SampleId, SampleSummary};

use crate::error::{RunError, RunResult};

pub const REDUCERS: [&str; 5] = ["mean", "median", "mode", "max", "min"];

/// Combine `values` with the reducer `name`. Empty input reduces to 0.
pub fn reduce(name: &str, values: &[f64]) -> RunResult<f64> {
    if !REDUCERS.contains(&name) {
        return Err(RunError::ReducerNotFound(name.to_string()));
    }
    if values.is_empty() {
        return Ok(0.0);
    }
    let value = match name {
        "mean" => values.iter().sum::<f64>() / values.len() as f64,
        "median" => {
            let mut sorted = values.to_vec();
            sorted.sort_by(f64::total_cmp);
            let mid = sorted.len() / 2;
            if sorted.len() % 2 == 0 {
                (sorted[mid - 1] + sorted[mid]) / 2.0
            } else {
                sorted[mid]
            }
        }
        "mode" => {
            // Most frequent value; ties go to the smallest.
            let mut sorted = values.to_vec();
            sorted.sort_by(f64::total_cmp);
            let mut best = (sorted[0], 0usize);
            let mut run = (sorted[0], 0usize);
            for v in sorted {
                if v == run.0 {
                    run.1 += 1;
                } else {
                    run = (v, 1);
                }
                if run.1 > best.1 {
                    best = run;
                }
            }
            best.0
        }
        "max" => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        "min" => values.iter().copied().fold(f64::INFINITY, f64::min),
        other => return Err(RunError::ReducerNotFound(other.to_string())),
    };
    Ok(value)
}

fn stderr(values: &[f64], mean: f64) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let n = values.len() as f64;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (var / n).sqrt()
}

/// Per-sample reductions and result metrics for completed samples.
pub fn reduce_scores(
    samples: &[SampleSummary],
    reducers: &[String],
) -> RunResult<(Vec<EvalSampleReductions>, Vec<EvalScore>)> {
    // scorer -> sample id -> epoch values
    let mut by_scorer: BTreeMap<&str, BTreeMap<&SampleId, Vec<f64>>> = BTreeMap::new();
    for sample in samples {
        for (scorer, score) in &sample.scores {
            if let Some(value) = score.as_f64() {
                by_scorer
                    .entry(scorer.as_str())
                    .or_default()
                    .entry(&sample.id)
                    .or_default()
                    .push(value);
            }
        }
    }

    let mut reductions = Vec::new();
    let mut scores = Vec::new();
    for (scorer, per_sample) in by_scorer {
        for reducer in reducers {
            let mut reduced = Vec::with_capacity(per_sample.len());
            for (id, values) in &per_sample {
                reduced.push(EvalSampleScore {
                    sample_id: (*id).clone(),
                    value: reduce(reducer, values)?,
                });
            }
            let values: Vec<f64> = reduced.iter().map(|s| s.value).collect();
            let mean = reduce("mean", &values)?;
            let mut metrics = BTreeMap::new();
            metrics.insert("mean".to_string(), mean);
            metrics.insert("stderr".to_string(), stderr(&values, mean));
            scores.push(EvalScore {
                name: scorer.to_string(),
                reducer: Some(reducer.clone()),
                metrics,
            });
            reductions.push(EvalSampleReductions {
                scorer: scorer.to_string(),
                reducer: Some(reducer.clone()),
                samples: reduced,
            });
        }
    }
    Ok((reductions, scores))
}
