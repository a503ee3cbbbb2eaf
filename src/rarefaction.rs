//! Rarefaction-curve saturation check.
//!
//! The tail slope of a rarefaction curve tells whether deeper sequencing would
//! still reveal new species. A flat tail (small slope) means the sample is
//! close to saturation and is worth keeping.

use serde::Serialize;
use serde_json::Value;

/// Minimum number of samples needed to compute the tail slope.
pub const MIN_CURVE_POINTS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CurvePoint {
    pub reads: f64,
    pub species: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Thresholds {
    /// Accept when the tail slope is strictly below this value.
    pub slope_threshold: f64,
    pub min_species_count: f64,
    pub min_read_count: f64,
    pub ignore_slope: bool,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            slope_threshold: 0.5,
            min_species_count: 1000.0,
            min_read_count: 1_000_000.0,
            ignore_slope: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictReason {
    Saturated,
    SlopeIgnored,
    SpeciesCountTooLow,
    ReadCountTooLow,
    SlopeTooSteep,
    MalformedCurve,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Verdict {
    pub accepted: bool,
    pub slope: f64,
    pub species_count: f64,
    pub reason: VerdictReason,
}

impl Verdict {
    fn malformed() -> Self {
        Self {
            accepted: false,
            slope: 0.0,
            species_count: 0.0,
            reason: VerdictReason::MalformedCurve,
        }
    }
}

pub fn evaluate(samples: &[CurvePoint], thresholds: &Thresholds) -> Verdict {
    let n = samples.len();
    if n < MIN_CURVE_POINTS {
        return Verdict::malformed();
    }

    let (mut y2, mut y1) = (samples[n - 1].species, samples[n - 3].species);
    // One step back only; a second regression is taken as is.
    if y2 < y1 {
        y2 = samples[n - 2].species;
        y1 = samples[n - 4].species;
    }
    let slope = y2 - y1;
    let max_reads = samples[n - 1].reads;

    let (accepted, reason) = if y2 < thresholds.min_species_count {
        (false, VerdictReason::SpeciesCountTooLow)
    } else if max_reads < thresholds.min_read_count {
        (false, VerdictReason::ReadCountTooLow)
    } else if thresholds.ignore_slope {
        (true, VerdictReason::SlopeIgnored)
    } else if slope < thresholds.slope_threshold {
        (true, VerdictReason::Saturated)
    } else {
        (false, VerdictReason::SlopeTooSteep)
    };

    Verdict {
        accepted,
        slope,
        species_count: y2,
        reason,
    }
}

/// Evaluates the raw secondary-fetch response. Anything that is not a list of
/// numeric `[reads, species]` pairs yields a malformed-curve rejection.
pub fn evaluate_json(value: &Value, thresholds: &Thresholds) -> Verdict {
    match parse_curve(value) {
        Some(samples) => evaluate(&samples, thresholds),
        None => Verdict::malformed(),
    }
}

pub fn parse_curve(value: &Value) -> Option<Vec<CurvePoint>> {
    value
        .as_array()?
        .iter()
        .map(|point| {
            let pair = point.as_array()?;
            if pair.len() < 2 {
                return None;
            }
            Some(CurvePoint {
                reads: numeric(&pair[0])?,
                species: numeric(&pair[1])?,
            })
        })
        .collect()
}

fn numeric(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    number.is_finite().then_some(number)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn curve(points: &[(f64, f64)]) -> Vec<CurvePoint> {
        points
            .iter()
            .map(|&(reads, species)| CurvePoint { reads, species })
            .collect()
    }

    fn lenient() -> Thresholds {
        Thresholds {
            slope_threshold: 0.5,
            min_species_count: 0.0,
            min_read_count: 0.0,
            ignore_slope: false,
        }
    }

    #[test]
    fn regressed_tail_steps_back_once() {
        let samples = curve(&[(1.0, 100.0), (2.0, 90.0), (3.0, 95.0), (4.0, 20.0)]);
        let verdict = evaluate(&samples, &lenient());
        assert_eq!(verdict.slope, -5.0);
        assert_eq!(verdict.species_count, 95.0);
        assert!(verdict.accepted);
    }

    #[test]
    fn second_regression_is_not_corrected() {
        let samples = curve(&[
            (1.0, 300.0),
            (2.0, 200.0),
            (3.0, 100.0),
            (4.0, 150.0),
            (5.0, 50.0),
        ]);
        // y[4] < y[2] → fallback to y[3] - y[1] = -50 even though y[3] < y[1].
        let verdict = evaluate(&samples, &lenient());
        assert_eq!(verdict.slope, -50.0);
        assert_eq!(verdict.species_count, 150.0);
    }

    #[test]
    fn low_species_count_wins_over_flat_slope() {
        let samples = curve(&[
            (1e6, 497.0),
            (5e6, 499.0),
            (1e7, 500.0),
            (5e7, 500.0),
        ]);
        let thresholds = Thresholds {
            min_species_count: 1000.0,
            ..Thresholds::default()
        };
        let verdict = evaluate(&samples, &thresholds);
        assert!(!verdict.accepted);
        assert_eq!(verdict.reason, VerdictReason::SpeciesCountTooLow);
        assert_eq!(verdict.species_count, 500.0);
    }

    #[test]
    fn shallow_sequencing_is_rejected() {
        let samples = curve(&[
            (1000.0, 1900.0),
            (2000.0, 2000.0),
            (3000.0, 2000.0),
            (4000.0, 2000.0),
        ]);
        let verdict = evaluate(&samples, &Thresholds::default());
        assert_eq!(verdict.reason, VerdictReason::ReadCountTooLow);
    }

    #[test]
    fn ignore_slope_accepts_steep_curve() {
        let samples = curve(&[
            (500_000.0, 1900.0),
            (1_000_000.0, 1950.0),
            (1_500_000.0, 1950.0),
            (2_000_000.0, 2000.0),
        ]);
        let thresholds = Thresholds {
            ignore_slope: true,
            ..Thresholds::default()
        };
        let verdict = evaluate(&samples, &thresholds);
        assert_eq!(verdict.slope, 50.0);
        assert!(verdict.accepted);
        assert_eq!(verdict.reason, VerdictReason::SlopeIgnored);

        let verdict = evaluate(&samples, &Thresholds::default());
        assert!(!verdict.accepted);
        assert_eq!(verdict.reason, VerdictReason::SlopeTooSteep);
    }

    #[test]
    fn malformed_curves_reject_with_zeroes() {
        let short = curve(&[(1.0, 1.0), (2.0, 2.0), (3.0, 3.0)]);
        assert_eq!(evaluate(&short, &lenient()), Verdict::malformed());

        let non_numeric = json!([[1, 2], [2, "x"], [3, 4], [4, 5]]);
        let verdict = evaluate_json(&non_numeric, &lenient());
        assert!(!verdict.accepted);
        assert_eq!(verdict.slope, 0.0);
        assert_eq!(verdict.species_count, 0.0);

        let not_a_list = json!({"error": "not found"});
        assert_eq!(
            evaluate_json(&not_a_list, &lenient()).reason,
            VerdictReason::MalformedCurve
        );
    }

    #[test]
    fn parses_numeric_pairs() {
        let value = json!([[1000, 10], [2000, 15.5], ["3000", "17"]]);
        let samples = parse_curve(&value).unwrap();
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[2], CurvePoint { reads: 3000.0, species: 17.0 });
    }
}
