//! Descriptive statistics over one component's cleaned samples.

/// Summary of a sorted, cleaned sample set.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Summary {
    pub samples: usize,
    pub avg: f64,
    pub median: f64,
    pub std_dev: f64,
    /// Fisher-Pearson moment coefficient; zero when the distribution is
    /// too small or too flat for the ratio to mean anything.
    pub skew: f64,
    pub min: f64,
    pub max: f64,
    pub range: f64,
}

/// Compute the summary for a sorted, non-empty slice. Returns `None` on
/// empty input.
pub fn summarize(sorted: &[f64]) -> Option<Summary> {
    let n = sorted.len();
    if n == 0 {
        return None;
    }

    let sum: f64 = sorted.iter().sum();
    let avg = sum / n as f64;

    let median = if n % 2 == 0 {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    } else {
        sorted[n / 2]
    };

    let mut variance_sum = 0.0;
    let mut skew_sum = 0.0;
    for &v in sorted {
        let diff = v - avg;
        variance_sum += diff * diff;
        skew_sum += diff * diff * diff;
    }
    // Population form: reports describe the recorded set itself, not a
    // sample of some larger population.
    let std_dev = (variance_sum / n as f64).sqrt();
    let skew = if n > 1 && std_dev > 1e-9 {
        (skew_sum / n as f64) / (std_dev * std_dev * std_dev)
    } else {
        0.0
    };

    let min = sorted[0];
    let max = sorted[n - 1];

    Some(Summary {
        samples: n,
        avg,
        median,
        std_dev,
        skew,
        min,
        max,
        range: max - min,
    })
}
