//! OS-preemption outlier filter.
//!
//! A global interquartile fence does a poor job on telemetry from
//! high-frequency, short-duration sites: the distribution is tight and a
//! single descheduling event sits many orders of magnitude out. Instead
//! the fence is built from bucketed maxima: each bucket of consecutive
//! samples contributes its local worst case, and the upper fence is set
//! from the spread of those worst cases.

/// Samples per bucket.
const BUCKET: usize = 1_000;
/// A tail bucket shorter than this contributes no maximum.
const MIN_TAIL: usize = 500;

/// Filter output: the kept samples sorted ascending, plus the number of
/// samples judged to be preemption outliers.
pub struct Cleaned {
    pub samples: Vec<f64>,
    pub bypass: usize,
}

/// Apply the bucketed-IQR fence. Works on cycles or nanoseconds alike;
/// the fence scales with the data.
///
/// If filtering would remove everything, the input is returned unfiltered
/// with a bypass of zero: an all-outlier verdict means the fence, not the
/// data, is wrong.
pub fn clean(input: &[f64]) -> Cleaned {
    let cutoff = upper_fence(input);

    let mut kept = Vec::with_capacity(input.len());
    let mut bypass = 0usize;
    for &v in input {
        if v <= cutoff {
            kept.push(v);
        } else {
            bypass += 1;
        }
    }

    if kept.is_empty() {
        kept = input.to_vec();
        bypass = 0;
    }

    kept.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    Cleaned {
        samples: kept,
        bypass,
    }
}

/// Cutoff above which a sample counts as bypassed.
///
/// - ≥ 4 bucket maxima: sort them, `q1` at index n/4, `q3` at index
///   3n/4, fence at `q3 + 3·IQR` (or `1.5·q3` when the IQR collapses to
///   zero).
/// - 1–3 maxima: too few for quartiles; fence at 1.5 × their median,
///   which for a single bucket is simply 1.5 × its maximum.
/// - no maxima (input shorter than a half bucket): no filtering.
fn upper_fence(input: &[f64]) -> f64 {
    let mut maxima: Vec<f64> = input
        .chunks(BUCKET)
        .filter(|chunk| chunk.len() == BUCKET || chunk.len() >= MIN_TAIL)
        .map(|chunk| chunk.iter().copied().fold(f64::MIN, f64::max))
        .collect();

    if maxima.is_empty() {
        return f64::INFINITY;
    }

    maxima.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = maxima.len();
    if n < 4 {
        return 1.5 * median_of_sorted(&maxima);
    }

    let q1 = maxima[n / 4];
    let q3 = maxima[3 * n / 4];
    let iqr = q3 - q1;
    if iqr == 0.0 {
        1.5 * q3
    } else {
        q3 + 3.0 * iqr
    }
}

fn median_of_sorted(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const US: f64 = 1_000.0; // fixtures are in nanoseconds

    #[test]
    fn short_input_passes_through_sorted() {
        let cleaned = clean(&[30.0, 10.0, 20.0]);
        assert_eq!(cleaned.samples, vec![10.0, 20.0, 30.0]);
        assert_eq!(cleaned.bypass, 0);
    }

    #[test]
    fn two_bucket_fence_catches_one_spike() {
        // 999 quiet samples + one 900 us preemption spike fill the first
        // bucket; a second quiet bucket follows. Exactly the spike goes.
        let mut input = vec![10.0 * US; 999];
        input.push(900.0 * US);
        input.extend(std::iter::repeat(10.0 * US).take(1_000));
        let cleaned = clean(&input);
        assert_eq!(cleaned.bypass, 1);
        assert_eq!(cleaned.samples.len(), 1_999);
        assert!(cleaned.samples.iter().all(|&v| v <= 10.0 * US));
    }

    #[test]
    fn iqr_fence_spares_the_normal_tail() {
        // Six buckets whose maxima sit close together: nothing beyond
        // the fence, nothing bypassed.
        let mut input = Vec::new();
        for b in 0..6 {
            input.extend(std::iter::repeat(10.0 * US).take(999));
            input.push((12.0 + b as f64) * US);
        }
        let cleaned = clean(&input);
        assert_eq!(cleaned.bypass, 0);
        assert_eq!(cleaned.samples.len(), input.len());
    }

    #[test]
    fn iqr_fence_removes_far_outliers() {
        // Five quiet buckets and one wrecked by descheduling.
        let mut input = vec![10.0 * US; 5_000];
        for slot in input.iter_mut().take(4_010).skip(4_000) {
            *slot = 5_000.0 * US;
        }
        input.extend(std::iter::repeat(10.0 * US).take(1_000));
        let cleaned = clean(&input);
        assert_eq!(cleaned.bypass, 10);
        assert_eq!(cleaned.samples.len(), input.len() - 10);
    }

    #[test]
    fn zero_iqr_falls_back_to_scaled_q3() {
        // Identical bucket maxima collapse the IQR; the 1.5*q3 fallback
        // still passes everything at or below the common maximum.
        let input = vec![7.0; 4_000];
        let cleaned = clean(&input);
        assert_eq!(cleaned.bypass, 0);
        assert_eq!(cleaned.samples.len(), 4_000);
    }

    #[test]
    fn empty_input_stays_empty_with_zero_bypass() {
        let cleaned = clean(&[]);
        assert!(cleaned.samples.is_empty());
        assert_eq!(cleaned.bypass, 0);
    }

    #[test]
    fn output_is_sorted_subsequence_and_counts_match() {
        let mut input = vec![10.0 * US; 1_999];
        input.push(900.0 * US);
        let cleaned = clean(&input);
        assert_eq!(cleaned.samples.len() + cleaned.bypass, input.len());
        assert!(cleaned
            .samples
            .windows(2)
            .all(|w| w[0] <= w[1]));
    }
}
