//! Order statistics used by the heuristics and sanity gate.

/// Median of `values`; `None` when empty. NaNs sort last.
pub fn median(values: &[f64]) -> Option<f64> {
    percentile(values, 50.0)
}

/// Linear-interpolated percentile (`q` in 0..=100); `None` when empty.
pub fn percentile(values: &[f64], q: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let q = q.clamp(0.0, 100.0) / 100.0;
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

/// Median of absolute values.
pub fn median_abs(values: &[f64]) -> Option<f64> {
    let abs: Vec<f64> = values.iter().map(|v| v.abs()).collect();
    median(&abs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_median_odd_even() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&[4.0, 1.0, 2.0, 3.0]), Some(2.5));
        assert_eq!(median(&[]), None);
    }

    #[test]
    fn test_percentile_interpolates() {
        let v: Vec<f64> = (1..=11).map(|x| x as f64).collect();
        assert!((percentile(&v, 90.0).unwrap() - 10.0).abs() < 1e-12);
        assert_eq!(percentile(&v, 0.0), Some(1.0));
        assert!((percentile(&[1.0, 2.0], 90.0).unwrap() - 1.9).abs() < 1e-12);
    }

    #[test]
    fn test_median_abs() {
        assert_eq!(median_abs(&[-3.0, 1.0, -2.0]), Some(2.0));
    }
}
