//! Gauge value merge

/// Weighted mean of `(value, weight)` pairs: `sum(value * weight) / sum(weight)`.
/// Returns the merged value and total weight, or `None` when the total
/// weight is zero.
pub fn weighted_mean<I>(values: I) -> Option<(f64, i64)>
where
    I: IntoIterator<Item = (f64, i64)>,
{
    let (weighted_sum, total_weight) = values
        .into_iter()
        .fold((0.0, 0i64), |(sum, weight), (v, w)| (sum + v * w as f64, weight + w));
    if total_weight == 0 {
        return None;
    }
    Some((weighted_sum / total_weight as f64, total_weight))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weighted_mean() {
        assert_eq!(weighted_mean([(10.0, 1), (20.0, 3)]), Some((17.5, 4)));
    }

    #[test]
    fn test_single_value_unchanged() {
        assert_eq!(weighted_mean([(42.0, 5)]), Some((42.0, 5)));
    }

    #[test]
    fn test_zero_weight() {
        assert_eq!(weighted_mean(std::iter::empty()), None);
        assert_eq!(weighted_mean([(1.0, 0)]), None);
    }
}
