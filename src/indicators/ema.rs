// =============================================================================
// Exponential Moving Average (EMA)
// =============================================================================
//
// Formula:
//   multiplier = 2 / (period + 1)
//   EMA_t      = value_t * multiplier + EMA_{t-1} * (1 - multiplier)
//
// The series is seeded with the first value; every later value is smoothed in.
// =============================================================================

/// Compute the final EMA of `values` for the given look-back `period`.
///
/// # Edge cases
/// - `period == 0` => `None` (division guard)
/// - empty input => `None`
/// - a non-finite intermediate poisons the series => `None`
pub fn ema_last(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 {
        return None;
    }
    let mut iter = values.iter();
    let mut ema = *iter.next()?;
    if !ema.is_finite() {
        return None;
    }

    let multiplier = 2.0 / (period as f64 + 1.0);
    for &value in iter {
        ema = value * multiplier + ema * (1.0 - multiplier);
        if !ema.is_finite() {
            return None;
        }
    }
    Some(ema)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input() {
        assert_eq!(ema_last(&[], 9), None);
    }

    #[test]
    fn period_zero() {
        assert_eq!(ema_last(&[1.0, 2.0], 0), None);
    }

    #[test]
    fn single_value_is_the_seed() {
        assert_eq!(ema_last(&[42.0], 9), Some(42.0));
    }

    #[test]
    fn known_values() {
        // period 2 => multiplier 2/3; seed = 1
        // step 2: 2*(2/3) + 1*(1/3) = 5/3
        // step 3: 3*(2/3) + (5/3)*(1/3) = 2 + 5/9 = 23/9
        let ema = ema_last(&[1.0, 2.0, 3.0], 2).unwrap();
        assert!((ema - 23.0 / 9.0).abs() < 1e-12, "got {ema}");
    }

    #[test]
    fn constant_series_stays_constant() {
        let values = vec![100.0; 50];
        assert!((ema_last(&values, 9).unwrap() - 100.0).abs() < 1e-12);
    }

    #[test]
    fn nan_poisons_the_series() {
        assert_eq!(ema_last(&[1.0, f64::NAN, 3.0], 3), None);
        assert_eq!(ema_last(&[f64::NAN, 1.0], 3), None);
    }

    #[test]
    fn rising_series_lags_below_last_value() {
        let values: Vec<f64> = (1..=40).map(|i| i as f64).collect();
        let ema = ema_last(&values, 9).unwrap();
        assert!(ema < 40.0);
        assert!(ema > 30.0);
    }
}
