use crate::errors::{CalibError, CalibResult};
use crate::state::TrendWindowResult;
use statrs::statistics::Statistics;
use std::collections::VecDeque;

/// Minimum window length for a defined sample standard deviation.
pub const MIN_WINDOW: usize = 2;

/// Least-squares slope of `logs` against 1..=n and their sample standard
/// deviation (divisor n - 1). Requires n >= 2.
pub fn fit_log_trend(logs: &[f64]) -> (f64, f64) {
    let n = logs.len();
    debug_assert!(n >= MIN_WINDOW);
    let nf = n as f64;

    // Day index 1..n: mean (n+1)/2, centred sum of squares n(n^2-1)/12.
    let t_mean = (nf + 1.0) / 2.0;
    let sxx = nf * (nf * nf - 1.0) / 12.0;
    let l_mean = logs.mean();

    let mut sxy = 0.0;
    for (j, &l) in logs.iter().enumerate() {
        sxy += (j as f64 + 1.0 - t_mean) * (l - l_mean);
    }

    (sxy / sxx, logs.std_dev())
}

/// Lazy E1/E2 computation over every trailing window of `series`.
///
/// Yields one item per index `window - 1 ..= len - 1`. A window holding a
/// non-positive price yields `CalibError::NonPositivePrice` instead of a
/// result; the offending value is never passed to `ln`.
pub struct TrendWindows<'a> {
    series: &'a [f64],
    window: usize,
    next_end: usize,
    logs: Vec<f64>,
}

impl<'a> TrendWindows<'a> {
    pub fn new(series: &'a [f64], window: usize) -> CalibResult<Self> {
        if window < MIN_WINDOW {
            return Err(CalibError::InvalidWindow(window));
        }
        Ok(Self {
            series,
            window,
            next_end: window - 1,
            logs: Vec::with_capacity(window),
        })
    }
}

impl Iterator for TrendWindows<'_> {
    type Item = CalibResult<TrendWindowResult>;

    fn next(&mut self) -> Option<Self::Item> {
        let end = self.next_end;
        if end >= self.series.len() {
            return None;
        }
        self.next_end += 1;

        let start = end + 1 - self.window;
        let prices = &self.series[start..=end];
        if let Some(offset) = prices.iter().position(|&p| !(p > 0.0) || !p.is_finite()) {
            // Fuse: later windows are not computed after a domain error.
            self.next_end = self.series.len();
            return Some(Err(CalibError::NonPositivePrice {
                index: start + offset,
                price: prices[offset],
            }));
        }

        self.logs.clear();
        self.logs.extend(prices.iter().map(|p| p.ln()));
        let (slope, dispersion) = fit_log_trend(&self.logs);
        Some(Ok(TrendWindowResult { index: end, slope, dispersion }))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.series.len().saturating_sub(self.next_end);
        (0, Some(remaining))
    }
}

/// E1/E2 for every trailing window, collected. Fails on the first window
/// holding a non-positive price.
pub fn rolling_features(series: &[f64], window: usize) -> CalibResult<Vec<TrendWindowResult>> {
    TrendWindows::new(series, window)?.collect()
}

/// Incremental trend engine. Keeps only the trailing window of log prices,
/// so each new sample costs O(window) regardless of series length.
#[derive(Debug, Clone)]
pub struct TrendEngine {
    window: usize,
    logs: VecDeque<f64>,
    /// Samples accepted so far (index of the next sample).
    count: usize,
}

impl TrendEngine {
    pub fn new(window: usize) -> CalibResult<Self> {
        if window < MIN_WINDOW {
            return Err(CalibError::InvalidWindow(window));
        }
        Ok(Self {
            window,
            logs: VecDeque::with_capacity(window + 1),
            count: 0,
        })
    }

    /// Push the next price. Returns the result for the window ending at this
    /// sample once `window` samples have been seen. A non-positive price is
    /// rejected and leaves the engine unchanged.
    pub fn update(&mut self, price: f64) -> CalibResult<Option<TrendWindowResult>> {
        if !(price > 0.0) || !price.is_finite() {
            return Err(CalibError::NonPositivePrice { index: self.count, price });
        }

        if self.logs.len() == self.window {
            self.logs.pop_front();
        }
        self.logs.push_back(price.ln());
        let index = self.count;
        self.count += 1;

        if self.logs.len() < self.window {
            return Ok(None);
        }

        let (slope, dispersion) = fit_log_trend(self.logs.make_contiguous());
        Ok(Some(TrendWindowResult { index, slope, dispersion }))
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.logs.len() == self.window
    }

    #[inline]
    pub fn window(&self) -> usize {
        self.window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_series_scenario() {
        let out = rolling_features(&[100.0; 5], 3).unwrap();
        assert_eq!(out.len(), 3);
        for (k, r) in out.iter().enumerate() {
            assert_eq!(r.index, k + 2);
            assert!(r.slope.abs() < 1e-12, "slope {}", r.slope);
            assert!(r.dispersion.abs() < 1e-12, "dispersion {}", r.dispersion);
        }
    }

    #[test]
    fn test_result_count() {
        let series: Vec<f64> = (1..=50).map(|i| 100.0 + i as f64).collect();
        for n in [2, 3, 10, 50] {
            assert_eq!(rolling_features(&series, n).unwrap().len(), 50 - n + 1);
        }
        assert!(rolling_features(&series, 51).unwrap().is_empty());
    }

    #[test]
    fn test_exponential_growth_has_exact_slope() {
        // ln(p_j) = ln(100) + 0.01 j: slope 0.01 in every window.
        let series: Vec<f64> = (0..20).map(|j| 100.0 * (0.01 * j as f64).exp()).collect();
        for r in rolling_features(&series, 5).unwrap() {
            assert!((r.slope - 0.01).abs() < 1e-12, "slope {}", r.slope);
        }
    }

    #[test]
    fn test_dispersion_uses_sample_divisor() {
        // logs 0 and ln(e^2) = 2: mean 1, sample variance 2.
        let e2 = 2f64.exp();
        let out = rolling_features(&[1.0, e2], 2).unwrap();
        assert!((out[0].dispersion - 2f64.sqrt()).abs() < 1e-12);
        assert!((out[0].slope - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_non_positive_price_is_domain_error() {
        let series = [100.0, 101.0, 0.0, 103.0, 104.0];
        let err = rolling_features(&series, 2).unwrap_err();
        assert!(err.is_input_domain());
        assert!(matches!(err, CalibError::NonPositivePrice { index: 2, .. }));

        let mut windows = TrendWindows::new(&series, 2).unwrap();
        assert!(windows.next().unwrap().is_ok());
        assert!(windows.next().unwrap().is_err());
        assert!(windows.next().is_none(), "iterator fuses after a domain error");
    }

    #[test]
    fn test_window_below_two_rejected() {
        assert!(matches!(rolling_features(&[1.0, 2.0], 1), Err(CalibError::InvalidWindow(1))));
        assert!(TrendEngine::new(0).is_err());
    }

    #[test]
    fn test_engine_matches_batch() {
        let series: Vec<f64> = (0..40).map(|j| 100.0 + 10.0 * (j as f64 * 0.7).sin()).collect();
        let batch = rolling_features(&series, 7).unwrap();

        let mut engine = TrendEngine::new(7).unwrap();
        let streamed: Vec<_> = series.iter().filter_map(|&p| engine.update(p).unwrap()).collect();

        assert_eq!(batch.len(), streamed.len());
        for (a, b) in batch.iter().zip(streamed.iter()) {
            assert_eq!(a.index, b.index);
            assert!((a.slope - b.slope).abs() < 1e-12);
            assert!((a.dispersion - b.dispersion).abs() < 1e-12);
        }
    }

    #[test]
    fn test_engine_rejects_bad_price_without_state_change() {
        let mut engine = TrendEngine::new(2).unwrap();
        assert_eq!(engine.update(100.0).unwrap(), None);
        assert!(engine.update(-1.0).is_err());
        let r = engine.update(100.0).unwrap().expect("window full");
        assert_eq!(r.index, 1);
        assert!(engine.is_ready());
    }
}
