use crate::errors::{CalibError, CalibResult};
use std::collections::VecDeque;

/// Simple moving average over a fixed window, O(1) per push.
#[derive(Debug, Clone)]
pub struct MovingAverage {
    period: usize,
    buffer: VecDeque<f64>,
    sum: f64,
}

impl MovingAverage {
    pub fn new(period: usize) -> CalibResult<Self> {
        if period == 0 {
            return Err(CalibError::InvalidWindow(period));
        }
        Ok(Self {
            period,
            buffer: VecDeque::with_capacity(period + 1),
            sum: 0.0,
        })
    }

    /// Push a new value, return the current mean once the window is full.
    pub fn push(&mut self, value: f64) -> Option<f64> {
        if self.buffer.len() == self.period {
            if let Some(old) = self.buffer.pop_front() {
                self.sum -= old;
            }
        }
        self.buffer.push_back(value);
        self.sum += value;
        self.value()
    }

    pub fn value(&self) -> Option<f64> {
        if self.buffer.len() == self.period {
            Some(self.sum / self.period as f64)
        } else {
            None
        }
    }

    pub fn is_ready(&self) -> bool {
        self.buffer.len() == self.period
    }
}

/// Rolling mean aligned with `series`: `None` for the first `window - 1`
/// positions, then the mean of the trailing `window` values.
pub fn moving_average(series: &[f64], window: usize) -> CalibResult<Vec<Option<f64>>> {
    let mut sma = MovingAverage::new(window)?;
    Ok(series.iter().map(|&p| sma.push(p)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aligned_output() {
        let out = moving_average(&[1.0, 2.0, 3.0, 4.0, 5.0], 3).unwrap();
        assert_eq!(out.len(), 5);
        assert_eq!(out[0], None);
        assert_eq!(out[1], None);
        assert!((out[2].unwrap() - 2.0).abs() < f64::EPSILON);
        assert!((out[4].unwrap() - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_window_longer_than_series() {
        let out = moving_average(&[1.0, 2.0], 3).unwrap();
        assert!(out.iter().all(Option::is_none));
    }

    #[test]
    fn test_push_wraps() {
        let mut sma = MovingAverage::new(2).unwrap();
        assert_eq!(sma.push(10.0), None);
        assert!(!sma.is_ready());
        assert!((sma.push(20.0).unwrap() - 15.0).abs() < f64::EPSILON);
        assert!((sma.push(40.0).unwrap() - 30.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_zero_window_rejected() {
        assert!(moving_average(&[1.0], 0).is_err());
    }
}
