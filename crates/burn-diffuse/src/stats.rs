//! Tensor diagnostics
//!
//! Host-side summaries for the debug printouts plus an optional
//! non-finite trap for catching numerical blowups close to their
//! source.

use std::fmt;

use burn::prelude::*;

/// Single-pass summary of one tensor. Non-finite values are counted
/// separately and excluded from the moments.
pub struct TensorReport {
    pub min: f32,
    pub max: f32,
    pub mean: f32,
    pub std: f32,
    pub nan: usize,
    pub inf: usize,
    pub len: usize,
}

impl TensorReport {
    pub fn of<B: Backend, const D: usize>(tensor: &Tensor<B, D>) -> Self {
        let values: Vec<f32> = tensor
            .clone()
            .into_data()
            .convert::<f32>()
            .to_vec()
            .unwrap();

        let mut report = Self {
            min: f32::INFINITY,
            max: f32::NEG_INFINITY,
            mean: 0.0,
            std: 0.0,
            nan: 0,
            inf: 0,
            len: values.len(),
        };
        let mut sum = 0.0f64;
        for &v in &values {
            if v.is_nan() {
                report.nan += 1;
            } else if v.is_infinite() {
                report.inf += 1;
            } else {
                report.min = report.min.min(v);
                report.max = report.max.max(v);
                sum += v as f64;
            }
        }

        let finite = report.len - report.nan - report.inf;
        if finite > 0 {
            report.mean = (sum / finite as f64) as f32;
            let var = values
                .iter()
                .filter(|v| v.is_finite())
                .map(|&v| ((v - report.mean) as f64).powi(2))
                .sum::<f64>()
                / finite as f64;
            report.std = var.sqrt() as f32;
        }
        report
    }

    pub fn is_finite(&self) -> bool {
        self.nan == 0 && self.inf == 0
    }
}

impl fmt::Display for TensorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.len == 0 {
            return write!(f, "empty");
        }
        write!(
            f,
            "min={:.4}, max={:.4}, mean={:.4}, std={:.4}",
            self.min, self.max, self.mean, self.std
        )?;
        if !self.is_finite() {
            write!(f, " [NaN={}, Inf={}]", self.nan, self.inf)?;
        }
        Ok(())
    }
}

/// Panic on NaN/Inf when `enabled`; no-op otherwise
#[inline]
pub fn trap_non_finite_if<B: Backend, const D: usize>(
    tensor: &Tensor<B, D>,
    name: &str,
    enabled: bool,
) {
    if !enabled {
        return;
    }
    let report = TensorReport::of(tensor);
    if !report.is_finite() {
        panic!(
            "non-finite values in {}: NaN={}/{}, Inf={}/{} ({})",
            name, report.nan, report.len, report.inf, report.len, report
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type B = burn_ndarray::NdArray<f32>;

    #[test]
    fn test_report_format() {
        let t = Tensor::<B, 2>::ones([2, 2], &Default::default());
        let s = TensorReport::of(&t).to_string();
        assert!(s.contains("mean=1.0000"), "{}", s);
        assert!(!s.contains("NaN"), "{}", s);
    }

    #[test]
    fn test_non_finite_excluded_from_moments() {
        let t = Tensor::<B, 1>::from_data(
            TensorData::new(vec![1.0f32, 3.0, f32::NAN, f32::INFINITY], [4]),
            &Default::default(),
        );
        let report = TensorReport::of(&t);
        assert_eq!((report.nan, report.inf), (1, 1));
        assert!((report.mean - 2.0).abs() < 1e-6);
        assert!((report.max - 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_trap_disabled_never_panics() {
        let t = Tensor::<B, 1>::from_data(
            TensorData::new(vec![f32::NAN], [1]),
            &Default::default(),
        );
        trap_non_finite_if(&t, "nan", false);
    }
}
