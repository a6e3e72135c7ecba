//! Autoregressive models fitted by least squares
//!
//! The seasonal model regresses each hour on the previous two hours and on
//! the same hour one period earlier (and the hour before that), which
//! carries the daily shape. The non-seasonal model is a plain AR(p).
//! Forecast variance follows from the model's psi weights.

use ndarray::{Array1, Array2};

/// Relative ridge penalty keeping the normal equations well conditioned
const RIDGE: f64 = 1e-6;

/// Structure of the autoregression
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelSpec {
    /// Lags 1, 2, `period`, `period + 1`
    Seasonal { period: usize },
    /// Lags 1..=`order`
    NonSeasonal { order: usize },
}

impl ModelSpec {
    pub fn lags(&self) -> Vec<usize> {
        match *self {
            ModelSpec::Seasonal { period } => vec![1, 2, period, period + 1],
            ModelSpec::NonSeasonal { order } => (1..=order.max(1)).collect(),
        }
    }

    /// Fewest observations that leave at least one residual degree of freedom
    pub fn min_observations(&self) -> usize {
        let lags = self.lags();
        let max_lag = lags.iter().copied().max().unwrap_or(1);
        max_lag + lags.len() + 2
    }

    pub fn name(&self) -> &'static str {
        match self {
            ModelSpec::Seasonal { .. } => "seasonal_ar",
            ModelSpec::NonSeasonal { .. } => "ar",
        }
    }
}

/// Point forecasts with their standard errors
#[derive(Debug, Clone, PartialEq)]
pub struct Forecast {
    pub mean: Vec<f64>,
    pub std_err: Vec<f64>,
}

/// Fitted autoregression
#[derive(Debug, Clone)]
pub struct ArModel {
    lags: Vec<usize>,
    intercept: f64,
    coefs: Vec<f64>,
    /// Residual variance
    sigma2: f64,
}

impl ArModel {
    /// Fit by ordinary least squares with a small ridge on the lag terms
    pub fn fit(series: &[f64], spec: ModelSpec) -> Result<Self, String> {
        let lags = spec.lags();
        if series.len() < spec.min_observations() {
            return Err(format!(
                "{} needs at least {} points, got {}",
                spec.name(),
                spec.min_observations(),
                series.len()
            ));
        }
        if series.iter().any(|v| !v.is_finite()) {
            return Err("series contains non-finite values".to_string());
        }

        let max_lag = lags.iter().copied().max().unwrap_or(1);
        let rows = series.len() - max_lag;
        let k = lags.len() + 1;

        let mut x = Array2::<f64>::zeros((rows, k));
        let mut y = Array1::<f64>::zeros(rows);
        for (i, t) in (max_lag..series.len()).enumerate() {
            x[[i, 0]] = 1.0;
            for (j, lag) in lags.iter().enumerate() {
                x[[i, j + 1]] = series[t - lag];
            }
            y[i] = series[t];
        }

        let mut xtx = x.t().dot(&x);
        let xty = x.t().dot(&y);
        let scale = (0..k).map(|i| xtx[[i, i]]).sum::<f64>() / k as f64;
        let lambda = RIDGE * scale.max(1.0);
        for i in 1..k {
            xtx[[i, i]] += lambda;
        }

        let beta = solve(xtx, xty)?;
        let residuals = &y - &x.dot(&beta);
        let ssr = residuals.dot(&residuals);
        let dof = rows.saturating_sub(k).max(1);
        let sigma2 = ssr / dof as f64;

        if !sigma2.is_finite() || beta.iter().any(|b| !b.is_finite()) {
            return Err("fit produced non-finite coefficients".to_string());
        }

        Ok(Self {
            lags,
            intercept: beta[0],
            coefs: beta.iter().skip(1).copied().collect(),
            sigma2,
        })
    }

    pub fn sigma2(&self) -> f64 {
        self.sigma2
    }

    pub fn coefficients(&self) -> (f64, &[f64]) {
        (self.intercept, &self.coefs)
    }

    /// Forecast `steps` values following `history`.
    ///
    /// `history` must hold at least as many points as the largest lag.
    pub fn forecast(&self, history: &[f64], steps: usize) -> Forecast {
        let mut buffer = history.to_vec();
        let mut mean = Vec::with_capacity(steps);
        for _ in 0..steps {
            let n = buffer.len();
            let value = self.intercept
                + self
                    .lags
                    .iter()
                    .zip(&self.coefs)
                    .map(|(lag, c)| c * buffer.get(n.wrapping_sub(*lag)).copied().unwrap_or(0.0))
                    .sum::<f64>();
            buffer.push(value);
            mean.push(value);
        }

        let psi = self.psi_weights(steps);
        let mut acc = 0.0;
        let std_err = psi
            .iter()
            .map(|w| {
                acc += w * w;
                (self.sigma2 * acc).sqrt()
            })
            .collect();

        Forecast { mean, std_err }
    }

    /// MA(∞) weights of the fitted process
    fn psi_weights(&self, steps: usize) -> Vec<f64> {
        let mut psi = Vec::with_capacity(steps);
        for i in 0..steps {
            if i == 0 {
                psi.push(1.0);
                continue;
            }
            let w = self
                .lags
                .iter()
                .zip(&self.coefs)
                .filter(|(lag, _)| **lag <= i)
                .map(|(lag, c)| c * psi[i - lag])
                .sum();
            psi.push(w);
        }
        psi
    }
}

/// Solve `a · x = b` by Gaussian elimination with partial pivoting
fn solve(mut a: Array2<f64>, mut b: Array1<f64>) -> Result<Array1<f64>, String> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&r1, &r2| a[[r1, col]].abs().total_cmp(&a[[r2, col]].abs()))
            .unwrap_or(col);
        if a[[pivot, col]].abs() < 1e-12 {
            return Err("normal equations are singular".to_string());
        }
        if pivot != col {
            for k in 0..n {
                a.swap([col, k], [pivot, k]);
            }
            b.swap(col, pivot);
        }
        for row in col + 1..n {
            let factor = a[[row, col]] / a[[col, col]];
            if factor == 0.0 {
                continue;
            }
            for k in col..n {
                a[[row, k]] -= factor * a[[col, k]];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = Array1::<f64>::zeros(n);
    for row in (0..n).rev() {
        let tail: f64 = (row + 1..n).map(|k| a[[row, k]] * x[k]).sum();
        x[row] = (b[row] - tail) / a[[row, row]];
    }
    Ok(x)
}
