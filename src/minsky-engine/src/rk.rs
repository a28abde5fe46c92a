// Copyright 2025 The Minsky Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! Adaptive Runge-Kutta-Fehlberg 4(5) driver. The embedded fourth
//! order solution estimates the local error of the fifth order one;
//! steps are grown and shrunk to hold the per-component error below
//! `eps_abs + eps_rel * |y|`.

use crate::common::Result;

/// Fehlberg tableau
const A2: [f64; 1] = [1.0 / 4.0];
const A3: [f64; 2] = [3.0 / 32.0, 9.0 / 32.0];
const A4: [f64; 3] = [1932.0 / 2197.0, -7200.0 / 2197.0, 7296.0 / 2197.0];
const A5: [f64; 4] = [439.0 / 216.0, -8.0, 3680.0 / 513.0, -845.0 / 4104.0];
const A6: [f64; 5] = [
    -8.0 / 27.0,
    2.0,
    -3544.0 / 2565.0,
    1859.0 / 4104.0,
    -11.0 / 40.0,
];
const C: [f64; 6] = [0.0, 1.0 / 4.0, 3.0 / 8.0, 12.0 / 13.0, 1.0, 1.0 / 2.0];
/// fifth order weights
const B5: [f64; 6] = [
    16.0 / 135.0,
    0.0,
    6656.0 / 12825.0,
    28561.0 / 56430.0,
    -9.0 / 50.0,
    2.0 / 55.0,
];
/// fourth order weights
const B4: [f64; 6] = [
    25.0 / 216.0,
    0.0,
    1408.0 / 2565.0,
    2197.0 / 4104.0,
    -1.0 / 5.0,
    0.0,
];

const SAFETY: f64 = 0.9;
const SHRINK_LIMIT: f64 = 0.1;
const GROW_LIMIT: f64 = 5.0;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Status {
    /// reached the target time
    Success,
    /// performed the requested number of steps without reaching the
    /// target time; not an error for an open-ended run
    MaxIter,
    /// the system produced a non-finite value
    BadFunc,
    /// the requested accuracy is unachievable at the minimum step size
    Failure,
}

#[derive(Debug)]
pub struct RungeKuttaFehlberg {
    step_min: f64,
    step_max: f64,
    eps_abs: f64,
    eps_rel: f64,
    /// current trial step size, carried between calls
    h: f64,
}

impl RungeKuttaFehlberg {
    pub fn new(step_min: f64, step_max: f64, eps_abs: f64, eps_rel: f64) -> Self {
        RungeKuttaFehlberg {
            step_min,
            step_max,
            eps_abs,
            eps_rel,
            h: step_max,
        }
    }

    /// reset the step-size state after a failed evaluation
    pub fn reset(&mut self) {
        self.h = self.step_max;
    }

    /// advance `y` from `t` toward `t1`, taking at most `nmax`
    /// accepted steps. `f(t, y, dydt)` evaluates the derivative; an
    /// error return maps to `Status::BadFunc`.
    pub fn apply<F>(
        &mut self,
        t: &mut f64,
        t1: f64,
        nmax: usize,
        y: &mut [f64],
        mut f: F,
    ) -> Status
    where
        F: FnMut(f64, &[f64], &mut [f64]) -> Result<()>,
    {
        let n = y.len();
        let hmin = self.step_min.max(f64::MIN_POSITIVE).min(self.step_max);
        let hmax = self.step_max;
        let mut k = vec![vec![0.0; n]; 6];
        let mut ytmp = vec![0.0; n];
        let mut y5 = vec![0.0; n];

        for _ in 0..nmax {
            if *t >= t1 {
                return Status::Success;
            }
            let mut h = self.h.clamp(hmin, hmax);
            if h > t1 - *t {
                h = t1 - *t;
            }

            // try steps until one meets the error tolerance
            loop {
                if f(*t, y, &mut k[0]).is_err() {
                    return Status::BadFunc;
                }
                for stage in 1..6 {
                    let a: &[f64] = match stage {
                        1 => &A2,
                        2 => &A3,
                        3 => &A4,
                        4 => &A5,
                        _ => &A6,
                    };
                    for i in 0..n {
                        let mut acc = 0.0;
                        for (j, aj) in a.iter().enumerate() {
                            acc += aj * k[j][i];
                        }
                        ytmp[i] = y[i] + h * acc;
                    }
                    let (_, rest) = k.split_at_mut(stage);
                    if f(*t + C[stage] * h, &ytmp, &mut rest[0]).is_err() {
                        return Status::BadFunc;
                    }
                }

                // fifth order solution and embedded error estimate
                let mut ratio: f64 = 0.0;
                for i in 0..n {
                    let mut acc5 = 0.0;
                    let mut acc4 = 0.0;
                    for j in 0..6 {
                        acc5 += B5[j] * k[j][i];
                        acc4 += B4[j] * k[j][i];
                    }
                    y5[i] = y[i] + h * acc5;
                    let err = (h * (acc5 - acc4)).abs();
                    let scale = self.eps_abs + self.eps_rel * y5[i].abs();
                    ratio = ratio.max(err / scale);
                }
                if !ratio.is_finite() || y5.iter().any(|v| !v.is_finite()) {
                    return Status::BadFunc;
                }

                if ratio <= 1.0 {
                    // accept, with local extrapolation
                    *t += h;
                    y.copy_from_slice(&y5);
                    let grow = if ratio > 0.0 {
                        (SAFETY * ratio.powf(-0.2)).min(GROW_LIMIT)
                    } else {
                        GROW_LIMIT
                    };
                    self.h = (h * grow.max(1.0)).clamp(hmin, hmax);
                    break;
                }

                // reject and shrink
                h *= (SAFETY * ratio.powf(-0.25)).max(SHRINK_LIMIT);
                if h < hmin && self.step_min > 0.0 {
                    return Status::Failure;
                }
                self.h = h;
            }
        }
        Status::MaxIter
    }
}
