/*
 * This file is part of Drivefan.
 *
 * Copyright (C) 2025 Drivefan contributors
 *
 * Drivefan is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Drivefan is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Drivefan. If not, see <https://www.gnu.org/licenses/>.
 */

//! Positional PID law used to nudge the fan duty cycle.
//!
//! The integral is stored already scaled by `ki` and clamped to
//! `[-imax, imax]`, so `imax` bounds the integral contribution directly.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PidGains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub imax: f64,
}

impl Default for PidGains {
    fn default() -> Self {
        Self { kp: 1.0, ki: 0.0, kd: 0.0, imax: 10.0 }
    }
}

impl PidGains {
    pub fn with_kp(mut self, kp: f64) -> Self {
        self.kp = kp;
        self
    }

    pub fn with_ki(mut self, ki: f64) -> Self {
        self.ki = ki;
        self
    }

    pub fn with_kd(mut self, kd: f64) -> Self {
        self.kd = kd;
        self
    }

    pub fn with_imax(mut self, imax: f64) -> Self {
        self.imax = imax;
        self
    }
}

/// Individual terms of one PID step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PidTerms {
    pub error: f64,
    pub proportional: f64,
    pub integral: f64,
    pub derivative: f64,
}

impl PidTerms {
    /// Control delta to add to the running PWM value.
    pub fn delta(&self) -> f64 {
        self.proportional + self.integral + self.derivative
    }
}

#[derive(Debug, Clone)]
pub struct PidController {
    gains: PidGains,
    integral: f64,
    previous_error: f64,
}

impl PidController {
    pub fn new(gains: PidGains) -> Self {
        Self {
            gains,
            integral: 0.0,
            previous_error: 0.0,
        }
    }

    pub fn gains(&self) -> &PidGains {
        &self.gains
    }

    pub fn integral(&self) -> f64 {
        self.integral
    }

    pub fn previous_error(&self) -> f64 {
        self.previous_error
    }

    /// Advances the controller by `elapsed_secs`.
    ///
    /// Returns `None` without touching any state when the interval is not a
    /// positive finite number; the derivative is undefined there.
    pub fn step(&mut self, current: f64, setpoint: f64, elapsed_secs: f64) -> Option<PidTerms> {
        if !(elapsed_secs > 0.0 && elapsed_secs.is_finite()) {
            return None;
        }

        let error = current - setpoint;
        let proportional = self.gains.kp * error;

        let imax = self.gains.imax.abs();
        self.integral = (self.integral + self.gains.ki * error * elapsed_secs).clamp(-imax, imax);

        let derivative = self.gains.kd * (error - self.previous_error) / elapsed_secs;
        self.previous_error = error;

        Some(PidTerms {
            error,
            proportional,
            integral: self.integral,
            derivative,
        })
    }

    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.previous_error = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-9, "{a} != {b}");
    }

    #[test]
    fn test_proportional_only() {
        let mut pid = PidController::new(PidGains::default());
        let terms = pid.step(45.0, 37.0, 10.0).unwrap();
        assert_close(terms.error, 8.0);
        assert_close(terms.proportional, 8.0);
        assert_close(terms.integral, 0.0);
        assert_close(terms.derivative, 0.0);
        assert_close(terms.delta(), 8.0);
    }

    #[test]
    fn test_integral_accumulates_with_elapsed_time() {
        let mut pid = PidController::new(PidGains::default().with_kp(0.0).with_ki(0.1).with_imax(100.0));
        pid.step(40.0, 37.0, 2.0).unwrap();
        assert_close(pid.integral(), 0.6);
        pid.step(40.0, 37.0, 5.0).unwrap();
        assert_close(pid.integral(), 2.1);
    }

    #[test]
    fn test_integral_is_clamped_to_imax() {
        let mut pid = PidController::new(PidGains::default().with_ki(1.0).with_imax(10.0));
        for _ in 0..50 {
            pid.step(80.0, 37.0, 10.0).unwrap();
            assert!(pid.integral().abs() <= 10.0);
        }
        assert_close(pid.integral(), 10.0);
        for _ in 0..50 {
            pid.step(0.0, 37.0, 10.0).unwrap();
            assert!(pid.integral().abs() <= 10.0);
        }
        assert_close(pid.integral(), -10.0);
    }

    #[test]
    fn test_integral_bound_holds_for_mixed_errors() {
        let mut pid = PidController::new(PidGains::default().with_ki(0.7).with_imax(3.5));
        let temps = [10.0, 90.0, 37.0, 55.0, -20.0, 120.0, 36.0, 38.0, 0.0, 70.0];
        let intervals = [0.5, 10.0, 3.0, 60.0, 0.01, 7.0, 10.0, 10.0, 1.0, 30.0];
        for (t, dt) in temps.iter().zip(intervals.iter()) {
            pid.step(*t, 37.0, *dt).unwrap();
            assert!(pid.integral().abs() <= 3.5);
        }
    }

    #[test]
    fn test_derivative_uses_previous_error() {
        let mut pid = PidController::new(PidGains::default().with_kp(0.0).with_kd(2.0));
        let first = pid.step(40.0, 37.0, 10.0).unwrap();
        // previous error starts at zero
        assert_close(first.derivative, 0.6);
        let second = pid.step(45.0, 37.0, 5.0).unwrap();
        assert_close(second.derivative, 2.0 * (8.0 - 3.0) / 5.0);
        assert_close(pid.previous_error(), 8.0);
    }

    #[test]
    fn test_zero_interval_is_a_no_op() {
        let mut pid = PidController::new(PidGains::default().with_ki(0.5).with_kd(1.0));
        pid.step(45.0, 37.0, 10.0).unwrap();
        let integral = pid.integral();
        let previous = pid.previous_error();

        assert!(pid.step(90.0, 37.0, 0.0).is_none());
        assert_eq!(pid.integral(), integral);
        assert_eq!(pid.previous_error(), previous);
    }

    #[test]
    fn test_non_finite_interval_is_rejected() {
        let mut pid = PidController::new(PidGains::default());
        assert!(pid.step(45.0, 37.0, f64::NAN).is_none());
        assert!(pid.step(45.0, 37.0, f64::INFINITY).is_none());
        assert!(pid.step(45.0, 37.0, -1.0).is_none());
        assert_eq!(pid.previous_error(), 0.0);
    }

    #[test]
    fn test_reset_clears_state() {
        let mut pid = PidController::new(PidGains::default().with_ki(1.0));
        pid.step(50.0, 37.0, 1.0).unwrap();
        pid.reset();
        assert_eq!(pid.integral(), 0.0);
        assert_eq!(pid.previous_error(), 0.0);
    }
}
