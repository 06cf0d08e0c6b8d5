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

//! The closed loop: sense all drives, run the PID law on the hottest one,
//! apply the safety limits and drive both fan channels.

use std::thread;
use std::time::Instant;

use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::{Config, PWM_MAX};
use crate::logger;
use crate::pid::{PidController, PidTerms};
use crate::probe::{read_or_zero, TemperatureProbe};
use crate::superio::{drive_all_channels, FanController, HardwareError};

/// Everything decided in one applied cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    pub max_temp: i32,
    pub elapsed_secs: f64,
    pub terms: PidTerms,
    pub pwm_float: f64,
    pub pwm: u8,
    pub overheat: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Applied(CycleReport),
    /// The measured interval was zero; nothing was computed or written.
    Skipped { max_temp: i32 },
}

/// Clamps the running PWM value.
///
/// Overheat, or a value above `PWM_MAX`, forces full speed; otherwise the
/// value is floored at `pwm_min`. A non-finite value also forces full speed.
pub fn apply_safety_limits(pwm_float: f64, max_temp: i32, config: &Config) -> f64 {
    let max = f64::from(PWM_MAX);
    if max_temp > config.overheat || pwm_float > max || !pwm_float.is_finite() {
        max
    } else if pwm_float < f64::from(config.pwm_min) {
        f64::from(config.pwm_min)
    } else {
        pwm_float
    }
}

pub struct ControlLoop<'a, H: FanController, T: TemperatureProbe> {
    config: &'a Config,
    hardware: H,
    probe: T,
    pid: PidController,
    pwm_float: f64,
    pwm: u8,
    last_sample: Instant,
}

impl<'a, H: FanController, T: TemperatureProbe> ControlLoop<'a, H, T> {
    /// `started` is the reference instant for the first cycle's interval.
    pub fn new(config: &'a Config, hardware: H, probe: T, started: Instant) -> Self {
        Self {
            config,
            hardware,
            probe,
            pid: PidController::new(config.gains()),
            pwm_float: f64::from(config.pwm_init),
            pwm: config.pwm_init,
            last_sample: started,
        }
    }

    pub fn pwm(&self) -> u8 {
        self.pwm
    }

    pub fn pwm_float(&self) -> f64 {
        self.pwm_float
    }

    pub fn pid(&self) -> &PidController {
        &self.pid
    }

    pub fn hardware(&self) -> &H {
        &self.hardware
    }

    pub fn last_sample(&self) -> Instant {
        self.last_sample
    }

    /// Writes the initial duty cycle and takes the fans out of automatic
    /// mode. Must run once before the first cycle.
    pub fn start(&mut self) -> Result<(), HardwareError> {
        drive_all_channels(&mut self.hardware, self.pwm)?;
        self.hardware.set_manual_mode()?;
        info!(pwm = self.pwm, drives = ?self.config.drives, "fan control started");
        Ok(())
    }

    /// Hottest reading across all drives, probed in order. Failed readings
    /// count as 0 °C.
    pub fn max_temperature(&self) -> i32 {
        let mut max_temp = 0;
        for drive in &self.config.drives {
            let temp = read_or_zero(&self.probe, drive);
            debug!(drive = %drive, temperature = temp, "drive temperature");
            max_temp = max_temp.max(temp);
        }
        max_temp
    }

    /// One cycle using `now` as the post-sensing timestamp.
    pub fn run_cycle_at(&mut self, now: Instant) -> Result<CycleOutcome, HardwareError> {
        self.run_cycle_with(|| now)
    }

    /// One cycle. `clock` is sampled after all drives have been read.
    pub fn run_cycle_with<C: FnOnce() -> Instant>(&mut self, clock: C) -> Result<CycleOutcome, HardwareError> {
        let max_temp = self.max_temperature();

        let now = clock();
        let elapsed_secs = now.saturating_duration_since(self.last_sample).as_secs_f64();
        let Some(terms) = self.pid.step(f64::from(max_temp), f64::from(self.config.setpoint), elapsed_secs) else {
            debug!(max_temp, "zero interval since last cycle, skipping");
            logger::log_event("cycle_skipped", json!({ "max_temp": max_temp }));
            return Ok(CycleOutcome::Skipped { max_temp });
        };
        self.last_sample = now;

        self.pwm_float = apply_safety_limits(self.pwm_float + terms.delta(), max_temp, self.config);
        // Truncation; the value is already within [pwm_min, PWM_MAX].
        self.pwm = self.pwm_float as u8;

        let overheat = max_temp > self.config.overheat;
        if overheat {
            warn!(max_temp, limit = self.config.overheat, "overheat, fans at full speed");
        }
        debug!(
            max_temp,
            error = terms.error,
            p = terms.proportional,
            i = terms.integral,
            d = terms.derivative,
            pwm_float = self.pwm_float,
            pwm = self.pwm,
            "control cycle"
        );

        drive_all_channels(&mut self.hardware, self.pwm)?;

        let report = CycleReport {
            max_temp,
            elapsed_secs,
            terms,
            pwm_float: self.pwm_float,
            pwm: self.pwm,
            overheat,
        };
        if logger::is_enabled() {
            logger::log_event("cycle", serde_json::to_value(&report).unwrap_or_default());
        }
        Ok(CycleOutcome::Applied(report))
    }

    /// Runs cycles forever, sleeping `interval` after each. Returns only if
    /// the hardware stops accepting writes.
    pub fn run(&mut self) -> Result<(), HardwareError> {
        loop {
            self.run_cycle_with(Instant::now)?;
            thread::sleep(self.config.interval);
        }
    }
}
