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

//! Drive temperature readings through `smartctl`.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;
use tracing::debug;

/// SMART attribute carrying the drive temperature.
const TEMPERATURE_ATTRIBUTE: &str = "Temperature_Celsius";

/// RAW_VALUE is the 10th column of `smartctl -A` attribute rows.
const RAW_VALUE_COLUMN: usize = 9;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to run probe: {0}")]
    Spawn(#[source] io::Error),
    #[error("no Temperature_Celsius attribute in probe output")]
    NoOutput,
    #[error("Parse error: {0}")]
    Parse(String),
}

#[cfg_attr(test, mockall::automock)]
pub trait TemperatureProbe {
    /// Current temperature of `drive` (a name under `/dev`), in °C.
    fn read_celsius(&self, drive: &str) -> Result<i32, ProbeError>;
}

/// Runs `smartctl -A -d sat /dev/<drive>` once per reading.
#[derive(Debug, Clone)]
pub struct SmartctlProbe {
    program: PathBuf,
}

impl SmartctlProbe {
    pub fn new<P: AsRef<Path>>(program: P) -> Self {
        Self { program: program.as_ref().to_path_buf() }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl Default for SmartctlProbe {
    fn default() -> Self {
        Self::new("smartctl")
    }
}

impl TemperatureProbe for SmartctlProbe {
    fn read_celsius(&self, drive: &str) -> Result<i32, ProbeError> {
        // smartctl exit status is a bitmask that is non-zero for many healthy
        // drives, so only stdout is inspected.
        let output = Command::new(&self.program)
            .args(["-A", "-d", "sat"])
            .arg(format!("/dev/{}", drive))
            .output()
            .map_err(ProbeError::Spawn)?;
        parse_temperature(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Extracts the raw temperature value from `smartctl -A` output.
pub fn parse_temperature(output: &str) -> Result<i32, ProbeError> {
    let line = output
        .lines()
        .find(|l| l.contains(TEMPERATURE_ATTRIBUTE))
        .ok_or(ProbeError::NoOutput)?;
    let raw = line
        .split_whitespace()
        .nth(RAW_VALUE_COLUMN)
        .ok_or_else(|| ProbeError::Parse(format!("short attribute row: {}", line.trim())))?;
    raw.parse::<i32>()
        .map_err(|e| ProbeError::Parse(format!("{:?}: {}", raw, e)))
}

/// Reads `drive`, degrading any failure to 0 °C so a single bad reading
/// never stops the loop. Note that a failed reading therefore cannot raise
/// the cycle maximum.
pub fn read_or_zero<T: TemperatureProbe + ?Sized>(probe: &T, drive: &str) -> i32 {
    match probe.read_celsius(drive) {
        Ok(temp) => temp,
        Err(e) => {
            debug!(drive, error = %e, "temperature probe failed, using 0");
            0
        }
    }
}
