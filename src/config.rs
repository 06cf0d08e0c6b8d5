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

//! Runtime configuration.
//!
//! Built once at startup from built-in defaults, an optional JSON file and the
//! command line (in increasing precedence), then handed to the control loop by
//! reference. Nothing here is mutated after `parse_args` returns.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pid::PidGains;

/// Hardware ceiling of the PWM duty cycle. Not configurable.
pub const PWM_MAX: u8 = 255;

pub const DEFAULT_SETPOINT: i32 = 37;
pub const DEFAULT_PWM_INIT: u8 = 128;
pub const DEFAULT_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_OVERHEAT: i32 = 50;
pub const DEFAULT_PWM_MIN: u8 = 80;
pub const DEFAULT_KP: f64 = 1.0;
pub const DEFAULT_KI: f64 = 0.0;
pub const DEFAULT_IMAX: f64 = 10.0;
pub const DEFAULT_KD: f64 = 0.0;

const MAX_DRIVE_NAME_LEN: usize = 64;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("drive_list is required")]
    MissingDriveList,
    #[error("Unknown parameter: {0}")]
    UnknownArgument(String),
    #[error("invalid value for {name}: {value:?}")]
    InvalidValue { name: String, value: String },
    #[error("drive_list contains an empty drive name")]
    EmptyDrive,
    #[error("unsafe drive name: {0:?}")]
    UnsafeDriveName(String),
    #[error("{name} out of range: {reason}")]
    OutOfRange { name: String, reason: String },
    #[error("config file {}: {reason}", path.display())]
    ConfigFile { path: PathBuf, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub drives: Vec<String>,
    pub debug: bool,
    /// Target maximum drive temperature, °C.
    pub setpoint: i32,
    pub pwm_init: u8,
    pub interval: Duration,
    /// Above this temperature (°C) the fans run at `PWM_MAX`.
    pub overheat: i32,
    pub pwm_min: u8,
    pub kp: f64,
    pub ki: f64,
    pub imax: f64,
    pub kd: f64,
    pub smartctl: PathBuf,
    pub journal: Option<PathBuf>,
}

impl Config {
    /// Defaults for everything except the drive list.
    pub fn with_drives(drives: Vec<String>) -> Self {
        Self {
            drives,
            debug: false,
            setpoint: DEFAULT_SETPOINT,
            pwm_init: DEFAULT_PWM_INIT,
            interval: Duration::from_secs(DEFAULT_INTERVAL_SECS),
            overheat: DEFAULT_OVERHEAT,
            pwm_min: DEFAULT_PWM_MIN,
            kp: DEFAULT_KP,
            ki: DEFAULT_KI,
            imax: DEFAULT_IMAX,
            kd: DEFAULT_KD,
            smartctl: PathBuf::from("smartctl"),
            journal: None,
        }
    }

    pub fn gains(&self) -> PidGains {
        PidGains {
            kp: self.kp,
            ki: self.ki,
            kd: self.kd,
            imax: self.imax,
        }
    }
}

/// Optional JSON configuration file. Keys match the command-line names.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub drive_list: Option<String>,
    #[serde(default)]
    pub debug: Option<bool>,
    #[serde(default)]
    pub setpoint: Option<i32>,
    #[serde(default)]
    pub pwminit: Option<u8>,
    #[serde(default)]
    pub interval: Option<u64>,
    #[serde(default)]
    pub overheat: Option<i32>,
    #[serde(default)]
    pub pwmmin: Option<u8>,
    #[serde(default)]
    pub kp: Option<f64>,
    #[serde(default)]
    pub ki: Option<f64>,
    #[serde(default)]
    pub imax: Option<f64>,
    #[serde(default)]
    pub kd: Option<f64>,
    #[serde(default)]
    pub smartctl: Option<PathBuf>,
    #[serde(default)]
    pub journal: Option<PathBuf>,
}

pub fn load_file_config(path: &Path) -> Result<FileConfig, ConfigError> {
    let data = fs::read_to_string(path).map_err(|e| ConfigError::ConfigFile {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    serde_json::from_str(&data).map_err(|e| ConfigError::ConfigFile {
        path: path.to_path_buf(),
        reason: format!("parse error: {}", e),
    })
}

/// What the command line asked for.
#[derive(Debug, Clone, PartialEq)]
pub enum Invocation {
    Run(Config),
    Help,
}

/// Parses `--name=value` arguments (program name excluded).
pub fn parse_args<I, S>(args: I) -> Result<Invocation, ConfigError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut pairs: Vec<(String, String)> = Vec::new();
    let mut config_path: Option<PathBuf> = None;

    for arg in args {
        let arg = arg.as_ref();
        if arg == "--help" || arg == "-h" {
            return Ok(Invocation::Help);
        }
        let (name, value) = arg
            .strip_prefix("--")
            .and_then(|rest| rest.split_once('='))
            .ok_or_else(|| ConfigError::UnknownArgument(arg.to_string()))?;
        if !is_known_option(name) {
            return Err(ConfigError::UnknownArgument(arg.to_string()));
        }
        if name == "config" {
            config_path = Some(PathBuf::from(value));
        } else {
            pairs.push((name.to_string(), value.to_string()));
        }
    }

    let file = match &config_path {
        Some(p) => load_file_config(p)?,
        None => FileConfig::default(),
    };

    let mut drive_list = file.drive_list.clone();
    for (name, value) in &pairs {
        if name == "drive_list" {
            drive_list = Some(value.clone());
        }
    }
    let drives = parse_drive_list(&drive_list.ok_or(ConfigError::MissingDriveList)?)?;

    let mut cfg = Config::with_drives(drives);
    apply_file_config(&mut cfg, &file);
    for (name, value) in &pairs {
        apply_option(&mut cfg, name, value)?;
    }

    validate(&cfg)?;
    Ok(Invocation::Run(cfg))
}

fn is_known_option(name: &str) -> bool {
    matches!(
        name,
        "drive_list"
            | "debug"
            | "setpoint"
            | "pwminit"
            | "interval"
            | "overheat"
            | "pwmmin"
            | "kp"
            | "ki"
            | "imax"
            | "kd"
            | "smartctl"
            | "journal"
            | "config"
    )
}

fn apply_file_config(cfg: &mut Config, file: &FileConfig) {
    if let Some(v) = file.debug { cfg.debug = v; }
    if let Some(v) = file.setpoint { cfg.setpoint = v; }
    if let Some(v) = file.pwminit { cfg.pwm_init = v; }
    if let Some(v) = file.interval { cfg.interval = Duration::from_secs(v); }
    if let Some(v) = file.overheat { cfg.overheat = v; }
    if let Some(v) = file.pwmmin { cfg.pwm_min = v; }
    if let Some(v) = file.kp { cfg.kp = v; }
    if let Some(v) = file.ki { cfg.ki = v; }
    if let Some(v) = file.imax { cfg.imax = v; }
    if let Some(v) = file.kd { cfg.kd = v; }
    if let Some(v) = &file.smartctl { cfg.smartctl = v.clone(); }
    if let Some(v) = &file.journal { cfg.journal = Some(v.clone()); }
}

fn apply_option(cfg: &mut Config, name: &str, value: &str) -> Result<(), ConfigError> {
    match name {
        "drive_list" => {}
        "debug" => {
            cfg.debug = match value {
                "1" | "true" => true,
                "0" | "false" => false,
                _ => return Err(invalid(name, value)),
            }
        }
        "setpoint" => cfg.setpoint = parse_value(name, value)?,
        "pwminit" => cfg.pwm_init = parse_value(name, value)?,
        "interval" => cfg.interval = Duration::from_secs(parse_value(name, value)?),
        "overheat" => cfg.overheat = parse_value(name, value)?,
        "pwmmin" => cfg.pwm_min = parse_value(name, value)?,
        "kp" => cfg.kp = parse_value(name, value)?,
        "ki" => cfg.ki = parse_value(name, value)?,
        "imax" => cfg.imax = parse_value(name, value)?,
        "kd" => cfg.kd = parse_value(name, value)?,
        "smartctl" => cfg.smartctl = PathBuf::from(value),
        "journal" => cfg.journal = Some(PathBuf::from(value)),
        _ => return Err(ConfigError::UnknownArgument(format!("--{}={}", name, value))),
    }
    Ok(())
}

fn parse_value<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| invalid(name, value))
}

fn invalid(name: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue { name: name.to_string(), value: value.to_string() }
}

/// Splits a comma-separated drive list, keeping order and duplicates.
pub fn parse_drive_list(list: &str) -> Result<Vec<String>, ConfigError> {
    let mut drives = Vec::new();
    for part in list.split(',') {
        let name = part.trim();
        if name.is_empty() {
            return Err(ConfigError::EmptyDrive);
        }
        drives.push(name.to_string());
    }
    Ok(drives)
}

/// Drive names are appended to `/dev/`; keep them inside it.
fn is_safe_drive_name(s: &str) -> bool {
    if s.is_empty() || s.len() > MAX_DRIVE_NAME_LEN { return false; }
    if s.starts_with('/') || s.split('/').any(|seg| seg == ".." || seg.is_empty()) { return false; }
    s.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/'))
}

pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.drives.is_empty() {
        return Err(ConfigError::MissingDriveList);
    }
    for d in &cfg.drives {
        if !is_safe_drive_name(d) {
            return Err(ConfigError::UnsafeDriveName(d.clone()));
        }
    }
    if cfg.interval < Duration::from_secs(1) {
        return Err(ConfigError::OutOfRange {
            name: "interval".into(),
            reason: "must be at least 1 second".into(),
        });
    }
    for (name, v) in [("kp", cfg.kp), ("ki", cfg.ki), ("kd", cfg.kd), ("imax", cfg.imax)] {
        if !v.is_finite() {
            return Err(ConfigError::OutOfRange { name: name.into(), reason: "must be finite".into() });
        }
    }
    if cfg.imax < 0.0 {
        return Err(ConfigError::OutOfRange { name: "imax".into(), reason: "must not be negative".into() });
    }
    Ok(())
}

pub fn usage() -> &'static str {
    "Usage:

 drivefan --drive_list=<drive_list> [--debug=<0|1>] [--setpoint=<C>] [--pwminit=<pwm>]
          [--interval=<s>] [--overheat=<C>] [--pwmmin=<pwm>] [--kp=<f>] [--ki=<f>]
          [--imax=<f>] [--kd=<f>] [--config=<path>] [--journal=<path>] [--smartctl=<path>]

Arguments may appear in any order. Unspecified arguments take the value from
--config if given, otherwise their default.

drive_list Comma-separated drive names under /dev, e.g. 'sda,sdc' (required)
debug      Enable (1) or disable (0) debug logs (default: 0)
setpoint   Target maximum drive temperature in degrees Celsius (default: 37)
pwminit    Initial PWM value to write (default: 128)
interval   Polling interval in seconds (default: 10)
overheat   Temperature in degrees Celsius above which fans run at full
           speed (default: 50)
pwmmin     Never drive the fans below this PWM value (default: 80)
kp         Proportional coefficient (default: 1.0)
ki         Integral coefficient (default: 0.0)
imax       Maximum integral value (default: 10.0)
kd         Derivative coefficient (default: 0.0)
config     JSON file with any of the keys above
journal    Append a JSON line per control cycle to this file
smartctl   smartctl binary used to read drive temperatures (default: smartctl)
"
}
