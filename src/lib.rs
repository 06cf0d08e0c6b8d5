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

//! Drivefan - PID fan control for hard-drive enclosures.
//!
//! Reads drive temperatures through `smartctl`, runs a PID law on the hottest
//! drive and writes the resulting duty cycle to the fan PWM registers of an
//! ITE IT8613E environment controller.

pub mod config;
pub mod control;
pub mod logger;
pub mod pid;
pub mod probe;
pub mod superio;
