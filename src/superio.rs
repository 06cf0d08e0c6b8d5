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

//! Register-level access to the ITE IT8613E Super I/O and its environment
//! controller (EC).
//!
//! The chip is reached through the classic index/data port pair at
//! `0x2e`/`0x2f`. After the vendor unlock sequence the chip identifies itself
//! through two config registers; only then is the EC logical device selected,
//! activated and its base address ("bar") read. Fan PWM duty and fan-control
//! mode registers live behind the EC's own address/data pair at `bar + 5` and
//! `bar + 6`.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tracing::{debug, info};

pub const SUPERIO_INDEX_PORT: u16 = 0x2e;
pub const SUPERIO_DATA_PORT: u16 = 0x2f;

/// Written to the index port, in order, to enter config mode.
pub const UNLOCK_SEQUENCE: [u8; 4] = [0x87, 0x01, 0x55, 0x55];

pub const IT8613E_CHIP_ID: u16 = 0x8613;

const REG_CHIP_ID_HIGH: u8 = 0x20;
const REG_CHIP_ID_LOW: u8 = 0x21;
const REG_LOGICAL_DEVICE: u8 = 0x07;
const REG_ACTIVATE: u8 = 0x30;
const REG_BAR_HIGH: u8 = 0x60;
const REG_BAR_LOW: u8 = 0x61;

const LDN_ENVIRONMENT: u8 = 0x04;

const EC_ADDR_OFFSET: u16 = 5;
const EC_DATA_OFFSET: u16 = 6;

/// Fan control mode registers; `0x00` hands the duty cycle to software.
const EC_REG_FAN_CTL: [u8; 2] = [0x16, 0x17];

const DEV_PORT: &str = "/dev/port";

static PORTS_CLAIMED: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Error)]
pub enum HardwareError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Permission denied - need root")]
    PermissionDenied,
    #[error("Super I/O ports are already claimed by this process")]
    AlreadyClaimed,
    #[error("unexpected Super I/O chip id {found:#06x} (expected {expected:#06x})")]
    IdentityMismatch { expected: u16, found: u16 },
}

/// The two fan headers driven by this tool. Values are EC register offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PwmChannel {
    Fan2 = 0x6b,
    Fan3 = 0x73,
}

impl PwmChannel {
    pub const ALL: [PwmChannel; 2] = [PwmChannel::Fan2, PwmChannel::Fan3];

    pub fn register(self) -> u8 {
        self as u8
    }
}

/// Byte-wide I/O port access.
pub trait PortIo {
    fn outb(&mut self, port: u16, value: u8) -> io::Result<()>;
    fn inb(&mut self, port: u16) -> io::Result<u8>;
}

/// Port I/O through `/dev/port`, where the file offset is the port number.
#[derive(Debug)]
pub struct DevPort {
    file: File,
}

impl DevPort {
    /// Opens `/dev/port`. Only one instance may exist per process.
    pub fn open() -> Result<Self, HardwareError> {
        if PORTS_CLAIMED.swap(true, Ordering::SeqCst) {
            return Err(HardwareError::AlreadyClaimed);
        }
        match OpenOptions::new().read(true).write(true).open(DEV_PORT) {
            Ok(file) => Ok(Self { file }),
            Err(e) => {
                PORTS_CLAIMED.store(false, Ordering::SeqCst);
                if e.kind() == io::ErrorKind::PermissionDenied {
                    Err(HardwareError::PermissionDenied)
                } else {
                    Err(HardwareError::Io(e))
                }
            }
        }
    }
}

impl Drop for DevPort {
    fn drop(&mut self) {
        PORTS_CLAIMED.store(false, Ordering::SeqCst);
    }
}

impl PortIo for DevPort {
    fn outb(&mut self, port: u16, value: u8) -> io::Result<()> {
        self.file.write_all_at(&[value], u64::from(port))
    }

    fn inb(&mut self, port: u16) -> io::Result<u8> {
        let mut buf = [0u8; 1];
        self.file.read_exact_at(&mut buf, u64::from(port))?;
        Ok(buf[0])
    }
}

/// What the control loop needs from the fan hardware.
#[cfg_attr(test, mockall::automock)]
pub trait FanController {
    fn write_pwm(&mut self, channel: PwmChannel, value: u8) -> Result<(), HardwareError>;
    fn read_register(&mut self, reg: u8) -> Result<u8, HardwareError>;
    fn set_manual_mode(&mut self) -> Result<(), HardwareError>;
}

/// Writes the same duty cycle to every channel, back to back.
pub fn drive_all_channels<H: FanController + ?Sized>(hw: &mut H, value: u8) -> Result<(), HardwareError> {
    for channel in PwmChannel::ALL {
        hw.write_pwm(channel, value)?;
    }
    Ok(())
}

/// Super I/O config space, before the EC has been located.
pub struct SuperIo<P: PortIo> {
    io: P,
}

impl<P: PortIo> SuperIo<P> {
    pub fn new(io: P) -> Self {
        Self { io }
    }

    fn read(&mut self, reg: u8) -> io::Result<u8> {
        self.io.outb(SUPERIO_INDEX_PORT, reg)?;
        self.io.inb(SUPERIO_DATA_PORT)
    }

    fn write(&mut self, reg: u8, value: u8) -> io::Result<()> {
        self.io.outb(SUPERIO_INDEX_PORT, reg)?;
        self.io.outb(SUPERIO_DATA_PORT, value)
    }

    /// Runs the unlock/identify/activate handshake and returns a handle to
    /// the EC. A chip id mismatch is fatal: nothing past the id read is
    /// written to the chip.
    pub fn initialize(mut self) -> Result<EcHandle<P>, HardwareError> {
        for byte in UNLOCK_SEQUENCE {
            self.io.outb(SUPERIO_INDEX_PORT, byte)?;
        }

        let found = u16::from(self.read(REG_CHIP_ID_HIGH)?) << 8 | u16::from(self.read(REG_CHIP_ID_LOW)?);
        if found != IT8613E_CHIP_ID {
            return Err(HardwareError::IdentityMismatch {
                expected: IT8613E_CHIP_ID,
                found,
            });
        }
        debug!(chip_id = %format!("{:#06x}", found), "Super I/O identified");

        self.write(REG_LOGICAL_DEVICE, LDN_ENVIRONMENT)?;
        self.write(REG_ACTIVATE, 0x01)?;

        let bar = u16::from(self.read(REG_BAR_HIGH)?) << 8 | u16::from(self.read(REG_BAR_LOW)?);
        info!(bar = %format!("{:#06x}", bar), "environment controller active");

        Ok(EcHandle { io: self.io, bar })
    }
}

/// A located, activated environment controller.
pub struct EcHandle<P: PortIo> {
    io: P,
    bar: u16,
}

impl<P: PortIo> EcHandle<P> {
    pub fn bar(&self) -> u16 {
        self.bar
    }

    pub fn write_register(&mut self, reg: u8, value: u8) -> Result<(), HardwareError> {
        self.io.outb(self.bar.wrapping_add(EC_ADDR_OFFSET), reg)?;
        self.io.outb(self.bar.wrapping_add(EC_DATA_OFFSET), value)?;
        Ok(())
    }
}

impl<P: PortIo> FanController for EcHandle<P> {
    fn write_pwm(&mut self, channel: PwmChannel, value: u8) -> Result<(), HardwareError> {
        self.write_register(channel.register(), value)
    }

    fn read_register(&mut self, reg: u8) -> Result<u8, HardwareError> {
        self.io.outb(self.bar.wrapping_add(EC_ADDR_OFFSET), reg)?;
        Ok(self.io.inb(self.bar.wrapping_add(EC_DATA_OFFSET))?)
    }

    fn set_manual_mode(&mut self) -> Result<(), HardwareError> {
        for reg in EC_REG_FAN_CTL {
            self.write_register(reg, 0x00)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const TEST_BAR: u16 = 0x0a30;

    /// Emulates the config space and EC register file of a Super I/O chip.
    struct FakeChip {
        chip_id: u16,
        unlock_progress: usize,
        index: u8,
        config: HashMap<u8, u8>,
        ec_index: u8,
        ec: HashMap<u8, u8>,
        writes: Vec<(u16, u8)>,
    }

    impl FakeChip {
        fn new(chip_id: u16) -> Self {
            let mut config = HashMap::new();
            config.insert(REG_CHIP_ID_HIGH, (chip_id >> 8) as u8);
            config.insert(REG_CHIP_ID_LOW, chip_id as u8);
            config.insert(REG_BAR_HIGH, (TEST_BAR >> 8) as u8);
            config.insert(REG_BAR_LOW, TEST_BAR as u8);
            Self {
                chip_id,
                unlock_progress: 0,
                index: 0,
                config,
                ec_index: 0,
                ec: HashMap::new(),
                writes: Vec::new(),
            }
        }

        fn unlocked(&self) -> bool {
            self.unlock_progress == UNLOCK_SEQUENCE.len()
        }
    }

    impl PortIo for &mut FakeChip {
        fn outb(&mut self, port: u16, value: u8) -> io::Result<()> {
            self.writes.push((port, value));
            match port {
                SUPERIO_INDEX_PORT if !self.unlocked() => {
                    if UNLOCK_SEQUENCE[self.unlock_progress] == value {
                        self.unlock_progress += 1;
                    } else {
                        self.unlock_progress = 0;
                    }
                }
                SUPERIO_INDEX_PORT => self.index = value,
                SUPERIO_DATA_PORT => {
                    self.config.insert(self.index, value);
                }
                p if p == TEST_BAR + EC_ADDR_OFFSET => self.ec_index = value,
                p if p == TEST_BAR + EC_DATA_OFFSET => {
                    self.ec.insert(self.ec_index, value);
                }
                _ => {}
            }
            Ok(())
        }

        fn inb(&mut self, port: u16) -> io::Result<u8> {
            match port {
                SUPERIO_DATA_PORT if self.unlocked() => {
                    Ok(self.config.get(&self.index).copied().unwrap_or(0xff))
                }
                p if p == TEST_BAR + EC_DATA_OFFSET => Ok(self.ec.get(&self.ec_index).copied().unwrap_or(0)),
                _ => Ok(0xff),
            }
        }
    }

    #[test]
    fn test_initialize_unlocks_and_reads_bar() {
        let mut chip = FakeChip::new(IT8613E_CHIP_ID);
        let handle = SuperIo::new(&mut chip).initialize().unwrap();
        assert_eq!(handle.bar(), TEST_BAR);
        drop(handle);

        let unlock: Vec<u8> = chip.writes[..4].iter().map(|(_, v)| *v).collect();
        assert_eq!(unlock, UNLOCK_SEQUENCE.to_vec());
        assert!(chip.writes[..4].iter().all(|(p, _)| *p == SUPERIO_INDEX_PORT));
        assert_eq!(chip.config.get(&REG_LOGICAL_DEVICE), Some(&LDN_ENVIRONMENT));
        assert_eq!(chip.config.get(&REG_ACTIVATE), Some(&0x01));
    }

    #[test]
    fn test_initialize_rejects_wrong_chip() {
        let mut chip = FakeChip::new(0x8728);
        let err = SuperIo::new(&mut chip).initialize().err().unwrap();
        match err {
            HardwareError::IdentityMismatch { expected, found } => {
                assert_eq!(expected, IT8613E_CHIP_ID);
                assert_eq!(found, 0x8728);
            }
            other => panic!("unexpected error: {other}"),
        }
        // Nothing is selected or activated on the wrong chip.
        assert!(!chip.config.contains_key(&REG_LOGICAL_DEVICE));
        assert!(!chip.config.contains_key(&REG_ACTIVATE));
        assert_eq!(chip.chip_id, 0x8728);
    }

    #[test]
    fn test_pwm_writes_go_through_ec_ports() {
        let mut chip = FakeChip::new(IT8613E_CHIP_ID);
        let mut handle = SuperIo::new(&mut chip).initialize().unwrap();
        drive_all_channels(&mut handle, 136).unwrap();
        drop(handle);

        assert_eq!(chip.ec.get(&0x6b), Some(&136));
        assert_eq!(chip.ec.get(&0x73), Some(&136));
        let tail = &chip.writes[chip.writes.len() - 4..];
        assert_eq!(
            tail,
            &[
                (TEST_BAR + 5, 0x6b),
                (TEST_BAR + 6, 136),
                (TEST_BAR + 5, 0x73),
                (TEST_BAR + 6, 136),
            ]
        );
    }

    #[test]
    fn test_set_manual_mode_clears_both_control_registers() {
        let mut chip = FakeChip::new(IT8613E_CHIP_ID);
        let mut handle = SuperIo::new(&mut chip).initialize().unwrap();
        handle.write_register(0x16, 0x80).unwrap();
        handle.write_register(0x17, 0x80).unwrap();
        handle.set_manual_mode().unwrap();
        assert_eq!(handle.read_register(0x16).unwrap(), 0x00);
        assert_eq!(handle.read_register(0x17).unwrap(), 0x00);
    }

    #[test]
    fn test_pwm_channel_registers() {
        assert_eq!(PwmChannel::Fan2.register(), 0x6b);
        assert_eq!(PwmChannel::Fan3.register(), 0x73);
        assert_eq!(PwmChannel::ALL.len(), 2);
    }

    #[test]
    fn test_drive_all_channels_stops_on_first_error() {
        let mut mock = MockFanController::new();
        mock.expect_write_pwm()
            .withf(|c, v| *c == PwmChannel::Fan2 && *v == 90)
            .times(1)
            .returning(|_, _| Err(HardwareError::PermissionDenied));
        assert!(drive_all_channels(&mut mock, 90).is_err());
    }

    #[test]
    fn test_hardware_error_display() {
        let err = HardwareError::IdentityMismatch { expected: 0x8613, found: 0xffff };
        assert_eq!(err.to_string(), "unexpected Super I/O chip id 0xffff (expected 0x8613)");
        assert_eq!(HardwareError::PermissionDenied.to_string(), "Permission denied - need root");
    }
}
