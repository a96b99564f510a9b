//! # HARDWARE BACKING
//!
//! Concrete [`SpiBus`] and [`LinkLines`] implementations for a Linux SBC:
//! `spidev` for the full-duplex transfer itself, `sysfs_gpio` for the two
//! handshake lines and the transfer-direction line. `mc-transfer` never
//! depends on either crate directly — it only sees the traits — so these
//! stay local to the daemon binary, the same way a real SPI controller
//! would be the one place in the workspace that's allowed to know about
//! device files and GPIO numbers.

use std::io;
use std::time::{Duration, Instant};

use mc_transfer::bus::SpiBus;
use mc_transfer::lines::LinkLines;
use spidev::{SpiModeFlags, Spidev, SpidevOptions, SpidevTransfer};
use sysfs_gpio::{Direction, Pin};

pub struct LinuxSpiBus {
  device: Spidev,
}

impl LinuxSpiBus {
  pub fn open(path: &str, max_speed_hz: u32) -> io::Result<Self> {
    let mut device = Spidev::open(path)?;
    let options = SpidevOptions::new().bits_per_word(8).max_speed_hz(max_speed_hz).mode(SpiModeFlags::SPI_MODE_0).build();
    device.configure(&options)?;
    Ok(Self { device })
  }
}

impl SpiBus for LinuxSpiBus {
  fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> io::Result<()> {
    let mut transfer = SpidevTransfer::read_write(tx, rx);
    self.device.transfer(&mut transfer)
  }
}

pub struct GpioLinkLines {
  sbc_ready: Pin,
  firmware_ready: Pin,
  direction: Pin,
  poll_interval: Duration,
}

impl GpioLinkLines {
  pub fn open(sbc_ready: u32, firmware_ready: u32, direction: u32) -> sysfs_gpio::Result<Self> {
    let sbc_ready = Pin::new(sbc_ready as u64);
    let firmware_ready = Pin::new(firmware_ready as u64);
    let direction = Pin::new(direction as u64);
    sbc_ready.export()?;
    firmware_ready.export()?;
    direction.export()?;
    sbc_ready.set_direction(Direction::Out)?;
    firmware_ready.set_direction(Direction::In)?;
    direction.set_direction(Direction::Out)?;
    Ok(Self {
      sbc_ready,
      firmware_ready,
      direction,
      poll_interval: Duration::from_millis(2),
    })
  }
}

impl LinkLines for GpioLinkLines {
  fn assert_sbc_ready(&mut self) {
    let _ = self.sbc_ready.set_value(1);
  }

  fn deassert_sbc_ready(&mut self) {
    let _ = self.sbc_ready.set_value(0);
  }

  fn wait_firmware_ready(&mut self, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
      if self.firmware_ready.get_value().unwrap_or(0) == 1 {
        return true;
      }
      if Instant::now() >= deadline {
        return false;
      }
      std::thread::sleep(self.poll_interval);
    }
  }

  fn toggle_transfer_direction(&mut self) {
    let current = self.direction.get_value().unwrap_or(0);
    let _ = self.direction.set_value(if current == 0 { 1 } else { 0 });
  }

  fn hold_sbc_ready_low(&mut self, duration: Duration) {
    self.deassert_sbc_ready();
    std::thread::sleep(duration);
  }
}
