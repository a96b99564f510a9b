//! # SPI BUS
//!
//! One full-duplex transfer of equal-length buffers. Real hardware backs
//! this with a Linux `spidev` ioctl; this crate only depends on the trait so
//! that swapping transports never touches [`crate::engine`].

use std::io;

pub trait SpiBus: Send {
  /// Performs one full-duplex transfer: `tx.len()` bytes are written while
  /// `rx.len()` bytes are simultaneously read. Implementations backed by a
  /// real SPI controller require `tx.len() == rx.len()`.
  fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> io::Result<()>;
}

/// A loopback [`SpiBus`] double: whatever was last queued on the firmware
/// side is read back, letting tests script a scripted firmware response
/// without real hardware.
#[cfg(test)]
pub struct LoopbackBus {
  pub firmware_replies: std::collections::VecDeque<Vec<u8>>,
  pub captured_writes: Vec<Vec<u8>>,
}

#[cfg(test)]
impl LoopbackBus {
  pub fn new() -> Self {
    Self {
      firmware_replies: std::collections::VecDeque::new(),
      captured_writes: Vec::new(),
    }
  }

  pub fn queue_reply(&mut self, bytes: Vec<u8>) {
    self.firmware_replies.push_back(bytes);
  }
}

#[cfg(test)]
impl SpiBus for LoopbackBus {
  fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> io::Result<()> {
    self.captured_writes.push(tx.to_vec());
    if let Some(mut reply) = self.firmware_replies.pop_front() {
      reply.resize(rx.len(), 0);
      rx.copy_from_slice(&reply);
    } else {
      rx.fill(0);
    }
    Ok(())
  }
}
