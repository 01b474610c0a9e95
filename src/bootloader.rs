//! Firmware-update transport.
//!
//! The bootloader speaks raw SPI with none of the normal framing, and entry
//! is a RESET/IRQ handshake rather than a command. Everything here still
//! brackets the shared bus with the cross-process lock.

use std::thread;
use std::time::{Duration, Instant};

use crate::api::Error;
use crate::hw::HatIo;

const RESET_PULSE: Duration = Duration::from_millis(1);
const RESET_SETTLE: Duration = Duration::from_millis(10);
const RESET_ATTEMPTS: u32 = 10;
const IRQ_POLL: Duration = Duration::from_millis(1);
const IRQ_DEADLINE: Duration = Duration::from_millis(100);

/// Pulse the board into its bootloader. The board acknowledges by dropping
/// its IRQ line.
pub(crate) fn enter(io: &mut dyn HatIo) -> Result<(), Error> {
    io.obtain_lock()?;
    let result = reset_handshake(io);
    io.release_lock();
    result
}

fn reset_handshake(io: &mut dyn HatIo) -> Result<(), Error> {
    let mut attempts = 0;
    while io.irq_read()? && attempts < RESET_ATTEMPTS {
        io.reset_write(true)?;
        thread::sleep(RESET_PULSE);
        io.reset_write(false)?;
        thread::sleep(RESET_SETTLE);
        attempts += 1;
    }
    if io.irq_read()? {
        let start = Instant::now();
        while io.irq_read()? {
            if start.elapsed() >= IRQ_DEADLINE {
                log::error!("bootloader entry: IRQ never dropped");
                return Err(Error::Timeout);
            }
            thread::sleep(IRQ_POLL);
        }
    }
    Ok(())
}

/// Whether the bootloader is ready for the next block (IRQ low).
pub(crate) fn ready(io: &mut dyn HatIo) -> Result<bool, Error> {
    Ok(!io.irq_read()?)
}

/// One opaque full-duplex block exchange with the bootloader.
pub(crate) fn transfer(io: &mut dyn HatIo, tx: &[u8], rx: &mut [u8]) -> Result<(), Error> {
    if tx.len() != rx.len() {
        return Err(Error::BadParameter);
    }
    io.obtain_lock()?;
    let result = (|| {
        io.set_address()?;
        io.configure_bus()?;
        io.transfer(tx, rx)
    })();
    io.release_lock();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockIo;

    #[test]
    fn reset_pulses_until_irq_drops() {
        let mut io = MockIo::new();
        {
            let mut state = io.state();
            state.irq_level = true;
            state.irq_low_after_pulses = Some(3);
        }
        enter(&mut io).unwrap();
        assert_eq!(io.state().reset_pulses, 3);
        assert!(ready(&mut io).unwrap());
        assert!(!io.state().locked, "lock leaked");
    }

    #[test]
    fn stuck_irq_times_out() {
        let mut io = MockIo::new();
        {
            let mut state = io.state();
            state.irq_level = true;
            state.irq_low_after_pulses = None;
        }
        assert_eq!(enter(&mut io).unwrap_err(), Error::Timeout);
        assert!(!io.state().locked, "lock leaked on failure");
    }

    #[test]
    fn raw_blit_skips_framing() {
        let mut io = MockIo::new();
        io.state().irq_level = false;
        let tx = [0xDE, 0xAD, 0xBE, 0xEF];
        let mut rx = [0u8; 4];
        transfer(&mut io, &tx, &mut rx).unwrap();
        assert_eq!(io.state().last_raw_tx, tx.to_vec());
        let mut short = [0u8; 2];
        assert_eq!(transfer(&mut io, &tx, &mut short).unwrap_err(), Error::BadParameter);
    }
}
