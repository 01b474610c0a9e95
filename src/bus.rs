//! One framed command/response transaction over the shared SPI bus.
//!
//! Every transaction brackets itself with the cross-process bus lock and
//! re-asserts the board address and bus parameters, because other board
//! drivers (and other processes) use the same spidev device in between.

use std::thread;
use std::time::{Duration, Instant};

use num_traits::ToPrimitive;

use crate::api::{Command, Error, MAX_SPI_TRANSFER};
use crate::hw::HatIo;
use crate::protocol::{self, FrameScanner, REPLY_HEADER_LEN};

/// Default reply deadline for configuration-sized commands.
pub(crate) const REPLY_TIMEOUT: Duration = Duration::from_millis(250);
/// Default pause between ready polls.
pub(crate) const RETRY_INTERVAL_US: u64 = 100;
/// Back-off after a failed body-read ioctl.
const IOCTL_RETRY_US: u64 = 300;

/// Send `command` with `tx_payload`, wait for the device's framed reply, and
/// copy its payload into `rx_payload`. Returns the number of payload bytes
/// the device actually sent (callers size `rx_payload` for what they expect).
pub(crate) fn transfer(
    io: &mut dyn HatIo,
    command: Command,
    tx_payload: &[u8],
    rx_payload: &mut [u8],
    reply_timeout: Duration,
    retry_interval_us: u64,
) -> Result<usize, Error> {
    if rx_payload.len() > MAX_SPI_TRANSFER - REPLY_HEADER_LEN - 1 {
        return Err(Error::BadParameter);
    }
    let frame = protocol::encode(command, tx_payload)?;

    io.obtain_lock()?;
    let result = locked_transfer(io, command, &frame, rx_payload, reply_timeout, retry_interval_us);
    io.release_lock();
    result
}

fn locked_transfer(
    io: &mut dyn HatIo,
    command: Command,
    frame: &[u8],
    rx_payload: &mut [u8],
    reply_timeout: Duration,
    retry_interval_us: u64,
) -> Result<usize, Error> {
    io.set_address()?;
    io.configure_bus()?;

    // clock the command out; the device's MISO traffic during this phase is
    // meaningless
    let mut scratch = vec![0u8; frame.len()];
    io.transfer(frame, &mut scratch)?;

    // ready poll: the device answers 0x00 until its reply is staged
    let start = Instant::now();
    let ready = loop {
        let mut poll = [0u8];
        io.transfer(&[0u8], &mut poll)?;
        if poll[0] != 0 {
            break poll[0];
        }
        if start.elapsed() > reply_timeout {
            return Err(Error::Timeout);
        }
        thread::sleep(Duration::from_micros(retry_interval_us));
    };

    // body read: splice the reply after the ready byte (which is normally the
    // frame start itself) and let the scanner find the frame
    let mut stream = Vec::with_capacity(1 + REPLY_HEADER_LEN + rx_payload.len());
    stream.push(ready);
    let mut scanner = FrameScanner::new();
    let mut location = scanner.scan(&stream);
    let mut next_read = REPLY_HEADER_LEN + rx_payload.len();
    while location.is_none() {
        if start.elapsed() > reply_timeout {
            return Err(Error::Timeout);
        }
        let tx = vec![0u8; next_read];
        let mut rx = vec![0u8; next_read];
        match io.transfer(&tx, &mut rx) {
            Ok(()) => {
                location = scanner.scan(&rx);
                stream.extend_from_slice(&rx);
                next_read = scanner.remaining().max(1).min(MAX_SPI_TRANSFER);
            }
            Err(_) => thread::sleep(Duration::from_micros(IOCTL_RETRY_US)),
        }
    }

    let location = location.unwrap();
    let reply = &stream[location.start..location.start + location.len];
    if reply[1] != command.to_u8().unwrap() {
        log::debug!("command 0x{:02x} echoed as 0x{:02x}", command.to_u8().unwrap(), reply[1]);
        return Err(Error::BadParameter);
    }
    let payload = &reply[REPLY_HEADER_LEN..];
    match reply[2] {
        0x00 => {
            let n = payload.len().min(rx_payload.len());
            rx_payload[..n].copy_from_slice(&payload[..n]);
            Ok(payload.len())
        }
        0x02 => Err(Error::BadParameter),
        0x03 => Err(Error::Busy),
        0x05 => Err(Error::Timeout),
        status => {
            log::debug!("command 0x{:02x}: unknown firmware status 0x{:02x}", reply[1], status);
            Err(Error::Undefined)
        }
    }
}

/// `transfer` with the default deadline, for the configuration commands.
pub(crate) fn transact(
    io: &mut dyn HatIo,
    command: Command,
    tx_payload: &[u8],
    rx_payload: &mut [u8],
) -> Result<usize, Error> {
    transfer(io, command, tx_payload, rx_payload, REPLY_TIMEOUT, RETRY_INTERVAL_US)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockIo;

    #[test]
    fn id_reply_roundtrip() {
        let mut io = MockIo::new();
        io.state().version = 0x0305;
        let mut rx = [0u8; 4];
        let n = transact(&mut io, Command::Id, &[], &mut rx).unwrap();
        assert_eq!(n, 4);
        assert_eq!(u16::from_le_bytes([rx[0], rx[1]]), crate::api::PRODUCT_ID);
        assert_eq!(u16::from_le_bytes([rx[2], rx[3]]), 0x0305);
        assert!(!io.state().locked, "lock leaked");
    }

    #[test]
    fn ready_poll_times_out_on_dead_device() {
        let mut io = MockIo::new();
        io.state().ready_never = true;
        let start = Instant::now();
        let err = transfer(
            &mut io,
            Command::BlinkLed,
            &[1],
            &mut [],
            Duration::from_millis(5),
            20,
        )
        .unwrap_err();
        assert_eq!(err, Error::Timeout);
        assert!(start.elapsed() >= Duration::from_millis(5));
        assert!(!io.state().locked, "lock leaked on timeout");
    }

    #[test]
    fn ready_poll_rides_out_slow_device() {
        let mut io = MockIo::new();
        io.state().ready_delay_polls = 10;
        let mut rx = [0u8; 4];
        transact(&mut io, Command::Id, &[], &mut rx).unwrap();
    }

    #[test]
    fn command_mismatch_is_bad_parameter() {
        let mut io = MockIo::new();
        io.state().echo_command = Some(Command::Reset.to_u8().unwrap());
        let err = transact(&mut io, Command::BlinkLed, &[1], &mut []).unwrap_err();
        assert_eq!(err, Error::BadParameter);
    }

    #[test]
    fn firmware_status_demux() {
        for (status, expect) in [
            (0x02u8, Error::BadParameter),
            (0x03, Error::Busy),
            (0x05, Error::Timeout),
            (0x01, Error::Undefined),
            (0x06, Error::Undefined),
            (0x4F, Error::Undefined),
        ]
        .iter()
        {
            let mut io = MockIo::new();
            io.state().force_status = Some(*status);
            let err = transact(&mut io, Command::BlinkLed, &[1], &mut []).unwrap_err();
            assert_eq!(err, *expect, "status 0x{:02x}", status);
        }
    }

    #[test]
    fn lock_contention_surfaces() {
        let mut io = MockIo::new();
        io.state().lock_fails = true;
        let err = transact(&mut io, Command::BlinkLed, &[1], &mut []).unwrap_err();
        assert_eq!(err, Error::LockTimeout);
    }

    #[test]
    fn body_read_retries_after_ioctl_failure() {
        let mut io = MockIo::new();
        io.state().body_io_errors = 2;
        let mut rx = [0u8; 4];
        transact(&mut io, Command::Id, &[], &mut rx).unwrap();
        assert_eq!(u16::from_le_bytes([rx[0], rx[1]]), crate::api::PRODUCT_ID);
    }

    #[test]
    fn oversized_reply_buffer_rejected() {
        let mut io = MockIo::new();
        let mut rx = vec![0u8; MAX_SPI_TRANSFER];
        let err = transact(&mut io, Command::ScanData, &[], &mut rx).unwrap_err();
        assert_eq!(err, Error::BadParameter);
    }
}
