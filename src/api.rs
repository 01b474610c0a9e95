use std::fmt;

/// Maximum number of boards that can stack on one host.
pub const MAX_HATS: u8 = 8;
/// Analog input channels per board.
pub const NUM_CHANNELS: usize = 2;

/// ADC codes are 24-bit two's complement.
pub const MIN_CODE: i32 = -8_388_608;
pub const MAX_CODE: i32 = 8_388_607;
/// Input span is +/-5 V across the 24-bit range.
pub const LSB_SIZE: f64 = 10.0 / 16_777_216.0;
pub const MIN_VOLTAGE: f64 = -5.0;
pub const MAX_VOLTAGE: f64 = 5.0 - LSB_SIZE;

/// Timebase the on-board divisor divides down from.
pub const BASE_CLOCK_HZ: f64 = 51_200.0;

/// Product id baked into the EEPROM and echoed by the ID command.
pub const PRODUCT_ID: u16 = 0x0172;

/// Hard ceiling on the host-side sample ring, in samples across all channels.
pub const MAX_SCAN_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Largest single spidev transfer we will issue; the stock kernel bufsiz.
pub(crate) const MAX_SPI_TRANSFER: usize = 4096;
/// Samples per AINSCANDATA burst, bounded by one spidev transfer
/// (reply header + ready byte + 3 bytes/sample).
pub const MAX_SAMPLES_READ: usize = (MAX_SPI_TRANSFER - 6) / 3;

/// Static description of the analog input subsystem.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceInfo {
    pub num_channels: usize,
    pub min_code: i32,
    pub max_code: i32,
    pub min_voltage: f64,
    pub max_voltage: f64,
    pub lsb_size: f64,
}

pub(crate) const DEVICE_INFO: DeviceInfo = DeviceInfo {
    num_channels: NUM_CHANNELS,
    min_code: MIN_CODE,
    max_code: MAX_CODE,
    min_voltage: MIN_VOLTAGE,
    max_voltage: MAX_VOLTAGE,
    lsb_size: LSB_SIZE,
};

/// Command bytes understood by the board firmware. Replies echo the command
/// byte; a mismatch means the bus got out of step with the device.
#[derive(Debug, Copy, Clone, PartialEq, Eq, num_derive::FromPrimitive, num_derive::ToPrimitive)]
pub(crate) enum Command {
    ScanStart = 0x11,
    ScanStatus = 0x12,
    ScanData = 0x13,
    ScanStop = 0x14,
    ClockConfigWrite = 0x15,
    ClockConfigRead = 0x16,
    TriggerConfigWrite = 0x17,
    TriggerConfigRead = 0x18,

    BlinkLed = 0x40,
    Id = 0x41,
    Reset = 0x42,
    IepeConfigWrite = 0x43,
    IepeConfigRead = 0x44,
    TestSignalsWrite = 0x45,
    TestSignalsRead = 0x46,

    /// Ask the firmware to resend its last reply.
    RereadReply = 0x7F,
}

/// Status byte carried in the AINSCANSTATUS reply payload.
pub(crate) const DEV_STATUS_RUNNING: u8 = 0x01;
pub(crate) const DEV_STATUS_HW_OVERRUN: u8 = 0x02;
pub(crate) const DEV_STATUS_TRIGGERED: u8 = 0x04;

/// Bit folded into the channel mask sent with AINSCANSTART when the scan
/// should hold for the external trigger.
pub(crate) const DEV_TRIGGER_ENABLE: u8 = 0x80;

bitflags::bitflags! {
    /// Options accepted by `scan_start`.
    pub struct ScanOptions: u32 {
        /// Run until stopped, ignoring the finite sample count.
        const CONTINUOUS      = 0x0001;
        /// Hold off acquisition until the external trigger condition.
        const EXTTRIGGER      = 0x0002;
        /// Deliver raw codes as floats; skip the LSB voltage multiply.
        const NOSCALEDATA     = 0x0004;
        /// Skip the factory slope/offset correction.
        const NOCALIBRATEDATA = 0x0008;
    }
}

bitflags::bitflags! {
    /// Scan state reported by `scan_status` and `scan_read`.
    pub struct ScanStatus: u32 {
        const HW_OVERRUN     = 0x0001;
        const BUFFER_OVERRUN = 0x0002;
        const TRIGGERED      = 0x0004;
        const RUNNING        = 0x0008;
    }
}

/// Clock and trigger routing between stacked boards.
#[derive(Debug, Copy, Clone, PartialEq, Eq, num_derive::FromPrimitive, num_derive::ToPrimitive)]
pub enum SourceType {
    /// Use the on-board source, not shared with other boards.
    Local = 0,
    /// Use the on-board source and drive it onto the shared stack pin.
    Master = 1,
    /// Use whatever a master board drives onto the shared stack pin.
    Slave = 2,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, num_derive::FromPrimitive, num_derive::ToPrimitive)]
pub enum TriggerMode {
    RisingEdge = 0,
    FallingEdge = 1,
    ActiveHigh = 2,
    ActiveLow = 3,
}

/// Result of one `scan_read` call. A deadline that expires before the sample
/// target is met is reported here, next to whatever was already copied out,
/// rather than as an error that would discard the partial read.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanRead {
    pub status: ScanStatus,
    pub samples_read_per_channel: usize,
    pub timed_out: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    /// Out-of-range address/channel/mask, short buffer, or a reply whose
    /// command byte does not echo the request.
    BadParameter,
    /// Device firmware busy, or a host-side config mutation attempted while
    /// a scan session exists.
    Busy,
    /// Reply, trigger-poll, or read deadline expired.
    Timeout,
    /// The cross-process SPI bus lock was not acquired within 5 s.
    LockTimeout,
    /// Allocation, thread creation, or SPI open failed; or no scan session
    /// exists for the query.
    ResourceUnavail,
    /// EEPROM or ID-command product id did not match this driver.
    InvalidDevice,
    /// ioctl failure, or a firmware status byte outside the known set.
    Undefined,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::BadParameter => write!(f, "bad parameter"),
            Error::Busy => write!(f, "device busy"),
            Error::Timeout => write!(f, "timed out"),
            Error::LockTimeout => write!(f, "SPI bus lock timed out"),
            Error::ResourceUnavail => write!(f, "resource unavailable"),
            Error::InvalidDevice => write!(f, "invalid device"),
            Error::Undefined => write!(f, "undefined failure"),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_info_constants() {
        assert_eq!(DEVICE_INFO.num_channels, 2);
        assert_eq!(DEVICE_INFO.max_code - DEVICE_INFO.min_code + 1, 1 << 24);
        assert!((DEVICE_INFO.lsb_size - 10.0 / (1 << 24) as f64).abs() < 1e-18);
        assert_eq!(DEVICE_INFO.max_voltage, 5.0 - LSB_SIZE);
        // one full-scale step of the 24-bit converter spans the 10 V range
        assert!((DEVICE_INFO.lsb_size * (1 << 24) as f64 - 10.0).abs() < 1e-9);
    }

    #[test]
    fn data_read_burst_fits_one_spi_transfer() {
        assert!(MAX_SAMPLES_READ * 3 + 6 <= MAX_SPI_TRANSFER);
        assert!((MAX_SAMPLES_READ + 1) * 3 + 6 > MAX_SPI_TRANSFER);
    }
}
