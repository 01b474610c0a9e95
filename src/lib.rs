//! Host-side driver for the MCC 172, a two-channel 24-bit 51.2 kS/s
//! IEPE-capable measurement HAT.
//!
//! The board hangs off the host's shared SPI bus behind a board-select
//! demultiplexer, so every exchange is a framed command/response transaction
//! under a cross-process bus lock. Acquisition runs flat out on the device;
//! a background thread drains the device FIFO into a host-side ring buffer
//! that the caller reads at its leisure.
//!
//! ```no_run
//! use mcc172::{Mcc172, ScanOptions, SourceType};
//!
//! fn main() -> Result<(), mcc172::Error> {
//!     let hat = Mcc172::open(0)?;
//!     hat.iepe_config_write(0, true)?;
//!     let rate = hat.clock_config_write(SourceType::Local, 10_240.0)?;
//!     hat.scan_start(0b01, 10_240, ScanOptions::empty())?;
//!     let mut samples = vec![0.0f64; 10_240];
//!     let read = hat.scan_read(10_240, 2.0 * 10_240.0 / rate, &mut samples)?;
//!     println!("{} samples", read.samples_read_per_channel);
//!     hat.scan_cleanup()?;
//!     Ok(())
//! }
//! ```

mod api;
mod bootloader;
mod bus;
mod calibration;
mod hw;
mod protocol;
mod registry;
mod scan;
#[cfg(test)]
pub(crate) mod testing;

pub use api::{
    DeviceInfo, Error, ScanOptions, ScanRead, ScanStatus, SourceType, TriggerMode, BASE_CLOCK_HZ,
    LSB_SIZE, MAX_CODE, MAX_HATS, MAX_SAMPLES_READ, MAX_SCAN_BUFFER_SIZE, MAX_VOLTAGE, MIN_CODE,
    MIN_VOLTAGE, NUM_CHANNELS, PRODUCT_ID,
};
pub use registry::is_open;

/// Static description of the analog input subsystem. Identical for every
/// board of this type.
pub fn info() -> &'static DeviceInfo {
    &api::DEVICE_INFO
}

/// A handle onto one board. Handles are refcounted per address: opening an
/// address twice yields two handles onto the same device record, and the
/// record (including any scan session) is torn down when the last handle is
/// closed or dropped.
#[derive(Debug)]
pub struct Mcc172 {
    addr: u8,
}

impl Mcc172 {
    /// Open the board at `addr`, bringing up its record on first use:
    /// GPIO lines, the SPI device, the EEPROM calibration blob, and the
    /// firmware ID handshake.
    pub fn open(addr: u8) -> Result<Mcc172, Error> {
        registry::open(addr, false)?;
        Ok(Mcc172 { addr })
    }

    /// Like [`Mcc172::open`], but tolerates a board whose firmware cannot
    /// answer the ID handshake, for loading firmware onto it.
    pub fn open_for_update(addr: u8) -> Result<Mcc172, Error> {
        registry::open(addr, true)?;
        Ok(Mcc172 { addr })
    }

    #[cfg(test)]
    pub(crate) fn open_with(addr: u8, io: Box<dyn hw::HatIo>) -> Result<Mcc172, Error> {
        registry::open_with(addr, io, false)?;
        Ok(Mcc172 { addr })
    }

    #[cfg(test)]
    pub(crate) fn open_for_update_with(addr: u8, io: Box<dyn hw::HatIo>) -> Result<Mcc172, Error> {
        registry::open_with(addr, io, true)?;
        Ok(Mcc172 { addr })
    }

    /// Release this handle. Equivalent to dropping it; spelled out so the
    /// teardown point is visible in calling code.
    pub fn close(self) {}

    pub fn address(&self) -> u8 {
        self.addr
    }

    pub fn firmware_version(&self) -> Result<u16, Error> {
        registry::firmware_version(self.addr)
    }

    pub fn serial(&self) -> Result<String, Error> {
        registry::serial(self.addr)
    }

    pub fn calibration_date(&self) -> Result<String, Error> {
        registry::calibration_date(self.addr)
    }

    /// Factory (or last written) calibration for one channel, as
    /// `(slope, offset)`.
    pub fn calibration_coefficient_read(&self, channel: u8) -> Result<(f64, f64), Error> {
        registry::calibration_coefficient_read(self.addr, channel)
    }

    /// Override the calibration applied to subsequent scans. Rejected while
    /// a scan session exists.
    pub fn calibration_coefficient_write(
        &self,
        channel: u8,
        slope: f64,
        offset: f64,
    ) -> Result<(), Error> {
        registry::calibration_coefficient_write(self.addr, channel, slope, offset)
    }

    pub fn blink_led(&self, count: u8) -> Result<(), Error> {
        registry::blink_led(self.addr, count)
    }

    /// Firmware reset of the board. Rejected while a scan session exists.
    pub fn reset(&self) -> Result<(), Error> {
        registry::reset(self.addr)
    }

    /// Whether constant-current IEPE excitation is on for `channel`.
    pub fn iepe_config_read(&self, channel: u8) -> Result<bool, Error> {
        registry::iepe_config_read(self.addr, channel)
    }

    pub fn iepe_config_write(&self, channel: u8, enabled: bool) -> Result<(), Error> {
        registry::iepe_config_write(self.addr, channel, enabled)
    }

    /// Set the sample clock. The achievable rates are 51.2 kHz divided by an
    /// integer divisor in 1..=256; returns the rate actually configured.
    pub fn clock_config_write(&self, source: SourceType, sample_rate: f64) -> Result<f64, Error> {
        registry::clock_config_write(self.addr, source, sample_rate)
    }

    /// Current clock configuration as `(source, actual rate, synced)`.
    /// `synced` goes true once the clock (shared or local) has stabilised.
    pub fn clock_config_read(&self) -> Result<(SourceType, f64, bool), Error> {
        registry::clock_config_read(self.addr)
    }

    pub fn trigger_config(&self, source: SourceType, mode: TriggerMode) -> Result<(), Error> {
        registry::trigger_config(self.addr, source, mode)
    }

    /// Trigger routing as last written through this process (the device is
    /// not queried).
    pub fn trigger_config_read(&self) -> Result<(SourceType, TriggerMode), Error> {
        registry::trigger_config_read(self.addr)
    }

    /// Route the clock/sync/trigger test points. Factory test plumbing.
    pub fn test_signals_write(&self, mode: u8, clock: u8, sync: u8) -> Result<(), Error> {
        registry::test_signals_write(self.addr, mode, clock, sync)
    }

    pub fn test_signals_read(&self) -> Result<(u8, u8, u8), Error> {
        registry::test_signals_read(self.addr)
    }

    /// Start an acquisition on the channels in `channel_mask`.
    ///
    /// Finite scans capture `samples_per_channel` samples per active
    /// channel; with [`ScanOptions::CONTINUOUS`] the count only influences
    /// the host ring sizing. Fails with [`Error::Busy`] while a previous
    /// session exists (run [`Mcc172::scan_cleanup`] first).
    pub fn scan_start(
        &self,
        channel_mask: u8,
        samples_per_channel: u32,
        options: ScanOptions,
    ) -> Result<(), Error> {
        scan::start(self.addr, channel_mask, samples_per_channel, options)
    }

    /// Read from the scan ring into `buffer`, interleaved by channel.
    ///
    /// `samples_per_channel == -1` returns whatever is available right now;
    /// otherwise the call waits up to `timeout` seconds (negative = forever,
    /// zero = don't wait) for the requested amount. A deadline that expires
    /// short of the target is reported in [`ScanRead::timed_out`] alongside
    /// the samples that did arrive.
    pub fn scan_read(
        &self,
        samples_per_channel: i32,
        timeout: f64,
        buffer: &mut [f64],
    ) -> Result<ScanRead, Error> {
        scan::read(self.addr, samples_per_channel, timeout, buffer)
    }

    /// Scan state and unread samples per channel, without consuming.
    pub fn scan_status(&self) -> Result<(ScanStatus, usize), Error> {
        scan::status(self.addr)
    }

    pub fn scan_buffer_size(&self) -> Result<usize, Error> {
        scan::buffer_size(self.addr)
    }

    pub fn scan_channel_count(&self) -> Result<usize, Error> {
        scan::channel_count(self.addr)
    }

    /// Tell the device to stop acquiring. The producer thread winds down on
    /// its own; the session stays readable until [`Mcc172::scan_cleanup`].
    pub fn scan_stop(&self) -> Result<(), Error> {
        scan::stop(self.addr)
    }

    /// Stop the producer thread and release the scan session and its ring.
    pub fn scan_cleanup(&self) -> Result<(), Error> {
        scan::cleanup(self.addr)
    }

    /// Reset the board into its bootloader for a firmware load.
    pub fn enter_bootloader(&self) -> Result<(), Error> {
        let io = registry::with_device(self.addr, |dev| {
            if dev.scan.is_some() {
                return Err(Error::Busy);
            }
            Ok(dev.io.clone())
        })?;
        let mut io = io.lock().unwrap();
        bootloader::enter(io.as_mut())
    }

    /// Whether the bootloader is ready for the next block.
    pub fn bootloader_ready(&self) -> Result<bool, Error> {
        let io = registry::with_device(self.addr, |dev| Ok(dev.io.clone()))?;
        let mut io = io.lock().unwrap();
        bootloader::ready(io.as_mut())
    }

    /// Exchange one raw firmware block with the bootloader. No framing; the
    /// lengths of `tx` and `rx` must match.
    pub fn bootloader_transfer(&self, tx: &[u8], rx: &mut [u8]) -> Result<(), Error> {
        let io = registry::with_device(self.addr, |dev| Ok(dev.io.clone()))?;
        let mut io = io.lock().unwrap();
        bootloader::transfer(io.as_mut(), tx, rx)
    }
}

impl Drop for Mcc172 {
    fn drop(&mut self) {
        if let Err(e) = registry::close(self.addr) {
            log::error!("close of address {} failed: {}", self.addr, e);
        }
    }
}
