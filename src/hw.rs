//! Hardware access seam.
//!
//! Everything the driver core needs from the platform goes through `HatIo`:
//! the shared SPI bus (with its cross-process lock and board-select lines),
//! the RESET/IRQ pins, and the board-info EEPROM blob. The shipped
//! implementation talks to spidev and sysfs GPIO; the test suite substitutes
//! a scripted double.

use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use spidev::{SpiModeFlags, Spidev, SpidevOptions, SpidevTransfer};
use sysfs_gpio::{Direction, Pin};

use crate::api::{Error, MAX_HATS};

/// Factory EEPROM contents relevant to the core: the product id and the raw
/// calibration blob. Decoding the EEPROM container format is the platform
/// tooling's job, not ours.
#[derive(Debug, Clone)]
pub(crate) struct BoardInfo {
    pub product_id: u16,
    pub blob: Vec<u8>,
}

pub(crate) trait HatIo: Send {
    /// Take the cross-process SPI bus lock. Bounded at 5 s.
    fn obtain_lock(&mut self) -> Result<(), Error>;
    fn release_lock(&mut self);
    /// Drive this board's address onto the shared select lines.
    fn set_address(&mut self) -> Result<(), Error>;
    /// Re-assert mode 1 / 20 MHz / 8-bit. Other drivers share the bus, so
    /// this happens on every transaction.
    fn configure_bus(&mut self) -> Result<(), Error>;
    /// Full-duplex clocking of `tx` out while filling `rx`. Lengths match.
    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<(), Error>;
    fn reset_write(&mut self, level: bool) -> Result<(), Error>;
    /// Level of the board's IRQ line (high = true).
    fn irq_read(&mut self) -> Result<bool, Error>;
    fn board_info(&mut self) -> Result<BoardInfo, Error>;
}

/// Board wiring on the host header (BCM numbering).
const ADDR_PINS: [u64; 3] = [12, 13, 26];
const RESET_PIN: u64 = 16;
const IRQ_PIN: u64 = 20;

const SPI_DEVICE: &str = "/dev/spidev0.0";
const LOCK_FILE: &str = "/tmp/.mcc172-spi.lock";
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);
/// Where the platform's HAT tooling leaves each board's EEPROM contents.
const HAT_INFO_DIR: &str = "/etc/mcc/hats";

pub(crate) struct LinuxIo {
    addr: u8,
    spi: Spidev,
    lock_file: Option<File>,
    addr_pins: [Pin; 3],
    reset: Pin,
    irq: Pin,
}

fn export_pin(num: u64, dir: Direction) -> Result<Pin, Error> {
    let pin = Pin::new(num);
    pin.export().map_err(|_| Error::ResourceUnavail)?;
    // sysfs takes a moment to hand the attribute files over after export
    thread::sleep(Duration::from_millis(50));
    pin.set_direction(dir).map_err(|e| {
        log::error!("gpio {} direction: {}", num, e);
        Error::ResourceUnavail
    })?;
    Ok(pin)
}

impl LinuxIo {
    pub(crate) fn new(addr: u8) -> Result<LinuxIo, Error> {
        if addr >= MAX_HATS {
            return Err(Error::BadParameter);
        }
        let spi = Spidev::open(SPI_DEVICE).map_err(|e| {
            log::error!("open {}: {}", SPI_DEVICE, e);
            Error::ResourceUnavail
        })?;
        let addr_pins = [
            export_pin(ADDR_PINS[0], Direction::Low)?,
            export_pin(ADDR_PINS[1], Direction::Low)?,
            export_pin(ADDR_PINS[2], Direction::Low)?,
        ];
        // RESET idles low; IRQ is the board's attention line
        let reset = export_pin(RESET_PIN, Direction::Low)?;
        let irq = export_pin(IRQ_PIN, Direction::In)?;
        Ok(LinuxIo { addr, spi, lock_file: None, addr_pins, reset, irq })
    }
}

impl HatIo for LinuxIo {
    fn obtain_lock(&mut self) -> Result<(), Error> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(LOCK_FILE)
            .map_err(|e| {
                log::error!("open {}: {}", LOCK_FILE, e);
                Error::ResourceUnavail
            })?;
        let fd = file.as_raw_fd();
        let deadline = Instant::now() + LOCK_TIMEOUT;
        loop {
            if unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) } == 0 {
                self.lock_file = Some(file);
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::LockTimeout);
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn release_lock(&mut self) {
        // dropping the fd releases the flock
        self.lock_file = None;
    }

    fn set_address(&mut self) -> Result<(), Error> {
        for (bit, pin) in self.addr_pins.iter().enumerate() {
            let level = (self.addr >> bit) & 1;
            pin.set_value(level).map_err(|e| {
                log::error!("address line {}: {}", bit, e);
                Error::Undefined
            })?;
        }
        Ok(())
    }

    fn configure_bus(&mut self) -> Result<(), Error> {
        let options = SpidevOptions::new()
            .bits_per_word(8)
            .max_speed_hz(20_000_000)
            .mode(SpiModeFlags::SPI_MODE_1)
            .build();
        self.spi.configure(&options).map_err(|e| {
            log::error!("spi configure: {}", e);
            Error::Undefined
        })
    }

    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<(), Error> {
        let mut xfer = SpidevTransfer::read_write(tx, rx);
        self.spi.transfer(&mut xfer).map_err(|_| Error::Undefined)
    }

    fn reset_write(&mut self, level: bool) -> Result<(), Error> {
        self.reset.set_value(level as u8).map_err(|_| Error::Undefined)
    }

    fn irq_read(&mut self) -> Result<bool, Error> {
        Ok(self.irq.get_value().map_err(|_| Error::Undefined)? != 0)
    }

    fn board_info(&mut self) -> Result<BoardInfo, Error> {
        let base = PathBuf::from(HAT_INFO_DIR).join(format!("hat_{}", self.addr));
        let mut id_text = String::new();
        File::open(base.join("product_id"))
            .and_then(|mut f| f.read_to_string(&mut id_text))
            .map_err(|e| {
                log::error!("board info for address {}: {}", self.addr, e);
                Error::InvalidDevice
            })?;
        let id_text = id_text.trim();
        let product_id = if let Some(hex) = id_text.strip_prefix("0x") {
            u16::from_str_radix(hex, 16)
        } else {
            id_text.parse()
        }
        .map_err(|_| Error::InvalidDevice)?;
        // the calibration blob is optional; a missing file falls through to
        // the calibration store's defaults
        let blob = std::fs::read(base.join("custom")).unwrap_or_default();
        Ok(BoardInfo { product_id, blob })
    }
}
