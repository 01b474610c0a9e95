//! Process-wide device registry.
//!
//! One record per board address, created on the first open and torn down
//! when the last handle goes away. The table mutex serializes open/close and
//! the cached-state accessors; streaming traffic never touches it beyond
//! cloning the session out.

use std::sync::{Arc, Mutex};

use crate::api::{Command, Error, SourceType, TriggerMode, MAX_HATS, NUM_CHANNELS, PRODUCT_ID};
use crate::bus;
use crate::calibration::FactoryData;
use crate::hw::{HatIo, LinuxIo};
use crate::scan::ScanHandle;

pub(crate) struct Device {
    pub(crate) handles: u32,
    pub(crate) version: u16,
    pub(crate) factory: FactoryData,
    pub(crate) trigger_source: SourceType,
    pub(crate) trigger_mode: TriggerMode,
    pub(crate) io: Arc<Mutex<Box<dyn HatIo>>>,
    pub(crate) scan: Option<ScanHandle>,
}

const NO_DEVICE: Option<Device> = None;
static DEVICES: Mutex<[Option<Device>; MAX_HATS as usize]> =
    Mutex::new([NO_DEVICE; MAX_HATS as usize]);

/// Run `f` against the open device at `addr`. An address with no open
/// device is a caller error.
pub(crate) fn with_device<T>(
    addr: u8,
    f: impl FnOnce(&mut Device) -> Result<T, Error>,
) -> Result<T, Error> {
    if addr >= MAX_HATS {
        return Err(Error::BadParameter);
    }
    let mut table = DEVICES.lock().unwrap();
    match table[addr as usize].as_mut() {
        Some(dev) => f(dev),
        None => Err(Error::BadParameter),
    }
}

pub(crate) fn open(addr: u8, for_update: bool) -> Result<(), Error> {
    if addr >= MAX_HATS {
        return Err(Error::BadParameter);
    }
    let mut table = DEVICES.lock().unwrap();
    if let Some(dev) = table[addr as usize].as_mut() {
        dev.handles += 1;
        return Ok(());
    }
    let io = Box::new(LinuxIo::new(addr)?);
    table[addr as usize] = Some(new_device(addr, io, for_update)?);
    Ok(())
}

/// Open against a caller-supplied hardware backend; the test suites hang
/// their scripted double off of this.
pub(crate) fn open_with(addr: u8, io: Box<dyn HatIo>, for_update: bool) -> Result<(), Error> {
    if addr >= MAX_HATS {
        return Err(Error::BadParameter);
    }
    let mut table = DEVICES.lock().unwrap();
    if let Some(dev) = table[addr as usize].as_mut() {
        dev.handles += 1;
        return Ok(());
    }
    table[addr as usize] = Some(new_device(addr, io, for_update)?);
    Ok(())
}

fn new_device(addr: u8, mut io: Box<dyn HatIo>, for_update: bool) -> Result<Device, Error> {
    let info = io.board_info()?;
    if info.product_id != PRODUCT_ID {
        log::error!(
            "board at address {} has product id 0x{:04x}, expected 0x{:04x}",
            addr,
            info.product_id,
            PRODUCT_ID
        );
        return Err(Error::InvalidDevice);
    }
    let factory = FactoryData::from_blob(&info.blob);

    // the firmware occasionally misses the first exchange after power-up
    let mut version = 0u16;
    let mut handshake = Err(Error::Undefined);
    for _ in 0..2 {
        let mut rx = [0u8; 4];
        match bus::transact(io.as_mut(), Command::Id, &[], &mut rx) {
            Ok(_) => {
                let id = u16::from_le_bytes([rx[0], rx[1]]);
                if id == PRODUCT_ID {
                    version = u16::from_le_bytes([rx[2], rx[3]]);
                    handshake = Ok(());
                    break;
                }
                handshake = Err(Error::InvalidDevice);
            }
            Err(e) => handshake = Err(e),
        }
    }
    if let Err(e) = handshake {
        if !for_update {
            return Err(e);
        }
        // an unprogrammed board can't answer; that's what the update path is for
        log::warn!("board at address {} failed the ID handshake ({}), opening for update", addr, e);
    }

    Ok(Device {
        handles: 1,
        version,
        factory,
        trigger_source: SourceType::Local,
        trigger_mode: TriggerMode::RisingEdge,
        io: Arc::new(Mutex::new(io)),
        scan: None,
    })
}

pub(crate) fn close(addr: u8) -> Result<(), Error> {
    if addr >= MAX_HATS {
        return Err(Error::BadParameter);
    }
    let mut removed = {
        let mut table = DEVICES.lock().unwrap();
        let dev = table[addr as usize].as_mut().ok_or(Error::BadParameter)?;
        dev.handles -= 1;
        if dev.handles > 0 {
            return Ok(());
        }
        table[addr as usize].take()
    };
    // last handle: stop the producer before the session (and the bus) go away
    if let Some(dev) = removed.as_mut() {
        if let Some(mut handle) = dev.scan.take() {
            handle.session.stop_thread.store(true, std::sync::atomic::Ordering::Release);
            if let Some(thread) = handle.thread.take() {
                let _ = thread.join();
            }
        }
    }
    Ok(())
}

pub fn is_open(addr: u8) -> bool {
    if addr >= MAX_HATS {
        return false;
    }
    DEVICES.lock().unwrap()[addr as usize].is_some()
}

pub(crate) fn has_session(addr: u8) -> bool {
    with_device(addr, |dev| Ok(dev.scan.is_some())).unwrap_or(false)
}

// ------------------------------------------------------- cached-state access

pub(crate) fn firmware_version(addr: u8) -> Result<u16, Error> {
    with_device(addr, |dev| Ok(dev.version))
}

pub(crate) fn serial(addr: u8) -> Result<String, Error> {
    with_device(addr, |dev| Ok(dev.factory.serial.clone()))
}

pub(crate) fn calibration_date(addr: u8) -> Result<String, Error> {
    with_device(addr, |dev| Ok(dev.factory.calibration_date.clone()))
}

pub(crate) fn calibration_coefficient_read(addr: u8, channel: u8) -> Result<(f64, f64), Error> {
    if channel as usize >= NUM_CHANNELS {
        return Err(Error::BadParameter);
    }
    with_device(addr, |dev| {
        Ok((dev.factory.slopes[channel as usize], dev.factory.offsets[channel as usize]))
    })
}

pub(crate) fn calibration_coefficient_write(
    addr: u8,
    channel: u8,
    slope: f64,
    offset: f64,
) -> Result<(), Error> {
    if channel as usize >= NUM_CHANNELS {
        return Err(Error::BadParameter);
    }
    with_device(addr, |dev| {
        if dev.scan.is_some() {
            return Err(Error::Busy);
        }
        dev.factory.slopes[channel as usize] = slope;
        dev.factory.offsets[channel as usize] = offset;
        Ok(())
    })
}

// ------------------------------------------------------------- device config

pub(crate) fn blink_led(addr: u8, count: u8) -> Result<(), Error> {
    with_device(addr, |dev| {
        let mut io = dev.io.lock().unwrap();
        bus::transact(io.as_mut(), Command::BlinkLed, &[count], &mut []).map(|_| ())
    })
}

pub(crate) fn reset(addr: u8) -> Result<(), Error> {
    with_device(addr, |dev| {
        if dev.scan.is_some() {
            return Err(Error::Busy);
        }
        let mut io = dev.io.lock().unwrap();
        bus::transact(io.as_mut(), Command::Reset, &[], &mut []).map(|_| ())
    })
}

pub(crate) fn iepe_config_read(addr: u8, channel: u8) -> Result<bool, Error> {
    if channel as usize >= NUM_CHANNELS {
        return Err(Error::BadParameter);
    }
    with_device(addr, |dev| {
        let mut rx = [0u8; 1];
        let mut io = dev.io.lock().unwrap();
        bus::transact(io.as_mut(), Command::IepeConfigRead, &[channel], &mut rx)?;
        Ok(rx[0] != 0)
    })
}

pub(crate) fn iepe_config_write(addr: u8, channel: u8, enabled: bool) -> Result<(), Error> {
    if channel as usize >= NUM_CHANNELS {
        return Err(Error::BadParameter);
    }
    with_device(addr, |dev| {
        if dev.scan.is_some() {
            return Err(Error::Busy);
        }
        let mut io = dev.io.lock().unwrap();
        bus::transact(io.as_mut(), Command::IepeConfigWrite, &[channel, enabled as u8], &mut [])
            .map(|_| ())
    })
}

/// The board derives its sample clock by integer division of the 51.2 kHz
/// timebase; report back what the divisor actually gives.
pub(crate) fn clock_config_write(
    addr: u8,
    source: SourceType,
    sample_rate: f64,
) -> Result<f64, Error> {
    if source == SourceType::Slave || !(sample_rate > 0.0) {
        return Err(Error::BadParameter);
    }
    let divisor = (crate::api::BASE_CLOCK_HZ / sample_rate).round().max(1.0).min(256.0);
    with_device(addr, |dev| {
        if dev.scan.is_some() {
            return Err(Error::Busy);
        }
        let payload = [source as u8, (divisor as u16 - 1) as u8];
        let mut io = dev.io.lock().unwrap();
        bus::transact(io.as_mut(), Command::ClockConfigWrite, &payload, &mut [])?;
        Ok(crate::api::BASE_CLOCK_HZ / divisor)
    })
}

pub(crate) fn clock_config_read(addr: u8) -> Result<(SourceType, f64, bool), Error> {
    with_device(addr, |dev| {
        let mut rx = [0u8; 3];
        let mut io = dev.io.lock().unwrap();
        bus::transact(io.as_mut(), Command::ClockConfigRead, &[], &mut rx)?;
        let source: SourceType = num_traits::FromPrimitive::from_u8(rx[0]).ok_or(Error::Undefined)?;
        let rate = crate::api::BASE_CLOCK_HZ / (rx[1] as f64 + 1.0);
        Ok((source, rate, rx[2] != 0))
    })
}

/// Last written trigger routing. The device is not asked; this is the
/// host-side cache the write updates.
pub(crate) fn trigger_config_read(addr: u8) -> Result<(SourceType, TriggerMode), Error> {
    with_device(addr, |dev| Ok((dev.trigger_source, dev.trigger_mode)))
}

pub(crate) fn trigger_config(
    addr: u8,
    source: SourceType,
    mode: TriggerMode,
) -> Result<(), Error> {
    with_device(addr, |dev| {
        if dev.scan.is_some() {
            return Err(Error::Busy);
        }
        let payload = [source as u8, mode as u8];
        let mut io = dev.io.lock().unwrap();
        bus::transact(io.as_mut(), Command::TriggerConfigWrite, &payload, &mut [])?;
        dev.trigger_source = source;
        dev.trigger_mode = mode;
        Ok(())
    })
}

pub(crate) fn test_signals_read(addr: u8) -> Result<(u8, u8, u8), Error> {
    with_device(addr, |dev| {
        let mut rx = [0u8; 3];
        let mut io = dev.io.lock().unwrap();
        bus::transact(io.as_mut(), Command::TestSignalsRead, &[], &mut rx)?;
        Ok((rx[0], rx[1], rx[2]))
    })
}

pub(crate) fn test_signals_write(addr: u8, mode: u8, clock: u8, sync: u8) -> Result<(), Error> {
    with_device(addr, |dev| {
        if dev.scan.is_some() {
            return Err(Error::Busy);
        }
        let mut io = dev.io.lock().unwrap();
        bus::transact(io.as_mut(), Command::TestSignalsWrite, &[mode, clock, sync], &mut [])
            .map(|_| ())
    })
}
