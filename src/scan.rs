//! The acquisition pipeline: scan control, the background producer that
//! drains the device FIFO, and the consumer side of the host sample ring.
//!
//! The ring is single-producer/single-consumer and lock-free. The producer
//! thread is the only writer of `write_index`, the flag bytes, and the only
//! incrementer of `depth`; the calling thread is the only writer of
//! `read_index` and the only decrementer of `depth`. Flag transitions use
//! release stores paired with acquire loads; the monotone counters get by
//! with relaxed stores on the owning side.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::api::{
    Command, Error, ScanOptions, ScanRead, ScanStatus, DEV_STATUS_HW_OVERRUN, DEV_STATUS_RUNNING,
    DEV_STATUS_TRIGGERED, DEV_TRIGGER_ENABLE, LSB_SIZE, MAX_SAMPLES_READ, MAX_SCAN_BUFFER_SIZE,
    NUM_CHANNELS,
};
use crate::bus;
use crate::hw::HatIo;
use crate::registry;

/// Producer poll pacing, all in microseconds.
const MIN_SLEEP_US: u64 = 200;
const MAX_SLEEP_US: u64 = 100_000;
const TRIG_SLEEP_US: u64 = 1000;
/// Consecutive empty status polls before the sleep doubles.
const IDLE_POLLS_BEFORE_BACKOFF: u32 = 4;

/// Status polls are small and frequent; keep their deadline tight.
const STATUS_REPLY_TIMEOUT: Duration = Duration::from_millis(1);
const STATUS_RETRY_US: u64 = 20;

/// Clock-sync rendezvous poll period. Two boards sharing a clock have to
/// meet up, so this poll has no deadline.
const SYNC_POLL: Duration = Duration::from_millis(100);

/// Consumer-side wait granularity.
const READ_POLL_US: u64 = 100;

struct RingStorage(Box<[UnsafeCell<f64>]>);

// Safety: slot access is partitioned by the SPSC index discipline above;
// no slot is read and written concurrently.
unsafe impl Send for RingStorage {}
unsafe impl Sync for RingStorage {}

pub(crate) struct ScanSession {
    ring: RingStorage,
    pub(crate) buffer_size: usize,
    pub(crate) options: ScanOptions,
    pub(crate) read_threshold: usize,
    pub(crate) channels: Vec<u8>,
    pub(crate) slopes: Vec<f64>,
    pub(crate) offsets: Vec<f64>,

    pub(crate) write_index: AtomicUsize,
    pub(crate) read_index: AtomicUsize,
    pub(crate) depth: AtomicUsize,
    pub(crate) samples_transferred: AtomicU64,
    pub(crate) channel_index: AtomicUsize,

    pub(crate) hw_overrun: AtomicBool,
    pub(crate) buffer_overrun: AtomicBool,
    pub(crate) triggered: AtomicBool,
    pub(crate) scan_running: AtomicBool,
    pub(crate) stop_thread: AtomicBool,
    pub(crate) thread_running: AtomicBool,
}

pub(crate) struct ScanHandle {
    pub(crate) session: Arc<ScanSession>,
    pub(crate) thread: Option<thread::JoinHandle<()>>,
}

impl ScanSession {
    pub(crate) fn new(
        buffer_size: usize,
        options: ScanOptions,
        channels: Vec<u8>,
        read_threshold: usize,
        slopes: Vec<f64>,
        offsets: Vec<f64>,
    ) -> Result<ScanSession, Error> {
        let mut slots = Vec::new();
        slots.try_reserve_exact(buffer_size).map_err(|_| Error::ResourceUnavail)?;
        for _ in 0..buffer_size {
            slots.push(UnsafeCell::new(0.0));
        }
        Ok(ScanSession {
            ring: RingStorage(slots.into_boxed_slice()),
            buffer_size,
            options,
            read_threshold,
            channels,
            slopes,
            offsets,
            write_index: AtomicUsize::new(0),
            read_index: AtomicUsize::new(0),
            depth: AtomicUsize::new(0),
            samples_transferred: AtomicU64::new(0),
            channel_index: AtomicUsize::new(0),
            hw_overrun: AtomicBool::new(false),
            buffer_overrun: AtomicBool::new(false),
            triggered: AtomicBool::new(false),
            scan_running: AtomicBool::new(false),
            stop_thread: AtomicBool::new(false),
            thread_running: AtomicBool::new(false),
        })
    }

    pub(crate) fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Producer side: append one burst. The caller has already clamped the
    /// burst so it does not cross the ring wrap. Returns false when the
    /// burst does not fit, which is the buffer-overrun condition.
    pub(crate) fn push_burst(&self, samples: &[f64]) -> bool {
        let n = samples.len();
        if self.depth.load(Ordering::Acquire) + n > self.buffer_size {
            return false;
        }
        let wi = self.write_index.load(Ordering::Relaxed);
        debug_assert!(wi + n <= self.buffer_size);
        for (i, &v) in samples.iter().enumerate() {
            unsafe {
                *self.ring.0[wi + i].get() = v;
            }
        }
        self.write_index.store((wi + n) % self.buffer_size, Ordering::Relaxed);
        self.depth.fetch_add(n, Ordering::Release);
        self.samples_transferred.fetch_add(n as u64, Ordering::Relaxed);
        true
    }

    /// Consumer side: move `out.len()` samples out of the ring. The caller
    /// has already checked that at least that much depth is available.
    fn pop_chunk(&self, out: &mut [f64]) -> usize {
        let n = out.len();
        let ri = self.read_index.load(Ordering::Relaxed);
        let first = n.min(self.buffer_size - ri);
        for i in 0..first {
            out[i] = unsafe { *self.ring.0[ri + i].get() };
        }
        for i in first..n {
            out[i] = unsafe { *self.ring.0[i - first].get() };
        }
        self.read_index.store((ri + n) % self.buffer_size, Ordering::Relaxed);
        self.depth.fetch_sub(n, Ordering::Release);
        n
    }

    fn status_flags(&self) -> ScanStatus {
        let mut status = ScanStatus::empty();
        if self.hw_overrun.load(Ordering::Acquire) {
            status |= ScanStatus::HW_OVERRUN;
        }
        if self.buffer_overrun.load(Ordering::Acquire) {
            status |= ScanStatus::BUFFER_OVERRUN;
        }
        if self.triggered.load(Ordering::Acquire) {
            status |= ScanStatus::TRIGGERED;
        }
        if self.scan_running.load(Ordering::Acquire) {
            status |= ScanStatus::RUNNING;
        }
        status
    }
}

/// Sign-extend one big-endian 24-bit sample to i32.
pub(crate) fn sign_extend_24(bytes: &[u8]) -> i32 {
    let raw = ((bytes[0] as i32) << 16) | ((bytes[1] as i32) << 8) | bytes[2] as i32;
    (raw << 8) >> 8
}

/// Decode a burst of raw samples, applying the per-channel calibration and
/// LSB scaling the options ask for. `channel_index` is the round-robin
/// position of the first sample; returns the position after the burst.
pub(crate) fn convert_burst(
    raw: &[u8],
    slopes: &[f64],
    offsets: &[f64],
    mut channel_index: usize,
    options: ScanOptions,
    out: &mut Vec<f64>,
) -> usize {
    let calibrate = !options.contains(ScanOptions::NOCALIBRATEDATA);
    let scale = !options.contains(ScanOptions::NOSCALEDATA);
    let channel_count = slopes.len();
    for chunk in raw.chunks_exact(3) {
        let mut value = sign_extend_24(chunk) as f64;
        if calibrate {
            value = value * slopes[channel_index] + offsets[channel_index];
        }
        if scale {
            value *= LSB_SIZE;
        }
        out.push(value);
        channel_index = (channel_index + 1) % channel_count;
    }
    channel_index
}

// ---------------------------------------------------------------- controller

fn clock_rate(io: &Arc<Mutex<Box<dyn HatIo>>>) -> Result<(f64, bool), Error> {
    let mut rx = [0u8; 3];
    {
        let mut io = io.lock().unwrap();
        bus::transact(io.as_mut(), Command::ClockConfigRead, &[], &mut rx)?;
    }
    let divisor = rx[1] as f64 + 1.0;
    Ok((crate::api::BASE_CLOCK_HZ / divisor, rx[2] != 0))
}

fn continuous_floor(rate: f64) -> usize {
    if rate <= 1024.0 {
        1000
    } else if rate <= 10_240.0 {
        10_000
    } else {
        100_000
    }
}

pub(crate) fn start(
    addr: u8,
    channel_mask: u8,
    samples_per_channel: u32,
    options: ScanOptions,
) -> Result<(), Error> {
    if channel_mask == 0 || channel_mask >= 1 << NUM_CHANNELS {
        return Err(Error::BadParameter);
    }
    let continuous = options.contains(ScanOptions::CONTINUOUS);
    if !continuous && samples_per_channel == 0 {
        return Err(Error::BadParameter);
    }

    // fast-fail while another session exists; snapshot what the session needs
    let (io, factory) = registry::with_device(addr, |dev| {
        if dev.scan.is_some() {
            return Err(Error::Busy);
        }
        Ok((dev.io.clone(), dev.factory.clone()))
    })?;

    let channels: Vec<u8> =
        (0..NUM_CHANNELS as u8).filter(|ch| channel_mask & (1 << ch) != 0).collect();
    let channel_count = channels.len();
    let slopes: Vec<f64> = channels.iter().map(|&ch| factory.slopes[ch as usize]).collect();
    let offsets: Vec<f64> = channels.iter().map(|&ch| factory.offsets[ch as usize]).collect();

    // boards sharing a clock have to rendezvous, so wait as long as it takes
    let rate = loop {
        let (rate, synced) = clock_rate(&io)?;
        if synced {
            break rate;
        }
        thread::sleep(SYNC_POLL);
    };

    let buffer_size = if continuous {
        continuous_floor(rate).max(samples_per_channel as usize) * channel_count
    } else {
        (samples_per_channel as usize).checked_mul(channel_count).ok_or(Error::BadParameter)?
    };
    if buffer_size > MAX_SCAN_BUFFER_SIZE {
        return Err(Error::BadParameter);
    }

    let mut read_threshold = ((rate / 10.0) as usize).max(channel_count).min(MAX_SAMPLES_READ);
    read_threshold -= read_threshold % channel_count;

    let session = Arc::new(ScanSession::new(
        buffer_size,
        options,
        channels,
        read_threshold,
        slopes,
        offsets,
    )?);

    registry::with_device(addr, |dev| {
        if dev.scan.is_some() {
            return Err(Error::Busy);
        }
        let mut dev_mask = channel_mask;
        if options.contains(ScanOptions::EXTTRIGGER) {
            dev_mask |= DEV_TRIGGER_ENABLE;
        }
        let scan_count: u32 = if continuous { 0 } else { samples_per_channel };
        let mut payload = [0u8; 5];
        payload[..4].copy_from_slice(&scan_count.to_le_bytes());
        payload[4] = dev_mask;
        {
            let mut io = dev.io.lock().unwrap();
            bus::transact(io.as_mut(), Command::ScanStart, &payload, &mut [])?;
        }

        session.scan_running.store(true, Ordering::Release);
        session.thread_running.store(true, Ordering::Release);
        let thread_io = dev.io.clone();
        let thread_session = session.clone();
        let spawned = thread::Builder::new()
            .name(format!("mcc172-scan-{}", addr))
            .spawn(move || producer_loop(thread_io, thread_session));
        match spawned {
            Ok(handle) => {
                dev.scan = Some(ScanHandle { session: session.clone(), thread: Some(handle) });
                Ok(())
            }
            Err(e) => {
                log::error!("scan thread create failed: {}", e);
                // unwind completely: stop the device scan, drop the ring
                let mut io = dev.io.lock().unwrap();
                let _ = bus::transact(io.as_mut(), Command::ScanStop, &[], &mut []);
                session.scan_running.store(false, Ordering::Release);
                session.thread_running.store(false, Ordering::Release);
                Err(Error::ResourceUnavail)
            }
        }
    })
}

/// Device-side stop. The producer notices on its next status poll; nothing
/// is joined or freed here.
pub(crate) fn stop(addr: u8) -> Result<(), Error> {
    let io = registry::with_device(addr, |dev| Ok(dev.io.clone()))?;
    let mut io = io.lock().unwrap();
    bus::transact(io.as_mut(), Command::ScanStop, &[], &mut []).map(|_| ())
}

/// Hard teardown: stop the producer thread, join it, release the session.
pub(crate) fn cleanup(addr: u8) -> Result<(), Error> {
    let handle = registry::with_device(addr, |dev| Ok(dev.scan.take()))?;
    if let Some(mut handle) = handle {
        handle.session.stop_thread.store(true, Ordering::Release);
        if let Some(thread) = handle.thread.take() {
            let _ = thread.join();
        }
    }
    Ok(())
}

fn session_of(addr: u8) -> Result<Arc<ScanSession>, Error> {
    registry::with_device(addr, |dev| {
        dev.scan.as_ref().map(|handle| handle.session.clone()).ok_or(Error::ResourceUnavail)
    })
}

pub(crate) fn buffer_size(addr: u8) -> Result<usize, Error> {
    Ok(session_of(addr)?.buffer_size)
}

pub(crate) fn channel_count(addr: u8) -> Result<usize, Error> {
    Ok(session_of(addr)?.channel_count())
}

pub(crate) fn status(addr: u8) -> Result<(ScanStatus, usize), Error> {
    let session = session_of(addr)?;
    let depth = session.depth.load(Ordering::Acquire);
    Ok((session.status_flags(), depth / session.channel_count()))
}

pub(crate) fn read(
    addr: u8,
    samples_per_channel: i32,
    timeout: f64,
    out: &mut [f64],
) -> Result<ScanRead, Error> {
    if samples_per_channel < -1 {
        return Err(Error::BadParameter);
    }
    let session = session_of(addr)?;
    let channel_count = session.channel_count();
    let capacity = out.len() - out.len() % channel_count;

    let target = if samples_per_channel < 0 {
        // everything that's there right now; the timeout does not apply
        let avail = session.depth.load(Ordering::Acquire);
        capacity.min(avail - avail % channel_count)
    } else {
        let want = (samples_per_channel as usize)
            .checked_mul(channel_count)
            .ok_or(Error::BadParameter)?;
        capacity.min(want)
    };
    let wait_forever = samples_per_channel >= 0 && timeout < 0.0;
    let deadline = if samples_per_channel >= 0 && timeout > 0.0 {
        Some(Instant::now() + Duration::from_secs_f64(timeout))
    } else {
        None
    };

    let mut copied = 0;
    let mut timed_out = false;
    loop {
        let avail = session.depth.load(Ordering::Acquire);
        let usable = avail - avail % channel_count;
        if usable > 0 && copied < target {
            let mut n = usable.min(target - copied);
            n -= n % channel_count;
            if n > 0 {
                copied += session.pop_chunk(&mut out[copied..copied + n]);
                continue;
            }
        }
        if copied >= target {
            break;
        }
        if session.hw_overrun.load(Ordering::Acquire)
            || session.buffer_overrun.load(Ordering::Acquire)
        {
            break;
        }
        // once the producer has wound down with nothing left in the ring,
        // no further samples can appear
        if !session.scan_running.load(Ordering::Acquire)
            && !session.thread_running.load(Ordering::Acquire)
            && session.depth.load(Ordering::Acquire) < channel_count
        {
            break;
        }
        match deadline {
            _ if wait_forever => {}
            None => break, // timeout == 0, or the read-all mode: one pass
            Some(deadline) => {
                if Instant::now() >= deadline {
                    timed_out = copied < target;
                    break;
                }
            }
        }
        thread::sleep(Duration::from_micros(READ_POLL_US));
    }

    Ok(ScanRead {
        status: session.status_flags(),
        samples_read_per_channel: copied / channel_count,
        timed_out,
    })
}

// ------------------------------------------------------------------ producer

struct DeviceScanStatus {
    running: bool,
    hw_overrun: bool,
    triggered: bool,
    available: usize,
    max_read_now: usize,
}

fn poll_device_status(io: &Arc<Mutex<Box<dyn HatIo>>>) -> Result<DeviceScanStatus, Error> {
    let mut rx = [0u8; 5];
    {
        let mut io = io.lock().unwrap();
        bus::transfer(
            io.as_mut(),
            Command::ScanStatus,
            &[],
            &mut rx,
            STATUS_REPLY_TIMEOUT,
            STATUS_RETRY_US,
        )?;
    }
    Ok(DeviceScanStatus {
        running: rx[0] & DEV_STATUS_RUNNING != 0,
        hw_overrun: rx[0] & DEV_STATUS_HW_OVERRUN != 0,
        triggered: rx[0] & DEV_STATUS_TRIGGERED != 0,
        available: u16::from_le_bytes([rx[1], rx[2]]) as usize,
        max_read_now: u16::from_le_bytes([rx[3], rx[4]]) as usize,
    })
}

fn read_device_samples(
    io: &Arc<Mutex<Box<dyn HatIo>>>,
    session: &ScanSession,
    count: usize,
) -> Result<Vec<f64>, Error> {
    let mut raw = vec![0u8; count * 3];
    {
        let mut io = io.lock().unwrap();
        bus::transact(io.as_mut(), Command::ScanData, &(count as u16).to_le_bytes(), &mut raw)?;
    }
    let mut samples = Vec::with_capacity(count);
    let channel_index = session.channel_index.load(Ordering::Relaxed);
    let next = convert_burst(
        &raw,
        &session.slopes,
        &session.offsets,
        channel_index,
        session.options,
        &mut samples,
    );
    session.channel_index.store(next, Ordering::Relaxed);
    Ok(samples)
}

fn producer_loop(io: Arc<Mutex<Box<dyn HatIo>>>, session: Arc<ScanSession>) {
    let channel_count = session.channel_count();
    let mut sleep_us = MIN_SLEEP_US;
    let mut idle_polls = 0u32;
    let mut last_read_productive = false;

    loop {
        if session.stop_thread.load(Ordering::Acquire) {
            break;
        }
        let status = match poll_device_status(&io) {
            Ok(status) => status,
            Err(e) => {
                log::debug!("scan status poll failed: {}", e);
                thread::sleep(Duration::from_micros(sleep_us));
                continue;
            }
        };
        if status.hw_overrun {
            log::warn!("hardware overrun, scan terminated");
            session.hw_overrun.store(true, Ordering::Release);
            session.scan_running.store(false, Ordering::Release);
            break;
        }
        if !status.triggered {
            thread::sleep(Duration::from_micros(TRIG_SLEEP_US));
            continue;
        }
        if !session.triggered.load(Ordering::Relaxed) {
            session.triggered.store(true, Ordering::Release);
        }

        let mut read_count =
            if !status.running || status.available >= session.read_threshold
                || status.available > status.max_read_now
            {
                status.available.min(status.max_read_now).min(MAX_SAMPLES_READ)
            } else {
                0
            };
        read_count -= read_count % channel_count;

        if read_count > 0 {
            // keep one device read contiguous in the ring
            let write_index = session.write_index.load(Ordering::Relaxed);
            let burst = read_count.min(session.buffer_size - write_index);
            match read_device_samples(&io, &session, burst) {
                Ok(samples) => {
                    if !session.push_burst(&samples) {
                        log::warn!("host ring overrun, scan terminated");
                        session.buffer_overrun.store(true, Ordering::Release);
                        session.scan_running.store(false, Ordering::Release);
                        break;
                    }
                    if last_read_productive {
                        sleep_us = (sleep_us / 2).max(MIN_SLEEP_US);
                    }
                    last_read_productive = true;
                    idle_polls = 0;
                    read_count = burst;
                }
                Err(e) => {
                    // the next status poll decides whether this is fatal
                    log::debug!("scan data read failed: {}", e);
                    read_count = 0;
                }
            }
        } else {
            last_read_productive = false;
            idle_polls += 1;
            if idle_polls > IDLE_POLLS_BEFORE_BACKOFF {
                sleep_us = (sleep_us * 2).min(MAX_SLEEP_US);
                idle_polls = 0;
            }
        }

        if !status.running && status.available == read_count {
            session.scan_running.store(false, Ordering::Release);
            break;
        }
        thread::sleep(Duration::from_micros(sleep_us));
    }

    if session.scan_running.load(Ordering::Acquire) {
        // stopped from the host side; make sure the device stops streaming
        {
            let mut io = io.lock().unwrap();
            let _ = bus::transact(io.as_mut(), Command::ScanStop, &[], &mut []);
        }
        session.scan_running.store(false, Ordering::Release);
    }
    session.thread_running.store(false, Ordering::Release);
}
