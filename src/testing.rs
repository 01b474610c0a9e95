//! Test backend: a scriptable `HatIo` double wrapping a behavioral model of
//! the board firmware, plus the registry gate that serializes suites which
//! touch the process-wide device table.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use num_traits::FromPrimitive;

use crate::api::{
    Command, Error, DEV_STATUS_HW_OVERRUN, DEV_STATUS_RUNNING, DEV_STATUS_TRIGGERED,
    DEV_TRIGGER_ENABLE, NUM_CHANNELS, PRODUCT_ID,
};
use crate::hw::{BoardInfo, HatIo};
use crate::protocol::{CMD_HEADER_LEN, FRAME_START};
use crate::Mcc172;

/// Device-side burst ceiling the model reports in max_read_now.
const MAX_READ_NOW: u16 = 512;

/// The sample stream the model emits: a signed ramp that exercises the
/// 24-bit sign extension.
fn ramp_code(index: u32) -> i32 {
    (index % 2000) as i32 - 1000
}

pub(crate) fn ramp_value(index: u32) -> f64 {
    ramp_code(index) as f64
}

pub(crate) struct MockScan {
    /// samples across all channels; None = continuous
    total: Option<u64>,
    generated: u64,
    available: u64,
    next_code: u32,
    running: bool,
    trig_enabled: bool,
}

pub(crate) struct MockState {
    // identity
    pub product_id: u16,
    pub version: u16,
    pub blob: Vec<u8>,
    /// answer this many ID commands with a bogus id before behaving
    pub id_failures: u32,

    // bus behavior knobs
    pub lock_fails: bool,
    pub ready_never: bool,
    pub ready_delay_polls: u32,
    pub body_io_errors: u32,
    pub echo_command: Option<u8>,
    pub force_status: Option<u8>,
    pub locked: bool,

    // configuration model
    pub clock_source: u8,
    pub divisor: u16,
    pub synced: bool,
    pub trigger_source: u8,
    pub trigger_mode: u8,
    pub iepe: [bool; NUM_CHANNELS],
    pub test_mode: u8,
    pub test_clock: u8,
    pub test_sync: u8,
    pub blink_count: u8,
    pub resets: u32,

    // scan model
    pub scan: Option<MockScan>,
    /// external trigger input level
    pub trigger_line: bool,
    /// samples appearing in the device FIFO per status poll
    pub scan_burst: u64,
    pub force_hw_overrun: bool,

    // bootloader model
    pub irq_level: bool,
    pub irq_low_after_pulses: Option<u32>,
    pub reset_pulses: u32,
    pub reset_level: bool,
    pub last_raw_tx: Vec<u8>,

    pending: VecDeque<u8>,
}

impl Default for MockState {
    fn default() -> MockState {
        MockState {
            product_id: PRODUCT_ID,
            version: 0x0100,
            blob: br#"{
                "serial": "00000042",
                "calibration": {
                    "date": "2025-01-01",
                    "slopes": [1.0, 1.0],
                    "offsets": [0.0, 0.0]
                }
            }"#
            .to_vec(),
            id_failures: 0,
            lock_fails: false,
            ready_never: false,
            ready_delay_polls: 0,
            body_io_errors: 0,
            echo_command: None,
            force_status: None,
            locked: false,
            clock_source: 0,
            divisor: 1,
            synced: true,
            trigger_source: 0,
            trigger_mode: 0,
            iepe: [false; NUM_CHANNELS],
            test_mode: 0,
            test_clock: 0,
            test_sync: 0,
            blink_count: 0,
            resets: 0,
            scan: None,
            trigger_line: true,
            scan_burst: 64,
            force_hw_overrun: false,
            irq_level: false,
            irq_low_after_pulses: None,
            reset_pulses: 0,
            reset_level: false,
            last_raw_tx: Vec::new(),
            pending: VecDeque::new(),
        }
    }
}

impl MockState {
    fn handle_command(&mut self, command_byte: u8, payload: &[u8]) {
        let (status, reply): (u8, Vec<u8>) = match Command::from_u8(command_byte) {
            Some(Command::Id) => {
                let id = if self.id_failures > 0 {
                    self.id_failures -= 1;
                    !self.product_id
                } else {
                    self.product_id
                };
                let mut p = id.to_le_bytes().to_vec();
                p.extend_from_slice(&self.version.to_le_bytes());
                (0x00, p)
            }
            Some(Command::BlinkLed) => {
                self.blink_count = payload[0];
                (0x00, vec![])
            }
            Some(Command::Reset) => {
                self.resets += 1;
                (0x00, vec![])
            }
            Some(Command::ClockConfigWrite) => {
                self.clock_source = payload[0];
                self.divisor = payload[1] as u16 + 1;
                (0x00, vec![])
            }
            Some(Command::ClockConfigRead) => {
                (0x00, vec![self.clock_source, (self.divisor - 1) as u8, self.synced as u8])
            }
            Some(Command::TriggerConfigWrite) => {
                self.trigger_source = payload[0];
                self.trigger_mode = payload[1];
                (0x00, vec![])
            }
            Some(Command::TriggerConfigRead) => {
                (0x00, vec![self.trigger_source, self.trigger_mode])
            }
            Some(Command::IepeConfigWrite) => {
                if (payload[0] as usize) < NUM_CHANNELS {
                    self.iepe[payload[0] as usize] = payload[1] != 0;
                    (0x00, vec![])
                } else {
                    (0x02, vec![])
                }
            }
            Some(Command::IepeConfigRead) => {
                if (payload[0] as usize) < NUM_CHANNELS {
                    (0x00, vec![self.iepe[payload[0] as usize] as u8])
                } else {
                    (0x02, vec![])
                }
            }
            Some(Command::TestSignalsWrite) => {
                self.test_mode = payload[0];
                self.test_clock = payload[1];
                self.test_sync = payload[2];
                (0x00, vec![])
            }
            Some(Command::TestSignalsRead) => {
                (0x00, vec![self.test_clock, self.test_sync, self.trigger_line as u8])
            }
            Some(Command::ScanStart) => {
                if self.scan.as_ref().map_or(false, |scan| scan.running) {
                    (0x03, vec![])
                } else {
                    let count =
                        u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
                    let mask = payload[4];
                    let channels = (mask & ((1u8 << NUM_CHANNELS) - 1)).count_ones() as u64;
                    self.scan = Some(MockScan {
                        total: if count == 0 { None } else { Some(count as u64 * channels) },
                        generated: 0,
                        available: 0,
                        next_code: 0,
                        running: true,
                        trig_enabled: mask & DEV_TRIGGER_ENABLE != 0,
                    });
                    (0x00, vec![])
                }
            }
            Some(Command::ScanStatus) => {
                let mut status_byte = 0u8;
                if self.force_hw_overrun {
                    status_byte |= DEV_STATUS_HW_OVERRUN;
                }
                let trigger_line = self.trigger_line;
                let burst = self.scan_burst;
                let mut available = 0u64;
                if let Some(scan) = self.scan.as_mut() {
                    let triggered = !scan.trig_enabled || trigger_line;
                    if scan.running && triggered {
                        let generate = match scan.total {
                            Some(total) => burst.min(total - scan.generated),
                            None => burst,
                        };
                        scan.generated += generate;
                        scan.available += generate;
                        if scan.total == Some(scan.generated) {
                            scan.running = false;
                        }
                    }
                    if scan.running {
                        status_byte |= DEV_STATUS_RUNNING;
                    }
                    if triggered {
                        status_byte |= DEV_STATUS_TRIGGERED;
                    }
                    available = scan.available;
                }
                let available = available.min(0xFFFF) as u16;
                let mut p = vec![status_byte];
                p.extend_from_slice(&available.to_le_bytes());
                p.extend_from_slice(&MAX_READ_NOW.to_le_bytes());
                (0x00, p)
            }
            Some(Command::ScanData) => {
                let count = u16::from_le_bytes([payload[0], payload[1]]) as u64;
                match self.scan.as_mut() {
                    Some(scan) if scan.available >= count => {
                        let mut p = Vec::with_capacity(count as usize * 3);
                        for _ in 0..count {
                            let code = ramp_code(scan.next_code) as u32;
                            scan.next_code += 1;
                            p.push((code >> 16) as u8);
                            p.push((code >> 8) as u8);
                            p.push(code as u8);
                        }
                        scan.available -= count;
                        (0x00, p)
                    }
                    _ => (0x02, vec![]),
                }
            }
            Some(Command::ScanStop) => {
                if let Some(scan) = self.scan.as_mut() {
                    scan.running = false;
                }
                (0x00, vec![])
            }
            _ => (0x02, vec![]),
        };

        let echoed = self.echo_command.unwrap_or(command_byte);
        let status = self.force_status.unwrap_or(status);
        self.pending.clear();
        self.pending.push_back(FRAME_START);
        self.pending.push_back(echoed);
        self.pending.push_back(status);
        self.pending.push_back((reply.len() & 0xFF) as u8);
        self.pending.push_back((reply.len() >> 8) as u8);
        self.pending.extend(reply);
    }
}

pub(crate) struct MockIo {
    state: Arc<Mutex<MockState>>,
}

impl MockIo {
    pub(crate) fn new() -> MockIo {
        MockIo { state: Arc::new(Mutex::new(MockState::default())) }
    }

    pub(crate) fn handle(&self) -> Arc<Mutex<MockState>> {
        self.state.clone()
    }

    pub(crate) fn state(&self) -> MutexGuard<MockState> {
        self.state.lock().unwrap()
    }
}

impl HatIo for MockIo {
    fn obtain_lock(&mut self) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if state.lock_fails {
            return Err(Error::LockTimeout);
        }
        assert!(!state.locked, "SPI lock taken twice");
        state.locked = true;
        Ok(())
    }

    fn release_lock(&mut self) {
        self.state.lock().unwrap().locked = false;
    }

    fn set_address(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn configure_bus(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        assert!(state.locked, "transfer outside the SPI lock");

        // a framed command?
        if tx.len() >= CMD_HEADER_LEN && tx[0] == FRAME_START {
            let count = tx[2] as usize | (tx[3] as usize) << 8;
            if CMD_HEADER_LEN + count == tx.len() {
                state.handle_command(tx[1], &tx[CMD_HEADER_LEN..]);
                for slot in rx.iter_mut() {
                    *slot = 0;
                }
                return Ok(());
            }
        }
        // dummy clocking to read the reply?
        if tx.iter().all(|&b| b == 0) {
            if state.ready_never {
                for slot in rx.iter_mut() {
                    *slot = 0;
                }
                return Ok(());
            }
            if rx.len() == 1 && state.ready_delay_polls > 0 {
                state.ready_delay_polls -= 1;
                rx[0] = 0;
                return Ok(());
            }
            if rx.len() > 1 && state.body_io_errors > 0 {
                state.body_io_errors -= 1;
                return Err(Error::Undefined);
            }
            for slot in rx.iter_mut() {
                *slot = state.pending.pop_front().unwrap_or(0);
            }
            return Ok(());
        }
        // anything else is a bootloader blit
        state.last_raw_tx = tx.to_vec();
        for slot in rx.iter_mut() {
            *slot = 0;
        }
        Ok(())
    }

    fn reset_write(&mut self, level: bool) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if level && !state.reset_level {
            state.reset_pulses += 1;
            if let Some(pulses) = state.irq_low_after_pulses {
                if state.reset_pulses >= pulses {
                    state.irq_level = false;
                }
            }
        }
        state.reset_level = level;
        Ok(())
    }

    fn irq_read(&mut self) -> Result<bool, Error> {
        Ok(self.state.lock().unwrap().irq_level)
    }

    fn board_info(&mut self) -> Result<BoardInfo, Error> {
        let state = self.state.lock().unwrap();
        Ok(BoardInfo { product_id: state.product_id, blob: state.blob.clone() })
    }
}

/// Tests that touch the process-wide registry hold this while they run.
pub(crate) fn registry_gate() -> MutexGuard<'static, ()> {
    static GATE: Mutex<()> = Mutex::new(());
    let _ = env_logger::builder().is_test(true).try_init();
    GATE.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn mock_io() -> (Box<dyn HatIo>, Arc<Mutex<MockState>>) {
    let io = MockIo::new();
    let state = io.handle();
    (Box::new(io), state)
}

pub(crate) fn open_mock(addr: u8) -> (Mcc172, Arc<Mutex<MockState>>) {
    let (io, state) = mock_io();
    let hat = Mcc172::open_with(addr, io).expect("mock open failed");
    (hat, state)
}
