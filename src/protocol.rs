//! Framed command/response codec for the board's SPI link.
//!
//! Outbound frames are [0xDB, command, count_lo, count_hi, payload...].
//! Inbound frames carry an extra status byte after the command. The inbound
//! scanner is a byte-at-a-time state machine that can be fed the reply in
//! arbitrary chunks, since the bus layer reads the body incrementally.

use num_traits::ToPrimitive;

use crate::api::{Command, Error};

pub(crate) const FRAME_START: u8 = 0xDB;
pub(crate) const CMD_HEADER_LEN: usize = 4;
pub(crate) const REPLY_HEADER_LEN: usize = 5;
/// Largest payload the firmware accepts in one command.
pub(crate) const MAX_PAYLOAD: usize = 256;

/// Build an outbound frame.
pub(crate) fn encode(command: Command, payload: &[u8]) -> Result<Vec<u8>, Error> {
    if payload.len() > MAX_PAYLOAD {
        return Err(Error::BadParameter);
    }
    let mut frame = Vec::with_capacity(CMD_HEADER_LEN + payload.len());
    frame.push(FRAME_START);
    frame.push(command.to_u8().unwrap());
    frame.push((payload.len() & 0xFF) as u8);
    frame.push((payload.len() >> 8) as u8);
    frame.extend_from_slice(payload);
    Ok(frame)
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ScanState {
    SearchStart,
    Command,
    Status,
    CountLo,
    CountHi,
    Data,
    Done,
}

/// A complete inbound frame located by the scanner, as offsets into the
/// caller's accumulated stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct FrameLocation {
    pub start: usize,
    pub len: usize,
}

/// Incremental scanner for inbound frames. Feed it each chunk of the reply
/// stream as it arrives; it never fails, it only reports whether a frame has
/// completed yet and how many more bytes it wants.
pub(crate) struct FrameScanner {
    state: ScanState,
    /// absolute offset of the next byte to be fed
    offset: usize,
    /// absolute offset of the 0xDB that opened the current candidate frame
    frame_start: usize,
    count: usize,
    data_left: usize,
}

impl FrameScanner {
    pub(crate) fn new() -> FrameScanner {
        FrameScanner {
            state: ScanState::SearchStart,
            offset: 0,
            frame_start: 0,
            count: 0,
            data_left: 0,
        }
    }

    /// Advance the state machine over `chunk`. Returns the location of the
    /// first complete frame, if one finished inside this chunk. Once a frame
    /// has been reported the scanner stays in `Done` until reset.
    pub(crate) fn scan(&mut self, chunk: &[u8]) -> Option<FrameLocation> {
        for &byte in chunk {
            let pos = self.offset;
            self.offset += 1;
            match self.state {
                ScanState::SearchStart => {
                    if byte == FRAME_START {
                        self.frame_start = pos;
                        self.state = ScanState::Command;
                    }
                }
                ScanState::Command => self.state = ScanState::Status,
                ScanState::Status => self.state = ScanState::CountLo,
                ScanState::CountLo => {
                    self.count = byte as usize;
                    self.state = ScanState::CountHi;
                }
                ScanState::CountHi => {
                    self.count |= (byte as usize) << 8;
                    if self.count == 0 {
                        self.state = ScanState::Done;
                    } else {
                        self.data_left = self.count;
                        self.state = ScanState::Data;
                    }
                }
                ScanState::Data => {
                    self.data_left -= 1;
                    if self.data_left == 0 {
                        self.state = ScanState::Done;
                    }
                }
                ScanState::Done => {}
            }
            if self.state == ScanState::Done {
                return Some(FrameLocation {
                    start: self.frame_start,
                    len: REPLY_HEADER_LEN + self.count,
                });
            }
        }
        None
    }

    /// Bytes still needed before the current candidate frame can complete.
    /// While searching for a start byte this is the full header length.
    pub(crate) fn remaining(&self) -> usize {
        match self.state {
            ScanState::SearchStart => REPLY_HEADER_LEN,
            ScanState::Command => REPLY_HEADER_LEN - 1,
            ScanState::Status => REPLY_HEADER_LEN - 2,
            ScanState::CountLo => REPLY_HEADER_LEN - 3,
            ScanState::CountHi => 1,
            ScanState::Data => self.data_left,
            ScanState::Done => 0,
        }
    }
}
