//! Byte-at-a-time frame parser.
//!
//! The parser is fed one byte per call and emits a [`Packet`] whenever a
//! complete, checksum-verified frame has been assembled. It never panics:
//! any malformed byte resets the state machine, and the offending byte is
//! re-examined as a potential sync byte so back-to-back frames survive a
//! corrupted predecessor.

use crate::packet::{checksum, Packet, PacketType, SYNC_BYTE};
use thiserror::Error;

/// A structural error in the inbound byte stream. The parser has already
/// resynchronized when one of these is returned; callers only need to log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("bad prefix byte {byte:#04x} at frame offset {offset}")]
    BadPrefix { offset: usize, byte: u8 },
    #[error("bad packet type {0:#04x}")]
    BadType(u8),
    #[error("bad payload size {0}")]
    BadSize(u8),
    #[error("checksum mismatch: computed {computed:#04x}, received {received:#04x}")]
    ChecksumMismatch { computed: u8, received: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Sync,
    Prefix1,
    Prefix2,
    Type,
    Id,
    Size,
    Payload,
    Checksum,
}

/// Reentrant parser state for one serial port.
#[derive(Debug)]
pub struct FrameParser {
    state: State,
    sum: u8,
    packet_type: PacketType,
    id: u8,
    size: u8,
    payload: Vec<u8>,
}

impl FrameParser {
    pub fn new() -> Self {
        FrameParser {
            state: State::Sync,
            sum: 0,
            packet_type: PacketType::Error,
            id: 0,
            size: 0,
            payload: Vec::new(),
        }
    }

    /// True when the parser is somewhere inside a frame. The read loop uses
    /// this to tell a harmless inter-frame read timeout from an interrupted
    /// frame worth logging.
    pub fn in_frame(&self) -> bool {
        self.state != State::Sync
    }

    /// Drop any partial frame and hunt for the next sync byte.
    pub fn reset(&mut self) {
        self.state = State::Sync;
        self.payload.clear();
    }

    /// Feed one byte. Returns `Ok(Some(packet))` when the byte completes a
    /// verified frame, `Ok(None)` when more bytes are needed (stray bytes
    /// between frames are silently dropped), and `Err` when the byte
    /// invalidated the frame under construction.
    pub fn push(&mut self, byte: u8) -> Result<Option<Packet>, FrameError> {
        match self.state {
            State::Sync => {
                if byte == SYNC_BYTE {
                    self.sum = 0;
                    self.state = State::Prefix1;
                }
                Ok(None)
            }
            State::Prefix1 => {
                if byte == 0x01 {
                    self.sum = self.sum.wrapping_add(byte);
                    self.state = State::Prefix2;
                    Ok(None)
                } else {
                    Err(self.resync(byte, FrameError::BadPrefix { offset: 1, byte }))
                }
            }
            State::Prefix2 => {
                if byte == 0x02 {
                    self.sum = self.sum.wrapping_add(byte);
                    self.state = State::Type;
                    Ok(None)
                } else {
                    Err(self.resync(byte, FrameError::BadPrefix { offset: 2, byte }))
                }
            }
            State::Type => match PacketType::from_byte(byte) {
                Some(packet_type) => {
                    self.sum = self.sum.wrapping_add(byte);
                    self.packet_type = packet_type;
                    self.state = State::Id;
                    Ok(None)
                }
                None => Err(self.resync(byte, FrameError::BadType(byte))),
            },
            State::Id => {
                self.sum = self.sum.wrapping_add(byte);
                self.id = byte;
                self.state = State::Size;
                Ok(None)
            }
            State::Size => {
                if byte == 0 || byte == 0xFF {
                    Err(self.resync(byte, FrameError::BadSize(byte)))
                } else {
                    self.sum = self.sum.wrapping_add(byte);
                    self.size = byte;
                    self.payload.clear();
                    self.state = State::Payload;
                    Ok(None)
                }
            }
            State::Payload => {
                self.sum = self.sum.wrapping_add(byte);
                self.payload.push(byte);
                if self.payload.len() == usize::from(self.size) {
                    self.state = State::Checksum;
                }
                Ok(None)
            }
            State::Checksum => {
                let computed = self.sum;
                if byte == computed {
                    let payload = std::mem::take(&mut self.payload);
                    let packet = Packet::from_verified_parts(self.packet_type, self.id, payload);
                    self.reset();
                    Ok(Some(packet))
                } else {
                    Err(self.resync(
                        byte,
                        FrameError::ChecksumMismatch {
                            computed,
                            received: byte,
                        },
                    ))
                }
            }
        }
    }

    /// Reset, then re-offer the failed byte as a potential sync byte so a
    /// frame that starts immediately after garbage is not lost.
    fn resync(&mut self, byte: u8, error: FrameError) -> FrameError {
        self.reset();
        if byte == SYNC_BYTE {
            self.sum = 0;
            self.state = State::Prefix1;
        }
        error
    }
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}
