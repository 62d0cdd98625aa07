//! Packet model and frame encoding.

use thiserror::Error;

/// First byte of every frame.
pub const SYNC_BYTE: u8 = 0xAA;

/// Full three-byte frame prefix.
pub const PREFIX: [u8; 3] = [0xAA, 0x01, 0x02];

/// Maximum number of payload bytes in one frame.
pub const MAX_PAYLOAD: usize = 254;

// ---------------------------------------------------------------------------
// PacketType
// ---------------------------------------------------------------------------

/// On-wire packet type tag. Values outside this set are framing errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Error = 0,
    Command = 1,
    StreamData = 2,
}

impl PacketType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(PacketType::Error),
            1 => Some(PacketType::Command),
            2 => Some(PacketType::StreamData),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

// ---------------------------------------------------------------------------
// OpCode
// ---------------------------------------------------------------------------

/// First payload byte of a Command frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    InitialConnection = 1,
    WatchdogReset = 2,
    StartStreaming = 3,
    StopStreaming = 4,
    StartTherapy = 5,
    StopTherapy = 6,
}

impl OpCode {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(OpCode::InitialConnection),
            2 => Some(OpCode::WatchdogReset),
            3 => Some(OpCode::StartStreaming),
            4 => Some(OpCode::StopStreaming),
            5 => Some(OpCode::StartTherapy),
            6 => Some(OpCode::StopTherapy),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

// ---------------------------------------------------------------------------
// DeviceErrorCode
// ---------------------------------------------------------------------------

/// One-byte error code carried in the payload of an Error frame.
///
/// Codes 252..=255 never appear on the wire; the host synthesizes them for
/// local failures (cancellation, missing port, reply timeout, write error).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceErrorCode {
    BadChecksum,
    PayloadLengthExceedsMax,
    BadPacketType,
    BadOpCode,
    AlreadyConnected,
    AlreadyStreaming,
    AlreadyStopStreaming,
    NotConnected,
    AlreadyDoingTherapy,
    AlreadyStopTherapy,
    /// Host-synthesized: the operation was cancelled before completion.
    Cancelled,
    /// Host-synthesized: no port is open.
    NotOpen,
    /// Host-synthesized: no reply arrived within the command timeout.
    TimeoutExpired,
    /// Host-synthesized: the write to the port failed.
    ComFailed,
    /// A code this host does not recognize; preserved for logging.
    Unknown(u8),
}

impl DeviceErrorCode {
    pub fn as_byte(self) -> u8 {
        match self {
            DeviceErrorCode::BadChecksum => 0,
            DeviceErrorCode::PayloadLengthExceedsMax => 1,
            DeviceErrorCode::BadPacketType => 2,
            DeviceErrorCode::BadOpCode => 3,
            DeviceErrorCode::AlreadyConnected => 4,
            DeviceErrorCode::AlreadyStreaming => 5,
            DeviceErrorCode::AlreadyStopStreaming => 6,
            DeviceErrorCode::NotConnected => 7,
            DeviceErrorCode::AlreadyDoingTherapy => 8,
            DeviceErrorCode::AlreadyStopTherapy => 9,
            DeviceErrorCode::Cancelled => 252,
            DeviceErrorCode::NotOpen => 253,
            DeviceErrorCode::TimeoutExpired => 254,
            DeviceErrorCode::ComFailed => 255,
            DeviceErrorCode::Unknown(byte) => byte,
        }
    }
}

impl From<u8> for DeviceErrorCode {
    fn from(byte: u8) -> Self {
        match byte {
            0 => DeviceErrorCode::BadChecksum,
            1 => DeviceErrorCode::PayloadLengthExceedsMax,
            2 => DeviceErrorCode::BadPacketType,
            3 => DeviceErrorCode::BadOpCode,
            4 => DeviceErrorCode::AlreadyConnected,
            5 => DeviceErrorCode::AlreadyStreaming,
            6 => DeviceErrorCode::AlreadyStopStreaming,
            7 => DeviceErrorCode::NotConnected,
            8 => DeviceErrorCode::AlreadyDoingTherapy,
            9 => DeviceErrorCode::AlreadyStopTherapy,
            252 => DeviceErrorCode::Cancelled,
            253 => DeviceErrorCode::NotOpen,
            254 => DeviceErrorCode::TimeoutExpired,
            255 => DeviceErrorCode::ComFailed,
            other => DeviceErrorCode::Unknown(other),
        }
    }
}

impl std::fmt::Display for DeviceErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceErrorCode::Unknown(byte) => write!(f, "Unknown({byte:#04x})"),
            other => write!(f, "{other:?}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Packet
// ---------------------------------------------------------------------------

/// A decoded frame. Immutable once constructed; a `Packet` produced by the
/// frame parser has already passed checksum verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    packet_type: PacketType,
    id: u8,
    payload: Vec<u8>,
}

/// Errors building or encoding a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("payload must contain at least one byte")]
    EmptyPayload,
    #[error("payload of {0} bytes exceeds the {MAX_PAYLOAD}-byte maximum")]
    PayloadTooLong(usize),
}

impl Packet {
    pub fn new(packet_type: PacketType, id: u8, payload: Vec<u8>) -> Result<Self, EncodeError> {
        if payload.is_empty() {
            return Err(EncodeError::EmptyPayload);
        }
        if payload.len() > MAX_PAYLOAD {
            return Err(EncodeError::PayloadTooLong(payload.len()));
        }
        Ok(Packet {
            packet_type,
            id,
            payload,
        })
    }

    /// Construct from parts the framer has already validated.
    pub(crate) fn from_verified_parts(packet_type: PacketType, id: u8, payload: Vec<u8>) -> Self {
        Packet {
            packet_type,
            id,
            payload,
        }
    }

    pub fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Encode the full frame, checksum included.
    pub fn encode(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(PREFIX.len() + 3 + self.payload.len() + 1);
        frame.extend_from_slice(&PREFIX);
        frame.push(self.packet_type.as_byte());
        frame.push(self.id);
        frame.push(self.payload.len() as u8);
        frame.extend_from_slice(&self.payload);
        frame.push(checksum(&frame[1..]));
        frame
    }
}

/// Low 8 bits of the byte sum. Callers pass the frame bytes after the sync
/// byte (prefix remainder, type, id, size, payload).
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, &b| sum.wrapping_add(b))
}

/// Encode a Command frame: payload is `[opcode, data...]`.
pub fn encode_command(id: u8, op: OpCode, data: &[u8]) -> Result<Vec<u8>, EncodeError> {
    let mut payload = Vec::with_capacity(1 + data.len());
    payload.push(op.as_byte());
    payload.extend_from_slice(data);
    Ok(Packet::new(PacketType::Command, id, payload)?.encode())
}
