//! Wire protocol for the stimulation device serial link.
//!
//! Everything that touches raw frame bytes lives here: the packet model,
//! frame encoding with the additive checksum, the byte-at-a-time frame
//! parser, and the streaming-sample codec. The crate is I/O-free so the
//! driver, the emulator, and the test suites all share one definition of
//! the wire format.
//!
//! # Frame layout
//!
//! ```text
//! +------+------+------+------+------+------+---------+----------+
//! | 0xAA | 0x01 | 0x02 | TYPE |  ID  | SIZE | PAYLOAD | CHECKSUM |
//! +------+------+------+------+------+------+---------+----------+
//! ```
//!
//! `SIZE` counts payload bytes (1..=254). The checksum is the low 8 bits of
//! the sum of every frame byte after the 0xAA sync byte.

pub mod framer;
pub mod packet;
pub mod sample;

pub use framer::{FrameError, FrameParser};
pub use packet::{
    DeviceErrorCode, EncodeError, OpCode, Packet, PacketType, MAX_PAYLOAD, PREFIX, SYNC_BYTE,
};
pub use sample::{StreamingSample, DYNAMIC_RANGE, X_MIN};
