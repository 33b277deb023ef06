//! Binary frame codec for the Teensy HID panel.
//!
//! A 64-byte HID report carries consecutive length-prefixed frames:
//!
//! | Byte  | Meaning                                          |
//! |-------|--------------------------------------------------|
//! | 0     | frame length `L`, counting this byte             |
//! | 1     | packet type                                      |
//! | 2..4  | registration id, little-endian `u16`             |
//! | 4     | data type tag (register and write frames)        |
//! | 5     | reserved                                         |
//! | 6..   | name (register) or LE `i32`/`f32` value (write)  |
//!
//! Command frames are only four bytes long.

use panelbridge_types::{BridgeError, CommandPhase, DatarefType, DatarefValue};

/// Size of one HID report on the wire.
pub const REPORT_SIZE: usize = 64;

pub const PACKET_REGISTER: u8 = 0x01;
pub const PACKET_WRITE: u8 = 0x02;
pub const PACKET_COMMAND_BEGIN: u8 = 0x04;
pub const PACKET_COMMAND_END: u8 = 0x05;
pub const PACKET_COMMAND_ONCE: u8 = 0x06;

pub const TAG_COMMAND: u8 = 0x00;
pub const TAG_INTEGER: u8 = 0x01;
pub const TAG_FLOAT: u8 = 0x02;

/// Length byte of an outbound write frame.
const WRITE_FRAME_LEN: u8 = 10;

/// Sent when the simulation starts.
pub const SIMULATION_START_FRAME: [u8; 4] = [0x04, 0x03, 0x01, 0x00];
/// Sent at least every half second while a session is open.
pub const KEEPALIVE_FRAME: [u8; 4] = [0x04, 0x03, 0x02, 0x00];
/// Sent when the simulation stops, right before the device is closed.
pub const SIMULATION_STOP_FRAME: [u8; 4] = [0x04, 0x03, 0x03, 0x00];

/// Numeric payload of a write frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WireValue {
    Integer(i32),
    Float(f32),
}

/// One decoded device frame.
#[derive(Debug, Clone, PartialEq)]
pub enum TeensyFrame {
    Register {
        id: u16,
        data_type: DatarefType,
        name: String,
    },
    Write {
        id: u16,
        value: WireValue,
    },
    Command {
        id: u16,
        phase: CommandPhase,
    },
}

/// Split one received buffer into its frames.
///
/// Extraction stops at the first length byte that is not `1 < L <= remaining`
/// or when fewer than two bytes remain.  Whatever is left is discarded; there
/// is no reassembly across reads.
pub fn extract_frames(buf: &[u8]) -> Vec<&[u8]> {
    let mut frames = Vec::new();
    let mut rest = buf;
    while rest.len() >= 2 {
        let len = usize::from(rest[0]);
        if len <= 1 || len > rest.len() {
            break;
        }
        let (frame, tail) = rest.split_at(len);
        frames.push(frame);
        rest = tail;
    }
    frames
}

fn registration_id(frame: &[u8]) -> Result<u16, BridgeError> {
    match frame.get(2..4) {
        Some(&[lo, hi]) => Ok(u16::from_le_bytes([lo, hi])),
        _ => Err(BridgeError::ProtocolParse(format!(
            "frame of {} byte(s) has no registration id",
            frame.len()
        ))),
    }
}

fn tag(frame: &[u8]) -> Result<u8, BridgeError> {
    frame.get(4).copied().ok_or_else(|| {
        BridgeError::ProtocolParse(format!("frame of {} byte(s) has no type tag", frame.len()))
    })
}

fn value_bytes(frame: &[u8]) -> Result<[u8; 4], BridgeError> {
    frame
        .get(6..10)
        .and_then(|b| <[u8; 4]>::try_from(b).ok())
        .ok_or_else(|| {
            BridgeError::ProtocolParse(format!(
                "write frame of {} byte(s) is too short for a value",
                frame.len()
            ))
        })
}

/// Decode one frame produced by [`extract_frames`].
pub fn parse_frame(frame: &[u8]) -> Result<TeensyFrame, BridgeError> {
    let packet_type = frame
        .get(1)
        .copied()
        .ok_or_else(|| BridgeError::ProtocolParse("empty frame".to_string()))?;
    let id = registration_id(frame)?;

    match packet_type {
        PACKET_REGISTER => {
            let data_type = match tag(frame)? {
                TAG_COMMAND => DatarefType::Command,
                TAG_INTEGER => DatarefType::Integer,
                TAG_FLOAT => DatarefType::Float,
                other => {
                    return Err(BridgeError::UnsupportedType {
                        name: format!("registration {id}"),
                        data_type: format!("tag {other:#04x}"),
                    });
                }
            };
            let raw_name = frame.get(6..).unwrap_or_default();
            let name = std::str::from_utf8(raw_name)
                .map_err(|e| BridgeError::ProtocolParse(format!("register name is not UTF-8: {e}")))?
                .trim_end_matches('\0');
            if name.is_empty() {
                return Err(BridgeError::ProtocolParse(format!(
                    "registration {id} has an empty name"
                )));
            }
            Ok(TeensyFrame::Register {
                id,
                data_type,
                name: name.to_string(),
            })
        }
        PACKET_WRITE => {
            let value = match tag(frame)? {
                TAG_INTEGER => WireValue::Integer(i32::from_le_bytes(value_bytes(frame)?)),
                TAG_FLOAT => WireValue::Float(f32::from_le_bytes(value_bytes(frame)?)),
                other => {
                    return Err(BridgeError::UnsupportedType {
                        name: format!("registration {id}"),
                        data_type: format!("tag {other:#04x}"),
                    });
                }
            };
            Ok(TeensyFrame::Write { id, value })
        }
        PACKET_COMMAND_BEGIN => Ok(TeensyFrame::Command {
            id,
            phase: CommandPhase::Begin,
        }),
        PACKET_COMMAND_END => Ok(TeensyFrame::Command {
            id,
            phase: CommandPhase::End,
        }),
        PACKET_COMMAND_ONCE => Ok(TeensyFrame::Command {
            id,
            phase: CommandPhase::Once,
        }),
        other => Err(BridgeError::ProtocolParse(format!(
            "unknown packet type {other:#04x}"
        ))),
    }
}

/// Build the 10-byte write frame for registration `id`.
pub fn encode_write(id: u16, name: &str, value: DatarefValue) -> Result<Vec<u8>, BridgeError> {
    let (tag, bytes) = match value {
        DatarefValue::Integer(v) => (TAG_INTEGER, v.to_le_bytes()),
        DatarefValue::Float(v) => (TAG_FLOAT, v.to_le_bytes()),
        DatarefValue::Command(_) => {
            return Err(BridgeError::UnsupportedType {
                name: name.to_string(),
                data_type: DatarefType::Command.to_string(),
            });
        }
    };
    let [lo, hi] = id.to_le_bytes();
    let mut frame = vec![WRITE_FRAME_LEN, PACKET_WRITE, lo, hi, tag, 0];
    frame.extend_from_slice(&bytes);
    Ok(frame)
}

/// Zero-pad `frame` to a full report.
pub fn pad_report(frame: &[u8]) -> Result<[u8; REPORT_SIZE], BridgeError> {
    if frame.len() > REPORT_SIZE {
        return Err(BridgeError::ProtocolParse(format!(
            "frame of {} byte(s) does not fit a {REPORT_SIZE}-byte report",
            frame.len()
        )));
    }
    let mut report = [0u8; REPORT_SIZE];
    report[..frame.len()].copy_from_slice(frame);
    Ok(report)
}
