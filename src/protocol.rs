//! MicroNIR command encoding.
//!
//! Hardware generations speak different dialects of the same small command
//! set:
//! - Binary: `[STX, opcode, p1, p2]`, optionally followed by `ETX`
//! - ASCII: a single letter (`S`, `W`, `V`)
//! - Framed ASCII: `[STX, 0x01, letter, ETX]`
//!
//! The wake byte (PING) is a bare `0x00` in every dialect. A command with no
//! representation in the configured dialect is sent in the other one, so
//! encoding never fails.

use serde::{Deserialize, Serialize};

pub const STX: u8 = 0x02;
pub const ETX: u8 = 0x03;

// Binary opcodes
const OP_PING: u8 = 0x00;
const OP_SCAN: u8 = 0x02;
const OP_LAMP: u8 = 0x03;
const OP_VERSION: u8 = 0x05;

// Framed ASCII carries the letter after this address byte
const FRAMED_ADDRESS: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Ping,
    Scan,
    Lamp,
    WarmUp,
    Version,
}

impl Opcode {
    fn binary(self) -> Option<u8> {
        match self {
            Opcode::Ping => Some(OP_PING),
            Opcode::Scan => Some(OP_SCAN),
            Opcode::Lamp => Some(OP_LAMP),
            Opcode::Version => Some(OP_VERSION),
            Opcode::WarmUp => None,
        }
    }

    fn letter(self) -> Option<u8> {
        match self {
            Opcode::Scan => Some(b'S'),
            Opcode::WarmUp => Some(b'W'),
            Opcode::Version => Some(b'V'),
            Opcode::Ping | Opcode::Lamp => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Dialect {
    Binary {
        /// Append `ETX` after the 4-byte frame.
        #[serde(default)]
        etx: bool,
    },
    #[default]
    Ascii,
    FramedAscii,
}

impl std::str::FromStr for Dialect {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "binary" => Ok(Dialect::Binary { etx: false }),
            "binary-etx" => Ok(Dialect::Binary { etx: true }),
            "ascii" => Ok(Dialect::Ascii),
            "framed" | "framed-ascii" => Ok(Dialect::FramedAscii),
            other => Err(format!(
                "unknown dialect '{other}' (expected binary, binary-etx, ascii or framed)"
            )),
        }
    }
}

/// A single request to the instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub opcode: Opcode,
    pub params: [u8; 2],
    pub label: &'static str,
}

impl Command {
    pub const fn ping() -> Self {
        Self {
            opcode: Opcode::Ping,
            params: [0, 0],
            label: "PING (0x00)",
        }
    }

    pub const fn scan() -> Self {
        Self {
            opcode: Opcode::Scan,
            params: [0, 0],
            label: "SCAN (Cmd: S)",
        }
    }

    pub const fn lamp(on: bool) -> Self {
        Self {
            opcode: Opcode::Lamp,
            params: [on as u8, 0],
            label: if on { "LAMP ON" } else { "LAMP OFF" },
        }
    }

    pub const fn warm_up() -> Self {
        Self {
            opcode: Opcode::WarmUp,
            params: [0, 0],
            label: "WARM UP (Cmd: W)",
        }
    }

    pub const fn version() -> Self {
        Self {
            opcode: Opcode::Version,
            params: [0, 0],
            label: "GET VERSION (Cmd: V)",
        }
    }

    /// Wire bytes for this command in `dialect`.
    pub fn encode(&self, dialect: Dialect) -> Vec<u8> {
        if self.opcode == Opcode::Ping {
            return vec![OP_PING];
        }
        match (dialect, self.opcode.binary(), self.opcode.letter()) {
            (Dialect::Binary { etx }, Some(op), _) => self.binary_frame(op, etx),
            (Dialect::Binary { .. }, None, Some(letter)) => vec![letter],
            (Dialect::Ascii, _, Some(letter)) => vec![letter],
            (Dialect::FramedAscii, _, Some(letter)) => vec![STX, FRAMED_ADDRESS, letter, ETX],
            (Dialect::Ascii | Dialect::FramedAscii, Some(op), None) => {
                self.binary_frame(op, false)
            }
            // Every opcode has at least one representation.
            (_, None, None) => vec![OP_PING],
        }
    }

    fn binary_frame(&self, op: u8, etx: bool) -> Vec<u8> {
        let mut frame = vec![STX, op, self.params[0], self.params[1]];
        if etx {
            frame.push(ETX);
        }
        frame
    }
}

/// Strip a leading `STX` and trailing `ETX` from an inbound reply, if present.
pub fn unframe(bytes: &[u8]) -> &[u8] {
    let bytes = bytes.strip_prefix(&[STX]).unwrap_or(bytes);
    bytes.strip_suffix(&[ETX]).unwrap_or(bytes)
}
