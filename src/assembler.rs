//! Reassembly of streamed byte fragments into 256-byte detector frames.
//!
//! Serial ports and BLE notifications both deliver a frame in arbitrary
//! chunks. The assembler keeps the bytes for one acquisition attempt and turns
//! them into a [`Spectrum`] once the frame is full.

use serde::{Deserialize, Serialize};

use crate::spectrum::{Spectrum, PIXEL_COUNT};

/// Size of one complete response frame: 128 samples of 2 bytes.
pub const FRAME_BYTES: usize = PIXEL_COUNT * 2;

/// Byte order of the 16-bit samples in a frame.
///
/// Firmware families disagree and nothing in the stream tells them apart, so
/// this is always configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endianness {
    #[default]
    Little,
    Big,
}

impl std::str::FromStr for Endianness {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "little" | "le" => Ok(Endianness::Little),
            "big" | "be" => Ok(Endianness::Big),
            other => Err(format!("unknown endianness '{other}' (expected little or big)")),
        }
    }
}

/// Pair `bytes` into 16-bit samples. A trailing odd byte is ignored.
pub fn decode_samples(bytes: &[u8], endianness: Endianness) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|pair| {
            let pair = [pair[0], pair[1]];
            match endianness {
                Endianness::Little => u16::from_le_bytes(pair),
                Endianness::Big => u16::from_be_bytes(pair),
            }
        })
        .collect()
}

#[derive(Debug, Default)]
pub struct PacketAssembler {
    buffer: Vec<u8>,
}

impl PacketAssembler {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(FRAME_BYTES),
        }
    }

    /// Append a fragment, keeping at most [`FRAME_BYTES`] in total.
    ///
    /// Returns how many bytes of `bytes` were accepted; surplus beyond the
    /// frame boundary is dropped.
    pub fn append(&mut self, bytes: &[u8]) -> usize {
        let take = self.remaining().min(bytes.len());
        self.buffer.extend_from_slice(&bytes[..take]);
        take
    }

    pub fn is_complete(&self) -> bool {
        self.buffer.len() >= FRAME_BYTES
    }

    /// Bytes accumulated so far.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn remaining(&self) -> usize {
        FRAME_BYTES - self.buffer.len()
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Decode the completed frame and clear the buffer.
    ///
    /// Returns `None`, leaving the buffer untouched, while the frame is
    /// incomplete.
    pub fn drain_as_spectrum(&mut self, endianness: Endianness) -> Option<Spectrum> {
        if !self.is_complete() {
            return None;
        }
        let mut raw = [0u16; PIXEL_COUNT];
        for (slot, sample) in raw
            .iter_mut()
            .zip(decode_samples(&self.buffer, endianness))
        {
            *slot = sample;
        }
        self.buffer.clear();
        Some(Spectrum::from_raw(raw))
    }

    /// Human-readable progress, e.g. `incomplete: 12/256 bytes`.
    pub fn progress(&self) -> String {
        format!("incomplete: {}/{} bytes", self.buffer.len(), FRAME_BYTES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_payload_decodes_per_byte_order() {
        let payload = [0x01, 0x00, 0x00, 0x01];
        assert_eq!(
            decode_samples(&payload, Endianness::Little),
            vec![0x0001, 0x0100]
        );
        assert_eq!(
            decode_samples(&payload, Endianness::Big),
            vec![0x0100, 0x0001]
        );
    }

    #[test]
    fn fragments_accumulate_until_frame_is_full() {
        let mut asm = PacketAssembler::new();
        assert_eq!(asm.append(&[0xAA; 100]), 100);
        assert!(!asm.is_complete());
        assert_eq!(asm.append(&[0xBB; 100]), 100);
        assert_eq!(asm.progress(), "incomplete: 200/256 bytes");
        assert_eq!(asm.append(&[0xCC; 100]), 56);
        assert!(asm.is_complete());
        assert_eq!(asm.len(), FRAME_BYTES);
        assert_eq!(asm.append(&[0xDD; 10]), 0);
        assert_eq!(asm.len(), FRAME_BYTES);
    }

    #[test]
    fn drain_resets_for_reuse() {
        let mut asm = PacketAssembler::new();
        let frame: Vec<u8> = (0..FRAME_BYTES).map(|i| i as u8).collect();

        for _ in 0..2 {
            asm.append(&frame);
            let spectrum = asm.drain_as_spectrum(Endianness::Little).unwrap();
            assert_eq!(asm.len(), 0);
            assert_eq!(spectrum.raw()[0], 0x0100);
            assert_eq!(spectrum.raw()[1], 0x0302);
        }
    }

    #[test]
    fn drain_refuses_partial_frames() {
        let mut asm = PacketAssembler::new();
        asm.append(&[0x00; 10]);
        assert!(asm.drain_as_spectrum(Endianness::Big).is_none());
        assert_eq!(asm.len(), 10);
    }

    #[test]
    fn big_endian_frame_decodes_high_byte_first() {
        let mut asm = PacketAssembler::new();
        let mut frame = vec![0u8; FRAME_BYTES];
        frame[254] = 0xFF;
        frame[255] = 0xFE;
        asm.append(&frame);
        let spectrum = asm.drain_as_spectrum(Endianness::Big).unwrap();
        assert_eq!(spectrum.raw()[127], 0xFFFE);
    }

    #[test]
    fn endianness_parses_from_cli_strings() {
        assert_eq!("LE".parse::<Endianness>(), Ok(Endianness::Little));
        assert_eq!("big".parse::<Endianness>(), Ok(Endianness::Big));
        assert!("middle".parse::<Endianness>().is_err());
    }
}
