//! H.264/AVC codec configuration
//!
//! RTMP carries H.264 in AVCC form: the sequence header holds an
//! AVCDecoderConfigurationRecord, frames hold length-prefixed NAL units.
//!
//! ```text
//! AVCDecoderConfigurationRecord:
//! configurationVersion (1) | AVCProfileIndication (1) | profile_compat (1)
//! | AVCLevelIndication (1) | lengthSizeMinusOne (1, low 2 bits)
//! | numOfSPS (1, low 5 bits) | { spsLength (2) | sps }*
//! | numOfPPS (1) | { ppsLength (2) | pps }*
//! ```

use bytes::{Buf, Bytes};

use crate::error::{MediaError, Result};

/// H.264 NAL unit type (low 5 bits of the NALU header byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NaluType {
    Slice = 1,
    Idr = 5,
    Sei = 6,
    Sps = 7,
    Pps = 8,
    Aud = 9,
}

impl NaluType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b & 0x1F {
            1 => Some(NaluType::Slice),
            5 => Some(NaluType::Idr),
            6 => Some(NaluType::Sei),
            7 => Some(NaluType::Sps),
            8 => Some(NaluType::Pps),
            9 => Some(NaluType::Aud),
            _ => None,
        }
    }
}

/// Decoder configuration from an AVC sequence header
#[derive(Debug, Clone)]
pub struct AvcConfig {
    /// Profile indication (66 Baseline, 77 Main, 100 High, ...)
    pub profile: u8,
    pub compatibility: u8,
    /// Level indication (31 = level 3.1)
    pub level: u8,
    /// NALU length prefix size in bytes (usually 4)
    pub nalu_length_size: u8,
    pub sps: Vec<Bytes>,
    pub pps: Vec<Bytes>,
}

impl AvcConfig {
    /// Parse an AVCDecoderConfigurationRecord
    pub fn parse(mut data: Bytes) -> Result<Self> {
        if data.len() < 7 {
            return Err(MediaError::InvalidAvcPacket.into());
        }

        let version = data.get_u8();
        if version != 1 {
            return Err(MediaError::InvalidAvcPacket.into());
        }

        let profile = data.get_u8();
        let compatibility = data.get_u8();
        let level = data.get_u8();
        let nalu_length_size = (data.get_u8() & 0x03) + 1;

        let num_sps = (data.get_u8() & 0x1F) as usize;
        let mut sps = Vec::with_capacity(num_sps);
        for _ in 0..num_sps {
            if data.len() < 2 {
                return Err(MediaError::InvalidAvcPacket.into());
            }
            let len = data.get_u16() as usize;
            if data.len() < len {
                return Err(MediaError::InvalidAvcPacket.into());
            }
            sps.push(data.copy_to_bytes(len));
        }

        if data.is_empty() {
            return Err(MediaError::InvalidAvcPacket.into());
        }
        let num_pps = data.get_u8() as usize;
        let mut pps = Vec::with_capacity(num_pps);
        for _ in 0..num_pps {
            if data.len() < 2 {
                return Err(MediaError::InvalidAvcPacket.into());
            }
            let len = data.get_u16() as usize;
            if data.len() < len {
                return Err(MediaError::InvalidAvcPacket.into());
            }
            pps.push(data.copy_to_bytes(len));
        }

        Ok(AvcConfig { profile, compatibility, level, nalu_length_size, sps, pps })
    }

    pub fn profile_name(&self) -> &'static str {
        match self.profile {
            66 => "Baseline",
            77 => "Main",
            88 => "Extended",
            100 => "High",
            110 => "High 10",
            _ => "Unknown",
        }
    }
}

/// Scan AVCC-framed NAL units for an IDR slice
pub fn contains_idr(data: &[u8], nalu_length_size: usize) -> bool {
    let mut offset = 0;
    while offset + nalu_length_size < data.len() {
        let mut len: usize = 0;
        for i in 0..nalu_length_size {
            len = (len << 8) | data[offset + i] as usize;
        }
        offset += nalu_length_size;
        if offset >= data.len() {
            break;
        }
        if NaluType::from_byte(data[offset]) == Some(NaluType::Idr) {
            return true;
        }
        offset += len;
    }
    false
}
