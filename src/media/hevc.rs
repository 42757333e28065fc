//! H.265/HEVC codec configuration
//!
//! HEVC rides RTMP the same way AVC does: the sequence header carries an
//! HEVCDecoderConfigurationRecord, frames carry length-prefixed NAL
//! units. The HEVC NALU type lives in bits 1..6 of the first header byte.
//!
//! ```text
//! HEVCDecoderConfigurationRecord (ISO/IEC 14496-15):
//! configurationVersion (1) | profile fields (1+4) | level (1)
//! | 15 bytes of tier/level/constraint detail
//! | numOfArrays (1) | { arrayNalType (1, low 6 bits) | numNalus (2)
//!                       | { naluLength (2) | nalu }* }*
//! ```

use bytes::{Buf, Bytes};

use crate::error::{MediaError, Result};

/// HEVC NAL unit types this server cares about
pub const HEVC_NAL_VPS: u8 = 32;
pub const HEVC_NAL_SPS: u8 = 33;
pub const HEVC_NAL_PPS: u8 = 34;

/// IRAP range: BLA/IDR/CRA pictures, all valid decode entry points
const HEVC_NAL_IRAP_FIRST: u8 = 16;
const HEVC_NAL_IRAP_LAST: u8 = 21;

/// NALU type from the first header byte
pub fn nalu_type(b: u8) -> u8 {
    (b >> 1) & 0x3F
}

/// Whether the NALU is an intra random access point
pub fn is_irap(nal_type: u8) -> bool {
    (HEVC_NAL_IRAP_FIRST..=HEVC_NAL_IRAP_LAST).contains(&nal_type)
}

/// Decoder configuration from an HEVC sequence header
#[derive(Debug, Clone)]
pub struct HevcConfig {
    /// general_profile_idc
    pub profile: u8,
    /// general_level_idc
    pub level: u8,
    /// NALU length prefix size in bytes
    pub nalu_length_size: u8,
    pub vps: Vec<Bytes>,
    pub sps: Vec<Bytes>,
    pub pps: Vec<Bytes>,
}

impl HevcConfig {
    /// Parse an HEVCDecoderConfigurationRecord
    pub fn parse(mut data: Bytes) -> Result<Self> {
        if data.len() < 23 {
            return Err(MediaError::InvalidHevcPacket.into());
        }

        let version = data.get_u8();
        if version != 1 {
            return Err(MediaError::InvalidHevcPacket.into());
        }

        let profile = data.get_u8() & 0x1F;
        let _profile_compatibility = data.get_u32();
        // 6 bytes constraint flags, then general_level_idc
        data.advance(6);
        let level = data.get_u8();
        // min_spatial_segmentation, parallelism, chroma, bit depths,
        // frame rate fields
        data.advance(8);
        let nalu_length_size = (data.get_u8() & 0x03) + 1;

        let num_arrays = data.get_u8() as usize;
        let mut vps = Vec::new();
        let mut sps = Vec::new();
        let mut pps = Vec::new();

        for _ in 0..num_arrays {
            if data.len() < 3 {
                return Err(MediaError::InvalidHevcPacket.into());
            }
            let array_type = data.get_u8() & 0x3F;
            let num_nalus = data.get_u16() as usize;

            for _ in 0..num_nalus {
                if data.len() < 2 {
                    return Err(MediaError::InvalidHevcPacket.into());
                }
                let len = data.get_u16() as usize;
                if data.len() < len {
                    return Err(MediaError::InvalidHevcPacket.into());
                }
                let nalu = data.copy_to_bytes(len);
                match array_type {
                    HEVC_NAL_VPS => vps.push(nalu),
                    HEVC_NAL_SPS => sps.push(nalu),
                    HEVC_NAL_PPS => pps.push(nalu),
                    _ => {}
                }
            }
        }

        if sps.is_empty() || pps.is_empty() {
            return Err(MediaError::InvalidHevcPacket.into());
        }

        Ok(HevcConfig { profile, level, nalu_length_size, vps, sps, pps })
    }
}

/// Scan length-prefixed HEVC NAL units for an IRAP picture
pub fn contains_irap(data: &[u8], nalu_length_size: usize) -> bool {
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
        if is_irap(nalu_type(data[offset])) {
            return true;
        }
        offset += len;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};

    fn sample_record() -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(1); // version
        buf.put_u8(0x01); // profile space/tier/profile idc (Main)
        buf.put_u32(0x6000_0000); // profile compatibility
        buf.put_slice(&[0x90, 0, 0, 0, 0, 0]); // constraint flags
        buf.put_u8(93); // level 3.1
        buf.put_slice(&[0xF0, 0, 0xFC, 0xFD, 0xF8, 0xF8, 0, 0]); // misc fields
        buf.put_u8(0xFF); // length size minus one = 3
        buf.put_u8(3); // three arrays

        for (nal_type, payload) in [
            (HEVC_NAL_VPS, &[0x40, 0x01, 0x0C][..]),
            (HEVC_NAL_SPS, &[0x42, 0x01, 0x01, 0x01][..]),
            (HEVC_NAL_PPS, &[0x44, 0x01, 0xC0][..]),
        ] {
            buf.put_u8(nal_type);
            buf.put_u16(1);
            buf.put_u16(payload.len() as u16);
            buf.put_slice(payload);
        }

        buf.freeze()
    }

    #[test]
    fn test_hevc_config_parse() {
        let config = HevcConfig::parse(sample_record()).unwrap();
        assert_eq!(config.profile, 1);
        assert_eq!(config.level, 93);
        assert_eq!(config.nalu_length_size, 4);
        assert_eq!(config.vps.len(), 1);
        assert_eq!(config.sps.len(), 1);
        assert_eq!(config.pps.len(), 1);
    }

    #[test]
    fn test_truncated_record_fails() {
        let data = sample_record().slice(..10);
        assert!(HevcConfig::parse(data).is_err());
    }

    #[test]
    fn test_nalu_type_extraction() {
        // IDR_W_RADL = 19 → header byte 0x26
        assert_eq!(nalu_type(0x26), 19);
        assert!(is_irap(19));
        // TRAIL_R = 1 → header byte 0x02
        assert_eq!(nalu_type(0x02), 1);
        assert!(!is_irap(1));
        assert_eq!(nalu_type(0x40), HEVC_NAL_VPS);
    }

    #[test]
    fn test_contains_irap() {
        let data = [
            0x00, 0x00, 0x00, 0x02, 0x02, 0x01, // TRAIL_R
            0x00, 0x00, 0x00, 0x02, 0x26, 0x01, // IDR_W_RADL
        ];
        assert!(contains_irap(&data, 4));

        let data = [0x00, 0x00, 0x00, 0x02, 0x02, 0x01];
        assert!(!contains_irap(&data, 4));
    }
}
