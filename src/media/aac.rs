//! AAC codec configuration
//!
//! RTMP carries AAC raw (no ADTS); the sequence header holds an
//! AudioSpecificConfig:
//!
//! ```text
//! audioObjectType        5 bits
//! samplingFrequencyIndex 4 bits  (0xF ⇒ explicit 24-bit frequency)
//! channelConfiguration   4 bits
//! ```

use bytes::Bytes;

use crate::error::{MediaError, Result};

/// Standard sampling frequencies by index
const SAMPLING_FREQUENCIES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// Parsed AudioSpecificConfig
#[derive(Debug, Clone)]
pub struct AudioSpecificConfig {
    /// Audio object type (2 = AAC-LC, the common case)
    pub object_type: u8,
    pub sampling_frequency_index: u8,
    /// Sampling frequency in Hz
    pub sampling_frequency: u32,
    /// 1 = mono, 2 = stereo, ...
    pub channel_configuration: u8,
    /// Original config bytes, replayed verbatim to joiners
    pub raw: Bytes,
}

impl AudioSpecificConfig {
    /// Parse an AAC sequence header payload
    pub fn parse(data: Bytes) -> Result<Self> {
        if data.len() < 2 {
            return Err(MediaError::InvalidAacPacket.into());
        }

        let object_type = data[0] >> 3;
        let sampling_frequency_index = ((data[0] & 0x07) << 1) | (data[1] >> 7);
        let channel_configuration;
        let sampling_frequency;

        if sampling_frequency_index == 0x0F {
            // explicit 24-bit frequency follows
            if data.len() < 5 {
                return Err(MediaError::InvalidAacPacket.into());
            }
            sampling_frequency = ((data[1] as u32 & 0x7F) << 17)
                | ((data[2] as u32) << 9)
                | ((data[3] as u32) << 1)
                | (data[4] as u32 >> 7);
            channel_configuration = (data[4] >> 3) & 0x0F;
        } else {
            sampling_frequency = SAMPLING_FREQUENCIES
                .get(sampling_frequency_index as usize)
                .copied()
                .ok_or(MediaError::InvalidAacPacket)?;
            channel_configuration = (data[1] >> 3) & 0x0F;
        }

        Ok(AudioSpecificConfig {
            object_type,
            sampling_frequency_index,
            sampling_frequency,
            channel_configuration,
            raw: data,
        })
    }

    pub fn profile_name(&self) -> &'static str {
        match self.object_type {
            1 => "AAC Main",
            2 => "AAC LC",
            3 => "AAC SSR",
            4 => "AAC LTP",
            5 => "HE-AAC",
            _ => "AAC",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aac_lc_44100_stereo() {
        // 0x12 0x10: object type 2 (LC), freq index 4 (44100), 2 channels
        let config = AudioSpecificConfig::parse(Bytes::from_static(&[0x12, 0x10])).unwrap();
        assert_eq!(config.object_type, 2);
        assert_eq!(config.sampling_frequency, 44100);
        assert_eq!(config.channel_configuration, 2);
        assert_eq!(config.profile_name(), "AAC LC");
    }

    #[test]
    fn test_aac_lc_48000_stereo() {
        // 0x11 0x90: object type 2, freq index 3 (48000), 2 channels
        let config = AudioSpecificConfig::parse(Bytes::from_static(&[0x11, 0x90])).unwrap();
        assert_eq!(config.sampling_frequency, 48000);
        assert_eq!(config.channel_configuration, 2);
    }

    #[test]
    fn test_too_short_fails() {
        assert!(AudioSpecificConfig::parse(Bytes::from_static(&[0x12])).is_err());
    }

    #[test]
    fn test_invalid_frequency_index_fails() {
        // freq index 13 is reserved
        let data = Bytes::from_static(&[0x16, 0x90]);
        assert!(AudioSpecificConfig::parse(data).is_err());
    }
}
