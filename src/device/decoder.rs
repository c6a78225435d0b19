use crate::device::types::HeartRateSample;

const FLAG_VALUE_FORMAT_U16: u8 = 0x01;

/// Extracts the beats-per-minute field from a Heart Rate Measurement notification.
///
/// Only the value format bit of the flags byte is honoured. Sensor contact, energy expended and
/// RR-interval fields are never parsed, trailing bytes are ignored.
pub fn parse_heart_rate(payload: &[u8]) -> Option<u16> {
    let (flags, value) = payload.split_first()?;

    if flags & FLAG_VALUE_FORMAT_U16 != 0 {
        match value {
            [low, high, ..] => Some(u16::from_le_bytes([*low, *high])),
            _ => None,
        }
    }
    else {
        value.first().map(|bpm| u16::from(*bpm))
    }
}

pub fn decode_sample(payload: &[u8]) -> Option<HeartRateSample> {
    parse_heart_rate(payload).map(|bpm| HeartRateSample { bpm })
}
