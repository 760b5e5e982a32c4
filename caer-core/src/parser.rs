//! Low-level field extraction for event packet headers and records.
//!
//! All multi-byte fields are little-endian. Callers are responsible for
//! passing slices that are long enough; the demultiplexer checks lengths
//! before any of these are used.

use byteorder::{ByteOrder, LittleEndian};

// ============================================================================
// Sub-packet header (28 bytes)
// [0] i16 type | [2] i16 source | [4] i32 size | [8] i32 ts offset
// [12] i32 ts overflow | [16] i32 capacity | [20] i32 number | [24] i32 valid
// ============================================================================

/// Size of a sub-packet header in bytes.
pub const HEADER_SIZE: usize = 28;

#[inline]
pub fn header_event_type(header: &[u8]) -> i16 {
    LittleEndian::read_i16(&header[0..2])
}

#[inline]
pub fn header_event_source(header: &[u8]) -> i16 {
    LittleEndian::read_i16(&header[2..4])
}

#[inline]
pub fn header_event_size(header: &[u8]) -> i32 {
    LittleEndian::read_i32(&header[4..8])
}

#[inline]
pub fn header_ts_offset(header: &[u8]) -> i32 {
    LittleEndian::read_i32(&header[8..12])
}

#[inline]
pub fn header_ts_overflow(header: &[u8]) -> i32 {
    LittleEndian::read_i32(&header[12..16])
}

#[inline]
pub fn header_event_capacity(header: &[u8]) -> i32 {
    LittleEndian::read_i32(&header[16..20])
}

#[inline]
pub fn header_event_number(header: &[u8]) -> i32 {
    LittleEndian::read_i32(&header[20..24])
}

#[inline]
pub fn header_event_valid(header: &[u8]) -> i32 {
    LittleEndian::read_i32(&header[24..28])
}

// ============================================================================
// Common 8-byte records: [0] u32 data | [4] i32 timestamp
// ============================================================================

/// Reads the 32-bit data word of an 8-byte record.
#[inline]
pub fn record_data(record: &[u8]) -> u32 {
    LittleEndian::read_u32(&record[0..4])
}

/// Reads the timestamp that follows the first data/info word of a record.
#[inline]
pub fn record_timestamp(record: &[u8]) -> i32 {
    LittleEndian::read_i32(&record[4..8])
}

/// Extracts the validity mark (bit 0), shared by every record kind.
#[inline]
pub fn get_valid(data: u32) -> bool {
    data & 0x1 != 0
}

// ============================================================================
// POLARITY
// Bits: [31:17] x | [16:2] y | [1] polarity | [0] valid
// ============================================================================

#[inline]
pub fn polarity_get_polarity(data: u32) -> bool {
    (data >> 1) & 0x1 != 0
}

#[inline]
pub fn polarity_get_y(data: u32) -> u16 {
    ((data >> 2) & 0x7FFF) as u16
}

#[inline]
pub fn polarity_get_x(data: u32) -> u16 {
    ((data >> 17) & 0x7FFF) as u16
}

/// Packs polarity fields into a data word, marked valid.
#[inline]
pub fn polarity_pack(x: u16, y: u16, polarity: bool) -> u32 {
    ((x as u32 & 0x7FFF) << 17) | ((y as u32 & 0x7FFF) << 2) | ((polarity as u32) << 1) | 0x1
}

// ============================================================================
// SPECIAL
// Bits: [31:8] data | [7:1] type | [0] valid
// ============================================================================

#[inline]
pub fn special_get_type(data: u32) -> u8 {
    ((data >> 1) & 0x7F) as u8
}

#[inline]
pub fn special_get_data(data: u32) -> u32 {
    (data >> 8) & 0x00FF_FFFF
}

#[inline]
pub fn special_pack(kind: u8, payload: u32) -> u32 {
    ((payload & 0x00FF_FFFF) << 8) | ((kind as u32 & 0x7F) << 1) | 0x1
}

// ============================================================================
// SPIKE
// Bits: [31:12] neuron id | [11:6] chip id | [5:1] source core id | [0] valid
// ============================================================================

#[inline]
pub fn spike_get_source_core_id(data: u32) -> u8 {
    ((data >> 1) & 0x1F) as u8
}

#[inline]
pub fn spike_get_chip_id(data: u32) -> u8 {
    ((data >> 6) & 0x3F) as u8
}

#[inline]
pub fn spike_get_neuron_id(data: u32) -> u32 {
    (data >> 12) & 0x000F_FFFF
}

#[inline]
pub fn spike_pack(neuron_id: u32, source_core_id: u8, chip_id: u8) -> u32 {
    ((neuron_id & 0x000F_FFFF) << 12)
        | ((chip_id as u32 & 0x3F) << 6)
        | ((source_core_id as u32 & 0x1F) << 1)
        | 0x1
}

// ============================================================================
// IMU6 (36 bytes)
// [0] u32 info | [4] i32 ts | [8..20] f32 accel xyz | [20..32] f32 gyro xyz
// [32] f32 temperature
// ============================================================================

pub const IMU6_ACCEL_OFFSET: usize = 8;
pub const IMU6_GYRO_OFFSET: usize = 20;
pub const IMU6_TEMP_OFFSET: usize = 32;

#[inline]
pub fn read_f32_triplet(record: &[u8], offset: usize) -> [f32; 3] {
    [
        LittleEndian::read_f32(&record[offset..offset + 4]),
        LittleEndian::read_f32(&record[offset + 4..offset + 8]),
        LittleEndian::read_f32(&record[offset + 8..offset + 12]),
    ]
}

#[inline]
pub fn imu6_get_temperature(record: &[u8]) -> f32 {
    LittleEndian::read_f32(&record[IMU6_TEMP_OFFSET..IMU6_TEMP_OFFSET + 4])
}

// ============================================================================
// FRAME (36 bytes fixed part, then u16 pixel samples)
// [0] u32 info | [4] ts start frame | [8] ts end frame | [12] ts start exp
// [16] ts end exp | [20] lengthX | [24] lengthY | [28] positionX | [32] positionY
// info bits: [14:8] roi id | [7:4] colour filter | [3:1] channels | [0] valid
// ============================================================================

pub const FRAME_FIXED_SIZE: usize = 36;

#[inline]
pub fn frame_get_channels(info: u32) -> u8 {
    ((info >> 1) & 0x7) as u8
}

#[inline]
pub fn frame_get_color_filter(info: u32) -> u8 {
    ((info >> 4) & 0xF) as u8
}

#[inline]
pub fn frame_get_roi_id(info: u32) -> u8 {
    ((info >> 8) & 0x7F) as u8
}

#[inline]
pub fn frame_pack_info(channels: u8, roi_id: u8) -> u32 {
    ((roi_id as u32 & 0x7F) << 8) | ((channels as u32 & 0x7) << 1) | 0x1
}

/// Reads the i32 at `offset` inside a frame's fixed part.
#[inline]
pub fn frame_field(record: &[u8], offset: usize) -> i32 {
    LittleEndian::read_i32(&record[offset..offset + 4])
}

pub const FRAME_TS_START_FRAME: usize = 4;
pub const FRAME_TS_END_FRAME: usize = 8;
pub const FRAME_TS_START_EXPOSURE: usize = 12;
pub const FRAME_TS_END_EXPOSURE: usize = 16;
pub const FRAME_LENGTH_X: usize = 20;
pub const FRAME_LENGTH_Y: usize = 24;
pub const FRAME_POSITION_X: usize = 28;
pub const FRAME_POSITION_Y: usize = 32;

/// Reads the pixel sample with flat index `index` from a frame record.
#[inline]
pub fn frame_sample(record: &[u8], index: usize) -> u16 {
    let offset = FRAME_FIXED_SIZE + index * 2;
    LittleEndian::read_u16(&record[offset..offset + 2])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_polarity_parsing() {
        // x=300, y=200, pol=1, valid=1
        let data: u32 = (300 << 17) | (200 << 2) | 0b11;
        assert!(get_valid(data));
        assert_eq!(polarity_get_x(data), 300);
        assert_eq!(polarity_get_y(data), 200);
        assert!(polarity_get_polarity(data));
        assert_eq!(polarity_pack(300, 200, true), data);
    }

    #[test]
    fn test_special_parsing() {
        // data=0xABCDEF, type=1 (timestamp reset), valid
        let data: u32 = (0xABCDEF << 8) | (1 << 1) | 1;
        assert_eq!(special_get_type(data), 1);
        assert_eq!(special_get_data(data), 0xABCDEF);
    }

    #[test]
    fn test_spike_parsing() {
        let data = spike_pack(1023, 3, 2);
        assert_eq!(spike_get_neuron_id(data), 1023);
        assert_eq!(spike_get_source_core_id(data), 3);
        assert_eq!(spike_get_chip_id(data), 2);
    }

    #[test]
    fn test_frame_info_parsing() {
        let info = frame_pack_info(3, 5);
        assert!(get_valid(info));
        assert_eq!(frame_get_channels(info), 3);
        assert_eq!(frame_get_roi_id(info), 5);
        assert_eq!(frame_get_color_filter(info), 0);
    }

    #[test]
    fn test_header_fields() {
        let mut header = [0u8; HEADER_SIZE];
        header[0..2].copy_from_slice(&1i16.to_le_bytes());
        header[4..8].copy_from_slice(&8i32.to_le_bytes());
        header[12..16].copy_from_slice(&2i32.to_le_bytes());
        header[20..24].copy_from_slice(&5i32.to_le_bytes());
        assert_eq!(header_event_type(&header), 1);
        assert_eq!(header_event_size(&header), 8);
        assert_eq!(header_ts_overflow(&header), 2);
        assert_eq!(header_event_number(&header), 5);
        assert_eq!(header_event_valid(&header), 0);
    }
}
