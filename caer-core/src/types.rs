//! Core types for decoded event data and device descriptors.
//!
//! This module defines the typed events produced by the decoders, the event
//! type tags carried in sub-packet headers, and the static device information
//! the decoders need for geometry checks.

use std::fmt;
use std::ops::Index;

/// Event type tag of a sub-packet.
///
/// Only the kinds this crate decodes get their own variant; every other tag
/// (IMU9, config, point events, future kinds) is bucketed as [`EventType::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventType {
    /// Device status and protocol markers (code 0)
    Special,
    /// DVS polarity change events (code 1)
    Polarity,
    /// APS intensity frames (code 2)
    Frame,
    /// 6-axis inertial measurement plus temperature (code 3)
    Imu6,
    /// Dynap-se neuron spikes (code 12)
    Spike,
    /// Any other or unknown tag
    Other,
}

impl EventType {
    /// Maps a raw header type code to an event type.
    #[inline]
    pub fn from_code(code: i16) -> Self {
        match code {
            0 => Self::Special,
            1 => Self::Polarity,
            2 => Self::Frame,
            3 => Self::Imu6,
            12 => Self::Spike,
            _ => Self::Other,
        }
    }

    /// Returns the raw header code, or `None` for [`EventType::Other`].
    pub fn code(&self) -> Option<i16> {
        match self {
            Self::Special => Some(0),
            Self::Polarity => Some(1),
            Self::Frame => Some(2),
            Self::Imu6 => Some(3),
            Self::Spike => Some(12),
            Self::Other => None,
        }
    }

    /// Smallest valid record stride in bytes for this event type.
    ///
    /// Frames need at least their fixed part; the pixel area is checked per
    /// record once the lengths are known.
    pub fn min_record_size(&self) -> Option<usize> {
        match self {
            Self::Special | Self::Polarity | Self::Spike => Some(8),
            Self::Frame | Self::Imu6 => Some(36),
            Self::Other => None,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Special => "special",
            Self::Polarity => "polarity",
            Self::Frame => "frame",
            Self::Imu6 => "imu6",
            Self::Spike => "spike",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}

/// A decoded DVS polarity event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolarityEvent {
    /// Timestamp in device clock ticks (microseconds)
    pub timestamp: i32,
    /// X coordinate, below the DVS width
    pub x: u16,
    /// Y coordinate, below the DVS height
    pub y: u16,
    /// `true` = ON (brightness increase), `false` = OFF
    pub polarity: bool,
}

impl PolarityEvent {
    /// Creates a new polarity event.
    #[inline]
    pub fn new(timestamp: i32, x: u16, y: u16, polarity: bool) -> Self {
        Self {
            timestamp,
            x,
            y,
            polarity,
        }
    }
}

/// A device status marker multiplexed into the event stream.
///
/// `kind` and `data` are passed through exactly as the device produced them;
/// use [`SpecialEventKind::from_u8`] to classify the code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialEvent {
    pub timestamp: i32,
    /// Device-defined status code (7 bits)
    pub kind: u8,
    /// Auxiliary payload (24 bits)
    pub data: u32,
}

impl SpecialEvent {
    #[inline]
    pub fn new(timestamp: i32, kind: u8, data: u32) -> Self {
        Self {
            timestamp,
            kind,
            data,
        }
    }
}

/// Known special event codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SpecialEventKind {
    TimestampWrap = 0,
    TimestampReset = 1,
    ExternalInputRisingEdge = 2,
    ExternalInputFallingEdge = 3,
    ExternalInputPulse = 4,
    DvsRowOnly = 5,
    ExternalInput1RisingEdge = 6,
    ExternalInput1FallingEdge = 7,
    ExternalInput1Pulse = 8,
    ExternalInput2RisingEdge = 9,
    ExternalInput2FallingEdge = 10,
    ExternalInput2Pulse = 11,
    ExternalGeneratorRisingEdge = 12,
    ExternalGeneratorFallingEdge = 13,
    ApsFrameStart = 14,
    ApsFrameEnd = 15,
    ApsExposureStart = 16,
    ApsExposureEnd = 17,
}

impl SpecialEventKind {
    /// Attempts to classify a raw special event code.
    pub fn from_u8(value: u8) -> Option<Self> {
        use SpecialEventKind::*;
        const KINDS: [SpecialEventKind; 18] = [
            TimestampWrap,
            TimestampReset,
            ExternalInputRisingEdge,
            ExternalInputFallingEdge,
            ExternalInputPulse,
            DvsRowOnly,
            ExternalInput1RisingEdge,
            ExternalInput1FallingEdge,
            ExternalInput1Pulse,
            ExternalInput2RisingEdge,
            ExternalInput2FallingEdge,
            ExternalInput2Pulse,
            ExternalGeneratorRisingEdge,
            ExternalGeneratorFallingEdge,
            ApsFrameStart,
            ApsFrameEnd,
            ApsExposureStart,
            ApsExposureEnd,
        ];
        KINDS.get(value as usize).copied()
    }
}

/// Row-major 16-bit intensity matrix, indexed `[y][x]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMatrix {
    width: usize,
    height: usize,
    pixels: Vec<u16>,
}

impl FrameMatrix {
    /// Creates a zero-filled matrix.
    pub fn zeros(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; width * height],
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Returns the pixel at column `x`, row `y`.
    #[inline]
    pub fn get(&self, x: usize, y: usize) -> Option<u16> {
        if x < self.width && y < self.height {
            Some(self.pixels[y * self.width + x])
        } else {
            None
        }
    }

    #[inline]
    pub(crate) fn set(&mut self, x: usize, y: usize, value: u16) {
        self.pixels[y * self.width + x] = value;
    }

    /// Iterates over rows, top to bottom.
    pub fn rows(&self) -> impl Iterator<Item = &[u16]> {
        // chunks_exact panics on a zero chunk size
        self.pixels.chunks_exact(self.width.max(1)).take(self.height)
    }

    /// Flat row-major pixel buffer.
    pub fn as_slice(&self) -> &[u16] {
        &self.pixels
    }

    pub fn into_vec(self) -> Vec<u16> {
        self.pixels
    }
}

impl Index<usize> for FrameMatrix {
    type Output = [u16];

    /// Returns row `y`.
    fn index(&self, y: usize) -> &[u16] {
        let start = y * self.width;
        &self.pixels[start..start + self.width]
    }
}

/// A decoded APS frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameEvent {
    /// Middle of the exposure
    pub timestamp: i32,
    pub ts_start_of_frame: i32,
    pub ts_end_of_frame: i32,
    pub ts_start_of_exposure: i32,
    pub ts_end_of_exposure: i32,
    /// Captured width (may be a region of interest)
    pub length_x: u32,
    /// Captured height (may be a region of interest)
    pub length_y: u32,
    /// Region of interest origin on the sensor
    pub position_x: i32,
    pub position_y: i32,
    /// Colour channels per pixel in the raw record (1 for grayscale)
    pub channels: u8,
    /// Region of interest identifier
    pub roi_id: u8,
    /// Intensities, first channel only
    pub pixels: FrameMatrix,
}

/// A decoded 6-axis IMU sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Imu6Event {
    pub timestamp: i32,
    /// Acceleration X/Y/Z in g
    pub accel: [f32; 3],
    /// Angular velocity X/Y/Z in deg/s
    pub gyro: [f32; 3],
    /// Temperature in deg C
    pub temperature: f32,
}

/// A decoded Dynap-se spike.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpikeEvent {
    pub timestamp: i32,
    pub neuron_id: u32,
    pub source_core_id: u8,
    pub chip_id: u8,
}

/// Device families handled by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Dvs128,
    Davis,
    Dynapse,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dvs128 => f.write_str("DVS128"),
            Self::Davis => f.write_str("DAVIS"),
            Self::Dynapse => f.write_str("Dynap-se"),
        }
    }
}

/// Pixel array size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Geometry {
    pub width: u16,
    pub height: u16,
}

impl Geometry {
    pub fn new(width: u16, height: u16) -> Self {
        Self { width, height }
    }

    /// `true` when the geometry has no pixels (unknown or not applicable).
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    #[inline]
    pub fn contains(&self, x: u16, y: u16) -> bool {
        x < self.width && y < self.height
    }
}

/// Static device information, fetched once when the device is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub kind: DeviceKind,
    pub device_id: u16,
    pub serial_number: String,
    pub is_master: bool,
    /// Human readable identification string
    pub device_string: String,
    /// DVS pixel array (empty for Dynap-se)
    pub dvs: Geometry,
    /// APS pixel array, DAVIS only
    pub aps: Option<Geometry>,
    pub logic_version: i16,
}

impl DeviceDescriptor {
    /// Descriptor for a DVS128 camera.
    pub fn dvs128(device_id: u16, serial_number: impl Into<String>) -> Self {
        Self {
            kind: DeviceKind::Dvs128,
            device_id,
            serial_number: serial_number.into(),
            is_master: true,
            device_string: "DVS128".to_string(),
            dvs: Geometry::new(128, 128),
            aps: None,
            logic_version: 0,
        }
    }

    /// Descriptor for a DAVIS camera whose DVS and APS arrays share a size.
    pub fn davis(device_id: u16, serial_number: impl Into<String>, geometry: Geometry) -> Self {
        Self {
            kind: DeviceKind::Davis,
            device_id,
            serial_number: serial_number.into(),
            is_master: true,
            device_string: format!("DAVIS{}", geometry.width),
            dvs: geometry,
            aps: Some(geometry),
            logic_version: 0,
        }
    }

    /// Descriptor for a Dynap-se board.
    pub fn dynapse(device_id: u16, serial_number: impl Into<String>, logic_version: i16) -> Self {
        Self {
            kind: DeviceKind::Dynapse,
            device_id,
            serial_number: serial_number.into(),
            is_master: true,
            device_string: "Dynap-se".to_string(),
            dvs: Geometry::default(),
            aps: None,
            logic_version,
        }
    }
}

/// Per-tick decoded output of the acquisition loop.
///
/// Every batch is bounded to one container; accumulating across ticks is up
/// to the caller.
#[derive(Debug, Clone, Default)]
pub struct EventBatches {
    pub polarity: Vec<PolarityEvent>,
    pub frames: Vec<FrameEvent>,
    pub imu6: Vec<Imu6Event>,
    pub special: Vec<SpecialEvent>,
    pub spikes: Vec<SpikeEvent>,
    /// Sub-packets dropped while decoding this tick
    pub rejected: Vec<crate::decoder::DecodeError>,
}

impl EventBatches {
    /// `true` when no events of any kind were decoded.
    pub fn is_empty(&self) -> bool {
        self.polarity.is_empty()
            && self.frames.is_empty()
            && self.imu6.is_empty()
            && self.special.is_empty()
            && self.spikes.is_empty()
    }

    /// Total number of decoded events across all kinds.
    pub fn event_count(&self) -> usize {
        self.polarity.len()
            + self.frames.len()
            + self.imu6.len()
            + self.special.len()
            + self.spikes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_codes() {
        assert_eq!(EventType::from_code(0), EventType::Special);
        assert_eq!(EventType::from_code(1), EventType::Polarity);
        assert_eq!(EventType::from_code(2), EventType::Frame);
        assert_eq!(EventType::from_code(3), EventType::Imu6);
        assert_eq!(EventType::from_code(12), EventType::Spike);
        assert_eq!(EventType::from_code(4), EventType::Other); // IMU9
        assert_eq!(EventType::from_code(-1), EventType::Other);
        assert_eq!(EventType::Spike.code(), Some(12));
        assert_eq!(EventType::Other.code(), None);
    }

    #[test]
    fn test_special_kind_classification() {
        assert_eq!(
            SpecialEventKind::from_u8(0),
            Some(SpecialEventKind::TimestampWrap)
        );
        assert_eq!(
            SpecialEventKind::from_u8(1),
            Some(SpecialEventKind::TimestampReset)
        );
        assert_eq!(
            SpecialEventKind::from_u8(17),
            Some(SpecialEventKind::ApsExposureEnd)
        );
        assert_eq!(SpecialEventKind::from_u8(18), None);
    }

    #[test]
    fn test_frame_matrix_indexing() {
        let mut m = FrameMatrix::zeros(3, 2);
        m.set(2, 1, 7);
        assert_eq!(m[1][2], 7);
        assert_eq!(m.get(2, 1), Some(7));
        assert_eq!(m.get(3, 0), None);
        assert_eq!(m.rows().count(), 2);
        assert_eq!(m[0], [0, 0, 0]);
    }

    #[test]
    fn test_empty_frame_matrix_rows() {
        let m = FrameMatrix::zeros(0, 0);
        assert_eq!(m.rows().count(), 0);
    }

    #[test]
    fn test_geometry_contains() {
        let g = Geometry::new(346, 260);
        assert!(g.contains(345, 259));
        assert!(!g.contains(346, 0));
        assert!(!g.contains(0, 260));
        assert!(Geometry::default().is_empty());
    }
}
