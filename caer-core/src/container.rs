//! Event packet containers and raw sub-packets.
//!
//! A container is what one blocking device read hands back: an ordered list
//! of sub-packet slots, any of which may be empty. Each sub-packet is kept as
//! its raw bytes (28-byte header followed by fixed-stride records) until the
//! demultiplexer validates it.

use crate::parser::{self, HEADER_SIZE};
use crate::types::{EventType, FrameEvent, Imu6Event, PolarityEvent, SpecialEvent, SpikeEvent};

/// Parsed sub-packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubPacketHeader {
    pub event_type: EventType,
    /// Raw type code, kept for event types bucketed as `Other`
    pub type_code: i16,
    pub event_source: i16,
    /// Record stride in bytes
    pub event_size: i32,
    pub ts_offset: i32,
    /// Number of 31-bit timestamp wraps before this packet
    pub ts_overflow: i32,
    pub event_capacity: i32,
    /// Declared number of records
    pub event_count: i32,
    pub event_valid: i32,
}

impl SubPacketHeader {
    /// Parses a header from the start of `bytes`.
    ///
    /// Returns `None` when fewer than [`HEADER_SIZE`] bytes are available.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_SIZE {
            return None;
        }
        let type_code = parser::header_event_type(bytes);
        Some(Self {
            event_type: EventType::from_code(type_code),
            type_code,
            event_source: parser::header_event_source(bytes),
            event_size: parser::header_event_size(bytes),
            ts_offset: parser::header_ts_offset(bytes),
            ts_overflow: parser::header_ts_overflow(bytes),
            event_capacity: parser::header_event_capacity(bytes),
            event_count: parser::header_event_number(bytes),
            event_valid: parser::header_event_valid(bytes),
        })
    }

    /// Appends the 28-byte encoding of this header to `out`.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.type_code.to_le_bytes());
        out.extend_from_slice(&self.event_source.to_le_bytes());
        out.extend_from_slice(&self.event_size.to_le_bytes());
        out.extend_from_slice(&self.ts_offset.to_le_bytes());
        out.extend_from_slice(&self.ts_overflow.to_le_bytes());
        out.extend_from_slice(&self.event_capacity.to_le_bytes());
        out.extend_from_slice(&self.event_count.to_le_bytes());
        out.extend_from_slice(&self.event_valid.to_le_bytes());
    }

    /// Extends a 32-bit event timestamp with this packet's overflow counter.
    #[inline]
    pub fn timestamp64(&self, timestamp: i32) -> i64 {
        ((self.ts_overflow as i64) << 31) | (timestamp as i64 & 0x7FFF_FFFF)
    }
}

/// One sub-packet as raw bytes: header followed by payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSubPacket {
    bytes: Vec<u8>,
}

impl RawSubPacket {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Parses the header, if the packet is long enough to hold one.
    pub fn header(&self) -> Option<SubPacketHeader> {
        SubPacketHeader::parse(&self.bytes)
    }

    /// Record area following the header.
    pub fn payload(&self) -> &[u8] {
        self.bytes.get(HEADER_SIZE..).unwrap_or(&[])
    }

    /// Starts building a sub-packet of `event_type` with the minimum stride.
    ///
    /// `Other` has no code or stride of its own; use
    /// [`SubPacketBuilder::with_code`] for those.
    pub fn builder(event_type: EventType) -> SubPacketBuilder {
        let code = event_type.code().unwrap_or(-1);
        let size = event_type.min_record_size().unwrap_or(0);
        SubPacketBuilder::with_code(code, size)
    }
}

/// Encoder for sub-packets, used by recorders and synthetic sources.
#[derive(Debug, Clone)]
pub struct SubPacketBuilder {
    header: SubPacketHeader,
    payload: Vec<u8>,
    count_override: Option<i32>,
}

impl SubPacketBuilder {
    /// Builder for an arbitrary type code and record stride.
    pub fn with_code(type_code: i16, event_size: usize) -> Self {
        Self {
            header: SubPacketHeader {
                event_type: EventType::from_code(type_code),
                type_code,
                event_source: 1,
                event_size: event_size as i32,
                ts_offset: 4,
                ts_overflow: 0,
                event_capacity: 0,
                event_count: 0,
                event_valid: 0,
            },
            payload: Vec::new(),
            count_override: None,
        }
    }

    pub fn source(mut self, source: i16) -> Self {
        self.header.event_source = source;
        self
    }

    pub fn ts_overflow(mut self, overflow: i32) -> Self {
        self.header.ts_overflow = overflow;
        self
    }

    /// Declares a count different from the number of pushed records.
    pub fn declared_count(mut self, count: i32) -> Self {
        self.count_override = Some(count);
        self
    }

    /// Appends one raw record, zero-padded to the stride.
    pub fn push_record(&mut self, record: &[u8]) -> &mut Self {
        let stride = self.header.event_size.max(0) as usize;
        let start = self.payload.len();
        self.payload.extend_from_slice(record);
        self.payload.resize(start + stride.max(record.len()), 0);
        self.header.event_count += 1;
        self.header.event_valid += 1;
        self
    }

    pub fn push_polarity(&mut self, event: &PolarityEvent) -> &mut Self {
        let data = parser::polarity_pack(event.x, event.y, event.polarity);
        self.push_data_record(data, event.timestamp)
    }

    pub fn push_special(&mut self, event: &SpecialEvent) -> &mut Self {
        let data = parser::special_pack(event.kind, event.data);
        self.push_data_record(data, event.timestamp)
    }

    pub fn push_spike(&mut self, event: &SpikeEvent) -> &mut Self {
        let data = parser::spike_pack(event.neuron_id, event.source_core_id, event.chip_id);
        self.push_data_record(data, event.timestamp)
    }

    pub fn push_imu6(&mut self, event: &Imu6Event) -> &mut Self {
        let mut record = Vec::with_capacity(36);
        record.extend_from_slice(&1u32.to_le_bytes());
        record.extend_from_slice(&event.timestamp.to_le_bytes());
        for value in event.accel.iter().chain(&event.gyro) {
            record.extend_from_slice(&value.to_le_bytes());
        }
        record.extend_from_slice(&event.temperature.to_le_bytes());
        self.push_record(&record)
    }

    /// Appends a grayscale frame record built from `frame`'s matrix.
    pub fn push_frame(&mut self, frame: &FrameEvent) -> &mut Self {
        let samples = frame.pixels.as_slice();
        self.push_frame_samples(frame, samples, 1)
    }

    /// Appends a frame record from raw samples (`channels` per pixel).
    pub fn push_frame_samples(
        &mut self,
        frame: &FrameEvent,
        samples: &[u16],
        channels: u8,
    ) -> &mut Self {
        let mut record = Vec::with_capacity(parser::FRAME_FIXED_SIZE + samples.len() * 2);
        record.extend_from_slice(&parser::frame_pack_info(channels, frame.roi_id).to_le_bytes());
        for value in [
            frame.ts_start_of_frame,
            frame.ts_end_of_frame,
            frame.ts_start_of_exposure,
            frame.ts_end_of_exposure,
            frame.length_x as i32,
            frame.length_y as i32,
            frame.position_x,
            frame.position_y,
        ] {
            record.extend_from_slice(&value.to_le_bytes());
        }
        for sample in samples {
            record.extend_from_slice(&sample.to_le_bytes());
        }
        // Frame packets use one stride for all records, sized by the largest.
        if record.len() > self.header.event_size as usize {
            self.restride(record.len());
        }
        self.push_record(&record)
    }

    fn push_data_record(&mut self, data: u32, timestamp: i32) -> &mut Self {
        let mut record = [0u8; 8];
        record[0..4].copy_from_slice(&data.to_le_bytes());
        record[4..8].copy_from_slice(&timestamp.to_le_bytes());
        self.push_record(&record)
    }

    fn restride(&mut self, new_size: usize) {
        let old_size = self.header.event_size.max(0) as usize;
        if old_size > 0 && !self.payload.is_empty() {
            let mut payload = Vec::with_capacity(self.payload.len() / old_size * new_size);
            for record in self.payload.chunks(old_size) {
                let start = payload.len();
                payload.extend_from_slice(record);
                payload.resize(start + new_size, 0);
            }
            self.payload = payload;
        }
        self.header.event_size = new_size as i32;
    }

    /// Finishes the sub-packet.
    pub fn build(&self) -> RawSubPacket {
        let mut header = self.header;
        header.event_capacity = header.event_count;
        if let Some(count) = self.count_override {
            header.event_count = count;
            header.event_valid = count;
        }
        let mut bytes = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        header.write_to(&mut bytes);
        bytes.extend_from_slice(&self.payload);
        RawSubPacket::from_bytes(bytes)
    }
}

/// Ordered sub-packet slots returned by one device read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventPacketContainer {
    packets: Vec<Option<RawSubPacket>>,
}

impl EventPacketContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, packet: RawSubPacket) {
        self.packets.push(Some(packet));
    }

    /// Appends an empty slot.
    pub fn push_empty(&mut self) {
        self.packets.push(None);
    }

    /// Number of slots, empty ones included.
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&RawSubPacket> {
        self.packets.get(index).and_then(Option::as_ref)
    }

    pub fn iter(&self) -> impl Iterator<Item = Option<&RawSubPacket>> {
        self.packets.iter().map(Option::as_ref)
    }

    /// Returns `true` if a populated slot already holds `type_code`.
    pub fn contains_code(&self, type_code: i16) -> bool {
        self.packets
            .iter()
            .flatten()
            .any(|p| p.header().map(|h| h.type_code) == Some(type_code))
    }
}

impl From<Vec<Option<RawSubPacket>>> for EventPacketContainer {
    fn from(packets: Vec<Option<RawSubPacket>>) -> Self {
        Self { packets }
    }
}

impl FromIterator<RawSubPacket> for EventPacketContainer {
    fn from_iter<I: IntoIterator<Item = RawSubPacket>>(iter: I) -> Self {
        Self {
            packets: iter.into_iter().map(Some).collect(),
        }
    }
}

impl IntoIterator for EventPacketContainer {
    type Item = Option<RawSubPacket>;
    type IntoIter = std::vec::IntoIter<Option<RawSubPacket>>;

    fn into_iter(self) -> Self::IntoIter {
        self.packets.into_iter()
    }
}
