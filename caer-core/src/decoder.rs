//! Typed sub-packet decoders.
//!
//! Every event kind is a fixed-stride record walk: the demultiplexer has
//! already checked that `event_count` records fit in the payload, so each
//! reader only extracts fields from one record. [`PacketDecoder`] dispatches
//! demultiplexed sub-packets to the matching reader and collects the results
//! into per-tick [`EventBatches`].

use crate::container::EventPacketContainer;
use crate::demux::{demux, Demultiplexed, TypedSubPacket};
use crate::parser;
use crate::types::{
    DeviceDescriptor, EventBatches, EventType, FrameEvent, FrameMatrix, Geometry, Imu6Event,
    PolarityEvent, SpecialEvent, SpikeEvent,
};
use log::{trace, warn};
use serde::Deserialize;
use thiserror::Error;

/// Errors that can occur while decoding a single sub-packet.
///
/// These are always local to one sub-packet; the acquisition loop drops the
/// offending batch and keeps going.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("sub-packet header truncated: {length} bytes, need 28")]
    TruncatedHeader { length: usize },

    #[error("malformed {event_type} sub-packet declaring {declared_count} events: {reason}")]
    MalformedPacket {
        event_type: EventType,
        declared_count: i32,
        reason: String,
    },
}

impl DecodeError {
    /// Event type of the failed sub-packet, when its header could be read.
    pub fn event_type(&self) -> Option<EventType> {
        match self {
            Self::TruncatedHeader { .. } => None,
            Self::MalformedPacket { event_type, .. } => Some(*event_type),
        }
    }
}

/// Which records of a frame sub-packet are decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FramePolicy {
    /// At most one frame per container: the first frame of the first frame
    /// sub-packet. Later frames and frame sub-packets are dropped.
    #[default]
    First,
    /// Every frame in the sub-packet
    All,
}

/// How decoded frame matrices are sized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FrameSizing {
    /// `length_y x length_x`, exactly what the record captured
    #[default]
    Record,
    /// Full APS array, region of interest placed at its position, the rest 0.
    /// Falls back to `Record` when the device has no APS geometry.
    SensorCanvas,
}

/// Decoder behaviour switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DecoderOptions {
    pub frame_policy: FramePolicy,
    pub frame_sizing: FrameSizing,
    /// Reject polarity sub-packets with coordinates outside the DVS array
    pub check_bounds: bool,
}

impl Default for DecoderOptions {
    fn default() -> Self {
        Self {
            frame_policy: FramePolicy::First,
            frame_sizing: FrameSizing::Record,
            check_bounds: true,
        }
    }
}

/// Extracts one event from one fixed-stride record.
trait RecordReader {
    type Event;

    const EVENT_TYPE: EventType;

    fn read(&self, record: &[u8]) -> Result<Self::Event, String>;
}

struct PolarityReader {
    bounds: Option<Geometry>,
}

impl RecordReader for PolarityReader {
    type Event = PolarityEvent;

    const EVENT_TYPE: EventType = EventType::Polarity;

    #[inline]
    fn read(&self, record: &[u8]) -> Result<PolarityEvent, String> {
        let data = parser::record_data(record);
        let x = parser::polarity_get_x(data);
        let y = parser::polarity_get_y(data);

        if let Some(bounds) = self.bounds {
            if !bounds.contains(x, y) {
                return Err(format!(
                    "x={} y={} outside the {}x{} DVS array",
                    x, y, bounds.width, bounds.height
                ));
            }
        }

        Ok(PolarityEvent::new(
            parser::record_timestamp(record),
            x,
            y,
            parser::polarity_get_polarity(data),
        ))
    }
}

struct SpecialReader;

impl RecordReader for SpecialReader {
    type Event = SpecialEvent;

    const EVENT_TYPE: EventType = EventType::Special;

    #[inline]
    fn read(&self, record: &[u8]) -> Result<SpecialEvent, String> {
        let data = parser::record_data(record);
        Ok(SpecialEvent::new(
            parser::record_timestamp(record),
            parser::special_get_type(data),
            parser::special_get_data(data),
        ))
    }
}

struct Imu6Reader;

impl RecordReader for Imu6Reader {
    type Event = Imu6Event;

    const EVENT_TYPE: EventType = EventType::Imu6;

    #[inline]
    fn read(&self, record: &[u8]) -> Result<Imu6Event, String> {
        Ok(Imu6Event {
            timestamp: parser::record_timestamp(record),
            accel: parser::read_f32_triplet(record, parser::IMU6_ACCEL_OFFSET),
            gyro: parser::read_f32_triplet(record, parser::IMU6_GYRO_OFFSET),
            temperature: parser::imu6_get_temperature(record),
        })
    }
}

struct SpikeReader;

impl RecordReader for SpikeReader {
    type Event = SpikeEvent;

    const EVENT_TYPE: EventType = EventType::Spike;

    #[inline]
    fn read(&self, record: &[u8]) -> Result<SpikeEvent, String> {
        let data = parser::record_data(record);
        Ok(SpikeEvent {
            timestamp: parser::record_timestamp(record),
            neuron_id: parser::spike_get_neuron_id(data),
            source_core_id: parser::spike_get_source_core_id(data),
            chip_id: parser::spike_get_chip_id(data),
        })
    }
}

struct FrameReader {
    canvas: Option<Geometry>,
}

impl RecordReader for FrameReader {
    type Event = FrameEvent;

    const EVENT_TYPE: EventType = EventType::Frame;

    fn read(&self, record: &[u8]) -> Result<FrameEvent, String> {
        let info = parser::record_data(record);
        let length_x = parser::frame_field(record, parser::FRAME_LENGTH_X);
        let length_y = parser::frame_field(record, parser::FRAME_LENGTH_Y);
        if length_x < 0 || length_y < 0 {
            return Err(format!("negative frame size {}x{}", length_x, length_y));
        }

        // Grayscale frames report one channel; treat a zero field the same way.
        let channels = parser::frame_get_channels(info).max(1);
        let (lx, ly) = (length_x as usize, length_y as usize);
        let available = (record.len() - parser::FRAME_FIXED_SIZE) / 2;
        let needed = lx
            .checked_mul(ly)
            .and_then(|n| n.checked_mul(channels as usize));
        if needed.map_or(true, |n| n > available) {
            return Err(format!(
                "{}x{} frame with {} channel(s) exceeds the {} samples in the record",
                lx, ly, channels, available
            ));
        }

        let position_x = parser::frame_field(record, parser::FRAME_POSITION_X);
        let position_y = parser::frame_field(record, parser::FRAME_POSITION_Y);

        let mut pixels = match self.canvas {
            Some(canvas) => FrameMatrix::zeros(canvas.width as usize, canvas.height as usize),
            None => FrameMatrix::zeros(lx, ly),
        };

        for y in 0..ly {
            for x in 0..lx {
                let sample = parser::frame_sample(record, (y * lx + x) * channels as usize);
                match self.canvas {
                    None => pixels.set(x, y, sample),
                    Some(canvas) => {
                        let cx = position_x as i64 + x as i64;
                        let cy = position_y as i64 + y as i64;
                        if (0..canvas.width as i64).contains(&cx)
                            && (0..canvas.height as i64).contains(&cy)
                        {
                            pixels.set(cx as usize, cy as usize, sample);
                        }
                    }
                }
            }
        }

        let ts_start_of_exposure = parser::frame_field(record, parser::FRAME_TS_START_EXPOSURE);
        let ts_end_of_exposure = parser::frame_field(record, parser::FRAME_TS_END_EXPOSURE);
        let timestamp = (ts_start_of_exposure as i64
            + (ts_end_of_exposure as i64 - ts_start_of_exposure as i64) / 2) as i32;

        Ok(FrameEvent {
            timestamp,
            ts_start_of_frame: parser::frame_field(record, parser::FRAME_TS_START_FRAME),
            ts_end_of_frame: parser::frame_field(record, parser::FRAME_TS_END_FRAME),
            ts_start_of_exposure,
            ts_end_of_exposure,
            length_x: lx as u32,
            length_y: ly as u32,
            position_x,
            position_y,
            channels,
            roi_id: parser::frame_get_roi_id(info),
            pixels,
        })
    }
}

/// Walks up to `limit` records of `packet`, preserving their order.
fn walk_records<R: RecordReader>(
    reader: &R,
    packet: &TypedSubPacket,
    limit: usize,
) -> Result<Vec<R::Event>, DecodeError> {
    if packet.event_type() != R::EVENT_TYPE {
        return Err(packet.malformed(format!("expected a {} sub-packet", R::EVENT_TYPE)));
    }

    let mut events = Vec::with_capacity(packet.event_count().min(limit));
    for (index, record) in packet.records().take(limit).enumerate() {
        let event = reader
            .read(record)
            .map_err(|reason| packet.malformed(format!("record {}: {}", index, reason)))?;
        events.push(event);
    }
    Ok(events)
}

/// Decodes demultiplexed sub-packets for one device.
#[derive(Debug, Clone)]
pub struct PacketDecoder {
    dvs: Geometry,
    aps: Option<Geometry>,
    options: DecoderOptions,
}

impl PacketDecoder {
    /// Creates a decoder using the geometry of `descriptor`.
    pub fn new(descriptor: &DeviceDescriptor, options: DecoderOptions) -> Self {
        Self {
            dvs: descriptor.dvs,
            aps: descriptor.aps,
            options,
        }
    }

    pub fn options(&self) -> &DecoderOptions {
        &self.options
    }

    /// Decodes every record of a polarity sub-packet.
    pub fn decode_polarity(
        &self,
        packet: &TypedSubPacket,
    ) -> Result<Vec<PolarityEvent>, DecodeError> {
        let bounds = (self.options.check_bounds && !self.dvs.is_empty()).then_some(self.dvs);
        walk_records(&PolarityReader { bounds }, packet, usize::MAX)
    }

    /// Decodes every record of a special sub-packet.
    pub fn decode_special(&self, packet: &TypedSubPacket) -> Result<Vec<SpecialEvent>, DecodeError> {
        walk_records(&SpecialReader, packet, usize::MAX)
    }

    /// Decodes every record of an IMU6 sub-packet.
    pub fn decode_imu6(&self, packet: &TypedSubPacket) -> Result<Vec<Imu6Event>, DecodeError> {
        walk_records(&Imu6Reader, packet, usize::MAX)
    }

    /// Decodes every record of a spike sub-packet.
    pub fn decode_spikes(&self, packet: &TypedSubPacket) -> Result<Vec<SpikeEvent>, DecodeError> {
        walk_records(&SpikeReader, packet, usize::MAX)
    }

    /// Decodes the frames of a frame sub-packet according to the frame policy.
    ///
    /// With [`FramePolicy::First`] at most one frame is returned;
    /// [`decode_demuxed`](Self::decode_demuxed) also skips any further frame
    /// sub-packets of the same container.
    pub fn decode_frames(&self, packet: &TypedSubPacket) -> Result<Vec<FrameEvent>, DecodeError> {
        let canvas = match self.options.frame_sizing {
            FrameSizing::Record => None,
            FrameSizing::SensorCanvas => self.aps.filter(|g| !g.is_empty()),
        };
        let limit = match self.options.frame_policy {
            FramePolicy::First => 1,
            FramePolicy::All => usize::MAX,
        };
        walk_records(&FrameReader { canvas }, packet, limit)
    }

    /// Dispatches every accepted sub-packet to its typed decoder.
    ///
    /// Failed sub-packets are logged and listed in
    /// [`EventBatches::rejected`]; unknown types are dropped.
    pub fn decode_demuxed(&self, demuxed: Demultiplexed) -> EventBatches {
        let (groups, rejected) = demuxed.into_parts();
        let mut batches = EventBatches::default();

        for err in rejected {
            warn!("{}; sub-packet dropped", err);
            batches.rejected.push(err);
        }

        for (event_type, packets) in groups {
            for packet in packets {
                let result = match event_type {
                    EventType::Polarity => self
                        .decode_polarity(&packet)
                        .map(|events| batches.polarity.extend(events)),
                    EventType::Special => self
                        .decode_special(&packet)
                        .map(|events| batches.special.extend(events)),
                    EventType::Frame
                        if self.options.frame_policy == FramePolicy::First
                            && !batches.frames.is_empty() =>
                    {
                        trace!(
                            "frame already decoded this tick, skipping {} more",
                            packet.event_count()
                        );
                        Ok(())
                    }
                    EventType::Frame => self
                        .decode_frames(&packet)
                        .map(|events| batches.frames.extend(events)),
                    EventType::Imu6 => self
                        .decode_imu6(&packet)
                        .map(|events| batches.imu6.extend(events)),
                    EventType::Spike => self
                        .decode_spikes(&packet)
                        .map(|events| batches.spikes.extend(events)),
                    EventType::Other => {
                        trace!(
                            "ignoring sub-packet with type code {} ({} events)",
                            packet.header().type_code,
                            packet.event_count()
                        );
                        Ok(())
                    }
                };

                if let Err(err) = result {
                    warn!("{}; sub-packet dropped", err);
                    batches.rejected.push(err);
                }
            }
        }

        batches
    }

    /// Demultiplexes and decodes one container.
    pub fn decode_container(&self, container: EventPacketContainer) -> EventBatches {
        self.decode_demuxed(demux(container))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::RawSubPacket;
    use crate::demux::validate;

    fn davis(width: u16, height: u16) -> DeviceDescriptor {
        DeviceDescriptor::davis(1, "test", Geometry::new(width, height))
    }

    fn frame(length_x: u32, length_y: u32, pixels: &[u16]) -> FrameEvent {
        let mut matrix = FrameMatrix::zeros(length_x as usize, length_y as usize);
        for (i, &p) in pixels.iter().enumerate() {
            matrix.set(i % length_x as usize, i / length_x as usize, p);
        }
        FrameEvent {
            timestamp: 150,
            ts_start_of_frame: 90,
            ts_end_of_frame: 210,
            ts_start_of_exposure: 100,
            ts_end_of_exposure: 200,
            length_x,
            length_y,
            position_x: 0,
            position_y: 0,
            channels: 1,
            roi_id: 0,
            pixels: matrix,
        }
    }

    #[test]
    fn test_decode_polarity_preserves_order() {
        let events = [
            PolarityEvent::new(300, 5, 6, true),
            PolarityEvent::new(100, 1, 2, false),
            PolarityEvent::new(100, 1, 2, false),
        ];
        let mut builder = RawSubPacket::builder(EventType::Polarity);
        for e in &events {
            builder.push_polarity(e);
        }
        let packet = validate(builder.build()).unwrap();

        let decoder = PacketDecoder::new(&davis(240, 180), DecoderOptions::default());
        let decoded = decoder.decode_polarity(&packet).unwrap();
        assert_eq!(decoded, events);
    }

    #[test]
    fn test_polarity_out_of_bounds_rejected() {
        let mut builder = RawSubPacket::builder(EventType::Polarity);
        builder.push_polarity(&PolarityEvent::new(0, 240, 0, true));
        let packet = validate(builder.build()).unwrap();

        let decoder = PacketDecoder::new(&davis(240, 180), DecoderOptions::default());
        assert!(decoder.decode_polarity(&packet).is_err());

        let lenient = PacketDecoder::new(
            &davis(240, 180),
            DecoderOptions {
                check_bounds: false,
                ..Default::default()
            },
        );
        assert_eq!(lenient.decode_polarity(&packet).unwrap()[0].x, 240);
    }

    #[test]
    fn test_decode_frame_row_major() {
        let mut builder = RawSubPacket::builder(EventType::Frame);
        builder.push_frame(&frame(2, 2, &[10, 20, 30, 40]));
        let packet = validate(builder.build()).unwrap();

        let decoder = PacketDecoder::new(&davis(240, 180), DecoderOptions::default());
        let frames = decoder.decode_frames(&packet).unwrap();
        assert_eq!(frames.len(), 1);
        let m = &frames[0].pixels;
        assert_eq!(m[0], [10, 20]);
        assert_eq!(m[1], [30, 40]);
        assert_eq!(frames[0].timestamp, 150);
    }

    #[test]
    fn test_decode_frame_policy() {
        let mut builder = RawSubPacket::builder(EventType::Frame);
        builder.push_frame(&frame(2, 1, &[1, 2]));
        builder.push_frame(&frame(3, 1, &[3, 4, 5]));
        let packet = validate(builder.build()).unwrap();

        let first = PacketDecoder::new(&davis(240, 180), DecoderOptions::default());
        let frames = first.decode_frames(&packet).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].pixels.as_slice(), &[1, 2]);

        let all = PacketDecoder::new(
            &davis(240, 180),
            DecoderOptions {
                frame_policy: FramePolicy::All,
                ..Default::default()
            },
        );
        let frames = all.decode_frames(&packet).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].pixels[0], [3, 4, 5]);
    }

    #[test]
    fn test_first_policy_caps_frames_per_container() {
        let mut a = RawSubPacket::builder(EventType::Frame);
        a.push_frame(&frame(1, 1, &[11]));
        let mut b = RawSubPacket::builder(EventType::Frame);
        b.push_frame(&frame(1, 1, &[22]));
        let container: EventPacketContainer = [a.build(), b.build()].into_iter().collect();

        let first = PacketDecoder::new(&davis(240, 180), DecoderOptions::default());
        let batches = first.decode_container(container.clone());
        assert_eq!(batches.frames.len(), 1);
        assert_eq!(batches.frames[0].pixels.as_slice(), &[11]);
        assert!(batches.rejected.is_empty());

        let all = PacketDecoder::new(
            &davis(240, 180),
            DecoderOptions {
                frame_policy: FramePolicy::All,
                ..Default::default()
            },
        );
        assert_eq!(all.decode_container(container).frames.len(), 2);
    }

    #[test]
    fn test_decode_frame_sensor_canvas() {
        let mut roi = frame(2, 1, &[7, 8]);
        roi.position_x = 1;
        roi.position_y = 2;
        let mut builder = RawSubPacket::builder(EventType::Frame);
        builder.push_frame(&roi);
        let packet = validate(builder.build()).unwrap();

        let decoder = PacketDecoder::new(
            &davis(4, 3),
            DecoderOptions {
                frame_sizing: FrameSizing::SensorCanvas,
                ..Default::default()
            },
        );
        let frames = decoder.decode_frames(&packet).unwrap();
        let m = &frames[0].pixels;
        assert_eq!((m.width(), m.height()), (4, 3));
        assert_eq!(m[2], [0, 7, 8, 0]);
        assert_eq!(m[0], [0, 0, 0, 0]);
    }

    #[test]
    fn test_decode_multichannel_frame_uses_first_channel() {
        let f = frame(2, 1, &[0, 0]);
        let mut builder = RawSubPacket::builder(EventType::Frame);
        builder.push_frame_samples(&f, &[1, 100, 200, 2, 101, 201], 3);
        let packet = validate(builder.build()).unwrap();

        let decoder = PacketDecoder::new(&davis(240, 180), DecoderOptions::default());
        let frames = decoder.decode_frames(&packet).unwrap();
        assert_eq!(frames[0].channels, 3);
        assert_eq!(frames[0].pixels[0], [1, 2]);
    }

    #[test]
    fn test_decode_imu6() {
        let sample = Imu6Event {
            timestamp: 42,
            accel: [0.0, -1.0, 0.5],
            gyro: [10.0, 20.0, -30.0],
            temperature: 36.5,
        };
        let mut builder = RawSubPacket::builder(EventType::Imu6);
        builder.push_imu6(&sample);
        let packet = validate(builder.build()).unwrap();

        let decoder = PacketDecoder::new(&davis(240, 180), DecoderOptions::default());
        assert_eq!(decoder.decode_imu6(&packet).unwrap(), vec![sample]);
    }

    #[test]
    fn test_decode_spikes() {
        let spike = SpikeEvent {
            timestamp: 7,
            neuron_id: 255,
            source_core_id: 2,
            chip_id: 3,
        };
        let mut builder = RawSubPacket::builder(EventType::Spike);
        builder.push_spike(&spike);
        let packet = validate(builder.build()).unwrap();

        let decoder = PacketDecoder::new(
            &DeviceDescriptor::dynapse(1, "test", 3),
            DecoderOptions::default(),
        );
        assert_eq!(decoder.decode_spikes(&packet).unwrap(), vec![spike]);
    }

    #[test]
    fn test_wrong_decoder_rejected() {
        let mut builder = RawSubPacket::builder(EventType::Special);
        builder.push_special(&SpecialEvent::new(0, 0, 0));
        let packet = validate(builder.build()).unwrap();

        let decoder = PacketDecoder::new(&davis(240, 180), DecoderOptions::default());
        assert!(decoder.decode_polarity(&packet).is_err());
    }
}
