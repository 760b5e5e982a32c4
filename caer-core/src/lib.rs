//! Event acquisition and decoding for DVS, DAVIS and Dynap-se devices.
//!
//! A device read returns an [`EventPacketContainer`]: a list of sub-packets,
//! each a 28-byte header followed by fixed-stride records of one event type.
//! This crate validates and groups those sub-packets ([`demux`]), decodes them
//! into typed events ([`PacketDecoder`]) and runs the open, configure, stream,
//! stop and close lifecycle of a device ([`Acquisition`]).
//!
//! # Example
//!
//! ```no_run
//! use caer_core::{Acquisition, AcquisitionConfig, DeviceKind, OpenRequest, ReplayOpener};
//!
//! let opener = ReplayOpener::new("recording.aedat");
//! let request = OpenRequest::any(1, DeviceKind::Davis);
//! let acquisition = Acquisition::open(&opener, &request, AcquisitionConfig::default()).unwrap();
//!
//! for batches in acquisition.take(100) {
//!     println!("{} polarity events", batches.polarity.len());
//! }
//! ```
//!
//! # Features
//!
//! - Polarity, special, frame, IMU6 and spike decoding
//! - Per sub-packet validation; malformed data never aborts a tick
//! - Cooperative cancellation with guaranteed stop and close
//! - AEDAT 3.1 replay and recording
//! - CSV, binary and PGM output writers

pub mod acquisition;
pub mod container;
pub mod decoder;
pub mod demux;
pub mod device;
pub mod output;
pub mod parser;
pub mod replay;
pub mod types;

// Re-export commonly used types
pub use acquisition::{
    Acquisition, AcquisitionConfig, AcquisitionError, AcquisitionState, ConfigParam, StopToken,
};
pub use container::{EventPacketContainer, RawSubPacket, SubPacketBuilder, SubPacketHeader};
pub use decoder::{DecodeError, DecoderOptions, FramePolicy, FrameSizing, PacketDecoder};
pub use demux::{demux, Demultiplexed, TypedSubPacket};
pub use device::{Device, DeviceError, DeviceOpener, OpenRequest};
pub use output::{FieldOrder, OutputError};
pub use replay::{AedatReader, AedatWriter, ReplayDevice, ReplayError, ReplayOpener};
pub use types::{
    DeviceDescriptor, DeviceKind, EventBatches, EventType, FrameEvent, FrameMatrix, Geometry,
    Imu6Event, PolarityEvent, SpecialEvent, SpecialEventKind, SpikeEvent,
};
