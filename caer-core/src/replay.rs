//! AEDAT 3.1 recordings.
//!
//! An AEDAT 3.1 file is a text header of `#` lines followed by event packets
//! laid out exactly like the sub-packets of a live container. [`AedatReader`]
//! regroups them into containers, [`ReplayDevice`] serves those containers
//! through the [`Device`] interface, and [`AedatWriter`] records containers
//! back to disk.

use crate::container::{EventPacketContainer, RawSubPacket, SubPacketHeader};
use crate::device::{Device, DeviceError, DeviceOpener, OpenRequest};
use crate::parser::HEADER_SIZE;
use crate::types::{DeviceDescriptor, Geometry};
use log::{debug, warn};
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur while reading or writing a recording.
#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Unexpected end of file")]
    UnexpectedEof,
}

const VERSION_LINE: &str = "#!AER-DAT3.1";
const END_OF_HEADER: &str = "#!END-HEADER";

/// Largest packet payload accepted from a file.
const MAX_PACKET_BYTES: usize = 256 << 20;

/// Metadata parsed from the text header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AedatHeader {
    /// Format version, e.g. `3.1`
    pub version: Option<String>,
    /// Payload format, e.g. `RAW`
    pub format: Option<String>,
    /// Device names from `#Source N: <name>` lines, in file order
    pub sources: Vec<String>,
}

impl AedatHeader {
    fn parse_line(&mut self, line: &str) {
        if let Some(version) = line.strip_prefix("#!AER-DAT") {
            self.version = Some(version.to_string());
        } else if let Some(format) = line.strip_prefix("#Format: ") {
            self.format = Some(format.to_string());
        } else if let Some(source) = line.strip_prefix("#Source ") {
            // Format: "#Source 1: DAVIS346B"
            if let Some(idx) = source.find(':') {
                self.sources.push(source[idx + 1..].trim().to_string());
            }
        }
    }

    /// Descriptor for the first recognised source device.
    pub fn descriptor(&self) -> Option<DeviceDescriptor> {
        self.sources.iter().find_map(|s| descriptor_for_source(s))
    }

    /// Like [`descriptor`](Self::descriptor), but an unrecognised source
    /// gives a DAVIS descriptor with no sensor geometry, so polarity
    /// coordinates go unchecked instead of being rejected.
    pub fn descriptor_or_unknown(&self) -> DeviceDescriptor {
        self.descriptor().unwrap_or_else(|| {
            let name = self.sources.first().map(String::as_str).unwrap_or("unknown");
            warn!("source {:?} not recognised, sensor geometry unknown", name);
            let mut descriptor = DeviceDescriptor::davis(1, "", Geometry::default());
            descriptor.aps = None;
            descriptor.device_string = name.to_string();
            descriptor
        })
    }
}

/// Maps a source device name to its descriptor.
pub fn descriptor_for_source(name: &str) -> Option<DeviceDescriptor> {
    let name = name.trim().to_ascii_uppercase();
    let davis = |w, h| DeviceDescriptor::davis(1, "", Geometry::new(w, h));

    let mut descriptor = if name.starts_with("DVS128") {
        DeviceDescriptor::dvs128(1, "")
    } else if name.starts_with("DAVIS240") {
        davis(240, 180)
    } else if name.starts_with("DAVIS346") {
        davis(346, 260)
    } else if name.starts_with("DAVIS640") {
        davis(640, 480)
    } else if name.starts_with("DAVIS128") {
        davis(128, 128)
    } else if name.starts_with("DYNAPSE") || name.starts_with("DYNAP-SE") {
        DeviceDescriptor::dynapse(1, "", 0)
    } else {
        return None;
    };
    descriptor.device_string = name;
    Some(descriptor)
}

/// Reads into `buf` until it is full or the reader is exhausted.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Streaming reader for AEDAT 3.1 recordings.
pub struct AedatReader<R: Read> {
    reader: BufReader<R>,
    header: AedatHeader,
    pending: Option<RawSubPacket>,
}

impl AedatReader<File> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ReplayError> {
        Self::new(File::open(path.as_ref())?)
    }
}

impl<R: Read> AedatReader<R> {
    /// Wraps `inner` and parses the text header, if present.
    pub fn new(inner: R) -> Result<Self, ReplayError> {
        let mut reader = Self {
            reader: BufReader::new(inner),
            header: AedatHeader::default(),
            pending: None,
        };
        reader.parse_header()?;
        Ok(reader)
    }

    pub fn header(&self) -> &AedatHeader {
        &self.header
    }

    fn parse_header(&mut self) -> Result<(), ReplayError> {
        let mut first = true;
        loop {
            let bytes_peeked = self.reader.fill_buf()?;
            if bytes_peeked.is_empty() || bytes_peeked[0] != b'#' {
                break;
            }

            let mut line = String::new();
            self.reader.read_line(&mut line)?;
            let line = line.trim_end();

            if first && !line.starts_with("#!AER-DAT") {
                return Err(ReplayError::InvalidFormat(format!(
                    "expected {} header, found {:?}",
                    VERSION_LINE, line
                )));
            }
            first = false;

            if line.starts_with(END_OF_HEADER) {
                break;
            }
            self.header.parse_line(line);
        }

        if let Some(version) = &self.header.version {
            if !version.starts_with('3') {
                return Err(ReplayError::InvalidFormat(format!(
                    "unsupported AEDAT version {}",
                    version
                )));
            }
        }
        Ok(())
    }

    /// Reads the next packet, or `None` at a clean end of file.
    pub fn read_packet(&mut self) -> Result<Option<RawSubPacket>, ReplayError> {
        let mut header_bytes = [0u8; HEADER_SIZE];
        match read_full(&mut self.reader, &mut header_bytes)? {
            0 => return Ok(None),
            n if n < HEADER_SIZE => return Err(ReplayError::UnexpectedEof),
            _ => {}
        }

        let header = SubPacketHeader::parse(&header_bytes).ok_or(ReplayError::UnexpectedEof)?;
        if header.event_size < 0 || header.event_capacity < 0 {
            return Err(ReplayError::InvalidFormat(format!(
                "packet of type {} with size {} and capacity {}",
                header.type_code, header.event_size, header.event_capacity
            )));
        }

        let payload_len = (header.event_capacity as usize)
            .checked_mul(header.event_size as usize)
            .filter(|&n| n <= MAX_PACKET_BYTES)
            .ok_or_else(|| {
                ReplayError::InvalidFormat(format!(
                    "packet payload of {} x {} bytes is too large",
                    header.event_capacity, header.event_size
                ))
            })?;

        let mut bytes = Vec::with_capacity(HEADER_SIZE + payload_len);
        bytes.extend_from_slice(&header_bytes);
        bytes.resize(HEADER_SIZE + payload_len, 0);
        self.reader
            .read_exact(&mut bytes[HEADER_SIZE..])
            .map_err(|e| match e.kind() {
                io::ErrorKind::UnexpectedEof => ReplayError::UnexpectedEof,
                _ => ReplayError::Io(e),
            })?;

        Ok(Some(RawSubPacket::from_bytes(bytes)))
    }

    /// Reads packets until a type repeats, forming one container.
    ///
    /// Returns `None` once the recording is exhausted.
    pub fn read_container(&mut self) -> Result<Option<EventPacketContainer>, ReplayError> {
        let mut container = EventPacketContainer::new();

        loop {
            let packet = match self.pending.take() {
                Some(packet) => packet,
                None => match self.read_packet()? {
                    Some(packet) => packet,
                    None => break,
                },
            };

            let code = packet.header().map_or(-1, |h| h.type_code);
            if container.contains_code(code) {
                self.pending = Some(packet);
                break;
            }
            container.push(packet);
        }

        Ok((!container.is_empty()).then_some(container))
    }
}

/// Writer for AEDAT 3.1 recordings.
pub struct AedatWriter<W: Write> {
    writer: BufWriter<W>,
}

impl AedatWriter<File> {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, ReplayError> {
        Ok(Self::new(File::create(path)?))
    }
}

impl<W: Write> AedatWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::new(writer),
        }
    }

    /// Writes the text header naming `source` as the recording device.
    pub fn write_header(&mut self, source: &str) -> Result<(), ReplayError> {
        write!(self.writer, "{}\r\n", VERSION_LINE)?;
        write!(self.writer, "#Format: RAW\r\n")?;
        write!(self.writer, "#Source 1: {}\r\n", source)?;
        write!(self.writer, "{}\r\n", END_OF_HEADER)?;
        Ok(())
    }

    /// Appends every populated slot of `container`.
    pub fn write_container(&mut self, container: &EventPacketContainer) -> Result<(), ReplayError> {
        for packet in container.iter().flatten() {
            self.writer.write_all(packet.as_bytes())?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), ReplayError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// A [`Device`] that replays a recording.
///
/// Once the recording is exhausted every read returns no data, like an idle
/// sensor; it is up to the caller to stop.
pub struct ReplayDevice<R: Read = File> {
    reader: AedatReader<R>,
    descriptor: DeviceDescriptor,
    streaming: bool,
    exhausted: bool,
    closed: bool,
}

impl ReplayDevice<File> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ReplayError> {
        Self::from_reader(File::open(path.as_ref())?)
    }
}

impl<R: Read> ReplayDevice<R> {
    /// Replays from `inner`, describing the device from the header.
    ///
    /// Recordings without a recognised source replay as a DAVIS of unknown
    /// geometry.
    pub fn from_reader(inner: R) -> Result<Self, ReplayError> {
        let reader = AedatReader::new(inner)?;
        let descriptor = reader.header().descriptor_or_unknown();
        Ok(Self {
            reader,
            descriptor,
            streaming: false,
            exhausted: false,
            closed: false,
        })
    }

    /// Overrides the descriptor derived from the header.
    pub fn with_descriptor(mut self, descriptor: DeviceDescriptor) -> Self {
        self.descriptor = descriptor;
        self
    }

    pub fn header(&self) -> &AedatHeader {
        self.reader.header()
    }

    /// `true` once every container has been served.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    fn ensure_open(&self) -> Result<(), DeviceError> {
        if self.closed {
            return Err(DeviceError::Rejected("device is closed".to_string()));
        }
        Ok(())
    }
}

impl<R: Read> Device for ReplayDevice<R> {
    fn descriptor(&self) -> DeviceDescriptor {
        self.descriptor.clone()
    }

    fn send_default_config(&mut self) -> Result<(), DeviceError> {
        self.ensure_open()
    }

    fn config_set(&mut self, module: i8, param: u8, value: u32) -> Result<(), DeviceError> {
        self.ensure_open()?;
        debug!(
            "replay ignores config module {} param {} = {}",
            module, param, value
        );
        Ok(())
    }

    fn data_start(&mut self) -> Result<(), DeviceError> {
        self.ensure_open()?;
        self.streaming = true;
        Ok(())
    }

    fn data_get(&mut self) -> Option<EventPacketContainer> {
        if !self.streaming || self.exhausted {
            return None;
        }
        match self.reader.read_container() {
            Ok(Some(container)) => Some(container),
            Ok(None) => {
                debug!("end of recording");
                self.exhausted = true;
                None
            }
            Err(e) => {
                warn!("recording unreadable, replay ends: {}", e);
                self.exhausted = true;
                None
            }
        }
    }

    fn data_stop(&mut self) {
        self.streaming = false;
    }

    fn close(&mut self) {
        self.streaming = false;
        self.closed = true;
    }
}

/// Opens recordings as devices.
#[derive(Debug, Clone)]
pub struct ReplayOpener {
    path: PathBuf,
    descriptor: Option<DeviceDescriptor>,
}

impl ReplayOpener {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            descriptor: None,
        }
    }

    /// Uses `descriptor` instead of the one derived from the file header.
    pub fn with_descriptor(mut self, descriptor: DeviceDescriptor) -> Self {
        self.descriptor = Some(descriptor);
        self
    }
}

impl DeviceOpener for ReplayOpener {
    type Device = ReplayDevice<File>;

    fn open(&self, request: &OpenRequest) -> Result<ReplayDevice<File>, DeviceError> {
        let device = ReplayDevice::open(&self.path).map_err(|e| match e {
            ReplayError::Io(io) if io.kind() == io::ErrorKind::NotFound => {
                DeviceError::NotFound(self.path.display().to_string())
            }
            other => DeviceError::Rejected(other.to_string()),
        })?;

        let mut descriptor = self
            .descriptor
            .clone()
            .unwrap_or_else(|| device.descriptor());
        if descriptor.kind != request.kind {
            return Err(DeviceError::NotFound(format!(
                "{} holds a {} recording, {} requested",
                self.path.display(),
                descriptor.kind,
                request.kind
            )));
        }
        if !request.serial_number.is_empty() && request.serial_number != descriptor.serial_number {
            return Err(DeviceError::NotFound(format!(
                "no recording with serial number {}",
                request.serial_number
            )));
        }

        descriptor.device_id = request.device_id;
        Ok(device.with_descriptor(descriptor))
    }
}
