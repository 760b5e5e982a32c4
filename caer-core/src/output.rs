//! Output format writers for decoded event batches.
//!
//! Every writer is streaming: construct it once, feed it the batches of each
//! tick, then flush (or `finish` for the binary format).

use crate::types::{FrameMatrix, Geometry, Imu6Event, PolarityEvent, SpecialEvent, SpikeEvent};
use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::Path;
use thiserror::Error;

/// Errors that can occur during output writing.
#[derive(Error, Debug)]
pub enum OutputError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid format: {0}")]
    InvalidFormat(String),
}

/// Column ordering for polarity CSV output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FieldOrder {
    /// x, y, p, t
    #[default]
    XYPT,
    /// t, x, y, p
    TXYP,
    /// x, y, t, p
    XYTP,
    /// Any other permutation, as indices into `[x, y, p, t]`
    Custom([usize; 4]),
}

const FIELD_NAMES: [&str; 4] = ["x", "y", "polarity", "timestamp"];

impl std::str::FromStr for FieldOrder {
    type Err = OutputError;

    /// Parses a field order from a string like "x,y,p,t" or "t,x,y,p".
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<String> = s.split(',').map(|p| p.trim().to_lowercase()).collect();

        if parts.len() != 4 {
            return Err(OutputError::InvalidFormat(
                "Format must have exactly 4 fields: x, y, p, t".to_string(),
            ));
        }

        let mut indices = [0usize; 4];
        let mut used = [false; 4];

        for (i, part) in parts.iter().enumerate() {
            let field_idx = match part.as_str() {
                "x" => 0,
                "y" => 1,
                "p" | "pol" | "polarity" => 2,
                "t" | "ts" | "timestamp" => 3,
                _ => {
                    return Err(OutputError::InvalidFormat(format!(
                        "Unknown field: {}. Use x, y, p, t",
                        part
                    )))
                }
            };

            if used[field_idx] {
                return Err(OutputError::InvalidFormat(format!(
                    "Duplicate field: {}",
                    part
                )));
            }

            indices[i] = field_idx;
            used[field_idx] = true;
        }

        Ok(match indices {
            [0, 1, 2, 3] => Self::XYPT,
            [3, 0, 1, 2] => Self::TXYP,
            [0, 1, 3, 2] => Self::XYTP,
            _ => Self::Custom(indices),
        })
    }
}

impl FieldOrder {
    /// Indices into `[x, y, p, t]` in output order.
    pub fn indices(&self) -> [usize; 4] {
        match self {
            Self::XYPT => [0, 1, 2, 3],
            Self::TXYP => [3, 0, 1, 2],
            Self::XYTP => [0, 1, 3, 2],
            Self::Custom(indices) => *indices,
        }
    }

    /// Column header line for this order.
    pub fn header(&self) -> String {
        self.indices()
            .iter()
            .map(|&i| FIELD_NAMES[i])
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// CSV writer for polarity events.
pub struct PolarityCsvWriter<W: Write> {
    writer: BufWriter<W>,
    field_order: FieldOrder,
}

impl<W: Write> PolarityCsvWriter<W> {
    pub fn new(writer: W, field_order: FieldOrder) -> Self {
        Self {
            writer: BufWriter::new(writer),
            field_order,
        }
    }

    /// Writes the optional `%geometry:W,H` line and the column header.
    pub fn write_header(&mut self, geometry: Option<Geometry>) -> Result<(), OutputError> {
        if let Some(g) = geometry.filter(|g| !g.is_empty()) {
            writeln!(self.writer, "%geometry:{},{}", g.width, g.height)?;
        }
        writeln!(self.writer, "{}", self.field_order.header())?;
        Ok(())
    }

    pub fn write_events(&mut self, events: &[PolarityEvent]) -> Result<(), OutputError> {
        for event in events {
            self.write_event(event)?;
        }
        Ok(())
    }

    #[inline]
    fn write_event(&mut self, event: &PolarityEvent) -> Result<(), OutputError> {
        let p = event.polarity as u8;
        match self.field_order {
            FieldOrder::XYPT => {
                writeln!(self.writer, "{},{},{},{}", event.x, event.y, p, event.timestamp)?;
            }
            FieldOrder::TXYP => {
                writeln!(self.writer, "{},{},{},{}", event.timestamp, event.x, event.y, p)?;
            }
            FieldOrder::XYTP => {
                writeln!(self.writer, "{},{},{},{}", event.x, event.y, event.timestamp, p)?;
            }
            FieldOrder::Custom(indices) => {
                let values = [
                    event.x as i64,
                    event.y as i64,
                    p as i64,
                    event.timestamp as i64,
                ];
                writeln!(
                    self.writer,
                    "{},{},{},{}",
                    values[indices[0]], values[indices[1]], values[indices[2]], values[indices[3]]
                )?;
            }
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), OutputError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// An event type with a fixed CSV layout.
pub trait CsvRow {
    /// Column header line
    const HEADER: &'static str;

    fn write_row<W: Write>(&self, out: &mut W) -> std::io::Result<()>;
}

impl CsvRow for SpecialEvent {
    const HEADER: &'static str = "timestamp,type,data";

    fn write_row<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        writeln!(out, "{},{},{}", self.timestamp, self.kind, self.data)
    }
}

impl CsvRow for Imu6Event {
    const HEADER: &'static str =
        "timestamp,accel_x,accel_y,accel_z,gyro_x,gyro_y,gyro_z,temperature";

    fn write_row<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        let [ax, ay, az] = self.accel;
        let [gx, gy, gz] = self.gyro;
        writeln!(
            out,
            "{},{},{},{},{},{},{},{}",
            self.timestamp, ax, ay, az, gx, gy, gz, self.temperature
        )
    }
}

impl CsvRow for SpikeEvent {
    const HEADER: &'static str = "timestamp,neuron_id,source_core_id,chip_id";

    fn write_row<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        writeln!(
            out,
            "{},{},{},{}",
            self.timestamp, self.neuron_id, self.source_core_id, self.chip_id
        )
    }
}

/// CSV writer for any [`CsvRow`] event type.
pub struct CsvWriter<W: Write, E: CsvRow> {
    writer: BufWriter<W>,
    _event: PhantomData<E>,
}

pub type SpecialCsvWriter<W> = CsvWriter<W, SpecialEvent>;
pub type Imu6CsvWriter<W> = CsvWriter<W, Imu6Event>;
pub type SpikeCsvWriter<W> = CsvWriter<W, SpikeEvent>;

impl<W: Write, E: CsvRow> CsvWriter<W, E> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::new(writer),
            _event: PhantomData,
        }
    }

    pub fn write_header(&mut self) -> Result<(), OutputError> {
        writeln!(self.writer, "{}", E::HEADER)?;
        Ok(())
    }

    pub fn write_events(&mut self, events: &[E]) -> Result<(), OutputError> {
        for event in events {
            event.write_row(&mut self.writer)?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), OutputError> {
        self.writer.flush()?;
        Ok(())
    }
}

const BINARY_MAGIC: &[u8; 8] = b"CAERBIN\0";
const BINARY_VERSION: u32 = 1;
/// Byte offset of the event count within the header.
const BINARY_COUNT_OFFSET: u64 = 20;

/// Binary output format for polarity events.
///
/// Header: magic `CAERBIN\0`, version (u32), DVS width (u32), DVS height
/// (u32), event count (u64). Each event is then a 12-byte record:
/// - x: u16
/// - y: u16
/// - polarity: u8
/// - padding: 3 bytes
/// - timestamp: i32
///
/// The count is written as zero up front and patched by [`Self::finish`].
pub struct BinaryWriter<W: Write + Seek> {
    writer: BufWriter<W>,
    count: u64,
}

impl<W: Write + Seek> BinaryWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::new(writer),
            count: 0,
        }
    }

    pub fn write_header(&mut self, geometry: Geometry) -> Result<(), OutputError> {
        self.writer.write_all(BINARY_MAGIC)?;
        self.writer.write_all(&BINARY_VERSION.to_le_bytes())?;
        self.writer.write_all(&(geometry.width as u32).to_le_bytes())?;
        self.writer.write_all(&(geometry.height as u32).to_le_bytes())?;
        self.writer.write_all(&0u64.to_le_bytes())?;
        Ok(())
    }

    pub fn write_events(&mut self, events: &[PolarityEvent]) -> Result<(), OutputError> {
        for event in events {
            self.writer.write_all(&event.x.to_le_bytes())?;
            self.writer.write_all(&event.y.to_le_bytes())?;
            self.writer.write_all(&[event.polarity as u8, 0, 0, 0])?;
            self.writer.write_all(&event.timestamp.to_le_bytes())?;
        }
        self.count += events.len() as u64;
        Ok(())
    }

    /// Events written so far.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Patches the event count into the header and flushes.
    pub fn finish(mut self) -> Result<W, OutputError> {
        self.writer.seek(SeekFrom::Start(BINARY_COUNT_OFFSET))?;
        self.writer.write_all(&self.count.to_le_bytes())?;
        self.writer.seek(SeekFrom::End(0))?;
        self.writer
            .into_inner()
            .map_err(|e| OutputError::Io(e.into_error()))
    }
}

/// Writes a frame as a binary 16-bit PGM (P5) image.
pub fn write_pgm<W: Write>(out: W, frame: &FrameMatrix) -> Result<(), OutputError> {
    if frame.width() == 0 || frame.height() == 0 {
        return Err(OutputError::InvalidFormat(
            "cannot write an empty frame".to_string(),
        ));
    }

    let mut writer = BufWriter::new(out);
    write!(writer, "P5\n{} {}\n65535\n", frame.width(), frame.height())?;
    // PGM samples wider than a byte are big-endian
    for sample in frame.as_slice() {
        writer.write_all(&sample.to_be_bytes())?;
    }
    writer.flush()?;
    Ok(())
}

/// Writes a frame to a PGM file.
pub fn write_pgm_file<P: AsRef<Path>>(path: P, frame: &FrameMatrix) -> Result<(), OutputError> {
    write_pgm(File::create(path)?, frame)
}
