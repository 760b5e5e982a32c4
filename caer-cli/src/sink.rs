//! Per-tick output files.

use caer_core::output::{
    write_pgm_file, BinaryWriter, CsvRow, CsvWriter, OutputError, PolarityCsvWriter,
};
use caer_core::{EventBatches, FieldOrder, Geometry, Imu6Event, SpecialEvent, SpikeEvent};
use log::warn;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

enum PolaritySink {
    Csv(PolarityCsvWriter<File>),
    Binary(BinaryWriter<File>),
}

/// Running totals of what was written.
#[derive(Debug, Default, Clone, Copy)]
pub struct Totals {
    pub polarity: u64,
    pub frames: u64,
    pub imu6: u64,
    pub special: u64,
    pub spikes: u64,
    pub rejected: u64,
}

/// Writes every event kind to its own file in one directory.
///
/// Files are created on the first batch that has events of their kind.
pub struct Sinks {
    dir: PathBuf,
    field_order: FieldOrder,
    binary: bool,
    geometry: Geometry,
    polarity: Option<PolaritySink>,
    special: Option<CsvWriter<File, SpecialEvent>>,
    imu6: Option<CsvWriter<File, Imu6Event>>,
    spikes: Option<CsvWriter<File, SpikeEvent>>,
    totals: Totals,
}

fn write_csv<E: CsvRow>(
    slot: &mut Option<CsvWriter<File, E>>,
    path: &Path,
    events: &[E],
) -> Result<(), OutputError> {
    if events.is_empty() {
        return Ok(());
    }
    if slot.is_none() {
        let mut writer = CsvWriter::new(File::create(path)?);
        writer.write_header()?;
        *slot = Some(writer);
    }
    if let Some(writer) = slot {
        writer.write_events(events)?;
    }
    Ok(())
}

impl Sinks {
    pub fn new(
        dir: &Path,
        field_order: FieldOrder,
        binary: bool,
        geometry: Geometry,
    ) -> Result<Self, OutputError> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            field_order,
            binary,
            geometry,
            polarity: None,
            special: None,
            imu6: None,
            spikes: None,
            totals: Totals::default(),
        })
    }

    pub fn totals(&self) -> Totals {
        self.totals
    }

    pub fn write(&mut self, batches: &EventBatches) -> Result<(), OutputError> {
        if !batches.polarity.is_empty() {
            if self.polarity.is_none() {
                self.polarity = Some(self.open_polarity()?);
            }
            match &mut self.polarity {
                Some(PolaritySink::Csv(w)) => w.write_events(&batches.polarity)?,
                Some(PolaritySink::Binary(w)) => w.write_events(&batches.polarity)?,
                None => {}
            }
        }

        write_csv(&mut self.special, &self.dir.join("special.csv"), &batches.special)?;
        write_csv(&mut self.imu6, &self.dir.join("imu6.csv"), &batches.imu6)?;
        write_csv(&mut self.spikes, &self.dir.join("spikes.csv"), &batches.spikes)?;

        for frame in &batches.frames {
            let path = self
                .dir
                .join(format!("frame_{:06}_{}.pgm", self.totals.frames, frame.timestamp));
            match write_pgm_file(&path, &frame.pixels) {
                Ok(()) => self.totals.frames += 1,
                Err(OutputError::InvalidFormat(reason)) => {
                    warn!("frame at {} not written: {}", frame.timestamp, reason)
                }
                Err(e) => return Err(e),
            }
        }

        self.totals.polarity += batches.polarity.len() as u64;
        self.totals.imu6 += batches.imu6.len() as u64;
        self.totals.special += batches.special.len() as u64;
        self.totals.spikes += batches.spikes.len() as u64;
        self.totals.rejected += batches.rejected.len() as u64;
        Ok(())
    }

    fn open_polarity(&self) -> Result<PolaritySink, OutputError> {
        if self.binary {
            let mut writer = BinaryWriter::new(File::create(self.dir.join("polarity.bin"))?);
            writer.write_header(self.geometry)?;
            Ok(PolaritySink::Binary(writer))
        } else {
            let mut writer =
                PolarityCsvWriter::new(File::create(self.dir.join("polarity.csv"))?, self.field_order);
            writer.write_header(Some(self.geometry))?;
            Ok(PolaritySink::Csv(writer))
        }
    }

    /// Flushes every open file.
    pub fn finish(self) -> Result<Totals, OutputError> {
        match self.polarity {
            Some(PolaritySink::Csv(mut w)) => w.flush()?,
            Some(PolaritySink::Binary(w)) => {
                w.finish()?;
            }
            None => {}
        }
        if let Some(mut w) = self.special {
            w.flush()?;
        }
        if let Some(mut w) = self.imu6 {
            w.flush()?;
        }
        if let Some(mut w) = self.spikes {
            w.flush()?;
        }
        Ok(self.totals)
    }
}
