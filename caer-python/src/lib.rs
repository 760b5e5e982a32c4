//! Python bindings for decoding event recordings into numpy arrays.
//!
//! Every event kind is returned in columnar form (one array per field),
//! frames as 2D `uint16` arrays indexed `[y, x]`.

use caer_core::replay::AedatReader;
use caer_core::{
    DecoderOptions, DeviceDescriptor, EventBatches, FrameEvent, FramePolicy, FrameSizing,
    Geometry, PacketDecoder,
};
use numpy::ndarray::Array2;
use numpy::{IntoPyArray, PyArray1, PyArray2};
use pyo3::exceptions::{PyIOError, PyIndexError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyDict;
use std::io::{Cursor, Read};

/// Decoded polarity events in columnar form.
#[pyclass]
pub struct PolarityEvents {
    x: Vec<u16>,
    y: Vec<u16>,
    /// 0 = OFF, 1 = ON
    polarity: Vec<u8>,
    timestamp: Vec<i32>,
}

#[pymethods]
impl PolarityEvents {
    fn __len__(&self) -> usize {
        self.x.len()
    }

    fn __repr__(&self) -> String {
        format!("PolarityEvents(count={})", self.x.len())
    }

    #[getter]
    fn x<'py>(&self, py: Python<'py>) -> &'py PyArray1<u16> {
        self.x.clone().into_pyarray(py)
    }

    #[getter]
    fn y<'py>(&self, py: Python<'py>) -> &'py PyArray1<u16> {
        self.y.clone().into_pyarray(py)
    }

    /// Values: 0 = OFF (decrease in brightness), 1 = ON (increase)
    #[getter]
    fn polarity<'py>(&self, py: Python<'py>) -> &'py PyArray1<u8> {
        self.polarity.clone().into_pyarray(py)
    }

    /// Alias for polarity.
    #[getter]
    fn p<'py>(&self, py: Python<'py>) -> &'py PyArray1<u8> {
        self.polarity.clone().into_pyarray(py)
    }

    /// Timestamps in microseconds.
    #[getter]
    fn timestamp<'py>(&self, py: Python<'py>) -> &'py PyArray1<i32> {
        self.timestamp.clone().into_pyarray(py)
    }

    /// Alias for timestamp.
    #[getter]
    fn t<'py>(&self, py: Python<'py>) -> &'py PyArray1<i32> {
        self.timestamp.clone().into_pyarray(py)
    }

    /// Returns all arrays as a dictionary, e.g. for a pandas DataFrame.
    fn to_dict(&self, py: Python<'_>) -> PyResult<PyObject> {
        let dict = PyDict::new(py);
        dict.set_item("x", self.x.clone().into_pyarray(py))?;
        dict.set_item("y", self.y.clone().into_pyarray(py))?;
        dict.set_item("polarity", self.polarity.clone().into_pyarray(py))?;
        dict.set_item("timestamp", self.timestamp.clone().into_pyarray(py))?;
        Ok(dict.into())
    }
}

/// Decoded special events.
#[pyclass]
pub struct SpecialEvents {
    kind: Vec<u8>,
    data: Vec<u32>,
    timestamp: Vec<i32>,
}

#[pymethods]
impl SpecialEvents {
    fn __len__(&self) -> usize {
        self.kind.len()
    }

    /// Device-defined status codes.
    #[getter]
    fn kind<'py>(&self, py: Python<'py>) -> &'py PyArray1<u8> {
        self.kind.clone().into_pyarray(py)
    }

    #[getter]
    fn data<'py>(&self, py: Python<'py>) -> &'py PyArray1<u32> {
        self.data.clone().into_pyarray(py)
    }

    #[getter]
    fn timestamp<'py>(&self, py: Python<'py>) -> &'py PyArray1<i32> {
        self.timestamp.clone().into_pyarray(py)
    }
}

/// Decoded IMU6 samples. `accel` and `gyro` are `(N, 3)` arrays.
#[pyclass]
pub struct Imu6Events {
    accel: Vec<[f32; 3]>,
    gyro: Vec<[f32; 3]>,
    temperature: Vec<f32>,
    timestamp: Vec<i32>,
}

fn triplets<'py>(py: Python<'py>, values: &[[f32; 3]]) -> PyResult<&'py PyArray2<f32>> {
    let flat: Vec<f32> = values.iter().flatten().copied().collect();
    let array = Array2::from_shape_vec((values.len(), 3), flat)
        .map_err(|e| PyValueError::new_err(e.to_string()))?;
    Ok(array.into_pyarray(py))
}

#[pymethods]
impl Imu6Events {
    fn __len__(&self) -> usize {
        self.timestamp.len()
    }

    /// Acceleration in g, columns X/Y/Z.
    #[getter]
    fn accel<'py>(&self, py: Python<'py>) -> PyResult<&'py PyArray2<f32>> {
        triplets(py, &self.accel)
    }

    /// Angular velocity in deg/s, columns X/Y/Z.
    #[getter]
    fn gyro<'py>(&self, py: Python<'py>) -> PyResult<&'py PyArray2<f32>> {
        triplets(py, &self.gyro)
    }

    /// Temperature in deg C.
    #[getter]
    fn temperature<'py>(&self, py: Python<'py>) -> &'py PyArray1<f32> {
        self.temperature.clone().into_pyarray(py)
    }

    #[getter]
    fn timestamp<'py>(&self, py: Python<'py>) -> &'py PyArray1<i32> {
        self.timestamp.clone().into_pyarray(py)
    }
}

/// Decoded Dynap-se spikes.
#[pyclass]
pub struct SpikeEvents {
    neuron_id: Vec<u32>,
    source_core_id: Vec<u8>,
    chip_id: Vec<u8>,
    timestamp: Vec<i32>,
}

#[pymethods]
impl SpikeEvents {
    fn __len__(&self) -> usize {
        self.neuron_id.len()
    }

    #[getter]
    fn neuron_id<'py>(&self, py: Python<'py>) -> &'py PyArray1<u32> {
        self.neuron_id.clone().into_pyarray(py)
    }

    #[getter]
    fn source_core_id<'py>(&self, py: Python<'py>) -> &'py PyArray1<u8> {
        self.source_core_id.clone().into_pyarray(py)
    }

    #[getter]
    fn chip_id<'py>(&self, py: Python<'py>) -> &'py PyArray1<u8> {
        self.chip_id.clone().into_pyarray(py)
    }

    #[getter]
    fn timestamp<'py>(&self, py: Python<'py>) -> &'py PyArray1<i32> {
        self.timestamp.clone().into_pyarray(py)
    }
}

/// Decoded APS frames. Index to get one frame as a 2D array.
#[pyclass]
pub struct Frames {
    frames: Vec<FrameEvent>,
}

#[pymethods]
impl Frames {
    fn __len__(&self) -> usize {
        self.frames.len()
    }

    /// Returns frame `index` as a `(height, width)` uint16 array.
    fn __getitem__<'py>(&self, py: Python<'py>, index: isize) -> PyResult<&'py PyArray2<u16>> {
        let len = self.frames.len() as isize;
        let i = if index < 0 { index + len } else { index };
        if i < 0 || i >= len {
            return Err(PyIndexError::new_err("frame index out of range"));
        }
        let pixels = &self.frames[i as usize].pixels;
        let array = Array2::from_shape_vec(
            (pixels.height(), pixels.width()),
            pixels.as_slice().to_vec(),
        )
        .map_err(|e| PyValueError::new_err(e.to_string()))?;
        Ok(array.into_pyarray(py))
    }

    /// Middle-of-exposure timestamps.
    #[getter]
    fn timestamp<'py>(&self, py: Python<'py>) -> &'py PyArray1<i32> {
        self.frames
            .iter()
            .map(|f| f.timestamp)
            .collect::<Vec<_>>()
            .into_pyarray(py)
    }

    /// `(position_x, position_y)` of each frame's region of interest.
    #[getter]
    fn position(&self) -> Vec<(i32, i32)> {
        self.frames
            .iter()
            .map(|f| (f.position_x, f.position_y))
            .collect()
    }
}

/// Everything decoded from one recording.
#[pyclass]
pub struct Recording {
    #[pyo3(get)]
    polarity: Py<PolarityEvents>,
    #[pyo3(get)]
    special: Py<SpecialEvents>,
    #[pyo3(get)]
    imu6: Py<Imu6Events>,
    #[pyo3(get)]
    spikes: Py<SpikeEvents>,
    #[pyo3(get)]
    frames: Py<Frames>,
    /// Name of the recording device
    #[pyo3(get)]
    device: String,
    /// DVS `(width, height)`
    #[pyo3(get)]
    sensor_size: (u16, u16),
    /// Number of sub-packets dropped as malformed
    #[pyo3(get)]
    rejected: usize,
}

#[pymethods]
impl Recording {
    fn __repr__(&self, py: Python<'_>) -> String {
        format!(
            "Recording(device={}, sensor={}x{}, polarity={}, frames={}, rejected={})",
            self.device,
            self.sensor_size.0,
            self.sensor_size.1,
            self.polarity.borrow(py).x.len(),
            self.frames.borrow(py).frames.len(),
            self.rejected
        )
    }
}

/// Accumulates per-container batches into columns.
#[derive(Default)]
struct Columns {
    polarity: Vec<caer_core::PolarityEvent>,
    special: Vec<caer_core::SpecialEvent>,
    imu6: Vec<caer_core::Imu6Event>,
    spikes: Vec<caer_core::SpikeEvent>,
    frames: Vec<FrameEvent>,
    rejected: usize,
}

impl Columns {
    fn extend(&mut self, batches: EventBatches) {
        self.polarity.extend(batches.polarity);
        self.special.extend(batches.special);
        self.imu6.extend(batches.imu6);
        self.spikes.extend(batches.spikes);
        self.frames.extend(batches.frames);
        self.rejected += batches.rejected.len();
    }

    fn into_recording(self, py: Python<'_>, descriptor: &DeviceDescriptor) -> PyResult<Recording> {
        let polarity = PolarityEvents {
            x: self.polarity.iter().map(|e| e.x).collect(),
            y: self.polarity.iter().map(|e| e.y).collect(),
            polarity: self.polarity.iter().map(|e| e.polarity as u8).collect(),
            timestamp: self.polarity.iter().map(|e| e.timestamp).collect(),
        };
        let special = SpecialEvents {
            kind: self.special.iter().map(|e| e.kind).collect(),
            data: self.special.iter().map(|e| e.data).collect(),
            timestamp: self.special.iter().map(|e| e.timestamp).collect(),
        };
        let imu6 = Imu6Events {
            accel: self.imu6.iter().map(|e| e.accel).collect(),
            gyro: self.imu6.iter().map(|e| e.gyro).collect(),
            temperature: self.imu6.iter().map(|e| e.temperature).collect(),
            timestamp: self.imu6.iter().map(|e| e.timestamp).collect(),
        };
        let spikes = SpikeEvents {
            neuron_id: self.spikes.iter().map(|e| e.neuron_id).collect(),
            source_core_id: self.spikes.iter().map(|e| e.source_core_id).collect(),
            chip_id: self.spikes.iter().map(|e| e.chip_id).collect(),
            timestamp: self.spikes.iter().map(|e| e.timestamp).collect(),
        };

        Ok(Recording {
            polarity: Py::new(py, polarity)?,
            special: Py::new(py, special)?,
            imu6: Py::new(py, imu6)?,
            spikes: Py::new(py, spikes)?,
            frames: Py::new(py, Frames { frames: self.frames })?,
            device: descriptor.device_string.clone(),
            sensor_size: (descriptor.dvs.width, descriptor.dvs.height),
            rejected: self.rejected,
        })
    }
}

fn decoder_options(
    frame_policy: &str,
    frame_sizing: &str,
    check_bounds: bool,
) -> PyResult<DecoderOptions> {
    let frame_policy = match frame_policy.to_lowercase().as_str() {
        "first" => FramePolicy::First,
        "all" => FramePolicy::All,
        other => {
            return Err(PyValueError::new_err(format!(
                "unknown frame policy {:?}, use 'first' or 'all'",
                other
            )))
        }
    };
    let frame_sizing = match frame_sizing.to_lowercase().as_str() {
        "record" => FrameSizing::Record,
        "sensor-canvas" | "sensor_canvas" => FrameSizing::SensorCanvas,
        other => {
            return Err(PyValueError::new_err(format!(
                "unknown frame sizing {:?}, use 'record' or 'sensor-canvas'",
                other
            )))
        }
    };
    Ok(DecoderOptions {
        frame_policy,
        frame_sizing,
        check_bounds,
    })
}

fn decode_reader<R: Read>(
    py: Python<'_>,
    mut reader: AedatReader<R>,
    descriptor: DeviceDescriptor,
    options: DecoderOptions,
) -> PyResult<Recording> {
    let decoder = PacketDecoder::new(&descriptor, options);
    let mut columns = Columns::default();

    while let Some(container) = reader
        .read_container()
        .map_err(|e| PyIOError::new_err(format!("Failed to read recording: {}", e)))?
    {
        columns.extend(decoder.decode_container(container));
    }

    columns.into_recording(py, &descriptor)
}

/// Decodes an AEDAT 3.1 recording.
///
/// Args:
///     path: Path to the .aedat file
///     frame_policy: 'first' (at most one frame per container) or 'all'
///     frame_sizing: 'record' or 'sensor-canvas'
///     check_bounds: Drop polarity packets with out-of-range coordinates
///
/// Returns:
///     Recording: polarity, special, imu6, spikes and frames
///
/// Example:
///     >>> import caer
///     >>> rec = caer.decode_file("recording.aedat")
///     >>> print(f"Decoded {len(rec.polarity)} polarity events")
///     >>> image = rec.frames[0]  # 2D numpy array
#[pyfunction]
#[pyo3(signature = (path, frame_policy="first", frame_sizing="record", check_bounds=true))]
fn decode_file(
    py: Python<'_>,
    path: &str,
    frame_policy: &str,
    frame_sizing: &str,
    check_bounds: bool,
) -> PyResult<Recording> {
    let options = decoder_options(frame_policy, frame_sizing, check_bounds)?;
    let reader = AedatReader::open(path)
        .map_err(|e| PyIOError::new_err(format!("Failed to open {}: {}", path, e)))?;
    let descriptor = reader.header().descriptor_or_unknown();
    decode_reader(py, reader, descriptor, options)
}

/// Decodes event packets held in memory.
///
/// The bytes may carry an AEDAT 3.1 text header; without a recognised source
/// the sensor geometry is taken from the arguments.
///
/// Args:
///     data: Concatenated event packets
///     sensor_width: DVS width in pixels (default: 346)
///     sensor_height: DVS height in pixels (default: 260)
///     frame_policy: 'first' (at most one frame per container) or 'all'
///     frame_sizing: 'record' or 'sensor-canvas'
///     check_bounds: Drop polarity packets with out-of-range coordinates
#[pyfunction]
#[pyo3(signature = (
    data,
    sensor_width=346,
    sensor_height=260,
    frame_policy="first",
    frame_sizing="record",
    check_bounds=true
))]
fn decode_bytes(
    py: Python<'_>,
    data: &[u8],
    sensor_width: u16,
    sensor_height: u16,
    frame_policy: &str,
    frame_sizing: &str,
    check_bounds: bool,
) -> PyResult<Recording> {
    let options = decoder_options(frame_policy, frame_sizing, check_bounds)?;
    let reader = AedatReader::new(Cursor::new(data))
        .map_err(|e| PyValueError::new_err(format!("Invalid data: {}", e)))?;
    let descriptor = reader.header().descriptor().unwrap_or_else(|| {
        DeviceDescriptor::davis(1, "", Geometry::new(sensor_width, sensor_height))
    });
    decode_reader(py, reader, descriptor, options)
}

/// Event recording decoder module for Python.
#[pymodule]
fn caer(_py: Python<'_>, m: &PyModule) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(decode_file, m)?)?;
    m.add_function(wrap_pyfunction!(decode_bytes, m)?)?;
    m.add_class::<Recording>()?;
    m.add_class::<PolarityEvents>()?;
    m.add_class::<SpecialEvents>()?;
    m.add_class::<Imu6Events>()?;
    m.add_class::<SpikeEvents>()?;
    m.add_class::<Frames>()?;
    Ok(())
}
