//! Device acquisition loop.
//!
//! [`Acquisition`] owns one device handle and moves through
//! `Idle -> Streaming -> Draining -> Closed`. Setup happens in
//! [`Acquisition::start`]; each [`Acquisition::next_tick`] performs one
//! blocking read and returns the decoded batches. Cancellation is observed
//! between reads, and the device is always stopped (if started) and closed
//! exactly once, on whatever path the acquisition ends.

use crate::decoder::{DecoderOptions, PacketDecoder};
use crate::device::{
    Device, DeviceError, DeviceOpener, OpenRequest, HOST_CONFIG_DATAEXCHANGE,
    HOST_CONFIG_DATAEXCHANGE_BLOCKING,
};
use crate::types::{DeviceDescriptor, EventBatches};
use log::{debug, info, trace};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Fatal errors raised while opening and setting up a device.
#[derive(Error, Debug)]
pub enum AcquisitionError {
    #[error("device not found: {0}")]
    DeviceNotFound(#[source] DeviceError),

    #[error("default configuration upload failed: {0}")]
    DefaultConfig(#[source] DeviceError),

    #[error("setting module {module} parameter {param} failed: {source}")]
    ConfigSet {
        module: i8,
        param: u8,
        #[source]
        source: DeviceError,
    },

    #[error("enabling blocking data exchange failed: {0}")]
    ExchangeMode(#[source] DeviceError),

    #[error("data start failed: {0}")]
    Start(#[source] DeviceError),
}

/// One configuration override, applied after the default configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ConfigParam {
    pub module: i8,
    pub param: u8,
    pub value: u32,
}

/// Settings for an acquisition session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    pub decoder: DecoderOptions,
    /// Applied in order through `config_set`
    pub config: Vec<ConfigParam>,
}

/// Lifecycle of an [`Acquisition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionState {
    /// Opened, being configured
    Idle,
    /// Data transfer running
    Streaming,
    /// Cancelled, stopping the transfer
    Draining,
    /// Device released
    Closed,
}

/// Cooperative cancellation flag shared with other threads.
#[derive(Debug, Clone, Default)]
pub struct StopToken(Arc<AtomicBool>);

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests shutdown; takes effect before the next device read.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A running acquisition on one exclusively owned device.
pub struct Acquisition<D: Device> {
    device: D,
    descriptor: DeviceDescriptor,
    decoder: PacketDecoder,
    state: AcquisitionState,
    stop: StopToken,
    containers: u64,
    empty_ticks: u64,
}

impl<D: Device> Acquisition<D> {
    /// Opens a device through `opener` and starts streaming from it.
    pub fn open<O>(
        opener: &O,
        request: &OpenRequest,
        config: AcquisitionConfig,
    ) -> Result<Self, AcquisitionError>
    where
        O: DeviceOpener<Device = D>,
    {
        let device = opener
            .open(request)
            .map_err(AcquisitionError::DeviceNotFound)?;
        Self::start(device, config)
    }

    /// Configures `device` and starts the data transfer.
    ///
    /// Sends the default configuration, applies the overrides in `config`,
    /// enables blocking data exchange and starts the transfer. If any step
    /// fails the device is closed and the failing step is reported.
    pub fn start(device: D, config: AcquisitionConfig) -> Result<Self, AcquisitionError> {
        let descriptor = device.descriptor();
        info!(
            "{} --- ID: {}, serial: {}, master: {}, DVS: {}x{}",
            descriptor.device_string,
            descriptor.device_id,
            descriptor.serial_number,
            descriptor.is_master,
            descriptor.dvs.width,
            descriptor.dvs.height
        );

        let decoder = PacketDecoder::new(&descriptor, config.decoder);
        let mut acquisition = Self {
            device,
            descriptor,
            decoder,
            state: AcquisitionState::Idle,
            stop: StopToken::new(),
            containers: 0,
            empty_ticks: 0,
        };

        // Early returns drop `acquisition`, which closes the device.
        acquisition
            .device
            .send_default_config()
            .map_err(AcquisitionError::DefaultConfig)?;

        for p in &config.config {
            acquisition
                .device
                .config_set(p.module, p.param, p.value)
                .map_err(|source| AcquisitionError::ConfigSet {
                    module: p.module,
                    param: p.param,
                    source,
                })?;
        }

        acquisition
            .device
            .config_set(
                HOST_CONFIG_DATAEXCHANGE,
                HOST_CONFIG_DATAEXCHANGE_BLOCKING,
                1,
            )
            .map_err(AcquisitionError::ExchangeMode)?;

        acquisition
            .device
            .data_start()
            .map_err(AcquisitionError::Start)?;

        acquisition.state = AcquisitionState::Streaming;
        info!("data transfer started");
        Ok(acquisition)
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> AcquisitionState {
        self.state
    }

    pub fn decoder(&self) -> &PacketDecoder {
        &self.decoder
    }

    /// Token that cancels this acquisition from another thread.
    pub fn stop_token(&self) -> StopToken {
        self.stop.clone()
    }

    /// Containers received so far.
    pub fn containers_received(&self) -> u64 {
        self.containers
    }

    /// Reads that returned no container.
    pub fn empty_ticks(&self) -> u64 {
        self.empty_ticks
    }

    /// Performs one read and decodes it.
    ///
    /// A read that returns no container yields empty batches. Returns `None`
    /// once cancellation has been observed; the device is stopped and closed
    /// at that point and no further reads are made.
    pub fn next_tick(&mut self) -> Option<EventBatches> {
        if self.state != AcquisitionState::Streaming {
            return None;
        }
        if self.stop.is_cancelled() {
            info!("cancellation requested");
            self.finish();
            return None;
        }

        let batches = match self.device.data_get() {
            Some(container) => {
                self.containers += 1;
                trace!(
                    "container {} with {} sub-packet slot(s)",
                    self.containers,
                    container.len()
                );
                self.decoder.decode_container(container)
            }
            None => {
                self.empty_ticks += 1;
                EventBatches::default()
            }
        };

        debug!(
            "tick: {} polarity, {} frame, {} imu6, {} special, {} spike, {} rejected",
            batches.polarity.len(),
            batches.frames.len(),
            batches.imu6.len(),
            batches.special.len(),
            batches.spikes.len(),
            batches.rejected.len()
        );
        Some(batches)
    }

    /// Stops and closes the device.
    pub fn shutdown(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        match self.state {
            AcquisitionState::Closed => return,
            AcquisitionState::Streaming | AcquisitionState::Draining => {
                self.state = AcquisitionState::Draining;
                self.device.data_stop();
                debug!("data transfer stopped");
            }
            AcquisitionState::Idle => {}
        }
        self.device.close();
        self.state = AcquisitionState::Closed;
        info!(
            "device closed after {} container(s), {} empty read(s)",
            self.containers, self.empty_ticks
        );
    }
}

impl<D: Device> Iterator for Acquisition<D> {
    type Item = EventBatches;

    fn next(&mut self) -> Option<EventBatches> {
        self.next_tick()
    }
}

impl<D: Device> Drop for Acquisition<D> {
    fn drop(&mut self) {
        self.finish();
    }
}
