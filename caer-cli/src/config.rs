use caer_core::{AcquisitionConfig, ConfigParam, DecoderOptions, FramePolicy, FrameSizing};
use confique::Config;

/// Settings loadable from a TOML file; command-line flags take precedence.
#[derive(Config, Debug, Clone)]
pub struct Conf {
    #[config(nested)]
    pub decoder: DecoderSettings,
    #[config(nested)]
    pub run: RunSettings,
    /// Device configuration overrides, applied after the defaults
    pub device_config: Option<Vec<ConfigParam>>,
}

#[derive(Config, Debug, Clone)]
pub struct DecoderSettings {
    #[config(default = "first")]
    pub frame_policy: FramePolicy,
    #[config(default = "record")]
    pub frame_sizing: FrameSizing,
    #[config(default = true)]
    pub check_bounds: bool,
}

#[derive(Config, Debug, Clone)]
pub struct RunSettings {
    #[config(default = "x,y,p,t")]
    pub field_order: String,
    /// Consecutive reads without data before the run ends
    #[config(default = 3)]
    pub idle_ticks: u64,
    pub max_containers: Option<u64>,
}

impl Conf {
    pub fn acquisition(&self) -> AcquisitionConfig {
        AcquisitionConfig {
            decoder: DecoderOptions {
                frame_policy: self.decoder.frame_policy,
                frame_sizing: self.decoder.frame_sizing,
                check_bounds: self.decoder.check_bounds,
            },
            config: self.device_config.clone().unwrap_or_default(),
        }
    }
}
