//! Configuration management.
//!
//! Settings are deserialized from a TOML file with serde defaults for every
//! field, so a minimal file (or none at all) yields a working local-loopback
//! configuration. Validation catches the values that parse but are
//! semantically wrong, e.g. an empty channel list.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CamError, CamResult};
use crate::protocol::DEFAULT_CAM_PORT;

/// How a Z-stack is reduced to one 2D image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StackMode {
    /// Read exactly the slice the server reported.
    None,
    /// Sum all slices and divide by the accumulated intensity scale.
    Mean,
    /// Element-wise maximum across slices.
    Max,
}

/// When to issue a session-boundary command (start-scan, stop-waiting).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum CommandPolicy {
    /// Send after each processed object set.
    #[serde(rename = "default")]
    Immediate,
    /// Never send.
    #[serde(rename = "none")]
    Never,
    /// Send once at the end of the run.
    #[serde(rename = "deferred")]
    Deferred,
}

/// Which per-object measurement supplies the object center.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CenterSource {
    Location,
    AreaShape,
    BoundingBox,
}

/// One image channel to read per acquisition. The first entry is the
/// primary channel; up to four more may follow.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelSettings {
    /// Operator-facing 1-based channel number. The filename token value is
    /// this number minus one.
    pub number: u8,
    /// Name under which the resulting image is published to the pipeline.
    pub output_name: String,
}

/// Connection parameters for the CAM server.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// IP address (or hostname) of the CAM server.
    pub address: String,
    pub port: u16,
    /// System identifier passed in every command; zero on most microscopes.
    pub sys_id: u32,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Window for one `wait_for_image` call.
    #[serde(with = "humantime_serde")]
    pub wait_timeout: Duration,
    /// Drain stale notifications before each wait.
    pub flush_on_start: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: DEFAULT_CAM_PORT,
            sys_id: 0,
            connect_timeout: Duration::from_secs(10),
            wait_timeout: Duration::from_secs(400),
            flush_on_start: false,
        }
    }
}

/// What to acquire and how to read it back from disk.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AcquisitionSettings {
    /// Local root under which the server-relative image paths resolve.
    pub base_path: PathBuf,
    /// Job number whose notifications matter; -1 adopts the first one seen.
    pub job_of_interest: i32,
    /// Number of image sets to process before the session is considered
    /// complete. Bounds an otherwise open-ended acquisition loop.
    pub image_sets: u32,
    pub stack_mode: StackMode,
    pub channels: Vec<ChannelSettings>,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            base_path: PathBuf::new(),
            job_of_interest: -1,
            image_sets: 100_000,
            stack_mode: StackMode::None,
            channels: vec![ChannelSettings {
                number: 1,
                output_name: "OutputImage".to_string(),
            }],
        }
    }
}

/// Job-emission behavior.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
    /// Name of the CAM job invoked per object.
    pub cam_job: String,
    /// Clear the server-side job queue before queueing, even when the
    /// object set is empty.
    pub delete_list: bool,
    /// Per well, per timepoint, per object class. -1 is unlimited.
    pub max_objects_per_well: i32,
    pub start_scan: CommandPolicy,
    pub stop_waiting: CommandPolicy,
    pub center_source: CenterSource,
    pub flip_x: bool,
    pub flip_y: bool,
    pub swap_xy: bool,
    /// Fixed pixel offsets compensating objective misalignment.
    pub offset_x: i32,
    pub offset_y: i32,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            cam_job: "Hiresjob".to_string(),
            delete_list: true,
            max_objects_per_well: -1,
            start_scan: CommandPolicy::Immediate,
            stop_waiting: CommandPolicy::Immediate,
            center_source: CenterSource::Location,
            flip_x: false,
            flip_y: false,
            swap_xy: false,
            offset_x: 0,
            offset_y: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub log_level: Option<String>,
    pub server: ServerSettings,
    pub acquisition: AcquisitionSettings,
    pub dispatch: DispatchSettings,
}

impl Settings {
    /// Load settings from a TOML file; a missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> CamResult<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path));
        } else {
            builder = builder.add_source(::config::File::with_name("camlink").required(false));
        }
        let settings: Settings = builder
            .build()
            .map_err(CamError::Config)?
            .try_deserialize()
            .map_err(CamError::Config)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Semantic checks beyond what deserialization enforces.
    pub fn validate(&self) -> CamResult<()> {
        if self.acquisition.channels.is_empty() {
            return Err(CamError::Configuration(
                "at least one acquisition channel is required".to_string(),
            ));
        }
        if self.acquisition.channels.len() > 5 {
            return Err(CamError::Configuration(format!(
                "at most 5 channels are supported, got {}",
                self.acquisition.channels.len()
            )));
        }
        for channel in &self.acquisition.channels {
            if !(1..=9).contains(&channel.number) {
                return Err(CamError::Configuration(format!(
                    "channel number {} outside 1..=9",
                    channel.number
                )));
            }
            if channel.output_name.is_empty() {
                return Err(CamError::Configuration(
                    "channel output name must not be empty".to_string(),
                ));
            }
        }
        if self.acquisition.job_of_interest < -1 {
            return Err(CamError::Configuration(format!(
                "job_of_interest must be -1 or a job number, got {}",
                self.acquisition.job_of_interest
            )));
        }
        if self.dispatch.max_objects_per_well < -1 {
            return Err(CamError::Configuration(format!(
                "max_objects_per_well must be -1 or a count, got {}",
                self.dispatch.max_objects_per_well
            )));
        }
        Ok(())
    }
}
