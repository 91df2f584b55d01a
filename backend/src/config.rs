//! Configuration management.

use crate::annotate::DEFAULT_OVERLAY_LABEL;
use crate::graph::assembler::{AssemblerConfig, MuxSettings, SinkSettings};
use crate::graph::Codec;
use crate::publisher::SessionDescription;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use osdcast_types::PropertyValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Configuration structure that matches the TOML file format.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    source: SourceConfig,
    #[serde(default)]
    encoder: EncoderConfig,
    #[serde(default)]
    inference: InferenceConfig,
    #[serde(default)]
    mux: MuxSettings,
    #[serde(default)]
    rtsp: RtspConfig,
    #[serde(default)]
    overlay: OverlayConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SourceConfig {
    /// Device path or URI
    input: Option<String>,
    /// Caps forced on capture devices
    camera_caps: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            input: None,
            camera_caps: AssemblerConfig::default().camera_caps,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EncoderConfig {
    codec: String,
    bitrate: u32,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        let defaults = AssemblerConfig::default();
        Self {
            codec: defaults.codec,
            bitrate: defaults.bitrate,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct InferenceConfig {
    config_file: PathBuf,
    tracker_config: Option<PathBuf>,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            config_file: AssemblerConfig::default().infer_config,
            tracker_config: None,
        }
    }
}

/// RTSP mount and the UDP hop feeding it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RtspConfig {
    pub port: u16,
    pub mount_path: String,
    pub udp_host: String,
    pub udp_port: u16,
}

impl Default for RtspConfig {
    fn default() -> Self {
        Self {
            port: osdcast_types::DEFAULT_RTSP_PORT,
            mount_path: osdcast_types::DEFAULT_MOUNT_PATH.to_string(),
            udp_host: osdcast_types::DEFAULT_UDP_HOST.to_string(),
            udp_port: osdcast_types::DEFAULT_UDP_PORT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OverlayConfig {
    label: String,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            label: DEFAULT_OVERLAY_LABEL.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct LoggingConfig {
    /// Path to log file (if set, logs will be written to file in addition to stdout)
    log_file: Option<PathBuf>,
    /// Log level (trace, debug, info, warn, error)
    /// If not set, uses RUST_LOG environment variable or defaults to "info"
    log_level: Option<String>,
}

/// Values given on the command line. Unset fields leave lower layers alone.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub input: Option<String>,
    pub codec: Option<String>,
    pub bitrate: Option<u32>,
    pub infer_config: Option<PathBuf>,
    pub tracker_config: Option<PathBuf>,
    pub rtsp_port: Option<u16>,
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub input: Option<String>,
    pub camera_caps: String,
    /// Codec selector, validated when the pipeline is assembled
    pub codec: String,
    pub bitrate: u32,
    pub infer_config: PathBuf,
    pub tracker_config: Option<PathBuf>,
    pub mux: MuxSettings,
    pub rtsp: RtspConfig,
    pub overlay_label: String,
    /// Path to log file (if set, logs will be written to file in addition to stdout)
    pub log_file: Option<PathBuf>,
    /// Log level (if set, overrides RUST_LOG environment variable)
    pub log_level: Option<String>,
}

impl Config {
    /// Load configuration with full priority chain: CLI args > env vars > config files > defaults.
    ///
    /// Config files are searched in this order:
    /// 1. `config.toml` in user config directory (~/.config/osdcast/ on Linux)
    /// 2. `.osdcast.toml` in current directory
    pub fn from_figment(cli: &CliOverrides) -> anyhow::Result<Self> {
        let local_config = std::env::current_dir()
            .ok()
            .map(|d| d.join(".osdcast.toml"));
        let user_config = directories::ProjectDirs::from("", "", "osdcast")
            .map(|dirs| dirs.config_dir().join("config.toml"));

        // 1. Start with defaults
        let mut figment = Figment::new().merge(Serialized::defaults(ConfigFile::default()));

        // 2. Merge user config file if it exists
        if let Some(ref path) = user_config {
            if path.exists() {
                figment = figment.merge(Toml::file(path));
            }
        }

        // 3. Merge local config file if it exists
        if let Some(ref path) = local_config {
            if path.exists() {
                figment = figment.merge(Toml::file(path));
            }
        }

        // 4. Merge environment variables (OSDCAST_SECTION__KEY)
        figment = figment.merge(Env::prefixed("OSDCAST_").split("__"));

        // 5. Merge CLI arguments (highest priority)
        if let Some(ref input) = cli.input {
            figment = figment.merge(Serialized::default("source.input", input));
        }
        if let Some(ref codec) = cli.codec {
            figment = figment.merge(Serialized::default("encoder.codec", codec));
        }
        if let Some(bitrate) = cli.bitrate {
            figment = figment.merge(Serialized::default("encoder.bitrate", bitrate));
        }
        if let Some(ref path) = cli.infer_config {
            figment = figment.merge(Serialized::default("inference.config_file", path));
        }
        if let Some(ref path) = cli.tracker_config {
            figment = figment.merge(Serialized::default("inference.tracker_config", path));
        }
        if let Some(port) = cli.rtsp_port {
            figment = figment.merge(Serialized::default("rtsp.port", port));
        }

        let config_file: ConfigFile = figment.extract()?;

        Ok(Self {
            input: config_file.source.input,
            camera_caps: config_file.source.camera_caps,
            codec: config_file.encoder.codec,
            bitrate: config_file.encoder.bitrate,
            infer_config: config_file.inference.config_file,
            tracker_config: config_file.inference.tracker_config,
            mux: config_file.mux,
            rtsp: config_file.rtsp,
            overlay_label: config_file.overlay.label,
            log_file: config_file.logging.log_file,
            log_level: config_file.logging.log_level,
        })
    }

    /// Assembler input for this configuration and the loaded tracker properties.
    pub fn assembler_config(
        &self,
        tracker: Option<BTreeMap<String, PropertyValue>>,
    ) -> AssemblerConfig {
        AssemblerConfig {
            codec: self.codec.clone(),
            bitrate: self.bitrate,
            input: self.input.clone().unwrap_or_default(),
            infer_config: self.infer_config.clone(),
            tracker,
            camera_caps: self.camera_caps.clone(),
            mux: self.mux.clone(),
            sink: SinkSettings {
                host: self.rtsp.udp_host.clone(),
                port: self.rtsp.udp_port,
            },
            ..Default::default()
        }
    }

    pub fn session_description(&self, codec: Codec) -> SessionDescription {
        SessionDescription {
            rtsp_port: self.rtsp.port,
            mount_path: self.rtsp.mount_path.clone(),
            udp_port: self.rtsp.udp_port,
            codec,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_figment(&CliOverrides::default()).unwrap_or_else(|_| {
            let file = ConfigFile::default();
            Self {
                input: None,
                camera_caps: file.source.camera_caps,
                codec: file.encoder.codec,
                bitrate: file.encoder.bitrate,
                infer_config: file.inference.config_file,
                tracker_config: None,
                mux: file.mux,
                rtsp: file.rtsp,
                overlay_label: file.overlay.label,
                log_file: None,
                log_level: None,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;
    use tempfile::TempDir;

    const ENV_VARS: [&str; 3] = [
        "OSDCAST_ENCODER__BITRATE",
        "OSDCAST_RTSP__PORT",
        "OSDCAST_MUX__BATCH_SIZE",
    ];

    /// Run `f` in an empty temp directory with the OSDCAST_ variables this
    /// module touches cleared, restoring both afterwards.
    fn isolated<T>(local_config: Option<&str>, f: impl FnOnce() -> T) -> T {
        let saved: Vec<_> = ENV_VARS
            .iter()
            .map(|name| (*name, std::env::var(name).ok()))
            .collect();
        for name in ENV_VARS {
            std::env::remove_var(name);
        }

        let temp_dir = TempDir::new().unwrap();
        if let Some(content) = local_config {
            fs::write(temp_dir.path().join(".osdcast.toml"), content).unwrap();
        }
        let original_dir = std::env::current_dir().unwrap();
        std::env::set_current_dir(&temp_dir).unwrap();

        let result = f();

        // Restore (restore dir before temp_dir is dropped, ignore errors)
        let _ = std::env::set_current_dir(&original_dir);
        for (name, value) in saved {
            match value {
                Some(v) => std::env::set_var(name, v),
                None => std::env::remove_var(name),
            }
        }
        result
    }

    #[test]
    #[serial]
    fn test_from_figment_defaults() {
        let config = isolated(None, || Config::from_figment(&CliOverrides::default()).unwrap());

        assert!(config.input.is_none());
        assert_eq!(config.codec, "H264");
        assert_eq!(config.bitrate, 4_000_000);
        assert_eq!(config.rtsp.port, 8555);
        assert_eq!(config.rtsp.mount_path, "/ds-test");
        assert_eq!(config.rtsp.udp_host, "224.224.255.255");
        assert_eq!(config.rtsp.udp_port, 5400);
        assert_eq!(config.mux.width, 1280);
        assert_eq!(config.mux.batched_push_timeout, 4_000_000);
        assert_eq!(config.overlay_label, "FPS");
        assert!(config.tracker_config.is_none());
    }

    #[test]
    #[serial]
    fn test_from_figment_config_file() {
        let content = r#"
[source]
input = "file:///media/sample_720p.h264"

[encoder]
codec = "H265"
bitrate = 2000000

[inference]
tracker_config = "tracker.txt"

[overlay]
label = "yolov8n_FPS"
"#;
        let config = isolated(Some(content), || {
            Config::from_figment(&CliOverrides::default()).unwrap()
        });

        assert_eq!(config.input.as_deref(), Some("file:///media/sample_720p.h264"));
        assert_eq!(config.codec, "H265");
        assert_eq!(config.bitrate, 2_000_000);
        assert_eq!(config.tracker_config, Some(PathBuf::from("tracker.txt")));
        assert_eq!(config.overlay_label, "yolov8n_FPS");
    }

    #[test]
    #[serial]
    fn test_from_figment_env_vars_override_config_file() {
        let config = isolated(Some("[encoder]\nbitrate = 1000\n[mux]\nbatch_size = 2"), || {
            std::env::set_var("OSDCAST_ENCODER__BITRATE", "3000");
            std::env::set_var("OSDCAST_MUX__BATCH_SIZE", "4");
            Config::from_figment(&CliOverrides::default()).unwrap()
        });

        assert_eq!(config.bitrate, 3000);
        assert_eq!(config.mux.batch_size, 4);
    }

    #[test]
    #[serial]
    fn test_from_figment_cli_overrides_env_and_config() {
        let cli = CliOverrides {
            input: Some("/dev/video1".to_string()),
            bitrate: Some(9999),
            rtsp_port: Some(9555),
            ..Default::default()
        };
        let config = isolated(Some("[encoder]\nbitrate = 1000"), || {
            std::env::set_var("OSDCAST_ENCODER__BITRATE", "3000");
            std::env::set_var("OSDCAST_RTSP__PORT", "7555");
            Config::from_figment(&cli).unwrap()
        });

        assert_eq!(config.input.as_deref(), Some("/dev/video1"));
        assert_eq!(config.bitrate, 9999);
        assert_eq!(config.rtsp.port, 9555);
    }

    #[test]
    #[serial]
    fn test_assembler_config_and_session() {
        let cli = CliOverrides {
            input: Some("/dev/video0".to_string()),
            codec: Some("H265".to_string()),
            ..Default::default()
        };
        let config = isolated(Some("[rtsp]\nudp_port = 6000"), || {
            Config::from_figment(&cli).unwrap()
        });

        let assembler = config.assembler_config(None);
        assert_eq!(assembler.input, "/dev/video0");
        assert_eq!(assembler.sink.port, 6000);
        assert_eq!(assembler.mux, MuxSettings::default());

        let session = config.session_description(Codec::select(&assembler.codec).unwrap());
        assert_eq!(session.udp_port, 6000);
        assert_eq!(session.codec, Codec::H265);
        assert_eq!(session.url(), "rtsp://localhost:8555/ds-test");
    }
}
