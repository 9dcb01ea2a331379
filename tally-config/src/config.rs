use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tally_log::LogConfig;
use tally_metrics::{BatchPersisterConfig, ReporterConfig, RuntimeConfig};

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Indicates config related errors.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, thiserror::Error)]
pub enum ConfigErrorKind {
    /// Failed to open the file.
    #[error("could not open config file")]
    CouldNotOpenFile,
    /// Parsing YAML failed.
    #[error("could not parse yaml config file")]
    BadYaml,
    /// Parsing JSON failed.
    #[error("could not parse json config file")]
    BadJson,
    /// Invalid config value.
    #[error("invalid config value")]
    InvalidValue,
    /// The file extension is neither YAML nor JSON.
    #[error("unknown config file format")]
    UnknownFormat,
}

/// Indicates config related errors.
#[derive(Debug)]
pub struct ConfigError {
    kind: ConfigErrorKind,
    file: Option<PathBuf>,
    source: Option<BoxError>,
}

impl ConfigError {
    #[inline]
    fn new(kind: ConfigErrorKind) -> Self {
        Self {
            kind,
            file: None,
            source: None,
        }
    }

    #[inline]
    fn wrap<E>(source: E, kind: ConfigErrorKind) -> Self
    where
        E: Into<BoxError>,
    {
        Self {
            kind,
            file: None,
            source: Some(source.into()),
        }
    }

    #[inline]
    fn file(mut self, path: &Path) -> Self {
        self.file = Some(path.to_path_buf());
        self
    }

    /// Returns the error kind of the error.
    pub fn kind(&self) -> ConfigErrorKind {
        self.kind
    }

    /// Returns the path of the file that failed to load, if any.
    pub fn path(&self) -> Option<&Path> {
        self.file.as_deref()
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.file {
            Some(file) => write!(f, "{} (file {})", self.kind, file.display()),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

enum ConfigFormat {
    Yaml,
    Json,
}

impl ConfigFormat {
    fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "yml" | "yaml" => Some(Self::Yaml),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Configuration of the logging system, the reporter, the batch persister and the runtime
/// recorder.
///
/// All sections are optional and fall back to their defaults:
///
/// ```yaml
/// logging:
///   level: debug
/// reporter:
///   period: 10s
///   prefix: myapp.
///   global_tags:
///     region: eu
/// pipeline:
///   push_interval: 500ms
///   error_limit: 3
/// runtime:
///   enabled: true
/// ```
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Logging setup.
    pub logging: LogConfig,
    /// Periodic flushing of the measurement set.
    pub reporter: ReporterConfig,
    /// Batched persistence of raw measurements.
    pub pipeline: BatchPersisterConfig,
    /// Sampling of process statistics.
    pub runtime: RuntimeConfig,
}

impl Config {
    /// Loads the configuration from a YAML or JSON file, depending on its extension.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let format = ConfigFormat::from_path(path)
            .ok_or_else(|| ConfigError::new(ConfigErrorKind::UnknownFormat).file(path))?;

        let contents = fs::read_to_string(path)
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::CouldNotOpenFile).file(path))?;

        let config: Self = match format {
            ConfigFormat::Yaml => serde_yaml::from_str(&contents)
                .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::BadYaml).file(path))?,
            ConfigFormat::Json => serde_json::from_str(&contents)
                .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::BadJson).file(path))?,
        };

        config.validate().map_err(|e| e.file(path))?;
        Ok(config)
    }

    /// Parses the configuration from a YAML string.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::BadYaml))?;
        config.validate()?;
        Ok(config)
    }

    /// Creates the configuration from a JSON value.
    pub fn from_json_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_value(value)
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::BadJson))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.reporter
            .validate()
            .and_then(|()| self.pipeline.validate())
            .and_then(|()| self.runtime.validate())
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::InvalidValue))
    }
}
