use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Result, anyhow};
use serde::Deserialize;

use crate::constants::FILE_PASST_LOG;
use crate::network::istio::default_reserved_ports;

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
struct ConfigFile {
    debug: Option<bool>,
    passt_log_file: Option<String>,
    reserved_ports: Option<Vec<u16>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub debug: bool,
    pub passt_log_file: String,
    pub reserved_ports: Vec<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            debug: false,
            passt_log_file: FILE_PASST_LOG.into(),
            reserved_ports: default_reserved_ports(),
        }
    }
}

impl Config {
    pub fn from_string(value: &str) -> Result<Self> {
        if value.trim().is_empty() {
            return Ok(Self::default());
        }
        let file = serde_yaml2::from_str::<ConfigFile>(value)
            .map_err(|e| anyhow!("unable to parse config: {}", e))?;
        Ok(Self::default().merge(file))
    }

    /// Reads the config at `path`. A missing file yields the defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(s) => Self::from_string(&s),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(anyhow!("unable to read config {:?}: {}", path, e)),
        }
    }

    fn merge(mut self, file: ConfigFile) -> Self {
        if let Some(debug) = file.debug {
            self.debug = debug;
        }
        if let Some(passt_log_file) = file.passt_log_file {
            self.passt_log_file = passt_log_file;
        }
        if let Some(reserved_ports) = file.reserved_ports {
            self.reserved_ports = reserved_ports;
        }
        self
    }
}
