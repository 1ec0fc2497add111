use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Operating system family of a runner instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsType {
    #[default]
    Linux,
    Windows,
    #[serde(other)]
    Unknown,
}

impl OsType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Linux => "linux",
            Self::Windows => "windows",
            Self::Unknown => "unknown",
        }
    }

    /// OS name used by runner tool downloads.
    fn download_name(&self) -> Option<&'static str> {
        match self {
            Self::Linux => Some("linux"),
            Self::Windows => Some("win"),
            Self::Unknown => None,
        }
    }
}

impl fmt::Display for OsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OsType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "linux" => Ok(Self::Linux),
            "windows" => Ok(Self::Windows),
            other => Err(Error::Validation(format!("unknown os type: {other}"))),
        }
    }
}

/// CPU architecture of a runner instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsArch {
    #[default]
    Amd64,
    Arm64,
    Arm,
    I386,
    #[serde(other)]
    Unknown,
}

impl OsArch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Amd64 => "amd64",
            Self::Arm64 => "arm64",
            Self::Arm => "arm",
            Self::I386 => "i386",
            Self::Unknown => "unknown",
        }
    }

    /// Architecture name used by runner tool downloads.
    fn download_name(&self) -> Option<&'static str> {
        match self {
            Self::Amd64 => Some("x64"),
            Self::Arm64 => Some("arm64"),
            Self::Arm => Some("arm"),
            Self::I386 | Self::Unknown => None,
        }
    }
}

impl fmt::Display for OsArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OsArch {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "amd64" => Ok(Self::Amd64),
            "arm64" => Ok(Self::Arm64),
            "arm" => Ok(Self::Arm),
            "i386" => Ok(Self::I386),
            other => Err(Error::Validation(format!("unknown os arch: {other}"))),
        }
    }
}

/// A runner tool archive the orchestrator offers for download.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerApplicationDownload {
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub download_url: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256_checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_download_token: Option<String>,
}

impl RunnerApplicationDownload {
    /// Whether this download is built for the given platform.
    pub fn matches(&self, os_type: OsType, os_arch: OsArch) -> bool {
        match (os_type.download_name(), os_arch.download_name()) {
            (Some(os), Some(arch)) => self.os == os && self.architecture == arch,
            _ => false,
        }
    }
}

/// Create request sent by the orchestrator for one runner instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BootstrapInstance {
    pub name: String,
    #[serde(default)]
    pub tools: Vec<RunnerApplicationDownload>,
    #[serde(default)]
    pub repo_url: String,
    #[serde(rename = "callback-url", default)]
    pub callback_url: String,
    #[serde(rename = "metadata-url", default)]
    pub metadata_url: String,
    #[serde(rename = "instance-token", default)]
    pub instance_token: String,
    #[serde(rename = "ssh-keys", default)]
    pub ssh_keys: Vec<String>,
    /// Base64 encoded PEM bundle of extra CA certificates.
    #[serde(rename = "ca-cert-bundle", default, skip_serializing_if = "Option::is_none")]
    pub ca_cert_bundle: Option<String>,
    #[serde(default)]
    pub os_type: OsType,
    #[serde(rename = "arch", default)]
    pub os_arch: OsArch,
    #[serde(default)]
    pub flavor: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub pool_id: String,
    /// Runner group to register in. Empty means the default group.
    #[serde(rename = "github-runner-group", default)]
    pub runner_group: String,
    /// Register with just-in-time credentials served from the metadata URL
    /// instead of a registration token.
    #[serde(default)]
    pub jit_config_enabled: bool,
    /// Per-pool override document, validated against the extra specs schema.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub extra_specs: serde_json::Value,
}

/// Canonical instance status reported back to the orchestrator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Running,
    Stopped,
    #[default]
    Unknown,
}

/// Instance record derived from a live CloudStack VM and its tags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderInstance {
    #[serde(default)]
    pub provider_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_type: Option<OsType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_arch: Option<OsArch>,
    #[serde(default)]
    pub status: InstanceStatus,
}
