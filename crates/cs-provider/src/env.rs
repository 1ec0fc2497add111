use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use cs_infra::CloudStackProvider;

use crate::error::{CliError, Result};

/// Operations the orchestrator can ask of the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    CreateInstance,
    DeleteInstance,
    GetInstance,
    ListInstances,
    RemoveAllInstances,
    Stop,
    Start,
    GetVersion,
    GetSupportedInterfaceVersions,
    ValidatePoolInfo,
    GetConfigJsonSchema,
    GetExtraSpecsJsonSchema,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateInstance => "CreateInstance",
            Self::DeleteInstance => "DeleteInstance",
            Self::GetInstance => "GetInstance",
            Self::ListInstances => "ListInstances",
            Self::RemoveAllInstances => "RemoveAllInstances",
            Self::Stop => "StopInstance",
            Self::Start => "StartInstance",
            Self::GetVersion => "GetVersion",
            Self::GetSupportedInterfaceVersions => "GetSupportedInterfaceVersions",
            Self::ValidatePoolInfo => "ValidatePoolInfo",
            Self::GetConfigJsonSchema => "GetConfigJSONSchema",
            Self::GetExtraSpecsJsonSchema => "GetExtraSpecsJSONSchema",
        }
    }

    /// Whether the command talks to CloudStack and so needs a live provider.
    pub fn needs_provider(&self) -> bool {
        !matches!(
            self,
            Self::GetVersion
                | Self::GetSupportedInterfaceVersions
                | Self::ValidatePoolInfo
                | Self::GetConfigJsonSchema
                | Self::GetExtraSpecsJsonSchema
        )
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = CliError;

    fn from_str(s: &str) -> Result<Self> {
        let cmd = match s {
            "CreateInstance" => Self::CreateInstance,
            "DeleteInstance" => Self::DeleteInstance,
            "GetInstance" => Self::GetInstance,
            "ListInstances" => Self::ListInstances,
            "RemoveAllInstances" => Self::RemoveAllInstances,
            "StopInstance" => Self::Stop,
            "StartInstance" => Self::Start,
            "GetVersion" => Self::GetVersion,
            "GetSupportedInterfaceVersions" => Self::GetSupportedInterfaceVersions,
            "ValidatePoolInfo" => Self::ValidatePoolInfo,
            "GetConfigJSONSchema" => Self::GetConfigJsonSchema,
            "GetExtraSpecsJSONSchema" => Self::GetExtraSpecsJsonSchema,
            other => return Err(CliError::UnknownCommand(other.to_string())),
        };
        Ok(cmd)
    }
}

/// Invocation settings passed by the orchestrator through the environment.
#[derive(Debug, Clone)]
pub struct Environment {
    pub command: Command,
    pub config_file: Option<PathBuf>,
    pub controller_id: String,
    pub pool_id: String,
    pub instance_id: String,
    pub interface_version: Option<String>,
}

impl Environment {
    /// Read from env vars:
    ///
    /// - `GARM_COMMAND` (required)
    /// - `GARM_PROVIDER_CONFIG_FILE` (required for commands that reach CloudStack)
    /// - `GARM_CONTROLLER_ID` (required for commands that reach CloudStack)
    /// - `GARM_POOL_ID` (required for `ListInstances`)
    /// - `GARM_INSTANCE_ID` (required for single-instance commands)
    /// - `GARM_INTERFACE_VERSION` (optional)
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.is_empty());

        let command: Command = var("GARM_COMMAND")
            .ok_or(CliError::MissingEnv("GARM_COMMAND"))?
            .parse()?;

        let interface_version = var("GARM_INTERFACE_VERSION");
        if let Some(version) = &interface_version {
            if !CloudStackProvider::supported_interface_versions().contains(version) {
                return Err(CliError::UnsupportedInterface(version.clone()));
            }
        }

        let env = Self {
            command,
            config_file: var("GARM_PROVIDER_CONFIG_FILE").map(PathBuf::from),
            controller_id: var("GARM_CONTROLLER_ID").unwrap_or_default(),
            pool_id: var("GARM_POOL_ID").unwrap_or_default(),
            instance_id: var("GARM_INSTANCE_ID").unwrap_or_default(),
            interface_version,
        };
        env.require()?;
        Ok(env)
    }

    fn require(&self) -> Result<()> {
        if self.command.needs_provider() {
            if self.config_file.is_none() {
                return Err(CliError::MissingEnv("GARM_PROVIDER_CONFIG_FILE"));
            }
            if self.controller_id.is_empty() {
                return Err(CliError::MissingEnv("GARM_CONTROLLER_ID"));
            }
        }
        match self.command {
            Command::ListInstances if self.pool_id.is_empty() => {
                Err(CliError::MissingEnv("GARM_POOL_ID"))
            }
            Command::DeleteInstance | Command::GetInstance | Command::Stop | Command::Start
                if self.instance_id.is_empty() =>
            {
                Err(CliError::MissingEnv("GARM_INSTANCE_ID"))
            }
            _ => Ok(()),
        }
    }
}
