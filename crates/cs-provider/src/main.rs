mod env;
mod error;

use std::process::ExitCode;
use std::sync::Arc;

use cs_infra::platform::client_from_config;
use cs_infra::types::BootstrapInstance;
use cs_infra::{CloudStackProvider, ProviderConfig};
use tokio::io::AsyncReadExt;
use tracing::{debug, error, warn};
use tracing_subscriber::EnvFilter;

use crate::env::{Command, Environment};
use crate::error::{CliError, Result};

#[tokio::main]
async fn main() -> ExitCode {
    // stdout carries command results, logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let env = match Environment::from_env() {
        Ok(env) => env,
        Err(e) => {
            error!(error = %e, "invalid provider invocation");
            return ExitCode::FAILURE;
        }
    };
    debug!(command = %env.command, interface_version = ?env.interface_version, "running command");

    tokio::select! {
        result = run(&env) => match result {
            Ok(output) => {
                if !output.is_empty() {
                    println!("{output}");
                }
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!(command = %env.command, error = %e, "command failed");
                ExitCode::FAILURE
            }
        },
        _ = tokio::signal::ctrl_c() => {
            warn!(command = %env.command, "interrupted");
            ExitCode::from(130)
        }
    }
}

async fn run(env: &Environment) -> Result<String> {
    match env.command {
        Command::GetVersion => Ok(CloudStackProvider::version().to_string()),
        Command::GetSupportedInterfaceVersions => Ok(serde_json::to_string(
            &CloudStackProvider::supported_interface_versions(),
        )?),
        Command::GetConfigJsonSchema => Ok(CloudStackProvider::config_json_schema()?),
        Command::GetExtraSpecsJsonSchema => Ok(CloudStackProvider::extra_specs_json_schema()?),
        Command::ValidatePoolInfo => {
            let extra_specs = pool_extra_specs(&read_stdin().await?)?;
            CloudStackProvider::validate_pool_info(&extra_specs)?;
            Ok(String::new())
        }
        Command::CreateInstance => {
            let bootstrap: BootstrapInstance = serde_json::from_slice(&read_stdin().await?)?;
            let instance = connect(env).await?.create_instance(bootstrap).await?;
            Ok(serde_json::to_string(&instance)?)
        }
        Command::DeleteInstance => {
            connect(env).await?.delete_instance(&env.instance_id).await?;
            Ok(String::new())
        }
        Command::GetInstance => {
            let instance = connect(env).await?.get_instance(&env.instance_id).await?;
            Ok(serde_json::to_string(&instance)?)
        }
        Command::ListInstances => {
            let instances = connect(env).await?.list_instances(&env.pool_id).await?;
            Ok(serde_json::to_string(&instances)?)
        }
        Command::RemoveAllInstances => {
            connect(env).await?.remove_all_instances().await?;
            Ok(String::new())
        }
        Command::Stop => {
            connect(env).await?.stop(&env.instance_id, true).await?;
            Ok(String::new())
        }
        Command::Start => {
            connect(env).await?.start(&env.instance_id).await?;
            Ok(String::new())
        }
    }
}

async fn connect(env: &Environment) -> Result<CloudStackProvider> {
    let path = env
        .config_file
        .as_ref()
        .ok_or(CliError::MissingEnv("GARM_PROVIDER_CONFIG_FILE"))?;
    let config = ProviderConfig::load(path)?;
    let client = client_from_config(&config)?;
    Ok(CloudStackProvider::new(config, Arc::new(client), env.controller_id.clone()).await?)
}

async fn read_stdin() -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    tokio::io::stdin().read_to_end(&mut buf).await?;
    Ok(buf)
}

/// Pull the extra specs document out of a pool info payload. The document
/// may arrive as a JSON object or as a string holding one.
fn pool_extra_specs(input: &[u8]) -> Result<String> {
    if input.iter().all(u8::is_ascii_whitespace) {
        return Ok(String::new());
    }
    let info: serde_json::Value = serde_json::from_slice(input)?;
    let extra_specs = match info.get("extra_specs") {
        None | Some(serde_json::Value::Null) => String::new(),
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    };
    Ok(extra_specs)
}
