use std::path::Path;
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Deserializer};
use tokio::sync::OnceCell;
use tracing::info;

use crate::platform::Platform;
use crate::resolve::{self, LookupScope, ResolvedIdentifiers, ResourceKind};
use crate::{Error, Result};

/// How long to wait for async CloudStack jobs such as VM deployment.
pub const DEFAULT_ASYNC_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Provider-wide CloudStack configuration, loaded from TOML.
///
/// `zone`, `service_offering`, `template` and `project` accept either a UUID
/// or a symbolic name. Names are resolved once through the API by
/// [`ProviderConfig::resolve`] and the IDs cached for the life of the config.
///
/// ```toml
/// api_url = "https://cloudstack.example.com/client/api"
/// api_key = "..."
/// secret  = "..."
/// verify_ssl = true
/// zone = "us-west-1"
/// service_offering = "2-4096"
/// template = "gha-runner-ubuntu-2404"
/// project = "sw_infra"
/// async_timeout = "20m"
/// ```
#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    /// CloudStack API URL
    pub api_url: String,
    /// CloudStack API key
    pub api_key: String,
    /// CloudStack API secret
    pub secret: String,
    /// Verify SSL certificates (default: false)
    #[serde(default)]
    pub verify_ssl: bool,
    /// CloudStack zone name or UUID
    pub zone: String,
    /// Compute offering name or UUID
    pub service_offering: String,
    /// VM template name or UUID
    pub template: String,
    /// CloudStack project name or UUID (optional)
    #[serde(default)]
    pub project: Option<String>,
    /// SSH keypair name (optional)
    #[serde(default)]
    pub ssh_key_name: Option<String>,
    /// Async API call timeout, e.g. "15m" (default: 15m)
    #[serde(
        default = "default_async_timeout",
        deserialize_with = "deserialize_duration"
    )]
    #[schemars(with = "String")]
    pub async_timeout: Duration,
    /// Expunge VMs immediately on deletion (default: false)
    #[serde(default)]
    pub expunge: bool,

    #[serde(skip)]
    resolved: OnceCell<ResolvedIdentifiers>,
}

fn default_async_timeout() -> Duration {
    DEFAULT_ASYNC_TIMEOUT
}

fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    humantime::parse_duration(&s).map_err(serde::de::Error::custom)
}

impl ProviderConfig {
    /// Load and validate the configuration file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let mut cfg: Self = toml::from_str(content)?;
        cfg.project = cfg.project.filter(|p| !p.is_empty());
        cfg.ssh_key_name = cfg.ssh_key_name.filter(|k| !k.is_empty());
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        let required = [
            ("api_url", &self.api_url),
            ("api_key", &self.api_key),
            ("secret", &self.secret),
            ("zone", &self.zone),
            ("service_offering", &self.service_offering),
            ("template", &self.template),
        ];
        for (field, value) in required {
            if value.is_empty() {
                return Err(Error::Config(format!("missing {field}")));
            }
        }
        Ok(())
    }

    /// Effective async job timeout; zero falls back to the default.
    pub fn async_timeout(&self) -> Duration {
        if self.async_timeout.is_zero() {
            DEFAULT_ASYNC_TIMEOUT
        } else {
            self.async_timeout
        }
    }

    /// Resolve names to IDs, at most once per config.
    ///
    /// Order is zone, service offering, project, template: templates may be
    /// project-scoped so the project has to be known first. Concurrent
    /// callers wait on the same resolution.
    pub async fn resolve(&self, platform: &dyn Platform) -> Result<&ResolvedIdentifiers> {
        self.resolved
            .get_or_try_init(|| self.resolve_names(platform))
            .await
    }

    async fn resolve_names(&self, platform: &dyn Platform) -> Result<ResolvedIdentifiers> {
        let zone_id = resolve_field(
            platform,
            ResourceKind::Zone,
            &self.zone,
            LookupScope::default(),
        )
        .await?;

        let service_offering_id = resolve_field(
            platform,
            ResourceKind::ServiceOffering,
            &self.service_offering,
            LookupScope::default(),
        )
        .await?;

        let project_id = match &self.project {
            Some(project) => Some(
                resolve_field(
                    platform,
                    ResourceKind::Project,
                    project,
                    LookupScope::default(),
                )
                .await?,
            ),
            None => None,
        };

        let template_id = resolve_field(
            platform,
            ResourceKind::Template,
            &self.template,
            LookupScope {
                zone_id: Some(&zone_id),
                project_id: project_id.as_deref(),
            },
        )
        .await?;

        info!(
            zone_id = %zone_id,
            service_offering_id = %service_offering_id,
            template_id = %template_id,
            project_id = ?project_id,
            "resolved cloudstack placement"
        );

        Ok(ResolvedIdentifiers {
            zone_id,
            service_offering_id,
            template_id,
            project_id,
        })
    }

    /// Seed the resolved IDs directly, skipping API lookups.
    pub fn with_resolved(mut self, ids: ResolvedIdentifiers) -> Self {
        self.resolved = OnceCell::from(ids);
        self
    }

    /// The resolved IDs; fails if [`ProviderConfig::resolve`] has not run.
    pub fn resolved(&self) -> Result<&ResolvedIdentifiers> {
        self.resolved
            .get()
            .ok_or_else(|| Error::Config("placement names have not been resolved".into()))
    }
}

async fn resolve_field(
    platform: &dyn Platform,
    kind: ResourceKind,
    value: &str,
    scope: LookupScope<'_>,
) -> Result<String> {
    resolve::resolve(platform, kind, value, scope)
        .await
        .map_err(|e| Error::Resolution {
            field: kind.as_str(),
            value: value.to_string(),
            source: Box::new(e),
        })
}

/// JSON schema of the configuration document.
pub fn config_json_schema() -> Result<String> {
    let schema = schemars::schema_for!(ProviderConfig);
    Ok(serde_json::to_string(&schema)?)
}
