use std::sync::Arc;

use tracing::{debug, error, info};

use crate::config::{self, ProviderConfig};
use crate::instance::{InstanceManager, vm_to_instance};
use crate::platform::Platform;
use crate::spec::{ExtraSpecs, SpecBuilder};
use crate::types::{BootstrapInstance, InstanceStatus, ProviderInstance};
use crate::{Error, Result};

/// Orchestrator interface versions this provider speaks.
pub const SUPPORTED_INTERFACE_VERSIONS: &[&str] = &["v0.1.0", "v0.1.1"];

/// The orchestrator-facing CloudStack provider.
pub struct CloudStackProvider {
    config: ProviderConfig,
    instances: InstanceManager,
    specs: SpecBuilder,
    controller_id: String,
}

impl CloudStackProvider {
    /// Resolve the configured placement names and build the provider.
    pub async fn new(
        config: ProviderConfig,
        platform: Arc<dyn Platform>,
        controller_id: impl Into<String>,
    ) -> Result<Self> {
        let project_id = config.resolve(platform.as_ref()).await?.project_id.clone();
        Ok(Self {
            config,
            instances: InstanceManager::new(platform, project_id),
            specs: SpecBuilder::default(),
            controller_id: controller_id.into(),
        })
    }

    /// Replace the spec builder, e.g. to inject a different tool fetcher.
    pub fn with_spec_builder(mut self, specs: SpecBuilder) -> Self {
        self.specs = specs;
        self
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub async fn create_instance(&self, bootstrap: BootstrapInstance) -> Result<ProviderInstance> {
        debug!(
            name = %bootstrap.name,
            pool_id = %bootstrap.pool_id,
            controller_id = %self.controller_id,
            "create instance"
        );

        let spec = self.specs.build(&self.config, bootstrap, &self.controller_id)?;

        let id = match self.instances.create(&spec).await {
            Ok(id) => id,
            Err(e) => {
                error!(
                    name = %spec.bootstrap.name,
                    pool_id = %spec.bootstrap.pool_id,
                    error = %e,
                    "failed to create instance"
                );
                return Err(e);
            }
        };

        info!(provider_id = %id, name = %spec.bootstrap.name, "instance created");
        Ok(ProviderInstance {
            provider_id: id,
            name: spec.bootstrap.name.clone(),
            os_type: Some(spec.bootstrap.os_type),
            os_arch: Some(spec.bootstrap.os_arch),
            status: InstanceStatus::Running,
        })
    }

    pub async fn delete_instance(&self, instance: &str) -> Result<()> {
        debug!(instance, expunge = self.config.expunge, "delete instance");
        if let Err(e) = self.instances.destroy(instance, self.config.expunge).await {
            error!(instance, error = %e, "failed to delete instance");
            return Err(e);
        }
        Ok(())
    }

    /// Look up one instance. An unknown instance yields an empty record.
    pub async fn get_instance(&self, instance: &str) -> Result<ProviderInstance> {
        debug!(instance, "get instance");
        match self.instances.find_one(&self.controller_id, instance).await {
            Ok(vm) => vm_to_instance(&vm),
            Err(Error::NotFound(_)) => {
                debug!(instance, "instance not found");
                Ok(ProviderInstance::default())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn list_instances(&self, pool_id: &str) -> Result<Vec<ProviderInstance>> {
        debug!(pool_id, "list instances");
        self.instances
            .list_by_pool(&self.controller_id, pool_id)
            .await?
            .iter()
            .map(vm_to_instance)
            .collect()
    }

    /// Instances are always removed one at a time by the orchestrator.
    pub async fn remove_all_instances(&self) -> Result<()> {
        Ok(())
    }

    pub async fn stop(&self, instance: &str, force: bool) -> Result<()> {
        self.instances.stop(instance, force).await
    }

    pub async fn start(&self, instance: &str) -> Result<()> {
        self.instances.start(instance).await
    }

    pub fn version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    pub fn supported_interface_versions() -> Vec<String> {
        SUPPORTED_INTERFACE_VERSIONS
            .iter()
            .map(|v| v.to_string())
            .collect()
    }

    /// Check a pool's extra specs document. Image and flavor are not used.
    pub fn validate_pool_info(extra_specs: &str) -> Result<()> {
        if extra_specs.trim().is_empty() {
            return Ok(());
        }
        let raw: serde_json::Value = serde_json::from_str(extra_specs)
            .map_err(|e| Error::Validation(format!("invalid extra_specs: {e}")))?;
        ExtraSpecs::validate(&raw)
    }

    pub fn config_json_schema() -> Result<String> {
        config::config_json_schema()
    }

    pub fn extra_specs_json_schema() -> Result<String> {
        Ok(serde_json::to_string(&ExtraSpecs::json_schema()?)?)
    }
}
