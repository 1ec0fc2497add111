use std::collections::BTreeMap;
use std::sync::Arc;

use cloudstack_api::{DeployVirtualMachineParams, ListVirtualMachinesParams, VirtualMachine};
use tracing::{debug, error, info, warn};

use crate::platform::Platform;
use crate::resolve::is_identifier;
use crate::spec::RunnerSpec;
use crate::types::{InstanceStatus, ProviderInstance};
use crate::{Error, Result, is_not_found_error};

pub const CONTROLLER_ID_TAG: &str = "GARM_CONTROLLER_ID";
pub const POOL_ID_TAG: &str = "GARM_POOL_ID";
pub const NAME_TAG: &str = "Name";
pub const OS_TYPE_TAG: &str = "OSType";
pub const OS_ARCH_TAG: &str = "OSArch";

/// CloudStack resource type of virtual machines, used when tagging.
const VM_RESOURCE_TYPE: &str = "UserVm";

/// Map a raw CloudStack VM state to the status reported to the orchestrator.
pub fn classify_state(state: &str) -> InstanceStatus {
    match state.to_ascii_lowercase().as_str() {
        "running" | "starting" | "migrating" | "restoring" | "stopping" => InstanceStatus::Running,
        "stopped" | "shutdown" | "destroyed" | "expunging" => InstanceStatus::Stopped,
        _ => InstanceStatus::Unknown,
    }
}

/// VMs in these states are on their way out and never listed for a pool.
fn is_terminal(state: &str) -> bool {
    state.eq_ignore_ascii_case("destroyed") || state.eq_ignore_ascii_case("expunging")
}

/// Convert a CloudStack VM into the orchestrator's instance record.
pub fn vm_to_instance(vm: &VirtualMachine) -> Result<ProviderInstance> {
    if vm.id.is_empty() {
        return Err(Error::Validation("virtual machine has no id".into()));
    }

    let name = if vm.displayname.is_empty() {
        vm.tag(NAME_TAG).unwrap_or_default().to_string()
    } else {
        vm.displayname.clone()
    };

    Ok(ProviderInstance {
        provider_id: vm.id.clone(),
        name,
        os_type: vm.tag(OS_TYPE_TAG).and_then(|t| t.parse().ok()),
        os_arch: vm.tag(OS_ARCH_TAG).and_then(|t| t.parse().ok()),
        status: classify_state(&vm.state),
    })
}

/// Creates, finds and acts on runner VMs.
///
/// Lookups are scoped to the configured project, if any.
#[derive(Clone)]
pub struct InstanceManager {
    platform: Arc<dyn Platform>,
    project_id: Option<String>,
}

impl InstanceManager {
    pub fn new(platform: Arc<dyn Platform>, project_id: Option<String>) -> Self {
        Self {
            platform,
            project_id,
        }
    }

    /// Deploy and tag a VM for `spec`, returning its ID.
    pub async fn create(&self, spec: &RunnerSpec) -> Result<String> {
        let user_data = spec.compose_user_data()?;
        let bootstrap = &spec.bootstrap;

        let params = DeployVirtualMachineParams {
            service_offering_id: spec.service_offering_id.clone(),
            template_id: spec.template_id.clone(),
            zone_id: spec.zone_id.clone(),
            name: bootstrap.name.clone(),
            display_name: bootstrap.name.clone(),
            user_data,
            network_ids: spec.network_ids.clone(),
            keypair: spec.ssh_key_name.clone(),
            project_id: spec.project_id.clone(),
        };

        let vm = self.platform.deploy_virtual_machine(&params).await?;
        if vm.id.is_empty() {
            return Err(Error::Platform(cloudstack_api::Error::Decode {
                command: "deployVirtualMachine",
                message: "empty virtual machine id".into(),
            }));
        }
        info!(vm_id = %vm.id, name = %bootstrap.name, zone_id = %spec.zone_id, "cloudstack: vm deployed");

        let tags = BTreeMap::from([
            (CONTROLLER_ID_TAG.to_string(), spec.controller_id.clone()),
            (POOL_ID_TAG.to_string(), bootstrap.pool_id.clone()),
            (NAME_TAG.to_string(), bootstrap.name.clone()),
            (OS_TYPE_TAG.to_string(), bootstrap.os_type.to_string()),
            (OS_ARCH_TAG.to_string(), bootstrap.os_arch.to_string()),
        ]);

        if let Err(e) = self
            .platform
            .create_tags(std::slice::from_ref(&vm.id), VM_RESOURCE_TYPE, &tags)
            .await
        {
            error!(vm_id = %vm.id, error = %e, "cloudstack: failed to tag vm");
            return Err(e.into());
        }
        info!(vm_id = %vm.id, pool_id = %bootstrap.pool_id, "cloudstack: vm tagged");

        Ok(vm.id)
    }

    /// Find exactly one VM by ID or name.
    ///
    /// Name lookups are narrowed to `controller_id`'s VMs when it is set.
    pub async fn find_one(&self, controller_id: &str, identifier: &str) -> Result<VirtualMachine> {
        if identifier.trim().is_empty() {
            return Err(Error::Validation("empty instance identifier".into()));
        }

        let by_id = is_identifier(identifier);
        let mut query = ListVirtualMachinesParams {
            project_id: self.project_id.clone(),
            list_all: true,
            ..Default::default()
        };
        if by_id {
            query.id = Some(identifier.to_string());
        } else {
            query.name = Some(identifier.to_string());
            if !controller_id.is_empty() {
                query
                    .tags
                    .insert(CONTROLLER_ID_TAG.to_string(), controller_id.to_string());
            }
        }

        debug!(identifier, by_id, "cloudstack: looking up vm");
        let mut vms = self.platform.list_virtual_machines(&query).await?;

        match vms.len() {
            0 => Err(Error::NotFound(format!("instance {identifier:?}"))),
            1 => Ok(vms.remove(0)),
            n => Err(Error::Ambiguous(format!(
                "{n} instances match {identifier:?}"
            ))),
        }
    }

    /// Live VMs carrying both the controller and pool tags.
    pub async fn list_by_pool(
        &self,
        controller_id: &str,
        pool_id: &str,
    ) -> Result<Vec<VirtualMachine>> {
        let query = ListVirtualMachinesParams {
            project_id: self.project_id.clone(),
            tags: BTreeMap::from([
                (CONTROLLER_ID_TAG.to_string(), controller_id.to_string()),
                (POOL_ID_TAG.to_string(), pool_id.to_string()),
            ]),
            list_all: true,
            ..Default::default()
        };

        let vms = self.platform.list_virtual_machines(&query).await?;
        Ok(vms.into_iter().filter(|vm| !is_terminal(&vm.state)).collect())
    }

    pub async fn start(&self, identifier: &str) -> Result<()> {
        let vm = self.find_one("", identifier).await?;
        self.platform.start_virtual_machine(&vm.id).await?;
        info!(vm_id = %vm.id, "cloudstack: vm started");
        Ok(())
    }

    /// Stop a VM. A VM that no longer exists counts as stopped.
    pub async fn stop(&self, identifier: &str, force: bool) -> Result<()> {
        let vm = match self.find_one("", identifier).await {
            Ok(vm) => vm,
            Err(Error::NotFound(_)) => {
                warn!(identifier, "cloudstack: vm to stop not found");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let result = self
            .platform
            .stop_virtual_machine(&vm.id, force)
            .await
            .map_err(Error::from);
        absorb_not_found(result, &vm.id, "stop")?;
        info!(vm_id = %vm.id, force, "cloudstack: vm stopped");
        Ok(())
    }

    /// Destroy a VM. A VM that no longer exists counts as destroyed.
    pub async fn destroy(&self, identifier: &str, expunge: bool) -> Result<()> {
        let vm = match self.find_one("", identifier).await {
            Ok(vm) => vm,
            Err(Error::NotFound(_)) => {
                warn!(identifier, "cloudstack: vm to destroy not found");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let result = self
            .platform
            .destroy_virtual_machine(&vm.id, expunge)
            .await
            .map_err(Error::from);
        absorb_not_found(result, &vm.id, "destroy")?;
        info!(vm_id = %vm.id, expunge, "cloudstack: vm destroyed");
        Ok(())
    }
}

fn absorb_not_found(result: Result<()>, vm_id: &str, action: &str) -> Result<()> {
    match result {
        Err(e) if is_not_found_error(&e) => {
            warn!(vm_id, action, error = %e, "cloudstack: vm disappeared before action");
            Ok(())
        }
        other => other,
    }
}
