use std::collections::BTreeMap;

use async_trait::async_trait;
use cloudstack_api::{
    CloudStackClient, DeployVirtualMachineParams, ListTemplatesParams, ListVirtualMachinesParams,
    Project, ServiceOffering, Template, VirtualMachine, Zone,
};

use crate::Result;
use crate::config::ProviderConfig;

/// The remote operations the provider needs from a CloudStack deployment.
///
/// `CloudStackClient` is the production implementation; tests substitute an
/// in-memory platform.
#[async_trait]
pub trait Platform: Send + Sync + 'static {
    async fn list_zones(&self, name: &str) -> cloudstack_api::Result<Vec<Zone>>;

    async fn list_service_offerings(&self, name: &str)
    -> cloudstack_api::Result<Vec<ServiceOffering>>;

    async fn list_projects(&self, name: &str) -> cloudstack_api::Result<Vec<Project>>;

    async fn list_templates(
        &self,
        query: &ListTemplatesParams,
    ) -> cloudstack_api::Result<Vec<Template>>;

    /// Deploy a VM and wait for the deploy job to finish.
    async fn deploy_virtual_machine(
        &self,
        req: &DeployVirtualMachineParams,
    ) -> cloudstack_api::Result<VirtualMachine>;

    async fn list_virtual_machines(
        &self,
        query: &ListVirtualMachinesParams,
    ) -> cloudstack_api::Result<Vec<VirtualMachine>>;

    async fn start_virtual_machine(&self, id: &str) -> cloudstack_api::Result<()>;

    async fn stop_virtual_machine(&self, id: &str, forced: bool) -> cloudstack_api::Result<()>;

    async fn destroy_virtual_machine(&self, id: &str, expunge: bool)
    -> cloudstack_api::Result<()>;

    async fn create_tags(
        &self,
        resource_ids: &[String],
        resource_type: &str,
        tags: &BTreeMap<String, String>,
    ) -> cloudstack_api::Result<()>;
}

#[async_trait]
impl Platform for CloudStackClient {
    async fn list_zones(&self, name: &str) -> cloudstack_api::Result<Vec<Zone>> {
        CloudStackClient::list_zones(self, name).await
    }

    async fn list_service_offerings(
        &self,
        name: &str,
    ) -> cloudstack_api::Result<Vec<ServiceOffering>> {
        CloudStackClient::list_service_offerings(self, name).await
    }

    async fn list_projects(&self, name: &str) -> cloudstack_api::Result<Vec<Project>> {
        CloudStackClient::list_projects(self, name).await
    }

    async fn list_templates(
        &self,
        query: &ListTemplatesParams,
    ) -> cloudstack_api::Result<Vec<Template>> {
        CloudStackClient::list_templates(self, query).await
    }

    async fn deploy_virtual_machine(
        &self,
        req: &DeployVirtualMachineParams,
    ) -> cloudstack_api::Result<VirtualMachine> {
        CloudStackClient::deploy_virtual_machine(self, req).await
    }

    async fn list_virtual_machines(
        &self,
        query: &ListVirtualMachinesParams,
    ) -> cloudstack_api::Result<Vec<VirtualMachine>> {
        CloudStackClient::list_virtual_machines(self, query).await
    }

    async fn start_virtual_machine(&self, id: &str) -> cloudstack_api::Result<()> {
        CloudStackClient::start_virtual_machine(self, id).await
    }

    async fn stop_virtual_machine(&self, id: &str, forced: bool) -> cloudstack_api::Result<()> {
        CloudStackClient::stop_virtual_machine(self, id, forced).await
    }

    async fn destroy_virtual_machine(
        &self,
        id: &str,
        expunge: bool,
    ) -> cloudstack_api::Result<()> {
        CloudStackClient::destroy_virtual_machine(self, id, expunge).await
    }

    async fn create_tags(
        &self,
        resource_ids: &[String],
        resource_type: &str,
        tags: &BTreeMap<String, String>,
    ) -> cloudstack_api::Result<()> {
        CloudStackClient::create_tags(self, resource_ids, resource_type, tags).await
    }
}

/// Build the HTTP client described by the provider configuration.
pub fn client_from_config(cfg: &ProviderConfig) -> Result<CloudStackClient> {
    let client = CloudStackClient::new(&cfg.api_url, &cfg.api_key, &cfg.secret, cfg.verify_ssl)?
        .with_async_timeout(cfg.async_timeout());
    Ok(client)
}
