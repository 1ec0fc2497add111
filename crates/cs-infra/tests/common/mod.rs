#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use cloudstack_api::{
    DeployVirtualMachineParams, ListTemplatesParams, ListVirtualMachinesParams, Project,
    ResourceTag, ServiceOffering, StatusCode, Template, VirtualMachine, Zone,
};
use cs_infra::{Platform, ProviderConfig};

pub const ZONE_ID: &str = "11111111-1111-1111-1111-111111111111";
pub const OFFERING_ID: &str = "22222222-2222-2222-2222-222222222222";
pub const TEMPLATE_ID: &str = "33333333-3333-3333-3333-333333333333";
pub const PROJECT_ID: &str = "44444444-4444-4444-4444-444444444444";
pub const CONTROLLER_ID: &str = "controller-1";

/// In-memory CloudStack deployment that records every call.
#[derive(Default)]
pub struct FakePlatform {
    pub zones: Vec<Zone>,
    pub offerings: Vec<ServiceOffering>,
    pub projects: Vec<Project>,
    pub templates: Vec<Template>,
    vms: Mutex<Vec<VirtualMachine>>,
    calls: Mutex<Vec<&'static str>>,
    deployed: Mutex<Vec<DeployVirtualMachineParams>>,
    list_queries: Mutex<Vec<ListVirtualMachinesParams>>,
    template_queries: Mutex<Vec<ListTemplatesParams>>,
    failures: Mutex<BTreeMap<&'static str, String>>,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_zone(mut self, id: &str, name: &str) -> Self {
        self.zones.push(Zone {
            id: id.into(),
            name: name.into(),
        });
        self
    }

    pub fn with_offering(mut self, id: &str, name: &str) -> Self {
        self.offerings.push(ServiceOffering {
            id: id.into(),
            name: name.into(),
        });
        self
    }

    pub fn with_project(mut self, id: &str, name: &str) -> Self {
        self.projects.push(Project {
            id: id.into(),
            name: name.into(),
        });
        self
    }

    pub fn with_template(mut self, id: &str, name: &str, zone_id: &str) -> Self {
        self.templates.push(Template {
            id: id.into(),
            name: name.into(),
            zoneid: Some(zone_id.into()),
        });
        self
    }

    /// Seed a VM carrying the given tags.
    pub fn add_vm(&self, id: &str, name: &str, state: &str, tags: &[(&str, &str)]) {
        self.vms.lock().unwrap().push(VirtualMachine {
            id: id.into(),
            name: name.into(),
            displayname: name.into(),
            state: state.into(),
            tags: tags
                .iter()
                .map(|(k, v)| ResourceTag {
                    key: k.to_string(),
                    value: v.to_string(),
                })
                .collect(),
            ..Default::default()
        });
    }

    /// Make the named platform call fail with `error_text`.
    pub fn fail(&self, call: &'static str, error_text: &str) {
        self.failures
            .lock()
            .unwrap()
            .insert(call, error_text.to_string());
    }

    pub fn calls(&self, call: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| **c == call).count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn vm(&self, id: &str) -> Option<VirtualMachine> {
        self.vms.lock().unwrap().iter().find(|vm| vm.id == id).cloned()
    }

    pub fn deployed(&self) -> Vec<DeployVirtualMachineParams> {
        self.deployed.lock().unwrap().clone()
    }

    pub fn last_list_query(&self) -> Option<ListVirtualMachinesParams> {
        self.list_queries.lock().unwrap().last().cloned()
    }

    pub fn last_template_query(&self) -> Option<ListTemplatesParams> {
        self.template_queries.lock().unwrap().last().cloned()
    }

    fn record(&self, call: &'static str) -> cloudstack_api::Result<()> {
        self.calls.lock().unwrap().push(call);
        match self.failures.lock().unwrap().get(call) {
            Some(text) => Err(cloudstack_api::Error::Api {
                command: call,
                status: StatusCode::from_u16(431).unwrap(),
                error_code: 431,
                error_text: text.clone(),
            }),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Platform for FakePlatform {
    // Zone and offering lookups match by substring, like a keyword search.
    async fn list_zones(&self, name: &str) -> cloudstack_api::Result<Vec<Zone>> {
        self.record("listZones")?;
        Ok(self
            .zones
            .iter()
            .filter(|z| z.name.contains(name))
            .cloned()
            .collect())
    }

    async fn list_service_offerings(
        &self,
        name: &str,
    ) -> cloudstack_api::Result<Vec<ServiceOffering>> {
        self.record("listServiceOfferings")?;
        Ok(self
            .offerings
            .iter()
            .filter(|o| o.name.contains(name))
            .cloned()
            .collect())
    }

    async fn list_projects(&self, name: &str) -> cloudstack_api::Result<Vec<Project>> {
        self.record("listProjects")?;
        Ok(self
            .projects
            .iter()
            .filter(|p| p.name == name)
            .cloned()
            .collect())
    }

    async fn list_templates(
        &self,
        query: &ListTemplatesParams,
    ) -> cloudstack_api::Result<Vec<Template>> {
        self.record("listTemplates")?;
        self.template_queries.lock().unwrap().push(query.clone());
        Ok(self
            .templates
            .iter()
            .filter(|t| t.name == query.name)
            .filter(|t| query.zone_id.is_none() || t.zoneid == query.zone_id)
            .cloned()
            .collect())
    }

    async fn deploy_virtual_machine(
        &self,
        req: &DeployVirtualMachineParams,
    ) -> cloudstack_api::Result<VirtualMachine> {
        self.record("deployVirtualMachine")?;
        self.deployed.lock().unwrap().push(req.clone());

        let vm = VirtualMachine {
            id: uuid::Uuid::new_v4().to_string(),
            name: req.name.clone(),
            displayname: req.display_name.clone(),
            state: "Running".into(),
            zoneid: Some(req.zone_id.clone()),
            templateid: Some(req.template_id.clone()),
            serviceofferingid: Some(req.service_offering_id.clone()),
            projectid: req.project_id.clone(),
            tags: Vec::new(),
        };
        self.vms.lock().unwrap().push(vm.clone());
        Ok(vm)
    }

    async fn list_virtual_machines(
        &self,
        query: &ListVirtualMachinesParams,
    ) -> cloudstack_api::Result<Vec<VirtualMachine>> {
        self.record("listVirtualMachines")?;
        self.list_queries.lock().unwrap().push(query.clone());

        let vms = self.vms.lock().unwrap();
        Ok(vms
            .iter()
            .filter(|vm| query.id.as_ref().is_none_or(|id| &vm.id == id))
            .filter(|vm| query.name.as_ref().is_none_or(|name| &vm.name == name))
            .filter(|vm| {
                query
                    .project_id
                    .as_ref()
                    .is_none_or(|p| vm.projectid.as_ref() == Some(p))
            })
            .filter(|vm| {
                query
                    .tags
                    .iter()
                    .all(|(k, v)| vm.tag(k) == Some(v.as_str()))
            })
            .cloned()
            .collect())
    }

    async fn start_virtual_machine(&self, id: &str) -> cloudstack_api::Result<()> {
        self.record("startVirtualMachine")?;
        self.set_state(id, "Running");
        Ok(())
    }

    async fn stop_virtual_machine(&self, id: &str, _forced: bool) -> cloudstack_api::Result<()> {
        self.record("stopVirtualMachine")?;
        self.set_state(id, "Stopped");
        Ok(())
    }

    async fn destroy_virtual_machine(
        &self,
        id: &str,
        expunge: bool,
    ) -> cloudstack_api::Result<()> {
        self.record("destroyVirtualMachine")?;
        if expunge {
            self.vms.lock().unwrap().retain(|vm| vm.id != id);
        } else {
            self.set_state(id, "Destroyed");
        }
        Ok(())
    }

    async fn create_tags(
        &self,
        resource_ids: &[String],
        _resource_type: &str,
        tags: &BTreeMap<String, String>,
    ) -> cloudstack_api::Result<()> {
        self.record("createTags")?;
        let mut vms = self.vms.lock().unwrap();
        for vm in vms.iter_mut().filter(|vm| resource_ids.contains(&vm.id)) {
            vm.tags.extend(tags.iter().map(|(k, v)| ResourceTag {
                key: k.clone(),
                value: v.clone(),
            }));
        }
        Ok(())
    }
}

impl FakePlatform {
    fn set_state(&self, id: &str, state: &str) {
        if let Some(vm) = self.vms.lock().unwrap().iter_mut().find(|vm| vm.id == id) {
            vm.state = state.into();
        }
    }
}

/// Provider config with the given placement values.
pub fn config(zone: &str, offering: &str, template: &str, project: Option<&str>) -> ProviderConfig {
    let mut toml = format!(
        r#"
        api_url = "https://cloudstack.example.com/client/api"
        api_key = "key"
        secret = "secret"
        zone = "{zone}"
        service_offering = "{offering}"
        template = "{template}"
        "#
    );
    if let Some(project) = project {
        toml.push_str(&format!("project = \"{project}\"\n"));
    }
    ProviderConfig::from_toml(&toml).unwrap()
}

/// Config whose placement values are all IDs already.
pub fn id_config() -> ProviderConfig {
    config(ZONE_ID, OFFERING_ID, TEMPLATE_ID, None)
}
