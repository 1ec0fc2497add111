use serde::Deserialize;
use std::collections::BTreeMap;

// ── Lookup resources ─────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Zone {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceOffering {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Project {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Template {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub zoneid: Option<String>,
}

/// Query for `listTemplates`. CloudStack requires a template filter; the
/// provider only ever deploys from `executable` templates.
#[derive(Debug, Clone)]
pub struct ListTemplatesParams {
    pub template_filter: String,
    pub name: String,
    pub zone_id: Option<String>,
    pub project_id: Option<String>,
}

impl ListTemplatesParams {
    pub fn executable(name: impl Into<String>) -> Self {
        Self {
            template_filter: "executable".into(),
            name: name.into(),
            zone_id: None,
            project_id: None,
        }
    }

    pub(crate) fn to_params(&self) -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();
        params.insert("templatefilter".into(), self.template_filter.clone());
        params.insert("name".into(), self.name.clone());
        if let Some(zone) = &self.zone_id {
            params.insert("zoneid".into(), zone.clone());
        }
        if let Some(project) = &self.project_id {
            params.insert("projectid".into(), project.clone());
        }
        params
    }
}

// ── Virtual machines ─────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ResourceTag {
    pub key: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VirtualMachine {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub displayname: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub zoneid: Option<String>,
    #[serde(default)]
    pub templateid: Option<String>,
    #[serde(default)]
    pub serviceofferingid: Option<String>,
    #[serde(default)]
    pub projectid: Option<String>,
    #[serde(default)]
    pub tags: Vec<ResourceTag>,
}

impl VirtualMachine {
    /// Value of the first tag with the given key.
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.key == key)
            .map(|t| t.value.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct DeployVirtualMachineParams {
    pub service_offering_id: String,
    pub template_id: String,
    pub zone_id: String,
    pub name: String,
    pub display_name: String,
    /// Base64-encoded user data.
    pub user_data: String,
    pub network_ids: Vec<String>,
    pub keypair: Option<String>,
    pub project_id: Option<String>,
}

impl DeployVirtualMachineParams {
    pub(crate) fn to_params(&self) -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();
        params.insert("serviceofferingid".into(), self.service_offering_id.clone());
        params.insert("templateid".into(), self.template_id.clone());
        params.insert("zoneid".into(), self.zone_id.clone());
        params.insert("name".into(), self.name.clone());
        params.insert("displayname".into(), self.display_name.clone());
        params.insert("userdata".into(), self.user_data.clone());
        if !self.network_ids.is_empty() {
            params.insert("networkids".into(), self.network_ids.join(","));
        }
        if let Some(keypair) = &self.keypair {
            params.insert("keypair".into(), keypair.clone());
        }
        if let Some(project) = &self.project_id {
            params.insert("projectid".into(), project.clone());
        }
        params
    }
}

/// Query for `listVirtualMachines`.
#[derive(Debug, Clone, Default)]
pub struct ListVirtualMachinesParams {
    pub id: Option<String>,
    pub name: Option<String>,
    pub project_id: Option<String>,
    pub tags: BTreeMap<String, String>,
    pub list_all: bool,
}

impl ListVirtualMachinesParams {
    pub(crate) fn to_params(&self) -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();
        if let Some(id) = &self.id {
            params.insert("id".into(), id.clone());
        }
        if let Some(name) = &self.name {
            params.insert("name".into(), name.clone());
        }
        if let Some(project) = &self.project_id {
            params.insert("projectid".into(), project.clone());
        }
        if self.list_all {
            params.insert("listall".into(), "true".into());
        }
        insert_tags(&mut params, &self.tags);
        params
    }
}

/// Encode a tag map the way CloudStack expects map parameters:
/// `tags[0].key=..&tags[0].value=..`.
pub(crate) fn insert_tags(params: &mut BTreeMap<String, String>, tags: &BTreeMap<String, String>) {
    for (i, (key, value)) in tags.iter().enumerate() {
        params.insert(format!("tags[{i}].key"), key.clone());
        params.insert(format!("tags[{i}].value"), value.clone());
    }
}

// ── Response envelopes ───────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ListZonesResponse {
    #[serde(default)]
    pub zone: Vec<Zone>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ListServiceOfferingsResponse {
    #[serde(default)]
    pub serviceoffering: Vec<ServiceOffering>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ListProjectsResponse {
    #[serde(default)]
    pub project: Vec<Project>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ListTemplatesResponse {
    #[serde(default)]
    pub template: Vec<Template>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ListVirtualMachinesResponse {
    #[serde(default)]
    pub virtualmachine: Vec<VirtualMachine>,
}

/// Immediate reply to an async command.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct AsyncJobStarted {
    #[serde(default)]
    pub id: Option<String>,
    pub jobid: String,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct AsyncJobResult {
    pub jobstatus: u8,
    #[serde(default)]
    pub jobresult: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ErrorBody {
    #[serde(default)]
    pub errorcode: u32,
    #[serde(default)]
    pub errortext: String,
}
