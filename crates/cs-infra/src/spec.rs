use std::collections::BTreeMap;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ProviderConfig;
use crate::types::{BootstrapInstance, OsArch, OsType, RunnerApplicationDownload};
use crate::userdata;
use crate::{Error, Result};

/// Mount options used when an NFS mount does not set its own.
pub const DEFAULT_NFS_OPTIONS: &str = "nfsvers=4,ro,soft,timeo=30";

/// Per-pool overrides carried in a bootstrap request's `extra_specs`.
///
/// Scalar overrides only apply when present and non-empty; an empty string
/// keeps the provider default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ExtraSpecs {
    /// Override the default zone ID.
    #[serde(default)]
    pub zone_id: Option<String>,
    /// Override the default service offering ID.
    #[serde(default)]
    pub service_offering_id: Option<String>,
    /// Override the default template ID.
    #[serde(default)]
    pub template_id: Option<String>,
    /// CloudStack project ID to deploy the instance into.
    #[serde(default)]
    pub project_id: Option<String>,
    /// List of network IDs to attach to the instance.
    #[serde(default)]
    pub network_ids: Vec<String>,
    /// Name of the SSH keypair to use for the instance.
    #[serde(default)]
    pub ssh_key_name: Option<String>,
    /// Disable automatic updates on the VM.
    #[serde(default)]
    pub disable_updates: Option<bool>,
    /// Enable boot debug on the VM.
    #[serde(default)]
    pub enable_boot_debug: Option<bool>,
    /// Extra packages to install on the VM.
    #[serde(default)]
    pub extra_packages: Vec<String>,
    /// NFS shares to mount before the runner is installed.
    #[serde(default)]
    pub nfs_mounts: Vec<NfsMount>,
    /// Base64 encoded runner install script template.
    #[serde(default)]
    pub runner_install_template: Option<String>,
    /// Base64 encoded scripts run before the runner install, keyed by file name.
    #[serde(default)]
    pub pre_install_scripts: BTreeMap<String, String>,
    /// Extra values available to the install template.
    #[serde(default)]
    pub extra_context: BTreeMap<String, String>,
}

/// An NFS export to mount on the instance at boot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct NfsMount {
    /// NFS server host.
    pub server: String,
    /// Exported path on the server.
    pub server_path: String,
    /// Local mount point.
    pub mount_path: String,
    /// Mount read-write instead of read-only.
    #[serde(default)]
    pub read_write: bool,
    /// Custom mount options, replacing the defaults.
    #[serde(default)]
    pub options: Option<String>,
}

impl NfsMount {
    /// Options passed to `mount -o`.
    pub fn mount_options(&self) -> String {
        match self.options.as_deref().map(str::trim) {
            Some(custom) if !custom.is_empty() => custom.to_string(),
            _ if self.read_write => DEFAULT_NFS_OPTIONS.replacen(",ro,", ",rw,", 1),
            _ => DEFAULT_NFS_OPTIONS.to_string(),
        }
    }

    fn validate(&self) -> Result<()> {
        let fields = [
            ("server", &self.server),
            ("server_path", &self.server_path),
            ("mount_path", &self.mount_path),
        ];
        for (field, value) in fields {
            if value.is_empty() {
                return Err(Error::Validation(format!("nfs mount {field} is empty")));
            }
            if !shell_safe(value) {
                return Err(Error::Validation(format!(
                    "nfs mount {field} {value:?} contains unsupported characters"
                )));
            }
        }
        if !shell_safe(&self.mount_options()) {
            return Err(Error::Validation(format!(
                "nfs mount options {:?} contain unsupported characters",
                self.mount_options()
            )));
        }
        if !self.mount_path.starts_with('/') {
            return Err(Error::Validation(format!(
                "nfs mount_path {:?} must be absolute",
                self.mount_path
            )));
        }
        Ok(())
    }
}

/// Values are interpolated into a shell script unquoted.
fn shell_safe(value: &str) -> bool {
    value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:@,=+[]%".contains(c))
}

impl ExtraSpecs {
    /// JSON schema of the override document.
    pub fn json_schema() -> Result<serde_json::Value> {
        Ok(serde_json::to_value(schemars::schema_for!(ExtraSpecs))?)
    }

    /// Check a raw override document against [`ExtraSpecs::json_schema`].
    pub fn validate(raw: &serde_json::Value) -> Result<()> {
        let schema = Self::json_schema()?;
        let validator = jsonschema::validator_for(&schema)
            .map_err(|e| Error::Validation(format!("invalid extra specs schema: {e}")))?;

        let errors: Vec<String> = validator
            .iter_errors(raw)
            .map(|e| {
                let path = e.instance_path.to_string();
                if path.is_empty() {
                    e.to_string()
                } else {
                    format!("{path}: {e}")
                }
            })
            .collect();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(format!(
                "extra specs failed schema validation: {}",
                errors.join("; ")
            )))
        }
    }

    /// Validate then deserialize an override document. A missing document
    /// yields no overrides.
    pub fn from_raw(raw: &serde_json::Value) -> Result<Self> {
        if raw.is_null() {
            return Ok(Self::default());
        }
        Self::validate(raw)?;
        serde_json::from_value(raw.clone())
            .map_err(|e| Error::Validation(format!("failed to decode extra specs: {e}")))
    }
}

/// Picks the runner tool archive for an instance's platform.
pub trait ToolFetcher: Send + Sync {
    fn select(
        &self,
        os_type: OsType,
        os_arch: OsArch,
        tools: &[RunnerApplicationDownload],
    ) -> Result<RunnerApplicationDownload>;
}

/// Default fetcher: the first offered download built for the platform.
#[derive(Debug, Clone, Copy, Default)]
pub struct MatchingTools;

impl ToolFetcher for MatchingTools {
    fn select(
        &self,
        os_type: OsType,
        os_arch: OsArch,
        tools: &[RunnerApplicationDownload],
    ) -> Result<RunnerApplicationDownload> {
        tools
            .iter()
            .find(|t| t.matches(os_type, os_arch))
            .cloned()
            .ok_or_else(|| {
                Error::Validation(format!(
                    "failed to find tools for OS {os_type} and arch {os_arch}"
                ))
            })
    }
}

/// Fully resolved specification for one CloudStack runner VM.
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerSpec {
    pub zone_id: String,
    pub service_offering_id: String,
    pub template_id: String,
    pub project_id: Option<String>,
    pub network_ids: Vec<String>,
    pub ssh_key_name: Option<String>,
    pub disable_updates: bool,
    pub enable_boot_debug: bool,
    pub extra_packages: Vec<String>,
    pub nfs_mounts: Vec<NfsMount>,
    /// Decoded install script template, if the pool overrides it.
    pub install_template: Option<String>,
    /// Decoded pre-install scripts keyed by file name.
    pub pre_install_scripts: BTreeMap<String, String>,
    pub extra_context: BTreeMap<String, String>,
    pub tools: RunnerApplicationDownload,
    pub bootstrap: BootstrapInstance,
    pub controller_id: String,
}

impl RunnerSpec {
    /// Apply overrides on top of the provider defaults.
    pub fn merge_extra_specs(&mut self, extra: ExtraSpecs) -> Result<()> {
        if let Some(zone) = non_empty(extra.zone_id) {
            self.zone_id = zone;
        }
        if let Some(offering) = non_empty(extra.service_offering_id) {
            self.service_offering_id = offering;
        }
        if let Some(template) = non_empty(extra.template_id) {
            self.template_id = template;
        }
        if let Some(project) = non_empty(extra.project_id) {
            self.project_id = Some(project);
        }
        if !extra.network_ids.is_empty() {
            self.network_ids = extra.network_ids;
        }
        if let Some(key) = non_empty(extra.ssh_key_name) {
            self.ssh_key_name = Some(key);
        }
        if let Some(disable) = extra.disable_updates {
            self.disable_updates = disable;
        }
        if let Some(debug) = extra.enable_boot_debug {
            self.enable_boot_debug = debug;
        }
        if !extra.extra_packages.is_empty() {
            self.extra_packages = extra.extra_packages;
        }
        if !extra.nfs_mounts.is_empty() {
            self.nfs_mounts = extra.nfs_mounts;
        }
        if let Some(template) = non_empty(extra.runner_install_template) {
            self.install_template = Some(decode_script("runner_install_template", &template)?);
        }
        for (name, script) in extra.pre_install_scripts {
            let decoded = decode_script(&format!("pre_install_scripts.{name}"), &script)?;
            self.pre_install_scripts.insert(name, decoded);
        }
        self.extra_context.extend(extra.extra_context);
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.zone_id.is_empty() {
            return Err(Error::Validation("missing zone_id".into()));
        }
        if self.service_offering_id.is_empty() {
            return Err(Error::Validation("missing service_offering_id".into()));
        }
        if self.template_id.is_empty() {
            return Err(Error::Validation("missing template_id".into()));
        }
        if self.bootstrap.name.is_empty() {
            return Err(Error::Validation("missing bootstrap params".into()));
        }
        if !self.nfs_mounts.is_empty() && self.bootstrap.os_type != OsType::Linux {
            return Err(Error::Validation(format!(
                "nfs_mounts are not supported on {}",
                self.bootstrap.os_type
            )));
        }
        for mount in &self.nfs_mounts {
            mount.validate()?;
        }
        Ok(())
    }

    /// Base64 encoded boot payload for this instance.
    pub fn compose_user_data(&self) -> Result<String> {
        userdata::compose_user_data(self)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

fn decode_script(field: &str, encoded: &str) -> Result<String> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| Error::Validation(format!("{field} is not valid base64: {e}")))?;
    String::from_utf8(bytes)
        .map_err(|_| Error::Validation(format!("{field} is not valid UTF-8")))
}

/// Builds [`RunnerSpec`]s from bootstrap requests.
#[derive(Clone)]
pub struct SpecBuilder {
    tools: Arc<dyn ToolFetcher>,
}

impl Default for SpecBuilder {
    fn default() -> Self {
        Self::new(Arc::new(MatchingTools))
    }
}

impl SpecBuilder {
    pub fn new(tools: Arc<dyn ToolFetcher>) -> Self {
        Self { tools }
    }

    /// Resolve a bootstrap request against the provider defaults.
    pub fn build(
        &self,
        cfg: &ProviderConfig,
        bootstrap: BootstrapInstance,
        controller_id: &str,
    ) -> Result<RunnerSpec> {
        let resolved = cfg.resolved()?;

        let tools = self
            .tools
            .select(bootstrap.os_type, bootstrap.os_arch, &bootstrap.tools)?;

        let extra = ExtraSpecs::from_raw(&bootstrap.extra_specs)?;

        let mut spec = RunnerSpec {
            zone_id: resolved.zone_id.clone(),
            service_offering_id: resolved.service_offering_id.clone(),
            template_id: resolved.template_id.clone(),
            project_id: resolved.project_id.clone(),
            network_ids: Vec::new(),
            ssh_key_name: cfg.ssh_key_name.clone(),
            disable_updates: false,
            enable_boot_debug: false,
            extra_packages: Vec::new(),
            nfs_mounts: Vec::new(),
            install_template: None,
            pre_install_scripts: BTreeMap::new(),
            extra_context: BTreeMap::new(),
            tools,
            bootstrap,
            controller_id: controller_id.to_string(),
        };

        spec.merge_extra_specs(extra)?;
        spec.validate()?;

        debug!(
            name = %spec.bootstrap.name,
            zone_id = %spec.zone_id,
            template_id = %spec.template_id,
            service_offering_id = %spec.service_offering_id,
            "built runner spec"
        );
        Ok(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::ResolvedIdentifiers;
    use serde_json::json;

    const CONFIG: &str = r#"
        api_url = "https://cloudstack.example.com/client/api"
        api_key = "api-key"
        secret = "secret"
        zone = "zone-default"
        service_offering = "service-offering-id"
        template = "template-id"
    "#;

    fn config() -> ProviderConfig {
        ProviderConfig::from_toml(CONFIG)
            .unwrap()
            .with_resolved(ResolvedIdentifiers {
                zone_id: "zone-default".into(),
                service_offering_id: "service-offering-id".into(),
                template_id: "T".into(),
                project_id: None,
            })
    }

    struct FixedTools;

    impl ToolFetcher for FixedTools {
        fn select(
            &self,
            _: OsType,
            _: OsArch,
            _: &[RunnerApplicationDownload],
        ) -> Result<RunnerApplicationDownload> {
            Ok(RunnerApplicationDownload {
                filename: "runner.tar.gz".into(),
                ..Default::default()
            })
        }
    }

    fn bootstrap(extra: serde_json::Value) -> BootstrapInstance {
        BootstrapInstance {
            name: "runner-name".into(),
            os_type: OsType::Linux,
            os_arch: OsArch::Amd64,
            extra_specs: extra,
            ..Default::default()
        }
    }

    fn build(extra: serde_json::Value) -> Result<RunnerSpec> {
        SpecBuilder::new(Arc::new(FixedTools)).build(&config(), bootstrap(extra), "controller-id")
    }

    #[test]
    fn decodes_full_override_document() {
        let raw = json!({
            "zone_id": "zone-1",
            "service_offering_id": "off",
            "template_id": "tmpl",
            "network_ids": ["net1", "net2"],
            "disable_updates": true,
            "enable_boot_debug": true,
            "extra_packages": ["pkg1", "pkg2"],
            "nfs_mounts": [{"server": "nfs.local", "server_path": "/export", "mount_path": "/mnt/x"}],
            "runner_install_template": "IyEvYmluL2Jhc2gKZWNobyBJbnN0YWxsaW5nIHJ1bm5lci4uLg==",
            "pre_install_scripts": {"setup.sh": "IyEvYmluL2Jhc2gKZWNobyBTZXR1cCBzY3JpcHQuLi4="},
            "extra_context": {"key": "value"}
        });

        let extra = ExtraSpecs::from_raw(&raw).unwrap();
        assert_eq!(extra.zone_id.as_deref(), Some("zone-1"));
        assert_eq!(extra.network_ids, vec!["net1", "net2"]);
        assert_eq!(extra.disable_updates, Some(true));
        assert_eq!(extra.nfs_mounts[0].server, "nfs.local");
        assert!(!extra.nfs_mounts[0].read_write);
        assert_eq!(extra.extra_context["key"], "value");
    }

    #[test]
    fn schema_document_is_strict() {
        let schema = ExtraSpecs::json_schema().unwrap();
        assert!(schema.is_object());
        assert_eq!(schema["additionalProperties"], false);
        assert!(schema["properties"].get("zone_id").is_some());
    }

    #[test]
    fn schema_rejects_unknown_fields_before_decoding() {
        let err = ExtraSpecs::validate(&json!({"invalid": "value"})).unwrap_err();
        assert!(err.to_string().contains("failed schema validation"));

        let err = ExtraSpecs::from_raw(&json!({"invalid": "value"})).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn schema_reports_offending_field() {
        let err = ExtraSpecs::validate(&json!({"network_ids": "net1"})).unwrap_err();
        assert!(err.to_string().contains("/network_ids"), "{err}");

        let err = ExtraSpecs::validate(&json!({"nfs_mounts": [{"server": "s"}]})).unwrap_err();
        assert!(err.to_string().contains("/nfs_mounts/0"), "{err}");

        let err = ExtraSpecs::validate(&json!({
            "nfs_mounts": [{"server": "s", "server_path": "/e", "mount_path": "/m", "extra": 1}]
        }))
        .unwrap_err();
        assert!(err.to_string().contains("/nfs_mounts/0"), "{err}");
    }

    #[test]
    fn missing_document_is_a_no_op() {
        assert_eq!(
            ExtraSpecs::from_raw(&serde_json::Value::Null).unwrap(),
            ExtraSpecs::default()
        );
        assert_eq!(ExtraSpecs::from_raw(&json!({})).unwrap(), ExtraSpecs::default());
    }

    #[test]
    fn builds_spec_from_defaults_and_overrides() {
        let spec = build(json!({
            "zone_id": "zone-override",
            "disable_updates": true,
            "enable_boot_debug": true,
            "extra_packages": ["pkg1"]
        }))
        .unwrap();

        assert_eq!(spec.zone_id, "zone-override");
        assert_eq!(spec.service_offering_id, "service-offering-id");
        assert_eq!(spec.template_id, "T");
        assert!(spec.network_ids.is_empty());
        assert!(spec.disable_updates);
        assert!(spec.enable_boot_debug);
        assert_eq!(spec.extra_packages, vec!["pkg1"]);
        assert_eq!(spec.tools.filename, "runner.tar.gz");
        assert_eq!(spec.controller_id, "controller-id");
        assert_eq!(spec.bootstrap.name, "runner-name");
    }

    #[test]
    fn empty_override_keeps_default() {
        let spec = build(json!({"template_id": "", "project_id": "", "ssh_key_name": ""})).unwrap();
        assert_eq!(spec.template_id, "T");
        assert_eq!(spec.project_id, None);
        assert_eq!(spec.ssh_key_name, None);

        let spec = build(json!({"template_id": "T2"})).unwrap();
        assert_eq!(spec.template_id, "T2");
    }

    #[test]
    fn explicit_false_overrides_flags() {
        let mut spec = build(json!({"disable_updates": true})).unwrap();
        spec.merge_extra_specs(ExtraSpecs {
            disable_updates: Some(false),
            ..Default::default()
        })
        .unwrap();
        assert!(!spec.disable_updates);
    }

    #[test]
    fn install_scripts_are_decoded() {
        let spec = build(json!({
            "runner_install_template": "IyEvYmluL2Jhc2gKZWNobyBJbnN0YWxsaW5nIHJ1bm5lci4uLg==",
            "pre_install_scripts": {"setup.sh": "IyEvYmluL2Jhc2gKZWNobyBTZXR1cCBzY3JpcHQuLi4="}
        }))
        .unwrap();
        assert_eq!(
            spec.install_template.as_deref(),
            Some("#!/bin/bash\necho Installing runner...")
        );
        assert_eq!(
            spec.pre_install_scripts["setup.sh"],
            "#!/bin/bash\necho Setup script..."
        );

        let err = build(json!({"runner_install_template": "%%%"})).unwrap_err();
        assert!(err.to_string().contains("runner_install_template"));
    }

    #[test]
    fn validate_names_first_missing_field() {
        let mut spec = build(serde_json::Value::Null).unwrap();
        spec.bootstrap.name.clear();
        assert_eq!(
            spec.validate().unwrap_err().to_string(),
            "validation error: missing bootstrap params"
        );
        spec.zone_id.clear();
        assert_eq!(
            spec.validate().unwrap_err().to_string(),
            "validation error: missing zone_id"
        );
    }

    #[test]
    fn unresolved_config_fails_build() {
        let cfg = ProviderConfig::from_toml(CONFIG).unwrap();
        let err = SpecBuilder::default()
            .build(&cfg, bootstrap(serde_json::Value::Null), "c")
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn default_tools_match_platform() {
        let mut b = bootstrap(serde_json::Value::Null);
        b.os_arch = OsArch::Arm64;
        b.tools = vec![
            RunnerApplicationDownload {
                os: "linux".into(),
                architecture: "x64".into(),
                filename: "x64.tar.gz".into(),
                ..Default::default()
            },
            RunnerApplicationDownload {
                os: "linux".into(),
                architecture: "arm64".into(),
                filename: "arm64.tar.gz".into(),
                ..Default::default()
            },
        ];
        let spec = SpecBuilder::default().build(&config(), b.clone(), "c").unwrap();
        assert_eq!(spec.tools.filename, "arm64.tar.gz");

        b.os_type = OsType::Windows;
        let err = SpecBuilder::default().build(&config(), b, "c").unwrap_err();
        assert!(err.to_string().contains("failed to find tools"));
    }

    #[test]
    fn nfs_mount_options() {
        let mut mount = NfsMount {
            server: "nfs.local".into(),
            server_path: "/export".into(),
            mount_path: "/mnt/cache".into(),
            ..Default::default()
        };
        assert_eq!(mount.mount_options(), "nfsvers=4,ro,soft,timeo=30");

        mount.read_write = true;
        assert_eq!(mount.mount_options(), "nfsvers=4,rw,soft,timeo=30");

        mount.options = Some("".into());
        assert_eq!(mount.mount_options(), "nfsvers=4,rw,soft,timeo=30");

        mount.options = Some("vers=3,hard".into());
        assert_eq!(mount.mount_options(), "vers=3,hard");
    }

    #[test]
    fn nfs_mounts_are_checked() {
        let err = build(json!({
            "nfs_mounts": [{"server": "nfs", "server_path": "/e", "mount_path": "/m; rm -rf /"}]
        }))
        .unwrap_err();
        assert!(err.to_string().contains("unsupported characters"));

        let err = build(json!({
            "nfs_mounts": [{"server": "nfs", "server_path": "/e", "mount_path": "relative"}]
        }))
        .unwrap_err();
        assert!(err.to_string().contains("must be absolute"));
    }

    #[test]
    fn nfs_mounts_require_linux() {
        let mut b = bootstrap(json!({
            "nfs_mounts": [{"server": "nfs", "server_path": "/e", "mount_path": "/m"}]
        }));
        b.os_type = OsType::Windows;
        let err = SpecBuilder::new(Arc::new(FixedTools))
            .build(&config(), b, "c")
            .unwrap_err();
        assert!(err.to_string().contains("not supported on windows"));
    }
}
