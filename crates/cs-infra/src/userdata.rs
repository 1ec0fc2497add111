use std::collections::BTreeMap;
use std::io::{Cursor, Write};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use flate2::Compression;
use flate2::write::GzEncoder;
use minijinja::{Environment, UndefinedBehavior, Value};
use serde::Serialize;
use tracing::{debug, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::spec::{NfsMount, RunnerSpec};
use crate::types::OsType;
use crate::{Error, Result};

/// Payloads at or above this many bytes are compressed before encoding.
pub const COMPRESSION_THRESHOLD: usize = 1 << 14;

const INSTALL_SCRIPT_PATH: &str = "/install_runner.sh";
const PRE_INSTALL_DIR: &str = "/garm-pre-install";
const NFS_SCRIPT_NAME: &str = "00-nfs-mounts.sh";

const LINUX_INSTALL_TEMPLATE: &str = r#"#!/bin/bash
set -e
set -o pipefail

METADATA_URL="{{ metadata_url }}"
CALLBACK_URL="{{ callback_url }}"
BEARER_TOKEN="{{ instance_token }}"

function call() {
	PAYLOAD="$1"
	curl --retry 5 --retry-delay 5 --retry-connrefused --fail -s -X POST \
		-d "${PAYLOAD}" -H 'Accept: application/json' \
		-H "Authorization: Bearer ${BEARER_TOKEN}" "${CALLBACK_URL}" || echo "failed to call home: exit code ($?)"
}

function sendStatus() {
	call "{\"status\": \"installing\", \"message\": \"$1\"}"
}

function fail() {
	call "{\"status\": \"failed\", \"message\": \"$1\"}"
	exit 1
}

function getRunnerFile() {
	curl --retry 5 --retry-delay 5 --retry-connrefused --fail -s -X GET \
		-H 'Accept: application/json' -H "Authorization: Bearer ${BEARER_TOKEN}" \
		"${METADATA_URL}/$1" -o "$2"
}

sendStatus "downloading tools from {{ download_url }}"
mkdir -p /home/runner/actions-runner
cd /home/runner/actions-runner
curl --retry 5 --retry-delay 5 --fail -L -o "{{ filename }}" \
	-H "Authorization: Bearer {{ temp_download_token }}" "{{ download_url }}" || fail "failed to download tools"
{% if sha256_checksum %}
echo "{{ sha256_checksum }}  {{ filename }}" | sha256sum -c - || fail "checksum mismatch for {{ filename }}"
{% endif %}
tar xf "{{ filename }}" || fail "failed to extract tools"

sendStatus "configuring runner"
./bin/installdependencies.sh || fail "failed to install dependencies"
{% if jit_config_enabled %}
sendStatus "downloading JIT credentials"
getRunnerFile "credentials/runner" ".runner" || fail "failed to get runner file"
getRunnerFile "credentials/credentials" ".credentials" || fail "failed to get credentials file"
getRunnerFile "credentials/credentials_rsaparams" ".credentials_rsaparams" || fail "failed to get credentials_rsaparams file"
{% else %}
./config.sh --unattended --url "{{ repo_url }}" --name "{{ runner_name }}" \
	--labels "{{ labels }}" --ephemeral \
{% if runner_group %}
	--runnergroup "{{ runner_group }}" \
{% endif %}
	--token "$(curl --retry 5 --fail -s -H "Authorization: Bearer ${BEARER_TOKEN}" "${METADATA_URL}/runner-registration-token/")" \
	|| fail "failed to configure runner"
{% endif %}

sendStatus "installing runner service"
./svc.sh install || fail "failed to install service"
./svc.sh start || fail "failed to start service"

call '{"status": "idle", "message": "runner successfully installed"}'
"#;

const WINDOWS_INSTALL_TEMPLATE: &str = r#"$ErrorActionPreference = "Stop"

$MetadataUrl = "{{ metadata_url }}"
$CallbackUrl = "{{ callback_url }}"
$Token = "{{ instance_token }}"
$Headers = @{ Authorization = "Bearer $Token"; Accept = "application/json" }

function Send-Status([string]$Status, [string]$Message) {
	$Body = @{ status = $Status; message = $Message } | ConvertTo-Json
	Invoke-RestMethod -Uri $CallbackUrl -Method Post -Headers $Headers -Body $Body | Out-Null
}

try {
	Send-Status "installing" "downloading tools from {{ download_url }}"
	New-Item -ItemType Directory -Force -Path C:\actions-runner | Out-Null
	Set-Location C:\actions-runner
	Invoke-WebRequest -Uri "{{ download_url }}" -OutFile "{{ filename }}" `
		-Headers @{ Authorization = "Bearer {{ temp_download_token }}" }
{% if sha256_checksum %}
	$Hash = (Get-FileHash -Path "{{ filename }}" -Algorithm SHA256).Hash
	if ($Hash -ne "{{ sha256_checksum }}") {
		throw "checksum mismatch for {{ filename }}"
	}
{% endif %}
	Expand-Archive -Path "{{ filename }}" -DestinationPath . -Force

	Send-Status "installing" "configuring runner"
{% if jit_config_enabled %}
	foreach ($File in @("runner", "credentials", "credentials_rsaparams")) {
		Invoke-WebRequest -Uri "$MetadataUrl/credentials/$File" -Headers $Headers -OutFile ".$File"
	}
	New-Service -Name "actions.runner.{{ runner_name }}" -StartupType Automatic `
		-BinaryPathName "C:\actions-runner\bin\RunnerService.exe" | Out-Null
	Start-Service -Name "actions.runner.{{ runner_name }}"
{% else %}
	$RegToken = Invoke-RestMethod -Uri "$MetadataUrl/runner-registration-token/" -Headers $Headers
	./config.cmd --unattended --url "{{ repo_url }}" --name "{{ runner_name }}" `
{% if runner_group %}
		--runnergroup "{{ runner_group }}" `
{% endif %}
		--labels "{{ labels }}" --ephemeral --runasservice --token $RegToken
{% endif %}

	Send-Status "idle" "runner successfully installed"
} catch {
	Send-Status "failed" $_.Exception.Message
	exit 1
}
"#;

#[derive(Debug, Serialize)]
struct CloudConfig {
    package_upgrade: bool,
    packages: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    ssh_authorized_keys: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ca_certs: Option<CaCerts>,
    write_files: Vec<WriteFile>,
    runcmd: Vec<String>,
}

#[derive(Debug, Serialize)]
struct CaCerts {
    trusted: Vec<String>,
}

#[derive(Debug, Serialize)]
struct WriteFile {
    encoding: &'static str,
    content: String,
    owner: &'static str,
    path: String,
    permissions: &'static str,
}

impl WriteFile {
    fn script(path: String, body: &str) -> Self {
        Self {
            encoding: "b64",
            content: STANDARD.encode(body),
            owner: "root:root",
            path,
            permissions: "0755",
        }
    }
}

/// Shell script mounting `mounts`, or `None` when there is nothing to mount.
pub fn nfs_mount_script(mounts: &[NfsMount]) -> Option<String> {
    if mounts.is_empty() {
        return None;
    }

    let mut script = String::from("#!/bin/bash\nset -e\n\n");
    script.push_str(
        "(command -v apt-get >/dev/null && apt-get update -q && apt-get install -y -q nfs-common) \
         || (command -v dnf >/dev/null && dnf install -y -q nfs-utils) \
         || (command -v yum >/dev/null && yum install -y -q nfs-utils)\n",
    );
    for mount in mounts {
        script.push_str(&format!(
            "\nmkdir -p {path}\nmount -t nfs -o {opts} {server}:{export} {path}\n",
            path = mount.mount_path,
            opts = mount.mount_options(),
            server = mount.server,
            export = mount.server_path,
        ));
    }
    Some(script)
}

/// Compress `payload` when it reaches [`COMPRESSION_THRESHOLD`]: a single
/// `udata` zip entry for Windows, a gzip stream otherwise.
pub fn maybe_compress(payload: Vec<u8>, os_type: OsType) -> Result<Vec<u8>> {
    if payload.len() < COMPRESSION_THRESHOLD {
        return Ok(payload);
    }

    let compressed = match os_type {
        OsType::Windows => {
            let mut buffer = Cursor::new(Vec::new());
            {
                let mut zip = ZipWriter::new(&mut buffer);
                let options =
                    SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
                zip.start_file("udata", options)
                    .map_err(|e| Error::UserData(format!("failed to create zip entry: {e}")))?;
                zip.write_all(&payload)
                    .map_err(|e| Error::UserData(format!("failed to write zip entry: {e}")))?;
                zip.finish()
                    .map_err(|e| Error::UserData(format!("failed to finalize zip: {e}")))?;
            }
            buffer.into_inner()
        }
        _ => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder
                .write_all(&payload)
                .map_err(|e| Error::UserData(format!("failed to gzip user data: {e}")))?;
            encoder
                .finish()
                .map_err(|e| Error::UserData(format!("failed to gzip user data: {e}")))?
        }
    };

    debug!(
        os_type = %os_type,
        raw = payload.len(),
        compressed = compressed.len(),
        "compressed user data"
    );
    Ok(compressed)
}

/// Render, compress and base64 encode the boot payload for `spec`.
pub fn compose_user_data(spec: &RunnerSpec) -> Result<String> {
    let install = install_script(spec)?;

    let payload = match spec.bootstrap.os_type {
        OsType::Linux => linux_cloud_config(spec, &install)?,
        OsType::Windows => {
            if !spec.pre_install_scripts.is_empty() {
                warn!(
                    name = %spec.bootstrap.name,
                    "pre-install scripts are not run on windows instances"
                );
            }
            format!("<powershell>\n{install}\n</powershell>")
        }
        OsType::Unknown => {
            return Err(Error::UserData("unsupported os type".into()));
        }
    };

    let payload = maybe_compress(payload.into_bytes(), spec.bootstrap.os_type)?;
    Ok(STANDARD.encode(payload))
}

fn linux_cloud_config(spec: &RunnerSpec, install: &str) -> Result<String> {
    let mut packages = vec!["curl".to_string(), "tar".to_string()];
    packages.extend(spec.extra_packages.iter().cloned());

    let ca_certs = match &spec.bootstrap.ca_cert_bundle {
        Some(bundle) if !bundle.is_empty() => {
            let pem = STANDARD
                .decode(bundle)
                .map_err(|e| Error::UserData(format!("invalid ca-cert-bundle: {e}")))?;
            let pem = String::from_utf8(pem)
                .map_err(|_| Error::UserData("ca-cert-bundle is not valid UTF-8".into()))?;
            Some(CaCerts { trusted: vec![pem] })
        }
        _ => None,
    };

    let mut write_files = Vec::new();
    let mut runcmd = Vec::new();

    let mut pre_install: Vec<(&str, &str)> = Vec::new();
    let nfs = nfs_mount_script(&spec.nfs_mounts);
    if let Some(script) = &nfs {
        pre_install.push((NFS_SCRIPT_NAME, script));
    }
    pre_install.extend(
        spec.pre_install_scripts
            .iter()
            .filter(|(name, _)| name.as_str() != NFS_SCRIPT_NAME)
            .map(|(name, body)| (name.as_str(), body.as_str())),
    );

    for (name, body) in pre_install {
        let path = format!("{PRE_INSTALL_DIR}/{name}");
        runcmd.push(path.clone());
        write_files.push(WriteFile::script(path, body));
    }

    write_files.push(WriteFile::script(INSTALL_SCRIPT_PATH.to_string(), install));
    if spec.enable_boot_debug {
        runcmd.push(format!("bash -x {INSTALL_SCRIPT_PATH}"));
    } else {
        runcmd.push(INSTALL_SCRIPT_PATH.to_string());
    }
    runcmd.push(format!("rm -f {INSTALL_SCRIPT_PATH}"));

    let config = CloudConfig {
        package_upgrade: !spec.disable_updates,
        packages,
        ssh_authorized_keys: spec.bootstrap.ssh_keys.clone(),
        ca_certs,
        write_files,
        runcmd,
    };

    let yaml = serde_yaml::to_string(&config)
        .map_err(|e| Error::UserData(format!("failed to render cloud-config: {e}")))?;
    Ok(format!("#cloud-config\n{yaml}"))
}

fn install_script(spec: &RunnerSpec) -> Result<String> {
    let template = match (&spec.install_template, spec.bootstrap.os_type) {
        (Some(custom), _) => custom.as_str(),
        (None, OsType::Windows) => WINDOWS_INSTALL_TEMPLATE,
        (None, _) => LINUX_INSTALL_TEMPLATE,
    };
    render_template(template, &install_context(spec))
}

/// Values available to install templates. Extra context never shadows a
/// built-in key.
fn install_context(spec: &RunnerSpec) -> BTreeMap<String, Value> {
    let b = &spec.bootstrap;
    let mut ctx: BTreeMap<String, Value> = spec
        .extra_context
        .iter()
        .map(|(key, value)| (key.clone(), Value::from(value.as_str())))
        .collect();
    let builtins = [
        ("runner_name", Value::from(b.name.as_str())),
        ("repo_url", Value::from(b.repo_url.as_str())),
        ("callback_url", Value::from(b.callback_url.as_str())),
        ("metadata_url", Value::from(b.metadata_url.as_str())),
        ("instance_token", Value::from(b.instance_token.as_str())),
        ("labels", Value::from(b.labels.join(","))),
        ("runner_group", Value::from(b.runner_group.as_str())),
        ("jit_config_enabled", Value::from(b.jit_config_enabled)),
        ("pool_id", Value::from(b.pool_id.as_str())),
        ("os_type", Value::from(b.os_type.as_str())),
        ("os_arch", Value::from(b.os_arch.to_string())),
        ("controller_id", Value::from(spec.controller_id.as_str())),
        ("download_url", Value::from(spec.tools.download_url.as_str())),
        ("filename", Value::from(spec.tools.filename.as_str())),
        (
            "temp_download_token",
            Value::from(spec.tools.temp_download_token.clone().unwrap_or_default()),
        ),
        (
            "sha256_checksum",
            Value::from(spec.tools.sha256_checksum.clone().unwrap_or_default()),
        ),
        ("enable_boot_debug", Value::from(spec.enable_boot_debug)),
    ];
    for (key, value) in builtins {
        ctx.insert(key.to_string(), value);
    }
    ctx
}

/// Render a Jinja-style install template. Undefined values and syntax
/// errors both fail the render.
pub fn render_template(template: &str, ctx: &BTreeMap<String, Value>) -> Result<String> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.set_keep_trailing_newline(true);
    env.set_trim_blocks(true);
    env.add_template("install", template)
        .map_err(|e| Error::UserData(format!("failed to parse install template: {e}")))?;

    let tmpl = env
        .get_template("install")
        .map_err(|e| Error::UserData(format!("failed to load install template: {e}")))?;

    tmpl.render(ctx)
        .map_err(|e| Error::UserData(format!("failed to render install template: {e}")))
}
