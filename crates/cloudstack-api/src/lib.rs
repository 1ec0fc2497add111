//! Typed Rust client for the Apache CloudStack API.
//!
//! Covers the subset needed for managing runner VMs: zone, service offering,
//! project and template lookups, virtual machines (deploy, list, start, stop,
//! destroy), resource tags, and polling of async jobs.

mod types;

pub use reqwest::StatusCode;
pub use types::*;

use std::collections::BTreeMap;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use sha1::Sha1;
use tracing::debug;

const DEFAULT_ASYNC_TIMEOUT: Duration = Duration::from_secs(15 * 60);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cloudstack api request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("cloudstack api {command} returned {status} (errorcode {error_code}): {error_text}")]
    Api {
        command: &'static str,
        status: StatusCode,
        error_code: u32,
        error_text: String,
    },

    #[error("cloudstack api {command} returned an unexpected body: {message}")]
    Decode {
        command: &'static str,
        message: String,
    },

    #[error("cloudstack async job {job_id} failed (errorcode {error_code}): {error_text}")]
    JobFailed {
        job_id: String,
        error_code: u32,
        error_text: String,
    },

    #[error("cloudstack async job {job_id} did not finish within {timeout:?}")]
    AsyncTimeout { job_id: String, timeout: Duration },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Client for the CloudStack query API.
///
/// Every request is a signed POST to the single API endpoint. Async commands
/// are followed by `queryAsyncJobResult` polling until the job finishes or
/// the async timeout elapses.
#[derive(Clone)]
pub struct CloudStackClient {
    api_url: String,
    api_key: String,
    secret: String,
    async_timeout: Duration,
    poll_interval: Duration,
    http: reqwest::Client,
}

impl CloudStackClient {
    pub fn new(
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        secret: impl Into<String>,
        verify_ssl: bool,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(!verify_ssl)
            .build()?;

        Ok(Self {
            api_url: api_url.into(),
            api_key: api_key.into(),
            secret: secret.into(),
            async_timeout: DEFAULT_ASYNC_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            http,
        })
    }

    /// Upper bound for waiting on a single async job.
    pub fn with_async_timeout(mut self, timeout: Duration) -> Self {
        self.async_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    async fn call<T: DeserializeOwned + Default>(
        &self,
        command: &'static str,
        mut params: BTreeMap<String, String>,
    ) -> Result<T> {
        params.insert("command".into(), command.into());
        params.insert("response".into(), "json".into());
        params.insert("apikey".into(), self.api_key.clone());
        let signature = sign(&self.secret, &params);
        params.insert("signature".into(), signature);

        let resp = self.http.post(&self.api_url).form(&params).send().await?;
        let status = resp.status();
        let body = resp.text().await?;

        if !status.is_success() {
            let err = error_body(&body);
            return Err(Error::Api {
                command,
                status,
                error_code: err.errorcode,
                error_text: err.errortext,
            });
        }

        unwrap_envelope(command, &body)
    }

    async fn call_async(
        &self,
        command: &'static str,
        params: BTreeMap<String, String>,
    ) -> Result<serde_json::Value> {
        let started: AsyncJobStarted = self.call(command, params).await?;
        debug!(command, job_id = %started.jobid, resource_id = ?started.id, "cloudstack: async job started");
        self.wait_for_job(&started.jobid).await
    }

    async fn wait_for_job(&self, job_id: &str) -> Result<serde_json::Value> {
        let deadline = tokio::time::Instant::now() + self.async_timeout;
        loop {
            let mut params = BTreeMap::new();
            params.insert("jobid".to_string(), job_id.to_string());
            let job: AsyncJobResult = self.call("queryAsyncJobResult", params).await?;

            match job.jobstatus {
                1 => return Ok(job.jobresult.unwrap_or(serde_json::Value::Null)),
                2 => {
                    let err: ErrorBody = job
                        .jobresult
                        .and_then(|v| serde_json::from_value(v).ok())
                        .unwrap_or_default();
                    return Err(Error::JobFailed {
                        job_id: job_id.to_string(),
                        error_code: err.errorcode,
                        error_text: err.errortext,
                    });
                }
                _ => {}
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(Error::AsyncTimeout {
                    job_id: job_id.to_string(),
                    timeout: self.async_timeout,
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    // ── Lookups ──────────────────────────────────────────────────────

    pub async fn list_zones(&self, name: &str) -> Result<Vec<Zone>> {
        let mut params = BTreeMap::new();
        params.insert("name".to_string(), name.to_string());
        let resp: ListZonesResponse = self.call("listZones", params).await?;
        Ok(resp.zone)
    }

    pub async fn list_service_offerings(&self, name: &str) -> Result<Vec<ServiceOffering>> {
        let mut params = BTreeMap::new();
        params.insert("name".to_string(), name.to_string());
        let resp: ListServiceOfferingsResponse =
            self.call("listServiceOfferings", params).await?;
        Ok(resp.serviceoffering)
    }

    pub async fn list_projects(&self, name: &str) -> Result<Vec<Project>> {
        let mut params = BTreeMap::new();
        params.insert("name".to_string(), name.to_string());
        params.insert("listall".to_string(), "true".to_string());
        let resp: ListProjectsResponse = self.call("listProjects", params).await?;
        Ok(resp.project)
    }

    pub async fn list_templates(&self, query: &ListTemplatesParams) -> Result<Vec<Template>> {
        let resp: ListTemplatesResponse = self.call("listTemplates", query.to_params()).await?;
        Ok(resp.template)
    }

    // ── Virtual machines ─────────────────────────────────────────────

    pub async fn deploy_virtual_machine(
        &self,
        req: &DeployVirtualMachineParams,
    ) -> Result<VirtualMachine> {
        let result = self
            .call_async("deployVirtualMachine", req.to_params())
            .await?;
        job_payload(result, "virtualmachine", "deployVirtualMachine")
    }

    pub async fn list_virtual_machines(
        &self,
        query: &ListVirtualMachinesParams,
    ) -> Result<Vec<VirtualMachine>> {
        let resp: ListVirtualMachinesResponse =
            self.call("listVirtualMachines", query.to_params()).await?;
        Ok(resp.virtualmachine)
    }

    pub async fn start_virtual_machine(&self, id: &str) -> Result<()> {
        let mut params = BTreeMap::new();
        params.insert("id".to_string(), id.to_string());
        self.call_async("startVirtualMachine", params).await?;
        Ok(())
    }

    pub async fn stop_virtual_machine(&self, id: &str, forced: bool) -> Result<()> {
        let mut params = BTreeMap::new();
        params.insert("id".to_string(), id.to_string());
        params.insert("forced".to_string(), forced.to_string());
        self.call_async("stopVirtualMachine", params).await?;
        Ok(())
    }

    pub async fn destroy_virtual_machine(&self, id: &str, expunge: bool) -> Result<()> {
        let mut params = BTreeMap::new();
        params.insert("id".to_string(), id.to_string());
        params.insert("expunge".to_string(), expunge.to_string());
        self.call_async("destroyVirtualMachine", params).await?;
        Ok(())
    }

    // ── Tags ─────────────────────────────────────────────────────────

    pub async fn create_tags(
        &self,
        resource_ids: &[String],
        resource_type: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<()> {
        let mut params = BTreeMap::new();
        params.insert("resourceids".to_string(), resource_ids.join(","));
        params.insert("resourcetype".to_string(), resource_type.to_string());
        insert_tags(&mut params, tags);
        self.call_async("createTags", params).await?;
        Ok(())
    }
}

/// The string CloudStack signs: parameters sorted by name, values
/// query-escaped with `%20` for spaces, the whole thing lower-cased.
pub fn canonical_query(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
        .to_lowercase()
}

/// HMAC-SHA1 request signature, base64 encoded.
pub fn sign(secret: &str, params: &BTreeMap<String, String>) -> String {
    let mut mac = Hmac::<Sha1>::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts any key size");
    mac.update(canonical_query(params).as_bytes());
    STANDARD.encode(mac.finalize().into_bytes())
}

fn envelope_key(command: &str) -> String {
    format!("{}response", command.to_lowercase())
}

fn unwrap_envelope<T: DeserializeOwned + Default>(command: &'static str, body: &str) -> Result<T> {
    let value: serde_json::Value = serde_json::from_str(body).map_err(|e| Error::Decode {
        command,
        message: e.to_string(),
    })?;

    match value.get(envelope_key(command)) {
        Some(inner) => serde_json::from_value(inner.clone()).map_err(|e| Error::Decode {
            command,
            message: e.to_string(),
        }),
        None => Err(Error::Decode {
            command,
            message: format!("missing {} envelope", envelope_key(command)),
        }),
    }
}

/// Error replies carry `errorcode`/`errortext` inside the command envelope.
fn error_body(body: &str) -> ErrorBody {
    let parsed = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.as_object().and_then(|o| o.values().next().cloned()))
        .and_then(|inner| serde_json::from_value::<ErrorBody>(inner).ok());

    match parsed {
        Some(err) if !err.errortext.is_empty() => err,
        Some(err) => ErrorBody {
            errorcode: err.errorcode,
            errortext: body.to_string(),
        },
        None => ErrorBody {
            errorcode: 0,
            errortext: body.to_string(),
        },
    }
}

fn job_payload<T: DeserializeOwned>(
    result: serde_json::Value,
    key: &str,
    command: &'static str,
) -> Result<T> {
    let inner = result.get(key).cloned().ok_or_else(|| Error::Decode {
        command,
        message: format!("async job result has no {key}"),
    })?;
    serde_json::from_value(inner).map_err(|e| Error::Decode {
        command,
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const VM_ID: &str = "5b5c6a3e-8a3f-4f5e-9a59-0f7a1b2c3d4e";

    fn client(server: &MockServer) -> CloudStackClient {
        CloudStackClient::new(format!("{}/client/api", server.uri()), "key", "secret", true)
            .unwrap()
            .with_poll_interval(Duration::from_millis(5))
    }

    #[test]
    fn canonical_query_sorts_escapes_and_lowercases() {
        let mut params = BTreeMap::new();
        params.insert("name".to_string(), "My Zone".to_string());
        params.insert("command".to_string(), "listZones".to_string());
        params.insert("apikey".to_string(), "ABC".to_string());

        assert_eq!(
            canonical_query(&params),
            "apikey=abc&command=listzones&name=my%20zone"
        );
    }

    #[test]
    fn signature_depends_on_secret() {
        let mut params = BTreeMap::new();
        params.insert("command".to_string(), "listZones".to_string());

        let a = sign("one", &params);
        let b = sign("two", &params);
        assert_ne!(a, b);
        assert_eq!(a, sign("one", &params));
        // 20 byte SHA1 digest in base64
        assert_eq!(a.len(), 28);
    }

    #[tokio::test]
    async fn list_zones_unwraps_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/client/api"))
            .and(body_string_contains("command=listZones"))
            .and(body_string_contains("signature="))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "listzonesresponse": {
                    "count": 1,
                    "zone": [{"id": "zone-uuid", "name": "us-west-1"}]
                }
            })))
            .mount(&server)
            .await;

        let zones = client(&server).list_zones("us-west-1").await.unwrap();
        assert_eq!(zones.len(), 1);
        assert_eq!(zones[0].id, "zone-uuid");
    }

    #[tokio::test]
    async fn empty_list_envelope_is_empty_vec() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("command=listVirtualMachines"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"listvirtualmachinesresponse": {}})),
            )
            .mount(&server)
            .await;

        let vms = client(&server)
            .list_virtual_machines(&ListVirtualMachinesParams::default())
            .await
            .unwrap();
        assert!(vms.is_empty());
    }

    #[tokio::test]
    async fn api_error_carries_errortext() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("command=listVirtualMachines"))
            .respond_with(ResponseTemplate::new(431).set_body_json(serde_json::json!({
                "listvirtualmachinesresponse": {
                    "errorcode": 431,
                    "errortext": "Unable to execute API command listvirtualmachines due to invalid value, or entity does not exist"
                }
            })))
            .mount(&server)
            .await;

        let err = client(&server)
            .list_virtual_machines(&ListVirtualMachinesParams {
                id: Some("bogus".into()),
                ..Default::default()
            })
            .await
            .unwrap_err();

        match err {
            Error::Api {
                error_code,
                error_text,
                ..
            } => {
                assert_eq!(error_code, 431);
                assert!(error_text.contains("entity does not exist"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn deploy_waits_for_async_job() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("command=deployVirtualMachine"))
            .and(body_string_contains("networkids=net-1%2Cnet-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "deployvirtualmachineresponse": {"id": VM_ID, "jobid": "job-1"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_string_contains("command=queryAsyncJobResult"))
            .and(body_string_contains("jobid=job-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "queryasyncjobresultresponse": {
                    "jobid": "job-1",
                    "jobstatus": 1,
                    "jobresult": {
                        "virtualmachine": {"id": VM_ID, "name": "runner-1", "state": "Running"}
                    }
                }
            })))
            .mount(&server)
            .await;

        let vm = client(&server)
            .deploy_virtual_machine(&DeployVirtualMachineParams {
                service_offering_id: "off".into(),
                template_id: "tmpl".into(),
                zone_id: "zone".into(),
                name: "runner-1".into(),
                display_name: "runner-1".into(),
                user_data: "I2Nsb3VkLWNvbmZpZw==".into(),
                network_ids: vec!["net-1".into(), "net-2".into()],
                keypair: None,
                project_id: None,
            })
            .await
            .unwrap();

        assert_eq!(vm.id, VM_ID);
        assert_eq!(vm.state, "Running");
    }

    #[tokio::test]
    async fn failed_job_surfaces_errortext() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("command=stopVirtualMachine"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "stopvirtualmachineresponse": {"jobid": "job-2"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_string_contains("command=queryAsyncJobResult"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "queryasyncjobresultresponse": {
                    "jobstatus": 2,
                    "jobresult": {"errorcode": 530, "errortext": "Failed to stop VM"}
                }
            })))
            .mount(&server)
            .await;

        let err = client(&server)
            .stop_virtual_machine(VM_ID, true)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::JobFailed { error_code: 530, .. }));
    }

    #[tokio::test]
    async fn pending_job_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("command=destroyVirtualMachine"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "destroyvirtualmachineresponse": {"jobid": "job-3"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_string_contains("command=queryAsyncJobResult"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "queryasyncjobresultresponse": {"jobstatus": 0}
            })))
            .mount(&server)
            .await;

        let err = client(&server)
            .with_async_timeout(Duration::from_millis(20))
            .destroy_virtual_machine(VM_ID, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AsyncTimeout { .. }));
    }

    #[tokio::test]
    async fn create_tags_encodes_tag_map() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("command=createTags"))
            .and(body_string_contains("resourcetype=UserVm"))
            .and(body_string_contains("tags%5B0%5D.key=GARM_POOL_ID"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "createtagsresponse": {"jobid": "job-4"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_string_contains("command=queryAsyncJobResult"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "queryasyncjobresultresponse": {"jobstatus": 1, "jobresult": {"success": true}}
            })))
            .mount(&server)
            .await;

        let mut tags = BTreeMap::new();
        tags.insert("GARM_POOL_ID".to_string(), "pool-1".to_string());
        client(&server)
            .create_tags(&[VM_ID.to_string()], "UserVm", &tags)
            .await
            .unwrap();
    }
}
