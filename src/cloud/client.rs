//! CloudStack API client.
//!
//! Speaks the signed query protocol: every request is a GET whose
//! parameters are sorted, url-encoded and signed with HMAC-SHA1 over the
//! lowercased query string. Commands that schedule an asynchronous job are
//! polled through `queryAsyncJobResult` until the job settles, bounded by
//! the configured operation timeout.

use super::{CloudConfig, CloudConnector, CloudError, Snapshot, Volume, VM};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use openssl::{hash::MessageDigest, pkey::PKey, sign::Signer};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// CSExceptionErrorCode for InvalidParameterValueException. On deletes it
/// means the resource is already gone.
const INVALID_PARAMETER_CODE: &str = "4350";

/// Interval between `queryAsyncJobResult` polls.
const JOB_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// The CloudStack metadata service alias served by the virtual router.
const METADATA_INSTANCE_ID_URL: &str = "http://data-server./latest/meta-data/instance-id";
const METADATA_TIMEOUT: Duration = Duration::from_secs(2);

/// Volume states in which CloudStack accepts a resize.
const RESIZABLE_STATES: [&str; 2] = ["Allocated", "Ready"];

/// Concrete [`CloudConnector`] backed by the CloudStack HTTP API.
pub struct CloudStackApiClient {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
    secret_key: String,
    project_id: String,
    /// Upper bound for one cloud operation, job polling included.
    timeout: Duration,
}

impl CloudStackApiClient {
    /// Build a client from the connection configuration.
    pub fn new(config: &CloudConfig, timeout: Duration) -> Result<Self, CloudError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(!config.verify_ssl)
            .build()
            .map_err(|source| CloudError::Request { source })?;
        Ok(Self {
            http,
            api_url: config.api_url.clone(),
            api_key: config.api_key.clone(),
            secret_key: config.secret_key.clone(),
            project_id: config.project_id.clone(),
            timeout,
        })
    }

    /// Build the sorted, signed query string for `command`.
    fn build_query(&self, command: &str, params: &[(String, String)]) -> Result<String, CloudError> {
        let mut pairs: Vec<(String, String)> = vec![
            ("command".to_string(), command.to_string()),
            ("response".to_string(), "json".to_string()),
            ("apiKey".to_string(), self.api_key.clone()),
        ];
        pairs.extend(params.iter().cloned());
        pairs.sort();
        let query = pairs
            .iter()
            .map(|(key, value)| format!("{key}={}", urlencoding::encode(value)))
            .collect::<Vec<_>>()
            .join("&");
        let signature = sign(&query, &self.secret_key)?;
        Ok(format!("{query}&signature={}", urlencoding::encode(&signature)))
    }

    /// Issue one API call and unwrap its `<command>response` envelope.
    async fn api_request(
        &self,
        command: &str,
        params: Vec<(String, String)>,
    ) -> Result<Value, CloudError> {
        let query = self.build_query(command, &params)?;
        let url = format!("{}?{}", self.api_url, query);
        debug!(command, "CloudStack API call");
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|source| CloudError::Request { source })?;
        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|source| CloudError::Request { source })?;
        let envelope = unwrap_envelope(command, body)?;
        if let Some(text) = error_text(&envelope) {
            return Err(CloudError::Api {
                command: command.to_string(),
                text,
            });
        }
        if !status.is_success() {
            return Err(CloudError::Api {
                command: command.to_string(),
                text: format!("HTTP {status}"),
            });
        }
        Ok(envelope)
    }

    /// Issue an API call and, when it scheduled an asynchronous job, poll
    /// until the job settles. Returns the job result for async commands and
    /// the immediate envelope otherwise.
    async fn async_request(
        &self,
        command: &str,
        params: Vec<(String, String)>,
    ) -> Result<Value, CloudError> {
        let response = self.api_request(command, params).await?;
        match response.get("jobid").and_then(Value::as_str) {
            Some(job_id) => {
                let job_id = job_id.to_string();
                self.wait_for_job(command, &job_id).await
            }
            None => Ok(response),
        }
    }

    async fn wait_for_job(&self, command: &str, job_id: &str) -> Result<Value, CloudError> {
        let deadline = Instant::now() + self.timeout;
        loop {
            let result = self
                .api_request(
                    "queryAsyncJobResult",
                    vec![("jobid".to_string(), job_id.to_string())],
                )
                .await?;
            match result.get("jobstatus").and_then(Value::as_i64).unwrap_or(0) {
                // Still running.
                0 => {}
                1 => return Ok(result.get("jobresult").cloned().unwrap_or(Value::Null)),
                _ => {
                    let text = result
                        .get("jobresult")
                        .and_then(error_text)
                        .unwrap_or_else(|| format!("async job {job_id} failed"));
                    return Err(CloudError::Api {
                        command: command.to_string(),
                        text,
                    });
                }
            }
            if Instant::now() + JOB_POLL_INTERVAL > deadline {
                return Err(CloudError::Api {
                    command: command.to_string(),
                    text: format!("async job {job_id} did not settle in time"),
                });
            }
            tokio::time::sleep(JOB_POLL_INTERVAL).await;
        }
    }

    /// Scope a parameter list by the default project, when configured.
    fn scoped(&self, mut params: Vec<(String, String)>) -> Vec<(String, String)> {
        if !self.project_id.is_empty() {
            params.push(("projectid".to_string(), self.project_id.clone()));
        }
        params
    }

    /// Exactly-one volume lookup.
    async fn list_volume(&self, params: Vec<(String, String)>) -> Result<ApiVolume, CloudError> {
        let envelope = self.api_request("listVolumes", self.scoped(params)).await?;
        let mut volumes: Vec<ApiVolume> = parse_list("listVolumes", &envelope, "volume")?;
        match volumes.len() {
            0 => Err(CloudError::NotFound),
            1 => Ok(volumes.remove(0)),
            _ => Err(CloudError::TooManyResults),
        }
    }

    /// Exactly-one VM lookup.
    async fn list_vm(&self, params: Vec<(String, String)>) -> Result<VM, CloudError> {
        let envelope = self
            .api_request("listVirtualMachines", self.scoped(params))
            .await?;
        let mut vms: Vec<ApiVirtualMachine> =
            parse_list("listVirtualMachines", &envelope, "virtualmachine")?;
        match vms.len() {
            0 => Err(CloudError::NotFound),
            1 => {
                let vm = vms.remove(0);
                Ok(VM {
                    id: vm.id,
                    zone_id: vm.zoneid,
                })
            }
            _ => Err(CloudError::TooManyResults),
        }
    }

    async fn get_vm_by_name(&self, name: &str) -> Result<VM, CloudError> {
        self.list_vm(vec![("name".to_string(), name.to_string())])
            .await
    }

    /// Look up this instance's VM ID on the metadata service. Returns None
    /// when the service is unreachable or answers nothing useful.
    async fn metadata_instance_id(&self) -> Option<String> {
        let client = reqwest::Client::builder()
            .timeout(METADATA_TIMEOUT)
            .build()
            .ok()?;
        match client.get(METADATA_INSTANCE_ID_URL).send().await {
            Ok(response) => match response.error_for_status() {
                Ok(response) => response
                    .text()
                    .await
                    .ok()
                    .map(|id| id.trim().to_string())
                    .filter(|id| !id.is_empty()),
                Err(_) => None,
            },
            Err(error) => {
                debug!(%error, "instance metadata not available");
                None
            }
        }
    }
}

/// HMAC-SHA1 of the lowercased query string, base64 encoded.
fn sign(query: &str, secret_key: &str) -> Result<String, CloudError> {
    let key =
        PKey::hmac(secret_key.as_bytes()).map_err(|source| CloudError::Signing { source })?;
    let mut signer = Signer::new(MessageDigest::sha1(), &key)
        .map_err(|source| CloudError::Signing { source })?;
    signer
        .update(query.to_lowercase().as_bytes())
        .map_err(|source| CloudError::Signing { source })?;
    let digest = signer
        .sign_to_vec()
        .map_err(|source| CloudError::Signing { source })?;
    Ok(STANDARD.encode(digest))
}

/// Unwrap the `<command>response` JSON envelope. Error replies arrive
/// either under the command key or under `errorresponse`.
fn unwrap_envelope(command: &str, body: Value) -> Result<Value, CloudError> {
    let expected = format!("{}response", command.to_lowercase());
    let Value::Object(mut map) = body else {
        return Err(CloudError::InvalidResponse {
            command: command.to_string(),
            reason: "response is not a JSON object".to_string(),
        });
    };
    if let Some(inner) = map.remove(&expected) {
        return Ok(inner);
    }
    if let Some(inner) = map.remove("errorresponse") {
        return Ok(inner);
    }
    // A few commands answer under a differently-worded key; accept a
    // single-entry envelope.
    if map.len() == 1 {
        if let Some((_, inner)) = map.into_iter().next() {
            return Ok(inner);
        }
    }
    Err(CloudError::InvalidResponse {
        command: command.to_string(),
        reason: format!("missing {expected} envelope"),
    })
}

/// Extract the error text from an envelope or job result, keeping the
/// CSExceptionErrorCode visible for callers that match on it.
fn error_text(envelope: &Value) -> Option<String> {
    let text = envelope.get("errortext").and_then(Value::as_str)?;
    Some(match envelope.get("cserrorcode").and_then(Value::as_i64) {
        Some(code) => format!("{text} (CSExceptionErrorCode: {code})"),
        None => text.to_string(),
    })
}

/// Deserialize the entity list under `key`; an absent key means an empty
/// result (CloudStack omits the list when `count` is zero).
fn parse_list<T: DeserializeOwned>(
    command: &str,
    envelope: &Value,
    key: &str,
) -> Result<Vec<T>, CloudError> {
    match envelope.get(key) {
        None => Ok(Vec::new()),
        Some(list) => {
            serde_json::from_value(list.clone()).map_err(|error| CloudError::InvalidResponse {
                command: command.to_string(),
                reason: error.to_string(),
            })
        }
    }
}

/// Deserialize the single entity under `key`.
fn parse_entity<T: DeserializeOwned>(
    command: &str,
    envelope: &Value,
    key: &str,
) -> Result<T, CloudError> {
    let entity = envelope
        .get(key)
        .ok_or_else(|| CloudError::InvalidResponse {
            command: command.to_string(),
            reason: format!("missing {key} entity"),
        })?;
    serde_json::from_value(entity.clone()).map_err(|error| CloudError::InvalidResponse {
        command: command.to_string(),
        reason: error.to_string(),
    })
}

/// Remap a delete error carrying CSExceptionErrorCode 4350 to NotFound.
fn delete_idempotent(error: CloudError) -> CloudError {
    match &error {
        CloudError::Api { text, .. } if text.contains(INVALID_PARAMETER_CODE) => {
            CloudError::NotFound
        }
        _ => error,
    }
}

#[derive(Debug, Deserialize)]
struct ApiVolume {
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    size: i64,
    #[serde(default)]
    diskofferingid: String,
    #[serde(default)]
    domainid: String,
    #[serde(default)]
    projectid: String,
    #[serde(default)]
    zoneid: String,
    #[serde(default)]
    virtualmachineid: String,
    #[serde(default)]
    deviceid: Option<i64>,
    #[serde(default)]
    state: String,
}

impl From<ApiVolume> for Volume {
    fn from(volume: ApiVolume) -> Self {
        // The detachment invariant: no VM, no device ordinal.
        let device_id = match volume.deviceid {
            Some(device_id) if !volume.virtualmachineid.is_empty() => device_id.to_string(),
            _ => String::new(),
        };
        Volume {
            id: volume.id,
            name: volume.name,
            size: volume.size,
            disk_offering_id: volume.diskofferingid,
            domain_id: volume.domainid,
            project_id: volume.projectid,
            zone_id: volume.zoneid,
            virtual_machine_id: volume.virtualmachineid,
            device_id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiSnapshot {
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    virtualsize: i64,
    #[serde(default)]
    domainid: String,
    #[serde(default)]
    projectid: String,
    #[serde(default)]
    zoneid: String,
    #[serde(default)]
    volumeid: String,
    #[serde(default)]
    created: String,
}

impl From<ApiSnapshot> for Snapshot {
    fn from(snapshot: ApiSnapshot) -> Self {
        Snapshot {
            id: snapshot.id,
            name: snapshot.name,
            size: snapshot.virtualsize,
            domain_id: snapshot.domainid,
            project_id: snapshot.projectid,
            zone_id: snapshot.zoneid,
            volume_id: snapshot.volumeid,
            created_at: snapshot.created,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiVirtualMachine {
    #[serde(default)]
    id: String,
    #[serde(default)]
    zoneid: String,
}

#[derive(Debug, Deserialize)]
struct ApiZone {
    #[serde(default)]
    id: String,
}

#[tonic::async_trait]
impl CloudConnector for CloudStackApiClient {
    async fn get_node_info(&self, vm_name: &str) -> Result<VM, CloudError> {
        // The metadata service knows the VM ID directly; the name search is
        // the fallback for setups without a reachable virtual router.
        if let Some(id) = self.metadata_instance_id().await {
            debug!(vm.id = %id, "node VM found via instance metadata");
            return self.get_vm_by_id(&id).await;
        }
        debug!(vm.name = vm_name, "node VM lookup by name");
        self.get_vm_by_name(vm_name).await
    }

    async fn get_vm_by_id(&self, vm_id: &str) -> Result<VM, CloudError> {
        self.list_vm(vec![("id".to_string(), vm_id.to_string())])
            .await
    }

    async fn list_zones_id(&self) -> Result<Vec<String>, CloudError> {
        let envelope = self
            .api_request(
                "listZones",
                vec![("available".to_string(), "true".to_string())],
            )
            .await?;
        let zones: Vec<ApiZone> = parse_list("listZones", &envelope, "zone")?;
        Ok(zones.into_iter().map(|zone| zone.id).collect())
    }

    async fn get_volume_by_id(&self, volume_id: &str) -> Result<Volume, CloudError> {
        if volume_id.is_empty() {
            return Err(CloudError::InvalidArgument {
                reason: "invalid volume ID: empty string".to_string(),
            });
        }
        self.list_volume(vec![("id".to_string(), volume_id.to_string())])
            .await
            .map(Volume::from)
    }

    async fn get_volume_by_name(&self, name: &str) -> Result<Volume, CloudError> {
        if name.is_empty() {
            return Err(CloudError::InvalidArgument {
                reason: "invalid volume name: empty string".to_string(),
            });
        }
        self.list_volume(vec![("name".to_string(), name.to_string())])
            .await
            .map(Volume::from)
    }

    async fn create_volume(
        &self,
        disk_offering_id: &str,
        zone_id: &str,
        name: &str,
        size_gib: i64,
    ) -> Result<String, CloudError> {
        let result = self
            .async_request(
                "createVolume",
                vec![
                    ("diskofferingid".to_string(), disk_offering_id.to_string()),
                    ("zoneid".to_string(), zone_id.to_string()),
                    ("name".to_string(), name.to_string()),
                    ("size".to_string(), size_gib.to_string()),
                ],
            )
            .await?;
        let volume: ApiVolume = parse_entity("createVolume", &result, "volume")?;
        Ok(volume.id)
    }

    async fn delete_volume(&self, id: &str) -> Result<(), CloudError> {
        self.async_request("deleteVolume", vec![("id".to_string(), id.to_string())])
            .await
            .map_err(delete_idempotent)?;
        Ok(())
    }

    async fn attach_volume(&self, volume_id: &str, vm_id: &str) -> Result<String, CloudError> {
        let result = self
            .async_request(
                "attachVolume",
                vec![
                    ("id".to_string(), volume_id.to_string()),
                    ("virtualmachineid".to_string(), vm_id.to_string()),
                ],
            )
            .await?;
        let volume: ApiVolume = parse_entity("attachVolume", &result, "volume")?;
        match volume.deviceid {
            Some(device_id) => Ok(device_id.to_string()),
            None => Err(CloudError::InvalidResponse {
                command: "attachVolume".to_string(),
                reason: "attached volume reports no device ID".to_string(),
            }),
        }
    }

    async fn detach_volume(&self, volume_id: &str) -> Result<(), CloudError> {
        self.async_request(
            "detachVolume",
            vec![("id".to_string(), volume_id.to_string())],
        )
        .await?;
        Ok(())
    }

    async fn expand_volume(&self, volume_id: &str, new_size_gib: i64) -> Result<(), CloudError> {
        let volume = self
            .list_volume(vec![("id".to_string(), volume_id.to_string())])
            .await?;
        if !RESIZABLE_STATES.contains(&volume.state.as_str()) {
            return Err(CloudError::NotResizable {
                id: volume_id.to_string(),
                state: volume.state,
            });
        }
        self.async_request(
            "resizeVolume",
            vec![
                ("id".to_string(), volume_id.to_string()),
                ("size".to_string(), new_size_gib.to_string()),
            ],
        )
        .await?;
        Ok(())
    }

    async fn create_volume_from_snapshot(
        &self,
        zone_id: &str,
        name: &str,
        project_id: &str,
        snapshot_id: &str,
        size_gib: i64,
    ) -> Result<Volume, CloudError> {
        let mut params = vec![
            ("zoneid".to_string(), zone_id.to_string()),
            ("name".to_string(), name.to_string()),
            ("size".to_string(), size_gib.to_string()),
            ("snapshotid".to_string(), snapshot_id.to_string()),
        ];
        if !project_id.is_empty() {
            params.push(("projectid".to_string(), project_id.to_string()));
        }
        let result = self.async_request("createVolume", params).await?;
        let volume: ApiVolume = parse_entity("createVolume", &result, "volume")?;
        Ok(volume.into())
    }

    async fn get_snapshot_by_id(&self, snapshot_id: &str) -> Result<Snapshot, CloudError> {
        let snapshots = self.list_snapshots("", snapshot_id).await?;
        exactly_one(snapshots)
    }

    async fn get_snapshot_by_name(&self, name: &str) -> Result<Snapshot, CloudError> {
        let envelope = self
            .api_request(
                "listSnapshots",
                self.scoped(vec![("name".to_string(), name.to_string())]),
            )
            .await?;
        let snapshots: Vec<ApiSnapshot> = parse_list("listSnapshots", &envelope, "snapshot")?;
        exactly_one(snapshots.into_iter().map(Snapshot::from).collect())
    }

    async fn create_snapshot(&self, volume_id: &str, name: &str) -> Result<Snapshot, CloudError> {
        // CloudStack does not enforce snapshot name uniqueness; do it here
        // so reusing a name against a different source volume collides.
        match self.get_snapshot_by_name(name).await {
            Ok(existing) if existing.volume_id == volume_id => return Ok(existing),
            Ok(_) => return Err(CloudError::AlreadyExists),
            Err(CloudError::NotFound) => {}
            Err(error) => return Err(error),
        }
        let result = self
            .async_request(
                "createSnapshot",
                vec![
                    ("volumeid".to_string(), volume_id.to_string()),
                    ("name".to_string(), name.to_string()),
                ],
            )
            .await?;
        let snapshot: ApiSnapshot = parse_entity("createSnapshot", &result, "snapshot")?;
        Ok(snapshot.into())
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<(), CloudError> {
        self.async_request(
            "deleteSnapshot",
            vec![("id".to_string(), snapshot_id.to_string())],
        )
        .await
        .map_err(delete_idempotent)?;
        Ok(())
    }

    async fn list_snapshots(
        &self,
        volume_id: &str,
        snapshot_id: &str,
    ) -> Result<Vec<Snapshot>, CloudError> {
        let mut params = Vec::new();
        if !snapshot_id.is_empty() {
            params.push(("id".to_string(), snapshot_id.to_string()));
        }
        if !volume_id.is_empty() {
            params.push(("volumeid".to_string(), volume_id.to_string()));
        }
        let envelope = self
            .api_request("listSnapshots", self.scoped(params))
            .await?;
        let snapshots: Vec<ApiSnapshot> = parse_list("listSnapshots", &envelope, "snapshot")?;
        Ok(snapshots.into_iter().map(Snapshot::from).collect())
    }
}

fn exactly_one(mut snapshots: Vec<Snapshot>) -> Result<Snapshot, CloudError> {
    match snapshots.len() {
        0 => Err(CloudError::NotFound),
        1 => Ok(snapshots.remove(0)),
        _ => Err(CloudError::TooManyResults),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client() -> CloudStackApiClient {
        let config = CloudConfig {
            api_url: "https://cloud.example.com/client/api".to_string(),
            api_key: "KEY".to_string(),
            secret_key: "SECRET".to_string(),
            verify_ssl: true,
            project_id: String::new(),
        };
        CloudStackApiClient::new(&config, Duration::from_secs(30)).unwrap()
    }

    #[test]
    fn query_is_sorted_and_signed() {
        let query = client()
            .build_query(
                "listVolumes",
                &[("name".to_string(), "vol a".to_string())],
            )
            .unwrap();
        let without_signature = query.split("&signature=").next().unwrap();
        assert_eq!(
            without_signature,
            "apiKey=KEY&command=listVolumes&name=vol%20a&response=json"
        );
        assert!(query.contains("&signature="));
        // The same input must sign identically.
        assert_eq!(
            query,
            client()
                .build_query("listVolumes", &[("name".to_string(), "vol a".to_string())])
                .unwrap()
        );
    }

    #[test]
    fn envelope_unwrapping() {
        let body = json!({"listvolumesresponse": {"count": 1, "volume": []}});
        let inner = unwrap_envelope("listVolumes", body).unwrap();
        assert_eq!(inner.get("count").and_then(Value::as_i64), Some(1));

        let error = json!({"errorresponse": {"errortext": "oops"}});
        let inner = unwrap_envelope("listVolumes", error).unwrap();
        assert_eq!(error_text(&inner).unwrap(), "oops");
    }

    #[test]
    fn error_text_carries_cs_error_code() {
        let envelope = json!({
            "errorcode": 431,
            "cserrorcode": 4350,
            "errortext": "no volume with that id",
        });
        let text = error_text(&envelope).unwrap();
        assert!(text.contains("4350"));
        let remapped = delete_idempotent(CloudError::Api {
            command: "deleteVolume".to_string(),
            text,
        });
        assert!(matches!(remapped, CloudError::NotFound));
    }

    #[test]
    fn detached_volume_has_no_device_id() {
        let detached: ApiVolume = serde_json::from_value(json!({
            "id": "v1", "name": "vol", "size": 1, "deviceid": 0
        }))
        .unwrap();
        assert_eq!(Volume::from(detached).device_id, "");

        let attached: ApiVolume = serde_json::from_value(json!({
            "id": "v1", "name": "vol", "size": 1,
            "virtualmachineid": "vm1", "deviceid": 4
        }))
        .unwrap();
        let volume = Volume::from(attached);
        assert_eq!(volume.device_id, "4");
        assert_eq!(volume.virtual_machine_id, "vm1");
    }

    #[test]
    fn empty_list_when_key_absent() {
        let envelope = json!({"count": 0});
        let volumes: Vec<ApiVolume> = parse_list("listVolumes", &envelope, "volume").unwrap();
        assert!(volumes.is_empty());
    }
}
