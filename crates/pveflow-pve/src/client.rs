//! Proxmox VE REST client
//!
//! Implements [`HypervisorApi`] over `/api2/json`. Mutating endpoints that
//! answer with a task id (`UPID:...`) are awaited until the task stops; the
//! caller bounds every call with its own deadline.

use crate::error::{PveError, Result};
use async_trait::async_trait;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use pveflow_core::{InstanceIdentity, InstanceKind};
use pveflow_reconcile::{
    CloneRequest, CreateRequest, HypervisorApi, InstanceStatus, MigrateRequest, MoveDiskRequest,
    ObservedConfig, ResizeDiskRequest, RetryConfig, ShutdownRequest, UpdateRequest,
};
use reqwest::Method;
use reqwest::header::AUTHORIZATION;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Characters left unescaped in `sshkeys`, as `encodeURIComponent` does.
const SSH_KEYS: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Path segments (node names, task ids).
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.');

/// Connection settings for [`PveClient`]
#[derive(Debug, Clone)]
pub struct PveConfig {
    /// Base URL, e.g. `https://pve1.example.com:8006`
    pub endpoint: String,
    /// `USER@REALM!TOKENID=SECRET`
    pub api_token: String,
    /// Skip TLS certificate verification
    pub insecure: bool,
    pub retry: RetryConfig,
    pub task_poll_interval: Duration,
}

impl PveConfig {
    pub fn new(endpoint: impl Into<String>, api_token: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_token: api_token.into(),
            insecure: false,
            retry: RetryConfig::default(),
            task_poll_interval: Duration::from_secs(1),
        }
    }

    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct TaskStatus {
    status: String,
    #[serde(default)]
    exitstatus: Option<String>,
}

/// Proxmox VE API client
pub struct PveClient {
    http: reqwest::Client,
    base_url: String,
    auth_header: String,
    retry: RetryConfig,
    task_poll_interval: Duration,
}

impl PveClient {
    pub fn new(config: PveConfig) -> Result<Self> {
        let endpoint = config.endpoint.trim().trim_end_matches('/');
        if !(endpoint.starts_with("https://") || endpoint.starts_with("http://")) {
            return Err(PveError::InvalidConfig(format!(
                "endpoint must be an http(s) URL: {:?}",
                config.endpoint
            )));
        }
        if !config.api_token.contains('!') || !config.api_token.contains('=') {
            return Err(PveError::InvalidConfig(
                "api token must look like USER@REALM!TOKENID=SECRET".to_string(),
            ));
        }

        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.insecure)
            .build()?;

        Ok(Self {
            http,
            base_url: format!("{}/api2/json", endpoint),
            auth_header: format!("PVEAPIToken={}", config.api_token),
            retry: config.retry,
            task_poll_interval: config.task_poll_interval,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        form: Option<&[(String, String)]>,
    ) -> Result<serde_json::Value> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%method, path, "Proxmox API request");

        let mut builder = self
            .http
            .request(method, &url)
            .header(AUTHORIZATION, &self.auth_header);
        if let Some(form) = form {
            builder = builder.form(form);
        }

        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(PveError::from_status(status.as_u16(), &body));
        }
        let envelope: Envelope = serde_json::from_str(&body)?;
        Ok(envelope.data)
    }

    /// GET with retries on transient failures.
    async fn get(&self, path: &str) -> Result<serde_json::Value> {
        let mut attempt = 1;
        loop {
            match self.request(Method::GET, path, None).await {
                Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(path, attempt, error = %e, ?delay, "Retrying read");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Issues a mutation and waits for the task it starts, if any.
    async fn mutate(
        &self,
        method: Method,
        node: &str,
        path: &str,
        form: &[(String, String)],
    ) -> Result<()> {
        let data = self.request(method, path, Some(form)).await?;
        match data.as_str().filter(|s| s.starts_with("UPID:")) {
            Some(upid) => self.wait_for_task(node, upid).await,
            None => Ok(()),
        }
    }

    /// Polls a task until it stops. A 400 right after submission means the
    /// task is not visible yet and is retried.
    pub async fn wait_for_task(&self, node: &str, upid: &str) -> Result<()> {
        let path = format!(
            "/nodes/{}/tasks/{}/status",
            segment(node),
            segment(upid)
        );
        loop {
            match self.request(Method::GET, &path, None).await {
                Ok(data) => {
                    let status: TaskStatus = serde_json::from_value(data)?;
                    if status.status != "running" {
                        return task_result(upid, status.exitstatus.as_deref());
                    }
                    debug!(upid, "Task still running");
                }
                Err(PveError::Status { status: 400, .. }) => {
                    debug!(upid, "Task not visible yet");
                }
                Err(e) if e.is_transient() => {
                    debug!(upid, error = %e, "Task status poll failed");
                }
                Err(e) => return Err(e),
            }
            tokio::time::sleep(self.task_poll_interval).await;
        }
    }

    /// Next free instance id from the cluster.
    pub async fn next_id(&self) -> Result<u32> {
        let data = self.get("/cluster/nextid").await?;
        let id = match &data {
            serde_json::Value::String(s) => s.parse().ok(),
            serde_json::Value::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
            _ => None,
        };
        id.ok_or_else(|| PveError::InvalidResponse(format!("nextid returned {}", data)))
    }
}

fn segment(value: &str) -> String {
    utf8_percent_encode(value, SEGMENT).to_string()
}

fn collection_path(node: &str, kind: InstanceKind) -> String {
    format!("/nodes/{}/{}", segment(node), kind.api_collection())
}

fn instance_path(id: &InstanceIdentity, tail: &str) -> String {
    format!("{}/{}/{}", collection_path(&id.node, id.kind), id.vm_id, tail)
}

fn task_result(upid: &str, exit_status: Option<&str>) -> Result<()> {
    match exit_status {
        Some("OK") => Ok(()),
        Some(status) if status.starts_with("WARNINGS: ") => {
            warn!(upid, status, "Task finished with warnings");
            Ok(())
        }
        other => Err(PveError::TaskFailed {
            upid: upid.to_string(),
            exit_status: other.unwrap_or("unknown").to_string(),
        }),
    }
}

fn pair(key: &str, value: impl ToString) -> (String, String) {
    (key.to_string(), value.to_string())
}

fn flag(value: bool) -> &'static str {
    if value { "1" } else { "0" }
}

/// Remote-form parameters; `sshkeys` is percent-encoded as the API requires.
fn encode_params(params: &BTreeMap<String, String>) -> Vec<(String, String)> {
    params
        .iter()
        .map(|(key, value)| {
            if key == "sshkeys" {
                (key.clone(), utf8_percent_encode(value, SSH_KEYS).to_string())
            } else {
                (key.clone(), value.clone())
            }
        })
        .collect()
}

fn update_form(request: &UpdateRequest) -> Vec<(String, String)> {
    let mut form = encode_params(&request.set);
    if !request.delete.is_empty() {
        form.push(pair("delete", request.delete.join(",")));
    }
    form
}

fn clone_form(kind: InstanceKind, vm_id: u32, request: &CloneRequest) -> Vec<(String, String)> {
    let name_key = match kind {
        InstanceKind::Vm => "name",
        InstanceKind::Container => "hostname",
    };
    let mut form = vec![pair("newid", vm_id), pair("full", flag(request.full))];
    if let Some(name) = &request.name {
        form.push(pair(name_key, name));
    }
    if let Some(description) = &request.description {
        form.push(pair("description", description));
    }
    if let Some(pool) = &request.pool_id {
        form.push(pair("pool", pool));
    }
    if let Some(datastore) = &request.target_datastore {
        form.push(pair("storage", datastore));
    }
    form
}

fn migrate_form(kind: InstanceKind, request: &MigrateRequest) -> Vec<(String, String)> {
    let mut form = vec![pair("target", &request.target_node)];
    match kind {
        InstanceKind::Vm => {
            form.push(pair("online", flag(request.online)));
            form.push(pair("with-local-disks", flag(request.with_local_disks)));
        }
        // Containers cannot live-migrate; a running one is restarted.
        InstanceKind::Container => {
            if request.online {
                form.push(pair("restart", "1"));
            }
        }
    }
    form
}

/// Config map with `sshkeys` decoded back into plain text.
fn decode_config(data: serde_json::Value) -> Result<ObservedConfig> {
    let mut map: BTreeMap<String, serde_json::Value> = serde_json::from_value(data)?;
    if let Some(serde_json::Value::String(keys)) = map.get("sshkeys") {
        let decoded = percent_decode_str(keys).decode_utf8_lossy().into_owned();
        map.insert("sshkeys".to_string(), serde_json::Value::String(decoded));
    }
    Ok(map.into())
}

fn timeout_secs(timeout: Duration) -> u64 {
    timeout.as_secs().max(1)
}

#[async_trait]
impl HypervisorApi for PveClient {
    async fn create_instance(
        &self,
        node: &str,
        request: &CreateRequest,
    ) -> pveflow_reconcile::Result<u32> {
        let vm_id = match request.vm_id {
            Some(id) => id,
            None => self.next_id().await?,
        };
        let mut form = vec![pair("vmid", vm_id)];
        form.extend(encode_params(&request.params));

        info!(node, vm_id, kind = %request.kind, "Creating instance");
        self.mutate(
            Method::POST,
            node,
            &collection_path(node, request.kind),
            &form,
        )
        .await?;
        Ok(vm_id)
    }

    async fn clone_instance(
        &self,
        source: &InstanceIdentity,
        request: &CloneRequest,
        retries: u32,
    ) -> pveflow_reconcile::Result<u32> {
        let vm_id = match request.new_id {
            Some(id) => id,
            None => self.next_id().await?,
        };
        let form = clone_form(source.kind, vm_id, request);
        let path = instance_path(source, "clone");
        let attempts = retries.max(1);

        info!(source = %source, vm_id, "Cloning instance");
        let mut attempt = 1;
        loop {
            match self.mutate(Method::POST, &source.node, &path, &form).await {
                Ok(()) => return Ok(vm_id),
                Err(e @ (PveError::NotFound(_) | PveError::InvalidConfig(_))) => {
                    return Err(e.into());
                }
                Err(e) if attempt < attempts => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(source = %source, attempt, error = %e, ?delay, "Retrying clone");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn get_instance(&self, id: &InstanceIdentity) -> pveflow_reconcile::Result<ObservedConfig> {
        let data = self.get(&instance_path(id, "config")).await?;
        Ok(decode_config(data)?)
    }

    async fn get_instance_status(
        &self,
        id: &InstanceIdentity,
    ) -> pveflow_reconcile::Result<InstanceStatus> {
        let data = self.get(&instance_path(id, "status/current")).await?;
        let status: InstanceStatus = serde_json::from_value(data).map_err(PveError::from)?;
        Ok(status)
    }

    async fn update_instance(
        &self,
        id: &InstanceIdentity,
        request: &UpdateRequest,
    ) -> pveflow_reconcile::Result<()> {
        if request.is_empty() {
            return Ok(());
        }
        self.mutate(
            Method::PUT,
            &id.node,
            &instance_path(id, "config"),
            &update_form(request),
        )
        .await?;
        Ok(())
    }

    async fn move_disk(
        &self,
        id: &InstanceIdentity,
        request: &MoveDiskRequest,
    ) -> pveflow_reconcile::Result<()> {
        let (tail, disk_key) = match id.kind {
            InstanceKind::Vm => ("move_disk", "disk"),
            InstanceKind::Container => ("move_volume", "volume"),
        };
        let form = vec![
            pair(disk_key, &request.interface),
            pair("storage", &request.target_datastore),
            pair("delete", flag(request.delete_original)),
        ];
        self.mutate(Method::POST, &id.node, &instance_path(id, tail), &form)
            .await?;
        Ok(())
    }

    async fn resize_disk(
        &self,
        id: &InstanceIdentity,
        request: &ResizeDiskRequest,
    ) -> pveflow_reconcile::Result<()> {
        let form = vec![
            pair("disk", &request.interface),
            pair("size", format!("{}G", request.size_gib)),
        ];
        self.mutate(Method::PUT, &id.node, &instance_path(id, "resize"), &form)
            .await?;
        Ok(())
    }

    async fn migrate_instance(
        &self,
        id: &InstanceIdentity,
        request: &MigrateRequest,
    ) -> pveflow_reconcile::Result<()> {
        let form = migrate_form(id.kind, request);
        self.mutate(Method::POST, &id.node, &instance_path(id, "migrate"), &form)
            .await?;
        Ok(())
    }

    async fn start_instance(
        &self,
        id: &InstanceIdentity,
        timeout: Duration,
    ) -> pveflow_reconcile::Result<()> {
        let mut form = Vec::new();
        if id.kind == InstanceKind::Vm {
            form.push(pair("timeout", timeout_secs(timeout)));
        }
        self.mutate(Method::POST, &id.node, &instance_path(id, "status/start"), &form)
            .await?;
        Ok(())
    }

    async fn shutdown_instance(
        &self,
        id: &InstanceIdentity,
        request: &ShutdownRequest,
    ) -> pveflow_reconcile::Result<()> {
        let form = vec![
            pair("forceStop", flag(request.force_stop)),
            pair("timeout", timeout_secs(request.timeout)),
        ];
        self.mutate(
            Method::POST,
            &id.node,
            &instance_path(id, "status/shutdown"),
            &form,
        )
        .await?;
        Ok(())
    }

    async fn stop_instance(
        &self,
        id: &InstanceIdentity,
        timeout: Duration,
    ) -> pveflow_reconcile::Result<()> {
        let mut form = Vec::new();
        if id.kind == InstanceKind::Vm {
            form.push(pair("timeout", timeout_secs(timeout)));
        }
        self.mutate(Method::POST, &id.node, &instance_path(id, "status/stop"), &form)
            .await?;
        Ok(())
    }

    async fn reboot_instance(
        &self,
        id: &InstanceIdentity,
        timeout: Duration,
    ) -> pveflow_reconcile::Result<()> {
        let form = vec![pair("timeout", timeout_secs(timeout))];
        self.mutate(
            Method::POST,
            &id.node,
            &instance_path(id, "status/reboot"),
            &form,
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN: &str = "root@pam!pveflow=00000000-0000-0000-0000-000000000000";

    #[test]
    fn test_client_base_url_and_auth() {
        let client = PveClient::new(PveConfig::new("https://pve1:8006/", TOKEN)).unwrap();
        assert_eq!(client.base_url(), "https://pve1:8006/api2/json");
        assert_eq!(client.auth_header, format!("PVEAPIToken={}", TOKEN));
    }

    #[test]
    fn test_client_rejects_bad_config() {
        assert!(matches!(
            PveClient::new(PveConfig::new("pve1:8006", TOKEN)),
            Err(PveError::InvalidConfig(_))
        ));
        assert!(matches!(
            PveClient::new(PveConfig::new("https://pve1:8006", "secret")),
            Err(PveError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_instance_paths() {
        let vm = InstanceIdentity::new("pve1", 100);
        assert_eq!(instance_path(&vm, "config"), "/nodes/pve1/qemu/100/config");

        let ct = InstanceIdentity::new("pve2", 200).with_kind(InstanceKind::Container);
        assert_eq!(
            instance_path(&ct, "status/start"),
            "/nodes/pve2/lxc/200/status/start"
        );
        assert_eq!(
            segment("UPID:pve1:000A:01:ABC:qmstart:100:root@pam:"),
            "UPID%3Apve1%3A000A%3A01%3AABC%3Aqmstart%3A100%3Aroot%40pam%3A"
        );
    }

    #[test]
    fn test_update_form_encodes_keys_and_joins_deletes() {
        let mut request = UpdateRequest::default();
        request.set.insert("cores".into(), "4".into());
        request
            .set
            .insert("sshkeys".into(), "ssh-ed25519 AAAA ops@host".into());
        request.delete = vec!["name".into(), "startup".into()];

        let form = update_form(&request);
        assert_eq!(
            form,
            vec![
                pair("cores", "4"),
                pair("sshkeys", "ssh-ed25519%20AAAA%20ops%40host"),
                pair("delete", "name,startup"),
            ]
        );
    }

    #[test]
    fn test_decode_config_restores_ssh_keys() {
        let data = serde_json::json!({
            "cores": 2,
            "sshkeys": "ssh-ed25519%20AAAA%20a%0Assh-rsa%20BBBB%20b",
        });
        let config = decode_config(data).unwrap();
        assert_eq!(config.get_u32("cores"), Some(2));
        assert_eq!(
            config.get_str("sshkeys").as_deref(),
            Some("ssh-ed25519 AAAA a\nssh-rsa BBBB b")
        );
    }

    #[test]
    fn test_clone_form() {
        let request = CloneRequest {
            new_id: None,
            name: Some("web".into()),
            description: None,
            pool_id: Some("prod".into()),
            target_datastore: Some("fast".into()),
            full: true,
        };
        let form = clone_form(InstanceKind::Vm, 130, &request);
        assert_eq!(
            form,
            vec![
                pair("newid", 130),
                pair("full", "1"),
                pair("name", "web"),
                pair("pool", "prod"),
                pair("storage", "fast"),
            ]
        );
        let ct = clone_form(InstanceKind::Container, 131, &request);
        assert!(ct.contains(&pair("hostname", "web")));
    }

    #[test]
    fn test_migrate_form_by_kind() {
        let request = MigrateRequest {
            target_node: "pve2".into(),
            with_local_disks: true,
            online: true,
        };
        assert_eq!(
            migrate_form(InstanceKind::Vm, &request),
            vec![
                pair("target", "pve2"),
                pair("online", "1"),
                pair("with-local-disks", "1"),
            ]
        );
        assert_eq!(
            migrate_form(InstanceKind::Container, &request),
            vec![pair("target", "pve2"), pair("restart", "1")]
        );
    }

    #[test]
    fn test_task_result() {
        assert!(task_result("UPID:a", Some("OK")).is_ok());
        assert!(task_result("UPID:a", Some("WARNINGS: 2")).is_ok());
        match task_result("UPID:a", Some("command 'qm start' failed")) {
            Err(PveError::TaskFailed { exit_status, .. }) => {
                assert_eq!(exit_status, "command 'qm start' failed");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(task_result("UPID:a", None).is_err());
    }
}
