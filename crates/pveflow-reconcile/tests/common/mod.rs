use async_trait::async_trait;
use pveflow_core::model::InstanceIdentity;
use pveflow_core::wire::PropertyString;
use pveflow_core::{Normalizer, RawInstance};
use pveflow_reconcile::{
    CloneRequest, CreateRequest, HypervisorApi, InstanceStatus,
    MigrateRequest, MoveDiskRequest, ObservedConfig, ReconcileError, ResizeDiskRequest, Result,
    RunState, ShutdownRequest, UpdateRequest,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::time::Duration;

pub fn desired(yaml: &str) -> pveflow_core::DesiredInstance {
    let raw: RawInstance = serde_yaml::from_str(yaml).unwrap();
    Normalizer::default().normalize(&raw).unwrap()
}

#[derive(Debug, Clone)]
pub struct FakeInstance {
    pub node: String,
    pub config: BTreeMap<String, String>,
    pub running: bool,
    pub lock: Option<String>,
}

#[derive(Default)]
pub struct FakeState {
    pub instances: BTreeMap<u32, FakeInstance>,
    /// Names of mutating calls in issue order
    pub calls: Vec<String>,
    pub updates: Vec<UpdateRequest>,
    pub shutdowns: Vec<ShutdownRequest>,
    failures: BTreeMap<String, ReconcileError>,
    hangs: BTreeSet<String>,
    next_id: u32,
}

/// In-memory hypervisor that allocates volumes the way the real one names them.
pub struct FakeApi {
    state: Mutex<FakeState>,
}

impl FakeApi {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                next_id: 200,
                ..Default::default()
            }),
        }
    }

    pub fn with_instance(self, node: &str, vm_id: u32, running: bool, config: &[(&str, &str)]) -> Self {
        let config = config
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.state.lock().unwrap().instances.insert(
            vm_id,
            FakeInstance {
                node: node.to_string(),
                config,
                running,
                lock: None,
            },
        );
        self
    }

    /// Fails the next call named `call` with `error`.
    pub fn fail_on(&self, call: &str, error: ReconcileError) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert(call.to_string(), error);
    }

    /// Makes every call named `call` hang forever.
    pub fn hang_on(&self, call: &str) {
        self.state.lock().unwrap().hangs.insert(call.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn updates(&self) -> Vec<UpdateRequest> {
        self.state.lock().unwrap().updates.clone()
    }

    pub fn shutdowns(&self) -> Vec<ShutdownRequest> {
        self.state.lock().unwrap().shutdowns.clone()
    }

    pub fn instance(&self, vm_id: u32) -> Option<FakeInstance> {
        self.state.lock().unwrap().instances.get(&vm_id).cloned()
    }

    async fn enter(&self, call: &str) -> Result<()> {
        let hang = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(call.to_string());
            if let Some(err) = state.failures.remove(call) {
                return Err(err);
            }
            state.hangs.contains(call)
        };
        if hang {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    fn with_existing<T>(
        &self,
        id: &InstanceIdentity,
        f: impl FnOnce(&mut FakeInstance) -> T,
    ) -> Result<T> {
        let mut state = self.state.lock().unwrap();
        match state.instances.get_mut(&id.vm_id) {
            Some(instance) if instance.node == id.node => Ok(f(instance)),
            _ => Err(ReconcileError::NotFound(id.to_string())),
        }
    }
}

fn is_drive_key(key: &str) -> bool {
    key == "rootfs"
        || ["ide", "sata", "scsi", "virtio", "efidisk", "tpmstate"]
            .iter()
            .any(|bus| key.strip_prefix(bus).is_some_and(|n| n.parse::<u32>().is_ok()))
}

/// Turns `STORE:SIZE` and `STORE:cloudinit` into allocated volumes.
fn allocate(vm_id: u32, config: &BTreeMap<String, String>, key: &str, value: &str) -> String {
    if !is_drive_key(key) {
        return value.to_string();
    }
    let mut props = PropertyString::parse(value);
    let Some(head) = props.head.clone() else {
        return value.to_string();
    };
    let Some((store, rest)) = head.split_once(':') else {
        return value.to_string();
    };
    if rest == "cloudinit" {
        props.head = Some(format!("{}:vm-{}-cloudinit", store, vm_id));
    } else if let Ok(size) = rest.parse::<u64>() {
        let index = config.values().filter(|v| v.contains("-disk-")).count();
        props.head = Some(format!("{}:vm-{}-disk-{}", store, vm_id, index));
        props.push("size", format!("{}G", size));
    }
    props.to_string()
}

#[async_trait]
impl HypervisorApi for FakeApi {
    async fn create_instance(&self, node: &str, request: &CreateRequest) -> Result<u32> {
        self.enter("create").await?;
        let mut state = self.state.lock().unwrap();
        let vm_id = match request.vm_id {
            Some(id) => id,
            None => {
                state.next_id += 1;
                state.next_id
            }
        };
        let mut config = BTreeMap::new();
        for (key, value) in &request.params {
            let value = allocate(vm_id, &config, key, value);
            config.insert(key.clone(), value);
        }
        state.instances.insert(
            vm_id,
            FakeInstance {
                node: node.to_string(),
                config,
                running: false,
                lock: None,
            },
        );
        Ok(vm_id)
    }

    async fn clone_instance(
        &self,
        source: &InstanceIdentity,
        request: &CloneRequest,
        _retries: u32,
    ) -> Result<u32> {
        self.enter("clone").await?;
        let mut source_config = self.with_existing(source, |i| i.config.clone())?;
        let mut state = self.state.lock().unwrap();
        let vm_id = match request.new_id {
            Some(id) => id,
            None => {
                state.next_id += 1;
                state.next_id
            }
        };

        source_config.remove("template");
        let from = format!("vm-{}-", source.vm_id);
        let to = format!("vm-{}-", vm_id);
        let mut config: BTreeMap<String, String> = source_config
            .into_iter()
            .map(|(k, v)| (k, v.replace(&from, &to)))
            .collect();
        if let Some(name) = &request.name {
            config.insert("name".to_string(), name.clone());
        }
        state.instances.insert(
            vm_id,
            FakeInstance {
                node: source.node.clone(),
                config,
                running: false,
                lock: Some("clone".to_string()),
            },
        );
        Ok(vm_id)
    }

    async fn get_instance(&self, id: &InstanceIdentity) -> Result<ObservedConfig> {
        let config = self.with_existing(id, |i| i.config.clone())?;
        Ok(config
            .into_iter()
            .map(|(k, v)| (k, serde_json::Value::String(v)))
            .collect::<BTreeMap<_, _>>()
            .into())
    }

    async fn get_instance_status(&self, id: &InstanceIdentity) -> Result<InstanceStatus> {
        self.with_existing(id, |i| {
            let status = InstanceStatus {
                status: if i.running {
                    RunState::Running
                } else {
                    RunState::Stopped
                },
                lock: i.lock.clone(),
            };
            // Locks clear after the first poll.
            i.lock = None;
            status
        })
    }

    async fn update_instance(&self, id: &InstanceIdentity, request: &UpdateRequest) -> Result<()> {
        self.enter("update").await?;
        self.state.lock().unwrap().updates.push(request.clone());
        self.with_existing(id, |i| {
            for key in &request.delete {
                i.config.remove(key);
            }
            for (key, value) in &request.set {
                let value = allocate(id.vm_id, &i.config, key, value);
                i.config.insert(key.clone(), value);
            }
        })
    }

    async fn move_disk(&self, id: &InstanceIdentity, request: &MoveDiskRequest) -> Result<()> {
        self.enter("move_disk").await?;
        self.with_existing(id, |i| {
            if let Some(value) = i.config.get_mut(&request.interface) {
                let mut props = PropertyString::parse(value);
                if let Some((_, path)) = props.head.clone().as_deref().and_then(|h| h.split_once(':')) {
                    props.head = Some(format!("{}:{}", request.target_datastore, path));
                }
                *value = props.to_string();
            }
        })
    }

    async fn resize_disk(&self, id: &InstanceIdentity, request: &ResizeDiskRequest) -> Result<()> {
        self.enter("resize_disk").await?;
        self.with_existing(id, |i| {
            if let Some(value) = i.config.get_mut(&request.interface) {
                let props = PropertyString::parse(value);
                let mut resized = PropertyString::new();
                resized.head = props.head.clone();
                for (key, val) in props.pairs() {
                    if key == "size" {
                        resized.push("size", format!("{}G", request.size_gib));
                    } else {
                        resized.push(key, val);
                    }
                }
                *value = resized.to_string();
            }
        })
    }

    async fn migrate_instance(&self, id: &InstanceIdentity, request: &MigrateRequest) -> Result<()> {
        self.enter("migrate").await?;
        self.with_existing(id, |i| i.node = request.target_node.clone())
    }

    async fn start_instance(&self, id: &InstanceIdentity, _timeout: Duration) -> Result<()> {
        self.enter("start").await?;
        self.with_existing(id, |i| i.running = true)
    }

    async fn shutdown_instance(&self, id: &InstanceIdentity, request: &ShutdownRequest) -> Result<()> {
        self.enter("shutdown").await?;
        self.state.lock().unwrap().shutdowns.push(request.clone());
        self.with_existing(id, |i| i.running = false)
    }

    async fn stop_instance(&self, id: &InstanceIdentity, _timeout: Duration) -> Result<()> {
        self.enter("stop").await?;
        self.with_existing(id, |i| i.running = false)
    }

    async fn reboot_instance(&self, id: &InstanceIdentity, _timeout: Duration) -> Result<()> {
        self.enter("reboot").await?;
        self.with_existing(id, |i| i.running = true)
    }
}
