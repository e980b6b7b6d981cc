use crate::errors::Result;
use crate::metrics::SINK_FAILURES_TOTAL;
use crate::model::{AppliedValue, CapabilityValue};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error};

/// Externally visible state of one device.
#[async_trait]
pub trait CapabilityStateSink: Send + Sync {
    async fn set_capability_value(&self, name: &str, value: CapabilityValue) -> Result<()>;
    async fn set_available(&self) -> Result<()>;
    async fn set_unavailable(&self, reason: &str) -> Result<()>;
    async fn set_warning(&self, message: &str) -> Result<()>;
    async fn unset_warning(&self) -> Result<()>;
}

/// Fire-and-forget front of a sink: failures are logged and counted, never returned.
#[derive(Clone)]
pub struct SinkWriter {
    device_id: String,
    sink: Arc<dyn CapabilityStateSink>,
}

impl SinkWriter {
    pub fn new(device_id: &str, sink: Arc<dyn CapabilityStateSink>) -> Self {
        Self {
            device_id: device_id.to_string(),
            sink,
        }
    }

    fn report(&self, op: &str, result: Result<()>) {
        if let Err(e) = result {
            SINK_FAILURES_TOTAL.inc();
            error!("[{}] {} failed: {}", self.device_id, op, e);
        }
    }

    pub async fn set_value(&self, name: &str, value: impl Into<CapabilityValue>) {
        let value = value.into();
        debug!("[{}] {} = {:?}", self.device_id, name, value);
        let result = self.sink.set_capability_value(name, value).await;
        self.report(name, result);
    }

    pub async fn set_available(&self) {
        let result = self.sink.set_available().await;
        self.report("setAvailable", result);
    }

    pub async fn set_unavailable(&self, reason: &str) {
        let result = self.sink.set_unavailable(reason).await;
        self.report("setUnavailable", result);
    }

    pub async fn set_warning(&self, message: &str) {
        let result = self.sink.set_warning(message).await;
        self.report("setWarning", result);
    }

    pub async fn unset_warning(&self) {
        let result = self.sink.unset_warning().await;
        self.report("unsetWarning", result);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    pub device_id: String,
    pub available: bool,
    pub unavailable_reason: Option<String>,
    pub warning: Option<String>,
    pub capabilities: BTreeMap<String, AppliedValue>,
}

impl DeviceSnapshot {
    fn new(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            available: true,
            unavailable_reason: None,
            warning: None,
            capabilities: BTreeMap::new(),
        }
    }

    pub fn value(&self, name: &str) -> Option<&CapabilityValue> {
        self.capabilities.get(name).map(|v| &v.value)
    }
}

/// Shared in-memory state of every device, served by the HTTP surface.
#[derive(Clone, Default)]
pub struct MemoryStore {
    devices: Arc<RwLock<HashMap<String, DeviceSnapshot>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sink_for(&self, device_id: &str) -> Arc<dyn CapabilityStateSink> {
        Arc::new(MemorySink {
            device_id: device_id.to_string(),
            store: self.clone(),
        })
    }

    pub async fn snapshot(&self, device_id: &str) -> Option<DeviceSnapshot> {
        self.devices.read().await.get(device_id).cloned()
    }

    pub async fn snapshots(&self) -> Vec<DeviceSnapshot> {
        let mut all: Vec<DeviceSnapshot> = self.devices.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        all
    }

    async fn update(&self, device_id: &str, f: impl FnOnce(&mut DeviceSnapshot)) {
        let mut devices = self.devices.write().await;
        let snapshot = devices
            .entry(device_id.to_string())
            .or_insert_with(|| DeviceSnapshot::new(device_id));
        f(snapshot);
    }
}

/// Last-write-wins sink over a [`MemoryStore`].
struct MemorySink {
    device_id: String,
    store: MemoryStore,
}

#[async_trait]
impl CapabilityStateSink for MemorySink {
    async fn set_capability_value(&self, name: &str, value: CapabilityValue) -> Result<()> {
        self.store
            .update(&self.device_id, |s| {
                s.capabilities.insert(
                    name.to_string(),
                    AppliedValue {
                        value,
                        applied_at: Utc::now(),
                    },
                );
            })
            .await;
        Ok(())
    }

    async fn set_available(&self) -> Result<()> {
        self.store
            .update(&self.device_id, |s| {
                s.available = true;
                s.unavailable_reason = None;
            })
            .await;
        Ok(())
    }

    async fn set_unavailable(&self, reason: &str) -> Result<()> {
        self.store
            .update(&self.device_id, |s| {
                s.available = false;
                s.unavailable_reason = Some(reason.to_string());
            })
            .await;
        Ok(())
    }

    async fn set_warning(&self, message: &str) -> Result<()> {
        self.store
            .update(&self.device_id, |s| s.warning = Some(message.to_string()))
            .await;
        Ok(())
    }

    async fn unset_warning(&self) -> Result<()> {
        self.store
            .update(&self.device_id, |s| s.warning = None)
            .await;
        Ok(())
    }
}
