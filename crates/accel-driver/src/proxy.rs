//! Remote driver proxy
//!
//! `RemoteDriver` speaks the plugin protocol over a blocking request/response
//! endpoint. All calls for one driver are serialised under one lock, and the
//! per-driver sequence number is incremented after every send (including the
//! sends of the resync handshake) so both sides advance in lockstep.
//!
//! When any call returns NOT_SYNC, the proxy fetches the controller's
//! authoritative slot list, replays it to the driver through `GetCapability`,
//! hands the driver's view of unrecoverable slots back to the controller via
//! `DriverCallback::update_driver`, and retries the original call exactly
//! once. A second failure propagates.

use crate::api::{self, DRIVER_ENDPOINT_TYPE};
use crate::driver::{AcceleratorDriver, Capability, DriverCallback};
use crate::{DriverError, Result};
use accel_core::{DeviceInfo, SlotConfig, SlotInfo};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// A blocking request/response endpoint to one driver plugin
#[async_trait]
pub trait PluginEndpoint: Send + Sync {
    /// Issue one call; `method` is the full wire name
    /// (`AcceleratorDriver.<Method>`), `body` the request envelope.
    async fn call(&self, method: &str, body: Value) -> Result<Value>;
}

/// HTTP implementation of the plugin transport: one JSON POST per call
pub struct HttpPluginEndpoint {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPluginEndpoint {
    /// Create an endpoint for the given plugin base URL
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(base_url, DEFAULT_CALL_TIMEOUT)
    }

    /// Create an endpoint with a per-call deadline
    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DriverError::Transport(format!("failed to build plugin client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl PluginEndpoint for HttpPluginEndpoint {
    async fn call(&self, method: &str, body: Value) -> Result<Value> {
        let url = format!("{}/{}", self.base_url, method);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DriverError::Timeout(format!("{}: {}", url, e))
                } else {
                    DriverError::Transport(format!("{}: {}", url, e))
                }
            })?;
        response
            .json()
            .await
            .map_err(|e| DriverError::Transport(format!("{}: invalid response: {}", url, e)))
    }
}

/// Transport-level client for one driver plugin
pub struct RemoteDriver {
    driver_name: String,
    endpoint: Arc<dyn PluginEndpoint>,
    callback: Weak<dyn DriverCallback>,
    seq_no: Mutex<u64>,
}

impl RemoteDriver {
    /// Create a proxy for the named driver
    pub fn new(
        driver_name: impl Into<String>,
        endpoint: Arc<dyn PluginEndpoint>,
        callback: Weak<dyn DriverCallback>,
    ) -> Self {
        Self {
            driver_name: driver_name.into(),
            endpoint,
            callback,
            seq_no: Mutex::new(0),
        }
    }

    /// Registration handshake: send the controller's slot list, receive the
    /// driver's capability and the slots it could not recover.
    pub async fn get_capability(
        &self,
        slots: Vec<SlotInfo>,
    ) -> Result<(Capability, Vec<SlotInfo>)> {
        let resp: api::GetCapabilityResponse = self
            .call("GetCapability", &api::GetCapabilityRequest { slots })
            .await?;
        Ok((Capability { runtimes: resp.runtimes }, resp.slots))
    }

    fn callback(&self) -> Result<Arc<dyn DriverCallback>> {
        self.callback
            .upgrade()
            .ok_or_else(|| DriverError::Transport("driver callback is gone".to_string()))
    }

    /// One send under the lock. The sequence number advances after every
    /// send, success or failure.
    async fn send<A: Serialize>(&self, seq_no: &mut u64, method: &str, args: &A) -> Result<Value> {
        let envelope = serde_json::to_value(api::Request { seq_no: *seq_no, args })?;
        let result = self
            .endpoint
            .call(&format!("{}.{}", DRIVER_ENDPOINT_TYPE, method), envelope)
            .await;
        *seq_no += 1;
        result
    }

    async fn call<A: Serialize, R: DeserializeOwned>(&self, method: &str, args: &A) -> Result<R> {
        let mut seq_no = self.seq_no.lock().await;

        // step #1: issue the call
        let raw = self.send(&mut seq_no, method, args).await?;
        match decode_head(&raw) {
            Ok(()) => return Ok(serde_json::from_value(raw)?),
            Err(DriverError::NotSync) => {}
            Err(e) => return Err(e),
        }

        // step #2: recover from NOT_SYNC with an authoritative-list exchange
        debug!(driver = %self.driver_name, method, "plugin out of sync, resyncing");
        self.resync(&mut seq_no).await?;

        // step #3: restart the call; a second failure propagates
        let raw = self.send(&mut seq_no, method, args).await?;
        decode_head(&raw)?;
        Ok(serde_json::from_value(raw)?)
    }

    async fn resync(&self, seq_no: &mut u64) -> Result<()> {
        let callback = self.callback()?;

        let slots = callback
            .query_managed_slots(&self.driver_name)
            .await?;
        warn!(
            driver = %self.driver_name,
            slots = slots.len(),
            "resyncing plugin with authoritative slot list"
        );

        let raw = self
            .send(seq_no, "GetCapability", &api::GetCapabilityRequest { slots })
            .await?;
        decode_head(&raw)?;
        let resp: api::GetCapabilityResponse = serde_json::from_value(raw)?;

        callback
            .update_driver(
                &self.driver_name,
                Capability { runtimes: resp.runtimes },
                resp.slots,
            )
            .await
    }
}

fn decode_head(raw: &Value) -> Result<()> {
    let head: api::ResponseHead = serde_json::from_value(raw.clone())?;
    head.to_result()
}

#[async_trait]
impl AcceleratorDriver for RemoteDriver {
    fn name(&self) -> &str {
        &self.driver_name
    }

    async fn runtimes(&self) -> Vec<String> {
        match self
            .call::<_, api::GetRuntimesResponse>("GetRuntime", &Value::Null)
            .await
        {
            Ok(resp) => resp.runtimes,
            Err(e) => {
                warn!(driver = %self.driver_name, error = %e, "failed to query runtimes");
                Vec::new()
            }
        }
    }

    async fn query_runtime(&self, runtime: &str) -> Result<()> {
        self.call::<_, api::QueryRuntimeResponse>(
            "QueryRuntime",
            &api::QueryRuntimeRequest { runtime: runtime.to_string() },
        )
        .await
        .map(|_| ())
    }

    async fn list_devices(&self) -> Result<Vec<DeviceInfo>> {
        let resp: api::ListDeviceResponse = self.call("ListDevice", &Value::Null).await?;
        Ok(resp.devices)
    }

    async fn allocate_slot(&self, sid: &str, runtime: &str, options: &[String]) -> Result<()> {
        self.call::<_, api::AllocateSlotResponse>(
            "AllocateSlot",
            &api::AllocateSlotRequest {
                slot_id: sid.to_string(),
                runtime: runtime.to_string(),
                options: options.to_vec(),
            },
        )
        .await
        .map(|_| ())
    }

    async fn release_slot(&self, sid: &str) -> Result<()> {
        self.call::<_, api::ReleaseSlotResponse>(
            "ReleaseSlot",
            &api::ReleaseSlotRequest { slot_id: sid.to_string() },
        )
        .await
        .map(|_| ())
    }

    async fn list_slots(&self) -> Result<Vec<String>> {
        let resp: api::ListSlotResponse = self.call("ListSlot", &Value::Null).await?;
        Ok(resp.slots)
    }

    async fn slot_info(&self, sid: &str) -> Result<SlotInfo> {
        let resp: api::SlotInfoResponse = self
            .call("SlotInfo", &api::SlotInfoRequest { slot_id: sid.to_string() })
            .await?;
        Ok(resp.slot_info)
    }

    async fn prepare_slot(&self, sid: &str) -> Result<SlotConfig> {
        let resp: api::PrepareSlotResponse = self
            .call("PrepareSlot", &api::PrepareSlotRequest { slot_id: sid.to_string() })
            .await?;
        Ok(resp.slot_config)
    }
}
