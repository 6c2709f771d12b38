//! Wire format of the driver plugin protocol
//!
//! One JSON POST per call, to `<base>/AcceleratorDriver.<Method>`. Every
//! request carries the per-driver sequence number; every response carries an
//! error head with the stable code values below.

use crate::{DriverError, Result};
use accel_core::{DeviceInfo, SlotConfig, SlotInfo};
use serde::{Deserialize, Serialize};

/// Endpoint type prefixed to every method name on the wire
pub const DRIVER_ENDPOINT_TYPE: &str = "AcceleratorDriver";

// code 0x0[0-9]: plugin internal errors
pub const RESP_ERR_NOERROR: i64 = 0x0;
pub const RESP_ERR_NOTIMPL: i64 = 0x1;
pub const RESP_ERR_NOTSYNC: i64 = 0x2;
// code 0x1[0-9]: accelerator operation errors
pub const RESP_ERR_NOTFOUND: i64 = 0x10;
pub const RESP_ERR_NODEV: i64 = 0x11;

/// Request envelope for every plugin call
#[derive(Debug, Serialize)]
pub struct Request<T: Serialize> {
    /// Sequence number at the time the request is sent
    #[serde(rename = "SeqNo")]
    pub seq_no: u64,

    /// Method-specific arguments
    #[serde(rename = "Args")]
    pub args: T,
}

/// Error head present in every plugin response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseHead {
    #[serde(rename = "ErrType", default)]
    pub err_type: i64,

    #[serde(rename = "ErrMsg", default)]
    pub err_msg: String,
}

impl ResponseHead {
    /// Map the wire error code to a driver error, if any
    pub fn to_result(&self) -> Result<()> {
        match self.err_type {
            RESP_ERR_NOERROR => Ok(()),
            RESP_ERR_NOTIMPL => Err(DriverError::NotImplemented),
            RESP_ERR_NOTSYNC => Err(DriverError::NotSync),
            RESP_ERR_NOTFOUND => Err(DriverError::NoSuchSlot(self.err_msg.clone())),
            RESP_ERR_NODEV => Err(DriverError::NoDevice(self.err_msg.clone())),
            _ => Err(DriverError::Remote(self.err_msg.clone())),
        }
    }
}

/// GetCapability carries the controller's authoritative slot list so the
/// driver can resynchronize its own table
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct GetCapabilityRequest {
    #[serde(rename = "Slots", default)]
    pub slots: Vec<SlotInfo>,
}

#[derive(Debug, Default, Deserialize)]
pub struct GetCapabilityResponse {
    #[serde(flatten)]
    pub head: ResponseHead,

    #[serde(rename = "Runtimes", default)]
    pub runtimes: Vec<String>,

    /// Slots the driver could not recover
    #[serde(rename = "Slots", default)]
    pub slots: Vec<SlotInfo>,
}

#[derive(Debug, Default, Deserialize)]
pub struct GetRuntimesResponse {
    #[serde(flatten)]
    pub head: ResponseHead,

    #[serde(rename = "Runtimes", default)]
    pub runtimes: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QueryRuntimeRequest {
    #[serde(rename = "Runtime")]
    pub runtime: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct QueryRuntimeResponse {
    #[serde(flatten)]
    pub head: ResponseHead,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListDeviceResponse {
    #[serde(flatten)]
    pub head: ResponseHead,

    #[serde(rename = "Devices", default)]
    pub devices: Vec<DeviceInfo>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AllocateSlotRequest {
    /// Slot id the plugin is expected to store for future reference
    #[serde(rename = "SlotID")]
    pub slot_id: String,

    #[serde(rename = "Runtime")]
    pub runtime: String,

    #[serde(rename = "Options", default)]
    pub options: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AllocateSlotResponse {
    #[serde(flatten)]
    pub head: ResponseHead,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReleaseSlotRequest {
    #[serde(rename = "SlotID")]
    pub slot_id: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReleaseSlotResponse {
    #[serde(flatten)]
    pub head: ResponseHead,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListSlotResponse {
    #[serde(flatten)]
    pub head: ResponseHead,

    #[serde(rename = "Slots", default)]
    pub slots: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SlotInfoRequest {
    #[serde(rename = "SlotID")]
    pub slot_id: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct SlotInfoResponse {
    #[serde(flatten)]
    pub head: ResponseHead,

    #[serde(rename = "SlotInfo", default)]
    pub slot_info: SlotInfo,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PrepareSlotRequest {
    #[serde(rename = "SlotID")]
    pub slot_id: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct PrepareSlotResponse {
    #[serde(flatten)]
    pub head: ResponseHead,

    #[serde(rename = "SlotConfig", default)]
    pub slot_config: SlotConfig,
}
