//! HTTP surface for accelerator slot management
//!
//! Thin axum adapter over the controller operations:
//!
//! - `POST /accelerators/slots/create`
//! - `GET /accelerators/slots[?filters=...]`
//! - `GET /accelerators/slots/{name}`
//! - `DELETE /accelerators/slots/{name}?force=0|1`
//! - `GET /accelerators/drivers`
//! - `GET /accelerators/devices`
//! - `GET /accelerators/drivers/{driver}/devices`

use accel_controller::{Controller, Slot};
use accel_core::types::{MAX_FILTER_LEN, MAX_NAME_LEN, MAX_OPTIONS_COUNT, MAX_OPTION_LEN};
use accel_core::{generate_id, DeviceInfo};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::debug;

/// Filter keys accepted by the slot listing
const ACCEPTED_FILTERS: [&str; 6] = ["driver", "scope", "name", "id", "owner", "runtime"];

#[derive(Clone)]
struct AppState {
    controller: Controller,
}

/// Build the accelerator router
pub fn router(controller: Controller) -> Router {
    Router::new()
        .route("/accelerators/slots/create", post(create_slot))
        .route("/accelerators/slots", get(list_slots))
        .route(
            "/accelerators/slots/:name",
            get(inspect_slot).delete(delete_slot),
        )
        .route("/accelerators/drivers", get(list_drivers))
        .route("/accelerators/devices", get(list_devices))
        .route("/accelerators/drivers/:driver/devices", get(list_driver_devices))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(AppState { controller })
}

/// API view of one slot
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ApiSlot {
    #[serde(rename = "ID")]
    pub id: String,
    pub name: String,
    pub scope: String,
    pub driver: String,
    pub runtime: String,
    pub options: Vec<String>,
    pub owner: String,
    pub state: u32,
    #[serde(default)]
    pub device: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateSlotRequest {
    pub name: String,
    #[serde(default)]
    pub driver: String,
    pub runtime: String,
    #[serde(default)]
    pub options: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SlotsListResponse {
    pub slots: Vec<ApiSlot>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DriverDescription {
    pub name: String,
    pub runtimes: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DriversResponse {
    pub drivers: Vec<DriverDescription>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DevicesResponse {
    pub devices: Vec<DeviceInfo>,
    pub warnings: Vec<String>,
}

/// Error wrapper deriving the HTTP status from the error kind
#[derive(Debug)]
struct ApiError(accel_core::Error);

impl<E: Into<accel_core::Error>> From<E> for ApiError {
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.to_http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(serde_json::json!({ "message": self.0.to_string() }));
        (status, body).into_response()
    }
}

fn api_slot(slot: &Slot, device: String) -> ApiSlot {
    ApiSlot {
        id: slot.id(),
        name: slot.name(),
        scope: slot.scope().to_string(),
        driver: slot.driver_name(),
        runtime: slot.runtime(),
        options: slot.options(),
        owner: slot.owner(),
        state: slot.state(),
        device,
    }
}

fn check_len(what: &str, value: &str) -> Result<(), ApiError> {
    if value.len() > MAX_NAME_LEN {
        return Err(accel_core::Error::bad_request(format!("{} length exceeds limit", what)).into());
    }
    Ok(())
}

async fn create_slot(
    State(state): State<AppState>,
    Json(req): Json<CreateSlotRequest>,
) -> Result<(StatusCode, Json<ApiSlot>), ApiError> {
    check_len("name", &req.name)?;
    check_len("driver", &req.driver)?;
    check_len("runtime", &req.runtime)?;
    if req.options.len() > MAX_OPTIONS_COUNT {
        return Err(accel_core::Error::bad_request("options count exceeds limit").into());
    }
    for opt in &req.options {
        if opt.len() > MAX_OPTION_LEN {
            return Err(accel_core::Error::bad_request("option length exceeds limit").into());
        }
    }

    let slot = state
        .controller
        .allocate_global_slot(&req.name, &generate_id(), &req.runtime, &req.driver, req.options)
        .await?;
    Ok((StatusCode::CREATED, Json(api_slot(&slot, String::new()))))
}

async fn list_slots(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<SlotsListResponse>, ApiError> {
    let filters = parse_filters(params.get("filters").map(String::as_str))?;

    let slots: Vec<ApiSlot> = state
        .controller
        .slots()
        .iter()
        .map(|slot| api_slot(slot, String::new()))
        .collect();
    let slots = filter_slots(slots, &filters)?;

    Ok(Json(SlotsListResponse { slots, warnings: Vec::new() }))
}

async fn inspect_slot(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ApiSlot>, ApiError> {
    check_len("name", &name)?;
    let slot = resolve_slot(&state.controller, &name)?;
    let device = state.controller.slot_device(&slot).await;
    Ok(Json(api_slot(&slot, device)))
}

async fn delete_slot(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<StatusCode, ApiError> {
    check_len("name", &name)?;
    let force = matches!(
        params.get("force").map(String::as_str),
        Some("1") | Some("true")
    );

    let slot = resolve_slot(&state.controller, &name)?;
    state.controller.release(&slot, force).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_drivers(
    State(state): State<AppState>,
) -> Result<Json<DriversResponse>, ApiError> {
    let mut drivers = Vec::new();
    state.controller.walk_drivers(|name, _, capability| {
        drivers.push(DriverDescription {
            name: name.to_string(),
            runtimes: capability.runtimes.clone(),
        });
        false
    });
    Ok(Json(DriversResponse { drivers, warnings: Vec::new() }))
}

async fn list_devices(
    State(state): State<AppState>,
) -> Result<Json<DevicesResponse>, ApiError> {
    let mut names = Vec::new();
    state.controller.walk_drivers(|name, _, _| {
        names.push(name.to_string());
        false
    });

    // aggregate across drivers, skipping the ones that fail to answer
    let mut devices = Vec::new();
    let mut warnings = Vec::new();
    for name in names {
        match state.controller.list_devices(&name).await {
            Ok(mut found) => devices.append(&mut found),
            Err(err) => {
                debug!(driver = %name, error = %err, "failed to list devices");
                warnings.push(format!("driver {}: {}", name, err));
            }
        }
    }
    Ok(Json(DevicesResponse { devices, warnings }))
}

async fn list_driver_devices(
    State(state): State<AppState>,
    Path(driver): Path<String>,
) -> Result<Json<DevicesResponse>, ApiError> {
    check_len("driver", &driver)?;
    let devices = state.controller.list_devices(&driver).await?;
    Ok(Json(DevicesResponse { devices, warnings: Vec::new() }))
}

fn resolve_slot(controller: &Controller, name_or_id: &str) -> Result<Slot, ApiError> {
    match controller.slot_by_name(name_or_id) {
        Ok(slot) => Ok(slot),
        Err(_) => Ok(controller.slots_by_id_prefix(name_or_id)?),
    }
}

fn parse_filters(raw: Option<&str>) -> Result<HashMap<String, Vec<String>>, ApiError> {
    let Some(raw) = raw else {
        return Ok(HashMap::new());
    };
    if raw.len() > MAX_FILTER_LEN {
        return Err(accel_core::Error::bad_request("filter length exceeds limit").into());
    }
    let filters: HashMap<String, Vec<String>> = serde_json::from_str(raw)
        .map_err(|_| accel_core::Error::bad_request(format!("invalid filters: {}", raw)))?;
    for key in filters.keys() {
        if !ACCEPTED_FILTERS.contains(&key.as_str()) {
            return Err(
                accel_core::Error::bad_request(format!("invalid filter key \"{}\"", key)).into(),
            );
        }
    }
    Ok(filters)
}

/// Keep the slots matching every provided filter. `driver` and `scope`
/// match exactly; the other keys match as regular expressions, falling
/// back to equality for invalid patterns.
fn filter_slots(
    slots: Vec<ApiSlot>,
    filters: &HashMap<String, Vec<String>>,
) -> Result<Vec<ApiSlot>, ApiError> {
    if filters.is_empty() {
        return Ok(slots);
    }

    let exact = |values: &[String], field: &str| values.iter().any(|v| v == field);
    let fuzzy = |values: &[String], field: &str| {
        values.iter().any(|v| match Regex::new(v) {
            Ok(re) => re.is_match(field),
            Err(_) => v == field,
        })
    };

    Ok(slots
        .into_iter()
        .filter(|slot| {
            filters.iter().all(|(key, values)| match key.as_str() {
                "driver" => exact(values, &slot.driver),
                "scope" => exact(values, &slot.scope),
                "name" => fuzzy(values, &slot.name),
                "id" => fuzzy(values, &slot.id),
                "owner" => fuzzy(values, &slot.owner),
                "runtime" => fuzzy(values, &slot.runtime),
                _ => true,
            })
        })
        .collect())
}
