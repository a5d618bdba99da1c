//! JSON wire shapes for the REST surface. Kept separate from the
//! domain model (`refill_api::model`) the same way `refill-directory`
//! and `refill-store` keep their own DTOs -- the wire format is an
//! implementation detail of this crate, not of the shared model.

use crate::supervisor::protocol::{OperationRequest, OperationResponse, StateSnapshot};
use chrono::{DateTime, Utc};
use refill_api::model::{Transaction, VehicleRecord};
use serde::{Deserialize, Serialize};

#[derive(Deserialize)]
#[serde(untagged)]
pub enum KilometersValue {
    Int(i64),
    Str(String),
}

#[derive(Deserialize)]
pub struct DrfSubmitRequest {
    pub kilometers: KilometersValue,
}

#[derive(Deserialize)]
pub struct AuthRequest {
    pub username: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct UartRequest {
    pub line: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HlsResponse {
    pub hls_id: u32,
    pub meter_read: f64,
    pub denominator: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionDto {
    pub id: u64,
    pub tag: String,
    pub fleet_number: String,
    pub dispensed_liters: f64,
    pub machine_hours: u32,
    pub status: String,
}

impl From<&Transaction> for TransactionDto {
    fn from(t: &Transaction) -> Self {
        TransactionDto {
            id: t.id,
            tag: t.tag.to_string(),
            fleet_number: t.fleet_number.clone(),
            dispensed_liters: t.dispensed_liters,
            machine_hours: t.machine_hours,
            status: t.status.to_string(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleDto {
    pub tag: String,
    pub fleet_number: String,
    pub tank_capacity_liters: f64,
}

impl From<&VehicleRecord> for VehicleDto {
    fn from(v: &VehicleRecord) -> Self {
        VehicleDto {
            tag: v.tag.to_string(),
            fleet_number: v.fleet_number.clone(),
            tank_capacity_liters: v.tank_capacity_liters,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeterDto {
    pub current: Option<f64>,
    pub last_stable: Option<f64>,
    pub last_saved: Option<f64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateResponseDto {
    pub state: &'static str,
    pub previous_state: &'static str,
    pub timestamp: DateTime<Utc>,
    pub transaction: Option<TransactionDto>,
    pub vehicle: Option<VehicleDto>,
    pub meter: MeterDto,
    pub message: Option<String>,
}

impl From<StateSnapshot> for StateResponseDto {
    fn from(s: StateSnapshot) -> Self {
        StateResponseDto {
            state: s.state,
            previous_state: s.previous_state,
            timestamp: s.timestamp,
            transaction: s.transaction.as_ref().map(TransactionDto::from),
            vehicle: s.vehicle.as_ref().map(VehicleDto::from),
            meter: MeterDto {
                current: s.meter.current,
                last_stable: s.meter.last_stable,
                last_saved: s.meter.last_saved,
            },
            message: s.message,
        }
    }
}

#[derive(Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum OperationRequestDto {
    RefillReq,
    RefillDrf { kilometers: KilometersValue },
    RefillParams,
    RefillFinish,
    VehicleInfo,
}

impl From<OperationRequestDto> for OperationRequest {
    fn from(dto: OperationRequestDto) -> Self {
        match dto {
            OperationRequestDto::RefillReq => OperationRequest::RefillReq,
            OperationRequestDto::RefillDrf { kilometers } => OperationRequest::RefillDrf {
                kilometers: match kilometers {
                    KilometersValue::Int(n) => n,
                    KilometersValue::Str(s) => s.parse().unwrap_or(-1),
                },
            },
            OperationRequestDto::RefillParams => OperationRequest::RefillParams,
            OperationRequestDto::RefillFinish => OperationRequest::RefillFinish,
            OperationRequestDto::VehicleInfo => OperationRequest::VehicleInfo,
        }
    }
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperationResponseDto {
    RefillStarted,
    TagWaiting,
    RefillDrf,
    RefillParams {
        tag: Option<String>,
        fleet_number: Option<String>,
        liters: f64,
        timestamp: DateTime<Utc>,
    },
    RefillFinished {
        liters: f64,
    },
    VehicleInfo {
        vehicle: Option<VehicleDto>,
    },
    Invalid {
        message: String,
    },
    InvalidToken,
}

impl OperationResponseDto {
    pub fn invalid_token() -> Self {
        OperationResponseDto::InvalidToken
    }
}

impl From<OperationResponse> for OperationResponseDto {
    fn from(r: OperationResponse) -> Self {
        match r {
            OperationResponse::RefillStarted => OperationResponseDto::RefillStarted,
            OperationResponse::TagWaiting => OperationResponseDto::TagWaiting,
            OperationResponse::RefillDrf => OperationResponseDto::RefillDrf,
            OperationResponse::RefillParams {
                tag,
                fleet_number,
                liters,
                timestamp,
            } => OperationResponseDto::RefillParams {
                tag,
                fleet_number,
                liters,
                timestamp,
            },
            OperationResponse::RefillFinished { liters } => OperationResponseDto::RefillFinished { liters },
            OperationResponse::VehicleInfo(v) => OperationResponseDto::VehicleInfo {
                vehicle: v.as_ref().map(VehicleDto::from),
            },
            OperationResponse::Invalid(message) => OperationResponseDto::Invalid { message },
        }
    }
}
