//! The channel protocol between the HTTP surface (`refilld::httpd`)
//! and the supervisor's event loop. Every operator interaction is a
//! request/oneshot-reply pair so the loop stays the sole owner of its
//! state and the operator-contact health watch (spec §5).

use chrono::{DateTime, Utc};
use refill_api::model::{Transaction, VehicleRecord};
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, Default)]
pub struct MeterSnapshot {
    pub current: Option<f64>,
    pub last_stable: Option<f64>,
    pub last_saved: Option<f64>,
}

/// Everything `GET /api/state` and the richer `/api/operation` replies
/// need to render (spec §6).
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    pub state: &'static str,
    pub previous_state: &'static str,
    pub timestamp: DateTime<Utc>,
    pub transaction: Option<Transaction>,
    pub vehicle: Option<VehicleRecord>,
    pub meter: MeterSnapshot,
    pub message: Option<String>,
}

/// Why an operator command was refused. The supervisor never mutates
/// state on a rejected command (spec §7, rule 6).
#[derive(Debug, Clone)]
pub struct Rejected {
    pub error: &'static str,
    pub current_state: &'static str,
}

pub type OperatorResult<T> = Result<T, Rejected>;

/// The `/api/operation` request variants (spec §6).
#[derive(Debug, Clone)]
pub enum OperationRequest {
    RefillReq,
    RefillDrf { kilometers: i64 },
    RefillParams,
    RefillFinish,
    VehicleInfo,
}

/// The matching response tags.
#[derive(Debug, Clone)]
pub enum OperationResponse {
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
    VehicleInfo(Option<VehicleRecord>),
    Invalid(String),
}

/// Commands the HTTP layer sends into the supervisor's event loop.
/// Each carries its own oneshot reply channel; sending one is the only
/// way outside code can touch supervisor state.
pub enum OperatorCommand {
    Fill(oneshot::Sender<OperatorResult<StateSnapshot>>),
    DrfSubmit {
        kilometers: i64,
        reply: oneshot::Sender<OperatorResult<StateSnapshot>>,
    },
    ForceStop(oneshot::Sender<OperatorResult<StateSnapshot>>),
    PollState(oneshot::Sender<StateSnapshot>),
    Operation {
        request: OperationRequest,
        reply: oneshot::Sender<OperationResponse>,
    },
    HlsRead {
        socket_id: u32,
        reply: oneshot::Sender<refill_api::Result<(f64, u32)>>,
    },
    Uart {
        line: String,
    },
}
