//! The narrow collaborator interfaces the supervisor is generic over
//! (spec §4.0 / §6). Each is implemented by a dedicated crate:
//! `refill-nozzle`, `refill-directory`, `refill-store`. Test code in
//! `refilld` implements lightweight fakes of the same traits.

use crate::error::Error;
use crate::model::{NewTransaction, Tag, Transaction, TransactionId, VehicleRecord};
use crate::nozzle::{NozzleCommand, NozzleFrame};
use async_trait::async_trait;

pub type Result<T> = std::result::Result<T, Error>;

/// The nozzle serial transport. `send` both transmits a command and,
/// if `expect_response` is set, waits for the correlated reply
/// (spec §4.1).
#[async_trait]
pub trait NozzlePort: Send {
    async fn send(&mut self, cmd: NozzleCommand) -> Result<Option<NozzleFrame>>;

    /// Returns the next frame the port has observed, whether or not
    /// it resolved a pending request. The supervisor uses this to
    /// refresh the nozzle-heartbeat watch and to notice unsolicited
    /// events (`rfid_match`, `rfid_alarm`, `nhb`).
    async fn next_event(&mut self) -> Option<NozzleFrame>;
}

/// The remote fleet directory (spec §6). `refresh_tags` re-populates
/// the locally cached permitted-tag set; `validate_tag` is a pure,
/// local lookup against that cache.
#[async_trait]
pub trait FleetDirectory: Send {
    async fn login(&mut self) -> Result<()>;
    async fn refresh_tags(&mut self, tank_id: u64) -> Result<()>;
    fn validate_tag(&self, tag: &Tag) -> Option<VehicleRecord>;

    /// Best-effort, non-fatal: callers log but never abort a refill
    /// because this failed (spec §9 open question on `updateVehicleHours`).
    async fn update_vehicle_hours(&mut self, tag: &Tag, hours: u32) -> Result<()>;
}

/// Local persistence for in-flight and completed transactions
/// (spec §3, I4, I5).
#[async_trait]
pub trait TransactionStore: Send {
    async fn create_transaction(&mut self, draft: NewTransaction) -> Result<Transaction>;
    async fn update_liters(&mut self, id: TransactionId, liters: f64) -> Result<()>;

    /// Accumulates into the tank-wide lifetime counter and marks the
    /// current transaction complete -- called once, after the final
    /// `update_liters`, not on every mid-dispense persist.
    async fn add_dispensed(&mut self, liters: f64) -> Result<()>;
    async fn delete_transaction(&mut self, id: TransactionId) -> Result<()>;
    async fn clear_incomplete(&mut self) -> Result<()>;
    async fn flag_needs_review(&mut self, id: TransactionId, reason: String) -> Result<()>;
}
