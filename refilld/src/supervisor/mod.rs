//! The refill supervisor: a single-threaded, event-driven state
//! machine driving one nozzle through a fill cycle (spec §3, §4, §5).
//!
//! Modeled on `drv_cycle::Instance::run` -- one `tokio::select!` over
//! a tick, the nozzle port's event stream, and an inbound command
//! channel, with `transition()` as the sole place state changes. Every
//! state has both an event path and a tick path so nothing waits
//! without a visible timer (spec §4.4 "common properties").

pub mod protocol;
pub mod state;

use crate::config::Limits;
use crate::health::HealthMonitor;
use crate::stability::StabilityFilter;
use protocol::{
    MeterSnapshot, OperationRequest, OperationResponse, OperatorCommand, OperatorResult, Rejected,
    StateSnapshot,
};
use refill_api::model::{NewTransaction, NozzleId, Tag, Transaction, VehicleRecord};
use refill_api::nozzle::{NozzleCommand, NozzleFrame};
use refill_api::{Error, FleetDirectory, NozzlePort, Result, TransactionStore};
use state::{State, Transition, TRANSITION_LOG_CAPACITY};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{info, warn};

const READING_FIRST_METER_RETRIES: u32 = 150;
const READING_FIRST_METER_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2);
const TAG_MATCH_RETRY_INTERVAL: Duration = Duration::from_secs(5);
const TAG_MATCH_RETRIES: u32 = 60;
const DISPENSING_METER_RETRIES: u32 = 5;
const DISPENSING_METER_TIMEOUT: Duration = Duration::from_secs(5);
const INTERRUPTED_MAX_DURATION: Duration = Duration::from_secs(3 * 60);
const INTERRUPTED_RETRY_INTERVAL: Duration = Duration::from_secs(5);
const FINAL_METER_RETRIES: u32 = 2;
const FINAL_METER_TIMEOUT: Duration = Duration::from_secs(5);
const AWAITING_STABILITY_TIMEOUT: Duration = Duration::from_secs(5);
const IDLE_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
const AWAITING_FIRST_RFID_MAX_DURATION: Duration = Duration::from_secs(3 * 60);
const FAULTED_RECOVERY_MIN: Duration = Duration::from_secs(5);
const FAULTED_RECOVERY_MAX: Duration = Duration::from_secs(30);
const FAULTED_MAX_RECOVERIES: u32 = 3;

fn interrupted_retries() -> u32 {
    (INTERRUPTED_MAX_DURATION.as_secs() / INTERRUPTED_RETRY_INTERVAL.as_secs()) as u32
}

/// Drives one nozzle. Generic over its three collaborators so tests
/// can swap in channel-based fakes for all three (spec §8).
pub struct Supervisor<P: NozzlePort, D: FleetDirectory, S: TransactionStore> {
    nozzle: P,
    directory: D,
    store: S,
    limits: Limits,
    nozzle_id: NozzleId,
    tank_id: u64,

    state: State,
    prev_state: &'static str,
    health: HealthMonitor,
    stability: StabilityFilter,
    bound_vehicle: Option<VehicleRecord>,
    transaction: Option<Transaction>,
    rfid_in_contact: bool,
    message: Option<String>,
    paired: bool,
    next_idle_heartbeat: Instant,

    transitions: VecDeque<Transition>,
    snapshot_tx: watch::Sender<StateSnapshot>,
    operator_rx: mpsc::Receiver<OperatorCommand>,
}

impl<P: NozzlePort, D: FleetDirectory, S: TransactionStore> Supervisor<P, D, S> {
    pub fn new(
        nozzle: P,
        directory: D,
        store: S,
        limits: Limits,
        nozzle_id: NozzleId,
        tank_id: u64,
    ) -> (Self, mpsc::Sender<OperatorCommand>, watch::Receiver<StateSnapshot>) {
        let now = Instant::now();
        let health = HealthMonitor::new(
            now,
            limits.nozzle_heartbeat_budget() * 2,
            limits.nozzle_heartbeat_budget(),
            limits.app_comm_active_budget(),
        );
        let stability = StabilityFilter::new(
            limits.meter_stability_count,
            limits.meter_stability_window(),
            limits.meter_stability_duration(),
        );
        let (operator_tx, operator_rx) = mpsc::channel(32);
        let initial = StateSnapshot {
            state: "Idle",
            previous_state: "Idle",
            timestamp: chrono::Utc::now(),
            transaction: None,
            vehicle: None,
            meter: MeterSnapshot::default(),
            message: None,
        };
        let (snapshot_tx, snapshot_rx) = watch::channel(initial);

        let sup = Supervisor {
            nozzle,
            directory,
            store,
            limits,
            nozzle_id,
            tank_id,
            state: State::Idle,
            prev_state: "Idle",
            health,
            stability,
            bound_vehicle: None,
            transaction: None,
            rfid_in_contact: false,
            message: None,
            paired: false,
            next_idle_heartbeat: now,
            transitions: VecDeque::with_capacity(TRANSITION_LOG_CAPACITY),
            snapshot_tx,
            operator_rx,
        };

        (sup, operator_tx, snapshot_rx)
    }

    /// The event loop. Runs until the operator channel closes or the
    /// nozzle port is gone for good.
    pub async fn run(mut self) -> Result<()> {
        self.directory.refresh_tags(self.tank_id).await?;
        self.publish_snapshot();

        let mut tick = tokio::time::interval(self.limits.tick_interval());

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.on_tick().await {
                        warn!("tick handling failed -- {}", e);
                    }
                }
                frame = self.nozzle.next_event() => {
                    match frame {
                        Some(f) => {
                            if let Err(e) = self.on_frame(f).await {
                                warn!("frame handling failed -- {}", e);
                            }
                        }
                        None => return Err(Error::MissingPeer(String::from("nozzle port closed"))),
                    }
                }
                cmd = self.operator_rx.recv() => {
                    match cmd {
                        Some(c) => self.on_operator(c).await,
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    // ---- plumbing -------------------------------------------------

    fn transition(&mut self, next: State, reason: &'static str) {
        let from = self.state.name();
        self.prev_state = from;
        self.health
            .set_operator_active(Instant::now(), next.operator_contact_is_bounded());
        self.state = next;
        let to = self.state.name();

        info!(from, to, reason, "supervisor transition");

        if self.transitions.len() >= TRANSITION_LOG_CAPACITY {
            self.transitions.pop_front();
        }
        self.transitions.push_back(Transition {
            from,
            to,
            reason,
            at: Instant::now(),
        });

        self.publish_snapshot();
    }

    fn publish_snapshot(&self) {
        let snapshot = StateSnapshot {
            state: self.state.name(),
            previous_state: self.prev_state,
            timestamp: chrono::Utc::now(),
            transaction: self.transaction.clone(),
            vehicle: self.bound_vehicle.clone(),
            meter: MeterSnapshot {
                current: self.stability.current(),
                last_stable: self.stability.last_stable(),
                last_saved: self.transaction.as_ref().map(|t| t.dispensed_liters),
            },
            message: self.message.clone(),
        };
        let _ = self.snapshot_tx.send(snapshot);
    }

    /// Re-entry into Idle always resets scoped state (spec §4.4).
    fn reset_refill_scope(&mut self, now: Instant) {
        self.stability.reset();
        self.bound_vehicle = None;
        self.transaction = None;
        self.rfid_in_contact = false;
        self.message = None;
        self.health.reset(now);
    }

    fn enter_idle(&mut self, reason: &'static str) {
        self.reset_refill_scope(Instant::now());
        self.transition(State::Idle, reason);
    }

    async fn issue(&mut self, cmd: NozzleCommand, timeout: Duration) -> Result<Option<NozzleFrame>> {
        match tokio::time::timeout(timeout, self.nozzle.send(cmd)).await {
            Ok(result) => {
                if let Ok(Some(_)) = &result {
                    self.health.refresh_nozzle(Instant::now());
                }
                result
            }
            Err(_) => Err(Error::TimeoutError),
        }
    }

    async fn fire(&mut self, cmd: NozzleCommand) {
        let _ = self.nozzle.send(cmd).await;
    }

    // ---- tick dispatch ---------------------------------------------

    async fn on_tick(&mut self) -> Result<()> {
        let now = Instant::now();
        let flags = self.health.expired(now);

        let state = std::mem::replace(&mut self.state, State::Idle);

        match state {
            State::Idle => self.tick_idle(now, flags.board).await,
            State::Starting => {
                self.state = State::Starting;
            }
            State::AwaitingFirstRfid {
                retries_left,
                deadline,
                entered_at,
                got_valid_response,
            } => {
                self.tick_awaiting_first_rfid(now, retries_left, deadline, entered_at, got_valid_response, flags.operator)
                    .await
            }
            State::AwaitingOdometer { entered_at } => {
                self.tick_awaiting_odometer(now, entered_at, flags.operator).await
            }
            State::ReadingFirstMeter { retries_left, deadline } => {
                self.tick_reading_first_meter(now, retries_left, deadline).await
            }
            State::AwaitingTagMatch {
                retries_left,
                deadline,
                tag,
            } => self.tick_awaiting_tag_match(now, retries_left, deadline, tag).await,
            State::Dispensing { retries_left, deadline } => {
                self.tick_dispensing(now, retries_left, deadline, flags).await
            }
            State::Interrupted { retries_left, deadline } => {
                self.tick_interrupted(now, retries_left, deadline, flags.operator).await
            }
            State::FinalMeterRead { retries_left, deadline } => {
                self.tick_final_meter_read(now, retries_left, deadline).await
            }
            State::AwaitingStability { deadline } => self.tick_awaiting_stability(now, deadline).await,
            State::AwaitingOperatorAck { entered_at } => {
                self.tick_awaiting_operator_ack(now, entered_at).await
            }
            State::ForceStopping => {
                self.state = State::ForceStopping;
            }
            State::Faulted {
                entered_at,
                recoveries_attempted,
            } => self.tick_faulted(now, entered_at, recoveries_attempted).await,
        }

        Ok(())
    }

    async fn tick_idle(&mut self, now: Instant, board_expired: bool) {
        if board_expired {
            self.enter_faulted("board heartbeat lost");
            return;
        }

        if !self.paired {
            self.fire(NozzleCommand::PairNozzle(self.nozzle_id)).await;
            self.paired = true;
            self.next_idle_heartbeat = now + IDLE_HEARTBEAT_INTERVAL;
        }

        if now >= self.next_idle_heartbeat {
            self.next_idle_heartbeat = now + IDLE_HEARTBEAT_INTERVAL;
            if let Ok(Some(NozzleFrame::Heartbeat { status })) =
                self.issue(NozzleCommand::Heartbeat, self.limits.uart_response_timeout()).await
            {
                self.health.refresh_board(now);
                if status != 0 {
                    warn!(status, "board heartbeat reported non-zero status");
                }
            }
        }

        self.state = State::Idle;
    }

    async fn tick_awaiting_first_rfid(
        &mut self,
        now: Instant,
        retries_left: u32,
        deadline: Instant,
        entered_at: Instant,
        got_valid_response: bool,
        operator_expired: bool,
    ) {
        if got_valid_response && operator_expired {
            self.enter_idle("operator contact lost");
            return;
        }

        if now.saturating_duration_since(entered_at) > AWAITING_FIRST_RFID_MAX_DURATION {
            self.enter_idle("awaiting first rfid exceeded 3 minute ceiling");
            return;
        }

        if now < deadline {
            self.state = State::AwaitingFirstRfid {
                retries_left,
                deadline,
                entered_at,
                got_valid_response,
            };
            return;
        }

        if retries_left == 0 {
            self.enter_idle("rfid max retries");
            return;
        }

        self.fire(NozzleCommand::RfidGet(self.nozzle_id)).await;
        self.state = State::AwaitingFirstRfid {
            retries_left: retries_left - 1,
            deadline: now + self.limits.rfid_retry_interval(),
            entered_at,
            got_valid_response,
        };
    }

    async fn tick_awaiting_odometer(&mut self, now: Instant, entered_at: Instant, operator_expired: bool) {
        if operator_expired || now.saturating_duration_since(entered_at) > self.limits.drf_submit_timeout() {
            self.fire(NozzleCommand::RfidGetStop(self.nozzle_id)).await;
            self.enter_idle("drf submit timeout");
            return;
        }
        self.state = State::AwaitingOdometer { entered_at };
    }

    async fn tick_reading_first_meter(&mut self, now: Instant, retries_left: u32, deadline: Instant) {
        if now < deadline {
            self.state = State::ReadingFirstMeter { retries_left, deadline };
            return;
        }

        if retries_left == 0 {
            self.fire(NozzleCommand::RfidGetStop(self.nozzle_id)).await;
            self.fire(NozzleCommand::SetSolenoid(self.nozzle_id, false)).await;
            self.enter_idle("meter read error");
            return;
        }

        self.fire(NozzleCommand::MeterRead(self.nozzle_id)).await;
        self.state = State::ReadingFirstMeter {
            retries_left: retries_left - 1,
            deadline: now + READING_FIRST_METER_ATTEMPT_TIMEOUT,
        };
    }

    async fn tick_awaiting_tag_match(&mut self, now: Instant, retries_left: u32, deadline: Instant, tag: Tag) {
        if now < deadline {
            self.state = State::AwaitingTagMatch { retries_left, deadline, tag };
            return;
        }

        if retries_left == 0 {
            self.fire(NozzleCommand::RfidStop(self.nozzle_id)).await;
            self.enter_idle("tag match timeout");
            return;
        }

        self.state = State::AwaitingTagMatch {
            retries_left: retries_left - 1,
            deadline: now + TAG_MATCH_RETRY_INTERVAL,
            tag,
        };
    }

    async fn tick_dispensing(&mut self, now: Instant, retries_left: u32, deadline: Instant, flags: crate::health::HealthFlags) {
        if flags.nozzle {
            self.interrupt("nozzle comm lost").await;
            return;
        }

        if flags.operator {
            self.fire(NozzleCommand::SetSolenoid(self.nozzle_id, false)).await;
            self.fire(NozzleCommand::RfidStop(self.nozzle_id)).await;
            self.goto_final_meter_read("operator contact lost").await;
            return;
        }

        if let Some(current) = self.stability.current() {
            if let Some(v) = self.bound_vehicle.as_ref() {
                if current >= v.tank_capacity_liters {
                    self.fire(NozzleCommand::SetSolenoid(self.nozzle_id, false)).await;
                    self.fire(NozzleCommand::RfidStop(self.nozzle_id)).await;
                    self.goto_final_meter_read("tank capacity").await;
                    return;
                }
            }
        }

        if now < deadline {
            self.state = State::Dispensing { retries_left, deadline };
            return;
        }

        if retries_left == 0 {
            self.fire(NozzleCommand::SetSolenoid(self.nozzle_id, false)).await;
            self.fire(NozzleCommand::RfidStop(self.nozzle_id)).await;
            self.goto_final_meter_read("meter timeout").await;
            return;
        }

        self.fire(NozzleCommand::MeterRead(self.nozzle_id)).await;
        self.state = State::Dispensing {
            retries_left: retries_left - 1,
            deadline: now + DISPENSING_METER_TIMEOUT,
        };
    }

    async fn tick_interrupted(&mut self, now: Instant, retries_left: u32, deadline: Instant, operator_expired: bool) {
        if operator_expired {
            self.goto_final_meter_read("operator contact lost").await;
            return;
        }

        if now < deadline {
            self.state = State::Interrupted { retries_left, deadline };
            return;
        }

        if retries_left == 0 {
            self.fire(NozzleCommand::RfidStop(self.nozzle_id)).await;
            self.goto_final_meter_read("nozzle removed").await;
            return;
        }

        self.fire(NozzleCommand::RfidGet(self.nozzle_id)).await;
        self.state = State::Interrupted {
            retries_left: retries_left - 1,
            deadline: now + INTERRUPTED_RETRY_INTERVAL,
        };
    }

    async fn tick_final_meter_read(&mut self, now: Instant, retries_left: u32, deadline: Instant) {
        if now < deadline {
            self.state = State::FinalMeterRead { retries_left, deadline };
            return;
        }

        if retries_left == 0 {
            let value = self.stability.last_stable().unwrap_or(0.0);
            self.finalize(value).await;
            return;
        }

        self.fire(NozzleCommand::MeterRead(self.nozzle_id)).await;
        self.state = State::FinalMeterRead {
            retries_left: retries_left - 1,
            deadline: now + FINAL_METER_TIMEOUT,
        };
    }

    async fn tick_awaiting_stability(&mut self, now: Instant, deadline: Instant) {
        if now < deadline {
            self.state = State::AwaitingStability { deadline };
            return;
        }
        self.transition(
            State::FinalMeterRead {
                retries_left: FINAL_METER_RETRIES,
                deadline: now + FINAL_METER_TIMEOUT,
            },
            "re-reading after stability wait",
        );
        self.fire(NozzleCommand::MeterRead(self.nozzle_id)).await;
    }

    async fn tick_awaiting_operator_ack(&mut self, now: Instant, entered_at: Instant) {
        if now.saturating_duration_since(entered_at) > self.limits.app_inform_timeout() {
            self.enter_idle("operator ack timeout");
            return;
        }
        self.state = State::AwaitingOperatorAck { entered_at };
    }

    async fn tick_faulted(&mut self, now: Instant, entered_at: Instant, recoveries_attempted: u32) {
        let elapsed = now.saturating_duration_since(entered_at);

        if elapsed > FAULTED_RECOVERY_MAX {
            self.attempt_full_reset().await;
            return;
        }

        if elapsed >= FAULTED_RECOVERY_MIN && recoveries_attempted < FAULTED_MAX_RECOVERIES {
            self.run_recovery_probe().await;
            self.state = State::Faulted {
                entered_at,
                recoveries_attempted: recoveries_attempted + 1,
            };
            return;
        }

        self.state = State::Faulted { entered_at, recoveries_attempted };
    }

    async fn run_recovery_probe(&mut self) {
        let timeout = self.limits.uart_response_timeout();
        let healthy = matches!(
            self.issue(NozzleCommand::Heartbeat, timeout).await,
            Ok(Some(NozzleFrame::Heartbeat { status: 0 }))
        );

        self.fire(NozzleCommand::SetSolenoid(self.nozzle_id, false)).await;
        self.fire(NozzleCommand::RfidStop(self.nozzle_id)).await;
        self.fire(NozzleCommand::MeterReset(self.nozzle_id)).await;

        let meter_ok = self.issue(NozzleCommand::MeterRead(self.nozzle_id), timeout).await.is_ok();
        let rfid_ok = self.issue(NozzleCommand::RfidGet(self.nozzle_id), timeout).await.is_ok();

        if healthy && meter_ok && rfid_ok {
            self.attempt_full_reset().await;
        }
    }

    async fn attempt_full_reset(&mut self) {
        if let Some(tx) = self.transaction.clone() {
            if let Some(last_stable) = self.stability.last_stable() {
                if last_stable > 0.0 {
                    if self.store.update_liters(tx.id, last_stable).await.is_ok() {
                        self.message = Some(String::from("recovered from a fault"));
                        self.transition(
                            State::AwaitingOperatorAck { entered_at: Instant::now() },
                            "recovered in-flight transaction",
                        );
                        return;
                    }
                    tracing::error!("could not persist recovered transaction {} after fault", tx.id);
                }
            }
        }

        self.enter_idle("fault cleared");
    }

    fn enter_faulted(&mut self, reason: &'static str) {
        self.transition(
            State::Faulted {
                entered_at: Instant::now(),
                recoveries_attempted: 0,
            },
            reason,
        );
    }

    async fn interrupt(&mut self, reason: &'static str) {
        self.fire(NozzleCommand::SetSolenoid(self.nozzle_id, false)).await;
        self.transition(
            State::Interrupted {
                retries_left: interrupted_retries(),
                deadline: Instant::now() + INTERRUPTED_RETRY_INTERVAL,
            },
            reason,
        );
    }

    async fn goto_final_meter_read(&mut self, reason: &'static str) {
        self.fire(NozzleCommand::MeterRead(self.nozzle_id)).await;
        self.transition(
            State::FinalMeterRead {
                retries_left: FINAL_METER_RETRIES,
                deadline: Instant::now() + FINAL_METER_TIMEOUT,
            },
            reason,
        );
    }

    /// Persist-or-discard the transaction and hand control back to the
    /// operator (spec §4.4 "Finalize").
    async fn finalize(&mut self, final_value: f64) {
        if final_value > 0.0 {
            if let Some(tx) = self.transaction.as_mut() {
                tx.dispensed_liters = final_value;
                let id = tx.id;
                let tag = tx.tag.clone();
                let _ = self.store.update_liters(id, final_value).await;
                let _ = self.store.add_dispensed(final_value).await;
                let _ = self.store.clear_incomplete().await;

                if let Some(v) = self.bound_vehicle.as_ref() {
                    let hours = v.current_machine_hours;
                    if let Err(e) = self.directory.update_vehicle_hours(&tag, hours).await {
                        warn!("couldn't update vehicle hours for {} -- {}", tag, e);
                    }
                }
            }
        } else if let Some(tx) = self.transaction.as_ref() {
            let _ = self.store.delete_transaction(tx.id).await;
            let _ = self.store.clear_incomplete().await;
        }

        self.transition(
            State::AwaitingOperatorAck { entered_at: Instant::now() },
            "transaction finalized",
        );
    }

    // ---- frame dispatch ---------------------------------------------

    async fn on_frame(&mut self, frame: NozzleFrame) -> Result<()> {
        self.health.refresh_nozzle(Instant::now());
        if let NozzleFrame::Heartbeat { .. } = &frame {
            self.health.refresh_board(Instant::now());
        }

        match (&self.state, &frame) {
            (State::AwaitingFirstRfid { .. }, NozzleFrame::RfidGet { tag, .. }) => {
                self.on_first_rfid_reply(tag.clone()).await;
            }
            (State::AwaitingTagMatch { .. }, NozzleFrame::RfidMatch { .. }) => {
                self.rfid_in_contact = true;
                self.on_tag_match().await;
            }
            (State::Dispensing { .. }, NozzleFrame::RfidAlarm { .. }) => {
                self.rfid_in_contact = false;
                self.interrupt("tag contact lost").await;
            }
            (State::Interrupted { .. }, NozzleFrame::RfidGet { tag, .. }) => {
                self.on_interrupted_rfid_reply(tag.clone()).await;
            }
            (State::Dispensing { .. }, NozzleFrame::MeterRead { liters }) => {
                self.on_meter_sample(*liters).await;
            }
            (State::ReadingFirstMeter { .. }, NozzleFrame::MeterRead { liters }) => {
                self.on_first_meter_reply(*liters).await;
            }
            (State::FinalMeterRead { .. }, NozzleFrame::MeterRead { liters }) => {
                self.on_final_meter_reply(*liters).await;
            }
            _ => {}
        }

        Ok(())
    }

    async fn on_first_rfid_reply(&mut self, tag: Tag) {
        let State::AwaitingFirstRfid {
            retries_left,
            entered_at,
            ..
        } = self.state.clone()
        else {
            return;
        };

        if !tag.is_present() {
            self.state = State::AwaitingFirstRfid {
                retries_left,
                deadline: Instant::now() + self.limits.rfid_retry_interval(),
                entered_at,
                got_valid_response: true,
            };
            return;
        }

        match self.directory_lookup(&tag) {
            Some(vehicle) => {
                self.bound_vehicle = Some(vehicle);
                self.transition(
                    State::AwaitingOdometer { entered_at: Instant::now() },
                    "vehicle tag recognized",
                );
            }
            None => {
                self.state = State::AwaitingFirstRfid {
                    retries_left,
                    deadline: Instant::now() + self.limits.rfid_retry_interval(),
                    entered_at,
                    got_valid_response: true,
                };
            }
        }
    }

    fn directory_lookup(&self, tag: &Tag) -> Option<VehicleRecord> {
        self.directory.validate_tag(tag)
    }

    async fn on_first_meter_reply(&mut self, liters: f64) {
        self.stability.push(Instant::now(), liters);

        let Some(vehicle) = self.bound_vehicle.clone() else {
            self.enter_idle("no bound vehicle for tag match");
            return;
        };

        self.fire(NozzleCommand::RfidGetCont(self.nozzle_id, vehicle.tag.clone())).await;
        self.transition(
            State::AwaitingTagMatch {
                retries_left: TAG_MATCH_RETRIES,
                deadline: Instant::now() + TAG_MATCH_RETRY_INTERVAL,
                tag: vehicle.tag,
            },
            "first meter read complete",
        );
    }

    async fn on_tag_match(&mut self) {
        let State::AwaitingTagMatch { tag, .. } = self.state.clone() else {
            return;
        };
        let Some(vehicle) = self.bound_vehicle.clone() else {
            self.message = Some(String::from("Database Error"));
            self.transition(State::AwaitingOperatorAck { entered_at: Instant::now() }, "no bound vehicle");
            return;
        };

        let draft = NewTransaction {
            tag: tag.clone(),
            fleet_number: vehicle.fleet_number.clone(),
            start_meter: self.stability.current().unwrap_or(0.0),
            machine_hours: vehicle.current_machine_hours,
        };

        match self.store.create_transaction(draft).await {
            Ok(tx) => {
                self.transaction = Some(tx);
                self.fire(NozzleCommand::SetSolenoid(self.nozzle_id, true)).await;
                self.fire(NozzleCommand::MeterRead(self.nozzle_id)).await;
                self.transition(
                    State::Dispensing {
                        retries_left: DISPENSING_METER_RETRIES,
                        deadline: Instant::now() + DISPENSING_METER_TIMEOUT,
                    },
                    "tag matched, dispensing",
                );
            }
            Err(e) => {
                warn!("couldn't create transaction -- {}", e);
                self.message = Some(String::from("Database Error"));
                self.transition(State::AwaitingOperatorAck { entered_at: Instant::now() }, "store error");
            }
        }
    }

    async fn on_interrupted_rfid_reply(&mut self, tag: Tag) {
        let bound_matches = self
            .bound_vehicle
            .as_ref()
            .map(|v| v.tag == tag)
            .unwrap_or(false);

        if bound_matches {
            self.rfid_in_contact = true;
            self.fire(NozzleCommand::RfidGetCont(self.nozzle_id, tag)).await;
            self.fire(NozzleCommand::SetSolenoid(self.nozzle_id, true)).await;
            self.transition(
                State::Dispensing {
                    retries_left: DISPENSING_METER_RETRIES,
                    deadline: Instant::now() + DISPENSING_METER_TIMEOUT,
                },
                "RFID recovered",
            );
        }
    }

    /// spec §4.4 FinalMeterRead: a reply equal to the already-known
    /// stable value finalizes; a changed reply means the meter hasn't
    /// settled, so wait out one more stability window and re-read.
    async fn on_final_meter_reply(&mut self, liters: f64) {
        let unchanged = self
            .stability
            .last_stable()
            .map(|v| (v - liters).abs() < f64::EPSILON)
            .unwrap_or(false);

        self.stability.push(Instant::now(), liters);

        if unchanged {
            self.finalize(liters).await;
        } else {
            self.stability.stable_value();
            self.transition(
                State::AwaitingStability {
                    deadline: Instant::now() + AWAITING_STABILITY_TIMEOUT,
                },
                "final meter reading changed, awaiting stability",
            );
        }
    }

    async fn on_meter_sample(&mut self, liters: f64) {
        self.stability.push(Instant::now(), liters);
        self.stability.stable_value();

        if let (Some(tx), Some(step)) = (
            self.transaction.as_ref(),
            self.stability.needs_persist(self.limits.persist_step_liters),
        ) {
            let id = tx.id;
            if self.store.update_liters(id, step).await.is_ok() {
                self.stability.mark_saved(step);
            }
        }
    }

    // ---- operator commands -------------------------------------------

    async fn on_operator(&mut self, cmd: OperatorCommand) {
        self.health.refresh_operator(Instant::now());

        match cmd {
            OperatorCommand::Fill(reply) => {
                let result = self.do_fill().await;
                let _ = reply.send(result.map(|_| self.snapshot()));
            }
            OperatorCommand::DrfSubmit { kilometers, reply } => {
                let result = self.do_drf_submit(kilometers).await;
                let _ = reply.send(result.map(|_| self.snapshot()));
            }
            OperatorCommand::ForceStop(reply) => {
                let result = self.do_force_stop().await;
                let _ = reply.send(result.map(|_| self.snapshot()));
            }
            OperatorCommand::PollState(reply) => {
                if matches!(self.state, State::AwaitingOperatorAck { .. }) {
                    self.enter_idle("operator informed");
                }
                let _ = reply.send(self.snapshot());
            }
            OperatorCommand::Operation { request, reply } => {
                let response = self.do_operation(request).await;
                let _ = reply.send(response);
            }
            OperatorCommand::HlsRead { socket_id, reply } => {
                let result = self.do_hls_read(socket_id).await;
                let _ = reply.send(result);
            }
            OperatorCommand::Uart { line } => {
                info!(line, "diagnostic uart passthrough");
            }
        }
    }

    fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            state: self.state.name(),
            previous_state: self.prev_state,
            timestamp: chrono::Utc::now(),
            transaction: self.transaction.clone(),
            vehicle: self.bound_vehicle.clone(),
            meter: MeterSnapshot {
                current: self.stability.current(),
                last_stable: self.stability.last_stable(),
                last_saved: self.transaction.as_ref().map(|t| t.dispensed_liters),
            },
            message: self.message.clone(),
        }
    }

    async fn do_fill(&mut self) -> OperatorResult<()> {
        if !self.state.is_idle() {
            return Err(Rejected {
                error: "refill already in progress",
                current_state: self.state.name(),
            });
        }

        self.transition(State::Starting, "operator start");
        self.fire(NozzleCommand::RfidGet(self.nozzle_id)).await;

        let now = Instant::now();
        self.transition(
            State::AwaitingFirstRfid {
                retries_left: self.limits.max_rfid_retries,
                deadline: now + self.limits.rfid_retry_interval(),
                entered_at: now,
                got_valid_response: false,
            },
            "starting entry complete",
        );

        Ok(())
    }

    async fn do_drf_submit(&mut self, kilometers: i64) -> OperatorResult<()> {
        if !matches!(self.state, State::AwaitingOdometer { .. }) {
            return Err(Rejected {
                error: "not awaiting odometer entry",
                current_state: self.state.name(),
            });
        }

        if !(0..=1000).contains(&kilometers) {
            return Err(Rejected {
                error: "kilometers must be between 0 and 1000",
                current_state: self.state.name(),
            });
        }

        if let Some(v) = self.bound_vehicle.as_mut() {
            v.current_machine_hours = kilometers as u32;
        }

        self.fire(NozzleCommand::MeterReset(self.nozzle_id)).await;
        self.fire(NozzleCommand::MeterRead(self.nozzle_id)).await;

        self.transition(
            State::ReadingFirstMeter {
                retries_left: READING_FIRST_METER_RETRIES,
                deadline: Instant::now() + READING_FIRST_METER_ATTEMPT_TIMEOUT,
            },
            "odometer accepted",
        );

        Ok(())
    }

    async fn do_force_stop(&mut self) -> OperatorResult<()> {
        if !matches!(self.state, State::Dispensing { .. } | State::Interrupted { .. }) {
            return Err(Rejected {
                error: "not dispensing",
                current_state: self.state.name(),
            });
        }

        self.transition(State::ForceStopping, "operator force stop");

        let reply = self
            .issue(NozzleCommand::MeterRead(self.nozzle_id), self.limits.meter_read_timeout())
            .await;
        self.fire(NozzleCommand::SetSolenoid(self.nozzle_id, false)).await;
        self.fire(NozzleCommand::RfidStop(self.nozzle_id)).await;

        let value = match reply {
            Ok(Some(NozzleFrame::MeterRead { liters })) if liters > 0.0 => Some(liters),
            _ => self.stability.last_stable().filter(|v| *v > 0.0),
        };

        match value {
            Some(v) => {
                self.stability.push(Instant::now(), v);
                self.stability.stable_value();
                self.transition(
                    State::FinalMeterRead {
                        retries_left: FINAL_METER_RETRIES,
                        deadline: Instant::now() + FINAL_METER_TIMEOUT,
                    },
                    "force stop with usable reading",
                );
            }
            None => {
                self.finalize(0.0).await;
            }
        }

        Ok(())
    }

    async fn do_operation(&mut self, request: OperationRequest) -> OperationResponse {
        match request {
            OperationRequest::RefillReq => match self.do_fill().await {
                Ok(()) => OperationResponse::RefillStarted,
                Err(r) => OperationResponse::Invalid(r.error.to_string()),
            },
            OperationRequest::RefillDrf { kilometers } => {
                if matches!(self.state, State::AwaitingOdometer { .. }) {
                    match self.do_drf_submit(kilometers).await {
                        Ok(()) => OperationResponse::RefillDrf,
                        Err(r) => OperationResponse::Invalid(r.error.to_string()),
                    }
                } else if matches!(self.state, State::AwaitingFirstRfid { .. } | State::Starting) {
                    OperationResponse::TagWaiting
                } else {
                    OperationResponse::Invalid(String::from("not awaiting a DRF submission"))
                }
            }
            OperationRequest::RefillParams => match (&self.state, &self.transaction) {
                (State::Dispensing { .. }, Some(tx)) => OperationResponse::RefillParams {
                    tag: Some(tx.tag.to_string()),
                    fleet_number: Some(tx.fleet_number.clone()),
                    liters: self.stability.current().unwrap_or(tx.dispensed_liters),
                    timestamp: chrono::Utc::now(),
                },
                _ => OperationResponse::Invalid(String::from("no refill in progress")),
            },
            OperationRequest::RefillFinish => match self.do_force_stop().await {
                Ok(()) => OperationResponse::RefillFinished {
                    liters: self.stability.last_stable().unwrap_or(0.0),
                },
                Err(r) => OperationResponse::Invalid(r.error.to_string()),
            },
            OperationRequest::VehicleInfo => OperationResponse::VehicleInfo(self.bound_vehicle.clone()),
        }
    }

    async fn do_hls_read(&mut self, socket_id: u32) -> Result<(f64, u32)> {
        match self
            .issue(NozzleCommand::HlsRead(500, socket_id), self.limits.uart_response_timeout())
            .await?
        {
            Some(NozzleFrame::HlsRead { value, denominator }) => Ok((value, denominator)),
            _ => Err(Error::ProtocolError(String::from("no hls_read reply"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use refill_api::model::TransactionStatus;
    use std::collections::HashMap;
    use std::str::FromStr;
    use std::sync::{Arc, Mutex as StdMutex};
    use tokio::sync::oneshot;

    // ---- fakes --------------------------------------------------------

    /// Mirrors `SerialNozzlePort`'s dual-delivery behavior: a reply to an
    /// expect-response command is both returned from `send` and published
    /// on the event stream, exactly like the real reader task does before
    /// it attempts correlation.
    struct FakeNozzle {
        log: Arc<StdMutex<Vec<NozzleCommand>>>,
        scripts: Arc<StdMutex<HashMap<refill_api::nozzle::VerbFamily, VecDeque<NozzleFrame>>>>,
        events_tx: mpsc::Sender<NozzleFrame>,
        events_rx: mpsc::Receiver<NozzleFrame>,
    }

    struct FakeNozzleHandle {
        log: Arc<StdMutex<Vec<NozzleCommand>>>,
        scripts: Arc<StdMutex<HashMap<refill_api::nozzle::VerbFamily, VecDeque<NozzleFrame>>>>,
        events_tx: mpsc::Sender<NozzleFrame>,
    }

    impl FakeNozzleHandle {
        fn script(&self, frame: NozzleFrame) {
            self.scripts
                .lock()
                .unwrap()
                .entry(frame.family())
                .or_default()
                .push_back(frame);
        }

        async fn push_unsolicited(&self, frame: NozzleFrame) {
            let _ = self.events_tx.send(frame).await;
        }

        fn commands(&self) -> Vec<NozzleCommand> {
            self.log.lock().unwrap().clone()
        }
    }

    fn fake_nozzle() -> (FakeNozzle, FakeNozzleHandle) {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let scripts = Arc::new(StdMutex::new(HashMap::new()));
        let (events_tx, events_rx) = mpsc::channel(64);

        let port = FakeNozzle {
            log: log.clone(),
            scripts: scripts.clone(),
            events_tx: events_tx.clone(),
            events_rx,
        };
        let handle = FakeNozzleHandle { log, scripts, events_tx };

        (port, handle)
    }

    #[async_trait]
    impl NozzlePort for FakeNozzle {
        async fn send(&mut self, cmd: NozzleCommand) -> Result<Option<NozzleFrame>> {
            self.log.lock().unwrap().push(cmd.clone());

            match cmd.family().filter(|_| cmd.expect_response()) {
                Some(family) => {
                    let reply = self.scripts.lock().unwrap().get_mut(&family).and_then(|q| q.pop_front());
                    match reply {
                        Some(frame) => {
                            let _ = self.events_tx.send(frame.clone()).await;
                            Ok(Some(frame))
                        }
                        None => Err(Error::TimeoutError),
                    }
                }
                None => Ok(None),
            }
        }

        async fn next_event(&mut self) -> Option<NozzleFrame> {
            self.events_rx.recv().await
        }
    }

    struct FakeDirectory {
        tags: HashMap<String, VehicleRecord>,
    }

    #[async_trait]
    impl FleetDirectory for FakeDirectory {
        async fn login(&mut self) -> Result<()> {
            Ok(())
        }

        async fn refresh_tags(&mut self, _tank_id: u64) -> Result<()> {
            Ok(())
        }

        fn validate_tag(&self, tag: &Tag) -> Option<VehicleRecord> {
            match tag {
                Tag::Present(s) => self.tags.get(s).cloned(),
                Tag::None => None,
            }
        }

        async fn update_vehicle_hours(&mut self, _tag: &Tag, _hours: u32) -> Result<()> {
            Ok(())
        }
    }

    use refill_api::model::TransactionId;

    #[derive(Default)]
    struct FakeStore {
        next_id: TransactionId,
        current: Option<TransactionId>,
        rows: Arc<StdMutex<HashMap<TransactionId, Transaction>>>,
    }

    #[async_trait]
    impl TransactionStore for FakeStore {
        async fn create_transaction(&mut self, draft: NewTransaction) -> Result<Transaction> {
            self.next_id += 1;
            let tx = Transaction {
                id: self.next_id,
                tag: draft.tag,
                fleet_number: draft.fleet_number,
                start_meter: draft.start_meter,
                dispensed_liters: 0.0,
                machine_hours: draft.machine_hours,
                created_at: chrono::Utc::now(),
                status: TransactionStatus::Initiated,
            };
            self.current = Some(tx.id);
            self.rows.lock().unwrap().insert(tx.id, tx.clone());
            Ok(tx)
        }

        async fn update_liters(&mut self, id: TransactionId, liters: f64) -> Result<()> {
            let mut rows = self.rows.lock().unwrap();
            let tx = rows.get_mut(&id).ok_or(Error::NotFound)?;
            tx.dispensed_liters = liters;
            if tx.status == TransactionStatus::Initiated {
                tx.status = TransactionStatus::InProgress;
            }
            Ok(())
        }

        async fn add_dispensed(&mut self, _liters: f64) -> Result<()> {
            let id = self.current.ok_or(Error::NotFound)?;
            let mut rows = self.rows.lock().unwrap();
            let tx = rows.get_mut(&id).ok_or(Error::NotFound)?;
            tx.status = TransactionStatus::Completed;
            Ok(())
        }

        async fn delete_transaction(&mut self, id: TransactionId) -> Result<()> {
            self.rows.lock().unwrap().remove(&id).ok_or(Error::NotFound)?;
            if self.current == Some(id) {
                self.current = None;
            }
            Ok(())
        }

        async fn clear_incomplete(&mut self) -> Result<()> {
            let current = self.current;
            let mut rows = self.rows.lock().unwrap();
            rows.retain(|id, tx| {
                Some(*id) == current
                    || !matches!(tx.status, TransactionStatus::Initiated | TransactionStatus::InProgress)
            });
            self.current = None;
            Ok(())
        }

        async fn flag_needs_review(&mut self, id: TransactionId, _reason: String) -> Result<()> {
            let mut rows = self.rows.lock().unwrap();
            let tx = rows.get_mut(&id).ok_or(Error::NotFound)?;
            tx.status = TransactionStatus::NeedsReview;
            Ok(())
        }
    }

    const TAG: &str = "E200001D8914005717701BFC";

    fn vehicle(capacity: f64) -> VehicleRecord {
        VehicleRecord {
            tag: Tag::Present(TAG.to_string()),
            fleet_number: String::from("42"),
            tank_capacity_liters: capacity,
            current_machine_hours: 2013,
        }
    }

    fn harness(
        capacity: f64,
    ) -> (
        Supervisor<FakeNozzle, FakeDirectory, FakeStore>,
        FakeNozzleHandle,
        mpsc::Sender<OperatorCommand>,
        watch::Receiver<StateSnapshot>,
        Arc<StdMutex<HashMap<TransactionId, Transaction>>>,
    ) {
        let (nozzle, handle) = fake_nozzle();
        let mut tags = HashMap::new();
        tags.insert(TAG.to_string(), vehicle(capacity));
        let directory = FakeDirectory { tags };
        let store = FakeStore::default();
        let rows = store.rows.clone();
        let limits = Limits::default();
        let nozzle_id = NozzleId::from_str("0076").unwrap();

        let (sup, operator_tx, snapshot_rx) = Supervisor::new(nozzle, directory, store, limits, nozzle_id, 1);

        (sup, handle, operator_tx, snapshot_rx, rows)
    }

    async fn fill(operator_tx: &mpsc::Sender<OperatorCommand>) -> OperatorResult<StateSnapshot> {
        let (tx, rx) = oneshot::channel();
        operator_tx.send(OperatorCommand::Fill(tx)).await.unwrap();
        rx.await.unwrap()
    }

    async fn drf_submit(operator_tx: &mpsc::Sender<OperatorCommand>, kilometers: i64) -> OperatorResult<StateSnapshot> {
        let (tx, rx) = oneshot::channel();
        operator_tx.send(OperatorCommand::DrfSubmit { kilometers, reply: tx }).await.unwrap();
        rx.await.unwrap()
    }

    async fn poll(operator_tx: &mpsc::Sender<OperatorCommand>) -> StateSnapshot {
        let (tx, rx) = oneshot::channel();
        operator_tx.send(OperatorCommand::PollState(tx)).await.unwrap();
        rx.await.unwrap()
    }

    async fn force_stop(operator_tx: &mpsc::Sender<OperatorCommand>) -> OperatorResult<StateSnapshot> {
        let (tx, rx) = oneshot::channel();
        operator_tx.send(OperatorCommand::ForceStop(tx)).await.unwrap();
        rx.await.unwrap()
    }

    // ---- tests ----------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn fill_issues_rfid_get_and_enters_awaiting_first_rfid() {
        let (sup, handle, operator_tx, _snapshot_rx, _rows) = harness(100.0);
        tokio::spawn(sup.run());

        let snap = fill(&operator_tx).await.unwrap();
        assert_eq!(snap.state, "AwaitingFirstRfid");
        assert!(handle.commands().iter().any(|c| matches!(c, NozzleCommand::RfidGet(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn second_fill_while_running_is_rejected() {
        let (sup, _handle, operator_tx, _snapshot_rx, _rows) = harness(100.0);
        tokio::spawn(sup.run());

        fill(&operator_tx).await.unwrap();
        let rejected = fill(&operator_tx).await.unwrap_err();
        assert_eq!(rejected.current_state, "AwaitingFirstRfid");
    }

    // R1: a valid tag present in the directory binds the vehicle and
    // advances to AwaitingOdometer.
    #[tokio::test(start_paused = true)]
    async fn valid_tag_binds_vehicle_and_advances_to_awaiting_odometer() {
        let (sup, handle, operator_tx, _snapshot_rx, _rows) = harness(100.0);
        tokio::spawn(sup.run());

        fill(&operator_tx).await.unwrap();
        handle
            .push_unsolicited(NozzleFrame::RfidGet {
                nozzle: NozzleId::from_str("0076").unwrap(),
                tag: Tag::Present(TAG.to_string()),
                battery: 100,
            })
            .await;

        tokio::task::yield_now().await;
        let snap = poll(&operator_tx).await;
        assert_eq!(snap.state, "AwaitingOdometer");
        assert_eq!(snap.vehicle.unwrap().tag, Tag::Present(TAG.to_string()));
    }

    // S2: an unrecognized tag is cleared and polling continues rather
    // than advancing or faulting.
    #[tokio::test(start_paused = true)]
    async fn unknown_tag_keeps_polling_in_awaiting_first_rfid() {
        let (sup, handle, operator_tx, _snapshot_rx, _rows) = harness(100.0);
        tokio::spawn(sup.run());

        fill(&operator_tx).await.unwrap();
        handle
            .push_unsolicited(NozzleFrame::RfidGet {
                nozzle: NozzleId::from_str("0076").unwrap(),
                tag: Tag::Present("AAAAAAAAAAAAAAAAAAAAAAAA".to_string()),
                battery: 100,
            })
            .await;

        tokio::task::yield_now().await;
        let snap = poll(&operator_tx).await;
        assert_eq!(snap.state, "AwaitingFirstRfid");
    }

    // B1: kilometers must be within 0..=1000.
    #[tokio::test(start_paused = true)]
    async fn drf_submit_rejects_out_of_range_kilometers() {
        let (sup, handle, operator_tx, _snapshot_rx, _rows) = harness(100.0);
        tokio::spawn(sup.run());

        fill(&operator_tx).await.unwrap();
        handle
            .push_unsolicited(NozzleFrame::RfidGet {
                nozzle: NozzleId::from_str("0076").unwrap(),
                tag: Tag::Present(TAG.to_string()),
                battery: 100,
            })
            .await;
        tokio::task::yield_now().await;

        assert!(drf_submit(&operator_tx, 1001).await.is_err());
        let accepted = drf_submit(&operator_tx, 1000).await;
        assert!(accepted.is_ok());
    }

    // S1: the full happy-path refill cycle, ending with a persisted
    // transaction and the solenoid opened exactly once and closed
    // exactly once (P2).
    #[tokio::test(start_paused = true)]
    async fn full_refill_cycle_persists_dispensed_liters() {
        let (sup, handle, operator_tx, _snapshot_rx, rows) = harness(100.0);
        tokio::spawn(sup.run());

        fill(&operator_tx).await.unwrap();
        handle
            .push_unsolicited(NozzleFrame::RfidGet {
                nozzle: NozzleId::from_str("0076").unwrap(),
                tag: Tag::Present(TAG.to_string()),
                battery: 100,
            })
            .await;
        tokio::task::yield_now().await;

        handle.script(NozzleFrame::MeterRead { liters: 0.0 });
        drf_submit(&operator_tx, 250).await.unwrap();
        tokio::time::advance(READING_FIRST_METER_ATTEMPT_TIMEOUT).await;

        handle
            .push_unsolicited(NozzleFrame::RfidMatch {
                nozzle: NozzleId::from_str("0076").unwrap(),
                seq: 1,
            })
            .await;
        tokio::task::yield_now().await;

        let mid = poll(&operator_tx).await;
        assert_eq!(mid.state, "Dispensing");

        handle.push_unsolicited(NozzleFrame::MeterRead { liters: 4.1 }).await;
        handle.push_unsolicited(NozzleFrame::MeterRead { liters: 9.0 }).await;
        handle.push_unsolicited(NozzleFrame::MeterRead { liters: 12.3 }).await;
        tokio::task::yield_now().await;
        // The repeat must be >= meter_stability_duration (5s) apart for
        // the filter to call it stable (R2).
        tokio::time::advance(Duration::from_secs(5)).await;
        handle.push_unsolicited(NozzleFrame::MeterRead { liters: 12.3 }).await;
        tokio::task::yield_now().await;

        let finished = force_stop(&operator_tx).await.unwrap();
        assert_eq!(finished.state, "FinalMeterRead");

        // FinalMeterRead retries twice at FINAL_METER_TIMEOUT before
        // finalizing on the third deadline.
        tokio::time::advance(FINAL_METER_TIMEOUT * 3 + Duration::from_secs(1)).await;

        let final_snap = poll(&operator_tx).await;
        assert_eq!(final_snap.state, "Idle");

        let commands = handle.commands();
        let opens = commands.iter().filter(|c| matches!(c, NozzleCommand::SetSolenoid(_, true))).count();
        let closes = commands.iter().filter(|c| matches!(c, NozzleCommand::SetSolenoid(_, false))).count();
        assert_eq!(opens, 1);
        assert!(closes >= opens, "every open must be matched by a close (P2)");
        assert!(matches!(commands.last(), Some(NozzleCommand::SetSolenoid(_, false))));

        let saved = rows.lock().unwrap();
        assert_eq!(saved.len(), 1, "finalize must keep the persisted transaction, not sweep it away");
        let saved_tx = saved.values().next().unwrap();
        assert_eq!(saved_tx.status, TransactionStatus::Completed);
    }

    // S4/P4: a 0-liter force-stop deletes the transaction instead of
    // persisting it.
    #[tokio::test(start_paused = true)]
    async fn zero_liter_force_stop_leaves_no_transaction() {
        let (sup, handle, operator_tx, _snapshot_rx, rows) = harness(100.0);
        tokio::spawn(sup.run());

        fill(&operator_tx).await.unwrap();
        handle
            .push_unsolicited(NozzleFrame::RfidGet {
                nozzle: NozzleId::from_str("0076").unwrap(),
                tag: Tag::Present(TAG.to_string()),
                battery: 100,
            })
            .await;
        tokio::task::yield_now().await;

        handle.script(NozzleFrame::MeterRead { liters: 0.0 });
        drf_submit(&operator_tx, 250).await.unwrap();
        tokio::time::advance(READING_FIRST_METER_ATTEMPT_TIMEOUT).await;

        handle
            .push_unsolicited(NozzleFrame::RfidMatch {
                nozzle: NozzleId::from_str("0076").unwrap(),
                seq: 1,
            })
            .await;
        tokio::task::yield_now().await;

        let snap = force_stop(&operator_tx).await.unwrap();
        assert_eq!(snap.state, "AwaitingOperatorAck");
        assert!(rows.lock().unwrap().is_empty(), "a 0-liter force-stop must delete the draft transaction");
    }

    // B3: an alarm during Dispensing always yields Interrupted, even
    // if a meter_read reply is also pending.
    #[tokio::test(start_paused = true)]
    async fn rfid_alarm_during_dispensing_always_interrupts() {
        let (sup, handle, operator_tx, _snapshot_rx, _rows) = harness(100.0);
        tokio::spawn(sup.run());

        fill(&operator_tx).await.unwrap();
        handle
            .push_unsolicited(NozzleFrame::RfidGet {
                nozzle: NozzleId::from_str("0076").unwrap(),
                tag: Tag::Present(TAG.to_string()),
                battery: 100,
            })
            .await;
        tokio::task::yield_now().await;

        handle.script(NozzleFrame::MeterRead { liters: 0.0 });
        drf_submit(&operator_tx, 250).await.unwrap();
        tokio::time::advance(READING_FIRST_METER_ATTEMPT_TIMEOUT).await;

        handle
            .push_unsolicited(NozzleFrame::RfidMatch {
                nozzle: NozzleId::from_str("0076").unwrap(),
                seq: 1,
            })
            .await;
        tokio::task::yield_now().await;

        handle.push_unsolicited(NozzleFrame::RfidAlarm { nozzle: NozzleId::from_str("0076").unwrap() }).await;
        handle.push_unsolicited(NozzleFrame::MeterRead { liters: 9.9 }).await;
        tokio::task::yield_now().await;

        let snap = poll(&operator_tx).await;
        assert_eq!(snap.state, "Interrupted");
        assert!(
            matches!(handle.commands().last(), Some(NozzleCommand::SetSolenoid(_, false))),
            "losing tag contact must close the solenoid (I1)"
        );
    }
}
