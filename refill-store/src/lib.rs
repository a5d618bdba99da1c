//! File-backed persistence for refill transactions (spec §3, I4, I5).
//!
//! Every mutation rewrites the whole transaction table to disk. This
//! mirrors `persist_step_liters`: the supervisor calls `update_liters`
//! at a bounded cadence while dispensing, so a crash mid-fill loses at
//! most that much volume from the record, not the whole transaction.
//!
//! Unlike the simplest in-memory backend, this one must survive a
//! process restart -- `clear_incomplete` exists specifically to sweep
//! out transactions a previous run never finished.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use refill_api::model::{NewTransaction, Tag, Transaction, TransactionId, TransactionStatus};
use refill_api::{Error, Result, TransactionStore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

#[derive(Debug, Serialize, Deserialize)]
struct Record {
    id: TransactionId,
    tag: Option<String>,
    fleet_number: String,
    start_meter: f64,
    dispensed_liters: f64,
    machine_hours: u32,
    created_at: DateTime<Utc>,
    status: String,
}

impl From<&Transaction> for Record {
    fn from(t: &Transaction) -> Self {
        Record {
            id: t.id,
            tag: match &t.tag {
                Tag::None => None,
                Tag::Present(s) => Some(s.clone()),
            },
            fleet_number: t.fleet_number.clone(),
            start_meter: t.start_meter,
            dispensed_liters: t.dispensed_liters,
            machine_hours: t.machine_hours,
            created_at: t.created_at,
            status: t.status.to_string(),
        }
    }
}

impl Record {
    fn into_transaction(self) -> Transaction {
        Transaction {
            id: self.id,
            tag: match self.tag {
                None => Tag::None,
                Some(s) => Tag::Present(s),
            },
            fleet_number: self.fleet_number,
            start_meter: self.start_meter,
            dispensed_liters: self.dispensed_liters,
            machine_hours: self.machine_hours,
            created_at: self.created_at,
            status: status_from_str(&self.status),
        }
    }
}

fn status_from_str(s: &str) -> TransactionStatus {
    match s {
        "initiated" => TransactionStatus::Initiated,
        "in_progress" => TransactionStatus::InProgress,
        "completed" => TransactionStatus::Completed,
        "deleted" => TransactionStatus::Deleted,
        _ => TransactionStatus::NeedsReview,
    }
}

struct State {
    table: HashMap<TransactionId, Transaction>,
    next_id: TransactionId,
    current: Option<TransactionId>,
    tank_total: f64,
}

pub struct FileTransactionStore {
    path: PathBuf,
    state: Mutex<State>,
}

impl FileTransactionStore {
    /// Loads the table from `path` if it exists, starting empty
    /// otherwise. Doesn't fail on a missing file -- a fresh
    /// installation has none yet.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let table = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let records: Vec<Record> = serde_json::from_slice(&bytes)
                    .map_err(|e| Error::BackendError(format!("corrupt transaction store: {}", e)))?;
                records
                    .into_iter()
                    .map(Record::into_transaction)
                    .map(|t| (t.id, t))
                    .collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                return Err(Error::BackendError(format!(
                    "couldn't read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let next_id = table.keys().copied().max().map(|n| n + 1).unwrap_or(1);

        Ok(FileTransactionStore {
            path,
            state: Mutex::new(State {
                table,
                next_id,
                current: None,
                tank_total: 0.0,
            }),
        })
    }

    // Rewrites the whole table. Simple and correct for the table
    // sizes this system deals with (one active transaction plus a
    // short tail of recently completed ones).
    async fn flush(&self, records: Vec<Record>) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&records)
            .map_err(|e| Error::BackendError(format!("couldn't encode transactions: {}", e)))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }
        }

        tokio::fs::write(&self.path, bytes)
            .await
            .map_err(|e| Error::BackendError(format!("couldn't write {}: {}", self.path.display(), e)))
    }

    fn snapshot(state: &State) -> Vec<Record> {
        state.table.values().map(Record::from).collect()
    }
}

#[async_trait]
impl TransactionStore for FileTransactionStore {
    async fn create_transaction(&mut self, draft: NewTransaction) -> Result<Transaction> {
        let records = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| Error::BackendError(String::from("transaction table lock poisoned")))?;

            let id = state.next_id;
            state.next_id += 1;

            let txn = Transaction {
                id,
                tag: draft.tag,
                fleet_number: draft.fleet_number,
                start_meter: draft.start_meter,
                dispensed_liters: 0.0,
                machine_hours: draft.machine_hours,
                created_at: Utc::now(),
                status: TransactionStatus::Initiated,
            };

            state.table.insert(id, txn);
            state.current = Some(id);

            Self::snapshot(&state)
        };

        self.flush(records).await?;

        let state = self
            .state
            .lock()
            .map_err(|_| Error::BackendError(String::from("transaction table lock poisoned")))?;
        let id = state.current.expect("just created a transaction");
        Ok(state.table.get(&id).expect("just inserted").clone())
    }

    async fn update_liters(&mut self, id: TransactionId, liters: f64) -> Result<()> {
        let records = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| Error::BackendError(String::from("transaction table lock poisoned")))?;

            let txn = state.table.get_mut(&id).ok_or(Error::NotFound)?;
            txn.dispensed_liters = liters;
            if txn.status == TransactionStatus::Initiated {
                txn.status = TransactionStatus::InProgress;
            }

            Self::snapshot(&state)
        };

        self.flush(records).await
    }

    async fn add_dispensed(&mut self, liters: f64) -> Result<()> {
        let records = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| Error::BackendError(String::from("transaction table lock poisoned")))?;

            state.tank_total += liters;

            let id = state.current.ok_or(Error::NotFound)?;
            let txn = state.table.get_mut(&id).ok_or(Error::NotFound)?;
            txn.status = TransactionStatus::Completed;

            Self::snapshot(&state)
        };

        self.flush(records).await
    }

    async fn delete_transaction(&mut self, id: TransactionId) -> Result<()> {
        let records = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| Error::BackendError(String::from("transaction table lock poisoned")))?;

            state.table.remove(&id).ok_or(Error::NotFound)?;
            if state.current == Some(id) {
                state.current = None;
            }

            Self::snapshot(&state)
        };

        self.flush(records).await
    }

    async fn clear_incomplete(&mut self) -> Result<()> {
        let records = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| Error::BackendError(String::from("transaction table lock poisoned")))?;

            let current = state.current;
            let stale: Vec<TransactionId> = state
                .table
                .iter()
                .filter(|(id, t)| {
                    Some(**id) != current
                        && matches!(t.status, TransactionStatus::Initiated | TransactionStatus::InProgress)
                })
                .map(|(id, _)| *id)
                .collect();

            for id in &stale {
                warn!("clearing incomplete transaction {} from a prior run", id);
                state.table.remove(id);
            }
            state.current = None;

            Self::snapshot(&state)
        };

        self.flush(records).await
    }

    async fn flag_needs_review(&mut self, id: TransactionId, reason: String) -> Result<()> {
        let records = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| Error::BackendError(String::from("transaction table lock poisoned")))?;

            let txn = state.table.get_mut(&id).ok_or(Error::NotFound)?;
            txn.status = TransactionStatus::NeedsReview;
            warn!("transaction {} flagged for review -- {}", id, reason);

            Self::snapshot(&state)
        };

        self.flush(records).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft() -> NewTransaction {
        NewTransaction {
            tag: Tag::Present("E200001D8914005717701BFC".into()),
            fleet_number: "42".into(),
            start_meter: 1000.0,
            machine_hours: 500,
        }
    }

    #[tokio::test]
    async fn update_liters_then_add_dispensed_completes_the_transaction() {
        let dir = tempdir();
        let mut store = FileTransactionStore::open(dir.join("txns.json")).await.unwrap();

        let txn = store.create_transaction(draft()).await.unwrap();
        assert_eq!(txn.status, TransactionStatus::Initiated);

        store.update_liters(txn.id, 5.0).await.unwrap();
        store.add_dispensed(5.0).await.unwrap();
        store.add_dispensed(3.5).await.unwrap();

        let reloaded = FileTransactionStore::open(dir.join("txns.json")).await.unwrap();
        let state = reloaded.state.lock().unwrap();
        let reloaded_txn = state.table.get(&txn.id).unwrap().clone();
        assert_eq!(reloaded_txn.dispensed_liters, 5.0);
        assert_eq!(reloaded_txn.status, TransactionStatus::Completed);
        assert_eq!(state.tank_total, 8.5);
    }

    #[tokio::test]
    async fn clear_incomplete_drops_stale_but_keeps_needs_review() {
        let dir = tempdir();
        let mut store = FileTransactionStore::open(dir.join("txns.json")).await.unwrap();

        let stale = store.create_transaction(draft()).await.unwrap();
        store.update_liters(stale.id, 2.0).await.unwrap();

        let done = store.create_transaction(draft()).await.unwrap();
        store.update_liters(done.id, 10.0).await.unwrap();
        store.flag_needs_review(done.id, "manual close".into()).await.unwrap();

        store.clear_incomplete().await.unwrap();

        let state = store.state.lock().unwrap();
        assert!(!state.table.contains_key(&stale.id));
        assert!(state.table.contains_key(&done.id));
    }

    #[tokio::test]
    async fn clear_incomplete_keeps_the_transaction_just_completed() {
        let dir = tempdir();
        let mut store = FileTransactionStore::open(dir.join("txns.json")).await.unwrap();

        // A prior run's abandoned draft -- should be swept.
        let stale = store.create_transaction(draft()).await.unwrap();
        store.update_liters(stale.id, 2.0).await.unwrap();

        // The transaction `finalize()` just persisted in this run.
        let done = store.create_transaction(draft()).await.unwrap();
        store.update_liters(done.id, 10.0).await.unwrap();
        store.add_dispensed(10.0).await.unwrap();

        store.clear_incomplete().await.unwrap();

        let state = store.state.lock().unwrap();
        assert!(!state.table.contains_key(&stale.id));
        let done_txn = state.table.get(&done.id).unwrap();
        assert_eq!(done_txn.status, TransactionStatus::Completed);
    }

    #[tokio::test]
    async fn delete_transaction_removes_it() {
        let dir = tempdir();
        let mut store = FileTransactionStore::open(dir.join("txns.json")).await.unwrap();

        let txn = store.create_transaction(draft()).await.unwrap();
        store.delete_transaction(txn.id).await.unwrap();

        assert!(store.delete_transaction(txn.id).await.is_err());
    }

    fn tempdir() -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("refill-store-test-{:?}", std::thread::current().id()));
        p
    }
}
