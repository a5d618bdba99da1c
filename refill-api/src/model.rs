//! The data model shared by the supervisor and its collaborators.
//!
//! These types cross crate boundaries (nozzle port, directory client,
//! transaction store all speak them) so they live here rather than in
//! `refilld`.

use crate::error::Error;
use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;

/// A four-digit decimal nozzle identifier. Stable for the
/// supervisor's lifetime; the first argument of every nozzle command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NozzleId(pub [u8; 4]);

impl NozzleId {
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or("0000")
    }
}

impl fmt::Display for NozzleId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for NozzleId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() == 4 && s.bytes().all(|b| b.is_ascii_digit()) {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(s.as_bytes());
            Ok(NozzleId(buf))
        } else {
            Err(Error::ConfigError(format!(
                "nozzle id {:?} isn't 4 decimal digits",
                s
            )))
        }
    }
}

/// An RFID tag: 24 hex characters, or the literal `-` meaning "no tag
/// in field." Casing is preserved as received; tags compare for exact
/// equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Tag {
    None,
    Present(String),
}

impl Tag {
    pub fn parse(raw: &str) -> Option<Tag> {
        if raw == "-" {
            Some(Tag::None)
        } else if raw.len() == 24 && raw.bytes().all(|b| b.is_ascii_hexdigit()) {
            Some(Tag::Present(raw.to_owned()))
        } else {
            None
        }
    }

    pub fn is_present(&self) -> bool {
        matches!(self, Tag::Present(_))
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Tag::None => write!(f, "-"),
            Tag::Present(s) => write!(f, "{}", s),
        }
    }
}

/// A vehicle record, as returned by the fleet directory for tags
/// permitted at this tank.
#[derive(Debug, Clone, PartialEq)]
pub struct VehicleRecord {
    pub tag: Tag,
    pub fleet_number: String,
    pub tank_capacity_liters: f64,
    pub current_machine_hours: u32,
}

pub type TransactionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Initiated,
    InProgress,
    Completed,
    Deleted,
    NeedsReview,
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            TransactionStatus::Initiated => "initiated",
            TransactionStatus::InProgress => "in_progress",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Deleted => "deleted",
            TransactionStatus::NeedsReview => "needs_review",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewTransaction {
    pub tag: Tag,
    pub fleet_number: String,
    pub start_meter: f64,
    pub machine_hours: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub id: TransactionId,
    pub tag: Tag,
    pub fleet_number: String,
    pub start_meter: f64,
    pub dispensed_liters: f64,
    pub machine_hours: u32,
    pub created_at: DateTime<Utc>,
    pub status: TransactionStatus,
}
