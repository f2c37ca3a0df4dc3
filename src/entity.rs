//! Domain entity kinds and per-record sync state.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Entity families served by the clinic API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
  Organization,
  Patient,
  Employee,
  Appointment,
  Schedule,
  Department,
  Notification,
  Other,
}

impl EntityKind {
  pub const ALL: [EntityKind; 8] = [
    EntityKind::Organization,
    EntityKind::Patient,
    EntityKind::Employee,
    EntityKind::Appointment,
    EntityKind::Schedule,
    EntityKind::Department,
    EntityKind::Notification,
    EntityKind::Other,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Organization => "organization",
      Self::Patient => "patient",
      Self::Employee => "employee",
      Self::Appointment => "appointment",
      Self::Schedule => "schedule",
      Self::Department => "department",
      Self::Notification => "notification",
      Self::Other => "other",
    }
  }

  /// Map a URL path segment such as `organizations` to its entity kind.
  pub fn from_segment(segment: &str) -> Self {
    match segment.to_ascii_lowercase().as_str() {
      "organizations" | "organization" => Self::Organization,
      "patients" | "patient" => Self::Patient,
      "employees" | "employee" | "staff" => Self::Employee,
      "appointments" | "appointment" => Self::Appointment,
      "schedules" | "schedule" => Self::Schedule,
      "departments" | "department" => Self::Department,
      "notifications" | "notification" => Self::Notification,
      _ => Self::Other,
    }
  }
}

impl fmt::Display for EntityKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for EntityKind {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::ALL
      .iter()
      .find(|kind| kind.as_str() == s)
      .copied()
      .ok_or_else(|| format!("unknown entity kind '{}'", s))
  }
}

/// Bookkeeping tag for a record touched by an optimistic write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
  Synced,
  Pending,
  /// The server never accepted the queued write
  Conflict,
}

impl SyncState {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Synced => "synced",
      Self::Pending => "pending",
      Self::Conflict => "conflict",
    }
  }
}

impl FromStr for SyncState {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "synced" => Ok(Self::Synced),
      "pending" => Ok(Self::Pending),
      "conflict" => Ok(Self::Conflict),
      other => Err(format!("unknown sync state '{}'", other)),
    }
  }
}
