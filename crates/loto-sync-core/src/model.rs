//! Entity records and their row codecs.
//!
//! Every table is a flat map of column name to scalar value on the wire. Each
//! entity type implements [`Entity`], which binds it to its [`Table`] at compile
//! time and converts between the typed record and its [`Row`].

use crate::error::{Result, StoreError};
use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// A flat record: column name to scalar value.
pub type Row = serde_json::Map<String, Value>;

/// Replicated tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Breakers,
    Locks,
    LockInventory,
    Personnel,
    Plans,
    History,
    /// Offline writes awaiting replay; lives only in the local cache
    PendingOperations,
}

impl Table {
    pub const ALL: [Table; 7] = [
        Table::Breakers,
        Table::Locks,
        Table::LockInventory,
        Table::Personnel,
        Table::Plans,
        Table::History,
        Table::PendingOperations,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Breakers => "breakers",
            Table::Locks => "locks",
            Table::LockInventory => "lock_inventory",
            Table::Personnel => "personnel",
            Table::Plans => "plans",
            Table::History => "history",
            Table::PendingOperations => "pending_operations",
        }
    }

    /// Tables that never exist on the remote store.
    pub fn is_local_only(&self) -> bool {
        matches!(self, Table::PendingOperations)
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Table {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "breakers" | "breaker" => Ok(Table::Breakers),
            "locks" | "lock" => Ok(Table::Locks),
            "lock_inventory" | "inventory" => Ok(Table::LockInventory),
            "personnel" => Ok(Table::Personnel),
            "plans" | "plan" => Ok(Table::Plans),
            "history" => Ok(Table::History),
            "pending_operations" | "pending" => Ok(Table::PendingOperations),
            other => Err(StoreError::UnknownTable(other.to_string())),
        }
    }
}

/// Kind of write issued through the replicated store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOp {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for WriteOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WriteOp::Insert => "insert",
            WriteOp::Update => "update",
            WriteOp::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// Typed row codec bound to one table.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const TABLE: Table;

    fn id(&self) -> Option<i64>;

    fn set_id(&mut self, id: i64);

    /// Stamp write-time columns before the record leaves for either store.
    fn prepare_for_write(&mut self, _op: WriteOp, _now: DateTime<Utc>) {}

    fn to_row(&self) -> Result<Row> {
        let value = serde_json::to_value(self).map_err(|source| StoreError::Codec {
            table: Self::TABLE,
            source,
        })?;
        match value {
            Value::Object(row) => Ok(row),
            _ => Err(StoreError::NotARow(Self::TABLE)),
        }
    }

    fn from_row(row: Row) -> Result<Self> {
        serde_json::from_value(Value::Object(row)).map_err(|source| StoreError::Codec {
            table: Self::TABLE,
            source,
        })
    }
}

/// Read the integer primary key out of a raw row.
pub fn row_id(row: &Row) -> Option<i64> {
    row.get("id").and_then(Value::as_i64)
}

/// Breaker position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakerState {
    On,
    Off,
    /// Locked out; the only state in which `lock_key` is meaningful
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Breaker {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub name: String,
    #[serde(default)]
    pub zone: Option<String>,
    #[serde(default)]
    pub subzone: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub special_use: Option<String>,
    pub state: BreakerState,
    #[serde(default)]
    pub lock_key: Option<String>,
    /// Name of the upstream general breaker, if any
    #[serde(default)]
    pub general_breaker: Option<String>,
    #[serde(default)]
    pub date: Option<NaiveDate>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

impl Breaker {
    pub fn new(name: impl Into<String>, state: BreakerState) -> Self {
        Self {
            id: None,
            name: name.into(),
            zone: None,
            subzone: None,
            location: None,
            special_use: None,
            state,
            lock_key: None,
            general_breaker: None,
            date: None,
            last_updated: None,
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = Some(zone.into());
        self
    }

    pub fn with_lock_key(mut self, key: impl Into<String>) -> Self {
        self.lock_key = Some(key.into());
        self
    }

    /// The key this breaker currently holds: state is Closed and the key is non-empty.
    pub fn active_lock_key(&self) -> Option<&str> {
        if self.state != BreakerState::Closed {
            return None;
        }
        self.lock_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
    }

    pub fn holds_lock(&self) -> bool {
        self.active_lock_key().is_some()
    }
}

impl Entity for Breaker {
    const TABLE: Table = Table::Breakers;

    fn id(&self) -> Option<i64> {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = Some(id);
    }

    fn prepare_for_write(&mut self, _op: WriteOp, now: DateTime<Utc>) {
        if self.last_updated.is_none() {
            self.last_updated = Some(now);
        }
    }
}

/// A physical padlock; `used`/`assigned_to` are derived from breakers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lock {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    /// Business key referenced by `Breaker::lock_key`
    pub key_number: String,
    #[serde(default)]
    pub zone: Option<String>,
    #[serde(default)]
    pub used: bool,
    #[serde(default)]
    pub assigned_to: Option<String>,
    #[serde(default)]
    pub remarks: Option<String>,
}

impl Lock {
    pub fn new(key_number: impl Into<String>) -> Self {
        Self {
            id: None,
            key_number: key_number.into(),
            zone: None,
            used: false,
            assigned_to: None,
            remarks: None,
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.id = Some(id);
        self
    }

    pub fn matches_key(&self, key: &str) -> bool {
        self.key_number.trim() == key.trim()
    }
}

impl Entity for Lock {
    const TABLE: Table = Table::Locks;

    fn id(&self) -> Option<i64> {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = Some(id);
    }
}

/// Singleton capacity record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockInventory {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub total_capacity: i64,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl LockInventory {
    pub const SINGLETON_ID: i64 = 1;

    pub fn new(total_capacity: i64) -> Self {
        Self {
            id: Some(Self::SINGLETON_ID),
            total_capacity,
            updated_at: None,
        }
    }
}

impl Entity for LockInventory {
    const TABLE: Table = Table::LockInventory;

    fn id(&self) -> Option<i64> {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = Some(id);
    }

    fn prepare_for_write(&mut self, _op: WriteOp, now: DateTime<Utc>) {
        self.updated_at = Some(now);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Personnel {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub name: String,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub certification: Option<String>,
    #[serde(default)]
    pub certification_expires: Option<NaiveDate>,
}

impl Personnel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            company: None,
            role: None,
            certification: None,
            certification_expires: None,
        }
    }
}

impl Entity for Personnel {
    const TABLE: Table = Table::Personnel;

    fn id(&self) -> Option<i64> {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = Some(id);
    }
}

/// Plan document metadata; the file itself lives in object storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub name: String,
    #[serde(default)]
    pub zone: Option<String>,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub uploaded_at: Option<DateTime<Utc>>,
}

impl Plan {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            zone: None,
            file_path: None,
            uploaded_at: None,
        }
    }
}

impl Entity for Plan {
    const TABLE: Table = Table::Plans;

    fn id(&self) -> Option<i64> {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = Some(id);
    }
}

/// Append-only audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default)]
    pub breaker_id: Option<i64>,
    pub action: String,
    pub user_mode: String,
    #[serde(default)]
    pub details: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl HistoryEntry {
    pub fn new(action: impl Into<String>, user_mode: impl Into<String>) -> Self {
        Self {
            id: None,
            breaker_id: None,
            action: action.into(),
            user_mode: user_mode.into(),
            details: None,
            timestamp: None,
        }
    }

    pub fn for_breaker(mut self, breaker_id: i64) -> Self {
        self.breaker_id = Some(breaker_id);
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

impl Entity for HistoryEntry {
    const TABLE: Table = Table::History;

    fn id(&self) -> Option<i64> {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = Some(id);
    }

    fn prepare_for_write(&mut self, _op: WriteOp, now: DateTime<Utc>) {
        if self.timestamp.is_none() {
            self.timestamp = Some(now);
        }
    }
}

/// A write accepted locally while the remote store was unreachable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingWrite {
    /// Queue sequence number
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub op_id: uuid::Uuid,
    pub table: Table,
    pub op: WriteOp,
    #[serde(default)]
    pub record_id: Option<i64>,
    pub row: Row,
    pub queued_at: DateTime<Utc>,
}

impl Entity for PendingWrite {
    const TABLE: Table = Table::PendingOperations;

    fn id(&self) -> Option<i64> {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = Some(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn table_names_round_trip_through_from_str() {
        for table in Table::ALL {
            assert_eq!(table.as_str().parse::<Table>().unwrap(), table);
        }
        assert_eq!("inventory".parse::<Table>().unwrap(), Table::LockInventory);
        assert!(matches!(
            "fuses".parse::<Table>(),
            Err(StoreError::UnknownTable(_))
        ));
    }

    #[test]
    fn breaker_holds_lock_only_when_closed_with_key() {
        let closed = Breaker::new("B1", BreakerState::Closed).with_lock_key(" K1 ");
        assert_eq!(closed.active_lock_key(), Some("K1"));

        let open = Breaker::new("B2", BreakerState::On).with_lock_key("K1");
        assert!(!open.holds_lock());

        let blank = Breaker::new("B3", BreakerState::Closed).with_lock_key("   ");
        assert!(!blank.holds_lock());
    }

    #[test]
    fn breaker_row_uses_flat_columns() {
        let breaker = Breaker::new("B1", BreakerState::Closed)
            .with_id(7)
            .with_lock_key("K1");
        let row = breaker.to_row().unwrap();

        assert_eq!(row["id"], json!(7));
        assert_eq!(row["state"], json!("Closed"));
        assert_eq!(row["lock_key"], json!("K1"));
        assert_eq!(row["special_use"], Value::Null);
    }

    #[test]
    fn insert_row_omits_missing_id() {
        let row = Personnel::new("Dana").to_row().unwrap();
        assert!(!row.contains_key("id"));
    }

    #[test]
    fn breaker_decodes_remote_row_with_missing_optionals() {
        let row = json!({
            "id": 3,
            "name": "TD-04",
            "state": "Off",
            "last_updated": "2024-03-01T10:00:00+00:00"
        });
        let Value::Object(row) = row else { unreachable!() };

        let breaker = Breaker::from_row(row).unwrap();
        assert_eq!(breaker.id, Some(3));
        assert_eq!(breaker.state, BreakerState::Off);
        assert!(breaker.lock_key.is_none());
        assert!(breaker.last_updated.is_some());
    }

    #[test]
    fn breaker_stamps_last_updated_only_when_absent() {
        let now = Utc::now();
        let mut fresh = Breaker::new("B1", BreakerState::On);
        fresh.prepare_for_write(WriteOp::Update, now);
        assert_eq!(fresh.last_updated, Some(now));

        let earlier = now - chrono::Duration::hours(1);
        let mut stamped = Breaker::new("B1", BreakerState::On);
        stamped.last_updated = Some(earlier);
        stamped.prepare_for_write(WriteOp::Update, now);
        assert_eq!(stamped.last_updated, Some(earlier));
    }

    #[test]
    fn unknown_state_is_a_codec_error() {
        let Value::Object(row) = json!({"id": 1, "name": "B", "state": "Tripped"}) else {
            unreachable!()
        };
        assert!(matches!(
            Breaker::from_row(row),
            Err(StoreError::Codec {
                table: Table::Breakers,
                ..
            })
        ));
    }
}
