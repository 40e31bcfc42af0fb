// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The seam between backup/restore and the live configuration-management
//! store.
//!
//! Export and restore never talk to the store's wire protocol directly; they
//! go through these traits, parameterized over the closed set of record
//! kinds. Production implementations wrap the real store; [`mem::MemStore`]
//! backs the test suites.

use serde_json::Value;
use std::fmt;

/// The closed set of record kinds a backup snapshots.
///
/// Data-bag items are handled separately through [`DataBagStore`] because
/// they are nested one level deeper (`<bag>/<item>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RecordKind {
    Client,
    Node,
    Role,
}

impl RecordKind {
    pub const ALL: [RecordKind; 3] = [
        RecordKind::Client,
        RecordKind::Node,
        RecordKind::Role,
    ];

    /// Subdirectory of `knife/` this kind is stored under in an archive.
    pub fn dir_name(&self) -> &'static str {
        match self {
            RecordKind::Client => "clients",
            RecordKind::Node => "nodes",
            RecordKind::Role => "roles",
        }
    }

    /// Type tag written into each exported record, identifying its origin.
    pub fn type_tag(&self) -> &'static str {
        match self {
            RecordKind::Client => "Chef::ApiClient",
            RecordKind::Node => "Chef::Node",
            RecordKind::Role => "Chef::Role",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecordKind::Client => "client",
            RecordKind::Node => "node",
            RecordKind::Role => "role",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to list {kind} records: {reason}")]
    List { kind: RecordKind, reason: String },

    #[error("failed to load {kind} {name:?}: {reason}")]
    Load { kind: RecordKind, name: String, reason: String },

    #[error("failed to save {kind} {name:?}: {reason}")]
    Save { kind: RecordKind, name: String, reason: String },

    #[error("failed to enumerate data bags: {reason}")]
    Bags { reason: String },

    #[error("failed to load data bag item {bag}/{item}: {reason}")]
    BagItem { bag: String, item: String, reason: String },

    #[error("failed to create proposal {barclamp}-{instance}: {reason}")]
    Proposal { barclamp: String, instance: String, reason: String },
}

/// Enumerate, load, and save records of the closed kinds.
pub trait RecordStore {
    fn list(&self, kind: RecordKind) -> Result<Vec<String>, StoreError>;
    fn load(&self, kind: RecordKind, name: &str) -> Result<Value, StoreError>;
    fn save(
        &self,
        kind: RecordKind,
        name: &str,
        record: &Value,
    ) -> Result<(), StoreError>;
}

/// Enumerate and load data-bag items.
pub trait DataBagStore {
    fn bag_names(&self) -> Result<Vec<String>, StoreError>;
    fn bag_items(&self, bag: &str) -> Result<Vec<String>, StoreError>;
    fn load_item(&self, bag: &str, item: &str) -> Result<Value, StoreError>;
}

/// Materialize recovered proposals into the live store.
pub trait ProposalStore {
    fn create_proposal(
        &self,
        barclamp: &str,
        instance: &str,
        properties: Value,
    ) -> Result<(), StoreError>;
}

pub mod mem {
    //! An in-memory store used by the test suites.

    use super::*;
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MemStore {
        records: Mutex<BTreeMap<(RecordKind, String), Value>>,
        bags: Mutex<BTreeMap<String, BTreeMap<String, Value>>>,
        proposals: Mutex<BTreeMap<(String, String), Value>>,
        // Records whose load is forced to fail, to exercise skip paths.
        broken: Mutex<BTreeSet<(RecordKind, String)>>,
    }

    impl MemStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn insert_record(
            &self,
            kind: RecordKind,
            name: &str,
            record: Value,
        ) {
            self.records
                .lock()
                .unwrap()
                .insert((kind, name.to_string()), record);
        }

        pub fn insert_bag_item(&self, bag: &str, item: &str, value: Value) {
            self.bags
                .lock()
                .unwrap()
                .entry(bag.to_string())
                .or_default()
                .insert(item.to_string(), value);
        }

        pub fn break_record(&self, kind: RecordKind, name: &str) {
            self.broken.lock().unwrap().insert((kind, name.to_string()));
        }

        pub fn record(&self, kind: RecordKind, name: &str) -> Option<Value> {
            self.records
                .lock()
                .unwrap()
                .get(&(kind, name.to_string()))
                .cloned()
        }

        pub fn record_names(&self, kind: RecordKind) -> Vec<String> {
            self.records
                .lock()
                .unwrap()
                .keys()
                .filter(|(k, _)| *k == kind)
                .map(|(_, name)| name.clone())
                .collect()
        }

        pub fn proposal(
            &self,
            barclamp: &str,
            instance: &str,
        ) -> Option<Value> {
            self.proposals
                .lock()
                .unwrap()
                .get(&(barclamp.to_string(), instance.to_string()))
                .cloned()
        }

        pub fn proposal_count(&self) -> usize {
            self.proposals.lock().unwrap().len()
        }
    }

    impl RecordStore for MemStore {
        fn list(&self, kind: RecordKind) -> Result<Vec<String>, StoreError> {
            Ok(self.record_names(kind))
        }

        fn load(
            &self,
            kind: RecordKind,
            name: &str,
        ) -> Result<Value, StoreError> {
            if self.broken.lock().unwrap().contains(&(kind, name.to_string()))
            {
                return Err(StoreError::Load {
                    kind,
                    name: name.to_string(),
                    reason: "record marked broken".to_string(),
                });
            }
            self.record(kind, name).ok_or_else(|| StoreError::Load {
                kind,
                name: name.to_string(),
                reason: "no such record".to_string(),
            })
        }

        fn save(
            &self,
            kind: RecordKind,
            name: &str,
            record: &Value,
        ) -> Result<(), StoreError> {
            self.insert_record(kind, name, record.clone());
            Ok(())
        }
    }

    impl DataBagStore for MemStore {
        fn bag_names(&self) -> Result<Vec<String>, StoreError> {
            Ok(self.bags.lock().unwrap().keys().cloned().collect())
        }

        fn bag_items(&self, bag: &str) -> Result<Vec<String>, StoreError> {
            Ok(self
                .bags
                .lock()
                .unwrap()
                .get(bag)
                .map(|items| items.keys().cloned().collect())
                .unwrap_or_default())
        }

        fn load_item(
            &self,
            bag: &str,
            item: &str,
        ) -> Result<Value, StoreError> {
            self.bags
                .lock()
                .unwrap()
                .get(bag)
                .and_then(|items| items.get(item))
                .cloned()
                .ok_or_else(|| StoreError::BagItem {
                    bag: bag.to_string(),
                    item: item.to_string(),
                    reason: "no such item".to_string(),
                })
        }
    }

    impl ProposalStore for MemStore {
        fn create_proposal(
            &self,
            barclamp: &str,
            instance: &str,
            properties: Value,
        ) -> Result<(), StoreError> {
            self.proposals.lock().unwrap().insert(
                (barclamp.to_string(), instance.to_string()),
                properties,
            );
            Ok(())
        }
    }
}
