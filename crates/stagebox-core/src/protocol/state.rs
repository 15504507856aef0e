//! Staged-change data model shared by the daemon and its clients.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use stagebox_macros::{Redact, SecureZeroize};

/// Schema version written into every [`State`].
pub const STATE_VERSION: u32 = 1;

/// The remote store a staged change targets.
///
/// Only used to partition staged state; the daemon never interprets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Service {
    /// Parameter store (plain or secure-string configuration values).
    Param,
    /// Secret store.
    Secret,
}

impl Service {
    /// Every known service, in display order.
    pub const ALL: [Service; 2] = [Service::Param, Service::Secret];

    pub fn as_str(self) -> &'static str {
        match self {
            Service::Param => "param",
            Service::Secret => "secret",
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown service name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown service {0:?} (expected \"param\" or \"secret\")")]
pub struct UnknownService(pub String);

impl FromStr for Service {
    type Err = UnknownService;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "param" | "ssm" | "parameter" => Ok(Service::Param),
            "secret" | "sm" | "secretsmanager" => Ok(Service::Secret),
            other => Err(UnknownService(other.to_string())),
        }
    }
}

/// The kind of change an [`Entry`] stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        })
    }
}

/// Options that only apply to staged deletes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteOptions {
    /// Delete immediately, skipping any recovery window.
    #[serde(default)]
    pub force: bool,
    /// Days the remote store keeps the value recoverable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_window_days: Option<u32>,
}

/// One staged value change for a named resource.
///
/// The value is wiped from memory when the entry is dropped and never
/// appears in `Debug` output. Re-staging replaces the entry wholesale.
#[derive(Clone, PartialEq, Serialize, Deserialize, Redact, SecureZeroize)]
pub struct Entry {
    #[no_zeroize]
    pub operation: Operation,
    #[redact]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[no_zeroize]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_options: Option<DeleteOptions>,
    #[no_zeroize]
    pub staged_at: SystemTime,
    /// Last-modified time of the remote value this change was based on.
    #[no_zeroize]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_modified_at: Option<SystemTime>,
}

impl Entry {
    fn new(operation: Operation, value: Option<String>) -> Self {
        Self {
            operation,
            value,
            description: None,
            delete_options: None,
            staged_at: SystemTime::now(),
            base_modified_at: None,
        }
    }

    /// Stage creation of a resource that does not exist remotely yet.
    pub fn create(value: impl Into<String>) -> Self {
        Self::new(Operation::Create, Some(value.into()))
    }

    /// Stage a new value for an existing resource.
    pub fn update(value: impl Into<String>) -> Self {
        Self::new(Operation::Update, Some(value.into()))
    }

    /// Stage deletion of a resource.
    pub fn delete(options: DeleteOptions) -> Self {
        let mut entry = Self::new(Operation::Delete, None);
        entry.delete_options = Some(options);
        entry
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_base_modified_at(mut self, at: SystemTime) -> Self {
        self.base_modified_at = Some(at);
        self
    }
}

/// One staged set of tag additions and removals for a named resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagEntry {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub add: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub remove: BTreeSet<String>,
    pub staged_at: SystemTime,
}

impl TagEntry {
    pub fn new() -> Self {
        Self {
            add: BTreeMap::new(),
            remove: BTreeSet::new(),
            staged_at: SystemTime::now(),
        }
    }

    /// Stage adding (or overwriting) a tag. Cancels a pending removal of the same key.
    pub fn add(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        self.remove.remove(&key);
        self.add.insert(key, value.into());
        self
    }

    /// Stage removing a tag. Cancels a pending addition of the same key.
    pub fn remove(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        self.add.remove(&key);
        self.remove.insert(key);
        self
    }

    /// Whether the entry changes nothing.
    pub fn is_noop(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }
}

impl Default for TagEntry {
    fn default() -> Self {
        Self::new()
    }
}

/// Staged entries for one service, keyed by resource name.
pub type EntryMap = BTreeMap<String, Entry>;
/// Staged tag changes for one service, keyed by resource name.
pub type TagMap = BTreeMap<String, TagEntry>;

static NO_ENTRIES: EntryMap = BTreeMap::new();
static NO_TAGS: TagMap = BTreeMap::new();

/// The full staging snapshot for one (account, region) scope.
///
/// Both partitions always hold a (possibly empty) map for every
/// [`Service`], including after deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "StateRepr")]
pub struct State {
    pub version: u32,
    entries: BTreeMap<Service, EntryMap>,
    tags: BTreeMap<Service, TagMap>,
}

/// Wire form of [`State`]; partitions may be missing.
#[derive(Deserialize)]
struct StateRepr {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    entries: BTreeMap<Service, EntryMap>,
    #[serde(default)]
    tags: BTreeMap<Service, TagMap>,
}

impl From<StateRepr> for State {
    fn from(repr: StateRepr) -> Self {
        let mut state = State {
            version: if repr.version == 0 {
                STATE_VERSION
            } else {
                repr.version
            },
            entries: repr.entries,
            tags: repr.tags,
        };
        state.fill_partitions();
        state
    }
}

impl State {
    /// An empty state with a map for every service.
    pub fn new() -> Self {
        let mut state = Self {
            version: STATE_VERSION,
            entries: BTreeMap::new(),
            tags: BTreeMap::new(),
        };
        state.fill_partitions();
        state
    }

    fn fill_partitions(&mut self) {
        for service in Service::ALL {
            self.entries.entry(service).or_default();
            self.tags.entry(service).or_default();
        }
    }

    /// True iff every per-service entry and tag map is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.values().all(BTreeMap::is_empty) && self.tags.values().all(BTreeMap::is_empty)
    }

    pub fn entries(&self, service: Service) -> &EntryMap {
        self.entries.get(&service).unwrap_or(&NO_ENTRIES)
    }

    pub fn entries_mut(&mut self, service: Service) -> &mut EntryMap {
        self.entries.entry(service).or_default()
    }

    pub fn tags(&self, service: Service) -> &TagMap {
        self.tags.get(&service).unwrap_or(&NO_TAGS)
    }

    pub fn tags_mut(&mut self, service: Service) -> &mut TagMap {
        self.tags.entry(service).or_default()
    }

    /// All entry partitions, keyed by service.
    pub fn all_entries(&self) -> &BTreeMap<Service, EntryMap> {
        &self.entries
    }

    /// All tag partitions, keyed by service.
    pub fn all_tags(&self) -> &BTreeMap<Service, TagMap> {
        &self.tags
    }

    /// Entry partitions restricted to one service, or all of them.
    pub fn entries_for(&self, service: Option<Service>) -> BTreeMap<Service, EntryMap> {
        match service {
            Some(service) => BTreeMap::from([(service, self.entries(service).clone())]),
            None => self.entries.clone(),
        }
    }

    /// Tag partitions restricted to one service, or all of them.
    pub fn tags_for(&self, service: Option<Service>) -> BTreeMap<Service, TagMap> {
        match service {
            Some(service) => BTreeMap::from([(service, self.tags(service).clone())]),
            None => self.tags.clone(),
        }
    }

    /// Drop every staged entry and tag change for one service, or for all.
    pub fn clear(&mut self, service: Option<Service>) {
        match service {
            Some(service) => {
                self.entries_mut(service).clear();
                self.tags_mut(service).clear();
            }
            None => {
                for map in self.entries.values_mut() {
                    map.clear();
                }
                for map in self.tags.values_mut() {
                    map.clear();
                }
            }
        }
    }

    /// Total number of staged entries across services.
    pub fn entry_count(&self) -> usize {
        self.entries.values().map(BTreeMap::len).sum()
    }

    /// Total number of staged tag changes across services.
    pub fn tag_count(&self) -> usize {
        self.tags.values().map(BTreeMap::len).sum()
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

/// The (account, region) pair that partitions all staged state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateKey {
    pub account_id: String,
    pub region: String,
}

impl StateKey {
    pub fn new(account_id: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            region: region.into(),
        }
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.account_id, self.region)
    }
}
