//! Application-facing staging API bound to one (account, region) scope.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::ipc::{IpcClient, IpcClientError};
use crate::protocol::{
    Entry, EntryMap, ErrorCode, Method, Request, Service, State, StateKey, TagEntry, TagMap,
};

/// Errors from the staging façade.
#[derive(Debug, thiserror::Error)]
pub enum StagingError {
    #[error("no change staged for {service} {name}")]
    NotStaged { service: Service, name: String },

    #[error(transparent)]
    Client(#[from] IpcClientError),
}

impl StagingError {
    pub fn is_not_staged(&self) -> bool {
        matches!(self, StagingError::NotStaged { .. })
    }
}

/// Staging operations for one (account, region) scope.
///
/// Cheap to clone; clones share the underlying client.
#[derive(Clone)]
pub struct StagingStore {
    client: Arc<IpcClient>,
    key: StateKey,
}

impl StagingStore {
    pub fn new(client: Arc<IpcClient>, account_id: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            client,
            key: StateKey::new(account_id, region),
        }
    }

    pub fn key(&self) -> &StateKey {
        &self.key
    }

    pub fn client(&self) -> &IpcClient {
        &self.client
    }

    fn request(&self, method: Method) -> Request {
        Request::scoped(method, &self.key)
    }

    fn item(&self, method: Method, service: Service, name: &str) -> Request {
        self.request(method).with_service(service).with_name(name)
    }

    /// The staged entry for `name`, or [`StagingError::NotStaged`].
    pub async fn get_entry(&self, service: Service, name: &str) -> Result<Entry, StagingError> {
        let entry: Option<Entry> = self
            .client
            .call_for_optional(&self.item(Method::GetEntry, service, name))
            .await?;
        entry.ok_or_else(|| not_staged(service, name))
    }

    /// The staged tag change for `name`, or [`StagingError::NotStaged`].
    pub async fn get_tag(&self, service: Service, name: &str) -> Result<TagEntry, StagingError> {
        let tag: Option<TagEntry> = self
            .client
            .call_for_optional(&self.item(Method::GetTag, service, name))
            .await?;
        tag.ok_or_else(|| not_staged(service, name))
    }

    /// Staged entries per service; `None` lists every service.
    pub async fn list_entries(
        &self,
        service: Option<Service>,
    ) -> Result<BTreeMap<Service, EntryMap>, StagingError> {
        let mut req = self.request(Method::ListEntries);
        req.service = service;
        Ok(self.client.call_for(&req).await?)
    }

    /// Staged tag changes per service; `None` lists every service.
    pub async fn list_tags(
        &self,
        service: Option<Service>,
    ) -> Result<BTreeMap<Service, TagMap>, StagingError> {
        let mut req = self.request(Method::ListTags);
        req.service = service;
        Ok(self.client.call_for(&req).await?)
    }

    /// The scope's full staged state.
    pub async fn load(&self) -> Result<State, StagingError> {
        Ok(self.client.call_for(&self.request(Method::Load)).await?)
    }

    /// Stage (or replace) an entry.
    pub async fn stage_entry(
        &self,
        service: Service,
        name: &str,
        entry: Entry,
    ) -> Result<(), StagingError> {
        debug!(scope = %self.key, %service, name, operation = %entry.operation, "staging entry");
        self.client
            .call(&self.item(Method::StageEntry, service, name).with_entry(entry))
            .await?;
        Ok(())
    }

    /// Stage (or replace) a tag change.
    pub async fn stage_tag(
        &self,
        service: Service,
        name: &str,
        tag_entry: TagEntry,
    ) -> Result<(), StagingError> {
        debug!(scope = %self.key, %service, name, "staging tag change");
        self.client
            .call(&self.item(Method::StageTag, service, name).with_tag_entry(tag_entry))
            .await?;
        Ok(())
    }

    pub async fn unstage_entry(&self, service: Service, name: &str) -> Result<(), StagingError> {
        self.client
            .call(&self.item(Method::UnstageEntry, service, name))
            .await
            .map_err(|e| map_not_staged(e, service, name))?;
        Ok(())
    }

    pub async fn unstage_tag(&self, service: Service, name: &str) -> Result<(), StagingError> {
        self.client
            .call(&self.item(Method::UnstageTag, service, name))
            .await
            .map_err(|e| map_not_staged(e, service, name))?;
        Ok(())
    }

    /// Unstage everything for one service, or for every service.
    pub async fn unstage_all(&self, service: Option<Service>) -> Result<(), StagingError> {
        let mut req = self.request(Method::UnstageAll);
        req.service = service;
        self.client.call(&req).await?;
        Ok(())
    }

    /// Snapshot the scope's state.
    ///
    /// With `keep = false` the scope is cleared afterwards, turning an export
    /// into a move. A change staged by another client between the snapshot
    /// and the clear is dropped without being part of the snapshot.
    pub async fn drain(&self, keep: bool) -> Result<State, StagingError> {
        let state: State = self.client.call_for(&self.request(Method::GetState)).await?;
        if !keep {
            self.unstage_all(None).await?;
        }
        debug!(
            scope = %self.key,
            keep,
            entries = state.entry_count(),
            tags = state.tag_count(),
            "drained staged state"
        );
        Ok(state)
    }

    /// Replace the scope's state wholesale.
    pub async fn set_state(&self, state: State) -> Result<(), StagingError> {
        self.client
            .call(&self.request(Method::SetState).with_state(state))
            .await?;
        Ok(())
    }
}

fn not_staged(service: Service, name: &str) -> StagingError {
    StagingError::NotStaged {
        service,
        name: name.to_string(),
    }
}

fn map_not_staged(e: IpcClientError, service: Service, name: &str) -> StagingError {
    if e.code() == Some(ErrorCode::NotStaged) {
        not_staged(service, name)
    } else {
        e.into()
    }
}
