//! Request dispatch: one protocol method, one store operation.
//!
//! Every operation follows the same shape: load the scope's [`State`], read
//! or mutate it, and on mutation write it back, all under the store's lock.
//! The handler is pure with respect to its inputs: replaying a request
//! against unchanged state yields the same response.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use tracing::{debug, warn};

use crate::build_info;
use crate::protocol::{ErrorCode, Method, PingInfo, Request, Response, Service, State};
use crate::store::{SecureStateStore, StoreError};

/// Switch that refuses new staged state once the daemon commits to going
/// down.
///
/// The switch is read inside the store's write lock, so a stage either lands
/// before a later `is_empty` check sees the store or is refused.
#[derive(Debug, Clone, Default)]
pub struct Admission(Arc<AtomicBool>);

impl Admission {
    pub fn close(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reopen(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Maps protocol methods onto the [`SecureStateStore`].
#[derive(Debug, Clone)]
pub struct RequestHandler {
    store: Arc<SecureStateStore>,
    admission: Admission,
    started_at: Instant,
}

type Outcome = Result<Response, Response>;

impl RequestHandler {
    pub fn new(store: Arc<SecureStateStore>) -> Self {
        Self {
            store,
            admission: Admission::default(),
            started_at: Instant::now(),
        }
    }

    pub fn store(&self) -> &Arc<SecureStateStore> {
        &self.store
    }

    /// The switch that stops this handler from accepting new staged state.
    pub fn admission(&self) -> &Admission {
        &self.admission
    }

    /// Handle one request and produce its response.
    pub fn handle(&self, req: &Request) -> Response {
        debug!(
            method = ?req.method,
            account = %req.account_id,
            region = %req.region,
            service = ?req.service,
            name = %req.name,
            "handling request"
        );
        match self.dispatch(req) {
            Ok(resp) | Err(resp) => resp,
        }
    }

    fn dispatch(&self, req: &Request) -> Outcome {
        match req.method {
            Method::Ping => Ok(Response::ok_with(&PingInfo {
                version: build_info::version_string(),
                pid: std::process::id(),
                uptime_secs: self.started_at.elapsed().as_secs(),
            })),
            // The daemon acts on shutdown after the response is written.
            Method::Shutdown => Ok(Response::ok()),
            Method::GetEntry => self.get_entry(req),
            Method::GetTag => self.get_tag(req),
            Method::ListEntries => {
                let state = self.load(req)?;
                Ok(Response::ok_with(&state.entries_for(req.service)))
            }
            Method::ListTags => {
                let state = self.load(req)?;
                Ok(Response::ok_with(&state.tags_for(req.service)))
            }
            Method::Load | Method::GetState => {
                let state = self.load(req)?;
                Ok(Response::ok_with(&state))
            }
            Method::StageEntry => self.stage_entry(req),
            Method::StageTag => self.stage_tag(req),
            Method::UnstageEntry => self.unstage_entry(req),
            Method::UnstageTag => self.unstage_tag(req),
            Method::UnstageAll => self.unstage_all(req),
            Method::SetState => self.set_state(req),
            Method::IsEmpty => {
                let empty = self.store.is_empty().map_err(internal)?;
                Ok(Response::ok_with(&empty))
            }
            Method::Unknown => Err(Response::err(
                ErrorCode::UnknownMethod,
                "unknown method; the daemon may be older than this client",
            )),
        }
    }

    fn load(&self, req: &Request) -> Result<State, Response> {
        self.store.get(&req.state_key()).map_err(internal)
    }

    fn get_entry(&self, req: &Request) -> Outcome {
        let (service, name) = target(req)?;
        let state = self.load(req)?;
        Ok(Response::ok_with(&state.entries(service).get(name)))
    }

    fn get_tag(&self, req: &Request) -> Outcome {
        let (service, name) = target(req)?;
        let state = self.load(req)?;
        Ok(Response::ok_with(&state.tags(service).get(name)))
    }

    fn stage_entry(&self, req: &Request) -> Outcome {
        let (service, name) = target(req)?;
        let entry = req
            .entry
            .clone()
            .ok_or_else(|| missing_payload("entry", req.method))?;
        self.mutate(req, |state| {
            state.entries_mut(service).insert(name.to_string(), entry);
            Ok(())
        })
    }

    fn stage_tag(&self, req: &Request) -> Outcome {
        let (service, name) = target(req)?;
        let tag_entry = req
            .tag_entry
            .clone()
            .ok_or_else(|| missing_payload("tag_entry", req.method))?;
        self.mutate(req, |state| {
            state.tags_mut(service).insert(name.to_string(), tag_entry);
            Ok(())
        })
    }

    fn unstage_entry(&self, req: &Request) -> Outcome {
        let (service, name) = target(req)?;
        self.mutate(req, |state| match state.entries_mut(service).remove(name) {
            Some(_) => Ok(()),
            None => Err(not_staged("entry", service, name)),
        })
    }

    fn unstage_tag(&self, req: &Request) -> Outcome {
        let (service, name) = target(req)?;
        self.mutate(req, |state| match state.tags_mut(service).remove(name) {
            Some(_) => Ok(()),
            None => Err(not_staged("tag change", service, name)),
        })
    }

    fn unstage_all(&self, req: &Request) -> Outcome {
        self.mutate(req, |state| {
            state.clear(req.service);
            Ok(())
        })
    }

    fn set_state(&self, req: &Request) -> Outcome {
        let state = req
            .state
            .clone()
            .ok_or_else(|| missing_payload("state", req.method))?;
        self.mutate(req, |current| {
            *current = state;
            Ok(())
        })
    }

    fn mutate(
        &self,
        req: &Request,
        f: impl FnOnce(&mut State) -> Result<(), Response>,
    ) -> Outcome {
        let admission = &self.admission;
        let adds = req.method.adds_state();
        self.store
            .update(&req.state_key(), |state| {
                if adds && admission.is_closed() {
                    return Err(Response::err(
                        ErrorCode::ShuttingDown,
                        "daemon is shutting down; retry against a new daemon",
                    ));
                }
                f(state)
            })
            .map_err(internal)??;
        Ok(Response::ok())
    }
}

/// The (service, name) pair single-item methods require.
fn target(req: &Request) -> Result<(Service, &str), Response> {
    let service = req.service.ok_or_else(|| {
        Response::err(
            ErrorCode::InvalidRequest,
            format!("{:?} requires a service", req.method),
        )
    })?;
    if req.name.is_empty() {
        return Err(Response::err(
            ErrorCode::InvalidRequest,
            format!("{:?} requires a name", req.method),
        ));
    }
    Ok((service, req.name.as_str()))
}

fn missing_payload(field: &str, method: Method) -> Response {
    Response::err(
        ErrorCode::MissingPayload,
        format!("{method:?} requires a {field} payload"),
    )
}

fn not_staged(what: &str, service: Service, name: &str) -> Response {
    Response::err(
        ErrorCode::NotStaged,
        format!("no {what} staged for {service} {name}"),
    )
}

fn internal(e: StoreError) -> Response {
    warn!(error = %e, "state store failure");
    Response::err(ErrorCode::Internal, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Entry, StateKey, TagEntry};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    fn handler() -> RequestHandler {
        RequestHandler::new(Arc::new(SecureStateStore::new()))
    }

    fn key() -> StateKey {
        StateKey::new("111122223333", "ap-northeast-1")
    }

    fn stage(h: &RequestHandler, service: Service, name: &str, value: &str) {
        let resp = h.handle(
            &Request::scoped(Method::StageEntry, &key())
                .with_service(service)
                .with_name(name)
                .with_entry(Entry::update(value)),
        );
        assert!(resp.success, "{resp:?}");
    }

    fn is_empty(h: &RequestHandler) -> bool {
        h.handle(&Request::new(Method::IsEmpty))
            .decode_data::<bool>()
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_ping_reports_version() {
        let resp = handler().handle(&Request::new(Method::Ping));
        let info: PingInfo = resp.decode_data().unwrap().unwrap();
        assert_eq!(info.version, build_info::version_string());
        assert_eq!(info.pid, std::process::id());
    }

    #[test]
    fn test_stage_get_unstage_entry() {
        let h = handler();
        let entry = Entry::create("v1").with_description("first");
        let resp = h.handle(
            &Request::scoped(Method::StageEntry, &key())
                .with_service(Service::Param)
                .with_name("/app/a")
                .with_entry(entry.clone()),
        );
        assert!(resp.success);

        let get = Request::scoped(Method::GetEntry, &key())
            .with_service(Service::Param)
            .with_name("/app/a");
        let got: Option<Entry> = h.handle(&get).decode_data().unwrap();
        assert_eq!(got, Some(entry));

        let unstage = Request::scoped(Method::UnstageEntry, &key())
            .with_service(Service::Param)
            .with_name("/app/a");
        assert!(h.handle(&unstage).success);

        let resp = h.handle(&get);
        assert!(resp.success);
        assert_eq!(resp.decode_data::<Entry>().unwrap(), None);
    }

    #[test]
    fn test_unstage_missing_is_not_staged() {
        let resp = handler().handle(
            &Request::scoped(Method::UnstageEntry, &key())
                .with_service(Service::Secret)
                .with_name("nope"),
        );
        assert!(!resp.success);
        assert_eq!(resp.code, Some(ErrorCode::NotStaged));

        let resp = handler().handle(
            &Request::scoped(Method::UnstageTag, &key())
                .with_service(Service::Secret)
                .with_name("nope"),
        );
        assert_eq!(resp.code, Some(ErrorCode::NotStaged));
    }

    #[test]
    fn test_restage_replaces_entry() {
        let h = handler();
        stage(&h, Service::Param, "/x", "old");
        stage(&h, Service::Param, "/x", "new");

        let got: Entry = h
            .handle(
                &Request::scoped(Method::GetEntry, &key())
                    .with_service(Service::Param)
                    .with_name("/x"),
            )
            .decode_data()
            .unwrap()
            .unwrap();
        assert_eq!(got.value.as_deref(), Some("new"));
    }

    #[test]
    fn test_tags_are_independent_of_entries() {
        let h = handler();
        let tags = TagEntry::new().add("env", "prod").remove("legacy");
        let resp = h.handle(
            &Request::scoped(Method::StageTag, &key())
                .with_service(Service::Secret)
                .with_name("db")
                .with_tag_entry(tags.clone()),
        );
        assert!(resp.success);

        let entry = h.handle(
            &Request::scoped(Method::GetEntry, &key())
                .with_service(Service::Secret)
                .with_name("db"),
        );
        assert_eq!(entry.decode_data::<Entry>().unwrap(), None);

        let got: TagEntry = h
            .handle(
                &Request::scoped(Method::GetTag, &key())
                    .with_service(Service::Secret)
                    .with_name("db"),
            )
            .decode_data()
            .unwrap()
            .unwrap();
        assert_eq!(got, tags);

        let listed: BTreeMap<Service, BTreeMap<String, TagEntry>> = h
            .handle(&Request::scoped(Method::ListTags, &key()))
            .decode_data()
            .unwrap()
            .unwrap();
        assert_eq!(listed[&Service::Secret].len(), 1);
        assert!(listed[&Service::Param].is_empty());
    }

    #[test]
    fn test_list_entries_filters_by_service() {
        let h = handler();
        stage(&h, Service::Param, "/p", "1");
        stage(&h, Service::Secret, "s", "2");

        let only: BTreeMap<Service, BTreeMap<String, Entry>> = h
            .handle(&Request::scoped(Method::ListEntries, &key()).with_service(Service::Secret))
            .decode_data()
            .unwrap()
            .unwrap();
        assert_eq!(only.len(), 1);
        assert!(only[&Service::Secret].contains_key("s"));
    }

    #[test]
    fn test_unstage_all_one_service_or_all() {
        let h = handler();
        stage(&h, Service::Param, "/p", "1");
        stage(&h, Service::Secret, "s", "2");

        assert!(
            h.handle(&Request::scoped(Method::UnstageAll, &key()).with_service(Service::Param))
                .success
        );
        assert!(!is_empty(&h));

        assert!(h.handle(&Request::scoped(Method::UnstageAll, &key())).success);
        assert!(is_empty(&h));

        // Idempotent on an already-empty scope.
        assert!(h.handle(&Request::scoped(Method::UnstageAll, &key())).success);
        assert!(is_empty(&h));
    }

    #[test]
    fn test_is_empty_is_global() {
        let h = handler();
        assert!(is_empty(&h));
        let other = StateKey::new("999999999999", "us-west-2");
        let resp = h.handle(
            &Request::scoped(Method::StageEntry, &other)
                .with_service(Service::Param)
                .with_name("/z")
                .with_entry(Entry::update("z")),
        );
        assert!(resp.success);
        assert!(!is_empty(&h));
    }

    #[test]
    fn test_get_and_set_state() {
        let h = handler();
        stage(&h, Service::Param, "/p", "1");

        let snapshot: State = h
            .handle(&Request::scoped(Method::GetState, &key()))
            .decode_data()
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.entry_count(), 1);

        let target = StateKey::new("444455556666", "ap-northeast-1");
        let resp = h.handle(&Request::scoped(Method::SetState, &target).with_state(snapshot.clone()));
        assert!(resp.success);

        let copied: State = h
            .handle(&Request::scoped(Method::Load, &target))
            .decode_data()
            .unwrap()
            .unwrap();
        assert_eq!(copied, snapshot);
    }

    #[test]
    fn test_set_empty_state_clears_scope() {
        let h = handler();
        stage(&h, Service::Param, "/p", "1");
        let resp = h.handle(&Request::scoped(Method::SetState, &key()).with_state(State::new()));
        assert!(resp.success);
        assert!(is_empty(&h));
    }

    #[test]
    fn test_missing_payloads() {
        let h = handler();
        let resp = h.handle(&Request::scoped(Method::SetState, &key()));
        assert_eq!(resp.code, Some(ErrorCode::MissingPayload));

        let resp = h.handle(
            &Request::scoped(Method::StageEntry, &key())
                .with_service(Service::Param)
                .with_name("/p"),
        );
        assert_eq!(resp.code, Some(ErrorCode::MissingPayload));
        assert!(is_empty(&h));
    }

    #[test]
    fn test_missing_target_is_invalid() {
        let h = handler();
        let resp = h.handle(&Request::scoped(Method::GetEntry, &key()).with_name("/p"));
        assert_eq!(resp.code, Some(ErrorCode::InvalidRequest));

        let resp = h.handle(&Request::scoped(Method::GetEntry, &key()).with_service(Service::Param));
        assert_eq!(resp.code, Some(ErrorCode::InvalidRequest));
    }

    #[test]
    fn test_closed_admission_refuses_new_state() {
        let h = handler();
        stage(&h, Service::Param, "/p", "1");
        h.admission().close();

        let resp = h.handle(
            &Request::scoped(Method::StageEntry, &key())
                .with_service(Service::Param)
                .with_name("/q")
                .with_entry(Entry::update("2")),
        );
        assert_eq!(resp.code, Some(ErrorCode::ShuttingDown));
        let resp = h.handle(&Request::scoped(Method::SetState, &key()).with_state(State::new()));
        assert_eq!(resp.code, Some(ErrorCode::ShuttingDown));

        // Reads and unstages still go through.
        assert!(h.handle(&Request::scoped(Method::ListEntries, &key())).success);
        assert!(h.handle(&Request::scoped(Method::UnstageAll, &key())).success);
        assert!(is_empty(&h));

        h.admission().reopen();
        stage(&h, Service::Param, "/q", "2");
        assert!(!is_empty(&h));
    }

    #[test]
    fn test_unknown_method() {
        let resp = handler().handle(&Request::new(Method::Unknown));
        assert!(!resp.success);
        assert_eq!(resp.code, Some(ErrorCode::UnknownMethod));
    }

    #[test]
    fn test_same_request_same_response() {
        let h = handler();
        stage(&h, Service::Param, "/p", "1");
        let req = Request::scoped(Method::ListEntries, &key());
        let a = h.handle(&req);
        let b = h.handle(&req);
        assert_eq!(a.data, b.data);
    }
}
