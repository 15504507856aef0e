//! Request/response envelope exchanged over the daemon socket.
//!
//! Each connection carries exactly one JSON-encoded [`Request`] and one
//! JSON-encoded [`Response`]. The response payload is opaque at this layer
//! and is interpreted according to the method that produced it.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::state::{Entry, Service, State, StateKey, TagEntry};

/// Largest request or response body either side accepts.
pub const MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

/// The closed set of daemon methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    Ping,
    Shutdown,
    GetEntry,
    GetTag,
    ListEntries,
    ListTags,
    Load,
    StageEntry,
    StageTag,
    UnstageEntry,
    UnstageTag,
    UnstageAll,
    GetState,
    SetState,
    IsEmpty,
    /// Any method name this build does not know (newer or older client).
    #[serde(other)]
    Unknown,
}

impl Method {
    /// Whether the method removes staged state and may leave the store empty.
    pub fn is_unstage(self) -> bool {
        matches!(
            self,
            Method::UnstageEntry | Method::UnstageTag | Method::UnstageAll
        )
    }

    /// Whether the method can add staged state.
    pub fn adds_state(self) -> bool {
        matches!(
            self,
            Method::StageEntry | Method::StageTag | Method::SetState
        )
    }

    /// Whether the method reads one scope without changing it.
    pub fn is_read(self) -> bool {
        matches!(
            self,
            Method::GetEntry
                | Method::GetTag
                | Method::ListEntries
                | Method::ListTags
                | Method::Load
                | Method::GetState
        )
    }
}

/// Machine-readable failure class carried next to the error message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The named entry or tag change is not staged.
    NotStaged,
    /// The request could not be decoded or is missing required fields.
    InvalidRequest,
    /// The method is not known to this daemon.
    UnknownMethod,
    /// A payload the method requires was not supplied.
    MissingPayload,
    /// The connecting process does not belong to the daemon's user.
    PeerRejected,
    /// The daemon failed internally (store unavailable, encoding failure).
    Internal,
    /// The daemon is going down and no longer accepts new staged state.
    /// Retry against a fresh daemon.
    ShuttingDown,
}

/// One request to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub method: Method,
    #[serde(default)]
    pub account_id: String,
    #[serde(default)]
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<Service>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<Entry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag_entry: Option<TagEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<State>,
}

impl Request {
    /// A request carrying only a method (ping, shutdown, emptiness check).
    pub fn new(method: Method) -> Self {
        Self {
            method,
            account_id: String::new(),
            region: String::new(),
            service: None,
            name: String::new(),
            entry: None,
            tag_entry: None,
            state: None,
        }
    }

    /// A request addressed to one (account, region) scope.
    pub fn scoped(method: Method, key: &StateKey) -> Self {
        let mut req = Self::new(method);
        req.account_id = key.account_id.clone();
        req.region = key.region.clone();
        req
    }

    pub fn with_service(mut self, service: Service) -> Self {
        self.service = Some(service);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_entry(mut self, entry: Entry) -> Self {
        self.entry = Some(entry);
        self
    }

    pub fn with_tag_entry(mut self, tag_entry: TagEntry) -> Self {
        self.tag_entry = Some(tag_entry);
        self
    }

    pub fn with_state(mut self, state: State) -> Self {
        self.state = Some(state);
        self
    }

    /// The scope this request addresses.
    pub fn state_key(&self) -> StateKey {
        StateKey::new(self.account_id.clone(), self.region.clone())
    }
}

/// One response from the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Response {
    /// A successful response with no payload.
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
            code: None,
            data: None,
        }
    }

    /// A successful response carrying `data`.
    ///
    /// Falls back to an internal error response if `data` cannot be encoded.
    pub fn ok_with<T: Serialize>(data: &T) -> Self {
        match serde_json::to_value(data) {
            Ok(value) => Self {
                data: Some(value),
                ..Self::ok()
            },
            Err(e) => Self::err(
                ErrorCode::Internal,
                format!("failed to encode response: {e}"),
            ),
        }
    }

    /// A failed response.
    pub fn err(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            code: Some(code),
            data: None,
        }
    }

    /// Decode the payload as `T`. An absent or `null` payload yields `None`.
    pub fn decode_data<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        match &self.data {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone()).map(Some),
        }
    }

    /// The error message, or a generic one if the daemon sent none.
    pub fn error_message(&self) -> &str {
        self.error.as_deref().unwrap_or("daemon reported failure")
    }
}

/// Payload of a `Ping` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingInfo {
    pub version: String,
    pub pid: u32,
    pub uptime_secs: u64,
}

/// Errors decoding or encoding envelopes.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("message of {size} bytes exceeds the {limit} byte limit", limit = MAX_MESSAGE_BYTES)]
    TooLarge { size: usize },
}

fn check_size(bytes: &[u8]) -> Result<(), ProtocolError> {
    if bytes.len() > MAX_MESSAGE_BYTES {
        return Err(ProtocolError::TooLarge { size: bytes.len() });
    }
    Ok(())
}

pub fn encode_request(req: &Request) -> Result<Vec<u8>, ProtocolError> {
    Ok(serde_json::to_vec(req)?)
}

pub fn decode_request(bytes: &[u8]) -> Result<Request, ProtocolError> {
    check_size(bytes)?;
    Ok(serde_json::from_slice(bytes)?)
}

pub fn encode_response(resp: &Response) -> Result<Vec<u8>, ProtocolError> {
    Ok(serde_json::to_vec(resp)?)
}

pub fn decode_response(bytes: &[u8]) -> Result<Response, ProtocolError> {
    check_size(bytes)?;
    Ok(serde_json::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn request_wire_shape() {
        let key = StateKey::new("123456789012", "eu-west-1");
        let req = Request::scoped(Method::StageEntry, &key)
            .with_service(Service::Secret)
            .with_name("prod/api-key")
            .with_entry(Entry::update("v"));

        let json: serde_json::Value = serde_json::from_slice(&encode_request(&req).unwrap()).unwrap();
        assert_eq!(json["method"], "StageEntry");
        assert_eq!(json["account_id"], "123456789012");
        assert_eq!(json["service"], "secret");
        assert_eq!(json["entry"]["value"], "v");
        assert!(json.get("state").is_none());
    }

    #[test]
    fn unknown_method_decodes() {
        let req = decode_request(br#"{"method":"Teleport","account_id":"a","region":"r"}"#).unwrap();
        assert_eq!(req.method, Method::Unknown);
        assert_eq!(req.state_key(), StateKey::new("a", "r"));
    }

    #[test]
    fn missing_method_is_malformed() {
        let err = decode_request(br#"{"account_id":"a"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn oversized_message_rejected() {
        let big = vec![b' '; MAX_MESSAGE_BYTES + 1];
        assert!(matches!(
            decode_request(&big),
            Err(ProtocolError::TooLarge { .. })
        ));
    }

    #[test]
    fn response_error_shape() {
        let resp = Response::err(ErrorCode::NotStaged, "not staged: /a");
        let json: serde_json::Value = serde_json::from_slice(&encode_response(&resp).unwrap()).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["code"], "not_staged");
        assert_eq!(json["error"], "not staged: /a");
        assert!(json.get("data").is_none());
    }

    #[test]
    fn decode_data_treats_null_as_absent() {
        let resp = Response::ok_with(&Option::<Entry>::None);
        assert!(resp.success);
        assert_eq!(resp.decode_data::<Entry>().unwrap(), None);

        let resp = Response::ok_with(&true);
        assert_eq!(resp.decode_data::<bool>().unwrap(), Some(true));
    }

    #[test]
    fn method_classes() {
        assert!(Method::UnstageAll.is_unstage());
        assert!(!Method::StageEntry.is_unstage());
        assert!(Method::SetState.adds_state());
        assert!(!Method::UnstageTag.adds_state());
        assert!(Method::ListTags.is_read());
        assert!(!Method::IsEmpty.is_read());
        assert!(!Method::StageEntry.is_read());
    }
}
