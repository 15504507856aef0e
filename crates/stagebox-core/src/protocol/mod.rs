//! Wire protocol between the staging daemon and its clients.
//!
//! - [`state`]: the staged-change data model (`Entry`, `TagEntry`, `State`)
//! - [`types`]: the request/response envelope and method catalog
//! - [`address`]: per-user socket path resolution

pub mod address;
pub mod state;
pub mod types;

pub use address::{default_socket_path, resolve_socket_path};
pub use state::{
    DeleteOptions, Entry, EntryMap, Operation, STATE_VERSION, Service, State, StateKey, TagEntry,
    TagMap,
};
pub use types::{
    ErrorCode, MAX_MESSAGE_BYTES, Method, PingInfo, ProtocolError, Request, Response,
    decode_request, decode_response, encode_request, encode_response,
};
