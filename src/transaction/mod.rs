//! The transaction state machine, including request validation and
//! response assembly.
//!
//! The hook points map onto state-machine steps the same way
//! `service::http::HttpService`'s `ProxyHttp` impl maps Pingora's own
//! hooks onto the request/response lifecycle.

mod fsm;
mod response;
mod state;
mod validation;

pub use fsm::TransactionFsm;
pub use response::{
    apply_keep_alive_header, decide_keep_alive, detect_self_loop, is_websocket_upgrade,
    strip_hop_by_hop, via_value,
};
pub use state::{
    CacheAction, CacheWriteLock, ClientInfo, DnsInfo, NextAction, ParentInfo, ServerInfo, Source,
    TransactionState,
};
pub use validation::{validate_request, ValidationError};
