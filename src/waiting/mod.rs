//! Asynchronous Waiting
//!
//! Suspended nodes hold no thread. They register a wait keyed by their
//! correlation ids and are resumed by the callback when work completes.

pub mod notify;

pub use notify::{
    NotifyCallback, NotifyResponse, ProgressCallback, PurgeReport, WaitNotifyService, WaitRequest,
    DEFAULT_RESPONSE_TTL,
};
