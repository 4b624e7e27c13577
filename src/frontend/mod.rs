//! Line-oriented admission front end.
//!
//! Stands in for the request-handling layer: each input line names the client
//! of one request, and each output line is the JSON decision for it. A denied
//! decision carries the retry-after hint the caller should answer with.

mod server;
mod service;

pub use server::{LineServer, ServeStats, MAX_LINE_LEN};
pub use service::{AdmissionResponse, AdmissionService};
