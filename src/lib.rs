#![warn(future_incompatible, nonstandard_style, rust_2018_idioms, unused)]
#![warn(clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::float_cmp,
    clippy::too_many_lines, // TODO
)]

pub mod amf;
pub mod chunk;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod handshake;
pub mod relay;
pub mod server;
pub mod socket;
pub mod status;
pub mod stream;
pub mod types;
pub mod wire;

pub use config::Config;
pub use relay::Relay;
pub use status::ReportType;

/// Listen port used when the configuration names none.
pub const DEFAULT_PORT: u16 = 1935;

use std::sync::atomic::{AtomicU64, Ordering};

static CURRENT_ID: AtomicU64 = AtomicU64::new(0);

/// Stable ids shared by connections, streams, servers, and status peers.
pub(crate) fn next_id() -> u64 {
    CURRENT_ID.fetch_add(1, Ordering::SeqCst) + 1
}
