//! Delivery of saved plates to a downstream receiver.
//!
//! One TCP connection per saved reading carries a length-prefixed JSON header followed by
//! the raw file bytes. See `downstream` for the framing and the dispatcher, `receiver` for
//! the accepting side.

mod downstream;
mod receiver;

pub use downstream::{
    read_bundle, sanitize_file_name, store_bundle, write_bundle, BundleLimits, DownstreamDispatcher,
    DownstreamSender, DownstreamTarget, FileHeader, OutgoingFile, ReceivedFile,
    TcpDownstreamSender, DEFAULT_DISPATCH_JOIN_TIMEOUT, DEFAULT_DISPATCH_QUEUE, MAX_FILE_LEN, MAX_HEADER_LEN,
};
pub use receiver::BundleReceiver;
