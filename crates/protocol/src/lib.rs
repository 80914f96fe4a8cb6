//! Wire protocol for the GripDL capture channel.
//!
//! The capture agent (a browser extension, through its native messaging
//! host) forwards intercepted downloads to the engine as length-prefixed
//! JSON messages. The same framing is used on every hop.
//!
//! # Wire format
//!
//! See [`wire`] module for the framing specification.

pub mod error;
pub mod messages;
pub mod wire;

pub use error::FramingError;
pub use messages::{CaptureResponse, DownloadRequest};
pub use wire::{DEFAULT_MAX_FRAME_LEN, FrameCodec};
