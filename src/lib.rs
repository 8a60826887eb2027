//! h2engine - HTTP/2 protocol engine
//!
//! This crate implements the wire-level mechanics of HTTP/2 (RFC 7540) as a
//! synchronous, sans-I/O library: a connection state machine, a per-stream
//! state machine, a binary frame codec, flow-control accounting, and
//! header-block legality validation.
//!
//! # Architecture
//!
//! Bytes read from the transport are fed to a [`FrameDecoder`], which yields
//! typed [`Frame`] values. Each frame is handed to the
//! [`ConnectionStateMachine`], which validates it against the connection and
//! stream lifecycles and returns a [`StateMachineResultWithEffect`]: whether the
//! frame may be forwarded, dropped, or must tear down a stream or the whole
//! connection, together with the observable [`StateChange`] it produced.
//!
//! Outbound frames go through the same state machine (`send_*` operations)
//! before being serialized by the [`FrameEncoder`].
//!
//! The engine owns no sockets, timers, or tasks. One connection is mutated by
//! one thread of control at a time.
//!
//! # Examples
//!
//! ```
//! use h2engine::{ConnectionConfig, ConnectionRole, ConnectionStateMachine, Headers, StreamId};
//!
//! let config = ConnectionConfig::default();
//! let mut client = ConnectionStateMachine::new(ConnectionRole::Client, &config);
//! client.send_settings(config.initial_settings().clone());
//!
//! let headers = Headers::from_pairs(&[
//!     (":method", "GET"),
//!     (":path", "/"),
//!     (":scheme", "https"),
//!     (":authority", "example.com"),
//! ]);
//! let outcome = client.send_headers(StreamId::new(1), &headers, true);
//! assert!(outcome.result.is_success());
//! ```

pub mod codec;
pub mod config;
pub mod content_length;
pub mod connection;
pub mod dos_heuristics;
pub mod effects;
pub mod error;
pub mod flow_control;
pub mod frames;
pub mod header_validation;
pub mod headers;
pub mod settings;
pub mod stream;
pub mod stream_collection;
pub mod stream_id;

pub use codec::{FrameDecoder, FrameEncoder};
pub use config::{ConnectionConfig, ConnectionConfigBuilder};
pub use connection::{ConnectionRole, ConnectionStateKind, ConnectionStateMachine, PostFrameOperation};
pub use effects::{StateChange, StateMachineResult, StateMachineResultWithEffect};
pub use error::{Error, ErrorCode, Result};
pub use flow_control::{FlowControlWindow, InboundWindowManager};
pub use frames::{Frame, FrameFlags, FramePayload, FrameType};
pub use headers::Headers;
pub use settings::{Setting, Settings, SettingsBuilder, SettingsParameter};
pub use stream_id::StreamId;

/// HTTP/2 connection preface that must be sent by clients
///
/// From RFC 7540 Section 3.5:
/// "PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n"
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Default initial window size (65535 bytes)
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65535;

/// Default maximum frame size (16384 bytes)
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 1 << 14;

/// Largest legal SETTINGS_MAX_FRAME_SIZE (2^24 - 1)
pub const MAX_ALLOWED_MAX_FRAME_SIZE: u32 = (1 << 24) - 1;

/// Default header table size (4096 bytes)
pub const DEFAULT_HEADER_TABLE_SIZE: u32 = 4096;

/// Largest legal flow-control window (2^31 - 1)
pub const MAX_WINDOW_SIZE: u32 = 0x7FFF_FFFF;
