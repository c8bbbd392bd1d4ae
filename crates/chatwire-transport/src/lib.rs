//! Realtime chat transport for chatwire.
//!
//! This crate carries user questions to the AI backend over one long-lived WebSocket
//! and reassembles the streamed answers:
//!
//! - **Connection manager**: one socket, heartbeat with pong timeout, reconnect,
//!   bounded wait-until-open for sends, graceful close
//! - **Protocol codec**: outbound command envelopes and the two-stage inbound decode
//! - **Session correlator**: run-ID correlation and answer slot assembly
//! - **Request client**: fixed-delay retrying REST calls returning `{code, message, result}`
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use chatwire_core::ChatId;
//! use chatwire_transport::{
//!     ConnectionManager, LogNotifier, SessionCorrelator, StaticToken, TransportConfig,
//! };
//!
//! # async fn run() -> chatwire_transport::Result<()> {
//! let config = TransportConfig::from_env();
//! let tokens = Arc::new(StaticToken::new("access-token"));
//!
//! let connection = ConnectionManager::new(config.clone(), tokens.clone());
//! let session = SessionCorrelator::new(
//!     Arc::new(connection.clone()),
//!     tokens,
//!     Arc::new(LogNotifier),
//!     config.client_type,
//! );
//! session.attach(&connection);
//!
//! let run_id = session.submit(ChatId::new("chat-1").unwrap(), "How is gold doing?");
//! # let _ = run_id;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod answer;
pub mod api;
pub mod auth;
pub mod chats;
pub mod config;
pub mod connection;
pub mod error;
pub mod http;
pub mod notice;
pub mod protocol;
pub mod retry;
pub mod session;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use answer::{AnalysisData, AnswerSlot, ChatStep, Reference, StockSeries};
pub use api::{Chat, ChatListQuery, HistoryMessage, HistoryQuery, Page, PageQuery};
pub use auth::{SharedToken, StaticToken, TokenProvider};
pub use chats::{group_by_recency, ChatGroups};
pub use config::TransportConfig;
pub use connection::{ConnectionEvent, ConnectionManager, ConnectionState};
pub use error::{Result, TransportError};
pub use http::{ApiClient, CallOptions, Envelope};
pub use notice::{LogNotifier, Notice, Notifier};
pub use protocol::{InboundFrame, OutboundCommand, SseMsgType};
pub use retry::RetryPolicy;
pub use session::{CommandSink, FrameOutcome, SessionCorrelator, SlotUpdate};
