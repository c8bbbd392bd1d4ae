//! Core types for chatwire.
//!
//! This crate provides the foundational types shared by the transport and the CLI:
//!
//! - **Identifiers**: Strongly-typed IDs for chats, runs, messages, and queries
//! - **Client type**: The platform tag sent with every connection and command
//! - **Error types**: Common error definitions shared across crates
//!
//! # Example
//!
//! ```
//! use chatwire_core::{ChatId, ClientType, RunId};
//!
//! // Run IDs are generated client-side and echoed back by the server
//! let run_id = RunId::generate();
//! assert_eq!(run_id.as_str().len(), 32);
//!
//! // Chat IDs are assigned by the server
//! let chat_id = ChatId::new("chat-1").unwrap();
//!
//! let client_type: ClientType = "app".parse().unwrap();
//! assert_eq!(client_type.as_str(), "APP");
//! # let _ = chat_id;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod client_type;
pub mod error;
pub mod ids;

pub use client_type::ClientType;
pub use error::{CoreError, Result};
pub use ids::{ChatId, IdError, MsgId, QueryId, RunId, GENERATED_ID_LEN};
