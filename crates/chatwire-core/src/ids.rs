//! Core identifier types for chatwire.
//!
//! Chat and query identifiers are assigned by the server and treated as opaque.
//! Run and message identifiers are generated client-side so that a question can be
//! correlated with its streamed answer before the server has acknowledged it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Length of client-generated run and message identifiers.
pub const GENERATED_ID_LEN: usize = 32;

/// Errors that can occur when parsing identifiers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    /// The input string is empty.
    #[error("identifier must not be empty")]
    Empty,

    /// The input contains characters outside the allowed set.
    #[error("identifier contains invalid character {0:?}")]
    InvalidChar(char),
}

fn validate(s: &str) -> Result<(), IdError> {
    if s.is_empty() {
        return Err(IdError::Empty);
    }
    if let Some(c) = s.chars().find(|c| c.is_whitespace() || c.is_control()) {
        return Err(IdError::InvalidChar(c));
    }
    Ok(())
}

/// A fixed-length random alphanumeric token.
fn random_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Create an identifier from a string.
            ///
            /// # Errors
            ///
            /// Returns an error if the string is empty or contains whitespace.
            pub fn new(s: impl Into<String>) -> Result<Self, IdError> {
                let s = s.into();
                validate(&s)?;
                Ok(Self(s))
            }

            /// Return the string representation.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = IdError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Server-assigned identifier of a conversation.
    ChatId
);

string_id!(
    /// Server-assigned identifier of a single question within a conversation.
    ///
    /// Required by stop and refresh commands; unknown until the first frame of a run
    /// arrives.
    QueryId
);

string_id!(
    /// Client-generated correlation token for one question/answer exchange.
    ///
    /// The server echoes the run ID on every frame belonging to the exchange.
    RunId
);

string_id!(
    /// Client-generated identifier of an outbound question message.
    MsgId
);

impl RunId {
    /// Generate a fresh random run ID of [`GENERATED_ID_LEN`] alphanumeric characters.
    #[must_use]
    pub fn generate() -> Self {
        Self(random_token())
    }
}

impl MsgId {
    /// Generate a fresh random message ID of [`GENERATED_ID_LEN`] alphanumeric characters.
    #[must_use]
    pub fn generate() -> Self {
        Self(random_token())
    }
}
