//! Client platform tag.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// Platform the client runs on.
///
/// Sent as the `ClientType` connection header and inside every outbound command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientType {
    /// Mini-program client.
    #[default]
    WechatMp,
    /// Desktop browser client.
    Pc,
    /// Native mobile app.
    App,
}

impl ClientType {
    /// Wire representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::WechatMp => "WECHAT_MP",
            Self::Pc => "PC",
            Self::App => "APP",
        }
    }
}

impl fmt::Display for ClientType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClientType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "WECHAT_MP" => Ok(Self::WechatMp),
            "PC" => Ok(Self::Pc),
            "APP" => Ok(Self::App),
            _ => Err(CoreError::UnknownClientType(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_case_insensitively() {
        assert_eq!("wechat_mp".parse::<ClientType>().unwrap(), ClientType::WechatMp);
        assert_eq!("wechat-mp".parse::<ClientType>().unwrap(), ClientType::WechatMp);
        assert_eq!("Pc".parse::<ClientType>().unwrap(), ClientType::Pc);
        assert_eq!("APP".parse::<ClientType>().unwrap(), ClientType::App);
    }

    #[test]
    fn rejects_unknown() {
        assert!(matches!(
            "desktop".parse::<ClientType>(),
            Err(CoreError::UnknownClientType(_))
        ));
    }

    #[test]
    fn serializes_to_wire_names() {
        assert_eq!(
            serde_json::to_string(&ClientType::WechatMp).unwrap(),
            r#""WECHAT_MP""#
        );
        assert_eq!(serde_json::to_string(&ClientType::Pc).unwrap(), r#""PC""#);
        assert_eq!(serde_json::to_string(&ClientType::App).unwrap(), r#""APP""#);
    }
}
