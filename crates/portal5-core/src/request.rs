//! Fetch metadata of an intercepted request.
//!
//! Mirrors the request attributes the interception layer can observe: mode,
//! destination, credentials, cache and redirect handling.

use serde::{Deserialize, Serialize};

/// Request mode, as reported by `Sec-Fetch-Mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestMode {
    Navigate,
    SameOrigin,
    #[default]
    NoCors,
    Cors,
    Websocket,
}

impl RequestMode {
    /// Parses a mode token; unknown tokens yield `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "navigate" => Some(Self::Navigate),
            "same-origin" => Some(Self::SameOrigin),
            "no-cors" => Some(Self::NoCors),
            "cors" => Some(Self::Cors),
            "websocket" => Some(Self::Websocket),
            _ => None,
        }
    }

    /// Returns the mode token.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Navigate => "navigate",
            Self::SameOrigin => "same-origin",
            Self::NoCors => "no-cors",
            Self::Cors => "cors",
            Self::Websocket => "websocket",
        }
    }

    /// Returns true for top-level or nested navigations.
    pub fn is_navigation(&self) -> bool {
        matches!(self, Self::Navigate)
    }

    /// Mode of the rebuilt outbound request.
    ///
    /// The outbound request always targets the proxy origin, so only
    /// `same-origin` and `cors` remain meaningful.
    pub fn outbound(&self) -> Self {
        match self {
            Self::SameOrigin | Self::NoCors => Self::SameOrigin,
            _ => Self::Cors,
        }
    }
}

impl std::fmt::Display for RequestMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request destination, as reported by `Sec-Fetch-Dest`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Destination {
    #[default]
    Empty,
    Document,
    Embed,
    Object,
    Script,
    Style,
    Worker,
    Image,
    Font,
    Iframe,
    /// Any other token, kept verbatim.
    Other(String),
}

impl Destination {
    /// Parses a destination token. Never fails.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "empty" => Self::Empty,
            "document" => Self::Document,
            "embed" => Self::Embed,
            "object" => Self::Object,
            "script" => Self::Script,
            "style" => Self::Style,
            "worker" => Self::Worker,
            "image" => Self::Image,
            "font" => Self::Font,
            "iframe" => Self::Iframe,
            other => Self::Other(other.to_string()),
        }
    }

    /// Returns the destination token (`""` for empty).
    pub fn as_str(&self) -> &str {
        match self {
            Self::Empty => "",
            Self::Document => "document",
            Self::Embed => "embed",
            Self::Object => "object",
            Self::Script => "script",
            Self::Style => "style",
            Self::Worker => "worker",
            Self::Image => "image",
            Self::Font => "font",
            Self::Iframe => "iframe",
            Self::Other(token) => token,
        }
    }

    /// Destinations whose document URL must match the proxied URL, so a
    /// mismatch is answered with a redirect rather than a rewritten fetch.
    pub fn requires_redirect(&self) -> bool {
        matches!(
            self,
            Self::Document | Self::Embed | Self::Object | Self::Script | Self::Style | Self::Worker
        )
    }
}

impl From<String> for Destination {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<Destination> for String {
    fn from(destination: Destination) -> Self {
        destination.as_str().to_string()
    }
}

/// Credentials mode of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Credentials {
    Omit,
    #[default]
    SameOrigin,
    Include,
}

/// Cache mode of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheMode {
    #[default]
    Default,
    NoStore,
    Reload,
    NoCache,
    ForceCache,
    OnlyIfCached,
}

/// Redirect handling of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RedirectMode {
    #[default]
    Follow,
    Error,
    Manual,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbound_mode() {
        assert_eq!(RequestMode::SameOrigin.outbound(), RequestMode::SameOrigin);
        assert_eq!(RequestMode::NoCors.outbound(), RequestMode::SameOrigin);
        assert_eq!(RequestMode::Cors.outbound(), RequestMode::Cors);
        assert_eq!(RequestMode::Navigate.outbound(), RequestMode::Cors);
        assert_eq!(RequestMode::Websocket.outbound(), RequestMode::Cors);
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!(RequestMode::parse("Navigate"), Some(RequestMode::Navigate));
        assert_eq!(RequestMode::parse("no-cors"), Some(RequestMode::NoCors));
        assert_eq!(RequestMode::parse("nested-navigate"), None);
        for mode in [
            RequestMode::Navigate,
            RequestMode::SameOrigin,
            RequestMode::NoCors,
            RequestMode::Cors,
            RequestMode::Websocket,
        ] {
            assert_eq!(RequestMode::parse(mode.as_str()), Some(mode));
        }
    }

    #[test]
    fn test_mode_serde() {
        let json = serde_json::to_string(&RequestMode::SameOrigin).unwrap();
        assert_eq!(json, "\"same-origin\"");
    }

    #[test]
    fn test_destination_requires_redirect() {
        for token in ["document", "embed", "object", "script", "style", "worker"] {
            assert!(Destination::parse(token).requires_redirect(), "{token}");
        }
        for token in ["", "image", "font", "iframe", "audio"] {
            assert!(!Destination::parse(token).requires_redirect(), "{token}");
        }
    }

    #[test]
    fn test_destination_keeps_unknown_tokens() {
        let dest = Destination::parse("Audio");
        assert_eq!(dest, Destination::Other("audio".to_string()));
        assert_eq!(dest.as_str(), "audio");
        assert_eq!(Destination::parse("empty"), Destination::Empty);
    }
}
