use std::{
    fmt::Display,
    sync::LazyLock,
};

use regex::Regex;
use serde::{
    Deserialize,
    Serialize,
    de::{
        Unexpected,
        Visitor,
    },
};
use thiserror::Error;

/// Error for an invalid URI.
#[derive(Debug, Error)]
#[error("invalid URI: {0:?}")]
pub struct InvalidUri(String);

/// Validates a URI under the relaxed WAMP rules, where components may be any non-empty text
/// without whitespace, `.` or `#`.
pub fn validate_strict_uri<S>(uri: S) -> Result<(), InvalidUri>
where
    S: AsRef<str>,
{
    static RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^([^\s.#]+\.)*([^\s.#]+)$").unwrap());
    if !RE.is_match(uri.as_ref()) {
        return Err(InvalidUri(uri.as_ref().to_owned()));
    }
    Ok(())
}

/// Validates a URI pattern, where components may be empty to act as wildcards.
pub fn validate_wildcard_uri<S>(uri: S) -> Result<(), InvalidUri>
where
    S: AsRef<str>,
{
    static RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^([^\s.#]*\.)*([^\s.#]*)$").unwrap());
    if !RE.is_match(uri.as_ref()) {
        return Err(InvalidUri(uri.as_ref().to_owned()));
    }
    Ok(())
}

/// A uniform resource identifier, naming realms, topics, procedures and errors.
#[derive(Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct Uri(String);

impl Uri {
    /// Constructs a URI directly from a value known to be valid, skipping validation.
    pub(crate) fn from_known<S>(value: S) -> Self
    where
        S: Into<String>,
    {
        Self(value.into())
    }

    /// Splits the URI into its components.
    pub fn split(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }
}

impl Display for Uri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl AsRef<str> for Uri {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Uri {
    type Error = InvalidUri;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_strict_uri(&value)?;
        Ok(Self(value))
    }
}

impl TryFrom<&str> for Uri {
    type Error = InvalidUri;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        validate_strict_uri(value)?;
        Ok(Self(value.to_owned()))
    }
}

impl From<Uri> for String {
    fn from(value: Uri) -> Self {
        value.0
    }
}

struct UriVisitor;

impl<'de> Visitor<'de> for UriVisitor {
    type Value = Uri;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(formatter, "a URI")
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Uri::try_from(v).map_err(|_| E::invalid_value(Unexpected::Str(v), &self))
    }
}

impl<'de> Deserialize<'de> for Uri {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_str(UriVisitor)
    }
}

/// [`Uri`], but with empty components allowed, for pattern-based subscriptions and
/// registrations.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Serialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct WildcardUri(String);

impl Display for WildcardUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl AsRef<str> for WildcardUri {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for WildcardUri {
    type Error = InvalidUri;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_wildcard_uri(&value)?;
        Ok(Self(value))
    }
}

impl TryFrom<&str> for WildcardUri {
    type Error = InvalidUri;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        validate_wildcard_uri(value)?;
        Ok(Self(value.to_owned()))
    }
}

impl From<Uri> for WildcardUri {
    fn from(value: Uri) -> Self {
        Self(value.0)
    }
}

struct WildcardUriVisitor;

impl<'de> Visitor<'de> for WildcardUriVisitor {
    type Value = WildcardUri;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(formatter, "a wildcard URI")
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        WildcardUri::try_from(v).map_err(|_| E::invalid_value(Unexpected::Str(v), &self))
    }
}

impl<'de> Deserialize<'de> for WildcardUri {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_str(WildcardUriVisitor)
    }
}

/// How a subscription or registration is matched against concrete URIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchStyle {
    Prefix,
    Wildcard,
}

impl MatchStyle {
    /// The value of the `match` option on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prefix => "prefix",
            Self::Wildcard => "wildcard",
        }
    }
}

impl Display for MatchStyle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for MatchStyle {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "prefix" => Ok(Self::Prefix),
            "wildcard" => Ok(Self::Wildcard),
            _ => Err(Self::Error::msg(format!("invalid match style: {value}"))),
        }
    }
}

#[cfg(test)]
mod uri_test {
    use crate::core::uri::{
        MatchStyle,
        Uri,
        WildcardUri,
        validate_strict_uri,
        validate_wildcard_uri,
    };

    #[test]
    fn validates_strict_uris() {
        assert_matches::assert_matches!(validate_strict_uri("com"), Ok(()));
        assert_matches::assert_matches!(validate_strict_uri("com.example.add"), Ok(()));
        assert_matches::assert_matches!(validate_strict_uri("wamp.session.get"), Ok(()));
        assert_matches::assert_matches!(validate_strict_uri("com.Example.ADD"), Ok(()));
        assert_matches::assert_matches!(validate_strict_uri("com.example..add"), Err(_));
        assert_matches::assert_matches!(validate_strict_uri(".com"), Err(_));
        assert_matches::assert_matches!(validate_strict_uri("com."), Err(_));
        assert_matches::assert_matches!(validate_strict_uri("com.exa mple"), Err(_));
        assert_matches::assert_matches!(validate_strict_uri("com.example#"), Err(_));
        assert_matches::assert_matches!(validate_strict_uri(""), Err(_));
    }

    #[test]
    fn validates_wildcard_uris() {
        assert_matches::assert_matches!(validate_wildcard_uri("com.example.topic"), Ok(()));
        assert_matches::assert_matches!(validate_wildcard_uri("com..topic"), Ok(()));
        assert_matches::assert_matches!(validate_wildcard_uri("..a..."), Ok(()));
        assert_matches::assert_matches!(validate_wildcard_uri("com.exa mple"), Err(_));
        assert_matches::assert_matches!(validate_wildcard_uri("com.#"), Err(_));
    }

    #[test]
    fn fails_deserialization_invalid_uri() {
        assert_matches::assert_matches!(serde_json::from_str::<Uri>(r#""com..add""#), Err(err) => {
            assert!(err.to_string().contains("expected a URI"));
        });
        assert_matches::assert_matches!(serde_json::from_str::<WildcardUri>(r#""com. .add""#), Err(err) => {
            assert!(err.to_string().contains("expected a wildcard URI"));
        });
    }

    #[test]
    fn parses_match_styles() {
        assert_matches::assert_matches!(MatchStyle::try_from("prefix"), Ok(MatchStyle::Prefix));
        assert_matches::assert_matches!(
            MatchStyle::try_from("wildcard"),
            Ok(MatchStyle::Wildcard)
        );
        assert_matches::assert_matches!(MatchStyle::try_from("exact"), Err(_));
    }
}
