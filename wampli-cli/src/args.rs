use std::sync::LazyLock;

use anyhow::{
    Error,
    Result,
};
use regex::{
    Captures,
    Regex,
};
use wampli::core::{
    types::{
        Dictionary,
        HashMap,
        List,
        Value,
    },
    uri::{
        MatchStyle,
        WildcardUri,
    },
};

/// Aliases the user has defined for URIs.
pub type Aliases = HashMap<String, String>;

/// Matches `wamp.session.get(12345, key=value)`.
static FUNCTION_STYLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^((?:(?:[0-9a-z_]+\.)|\.)*(?:[0-9a-z_]+)?)\s?\((.*)\)$").unwrap()
});

/// Matches `key=value`.
static KEYWORD_ARGUMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([a-z][a-z0-9_]{2,})\s*=(.+)$").unwrap());

/// Matches `$alias`, optionally terminated by another `$`.
static ALIAS_REFERENCE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\$(\w+)\$?").unwrap());

/// Splits the arguments of a function-style call, such as `a.b(hello, world)`.
///
/// Returns `None` if the text is not a function-style call. Otherwise, the URI is the first item,
/// followed by each argument as written.
pub fn split_function_style(text: &str) -> Option<Vec<String>> {
    let captures = FUNCTION_STYLE.captures(text)?;
    let mut args = Vec::from_iter([captures[1].to_owned()]);
    args.extend(split_top_level_commas(&captures[2]));
    Some(args)
}

/// Splits on commas that are not nested in brackets or quotes.
fn split_top_level_commas(text: &str) -> Vec<String> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    let mut args = Vec::new();
    let mut depth = 0usize;
    let mut quote = None;
    let mut start = 0;
    for (i, c) in text.char_indices() {
        match (quote, c) {
            (Some(open), c) if c == open => quote = None,
            (Some(_), _) => (),
            (None, '"' | '\'') => quote = Some(c),
            (None, '[' | '{' | '(') => depth += 1,
            (None, ']' | '}' | ')') => depth = depth.saturating_sub(1),
            (None, ',') if depth == 0 => {
                args.push(text[start..i].trim().to_owned());
                start = i + 1;
            }
            _ => (),
        }
    }
    args.push(text[start..].trim().to_owned());
    args
}

/// Splits a line of arguments, either function style or shell style.
pub fn split_arg_string(text: &str) -> Result<Vec<String>> {
    match split_function_style(text) {
        Some(args) => Ok(args),
        None => shlex::split(text).ok_or_else(|| Error::msg("unbalanced quotes in arguments")),
    }
}

/// Splits a `key=value` argument into its key and value.
///
/// Arguments that are not keyword arguments come back whole, without a key.
pub fn split_kwarg(arg: &str) -> (Option<&str>, &str) {
    match KEYWORD_ARGUMENT.captures(arg) {
        Some(captures) => match (captures.get(1), captures.get(2)) {
            (Some(key), Some(value)) => (Some(key.as_str()), value.as_str()),
            _ => (None, arg),
        },
        None => (None, arg),
    }
}

/// Parses an argument value as YAML, so that `5` is an integer and `[a, b]` is a list.
pub fn parse_arg_value(value: &str) -> Result<Value> {
    if value.is_empty() {
        return Ok(Value::Null);
    }
    let yaml = serde_yaml::from_str::<serde_yaml::Value>(value)
        .map_err(|err| Error::new(err).context(format!("invalid argument {value:?}")))?;
    value_from_yaml(yaml)
}

fn value_from_yaml(yaml: serde_yaml::Value) -> Result<Value> {
    match yaml {
        serde_yaml::Value::Null => Ok(Value::Null),
        serde_yaml::Value::Bool(val) => Ok(Value::Bool(val)),
        serde_yaml::Value::Number(number) => {
            if let Some(val) = number.as_i64() {
                Ok(Value::Integer(val))
            } else if let Some(val) = number.as_u64() {
                Ok(Value::UnsignedInteger(val))
            } else {
                number
                    .as_f64()
                    .map(Value::Float)
                    .ok_or_else(|| Error::msg(format!("number {number} is out of range")))
            }
        }
        serde_yaml::Value::String(val) => Ok(Value::String(val)),
        serde_yaml::Value::Sequence(values) => values
            .into_iter()
            .map(value_from_yaml)
            .collect::<Result<List>>()
            .map(Value::List),
        serde_yaml::Value::Mapping(mapping) => mapping
            .into_iter()
            .map(|(key, value)| Ok((key_from_yaml(key)?, value_from_yaml(value)?)))
            .collect::<Result<Dictionary>>()
            .map(Value::Dictionary),
        serde_yaml::Value::Tagged(tagged) => value_from_yaml(tagged.value),
    }
}

fn key_from_yaml(key: serde_yaml::Value) -> Result<String> {
    match key {
        serde_yaml::Value::String(key) => Ok(key),
        serde_yaml::Value::Bool(key) => Ok(key.to_string()),
        serde_yaml::Value::Number(key) => Ok(key.to_string()),
        _ => Err(Error::msg("dictionary keys must be scalars")),
    }
}

/// Parses arguments into positional and keyword arguments.
pub fn parse_args<I, S>(args: I) -> Result<(List, Dictionary)>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut arguments = List::default();
    let mut arguments_keyword = Dictionary::default();
    for arg in args {
        let (key, value) = split_kwarg(arg.as_ref());
        let value = parse_arg_value(value)?;
        match key {
            Some(key) => {
                arguments_keyword.insert(key.to_owned(), value);
            }
            None => arguments.push(value),
        }
    }
    Ok((arguments, arguments_keyword))
}

/// A URI that may be a pattern for subscriptions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UriPattern {
    pub uri: WildcardUri,
    pub match_style: Option<MatchStyle>,
}

/// Parses a glob-like URI.
///
/// `*` as a whole component matches any single component (`a.*.b` becomes the wildcard pattern
/// `a..b`), and a trailing `**` matches any suffix (`a.**` becomes the prefix pattern `a`).
pub fn parse_pattern(uri: &str) -> Result<UriPattern> {
    if let Some(position) = uri.find("**") {
        let prefix = match uri.strip_suffix("**") {
            Some(prefix) if prefix.len() == position => prefix,
            _ => return Err(Error::msg("'**' can only occur at the end")),
        };
        let prefix = prefix.strip_suffix('.').unwrap_or(prefix);
        if prefix.is_empty() {
            return Err(Error::msg("a prefix pattern needs at least one component"));
        }
        return Ok(UriPattern {
            uri: WildcardUri::try_from(prefix)?,
            match_style: Some(MatchStyle::Prefix),
        });
    }

    if uri.split('.').any(|component| component == "*") {
        let pattern = uri
            .split('.')
            .map(|component| if component == "*" { "" } else { component })
            .collect::<Vec<_>>()
            .join(".");
        return Ok(UriPattern {
            uri: WildcardUri::try_from(pattern)?,
            match_style: Some(MatchStyle::Wildcard),
        });
    }

    Ok(UriPattern {
        uri: WildcardUri::try_from(uri)?,
        match_style: None,
    })
}

/// Replaces aliases in a URI.
///
/// A URI that is itself an alias name is replaced entirely. Afterwards, every `$name` reference
/// to a known alias is substituted; a `$` directly after the name ends the reference.
pub fn resolve_aliases(uri: &str, aliases: &Aliases) -> String {
    let uri = aliases.get(uri).map(String::as_str).unwrap_or(uri);
    ALIAS_REFERENCE
        .replace_all(uri, |captures: &Captures| match aliases.get(&captures[1]) {
            Some(alias) => alias.clone(),
            None => captures[0].to_owned(),
        })
        .into_owned()
}

/// Resolves aliases in a URI and parses the result as a pattern.
pub fn ready_uri(uri: &str, aliases: &Aliases) -> Result<UriPattern> {
    if uri.is_empty() {
        return Err(Error::msg("please provide a URI"));
    }
    parse_pattern(&resolve_aliases(uri, aliases))
}
