use wampli::{
    core::types::{
        Dictionary,
        List,
        Value,
    },
    session::{
        Event,
        RpcResult,
    },
};

fn to_yaml(value: &Value) -> serde_yaml::Value {
    match value {
        Value::Null => serde_yaml::Value::Null,
        Value::Bool(val) => serde_yaml::Value::Bool(*val),
        Value::Integer(val) => serde_yaml::Value::Number((*val).into()),
        Value::UnsignedInteger(val) => serde_yaml::Value::Number((*val).into()),
        Value::Float(val) => serde_yaml::Value::Number((*val).into()),
        Value::String(val) => serde_yaml::Value::String(val.clone()),
        Value::List(values) => serde_yaml::Value::Sequence(values.iter().map(to_yaml).collect()),
        Value::Dictionary(values) => dictionary_to_yaml(values),
    }
}

/// Keys are sorted so that output is stable.
fn dictionary_to_yaml(values: &Dictionary) -> serde_yaml::Value {
    let mut entries = values.iter().collect::<Vec<_>>();
    entries.sort_by(|(a, _), (b, _)| a.cmp(b));
    serde_yaml::Value::Mapping(
        entries
            .into_iter()
            .map(|(key, value)| (serde_yaml::Value::String(key.clone()), to_yaml(value)))
            .collect(),
    )
}

fn yaml_repr(value: &serde_yaml::Value) -> String {
    let repr = match serde_yaml::to_string(value) {
        Ok(repr) => repr,
        Err(_) => return format!("{value:?}"),
    };
    // Scalars render as a single line; keep the trailing newline only for block output.
    if repr.trim_end().lines().count() <= 1 {
        repr.trim_end().to_owned()
    } else {
        repr
    }
}

/// Converts a value to a YAML-like representation meant for humans.
pub fn human_repr(value: &Value) -> String {
    yaml_repr(&to_yaml(value))
}

/// Converts call results to human-readable text.
///
/// An empty result reads as `ok`. A single positional value is shown on its own; keyword
/// arguments are shown as a mapping next to the positional ones.
pub fn human_result(arguments: &List, arguments_keyword: &Dictionary) -> String {
    let repr = match (arguments.as_slice(), arguments_keyword.is_empty()) {
        ([], true) => return "ok".to_owned(),
        ([value], true) => human_repr(value),
        (_, true) => yaml_repr(&serde_yaml::Value::Sequence(
            arguments.iter().map(to_yaml).collect(),
        )),
        ([], false) => yaml_repr(&dictionary_to_yaml(arguments_keyword)),
        (_, false) => {
            let mut mapping = serde_yaml::Mapping::new();
            mapping.insert(
                serde_yaml::Value::String("args".to_owned()),
                serde_yaml::Value::Sequence(arguments.iter().map(to_yaml).collect()),
            );
            mapping.insert(
                serde_yaml::Value::String("kwargs".to_owned()),
                dictionary_to_yaml(arguments_keyword),
            );
            yaml_repr(&serde_yaml::Value::Mapping(mapping))
        }
    };
    indent_multiline(&repr, "  ", true)
}

/// Formats the result of a call.
pub fn format_rpc_result(result: &RpcResult) -> String {
    human_result(&result.arguments, &result.arguments_keyword)
}

/// Indents the given text if it spans more than one line.
///
/// With `add_newlines`, indented output is surrounded by newlines so that it starts on its own
/// line after a prefix.
pub fn indent_multiline(text: &str, indentation: &str, add_newlines: bool) -> String {
    let lines = text.lines().collect::<Vec<_>>();
    if lines.len() <= 1 {
        return text.to_owned();
    }
    let indented = lines
        .into_iter()
        .map(|line| format!("{indentation}{line}"))
        .collect::<Vec<_>>()
        .join("\n");
    if add_newlines {
        format!("\n{indented}\n")
    } else {
        indented
    }
}

/// Formats a value on one line, as it would be typed as an argument.
fn inline_repr(value: &Value) -> String {
    match value {
        Value::String(val) => val.clone(),
        _ => value.to_string(),
    }
}

/// Formats a URI and its arguments like a function call: `uri(arg, key=value)`.
pub fn format_function_style(uri: &str, arguments: &List, arguments_keyword: &Dictionary) -> String {
    let mut keywords = arguments_keyword.iter().collect::<Vec<_>>();
    keywords.sort_by(|(a, _), (b, _)| a.cmp(b));
    let args = arguments
        .iter()
        .map(inline_repr)
        .chain(
            keywords
                .into_iter()
                .map(|(key, value)| format!("{key}={}", inline_repr(value))),
        )
        .collect::<Vec<_>>()
        .join(", ");
    format!("{uri}({args})")
}

/// Formats a received event in function style, named after its topic.
pub fn format_event(event: &Event) -> String {
    let topic = match &event.topic {
        Some(topic) => topic.to_string(),
        None => format!("subscription {}", event.subscription),
    };
    format_function_style(&topic, &event.arguments, &event.arguments_keyword)
}

#[cfg(test)]
mod format_test {
    use wampli::core::types::{
        Dictionary,
        List,
        Value,
    };

    use crate::format::{
        format_function_style,
        human_repr,
        human_result,
        indent_multiline,
    };

    #[test]
    fn represents_values_for_humans() {
        assert_eq!(human_repr(&Value::from("hello")), "hello");
        assert_eq!(human_repr(&Value::Integer(5)), "5");
        assert_eq!(
            human_repr(&Value::UnsignedInteger(u64::MAX)),
            "18446744073709551615"
        );
        assert_eq!(
            human_repr(&Value::List(List::from_iter([
                Value::from("hey"),
                Value::from("there")
            ]))),
            "- hey\n- there\n"
        );
        assert_eq!(
            human_repr(&Value::Dictionary(Dictionary::from_iter([
                ("b".to_owned(), Value::Integer(2)),
                ("a".to_owned(), Value::Integer(1)),
            ]))),
            "a: 1\nb: 2\n"
        );
    }

    #[test]
    fn reports_empty_results_as_ok() {
        assert_eq!(human_result(&List::default(), &Dictionary::default()), "ok");
        assert_eq!(
            human_result(&List::from_iter([Value::Integer(5)]), &Dictionary::default()),
            "5"
        );
        assert_eq!(
            human_result(
                &List::from_iter([Value::Integer(1), Value::Integer(2)]),
                &Dictionary::default()
            ),
            "\n  - 1\n  - 2\n"
        );
        assert_eq!(
            human_result(
                &List::default(),
                &Dictionary::from_iter([("key".to_owned(), Value::from("value"))])
            ),
            "key: value"
        );
    }

    #[test]
    fn indents_only_multiline_text() {
        assert_eq!(indent_multiline("one line", "  ", true), "one line");
        assert_eq!(indent_multiline("a\nb", "  ", true), "\n  a\n  b\n");
        assert_eq!(indent_multiline("a\nb\n", "> ", false), "> a\n> b");
    }

    #[test]
    fn formats_function_style() {
        assert_eq!(
            format_function_style(
                "wamp.session.get",
                &List::from_iter([Value::Integer(123456789)]),
                &Dictionary::from_iter([("key".to_owned(), Value::from("value"))]),
            ),
            "wamp.session.get(123456789, key=value)"
        );
        assert_eq!(
            format_function_style("a", &List::default(), &Dictionary::default()),
            "a()"
        );
    }
}
