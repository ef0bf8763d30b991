use std::collections::BTreeMap;

use serde_json::Value;

use super::command_registry::{
    CommandSpec, NO_ARG_COMMANDS, RAW_ARG_COMMANDS, SINGLE_PATH_COMMANDS,
};

/// One parsed line of chat input.
///
/// Plain text (including an empty line) becomes a `submit` intent carrying the
/// untouched text in `prompt`; the turn controller decides whether it is the
/// exit sentinel, a valid question, or an empty submission to reject.
#[derive(Debug, Clone, PartialEq)]
pub struct Intent {
    pub action: String,
    pub raw: String,
    pub prompt: Option<String>,
    pub command_args: BTreeMap<String, Value>,
}

impl Intent {
    fn new(action: &str, raw: &str) -> Self {
        Self {
            action: action.to_string(),
            raw: raw.to_string(),
            prompt: None,
            command_args: BTreeMap::new(),
        }
    }
}

fn find_action(command: &str, specs: &[CommandSpec]) -> Option<&'static str> {
    specs
        .iter()
        .find(|spec| spec.command == command)
        .map(|spec| spec.action)
}

fn parse_path_args(arg: &str) -> Vec<String> {
    if arg.trim().is_empty() {
        return Vec::new();
    }
    match shell_words::split(arg) {
        Ok(parts) => parts
            .into_iter()
            .filter(|value| !value.is_empty())
            .collect(),
        Err(_) => arg
            .split_whitespace()
            .map(str::to_string)
            .filter(|value| !value.is_empty())
            .collect(),
    }
}

fn parse_single_path_arg(arg: &str) -> String {
    let parts = parse_path_args(arg);
    match parts.len() {
        0 => String::new(),
        1 => parts[0].clone(),
        _ => parts.join(" "),
    }
}

pub fn parse_intent(text: &str) -> Intent {
    let raw_trimmed = text.trim();

    if let Some(slash_tail) = raw_trimmed.strip_prefix('/') {
        let command_len = slash_tail
            .chars()
            .take_while(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
            .count();
        if command_len > 0 {
            let command = slash_tail[..command_len].to_ascii_lowercase();
            let remainder = &slash_tail[command_len..];
            let arg = if remainder.is_empty() {
                ""
            } else {
                remainder.trim()
            };

            if let Some(action) = find_action(&command, RAW_ARG_COMMANDS) {
                let mut intent = Intent::new(action, text);
                intent
                    .command_args
                    .insert("model".to_string(), Value::String(arg.to_string()));
                return intent;
            }

            if let Some(action) = find_action(&command, SINGLE_PATH_COMMANDS) {
                let mut intent = Intent::new(action, text);
                intent.command_args.insert(
                    "path".to_string(),
                    Value::String(parse_single_path_arg(arg)),
                );
                return intent;
            }

            if let Some(action) = find_action(&command, NO_ARG_COMMANDS) {
                return Intent::new(action, text);
            }

            let mut intent = Intent::new("unknown", text);
            intent
                .command_args
                .insert("command".to_string(), Value::String(command));
            intent
                .command_args
                .insert("arg".to_string(), Value::String(arg.to_string()));
            return intent;
        }
    }

    let mut intent = Intent::new("submit", text);
    intent.prompt = Some(text.to_string());
    intent
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::parse_intent;

    #[test]
    fn parse_upload_basic() {
        let intent = parse_intent("/upload problem.png");
        assert_eq!(intent.action, "upload");
        assert_eq!(intent.command_args["path"], json!("problem.png"));
    }

    #[test]
    fn parse_upload_quoted_path() {
        let intent = parse_intent("/upload \"/tmp/page 12.jpg\"");
        assert_eq!(intent.action, "upload");
        assert_eq!(intent.command_args["path"], json!("/tmp/page 12.jpg"));
    }

    #[test]
    fn image_is_an_alias_for_upload() {
        let intent = parse_intent("  /IMAGE   /tmp/a.png  ");
        assert_eq!(intent.action, "upload");
        assert_eq!(intent.command_args["path"], json!("/tmp/a.png"));
    }

    #[test]
    fn parse_model_command() {
        let intent = parse_intent("/model gpt-4o-mini");
        assert_eq!(intent.action, "set_model");
        assert_eq!(intent.command_args["model"], json!("gpt-4o-mini"));
    }

    #[test]
    fn parse_no_arg_commands() {
        assert_eq!(parse_intent("/help").action, "help");
        assert_eq!(parse_intent("/status").action, "status");
    }

    #[test]
    fn plain_text_is_submitted_verbatim() {
        let intent = parse_intent("  what is 2+2?");
        assert_eq!(intent.action, "submit");
        assert_eq!(intent.prompt.as_deref(), Some("  what is 2+2?"));
    }

    #[test]
    fn empty_line_is_still_a_submission() {
        let intent = parse_intent("");
        assert_eq!(intent.action, "submit");
        assert_eq!(intent.prompt.as_deref(), Some(""));
    }

    #[test]
    fn exit_sentinel_is_left_to_the_controller() {
        let intent = parse_intent("EXIT");
        assert_eq!(intent.action, "submit");
        assert_eq!(intent.prompt.as_deref(), Some("EXIT"));
    }

    #[test]
    fn parse_unknown_command() {
        let intent = parse_intent("/magic foo bar");
        assert_eq!(intent.action, "unknown");
        assert_eq!(intent.command_args["command"], json!("magic"));
        assert_eq!(intent.command_args["arg"], json!("foo bar"));
    }

    #[test]
    fn bare_slash_is_plain_text() {
        let intent = parse_intent("/ 3");
        assert_eq!(intent.action, "submit");
        assert_eq!(intent.prompt.as_deref(), Some("/ 3"));
    }
}
