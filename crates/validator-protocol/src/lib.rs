use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod event;

pub use event::RunEvent;

/// Commands the validator script accepts. Anything else is rejected before launch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ValidatorCommand {
    Crawl,
    Analytics,
    Performance,
    Html,
    Robots,
    All,
    Clean,
}

impl ValidatorCommand {
    pub const ALL: [ValidatorCommand; 7] = [
        ValidatorCommand::Crawl,
        ValidatorCommand::Analytics,
        ValidatorCommand::Performance,
        ValidatorCommand::Html,
        ValidatorCommand::Robots,
        ValidatorCommand::All,
        ValidatorCommand::Clean,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ValidatorCommand::Crawl => "crawl",
            ValidatorCommand::Analytics => "analytics",
            ValidatorCommand::Performance => "performance",
            ValidatorCommand::Html => "html",
            ValidatorCommand::Robots => "robots",
            ValidatorCommand::All => "all",
            ValidatorCommand::Clean => "clean",
        }
    }

    /// Only the html dump can be saved to the output directory.
    pub fn supports_save(self) -> bool {
        matches!(self, ValidatorCommand::Html)
    }

    /// Only analytics accepts a single-page selector.
    pub fn supports_page(self) -> bool {
        matches!(self, ValidatorCommand::Analytics)
    }
}

impl fmt::Display for ValidatorCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidCommand(pub String);

impl fmt::Display for InvalidCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("No command specified.")
        } else {
            write!(f, "Invalid command: {}", self.0)
        }
    }
}

impl std::error::Error for InvalidCommand {}

impl FromStr for ValidatorCommand {
    type Err = InvalidCommand;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        ValidatorCommand::ALL
            .into_iter()
            .find(|command| command.as_str() == trimmed)
            .ok_or_else(|| InvalidCommand(trimmed.to_string()))
    }
}

/// A run as submitted by the dashboard form.
///
/// Every field is optional on the wire so that a malformed submission still reaches
/// the runner and is answered with a failure event instead of a transport error.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunRequest {
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub verbose: bool,
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub save: bool,
    #[serde(default)]
    pub page: Option<String>,
}

impl RunRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    pub fn validated_command(&self) -> Result<ValidatorCommand, InvalidCommand> {
        self.command.parse()
    }

    /// Target URL, or `None` when the script should use its configured default.
    pub fn target_url(&self) -> Option<&str> {
        non_empty(self.url.as_deref())
    }

    pub fn page(&self) -> Option<&str> {
        non_empty(self.page.as_deref())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FlagValue {
    Bool(bool),
    Number(u64),
    Text(String),
}

/// Accepts JSON booleans and numbers, and the form encodings `true`, `on`, `1` and `yes`.
/// Any other text is read as unset.
fn deserialize_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match FlagValue::deserialize(deserializer)? {
        FlagValue::Bool(value) => value,
        FlagValue::Number(value) => value != 0,
        FlagValue::Text(text) => matches!(
            text.trim().to_ascii_lowercase().as_str(),
            "true" | "on" | "1" | "yes"
        ),
    })
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_allowed_command() {
        for command in ValidatorCommand::ALL {
            let parsed: ValidatorCommand = command.as_str().parse().expect("parse");
            assert_eq!(parsed, command);
        }
        assert_eq!(
            " robots ".parse::<ValidatorCommand>(),
            Ok(ValidatorCommand::Robots)
        );
    }

    #[test]
    fn rejects_unknown_command_with_message() {
        let err = "bogus".parse::<ValidatorCommand>().unwrap_err();
        assert_eq!(err.to_string(), "Invalid command: bogus");
        assert!("HTML".parse::<ValidatorCommand>().is_err());
        assert!("".parse::<ValidatorCommand>().is_err());
    }

    #[test]
    fn empty_command_asks_for_one() {
        let err = "  ".parse::<ValidatorCommand>().unwrap_err();
        assert_eq!(err.to_string(), "No command specified.");
        let request: RunRequest = serde_json::from_str("{}").expect("deserialize");
        assert_eq!(
            request.validated_command().unwrap_err().to_string(),
            "No command specified."
        );
    }

    #[test]
    fn flags_accept_form_encodings() {
        let request: RunRequest =
            serde_json::from_str(r#"{"command":"html","verbose":"on","save":"1"}"#)
                .expect("deserialize");
        assert!(request.verbose);
        assert!(request.save);

        let request: RunRequest =
            serde_json::from_str(r#"{"command":"html","verbose":"off","save":false}"#)
                .expect("deserialize");
        assert!(!request.verbose);
        assert!(!request.save);

        let request: RunRequest =
            serde_json::from_str(r#"{"command":"html","verbose":true,"save":"garbage"}"#)
                .expect("deserialize");
        assert!(request.verbose);
        assert!(!request.save);
    }

    #[test]
    fn only_html_saves_and_only_analytics_pages() {
        for command in ValidatorCommand::ALL {
            assert_eq!(command.supports_save(), command == ValidatorCommand::Html);
            assert_eq!(command.supports_page(), command == ValidatorCommand::Analytics);
        }
    }

    #[test]
    fn blank_url_and_page_are_absent() {
        let request = RunRequest {
            command: "analytics".to_string(),
            url: Some("   ".to_string()),
            verbose: false,
            save: false,
            page: Some("".to_string()),
        };
        assert_eq!(request.target_url(), None);
        assert_eq!(request.page(), None);

        let request = RunRequest {
            url: Some(" https://example.com ".to_string()),
            page: Some("/pricing".to_string()),
            ..request
        };
        assert_eq!(request.target_url(), Some("https://example.com"));
        assert_eq!(request.page(), Some("/pricing"));
    }

    #[test]
    fn request_defaults_optional_fields() {
        let request: RunRequest =
            serde_json::from_str(r#"{"command":"crawl"}"#).expect("deserialize");
        assert_eq!(request, RunRequest::new("crawl"));
    }
}
