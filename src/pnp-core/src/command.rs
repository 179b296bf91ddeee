// SPDX-FileCopyrightText: 2026 Stan Grams <sjg@haxx.space>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Configurable command templates and placeholder substitution.
//!
//! Every operation the driver performs is rendered from a template looked up
//! by (operation kind, device id). A template keyed to a specific device id
//! wins over the `*` wildcard entry; the wildcard is consulted only when no
//! specific entry exists. Kinds that are not device-scoped only ever use the
//! wildcard slot.
//!
//! Templates contain placeholders of the form `{Name}` or `{Name:Format}`
//! where `Format` is a printf-style conversion defaulting to `%s`. A
//! placeholder whose value is unset substitutes to empty text, which lets
//! firmware dialects simply omit fields they do not use.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Operation kinds a template (or pattern) can be registered for.
///
/// The three `*Pattern` kinds hold regexes rather than outgoing commands:
/// `ConfirmPattern` matches a line that completes a sent command,
/// `PositionReportPattern` matches an asynchronous status line with one
/// named capture group per axis, and `MoveCompletePattern` matches the line
/// that signals physical motion has finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    ConfirmPattern,
    PositionReportPattern,
    Connect,
    Enable,
    Disable,
    Home,
    PositionSet,
    PumpOn,
    PumpOff,
    MoveTo,
    MoveCompletePattern,
    Pick,
    Place,
    ActuateSwitch,
    ActuateValue,
}

impl CommandKind {
    /// Whether a device-specific entry may exist for this kind.
    pub fn device_scoped(self) -> bool {
        matches!(
            self,
            CommandKind::MoveTo
                | CommandKind::MoveCompletePattern
                | CommandKind::Pick
                | CommandKind::Place
                | CommandKind::ActuateSwitch
                | CommandKind::ActuateValue
        )
    }
}

/// One template entry: a kind, an optional device id, and the text lines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    /// `None` or `*` is the wildcard slot.
    #[serde(default)]
    pub device_id: Option<String>,
    pub kind: CommandKind,
    lines: Vec<String>,
}

impl Command {
    pub fn new(device_id: Option<String>, kind: CommandKind, text: &str) -> Self {
        let mut command = Self {
            device_id,
            kind,
            lines: Vec::new(),
        };
        command.set_text(text);
        command
    }

    /// Replace the template text. CR characters are dropped and the text is
    /// stored as individual lines.
    pub fn set_text(&mut self, text: &str) {
        self.lines = text
            .trim()
            .replace('\r', "")
            .split('\n')
            .map(str::to_string)
            .collect();
    }

    /// The template text, lines joined with newlines.
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    fn is_wildcard(&self) -> bool {
        self.device_id.as_deref().map(|id| id == "*").unwrap_or(true)
    }
}

/// The configurable command table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandSet {
    commands: Vec<Command>,
}

impl CommandSet {
    pub fn new(commands: Vec<Command>) -> Self {
        Self { commands }
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    fn get_exact(&self, device_id: Option<&str>, kind: CommandKind) -> Option<usize> {
        match device_id {
            Some(id) if id != "*" => self
                .commands
                .iter()
                .position(|c| c.kind == kind && c.device_id.as_deref() == Some(id)),
            _ => self
                .commands
                .iter()
                .position(|c| c.kind == kind && c.is_wildcard()),
        }
    }

    /// Look up the template for a device, falling back to the wildcard when
    /// no device-specific entry exists.
    pub fn get(&self, device_id: Option<&str>, kind: CommandKind) -> Option<&Command> {
        if kind.device_scoped() {
            if let Some(id) = device_id {
                if let Some(i) = self.get_exact(Some(id), kind) {
                    return self.commands.get(i);
                }
            }
        }
        self.get_exact(None, kind).map(|i| &self.commands[i])
    }

    /// The template text for a device, if configured.
    pub fn text(&self, device_id: Option<&str>, kind: CommandKind) -> Option<String> {
        self.get(device_id, kind).map(Command::text)
    }

    /// Set, replace, or (with empty text) remove a template entry. Only the
    /// exact (device, kind) slot is touched; setting a device-specific entry
    /// never disturbs the wildcard.
    pub fn set(&mut self, device_id: Option<&str>, kind: CommandKind, text: &str) {
        let slot = self.get_exact(device_id, kind);
        if text.trim().is_empty() {
            if let Some(i) = slot {
                self.commands.remove(i);
            }
            return;
        }
        match slot {
            Some(i) => self.commands[i].set_text(text),
            None => {
                let id = device_id.filter(|id| *id != "*").map(str::to_string);
                self.commands.push(Command::new(id, kind, text));
            }
        }
    }
}

/// A value bound to a template placeholder.
#[derive(Debug, Clone, PartialEq)]
pub enum TemplateValue {
    Text(String),
    Number(f64),
    Integer(i64),
    Switch(bool),
}

impl TemplateValue {
    fn display(&self) -> String {
        match self {
            TemplateValue::Text(s) => s.clone(),
            TemplateValue::Number(v) => format!("{v}"),
            TemplateValue::Integer(v) => format!("{v}"),
            TemplateValue::Switch(v) => format!("{v}"),
        }
    }

    fn as_number(&self) -> f64 {
        match self {
            TemplateValue::Text(s) => s.parse().unwrap_or(0.0),
            TemplateValue::Number(v) => *v,
            TemplateValue::Integer(v) => *v as f64,
            TemplateValue::Switch(v) => *v as i64 as f64,
        }
    }

    fn as_integer(&self) -> i64 {
        match self {
            TemplateValue::Text(s) => s.parse().unwrap_or(0),
            TemplateValue::Number(v) => *v as i64,
            TemplateValue::Integer(v) => *v,
            TemplateValue::Switch(v) => *v as i64,
        }
    }
}

impl From<&str> for TemplateValue {
    fn from(value: &str) -> Self {
        TemplateValue::Text(value.to_string())
    }
}

impl From<String> for TemplateValue {
    fn from(value: String) -> Self {
        TemplateValue::Text(value)
    }
}

impl From<f64> for TemplateValue {
    fn from(value: f64) -> Self {
        TemplateValue::Number(value)
    }
}

impl From<i64> for TemplateValue {
    fn from(value: i64) -> Self {
        TemplateValue::Integer(value)
    }
}

impl From<u32> for TemplateValue {
    fn from(value: u32) -> Self {
        TemplateValue::Integer(value as i64)
    }
}

impl From<bool> for TemplateValue {
    fn from(value: bool) -> Self {
        TemplateValue::Switch(value)
    }
}

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{(\w+)(?::([^}]+))?\}").expect("placeholder pattern"))
}

/// Render a printf-style format: literal text around one conversion.
/// Supported conversions are `%s`, `%d`, `%f` and precision forms like
/// `%.4f`; literal prefixes glue axis letters to values (`X%.4f` renders
/// as `X12.5000`, and to nothing at all when the placeholder is unset).
/// A format with no conversion is emitted literally.
fn format_value(spec: &str, value: &TemplateValue) -> String {
    let Some(start) = spec.find('%') else {
        return spec.to_string();
    };
    let tail = &spec[start + 1..];
    let Some(conv_offset) = tail.find(|c: char| matches!(c, 's' | 'd' | 'f')) else {
        return spec.to_string();
    };
    let (middle, rest) = tail.split_at(conv_offset);
    let rendered = match rest.chars().next().unwrap_or('s') {
        'd' => format!("{}", value.as_integer()),
        'f' => {
            let precision = middle
                .strip_prefix('.')
                .and_then(|p| p.parse::<usize>().ok())
                .unwrap_or(6);
            format!("{:.*}", precision, value.as_number())
        }
        _ => value.display(),
    };
    format!("{}{}{}", &spec[..start], rendered, &rest[1..])
}

/// Replace every `{name}` / `{name:format}` placeholder whose name matches
/// with the formatted value, or with empty text when the value is `None`.
/// Placeholders with other names are left untouched for later passes.
pub fn substitute_variable(command: &str, name: &str, value: Option<TemplateValue>) -> String {
    placeholder_pattern()
        .replace_all(command, |caps: &regex::Captures<'_>| {
            if &caps[1] != name {
                return caps[0].to_string();
            }
            match &value {
                Some(v) => format_value(caps.get(2).map_or("%s", |m| m.as_str()), v),
                None => String::new(),
            }
        })
        .into_owned()
}
