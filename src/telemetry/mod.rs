use std::io::IsTerminal;

use crate::event_bus::event::BusEvent;

pub const CHANNEL_COLOR: &str = "\x1b[32m"; // green
pub const RESET_COLOR: &str = "\x1b[0m";

/// Formatter color mode for telemetry output.
///
/// - [`FormatterMode::Auto`]: detects TTY capability via `stderr.is_terminal()`
/// - [`FormatterMode::Colored`]: always includes color codes
/// - [`FormatterMode::Plain`]: never includes color codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FormatterMode {
    #[default]
    Auto,
    Colored,
    Plain,
}

impl FormatterMode {
    /// Auto-detect formatter mode based on stderr TTY capability.
    pub fn auto_detect() -> Self {
        if std::io::stderr().is_terminal() {
            FormatterMode::Colored
        } else {
            FormatterMode::Plain
        }
    }

    /// Returns true if this mode should use colored output.
    pub fn is_colored(&self) -> bool {
        match self {
            FormatterMode::Auto => std::io::stderr().is_terminal(),
            FormatterMode::Colored => true,
            FormatterMode::Plain => false,
        }
    }
}

/// Render bus events into sink-consumable text.
pub trait TelemetryFormatter: Send + Sync {
    fn render_event(&self, event: &BusEvent) -> String;
}

/// Plain text formatter with optional ANSI color codes.
pub struct PlainFormatter {
    mode: FormatterMode,
}

impl PlainFormatter {
    /// Create a new formatter with auto-detected color mode.
    pub fn new() -> Self {
        Self {
            mode: FormatterMode::Auto,
        }
    }

    /// Create a new formatter with explicit color mode.
    pub fn with_mode(mode: FormatterMode) -> Self {
        Self { mode }
    }
}

impl Default for PlainFormatter {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryFormatter for PlainFormatter {
    fn render_event(&self, event: &BusEvent) -> String {
        if self.mode.is_colored() {
            format!(
                "{CHANNEL_COLOR}[{}]{RESET_COLOR} {}\n",
                event.channel, event.payload
            )
        } else {
            format!("[{}] {}\n", event.channel, event.payload)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plain_mode_has_no_ansi_codes() {
        let formatter = PlainFormatter::with_mode(FormatterMode::Plain);
        let rendered = formatter.render_event(&BusEvent::new("status", json!("PENDING")));
        assert!(!rendered.contains("\x1b["));
        assert!(rendered.starts_with("[status]"));
    }

    #[test]
    fn colored_mode_wraps_channel() {
        let formatter = PlainFormatter::with_mode(FormatterMode::Colored);
        let rendered = formatter.render_event(&BusEvent::new("answer", json!({"text": "hi"})));
        assert!(rendered.contains(CHANNEL_COLOR));
        assert!(rendered.ends_with('\n'));
    }
}
