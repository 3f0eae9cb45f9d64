//! Diagnostic system for compile-time errors
//!
//! Every lex and parse error flows through the unified [`Diagnostic`]
//! type so the CLI, tests, and embedders all see the same shape, in
//! either human-readable or JSON form.

use serde::{Deserialize, Serialize};
use std::fmt;
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

use crate::span::Span;

/// Diagnostic schema version
pub const DIAG_VERSION: u32 = 1;

/// Severity level of a diagnostic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticLevel {
    /// Fatal error that prevents compilation
    Error,
}

impl fmt::Display for DiagnosticLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticLevel::Error => write!(f, "error"),
        }
    }
}

/// A diagnostic message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Diagnostic schema version
    pub diag_version: u32,
    /// Severity level
    pub level: DiagnosticLevel,
    /// Error code (e.g., "BS2001")
    pub code: String,
    /// Main diagnostic message
    pub message: String,
    /// File path (or "<script>" when compiling from memory)
    pub file: String,
    /// Line number (1-based)
    pub line: usize,
    /// Column number (1-based)
    pub column: usize,
    /// Length of error span
    pub length: usize,
    /// Source line string
    pub snippet: String,
    /// Short label for the caret range
    pub label: String,
}

impl Diagnostic {
    /// Create a new error diagnostic with code
    pub fn error_with_code(
        code: impl Into<String>,
        message: impl Into<String>,
        span: Span,
    ) -> Self {
        Self {
            diag_version: DIAG_VERSION,
            level: DiagnosticLevel::Error,
            code: code.into(),
            message: message.into(),
            file: "<script>".to_string(),
            line: 1,
            column: 1,
            length: span.len().max(1),
            snippet: String::new(),
            label: String::new(),
        }
    }

    /// Create a new error diagnostic (uses the generic error code)
    pub fn error(message: impl Into<String>, span: Span) -> Self {
        Self::error_with_code("BS9999", message, span)
    }

    /// Set the file path
    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = file.into();
        self
    }

    /// Set the line number
    pub fn with_line(mut self, line: usize) -> Self {
        self.line = line;
        self
    }

    /// Set the column number
    pub fn with_column(mut self, column: usize) -> Self {
        self.column = column;
        self
    }

    /// Set the snippet (source line)
    pub fn with_snippet(mut self, snippet: impl Into<String>) -> Self {
        self.snippet = snippet.into();
        self
    }

    /// Set the label (caret description)
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Format as human-readable string
    pub fn to_human_string(&self) -> String {
        let mut output = String::new();

        // Header: error[BS2001]: Expect ';' after value.
        output.push_str(&format!(
            "{}[{}]: {}\n",
            self.level, self.code, self.message
        ));

        // Location: --> path/to/file.bst:12:9
        output.push_str(&format!(
            "  --> {}:{}:{}\n",
            self.file, self.line, self.column
        ));

        // Snippet with caret
        if !self.snippet.is_empty() {
            output.push_str("   |\n");
            output.push_str(&format!("{:>2} | {}\n", self.line, self.snippet));

            let padding = " ".repeat(self.column.saturating_sub(1));
            let carets = "^".repeat(self.length.max(1));
            output.push_str(&format!("   | {}{}", padding, carets));
            if !self.label.is_empty() {
                output.push_str(&format!(" {}", self.label));
            }
            output.push('\n');
        }

        output
    }

    /// Format as JSON string
    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Color mode for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorMode {
    /// Always use colors
    Always,
    /// Never use colors
    Never,
    /// Auto-detect terminal capabilities
    Auto,
}

impl ColorMode {
    /// Resolve to a termcolor ColorChoice
    pub fn to_color_choice(self) -> ColorChoice {
        // Always respect NO_COLOR (https://no-color.org)
        if std::env::var("NO_COLOR").is_ok() {
            return ColorChoice::Never;
        }
        match self {
            ColorMode::Always => ColorChoice::Always,
            ColorMode::Never => ColorChoice::Never,
            ColorMode::Auto => ColorChoice::Auto,
        }
    }
}

/// Write a diagnostic to stderr with colors
pub fn emit(diag: &Diagnostic, color_mode: ColorMode) {
    let mut stream = StandardStream::stderr(color_mode.to_color_choice());
    let _ = write_diagnostic(&mut stream, diag);
}

/// Write a diagnostic to a color-aware sink
pub fn write_diagnostic(w: &mut impl WriteColor, diag: &Diagnostic) -> std::io::Result<()> {
    w.set_color(ColorSpec::new().set_fg(Some(Color::Red)).set_bold(true))?;
    write!(w, "{}[{}]", diag.level, diag.code)?;
    w.set_color(ColorSpec::new().set_bold(true))?;
    writeln!(w, ": {}", diag.message)?;
    w.reset()?;

    w.set_color(ColorSpec::new().set_fg(Some(Color::Blue)))?;
    write!(w, "  --> ")?;
    w.reset()?;
    writeln!(w, "{}:{}:{}", diag.file, diag.line, diag.column)?;

    if !diag.snippet.is_empty() {
        writeln!(w, "   |")?;
        writeln!(w, "{:>2} | {}", diag.line, diag.snippet)?;
        let padding = " ".repeat(diag.column.saturating_sub(1));
        let carets = "^".repeat(diag.length.max(1));
        w.set_color(ColorSpec::new().set_fg(Some(Color::Red)).set_bold(true))?;
        write!(w, "   | {}{}", padding, carets)?;
        if !diag.label.is_empty() {
            write!(w, " {}", diag.label)?;
        }
        w.reset()?;
        writeln!(w)?;
    }

    Ok(())
}
