//! Error types for parsing, script execution and the engine boundary.

/// A parse error with byte-offset position information.
#[derive(Debug, Clone, thiserror::Error)]
#[error("parse error at position {position}: {message}")]
pub struct ParseError {
    pub message: String,
    pub position: usize,
}

impl ParseError {
    pub fn new(message: impl Into<String>, position: usize) -> Self {
        Self {
            message: message.into(),
            position,
        }
    }

    /// Format the error with a caret pointing at the error position in the input.
    pub fn display_with_context(&self, input: &str) -> String {
        let line_start = input[..self.position.min(input.len())]
            .rfind('\n')
            .map(|i| i + 1)
            .unwrap_or(0);
        let line_end = input[line_start..]
            .find('\n')
            .map(|i| line_start + i)
            .unwrap_or(input.len());
        let caret = " ".repeat(self.position - line_start) + "^";
        format!(
            "{line}\n{caret}\n{err}",
            line = &input[line_start..line_end],
            caret = caret,
            err = self
        )
    }
}

/// A failure while executing a compiled script body.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RuntimeError {
    #[error("unknown identifier '{0}'")]
    UnknownIdent(String),

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("{func}: expected {expected} argument(s), got {got}")]
    Arity {
        func: String,
        expected: usize,
        got: usize,
    },

    #[error("{context}: expected {expected}")]
    Type {
        context: String,
        expected: &'static str,
    },

    #[error("cannot assign to '{0}'")]
    BadAssign(String),

    #[error("symbol error: {0}")]
    Symbol(String),
}

impl RuntimeError {
    pub fn type_err(context: impl Into<String>, expected: &'static str) -> Self {
        RuntimeError::Type {
            context: context.into(),
            expected,
        }
    }
}

/// Top-level error type for barscript.
#[derive(Debug, thiserror::Error)]
pub enum BarscriptError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("script '{script}' failed to build: {reason}")]
    ScriptBuild { script: String, reason: String },

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("data error: {reason}")]
    Data { reason: String },

    #[error("config parse error in {file}: {reason}")]
    ConfigParse { file: String, reason: String },

    #[error("invalid config value [{section}] {key}: {reason}")]
    ConfigInvalid {
        section: String,
        key: String,
        reason: String,
    },

    #[error("engine is shut down")]
    EngineGone,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<&BarscriptError> for std::process::ExitCode {
    fn from(err: &BarscriptError) -> Self {
        let code: u8 = match err {
            BarscriptError::Io(_) => 1,
            BarscriptError::ConfigParse { .. } | BarscriptError::ConfigInvalid { .. } => 2,
            BarscriptError::Data { .. } => 3,
            BarscriptError::Parse(_) | BarscriptError::ScriptBuild { .. } => 4,
            BarscriptError::Runtime(_) | BarscriptError::EngineGone => 5,
        };
        std::process::ExitCode::from(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caret_points_at_position() {
        let err = ParseError::new("expected ')'", 4);
        let ctx = err.display_with_context("a + (b");
        assert!(ctx.contains('^'));
        assert!(ctx.contains("position 4"));
    }

    #[test]
    fn caret_on_second_line() {
        let input = "line one\nbad(";
        let err = ParseError::new("expected ')'", input.len());
        let ctx = err.display_with_context(input);
        let lines: Vec<&str> = ctx.lines().collect();
        assert_eq!(lines[0], "bad(");
        assert_eq!(lines[1], "    ^");
    }

    #[test]
    fn error_display() {
        let err: BarscriptError = ParseError::new("expected number", 7).into();
        assert_eq!(err.to_string(), "parse error at position 7: expected number");
        let err = BarscriptError::ScriptBuild {
            script: "RSI".into(),
            reason: "bad body".into(),
        };
        assert!(err.to_string().contains("RSI"));
    }
}
