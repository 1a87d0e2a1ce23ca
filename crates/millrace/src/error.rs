//! Error taxonomy and the poison propagation wrapper.
//!
//! Compile-time failures (transpiler, parser, sequence analyzer) reject
//! synchronously as [`Exception`] values. Runtime failures become *poison*:
//! an absorbing error that resolves the originating value slot and propagates
//! to every dependent slot until a `guard` recovers it, a `_revert` drops it,
//! or the render root surfaces it as the overall rejection.

use std::{fmt, rc::Rc};

use strum::IntoStaticStr;

/// The error kinds surfaced by compilation and rendering.
///
/// These are kinds, not distinct types: every failure travels as an
/// [`Exception`] tagged with one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    /// Transpiler or parser error: block mismatches, invalid identifier
    /// lists, invalid `@`-command syntax, malformed expressions.
    Syntax,
    /// Invalid use of the `!` sequence marker.
    Sequence,
    /// Missing template, missing filter/extension, or an undefined variable
    /// when `throw_on_undefined` is set.
    Template,
    /// A filter, extension, context function, loader, or handler failed
    /// during rendering.
    Runtime,
    /// The render was aborted by the caller.
    Cancelled,
}

impl ErrorKind {
    /// The `SomethingError` display name used in messages.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Syntax => "SyntaxError",
            Self::Sequence => "SequenceError",
            Self::Template => "TemplateError",
            Self::Runtime => "RuntimeError",
            Self::Cancelled => "Cancelled",
        }
    }
}

/// A source position inside a named template.
///
/// Lines and columns are 1-based; column 0 means "unknown column".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct CodeLoc {
    pub line: u32,
    pub column: u32,
}

impl CodeLoc {
    #[must_use]
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

impl fmt::Display for CodeLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.column == 0 {
            write!(f, "Line {}", self.line)
        } else {
            write!(f, "Line {}, Column {}", self.line, self.column)
        }
    }
}

/// A single aggregated error: kind, message, owning template, and position.
///
/// The display format mirrors what callers see on the rejected render:
///
/// ```text
/// SequenceError: `!` on a property read is not allowed ((unknown path)) [Line 3, Column 7]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Exception {
    pub kind: ErrorKind,
    pub message: String,
    /// The reported path of the owning template, if known.
    pub template: Option<String>,
    pub loc: Option<CodeLoc>,
}

impl Exception {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            template: None,
            loc: None,
        }
    }

    /// Shorthand for a syntax error at a known line.
    #[must_use]
    pub fn syntax(message: impl Into<String>, line: u32, column: u32) -> Self {
        Self::new(ErrorKind::Syntax, message).at(CodeLoc::new(line, column))
    }

    /// Shorthand for a sequence-marker error at a known line.
    #[must_use]
    pub fn sequence(message: impl Into<String>, line: u32, column: u32) -> Self {
        Self::new(ErrorKind::Sequence, message).at(CodeLoc::new(line, column))
    }

    #[must_use]
    pub fn template_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Template, message)
    }

    #[must_use]
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Runtime, message)
    }

    #[must_use]
    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "render aborted")
    }

    /// Attaches a source position, keeping an existing one if already set.
    ///
    /// Errors keep the most specific (innermost) location they were first
    /// tagged with while bubbling outward.
    #[must_use]
    pub fn at(mut self, loc: CodeLoc) -> Self {
        self.loc.get_or_insert(loc);
        self
    }

    /// Attaches the owning template name, keeping an existing one if set.
    #[must_use]
    pub fn in_template(mut self, name: &str) -> Self {
        if self.template.is_none() {
            self.template = Some(name.to_owned());
        }
        self
    }

    /// The reported template path, `(unknown path)` when the template had no
    /// name.
    #[must_use]
    pub fn reported_path(&self) -> String {
        match &self.template {
            Some(name) => format!("({name})"),
            None => "((unknown path))".to_owned(),
        }
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} {}", self.kind.label(), self.message, self.reported_path())?;
        if let Some(loc) = self.loc {
            write!(f, " [{loc}]")?;
        }
        Ok(())
    }
}

impl std::error::Error for Exception {}

/// The absorbing runtime failure value.
///
/// A poison is created when a slot's computation raises, and becomes the
/// resolution of that slot and of every downstream slot that reads it. The
/// `Rc` makes propagation a pointer copy; the originating [`Exception`] is
/// shared by all dependents.
#[derive(Debug, Clone)]
pub struct Poison(Rc<Exception>);

impl Poison {
    #[must_use]
    pub fn new(cause: Exception) -> Self {
        Self(Rc::new(cause))
    }

    #[must_use]
    pub fn cause(&self) -> &Exception {
        &self.0
    }

    /// Whether this poison carries a render-abort error.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.kind == ErrorKind::Cancelled
    }

    /// Unwraps into the public exception, cloning only if shared.
    #[must_use]
    pub fn into_exception(self) -> Exception {
        Rc::try_unwrap(self.0).unwrap_or_else(|rc| (*rc).clone())
    }
}

impl From<Exception> for Poison {
    fn from(cause: Exception) -> Self {
        Self::new(cause)
    }
}

impl fmt::Display for Poison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Result alias used throughout evaluation: any error is already poison.
pub(crate) type RunResult<T> = Result<T, Poison>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_path_and_line() {
        let exc = Exception::sequence("`!` on a property read is not allowed", 3, 7).in_template("page.njk");
        assert_eq!(
            exc.to_string(),
            "SequenceError: `!` on a property read is not allowed (page.njk) [Line 3, Column 7]"
        );
    }

    #[test]
    fn unknown_path_is_reported() {
        let exc = Exception::runtime("division by zero").at(CodeLoc::new(4, 0));
        assert_eq!(exc.to_string(), "RuntimeError: division by zero ((unknown path)) [Line 4]");
    }

    #[test]
    fn innermost_location_wins() {
        let exc = Exception::runtime("boom").at(CodeLoc::new(2, 1)).at(CodeLoc::new(9, 9));
        assert_eq!(exc.loc, Some(CodeLoc::new(2, 1)));
    }
}
