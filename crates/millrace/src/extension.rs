//! Custom tag extensions.
//!
//! An extension registers a tag name; the parser then accepts
//! `{% name(args) %}` (plus a body up to `{% endname %}` when the extension
//! declares one) and the runtime calls [`Extension::run`] with the evaluated
//! arguments. Asynchronous extensions dispatch through the host-call
//! mechanism instead, pausing the render at a `FunctionCall` with path
//! `["extensions", name]`.

use crate::{error::Exception, value::Value};

/// A custom tag.
pub trait Extension {
    /// The tag name this extension handles. Must not shadow a reserved tag.
    fn tag(&self) -> &str;

    /// Whether the tag takes a `{% end<tag> %}`-terminated body. The body is
    /// rendered to text and passed to [`Self::run`].
    fn has_body(&self) -> bool {
        false
    }

    /// Whether invocation pauses to the host (`FunctionCall` with path
    /// `["extensions", <tag>]` and the evaluated args, body last) instead of
    /// calling [`Self::run`].
    fn is_async(&self) -> bool {
        false
    }

    /// Runs the extension with evaluated arguments and the rendered body
    /// text, if any. The returned value is appended to the text stream.
    fn run(&self, args: &[Value], body: Option<&str>) -> Result<Value, Exception>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Shout;

    impl Extension for Shout {
        fn tag(&self) -> &str {
            "shout"
        }

        fn has_body(&self) -> bool {
            true
        }

        fn run(&self, _args: &[Value], body: Option<&str>) -> Result<Value, Exception> {
            Ok(Value::from(body.unwrap_or_default().to_uppercase()))
        }
    }

    #[test]
    fn extension_surface() {
        let ext = Shout;
        assert_eq!(ext.tag(), "shout");
        assert!(ext.has_body());
        assert!(!ext.is_async());
        assert_eq!(ext.run(&[], Some("hi")).unwrap(), Value::str("HI"));
    }
}
