//! The script surface: a line-oriented, brace-less syntax that transpiles
//! one-to-one into template form.
//!
//! The script front end is purely syntactic. [`transpile`] turns script
//! source into an equivalent template string with stable line numbers; the
//! template pipeline takes over from there.

mod lexer;
mod transpile;

pub use transpile::transpile;
