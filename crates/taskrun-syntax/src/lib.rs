//! Runfile parser for taskrun.
//!
//! A Runfile is a line-oriented document of variable assignments, settings and
//! recipes. Recipes own an indented body of shell lines that may interpolate
//! expressions with `{{...}}`. Produces a typed AST: [`Document`], [`Recipe`],
//! [`Assignment`], [`Expression`].
//!
//! # Example
//! ```
//! let src = "src := \"app\"\n\nfmt:\n    ruff format {{src}}\n";
//! let doc = taskrun_syntax::parse(src).unwrap();
//! assert_eq!(doc.recipes().count(), 1);
//! assert_eq!(doc.assignment("src").unwrap().line, 1);
//! ```

pub mod ast;
mod parser;

pub use ast::*;
pub use parser::parse;
