//! S-expression wire format.
//!
//! Every control and data message on the Aiko bus is a textual S-expression.
//! This crate is the single codec: [`parse`] turns payload text into an
//! [`SValue`] tree and [`generate`] turns a tree back into payload text.
//!
//! ```rust
//! use aiko_sexpr::{parse, generate, SValue};
//!
//! let value = parse("(process_frame (stream_id: 0 frame_id: 0) (a: 0))").unwrap();
//! assert_eq!(generate(&value), "(process_frame (stream_id: 0 frame_id: 0) (a: 0))");
//! ```

// ── Module declarations ───────────────────────────────────────────────────────

mod generate;
mod parse;
mod value;

// ── Public re-exports ─────────────────────────────────────────────────────────

pub use generate::generate;
pub use parse::{parse, ParseError};
pub use value::SValue;
