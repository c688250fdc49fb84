//! Path expression engine
//!
//! Parsing, evaluation, and subscription filtering for the dotted-path query
//! language (`.data.users[0].status`, `.data.positions[trader=abc]`).

pub mod filter;
pub mod matcher;
pub mod parser;

pub use filter::{Condition, Filter};
pub use matcher::MatchResult;
pub use parser::Segment;
