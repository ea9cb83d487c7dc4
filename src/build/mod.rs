//! The match and execute engines plus the builtin rules.

pub mod executor;
pub mod matcher;
pub mod rules;
