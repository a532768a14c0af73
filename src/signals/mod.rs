//! Readiness-signal protocol.
//!
//! An agent inside a container announces finished work by writing a small
//! file at a fixed path. The content is either empty (copy the whole
//! workspace) or four `KEY=value` lines describing a patch job:
//!
//! - `REPO=`: local clone directory name
//! - `PATCH=`: patch file path inside the container
//! - `BRANCH=`: branch name prefix
//! - `MESSAGE=`: commit message and review-request title
//!
//! Content is decoded into a typed [`Decoded`] at the boundary; raw text
//! does not travel further into the system.

mod parser;
mod types;

pub use parser::{SignalParser, decode};
pub use types::{Decoded, PatchJob};
