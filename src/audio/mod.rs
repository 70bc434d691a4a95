//! Audio input handling.

mod source;

pub use source::{chunk_size, AudioError, AudioFormat, AudioSource};
