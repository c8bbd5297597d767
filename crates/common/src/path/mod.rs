// File path handling for document keys.

pub mod normalize;

pub use normalize::{normalize_file_path, PathError};
