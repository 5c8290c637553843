//! Unit tests for component identity and the small structured blobs.

mod tests_compression;
