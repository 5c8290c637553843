//! Unit tests for the data-file framings.

mod tests_modern;
