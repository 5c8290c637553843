//! Unit tests for the logical model.

mod tests_accumulator;
