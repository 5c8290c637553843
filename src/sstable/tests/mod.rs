//! Lifecycle tests: open, recovery, deletion, integrity.
