//! Writer pipeline tests: round trips, sealing, markers and compression.

mod helpers;
mod tests_roundtrip;
mod tests_rt_markers;
mod tests_seal;
