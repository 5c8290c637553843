//! # Tabula
//!
//! An immutable, wide-column **SSTable** storage format engine: a writer
//! that turns a fully-ordered stream of partition events into the on-disk
//! component set, and a reader that turns the files back into the same
//! stream. Three on-disk versions are supported — two legacy row-oriented
//! layouts (`ka`, `la`) and the row-grouped modern layout (`mc`).
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                       SstableWriter                        │
//! │   mutation stream ──► data framing (ka/la │ mc)            │
//! │        │                   │                               │
//! │        │          promoted index ──► Index                 │
//! │        │                   │            │                  │
//! │        ├── Bloom filter    └── Summary sample              │
//! │        ├── min/max statistics                              │
//! │        └── checksums / compression chunks                  │
//! │                                                            │
//! │   seal: Summary·Filter·Statistics·CRC|CompressionInfo·     │
//! │         Digest·Scylla, then TemporaryTOC ──rename──► TOC   │
//! └────────────────────────────────────────────────────────────┘
//! ┌────────────────────────────────────────────────────────────┐
//! │                         Sstable                            │
//! │   TOC ──► components ──► summary search ──► index scan     │
//! │        ──► data seek ──► event stream (slices, forwarding) │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`encoding`] | Primitive codecs: big-endian ints, vints, strings, arrays, maps, tagged unions |
//! | [`model`] | Logical entities: keys, clusterings, cells, rows, tombstones, schema seams |
//! | [`components`] | Versions, filenames, TOC, and the small structured component blobs |
//! | [`data`] | Data-file framing for the legacy and modern layouts |
//! | [`index`] | External index and the per-partition promoted index |
//! | [`writer`] | The writer pipeline: one facade, two version-specific implementations |
//! | [`reader`] | The reader pipeline: slices, forwarding, range-tombstone reconstruction |
//! | [`sstable`] | The lifecycle object: open, read, delete, import, sweep |
//! | [`error`] | The crate-wide error taxonomy |
//!
//! ## Guarantees
//!
//! - **Immutability** — once sealed, a file set is never modified.
//! - **Atomic publication** — the `TemporaryTOC` → `TOC` rename is the
//!   only publication point; an interrupted seal leaves nothing an
//!   observer could mistake for a sealed SSTable.
//! - **Integrity** — every data chunk is checksummed (CRC32 or Adler32 by
//!   version); a corrupt chunk never reaches the caller.
//! - **Byte stability** — a deterministic input stream and fixed
//!   parameters produce byte-identical files across runs.

pub mod components;
pub mod data;
pub mod encoding;
pub mod error;
pub mod index;
pub mod model;
pub mod reader;
pub mod sstable;
pub mod writer;

pub use error::{Result, SstableError};
