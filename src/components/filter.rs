//! The Filter component: a Bloom filter over partition keys.
//!
//! The filter is consulted before any index work on single-partition reads.
//! When the component is missing, or deliberately skipped, an always-true
//! filter stands in so reads stay correct and merely lose the shortcut.
//!
//! Legacy (`ka`/`la`) and modern (`mc`) files hash keys with different
//! families; the format is carried through open so probing always matches
//! the bytes on disk. Each family pins its seed, which keeps emitted files
//! byte-identical across runs.

use std::io::{Read, Write};

use bloomfilter::Bloom;

use crate::components::Version;
use crate::encoding::{read_int, read_raw, write_int, FixedInt};
use crate::error::{Result, SstableError};

/// Hash family selector, derived from the SSTable version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterFormat {
    /// Family used by the legacy row-oriented layouts.
    Legacy,
    /// Family used by the row-grouped layout.
    Modern,
}

impl FilterFormat {
    /// The family probing must use for files of `version`.
    pub fn for_version(version: Version) -> Self {
        if version.is_modern() {
            FilterFormat::Modern
        } else {
            FilterFormat::Legacy
        }
    }

    fn seed(self) -> [u8; 32] {
        match self {
            FilterFormat::Legacy => *b"tabula.filter.legacy.hash.seed.0",
            FilterFormat::Modern => *b"tabula.filter.modern.hash.seed.0",
        }
    }
}

/// The Filter component.
pub enum Filter {
    /// No filter on disk; every probe answers "maybe present".
    AlwaysPresent,
    /// A loaded or under-construction Bloom filter.
    Bloom {
        /// The backing filter.
        bloom: Box<Bloom<Vec<u8>>>,
        /// Hash family the filter was built with.
        format: FilterFormat,
    },
}

impl Filter {
    /// Build an empty filter sized for `expected_keys` at `fp_chance`.
    pub fn new(expected_keys: u64, fp_chance: f64, format: FilterFormat) -> Result<Filter> {
        let items = expected_keys.max(1) as usize;
        let bloom = Bloom::new_for_fp_rate_with_seed(items, fp_chance, &format.seed())
            .map_err(|e| SstableError::MalformedSstable(format!("bloom filter: {e}")))?;
        Ok(Filter::Bloom { bloom: Box::new(bloom), format })
    }

    /// Add a partition key.
    pub fn add(&mut self, key: &[u8]) {
        if let Filter::Bloom { bloom, .. } = self {
            bloom.set(&key.to_vec());
        }
    }

    /// Whether `key` may be present. False means definitely absent.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        match self {
            Filter::AlwaysPresent => true,
            Filter::Bloom { bloom, .. } => bloom.check(&key.to_vec()),
        }
    }

    /// Serialize: hash count, then the length-prefixed bitset encoding.
    pub fn save<W: Write>(&self, w: &mut W) -> Result<()> {
        match self {
            Filter::AlwaysPresent => Err(SstableError::MalformedSstable(
                "cannot serialize the always-true filter".into(),
            )),
            Filter::Bloom { bloom, .. } => {
                write_int(w, bloom.number_of_hash_functions() as i32)?;
                let bytes = bloom.as_slice();
                write_int(w, u32::from_len(bytes.len(), "filter bitset length")?)?;
                w.write_all(bytes).map_err(SstableError::Io)?;
                Ok(())
            }
        }
    }

    /// Parse a serialized filter for `format`.
    pub fn load<R: Read>(r: &mut R, format: FilterFormat) -> Result<Filter> {
        let hash_count = read_int::<i32, _>(r)?;
        let len = read_int::<u32, _>(r)?.as_len().map_err(SstableError::from)?;
        let bytes = read_raw(r, len, "filter bitset")?;
        let bloom = Bloom::from_slice(&bytes)
            .map_err(|e| SstableError::MalformedSstable(format!("bloom filter: {e}")))?;
        if bloom.number_of_hash_functions() as i32 != hash_count {
            return Err(SstableError::MalformedSstable(format!(
                "filter hash count {hash_count} does not match bitset header"
            )));
        }
        Ok(Filter::Bloom { bloom: Box::new(bloom), format })
    }
}
