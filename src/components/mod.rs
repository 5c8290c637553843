//! Component identity: versions, formats, component types, filenames and
//! the table-of-contents file.
//!
//! One sealed SSTable is a named set of component files. The TOC lists the
//! components that exist; its bare presence (under the non-temporary name)
//! is what marks the SSTable as successfully published.
//!
//! # Filenames
//!
//! ```text
//! LegacyA (ka):          <ks>-<cf>-ka-<generation>-<component>
//! LegacyB/ModernM:       <version>-<generation>-<format>-<component>
//! ```
//!
//! For `la`/`mc` the keyspace and table are derived from the directory path
//! `.../<ks>/<cf>-<uuid>[/staging|/upload|/snapshots/<name>]?`.

pub mod checksum;
pub mod compression;
pub mod filter;
pub mod scylla;
pub mod statistics;
pub mod summary;

#[cfg(test)]
mod tests;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::{Result, SstableError};

/// Largest TOC file we are willing to parse.
const MAX_TOC_SIZE: u64 = 4096;

// ------------------------------------------------------------------------------------------------
// Versions and formats
// ------------------------------------------------------------------------------------------------

/// On-disk layout version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Version {
    /// Legacy row-oriented layout with keyspace-prefixed filenames and no
    /// serialization header.
    Ka,
    /// Legacy row-oriented layout with version-prefixed filenames.
    La,
    /// Row-grouped layout with vints, delta-encoded timestamps and the
    /// richer row/marker flag model.
    Mc,
}

impl Version {
    /// Wire string used in filenames.
    pub fn as_str(self) -> &'static str {
        match self {
            Version::Ka => "ka",
            Version::La => "la",
            Version::Mc => "mc",
        }
    }

    /// Reverse of [`Version::as_str`].
    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "ka" => Version::Ka,
            "la" => Version::La,
            "mc" => Version::Mc,
            _ => return None,
        })
    }

    /// Whether this is the row-grouped modern layout.
    pub fn is_modern(self) -> bool {
        matches!(self, Version::Mc)
    }

    /// Whether filenames carry keyspace and table.
    pub fn filename_carries_keyspace(self) -> bool {
        matches!(self, Version::Ka)
    }
}

/// On-disk file format variant within a version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Format {
    /// The only format currently produced.
    #[default]
    Big,
}

impl Format {
    /// Wire string used in filenames.
    pub fn as_str(self) -> &'static str {
        match self {
            Format::Big => "big",
        }
    }

    /// Reverse of [`Format::as_str`].
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "big" => Some(Format::Big),
            _ => None,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Component types
// ------------------------------------------------------------------------------------------------

/// A component file of an SSTable.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ComponentType {
    /// The partition data itself.
    Data,
    /// External partition index.
    Index,
    /// Sparse in-memory sample of the index.
    Summary,
    /// Bloom filter over partition keys.
    Filter,
    /// Tagged metadata blob.
    Statistics,
    /// Full-file checksum, textual.
    Digest,
    /// Per-chunk CRC table (uncompressed data only).
    Crc,
    /// Compression parameters and chunk offsets (compressed data only).
    CompressionInfo,
    /// Table of contents.
    Toc,
    /// TOC staged before the publication rename.
    TemporaryToc,
    /// Statistics staged before an in-place rewrite.
    TemporaryStatistics,
    /// Sharding and feature metadata.
    Scylla,
    /// A component name this build does not recognize; retained verbatim.
    Unknown(String),
}

impl ComponentType {
    /// All recognized component types, in a stable order.
    pub const RECOGNIZED: [ComponentType; 12] = [
        ComponentType::Data,
        ComponentType::Index,
        ComponentType::Summary,
        ComponentType::Filter,
        ComponentType::Statistics,
        ComponentType::Digest,
        ComponentType::Crc,
        ComponentType::CompressionInfo,
        ComponentType::Toc,
        ComponentType::TemporaryToc,
        ComponentType::TemporaryStatistics,
        ComponentType::Scylla,
    ];

    /// The component's wire name for `version`. The map is case-sensitive
    /// and version-keyed even though current versions share the strings.
    pub fn name(&self, _version: Version) -> &str {
        match self {
            ComponentType::Data => "Data",
            ComponentType::Index => "Index",
            ComponentType::Summary => "Summary",
            ComponentType::Filter => "Filter",
            ComponentType::Statistics => "Statistics",
            ComponentType::Digest => "Digest",
            ComponentType::Crc => "CRC",
            ComponentType::CompressionInfo => "CompressionInfo",
            ComponentType::Toc => "TOC",
            ComponentType::TemporaryToc => "TemporaryTOC",
            ComponentType::TemporaryStatistics => "TemporaryStatistics",
            ComponentType::Scylla => "Scylla",
            ComponentType::Unknown(s) => s,
        }
    }

    /// Map a wire name back to a component type. Unrecognized names map to
    /// [`ComponentType::Unknown`] rather than failing, so a TOC written by a
    /// future version still loads.
    pub fn from_name(version: Version, s: &str) -> ComponentType {
        for ct in ComponentType::RECOGNIZED {
            if ct.name(version) == s {
                return ct;
            }
        }
        ComponentType::Unknown(s.to_string())
    }
}

// ------------------------------------------------------------------------------------------------
// Descriptors and filenames
// ------------------------------------------------------------------------------------------------

/// Identity of one SSTable: everything needed to name its files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    /// Directory holding the component files.
    pub dir: PathBuf,
    /// Keyspace name.
    pub keyspace: String,
    /// Table (column family) name.
    pub table: String,
    /// Layout version.
    pub version: Version,
    /// Monotonic id distinguishing SSTables of one table.
    pub generation: u64,
    /// Format variant.
    pub format: Format,
}

impl Descriptor {
    /// Filename (without directory) of `component`.
    pub fn component_basename(&self, component: &ComponentType) -> String {
        let name = component.name(self.version);
        if self.version.filename_carries_keyspace() {
            format!(
                "{}-{}-{}-{}-{}",
                self.keyspace,
                self.table,
                self.version.as_str(),
                self.generation,
                name
            )
        } else {
            format!(
                "{}-{}-{}-{}",
                self.version.as_str(),
                self.generation,
                self.format.as_str(),
                name
            )
        }
    }

    /// Full path of `component`.
    pub fn path(&self, component: &ComponentType) -> PathBuf {
        self.dir.join(self.component_basename(component))
    }

    /// Parse a component filename back into a descriptor plus the component
    /// it names. For `la`/`mc` filenames the keyspace and table come from
    /// the directory path.
    pub fn parse(dir: &Path, filename: &str) -> Result<(Descriptor, ComponentType)> {
        let parts: Vec<&str> = filename.splitn(4, '-').collect();
        // la/mc: <version>-<generation>-<format>-<component>
        if let [v, gen, fmt, comp] = parts.as_slice() {
            if let (Some(version), Ok(generation), Some(format)) = (
                Version::from_str(v),
                gen.parse::<u64>(),
                Format::from_str(fmt),
            ) {
                if !version.filename_carries_keyspace() {
                    let component = ComponentType::from_name(version, comp);
                    let (keyspace, table) = keyspace_table_from_dir(dir)?;
                    return Ok((
                        Descriptor {
                            dir: dir.to_path_buf(),
                            keyspace,
                            table,
                            version,
                            generation,
                            format,
                        },
                        component,
                    ));
                }
            }
        }
        // ka: <ks>-<cf>-ka-<generation>-<component>
        let parts: Vec<&str> = filename.splitn(5, '-').collect();
        if parts.len() == 5 && parts[2] == "ka" {
            let generation = parts[3].parse::<u64>().map_err(|_| {
                SstableError::MalformedSstable(format!("bad generation in filename {filename}"))
            })?;
            let component = ComponentType::from_name(Version::Ka, parts[4]);
            return Ok((
                Descriptor {
                    dir: dir.to_path_buf(),
                    keyspace: parts[0].to_string(),
                    table: parts[1].to_string(),
                    version: Version::Ka,
                    generation,
                    format: Format::Big,
                },
                component,
            ));
        }
        Err(SstableError::MalformedSstable(format!(
            "filename {filename} does not match any known version"
        )))
    }
}

/// Derive `(keyspace, table)` from a data directory path of the shape
/// `.../<ks>/<cf>-<uuid>[/staging|/upload|/snapshots/<name>]?`.
pub fn keyspace_table_from_dir(dir: &Path) -> Result<(String, String)> {
    let mut parts: Vec<&str> = dir
        .iter()
        .filter_map(|c| c.to_str())
        .filter(|c| *c != "/")
        .collect();

    // Strip the optional trailing staging/upload/snapshot segment.
    match parts.as_slice() {
        [.., "staging"] | [.., "upload"] => {
            parts.pop();
        }
        [.., prev, _name] if *prev == "snapshots" => {
            parts.pop();
            parts.pop();
        }
        _ => {}
    }

    let malformed = || {
        SstableError::MalformedSstable(format!(
            "path {} does not match <ks>/<cf>-<uuid>",
            dir.display()
        ))
    };

    let cf_dir = parts.pop().ok_or_else(malformed)?;
    let ks = parts.pop().ok_or_else(malformed)?;
    let (cf, uuid) = cf_dir.rsplit_once('-').ok_or_else(malformed)?;
    if uuid.is_empty() || !uuid.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(malformed());
    }
    Ok((ks.to_string(), cf.to_string()))
}

// ------------------------------------------------------------------------------------------------
// Table of contents
// ------------------------------------------------------------------------------------------------

/// The parsed table of contents: which components this SSTable has.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Toc {
    /// Every component listed, recognized or not, in listed order.
    pub components: Vec<ComponentType>,
}

impl Toc {
    /// The component set a fresh writer publishes, given whether the data
    /// file is compressed.
    pub fn for_write(compressed: bool, filter_enabled: bool) -> Toc {
        let mut components = vec![
            ComponentType::Toc,
            ComponentType::Statistics,
            ComponentType::Digest,
            ComponentType::Index,
            ComponentType::Summary,
            ComponentType::Data,
            ComponentType::Scylla,
        ];
        if filter_enabled {
            components.push(ComponentType::Filter);
        }
        if compressed {
            components.push(ComponentType::CompressionInfo);
        } else {
            components.push(ComponentType::Crc);
        }
        Toc { components }
    }

    /// Whether `component` is listed.
    pub fn contains(&self, component: &ComponentType) -> bool {
        self.components.contains(component)
    }

    /// The unrecognized entries, in order.
    pub fn unrecognized(&self) -> Vec<&str> {
        self.components
            .iter()
            .filter_map(|c| match c {
                ComponentType::Unknown(s) => Some(s.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Load and parse the published TOC of `desc`.
    ///
    /// Unknown component names are retained verbatim (and warned about) so
    /// that re-sealing publishes them unchanged. A TOC bigger than 4 KiB is
    /// malformed.
    pub fn load(desc: &Descriptor) -> Result<Toc> {
        let path = desc.path(&ComponentType::Toc);
        let meta = fs::metadata(&path)?;
        if meta.len() >= MAX_TOC_SIZE {
            return Err(SstableError::MalformedSstable(format!(
                "TOC too big: {} bytes in {}",
                meta.len(),
                path.display()
            )));
        }
        let text = fs::read_to_string(&path)?;
        let mut components = Vec::new();
        for line in text.lines() {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            let ct = ComponentType::from_name(desc.version, line);
            if let ComponentType::Unknown(name) = &ct {
                warn!(component = %name, toc = %path.display(), "unrecognized component in TOC");
            }
            if !components.contains(&ct) {
                components.push(ct);
            }
        }
        if components.is_empty() {
            return Err(SstableError::MalformedSstable(format!(
                "empty TOC in {}",
                path.display()
            )));
        }
        Ok(Toc { components })
    }

    /// Write the staged TOC under the temporary name and flush it. The
    /// publication rename is a separate step ([`Toc::publish`]).
    pub fn write_temporary(&self, desc: &Descriptor) -> Result<()> {
        let path = desc.path(&ComponentType::TemporaryToc);
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        for component in &self.components {
            match component {
                // The temporary name never appears inside the file.
                ComponentType::TemporaryToc => continue,
                other => {
                    file.write_all(other.name(desc.version).as_bytes())?;
                    file.write_all(b"\n")?;
                }
            }
        }
        file.sync_all()?;
        sync_directory(&desc.dir)?;
        Ok(())
    }

    /// Atomically publish the staged TOC: rename `TemporaryTOC` to `TOC`
    /// and flush the directory. After this returns, the SSTable is sealed.
    pub fn publish(desc: &Descriptor) -> Result<()> {
        fs::rename(
            desc.path(&ComponentType::TemporaryToc),
            desc.path(&ComponentType::Toc),
        )?;
        sync_directory(&desc.dir)?;
        Ok(())
    }
}

/// Flush a directory so renames and unlinks inside it are durable.
pub fn sync_directory(dir: &Path) -> Result<()> {
    let handle = fs::File::open(dir)?;
    handle.sync_all()?;
    Ok(())
}
