//! Seed manifests: the snap revisions an image was seeded with.
//!
//! ```text
//! # comment
//! core 5
//! test-snap -1
//! ```
//!
//! Positive revisions come from the store, negative ones are local builds.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("cannot access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("line {line}: cannot start with a space: {content:?}")]
    LeadingSpace { line: usize, content: String },
    #[error("line {line}: expected `<name> <revision>`: {content:?}")]
    Malformed { line: usize, content: String },
    #[error("invalid snap name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },
    #[error("invalid snap revision {0:?}")]
    InvalidRevision(String),
    #[error("revision of {0:?} must not be 0")]
    UnsetRevision(String),
}

pub type Result<T, E = ManifestError> = core::result::Result<T, E>;

/// A snap revision. Zero means unset and is never valid in a manifest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Revision(pub i32);

impl Revision {
    pub fn is_unset(self) -> bool {
        self.0 == 0
    }

    pub fn is_local(self) -> bool {
        self.0 < 0
    }
}

impl From<i32> for Revision {
    fn from(n: i32) -> Self {
        Self(n)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Revision {
    type Err = ManifestError;

    /// Accepts `N`, `-N` and the local form `xN`, meaning `-N`.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || ManifestError::InvalidRevision(s.to_string());
        if s == "unset" {
            return Ok(Revision(0));
        }
        match s.strip_prefix('x') {
            Some(local) => {
                let n: i32 = local.parse().map_err(|_| invalid())?;
                if n <= 0 {
                    return Err(invalid());
                }
                Ok(Revision(-n))
            }
            None => Ok(Revision(s.parse().map_err(|_| invalid())?)),
        }
    }
}

/// Checks `name` is a valid snap name: 2 to 40 characters of lowercase
/// letters, digits and single hyphens, with at least one letter and no
/// hyphen at either end.
pub fn validate_snap_name(name: &str) -> Result<()> {
    let invalid = |reason: &'static str| ManifestError::InvalidName {
        name: name.to_string(),
        reason,
    };
    if name.len() < 2 || name.len() > 40 {
        return Err(invalid("must be between 2 and 40 characters long"));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    {
        return Err(invalid("only lowercase letters, digits and dashes are allowed"));
    }
    if !name.bytes().any(|b| b.is_ascii_lowercase()) {
        return Err(invalid("must contain at least one letter"));
    }
    if name.starts_with('-') || name.ends_with('-') || name.contains("--") {
        return Err(invalid("dashes must separate letters or digits"));
    }
    Ok(())
}

pub fn read_seed_manifest(path: &Path) -> Result<BTreeMap<String, Revision>> {
    let io_error = |source: std::io::Error| ManifestError::Io {
        path: path.to_path_buf(),
        source,
    };
    let file = fs::File::open(path).map_err(io_error)?;
    let mut revisions = BTreeMap::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(io_error)?;
        let number = index + 1;
        if line.starts_with('#') {
            continue;
        }
        if line.starts_with(' ') {
            return Err(ManifestError::LeadingSpace {
                line: number,
                content: line,
            });
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let [name, revision] = tokens[..] else {
            return Err(ManifestError::Malformed {
                line: number,
                content: line.clone(),
            });
        };
        validate_snap_name(name)?;
        let revision: Revision = revision.parse()?;
        if revision.is_unset() {
            return Err(ManifestError::UnsetRevision(name.to_string()));
        }
        revisions.insert(name.to_string(), revision);
    }
    log::debug!("Read {} seeded snaps from {}", revisions.len(), path.display());
    Ok(revisions)
}

/// Writes `revisions` sorted by name. Nothing is written, and no file is
/// created, for an empty map.
pub fn write_seed_manifest(path: &Path, revisions: &BTreeMap<String, Revision>) -> Result<()> {
    if revisions.is_empty() {
        return Ok(());
    }
    let mut contents = String::new();
    for (name, revision) in revisions {
        if revision.is_unset() {
            return Err(ManifestError::UnsetRevision(name.clone()));
        }
        contents.push_str(&format!("{} {}\n", name, revision));
    }
    fs::write(path, contents).map_err(|source| ManifestError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;

    fn read_str(contents: &str) -> super::Result<BTreeMap<String, Revision>> {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("seed.manifest");
        fs::write(&path, contents).expect("write manifest");
        read_seed_manifest(&path)
    }

    #[test]
    fn read_manifest() -> Result<()> {
        let revisions = read_str("# seeded by ubuntu-image\ncore 5\npc-kernel x3\ntest-snap -1\n")?;
        assert_eq!(revisions.len(), 3);
        assert_eq!(revisions["core"], Revision(5));
        assert_eq!(revisions["pc-kernel"], Revision(-3));
        assert!(revisions["test-snap"].is_local());
        Ok(())
    }

    #[test]
    fn rejected_lines() {
        assert!(matches!(
            read_str(" foo 5\n"),
            Err(ManifestError::LeadingSpace { line: 1, .. })
        ));
        assert!(matches!(
            read_str("foo 0\n"),
            Err(ManifestError::UnsetRevision(_))
        ));
        assert!(matches!(
            read_str("foo unset\n"),
            Err(ManifestError::UnsetRevision(_))
        ));
        assert!(matches!(
            read_str("core 1\nfoo bar baz\n"),
            Err(ManifestError::Malformed { line: 2, .. })
        ));
        assert!(matches!(
            read_str("foo bar\n"),
            Err(ManifestError::InvalidRevision(_))
        ));
        assert!(matches!(
            read_str("Foo 1\n"),
            Err(ManifestError::InvalidName { .. })
        ));
        assert!(matches!(
            read_str("foo x0\n"),
            Err(ManifestError::InvalidRevision(_))
        ));
    }

    #[test]
    fn snap_names() {
        for name in ["core", "pc-kernel", "core18", "a1", "0ad"] {
            assert!(validate_snap_name(name).is_ok(), "{}", name);
        }
        for name in ["a", "-core", "core-", "co--re", "123", "core_18", "a".repeat(41).as_str()] {
            assert!(validate_snap_name(name).is_err(), "{}", name);
        }
    }

    #[test]
    fn write_sorted() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("seed.manifest");
        let revisions = BTreeMap::from([
            ("test-snap".to_string(), Revision(-1)),
            ("core".to_string(), Revision(5)),
        ]);
        write_seed_manifest(&path, &revisions)?;
        assert_eq!(fs::read_to_string(&path)?, "core 5\ntest-snap -1\n");
        assert_eq!(read_seed_manifest(&path)?, revisions);
        Ok(())
    }

    #[test]
    fn round_trips() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("seed.manifest");
        let long_name = format!("{}-{}", "a".repeat(20), "9".repeat(19));
        let cases = [
            vec![("core", Revision(1))],
            vec![(long_name.as_str(), Revision(i32::MAX))],
            vec![("0ad", Revision(i32::MIN + 1)), ("pc", Revision(-7)), ("pc-kernel", Revision(12))],
        ];
        for case in cases {
            let revisions: BTreeMap<_, _> = case
                .into_iter()
                .map(|(name, revision)| (name.to_string(), revision))
                .collect();
            write_seed_manifest(&path, &revisions)?;
            assert_eq!(read_seed_manifest(&path)?, revisions);
        }

        // local revisions read as `xN` are written back as `-N`
        fs::write(&path, "pc-kernel x3\ncore 5\n")?;
        let revisions = read_seed_manifest(&path)?;
        write_seed_manifest(&path, &revisions)?;
        assert_eq!(fs::read_to_string(&path)?, "core 5\npc-kernel -3\n");
        assert_eq!(read_seed_manifest(&path)?, revisions);
        Ok(())
    }

    #[test]
    fn write_empty_creates_nothing() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("seed.manifest");
        write_seed_manifest(&path, &BTreeMap::new())?;
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn write_rejects_unset() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("seed.manifest");
        let revisions = BTreeMap::from([("core".to_string(), Revision(0))]);
        assert!(matches!(
            write_seed_manifest(&path, &revisions),
            Err(ManifestError::UnsetRevision(_))
        ));
        assert!(!path.exists());
        Ok(())
    }
}
