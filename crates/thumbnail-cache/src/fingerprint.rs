//! Source-file fingerprinting and the 160-bit cache hash.
//!
//! A thumbnail is keyed by the state of its source file, captured as the
//! tuple (absolute path, byte length, mtime seconds, mtime nanoseconds).
//! That tuple is the classic Unix freshness heuristic: any edit to the
//! source changes the mtime, so the derived hash — and with it the cache
//! entry — changes too.

use std::env;
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::time::UNIX_EPOCH;

use sha1::{Digest, Sha1};

use crate::error::{Error, Result};

/// File metadata snapshot identifying one state of a source image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    path: PathBuf,
    size: i64,
    mtime_sec: i64,
    mtime_nsec: i64,
}

impl Fingerprint {
    /// Stat `path` and capture its identifying metadata.
    ///
    /// The path is made absolute lexically (no symlink resolution), so the
    /// fingerprint reflects the path the caller asked about.
    pub fn from_file(path: &Path) -> Result<Fingerprint> {
        let abs = absolutize(path)?;
        let md = fs::metadata(&abs).map_err(|e| Error::from_source_stat(&abs, &e))?;
        if !md.is_file() {
            return Err(Error::SourceNotFound(abs.display().to_string()));
        }
        let mtime = md
            .modified()
            .map_err(|e| Error::io(format!("mtime of {}", abs.display()), &e))?;
        let (mtime_sec, mtime_nsec) = match mtime.duration_since(UNIX_EPOCH) {
            Ok(d) => (d.as_secs() as i64, i64::from(d.subsec_nanos())),
            // Pre-epoch mtimes only show up on broken clocks; keep them
            // deterministic rather than erroring out.
            Err(e) => {
                let d = e.duration();
                (-(d.as_secs() as i64), i64::from(d.subsec_nanos()))
            }
        };
        Ok(Fingerprint {
            path: abs,
            size: md.len() as i64,
            mtime_sec,
            mtime_nsec,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// SHA-1 over `path \0 hex(size) \0 hex(mtime_sec) \0 hex(mtime_nsec)`.
    ///
    /// NUL is the one byte that cannot appear in a path, so the serialization
    /// is unambiguous. SHA-1 is fine here: the hash is a filesystem key, not
    /// a defense against adversarial collisions.
    pub fn hash(&self) -> Hash {
        let serialized = format!(
            "{}\0{:x}\0{:x}\0{:x}",
            self.path.to_string_lossy(),
            self.size,
            self.mtime_sec,
            self.mtime_nsec
        );
        let digest = Sha1::digest(serialized.as_bytes());
        Hash(digest.into())
    }
}

/// A 160-bit digest, rendered as 40 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Hash([u8; 20]);

impl Hash {
    pub const HEX_LEN: usize = 40;

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Lowercase hex form, the leading component of every cache id.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.to_hex())
    }
}

impl FromStr for Hash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Hash> {
        if s.len() != Self::HEX_LEN {
            return Err(Error::InvalidDescriptor(format!(
                "hash must be {} hex chars, got {}",
                Self::HEX_LEN,
                s.len()
            )));
        }
        let bytes = hex::decode(s)
            .map_err(|_| Error::InvalidDescriptor(format!("not a hex hash: {s:?}")))?;
        let mut out = [0u8; 20];
        out.copy_from_slice(&bytes);
        Ok(Hash(out))
    }
}

/// Make `path` absolute against the CWD and normalize `.`/`..` components
/// without touching the filesystem. Symlinks are deliberately left alone.
pub(crate) fn absolutize(path: &Path) -> Result<PathBuf> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        let cwd = env::current_dir().map_err(|e| Error::io("current working directory", &e))?;
        cwd.join(path)
    };
    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    Ok(out)
}
