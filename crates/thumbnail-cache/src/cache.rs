//! The content-addressed cache directory: `Factory` validates and owns the
//! base directory, `ThumbInfo` is the full cache-key record for one thumbnail.
//!
//! Layout under the base directory is `<hash[0:2]>/<hash[2:4]>/<id>` with
//! `id = <hash>-<WxH>-<mode>.<format>`, giving up to 65 536 shard buckets
//! and a self-describing tree: the filesystem is the index.

use std::fs::{self, Metadata};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use filetime::FileTime;
use tracing::debug;

use crate::descriptor::{Dimensions, Format, Mode};
use crate::error::{Error, Result};
use crate::fingerprint::{absolutize, Fingerprint, Hash};
use crate::generate;

/// An `exists()` hit refreshes timestamps only when the file has been idle
/// this long, bounding touch writes to one per file per window.
pub const LAZY_TOUCH_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Handle to a validated cache base directory; builds `ThumbInfo` values.
#[derive(Debug, Clone)]
pub struct Factory {
    base_dir: PathBuf,
    program: Arc<str>,
}

impl Factory {
    /// Validate `base_dir` and return a factory using the default external
    /// converter (`convert`).
    pub fn new(base_dir: &Path) -> Result<Factory> {
        Factory::with_program(base_dir, "convert")
    }

    /// Validate `base_dir`: make it absolute, create it if missing, reject
    /// non-directories, and probe that it is writable.
    pub fn with_program(base_dir: &Path, program: &str) -> Result<Factory> {
        let abs = absolutize(base_dir)?;
        match fs::metadata(&abs) {
            Ok(md) if !md.is_dir() => {
                return Err(Error::Config(format!(
                    "{} exists but is not a directory",
                    abs.display()
                )));
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                fs::create_dir_all(&abs)
                    .map_err(|e| Error::io(format!("create cache dir {}", abs.display()), &e))?;
            }
            Err(e) => return Err(Error::io(format!("stat {}", abs.display()), &e)),
        }
        // Probe writability up front so misconfiguration fails at startup,
        // not on the first request.
        tempfile::Builder::new()
            .prefix("cache-probe-")
            .tempfile_in(&abs)
            .map_err(|e| Error::io(format!("cache dir {} is not writable", abs.display()), &e))?;
        Ok(Factory {
            base_dir: abs,
            program: Arc::from(program),
        })
    }

    /// Absolute path of the validated cache root.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Fingerprint `source` and assemble the cache-key record for the given
    /// transform.
    pub fn from_file(
        &self,
        source: &Path,
        dimensions: Dimensions,
        mode: Mode,
        format: Format,
    ) -> Result<ThumbInfo> {
        if format == Format::Unknown {
            return Err(Error::InvalidDescriptor(
                "unknown output format".to_string(),
            ));
        }
        let fingerprint = Fingerprint::from_file(source)?;
        let hash = fingerprint.hash();
        Ok(self.assemble(
            hash,
            fingerprint.path().to_path_buf(),
            dimensions,
            mode,
            format,
        ))
    }

    /// Reconstruct a `ThumbInfo` from a bare id string
    /// (`<hash>-<WxH>-<mode>.<format>`). The result has an empty `source`:
    /// the id alone determines the on-disk artifact, and `source` is only a
    /// convenience for generation.
    pub fn from_id(&self, id: &str) -> Result<ThumbInfo> {
        let (hash_part, rest) = id
            .split_once('-')
            .ok_or_else(|| Error::InvalidDescriptor(format!("malformed id {id:?}")))?;
        let hash: Hash = hash_part.parse()?;
        let (size_part, rest) = rest
            .split_once('-')
            .ok_or_else(|| Error::InvalidDescriptor(format!("malformed id {id:?}")))?;
        let dimensions: Dimensions = size_part.parse()?;
        let (mode_part, format_part) = rest
            .rsplit_once('.')
            .ok_or_else(|| Error::InvalidDescriptor(format!("malformed id {id:?}")))?;
        let mode: Mode = mode_part.parse()?;
        let format = Format::from_name(format_part);
        if format == Format::Unknown {
            return Err(Error::InvalidDescriptor(format!(
                "unknown format in id {id:?}"
            )));
        }
        Ok(self.assemble(hash, PathBuf::new(), dimensions, mode, format))
    }

    fn assemble(
        &self,
        hash: Hash,
        source: PathBuf,
        dimensions: Dimensions,
        mode: Mode,
        format: Format,
    ) -> ThumbInfo {
        let hex = hash.to_hex();
        let id = format!("{hex}-{dimensions}-{mode}.{}", format.ext());
        let path = self.base_dir.join(&hex[0..2]).join(&hex[2..4]).join(&id);
        ThumbInfo {
            id,
            source,
            hash,
            dimensions,
            mode,
            format,
            path,
            program: Arc::clone(&self.program),
        }
    }
}

/// The full cache-key record for one thumbnail.
///
/// The `id` uniquely determines every field except `source`; two values with
/// the same id refer to the same on-disk artifact.
#[derive(Debug, Clone)]
pub struct ThumbInfo {
    id: String,
    source: PathBuf,
    hash: Hash,
    dimensions: Dimensions,
    mode: Mode,
    format: Format,
    path: PathBuf,
    program: Arc<str>,
}

impl ThumbInfo {
    /// The canonical cache key, `<hash>-<WxH>-<mode>.<format>`.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Absolute path of the source image; empty for id-only lookups.
    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn hash(&self) -> Hash {
        self.hash
    }

    pub fn dimensions(&self) -> Dimensions {
        self.dimensions
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn format(&self) -> Format {
        self.format
    }

    /// Sharded on-disk target path under the cache base directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the thumbnail already exists on disk.
    ///
    /// A hit on a file idle longer than [`LAZY_TOUCH_WINDOW`] refreshes both
    /// atime and mtime. The GC orders eviction by atime, but `relatime` and
    /// `noatime` mounts make kernel-managed atime unreliable, so the
    /// application maintains it for files it actually serves. Touch failures
    /// are ignored: the hit itself is still valid.
    pub fn exists(&self) -> bool {
        let md = match fs::metadata(&self.path) {
            Ok(md) => md,
            Err(_) => return false,
        };
        if !md.is_file() {
            return false;
        }
        self.lazy_touch(&md);
        true
    }

    fn lazy_touch(&self, md: &Metadata) {
        let atime = FileTime::from_last_access_time(md);
        let now = FileTime::now();
        let idle = now.unix_seconds().saturating_sub(atime.unix_seconds());
        if idle <= LAZY_TOUCH_WINDOW.as_secs() as i64 {
            return;
        }
        if let Err(e) = filetime::set_file_times(&self.path, now, now) {
            debug!(path = %self.path.display(), "lazy touch failed: {e}");
        }
    }

    /// Generate the thumbnail by invoking the external converter, writing to
    /// a sibling temp file and renaming into place.
    ///
    /// After a successful return a complete file is visible at `path()`;
    /// readers never observe a partial artifact.
    pub fn make(&self) -> Result<()> {
        let parent = self.path.parent().ok_or_else(|| {
            Error::Internal(format!("cache path {} has no parent", self.path.display()))
        })?;
        fs::create_dir_all(parent)
            .map_err(|e| Error::io(format!("create shard dir {}", parent.display()), &e))?;
        generate::generate(self, parent)
    }

    pub(crate) fn program(&self) -> &str {
        &self.program
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn factory(dir: &Path) -> Factory {
        Factory::new(dir).unwrap()
    }

    #[test]
    fn base_dir_is_created_and_absolute() {
        let tmp = tempdir().unwrap();
        let nested = tmp.path().join("a/b/cache");
        let f = factory(&nested);
        assert!(f.base_dir().is_absolute());
        assert!(nested.is_dir());
    }

    #[test]
    fn base_dir_must_be_a_directory() {
        let tmp = tempdir().unwrap();
        let file = tmp.path().join("occupied");
        fs::write(&file, b"x").unwrap();
        assert!(matches!(Factory::new(&file), Err(Error::Config(_))));
    }

    #[test]
    fn id_and_path_have_canonical_shape() {
        let tmp = tempdir().unwrap();
        let src = tmp.path().join("img.jpg");
        fs::write(&src, b"jpeg bytes").unwrap();
        let f = factory(&tmp.path().join("cache"));

        let ti = f
            .from_file(&src, Dimensions::square(480), Mode::Crop, Format::Jpeg)
            .unwrap();
        let hex = ti.hash().to_hex();
        assert_eq!(ti.id(), format!("{hex}-480x480-crop.jpg"));
        let expected = f
            .base_dir()
            .join(&hex[0..2])
            .join(&hex[2..4])
            .join(ti.id());
        assert_eq!(ti.path(), expected);
        assert_eq!(ti.source(), absolutize(&src).unwrap());
    }

    #[test]
    fn same_request_same_id_different_transform_different_id() {
        let tmp = tempdir().unwrap();
        let src = tmp.path().join("img.jpg");
        fs::write(&src, b"jpeg bytes").unwrap();
        let f = factory(&tmp.path().join("cache"));

        let a = f
            .from_file(&src, Dimensions::square(100), Mode::Crop, Format::Jpeg)
            .unwrap();
        let b = f
            .from_file(&src, Dimensions::square(100), Mode::Crop, Format::Jpeg)
            .unwrap();
        let c = f
            .from_file(&src, Dimensions::square(100), Mode::Shrink, Format::Jpeg)
            .unwrap();
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
    }

    #[test]
    fn unknown_format_is_rejected() {
        let tmp = tempdir().unwrap();
        let src = tmp.path().join("img.jpg");
        fs::write(&src, b"x").unwrap();
        let f = factory(&tmp.path().join("cache"));
        let err = f
            .from_file(&src, Dimensions::square(10), Mode::Crop, Format::Unknown)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidDescriptor(_)));
    }

    #[test]
    fn id_round_trips_through_from_id() {
        let tmp = tempdir().unwrap();
        let src = tmp.path().join("img.jpg");
        fs::write(&src, b"jpeg bytes").unwrap();
        let f = factory(&tmp.path().join("cache"));

        let ti = f
            .from_file(&src, Dimensions::new(100, 200), Mode::Stretch, Format::WebP)
            .unwrap();
        let back = f.from_id(ti.id()).unwrap();
        assert_eq!(back.id(), ti.id());
        assert_eq!(back.path(), ti.path());
        assert_eq!(back.dimensions(), ti.dimensions());
        assert_eq!(back.mode(), ti.mode());
        assert_eq!(back.format(), ti.format());
        assert_eq!(back.source(), Path::new(""));
    }

    #[test]
    fn from_id_rejects_malformed_ids() {
        let tmp = tempdir().unwrap();
        let f = factory(&tmp.path().join("cache"));
        assert!(f.from_id("not-an-id").is_err());
        assert!(f
            .from_id(&format!("{}-100x100-crop", "ab".repeat(20)))
            .is_err());
        assert!(f
            .from_id(&format!("{}-100x100-pad.jpg", "ab".repeat(20)))
            .is_err());
    }

    #[test]
    fn exists_false_until_file_appears() {
        let tmp = tempdir().unwrap();
        let src = tmp.path().join("img.jpg");
        fs::write(&src, b"jpeg bytes").unwrap();
        let f = factory(&tmp.path().join("cache"));
        let ti = f
            .from_file(&src, Dimensions::square(64), Mode::Shrink, Format::Png)
            .unwrap();

        assert!(!ti.exists());
        fs::create_dir_all(ti.path().parent().unwrap()).unwrap();
        fs::write(ti.path(), b"thumb").unwrap();
        assert!(ti.exists());
    }

    #[test]
    fn exists_touches_only_idle_files() {
        let tmp = tempdir().unwrap();
        let src = tmp.path().join("img.jpg");
        fs::write(&src, b"jpeg bytes").unwrap();
        let f = factory(&tmp.path().join("cache"));
        let ti = f
            .from_file(&src, Dimensions::square(64), Mode::Shrink, Format::Jpeg)
            .unwrap();
        fs::create_dir_all(ti.path().parent().unwrap()).unwrap();
        fs::write(ti.path(), b"thumb").unwrap();

        // Fresh file: timestamps must be left alone.
        let recent = FileTime::from_unix_time(FileTime::now().unix_seconds() - 60, 0);
        filetime::set_file_times(ti.path(), recent, recent).unwrap();
        assert!(ti.exists());
        let md = fs::metadata(ti.path()).unwrap();
        assert_eq!(
            FileTime::from_last_access_time(&md).unix_seconds(),
            recent.unix_seconds()
        );

        // Idle for 48h: both stamps jump to now.
        let stale = FileTime::from_unix_time(FileTime::now().unix_seconds() - 48 * 3600, 0);
        filetime::set_file_times(ti.path(), stale, stale).unwrap();
        assert!(ti.exists());
        let md = fs::metadata(ti.path()).unwrap();
        let now = FileTime::now().unix_seconds();
        assert!((now - FileTime::from_last_access_time(&md).unix_seconds()).abs() < 10);
        assert!((now - FileTime::from_last_modification_time(&md).unix_seconds()).abs() < 10);
    }
}
