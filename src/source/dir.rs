//! Local directory source backend
//!
//! Tars a directory verbatim (minus top-level dotfiles). The cachekey
//! is a digest over the tar stream itself, so it tracks exactly what
//! the build will see. Supports direct copying as a capability, which
//! lets the extraction path skip the tar round-trip.

use crate::error::{KilnError, KilnResult};
use crate::source::{tarstream, DirectCopy, SourceCache, SourceSpec};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Score this backend's claim on a url
pub fn guess(url: &str) -> Option<u8> {
    if url.starts_with("file://") {
        return Some(7);
    }
    if url.starts_with('/')
        || url.starts_with("./")
        || url.starts_with("../")
        || url.starts_with('~')
    {
        return Some(5);
    }
    None
}

/// Construct the directory cache for a spec
pub fn build(spec: &SourceSpec, _cache_dir: &Path) -> KilnResult<Box<dyn SourceCache>> {
    Ok(Box::new(DirSource::new(spec)?))
}

#[derive(Debug)]
pub(crate) struct DirSource {
    path: PathBuf,
    key: OnceLock<String>,
}

impl DirSource {
    pub(crate) fn new(spec: &SourceSpec) -> KilnResult<Self> {
        let raw = spec.url.strip_prefix("file://").unwrap_or(&spec.url);
        let path = if let Some(rest) = raw.strip_prefix("~/") {
            dirs::home_dir()
                .ok_or_else(|| KilnError::PathNotFound(PathBuf::from(raw)))?
                .join(rest)
        } else {
            PathBuf::from(raw)
        };
        if !path.is_dir() {
            return Err(KilnError::PathNotFound(path));
        }
        Ok(Self {
            path,
            key: OnceLock::new(),
        })
    }
}

/// Counts a digest over everything written through it
struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

impl SourceCache for DirSource {
    fn cachekey(&self) -> KilnResult<String> {
        if let Some(key) = self.key.get() {
            return Ok(key.clone());
        }
        let writer = HashingWriter {
            inner: std::io::sink(),
            hasher: Sha256::new(),
        };
        let writer = tarstream::write_dir_tar(&self.path, writer, true)?;
        let key = hex::encode(writer.hasher.finalize());
        let _ = self.key.set(key.clone());
        Ok(key)
    }

    fn tar(&self) -> KilnResult<Box<dyn Read + Send>> {
        // spool into an unlinked temp file so large trees never sit in
        // memory
        let spool = tempfile::tempfile().map_err(|e| KilnError::io("creating spool file", e))?;
        let mut spool = tarstream::write_dir_tar(&self.path, spool, true)?;
        spool
            .seek(SeekFrom::Start(0))
            .map_err(|e| KilnError::io("rewinding spool file", e))?;
        Ok(Box::new(spool))
    }

    fn as_direct_copy(&self) -> Option<&dyn DirectCopy> {
        Some(self)
    }
}

impl DirectCopy for DirSource {
    fn copy_to(&self, dest: &Path) -> KilnResult<()> {
        copy_tree(&self.path, dest, true)
    }
}

pub(crate) fn copy_tree(src: &Path, dest: &Path, skip_dotfiles: bool) -> KilnResult<()> {
    fs::create_dir_all(dest)
        .map_err(|e| KilnError::io(format!("creating {}", dest.display()), e))?;
    let mut entries: Vec<_> = fs::read_dir(src)
        .map_err(|e| KilnError::io(format!("reading {}", src.display()), e))?
        .collect::<Result<_, _>>()
        .map_err(|e| KilnError::io(format!("reading {}", src.display()), e))?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name();
        if skip_dotfiles && name.to_string_lossy().starts_with('.') {
            continue;
        }
        let from = entry.path();
        let to = dest.join(&name);
        let file_type = entry
            .file_type()
            .map_err(|e| KilnError::io(format!("inspecting {}", from.display()), e))?;

        if file_type.is_dir() {
            copy_tree(&from, &to, false)?;
        } else if file_type.is_symlink() {
            let target = fs::read_link(&from)
                .map_err(|e| KilnError::io(format!("reading link {}", from.display()), e))?;
            #[cfg(unix)]
            std::os::unix::fs::symlink(&target, &to)
                .map_err(|e| KilnError::io(format!("linking {}", to.display()), e))?;
            #[cfg(not(unix))]
            let _ = target;
        } else {
            fs::copy(&from, &to)
                .map_err(|e| KilnError::io(format!("copying {}", from.display()), e))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn source_for(dir: &Path) -> DirSource {
        DirSource::new(&SourceSpec::with_url(dir.to_string_lossy())).unwrap()
    }

    #[test]
    fn guess_scores() {
        assert_eq!(guess("file:///srv/src"), Some(7));
        assert_eq!(guess("/srv/src"), Some(5));
        assert_eq!(guess("./src"), Some(5));
        assert_eq!(guess("https://example.com/x.tar"), None);
    }

    #[test]
    fn missing_directory_is_fatal() {
        let err = DirSource::new(&SourceSpec::with_url("/does/not/exist-kiln")).unwrap_err();
        assert!(matches!(err, KilnError::PathNotFound(_)));
    }

    #[test]
    fn cachekey_tracks_content() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "one").unwrap();

        let key1 = source_for(dir.path()).cachekey().unwrap();
        let key1_again = source_for(dir.path()).cachekey().unwrap();
        assert_eq!(key1, key1_again);

        fs::write(dir.path().join("a.txt"), "two").unwrap();
        let key2 = source_for(dir.path()).cachekey().unwrap();
        assert_ne!(key1, key2);
    }

    #[test]
    fn tar_excludes_top_level_dotfiles() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("keep.txt"), "k").unwrap();
        fs::write(dir.path().join(".git-ish"), "x").unwrap();

        let src = source_for(dir.path());
        let mut archive = tar::Archive::new(src.tar().unwrap());
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["keep.txt"]);
    }

    #[test]
    fn direct_copy_capability() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/b.txt"), "b").unwrap();
        fs::write(dir.path().join(".hidden"), "h").unwrap();

        let src = source_for(dir.path());
        let copier = src.as_direct_copy().expect("dir backend can copy");

        let dest = TempDir::new().unwrap();
        copier.copy_to(dest.path()).unwrap();

        assert!(dest.path().join("a.txt").exists());
        assert!(dest.path().join("sub/b.txt").exists());
        assert!(!dest.path().join(".hidden").exists());
    }
}
