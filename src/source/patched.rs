//! Patch decorator for source caches
//!
//! Wraps an inner cache and applies patch files into a derived cache
//! directory keyed by (inner cachekey, patch contents). Distinct patch
//! sets never collide; re-selecting a previously used set reuses its
//! materialized tree without re-extracting or re-patching.

use crate::error::{KilnError, KilnResult};
use crate::source::{tarstream, PatchSpec, SourceCache};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::OnceLock;
use tracing::{debug, info};

pub(crate) struct PatchedSource {
    inner: Box<dyn SourceCache>,
    patches: Vec<PatchSpec>,
    cache_dir: PathBuf,
    key: OnceLock<String>,
}

impl PatchedSource {
    pub(crate) fn new(
        inner: Box<dyn SourceCache>,
        patches: Vec<PatchSpec>,
        cache_dir: &Path,
    ) -> KilnResult<Self> {
        for patch in &patches {
            if !patch.file.is_file() {
                return Err(KilnError::PathNotFound(patch.file.clone()));
            }
        }
        Ok(Self {
            inner,
            patches,
            cache_dir: cache_dir.to_path_buf(),
            key: OnceLock::new(),
        })
    }

    fn compute_key(&self) -> KilnResult<String> {
        let mut hasher = Sha256::new();
        hasher.update(self.inner.cachekey()?.as_bytes());
        for patch in &self.patches {
            let contents = fs::read(&patch.file)
                .map_err(|e| KilnError::io(format!("reading {}", patch.file.display()), e))?;
            hasher.update(&contents);
        }
        Ok(hex::encode(hasher.finalize()))
    }

    /// Extract the inner cache and apply the patch set, once per key
    fn ensure_materialized(&self) -> KilnResult<PathBuf> {
        let key = self.cachekey()?;
        let dir = self.cache_dir.join("patched").join(&key);
        if dir.is_dir() {
            debug!("patched tree reused: {}", dir.display());
            return Ok(dir);
        }

        let staging = self.cache_dir.join("patched").join(format!("{key}.part"));
        if staging.exists() {
            fs::remove_dir_all(&staging)
                .map_err(|e| KilnError::io(format!("clearing {}", staging.display()), e))?;
        }
        fs::create_dir_all(&staging)
            .map_err(|e| KilnError::io(format!("creating {}", staging.display()), e))?;

        // backends with the direct-copy capability skip the tar
        // round-trip
        match self.inner.as_direct_copy() {
            Some(copier) => copier.copy_to(&staging)?,
            None => tar::Archive::new(self.inner.tar()?)
                .unpack(&staging)
                .map_err(|e| KilnError::io(format!("unpacking into {}", staging.display()), e))?,
        }

        for patch in &self.patches {
            self.apply(patch, &staging)?;
        }

        fs::rename(&staging, &dir)
            .map_err(|e| KilnError::io(format!("renaming {}", staging.display()), e))?;
        Ok(dir)
    }

    fn apply(&self, patch: &PatchSpec, root: &Path) -> KilnResult<()> {
        let target = match &patch.base {
            Some(base) => root.join(base),
            None => root.to_path_buf(),
        };
        let patch_file = fs::canonicalize(&patch.file)
            .map_err(|e| KilnError::io(format!("resolving {}", patch.file.display()), e))?;

        info!("Applying patch {}", patch.file.display());
        let status = Command::new("patch")
            .arg("-t")
            .arg("-p1")
            .arg("-d")
            .arg(&target)
            .arg("-i")
            .arg(&patch_file)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| KilnError::command_failed("patch", e))?;

        if !status.success() {
            return Err(KilnError::PatchFailed {
                patch: patch.file.clone(),
                code: status.code().unwrap_or(-1),
            });
        }
        Ok(())
    }
}

impl SourceCache for PatchedSource {
    fn cachekey(&self) -> KilnResult<String> {
        if let Some(key) = self.key.get() {
            return Ok(key.clone());
        }
        let key = self.compute_key()?;
        let _ = self.key.set(key.clone());
        Ok(key)
    }

    fn tar(&self) -> KilnResult<Box<dyn Read + Send>> {
        let dir = self.ensure_materialized()?;
        let spool = tempfile::tempfile().map_err(|e| KilnError::io("creating spool file", e))?;
        let mut spool = tarstream::write_dir_tar(&dir, spool, false)?;
        spool
            .seek(SeekFrom::Start(0))
            .map_err(|e| KilnError::io("rewinding spool file", e))?;
        Ok(Box::new(spool))
    }

    fn prefix(&self) -> KilnResult<Option<String>> {
        // the materialized tree keeps the inner layout
        self.inner.prefix()
    }
}
