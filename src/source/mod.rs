//! Source cache subsystem
//!
//! Fetches, validates and caches build sources (remote archives, git
//! repositories, local directories) as content-addressed tar streams.
//! Backend selection is a scored pattern match on the source url; the
//! unique highest score wins and anything else is a configuration
//! error. Caches materialize lazily on first use and are never mutated
//! afterward within a run.
//!
//! The on-disk cache directory carries no inter-process locking;
//! concurrent invocations sharing one cache root are unsupported.

pub mod archive;
pub mod dir;
pub mod git;
pub mod patched;
pub mod tarstream;

use crate::error::{KilnError, KilnResult};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};

/// A patch applied on top of the fetched source tree
#[derive(Debug, Clone, Deserialize)]
pub struct PatchSpec {
    /// Patch file path, relative to the recipe directory
    pub file: PathBuf,
    /// Subdirectory of the unpacked tree to apply from
    #[serde(default)]
    pub base: Option<String>,
}

/// Declarative description of where a build's source comes from
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SourceSpec {
    /// Source url (archive http(s) url, git url, or local path)
    pub url: String,
    /// Declared content checksum (64 hex chars SHA-256, 40 SHA-1)
    pub checksum: Option<String>,
    /// Mapping of source paths into the build directory
    pub file_map: BTreeMap<String, String>,
    /// Git branch to fetch
    pub branch: Option<String>,
    /// Git tag to fetch
    pub tag: Option<String>,
    /// Explicit git revision to fetch
    pub revision: Option<String>,
    /// Subdirectory of the source tree the build runs in
    pub subdir: Option<String>,
    /// Patches applied in order after fetching
    pub patches: Vec<PatchSpec>,
}

impl SourceSpec {
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

/// A materialized, content-addressed source tree
///
/// `prefix` and [`SourceCache::as_direct_copy`] are optional
/// capabilities: a backend that implements them overrides the default,
/// fixed at construction time.
pub trait SourceCache: Send {
    /// Content-derived identifier, stable across invocations for
    /// identical (url, checksum, patch-set) inputs
    fn cachekey(&self) -> KilnResult<String>;

    /// The cached tree as a tar byte stream
    fn tar(&self) -> KilnResult<Box<dyn Read + Send>>;

    /// Single common leading path component of the tree, if any
    fn prefix(&self) -> KilnResult<Option<String>> {
        Ok(None)
    }

    /// Direct-copy capability, for backends that can skip the tar
    /// round-trip
    fn as_direct_copy(&self) -> Option<&dyn DirectCopy> {
        None
    }
}

/// Capability to copy the cached tree straight into a directory
pub trait DirectCopy {
    fn copy_to(&self, dest: &Path) -> KilnResult<()>;
}

/// One registered source backend: matcher plus constructor
#[derive(Debug)]
pub struct BackendEntry {
    pub name: &'static str,
    pub guess: fn(&str) -> Option<u8>,
    pub build: fn(&SourceSpec, &Path) -> KilnResult<Box<dyn SourceCache>>,
}

/// Registration table, in guess-evaluation order
pub const BACKENDS: &[BackendEntry] = &[
    BackendEntry {
        name: "git",
        guess: git::guess,
        build: git::build,
    },
    BackendEntry {
        name: "archive",
        guess: archive::guess,
        build: archive::build,
    },
    BackendEntry {
        name: "dir",
        guess: dir::guess,
        build: dir::build,
    },
];

fn select_from<'a>(url: &str, backends: &'a [BackendEntry]) -> KilnResult<&'a BackendEntry> {
    let mut best: Option<(u8, Vec<&'a BackendEntry>)> = None;

    for backend in backends {
        let Some(score) = (backend.guess)(url) else {
            continue;
        };
        best = match best.take() {
            None => Some((score, vec![backend])),
            Some((top, _)) if score > top => Some((score, vec![backend])),
            Some((top, mut matched)) => {
                if score == top {
                    matched.push(backend);
                }
                Some((top, matched))
            }
        };
    }

    match best {
        None => Err(KilnError::SourceUnrecognized {
            url: url.to_string(),
        }),
        Some((_, matched)) if matched.len() > 1 => Err(KilnError::SourceAmbiguous {
            url: url.to_string(),
            candidates: matched.iter().map(|b| b.name.to_string()).collect(),
        }),
        Some((_, matched)) => Ok(matched[0]),
    }
}

/// Select the backend for a url (unique highest score wins)
pub fn select_backend(url: &str) -> KilnResult<&'static BackendEntry> {
    select_from(url, BACKENDS)
}

/// Build the source cache for a spec inside `cache_dir`
///
/// When the spec declares patches the backend cache is wrapped in the
/// patch decorator, whose identity covers the patch contents.
pub fn build_cache(spec: &SourceSpec, cache_dir: &Path) -> KilnResult<Box<dyn SourceCache>> {
    let backend = select_backend(&spec.url)?;
    tracing::debug!("source backend for {}: {}", spec.url, backend.name);
    let inner = (backend.build)(spec, cache_dir)?;

    if spec.patches.is_empty() {
        Ok(inner)
    } else {
        Ok(Box::new(patched::PatchedSource::new(
            inner,
            spec.patches.clone(),
            cache_dir,
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn none_cache(_: &SourceSpec, _: &Path) -> KilnResult<Box<dyn SourceCache>> {
        unreachable!("test table is only used for selection")
    }

    #[test]
    fn git_urls_pick_git_backend() {
        for url in [
            "git://example.com/proj",
            "https://example.com/proj.git",
            "git+https://example.com/proj",
            "builder@example.com:proj.git",
        ] {
            assert_eq!(select_backend(url).unwrap().name, "git", "url: {url}");
        }
    }

    #[test]
    fn archive_urls_pick_archive_backend() {
        for url in [
            "https://example.com/proj-1.0.tar.gz",
            "http://example.com/proj.zip",
            "https://example.com/tool.bin",
        ] {
            assert_eq!(select_backend(url).unwrap().name, "archive", "url: {url}");
        }
    }

    #[test]
    fn paths_pick_dir_backend() {
        for url in ["/srv/src/proj", "./proj", "file:///srv/src/proj", "~/proj"] {
            assert_eq!(select_backend(url).unwrap().name, "dir", "url: {url}");
        }
    }

    #[test]
    fn unrecognized_url_is_fatal() {
        let err = select_backend("mailto:nobody@example.com").unwrap_err();
        assert!(matches!(err, KilnError::SourceUnrecognized { .. }));
    }

    #[test]
    fn tied_score_is_fatal_and_names_candidates() {
        let table = [
            BackendEntry {
                name: "left",
                guess: |_| Some(5),
                build: none_cache,
            },
            BackendEntry {
                name: "right",
                guess: |_| Some(5),
                build: none_cache,
            },
        ];
        let err = select_from("anything", &table).unwrap_err();
        match err {
            KilnError::SourceAmbiguous { candidates, .. } => {
                assert_eq!(candidates, vec!["left", "right"]);
            }
            other => panic!("expected SourceAmbiguous, got {other:?}"),
        }
    }
}
