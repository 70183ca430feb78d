//! Tar stream plumbing shared by the source backends
//!
//! Source caches hand their contents around as tar byte-streams. This
//! module provides the sequential composite reader used to chain
//! several tar-producing layers, a deterministic directory→tar writer,
//! and the common-prefix inspection used by the archive backend.

use crate::error::{KilnError, KilnResult};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::path::Path;

/// A deferred or already-open part of a [`ChainReader`]
enum Part {
    Open(Box<dyn Read + Send>),
    Deferred(Box<dyn FnOnce() -> io::Result<Box<dyn Read + Send>> + Send>),
}

/// Sequential composite byte stream
///
/// Reads the current part until it is exhausted, then advances to the
/// next. Deferred parts are only opened once the prior part has been
/// fully consumed, so expensive producers (child processes, network
/// fetches) start as late as possible.
pub struct ChainReader {
    parts: VecDeque<Part>,
}

impl ChainReader {
    pub fn new() -> Self {
        Self {
            parts: VecDeque::new(),
        }
    }

    /// Append an already-open reader
    pub fn push(mut self, reader: impl Read + Send + 'static) -> Self {
        self.parts.push_back(Part::Open(Box::new(reader)));
        self
    }

    /// Append a reader that is opened only when reached
    pub fn push_deferred(
        mut self,
        open: impl FnOnce() -> io::Result<Box<dyn Read + Send>> + Send + 'static,
    ) -> Self {
        self.parts.push_back(Part::Deferred(Box::new(open)));
        self
    }
}

impl Default for ChainReader {
    fn default() -> Self {
        Self::new()
    }
}

impl Read for ChainReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.parts.front_mut() {
                None => return Ok(0),
                Some(Part::Deferred(_)) => {
                    let Some(Part::Deferred(open)) = self.parts.pop_front() else {
                        unreachable!();
                    };
                    self.parts.push_front(Part::Open(open()?));
                }
                Some(Part::Open(reader)) => {
                    let n = reader.read(buf)?;
                    if n > 0 {
                        return Ok(n);
                    }
                    self.parts.pop_front();
                }
            }
        }
    }
}

/// A small in-memory file to place in a tar stream
pub struct TarMember {
    pub name: String,
    pub mode: u32,
    pub data: Vec<u8>,
}

impl TarMember {
    pub fn new(name: impl Into<String>, mode: u32, data: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            mode,
            data: data.into(),
        }
    }
}

/// Serialize members into tar bytes with the end-of-archive trailer
/// removed, so the result can be chained ahead of a complete tar
/// stream (the trailing stream supplies the terminator).
pub fn members_tar(members: &[TarMember]) -> KilnResult<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    for member in members {
        let mut header = tar::Header::new_gnu();
        header.set_size(member.data.len() as u64);
        header.set_mode(member.mode);
        header.set_mtime(0);
        header.set_cksum();
        builder
            .append_data(&mut header, &member.name, member.data.as_slice())
            .map_err(|e| KilnError::io(format!("appending tar member {}", member.name), e))?;
    }
    let mut bytes = builder
        .into_inner()
        .map_err(|e| KilnError::io("finishing member tar", e))?;
    // into_inner appends the two 512-byte terminator blocks
    bytes.truncate(bytes.len() - 1024);
    Ok(bytes)
}

/// Write a directory as a tar stream with deterministic entry order
///
/// Entries are sorted by name at every level. When `skip_top_dotfiles`
/// is set, dot-entries directly under `dir` are left out.
pub fn write_dir_tar<W: Write>(dir: &Path, out: W, skip_top_dotfiles: bool) -> KilnResult<W> {
    let mut builder = tar::Builder::new(out);
    builder.follow_symlinks(false);
    append_dir_entries(&mut builder, dir, Path::new(""), skip_top_dotfiles)?;
    builder
        .into_inner()
        .map_err(|e| KilnError::io(format!("finishing tar of {}", dir.display()), e))
}

fn append_dir_entries<W: Write>(
    builder: &mut tar::Builder<W>,
    dir: &Path,
    rel: &Path,
    skip_dotfiles: bool,
) -> KilnResult<()> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)
        .map_err(|e| KilnError::io(format!("reading directory {}", dir.display()), e))?
        .collect::<Result<_, _>>()
        .map_err(|e| KilnError::io(format!("reading directory {}", dir.display()), e))?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name();
        if skip_dotfiles && name.to_string_lossy().starts_with('.') {
            continue;
        }
        let path = entry.path();
        let entry_rel = rel.join(&name);
        let file_type = entry
            .file_type()
            .map_err(|e| KilnError::io(format!("inspecting {}", path.display()), e))?;

        if file_type.is_dir() {
            builder
                .append_dir(&entry_rel, &path)
                .map_err(|e| KilnError::io(format!("taring directory {}", path.display()), e))?;
            // dotfile exclusion only applies at the top level
            append_dir_entries(builder, &path, &entry_rel, false)?;
        } else {
            builder
                .append_path_with_name(&path, &entry_rel)
                .map_err(|e| KilnError::io(format!("taring {}", path.display()), e))?;
        }
    }
    Ok(())
}

/// The single common leading path segment of a set of member names
///
/// Returns `Some(segment)` only when every member lives under that
/// segment (a plain top-level file defeats the prefix).
pub fn common_prefix<I, S>(names: I) -> Option<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut prefix: Option<String> = None;
    let mut saw_nested = false;

    for name in names {
        let name = name.as_ref().trim_start_matches("./").trim_end_matches('/');
        if name.is_empty() || name == "." {
            continue;
        }
        let (first, nested) = match name.split_once('/') {
            Some((first, _)) => (first, true),
            None => (name, false),
        };
        saw_nested |= nested;
        match &prefix {
            None => prefix = Some(first.to_string()),
            Some(p) if p == first => {}
            Some(_) => return None,
        }
    }

    if saw_nested {
        prefix
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn chain_reader_concatenates_in_order() {
        let mut chain = ChainReader::new()
            .push(io::Cursor::new(b"abc".to_vec()))
            .push(io::Cursor::new(b"def".to_vec()));
        let mut out = String::new();
        chain.read_to_string(&mut out).unwrap();
        assert_eq!(out, "abcdef");
    }

    #[test]
    fn chain_reader_defers_opening() {
        let opened = Arc::new(AtomicBool::new(false));
        let flag = opened.clone();
        let mut chain = ChainReader::new()
            .push(io::Cursor::new(vec![0u8; 4096]))
            .push_deferred(move || {
                flag.store(true, Ordering::SeqCst);
                Ok(Box::new(io::Cursor::new(b"tail".to_vec())) as Box<dyn Read + Send>)
            });

        let mut buf = [0u8; 1024];
        chain.read(&mut buf).unwrap();
        assert!(!opened.load(Ordering::SeqCst));

        let mut rest = Vec::new();
        chain.read_to_end(&mut rest).unwrap();
        assert!(opened.load(Ordering::SeqCst));
        assert!(rest.ends_with(b"tail"));
    }

    #[test]
    fn members_tar_chains_with_full_tar() {
        let head = members_tar(&[TarMember::new("Dockerfile", 0o644, b"FROM x\n".to_vec())])
            .unwrap();

        let mut tail_builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(2);
        header.set_mode(0o644);
        header.set_cksum();
        tail_builder
            .append_data(&mut header, "src/main.c", &b"ok"[..])
            .unwrap();
        let tail = tail_builder.into_inner().unwrap();

        let chain = ChainReader::new()
            .push(io::Cursor::new(head))
            .push(io::Cursor::new(tail));
        let mut archive = tar::Archive::new(chain);
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["Dockerfile", "src/main.c"]);
    }

    #[test]
    fn dir_tar_is_sorted_and_skips_dotfiles() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("zeta.txt"), "z").unwrap();
        fs::write(dir.path().join("alpha.txt"), "a").unwrap();
        fs::write(dir.path().join(".hidden"), "h").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/.keep"), "k").unwrap();

        let bytes = write_dir_tar(dir.path(), Vec::new(), true).unwrap();
        let mut archive = tar::Archive::new(io::Cursor::new(bytes));
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| {
                let entry = e.unwrap();
                let path = entry.path().unwrap().to_string_lossy().into_owned();
                path.trim_end_matches('/').to_string()
            })
            .collect();

        // top-level dotfile gone, nested dotfile kept, names sorted
        assert_eq!(names, vec!["alpha.txt", "sub", "sub/.keep", "zeta.txt"]);
    }

    #[test]
    fn common_prefix_detected() {
        assert_eq!(
            common_prefix(["pkg-1.0/", "pkg-1.0/src/a.c", "pkg-1.0/Makefile"]),
            Some("pkg-1.0".to_string())
        );
    }

    #[test]
    fn common_prefix_defeated_by_top_level_file() {
        assert_eq!(common_prefix(["pkg-1.0/src/a.c", "README"]), None);
    }

    #[test]
    fn common_prefix_requires_nesting() {
        assert_eq!(common_prefix(["a", "b"]), None);
        assert_eq!(common_prefix(Vec::<String>::new()), None);
    }
}
