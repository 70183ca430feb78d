//! Git source backend
//!
//! Materializes a local bare mirror, performs a shallow fetch of
//! exactly one ref into `FETCH_HEAD`, and exports the tree with
//! `git archive`. The cachekey is the resolved tree hash, so two
//! fetches of the same tree produce the same key even when commit
//! metadata differs.

use crate::error::{KilnError, KilnResult};
use crate::source::{SourceCache, SourceSpec};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::OnceLock;
use tracing::{debug, info};

/// Score this backend's claim on a url
pub fn guess(url: &str) -> Option<u8> {
    if url.starts_with("git://") || url.starts_with("git+") {
        return Some(10);
    }
    let path = url.split(['?', '#']).next().unwrap_or(url);
    if path.ends_with(".git") {
        return Some(9);
    }
    if scp_like(url) {
        return Some(6);
    }
    None
}

/// `user@host:path` form, as accepted by git itself
fn scp_like(url: &str) -> bool {
    if url.contains("://") {
        return false;
    }
    match url.split_once('@') {
        Some((user, rest)) => !user.is_empty() && rest.contains(':'),
        None => false,
    }
}

/// Construct the git cache for a spec
pub fn build(spec: &SourceSpec, cache_dir: &Path) -> KilnResult<Box<dyn SourceCache>> {
    Ok(Box::new(GitSource::new(spec.clone(), cache_dir)))
}

pub(crate) struct GitSource {
    spec: SourceSpec,
    /// Fetch url with the `git+` marker stripped
    url: String,
    /// Bare mirror: `<cache>/git/<url-digest>.git`
    mirror: PathBuf,
    /// Tree hash of FETCH_HEAD once the fetch has happened
    fetched: OnceLock<String>,
}

impl GitSource {
    pub(crate) fn new(spec: SourceSpec, cache_dir: &Path) -> Self {
        let url = spec
            .url
            .strip_prefix("git+")
            .unwrap_or(&spec.url)
            .to_string();
        let digest = hex::encode(&Sha256::digest(url.as_bytes())[..8]);
        let mirror = cache_dir.join("git").join(format!("{digest}.git"));
        Self {
            spec,
            url,
            mirror,
            fetched: OnceLock::new(),
        }
    }

    /// The single ref to fetch: revision, tag, branch, or HEAD
    fn fetch_ref(&self) -> &str {
        self.spec
            .revision
            .as_deref()
            .or(self.spec.tag.as_deref())
            .or(self.spec.branch.as_deref())
            .unwrap_or("HEAD")
    }

    fn run_git(&self, args: &[&str]) -> KilnResult<String> {
        let cmdline = format!("git {}", args.join(" "));
        debug!("Executing: {}", cmdline);
        let output = Command::new("git")
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| KilnError::command_failed(cmdline.clone(), e))?;
        if !output.status.success() {
            return Err(KilnError::command_exec(
                cmdline,
                String::from_utf8_lossy(&output.stderr),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Fetch the ref into FETCH_HEAD and resolve its tree hash
    fn ensure_fetched(&self) -> KilnResult<String> {
        if let Some(hash) = self.fetched.get() {
            return Ok(hash.clone());
        }

        std::fs::create_dir_all(&self.mirror)
            .map_err(|e| KilnError::io(format!("creating {}", self.mirror.display()), e))?;
        let mirror = self.mirror.to_string_lossy().into_owned();
        if !self.mirror.join("HEAD").exists() {
            self.run_git(&["init", "--bare", "--quiet", &mirror])?;
        }

        let fetch_ref = self.fetch_ref();
        info!("Fetching {} ({})", self.url, fetch_ref);
        self.run_git(&[
            "-C", &mirror, "fetch", "--quiet", "--depth", "1", &self.url, fetch_ref,
        ])?;

        let hash = self
            .run_git(&["-C", &mirror, "rev-parse", "FETCH_HEAD^{tree}"])?
            .trim()
            .to_string();
        debug!("resolved tree {hash}");
        let _ = self.fetched.set(hash.clone());
        Ok(hash)
    }
}

impl SourceCache for GitSource {
    fn cachekey(&self) -> KilnResult<String> {
        self.ensure_fetched()
    }

    fn tar(&self) -> KilnResult<Box<dyn Read + Send>> {
        self.ensure_fetched()?;
        let mirror = self.mirror.to_string_lossy().into_owned();
        let cmdline = format!("git -C {mirror} archive FETCH_HEAD");
        debug!("Executing: {}", cmdline);
        let mut child = Command::new("git")
            .args(["-C", mirror.as_str(), "archive", "FETCH_HEAD"])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| KilnError::command_failed(cmdline.clone(), e))?;
        let stdout = child
            .stdout
            .take()
            .expect("stdout was requested as piped");
        Ok(Box::new(GitArchiveReader {
            child,
            stdout,
            finished: false,
        }))
    }
}

/// Streams `git archive` stdout, surfacing a failed exit as a read
/// error at end of stream
struct GitArchiveReader {
    child: Child,
    stdout: ChildStdout,
    finished: bool,
}

impl Read for GitArchiveReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.stdout.read(buf)?;
        if n == 0 && !self.finished {
            self.finished = true;
            let status = self.child.wait()?;
            if !status.success() {
                return Err(std::io::Error::other(format!(
                    "git archive exited with {status}"
                )));
            }
        }
        Ok(n)
    }
}

impl Drop for GitArchiveReader {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn git_available() -> bool {
        Command::new("git")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn init_repo(dir: &Path) {
        let run = |args: &[&str]| {
            let status = Command::new("git")
                .args(args)
                .current_dir(dir)
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .unwrap();
            assert!(status.success(), "git {args:?} failed");
        };
        run(&["init", "--quiet"]);
        run(&["config", "user.email", "test@example.com"]);
        run(&["config", "user.name", "Test"]);
        fs::write(dir.join("hello.txt"), "hello\n").unwrap();
        run(&["add", "."]);
        run(&["commit", "--quiet", "-m", "initial"]);
    }

    #[test]
    fn guess_scores() {
        assert_eq!(guess("git://example.com/x"), Some(10));
        assert_eq!(guess("git+ssh://example.com/x"), Some(10));
        assert_eq!(guess("https://example.com/x.git"), Some(9));
        assert_eq!(guess("builder@example.com:x"), Some(6));
        assert_eq!(guess("https://example.com/x.tar.gz"), None);
        assert_eq!(guess("/srv/src"), None);
    }

    #[test]
    fn fetch_head_tree_is_the_cachekey() {
        if !git_available() {
            return;
        }
        let repo = TempDir::new().unwrap();
        init_repo(repo.path());
        let cache = TempDir::new().unwrap();

        let src = GitSource::new(
            SourceSpec::with_url(repo.path().to_string_lossy()),
            cache.path(),
        );
        let key = src.cachekey().unwrap();

        let expected = Command::new("git")
            .args(["rev-parse", "HEAD^{tree}"])
            .current_dir(repo.path())
            .output()
            .unwrap();
        let expected = String::from_utf8_lossy(&expected.stdout).trim().to_string();
        assert_eq!(key, expected);
    }

    #[test]
    fn tar_streams_the_tree() {
        if !git_available() {
            return;
        }
        let repo = TempDir::new().unwrap();
        init_repo(repo.path());
        let cache = TempDir::new().unwrap();

        let src = GitSource::new(
            SourceSpec::with_url(repo.path().to_string_lossy()),
            cache.path(),
        );
        let mut archive = tar::Archive::new(src.tar().unwrap());
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert!(names.contains(&"hello.txt".to_string()), "names: {names:?}");
    }

    #[test]
    fn refetch_reuses_the_mirror() {
        if !git_available() {
            return;
        }
        let repo = TempDir::new().unwrap();
        init_repo(repo.path());
        let cache = TempDir::new().unwrap();
        let url = repo.path().to_string_lossy().into_owned();

        let first = GitSource::new(SourceSpec::with_url(&url), cache.path());
        let key1 = first.cachekey().unwrap();

        let second = GitSource::new(SourceSpec::with_url(&url), cache.path());
        let key2 = second.cachekey().unwrap();

        assert_eq!(key1, key2);
        assert_eq!(first.mirror, second.mirror);
    }
}
