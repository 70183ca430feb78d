//! Remote archive source backend
//!
//! Fetches an archive over HTTP with bounded redirect following,
//! streams the body through the configured checksum algorithm into the
//! cache directory, and exposes the contents as a tar stream. The
//! unpacking strategy is dispatched on the url's file extension.

use crate::error::{KilnError, KilnResult};
use crate::source::{tarstream, SourceCache, SourceSpec};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const SUPPORTED: &str = ".tar, .tar.gz, .tgz, .tar.bz2, .zip, .bin, .bundle";
const REDIRECT_LIMIT: usize = 3;

/// Score this backend's claim on a url
pub fn guess(url: &str) -> Option<u8> {
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return None;
    }
    if ArchiveKind::from_url(url).is_some() {
        Some(8)
    } else {
        Some(2)
    }
}

/// Construct the archive cache for a spec
pub fn build(spec: &SourceSpec, cache_dir: &Path) -> KilnResult<Box<dyn SourceCache>> {
    Ok(Box::new(ArchiveSource::new(spec.clone(), cache_dir)?))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveKind {
    Tar,
    TarGz,
    TarBz2,
    Zip,
    /// Single raw file wrapped in a synthetic tar (.bin / .bundle)
    Single,
}

impl ArchiveKind {
    fn from_url(url: &str) -> Option<Self> {
        let path = url.split(['?', '#']).next().unwrap_or(url);
        let lower = path.to_ascii_lowercase();
        if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Some(Self::TarGz)
        } else if lower.ends_with(".tar.bz2") {
            Some(Self::TarBz2)
        } else if lower.ends_with(".tar") {
            Some(Self::Tar)
        } else if lower.ends_with(".zip") {
            Some(Self::Zip)
        } else if lower.ends_with(".bin") || lower.ends_with(".bundle") {
            Some(Self::Single)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum ChecksumAlgo {
    Sha256,
    Sha1,
}

/// Pick the algorithm by declared checksum length (64 → SHA-256,
/// 40 → SHA-1); absent means opportunistic SHA-256 for the cachekey.
fn algo_for(url: &str, checksum: Option<&str>) -> KilnResult<ChecksumAlgo> {
    match checksum {
        None => Ok(ChecksumAlgo::Sha256),
        Some(c) if c.len() == 64 => Ok(ChecksumAlgo::Sha256),
        Some(c) if c.len() == 40 => Ok(ChecksumAlgo::Sha1),
        Some(c) => Err(KilnError::FetchFailed {
            url: url.to_string(),
            reason: format!(
                "checksum must be 40 (SHA-1) or 64 (SHA-256) hex characters, got {}",
                c.len()
            ),
        }),
    }
}

enum Hasher {
    Sha256(Sha256),
    Sha1(Sha1),
}

impl Hasher {
    fn new(algo: ChecksumAlgo) -> Self {
        match algo {
            ChecksumAlgo::Sha256 => Self::Sha256(Sha256::new()),
            ChecksumAlgo::Sha1 => Self::Sha1(Sha1::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(data),
            Self::Sha1(h) => h.update(data),
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            Self::Sha256(h) => hex::encode(h.finalize()),
            Self::Sha1(h) => hex::encode(h.finalize()),
        }
    }
}

fn hash_file(path: &Path, algo: ChecksumAlgo) -> KilnResult<String> {
    let mut file =
        File::open(path).map_err(|e| KilnError::io(format!("opening {}", path.display()), e))?;
    let mut hasher = Hasher::new(algo);
    let mut buf = [0u8; 8192];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| KilnError::io(format!("hashing {}", path.display()), e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize_hex())
}

pub(crate) struct ArchiveSource {
    spec: SourceSpec,
    kind: ArchiveKind,
    algo: ChecksumAlgo,
    /// Cache slot for this url: `<cache>/archive/<url-digest>`
    dir: PathBuf,
    /// Downloaded archive inside the slot
    file: PathBuf,
}

impl ArchiveSource {
    pub(crate) fn new(spec: SourceSpec, cache_dir: &Path) -> KilnResult<Self> {
        let kind = ArchiveKind::from_url(&spec.url).ok_or_else(|| KilnError::UnknownArchiveType {
            url: spec.url.clone(),
            supported: SUPPORTED.to_string(),
        })?;
        let algo = algo_for(&spec.url, spec.checksum.as_deref())?;

        let url_digest = hex::encode(&Sha256::digest(spec.url.as_bytes())[..8]);
        let filename = spec
            .url
            .split(['?', '#'])
            .next()
            .unwrap_or(&spec.url)
            .rsplit('/')
            .next()
            .filter(|n| !n.is_empty())
            .unwrap_or("source")
            .to_string();
        let dir = cache_dir.join("archive").join(url_digest);
        let file = dir.join(&filename);

        Ok(Self {
            spec,
            kind,
            algo,
            dir,
            file,
        })
    }

    /// Whether the on-disk file already validates against the declared
    /// checksum
    fn cached_file_valid(&self) -> KilnResult<bool> {
        let Some(expected) = &self.spec.checksum else {
            return Ok(false);
        };
        if !self.file.exists() {
            return Ok(false);
        }
        Ok(&hash_file(&self.file, self.algo)? == expected)
    }

    fn ensure_fetched(&self) -> KilnResult<()> {
        if self.cached_file_valid()? {
            debug!("cache hit for {}", self.spec.url);
            return Ok(());
        }

        fs::create_dir_all(&self.dir)
            .map_err(|e| KilnError::io(format!("creating {}", self.dir.display()), e))?;

        info!("Fetching {}", self.spec.url);
        let observed = self.fetch_into(&self.file)?;

        if let Some(expected) = &self.spec.checksum {
            if &observed != expected {
                let _ = fs::remove_file(&self.file);
                return Err(KilnError::ChecksumMismatch {
                    url: self.spec.url.clone(),
                    expected: expected.clone(),
                    given: observed,
                });
            }
            debug!("checksum verified: {expected}");
        }
        Ok(())
    }

    /// Fetch the url (following at most [`REDIRECT_LIMIT`] redirects),
    /// streaming the body through the hasher into `dest`. Returns the
    /// observed digest.
    fn fetch_into(&self, dest: &Path) -> KilnResult<String> {
        let agent = fetch_agent();
        let mut url = self.spec.url.clone();
        let mut hops = 0usize;

        let response = loop {
            let res = agent
                .get(&url)
                .call()
                .map_err(|e| KilnError::FetchFailed {
                    url: self.spec.url.clone(),
                    reason: e.to_string(),
                })?;
            let status = res.status().as_u16();

            if matches!(status, 301 | 302 | 303 | 307 | 308) {
                hops += 1;
                if hops > REDIRECT_LIMIT {
                    return Err(KilnError::TooManyRedirects {
                        url: self.spec.url.clone(),
                    });
                }
                let location = res
                    .headers()
                    .get("location")
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| KilnError::FetchFailed {
                        url: self.spec.url.clone(),
                        reason: format!("redirect ({status}) without location header"),
                    })?;
                url = resolve_location(&url, location)?;
                debug!("redirect {hops} -> {url}");
                continue;
            }

            if status != 200 {
                return Err(KilnError::FetchFailed {
                    url: self.spec.url.clone(),
                    reason: format!("HTTP status {status}"),
                });
            }
            break res;
        };

        let part = dest.with_extension("part");
        let mut out = File::create(&part)
            .map_err(|e| KilnError::io(format!("creating {}", part.display()), e))?;
        let mut hasher = Hasher::new(self.algo);
        let mut reader = response.into_body().into_reader();
        let mut buf = [0u8; 8192];
        loop {
            let n = reader.read(&mut buf).map_err(|e| KilnError::FetchFailed {
                url: self.spec.url.clone(),
                reason: e.to_string(),
            })?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            out.write_all(&buf[..n])
                .map_err(|e| KilnError::io(format!("writing {}", part.display()), e))?;
        }
        drop(out);
        fs::rename(&part, dest)
            .map_err(|e| KilnError::io(format!("renaming {}", part.display()), e))?;
        Ok(hasher.finalize_hex())
    }

    /// Unzip into a cachekey-named directory and re-tar; the tar file
    /// is reused on subsequent calls.
    fn zip_tar_path(&self) -> KilnResult<PathBuf> {
        let key = self.cachekey()?;
        let unpack_dir = self.dir.join(format!("unpacked-{}", &key[..16.min(key.len())]));
        let tar_path = unpack_dir.with_extension("tar");
        if tar_path.exists() {
            return Ok(tar_path);
        }

        if unpack_dir.exists() {
            fs::remove_dir_all(&unpack_dir)
                .map_err(|e| KilnError::io(format!("clearing {}", unpack_dir.display()), e))?;
        }
        let file = File::open(&self.file)
            .map_err(|e| KilnError::io(format!("opening {}", self.file.display()), e))?;
        let mut zip = zip::ZipArchive::new(file).map_err(|e| KilnError::FetchFailed {
            url: self.spec.url.clone(),
            reason: format!("reading zip: {e}"),
        })?;
        zip.extract(&unpack_dir).map_err(|e| KilnError::FetchFailed {
            url: self.spec.url.clone(),
            reason: format!("extracting zip: {e}"),
        })?;

        let part = tar_path.with_extension("tar.part");
        let out = File::create(&part)
            .map_err(|e| KilnError::io(format!("creating {}", part.display()), e))?;
        tarstream::write_dir_tar(&unpack_dir, out, false)?;
        fs::rename(&part, &tar_path)
            .map_err(|e| KilnError::io(format!("renaming {}", part.display()), e))?;
        Ok(tar_path)
    }

    /// Wrap the single downloaded file in a synthetic tar
    fn single_tar(&self) -> KilnResult<Box<dyn Read + Send>> {
        let data = fs::read(&self.file)
            .map_err(|e| KilnError::io(format!("reading {}", self.file.display()), e))?;
        let name = self
            .file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "source".to_string());
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o755);
        header.set_mtime(0);
        header.set_cksum();
        builder
            .append_data(&mut header, &name, data.as_slice())
            .map_err(|e| KilnError::io(format!("wrapping {name}"), e))?;
        let bytes = builder
            .into_inner()
            .map_err(|e| KilnError::io("finishing synthetic tar", e))?;
        Ok(Box::new(std::io::Cursor::new(bytes)))
    }

    fn open_archive(&self) -> KilnResult<Box<dyn Read + Send>> {
        let file = File::open(&self.file)
            .map_err(|e| KilnError::io(format!("opening {}", self.file.display()), e))?;
        Ok(match self.kind {
            ArchiveKind::Tar => Box::new(file),
            ArchiveKind::TarGz => Box::new(flate2::read::GzDecoder::new(file)),
            ArchiveKind::TarBz2 => Box::new(bzip2::read::BzDecoder::new(file)),
            ArchiveKind::Zip | ArchiveKind::Single => unreachable!("dispatched in tar()"),
        })
    }

    fn member_names(&self) -> KilnResult<Vec<String>> {
        match self.kind {
            ArchiveKind::Tar | ArchiveKind::TarGz | ArchiveKind::TarBz2 => {
                let mut archive = tar::Archive::new(self.open_archive()?);
                let mut names = Vec::new();
                for entry in archive
                    .entries()
                    .map_err(|e| KilnError::io("listing archive", e))?
                {
                    let entry = entry.map_err(|e| KilnError::io("listing archive", e))?;
                    names.push(
                        entry
                            .path()
                            .map_err(|e| KilnError::io("listing archive", e))?
                            .to_string_lossy()
                            .into_owned(),
                    );
                }
                Ok(names)
            }
            ArchiveKind::Zip => {
                let file = File::open(&self.file)
                    .map_err(|e| KilnError::io(format!("opening {}", self.file.display()), e))?;
                let zip = zip::ZipArchive::new(file).map_err(|e| KilnError::FetchFailed {
                    url: self.spec.url.clone(),
                    reason: format!("reading zip: {e}"),
                })?;
                Ok(zip.file_names().map(str::to_string).collect())
            }
            ArchiveKind::Single => Ok(Vec::new()),
        }
    }
}

impl SourceCache for ArchiveSource {
    fn cachekey(&self) -> KilnResult<String> {
        // a declared checksum is the key; nothing to fetch for it
        if let Some(checksum) = &self.spec.checksum {
            return Ok(checksum.clone());
        }
        self.ensure_fetched()?;
        hash_file(&self.file, self.algo)
    }

    fn tar(&self) -> KilnResult<Box<dyn Read + Send>> {
        self.ensure_fetched()?;
        match self.kind {
            ArchiveKind::Zip => {
                let tar_path = self.zip_tar_path()?;
                let file = File::open(&tar_path)
                    .map_err(|e| KilnError::io(format!("opening {}", tar_path.display()), e))?;
                Ok(Box::new(file))
            }
            ArchiveKind::Single => self.single_tar(),
            _ => self.open_archive(),
        }
    }

    fn prefix(&self) -> KilnResult<Option<String>> {
        self.ensure_fetched()?;
        Ok(tarstream::common_prefix(self.member_names()?))
    }
}

fn fetch_agent() -> ureq::Agent {
    // redirects are followed manually so the hop limit and Location
    // resolution stay under our control
    ureq::Agent::config_builder()
        .max_redirects(0)
        .http_status_as_error(false)
        .build()
        .into()
}

/// Resolve a Location header against the url it was served for
fn resolve_location(base: &str, location: &str) -> KilnResult<String> {
    if location.starts_with("http://") || location.starts_with("https://") {
        return Ok(location.to_string());
    }
    if let Some(rest) = location.strip_prefix('/') {
        let scheme_end = base.find("://").map(|i| i + 3).unwrap_or(0);
        let origin_end = base[scheme_end..]
            .find('/')
            .map(|i| scheme_end + i)
            .unwrap_or(base.len());
        return Ok(format!("{}/{}", &base[..origin_end], rest));
    }
    Err(KilnError::FetchFailed {
        url: base.to_string(),
        reason: format!("unsupported redirect location: {location}"),
    })
}
