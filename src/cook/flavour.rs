//! Distribution and flavour detection
//!
//! The target image decides the package ecosystem. Detection probes
//! well-known release files through the archive endpoint of a
//! throwaway container; a missing file means "try the next path", any
//! other engine failure is fatal. The flavour drives the installer
//! command, the index refresh command, and the default output format.

use crate::cook::UpdateMode;
use crate::docker::Docker;
use crate::error::{KilnError, KilnResult};
use chrono::{TimeZone, Utc};
use std::io::Read;
use tracing::{debug, warn};

/// Package-ecosystem family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavour {
    Debian,
    Redhat,
}

impl Flavour {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debian => "debian",
            Self::Redhat => "redhat",
        }
    }

    /// Map a distribution name onto its flavour
    pub fn from_distribution(name: &str) -> KilnResult<Self> {
        match name {
            "debian" | "ubuntu" | "mint" | "raspbian" => Ok(Self::Debian),
            "centos" | "fedora" | "redhat" | "rhel" | "rocky" | "almalinux" | "amazon"
            | "oracle" => Ok(Self::Redhat),
            other => Err(KilnError::UnknownFlavour(other.to_string())),
        }
    }

    /// Default output package format
    pub fn package_format(&self) -> &'static str {
        match self {
            Self::Debian => "deb",
            Self::Redhat => "rpm",
        }
    }

    /// Shell command installing the given packages
    pub fn install_command(&self, packages: &[String]) -> String {
        let list = packages.join(" ");
        match self {
            Self::Debian => {
                format!("apt-get install --yes --no-install-recommends {list}")
            }
            Self::Redhat => format!("yum install -y {list}"),
        }
    }

    /// Shell command forcing a full package index refresh
    pub fn index_refresh_command(&self) -> &'static str {
        match self {
            Self::Debian => "apt-get update",
            Self::Redhat => "yum makecache",
        }
    }
}

/// A detected or declared target distribution
#[derive(Debug, Clone)]
pub struct Distribution {
    pub name: String,
    pub version: String,
    pub codename: String,
    pub flavour: Flavour,
}

impl Distribution {
    fn new(name: String, version: String, codename: String) -> KilnResult<Self> {
        let flavour = Flavour::from_distribution(&name)?;
        Ok(Self {
            name,
            version,
            codename,
            flavour,
        })
    }

    /// Parse a `--distribution` override (`ubuntu-24.04` or `ubuntu`)
    pub fn parse_override(raw: &str) -> KilnResult<Self> {
        let (name, version) = match raw.split_once('-') {
            Some((name, version)) => (name.to_string(), version.to_string()),
            None => (raw.to_string(), String::new()),
        };
        Self::new(name, version, String::new())
    }
}

/// Probed paths, most informative first
const PROBE_PATHS: &[&str] = &[
    "/etc/os-release",
    "/usr/lib/os-release",
    "/etc/lsb-release",
    "/etc/redhat-release",
    "/etc/debian_version",
];

/// Detect the distribution of an image by inspecting its release
/// files
pub async fn detect(docker: &Docker, image: &str) -> KilnResult<Distribution> {
    let container = docker.create_container(image).await?;
    let result = probe(docker, &container).await;
    if let Err(e) = docker.delete(&container).await {
        warn!("failed to delete probe container {container}: {e}");
    }
    result?.ok_or_else(|| KilnError::DistributionUndetected(image.to_string()))
}

async fn probe(docker: &Docker, container: &str) -> KilnResult<Option<Distribution>> {
    for path in PROBE_PATHS {
        let text = match docker.archive(container, path).await {
            Ok(file) => read_single_file(file)?,
            Err(KilnError::FileNotFound(_)) | Err(KilnError::ContainerNotFound(_)) => continue,
            Err(e) => return Err(e),
        };
        debug!("probing {path}");
        if let Some(dist) = parse_release_file(path, &text)? {
            debug!(
                "detected {} {} ({})",
                dist.name,
                dist.version,
                dist.flavour.as_str()
            );
            return Ok(Some(dist));
        }
    }
    Ok(None)
}

/// Contents of the first regular file in an archive-endpoint tar
fn read_single_file(file: std::fs::File) -> KilnResult<String> {
    let mut archive = tar::Archive::new(file);
    for entry in archive
        .entries()
        .map_err(|e| KilnError::io("reading archive response", e))?
    {
        let mut entry = entry.map_err(|e| KilnError::io("reading archive response", e))?;
        if entry.header().entry_type().is_file() {
            let mut text = String::new();
            entry
                .read_to_string(&mut text)
                .map_err(|e| KilnError::io("reading archive response", e))?;
            return Ok(text);
        }
    }
    Ok(String::new())
}

fn parse_release_file(path: &str, text: &str) -> KilnResult<Option<Distribution>> {
    let parsed = match path {
        "/etc/os-release" | "/usr/lib/os-release" => parse_os_release(text),
        "/etc/lsb-release" => parse_lsb_release(text),
        "/etc/redhat-release" => parse_redhat_release(text),
        "/etc/debian_version" => parse_debian_version(text),
        _ => None,
    };
    match parsed {
        Some((name, version, codename)) => Distribution::new(name, version, codename).map(Some),
        None => Ok(None),
    }
}

fn unquote(value: &str) -> String {
    value.trim().trim_matches('"').to_string()
}

fn parse_os_release(text: &str) -> Option<(String, String, String)> {
    let mut name = None;
    let mut version = String::new();
    let mut codename = String::new();
    for line in text.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key.trim() {
            "ID" => name = Some(unquote(value).to_lowercase()),
            "VERSION_ID" => version = unquote(value),
            "VERSION_CODENAME" => codename = unquote(value),
            _ => {}
        }
    }
    name.map(|n| (n, version, codename))
}

fn parse_lsb_release(text: &str) -> Option<(String, String, String)> {
    let mut name = None;
    let mut version = String::new();
    let mut codename = String::new();
    for line in text.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key.trim() {
            "DISTRIB_ID" => name = Some(unquote(value).to_lowercase()),
            "DISTRIB_RELEASE" => version = unquote(value),
            "DISTRIB_CODENAME" => codename = unquote(value),
            _ => {}
        }
    }
    name.map(|n| (n, version, codename))
}

/// e.g. `CentOS Linux release 7.9.2009 (Core)`
fn parse_redhat_release(text: &str) -> Option<(String, String, String)> {
    let line = text.lines().next()?.trim();
    if line.is_empty() {
        return None;
    }
    let name = line.split_whitespace().next()?.to_lowercase();
    let version = line
        .split_whitespace()
        .find(|token| token.chars().next().is_some_and(|c| c.is_ascii_digit()))
        .unwrap_or("")
        .to_string();
    Some((name, version, String::new()))
}

fn parse_debian_version(text: &str) -> Option<(String, String, String)> {
    let version = text.trim();
    if version.is_empty() {
        return None;
    }
    Some(("debian".to_string(), version.to_string(), String::new()))
}

/// Age beyond which a package index counts as stale
const INDEX_MAX_AGE_HOURS: i64 = 24;

/// Decide whether the dependency-install step needs a preceding index
/// refresh
pub async fn index_refresh_needed(
    docker: &Docker,
    base_image: &str,
    flavour: Flavour,
    mode: UpdateMode,
) -> KilnResult<bool> {
    match mode {
        UpdateMode::Always => Ok(true),
        UpdateMode::Never => Ok(false),
        UpdateMode::Auto => match flavour {
            // yum validates its own metadata expiry
            Flavour::Redhat => Ok(false),
            Flavour::Debian => apt_index_stale(docker, base_image).await,
        },
    }
}

/// Probe `/var/lib/apt/lists` in the base image for staleness
async fn apt_index_stale(docker: &Docker, base_image: &str) -> KilnResult<bool> {
    let container = docker.create_container(base_image).await?;
    let result = apt_lists_stale(docker, &container).await;
    if let Err(e) = docker.delete(&container).await {
        warn!("failed to delete probe container {container}: {e}");
    }
    result
}

async fn apt_lists_stale(docker: &Docker, container: &str) -> KilnResult<bool> {
    let file = match docker.archive(container, "/var/lib/apt/lists").await {
        Ok(file) => file,
        Err(KilnError::FileNotFound(_)) => return Ok(true),
        Err(e) => return Err(e),
    };

    let mut archive = tar::Archive::new(file);
    let mut files = 0usize;
    let mut newest = 0u64;
    for entry in archive
        .entries()
        .map_err(|e| KilnError::io("reading archive response", e))?
    {
        let entry = entry.map_err(|e| KilnError::io("reading archive response", e))?;
        let header = entry.header();
        if header.entry_type().is_file() {
            files += 1;
        }
        if let Ok(mtime) = header.mtime() {
            newest = newest.max(mtime);
        }
    }

    // an unpopulated lists directory means `apt-get update` never ran
    if files < 2 {
        debug!("apt lists unpopulated ({files} files): refresh needed");
        return Ok(true);
    }
    let newest = Utc.timestamp_opt(newest as i64, 0).single();
    let stale = match newest {
        Some(ts) => Utc::now() - ts > chrono::Duration::hours(INDEX_MAX_AGE_HOURS),
        None => true,
    };
    if stale {
        debug!("apt lists older than {INDEX_MAX_AGE_HOURS}h: refresh needed");
    }
    Ok(stale)
}
