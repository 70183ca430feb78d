//! Typed client for the container engine HTTP API
//!
//! Covers exactly the surface the cook pipeline needs: image
//! inspection, image builds, the container lifecycle, the filesystem
//! diff, and per-path archive export.

use crate::config::EngineConfig;
use crate::docker::buildlog::BuildLogParser;
use crate::docker::transport::{RequestBody, Transport};
use crate::error::{KilnError, KilnResult};
use serde::Deserialize;
use std::fs::File;
use std::io::Write;
use tracing::{debug, info};

/// One entry of a container filesystem diff
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffEntry {
    pub path: String,
    pub kind: DiffKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffKind {
    Modified,
    Added,
    Deleted,
}

impl DiffKind {
    fn from_wire(kind: u8) -> KilnResult<Self> {
        match kind {
            0 => Ok(Self::Modified),
            1 => Ok(Self::Added),
            2 => Ok(Self::Deleted),
            other => Err(KilnError::InvalidResponse(format!(
                "unknown diff kind {other}"
            ))),
        }
    }
}

#[derive(Deserialize)]
struct ImageInspect {
    #[serde(rename = "Id")]
    id: String,
}

#[derive(Deserialize)]
struct CreateResponse {
    #[serde(rename = "Id")]
    id: String,
}

#[derive(Deserialize)]
struct WaitResponse {
    #[serde(rename = "StatusCode")]
    status_code: i64,
}

#[derive(Deserialize)]
struct ChangeEntry {
    #[serde(rename = "Path")]
    path: String,
    #[serde(rename = "Kind")]
    kind: u8,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

pub struct Docker {
    transport: Transport,
}

impl Docker {
    pub fn new(config: EngineConfig) -> KilnResult<Self> {
        Ok(Self {
            transport: Transport::new(config)?,
        })
    }

    fn engine_error(status: u16, body: &str) -> KilnError {
        let message = serde_json::from_str::<ErrorBody>(body)
            .map(|e| e.message)
            .unwrap_or_else(|_| body.trim().to_string());
        KilnError::EngineStatus { status, message }
    }

    /// Resolve an image reference to its id
    pub async fn image_id(&self, name: &str) -> KilnResult<String> {
        let response = self
            .transport
            .request("GET", &format!("/images/{}/json", urlencode(name)), RequestBody::Empty)
            .await?;
        let status = response.status;
        let body = response.body_string().await?;
        if status != 200 {
            return Err(Self::engine_error(status, &body));
        }
        let inspect: ImageInspect = serde_json::from_str(&body)?;
        Ok(inspect.id)
    }

    /// 200/404 probe: does an image with this tag exist?
    pub async fn image_exists(&self, tag: &str) -> KilnResult<bool> {
        let response = self
            .transport
            .request("GET", &format!("/images/{}/json", urlencode(tag)), RequestBody::Empty)
            .await?;
        let status = response.status;
        let body = response.body_string().await?;
        match status {
            200 => Ok(true),
            404 => Ok(false),
            _ => Err(Self::engine_error(status, &body)),
        }
    }

    /// Build an image from a spooled context tar, streaming the build
    /// log through the parser; returns the resulting image id.
    pub async fn build(
        &self,
        context: &mut File,
        dockerfile: &str,
        tag: Option<&str>,
        log_sink: &mut dyn Write,
    ) -> KilnResult<String> {
        let mut path = format!("/build?rm=1&dockerfile={}", urlencode(dockerfile));
        if let Some(tag) = tag {
            path.push_str(&format!("&t={}", urlencode(tag)));
        }

        let response = self
            .transport
            .request("POST", &path, RequestBody::TarFile(context))
            .await?;
        if response.status != 200 {
            let status = response.status;
            let body = response.body_string().await?;
            return Err(Self::engine_error(status, &body));
        }

        let mut parser = BuildLogParser::new(log_sink);
        response.stream_body(|chunk| parser.feed(chunk)).await?;
        let image = parser.finish()?;
        info!("built image {image}");
        Ok(image)
    }

    /// Create a container from an image; returns its id
    pub async fn create_container(&self, image: &str) -> KilnResult<String> {
        let body = serde_json::json!({ "Image": image }).to_string();
        let response = self
            .transport
            .request("POST", "/containers/create", RequestBody::Json(body))
            .await?;
        let status = response.status;
        let text = response.body_string().await?;
        if status != 201 {
            return Err(Self::engine_error(status, &text));
        }
        let created: CreateResponse = serde_json::from_str(&text)?;
        debug!("created container {}", created.id);
        Ok(created.id)
    }

    pub async fn start(&self, container: &str) -> KilnResult<()> {
        let response = self
            .transport
            .request(
                "POST",
                &format!("/containers/{container}/start"),
                RequestBody::Empty,
            )
            .await?;
        let status = response.status;
        match status {
            204 | 304 => Ok(()),
            404 => Err(KilnError::ContainerNotFound(container.to_string())),
            _ => {
                let body = response.body_string().await?;
                Err(Self::engine_error(status, &body))
            }
        }
    }

    /// Attach to the container's combined output stream, demuxing it
    /// into the two sinks until the container closes it
    pub async fn attach(
        &self,
        container: &str,
        stdout: &mut dyn Write,
        stderr: &mut dyn Write,
    ) -> KilnResult<()> {
        let response = self
            .transport
            .request(
                "POST",
                &format!("/containers/{container}/attach?stream=1&stdout=1&stderr=1"),
                RequestBody::Empty,
            )
            .await?;
        match response.status {
            200 => response.demux_into(stdout, stderr).await,
            404 => Err(KilnError::ContainerNotFound(container.to_string())),
            status => {
                let body = response.body_string().await?;
                Err(Self::engine_error(status, &body))
            }
        }
    }

    /// Block until the container exits; returns its exit code
    pub async fn wait(&self, container: &str) -> KilnResult<i64> {
        let response = self
            .transport
            .request(
                "POST",
                &format!("/containers/{container}/wait"),
                RequestBody::Empty,
            )
            .await?;
        let status = response.status;
        let body = response.body_string().await?;
        match status {
            200 => {
                let wait: WaitResponse = serde_json::from_str(&body)?;
                Ok(wait.status_code)
            }
            404 => Err(KilnError::ContainerNotFound(container.to_string())),
            _ => Err(Self::engine_error(status, &body)),
        }
    }

    /// Delete a container and its volumes
    pub async fn delete(&self, container: &str) -> KilnResult<()> {
        let response = self
            .transport
            .request(
                "DELETE",
                &format!("/containers/{container}?v=1"),
                RequestBody::Empty,
            )
            .await?;
        let status = response.status;
        match status {
            200 | 204 => Ok(()),
            404 => Err(KilnError::ContainerNotFound(container.to_string())),
            _ => {
                let body = response.body_string().await?;
                Err(Self::engine_error(status, &body))
            }
        }
    }

    /// The container's filesystem diff against its image
    pub async fn changes(&self, container: &str) -> KilnResult<Vec<DiffEntry>> {
        let response = self
            .transport
            .request(
                "GET",
                &format!("/containers/{container}/changes"),
                RequestBody::Empty,
            )
            .await?;
        let status = response.status;
        let body = response.body_string().await?;
        match status {
            200 => {
                // the engine reports `null` for an empty diff
                let entries: Option<Vec<ChangeEntry>> = serde_json::from_str(&body)?;
                entries
                    .unwrap_or_default()
                    .into_iter()
                    .map(|e| {
                        Ok(DiffEntry {
                            path: e.path,
                            kind: DiffKind::from_wire(e.kind)?,
                        })
                    })
                    .collect()
            }
            404 => Err(KilnError::ContainerNotFound(container.to_string())),
            _ => Err(Self::engine_error(status, &body)),
        }
    }

    /// Export one in-container path as a tar, spooled to a temp file
    pub async fn archive(&self, container: &str, path: &str) -> KilnResult<File> {
        let response = self
            .transport
            .request(
                "GET",
                &format!(
                    "/containers/{container}/archive?path={}",
                    urlencode(path)
                ),
                RequestBody::Empty,
            )
            .await?;
        match response.status {
            200 => response.body_to_file().await,
            404 => Err(KilnError::FileNotFound(path.to_string())),
            status => {
                let body = response.body_string().await?;
                Err(Self::engine_error(status, &body))
            }
        }
    }
}

/// Percent-encode a query value or path segment, leaving unreserved
/// characters and `/` intact
fn urlencode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' | b'/' | b':' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
