//! Attach stream demultiplexer
//!
//! The engine multiplexes a container's stdout and stderr onto one
//! ordered byte stream: a 1-byte stream tag (1=stdout, 2=stderr), a
//! 4-byte big-endian payload length, then the payload. The decoder is
//! push-based and incremental, so payload bytes reach the sinks as
//! they arrive and memory use stays bounded regardless of output size.
//! The same decoder serves both the raw stream and the variant wrapped
//! in HTTP chunked transfer encoding.

use crate::error::{KilnError, KilnResult};
use std::io::Write;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt};

const READ_CHUNK: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamKind {
    Stdout,
    Stderr,
}

enum State {
    Header { have: usize, bytes: [u8; 5] },
    Payload { kind: StreamKind, remaining: u32 },
}

/// Incremental frame decoder
pub struct FrameDecoder {
    state: State,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            state: State::Header {
                have: 0,
                bytes: [0; 5],
            },
        }
    }

    /// Feed raw stream bytes, writing payload through to the sinks
    pub fn feed(
        &mut self,
        mut data: &[u8],
        stdout: &mut dyn Write,
        stderr: &mut dyn Write,
    ) -> KilnResult<()> {
        while !data.is_empty() {
            match &mut self.state {
                State::Header { have, bytes } => {
                    if *have == 0 {
                        match data[0] {
                            1 | 2 => {}
                            other => return Err(KilnError::UnknownStreamType(other)),
                        }
                    }
                    let take = (5 - *have).min(data.len());
                    bytes[*have..*have + take].copy_from_slice(&data[..take]);
                    *have += take;
                    data = &data[take..];

                    if *have == 5 {
                        let kind = if bytes[0] == 1 {
                            StreamKind::Stdout
                        } else {
                            StreamKind::Stderr
                        };
                        let len = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
                        self.state = if len == 0 {
                            State::Header {
                                have: 0,
                                bytes: [0; 5],
                            }
                        } else {
                            State::Payload {
                                kind,
                                remaining: len,
                            }
                        };
                    }
                }
                State::Payload { kind, remaining } => {
                    let take = (*remaining as usize).min(data.len());
                    let sink: &mut dyn Write = match kind {
                        StreamKind::Stdout => stdout,
                        StreamKind::Stderr => stderr,
                    };
                    sink.write_all(&data[..take])
                        .map_err(|e| KilnError::io("writing demuxed output", e))?;
                    *remaining -= take as u32;
                    data = &data[take..];

                    if *remaining == 0 {
                        self.state = State::Header {
                            have: 0,
                            bytes: [0; 5],
                        };
                    }
                }
            }
        }
        Ok(())
    }

    /// End-of-stream check: anywhere but a frame boundary is a short
    /// read
    pub fn finish(&self) -> KilnResult<()> {
        match self.state {
            State::Header { have: 0, .. } => Ok(()),
            _ => Err(KilnError::ShortRead),
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Demux a raw attach stream until end of stream
pub async fn demux<R>(
    reader: &mut R,
    stdout: &mut dyn Write,
    stderr: &mut dyn Write,
) -> KilnResult<()>
where
    R: AsyncRead + Unpin,
{
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; READ_CHUNK];
    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| KilnError::io("reading attach stream", e))?;
        if n == 0 {
            break;
        }
        decoder.feed(&buf[..n], stdout, stderr)?;
    }
    decoder.finish()
}

/// Demux an attach stream wrapped in HTTP chunked transfer encoding
///
/// Outer loop: hex chunk-size line, exactly that many bytes into the
/// frame decoder, trailing CRLF, until the zero-size chunk.
pub async fn demux_chunked<R>(
    reader: &mut R,
    stdout: &mut dyn Write,
    stderr: &mut dyn Write,
) -> KilnResult<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; READ_CHUNK];
    loop {
        let size = read_chunk_size(reader).await?;
        if size == 0 {
            break;
        }
        let mut remaining = size;
        while remaining > 0 {
            let want = remaining.min(READ_CHUNK);
            let n = reader
                .read(&mut buf[..want])
                .await
                .map_err(|e| KilnError::io("reading attach stream", e))?;
            if n == 0 {
                return Err(KilnError::ShortRead);
            }
            decoder.feed(&buf[..n], stdout, stderr)?;
            remaining -= n;
        }
        consume_chunk_crlf(reader).await?;
    }
    decoder.finish()
}

/// Read one hex chunk-size line of a chunked body
pub(crate) async fn read_chunk_size<R>(reader: &mut R) -> KilnResult<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    reader
        .read_line(&mut line)
        .await
        .map_err(|e| KilnError::io("reading chunk size", e))?;
    if line.is_empty() {
        // EOF before the terminal chunk
        return Err(KilnError::ShortRead);
    }
    let trimmed = line.trim_end_matches(['\r', '\n']);
    // chunk extensions after ';' are allowed and ignored
    let hex_part = trimmed.split(';').next().unwrap_or("").trim();
    usize::from_str_radix(hex_part, 16)
        .map_err(|_| KilnError::InvalidChunkSize(trimmed.to_string()))
}

/// Consume the CRLF terminating a chunk's data
pub(crate) async fn consume_chunk_crlf<R>(reader: &mut R) -> KilnResult<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut crlf = [0u8; 2];
    reader
        .read_exact(&mut crlf)
        .await
        .map_err(|_| KilnError::ShortRead)?;
    if &crlf != b"\r\n" {
        return Err(KilnError::InvalidChunkSize(
            String::from_utf8_lossy(&crlf).into_owned(),
        ));
    }
    Ok(())
}
