//! Render driver client.
//!
//! Pages are rendered by a browser automation sidecar. Each session holds
//! one blocking TCP connection to it and speaks the same framing as the
//! subscriber protocol: a little-endian `u32` length followed by a
//! bincode body.
//!
//! ```text
//!   server                          driver
//!     │── Open { viewport } ─────────►│
//!     │◄──────────────────────── Ok ──│
//!     │── Capture ───────────────────►│
//!     │◄──────────── Frame { .. } ────│
//!     │── Close ─────────────────────►│
//! ```
//!
//! All calls block; the core only invokes them from its worker pool.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use vista_core::codec::{LENGTH_PREFIX, MAX_FRAME_SIZE};
use vista_core::{PixelFormat, RawFrame, RenderHandle, RenderLauncher, StreamError, Viewport};

/// Requests sent to the driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DriverRequest {
    Open { viewport: Viewport },
    Navigate { url: String },
    Capture,
    Click { x: u32, y: u32 },
    Scroll { dx: i32, dy: i32 },
    Text { value: String },
    Close,
}

/// Driver answers, one per request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DriverReply {
    Ok,
    Frame {
        width: u32,
        height: u32,
        stride: u32,
        format: PixelFormat,
        data: Vec<u8>,
    },
    Error {
        message: String,
    },
}

// ── Framing ──────────────────────────────────────────────────────

/// Write one length-prefixed bincode message.
pub fn write_message<T: Serialize>(writer: &mut impl Write, message: &T) -> Result<(), StreamError> {
    let body = bincode::serialize(message)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(StreamError::Encoding(format!(
            "frame too large: {} bytes (max {MAX_FRAME_SIZE})",
            body.len()
        )));
    }
    writer.write_all(&(body.len() as u32).to_le_bytes())?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}

/// Read one length-prefixed bincode message.
pub fn read_message<T: DeserializeOwned>(reader: &mut impl Read) -> Result<T, StreamError> {
    let mut prefix = [0u8; LENGTH_PREFIX];
    reader.read_exact(&mut prefix)?;
    let len = u32::from_le_bytes(prefix) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(StreamError::Encoding(format!(
            "frame too large: {len} bytes (max {MAX_FRAME_SIZE})"
        )));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok(bincode::deserialize(&body)?)
}

// ── DriverLauncher ───────────────────────────────────────────────

/// Opens one driver connection per session.
#[derive(Debug, Clone)]
pub struct DriverLauncher {
    addr: String,
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl DriverLauncher {
    pub fn new(addr: impl Into<String>, connect_timeout: Duration, io_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout,
            io_timeout,
        }
    }

    fn resolve(&self) -> Result<SocketAddr, StreamError> {
        self.addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| StreamError::RenderInitFailed(format!("{}: no address", self.addr)))
    }

    fn connect(&self) -> Result<TcpStream, StreamError> {
        let addr = self.resolve()?;
        let stream = TcpStream::connect_timeout(&addr, self.connect_timeout)?;
        stream.set_read_timeout(Some(self.io_timeout))?;
        stream.set_write_timeout(Some(self.io_timeout))?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

impl RenderLauncher for DriverLauncher {
    fn launch(&self, viewport: Viewport) -> Result<Box<dyn RenderHandle>, StreamError> {
        let stream = self
            .connect()
            .map_err(|e| StreamError::RenderInitFailed(format!("{}: {e}", self.addr)))?;
        let mut handle = DriverHandle {
            stream,
            io_timeout: self.io_timeout,
            closed: false,
        };
        match handle.call(&DriverRequest::Open { viewport }) {
            Ok(DriverReply::Ok) => {
                info!(driver = %self.addr, width = viewport.width, height = viewport.height, "page opened");
                Ok(Box::new(handle))
            }
            Ok(DriverReply::Error { message }) => Err(StreamError::RenderInitFailed(message)),
            Ok(other) => Err(StreamError::RenderInitFailed(format!(
                "unexpected reply to open: {other:?}"
            ))),
            Err(e) => Err(StreamError::RenderInitFailed(e.to_string())),
        }
    }
}

// ── DriverHandle ─────────────────────────────────────────────────

/// One page behind the driver.
#[derive(Debug)]
pub struct DriverHandle {
    stream: TcpStream,
    io_timeout: Duration,
    closed: bool,
}

impl DriverHandle {
    /// One request/reply exchange.
    ///
    /// Replies carry no request id, so after any failed exchange the
    /// stream position is unknown: a late reply would be read as the
    /// answer to the next request. The connection is dropped and this and
    /// every later call report `RenderLost`.
    fn call(&mut self, request: &DriverRequest) -> Result<DriverReply, StreamError> {
        if self.closed {
            return Err(StreamError::RenderLost("driver connection closed".into()));
        }
        let result = write_message(&mut self.stream, request)
            .and_then(|()| read_message(&mut self.stream));
        let err = match result {
            Ok(reply) => return Ok(reply),
            Err(e) => e,
        };

        self.closed = true;
        let _ = self.stream.shutdown(Shutdown::Both);
        warn!(error = %err, "driver exchange failed, dropping connection");
        Err(match err {
            StreamError::Io(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                StreamError::RenderLost(format!("driver timed out after {:?}", self.io_timeout))
            }
            StreamError::Io(e) => StreamError::RenderLost(format!("driver connection: {e}")),
            other => StreamError::RenderLost(format!("driver stream out of sync: {other}")),
        })
    }

    fn expect_ok(&mut self, request: &DriverRequest) -> Result<(), StreamError> {
        match self.call(request)? {
            DriverReply::Ok => Ok(()),
            DriverReply::Error { message } => Err(StreamError::Protocol(format!(
                "driver rejected input: {message}"
            ))),
            other => Err(StreamError::Protocol(format!("unexpected driver reply: {other:?}"))),
        }
    }
}

impl RenderHandle for DriverHandle {
    fn navigate(&mut self, url: &str) -> Result<(), StreamError> {
        match self.call(&DriverRequest::Navigate { url: url.to_string() })? {
            DriverReply::Ok => Ok(()),
            DriverReply::Error { message } => Err(StreamError::NavigationFailed(message)),
            other => Err(StreamError::Protocol(format!("unexpected driver reply: {other:?}"))),
        }
    }

    fn capture_frame(&mut self) -> Result<RawFrame, StreamError> {
        match self.call(&DriverRequest::Capture)? {
            DriverReply::Frame {
                width,
                height,
                stride,
                format,
                data,
            } => {
                let frame = RawFrame {
                    width,
                    height,
                    stride,
                    format,
                    data,
                };
                frame.validate()?;
                Ok(frame)
            }
            DriverReply::Error { message } => Err(StreamError::RenderLost(message)),
            DriverReply::Ok => Err(StreamError::Protocol("capture returned no frame".into())),
        }
    }

    fn dispatch_click(&mut self, x: u32, y: u32) -> Result<(), StreamError> {
        self.expect_ok(&DriverRequest::Click { x, y })
    }

    fn dispatch_scroll(&mut self, dx: i32, dy: i32) -> Result<(), StreamError> {
        self.expect_ok(&DriverRequest::Scroll { dx, dy })
    }

    fn dispatch_text(&mut self, text: &str) -> Result<(), StreamError> {
        self.expect_ok(&DriverRequest::Text {
            value: text.to_string(),
        })
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.call(&DriverRequest::Close) {
            debug!(error = %e, "driver close not acknowledged");
        }
        if !self.closed {
            self.closed = true;
            let _ = self.stream.shutdown(Shutdown::Both);
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
