//! Caller-side halves of an interactive session.
//!
//! A transport splits into a [`CallerSource`] that yields input frames and a
//! [`CallerSink`] that receives shell output and status events. The relay
//! only sees these two traits, so the same session code serves a local
//! terminal and a WebSocket peer.

use std::fmt;
use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, Stderr, Stdin, Stdout};
use tokio::sync::mpsc;

use crate::error::ErrorKind;

const READ_CHUNK: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputFrame {
    Data(Vec<u8>),
    Interrupt,
    Resize { cols: u16, rows: u16 },
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusEvent {
    Connected,
    SandboxReady,
    Exited(i64),
    Disconnected,
    Error(ErrorKind),
}

impl StatusEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exited(_) | Self::Disconnected | Self::Error(_))
    }
}

impl fmt::Display for StatusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => f.write_str("connected"),
            Self::SandboxReady => f.write_str("sandbox-ready"),
            Self::Exited(code) => write!(f, "exited:{code}"),
            Self::Disconnected => f.write_str("disconnected"),
            Self::Error(kind) => write!(f, "error:{kind}"),
        }
    }
}

#[async_trait]
pub trait CallerSource: Send {
    async fn next_frame(&mut self) -> io::Result<Option<InputFrame>>;
}

#[async_trait]
pub trait CallerSink: Send {
    async fn write_output(&mut self, bytes: &[u8]) -> io::Result<()>;

    async fn emit(&mut self, event: &StatusEvent) -> io::Result<()>;
}

pub trait DuplexTransport: Send + 'static {
    type Source: CallerSource + 'static;
    type Sink: CallerSink + 'static;

    fn split(self) -> (Self::Source, Self::Sink);
}

/// Raw byte streams; status events go to a separate writer as text lines.
pub struct ByteTransport<R, W, E> {
    reader: R,
    writer: W,
    status: E,
}

impl<R, W, E> ByteTransport<R, W, E> {
    pub fn new(reader: R, writer: W, status: E) -> Self {
        Self {
            reader,
            writer,
            status,
        }
    }
}

impl ByteTransport<Stdin, Stdout, Stderr> {
    pub fn terminal() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout(), tokio::io::stderr())
    }
}

impl<R, W, E> DuplexTransport for ByteTransport<R, W, E>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
    E: AsyncWrite + Send + Unpin + 'static,
{
    type Source = ByteSource<R>;
    type Sink = ByteSink<W, E>;

    fn split(self) -> (Self::Source, Self::Sink) {
        (
            ByteSource {
                reader: self.reader,
                buf: vec![0; READ_CHUNK],
            },
            ByteSink {
                writer: self.writer,
                status: self.status,
            },
        )
    }
}

pub struct ByteSource<R> {
    reader: R,
    buf: Vec<u8>,
}

#[async_trait]
impl<R> CallerSource for ByteSource<R>
where
    R: AsyncRead + Send + Unpin,
{
    async fn next_frame(&mut self) -> io::Result<Option<InputFrame>> {
        let n = self.reader.read(&mut self.buf).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(InputFrame::Data(self.buf[..n].to_vec())))
    }
}

pub struct ByteSink<W, E> {
    writer: W,
    status: E,
}

#[async_trait]
impl<W, E> CallerSink for ByteSink<W, E>
where
    W: AsyncWrite + Send + Unpin,
    E: AsyncWrite + Send + Unpin,
{
    async fn write_output(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await
    }

    async fn emit(&mut self, event: &StatusEvent) -> io::Result<()> {
        let line = format!("[webshell] {event}\n");
        self.status.write_all(line.as_bytes()).await?;
        self.status.flush().await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Output(Vec<u8>),
    Status(StatusEvent),
}

pub struct ChannelTransport {
    inbound: mpsc::Receiver<InputFrame>,
    outbound: mpsc::Sender<Outbound>,
}

pub struct ChannelPeer {
    pub inbound: mpsc::Sender<InputFrame>,
    pub outbound: mpsc::Receiver<Outbound>,
}

impl ChannelTransport {
    pub fn pair(capacity: usize) -> (Self, ChannelPeer) {
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        (
            Self {
                inbound: inbound_rx,
                outbound: outbound_tx,
            },
            ChannelPeer {
                inbound: inbound_tx,
                outbound: outbound_rx,
            },
        )
    }
}

impl DuplexTransport for ChannelTransport {
    type Source = ChannelSource;
    type Sink = ChannelSink;

    fn split(self) -> (Self::Source, Self::Sink) {
        (
            ChannelSource {
                inbound: self.inbound,
            },
            ChannelSink {
                outbound: self.outbound,
            },
        )
    }
}

pub struct ChannelSource {
    inbound: mpsc::Receiver<InputFrame>,
}

#[async_trait]
impl CallerSource for ChannelSource {
    async fn next_frame(&mut self) -> io::Result<Option<InputFrame>> {
        Ok(self.inbound.recv().await)
    }
}

pub struct ChannelSink {
    outbound: mpsc::Sender<Outbound>,
}

impl ChannelSink {
    async fn send(&self, message: Outbound) -> io::Result<()> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "caller channel closed"))
    }
}

#[async_trait]
impl CallerSink for ChannelSink {
    async fn write_output(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.send(Outbound::Output(bytes.to_vec())).await
    }

    async fn emit(&mut self, event: &StatusEvent) -> io::Result<()> {
        self.send(Outbound::Status(*event)).await
    }
}
