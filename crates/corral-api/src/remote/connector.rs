//! hyper connector over a pluggable [`Dialer`]
//!
//! Dials through the cluster's dialer and, for `https` endpoints, wraps the
//! stream in TLS pinned to the cluster CA.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use http::Uri;
use hyper::rt::{Read, ReadBufCursor, Write};
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use super::dialer::{BoxedIo, Dialer};

/// TLS settings for one endpoint
#[derive(Clone)]
pub struct TlsSettings {
    /// CA-pinned client config
    pub config: Arc<ClientConfig>,
    /// Name the server certificate must carry
    pub server_name: ServerName<'static>,
}

/// Stream produced by [`DialConnector`]
pub enum MaybeTls {
    /// Cleartext stream
    Plain(BoxedIo),
    /// TLS stream
    Tls(Box<TlsStream<BoxedIo>>),
}

impl AsyncRead for MaybeTls {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTls::Plain(io) => Pin::new(io).poll_read(cx, buf),
            MaybeTls::Tls(io) => Pin::new(io).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTls {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MaybeTls::Plain(io) => Pin::new(io).poll_write(cx, buf),
            MaybeTls::Tls(io) => Pin::new(io).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTls::Plain(io) => Pin::new(io).poll_flush(cx),
            MaybeTls::Tls(io) => Pin::new(io).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTls::Plain(io) => Pin::new(io).poll_shutdown(cx),
            MaybeTls::Tls(io) => Pin::new(io).poll_shutdown(cx),
        }
    }
}

/// Connection handed to hyper
pub struct DialedStream(TokioIo<MaybeTls>);

impl Read for DialedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_read(cx, buf)
    }
}

impl Write for DialedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().0).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_shutdown(cx)
    }
}

impl Connection for DialedStream {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

/// `tower::Service<Uri>` connector for hyper's client
#[derive(Clone)]
pub struct DialConnector {
    dialer: Arc<dyn Dialer>,
    tls: Option<TlsSettings>,
}

impl DialConnector {
    /// Connector dialing through `dialer`, with TLS when `tls` is set
    pub fn new(dialer: Arc<dyn Dialer>, tls: Option<TlsSettings>) -> Self {
        Self { dialer, tls }
    }
}

fn invalid(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, message.to_string())
}

impl tower::Service<Uri> for DialConnector {
    type Response = DialedStream;
    type Error = io::Error;
    type Future = Pin<Box<dyn Future<Output = io::Result<DialedStream>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let dialer = self.dialer.clone();
        let tls = self.tls.clone();

        Box::pin(async move {
            let host = uri.host().ok_or_else(|| invalid("endpoint has no host"))?;
            let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
            let https = uri.scheme_str() == Some("https");
            let port = uri.port_u16().unwrap_or(if https { 443 } else { 80 });

            let io = dialer.dial(&host, port).await?;

            let stream = match (https, tls) {
                (true, Some(tls)) => {
                    let connector = TlsConnector::from(tls.config);
                    let stream = connector.connect(tls.server_name, io).await?;
                    MaybeTls::Tls(Box::new(stream))
                }
                (true, None) => return Err(invalid("https endpoint without TLS settings")),
                (false, _) => MaybeTls::Plain(io),
            };

            Ok(DialedStream(TokioIo::new(stream)))
        })
    }
}
