//! Transport to one cluster host: plain TCP or TLS.

use crate::config::TlsOptions;
use crate::error::CommError;
use crate::tls::create_tls_connector;
use dbwire_protocol::HostDescription;
use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

pin_project! {
    /// A byte stream to a host, optionally TLS-encrypted.
    #[project = TransportProj]
    pub enum Transport {
        Plain { #[pin] stream: TcpStream },
        Tls { #[pin] stream: TlsStream<TcpStream> },
    }
}

impl Transport {
    /// Dials `host` and upgrades to TLS when `tls` is set.
    ///
    /// Timeouts are left to the caller.
    pub async fn dial(host: &HostDescription, tls: Option<&TlsOptions>) -> Result<Self, CommError> {
        let tcp = TcpStream::connect((host.host(), host.port())).await?;
        tcp.set_nodelay(true).ok();

        let Some(options) = tls else {
            return Ok(Transport::Plain { stream: tcp });
        };

        let (connector, server_name) = create_tls_connector(options, host.host())?;
        tracing::debug!("Performing TLS handshake with {}", host);
        let stream = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| CommError::TlsHandshake(e.to_string()))?;
        Ok(Transport::Tls { stream })
    }

    /// Returns whether this transport is TLS-encrypted.
    pub fn is_tls(&self) -> bool {
        matches!(self, Transport::Tls { .. })
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            TransportProj::Plain { stream } => stream.poll_read(cx, buf),
            TransportProj::Tls { stream } => stream.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            TransportProj::Plain { stream } => stream.poll_write(cx, buf),
            TransportProj::Tls { stream } => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            TransportProj::Plain { stream } => stream.poll_flush(cx),
            TransportProj::Tls { stream } => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            TransportProj::Plain { stream } => stream.poll_shutdown(cx),
            TransportProj::Tls { stream } => stream.poll_shutdown(cx),
        }
    }
}
