//! Network byte stream beneath the framing layer: plain TCP or TLS

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::config::ClientConfig;
use crate::error::{Result, SockletError};
use crate::protocol::handshake::Target;

/// The transport stream a connection owns. TLS is negotiated here for
/// wss:// targets; everything above sees one byte stream.
pub(crate) enum Transport {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

pub(crate) async fn connect(target: &Target, config: &ClientConfig) -> Result<Transport> {
    let tcp = TcpStream::connect((target.host.as_str(), target.port))
        .await
        .map_err(SockletError::Transport)?;
    // Frames are small and latency-sensitive
    let _ = tcp.set_nodelay(true);

    if !target.tls {
        return Ok(Transport::Plain(tcp));
    }

    let tls_config = config.tls.clone().ok_or_else(|| {
        SockletError::Config(
            "wss:// target requires a TLS client configuration".to_string(),
        )
    })?;
    let server_name = rustls::ServerName::try_from(target.host.as_str()).map_err(|_| {
        SockletError::Config(format!("invalid TLS server name '{}'", target.host))
    })?;
    let stream = TlsConnector::from(tls_config)
        .connect(server_name, tcp)
        .await
        .map_err(SockletError::Transport)?;
    Ok(Transport::Tls(Box::new(stream)))
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}
