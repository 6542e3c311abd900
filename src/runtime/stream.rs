use std::{
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};

use crate::{
    error::{ErrorKind, Result},
    options::ServerAddress,
    runtime,
};

pub(crate) const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A runtime-agnostic async stream possibly using TLS.
///
/// The `Null` variant stands in for a stream that has been moved out of a
/// connection, e.g. when nullifying it for check-in; reading from it yields EOF.
#[derive(Debug)]
pub(crate) enum AsyncStream {
    Null,

    /// A basic TCP connection to the server.
    Tcp(TcpStream),
}

impl AsyncStream {
    /// Creates a new Tokio TCP stream connected to the server as specified by the given address.
    pub(crate) async fn connect(
        address: &ServerAddress,
        connect_timeout: Option<Duration>,
    ) -> Result<Self> {
        let timeout = match connect_timeout {
            Some(t) if !t.is_zero() => t,
            _ => DEFAULT_CONNECT_TIMEOUT,
        };

        let mut addrs = runtime::timeout(
            timeout,
            tokio::net::lookup_host((address.host(), address.port_or_default())),
        )
        .await??
        .collect::<Vec<_>>();

        if addrs.is_empty() {
            return Err(ErrorKind::InvalidArgument {
                message: format!("address {} did not resolve to any hosts", address),
            }
            .into());
        }

        // Try each resolved address, returning the last error if none connect.
        let mut last_err = None;
        addrs.sort_by_key(|addr| if addr.is_ipv4() { 0 } else { 1 });
        for addr in addrs {
            match runtime::timeout(timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    stream.set_nodelay(true)?;
                    return Ok(Self::Tcp(stream));
                }
                Ok(Err(e)) => last_err = Some(e.into()),
                Err(e) => last_err = Some(e),
            }
        }

        Err(last_err.unwrap_or_else(crate::error::Error::network_timeout))
    }
}

impl AsyncRead for AsyncStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Null => Poll::Ready(Ok(())),
            Self::Tcp(ref mut inner) => Pin::new(inner).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for AsyncStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Self::Null => Poll::Ready(Ok(buf.len())),
            Self::Tcp(ref mut inner) => Pin::new(inner).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Null => Poll::Ready(Ok(())),
            Self::Tcp(ref mut inner) => Pin::new(inner).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Null => Poll::Ready(Ok(())),
            Self::Tcp(ref mut inner) => Pin::new(inner).poll_shutdown(cx),
        }
    }
}
