//! Broker transport for a FluxMQ session
//!
//! A session owns one [`Connection`] per known broker and issues one request
//! at a time on it, waiting for the matching response before the next one.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::Result;

/// Largest response frame accepted from a broker
const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

/// A synchronous request/response channel to one broker
#[async_trait]
pub trait Connection: Send + Sync + fmt::Debug {
    /// Send one encoded request frame and wait up to `timeout` for its response frame
    async fn send_sync(&self, request: Bytes, timeout: Duration) -> Result<Bytes>;
}

/// Opens connections to brokers
pub trait Connector: Send + Sync + fmt::Debug {
    fn open_connection(&self, host: &str, port: u16) -> Result<Arc<dyn Connection>>;
}

/// Connector producing [`TcpConnection`]s
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connection_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connection_timeout: Duration) -> Self {
        Self { connection_timeout }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl Connector for TcpConnector {
    fn open_connection(&self, host: &str, port: u16) -> Result<Arc<dyn Connection>> {
        Ok(Arc::new(TcpConnection::new(
            host,
            port,
            self.connection_timeout,
        )))
    }
}

type FramedStream = Framed<TcpStream, LengthDelimitedCodec>;

/// Length-prefixed TCP connection to a broker.
///
/// The socket is opened on first use and dropped after any I/O failure or
/// timeout, so the next request reconnects instead of reading a stale reply.
pub struct TcpConnection {
    broker: String,
    connection_timeout: Duration,
    stream: Mutex<Option<FramedStream>>,
}

impl TcpConnection {
    pub fn new(host: &str, port: u16, connection_timeout: Duration) -> Self {
        Self {
            broker: format!("{}:{}", host, port),
            connection_timeout,
            stream: Mutex::new(None),
        }
    }

    pub fn broker(&self) -> &str {
        &self.broker
    }

    async fn connect(&self) -> Result<FramedStream> {
        debug!("Creating connection to broker: {}", self.broker);

        let stream = timeout(self.connection_timeout, TcpStream::connect(&self.broker))
            .await
            .map_err(|_| SessionError::timeout(self.connection_timeout.as_millis() as u64))?
            .map_err(|e| {
                SessionError::connection(format!("Failed to connect to {}: {}", self.broker, e))
            })?;

        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY on {}: {}", self.broker, e);
        }

        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(MAX_FRAME_LENGTH)
            .new_codec();

        info!("Connected to broker: {}", self.broker);
        Ok(Framed::new(stream, codec))
    }

    async fn round_trip(framed: &mut FramedStream, request: Bytes) -> Result<Bytes> {
        framed.send(request).await?;

        match framed.next().await {
            Some(Ok(frame)) => Ok(frame.freeze()),
            Some(Err(e)) => Err(e.into()),
            None => Err(SessionError::connection("Connection closed by broker")),
        }
    }
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnection")
            .field("broker", &self.broker)
            .field("connection_timeout", &self.connection_timeout)
            .finish()
    }
}

#[async_trait]
impl Connection for TcpConnection {
    async fn send_sync(&self, request: Bytes, request_timeout: Duration) -> Result<Bytes> {
        let mut slot = self.stream.lock().await;

        if slot.is_none() {
            *slot = Some(self.connect().await?);
        }
        let framed = slot
            .as_mut()
            .ok_or_else(|| SessionError::connection(format!("No stream to {}", self.broker)))?;

        match timeout(request_timeout, Self::round_trip(framed, request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                warn!("Request to {} failed: {}", self.broker, e);
                *slot = None;
                Err(e)
            }
            Err(_) => {
                warn!(
                    "Request to {} timed out after {:?}",
                    self.broker, request_timeout
                );
                *slot = None;
                Err(SessionError::timeout(request_timeout.as_millis() as u64))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[tokio::test]
    async fn test_send_sync_round_trip() {
        let (listener, port) = listener().await;

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(socket, LengthDelimitedCodec::new());
            while let Some(Ok(frame)) = framed.next().await {
                let mut reply = BytesMut::from(&b"echo:"[..]);
                reply.extend_from_slice(&frame);
                framed.send(reply.freeze()).await.unwrap();
            }
        });

        let connection = TcpConnector::default()
            .open_connection("127.0.0.1", port)
            .unwrap();

        let first = connection
            .send_sync(Bytes::from_static(b"one"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(first, Bytes::from_static(b"echo:one"));

        // same socket is reused for the next request
        let second = connection
            .send_sync(Bytes::from_static(b"two"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(second, Bytes::from_static(b"echo:two"));
    }

    #[tokio::test]
    async fn test_send_sync_times_out() {
        let (listener, port) = listener().await;

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(socket, LengthDelimitedCodec::new());
            // read but never answer
            while let Some(Ok(_)) = framed.next().await {}
        });

        let connection = TcpConnection::new("127.0.0.1", port, Duration::from_secs(5));
        let err = connection
            .send_sync(Bytes::from_static(b"ping"), Duration::from_millis(50))
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert!(connection.stream.lock().await.is_none());
    }

    #[tokio::test]
    async fn test_send_sync_reports_closed_connection() {
        let (listener, port) = listener().await;

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let connection = TcpConnection::new("127.0.0.1", port, Duration::from_secs(5));
        let err = connection
            .send_sync(Bytes::from_static(b"ping"), Duration::from_secs(5))
            .await
            .unwrap_err();

        assert!(err.is_connection_error());
        assert_eq!(connection.broker(), format!("127.0.0.1:{}", port));
    }
}
