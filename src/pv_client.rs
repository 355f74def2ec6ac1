use std::io::{Error as IoError, ErrorKind};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::channel::{ChannelAccess, ChannelError};
use crate::pv_codec::{PvClientCodec, PvRequest, PvResponse};

/// Process-variable client over the line protocol.
///
/// Connects lazily. Any failed or timed out exchange drops the connection,
/// so a late answer can never be taken for the reply to the next request.
pub struct PvClient {
    addr: String,
    connection: Option<Framed<TcpStream, PvClientCodec>>,
}

impl PvClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connection: None,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub async fn test_connection(&mut self, timeout: Duration) -> Result<(), IoError> {
        match tokio::time::timeout(timeout, self.connect()).await {
            Ok(r) => r.map(|_| ()),
            Err(_) => Err(IoError::new(ErrorKind::TimedOut, "Connection timeout")),
        }
    }

    async fn connect(&mut self) -> Result<&mut Framed<TcpStream, PvClientCodec>, IoError> {
        if self.connection.is_none() {
            tracing::debug!("Connecting to process variable server {}...", self.addr);
            let stream = TcpStream::connect(&self.addr).await?;
            stream.set_nodelay(true)?;
            self.connection = Some(Framed::new(stream, PvClientCodec::default()));
        }

        self.connection
            .as_mut()
            .ok_or_else(|| IoError::new(ErrorKind::NotConnected, "Not connected"))
    }

    async fn exchange(&mut self, req: PvRequest) -> Result<PvResponse, IoError> {
        let connection = self.connect().await?;
        connection.send(req).await?;

        match connection.next().await {
            Some(r) => r,
            None => Err(IoError::new(
                ErrorKind::UnexpectedEof,
                "Unexpected end of stream",
            )),
        }
    }

    async fn request(
        &mut self,
        channel: &str,
        req: PvRequest,
        timeout: Duration,
    ) -> Result<f64, ChannelError> {
        let res = tokio::time::timeout(timeout, self.exchange(req)).await;

        match res {
            Ok(Ok(PvResponse::Ok(v))) => Ok(v),
            Ok(Ok(PvResponse::Err(message))) => Err(ChannelError::Rejected {
                channel: channel.to_owned(),
                message,
            }),
            Ok(Err(error)) => {
                self.connection = None;
                Err(ChannelError::Io {
                    channel: channel.to_owned(),
                    error,
                })
            }
            Err(_) => {
                self.connection = None;
                Err(ChannelError::Timeout {
                    channel: channel.to_owned(),
                    timeout,
                })
            }
        }
    }
}

impl ChannelAccess for PvClient {
    async fn get(&mut self, channel: &str, timeout: Duration) -> Result<f64, ChannelError> {
        self.request(channel, PvRequest::Get(channel.to_owned()), timeout)
            .await
    }

    async fn set(
        &mut self,
        channel: &str,
        value: f64,
        timeout: Duration,
    ) -> Result<(), ChannelError> {
        self.request(channel, PvRequest::Put(channel.to_owned(), value), timeout)
            .await
            .map(|_| ())
    }
}
