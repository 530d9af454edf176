use std::time::Duration;

use seedlink_mux_protocol::{Codec, Command, Decoded, Packet, ProtocolVersion};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, trace, warn};

use crate::error::{ClientError, Result};

/// A TCP transport with a [`Codec`] doing the framing.
///
/// Reads go through the codec's buffer, so text replies and binary packets
/// can be interleaved freely on one socket.
#[derive(Debug)]
pub struct Connection {
    reader: OwnedReadHalf,
    writer: BufWriter<OwnedWriteHalf>,
    codec: Codec,
    read_timeout: Duration,
}

impl Connection {
    pub async fn connect(
        addr: &str,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self> {
        debug!(addr, "TCP connecting");
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ClientError::Timeout(connect_timeout))?
            .map_err(ClientError::Io)?;

        stream.set_nodelay(true).ok();
        Ok(Self::from_stream(stream, read_timeout))
    }

    fn from_stream(stream: TcpStream, read_timeout: Duration) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: read_half,
            writer: BufWriter::new(write_half),
            codec: Codec::new(),
            read_timeout,
        }
    }

    /// Fix the framing once the handshake settled on a version.
    pub fn negotiate(&mut self, version: ProtocolVersion) -> Result<()> {
        self.codec.negotiate(version)?;
        Ok(())
    }

    pub async fn send_command(&mut self, cmd: &Command) -> Result<()> {
        trace!(?cmd, "sending");
        let bytes = self.codec.encode_command(cmd)?;
        self.send_raw(&bytes).await
    }

    pub async fn send_raw(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data).await.map_err(ClientError::Io)?;
        self.writer.flush().await.map_err(ClientError::Io)?;
        Ok(())
    }

    /// Read one reply line, without its line terminator.
    pub async fn read_line(&mut self) -> Result<String> {
        loop {
            if let Decoded::Item(line) = self.codec.decode_line()? {
                return Ok(line);
            }
            self.fill().await?;
        }
    }

    /// Read one streamed packet. `Ok(None)` means the server closed the
    /// connection on a packet boundary.
    pub async fn read_packet(&mut self) -> Result<Option<Packet>> {
        loop {
            if let Decoded::Item(packet) = self.codec.decode_packet()? {
                return Ok(Some(packet));
            }
            match self.fill().await {
                Ok(()) => {}
                Err(ClientError::Disconnected) if self.codec.buffered() == 0 => return Ok(None),
                Err(e) => return Err(e),
            }
        }
    }

    async fn fill(&mut self) -> Result<()> {
        let n = tokio::time::timeout(self.read_timeout, self.reader.read_buf(self.codec.read_buf()))
            .await
            .map_err(|_| {
                warn!(timeout = ?self.read_timeout, "read timeout");
                ClientError::Timeout(self.read_timeout)
            })?
            .map_err(ClientError::Io)?;
        if n == 0 {
            return Err(ClientError::Disconnected);
        }
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.writer.shutdown().await.map_err(ClientError::Io)?;
        Ok(())
    }
}
