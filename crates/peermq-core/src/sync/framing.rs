//! Message framing using tokio-util LengthDelimitedCodec
//!
//! Splits a transport stream into a framed writer and reader of
//! [`WireMessage`]s.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{ReadHalf, WriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use super::protocol::WireMessage;
use crate::error::{MqError, MqResult};
use crate::transport::RawStream;

fn codec(max_frame_len: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_len)
        .new_codec()
}

/// Split `stream` into a framed sink and source.
pub fn split(stream: RawStream, max_frame_len: usize) -> (MessageSink, MessageStream) {
    let (read, write) = tokio::io::split(stream);
    (
        MessageSink {
            inner: FramedWrite::new(write, codec(max_frame_len)),
        },
        MessageStream {
            inner: FramedRead::new(read, codec(max_frame_len)),
        },
    )
}

/// Framed writer for WireMessages
pub struct MessageSink {
    inner: FramedWrite<WriteHalf<RawStream>, LengthDelimitedCodec>,
}

impl MessageSink {
    /// Send one length-prefixed message
    pub async fn send(&mut self, msg: &WireMessage) -> MqResult<()> {
        let bytes = Bytes::from(msg.encode()?);
        self.inner
            .send(bytes)
            .await
            .map_err(|e| MqError::Network(format!("send {}: {}", msg.kind(), e)))
    }

    /// Flush and shut down the write side
    pub async fn close(mut self) {
        let _ = SinkExt::<Bytes>::close(&mut self.inner).await;
    }
}

/// Framed reader for WireMessages
pub struct MessageStream {
    inner: FramedRead<ReadHalf<RawStream>, LengthDelimitedCodec>,
}

impl MessageStream {
    /// Receive the next message, or `None` once the peer closed the stream
    pub async fn recv(&mut self) -> MqResult<Option<WireMessage>> {
        match self.inner.next().await {
            Some(Ok(bytes)) => WireMessage::decode(&bytes).map(Some),
            Some(Err(e)) => Err(MqError::Network(format!("read error: {}", e))),
            None => Ok(None),
        }
    }
}
