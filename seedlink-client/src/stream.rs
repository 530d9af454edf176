use futures_core::Stream;
use seedlink_mux_protocol::Record;

use crate::SeedLinkClient;
use crate::engine::ClientEngine;
use crate::error::{ClientError, Result};
use crate::state::Event;

/// Convert a streaming [`SeedLinkClient`] into a [`Stream`] of records.
///
/// The client must already be streaming (after
/// [`end_stream()`](SeedLinkClient::end_stream)). The stream ends when the
/// server closes the connection or sends `END`. A gap notice is yielded as
/// [`ClientError::GapDetected`] and the stream carries on.
pub fn record_stream(mut client: SeedLinkClient) -> impl Stream<Item = Result<Record>> {
    async_stream::stream! {
        loop {
            match client.next_record().await {
                Ok(Some(record)) => yield Ok(record),
                Ok(None) => break,
                Err(e @ ClientError::GapDetected(_)) => yield Err(e),
                Err(e) => {
                    yield Err(e);
                    break;
                }
            }
        }
    }
}

/// Convert a [`ClientEngine`] into a [`Stream`] of events, reconnecting as
/// needed. The first error ends the stream.
pub fn event_stream(mut engine: ClientEngine) -> impl Stream<Item = Result<Event>> {
    async_stream::try_stream! {
        while let Some(event) = engine.next_event().await? {
            yield event;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockConfig, MockServer, data_frame, gap_frame};
    use seedlink_mux_protocol::{ProtocolVersion, SequenceNumber};
    use std::pin::pin;
    use tokio_stream::StreamExt;

    async fn streaming_client(config: MockConfig) -> (MockServer, SeedLinkClient) {
        let server = MockServer::start(config).await;
        let mut client = SeedLinkClient::connect(&server.addr().to_string())
            .await
            .unwrap();
        client.station("ANMO", "IU").await.unwrap();
        client.data().await.unwrap();
        client.end_stream().await.unwrap();
        (server, client)
    }

    #[tokio::test]
    async fn stream_yields_records() {
        let frames = vec![
            data_frame(ProtocolVersion::V3, "IU", "ANMO", 1),
            data_frame(ProtocolVersion::V3, "IU", "ANMO", 2),
        ];
        let config = MockConfig {
            close_after_stream: true,
            ..MockConfig::v3_default(frames)
        };
        let (_server, client) = streaming_client(config).await;

        let mut stream = pin!(client.into_stream());

        let r1 = stream.next().await.unwrap().unwrap();
        assert_eq!(r1.sequence, SequenceNumber::new(1));
        let r2 = stream.next().await.unwrap().unwrap();
        assert_eq!(r2.sequence, SequenceNumber::new(2));

        // EOF → stream ends
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn stream_ends_on_eof() {
        let config = MockConfig {
            close_after_stream: true,
            ..MockConfig::v3_default(vec![])
        };
        let (_server, client) = streaming_client(config).await;

        let mut stream = pin!(record_stream(client));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn gap_does_not_end_stream() {
        let frames = vec![
            data_frame(ProtocolVersion::V4, "IU", "ANMO", 10),
            gap_frame(ProtocolVersion::V4, "IU", "ANMO", 11, 20),
            data_frame(ProtocolVersion::V4, "IU", "ANMO", 20),
        ];
        let config = MockConfig {
            close_after_stream: true,
            ..MockConfig::v4_default(frames)
        };
        let (_server, client) = streaming_client(config).await;

        let collected: Vec<_> = pin!(record_stream(client)).collect().await;
        assert_eq!(collected.len(), 3);
        assert_eq!(
            collected[0].as_ref().unwrap().sequence,
            SequenceNumber::new(10)
        );
        assert!(matches!(collected[1], Err(ClientError::GapDetected(_))));
        assert_eq!(
            collected[2].as_ref().unwrap().sequence,
            SequenceNumber::new(20)
        );
    }
}
