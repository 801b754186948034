//! Newline-delimited JSON control channel over a worker's stdin/stdout.
//!
//! The gateway writes [`SupervisorMessage`]s to stdin; the worker answers with
//! [`WorkerMessage`]s on stdout. Any other stdout line is plain worker output.

use futures_util::{SinkExt, StreamExt};
use shared_types::{SupervisorMessage, WorkerMessage};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};

use super::WorkerError;

/// Longest line accepted from a worker before the channel is dropped.
const MAX_LINE_BYTES: usize = 1024 * 1024;

pub(super) struct IpcReader<R> {
    lines: FramedRead<R, LinesCodec>,
}

impl<R: AsyncRead + Unpin> IpcReader<R> {
    pub(super) fn new(stdout: R) -> Self {
        Self {
            lines: FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_LINE_BYTES)),
        }
    }

    /// Next inbound line; `None` once the worker closed stdout.
    pub(super) async fn next(&mut self) -> Option<Result<Inbound, LinesCodecError>> {
        let line = self.lines.next().await?;
        Some(line.map(|text| Inbound::decode(&text)))
    }
}

pub(super) struct IpcWriter<W> {
    lines: FramedWrite<W, LinesCodec>,
}

impl<W: AsyncWrite + Unpin> IpcWriter<W> {
    pub(super) fn new(stdin: W) -> Self {
        Self {
            lines: FramedWrite::new(stdin, LinesCodec::new()),
        }
    }

    pub(super) async fn send(&mut self, message: &SupervisorMessage) -> Result<(), WorkerError> {
        let line = serde_json::to_string(message)
            .map_err(|e| WorkerError::Ipc(format!("encode {message:?}: {e}")))?;
        self.lines
            .send(line)
            .await
            .map_err(|e| WorkerError::Ipc(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(super) enum Inbound {
    Message(WorkerMessage),
    Output(String),
}

impl Inbound {
    fn decode(line: &str) -> Self {
        let trimmed = line.trim();
        if trimmed.starts_with('{') {
            if let Ok(message) = serde_json::from_str::<WorkerMessage>(trimmed) {
                return Inbound::Message(message);
            }
        }
        Inbound::Output(line.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_reader_separates_protocol_from_output() {
        let (mut tx, rx) = tokio::io::duplex(1024);
        tx.write_all(
            b"booting plugin host\n{\"type\":\"ready\",\"url\":\"http://127.0.0.1:4100\"}\n{\"level\":\"info\"}\n",
        )
        .await
        .unwrap();
        drop(tx);

        let mut reader = IpcReader::new(rx);
        assert_eq!(
            reader.next().await.unwrap().unwrap(),
            Inbound::Output("booting plugin host".to_string())
        );
        assert_eq!(
            reader.next().await.unwrap().unwrap(),
            Inbound::Message(WorkerMessage::Ready {
                url: "http://127.0.0.1:4100".to_string()
            })
        );
        assert_eq!(
            reader.next().await.unwrap().unwrap(),
            Inbound::Output("{\"level\":\"info\"}".to_string())
        );
        assert!(reader.next().await.is_none());
    }

    #[tokio::test]
    async fn test_writer_emits_one_line_per_message() {
        let (tx, rx) = tokio::io::duplex(1024);
        let mut writer = IpcWriter::new(tx);
        writer
            .send(&SupervisorMessage::Start {
                worker_id: "images".to_string(),
                gateway_url: None,
                config: serde_json::json!({"plugin": "images"}),
            })
            .await
            .unwrap();
        drop(writer);

        let mut lines = FramedRead::new(rx, LinesCodec::new());
        let line = lines.next().await.unwrap().unwrap();
        let decoded: SupervisorMessage = serde_json::from_str(&line).unwrap();
        assert_eq!(
            decoded,
            SupervisorMessage::Start {
                worker_id: "images".to_string(),
                gateway_url: None,
                config: serde_json::json!({"plugin": "images"})
            }
        );
    }
}
