//! Server-Sent Events framing for the chat push channel.
//!
//! Events are separated by a blank line. The `data:` lines of one event are
//! joined with `\n`; comments (`:`) and other fields are ignored.

use bytes::Bytes;
use futures::stream::BoxStream;
use futures_util::StreamExt;

use crate::core::ChatError;

/// Decoded `data:` payloads of one push channel, in arrival order.
pub type FrameStream = BoxStream<'static, Result<String, ChatError>>;

#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes and return the payloads of every event completed by
    /// them. Bytes of an unfinished event stay buffered, so multi-byte
    /// characters split across network chunks survive.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend(bytes.iter().copied().filter(|b| *b != b'\r'));

        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let block: Vec<u8> = self.buffer.drain(..pos + 2).collect();
            if let Some(data) = event_data(&String::from_utf8_lossy(&block[..pos])) {
                frames.push(data);
            }
        }
        frames
    }

    /// Flush a trailing event that was not terminated by a blank line.
    pub fn finish(&mut self) -> Option<String> {
        let block = std::mem::take(&mut self.buffer);
        event_data(&String::from_utf8_lossy(&block))
    }
}

fn event_data(block: &str) -> Option<String> {
    let data_lines: Vec<&str> = block
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|value| value.strip_prefix(' ').unwrap_or(value))
        .collect();

    if data_lines.is_empty() {
        return None;
    }
    Some(data_lines.join("\n"))
}

/// Turn an HTTP body into a stream of event payloads. A body error ends the
/// stream with a `TransportDrop`.
pub fn frames<S>(byte_stream: S) -> FrameStream
where
    S: futures::Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut decoder = SseDecoder::new();
        futures_util::pin_mut!(byte_stream);

        while let Some(chunk) = byte_stream.next().await {
            match chunk {
                Ok(bytes) => {
                    for frame in decoder.feed(&bytes) {
                        yield Ok(frame);
                    }
                }
                Err(e) => {
                    yield Err(ChatError::TransportDrop(e.to_string()));
                    return;
                }
            }
        }

        if let Some(frame) = decoder.finish() {
            yield Ok(frame);
        }
    })
}
