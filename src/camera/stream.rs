//! MJPEG byte-path helpers.
//!
//! The upstream already produces a valid `multipart/x-mixed-replace`
//! body, so the proxy forwards body bytes verbatim. Re-framing the
//! multipart stream as HTTP chunks breaks clients that parse `--frame`
//! as a chunk-length prefix; the response layer therefore disables
//! compression and closes the connection instead of chunking.

use crate::hub::ByteStream;
use futures::StreamExt;

/// Upstream read size. Larger upstream chunks are split, never merged,
/// so byte order is preserved exactly.
pub const STREAM_CHUNK_SIZE: usize = 8 * 1024;

/// Split a byte stream into chunks of at most [`STREAM_CHUNK_SIZE`],
/// forwarding bytes unchanged. Errors end the stream.
pub fn rechunk(mut upstream: ByteStream) -> ByteStream {
    Box::pin(async_stream::stream! {
        while let Some(item) = upstream.next().await {
            match item {
                Ok(mut bytes) => {
                    while bytes.len() > STREAM_CHUNK_SIZE {
                        yield Ok(bytes.split_to(STREAM_CHUNK_SIZE));
                    }
                    if !bytes.is_empty() {
                        yield Ok(bytes);
                    }
                }
                Err(err) => {
                    yield Err(err);
                    return;
                }
            }
        }
    })
}
