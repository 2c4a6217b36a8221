//! Line-at-a-time relay of an upstream byte stream.
//!
//! The upstream emits newline-delimited event frames in arbitrarily sized
//! chunks. [`line_frames`] re-cuts them so every item is exactly one line
//! (newline included); each item becomes its own body frame, which hyper
//! writes and flushes to the client before the next is polled.

use std::convert::Infallible;
use std::fmt::Display;

use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use tracing::{debug, info, warn};

struct Framer<E> {
    upstream: BoxStream<'static, Result<Bytes, E>>,
    buf: BytesMut,
    /// Bytes of `buf` already known to contain no newline.
    scanned: usize,
    upstream_done: bool,
    finished: bool,
    lines: u64,
    bytes: u64,
    request_id: String,
}

impl<E> Framer<E> {
    fn take_line(&mut self) -> Option<Bytes> {
        let pos = self.buf[self.scanned..].iter().position(|b| *b == b'\n')?;
        let line = self.buf.split_to(self.scanned + pos + 1).freeze();
        self.scanned = 0;
        Some(line)
    }

    fn emit(&mut self, line: Bytes) -> Bytes {
        self.lines += 1;
        self.bytes += line.len() as u64;
        line
    }
}

impl<E> Drop for Framer<E> {
    fn drop(&mut self) {
        if !self.finished {
            info!(
                request_id = %self.request_id,
                lines = self.lines,
                bytes = self.bytes,
                "Client went away before the stream completed"
            );
        }
    }
}

/// Split `upstream` into one item per line.
///
/// A trailing fragment without a newline is delivered as the last item. A
/// read error ends the stream early: it is logged, the unterminated fragment
/// is discarded, and no error frame is appended.
pub fn line_frames<S, E>(
    upstream: S,
    request_id: impl Into<String>,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let framer = Framer {
        upstream: upstream.boxed(),
        buf: BytesMut::new(),
        scanned: 0,
        upstream_done: false,
        finished: false,
        lines: 0,
        bytes: 0,
        request_id: request_id.into(),
    };

    stream::unfold(framer, |mut st| async move {
        loop {
            if let Some(line) = st.take_line() {
                let line = st.emit(line);
                return Some((Ok(line), st));
            }

            if st.upstream_done {
                if !st.buf.is_empty() {
                    let rest = st.buf.split().freeze();
                    st.scanned = 0;
                    let rest = st.emit(rest);
                    return Some((Ok(rest), st));
                }
                st.finished = true;
                debug!(
                    request_id = %st.request_id,
                    lines = st.lines,
                    bytes = st.bytes,
                    "Upstream stream complete"
                );
                return None;
            }

            match st.upstream.next().await {
                Some(Ok(chunk)) => {
                    st.scanned = st.buf.len();
                    st.buf.extend_from_slice(&chunk);
                }
                Some(Err(e)) => {
                    warn!(
                        request_id = %st.request_id,
                        error = %e,
                        lines = st.lines,
                        "Error reading upstream response, ending stream"
                    );
                    st.buf.clear();
                    st.scanned = 0;
                    st.upstream_done = true;
                }
                None => st.upstream_done = true,
            }
        }
    })
}
