//! Header names as they were sent.
//!
//! hyper hands the forwarding path a `HeaderMap`, which lowercases names and
//! groups repeated headers together. Snapshots shown to the operator should
//! read like the wire, so each stream hyper parses from is wrapped in a
//! [`HeadCapture`]: it keeps a copy of the bytes read since the last
//! [`CaptureBuf::mark`], and the head hyper just parsed is parsed again with
//! `httparse` to recover spelling and order.
//!
//! The copy is only trusted when it agrees with hyper's view of the same
//! message (method or status, and every header); otherwise the snapshot
//! falls back to the header map.

use super::message::{Header, headers_from_map};
use bytes::BytesMut;
use hyper::header::HeaderMap;
use hyper::{Method, StatusCode};
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Bytes kept after a mark; a head longer than this is not recovered.
const CAPTURE_LIMIT: usize = 64 * 1024;

/// Most header lines parsed back out of a captured head.
const MAX_HEADERS: usize = 128;

/// Bytes read from a stream since the last mark.
#[derive(Debug, Clone, Default)]
pub(crate) struct CaptureBuf(Arc<Mutex<BytesMut>>);

impl CaptureBuf {
    /// Forget everything read so far; the next bytes start a new head.
    pub(crate) fn mark(&self) {
        self.lock().clear();
    }

    /// Headers of the request head at the start of the buffer, in wire
    /// order and spelling, or the map's headers when the buffer disagrees.
    pub(crate) fn request_headers(&self, method: &Method, map: &HeaderMap) -> Vec<Header> {
        let buf = self.lock();
        let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut slots);

        match req.parse(&buf) {
            Ok(httparse::Status::Complete(_)) if req.method == Some(method.as_str()) => {
                matching(req.headers, map)
            }
            _ => None,
        }
        .unwrap_or_else(|| headers_from_map(map))
    }

    /// Headers of the response head at the start of the buffer, in wire
    /// order and spelling, or the map's headers when the buffer disagrees.
    pub(crate) fn response_headers(&self, status: StatusCode, map: &HeaderMap) -> Vec<Header> {
        let buf = self.lock();
        let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut res = httparse::Response::new(&mut slots);

        match res.parse(&buf) {
            Ok(httparse::Status::Complete(_)) if res.code == Some(status.as_u16()) => {
                matching(res.headers, map)
            }
            _ => None,
        }
        .unwrap_or_else(|| headers_from_map(map))
    }

    fn push(&self, data: &[u8]) {
        let mut buf = self.lock();
        let room = CAPTURE_LIMIT.saturating_sub(buf.len());
        buf.extend_from_slice(&data[..data.len().min(room)]);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BytesMut> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The parsed headers, if they are exactly the ones in `map`.
fn matching(parsed: &[httparse::Header<'_>], map: &HeaderMap) -> Option<Vec<Header>> {
    if parsed.len() != map.len() {
        return None;
    }

    parsed
        .iter()
        .map(|header| {
            let value = map
                .get_all(header.name)
                .iter()
                .find(|value| trim(value.as_bytes()) == trim(header.value))?;
            Some(Header::new(
                header.name,
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            ))
        })
        .collect()
}

fn trim(value: &[u8]) -> &[u8] {
    let start = value
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(value.len());
    let end = value
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &value[start..end]
}

/// A stream that copies what is read from it into a [`CaptureBuf`].
#[derive(Debug)]
pub(crate) struct HeadCapture<I> {
    inner: I,
    capture: CaptureBuf,
}

impl<I> HeadCapture<I> {
    pub(crate) fn new(inner: I, capture: CaptureBuf) -> Self {
        Self { inner, capture }
    }
}

impl<I: AsyncRead + Unpin> AsyncRead for HeadCapture<I> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = poll {
            self.capture.push(&buf.filled()[before..]);
        }
        poll
    }
}

impl<I: AsyncWrite + Unpin> AsyncWrite for HeadCapture<I> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
