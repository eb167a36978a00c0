//! `AsyncRead`/`AsyncWrite` view over a Workers WebSocket.

use std::io::{Error, ErrorKind, Result};
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{BufMut, BytesMut};
use futures_util::Stream;
use pin_project::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use worker::{EventStream, WebSocket, WebsocketEvent};

const INITIAL_BUFFER: usize = 4096;

#[pin_project]
pub struct WebSocketStream<'a> {
    ws: &'a WebSocket,
    #[pin]
    events: EventStream<'a>,
    pending: BytesMut,
    closed: bool,
}

impl<'a> WebSocketStream<'a> {
    /// `early_data` is served before anything read from the socket.
    pub fn new(ws: &'a WebSocket, events: EventStream<'a>, early_data: Option<Vec<u8>>) -> Self {
        let mut pending = BytesMut::with_capacity(INITIAL_BUFFER);
        if let Some(data) = early_data {
            pending.put_slice(&data);
        }
        Self {
            ws,
            events,
            pending,
            closed: false,
        }
    }

    fn closed_error() -> Error {
        Error::new(ErrorKind::BrokenPipe, "websocket closed")
    }
}

impl AsyncRead for WebSocketStream<'_> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<Result<()>> {
        let mut this = self.project();
        loop {
            if !this.pending.is_empty() {
                let n = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending.split_to(n));
                return Poll::Ready(Ok(()));
            }
            if *this.closed {
                return Poll::Ready(Ok(()));
            }

            match this.events.as_mut().poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Ok(WebsocketEvent::Message(msg)))) => {
                    // Text frames are read as their UTF-8 bytes.
                    if let Some(data) = msg.bytes() {
                        this.pending.put_slice(&data);
                    } else if let Some(text) = msg.text() {
                        this.pending.put_slice(text.as_bytes());
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Err(Error::other(e.to_string())));
                }
                Poll::Ready(_) => *this.closed = true,
            }
        }
    }
}

impl AsyncWrite for WebSocketStream<'_> {
    fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, buf: &[u8]) -> Poll<Result<usize>> {
        let this = self.project();
        if *this.closed {
            return Poll::Ready(Err(Self::closed_error()));
        }
        match this.ws.send_with_bytes(buf) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(e) => Poll::Ready(Err(Error::other(e.to_string()))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<()>> {
        if self.closed {
            return Poll::Ready(Err(Self::closed_error()));
        }
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<()>> {
        let this = self.project();
        if !*this.closed {
            this.ws
                .close(Some(1000), Some("normal close"))
                .map_err(|e| Error::other(e.to_string()))?;
            *this.closed = true;
        }
        Poll::Ready(Ok(()))
    }
}
