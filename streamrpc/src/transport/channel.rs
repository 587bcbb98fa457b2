// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Transports backed by in-memory channels. Useful for tests, and for a client and server that
//! live in the same process.

use futures::{task::*, Sink, SinkExt, Stream, StreamExt};
use pin_project::pin_project;
use std::{fmt, pin::Pin};
use tokio::sync::mpsc;

/// The error returned when a message is sent to a peer that was dropped.
///
/// Receiving never fails: a dropped peer ends the stream instead.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("the peer of the channel was dropped, so the message could not be delivered")]
pub struct Disconnected;

/// Returns two connected peers whose buffers grow without limit. Each peer's [`Stream`] yields
/// the messages sent through the other's [`Sink`], so sending never waits.
///
/// The first peer receives `A`s and sends `B`s: `unbounded::<ServerMessage, ClientMessage>()`
/// returns the client end first.
pub fn unbounded<A, B>() -> (UnboundedChannel<A, B>, UnboundedChannel<B, A>) {
    let (tx1, rx2) = mpsc::unbounded_channel();
    let (tx2, rx1) = mpsc::unbounded_channel();
    (
        UnboundedChannel { tx: tx1, rx: rx1 },
        UnboundedChannel { tx: tx2, rx: rx2 },
    )
}

/// One end of a pair returned by [`unbounded`]. Receives `Item`s and sends `SinkItem`s.
#[derive(Debug)]
pub struct UnboundedChannel<Item, SinkItem> {
    rx: mpsc::UnboundedReceiver<Item>,
    tx: mpsc::UnboundedSender<SinkItem>,
}

impl<Item, SinkItem> Stream for UnboundedChannel<Item, SinkItem> {
    type Item = Result<Item, Disconnected>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Item, Disconnected>>> {
        self.rx.poll_recv(cx).map(|option| option.map(Ok))
    }
}

impl<Item, SinkItem> Sink<SinkItem> for UnboundedChannel<Item, SinkItem> {
    type Error = Disconnected;

    fn poll_ready(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Disconnected>> {
        if self.tx.is_closed() {
            return Poll::Ready(Err(Disconnected));
        }
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: SinkItem) -> Result<(), Disconnected> {
        self.tx.send(item).map_err(|_| Disconnected)
    }

    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Disconnected>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Disconnected>> {
        // The peer's stream ends once this end is dropped.
        Poll::Ready(Ok(()))
    }
}

/// Returns two connected peers, each buffering at most `capacity` messages in flight to it.
/// Sending to a peer whose buffer is full waits, which lets the transport apply backpressure
/// between an in-process client and server. The first peer receives `A`s and sends `B`s.
pub fn bounded<A, B>(capacity: usize) -> (Channel<A, B>, Channel<B, A>)
where
    A: Send + Sync + 'static,
    B: Send + Sync + 'static,
{
    let (tx1, rx2) = flume::bounded(capacity);
    let (tx2, rx1) = flume::bounded(capacity);
    (
        Channel {
            rx: rx1.into_stream(),
            tx: tx1.into_sink(),
        },
        Channel {
            rx: rx2.into_stream(),
            tx: tx2.into_sink(),
        },
    )
}

/// One end of a pair returned by [`bounded`]. Receives `Item`s and sends `SinkItem`s.
#[pin_project]
pub struct Channel<Item: Send + Sync + 'static, SinkItem: Send + Sync + 'static> {
    #[pin]
    rx: flume::r#async::RecvStream<'static, Item>,
    #[pin]
    tx: flume::r#async::SendSink<'static, SinkItem>,
}

impl<Item, SinkItem> fmt::Debug for Channel<Item, SinkItem>
where
    Item: Send + Sync + 'static,
    SinkItem: Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel").finish_non_exhaustive()
    }
}

impl<Item, SinkItem> Stream for Channel<Item, SinkItem>
where
    Item: Send + Sync + 'static,
    SinkItem: Send + Sync + 'static,
{
    type Item = Result<Item, Disconnected>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project().rx.poll_next_unpin(cx).map(|item| item.map(Ok))
    }
}

impl<Item, SinkItem> Sink<SinkItem> for Channel<Item, SinkItem>
where
    Item: Send + Sync + 'static,
    SinkItem: Send + Sync + 'static,
{
    type Error = Disconnected;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Disconnected>> {
        self.project().tx.poll_ready_unpin(cx).map_err(|_| Disconnected)
    }

    fn start_send(self: Pin<&mut Self>, item: SinkItem) -> Result<(), Disconnected> {
        self.project().tx.start_send_unpin(item).map_err(|_| Disconnected)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Disconnected>> {
        self.project().tx.poll_flush_unpin(cx).map_err(|_| Disconnected)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Disconnected>> {
        self.project().tx.poll_close_unpin(cx).map_err(|_| Disconnected)
    }
}
