// Copyright 2019 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! A [`Transport`] that carries [`ClientMessage`](crate::ClientMessage)s and
//! [`ServerMessage`](crate::ServerMessage)s over any byte stream implementing `AsyncRead` and
//! `AsyncWrite`. Messages are length-delimited and serialized with any `tokio-serde` format.
//!
//! The frame format is independent of the [`Codec`](crate::Codec) used for payloads: a JSON
//! transport can carry bincode payloads and vice versa.

use crate::{ClientMessage, ServerMessage};
use futures::{prelude::*, task::*};
use pin_project::pin_project;
use serde::{Deserialize, Serialize};
use std::{error::Error, io, pin::Pin};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serde::{Deserializer, Framed as SerdeFramed, Serializer};
use tokio_util::codec::{length_delimited::LengthDelimitedCodec, Framed};

/// A transport that serializes to, and deserializes from, a byte stream.
#[pin_project]
pub struct Transport<S, Item, SinkItem, Format> {
    #[pin]
    inner: SerdeFramed<Framed<S, LengthDelimitedCodec>, Item, SinkItem, Format>,
}

impl<S, Item, SinkItem, Format> Transport<S, Item, SinkItem, Format> {
    /// Returns the byte stream over which messages are sent and received.
    pub fn get_ref(&self) -> &S {
        self.inner.get_ref().get_ref()
    }
}

fn io_error(e: impl Into<Box<dyn Error + Send + Sync>>) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}

impl<S, Item, SinkItem, Format, FormatError> Stream for Transport<S, Item, SinkItem, Format>
where
    S: AsyncWrite + AsyncRead,
    Item: for<'a> Deserialize<'a>,
    Format: Deserializer<Item>,
    FormatError: Into<Box<dyn Error + Send + Sync>>,
    SerdeFramed<Framed<S, LengthDelimitedCodec>, Item, SinkItem, Format>:
        Stream<Item = Result<Item, FormatError>>,
{
    type Item = io::Result<Item>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<io::Result<Item>>> {
        self.project().inner.poll_next(cx).map_err(io_error)
    }
}

impl<S, Item, SinkItem, Format, FormatError> Sink<SinkItem> for Transport<S, Item, SinkItem, Format>
where
    S: AsyncWrite,
    SinkItem: Serialize,
    Format: Serializer<SinkItem>,
    FormatError: Into<Box<dyn Error + Send + Sync>>,
    SerdeFramed<Framed<S, LengthDelimitedCodec>, Item, SinkItem, Format>:
        Sink<SinkItem, Error = FormatError>,
{
    type Error = io::Error;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_ready(cx).map_err(io_error)
    }

    fn start_send(self: Pin<&mut Self>, item: SinkItem) -> io::Result<()> {
        self.project().inner.start_send(item).map_err(io_error)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx).map_err(io_error)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_close(cx).map_err(io_error)
    }
}

/// Constructs a new transport from a framed byte stream and a serialization format.
pub fn new<S, Item, SinkItem, Format>(
    framed_io: Framed<S, LengthDelimitedCodec>,
    format: Format,
) -> Transport<S, Item, SinkItem, Format>
where
    S: AsyncWrite + AsyncRead,
    Item: for<'de> Deserialize<'de>,
    SinkItem: Serialize,
    Format: Serializer<SinkItem> + Deserializer<Item>,
{
    Transport {
        inner: SerdeFramed::new(framed_io, format),
    }
}

impl<S, Item, SinkItem, Format> From<(S, Format)> for Transport<S, Item, SinkItem, Format>
where
    S: AsyncWrite + AsyncRead,
    Item: for<'de> Deserialize<'de>,
    SinkItem: Serialize,
    Format: Serializer<SinkItem> + Deserializer<Item>,
{
    fn from((io, format): (S, Format)) -> Self {
        new(Framed::new(io, LengthDelimitedCodec::new()), format)
    }
}

/// The transport a client holds: it sends [`ClientMessage`]s and receives [`ServerMessage`]s.
pub type ClientTransport<S, Format> = Transport<S, ServerMessage, ClientMessage, Format>;

/// The transport a server holds for one connection.
pub type ServerTransport<S, Format> = Transport<S, ClientMessage, ServerMessage, Format>;

#[cfg(feature = "tcp")]
#[cfg_attr(docsrs, doc(cfg(feature = "tcp")))]
/// TCP support for the serde transport.
pub mod tcp {
    use super::*;
    use futures::ready;
    use std::{marker::PhantomData, net::SocketAddr};
    use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
    use tokio_util::codec::length_delimited;

    impl<Item, SinkItem, Format> Transport<TcpStream, Item, SinkItem, Format> {
        /// Returns the peer address of the underlying TcpStream.
        pub fn peer_addr(&self) -> io::Result<SocketAddr> {
            self.get_ref().peer_addr()
        }

        /// Returns the local address of the underlying TcpStream.
        pub fn local_addr(&self) -> io::Result<SocketAddr> {
            self.get_ref().local_addr()
        }
    }

    /// Connects to `addr`, wrapping the connection in a TCP transport.
    ///
    /// `max_frame_length` bounds the size of any one message in either direction.
    pub async fn connect<A, Item, SinkItem, Format>(
        addr: A,
        format: Format,
        max_frame_length: usize,
    ) -> io::Result<Transport<TcpStream, Item, SinkItem, Format>>
    where
        A: ToSocketAddrs,
        Item: for<'de> Deserialize<'de>,
        SinkItem: Serialize,
        Format: Serializer<SinkItem> + Deserializer<Item>,
    {
        let io = TcpStream::connect(addr).await?;
        io.set_nodelay(true)?;
        let framed = LengthDelimitedCodec::builder()
            .max_frame_length(max_frame_length)
            .new_framed(io);
        Ok(new(framed, format))
    }

    /// Listens on `addr`, wrapping accepted connections in TCP transports.
    pub async fn listen<A, Item, SinkItem, Format, FormatFn>(
        addr: A,
        format_fn: FormatFn,
    ) -> io::Result<Incoming<Item, SinkItem, Format, FormatFn>>
    where
        A: ToSocketAddrs,
        Item: for<'de> Deserialize<'de>,
        Format: Serializer<SinkItem> + Deserializer<Item>,
        FormatFn: Fn() -> Format,
    {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(Incoming {
            listener,
            format_fn,
            local_addr,
            config: LengthDelimitedCodec::builder(),
            ghost: PhantomData,
        })
    }

    /// A [`TcpListener`] that wraps connections in [transports](Transport).
    #[pin_project]
    #[derive(Debug)]
    pub struct Incoming<Item, SinkItem, Format, FormatFn> {
        listener: TcpListener,
        local_addr: SocketAddr,
        format_fn: FormatFn,
        config: length_delimited::Builder,
        ghost: PhantomData<(fn() -> Item, fn(SinkItem), Format)>,
    }

    impl<Item, SinkItem, Format, FormatFn> Incoming<Item, SinkItem, Format, FormatFn> {
        /// Returns the address being listened on.
        pub fn local_addr(&self) -> SocketAddr {
            self.local_addr
        }

        /// Returns a mutable reference to the length-delimited framing config applied to every
        /// accepted connection.
        pub fn config_mut(&mut self) -> &mut length_delimited::Builder {
            &mut self.config
        }
    }

    impl<Item, SinkItem, Format, FormatFn> Stream for Incoming<Item, SinkItem, Format, FormatFn>
    where
        Item: for<'de> Deserialize<'de>,
        SinkItem: Serialize,
        Format: Serializer<SinkItem> + Deserializer<Item>,
        FormatFn: Fn() -> Format,
    {
        type Item = io::Result<Transport<TcpStream, Item, SinkItem, Format>>;

        fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            let this = self.project();
            let (conn, peer) = ready!(this.listener.poll_accept(cx)?);
            tracing::debug!(%peer, "AcceptConnection");
            conn.set_nodelay(true)?;
            Poll::Ready(Some(Ok(new(
                this.config.new_framed(conn),
                (this.format_fn)(),
            ))))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Transport;
    use crate::{ClientMessage, Frame};
    use assert_matches::assert_matches;
    use futures::{task::*, Sink, Stream};
    use pin_utils::pin_mut;
    use std::{
        io::{self, Cursor},
        pin::Pin,
    };
    use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
    use tokio_serde::formats::{Bincode, SymmetricalJson};

    fn ctx() -> Context<'static> {
        Context::from_waker(noop_waker_ref())
    }

    struct TestIo(Cursor<Vec<u8>>);

    impl AsyncRead for TestIo {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            AsyncRead::poll_read(Pin::new(&mut self.0), cx, buf)
        }
    }

    impl AsyncWrite for TestIo {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            AsyncWrite::poll_write(Pin::new(&mut self.0), cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            AsyncWrite::poll_flush(Pin::new(&mut self.0), cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            AsyncWrite::poll_shutdown(Pin::new(&mut self.0), cx)
        }
    }

    #[test]
    fn reads_length_delimited_json() {
        let data: &[u8] = b"\x00\x00\x00\x18\"Test one, check check.\"";
        let transport = Transport::from((
            TestIo(Cursor::new(Vec::from(data))),
            SymmetricalJson::<String>::default(),
        ));
        pin_mut!(transport);

        assert_matches!(
            transport.as_mut().poll_next(&mut ctx()),
            Poll::Ready(Some(Ok(ref s))) if s == "Test one, check check.");
        assert_matches!(transport.as_mut().poll_next(&mut ctx()), Poll::Ready(None));
    }

    #[test]
    fn writes_length_delimited_json() {
        let mut transport = Box::pin(Transport::from((
            TestIo(Cursor::new(vec![])),
            SymmetricalJson::<String>::default(),
        )));

        assert_matches!(transport.as_mut().poll_ready(&mut ctx()), Poll::Ready(Ok(())));
        assert_matches!(
            transport.as_mut().start_send("Test one, check check.".into()),
            Ok(())
        );
        assert_matches!(transport.as_mut().poll_flush(&mut ctx()), Poll::Ready(Ok(())));
        assert_eq!(
            transport.get_ref().0.get_ref(),
            b"\x00\x00\x00\x18\"Test one, check check.\""
        );
    }

    #[test]
    fn garbage_is_an_io_error() {
        let data: &[u8] = b"\x00\x00\x00\x03abc";
        let transport = Transport::from((
            TestIo(Cursor::new(Vec::from(data))),
            Bincode::<ClientMessage, ClientMessage>::default(),
        ));
        pin_mut!(transport);
        assert_matches!(
            transport.as_mut().poll_next(&mut ctx()),
            Poll::Ready(Some(Err(e))) if e.kind() == io::ErrorKind::Other
        );
    }

    #[test]
    fn frames_survive_bincode() {
        let mut transport = Box::pin(Transport::from((
            TestIo(Cursor::new(vec![])),
            Bincode::<ClientMessage, ClientMessage>::default(),
        )));
        let message = ClientMessage::Frame {
            call_id: 3,
            frame: Frame {
                ordinal: 9,
                payload: None,
                terminal: true,
            },
        };
        assert_matches!(transport.as_mut().start_send(message), Ok(()));
        assert_matches!(transport.as_mut().poll_flush(&mut ctx()), Poll::Ready(Ok(())));

        let written = transport.get_ref().0.get_ref().clone();
        let reader = Transport::from((
            TestIo(Cursor::new(written)),
            Bincode::<ClientMessage, ClientMessage>::default(),
        ));
        pin_mut!(reader);
        assert_matches!(
            reader.as_mut().poll_next(&mut ctx()),
            Poll::Ready(Some(Ok(ClientMessage::Frame { call_id: 3, frame })))
                if frame.ordinal == 9 && frame.terminal && frame.payload.is_none()
        );
    }

    #[cfg(feature = "tcp")]
    #[tokio::test]
    async fn tcp() -> anyhow::Result<()> {
        use super::{tcp, ClientTransport, ServerTransport};
        use crate::{client, context, server, Json};
        use futures::prelude::*;

        let mut listener = tcp::listen("127.0.0.1:0", Bincode::default).await?;
        let addr = listener.local_addr();
        tokio::spawn(async move {
            let transport: ServerTransport<_, _> = listener.next().await.unwrap().unwrap();
            let service = server::Service::new(Json)
                .unary("Echo", |_ctx, message: String| async move { Ok(message) });
            server::BaseChannel::with_defaults(transport)
                .execute(service)
                .await;
        });

        let transport: ClientTransport<_, _> =
            tcp::connect(addr, Bincode::default(), 1 << 20).await?;
        let client = client::new(client::Config::default(), transport, Json).spawn();
        let echoed: String = client.unary(context::current(), "Echo", &"test").await?;
        assert_eq!(echoed, "test");
        Ok(())
    }
}
