//! Requests handed from the inbound listener to the router.

use std::fmt;
use std::net::SocketAddr;

use async_trait::async_trait;

use crate::error::{ReplyCode, Result};
use crate::tunnel::{BoxedIo, TargetAddr};

/// What the client asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// SOCKS5 CONNECT
    Connect,
    /// SOCKS4/4a CONNECT
    Socks4Connect,
    /// SOCKS5 UDP ASSOCIATE
    Associate,
}

/// A stream request that has not been answered yet.
#[async_trait]
pub trait PendingStream: Send {
    /// Send the success reply and hand over the client byte stream.
    async fn reply_success(self: Box<Self>, bound: SocketAddr) -> Result<BoxedIo>;

    /// Send a failure reply; the connection is closed afterwards.
    async fn reply_failure(self: Box<Self>, code: ReplyCode) -> Result<()>;
}

/// A UDP association that has not been answered yet.
#[async_trait]
pub trait PendingDatagram: Send {
    /// Send the success reply and start relaying client datagrams.
    async fn reply_success(self: Box<Self>) -> Result<Box<dyn DatagramChannel>>;

    /// Send a failure reply; the control connection is closed afterwards.
    async fn reply_failure(self: Box<Self>, code: ReplyCode) -> Result<()>;
}

/// Client side of an established UDP association.
#[async_trait]
pub trait DatagramChannel: Send + Sync {
    /// Next client datagram and its destination. `Ok(None)` once the
    /// association is over (control connection closed).
    async fn recv(&self) -> Result<Option<(TargetAddr, Vec<u8>)>>;

    /// Deliver `data` to the client as coming from `source`.
    async fn send(&self, source: &TargetAddr, data: &[u8]) -> Result<()>;
}

/// The client connection behind a request.
pub enum ClientHandle {
    /// CONNECT-style request
    Stream(Box<dyn PendingStream>),
    /// UDP ASSOCIATE request
    Datagram(Box<dyn PendingDatagram>),
}

impl ClientHandle {
    /// Answer with a failure, whatever the handle kind.
    pub async fn reply_failure(self, code: ReplyCode) -> Result<()> {
        match self {
            ClientHandle::Stream(s) => s.reply_failure(code).await,
            ClientHandle::Datagram(d) => d.reply_failure(code).await,
        }
    }
}

impl fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientHandle::Stream(_) => f.write_str("Stream"),
            ClientHandle::Datagram(_) => f.write_str("Datagram"),
        }
    }
}

/// A parsed client request.
#[derive(Debug)]
pub struct ConnectRequest {
    /// Requested destination
    pub destination: TargetAddr,
    /// Request kind
    pub command: Command,
    /// Peer address of the client
    pub client_addr: SocketAddr,
    /// Pending reply
    pub client: ClientHandle,
}

#[cfg(test)]
pub(crate) mod testing {
    use std::net::SocketAddr;
    use std::sync::Arc;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::io::DuplexStream;
    use tokio::sync::{mpsc, Mutex as AsyncMutex};

    use super::*;

    /// Outcome recorded by the mock pending handles.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Reply {
        Success,
        Failure(ReplyCode),
    }

    /// Pending stream backed by one end of an in-memory pipe.
    pub struct MockStream {
        pub io: DuplexStream,
        pub reply: Arc<Mutex<Option<Reply>>>,
    }

    #[async_trait]
    impl PendingStream for MockStream {
        async fn reply_success(self: Box<Self>, _bound: SocketAddr) -> Result<BoxedIo> {
            *self.reply.lock() = Some(Reply::Success);
            Ok(Box::new(self.io))
        }

        async fn reply_failure(self: Box<Self>, code: ReplyCode) -> Result<()> {
            *self.reply.lock() = Some(Reply::Failure(code));
            Ok(())
        }
    }

    /// Build a CONNECT request whose client is the returned pipe end.
    pub fn stream_request(
        destination: TargetAddr,
    ) -> (ConnectRequest, DuplexStream, Arc<Mutex<Option<Reply>>>) {
        let (client, ours) = tokio::io::duplex(64 * 1024);
        let reply = Arc::new(Mutex::new(None));
        let request = ConnectRequest {
            destination,
            command: Command::Connect,
            client_addr: "127.0.0.1:40000".parse().unwrap(),
            client: ClientHandle::Stream(Box::new(MockStream {
                io: ours,
                reply: Arc::clone(&reply),
            })),
        };
        (request, client, reply)
    }

    /// Datagram channel driven by the test through mpsc queues.
    pub struct MockDatagrams {
        pub inbound: AsyncMutex<mpsc::Receiver<(TargetAddr, Vec<u8>)>>,
        pub outbound: mpsc::Sender<(TargetAddr, Vec<u8>)>,
    }

    #[async_trait]
    impl DatagramChannel for MockDatagrams {
        async fn recv(&self) -> Result<Option<(TargetAddr, Vec<u8>)>> {
            Ok(self.inbound.lock().await.recv().await)
        }

        async fn send(&self, source: &TargetAddr, data: &[u8]) -> Result<()> {
            let _ = self.outbound.send((source.clone(), data.to_vec())).await;
            Ok(())
        }
    }

    pub struct MockAssociate {
        pub channel: MockDatagrams,
        pub reply: Arc<Mutex<Option<Reply>>>,
    }

    #[async_trait]
    impl PendingDatagram for MockAssociate {
        async fn reply_success(self: Box<Self>) -> Result<Box<dyn DatagramChannel>> {
            *self.reply.lock() = Some(Reply::Success);
            Ok(Box::new(self.channel))
        }

        async fn reply_failure(self: Box<Self>, code: ReplyCode) -> Result<()> {
            *self.reply.lock() = Some(Reply::Failure(code));
            Ok(())
        }
    }

    /// Build an ASSOCIATE request driven through the returned queues.
    pub fn associate_request() -> (
        ConnectRequest,
        mpsc::Sender<(TargetAddr, Vec<u8>)>,
        mpsc::Receiver<(TargetAddr, Vec<u8>)>,
    ) {
        let (to_router, inbound) = mpsc::channel(16);
        let (outbound, from_router) = mpsc::channel(16);
        let request = ConnectRequest {
            destination: TargetAddr::Ip("0.0.0.0:0".parse().unwrap()),
            command: Command::Associate,
            client_addr: "127.0.0.1:40001".parse().unwrap(),
            client: ClientHandle::Datagram(Box::new(MockAssociate {
                channel: MockDatagrams {
                    inbound: AsyncMutex::new(inbound),
                    outbound,
                },
                reply: Arc::new(Mutex::new(None)),
            })),
        };
        (request, to_router, from_router)
    }
}
