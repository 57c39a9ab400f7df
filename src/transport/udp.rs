//! UDP associations relayed through worker tunnels.
//!
//! Each destination inside an association gets its own sub-stream, and each
//! datagram travels as one frame, so datagram boundaries survive the tunnel.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::copy::Activity;
use super::request::{ClientHandle, ConnectRequest, DatagramChannel};
use super::Transport;
use crate::error::{Error, ReplyCode, Result};
use crate::tunnel::{StreamKind, SubStreamSender, TargetAddr};

impl Transport {
    /// Serve a UDP ASSOCIATE request through the worker.
    ///
    /// The association ends when the client's control connection closes, the
    /// request is cancelled, or no datagram moved for the UDP idle timeout.
    pub async fn handle_udp(
        &self,
        cancel: &CancellationToken,
        request: ConnectRequest,
    ) -> Result<()> {
        let ConnectRequest {
            client_addr,
            client,
            ..
        } = request;

        let pending = match client {
            ClientHandle::Datagram(pending) => pending,
            other => {
                let _ = other.reply_failure(ReplyCode::CommandNotSupported).await;
                return Err(Error::Unsupported("stream request on a datagram route".into()));
            }
        };
        if self.registry.is_none() {
            let _ = pending.reply_failure(ReplyCode::CommandNotSupported).await;
            return Err(Error::Unsupported("UDP needs relay egress".into()));
        }

        let channel: Arc<dyn DatagramChannel> = Arc::from(pending.reply_success().await?);
        self.metrics.increment_relayed();
        tracing::debug!("UDP association for {}", client_addr);

        let activity = Arc::new(Activity::new());
        let mut flows: HashMap<TargetAddr, SubStreamSender> = HashMap::new();
        let mut readers = JoinSet::new();

        let result = loop {
            let next = tokio::select! {
                next = channel.recv() => next,
                _ = activity.idle(self.config.udp_link_idle_timeout) => {
                    tracing::debug!("UDP association for {} idle", client_addr);
                    break Ok(());
                }
                _ = cancel.cancelled() => break Ok(()),
            };

            let (destination, datagram) = match next {
                Ok(Some(d)) => d,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            };
            activity.touch();

            if !flows.contains_key(&destination) {
                let key = self.session.tunnel_key(client_addr.ip(), &destination);
                let stream = match self.open_relay(&key, StreamKind::Udp, &destination).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        // Datagrams are best effort; drop this one
                        tracing::debug!("UDP flow to {} failed: {}", destination, e);
                        self.metrics.record_failure(&e);
                        continue;
                    }
                };
                let (sender, mut receiver) = stream.split();

                let channel = Arc::clone(&channel);
                let activity = Arc::clone(&activity);
                let metrics = Arc::clone(&self.metrics);
                let source = destination.clone();
                readers.spawn(async move {
                    loop {
                        match receiver.recv().await {
                            Ok(Some(reply)) => {
                                activity.touch();
                                metrics.add_bytes_down(reply.len() as u64);
                                if let Err(e) = channel.send(&source, &reply).await {
                                    tracing::debug!("UDP reply to client failed: {}", e);
                                    break;
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                tracing::debug!("UDP flow from {} ended: {}", source, e);
                                break;
                            }
                        }
                    }
                });
                flows.insert(destination.clone(), sender);
            }

            if let Some(flow) = flows.get(&destination) {
                match flow.send(&datagram).await {
                    Ok(()) => self.metrics.add_bytes_up(datagram.len() as u64),
                    Err(e) => {
                        tracing::debug!("UDP flow to {} failed: {}", destination, e);
                        if e.is_tunnel_failure() {
                            let key = self.session.tunnel_key(client_addr.ip(), &destination);
                            self.drop_failed_tunnel(&key, flow.tunnel());
                        }
                        flows.remove(&destination);
                    }
                }
            }
        };

        readers.abort_all();
        result
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::UdpSocket;

    use super::super::request::testing::associate_request;
    use super::super::TransportConfig;
    use super::*;
    use crate::dialer::{Dialer, DialerConfig};
    use crate::fragment::FragmentConfig;
    use crate::resolve::{HostsMap, LocalResolver, Resolver};
    use crate::tunnel::testing::LocalWorker;
    use crate::tunnel::{ClientSession, RegistryConfig, TunnelRegistry};

    fn transport(registry: Option<Arc<TunnelRegistry>>, udp_idle: Duration) -> Transport {
        let resolver = Resolver::new(
            LocalResolver::new(Arc::new(HostsMap::new())),
            Duration::from_secs(30),
            Arc::new(LocalResolver::default()),
        );
        let transport = Transport::new(
            Dialer::new(DialerConfig::default()).unwrap(),
            Arc::new(resolver),
            FragmentConfig::disabled(),
            ClientSession::from_parts("00000001", "tstcli"),
            TransportConfig {
                udp_link_idle_timeout: udp_idle,
                ..Default::default()
            },
        );
        match registry {
            Some(r) => transport.with_registry(r),
            None => transport,
        }
    }

    async fn udp_echo() -> TargetAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
                let _ = socket.send_to(&buf[..n], peer).await;
            }
        });
        TargetAddr::Ip(addr)
    }

    #[tokio::test]
    async fn test_associate_relays_datagrams() {
        let worker = Arc::new(LocalWorker::default());
        let registry = TunnelRegistry::new(worker.clone(), RegistryConfig::default());
        let transport = transport(Some(Arc::clone(&registry)), Duration::from_secs(30));
        let echo = udp_echo().await;

        let (request, to_router, mut from_router) = associate_request();
        let serve = tokio::spawn(async move {
            transport
                .handle_udp(&CancellationToken::new(), request)
                .await
        });

        to_router.send((echo.clone(), b"first".to_vec())).await.unwrap();
        let reply = from_router.recv().await.unwrap();
        assert_eq!(reply, (echo.clone(), b"first".to_vec()));
        to_router.send((echo.clone(), b"2nd".to_vec())).await.unwrap();
        let reply = from_router.recv().await.unwrap();
        assert_eq!(reply, (echo.clone(), b"2nd".to_vec()));

        // One destination, one tunnel
        assert_eq!(worker.dials(), 1);

        drop(to_router);
        serve.await.unwrap().unwrap();
    }

    /// One association carrying a single echoed datagram.
    async fn exchange(transport: &Transport, echo: &TargetAddr, payload: &[u8]) {
        let (request, to_router, mut from_router) = associate_request();
        let cancel = CancellationToken::new();
        let destination = echo.clone();
        let payload = payload.to_vec();

        let client = async move {
            to_router
                .send((destination.clone(), payload.clone()))
                .await
                .unwrap();
            let reply = from_router.recv().await.unwrap();
            assert_eq!(reply, (destination, payload));
        };
        let (served, ()) = tokio::join!(transport.handle_udp(&cancel, request), client);
        served.unwrap();
    }

    #[tokio::test]
    async fn test_associations_share_tunnel_until_idle() {
        let worker = Arc::new(LocalWorker::default());
        let registry = TunnelRegistry::new(
            worker.clone(),
            RegistryConfig {
                link_idle_timeout: Duration::from_millis(300),
                ..Default::default()
            },
        );
        let transport = transport(Some(registry), Duration::from_secs(30));
        let echo = udp_echo().await;

        exchange(&transport, &echo, b"one").await;
        exchange(&transport, &echo, b"two").await;
        assert_eq!(worker.dials(), 1);

        tokio::time::sleep(Duration::from_millis(700)).await;
        exchange(&transport, &echo, b"three").await;
        assert_eq!(worker.dials(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_association_closes_when_idle() {
        let worker = Arc::new(LocalWorker::default());
        let registry = TunnelRegistry::new(worker.clone(), RegistryConfig::default());
        let transport = transport(Some(registry), Duration::from_secs(5));

        let (request, _to_router, _from_router) = associate_request();
        let started = tokio::time::Instant::now();
        transport
            .handle_udp(&CancellationToken::new(), request)
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_associate_without_relay_is_rejected() {
        let transport = transport(None, Duration::from_secs(5));
        let (request, _to_router, _from_router) = associate_request();

        let err = transport
            .handle_udp(&CancellationToken::new(), request)
            .await
            .unwrap_err();
        assert_eq!(err.reply_code(), ReplyCode::CommandNotSupported);
    }
}
