use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use tokio::net::UdpSocket;
use tracing::{error, trace};

use crate::control::config::ControlConfig;
use crate::control::dispatcher::{CommandDispatcher, ReplySender};


/// Biggest accepted control datagram. Offer/answer payloads carry whole SDP bodies, so this
///  is far above typical MTU; callers are expected to deal with IP fragmentation.
const MAX_DATAGRAM_SIZE: usize = 65536;

/// Binds the control endpoint(s) and feeds every received datagram to one shared
///  [CommandDispatcher]. A wildcard listen address gets a second socket for the other
///  address family; failure to bind either socket is fatal to startup.
pub struct ControlListener {
    sockets: Vec<Arc<UdpSocket>>,
    dispatcher: Arc<CommandDispatcher>,
}

impl ControlListener {
    pub async fn bind(config: &ControlConfig, dispatcher: Arc<CommandDispatcher>) -> anyhow::Result<ControlListener> {
        let mut sockets = Vec::new();
        sockets.push(Arc::new(UdpSocket::bind(config.listen_addr).await?));

        if let Some(second_addr) = other_family_wildcard(config.listen_addr) {
            sockets.push(Arc::new(UdpSocket::bind(second_addr).await?));
        }

        Ok(ControlListener {
            sockets,
            dispatcher,
        })
    }

    /// the actually bound addresses; relevant when binding port 0
    pub fn local_addrs(&self) -> anyhow::Result<Vec<SocketAddr>> {
        self.sockets.iter()
            .map(|socket| Ok(socket.local_addr()?))
            .collect()
    }

    /// Runs the receive loop(s) until the enclosing task is dropped. Socket-level receive
    ///  errors are logged and the loop keeps going.
    pub async fn run(&self) {
        match self.sockets.as_slice() {
            [single] => self.recv_loop(single).await,
            [first, second] => {
                tokio::join!(self.recv_loop(first), self.recv_loop(second));
            }
            _ => {}
        }
    }

    async fn recv_loop(&self, socket: &Arc<UdpSocket>) {
        let sender = SocketReplySender {
            socket: socket.clone(),
        };
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, from)) => {
                    trace!("received {} bytes on the control port from {}", len, from);
                    self.dispatcher.handle_packet(&buf[..len], from, &sender).await;
                }
                Err(e) => {
                    error!("error receiving from control socket: {}", e);
                }
            }
        }
    }
}

/// replies leave through the same socket the request arrived on
struct SocketReplySender {
    socket: Arc<UdpSocket>,
}

#[async_trait]
impl ReplySender for SocketReplySender {
    async fn send_reply(&self, to: SocketAddr, cookie: &[u8], payload: &[u8]) -> anyhow::Result<()> {
        let mut buf = BytesMut::with_capacity(cookie.len() + 1 + payload.len());
        buf.put_slice(cookie);
        buf.put_u8(b' ');
        buf.put_slice(payload);

        self.socket.send_to(&buf, to).await?;
        Ok(())
    }
}

/// For a wildcard address, the same port in the other address family; `None` for anything
///  that is not a wildcard.
fn other_family_wildcard(addr: SocketAddr) -> Option<SocketAddr> {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() =>
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), addr.port())),
        IpAddr::V6(ip) if ip.is_unspecified() =>
            Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), addr.port())),
        _ => None,
    }
}


#[cfg(test)]
mod test {
    use std::str::FromStr;
    use std::time::Duration;

    use rstest::rstest;

    use crate::control::cookie_cache::CookieCache;
    use crate::control::dispatcher::MockSessionBackend;
    use crate::control::stats::{IntervalStats, PeerStatsTable};

    use super::*;

    #[rstest]
    #[case::v4_wildcard("0.0.0.0:2223", Some("[::]:2223"))]
    #[case::v6_wildcard("[::]:2223", Some("0.0.0.0:2223"))]
    #[case::v4_concrete("127.0.0.1:2223", None)]
    #[case::v6_concrete("[::1]:2223", None)]
    fn test_other_family_wildcard(#[case] addr: &str, #[case] expected: Option<&str>) {
        let addr = SocketAddr::from_str(addr).unwrap();
        let expected = expected.map(|e| SocketAddr::from_str(e).unwrap());
        assert_eq!(other_family_wildcard(addr), expected);
    }

    fn dispatcher(backend: MockSessionBackend) -> (Arc<CommandDispatcher>, Arc<PeerStatsTable>) {
        let peer_stats = Arc::new(PeerStatsTable::new());
        let dispatcher = Arc::new(CommandDispatcher::new(
            Arc::new(backend),
            Arc::new(CookieCache::new()),
            peer_stats.clone(),
            Arc::new(IntervalStats::new()),
        ));
        (dispatcher, peer_stats)
    }

    #[tokio::test]
    async fn test_concrete_address_binds_one_socket() {
        let (dispatcher, _) = dispatcher(MockSessionBackend::new());
        let config = ControlConfig::new(SocketAddr::from_str("127.0.0.1:0").unwrap());

        let listener = ControlListener::bind(&config, dispatcher).await.unwrap();
        let addrs = listener.local_addrs().unwrap();
        assert_eq!(addrs.len(), 1);
        assert!(addrs[0].is_ipv4());
    }

    #[tokio::test]
    async fn test_wildcard_address_binds_both_families() {
        let (dispatcher, _) = dispatcher(MockSessionBackend::new());
        let config = ControlConfig::new(SocketAddr::from_str("0.0.0.0:0").unwrap());

        let listener = ControlListener::bind(&config, dispatcher).await.unwrap();
        let addrs = listener.local_addrs().unwrap();
        assert_eq!(addrs.len(), 2);
        assert!(addrs[0].is_ipv4());
        assert!(addrs[1].is_ipv6());
    }

    #[tokio::test]
    async fn test_ping_end_to_end_with_duplicate() {
        let (dispatcher, peer_stats) = dispatcher(MockSessionBackend::new());
        let config = ControlConfig::new(SocketAddr::from_str("127.0.0.1:0").unwrap());

        let listener = Arc::new(ControlListener::bind(&config, dispatcher).await.unwrap());
        let listen_addr = listener.local_addrs().unwrap()[0];
        let _server = tokio::spawn({
            let listener = listener.clone();
            async move { listener.run().await }
        });

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut buf = [0u8; 1024];

        client.send_to(b"AB12 d7:command4:pinge", listen_addr).await.unwrap();
        let (len, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await.unwrap().unwrap();
        assert_eq!(&buf[..len], b"AB12 d6:result4:ponge");

        // the identical datagram again: identical reply bytes, no second count
        client.send_to(b"AB12 d7:command4:pinge", listen_addr).await.unwrap();
        let (len, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await.unwrap().unwrap();
        assert_eq!(&buf[..len], b"AB12 d6:result4:ponge");

        let peer = peer_stats.get(client.local_addr().unwrap()).await.unwrap();
        assert_eq!(peer.ping.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_datagram_without_cookie_gets_no_reply() {
        let (dispatcher, _) = dispatcher(MockSessionBackend::new());
        let config = ControlConfig::new(SocketAddr::from_str("127.0.0.1:0").unwrap());

        let listener = Arc::new(ControlListener::bind(&config, dispatcher).await.unwrap());
        let listen_addr = listener.local_addrs().unwrap()[0];
        let _server = tokio::spawn({
            let listener = listener.clone();
            async move { listener.run().await }
        });

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"d7:command4:pinge", listen_addr).await.unwrap();

        let mut buf = [0u8; 1024];
        let result = tokio::time::timeout(Duration::from_millis(200), client.recv_from(&mut buf)).await;
        assert!(result.is_err(), "expected silence for a datagram without a cookie");
    }
}
