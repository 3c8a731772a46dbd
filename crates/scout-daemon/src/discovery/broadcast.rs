//! Subnet broadcast handshake.
//!
//! A starting node sends one HELLO to the broadcast address and listens on the
//! same socket. The leader answers any HELLO with a unicast HELLO_REPLY that
//! carries its IP; the newcomer joins through that IP. If nothing useful
//! arrives within the reply window the node promotes itself. A join that
//! started inside the window is always waited out, and only its gossip step
//! decides the outcome. The listener keeps running after that, so once this
//! node leads it answers later nodes.

use super::{DiscoveryOutcome, DiscoveryRun};
use crate::coordinator::ClusterJoiner;
use ipnet::IpNet;
use scout_core::{ClusterError, Consensus, Packet, PacketHeader};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Receive buffer; comfortably above the codec's packet limit.
const RECV_BUFFER: usize = 4096;

/// Where HELLO goes: the directed broadcast of `network`, or the limited
/// broadcast address when no IPv4 network is configured.
pub fn broadcast_address(network: Option<IpNet>) -> IpAddr {
    match network {
        Some(IpNet::V4(net)) => IpAddr::V4(net.broadcast()),
        Some(IpNet::V6(net)) => {
            warn!("IPv6 network {} has no broadcast address, using limited broadcast", net);
            IpAddr::V4(Ipv4Addr::BROADCAST)
        }
        None => IpAddr::V4(Ipv4Addr::BROADCAST),
    }
}

pub struct BroadcastDiscovery {
    local_ip: IpAddr,
    bind: SocketAddr,
    target: SocketAddr,
    reply_window: Duration,
    consensus: Arc<dyn Consensus>,
    joiner: Arc<ClusterJoiner>,
}

impl BroadcastDiscovery {
    pub fn new(
        local_ip: IpAddr,
        port: u16,
        network: Option<IpNet>,
        reply_window: Duration,
        consensus: Arc<dyn Consensus>,
        joiner: Arc<ClusterJoiner>,
    ) -> Self {
        Self {
            local_ip,
            bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
            target: SocketAddr::new(broadcast_address(network), port),
            reply_window,
            consensus,
            joiner,
        }
    }

    /// Override where the socket binds and where HELLO is sent.
    pub fn with_addresses(mut self, bind: SocketAddr, target: SocketAddr) -> Self {
        self.bind = bind;
        self.target = target;
        self
    }

    /// Bind the discovery socket.
    pub async fn bind(self) -> scout_core::Result<BoundBroadcast> {
        let socket = UdpSocket::bind(self.bind)
            .await
            .map_err(|e| ClusterError::Bind(format!("discovery {}: {}", self.bind, e)))?;
        socket
            .set_broadcast(true)
            .map_err(|e| ClusterError::Bind(format!("discovery broadcast flag: {}", e)))?;
        Ok(BoundBroadcast {
            socket,
            discovery: self,
        })
    }

    pub async fn run(self, shutdown: watch::Receiver<bool>) -> scout_core::Result<DiscoveryRun> {
        Ok(self.bind().await?.run(shutdown).await)
    }
}

/// Discovery with its socket bound, ready to run.
pub struct BoundBroadcast {
    socket: UdpSocket,
    discovery: BroadcastDiscovery,
}

impl BoundBroadcast {
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }

    /// Send HELLO, start the listener, and wait out the reply window.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> DiscoveryRun {
        let BoundBroadcast { socket, discovery } = self;
        send_packet(&socket, &Packet::hello(), discovery.target).await;
        info!("Sent HELLO to {}", discovery.target);

        let (results_tx, mut results_rx) = mpsc::channel(4);
        let listener = Listener {
            socket,
            local_ip: discovery.local_ip,
            consensus: discovery.consensus,
            joiner: discovery.joiner,
            joined: false,
            results: results_tx,
        };
        let handle = tokio::spawn(listener.run(shutdown));

        let deadline = tokio::time::Instant::now() + discovery.reply_window;
        let mut joining = None;
        let mut last_failure = None;
        let outcome = loop {
            let next = if joining.is_some() {
                Ok(results_rx.recv().await)
            } else {
                tokio::time::timeout_at(deadline, results_rx.recv()).await
            };
            match next {
                Ok(Some(JoinProgress::Started(remote))) => joining = Some(remote),
                Ok(Some(JoinProgress::Finished(remote, Ok(())))) => {
                    break DiscoveryOutcome::Joined(remote);
                }
                Ok(Some(JoinProgress::Finished(remote, Err(error)))) => {
                    joining = None;
                    last_failure = Some((remote, error));
                }
                Ok(None) | Err(_) => {
                    break match last_failure.take() {
                        Some((remote, error)) => DiscoveryOutcome::JoinFailed { remote, error },
                        None => DiscoveryOutcome::Promoted,
                    };
                }
            }
        };
        // Closing the channel tells the listener discovery is settled
        drop(results_rx);

        match &outcome {
            DiscoveryOutcome::Joined(remote) => info!("Joined cluster through {}", remote),
            DiscoveryOutcome::JoinFailed { remote, error } => {
                error!("Found cluster at {} but could not join: {}", remote, error)
            }
            DiscoveryOutcome::Promoted => info!(
                "No HELLO_REPLY within {:?}, promoting self",
                discovery.reply_window
            ),
        }

        DiscoveryRun {
            outcome,
            listener: Some(handle),
        }
    }
}

async fn send_packet(socket: &UdpSocket, packet: &Packet, to: SocketAddr) {
    let bytes = match packet.encode() {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("Failed to encode {:?}: {}", packet.header, e);
            return;
        }
    };
    if let Err(e) = socket.send_to(&bytes, to).await {
        warn!("Failed to send {:?} to {}: {}", packet.header, to, e);
    }
}

struct Listener {
    socket: UdpSocket,
    local_ip: IpAddr,
    consensus: Arc<dyn Consensus>,
    joiner: Arc<ClusterJoiner>,
    joined: bool,
    results: mpsc::Sender<JoinProgress>,
}

/// What the listener tells a waiting `run` about a join.
#[derive(Debug)]
enum JoinProgress {
    Started(IpAddr),
    Finished(IpAddr, scout_core::Result<()>),
}

impl Listener {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut buf = vec![0u8; RECV_BUFFER];
        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => match result {
                    Ok((len, from)) => self.on_datagram(&buf[..len], from).await,
                    Err(e) => warn!("Discovery receive error: {}", e),
                },
                _ = shutdown.changed() => break,
            }
        }
        debug!("Discovery listener stopped");
    }

    async fn on_datagram(&mut self, bytes: &[u8], from: SocketAddr) {
        let packet = match Packet::decode(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Dropping discovery packet from {}: {}", from, e);
                return;
            }
        };

        match packet.header {
            PacketHeader::Hello => self.on_hello(from).await,
            PacketHeader::HelloReply => self.on_hello_reply(&packet, from).await,
        }
    }

    async fn on_hello(&self, from: SocketAddr) {
        if from.ip() == self.local_ip {
            return;
        }
        if !self.consensus.is_leader().await {
            debug!("Ignoring HELLO from {}, not the leader", from);
            return;
        }
        info!("Answering HELLO from {}", from);
        send_packet(&self.socket, &Packet::hello_reply(self.local_ip), from).await;
    }

    async fn on_hello_reply(&mut self, packet: &Packet, from: SocketAddr) {
        if self.joined || self.results.is_closed() {
            debug!("Ignoring HELLO_REPLY from {}, discovery settled", from);
            return;
        }
        let remote = match packet.reply_address() {
            Ok(remote) => remote,
            Err(e) => {
                warn!("Bad HELLO_REPLY from {}: {}", from, e);
                return;
            }
        };

        info!("Leader at {} answered, joining", remote);
        if !self.report(JoinProgress::Started(remote)).await {
            return;
        }
        let result = self.joiner.join_overlay(remote).await;
        match &result {
            Ok(()) => self.joined = true,
            Err(e) => warn!("Join through {} failed: {}", remote, e),
        }
        self.report(JoinProgress::Finished(remote, result)).await;

        if self.joined {
            self.joiner.add_to_data_service(remote).await;
        }
    }

    /// False when `run` has already settled and stopped listening.
    async fn report(&self, progress: JoinProgress) -> bool {
        match self.results.send(progress).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Discovery already settled, dropping {:?}", e.0);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scout_core::{
        ConsensusAddress, DataService, InMemoryConsensus, InMemoryDataService, InMemoryOverlay,
        Overlay,
    };

    const GOSSIP_PORT: u16 = 7946;
    const DATA_PORT: u16 = 8091;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    fn loopback() -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, 0))
    }

    /// Somewhere nobody listens.
    fn nowhere() -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, 9))
    }

    /// A fake whose every call takes `delay`.
    struct Delayed<T> {
        inner: T,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl<T: Overlay> Overlay for Delayed<T> {
        async fn join(&self, seeds: &[SocketAddr]) -> scout_core::Result<usize> {
            tokio::time::sleep(self.delay).await;
            self.inner.join(seeds).await
        }
    }

    #[async_trait::async_trait]
    impl<T: DataService> DataService for Delayed<T> {
        async fn add_node(&self, address: &str) -> scout_core::Result<()> {
            tokio::time::sleep(self.delay).await;
            self.inner.add_node(address).await
        }
    }

    struct Fixture {
        consensus: Arc<InMemoryConsensus>,
        overlay: InMemoryOverlay,
        data: InMemoryDataService,
        overlay_delay: Duration,
        data_delay: Duration,
    }

    impl Fixture {
        fn new(local: IpAddr, leader: bool) -> Self {
            let consensus = Arc::new(InMemoryConsensus::new(ConsensusAddress::new(local, 8300)));
            consensus.set_leader(leader);
            Self {
                consensus,
                overlay: InMemoryOverlay::new(),
                data: InMemoryDataService::new(),
                overlay_delay: Duration::ZERO,
                data_delay: Duration::ZERO,
            }
        }

        fn discovery(&self, local: IpAddr, window: Duration) -> BroadcastDiscovery {
            let overlay: Arc<dyn Overlay> = Arc::new(Delayed {
                inner: self.overlay.clone(),
                delay: self.overlay_delay,
            });
            let data: Arc<dyn DataService> = Arc::new(Delayed {
                inner: self.data.clone(),
                delay: self.data_delay,
            });
            let joiner = Arc::new(ClusterJoiner::new(overlay, data, GOSSIP_PORT, DATA_PORT));
            BroadcastDiscovery::new(local, 0, None, window, self.consensus.clone(), joiner)
        }
    }

    /// Start a node that has already given up on discovery and only listens.
    async fn listening(
        fixture: &Fixture,
        local: IpAddr,
        shutdown: watch::Receiver<bool>,
    ) -> SocketAddr {
        let bound = fixture
            .discovery(local, Duration::from_millis(20))
            .with_addresses(loopback(), nowhere())
            .bind()
            .await
            .unwrap();
        let addr = bound.local_addr().unwrap();
        let run = bound.run(shutdown).await;
        assert!(run.outcome.is_promoted());
        addr
    }

    // ==================== Broadcast address ====================

    #[test]
    fn test_broadcast_address_from_network() {
        let net: IpNet = "192.168.10.0/24".parse().unwrap();
        assert_eq!(
            broadcast_address(Some(net)),
            IpAddr::V4(Ipv4Addr::new(192, 168, 10, 255))
        );
    }

    #[test]
    fn test_broadcast_address_default() {
        assert_eq!(broadcast_address(None), IpAddr::V4(Ipv4Addr::BROADCAST));
    }

    // ==================== Handshake ====================

    #[tokio::test]
    async fn test_leader_reply_triggers_join() {
        let (_stop, shutdown) = watch::channel(false);
        let leader = Fixture::new(ip(1), true);
        let leader_addr = listening(&leader, ip(1), shutdown.clone()).await;

        let newcomer = Fixture::new(ip(2), false);
        let run = newcomer
            .discovery(ip(2), Duration::from_secs(3))
            .with_addresses(loopback(), leader_addr)
            .run(shutdown)
            .await
            .unwrap();

        assert!(matches!(run.outcome, DiscoveryOutcome::Joined(remote) if remote == ip(1)));
        assert_eq!(
            newcomer.overlay.seeds(),
            vec![SocketAddr::new(ip(1), GOSSIP_PORT)]
        );
        assert_eq!(newcomer.data.added(), vec!["10.0.0.1:8091"]);
        // The leader itself joined nobody
        assert!(leader.overlay.seeds().is_empty());
    }

    #[tokio::test]
    async fn test_follower_ignores_hello() {
        let (_stop, shutdown) = watch::channel(false);
        let follower = Fixture::new(ip(1), false);
        let follower_addr = listening(&follower, ip(1), shutdown.clone()).await;

        let newcomer = Fixture::new(ip(2), false);
        let run = newcomer
            .discovery(ip(2), Duration::from_millis(300))
            .with_addresses(loopback(), follower_addr)
            .run(shutdown)
            .await
            .unwrap();

        assert!(run.outcome.is_promoted());
        assert!(newcomer.overlay.seeds().is_empty());
    }

    #[tokio::test]
    async fn test_failed_join_is_reported_not_promoted() {
        let (_stop, shutdown) = watch::channel(false);
        let leader = Fixture::new(ip(1), true);
        let leader_addr = listening(&leader, ip(1), shutdown.clone()).await;

        let newcomer = Fixture::new(ip(2), false);
        newcomer.overlay.fail_joins(true);
        let run = newcomer
            .discovery(ip(2), Duration::from_millis(500))
            .with_addresses(loopback(), leader_addr)
            .run(shutdown)
            .await
            .unwrap();

        match run.outcome {
            DiscoveryOutcome::JoinFailed { remote, error } => {
                assert_eq!(remote, ip(1));
                assert!(matches!(error, ClusterError::Join(_)));
            }
            other => panic!("expected JoinFailed, got {:?}", other),
        }
        assert!(newcomer.data.added().is_empty());
    }

    #[tokio::test]
    async fn test_slow_data_service_does_not_turn_join_into_promotion() {
        let (_stop, shutdown) = watch::channel(false);
        let leader = Fixture::new(ip(1), true);
        let leader_addr = listening(&leader, ip(1), shutdown.clone()).await;

        let mut newcomer = Fixture::new(ip(2), false);
        newcomer.data_delay = Duration::from_millis(800);
        let run = newcomer
            .discovery(ip(2), Duration::from_millis(300))
            .with_addresses(loopback(), leader_addr)
            .run(shutdown)
            .await
            .unwrap();

        assert!(matches!(run.outcome, DiscoveryOutcome::Joined(remote) if remote == ip(1)));
        assert_eq!(
            newcomer.overlay.seeds(),
            vec![SocketAddr::new(ip(1), GOSSIP_PORT)]
        );

        // The data-service step still runs after the outcome is settled
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while newcomer.data.added().is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "data service never called");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(newcomer.data.added(), vec!["10.0.0.1:8091"]);
    }

    #[tokio::test]
    async fn test_join_started_inside_window_is_waited_out() {
        let (_stop, shutdown) = watch::channel(false);
        let leader = Fixture::new(ip(1), true);
        let leader_addr = listening(&leader, ip(1), shutdown.clone()).await;

        let mut newcomer = Fixture::new(ip(2), false);
        newcomer.overlay_delay = Duration::from_millis(800);
        let run = newcomer
            .discovery(ip(2), Duration::from_millis(300))
            .with_addresses(loopback(), leader_addr)
            .run(shutdown)
            .await
            .unwrap();

        assert!(matches!(run.outcome, DiscoveryOutcome::Joined(remote) if remote == ip(1)));
    }

    #[tokio::test]
    async fn test_malformed_packet_does_not_stop_listener() {
        let (_stop, shutdown) = watch::channel(false);
        let leader = Fixture::new(ip(1), true);
        let leader_addr = listening(&leader, ip(1), shutdown.clone()).await;

        let junk = UdpSocket::bind(loopback()).await.unwrap();
        junk.send_to(&[0xff, 0x00, 0x01], leader_addr).await.unwrap();

        let newcomer = Fixture::new(ip(2), false);
        let run = newcomer
            .discovery(ip(2), Duration::from_secs(3))
            .with_addresses(loopback(), leader_addr)
            .run(shutdown)
            .await
            .unwrap();
        assert!(matches!(run.outcome, DiscoveryOutcome::Joined(_)));
    }

    #[tokio::test]
    async fn test_listener_stops_on_shutdown() {
        let (stop, shutdown) = watch::channel(false);
        let node = Fixture::new(ip(1), false);
        let run = node
            .discovery(ip(1), Duration::from_millis(20))
            .with_addresses(loopback(), nowhere())
            .run(shutdown)
            .await
            .unwrap();

        stop.send(true).unwrap();
        let listener = run.listener.unwrap();
        tokio::time::timeout(Duration::from_secs(2), listener)
            .await
            .expect("listener did not stop")
            .unwrap();
    }
}
