//! UDP multicast transport: join the mDNS group on every usable interface,
//! decode inbound datagrams, and serialize outbound sends through one
//! channel per the concurrency model in spec §5 (single logical stream in,
//! one send loop out).

use std::collections::HashSet;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::sync::Arc;

use anyhow::{Context, Result};
use socket2::{Domain, Protocol as SockProtocol, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

use crate::record::ResourceRecord;
use crate::wire::{self, InboundQuery, InboundResponse, Message};

pub const MDNS_PORT: u16 = 5353;
const MDNS_GROUP_V4: &str = "224.0.0.251";
const MDNS_GROUP_V6: &str = "ff02::fb";

/// Top-level multicast/port/unicast configuration (spec §6's options table).
#[derive(Debug, Clone)]
pub struct Config {
    pub ip: Option<std::net::IpAddr>,
    pub port: u16,
    pub multicast: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config { ip: None, port: MDNS_PORT, multicast: true }
    }
}

/// Events the transport hands upward: inbound query or response packets.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Query(InboundQuery),
    Response(InboundResponse),
}

/// The interface the core programs against (spec §6): send one question,
/// send one response, observe inbound traffic via a channel of [`TransportEvent`].
pub trait Transport: Send + Sync {
    fn query(&self, name: &str, qtype: u16) -> Result<()>;
    fn respond(&self, answers: &[ResourceRecord], additionals: &[ResourceRecord]) -> Result<()>;
}

enum SendCommand {
    Query(Vec<u8>),
    Response(Vec<u8>),
}

struct McastSocket {
    sock: Arc<UdpSocket>,
    group: SocketAddr,
}

/// Concrete multicast (or unicast, for tests) UDP transport.
pub struct UdpTransport {
    send_tx: UnboundedSender<SendCommand>,
    cancel: CancellationToken,
}

impl Transport for UdpTransport {
    fn query(&self, name: &str, qtype: u16) -> Result<()> {
        let pkt = wire::encode_query(name, qtype)?;
        self.send_tx
            .send(SendCommand::Query(pkt))
            .map_err(|_| anyhow::anyhow!("transport send loop has shut down"))
    }

    fn respond(&self, answers: &[ResourceRecord], additionals: &[ResourceRecord]) -> Result<()> {
        let answers: Vec<_> = answers.iter().map(|r| r.to_raw()).collect::<Result<_>>()?;
        let additionals: Vec<_> = additionals.iter().map(|r| r.to_raw()).collect::<Result<_>>()?;
        let pkt = wire::encode_response(&answers, &additionals)?;
        self.send_tx
            .send(SendCommand::Response(pkt))
            .map_err(|_| anyhow::anyhow!("transport send loop has shut down"))
    }
}

impl UdpTransport {
    pub async fn new(config: Config) -> Result<(Arc<Self>, UnboundedReceiver<TransportEvent>)> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (send_tx, send_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let sockets = if config.multicast {
            bind_multicast_sockets(config.port).await?
        } else {
            bind_unicast_socket(config.ip, config.port).await?
        };
        anyhow::ensure!(!sockets.is_empty(), "no usable sockets for mDNS transport");

        for ms in &sockets {
            let sock = ms.sock.clone();
            let event_tx = event_tx.clone();
            let cancel = cancel.child_token();
            tokio::spawn(async move {
                recv_loop(sock, event_tx, cancel).await;
            });
        }

        {
            let cancel = cancel.child_token();
            tokio::spawn(async move {
                send_loop(sockets, send_rx, cancel).await;
            });
        }

        Ok((Arc::new(UdpTransport { send_tx, cancel }), event_rx))
    }

    /// Stop the recv/send background tasks. Idempotent.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn bind_multicast_sockets(port: u16) -> Result<Vec<McastSocket>> {
    let mut sockets = Vec::new();

    match create_multicast_socket_v4(port) {
        Ok(std_sock) => {
            let sock = UdpSocket::from_std(std_sock).context("wrapping v4 mDNS socket")?;
            sockets.push(McastSocket {
                sock: Arc::new(sock),
                group: SocketAddr::new(MDNS_GROUP_V4.parse().unwrap(), port),
            });
        }
        Err(e) => log::warn!("mdnssd: failed to create v4 multicast socket: {}", e),
    }

    if let Ok(ifaces) = if_addrs::get_if_addrs() {
        let mut seen = HashSet::new();
        for iface in ifaces {
            if !iface.ip().is_ipv6() {
                continue;
            }
            let Some(idx) = iface.index else { continue };
            if !seen.insert(idx) {
                continue;
            }
            match create_multicast_socket_v6(idx, port) {
                Ok(std_sock) => match UdpSocket::from_std(std_sock) {
                    Ok(sock) => sockets.push(McastSocket {
                        sock: Arc::new(sock),
                        group: SocketAddr::new(MDNS_GROUP_V6.parse().unwrap(), port),
                    }),
                    Err(e) => log::debug!("mdnssd: failed to wrap v6 socket idx={}: {}", idx, e),
                },
                Err(e) => log::debug!("mdnssd: failed to create v6 socket idx={}: {}", idx, e),
            }
        }
    }

    Ok(sockets)
}

async fn bind_unicast_socket(ip: Option<std::net::IpAddr>, port: u16) -> Result<Vec<McastSocket>> {
    let addr = SocketAddr::new(ip.unwrap_or(std::net::IpAddr::V4(Ipv4Addr::UNSPECIFIED)), port);
    let sock = UdpSocket::bind(addr).await.context("binding unicast transport socket")?;
    let group = sock.local_addr()?;
    Ok(vec![McastSocket { sock: Arc::new(sock), group }])
}

fn create_multicast_socket_v4(port: u16) -> Result<std::net::UdpSocket> {
    let sock = socket2::Socket::new(Domain::IPV4, Type::DGRAM, Some(SockProtocol::UDP))?;
    sock.set_reuse_address(true)?;
    #[cfg(not(target_os = "windows"))]
    sock.set_reuse_port(true)?;
    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    sock.bind(&socket2::SockAddr::from(bind_addr))?;
    let group: Ipv4Addr = MDNS_GROUP_V4.parse()?;
    sock.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    sock.set_multicast_loop_v4(true)?;
    sock.set_nonblocking(true)?;
    Ok(sock.into())
}

fn create_multicast_socket_v6(interface: u32, port: u16) -> Result<std::net::UdpSocket> {
    let sock = socket2::Socket::new(Domain::IPV6, Type::DGRAM, Some(SockProtocol::UDP))?;
    sock.set_reuse_address(true)?;
    #[cfg(not(target_os = "windows"))]
    sock.set_reuse_port(true)?;
    let bind_addr = SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0);
    sock.bind(&socket2::SockAddr::from(bind_addr))?;
    let group: Ipv6Addr = MDNS_GROUP_V6.parse()?;
    sock.join_multicast_v6(&group, interface)?;
    sock.set_multicast_if_v6(interface)?;
    sock.set_multicast_loop_v6(true)?;
    sock.set_nonblocking(true)?;
    Ok(sock.into())
}

async fn recv_loop(sock: Arc<UdpSocket>, event_tx: UnboundedSender<TransportEvent>, cancel: CancellationToken) {
    let mut buf = vec![0u8; 9000];
    loop {
        let (n, addr) = tokio::select! {
            result = sock.recv_from(&mut buf) => {
                match result {
                    Ok(v) => v,
                    Err(e) => {
                        log::debug!("mdnssd: recv error: {}", e);
                        continue;
                    }
                }
            }
            _ = cancel.cancelled() => return,
        };

        let msg = match wire::decode_message(&buf[..n]) {
            Ok(m) => m,
            Err(e) => {
                log::trace!("mdnssd: failed to decode packet from {}: {:?}", addr, e);
                continue;
            }
        };

        if dispatch(msg, addr, &event_tx).is_err() {
            return;
        }
    }
}

fn dispatch(msg: Message, addr: SocketAddr, event_tx: &UnboundedSender<TransportEvent>) -> Result<(), ()> {
    let event = if msg.is_response() {
        TransportEvent::Response(InboundResponse { message: msg, referer: addr.into() })
    } else {
        TransportEvent::Query(InboundQuery { message: msg, source: addr })
    };
    event_tx.send(event).map_err(|_| ())
}

async fn send_loop(sockets: Vec<McastSocket>, mut rx: UnboundedReceiver<SendCommand>, cancel: CancellationToken) {
    loop {
        let cmd = tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(c) => c,
                None => return,
            },
            _ = cancel.cancelled() => return,
        };

        let data = match &cmd {
            SendCommand::Query(d) | SendCommand::Response(d) => d,
        };
        for ms in &sockets {
            if let Err(e) = ms.sock.send_to(data, ms.group).await {
                log::debug!("mdnssd: send to {} failed: {}", ms.group, e);
            }
        }
    }
}
