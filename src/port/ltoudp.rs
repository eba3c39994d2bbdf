//! LocalTalk-over-UDP port
//!
//! LLAP frames ride UDP multicast: group 239.192.76.84, port 1954, each
//! payload tagged with a leading source-node byte. The tag lets a sender
//! recognize and discard its own transmissions coming back from the
//! group.

use crate::dataplane::Router;
use crate::port::localtalk::{LocalTalkLink, LocalTalkSeed};
use crate::port::{Port, PortState};
use crate::protocol::{Datagram, NetworkRange, ZoneName};
use crate::telemetry::PortStats;
use crate::{Error, Result};
use std::net::Ipv4Addr;
use std::os::unix::io::FromRawFd;
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// The LToUDP multicast group; the last two octets spell "LT".
const LTOUDP_GROUP: Ipv4Addr = Ipv4Addr::new(239, 192, 76, 84);
/// The LToUDP UDP port.
const LTOUDP_PORT: u16 = 1954;

/// Outbound frames queued toward the socket before we start dropping.
const LINK_QUEUE_DEPTH: usize = 64;

/// Largest UDP payload we will accept.
const RECV_BUFFER_SIZE: usize = 1024;

/// A LocalTalk port carried over UDP multicast.
pub struct LtoudpPort {
    link: Arc<LocalTalkLink>,
    interface_address: Ipv4Addr,
    frame_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    stats: Mutex<Option<Arc<PortStats>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LtoudpPort {
    /// Create an LToUDP port bound to the given local interface address
    /// (0.0.0.0 for all interfaces).
    pub fn new(interface_address: Ipv4Addr, seed: Option<LocalTalkSeed>) -> Arc<Self> {
        let label = if interface_address == Ipv4Addr::UNSPECIFIED {
            "LToUDP".to_string()
        } else {
            format!("LToUDP {}", interface_address)
        };
        let (frame_tx, frame_rx) = mpsc::channel(LINK_QUEUE_DEPTH);
        Arc::new(Self {
            link: Arc::new(LocalTalkLink::new(label, seed, 0xFE, true, frame_tx)),
            interface_address,
            frame_rx: Mutex::new(Some(frame_rx)),
            stats: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Open the multicast socket: reusable, joined to the LToUDP group,
    /// TTL 1, non-blocking.
    fn open_socket(&self) -> Result<std::net::UdpSocket> {
        unsafe {
            let fd = libc::socket(libc::AF_INET, libc::SOCK_DGRAM, libc::IPPROTO_UDP);
            if fd < 0 {
                return Err(Error::Io(std::io::Error::last_os_error()));
            }
            let close_on_error = |fd: i32, e: std::io::Error| -> Error {
                libc::close(fd);
                Error::Io(e)
            };

            let one: libc::c_int = 1;
            for option in [libc::SO_REUSEADDR, libc::SO_REUSEPORT] {
                if libc::setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    option,
                    &one as *const _ as *const libc::c_void,
                    std::mem::size_of::<libc::c_int>() as u32,
                ) < 0
                {
                    return Err(close_on_error(fd, std::io::Error::last_os_error()));
                }
            }

            let addr = libc::sockaddr_in {
                sin_family: libc::AF_INET as u16,
                sin_port: LTOUDP_PORT.to_be(),
                sin_addr: libc::in_addr { s_addr: 0 },
                sin_zero: [0; 8],
            };
            if libc::bind(
                fd,
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as u32,
            ) < 0
            {
                return Err(close_on_error(fd, std::io::Error::last_os_error()));
            }

            let mreq = libc::ip_mreq {
                imr_multiaddr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(LTOUDP_GROUP.octets()),
                },
                imr_interface: libc::in_addr {
                    s_addr: u32::from_ne_bytes(self.interface_address.octets()),
                },
            };
            if libc::setsockopt(
                fd,
                libc::IPPROTO_IP,
                libc::IP_ADD_MEMBERSHIP,
                &mreq as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::ip_mreq>() as u32,
            ) < 0
            {
                return Err(close_on_error(fd, std::io::Error::last_os_error()));
            }

            let ttl: libc::c_int = 1;
            if libc::setsockopt(
                fd,
                libc::IPPROTO_IP,
                libc::IP_MULTICAST_TTL,
                &ttl as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as u32,
            ) < 0
            {
                return Err(close_on_error(fd, std::io::Error::last_os_error()));
            }

            let flags = libc::fcntl(fd, libc::F_GETFL);
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);

            Ok(std::net::UdpSocket::from_raw_fd(fd))
        }
    }
}

impl Port for LtoudpPort {
    fn short_str(&self) -> String {
        self.link.label().to_string()
    }

    fn extended_network(&self) -> bool {
        false
    }

    fn network(&self) -> u16 {
        self.link.network()
    }

    fn node(&self) -> u8 {
        self.link.node()
    }

    fn network_range(&self) -> NetworkRange {
        self.link.network_range()
    }

    fn state(&self) -> PortState {
        self.link.port_state()
    }

    fn start(&self, router: Arc<Router>, handle: Arc<dyn Port>) -> Result<()> {
        let socket = self.open_socket()?;
        let socket = Arc::new(UdpSocket::from_std(socket)?);
        let stats = self.link.attach(router, handle);
        *self.stats.lock().unwrap() = Some(stats);

        let mut tasks = self.tasks.lock().unwrap();

        // read loop
        let link = Arc::clone(&self.link);
        let read_socket = Arc::clone(&socket);
        let mut stop = self.link.stop_signal().subscribe();
        tasks.push(tokio::spawn(async move {
            let mut buffer = vec![0u8; RECV_BUFFER_SIZE];
            loop {
                tokio::select! {
                    received = read_socket.recv_from(&mut buffer) => {
                        let (length, _sender) = match received {
                            Ok(result) => result,
                            Err(e) => {
                                error!("{} receive error: {}", link.label(), e);
                                continue;
                            }
                        };
                        // [source node tag][LLAP frame]
                        if length < 4 {
                            continue;
                        }
                        let data = &buffer[..length];
                        if link.is_own_node(data[0]) {
                            continue;
                        }
                        link.inbound_frame(&data[1..]);
                    }
                    _ = stop.changed() => break,
                }
            }
        }));

        // write loop: tag each frame with its LLAP source node
        let link = Arc::clone(&self.link);
        let write_socket = socket;
        let mut frame_rx = self
            .frame_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::Config(format!("{} started twice", self.short_str())))?;
        let mut stop = self.link.stop_signal().subscribe();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = frame_rx.recv() => {
                        let Some(frame) = frame else { break };
                        if frame.len() < 3 {
                            continue;
                        }
                        let mut payload = Vec::with_capacity(1 + frame.len());
                        payload.push(frame[1]); // LLAP source node
                        payload.extend_from_slice(&frame);
                        if let Err(e) = write_socket
                            .send_to(&payload, (LTOUDP_GROUP, LTOUDP_PORT))
                            .await
                        {
                            debug!("{} transmit failed: {}", link.label(), e);
                        }
                    }
                    _ = stop.changed() => break,
                }
            }
        }));

        // address acquisition
        tasks.push(tokio::spawn(Arc::clone(&self.link).run_acquisition()));

        Ok(())
    }

    fn stop(&self) {
        self.link.signal_stop();
    }

    fn take_tasks(&self) -> Vec<JoinHandle<()>> {
        self.tasks.lock().unwrap().drain(..).collect()
    }

    fn unicast(&self, network: u16, node: u8, datagram: Datagram) {
        self.link.unicast(network, node, datagram);
    }

    fn broadcast(&self, datagram: Datagram) {
        self.link.broadcast(datagram);
    }

    fn multicast(&self, _zone_name: &ZoneName, datagram: Datagram) {
        // LocalTalk has no link multicast; zones hear broadcasts
        self.link.broadcast(datagram);
    }

    fn multicast_address(&self, _zone_name: &[u8]) -> Vec<u8> {
        Vec::new()
    }

    fn set_network_range(&self, range: NetworkRange) -> Result<()> {
        self.link.set_network_range(range)
    }

    fn stats(&self) -> Arc<PortStats> {
        self.stats
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| Arc::new(PortStats::new()))
    }
}
