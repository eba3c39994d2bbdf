//! LocalTalk port driven by a TashTalk packet modem on a serial line
//!
//! TashTalk frames the LocalTalk bus for us. Toward the modem we write
//! command bytes: 0x01 introduces an LLAP frame (followed by its FCS),
//! 0x02 a 33-byte node-ID bitmap, 0x03 feature flags. From the modem we
//! read an escaped byte stream: 0x00 introduces an escape, 0x00 0xFF is
//! a literal zero byte, and 0x00 0xFD closes a frame whose FCS must
//! verify.

use crate::dataplane::Router;
use crate::port::localtalk::{LocalTalkLink, LocalTalkSeed};
use crate::port::{Port, PortState};
use crate::protocol::llap::FcsCalculator;
use crate::protocol::{Datagram, NetworkRange, ZoneName};
use crate::telemetry::PortStats;
use crate::{Error, Result};
use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

const CMD_SEND_FRAME: u8 = 0x01;
const CMD_NODE_BITMAP: u8 = 0x02;
const CMD_FEATURES: u8 = 0x03;

const ESCAPE: u8 = 0x00;
const ESCAPED_LITERAL_ZERO: u8 = 0xFF;
const ESCAPED_FRAME_DONE: u8 = 0xFD;

/// Longest frame the modem will hand us (LLAP + DDP + FCS).
const MAX_FRAME_LENGTH: usize = 605;

const LINK_QUEUE_DEPTH: usize = 64;

/// Decoder for TashTalk's escaped receive stream.
///
/// Feed bytes one at a time; a complete frame with a good FCS is
/// returned with the FCS bytes stripped.
#[derive(Debug)]
pub struct TashTalkDecoder {
    fcs: FcsCalculator,
    buffer: Vec<u8>,
    escaped: bool,
}

impl TashTalkDecoder {
    pub fn new() -> Self {
        Self {
            fcs: FcsCalculator::new(),
            buffer: Vec::with_capacity(MAX_FRAME_LENGTH),
            escaped: false,
        }
    }

    pub fn push(&mut self, byte: u8) -> Option<Vec<u8>> {
        if !self.escaped && byte == ESCAPE {
            self.escaped = true;
            return None;
        }
        let byte = if self.escaped {
            self.escaped = false;
            if byte != ESCAPED_LITERAL_ZERO {
                let frame = if byte == ESCAPED_FRAME_DONE
                    && self.fcs.is_okay()
                    && self.buffer.len() >= 5
                {
                    Some(self.buffer[..self.buffer.len() - 2].to_vec())
                } else {
                    None
                };
                self.fcs.reset();
                self.buffer.clear();
                return frame;
            }
            ESCAPE
        } else {
            byte
        };
        if self.buffer.len() < MAX_FRAME_LENGTH {
            self.fcs.feed_byte(byte);
            self.buffer.push(byte);
        }
        None
    }
}

impl Default for TashTalkDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// The 33-byte command giving the modem the node IDs it should answer
/// RTS and ENQ frames for.
fn node_bitmap_command(node: u8) -> Vec<u8> {
    let mut command = vec![0u8; 33];
    command[0] = CMD_NODE_BITMAP;
    command[1 + (node / 8) as usize] = 1 << (node % 8);
    command
}

/// Bytes that put the modem into a known state at startup: flush any
/// half-read command, clear the node bitmap, disable optional features.
fn init_commands() -> Vec<u8> {
    let mut bytes = vec![0u8; 1024];
    bytes.push(CMD_NODE_BITMAP);
    bytes.extend_from_slice(&[0u8; 32]);
    bytes.push(CMD_FEATURES);
    bytes.push(0);
    bytes
}

/// Wrap an LLAP frame in the transmit command with its FCS appended.
fn frame_command(frame: &[u8]) -> Vec<u8> {
    let mut fcs = FcsCalculator::new();
    fcs.feed(frame);
    let mut command = Vec::with_capacity(3 + frame.len());
    command.push(CMD_SEND_FRAME);
    command.extend_from_slice(frame);
    command.push(fcs.byte1());
    command.push(fcs.byte2());
    command
}

struct SerialIo {
    async_fd: AsyncFd<RawFd>,
}

impl SerialIo {
    /// Open and configure the tty: raw, 1 Mbaud, hardware flow control.
    fn open(path: &str) -> Result<Self> {
        let c_path = CString::new(path).map_err(|_| Error::Config(format!("bad path {}", path)))?;
        let fd = unsafe {
            libc::open(
                c_path.as_ptr(),
                libc::O_RDWR | libc::O_NOCTTY | libc::O_NONBLOCK,
            )
        };
        if fd < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }

        unsafe {
            let mut tio: libc::termios = std::mem::zeroed();
            if libc::tcgetattr(fd, &mut tio) < 0 {
                let e = std::io::Error::last_os_error();
                libc::close(fd);
                return Err(Error::Io(e));
            }
            libc::cfmakeraw(&mut tio);
            tio.c_cflag |= libc::CRTSCTS | libc::CLOCAL | libc::CREAD;
            tio.c_cc[libc::VMIN] = 0;
            tio.c_cc[libc::VTIME] = 0;
            libc::cfsetispeed(&mut tio, libc::B1000000);
            libc::cfsetospeed(&mut tio, libc::B1000000);
            if libc::tcsetattr(fd, libc::TCSANOW, &tio) < 0 {
                let e = std::io::Error::last_os_error();
                libc::close(fd);
                return Err(Error::Io(e));
            }
        }

        Ok(Self {
            async_fd: AsyncFd::new(fd)?,
        })
    }

    async fn read(&self, buffer: &mut [u8]) -> Result<usize> {
        loop {
            let mut guard = self.async_fd.readable().await.map_err(Error::Io)?;
            match guard.try_io(|inner| {
                let fd = *inner.get_ref();
                let n = unsafe { libc::read(fd, buffer.as_mut_ptr() as *mut _, buffer.len()) };
                if n < 0 {
                    Err(std::io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(result) => return result.map_err(Error::Io),
                Err(_would_block) => continue,
            }
        }
    }

    async fn write_all(&self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let mut guard = self.async_fd.writable().await.map_err(Error::Io)?;
            match guard.try_io(|inner| {
                let fd = *inner.get_ref();
                let n = unsafe { libc::write(fd, data.as_ptr() as *const _, data.len()) };
                if n < 0 {
                    Err(std::io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(Ok(written)) => data = &data[written..],
                Ok(Err(e)) => return Err(Error::Io(e)),
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }
}

impl Drop for SerialIo {
    fn drop(&mut self) {
        unsafe { libc::close(*self.async_fd.get_ref()) };
    }
}

/// A LocalTalk port behind a TashTalk modem.
pub struct TashTalkPort {
    link: Arc<LocalTalkLink>,
    device: String,
    frame_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    stats: Mutex<Option<Arc<PortStats>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TashTalkPort {
    pub fn new(device: impl Into<String>, seed: Option<LocalTalkSeed>) -> Arc<Self> {
        let device = device.into();
        let label = device.strip_prefix("/dev/").unwrap_or(&device).to_string();
        let (frame_tx, frame_rx) = mpsc::channel(LINK_QUEUE_DEPTH);
        // the modem answers RTS/ENQ itself once given the node bitmap
        Arc::new(Self {
            link: Arc::new(LocalTalkLink::new(label, seed, 0xFE, false, frame_tx)),
            device,
            frame_rx: Mutex::new(Some(frame_rx)),
            stats: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }
}

impl Port for TashTalkPort {
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
        let serial = Arc::new(SerialIo::open(&self.device)?);
        let stats = self.link.attach(router, handle);
        *self.stats.lock().unwrap() = Some(stats);

        let mut tasks = self.tasks.lock().unwrap();

        // reader: escaped stream -> LLAP frames
        let link = Arc::clone(&self.link);
        let read_serial = Arc::clone(&serial);
        let mut stop = self.link.stop_signal().subscribe();
        tasks.push(tokio::spawn(async move {
            let mut decoder = TashTalkDecoder::new();
            let mut buffer = vec![0u8; 4096];
            loop {
                tokio::select! {
                    read = read_serial.read(&mut buffer) => {
                        let length = match read {
                            Ok(0) => continue,
                            Ok(length) => length,
                            Err(e) => {
                                error!("{} serial read error: {}", link.label(), e);
                                break;
                            }
                        };
                        for &byte in &buffer[..length] {
                            if let Some(frame) = decoder.push(byte) {
                                link.inbound_frame(&frame);
                            }
                        }
                    }
                    _ = stop.changed() => break,
                }
            }
        }));

        // writer: frames and modem commands
        let link = Arc::clone(&self.link);
        let write_serial = serial;
        let mut frame_rx = self
            .frame_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::Config(format!("{} started twice", self.short_str())))?;
        let mut node_claimed = self.link.node_claimed_rx();
        let mut stop = self.link.stop_signal().subscribe();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = write_serial.write_all(&init_commands()).await {
                error!("{} serial write error: {}", link.label(), e);
                return;
            }
            loop {
                tokio::select! {
                    frame = frame_rx.recv() => {
                        let Some(frame) = frame else { break };
                        if let Err(e) = write_serial.write_all(&frame_command(&frame)).await {
                            debug!("{} transmit failed: {}", link.label(), e);
                        }
                    }
                    changed = node_claimed.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let node = *node_claimed.borrow_and_update();
                        if node != 0 {
                            if let Err(e) = write_serial.write_all(&node_bitmap_command(node)).await {
                                error!("{} serial write error: {}", link.label(), e);
                            }
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

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_stream(frame: &[u8]) -> Vec<u8> {
        // what the modem would emit: frame + FCS, zeroes escaped, then
        // the frame-done escape
        let mut fcs = FcsCalculator::new();
        fcs.feed(frame);
        let mut with_fcs = frame.to_vec();
        with_fcs.push(fcs.byte1());
        with_fcs.push(fcs.byte2());
        let mut stream = Vec::new();
        for &byte in &with_fcs {
            if byte == ESCAPE {
                stream.push(ESCAPE);
                stream.push(ESCAPED_LITERAL_ZERO);
            } else {
                stream.push(byte);
            }
        }
        stream.push(ESCAPE);
        stream.push(ESCAPED_FRAME_DONE);
        stream
    }

    #[test]
    fn test_decoder_roundtrip() {
        let frame = vec![0xFF, 0x05, 0x01, 0x00, 0x10, 0x04, 0x04, 0x01];
        let mut decoder = TashTalkDecoder::new();
        let mut frames = Vec::new();
        for byte in encode_stream(&frame) {
            if let Some(decoded) = decoder.push(byte) {
                frames.push(decoded);
            }
        }
        assert_eq!(frames, vec![frame]);
    }

    #[test]
    fn test_decoder_rejects_bad_fcs() {
        let frame = vec![0xFF, 0x05, 0x01, 0x12, 0x34];
        let mut stream = encode_stream(&frame);
        // corrupt a payload byte after encoding
        stream[2] ^= 0x40;
        let mut decoder = TashTalkDecoder::new();
        assert!(stream.into_iter().all(|byte| decoder.push(byte).is_none()));
    }

    #[test]
    fn test_decoder_recovers_after_junk() {
        let mut decoder = TashTalkDecoder::new();
        for byte in [0x12, 0x55, ESCAPE, 0xFE] {
            assert!(decoder.push(byte).is_none());
        }
        let frame = vec![0x01, 0x02, 0x01, 0x00, 0x08];
        let mut frames = Vec::new();
        for byte in encode_stream(&frame) {
            if let Some(decoded) = decoder.push(byte) {
                frames.push(decoded);
            }
        }
        assert_eq!(frames, vec![frame]);
    }

    #[test]
    fn test_node_bitmap_command() {
        let command = node_bitmap_command(42);
        assert_eq!(command.len(), 33);
        assert_eq!(command[0], CMD_NODE_BITMAP);
        // node 42: byte 5, bit 2
        assert_eq!(command[1 + 5], 1 << 2);
        assert_eq!(command.iter().skip(1).filter(|&&b| b != 0).count(), 1);
    }

    #[test]
    fn test_frame_command_appends_fcs() {
        let frame = vec![0x01, 0x02, 0x01];
        let command = frame_command(&frame);
        assert_eq!(command[0], CMD_SEND_FRAME);
        assert_eq!(&command[1..4], &frame[..]);
        let mut check = FcsCalculator::new();
        check.feed(&command[1..]);
        assert!(check.is_okay());
    }
}
