//! AEP (AppleTalk Echo Protocol) responder

use crate::dataplane::Router;
use crate::port::Port;
use crate::protocol::Datagram;
use crate::service::Service;
use crate::Result;
use std::sync::{Arc, OnceLock};

/// DDP type of Echo packets.
pub const ECHO_DDP_TYPE: u8 = 4;

const ECHO_FUNC_REQUEST: u8 = 1;
const ECHO_FUNC_REPLY: u8 = 2;

/// Answers Echo Requests on socket 4 with the payload copied verbatim.
#[derive(Default)]
pub struct EchoService {
    router: OnceLock<Arc<Router>>,
}

impl EchoService {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Service for EchoService {
    fn name(&self) -> &'static str {
        "echo service"
    }

    fn start(&self, router: Arc<Router>) -> Result<()> {
        let _ = self.router.set(router);
        Ok(())
    }

    fn stop(&self) {}

    fn inbound(&self, datagram: Datagram, rx_port: &Arc<dyn Port>) {
        let Some(router) = self.router.get() else {
            return;
        };
        if datagram.ddp_type != ECHO_DDP_TYPE {
            return;
        }
        if datagram.data.first() != Some(&ECHO_FUNC_REQUEST) {
            return;
        }
        let mut data = Vec::with_capacity(datagram.data.len());
        data.push(ECHO_FUNC_REPLY);
        data.extend_from_slice(&datagram.data[1..]);
        router.reply(&datagram, rx_port, ECHO_DDP_TYPE, data);
    }
}
