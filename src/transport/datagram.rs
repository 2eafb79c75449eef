use log::{debug, info, trace};
use std::net::{SocketAddr, UdpSocket};
use std::sync::Mutex;

use super::DatagramTransport;
use crate::config::{Endpoint, LocalBind};
use crate::error::{ForwarderError, Result};

struct Binding {
    socket: UdpSocket,
    target: SocketAddr,
}

/// Sends line-protocol text to a UDP listener
///
/// The socket and its destination are swapped under one lock, so a send
/// never sees a new socket with an old target or the other way round.
pub struct UdpTransport {
    binding: Mutex<Option<Binding>>,
}

impl UdpTransport {
    /// Create an unbound transport
    pub fn new() -> Self {
        Self {
            binding: Mutex::new(None),
        }
    }

    /// Local address of the bound socket
    pub fn local_addr(&self) -> Option<SocketAddr> {
        let binding = self.binding.lock().ok()?;
        binding.as_ref()?.socket.local_addr().ok()
    }

    /// Resolved destination
    pub fn target(&self) -> Option<SocketAddr> {
        let binding = self.binding.lock().ok()?;
        binding.as_ref().map(|b| b.target)
    }
}

impl Default for UdpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl DatagramTransport for UdpTransport {
    fn configure(&self, local: &LocalBind, target: &Endpoint) -> Result<()> {
        let target_addr = target.resolve()?;
        let bind_addr = local.socket_addr(&target_addr)?;

        let mut binding = self
            .binding
            .lock()
            .map_err(|_| ForwarderError::Other("Lock poisoned".to_string()))?;

        // The old socket must be gone before a fixed local port can be rebound
        if binding.take().is_some() {
            debug!("Closed previous UDP socket");
        }

        let socket = UdpSocket::bind(bind_addr)
            .map_err(|e| ForwarderError::transport(&format!("Cannot bind UDP socket to {}", bind_addr), e))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| ForwarderError::transport("Cannot make UDP socket non-blocking", e))?;

        info!(
            "UDP transport bound to {} sending to {}",
            socket.local_addr().map_or_else(|_| bind_addr.to_string(), |a| a.to_string()),
            target_addr
        );

        *binding = Some(Binding {
            socket,
            target: target_addr,
        });
        Ok(())
    }

    fn send(&self, line: &str) -> Result<()> {
        let binding = self
            .binding
            .lock()
            .map_err(|_| ForwarderError::Other("Lock poisoned".to_string()))?;
        let binding = binding
            .as_ref()
            .ok_or_else(|| ForwarderError::Transport("UDP socket is not bound".to_string()))?;

        let sent = binding
            .socket
            .send_to(line.as_bytes(), binding.target)
            .map_err(|e| ForwarderError::transport(&format!("UDP send to {} failed", binding.target), e))?;
        if sent != line.len() {
            return Err(ForwarderError::Transport(format!(
                "Short UDP send to {}: {} of {} bytes",
                binding.target,
                sent,
                line.len()
            )));
        }

        trace!("Sent {} bytes to {}", sent, binding.target);
        Ok(())
    }

    fn shutdown(&self) {
        if let Ok(mut binding) = self.binding.lock() {
            if binding.take().is_some() {
                info!("UDP transport closed");
            }
        }
    }
}
