//! Out-of-band interrupt channel. A TCP server (host side) or client
//! (device side) exchanging 2-byte messages.
//!
//! Each connection gets its own reader thread; `send_irq_request` looks up
//! the peer's connection by device id and writes a frame directly.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::{debug, error, info, warn};

use crate::error::{CxlError, Result};
use crate::lifecycle::Lifecycle;

pub const IRQ_WIDTH: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Irq {
    Null = 0x00,
    /// Host-side file ready to be read by device using CXL.cache.
    HostReady = 0x01,
    /// Device-side results ready to be read by host using CXL.mem.
    AccelValidationFinished = 0x02,
    /// Host finished writing file to device via CXL.mem.
    HostSent = 0x03,
    /// Accelerator finished training, waiting for host to send validation data.
    AccelTrainingFinished = 0x04,
    DevRemoved = 0x05,
    DevAdded = 0x06,
}

impl Irq {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x00 => Some(Irq::Null),
            0x01 => Some(Irq::HostReady),
            0x02 => Some(Irq::AccelValidationFinished),
            0x03 => Some(Irq::HostSent),
            0x04 => Some(Irq::AccelTrainingFinished),
            0x05 => Some(Irq::DevRemoved),
            0x06 => Some(Irq::DevAdded),
            _ => None,
        }
    }
}

pub type IrqCallback = dyn Fn(u8) + Send + Sync;

struct GeneralHandler {
    callback: Arc<IrqCallback>,
    persistent: bool,
}

/// Registry plus connection set for one side (host or device) of the
/// out-of-band interrupt channel.
pub struct IrqManager {
    label: String,
    addr: String,
    port: u16,
    server: bool,
    device_id: u8,
    connections: Mutex<Vec<TcpStream>>,
    per_device: Mutex<HashMap<u8, HashMap<Irq, Arc<IrqCallback>>>>,
    general: Mutex<HashMap<Irq, GeneralHandler>>,
    lifecycle: Lifecycle,
    reader_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl IrqManager {
    pub fn new(device_name: &str, addr: &str, port: u16, server: bool, device_id: u8) -> Arc<Self> {
        Arc::new(IrqManager {
            label: format!("{device_name}:IrqHandler"),
            addr: addr.to_string(),
            port,
            server,
            device_id,
            connections: Mutex::new(Vec::new()),
            per_device: Mutex::new(HashMap::new()),
            general: Mutex::new(HashMap::new()),
            lifecycle: Lifecycle::new(),
            reader_handles: Mutex::new(Vec::new()),
        })
    }

    /// Binds `(dev_id, irq) -> cb`. As a client, `dev_id` is always locked
    /// to 0 (there is only one peer: the host).
    pub fn register_interrupt_handler<F>(&self, irq: Irq, cb: F, dev_id: u8)
    where
        F: Fn(u8) + Send + Sync + 'static,
    {
        let dev_id = if self.server { dev_id } else { 0 };
        debug!("{}: registering handler for {irq:?} on device {dev_id}", self.label);
        self.per_device
            .lock()
            .unwrap()
            .entry(dev_id)
            .or_default()
            .insert(irq, Arc::new(cb));
    }

    /// Binds `irq -> cb` across every device; fires regardless of which
    /// connection the message arrived on.
    pub fn register_general_handler<F>(&self, irq: Irq, cb: F, persistent: bool)
    where
        F: Fn(u8) + Send + Sync + 'static,
    {
        debug!("{}: registering general handler for {irq:?}", self.label);
        self.general.lock().unwrap().insert(
            irq,
            GeneralHandler {
                callback: Arc::new(cb),
                persistent,
            },
        );
    }

    /// Server: starts listening and accepting peer connections. Client:
    /// opens one connection to the host. Either way, every connection gets
    /// its own reader thread decoding 2-byte IRQ frames.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        self.lifecycle.mark_starting();
        if self.server {
            let listener = TcpListener::bind((self.addr.as_str(), self.port))?;
            info!("{}: listening on {}:{}", self.label, self.addr, self.port);
            let this = self.clone();
            thread::spawn(move || {
                for stream in listener.incoming() {
                    match stream {
                        Ok(stream) => this.adopt_connection(stream),
                        Err(e) => {
                            warn!("{}: accept failed: {e}", this.label);
                            break;
                        }
                    }
                }
            });
        } else {
            let stream = TcpStream::connect((self.addr.as_str(), self.port))?;
            info!("{}: connected to {}:{}", self.label, self.addr, self.port);
            self.adopt_connection(stream);
        }
        self.lifecycle.mark_running();
        Ok(())
    }

    fn adopt_connection(self: &Arc<Self>, stream: TcpStream) {
        let reader_stream = stream.try_clone().expect("tcp stream clone");
        let device_index = {
            let mut conns = self.connections.lock().unwrap();
            conns.push(stream);
            conns.len() - 1
        };
        let this = self.clone();
        let handle = thread::spawn(move || this.irq_handler(reader_stream, device_index as u8));
        self.reader_handles.lock().unwrap().push(handle);
    }

    fn irq_handler(self: Arc<Self>, mut stream: TcpStream, connection_index: u8) {
        let this_dev_name = if self.server {
            "host".to_string()
        } else {
            format!("device {}", self.device_id)
        };
        loop {
            let mut buf = [0u8; IRQ_WIDTH];
            match stream.read_exact(&mut buf) {
                Ok(()) => {}
                Err(e) => {
                    debug!("{}: {this_dev_name} IRQ connection broken: {e}", self.label);
                    return;
                }
            }
            let msg = u16::from_le_bytes(buf);
            let remote_dev_id = if self.server {
                (msg & 0xFF) as u8
            } else {
                0
            };
            let irq_code = (msg >> 8) as u8;
            let Some(irq) = Irq::from_u8(irq_code) else {
                error!("{}: received unknown IRQ code {irq_code:#04x}", self.label);
                continue;
            };
            debug!("{}: IRQ received for {irq:?} from device {remote_dev_id}", self.label);
            self.dispatch(irq, remote_dev_id, connection_index);
        }
    }

    /// Routes a decoded IRQ to its handler. No handler at all, specific or
    /// general, is an internal invariant violation and aborts the process
    /// with a diagnostic.
    fn dispatch(&self, irq: Irq, remote_dev_id: u8, _connection_index: u8) {
        let specific = self
            .per_device
            .lock()
            .unwrap()
            .get(&remote_dev_id)
            .and_then(|m| m.get(&irq))
            .cloned();
        if let Some(cb) = specific {
            cb(remote_dev_id);
            return;
        }

        let general = {
            let mut general = self.general.lock().unwrap();
            match general.get(&irq) {
                Some(h) if h.persistent => Some(h.callback.clone()),
                Some(_) => general.remove(&irq).map(|h| h.callback),
                None => None,
            }
        };
        match general {
            Some(cb) => cb(remote_dev_id),
            None => panic!(
                "{}: IRQ {irq:?} is not registered for remote device {remote_dev_id}",
                self.label
            ),
        }
    }

    /// Writes a 2-byte frame to the connection for `device`. As a client,
    /// `device` is ignored: there is exactly one peer, the host.
    pub fn send_irq_request(&self, irq: Irq, device: usize) -> Result<()> {
        let device = if self.server { device } else { 0 };
        let mut conns = self.connections.lock().unwrap();
        let stream = conns.get_mut(device).ok_or(CxlError::ConnectionClosed)?;
        let frame = ((irq as u16) << 8) | self.device_id as u16;
        stream.write_all(&frame.to_le_bytes())?;
        stream.flush()?;
        Ok(())
    }

    /// Signals every reader thread to stop by shutting down its socket;
    /// `read_exact` then errors and the thread returns.
    pub fn stop(&self) {
        self.lifecycle.mark_stopping();
        for conn in self.connections.lock().unwrap().iter() {
            let _ = conn.shutdown(std::net::Shutdown::Both);
        }
        for handle in self.reader_handles.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
        self.lifecycle.mark_stopped();
    }

    pub fn wait_for_ready(&self) {
        self.lifecycle.wait_for_ready();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU8, Ordering};
    use std::time::Duration;

    fn free_port() -> u16 {
        TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
    }

    #[test]
    fn irq_round_trips_from_client_to_server() {
        let port = free_port();
        let server = IrqManager::new("host", "127.0.0.1", port, true, 0);
        let received = Arc::new(AtomicU8::new(0));
        {
            let received = received.clone();
            server.register_interrupt_handler(
                Irq::DevAdded,
                move |dev_id| received.store(dev_id + 1, Ordering::SeqCst),
                0,
            );
        }
        server.start().unwrap();
        thread::sleep(Duration::from_millis(50));

        let client = IrqManager::new("device0", "127.0.0.1", port, false, 0);
        client.start().unwrap();
        thread::sleep(Duration::from_millis(50));

        client.send_irq_request(Irq::DevAdded, 0).unwrap();
        thread::sleep(Duration::from_millis(100));

        assert_eq!(received.load(Ordering::SeqCst), 1);

        client.stop();
        server.stop();
    }

    #[test]
    fn general_handler_fires_and_deregisters_when_non_persistent() {
        let port = free_port();
        let server = IrqManager::new("host", "127.0.0.1", port, true, 0);
        let calls = Arc::new(AtomicU8::new(0));
        {
            let calls = calls.clone();
            server.register_general_handler(
                Irq::HostReady,
                move |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                },
                false,
            );
        }
        server.start().unwrap();
        thread::sleep(Duration::from_millis(50));

        let client = IrqManager::new("device0", "127.0.0.1", port, false, 0);
        client.start().unwrap();
        thread::sleep(Duration::from_millis(50));

        client.send_irq_request(Irq::HostReady, 0).unwrap();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!server.general.lock().unwrap().contains_key(&Irq::HostReady));

        client.stop();
        server.stop();
    }
}
