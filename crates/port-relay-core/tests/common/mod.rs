//! Shared fixtures for relay integration tests.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use port_relay_core::RelayInstance;

pub const IO_TIMEOUT: Duration = Duration::from_secs(10);

pub fn any_local() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// Echo service: every connection gets its bytes back until it closes.
pub fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind(any_local()).unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { return };
            thread::spawn(move || {
                let mut buf = [0u8; 8192];
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// Run a relay from `local` to `remote` on its own thread.
pub fn spawn_relay(remote: SocketAddr) -> SocketAddr {
    let relay = RelayInstance::bind(any_local(), remote).unwrap();
    let addr = relay.local_addr();
    thread::spawn(move || relay.run());
    addr
}

pub fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(IO_TIMEOUT)).unwrap();
    stream.set_write_timeout(Some(IO_TIMEOUT)).unwrap();
    stream
}

/// Deterministic, non-repeating-at-buffer-size test payload.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
