//! Shared fixtures for the integration tests
//!
//! `FakeSocksProxy` stands in for the anonymity daemon: it accepts SOCKS4a
//! CONNECT requests, looks the requested hostname up in a routing table and
//! splices the client onto the mapped loopback address.

#![allow(dead_code)]

use hiddenwire_core::{Config, ConnectionManager, CryptoIdentity, Identifier, ManagerEvent};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;

const GRANTED: u8 = 0x5A;
const REJECTED: u8 = 0x5B;

pub struct FakeSocksProxy {
    addr: SocketAddr,
    routes: Arc<Mutex<HashMap<String, SocketAddr>>>,
    stopped: Arc<AtomicBool>,
}

impl FakeSocksProxy {
    pub fn start() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let routes = Arc::new(Mutex::new(HashMap::new()));
        let stopped = Arc::new(AtomicBool::new(false));

        let accept_routes = routes.clone();
        let accept_stopped = stopped.clone();
        thread::Builder::new().name("fake-socks".into()).spawn(move || {
            for stream in listener.incoming() {
                if accept_stopped.load(Ordering::Acquire) {
                    break;
                }
                let Ok(stream) = stream else { continue };
                let routes = accept_routes.clone();
                thread::spawn(move || {
                    let _ = serve(stream, &routes);
                });
            }
        })?;

        Ok(Self { addr, routes, stopped })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Route connections for `host` to `target`
    pub fn map(&self, host: &str, target: SocketAddr) {
        self.routes.lock().unwrap().insert(host.to_string(), target);
    }
}

impl Drop for FakeSocksProxy {
    fn drop(&mut self) {
        self.stopped.store(true, Ordering::Release);
        // Unblock the accept loop
        let _ = TcpStream::connect(self.addr);
    }
}

fn read_until_nul(stream: &mut TcpStream) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte)?;
        if byte[0] == 0 {
            return Ok(out);
        }
        out.push(byte[0]);
    }
}

fn serve(mut client: TcpStream, routes: &Mutex<HashMap<String, SocketAddr>>) -> io::Result<()> {
    let mut header = [0u8; 8];
    client.read_exact(&mut header)?;
    let _user = read_until_nul(&mut client)?;
    let host = String::from_utf8_lossy(&read_until_nul(&mut client)?).into_owned();

    let target = routes.lock().unwrap().get(&host).copied();
    let upstream = match target.map(TcpStream::connect) {
        Some(Ok(upstream)) => upstream,
        _ => {
            client.write_all(&[0, REJECTED, 0, 0, 0, 0, 0, 0])?;
            return Ok(());
        }
    };
    client.write_all(&[0, GRANTED, 0, 0, 0, 0, 0, 0])?;

    let mut client_read = client.try_clone()?;
    let mut upstream_write = upstream.try_clone()?;
    thread::spawn(move || {
        let _ = io::copy(&mut client_read, &mut upstream_write);
        let _ = upstream_write.shutdown(Shutdown::Write);
    });

    let mut upstream_read = upstream;
    let _ = io::copy(&mut upstream_read, &mut client);
    let _ = client.shutdown(Shutdown::Write);
    Ok(())
}

/// Config for a manager listening on loopback behind `proxy`
pub fn test_config(proxy: &FakeSocksProxy) -> Config {
    let mut config = Config::default();
    config.network.proxy_address = proxy.addr();
    config.network.listen_address = "127.0.0.1:0".parse().unwrap();
    config.network.connect_timeout = Duration::from_secs(5);
    config.channel.poll_timeout = Duration::from_millis(50);
    config.dispatch.retry_interval = Duration::from_millis(20);
    config.dispatch.reconnect_delay = Duration::from_millis(100);
    config
}

pub struct Node {
    pub manager: ConnectionManager,
    pub events: mpsc::UnboundedReceiver<ManagerEvent>,
    pub id: Identifier,
}

/// Start a manager and publish it on the proxy under its own identifier
pub fn start_node(proxy: &FakeSocksProxy, config: Config) -> Node {
    let identity = Arc::new(CryptoIdentity::generate());
    let (manager, events) = ConnectionManager::start(config, identity).unwrap();
    proxy.map(manager.identifier().as_str(), manager.local_addr());
    let id = manager.identifier().clone();
    Node { manager, events, id }
}

/// Wait for the first event matching `predicate`, skipping others
pub async fn expect_event<F>(events: &mut mpsc::UnboundedReceiver<ManagerEvent>, mut predicate: F) -> ManagerEvent
where
    F: FnMut(&ManagerEvent) -> bool,
{
    let wait = async {
        loop {
            match events.recv().await {
                Some(event) if predicate(&event) => return event,
                Some(_) => continue,
                None => panic!("event stream closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(10), wait)
        .await
        .expect("timed out waiting for event")
}

pub fn fresh_identifier() -> Identifier {
    CryptoIdentity::generate().identifier().unwrap()
}
