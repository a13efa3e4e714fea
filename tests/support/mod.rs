#![allow(dead_code)]

use async_trait::async_trait;
use camscan::ports::{Connector, HttpBanner};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// In-memory network: a set of open sockets plus optional HTTP banners.
#[derive(Default)]
pub struct FakeNet {
    open: HashSet<SocketAddr>,
    banners: HashMap<SocketAddr, HttpBanner>,
    delay: Duration,
    faulty: AtomicBool,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    calls: AtomicUsize,
    probed: Mutex<Vec<SocketAddr>>,
}

impl FakeNet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(mut self, ip: &str, ports: &[u16]) -> Self {
        for &port in ports {
            self.open.insert(addr(ip, port));
        }
        self
    }

    pub fn banner(mut self, ip: &str, port: u16, server: &str, body: &str) -> Self {
        self.banners.insert(
            addr(ip, port),
            HttpBanner {
                server: Some(server.to_string()),
                body: body.to_string(),
            },
        );
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Every probe panics, as a broken connector would.
    pub fn faulty(self) -> Self {
        self.faulty.store(true, Ordering::SeqCst);
        self
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn probed(&self) -> Vec<SocketAddr> {
        self.probed.lock().unwrap().clone()
    }
}

pub fn addr(ip: &str, port: u16) -> SocketAddr {
    format!("{ip}:{port}").parse().unwrap()
}

#[async_trait]
impl Connector for FakeNet {
    async fn is_open(&self, addr: SocketAddr, _timeout: Duration) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.faulty.load(Ordering::SeqCst) {
            panic!("connector fault");
        }
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.probed.lock().unwrap().push(addr);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.open.contains(&addr)
    }

    async fn http_banner(&self, addr: SocketAddr, _timeout: Duration) -> Option<HttpBanner> {
        self.banners.get(&addr).cloned()
    }
}

pub fn probe_match(xaddrs: &str, scopes: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" xmlns:d="http://docs.oasis-open.org/ws-dd/ns/discovery/2009/01">
  <s:Header/>
  <s:Body>
    <d:ProbeMatches>
      <d:ProbeMatch>
        <d:Types>dn:NetworkVideoTransmitter</d:Types>
        <d:Scopes>{scopes}</d:Scopes>
        <d:XAddrs>{xaddrs}</d:XAddrs>
      </d:ProbeMatch>
    </d:ProbeMatches>
  </s:Body>
</s:Envelope>"#
    )
}

/// Loopback stand-in for the WS-Discovery group: answers every probe with `replies`.
pub async fn spawn_onvif_responder(replies: Vec<String>) -> SocketAddr {
    spawn_counting_responder(replies).await.0
}

/// Like [`spawn_onvif_responder`], also counting the probes received.
pub async fn spawn_counting_responder(replies: Vec<String>) -> (SocketAddr, Arc<AtomicUsize>) {
    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let local = socket.local_addr().unwrap();
    let probes = Arc::new(AtomicUsize::new(0));
    let seen = probes.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65_535];
        while let Ok((_, from)) = socket.recv_from(&mut buf).await {
            seen.fetch_add(1, Ordering::SeqCst);
            for reply in &replies {
                let _ = socket.send_to(reply.as_bytes(), from).await;
            }
        }
    });
    (local, probes)
}
