//! Deluge integration test harness.
//!
//! Nodes run in-process on a simulated link layer with virtual time: the
//! harness jumps straight to the earliest timer deadline of any node, fires
//! it, and delivers whatever frames were queued. Links can drop or corrupt
//! frames and the topology can be restricted to a line.
//!
//!   cargo test --test integration

use std::io::Cursor;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use deluge_core::config::ProtocolConfig;
use deluge_core::wire::cmd;
use deluge_core::Variant;
use deluge_services::{Deluge, DelugeRegistry, DisseminationObject, SendTarget};

mod dissemination;
mod loader;

// ── Harness ───────────────────────────────────────────────────────────────────

pub type Store = Cursor<Vec<u8>>;

pub const PORT: u16 = 6464;

/// Upper bound on harness steps, in case a run never settles.
const MAX_STEPS: usize = 1_000_000;

pub struct SimNode {
    pub deluge: Deluge<Store>,
    pub addr: SocketAddr,
}

pub struct Sim {
    pub nodes: Vec<SimNode>,
    pub config: ProtocolConfig,
    line: bool,
    loss: f64,
    corrupt: f64,
    rng: StdRng,
    seed: u64,
    start: Instant,
    now: Instant,
    pub delivered: usize,
    pub dropped: usize,
    pub corrupted: usize,
}

impl Sim {
    pub fn new(seed: u64) -> Self {
        let start = Instant::now();
        Self {
            nodes: Vec::new(),
            config: ProtocolConfig::default(),
            line: false,
            loss: 0.0,
            corrupt: 0.0,
            rng: StdRng::seed_from_u64(seed),
            seed,
            start,
            now: start,
            delivered: 0,
            dropped: 0,
            corrupted: 0,
        }
    }

    pub fn variant(mut self, variant: Variant) -> Self {
        self.config.variant = variant;
        self
    }

    /// Drop each delivery with probability `p`.
    pub fn loss(mut self, p: f64) -> Self {
        self.loss = p;
        self
    }

    /// Flip a payload byte of each data packet with probability `p`.
    pub fn corrupt(mut self, p: f64) -> Self {
        self.corrupt = p;
        self
    }

    /// Node `i` only hears nodes `i - 1` and `i + 1`.
    pub fn line(mut self) -> Self {
        self.line = true;
        self
    }

    /// Add a node holding `data` at `version`.
    pub fn seed(&mut self, data: &[u8], version: u8) -> usize {
        let rng = self.node_rng();
        let name = format!("seed-{}", self.nodes.len());
        let deluge = DelugeRegistry::new()
            .disseminate(Cursor::new(data.to_vec()), &name, version, &self.config, rng, self.now)
            .expect("seed node");
        self.push(deluge)
    }

    /// Add an empty node.
    pub fn join(&mut self) -> usize {
        let rng = self.node_rng();
        let name = format!("node-{}", self.nodes.len());
        let deluge = DelugeRegistry::new()
            .join(Cursor::new(Vec::new()), &name, &self.config, rng, self.now)
            .expect("join node");
        self.push(deluge)
    }

    pub fn object(&self, i: usize) -> &DisseminationObject<Store> {
        self.nodes[i].deluge.object()
    }

    /// Bytes in node `i`'s storage.
    pub fn stored(&mut self, i: usize) -> Vec<u8> {
        self.nodes[i].deluge.object_mut().storage_mut().get_ref().clone()
    }

    /// `i` holds a complete object at `version`.
    pub fn has(&self, i: usize, version: u8) -> bool {
        let object = self.object(i);
        object.version() == version && object.is_complete() && object.page_count() > 0
    }

    pub fn elapsed(&self) -> Duration {
        self.now - self.start
    }

    /// Advance to the next deadline and deliver what it produces.
    /// Returns false when no node has a timer armed.
    pub fn step(&mut self) -> bool {
        let Some(next) = self.nodes.iter().filter_map(|n| n.deluge.next_deadline()).min() else {
            return false;
        };
        self.now = self.now.max(next);
        for node in &mut self.nodes {
            node.deluge.poll_timers(self.now);
        }
        self.deliver();
        true
    }

    /// Step until `done` holds or `limit` of virtual time has passed.
    pub fn run_until(&mut self, limit: Duration, mut done: impl FnMut(&Sim) -> bool) -> bool {
        for _ in 0..MAX_STEPS {
            if done(self) {
                return true;
            }
            if self.elapsed() > limit || !self.step() {
                return false;
            }
        }
        false
    }

    fn deliver(&mut self) {
        loop {
            let mut frames = Vec::new();
            for (from, node) in self.nodes.iter_mut().enumerate() {
                frames.extend(node.deluge.drain_outbox().into_iter().map(|out| (from, out)));
            }
            if frames.is_empty() {
                return;
            }

            for (from, out) in frames {
                let sender = self.nodes[from].addr;
                let targets: Vec<usize> = match out.target {
                    SendTarget::Broadcast => (0..self.nodes.len()).filter(|&j| j != from).collect(),
                    SendTarget::Peer(addr) => {
                        self.nodes.iter().position(|n| n.addr == addr).into_iter().collect()
                    }
                };
                for to in targets {
                    if !self.hears(from, to) {
                        continue;
                    }
                    if self.loss > 0.0 && self.rng.gen_bool(self.loss) {
                        self.dropped += 1;
                        continue;
                    }
                    let mut frame = out.frame.to_vec();
                    let packet = frame[0] == cmd::PACKET;
                    if packet && self.corrupt > 0.0 && self.rng.gen_bool(self.corrupt) {
                        let at = self.rng.gen_range(7..frame.len());
                        frame[at] ^= 0x5a;
                        self.corrupted += 1;
                    }
                    self.delivered += 1;
                    self.nodes[to].deluge.handle_frame(&frame, sender, self.now);
                }
            }
        }
    }

    fn hears(&self, from: usize, to: usize) -> bool {
        !self.line || from.abs_diff(to) == 1
    }

    fn node_rng(&self) -> StdRng {
        StdRng::seed_from_u64(self.seed.wrapping_mul(31).wrapping_add(self.nodes.len() as u64))
    }

    fn push(&mut self, deluge: Deluge<Store>) -> usize {
        let i = self.nodes.len();
        let addr = SocketAddr::new(
            IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, i as u16 + 1)),
            PORT,
        );
        self.nodes.push(SimNode { deluge, addr });
        i
    }
}

/// Deterministic test content.
pub fn pattern(len: usize, salt: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(7).wrapping_add(salt) ^ (i >> 8) as u8)
        .collect()
}
