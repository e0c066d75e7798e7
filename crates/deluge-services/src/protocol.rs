//! Deluge dissemination state machine.
//!
//! A sans-IO core: callers feed it inbound frames and the current time, and
//! drain the frames it wants sent. Timers are plain deadlines; the event loop
//! sleeps until `next_deadline()` and then calls `poll_timers()`.
//!
//! States:
//!   MAINTAIN: advertise summaries (and profiles for stale neighbours) once
//!             per round; round length doubles while the neighbourhood is
//!             consistent and drops back to T_LOW when it is not.
//!   RX:       request the lowest missing page from the node that advertised
//!             it, give up after CONST_LAMBDA unanswered requests.
//!   TX:       stream the requested packets of one page after a short delay.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::Rng;

use deluge_core::config::ProtocolConfig;
use deluge_core::page::MAX_PAGES;
use deluge_core::wire::{Message, Packet, Profile, Request, Summary};
use deluge_core::{crc16, PACKET_SIZE};

use crate::object::{DisseminationObject, PAGE_COMPLETE};
use crate::send_target::{Outgoing, SendTarget};
use crate::storage::Storage;

// ── Parameters ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolParams {
    pub t_low: Duration,
    pub t_high: Duration,
    pub const_k: u32,
    pub const_lambda: u8,
    pub const_omega: u32,
    pub estimated_tx_time: Duration,
    pub t_r: Duration,
    pub tx_delay: Duration,
}

impl From<&ProtocolConfig> for ProtocolParams {
    fn from(c: &ProtocolConfig) -> Self {
        Self {
            t_low: c.t_low(),
            t_high: c.t_high(),
            const_k: c.const_k,
            const_lambda: c.const_lambda,
            const_omega: c.const_omega,
            estimated_tx_time: c.estimated_tx_time(),
            t_r: c.t_r(),
            tx_delay: c.tx_delay(),
        }
    }
}

impl Default for ProtocolParams {
    fn default() -> Self {
        Self::from(&ProtocolConfig::default())
    }
}

/// Round interval for the next round.
///
/// An observed inconsistency resets the interval to `t_low`; otherwise it
/// doubles, capped at `t_high`.
pub fn next_round_interval(current: Duration, inconsistent: bool, p: &ProtocolParams) -> Duration {
    if inconsistent {
        p.t_low
    } else {
        (current * 2).min(p.t_high)
    }
}

// ── States and timers ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Maintain,
    Rx,
    Tx,
}

/// Lower-layer hint: more frames of the same page follow, or the burst is over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamHint {
    Stream,
    StreamEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Round,
    Summary,
    Profile,
    Rx,
    Tx,
}

#[derive(Debug, Default, Clone, Copy)]
struct Timer {
    deadline: Option<Instant>,
    period: Duration,
}

impl Timer {
    fn set(&mut self, now: Instant, period: Duration) {
        self.period = period;
        self.deadline = Some(now + period);
    }

    /// Re-arm with the previous period.
    fn reset(&mut self, now: Instant) {
        self.deadline = Some(now + self.period);
    }

    fn stop(&mut self) {
        self.deadline = None;
    }

    fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Disarm and report whether the deadline had passed.
    fn take_expired(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(d) if d <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug, Default)]
struct Timers {
    round: Timer,
    summary: Timer,
    profile: Timer,
    rx: Timer,
    tx: Timer,
}

impl Timers {
    fn get(&self, kind: TimerKind) -> &Timer {
        match kind {
            TimerKind::Round => &self.round,
            TimerKind::Summary => &self.summary,
            TimerKind::Profile => &self.profile,
            TimerKind::Rx => &self.rx,
            TimerKind::Tx => &self.tx,
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        [&self.round, &self.summary, &self.profile, &self.rx, &self.tx]
            .into_iter()
            .filter_map(|t| t.deadline)
            .min()
    }
}

// ── State machine ─────────────────────────────────────────────────────────────

pub struct Deluge<S> {
    object: DisseminationObject<S>,
    params: ProtocolParams,
    state: State,
    timers: Timers,
    r_interval: Duration,
    recv_adv: u32,
    old_summary: bool,
    neighbor_inconsistency: bool,
    broadcast_profile: bool,
    /// Node whose summary or profile put us into RX.
    summary_from: Option<SocketAddr>,
    stream_hint: Option<StreamHint>,
    outbox: Vec<Outgoing>,
    rng: StdRng,
}

impl<S: Storage> Deluge<S> {
    /// Wrap an object in MAINTAIN. No round runs until `start_round`.
    pub fn new(object: DisseminationObject<S>, params: ProtocolParams, rng: StdRng) -> Self {
        let r_interval = params.t_low;
        Self {
            object,
            params,
            state: State::Maintain,
            timers: Timers::default(),
            r_interval,
            recv_adv: 0,
            old_summary: false,
            neighbor_inconsistency: false,
            broadcast_profile: false,
            summary_from: None,
            stream_hint: None,
            outbox: Vec::new(),
            rng,
        }
    }

    // ── Event entry points ───────────────────────────────────────────────────

    /// Decode and dispatch one inbound frame.
    ///
    /// Malformed frames and frames for another object are dropped.
    pub fn handle_frame(&mut self, frame: &[u8], sender: SocketAddr, now: Instant) {
        let msg = match Message::decode(frame) {
            Ok(m) => m,
            Err(e) => {
                tracing::trace!(
                    error = %e,
                    peer = %sender,
                    head = %hex::encode(&frame[..frame.len().min(8)]),
                    "dropping malformed frame"
                );
                return;
            }
        };
        if msg.object_id() != self.object.object_id() {
            tracing::trace!(
                object_id = msg.object_id(),
                kind = msg.kind(),
                "frame for another object, ignoring"
            );
            return;
        }
        match msg {
            Message::Summary(m) => self.handle_summary(&m, sender, now),
            Message::Request(m) => self.handle_request(&m, now),
            Message::Packet(m) => self.handle_packet(&m, now),
            Message::Profile(m) => self.handle_profile(&m, sender, now),
        }
    }

    /// Fire every timer whose deadline has passed.
    pub fn poll_timers(&mut self, now: Instant) {
        if self.timers.round.take_expired(now) {
            self.start_round(now);
        }
        if self.timers.summary.take_expired(now) {
            self.advertise_summary();
        }
        if self.timers.profile.take_expired(now) {
            self.send_profile();
        }
        if self.timers.rx.take_expired(now) {
            self.send_request(now);
        }
        if self.timers.tx.take_expired(now) {
            self.tx_callback(now);
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Frames queued since the last drain, in send order.
    pub fn drain_outbox(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.outbox)
    }

    // ── Rounds ───────────────────────────────────────────────────────────────

    /// Begin an advertisement round.
    pub fn start_round(&mut self, now: Instant) {
        if self.neighbor_inconsistency {
            tracing::debug!("inconsistency seen, resetting round interval");
        }
        self.r_interval =
            next_round_interval(self.r_interval, self.neighbor_inconsistency, &self.params);
        self.neighbor_inconsistency = false;
        self.recv_adv = 0;
        self.old_summary = false;

        let half = self.r_interval / 2;
        let r_rand = half + self.random_below(half);
        self.timers.summary.set(now, r_rand);
        self.timers.profile.set(now, r_rand);
        self.timers.round.set(now, self.r_interval);

        tracing::trace!(
            r_interval_ms = self.r_interval.as_millis() as u64,
            r_rand_ms = r_rand.as_millis() as u64,
            state = ?self.state,
            "round started"
        );
    }

    pub fn advertise_summary(&mut self) {
        if self.recv_adv >= self.params.const_k {
            tracing::trace!(recv_adv = self.recv_adv, "summary suppressed");
            self.timers.summary.stop();
            return;
        }
        let msg = Summary {
            version: self.object.update_version,
            highest_available: page_byte(self.object.highest_available_page()),
            object_id: self.object.object_id(),
        };
        self.outbox
            .push(Outgoing::broadcast(Message::Summary(msg).encode()));
    }

    pub fn send_profile(&mut self) {
        if !self.broadcast_profile || self.recv_adv >= self.params.const_k {
            return;
        }
        self.broadcast_profile = false;
        let msg = Profile {
            version: self.object.version,
            object_id: self.object.object_id(),
            version_vector: self.object.version_vector(),
        };
        tracing::debug!(
            version = msg.version,
            npages = msg.version_vector.len(),
            "broadcasting profile"
        );
        self.outbox
            .push(Outgoing::broadcast(Message::Profile(msg).encode()));
    }

    // ── Summaries ────────────────────────────────────────────────────────────

    pub fn handle_summary(&mut self, msg: &Summary, sender: SocketAddr, now: Instant) {
        let highest = self.object.highest_available_page();

        if msg.version != self.object.version || msg.highest_available as usize != highest {
            self.neighbor_inconsistency = true;
        } else {
            self.recv_adv += 1;
        }

        if msg.version < self.object.version {
            self.old_summary = true;
            self.broadcast_profile = true;
        }

        if msg.version != self.object.update_version || msg.highest_available as usize <= highest {
            return;
        }

        let advertised = msg.highest_available as usize;
        if advertised > self.object.page_count() {
            tracing::debug!(
                peer = %sender,
                advertised,
                pages = self.object.page_count(),
                "summary advertises more pages than the object has, ignoring"
            );
            return;
        }

        // Back off if these pages were recently served or received.
        let candidates = &self.object.pages()[..advertised];
        let request_age = oldest_age(now, candidates.iter().map(|p| p.last_request));
        let data_age = oldest_age(now, candidates.iter().map(|p| p.last_data));
        if request_age.is_some_and(|age| age <= self.r_interval * 2)
            || data_age.is_some_and(|age| age <= self.r_interval)
        {
            tracing::trace!(peer = %sender, "recent page activity, not requesting yet");
            return;
        }

        self.summary_from = Some(sender);
        self.transition(State::Rx);
        if !self.timers.rx.is_armed() {
            let delay = self.request_delay();
            self.timers.rx.set(now, delay);
        }
    }

    // ── Requests ─────────────────────────────────────────────────────────────

    /// Ask for the packets still missing from `current_rx_page`.
    pub fn send_request(&mut self, now: Instant) {
        let page = self.object.current_rx_page;
        if page >= self.object.page_count() {
            self.transition(State::Maintain);
            return;
        }

        let all = self.object.geometry().all_packets();
        let msg = Request {
            version: self.object.update_version,
            pagenum: page_byte(page),
            request_set: !self.object.pages[page].packet_set & all,
            object_id: self.object.object_id(),
        };
        let frame = Message::Request(msg).encode();
        self.outbox.push(match self.summary_from {
            Some(peer) => Outgoing::to_peer(peer, frame),
            None => Outgoing::broadcast(frame),
        });

        self.object.nrequests += 1;
        if self.object.nrequests >= self.params.const_lambda {
            tracing::debug!(
                page,
                requests = self.object.nrequests,
                "no answer, giving up for this round"
            );
            self.object.nrequests = 0;
            self.transition(State::Maintain);
        } else {
            self.timers.rx.reset(now);
        }
    }

    pub fn handle_request(&mut self, msg: &Request, now: Instant) {
        let page = msg.pagenum as usize;
        if page >= self.object.page_count() {
            tracing::trace!(page, "request for a page we do not have");
            return;
        }

        if msg.version != self.object.version {
            self.neighbor_inconsistency = true;
            return;
        }
        if !self.object.pages[page].is_complete() {
            return;
        }

        let all = self.object.geometry().all_packets();
        self.object.pages[page].last_request = Some(now);
        if self.object.current_tx_page == Some(page) {
            self.object.tx_set |= msg.request_set & all;
        } else {
            self.object.current_tx_page = Some(page);
            self.object.tx_set = msg.request_set & all;
        }
        tracing::trace!(page, tx_set = self.object.tx_set, "request accepted");

        self.transition(State::Tx);
        self.timers.tx.set(now, self.params.tx_delay);
    }

    // ── Transmission ─────────────────────────────────────────────────────────

    pub fn tx_callback(&mut self, now: Instant) {
        let page = match self.object.current_tx_page {
            Some(p) if self.object.tx_set != 0 => p,
            _ => {
                self.object.current_tx_page = None;
                self.transition(State::Maintain);
                return;
            }
        };

        self.send_page(page);
        if self.object.tx_set != 0 {
            self.stream_hint = Some(StreamHint::Stream);
            self.timers.tx.reset(now);
        } else {
            self.stream_hint = Some(StreamHint::StreamEnd);
            self.object.current_tx_page = None;
            self.transition(State::Maintain);
        }
    }

    /// Broadcast every packet of `page` whose bit is set in `tx_set`.
    pub fn send_page(&mut self, page: usize) {
        let data = match self.object.read_page(page) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(page, error = %e, "failed to read page for sending");
                self.object.tx_set = 0;
                return;
            }
        };

        let geometry = self.object.geometry();
        let version = self.object.pages[page].version;
        for packetnum in 0..geometry.packets_per_page() {
            if self.object.tx_set & (1 << packetnum) == 0 {
                continue;
            }
            let mut payload = [0u8; PACKET_SIZE];
            payload.copy_from_slice(&data[geometry.packet_range(packetnum)]);
            let msg = Packet {
                version,
                pagenum: page_byte(page),
                packetnum,
                crc: crc16(&payload),
                object_id: self.object.object_id(),
                payload,
            };
            self.outbox
                .push(Outgoing::broadcast(Message::Packet(msg).encode()));
        }
        tracing::trace!(page, tx_set = self.object.tx_set, "page sent");
        self.object.tx_set = 0;
    }

    // ── Reception ────────────────────────────────────────────────────────────

    pub fn handle_packet(&mut self, msg: &Packet, now: Instant) {
        let page = msg.pagenum as usize;
        if page != self.object.current_rx_page || page >= self.object.page_count() {
            tracing::trace!(
                page,
                current = self.object.current_rx_page,
                "packet for another page, dropping"
            );
            return;
        }

        if msg.version != self.object.version {
            self.neighbor_inconsistency = true;
        }

        let geometry = self.object.geometry();
        if msg.packetnum >= geometry.packets_per_page() {
            tracing::trace!(packetnum = msg.packetnum, "packet number out of range");
            return;
        }
        let bit = 1u8 << msg.packetnum;
        {
            let p = &self.object.pages[page];
            if msg.version != p.version || p.is_complete() || p.packet_set & bit != 0 {
                return;
            }
        }

        let crc = crc16(&msg.payload);
        if crc != msg.crc {
            tracing::debug!(
                page,
                packetnum = msg.packetnum,
                expected = msg.crc,
                crc,
                "packet crc mismatch"
            );
            return;
        }

        self.object.rx_buffer[geometry.packet_range(msg.packetnum)].copy_from_slice(&msg.payload);
        let p = &mut self.object.pages[page];
        p.last_data = Some(now);
        p.packet_set |= bit;

        if p.packet_set == geometry.all_packets() {
            self.stream_hint = Some(StreamHint::StreamEnd);
            self.complete_page(page, now);
        } else {
            self.stream_hint = Some(StreamHint::Stream);
        }
    }

    fn complete_page(&mut self, page: usize, now: Instant) {
        let data = std::mem::take(&mut self.object.rx_buffer);
        let written = self.object.write_page(page, &data);
        let crc = crc16(&data);
        self.object.rx_buffer = data;
        self.object.rx_buffer.fill(0);

        if let Err(e) = written {
            tracing::warn!(page, error = %e, "failed to write page, refetching");
            self.object.pages[page].packet_set = 0;
            return;
        }

        let p = &mut self.object.pages[page];
        p.crc = crc;
        p.flags |= PAGE_COMPLETE;
        let version = p.version;
        self.object.nrequests = 0;
        self.object.current_rx_page = self.object.highest_available_page();
        tracing::debug!(page, version, "page complete");

        if self.object.current_rx_page >= self.object.page_count() {
            self.finish_update();
        } else {
            self.transition(State::Rx);
            if !self.timers.rx.is_armed() {
                let delay = self.request_delay();
                self.timers.rx.set(now, delay);
            }
        }
    }

    fn finish_update(&mut self) {
        self.object.version = self.object.update_version;
        tracing::info!(
            object_id = self.object.object_id(),
            version = self.object.version,
            pages = self.object.page_count(),
            "update completed"
        );
        self.transition(State::Maintain);
    }

    // ── Profiles ─────────────────────────────────────────────────────────────

    pub fn handle_profile(&mut self, msg: &Profile, sender: SocketAddr, now: Instant) {
        if msg.version <= self.object.update_version {
            return;
        }
        if msg.version_vector.len() > MAX_PAGES {
            return;
        }

        if let Err(e) = self.object.apply_version_vector(&msg.version_vector) {
            tracing::warn!(error = %e, npages = msg.version_vector.len(), "cannot grow page table");
            return;
        }
        self.object.tx_set = 0;
        self.object.current_tx_page = None;
        self.object.nrequests = 0;
        self.object.update_version = msg.version;
        self.summary_from = Some(sender);

        tracing::info!(
            peer = %sender,
            version = msg.version,
            npages = msg.version_vector.len(),
            first_missing = self.object.current_rx_page,
            "profile accepted"
        );

        if self.object.current_rx_page >= self.object.page_count() {
            self.finish_update();
            return;
        }
        self.transition(State::Rx);
        let delay = self.request_delay();
        self.timers.rx.set(now, delay);
    }

    // ── Helpers ──────────────────────────────────────────────────────────────

    /// Leave the current state, stopping the timers it owns.
    fn transition(&mut self, to: State) {
        if self.state == to {
            return;
        }
        match self.state {
            State::Maintain => {
                self.timers.summary.stop();
                self.timers.profile.stop();
            }
            State::Rx => self.timers.rx.stop(),
            State::Tx => self.timers.tx.stop(),
        }
        tracing::debug!(from = ?self.state, to = ?to, "state transition");
        self.state = to;
    }

    /// `omega * tx_time + random(T_R)`.
    fn request_delay(&mut self) -> Duration {
        self.params.estimated_tx_time * self.params.const_omega + self.random_below(self.params.t_r)
    }

    fn random_below(&mut self, bound: Duration) -> Duration {
        let ms = bound.as_millis() as u64;
        if ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(self.rng.gen_range(0..ms))
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn state(&self) -> State {
        self.state
    }

    pub fn object(&self) -> &DisseminationObject<S> {
        &self.object
    }

    pub fn object_mut(&mut self) -> &mut DisseminationObject<S> {
        &mut self.object
    }

    pub fn into_object(self) -> DisseminationObject<S> {
        self.object
    }

    pub fn r_interval(&self) -> Duration {
        self.r_interval
    }

    /// A neighbour advertised an older version during this round.
    pub fn heard_stale_summary(&self) -> bool {
        self.old_summary
    }

    pub fn stream_hint(&self) -> Option<StreamHint> {
        self.stream_hint
    }

    pub fn timer_deadline(&self, kind: TimerKind) -> Option<Instant> {
        self.timers.get(kind).deadline
    }
}

/// Time since the oldest stamp; `None` if any stamp was never set.
fn oldest_age(now: Instant, stamps: impl Iterator<Item = Option<Instant>>) -> Option<Duration> {
    let mut oldest = now;
    for stamp in stamps {
        oldest = oldest.min(stamp?);
    }
    Some(now.saturating_duration_since(oldest))
}

/// Page indices are bounded by `MAX_PAGES` and fit a byte.
fn page_byte(page: usize) -> u8 {
    page.min(MAX_PAGES) as u8
}
