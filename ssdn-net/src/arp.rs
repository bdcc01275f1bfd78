//! ARP resolution for the virtual gateway.
//!
//! The gateway answers who-has requests for its own address and learns
//! container MACs from is-at replies to queries it sent itself. Learned
//! entries live in an [`ArpTable`] owned by a single service task; every
//! change publishes a new immutable table to registered listeners.
//!
//! Frames are assumed untagged (fixed 14-byte Ethernet header).

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use smoltcp::wire::{
    ArpHardware, ArpOperation, ArpPacket, EthernetAddress, EthernetFrame, EthernetProtocol,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::packet::{ETHERNET_HEADER_SIZE, PacketBuffer, PacketPool, PacketQueue};

pub type MacAddr = [u8; 6];

const BROADCAST_MAC: MacAddr = [0xFF; 6];

/// Ethernet header plus an IPv4-over-Ethernet ARP body.
pub const ARP_FRAME_SIZE: usize = ETHERNET_HEADER_SIZE + 28;

/// Offset of the IPv4 destination address within an Ethernet frame.
const DEST_IP_OFFSET: usize = ETHERNET_HEADER_SIZE + 16;

const RESOLVE_ATTEMPTS: usize = 3;
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ArpError {
    #[error("already resolving {0}")]
    AlreadyResolving(Ipv4Addr),

    #[error("failed to resolve {0}")]
    Unresolved(Ipv4Addr),

    #[error("packet buffer too small for an ARP frame: {0} bytes")]
    BufferTooSmall(usize),

    #[error("ARP tracker is not running")]
    Stopped,
}

/// Render a MAC address as lowercase colon-separated hex.
pub fn format_mac(mac: &MacAddr) -> String {
    mac.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Parse the colon-separated form produced by [`format_mac`].
pub fn parse_mac(s: &str) -> Option<MacAddr> {
    let mut mac: MacAddr = [0; 6];
    let mut parts = s.split(':');
    for byte in mac.iter_mut() {
        let part = parts.next()?;
        if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        *byte = u8::from_str_radix(part, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(mac)
}

/// Random locally administered unicast MAC address.
pub fn random_mac() -> MacAddr {
    let mut mac: MacAddr = rand::random();
    mac[0] &= 0xFE;
    mac[0] |= 0x02;
    mac
}

/// Immutable IPv4 to MAC mapping. Cloning is cheap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArpTable {
    entries: Arc<HashMap<u32, MacAddr>>,
}

impl ArpTable {
    pub fn get(&self, ip: Ipv4Addr) -> Option<MacAddr> {
        self.entries.get(&u32::from(ip)).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn with(&self, ip: u32, mac: MacAddr) -> Self {
        let mut entries = (*self.entries).clone();
        entries.insert(ip, mac);
        Self {
            entries: Arc::new(entries),
        }
    }

    fn without(&self, ip: u32) -> Self {
        let mut entries = (*self.entries).clone();
        entries.remove(&ip);
        Self {
            entries: Arc::new(entries),
        }
    }

    /// Address an IPv4 frame to the MAC known for its destination IP.
    ///
    /// Returns false, leaving the frame untouched, for non-IPv4 frames and
    /// unknown destinations.
    pub fn set_destination_mac(&self, frame: &mut [u8], src_mac: MacAddr) -> bool {
        if frame.len() < DEST_IP_OFFSET + 4 || frame[12] != 0x08 || frame[13] != 0x00 {
            return false;
        }
        let dest = u32::from_be_bytes([
            frame[DEST_IP_OFFSET],
            frame[DEST_IP_OFFSET + 1],
            frame[DEST_IP_OFFSET + 2],
            frame[DEST_IP_OFFSET + 3],
        ]);
        let Some(mac) = self.entries.get(&dest) else {
            return false;
        };
        let mut eth = EthernetFrame::new_unchecked(frame);
        eth.set_dst_addr(EthernetAddress(*mac));
        eth.set_src_addr(EthernetAddress(src_mac));
        true
    }

    pub fn string_map(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .map(|(ip, mac)| (Ipv4Addr::from(*ip).to_string(), format_mac(mac)))
            .collect()
    }
}

/// Result of [`ArpTracker::process`]. Every variant that carries the
/// buffer hands ownership back to the caller.
#[derive(Debug)]
pub enum ArpOutcome {
    /// Not an ARP frame; forward it normally.
    NotArp(PacketBuffer),
    /// Malformed ARP or a request for another address.
    Unsupported(PacketBuffer),
    /// Rewritten in place into a reply to send back out.
    Reply(PacketBuffer),
    /// Consumed by the tracker.
    Processing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArpListenerId(u64);

pub type ArpListener = mpsc::UnboundedSender<ArpTable>;

enum Request {
    Stop,
    Snapshot(oneshot::Sender<ArpTable>),
    AddListener(ArpListenerId, ArpListener),
    RemoveListener(ArpListenerId),
    Seed(u32, MacAddr),
    Unseed(u32),
    Reply(PacketBuffer),
}

/// Outstanding queries: at most one per IP. The sender is taken when the
/// reply arrives; the slot stays occupied until the query is untracked.
type Trackers = HashMap<u32, Option<oneshot::Sender<MacAddr>>>;

pub struct ArpTracker {
    local_ip: Ipv4Addr,
    local_mac: MacAddr,

    trackers: Mutex<Trackers>,

    control: mpsc::UnboundedSender<Request>,
    control_rx: Mutex<Option<mpsc::UnboundedReceiver<Request>>>,
    next_listener: AtomicU64,
}

impl ArpTracker {
    pub fn new(local_ip: Ipv4Addr, local_mac: MacAddr) -> Arc<Self> {
        let (control, control_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            local_ip,
            local_mac,
            trackers: Mutex::new(HashMap::new()),
            control,
            control_rx: Mutex::new(Some(control_rx)),
            next_listener: AtomicU64::new(1),
        })
    }

    pub fn local_ip(&self) -> Ipv4Addr {
        self.local_ip
    }

    pub fn local_mac(&self) -> MacAddr {
        self.local_mac
    }

    /// Spawn the service task. Only the first call has an effect.
    pub fn start(self: &Arc<Self>) {
        let rx = self
            .control_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(rx) = rx {
            tokio::spawn(Arc::clone(self).service(rx));
        }
    }

    pub fn stop(&self) {
        let _ = self.control.send(Request::Stop);
    }

    pub async fn snapshot(&self) -> Result<ArpTable, ArpError> {
        let (tx, rx) = oneshot::channel();
        self.control
            .send(Request::Snapshot(tx))
            .map_err(|_| ArpError::Stopped)?;
        rx.await.map_err(|_| ArpError::Stopped)
    }

    /// Register a listener. It is sent the current table first, then every
    /// new table.
    pub fn add_listener(&self, listener: ArpListener) -> ArpListenerId {
        let id = ArpListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        let _ = self.control.send(Request::AddListener(id, listener));
        id
    }

    pub fn remove_listener(&self, id: ArpListenerId) {
        let _ = self.control.send(Request::RemoveListener(id));
    }

    /// Record a MAC known without asking (e.g. from container inspection).
    pub fn seed(&self, ip: Ipv4Addr, mac: MacAddr) {
        let _ = self.control.send(Request::Seed(u32::from(ip), mac));
    }

    pub fn unseed(&self, ip: Ipv4Addr) {
        let _ = self.control.send(Request::Unseed(u32::from(ip)));
    }

    fn trackers(&self) -> MutexGuard<'_, Trackers> {
        self.trackers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim the query slot for `ip`. Fails if a query is already out.
    pub fn track_query(&self, ip: Ipv4Addr, resolved: oneshot::Sender<MacAddr>) -> bool {
        let mut trackers = self.trackers();
        let key = u32::from(ip);
        if trackers.contains_key(&key) {
            return false;
        }
        trackers.insert(key, Some(resolved));
        true
    }

    pub fn untrack_query(&self, ip: Ipv4Addr) {
        self.trackers().remove(&u32::from(ip));
    }

    /// Write a broadcast who-has for `ip` into `packet`.
    pub fn generate_query(&self, packet: &mut PacketBuffer, ip: Ipv4Addr) -> Result<(), ArpError> {
        if packet.capacity() < ARP_FRAME_SIZE {
            return Err(ArpError::BufferTooSmall(packet.capacity()));
        }
        packet.set_len(ARP_FRAME_SIZE);

        let mut eth = EthernetFrame::new_unchecked(&mut packet[..]);
        eth.set_dst_addr(EthernetAddress(BROADCAST_MAC));
        eth.set_src_addr(EthernetAddress(self.local_mac));
        eth.set_ethertype(EthernetProtocol::Arp);

        let mut arp = ArpPacket::new_unchecked(eth.payload_mut());
        arp.set_hardware_type(ArpHardware::Ethernet);
        arp.set_protocol_type(EthernetProtocol::Ipv4);
        arp.set_hardware_len(6);
        arp.set_protocol_len(4);
        arp.set_operation(ArpOperation::Request);
        arp.set_source_hardware_addr(&self.local_mac);
        arp.set_source_protocol_addr(&self.local_ip.octets());
        arp.set_target_hardware_addr(&BROADCAST_MAC);
        arp.set_target_protocol_addr(&ip.octets());
        Ok(())
    }

    /// Classify an inbound frame and handle it if it is ARP.
    pub fn process(&self, mut packet: PacketBuffer) -> ArpOutcome {
        if packet.len() < ARP_FRAME_SIZE {
            return ArpOutcome::NotArp(packet);
        }

        let operation = {
            let eth = EthernetFrame::new_unchecked(&packet[..]);
            if eth.ethertype() != EthernetProtocol::Arp {
                return ArpOutcome::NotArp(packet);
            }
            let arp = ArpPacket::new_unchecked(eth.payload());
            if arp.protocol_type() != EthernetProtocol::Ipv4
                || arp.hardware_len() != 6
                || arp.protocol_len() != 4
            {
                return ArpOutcome::Unsupported(packet);
            }
            arp.operation()
        };

        match operation {
            ArpOperation::Request => {
                debug!("Received ARP who-has");
                if self.answer_request(&mut packet) {
                    ArpOutcome::Reply(packet)
                } else {
                    ArpOutcome::Unsupported(packet)
                }
            }
            ArpOperation::Reply => {
                debug!("Received ARP is-at");
                // a stopped service drops the buffer, returning it to its pool
                let _ = self.control.send(Request::Reply(packet));
                ArpOutcome::Processing
            }
            _ => ArpOutcome::Unsupported(packet),
        }
    }

    /// Turn a who-has for our own address into the matching is-at.
    fn answer_request(&self, packet: &mut PacketBuffer) -> bool {
        let local_ip = self.local_ip.octets();
        let mut eth = EthernetFrame::new_unchecked(&mut packet[..]);
        let requester_mac = eth.src_addr();

        let mut arp = ArpPacket::new_unchecked(eth.payload_mut());
        if arp.target_protocol_addr() != local_ip {
            return false;
        }
        info!(ip = %self.local_ip, "Responding to ARP request");

        let mut sender_mac = [0u8; 6];
        sender_mac.copy_from_slice(arp.source_hardware_addr());
        let mut sender_ip = [0u8; 4];
        sender_ip.copy_from_slice(arp.source_protocol_addr());

        arp.set_operation(ArpOperation::Reply);
        arp.set_target_hardware_addr(&sender_mac);
        arp.set_target_protocol_addr(&sender_ip);
        arp.set_source_hardware_addr(&self.local_mac);
        arp.set_source_protocol_addr(&local_ip);

        eth.set_dst_addr(requester_mac);
        eth.set_src_addr(EthernetAddress(self.local_mac));
        true
    }

    /// Hand a resolved MAC to the query waiting for `ip`, if any.
    fn complete_query(&self, ip: u32, mac: MacAddr) -> bool {
        let mut trackers = self.trackers();
        match trackers.get_mut(&ip) {
            Some(slot) => {
                if let Some(resolved) = slot.take() {
                    let _ = resolved.send(mac);
                }
                true
            }
            None => false,
        }
    }

    async fn service(self: Arc<Self>, mut control: mpsc::UnboundedReceiver<Request>) {
        let mut table = ArpTable::default();
        let mut listeners: Vec<(ArpListenerId, ArpListener)> = Vec::new();

        while let Some(request) = control.recv().await {
            let updated = match request {
                Request::Stop => break,
                Request::Snapshot(tx) => {
                    let _ = tx.send(table.clone());
                    None
                }
                Request::AddListener(id, listener) => {
                    if listener.send(table.clone()).is_ok() {
                        listeners.push((id, listener));
                    }
                    None
                }
                Request::RemoveListener(id) => {
                    listeners.retain(|(lid, _)| *lid != id);
                    None
                }
                Request::Seed(ip, mac) => Some(table.with(ip, mac)),
                Request::Unseed(ip) => Some(table.without(ip)),
                Request::Reply(packet) => {
                    let (ip, mac) = reply_sender(&packet);
                    info!(ip = %Ipv4Addr::from(ip), mac = %format_mac(&mac), "ARP response");
                    if self.complete_query(ip, mac) {
                        Some(table.with(ip, mac))
                    } else {
                        debug!(ip = %Ipv4Addr::from(ip), "Ignoring unsolicited ARP response");
                        None
                    }
                }
            };

            if let Some(updated) = updated {
                table = updated;
                listeners.retain(|(_, tx)| tx.send(table.clone()).is_ok());
            }
        }
        debug!(ip = %self.local_ip, "ARP tracker stopped");
    }
}

fn reply_sender(packet: &PacketBuffer) -> (u32, MacAddr) {
    let eth = EthernetFrame::new_unchecked(&packet[..]);
    let arp = ArpPacket::new_unchecked(eth.payload());
    let mut mac = [0u8; 6];
    mac.copy_from_slice(arp.source_hardware_addr());
    let ip = arp.source_protocol_addr();
    (u32::from_be_bytes([ip[0], ip[1], ip[2], ip[3]]), mac)
}

/// Untracks its query when dropped.
struct QueryGuard<'a> {
    tracker: &'a ArpTracker,
    ip: Ipv4Addr,
}

impl Drop for QueryGuard<'_> {
    fn drop(&mut self) {
        self.tracker.untrack_query(self.ip);
    }
}

/// Resolve `ip` by broadcasting who-has on `out`, with buffers from `free`.
///
/// Sends up to three queries, waiting a second for each.
pub async fn resolve(
    tracker: &ArpTracker,
    free: &Arc<PacketPool>,
    out: &PacketQueue,
    ip: Ipv4Addr,
) -> Result<MacAddr, ArpError> {
    let (tx, mut rx) = oneshot::channel();
    if !tracker.track_query(ip, tx) {
        return Err(ArpError::AlreadyResolving(ip));
    }
    let _guard = QueryGuard { tracker, ip };

    for _ in 0..RESOLVE_ATTEMPTS {
        let mut packet = free.acquire().await;
        tracker.generate_query(&mut packet, ip)?;
        out.send(packet).await;
        debug!(ip = %ip, "Sent ARP request");

        match tokio::time::timeout(RESOLVE_TIMEOUT, &mut rx).await {
            Ok(Ok(mac)) => return Ok(mac),
            Ok(Err(_)) => break,
            Err(_) => {}
        }
    }

    warn!(ip = %ip, "Failed to resolve");
    Err(ArpError::Unresolved(ip))
}
