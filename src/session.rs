use crate::auth::{AuthTable, IdentityRecord};
use crate::dns_cache::ResponseCache;
use crate::endpoint::{Endpoint, TransportKind};
use crate::inspect::{DnsInspector, DuplexFlow};
use crate::policy::{apply_content_rules, ContentRule};
use crate::traflog::TrafficLog;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

static SESSION_ID: AtomicU64 = AtomicU64::new(0);

pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;

/// A paired left/right endpoint group relayed as one unit. Every method is a
/// single reaction to one event; waiting for I/O belongs to the loop owned by
/// the acceptor that created the session.
pub struct ProxySession {
    id: u64,
    left: Vec<Endpoint>,
    right: Vec<Endpoint>,
    tlog: Option<TrafficLog>,
    dead: bool,
    identity: Option<IdentityRecord>,
    identity_resolved: bool,
    identity_resolved_at: Option<SystemTime>,
    matched_policy: Option<String>,
    content_rules: Option<Vec<ContentRule>>,
    dns: Option<(DuplexFlow, DnsInspector)>,
    idle_timeout_secs: u64,
}

impl Default for ProxySession {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxySession {
    pub fn new() -> Self {
        Self {
            id: SESSION_ID.fetch_add(1, Ordering::Relaxed),
            left: Vec::new(),
            right: Vec::new(),
            tlog: None,
            dead: false,
            identity: None,
            identity_resolved: false,
            identity_resolved_at: None,
            matched_policy: None,
            content_rules: None,
            dns: None,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn dead(&self) -> bool {
        self.dead
    }

    pub fn set_dead(&mut self) {
        self.dead = true;
    }

    pub fn ladd(&mut self, cx: Endpoint) {
        self.left.push(cx);
    }

    pub fn radd(&mut self, cx: Endpoint) {
        self.right.push(cx);
    }

    pub fn left(&self) -> &[Endpoint] {
        &self.left
    }

    pub fn right(&self) -> &[Endpoint] {
        &self.right
    }

    pub fn left_mut(&mut self) -> &mut Vec<Endpoint> {
        &mut self.left
    }

    pub fn right_mut(&mut self) -> &mut Vec<Endpoint> {
        &mut self.right
    }

    pub(crate) fn sides_mut(&mut self) -> (&mut Vec<Endpoint>, &mut Vec<Endpoint>) {
        (&mut self.left, &mut self.right)
    }

    pub fn write_payload(&self) -> bool {
        self.tlog.is_some()
    }

    pub fn set_traffic_log(&mut self, tlog: TrafficLog) {
        self.tlog = Some(tlog);
    }

    pub fn set_content_rules(&mut self, rules: Vec<ContentRule>) {
        self.content_rules = Some(rules);
    }

    pub fn content_rules(&self) -> Option<&[ContentRule]> {
        self.content_rules.as_deref()
    }

    pub fn matched_policy(&self) -> Option<&str> {
        self.matched_policy.as_deref()
    }

    pub fn set_matched_policy(&mut self, tag: &str) {
        self.matched_policy = Some(tag.to_string());
    }

    pub fn idle_timeout_secs(&self) -> u64 {
        self.idle_timeout_secs
    }

    pub fn set_idle_timeout_secs(&mut self, secs: u64) {
        self.idle_timeout_secs = secs;
    }

    /// Starts DNS inspection on this session's flow.
    pub fn enable_dns_inspection(&mut self, transport: TransportKind, cache: Arc<ResponseCache>) {
        self.dns = Some((DuplexFlow::new(transport), DnsInspector::new(transport, cache)));
    }

    pub fn dns_inspector(&self) -> Option<&DnsInspector> {
        self.dns.as_ref().map(|(_, inspector)| inspector)
    }

    pub fn identity(&self) -> Option<&IdentityRecord> {
        self.identity.as_ref()
    }

    pub fn identity_resolved(&self) -> bool {
        self.identity_resolved
    }

    /// Looks up the client identity once per connection; records the attempt
    /// regardless of its outcome.
    pub fn resolve_identity(&mut self, auth: &AuthTable) -> bool {
        if self.identity_resolved {
            return self.identity.is_some();
        }
        self.identity_resolved = true;
        self.identity_resolved_at = Some(SystemTime::now());
        let Some(peer) = self.left.first().and_then(|cx| cx.peer_addr()) else {
            return false;
        };
        let ip = peer.ip().to_string();
        self.identity = auth.get(&ip);
        if self.identity.is_some() {
            auth.touch(&ip);
            if let Some(tag) = self.matched_policy.as_deref() {
                auth.set_last_policy(&ip, tag);
            }
            log::debug!("session #{}: identity {} resolved for {}", self.id, self.identity.as_ref().map(|i| i.username.as_str()).unwrap_or(""), ip);
        }
        self.identity.is_some()
    }

    /// New processed bytes are available on a left endpoint: log them and fan
    /// them out to every right endpoint.
    pub fn on_left_bytes(&mut self, idx: usize) {
        if self.dead {
            return;
        }
        let data = {
            let Some(cx) = self.left.get_mut(idx) else { return };
            if let Some(tlog) = self.tlog.as_mut() {
                let backlog = cx.take_log();
                if !backlog.is_empty() {
                    tlog.write_text('L', &backlog);
                }
                tlog.write('L', cx.to_read());
            }
            let raw = cx.to_read().to_vec();
            cx.consume_read();
            raw
        };
        if data.is_empty() {
            return;
        }
        let data = match self.content_rules.as_deref() {
            Some(rules) if !rules.is_empty() => apply_content_rules(rules, &data),
            _ => data,
        };
        if let Some((flow, inspector)) = self.dns.as_mut() {
            if !inspector.completed() {
                flow.push_request(&data);
                inspector.update(flow);
            }
        }
        self.apply_flow_verdicts();
        if self.dead {
            return;
        }
        for peer in self.right.iter_mut() {
            peer.to_write(&data);
        }
    }

    /// New processed bytes are available on a right endpoint: inspect first,
    /// then fan out to every left endpoint.
    pub fn on_right_bytes(&mut self, idx: usize) {
        if self.dead {
            return;
        }
        let data = {
            let Some(cx) = self.right.get_mut(idx) else { return };
            if let Some(tlog) = self.tlog.as_mut() {
                let backlog = cx.take_log();
                if !backlog.is_empty() {
                    tlog.write_text('R', &backlog);
                }
                tlog.write('R', cx.to_read());
            }
            let raw = cx.to_read().to_vec();
            cx.consume_read();
            raw
        };
        if data.is_empty() {
            return;
        }
        if let Some((flow, inspector)) = self.dns.as_mut() {
            if !inspector.completed() {
                flow.push_response(&data);
                inspector.update(flow);
            }
        }
        self.apply_flow_verdicts();
        if self.dead {
            return;
        }
        for peer in self.left.iter_mut() {
            peer.to_write(&data);
        }
    }

    /// Applies the inspector's verdict flags to the session: idle hints and,
    /// on a protocol-integrity violation, the flow-level error that vetoes
    /// delivery.
    fn apply_flow_verdicts(&mut self) {
        let Some((flow, _)) = self.dns.as_mut() else { return };
        if let Some(hint) = flow.take_idle_hint() {
            self.idle_timeout_secs = hint;
        }
        if flow.errored() && !self.dead {
            for cx in self.left.iter_mut() {
                cx.clear_write_buf();
            }
            self.dead = true;
            log::warn!("session #{}: flow errored by inspection, proxy marked dead", self.id);
        }
    }

    pub fn on_left_error(&mut self, idx: usize) {
        let Some(cx) = self.left.get_mut(idx) else { return };
        if let Some(tlog) = self.tlog.as_mut() {
            tlog.left_write(&format!("Client side connection closed: {}\n", cx.name()));
        }
        log::info!(
            "Connection from {} closed, sent={}/{}B received={}/{}B, flags=L",
            cx.name(),
            cx.meter_read_count,
            cx.meter_read_bytes,
            cx.meter_write_count,
            cx.meter_write_bytes
        );
        self.dead = true;
    }

    pub fn on_right_error(&mut self, idx: usize) {
        let Some(cx) = self.right.get_mut(idx) else { return };
        if let Some(tlog) = self.tlog.as_mut() {
            tlog.right_write(&format!("Server side connection closed: {}\n", cx.name()));
        }
        log::info!(
            "Connection from {} closed, sent={}/{}B received={}/{}B, flags=R",
            cx.name(),
            cx.meter_write_count,
            cx.meter_write_bytes,
            cx.meter_read_count,
            cx.meter_read_bytes
        );
        self.dead = true;
    }

    /// Flushes every endpoint's queued output to its socket. Write failures
    /// are fatal to the whole session.
    pub(crate) async fn flush_writes(&mut self) {
        for idx in 0..self.left.len() {
            if self.left[idx].is_detached() || self.left[idx].pending_write() == 0 {
                continue;
            }
            if let Err(err) = self.left[idx].flush_write().await {
                log::debug!("session #{}: left write failed: {}", self.id, err);
                self.on_left_error(idx);
                return;
            }
        }
        for idx in 0..self.right.len() {
            if self.right[idx].is_detached() || self.right[idx].pending_write() == 0 {
                continue;
            }
            if let Err(err) = self.right[idx].flush_write().await {
                log::debug!("session #{}: right write failed: {}", self.id, err);
                self.on_right_error(idx);
                return;
            }
        }
    }
}

impl std::fmt::Display for ProxySession {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let left = self.left.first().map(|cx| cx.name().to_string()).unwrap_or_default();
        let right = self.right.first().map(|cx| cx.name().to_string()).unwrap_or_default();
        write!(f, "#{} {} -> {}", self.id, left, right)
    }
}

impl Drop for ProxySession {
    fn drop(&mut self) {
        if let Some(tlog) = self.tlog.as_mut() {
            for cx in self.left.iter_mut() {
                let backlog = cx.take_log();
                if !backlog.is_empty() {
                    tlog.write_text('L', &backlog);
                }
            }
            for cx in self.right.iter_mut() {
                let backlog = cx.take_log();
                if !backlog.is_empty() {
                    tlog.write_text('R', &backlog);
                }
            }
            tlog.left_write("Connection stop\n");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::TYPE_A;

    fn detached(name: &str) -> Endpoint {
        Endpoint::detached(TransportKind::Tcp, name.into())
    }

    fn push_name(buf: &mut Vec<u8>, name: &str) {
        for label in name.split('.') {
            buf.push(label.len() as u8);
            buf.extend_from_slice(label.as_bytes());
        }
        buf.push(0);
    }

    fn udp_query(id: u16, name: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&id.to_be_bytes());
        buf.extend_from_slice(&0x0100_u16.to_be_bytes());
        buf.extend_from_slice(&[0, 1, 0, 0, 0, 0, 0, 0]);
        push_name(&mut buf, name);
        buf.extend_from_slice(&TYPE_A.to_be_bytes());
        buf.extend_from_slice(&1_u16.to_be_bytes());
        buf
    }

    fn udp_response(id: u16, name: &str, addr: [u8; 4]) -> Vec<u8> {
        let mut buf = udp_query(id, name);
        buf[2] = 0x81;
        buf[3] = 0x80;
        buf[6..8].copy_from_slice(&1_u16.to_be_bytes());
        buf.extend_from_slice(&0xC00C_u16.to_be_bytes());
        buf.extend_from_slice(&TYPE_A.to_be_bytes());
        buf.extend_from_slice(&1_u16.to_be_bytes());
        buf.extend_from_slice(&60_u32.to_be_bytes());
        buf.extend_from_slice(&4_u16.to_be_bytes());
        buf.extend_from_slice(&addr);
        buf
    }

    #[test]
    fn left_bytes_fan_out_to_every_right_endpoint() {
        let mut session = ProxySession::new();
        session.ladd(detached("client"));
        session.radd(detached("server-a"));
        session.radd(detached("server-b"));

        session.left_mut()[0].inject_read(b"first");
        session.on_left_bytes(0);
        session.left_mut()[0].inject_read(b" second");
        session.on_left_bytes(0);

        assert_eq!(session.right()[0].pending_write(), b"first second".len());
        assert_eq!(session.right()[1].pending_write(), b"first second".len());
        // read buffer was wiped after forwarding
        assert!(session.left()[0].to_read().is_empty());
    }

    #[test]
    fn right_bytes_relay_back_to_left() {
        let mut session = ProxySession::new();
        session.ladd(detached("client"));
        session.radd(detached("server"));

        session.right_mut()[0].inject_read(b"response");
        session.on_right_bytes(0);
        assert_eq!(session.left()[0].pending_write(), b"response".len());
    }

    #[test]
    fn error_on_either_side_kills_whole_session() {
        let mut session = ProxySession::new();
        session.ladd(detached("client"));
        session.radd(detached("server"));

        session.on_right_error(0);
        assert!(session.dead());

        // no further relaying is dispatched once dead
        session.left_mut()[0].inject_read(b"late");
        session.on_left_bytes(0);
        assert_eq!(session.right()[0].pending_write(), 0);
    }

    #[test]
    fn content_rules_rewrite_client_payloads() {
        let mut session = ProxySession::new();
        session.ladd(detached("client"));
        session.radd(detached("server"));
        session.set_content_rules(vec![ContentRule::new(b"secret", b"[cut]")]);

        session.left_mut()[0].inject_read(b"my secret data");
        session.on_left_bytes(0);
        assert_eq!(session.right()[0].pending_write(), b"my [cut] data".len());
    }

    #[test]
    fn spoofed_dns_response_vetoes_delivery() {
        let cache = Arc::new(ResponseCache::new("test cache", 16, true));
        let mut session = ProxySession::new();
        session.ladd(detached("client"));
        session.radd(detached("resolver"));
        session.enable_dns_inspection(TransportKind::Udp, cache.clone());

        session.left_mut()[0].inject_read(&udp_query(0x1234, "example.com"));
        session.on_left_bytes(0);
        assert_eq!(session.right()[0].pending_write(), udp_query(0x1234, "example.com").len());

        session.right_mut()[0].inject_read(&udp_response(0x5678, "example.com", [6, 6, 6, 6]));
        session.on_right_bytes(0);

        assert!(session.dead(), "spoofed response forces the flow into error");
        assert_eq!(session.left()[0].pending_write(), 0, "spoofed bytes never delivered");
        assert!(cache.is_empty());
    }

    #[test]
    fn matched_dns_response_relays_and_caches() {
        let cache = Arc::new(ResponseCache::new("test cache", 16, true));
        let mut session = ProxySession::new();
        session.ladd(detached("client"));
        session.radd(detached("resolver"));
        session.enable_dns_inspection(TransportKind::Udp, cache.clone());

        session.left_mut()[0].inject_read(&udp_query(0x4321, "ok.example.com"));
        session.on_left_bytes(0);
        // request recognized, aggressive idle hint
        assert_eq!(session.idle_timeout_secs(), 10);

        let response = udp_response(0x4321, "ok.example.com", [93, 184, 216, 34]);
        session.right_mut()[0].inject_read(&response);
        session.on_right_bytes(0);

        assert!(!session.dead());
        assert_eq!(session.left()[0].pending_write(), response.len());
        assert!(cache.get("ok.example.com").is_some());
        assert_eq!(session.idle_timeout_secs(), 1);
    }

    #[test]
    fn identity_resolution_records_the_attempt() {
        let auth = AuthTable::new(std::time::Duration::from_secs(600));
        auth.refresh(vec![IdentityRecord::new("127.0.0.1", "alice", &["staff"])]);

        let mut session = ProxySession::new();
        let mut client = detached("client");
        client.set_peer_addr("127.0.0.1:55555".parse().unwrap());
        session.ladd(client);

        assert!(session.resolve_identity(&auth));
        assert!(session.identity_resolved());
        assert_eq!(session.identity().unwrap().username, "alice");

        // a session with an unknown peer still records the attempt
        let mut other = ProxySession::new();
        let mut stranger = detached("client");
        stranger.set_peer_addr("10.9.9.9:1".parse().unwrap());
        other.ladd(stranger);
        assert!(!other.resolve_identity(&auth));
        assert!(other.identity_resolved());
    }
}
