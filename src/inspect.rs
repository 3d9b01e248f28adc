use crate::dns::{DecodeOutcome, DnsMessage};
use crate::dns_cache::ResponseCache;
use crate::endpoint::TransportKind;
use std::sync::Arc;

/// Inspector-visible view of one relayed flow: the bytes seen in each
/// direction plus the verdict flags the owning session applies after every
/// inspection pass.
pub struct DuplexFlow {
    transport: TransportKind,
    request_data: Vec<u8>,
    response_data: Vec<u8>,
    idle_hint: Option<u64>,
    errored: bool,
}

impl DuplexFlow {
    pub fn new(transport: TransportKind) -> Self {
        Self {
            transport,
            request_data: Vec::new(),
            response_data: Vec::new(),
            idle_hint: None,
            errored: false,
        }
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn push_request(&mut self, bytes: &[u8]) {
        self.request_data.extend_from_slice(bytes);
    }

    pub fn push_response(&mut self, bytes: &[u8]) {
        self.response_data.extend_from_slice(bytes);
    }

    pub fn request_data(&self) -> &[u8] {
        &self.request_data
    }

    pub fn response_data(&self) -> &[u8] {
        &self.response_data
    }

    /// Discards the response bytes pending delivery toward the client.
    pub fn clear_pending_write(&mut self) {
        self.response_data.clear();
    }

    pub fn set_error(&mut self) {
        self.errored = true;
    }

    pub fn errored(&self) -> bool {
        self.errored
    }

    /// Advisory inactivity bound, in seconds. Enforcement is up to the loop
    /// owning the flow; the inspector only tunes it.
    pub fn set_idle_hint(&mut self, secs: u64) {
        self.idle_hint = Some(secs);
    }

    pub fn take_idle_hint(&mut self) -> Option<u64> {
        self.idle_hint.take()
    }
}

const STAGE_REQUEST: u8 = 0;
const STAGE_RESPONSE: u8 = 1;

/// Per-flow DNS inspection state machine. Driven once per byte-arrival event;
/// never blocks, it just returns and waits to be driven again.
pub struct DnsInspector {
    stage: u8,
    framed: bool,
    completed: bool,
    result: bool,
    req: DnsMessage,
    resp: DnsMessage,
    cache: Arc<ResponseCache>,
}

impl DnsInspector {
    pub fn new(transport: TransportKind, cache: Arc<ResponseCache>) -> Self {
        Self {
            stage: STAGE_REQUEST,
            framed: transport.supports_framing(),
            completed: false,
            result: false,
            req: DnsMessage::default(),
            resp: DnsMessage::default(),
            cache,
        }
    }

    /// Once set, the owning flow must stop driving this inspector.
    pub fn completed(&self) -> bool {
        self.completed
    }

    pub fn result(&self) -> bool {
        self.result
    }

    pub fn request(&self) -> &DnsMessage {
        &self.req
    }

    pub fn response(&self) -> &DnsMessage {
        &self.resp
    }

    pub fn update(&mut self, flow: &mut DuplexFlow) {
        if self.completed || self.stage > STAGE_RESPONSE {
            return;
        }
        let framed = self.framed;
        let stage = self.stage;
        let outcome = {
            let (msg, buf) = match stage {
                STAGE_REQUEST => (&mut self.req, flow.request_data()),
                STAGE_RESPONSE => (&mut self.resp, flow.response_data()),
                _ => return,
            };
            if buf.is_empty() {
                log::debug!("DnsInspector::update: not enough data at stage {stage}");
                return;
            }
            if framed {
                if buf.len() < 2 {
                    return;
                }
                let framed_len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
                let Some(view) = buf.get(2..2 + framed_len) else {
                    // frame not fully buffered yet
                    return;
                };
                if framed_len + 2 != buf.len() {
                    log::warn!(
                        "dns inspection: processed {} framed bytes but {} were buffered",
                        framed_len,
                        buf.len()
                    );
                }
                msg.load(view)
            } else {
                msg.load(buf)
            }
        };

        if !outcome.is_ok() {
            log::debug!("dns inspection: parser failed at stage {stage}");
            self.completed = true;
            self.result = false;
            return;
        }
        if let DecodeOutcome::Leftover(consumed) = outcome {
            log::debug!("dns inspection: stage {stage} left {consumed} consumed bytes behind");
        }

        self.stage += 1;
        if self.stage == STAGE_RESPONSE {
            // the request was recognized, a reply should arrive quickly
            flow.set_idle_hint(10);
            log::debug!("dns request: {}", self.req);
        } else if self.stage >= 2 {
            self.completed = true;
            self.result = true;
            self.finish(flow);
        }
    }

    fn finish(&mut self, flow: &mut DuplexFlow) {
        let addresses = self.resp.answer_str();
        let is_address_response = !addresses.is_empty();
        if is_address_response {
            log::info!("dns inspection: {} is at{}", self.resp.question_str_0(), addresses);
        } else {
            log::info!("dns inspection: non-address response for {}", self.resp.question_str_0());
        }
        log::debug!("dns response: {}", self.resp);

        if self.req.id == self.resp.id {
            log::debug!("dns inspection: request and response id 0x{:04x} match", self.req.id);
            if is_address_response {
                let key = self.resp.question_str_0();
                let response = Arc::new(self.resp.clone());
                self.cache.with_lock(|cache| {
                    cache.insert(key.clone(), response);
                    log::info!(
                        "dns inspection: {} added to {} ({} of max {})",
                        key,
                        self.cache.label(),
                        cache.len(),
                        self.cache.max_size()
                    );
                });
            }
        } else {
            flow.clear_pending_write();
            flow.set_error();
            log::warn!(
                "dns inspection: blind reply attack: request id 0x{:04x} does not match response id 0x{:04x}",
                self.req.id,
                self.resp.id
            );
        }

        flow.set_idle_hint(if self.framed { 30 } else { 1 });
    }
}
