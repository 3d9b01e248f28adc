use crate::endpoint::Endpoint;
use crate::session::ProxySession;

/// Ordered search/replace rule applied to relayed client payloads.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ContentRule {
    pub search: Vec<u8>,
    pub replace: Vec<u8>,
}

impl ContentRule {
    pub fn new(search: &[u8], replace: &[u8]) -> Self {
        Self {
            search: search.to_vec(),
            replace: replace.to_vec(),
        }
    }
}

/// Applies every rule in order, replacing all non-overlapping occurrences.
pub fn apply_content_rules(rules: &[ContentRule], data: &[u8]) -> Vec<u8> {
    let mut current = data.to_vec();
    for rule in rules {
        if rule.search.is_empty() {
            continue;
        }
        let mut rewritten = Vec::with_capacity(current.len());
        let mut at = 0;
        while at < current.len() {
            if current[at..].starts_with(&rule.search) {
                rewritten.extend_from_slice(&rule.replace);
                at += rule.search.len();
            } else {
                rewritten.push(current[at]);
                at += 1;
            }
        }
        current = rewritten;
    }
    current
}

/// Decision returned by a policy evaluator for an accepted connection.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub tag: String,
    pub write_payload: bool,
    pub content_rules: Option<Vec<ContentRule>>,
}

impl Verdict {
    pub fn accept(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            write_payload: true,
            content_rules: None,
        }
    }
}

/// External policy seam: `None` vetoes the session, which is then discarded
/// instead of being registered.
pub trait PolicyEvaluator: Send + Sync {
    fn apply(&self, accepted_cx: &Endpoint, session: &ProxySession) -> Option<Verdict>;
}

/// Accepts everything; the default when no rule set is configured.
pub struct AllowAll;

impl PolicyEvaluator for AllowAll {
    fn apply(&self, _accepted_cx: &Endpoint, _session: &ProxySession) -> Option<Verdict> {
        Some(Verdict::accept("allow-all"))
    }
}

/// Vetoes connections whose resolved destination port is on the deny list.
pub struct PortDenyPolicy {
    denied_ports: Vec<u16>,
}

impl PortDenyPolicy {
    pub fn new(denied_ports: Vec<u16>) -> Self {
        Self { denied_ports }
    }
}

impl PolicyEvaluator for PortDenyPolicy {
    fn apply(&self, accepted_cx: &Endpoint, _session: &ProxySession) -> Option<Verdict> {
        let port = accepted_cx.nonlocal_dst()?.port();
        if self.denied_ports.contains(&port) {
            log::info!("policy: destination port {} denied for {}", port, accepted_cx.name());
            return None;
        }
        Some(Verdict::accept("port-filter"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rules_apply_in_order() {
        let rules = vec![
            ContentRule::new(b"cat", b"dog"),
            ContentRule::new(b"dogs", b"wolves"),
        ];
        let out = apply_content_rules(&rules, b"cats and cats");
        assert_eq!(out, b"wolves and wolves");
    }

    #[test]
    fn replacement_handles_multiple_hits() {
        let rules = vec![ContentRule::new(b"aa", b"b")];
        assert_eq!(apply_content_rules(&rules, b"aaaa"), b"bb");
        assert_eq!(apply_content_rules(&rules, b"xaax"), b"xbx");
    }
}
