use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::SystemTime;

pub const DNS_HEADER_SIZE: usize = 12;

pub const TYPE_A: u16 = 1;
pub const TYPE_CNAME: u16 = 5;
pub const TYPE_TXT: u16 = 16;
pub const TYPE_AAAA: u16 = 28;
pub const TYPE_OPT: u16 = 41;

pub fn record_type_str(rec_type: u16) -> &'static str {
    match rec_type {
        TYPE_A => "A",
        TYPE_CNAME => "CNAME",
        TYPE_TXT => "TXT",
        TYPE_AAAA => "AAAA",
        TYPE_OPT => "OPT",
        _ => "unknown",
    }
}

/// Outcome of a single decode pass over one datagram.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DecodeOutcome {
    /// All declared sections satisfied and every input byte consumed.
    Complete,
    /// Declared sections satisfied, but only this many bytes were consumed.
    Leftover(usize),
    /// Header too short or a mandatory section could not be satisfied.
    Failed,
}

impl DecodeOutcome {
    pub fn is_ok(&self) -> bool {
        !matches!(self, DecodeOutcome::Failed)
    }
}

fn be16(buf: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_be_bytes([*buf.get(at)?, *buf.get(at + 1)?]))
}

fn be32(buf: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_be_bytes([
        *buf.get(at)?,
        *buf.get(at + 1)?,
        *buf.get(at + 2)?,
        *buf.get(at + 3)?,
    ]))
}

/// Scans a label sequence starting at `at` and returns the dotted name plus
/// the number of bytes consumed. A length byte >= 0xC0 is a compression
/// pointer: it consumes two bytes and terminates the scan without being
/// dereferenced, so any name behind a pointer stays truncated. Returns `None`
/// when a label would run past the end of the buffer.
fn scan_name(buf: &[u8], at: usize) -> Option<(String, usize)> {
    let mut pos = at;
    let mut name = String::new();
    loop {
        let len = *buf.get(pos)? as usize;
        if len == 0 {
            pos += 1;
            break;
        }
        if len >= 0xC0 {
            buf.get(pos + 1)?;
            pos += 2;
            break;
        }
        let end = pos + 1 + len;
        if end > buf.len() {
            return None;
        }
        if !name.is_empty() {
            name.push('.');
        }
        name.push_str(&String::from_utf8_lossy(&buf[pos + 1..end]));
        pos = end;
    }
    Some((name, pos - at))
}

#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct DnsQuestion {
    pub name: String,
    pub rec_type: u16,
    pub rec_class: u16,
}

impl std::fmt::Display for DnsQuestion {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{} {} {}", self.name, record_type_str(self.rec_type), self.rec_class)
    }
}

/// A resource record as it appears in the answer and authority sections:
/// the name is kept as the raw two-byte reference, never resolved to text.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct DnsAnswer {
    pub name_ref: u16,
    pub rec_type: u16,
    pub rec_class: u16,
    pub ttl: u32,
    pub data: Vec<u8>,
}

impl DnsAnswer {
    /// Address payload of an A or AAAA record, if the data length matches.
    pub fn ip(&self) -> Option<IpAddr> {
        match self.rec_type {
            TYPE_A => {
                let octets: [u8; 4] = self.data.as_slice().try_into().ok()?;
                Some(IpAddr::V4(Ipv4Addr::from(octets)))
            }
            TYPE_AAAA => {
                let octets: [u8; 16] = self.data.as_slice().try_into().ok()?;
                Some(IpAddr::V6(Ipv6Addr::from(octets)))
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for DnsAnswer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.ip() {
            Some(ip) => write!(f, "{} ttl={} {}", record_type_str(self.rec_type), self.ttl, ip),
            None => write!(
                f,
                "{} ttl={} len={}",
                record_type_str(self.rec_type),
                self.ttl,
                self.data.len()
            ),
        }
    }
}

/// EDNS pseudo-record from the additional section.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct EdnsOpt {
    pub udp_size: u16,
    pub ext_rcode: u8,
    pub version: u8,
    pub flags: u16,
    pub data: Vec<u8>,
}

#[derive(Debug, Default, Clone)]
pub struct DnsMessage {
    pub id: u16,
    pub flags: u16,
    pub questions: u16,
    pub answers: u16,
    pub authorities: u16,
    pub additionals: u16,
    pub questions_list: Vec<DnsQuestion>,
    pub answers_list: Vec<DnsAnswer>,
    pub authorities_list: Vec<DnsAnswer>,
    pub additionals_list: Vec<DnsAnswer>,
    pub edns: Vec<EdnsOpt>,
    pub loaded_at: Option<SystemTime>,
}

fn rr_header(buf: &[u8], at: usize) -> Option<(u16, u16, u16, u32, u16)> {
    Some((
        be16(buf, at)?,
        be16(buf, at + 2)?,
        be16(buf, at + 4)?,
        be32(buf, at + 6)?,
        be16(buf, at + 10)?,
    ))
}

/// Fixed-layout record loop shared by the answer and authority sections.
/// Terminates early, consuming the remainder of the buffer, as soon as a
/// record's declared data length would overflow it.
fn load_rr_section(buf: &[u8], pos: &mut usize, togo: &mut u16, out: &mut Vec<DnsAnswer>) {
    while *pos < buf.len() && *togo > 0 {
        let Some((name_ref, rec_type, rec_class, ttl, datalen)) = rr_header(buf, *pos) else {
            *pos = buf.len();
            return;
        };
        let data_start = *pos + 12;
        let data_end = data_start + datalen as usize;
        if data_end > buf.len() {
            *pos = buf.len();
            return;
        }
        out.push(DnsAnswer {
            name_ref,
            rec_type,
            rec_class,
            ttl,
            data: buf[data_start..data_end].to_vec(),
        });
        *pos = data_end;
        *togo -= 1;
    }
}

impl DnsMessage {
    /// Decodes one wire-format message. The header fields are left untouched
    /// when the buffer does not exceed the fixed header size.
    pub fn load(&mut self, src: &[u8]) -> DecodeOutcome {
        if src.len() <= DNS_HEADER_SIZE {
            return DecodeOutcome::Failed;
        }
        self.loaded_at = Some(SystemTime::now());

        self.id = u16::from_be_bytes([src[0], src[1]]);
        self.flags = u16::from_be_bytes([src[2], src[3]]);
        self.questions = u16::from_be_bytes([src[4], src[5]]);
        self.answers = u16::from_be_bytes([src[6], src[7]]);
        self.authorities = u16::from_be_bytes([src[8], src[9]]);
        self.additionals = u16::from_be_bytes([src[10], src[11]]);

        let mut questions_togo = self.questions;
        let mut answers_togo = self.answers;
        let mut authorities_togo = self.authorities;
        let mut additionals_togo = self.additionals;

        log::trace!(
            "DnsMessage::load: [0x{:x}] q: {}, an: {}, au: {}, ad: {} (buffer length {})",
            self.id,
            self.questions,
            self.answers,
            self.authorities,
            self.additionals,
            src.len()
        );

        let mut pos = DNS_HEADER_SIZE;

        while pos < src.len() && questions_togo > 0 {
            let Some((name, consumed)) = scan_name(src, pos) else {
                log::debug!("DnsMessage::load: question name out of bounds at {pos}");
                pos = src.len();
                break;
            };
            let type_at = pos + consumed;
            let (Some(rec_type), Some(rec_class)) = (be16(src, type_at), be16(src, type_at + 2)) else {
                log::debug!("DnsMessage::load: question preamble out of bounds at {type_at}");
                pos = src.len();
                break;
            };
            self.questions_list.push(DnsQuestion { name, rec_type, rec_class });
            pos = type_at + 4;
            questions_togo -= 1;
        }

        load_rr_section(src, &mut pos, &mut answers_togo, &mut self.answers_list);
        load_rr_section(src, &mut pos, &mut authorities_togo, &mut self.authorities_list);

        while pos < src.len() && additionals_togo > 0 {
            let Some((_, consumed)) = scan_name(src, pos) else {
                pos = src.len();
                break;
            };
            let Some(pre_type) = be16(src, pos + consumed) else {
                pos = src.len();
                break;
            };
            let mut i = pos + consumed + 2;

            if pre_type == TYPE_OPT {
                let header = (|| {
                    Some((be16(src, i)?, *src.get(i + 2)?, *src.get(i + 3)?, be16(src, i + 4)?, be16(src, i + 6)?))
                })();
                let Some((udp_size, ext_rcode, version, opt_flags, datalen)) = header else {
                    pos = src.len();
                    break;
                };
                i += 8;
                let data_end = i + datalen as usize;
                if data_end > src.len() {
                    pos = src.len();
                    break;
                }
                self.edns.push(EdnsOpt {
                    udp_size,
                    ext_rcode,
                    version,
                    flags: opt_flags,
                    data: src[i..data_end].to_vec(),
                });
                pos = data_end;
                additionals_togo -= 1;
            } else if pre_type == TYPE_A || pre_type == TYPE_AAAA || pre_type == TYPE_TXT {
                // the name was already consumed by the scan above
                let header = (|| Some((be16(src, i)?, be32(src, i + 2)?, be16(src, i + 6)?)))();
                let Some((rec_class, ttl, datalen)) = header else {
                    pos = src.len();
                    break;
                };
                i += 8;
                let data_end = i + datalen as usize;
                if data_end > src.len() {
                    pos = src.len();
                    break;
                }
                self.additionals_list.push(DnsAnswer {
                    name_ref: 0,
                    rec_type: pre_type,
                    rec_class,
                    ttl,
                    data: src[i..data_end].to_vec(),
                });
                pos = data_end;
                additionals_togo -= 1;
            } else {
                log::debug!("DnsMessage::load: unsupported additional record type {pre_type}, skipping the rest");
                pos = src.len();
                break;
            }
        }
        // tolerate undercount from malformed input
        self.additionals = (self.additionals_list.len() + self.edns.len()) as u16;

        if questions_togo == 0 && answers_togo == 0 && authorities_togo == 0 {
            if pos == src.len() {
                return DecodeOutcome::Complete;
            }
            return DecodeOutcome::Leftover(pos);
        }
        DecodeOutcome::Failed
    }

    /// Name of the first question, the cache key for responses.
    pub fn question_str_0(&self) -> String {
        self.questions_list.first().map(|q| q.name.clone()).unwrap_or_default()
    }

    /// Space-prefixed concatenation of every A/AAAA answer address literal.
    pub fn answer_str(&self) -> String {
        let mut ret = String::new();
        for answer in &self.answers_list {
            if let Some(ip) = answer.ip() {
                ret.push(' ');
                ret.push_str(&ip.to_string());
            }
        }
        ret
    }

    pub fn a_answers(&self) -> Vec<IpAddr> {
        self.answers_list.iter().filter_map(|a| a.ip()).collect()
    }
}

impl std::fmt::Display for DnsMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "id: {}, flags: 0x{:x} [ ", self.id, self.flags)?;
        for (i, q) in self.questions_list.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{q}")?;
        }
        write!(f, " ]")?;
        if !self.answers_list.is_empty() {
            write!(f, " -> [ ")?;
            for (i, a) in self.answers_list.iter().enumerate() {
                if i > 0 {
                    write!(f, " | ")?;
                }
                write!(f, "{a}")?;
            }
            write!(f, " ]")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_name(buf: &mut Vec<u8>, name: &str) {
        for label in name.split('.') {
            buf.push(label.len() as u8);
            buf.extend_from_slice(label.as_bytes());
        }
        buf.push(0);
    }

    fn query(id: u16, name: &str, rec_type: u16) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&id.to_be_bytes());
        buf.extend_from_slice(&0x0100_u16.to_be_bytes());
        buf.extend_from_slice(&1_u16.to_be_bytes());
        buf.extend_from_slice(&0_u16.to_be_bytes());
        buf.extend_from_slice(&0_u16.to_be_bytes());
        buf.extend_from_slice(&0_u16.to_be_bytes());
        push_name(&mut buf, name);
        buf.extend_from_slice(&rec_type.to_be_bytes());
        buf.extend_from_slice(&1_u16.to_be_bytes());
        buf
    }

    fn push_rr(buf: &mut Vec<u8>, rec_type: u16, ttl: u32, data: &[u8]) {
        buf.extend_from_slice(&0xC00C_u16.to_be_bytes());
        buf.extend_from_slice(&rec_type.to_be_bytes());
        buf.extend_from_slice(&1_u16.to_be_bytes());
        buf.extend_from_slice(&ttl.to_be_bytes());
        buf.extend_from_slice(&(data.len() as u16).to_be_bytes());
        buf.extend_from_slice(data);
    }

    fn response(id: u16, name: &str, addrs: &[[u8; 4]]) -> Vec<u8> {
        let mut buf = query(id, name, TYPE_A);
        buf[2] = 0x81;
        buf[3] = 0x80;
        buf[6..8].copy_from_slice(&(addrs.len() as u16).to_be_bytes());
        for addr in addrs {
            push_rr(&mut buf, TYPE_A, 300, addr);
        }
        buf
    }

    #[test]
    fn short_buffer_fails_with_untouched_header() {
        for len in 0..=DNS_HEADER_SIZE {
            let mut msg = DnsMessage::default();
            assert_eq!(msg.load(&vec![0xff; len]), DecodeOutcome::Failed);
            assert_eq!(msg.id, 0);
            assert_eq!(msg.flags, 0);
            assert_eq!(msg.questions, 0);
            assert_eq!(msg.answers, 0);
            assert_eq!(msg.authorities, 0);
            assert_eq!(msg.additionals, 0);
        }
    }

    #[test]
    fn question_labels_reassemble_dotted_name() {
        let buf = query(0x1234, "example.com", TYPE_A);
        let mut msg = DnsMessage::default();
        assert_eq!(msg.load(&buf), DecodeOutcome::Complete);
        assert_eq!(msg.id, 0x1234);
        assert_eq!(msg.questions_list.len(), 1);
        let q = &msg.questions_list[0];
        assert_eq!(q.name, "example.com");
        assert_eq!(q.rec_type, TYPE_A);
        assert_eq!(q.rec_class, 1);
    }

    #[test]
    fn response_answers_and_answer_str() {
        let buf = response(7, "example.com", &[[93, 184, 216, 34], [93, 184, 216, 35]]);
        let mut msg = DnsMessage::default();
        assert_eq!(msg.load(&buf), DecodeOutcome::Complete);
        assert_eq!(msg.answers_list.len(), 2);
        assert_eq!(msg.answers_list[0].ttl, 300);
        assert_eq!(msg.answer_str(), " 93.184.216.34 93.184.216.35");
        assert_eq!(msg.a_answers().len(), 2);
    }

    #[test]
    fn truncation_never_reads_out_of_bounds() {
        let full = response(0xbeef, "truncated.example.net", &[[10, 0, 0, 1]]);
        for len in 0..full.len() {
            let mut msg = DnsMessage::default();
            let outcome = msg.load(&full[..len]);
            if len <= DNS_HEADER_SIZE {
                assert_eq!(outcome, DecodeOutcome::Failed, "len {len}");
            }
            if let DecodeOutcome::Leftover(consumed) = outcome {
                assert!(consumed <= len, "len {len} consumed {consumed}");
            }
        }
        let mut msg = DnsMessage::default();
        assert_eq!(msg.load(&full), DecodeOutcome::Complete);
    }

    #[test]
    fn trailing_bytes_reported_as_leftover() {
        let mut buf = query(1, "tail.example.org", TYPE_AAAA);
        let consumed_expected = buf.len();
        buf.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        let mut msg = DnsMessage::default();
        assert_eq!(msg.load(&buf), DecodeOutcome::Leftover(consumed_expected));
    }

    #[test]
    fn pointer_label_consumes_two_bytes_without_dereferencing() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0x0042_u16.to_be_bytes());
        buf.extend_from_slice(&0_u16.to_be_bytes());
        buf.extend_from_slice(&1_u16.to_be_bytes());
        buf.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
        // "www" label followed by a compression pointer back to the header
        buf.push(3);
        buf.extend_from_slice(b"www");
        buf.extend_from_slice(&[0xC0, 0x0C]);
        buf.extend_from_slice(&TYPE_A.to_be_bytes());
        buf.extend_from_slice(&1_u16.to_be_bytes());
        let mut msg = DnsMessage::default();
        assert_eq!(msg.load(&buf), DecodeOutcome::Complete);
        // the referenced suffix is not reconstructed
        assert_eq!(msg.questions_list[0].name, "www");
    }

    #[test]
    fn additional_count_corrected_on_unsupported_type() {
        let mut buf = query(9, "extras.example.com", TYPE_A);
        buf[10..12].copy_from_slice(&3_u16.to_be_bytes());
        // additional 1: root name + A record
        buf.push(0);
        buf.extend_from_slice(&TYPE_A.to_be_bytes());
        buf.extend_from_slice(&1_u16.to_be_bytes());
        buf.extend_from_slice(&60_u32.to_be_bytes());
        buf.extend_from_slice(&4_u16.to_be_bytes());
        buf.extend_from_slice(&[127, 0, 0, 1]);
        // additional 2: root name + OPT pseudo-record
        buf.push(0);
        buf.extend_from_slice(&TYPE_OPT.to_be_bytes());
        buf.extend_from_slice(&4096_u16.to_be_bytes());
        buf.push(0);
        buf.push(0);
        buf.extend_from_slice(&0_u16.to_be_bytes());
        buf.extend_from_slice(&0_u16.to_be_bytes());
        // additional 3: root name + unsupported NS record aborts the section
        buf.push(0);
        buf.extend_from_slice(&2_u16.to_be_bytes());
        buf.extend_from_slice(&[0xaa; 12]);
        let mut msg = DnsMessage::default();
        let outcome = msg.load(&buf);
        assert!(outcome.is_ok());
        assert_eq!(msg.additionals, 2);
        assert_eq!(msg.additionals_list.len(), 1);
        assert_eq!(msg.edns.len(), 1);
        assert_eq!(msg.edns[0].udp_size, 4096);
    }

    #[test]
    fn answer_overflow_truncates_section() {
        let mut buf = query(3, "short.example.com", TYPE_A);
        buf[6..8].copy_from_slice(&1_u16.to_be_bytes());
        // record claims 200 bytes of data but the buffer ends early
        buf.extend_from_slice(&0xC00C_u16.to_be_bytes());
        buf.extend_from_slice(&TYPE_A.to_be_bytes());
        buf.extend_from_slice(&1_u16.to_be_bytes());
        buf.extend_from_slice(&60_u32.to_be_bytes());
        buf.extend_from_slice(&200_u16.to_be_bytes());
        buf.extend_from_slice(&[1, 2, 3, 4]);
        let mut msg = DnsMessage::default();
        assert_eq!(msg.load(&buf), DecodeOutcome::Failed);
        assert!(msg.answers_list.is_empty());
    }

    #[test]
    fn hickory_encoded_query_decodes() {
        use hickory_proto::op::{Message, MessageType, OpCode, Query};
        use hickory_proto::rr::{Name, RecordType};
        use std::str::FromStr;

        let mut message = Message::new();
        message
            .set_id(0x4242)
            .set_op_code(OpCode::Query)
            .set_message_type(MessageType::Query)
            .set_recursion_desired(true)
            .add_query(Query::query(Name::from_str("interop.example.com.").unwrap(), RecordType::A));
        let wire = message.to_vec().unwrap();

        let mut msg = DnsMessage::default();
        assert!(msg.load(&wire).is_ok());
        assert_eq!(msg.id, 0x4242);
        assert_eq!(msg.questions_list[0].name, "interop.example.com");
        assert_eq!(msg.questions_list[0].rec_type, TYPE_A);
    }

    #[test]
    fn display_lists_questions_and_answers() {
        let buf = response(0x10, "display.example.com", &[[1, 2, 3, 4]]);
        let mut msg = DnsMessage::default();
        assert!(msg.load(&buf).is_ok());
        let text = format!("{msg}");
        assert!(text.contains("display.example.com A 1"));
        assert!(text.contains("1.2.3.4"));
    }
}
