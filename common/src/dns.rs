//! Minimal DNS responder that resolves every name to the portal address.

use std::net::Ipv4Addr;

use log::debug;

use crate::ports::DatagramPort;

pub const DNS_PORT: u16 = 53;
pub const ANSWER_TTL_SECS: u32 = 60;

const HEADER_LEN: usize = 12;
const TYPE_A: u16 = 1;
const CLASS_IN: u16 = 1;
const MAX_DATAGRAM: usize = 512;
const MAX_QUERIES_PER_POLL: usize = 8;

/// Builds the reply for one query datagram. Returns `None` for anything that
/// is not a well-formed standard query.
pub fn captive_answer(query: &[u8], address: Ipv4Addr) -> Option<Vec<u8>> {
    if query.len() < HEADER_LEN {
        return None;
    }
    let flags = u16::from_be_bytes([query[2], query[3]]);
    let is_response = flags & 0x8000 != 0;
    let opcode = (flags >> 11) & 0x0f;
    let questions = u16::from_be_bytes([query[4], query[5]]);
    if is_response || opcode != 0 || questions == 0 {
        return None;
    }

    let mut cursor = HEADER_LEN;
    loop {
        let len = usize::from(*query.get(cursor)?);
        cursor += 1;
        if len == 0 {
            break;
        }
        // Compression pointers never appear in a question we answer.
        if len > 63 {
            return None;
        }
        cursor += len;
    }
    let qtype = u16::from_be_bytes([*query.get(cursor)?, *query.get(cursor + 1)?]);
    let qclass = u16::from_be_bytes([*query.get(cursor + 2)?, *query.get(cursor + 3)?]);
    let question_end = cursor + 4;

    let answer = qtype == TYPE_A && qclass == CLASS_IN;
    let mut reply = Vec::with_capacity(question_end + 16);
    reply.extend_from_slice(&query[0..2]);
    let reply_flags = 0x8180 | (flags & 0x0100);
    reply.extend_from_slice(&reply_flags.to_be_bytes());
    reply.extend_from_slice(&1_u16.to_be_bytes());
    reply.extend_from_slice(&u16::from(answer).to_be_bytes());
    reply.extend_from_slice(&[0, 0, 0, 0]);
    reply.extend_from_slice(&query[HEADER_LEN..question_end]);

    if answer {
        reply.extend_from_slice(&[0xc0, 0x0c]);
        reply.extend_from_slice(&TYPE_A.to_be_bytes());
        reply.extend_from_slice(&CLASS_IN.to_be_bytes());
        reply.extend_from_slice(&ANSWER_TTL_SECS.to_be_bytes());
        reply.extend_from_slice(&4_u16.to_be_bytes());
        reply.extend_from_slice(&address.octets());
    }

    Some(reply)
}

#[derive(Debug, Clone)]
pub struct CaptiveDns {
    address: Ipv4Addr,
}

impl CaptiveDns {
    pub fn new(address: Ipv4Addr) -> Self {
        Self { address }
    }

    /// Answers pending queries. Returns how many replies were sent.
    pub fn poll(&self, socket: &mut impl DatagramPort) -> usize {
        let mut buf = [0_u8; MAX_DATAGRAM];
        let mut answered = 0;
        for _ in 0..MAX_QUERIES_PER_POLL {
            let Some((len, peer)) = socket.recv(&mut buf) else {
                break;
            };
            match captive_answer(&buf[..len], self.address) {
                Some(reply) => {
                    socket.send(&reply, peer);
                    answered += 1;
                }
                None => debug!("dropping malformed dns datagram from {peer}"),
            }
        }
        answered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryDatagram;

    fn query(name: &str, qtype: u16) -> Vec<u8> {
        let mut packet = vec![0xab, 0xcd, 0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 0];
        for label in name.split('.') {
            packet.push(label.len() as u8);
            packet.extend_from_slice(label.as_bytes());
        }
        packet.push(0);
        packet.extend_from_slice(&qtype.to_be_bytes());
        packet.extend_from_slice(&CLASS_IN.to_be_bytes());
        packet
    }

    #[test]
    fn a_query_resolves_to_portal_address() {
        let packet = query("connectivitycheck.gstatic.com", TYPE_A);

        let reply = captive_answer(&packet, Ipv4Addr::new(10, 10, 10, 10)).unwrap();

        assert_eq!(&reply[0..2], &[0xab, 0xcd]);
        assert_eq!(&reply[2..4], &[0x81, 0x80]);
        assert_eq!(&reply[6..8], &[0, 1]);
        assert_eq!(&reply[12..packet.len()], &packet[12..]);
        assert_eq!(&reply[reply.len() - 4..], &[10, 10, 10, 10]);
        assert_eq!(reply.len(), packet.len() + 16);
    }

    #[test]
    fn non_a_query_gets_empty_answer_section() {
        let packet = query("example.com", 28);

        let reply = captive_answer(&packet, Ipv4Addr::new(10, 10, 10, 10)).unwrap();

        assert_eq!(&reply[6..8], &[0, 0]);
        assert_eq!(reply.len(), packet.len());
    }

    #[test]
    fn truncated_and_response_packets_are_dropped() {
        let packet = query("example.com", TYPE_A);
        assert!(captive_answer(&packet[..packet.len() - 2], Ipv4Addr::LOCALHOST).is_none());

        let mut response = packet.clone();
        response[2] |= 0x80;
        assert!(captive_answer(&response, Ipv4Addr::LOCALHOST).is_none());
        assert!(captive_answer(&[0; 5], Ipv4Addr::LOCALHOST).is_none());
    }

    #[test]
    fn poll_replies_to_sender() {
        let mut socket = MemoryDatagram::default();
        let peer = "192.168.4.2:5353".parse().unwrap();
        socket.inbound.push_back((query("a.b", TYPE_A), peer));
        socket.inbound.push_back((vec![1, 2, 3], peer));

        let answered = CaptiveDns::new(Ipv4Addr::new(10, 10, 10, 10)).poll(&mut socket);

        assert_eq!(answered, 1);
        assert_eq!(socket.sent.len(), 1);
        assert_eq!(socket.sent[0].1, peer);
    }
}
