//! DNS message wire format: label (de)compression, resource record encode/decode.
//!
//! This is the on-wire codec the rest of the crate is written against
//! through the [`crate::transport::Transport`] interface; nothing above this
//! module reasons about bytes.

use std::io::{Cursor, Read, Write};
use std::net::SocketAddr;

use anyhow::{Context, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

pub const TYPE_A: u16 = 1;
pub const TYPE_PTR: u16 = 12;
pub const TYPE_TXT: u16 = 16;
pub const TYPE_AAAA: u16 = 28;
pub const TYPE_SRV: u16 = 33;
pub const QTYPE_ANY: u16 = 255;
pub const CLASS_IN: u16 = 1;

const FLAG_RESPONSE: u16 = 0x8000;

/// A DNS question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

/// A DNS resource record as it appears on the wire: a name, type/class/ttl,
/// and an opaque rdata blob. [`crate::record::ResourceRecord`] is built from
/// these and converted back for encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub name: String,
    pub rtype: u16,
    pub class: u16,
    pub ttl: u32,
    pub rdata: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    pub transaction: u16,
    pub flags: u16,
    pub questions: Vec<Question>,
    pub answers: Vec<RawRecord>,
    pub authority: Vec<RawRecord>,
    pub additionals: Vec<RawRecord>,
}

impl Message {
    pub fn is_response(&self) -> bool {
        self.flags & FLAG_RESPONSE != 0
    }
}

/// A query packet paired with the socket address it arrived from.
#[derive(Debug, Clone)]
pub struct InboundQuery {
    pub message: Message,
    pub source: SocketAddr,
}

/// A response packet paired with sender information (§6 `remoteInfo`).
#[derive(Debug, Clone)]
pub struct InboundResponse {
    pub message: Message,
    pub referer: RemoteInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

#[derive(Debug, Clone)]
pub struct RemoteInfo {
    pub address: std::net::IpAddr,
    pub family: Family,
    pub port: u16,
}

impl From<SocketAddr> for RemoteInfo {
    fn from(addr: SocketAddr) -> Self {
        RemoteInfo {
            address: addr.ip(),
            family: if addr.is_ipv4() { Family::V4 } else { Family::V6 },
            port: addr.port(),
        }
    }
}

/// Encode a DNS name as a sequence of length-prefixed labels terminated by a
/// zero byte. No name compression is attempted on the way out.
pub fn encode_label(name: &str, out: &mut Vec<u8>) -> Result<()> {
    for seg in name.trim_end_matches('.').split('.') {
        let bytes = seg.as_bytes();
        anyhow::ensure!(bytes.len() <= 63, "label '{}' exceeds 63 bytes", seg);
        out.write_u8(bytes.len() as u8)?;
        out.write_all(bytes)?;
    }
    out.write_u8(0)?;
    Ok(())
}

fn read_label(data: &[u8], cursor: &mut Cursor<&[u8]>) -> Result<String> {
    let mut labels: Vec<String> = Vec::new();
    let mut jumped = false;
    let mut guard = 0;
    loop {
        guard += 1;
        anyhow::ensure!(guard < 128, "label compression loop");
        let n = cursor.read_u8()?;
        if n == 0 {
            break;
        } else if n & 0xc0 == 0xc0 {
            let lo = cursor.read_u8()?;
            let off = (((n & 0x3f) as usize) << 8) | lo as usize;
            anyhow::ensure!(off < data.len(), "label pointer out of range");
            let mut sub = Cursor::new(&data[off..]);
            let rest = read_label(data, &mut sub)?;
            if !rest.is_empty() {
                labels.push(rest);
            }
            jumped = true;
            break;
        } else {
            let mut buf = vec![0u8; n as usize];
            cursor.read_exact(&mut buf)?;
            labels.push(String::from_utf8_lossy(&buf).into_owned());
        }
    }
    let _ = jumped;
    Ok(labels.join("."))
}

fn parse_question(data: &[u8], cursor: &mut Cursor<&[u8]>) -> Result<Question> {
    let name = read_label(data, cursor)?;
    let qtype = cursor.read_u16::<BigEndian>()?;
    let qclass = cursor.read_u16::<BigEndian>()?;
    Ok(Question { name, qtype, qclass })
}

fn parse_record(data: &[u8], cursor: &mut Cursor<&[u8]>) -> Result<RawRecord> {
    let name = read_label(data, cursor)?;
    let rtype = cursor.read_u16::<BigEndian>()?;
    let class = cursor.read_u16::<BigEndian>()?;
    let ttl = cursor.read_u32::<BigEndian>()?;
    let dlen = cursor.read_u16::<BigEndian>()?;
    let rdata_start = cursor.position() as usize;
    let mut rdata = vec![0u8; dlen as usize];
    cursor.read_exact(&mut rdata)?;
    let rdata = decompress_rdata_name(data, rtype, rdata_start, rdata)?;
    Ok(RawRecord { name, rtype, class, ttl, rdata })
}

/// PTR and SRV rdata end in a name that may use compression pointers back
/// into the enclosing message — `rdata` alone can't resolve those, so this
/// runs `read_label` against the full buffer at the record's own offset and
/// re-encodes the result as a flat, pointer-free label sequence. Everything
/// downstream (`record::ResourceRecord::from_raw`) then only ever sees
/// rdata that is self-contained.
fn decompress_rdata_name(data: &[u8], rtype: u16, rdata_start: usize, raw_rdata: Vec<u8>) -> Result<Vec<u8>> {
    let name_offset = match rtype {
        TYPE_PTR => 0,
        TYPE_SRV => {
            anyhow::ensure!(raw_rdata.len() >= 6, "SRV rdata too short");
            6
        }
        _ => return Ok(raw_rdata),
    };
    let mut name_cursor = Cursor::new(data);
    name_cursor.set_position((rdata_start + name_offset) as u64);
    let name = read_label(data, &mut name_cursor)?;

    let mut out = raw_rdata[..name_offset].to_vec();
    encode_label(&name, &mut out)?;
    Ok(out)
}

pub fn decode_message(data: &[u8]) -> Result<Message> {
    let mut cursor = Cursor::new(data);
    let transaction = cursor.read_u16::<BigEndian>().context("transaction id")?;
    let flags = cursor.read_u16::<BigEndian>()?;
    let nq = cursor.read_u16::<BigEndian>()?;
    let nans = cursor.read_u16::<BigEndian>()?;
    let nauth = cursor.read_u16::<BigEndian>()?;
    let nadd = cursor.read_u16::<BigEndian>()?;

    let mut questions = Vec::with_capacity(nq as usize);
    for _ in 0..nq {
        questions.push(parse_question(data, &mut cursor)?);
    }
    let mut answers = Vec::with_capacity(nans as usize);
    for _ in 0..nans {
        answers.push(parse_record(data, &mut cursor)?);
    }
    let mut authority = Vec::with_capacity(nauth as usize);
    for _ in 0..nauth {
        authority.push(parse_record(data, &mut cursor)?);
    }
    let mut additionals = Vec::with_capacity(nadd as usize);
    for _ in 0..nadd {
        additionals.push(parse_record(data, &mut cursor)?);
    }

    Ok(Message { transaction, flags, questions, answers, authority, additionals })
}

fn encode_record(rr: &RawRecord, out: &mut Vec<u8>) -> Result<()> {
    encode_label(&rr.name, out)?;
    out.write_u16::<BigEndian>(rr.rtype)?;
    out.write_u16::<BigEndian>(rr.class)?;
    out.write_u32::<BigEndian>(rr.ttl)?;
    out.write_u16::<BigEndian>(rr.rdata.len() as u16)?;
    out.extend_from_slice(&rr.rdata);
    Ok(())
}

/// Encode a one-question query message.
pub fn encode_query(name: &str, qtype: u16) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(64);
    out.write_u16::<BigEndian>(0)?; // transaction id: always 0 for mDNS
    out.write_u16::<BigEndian>(0)?; // flags: query
    out.write_u16::<BigEndian>(1)?; // qdcount
    out.write_u16::<BigEndian>(0)?;
    out.write_u16::<BigEndian>(0)?;
    out.write_u16::<BigEndian>(0)?;
    encode_label(name, &mut out)?;
    out.write_u16::<BigEndian>(qtype)?;
    out.write_u16::<BigEndian>(CLASS_IN)?;
    Ok(out)
}

/// Encode a response message carrying answers and additionals (no questions,
/// no authority section — the shape the Responder and Publisher both need).
pub fn encode_response(answers: &[RawRecord], additionals: &[RawRecord]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(512);
    out.write_u16::<BigEndian>(0)?;
    out.write_u16::<BigEndian>(FLAG_RESPONSE | 0x0400)?; // response, authoritative
    out.write_u16::<BigEndian>(0)?;
    out.write_u16::<BigEndian>(answers.len() as u16)?;
    out.write_u16::<BigEndian>(0)?;
    out.write_u16::<BigEndian>(additionals.len() as u16)?;
    for rr in answers {
        encode_record(rr, &mut out)?;
    }
    for rr in additionals {
        encode_record(rr, &mut out)?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_query() {
        let pkt = encode_query("_http._tcp.local", QTYPE_ANY).unwrap();
        let msg = decode_message(&pkt).unwrap();
        assert_eq!(msg.questions.len(), 1);
        assert_eq!(msg.questions[0].name, "_http._tcp.local");
        assert_eq!(msg.questions[0].qtype, QTYPE_ANY);
        assert!(!msg.is_response());
    }

    #[test]
    fn round_trips_a_response() {
        let ptr = RawRecord {
            name: "_http._tcp.local".into(),
            rtype: TYPE_PTR,
            class: CLASS_IN,
            ttl: 120,
            rdata: {
                let mut buf = Vec::new();
                encode_label("Foo._http._tcp.local", &mut buf).unwrap();
                buf
            },
        };
        let pkt = encode_response(&[ptr.clone()], &[]).unwrap();
        let msg = decode_message(&pkt).unwrap();
        assert!(msg.is_response());
        assert_eq!(msg.answers.len(), 1);
        assert_eq!(msg.answers[0], ptr);
    }

    #[test]
    fn decodes_compressed_labels() {
        // Two records pointing at the same owner name via a compression pointer.
        let mut pkt = Vec::new();
        pkt.write_u16::<BigEndian>(0).unwrap();
        pkt.write_u16::<BigEndian>(FLAG_RESPONSE).unwrap();
        pkt.write_u16::<BigEndian>(0).unwrap();
        pkt.write_u16::<BigEndian>(1).unwrap();
        pkt.write_u16::<BigEndian>(0).unwrap();
        pkt.write_u16::<BigEndian>(0).unwrap();
        let name_offset = pkt.len();
        encode_label("foo.local", &mut pkt).unwrap();
        pkt.write_u16::<BigEndian>(TYPE_A).unwrap();
        pkt.write_u16::<BigEndian>(CLASS_IN).unwrap();
        pkt.write_u32::<BigEndian>(10).unwrap();
        pkt.write_u16::<BigEndian>(4).unwrap();
        pkt.extend_from_slice(&[127, 0, 0, 1]);
        // second record, same name via pointer
        pkt.write_u16::<BigEndian>(0xc000 | name_offset as u16).unwrap();
        pkt.write_u16::<BigEndian>(TYPE_A).unwrap();
        pkt.write_u16::<BigEndian>(CLASS_IN).unwrap();
        pkt.write_u32::<BigEndian>(10).unwrap();
        pkt.write_u16::<BigEndian>(4).unwrap();
        pkt.extend_from_slice(&[127, 0, 0, 2]);

        // fix up ancount = 1 then rebuild with ancount=2 directly
        let mut hdr = Vec::new();
        hdr.write_u16::<BigEndian>(0).unwrap();
        hdr.write_u16::<BigEndian>(FLAG_RESPONSE).unwrap();
        hdr.write_u16::<BigEndian>(0).unwrap();
        hdr.write_u16::<BigEndian>(2).unwrap();
        hdr.write_u16::<BigEndian>(0).unwrap();
        hdr.write_u16::<BigEndian>(0).unwrap();
        let body = &pkt[12..];
        let mut full = hdr;
        full.extend_from_slice(body);

        let msg = decode_message(&full).unwrap();
        assert_eq!(msg.answers.len(), 2);
        assert_eq!(msg.answers[0].name, "foo.local");
        assert_eq!(msg.answers[1].name, "foo.local");
    }

    #[test]
    fn decodes_compressed_srv_target_in_rdata() {
        // A SRV record whose target is a pointer back to an earlier PTR's
        // answer name, as real responders commonly send.
        let mut hdr = Vec::new();
        hdr.write_u16::<BigEndian>(0).unwrap();
        hdr.write_u16::<BigEndian>(FLAG_RESPONSE).unwrap();
        hdr.write_u16::<BigEndian>(0).unwrap();
        hdr.write_u16::<BigEndian>(2).unwrap();
        hdr.write_u16::<BigEndian>(0).unwrap();
        hdr.write_u16::<BigEndian>(0).unwrap();

        let mut body = Vec::new();
        let owner_offset = 12 + body.len();
        encode_label("Foo._http._tcp.local", &mut body).unwrap();
        body.write_u16::<BigEndian>(TYPE_PTR).unwrap();
        body.write_u16::<BigEndian>(CLASS_IN).unwrap();
        body.write_u32::<BigEndian>(120).unwrap();
        let ptr_rdata_len_pos = body.len();
        body.write_u16::<BigEndian>(0).unwrap();
        let ptr_rdata_start = body.len();
        encode_label("Foo._http._tcp.local", &mut body).unwrap();
        let ptr_rdata_len = (body.len() - ptr_rdata_start) as u16;
        body[ptr_rdata_len_pos..ptr_rdata_len_pos + 2].copy_from_slice(&ptr_rdata_len.to_be_bytes());

        // SRV record, owner name compressed to the same offset, target
        // compressed to the PTR's rdata-embedded name above.
        body.write_u16::<BigEndian>(0xc000 | owner_offset as u16).unwrap();
        body.write_u16::<BigEndian>(TYPE_SRV).unwrap();
        body.write_u16::<BigEndian>(CLASS_IN).unwrap();
        body.write_u32::<BigEndian>(120).unwrap();
        let srv_rdata_len_pos = body.len();
        body.write_u16::<BigEndian>(0).unwrap();
        let srv_rdata_start = body.len();
        body.write_u16::<BigEndian>(0).unwrap(); // priority
        body.write_u16::<BigEndian>(0).unwrap(); // weight
        body.write_u16::<BigEndian>(3000).unwrap(); // port
        body.write_u16::<BigEndian>(0xc000 | (12 + ptr_rdata_start) as u16).unwrap();
        let srv_rdata_len = (body.len() - srv_rdata_start) as u16;
        body[srv_rdata_len_pos..srv_rdata_len_pos + 2].copy_from_slice(&srv_rdata_len.to_be_bytes());

        let mut full = hdr;
        full.extend_from_slice(&body);

        let msg = decode_message(&full).unwrap();
        assert_eq!(msg.answers.len(), 2);
        let srv = &msg.answers[1];
        assert_eq!(srv.rtype, TYPE_SRV);
        let port = u16::from_be_bytes([srv.rdata[4], srv.rdata[5]]);
        assert_eq!(port, 3000);

        let mut target_cursor = Cursor::new(&srv.rdata[6..]);
        let target = read_label(&srv.rdata[6..], &mut target_cursor).unwrap();
        assert_eq!(target, "Foo._http._tcp.local");
    }
}
