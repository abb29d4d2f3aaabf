//! Typed DNS-SD resource records (PTR/SRV/TXT/A/AAAA).

use std::net::{Ipv4Addr, Ipv6Addr};

use anyhow::{bail, Context, Result};
use byteorder::{BigEndian, WriteBytesExt};

use crate::wire::{self, RawRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    Ptr,
    Srv,
    Txt,
    A,
    Aaaa,
}

impl RecordType {
    pub fn wire_type(self) -> u16 {
        match self {
            RecordType::Ptr => wire::TYPE_PTR,
            RecordType::Srv => wire::TYPE_SRV,
            RecordType::Txt => wire::TYPE_TXT,
            RecordType::A => wire::TYPE_A,
            RecordType::Aaaa => wire::TYPE_AAAA,
        }
    }

    pub fn from_wire_type(t: u16) -> Option<Self> {
        match t {
            wire::TYPE_PTR => Some(RecordType::Ptr),
            wire::TYPE_SRV => Some(RecordType::Srv),
            wire::TYPE_TXT => Some(RecordType::Txt),
            wire::TYPE_A => Some(RecordType::A),
            wire::TYPE_AAAA => Some(RecordType::Aaaa),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordData {
    Ptr { target: String },
    Srv { port: u16, target: String },
    Txt { strings: Vec<Vec<u8>> },
    A { address: Ipv4Addr },
    Aaaa { address: Ipv6Addr },
}

impl RecordData {
    pub fn record_type(&self) -> RecordType {
        match self {
            RecordData::Ptr { .. } => RecordType::Ptr,
            RecordData::Srv { .. } => RecordType::Srv,
            RecordData::Txt { .. } => RecordType::Txt,
            RecordData::A { .. } => RecordType::A,
            RecordData::Aaaa { .. } => RecordType::Aaaa,
        }
    }
}

/// A DNS-SD resource record: owner name, TTL (0 == goodbye), and typed data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRecord {
    pub name: String,
    pub ttl: u32,
    pub data: RecordData,
}

impl ResourceRecord {
    pub fn record_type(&self) -> RecordType {
        self.data.record_type()
    }

    pub fn ptr(name: impl Into<String>, target: impl Into<String>, ttl: u32) -> Self {
        ResourceRecord { name: name.into(), ttl, data: RecordData::Ptr { target: target.into() } }
    }

    pub fn srv(name: impl Into<String>, target: impl Into<String>, port: u16, ttl: u32) -> Self {
        ResourceRecord {
            name: name.into(),
            ttl,
            data: RecordData::Srv { port, target: target.into() },
        }
    }

    pub fn txt(name: impl Into<String>, strings: Vec<Vec<u8>>, ttl: u32) -> Self {
        ResourceRecord { name: name.into(), ttl, data: RecordData::Txt { strings } }
    }

    pub fn a(name: impl Into<String>, address: Ipv4Addr, ttl: u32) -> Self {
        ResourceRecord { name: name.into(), ttl, data: RecordData::A { address } }
    }

    pub fn aaaa(name: impl Into<String>, address: Ipv6Addr, ttl: u32) -> Self {
        ResourceRecord { name: name.into(), ttl, data: RecordData::Aaaa { address } }
    }

    /// Case-insensitive (ASCII only) owner-name equality, per §4.D/§9.
    pub fn name_eq_ci(a: &str, b: &str) -> bool {
        a.eq_ignore_ascii_case(b)
    }

    pub fn to_raw(&self) -> Result<RawRecord> {
        let rdata = match &self.data {
            RecordData::Ptr { target } => {
                let mut buf = Vec::new();
                wire::encode_label(target, &mut buf)?;
                buf
            }
            RecordData::Srv { port, target } => {
                let mut buf = Vec::new();
                buf.write_u16::<BigEndian>(0)?; // priority, fixed at 0
                buf.write_u16::<BigEndian>(0)?; // weight, fixed at 0
                buf.write_u16::<BigEndian>(*port)?;
                wire::encode_label(target, &mut buf)?;
                buf
            }
            RecordData::Txt { strings } => {
                let mut buf = Vec::new();
                if strings.is_empty() {
                    buf.push(0);
                } else {
                    for s in strings {
                        anyhow::ensure!(s.len() <= 255, "TXT entry exceeds 255 bytes");
                        buf.push(s.len() as u8);
                        buf.extend_from_slice(s);
                    }
                }
                buf
            }
            RecordData::A { address } => address.octets().to_vec(),
            RecordData::Aaaa { address } => address.octets().to_vec(),
        };
        Ok(RawRecord {
            name: self.name.clone(),
            rtype: self.record_type().wire_type(),
            class: wire::CLASS_IN,
            ttl: self.ttl,
            rdata,
        })
    }

    pub fn from_raw(raw: &RawRecord) -> Result<Self> {
        let data = match raw.rtype {
            t if t == wire::TYPE_PTR => {
                let target = decode_name(&raw.rdata).context("decoding PTR target")?;
                RecordData::Ptr { target }
            }
            t if t == wire::TYPE_SRV => {
                anyhow::ensure!(raw.rdata.len() >= 6, "SRV rdata too short");
                let port = u16::from_be_bytes([raw.rdata[4], raw.rdata[5]]);
                let target = decode_name(&raw.rdata[6..]).context("decoding SRV target")?;
                RecordData::Srv { port, target }
            }
            t if t == wire::TYPE_TXT => {
                let mut strings = Vec::new();
                let mut i = 0;
                while i < raw.rdata.len() {
                    let len = raw.rdata[i] as usize;
                    i += 1;
                    if len == 0 {
                        continue;
                    }
                    anyhow::ensure!(i + len <= raw.rdata.len(), "TXT rdata truncated");
                    strings.push(raw.rdata[i..i + len].to_vec());
                    i += len;
                }
                RecordData::Txt { strings }
            }
            t if t == wire::TYPE_A => {
                anyhow::ensure!(raw.rdata.len() == 4, "A rdata must be 4 bytes");
                RecordData::A { address: Ipv4Addr::new(raw.rdata[0], raw.rdata[1], raw.rdata[2], raw.rdata[3]) }
            }
            t if t == wire::TYPE_AAAA => {
                anyhow::ensure!(raw.rdata.len() == 16, "AAAA rdata must be 16 bytes");
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&raw.rdata);
                RecordData::Aaaa { address: Ipv6Addr::from(octets) }
            }
            other => bail!("unsupported record type {}", other),
        };
        Ok(ResourceRecord { name: raw.name.clone(), ttl: raw.ttl, data })
    }
}

fn decode_name(rdata: &[u8]) -> Result<String> {
    // `wire::decode_message` resolves any compression pointer a PTR/SRV
    // target used against the full message before handing us this slice, so
    // it is always a flat, self-contained label sequence here.
    let mut out = Vec::new();
    let mut i = 0;
    loop {
        anyhow::ensure!(i < rdata.len(), "truncated name");
        let len = rdata[i] as usize;
        i += 1;
        if len == 0 {
            break;
        }
        anyhow::ensure!(i + len <= rdata.len(), "truncated name label");
        out.push(String::from_utf8_lossy(&rdata[i..i + len]).into_owned());
        i += len;
    }
    Ok(out.join("."))
}
