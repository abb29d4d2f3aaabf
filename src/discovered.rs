//! Build a [`DiscoveredService`] view from an inbound response packet (spec §4.G).

use std::net::IpAddr;
use std::time::{Duration, Instant};

use crate::record::{RecordData, ResourceRecord};
use crate::service_type::ServiceType;
use crate::txt::{self, TxtDecoded};
use crate::wire::RemoteInfo;

#[derive(Debug, Clone)]
pub struct DiscoveredService {
    pub name: String,
    pub fqdn: String,
    pub host: String,
    pub port: u16,
    pub referer: RemoteInfo,
    pub service_type: String,
    pub protocol: String,
    pub subtypes: Vec<String>,
    pub addresses: Vec<IpAddr>,
    pub txt: Option<Vec<(String, String)>>,
    pub raw_txt: Option<Vec<Vec<u8>>>,
    pub ttl: Option<u32>,
    pub last_seen: Instant,
}

impl DiscoveredService {
    pub fn expired_at(&self, now: Instant) -> bool {
        match self.ttl {
            Some(ttl) => now > self.last_seen + Duration::from_secs(ttl as u64),
            None => false,
        }
    }
}

/// Extract every service instance present in a response's answers +
/// additionals. Records with `ttl == 0` (goodbyes) are excluded — those are
/// handled by the browser's separate goodbye sweep.
pub fn extract(records: &[ResourceRecord], referer: RemoteInfo, now: Instant) -> Vec<DiscoveredService> {
    let live: Vec<&ResourceRecord> = records.iter().filter(|r| r.ttl > 0).collect();

    let mut out: Vec<DiscoveredService> = Vec::new();
    for ptr in live.iter().filter(|r| r.record_type() == crate::record::RecordType::Ptr) {
        let target = match &ptr.data {
            RecordData::Ptr { target } => target,
            _ => unreachable!(),
        };
        // A subtype PTR (`_sub.` owner name) and the real type PTR can both
        // target the same instance fqdn in one response (e.g. a browser that
        // queried only the subtype name gets back the subtype PTR plus the
        // instance's SRV/TXT, with no separate type PTR at all) — seed from
        // whichever PTR we see first and skip the rest so one instance never
        // produces more than one `DiscoveredService`.
        if out.iter().any(|svc| ResourceRecord::name_eq_ci(&svc.fqdn, target)) {
            continue;
        }

        let srv = live.iter().find(|r| {
            r.record_type() == crate::record::RecordType::Srv && ResourceRecord::name_eq_ci(&r.name, target)
        });
        let Some(srv) = srv else { continue };
        let (port, host) = match &srv.data {
            RecordData::Srv { port, target } => (*port, target.clone()),
            _ => unreachable!(),
        };

        let fqdn = srv.name.clone();
        let name = fqdn.split('.').next().unwrap_or(&fqdn).to_string();
        let labels: Vec<&str> = fqdn.split('.').collect();
        let (service_type, protocol) = if labels.len() >= 4 {
            let type_part = labels[1..labels.len() - 1].join(".");
            match ServiceType::parse(&type_part) {
                Ok(st) => (st.name, st.protocol),
                Err(_) => (String::new(), String::new()),
            }
        } else {
            (String::new(), String::new())
        };

        let mut subtypes = Vec::new();
        for sub_ptr in live.iter().filter(|r| r.record_type() == crate::record::RecordType::Ptr && r.name.contains("._sub.")) {
            if let RecordData::Ptr { target: sub_target } = &sub_ptr.data {
                if ResourceRecord::name_eq_ci(sub_target, &fqdn) {
                    if let Some(sub) = sub_ptr.name.strip_prefix('_').and_then(|s| s.split("._sub.").next()) {
                        subtypes.push(sub.to_string());
                    }
                }
            }
        }

        let txt_rec = live.iter().find(|r| {
            r.record_type() == crate::record::RecordType::Txt && ResourceRecord::name_eq_ci(&r.name, &fqdn)
        });
        let (txt_strings, raw_txt) = match txt_rec {
            Some(r) => match &r.data {
                RecordData::Txt { strings } => {
                    let decoded = txt::decode(strings, false);
                    let as_strings: Vec<(String, String)> = decoded
                        .into_iter()
                        .map(|(k, v)| match v {
                            TxtDecoded::Str(s) => (k, s),
                            TxtDecoded::Bytes(_) => unreachable!(),
                        })
                        .collect();
                    (Some(as_strings), Some(strings.clone()))
                }
                _ => (None, None),
            },
            None => (None, None),
        };

        let addresses: Vec<IpAddr> = live
            .iter()
            .filter(|r| {
                matches!(r.record_type(), crate::record::RecordType::A | crate::record::RecordType::Aaaa)
                    && ResourceRecord::name_eq_ci(&r.name, &host)
            })
            .map(|r| match &r.data {
                RecordData::A { address } => IpAddr::V4(*address),
                RecordData::Aaaa { address } => IpAddr::V6(*address),
                _ => unreachable!(),
            })
            .collect();

        out.push(DiscoveredService {
            name,
            fqdn,
            host,
            port,
            referer: referer.clone(),
            service_type,
            protocol,
            subtypes,
            addresses,
            txt: txt_strings,
            raw_txt,
            ttl: Some(ptr.ttl),
            last_seen: now,
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Family;

    fn referer() -> RemoteInfo {
        RemoteInfo { address: "127.0.0.1".parse().unwrap(), family: Family::V4, port: 5353 }
    }

    #[test]
    fn extracts_a_basic_instance() {
        let records = vec![
            ResourceRecord::ptr("_http._tcp.local", "Foo Bar._http._tcp.local", 120),
            ResourceRecord::srv("Foo Bar._http._tcp.local", "host.local", 3000, 120),
            ResourceRecord::txt("Foo Bar._http._tcp.local", vec![b"foo=bar".to_vec()], 120),
            ResourceRecord::a("host.local", "192.168.1.5".parse().unwrap(), 120),
        ];
        let out = extract(&records, referer(), Instant::now());
        assert_eq!(out.len(), 1);
        let svc = &out[0];
        assert_eq!(svc.name, "Foo Bar");
        assert_eq!(svc.fqdn, "Foo Bar._http._tcp.local");
        assert_eq!(svc.host, "host.local");
        assert_eq!(svc.port, 3000);
        assert_eq!(svc.service_type, "http");
        assert_eq!(svc.protocol, "tcp");
        assert_eq!(svc.addresses, vec!["192.168.1.5".parse::<IpAddr>().unwrap()]);
        assert_eq!(svc.txt, Some(vec![("foo".to_string(), "bar".to_string())]));
        assert_eq!(svc.ttl, Some(120));
    }

    #[test]
    fn skips_ptr_with_no_matching_srv() {
        let records = vec![ResourceRecord::ptr("_http._tcp.local", "Foo Bar._http._tcp.local", 120)];
        assert!(extract(&records, referer(), Instant::now()).is_empty());
    }

    #[test]
    fn excludes_goodbye_records() {
        let records = vec![
            ResourceRecord::ptr("_http._tcp.local", "Foo Bar._http._tcp.local", 0),
            ResourceRecord::srv("Foo Bar._http._tcp.local", "host.local", 3000, 0),
        ];
        assert!(extract(&records, referer(), Instant::now()).is_empty());
    }

    #[test]
    fn collects_subtypes() {
        let records = vec![
            ResourceRecord::ptr("_http._tcp.local", "Foo._http._tcp.local", 120),
            ResourceRecord::srv("Foo._http._tcp.local", "host.local", 3000, 120),
            ResourceRecord::ptr("_printer._sub._http._tcp.local", "Foo._http._tcp.local", 120),
        ];
        let out = extract(&records, referer(), Instant::now());
        assert_eq!(out[0].subtypes, vec!["printer".to_string()]);
    }

    #[test]
    fn seeds_from_a_subtype_ptr_alone() {
        // A browser that queried only `_printer._sub._http._tcp.local` gets
        // back just the subtype PTR plus the instance's SRV/TXT — no
        // separate top-level type PTR in the same packet.
        let records = vec![
            ResourceRecord::ptr("_printer._sub._http._tcp.local", "Foo._http._tcp.local", 120),
            ResourceRecord::srv("Foo._http._tcp.local", "host.local", 3000, 120),
            ResourceRecord::txt("Foo._http._tcp.local", vec![b"foo=bar".to_vec()], 120),
        ];
        let out = extract(&records, referer(), Instant::now());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].fqdn, "Foo._http._tcp.local");
        assert_eq!(out[0].subtypes, vec!["printer".to_string()]);
    }

    #[test]
    fn does_not_duplicate_instance_seen_via_both_type_and_subtype_ptr() {
        let records = vec![
            ResourceRecord::ptr("_http._tcp.local", "Foo._http._tcp.local", 120),
            ResourceRecord::ptr("_printer._sub._http._tcp.local", "Foo._http._tcp.local", 120),
            ResourceRecord::srv("Foo._http._tcp.local", "host.local", 3000, 120),
        ];
        let out = extract(&records, referer(), Instant::now());
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn expiry_uses_ptr_ttl() {
        let svc = DiscoveredService {
            name: "Foo".into(),
            fqdn: "Foo._http._tcp.local".into(),
            host: "host.local".into(),
            port: 1,
            referer: referer(),
            service_type: "http".into(),
            protocol: "tcp".into(),
            subtypes: vec![],
            addresses: vec![],
            txt: None,
            raw_txt: None,
            ttl: Some(1),
            last_seen: Instant::now() - Duration::from_secs(2),
        };
        assert!(svc.expired_at(Instant::now()));
    }
}
