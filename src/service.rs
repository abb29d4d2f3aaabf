//! A published service's identity, state, and the record-set builder
//! (spec §3 `Service`, §4.E `getRecords`).

use tokio::sync::Mutex;

use crate::host::InterfaceAddress;
use crate::record::ResourceRecord;
use crate::txt::{self, TxtValue};

pub const LOCAL_TLD: &str = "local";
pub const DEFAULT_TTL: u32 = 28800;
const MAX_RENAME_ATTEMPTS: u32 = 10;

/// Caller-supplied fields for a service to advertise (spec §6 "Service options").
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub protocol: String,
    pub service_type: String,
    pub subtypes: Vec<String>,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub txt: Vec<(String, TxtValue)>,
    pub ttl: u32,
    pub probe: bool,
    pub probe_auto_resolve: bool,
    pub disable_ipv6: bool,
}

impl ServiceOptions {
    pub fn new(service_type: impl Into<String>, protocol: impl Into<String>, name: impl Into<String>, port: u16) -> Self {
        ServiceOptions {
            protocol: protocol.into(),
            service_type: service_type.into(),
            subtypes: Vec::new(),
            name: sanitize_name(&name.into()),
            host: String::new(),
            port,
            txt: Vec::new(),
            ttl: DEFAULT_TTL,
            probe: true,
            probe_auto_resolve: true,
            disable_ipv6: false,
        }
    }
}

/// Dots in the instance name are sanitized to dashes (spec §3 invariant).
fn sanitize_name(name: &str) -> String {
    name.replace('.', "-")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    NotStarted,
    Started,
    Published,
    Destroyed,
}

struct State {
    name: String,
    fqdn: String,
    lifecycle: Lifecycle,
}

/// An advertised service. Construction validates the port range (invariant 1);
/// everything else is mutable only through the methods below, which enforce
/// the one-way `destroyed` transition (spec §3 "States").
pub struct Service {
    pub protocol: String,
    pub service_type: String,
    pub subtypes: Vec<String>,
    pub host: String,
    pub port: u16,
    pub txt: Vec<(String, TxtValue)>,
    pub ttl: u32,
    pub probe: bool,
    pub probe_auto_resolve: bool,
    pub disable_ipv6: bool,
    state: Mutex<State>,
}

fn compute_fqdn(name: &str, service_type: &str, protocol: &str) -> String {
    format!("{}._{}._{}.{}", name, service_type, protocol, LOCAL_TLD)
}

fn type_label(service_type: &str, protocol: &str) -> String {
    format!("_{}._{}.{}", service_type, protocol, LOCAL_TLD)
}

impl Service {
    pub fn new(options: ServiceOptions) -> anyhow::Result<Self> {
        anyhow::ensure!((1..=65535).contains(&options.port), "InvalidInput: port {} out of range", options.port);
        let fqdn = compute_fqdn(&options.name, &options.service_type, &options.protocol);
        Ok(Service {
            protocol: options.protocol,
            service_type: options.service_type,
            subtypes: options.subtypes,
            host: options.host,
            port: options.port,
            txt: options.txt,
            ttl: options.ttl,
            probe: options.probe,
            probe_auto_resolve: options.probe_auto_resolve,
            disable_ipv6: options.disable_ipv6,
            state: Mutex::new(State { name: options.name, fqdn, lifecycle: Lifecycle::NotStarted }),
        })
    }

    pub async fn name(&self) -> String {
        self.state.lock().await.name.clone()
    }

    pub async fn fqdn(&self) -> String {
        self.state.lock().await.fqdn.clone()
    }

    pub async fn lifecycle(&self) -> Lifecycle {
        self.state.lock().await.lifecycle
    }

    pub async fn is_started(&self) -> bool {
        matches!(self.state.lock().await.lifecycle, Lifecycle::Started | Lifecycle::Published)
    }

    pub async fn is_published(&self) -> bool {
        self.state.lock().await.lifecycle == Lifecycle::Published
    }

    pub async fn is_destroyed(&self) -> bool {
        self.state.lock().await.lifecycle == Lifecycle::Destroyed
    }

    pub async fn mark_started(&self) {
        let mut state = self.state.lock().await;
        if state.lifecycle != Lifecycle::Destroyed {
            state.lifecycle = Lifecycle::Started;
        }
    }

    pub async fn mark_published(&self) {
        let mut state = self.state.lock().await;
        if state.lifecycle != Lifecycle::Destroyed {
            state.lifecycle = Lifecycle::Published;
        }
    }

    pub async fn mark_unpublished(&self) {
        let mut state = self.state.lock().await;
        if state.lifecycle == Lifecycle::Published {
            state.lifecycle = Lifecycle::Started;
        }
    }

    /// `destroy()` never sends a goodbye itself (spec §9 open question);
    /// callers that want graceful teardown must unpublish first.
    pub async fn mark_destroyed(&self) {
        self.state.lock().await.lifecycle = Lifecycle::Destroyed;
    }

    /// Rename to `"<original> (k)"` for the `rename_number`-th conflict
    /// auto-resolution attempt (1-based; `k = rename_number + 1`, so the
    /// first rename produces `"(2)"`), recomputing `fqdn`. Returns the new
    /// name, or `None` once `MAX_RENAME_ATTEMPTS` renames have already been
    /// tried (spec §4.F: up to 10 attempts).
    pub async fn try_rename_for_conflict(&self, rename_number: u32, original_name: &str) -> Option<String> {
        if rename_number > MAX_RENAME_ATTEMPTS {
            return None;
        }
        let new_name = format!("{} ({})", original_name, rename_number + 1);
        let mut state = self.state.lock().await;
        state.fqdn = compute_fqdn(&new_name, &self.service_type, &self.protocol);
        state.name = new_name.clone();
        Some(new_name)
    }

    pub fn type_label(&self) -> String {
        type_label(&self.service_type, &self.protocol)
    }

    pub fn service_enumeration_ptr_name() -> &'static str {
        "_services._dns-sd._udp.local"
    }

    /// Build the record set for this service, in the exact order spec §4.E
    /// requires, against the caller's resolved hostname and eligible
    /// interface addresses.
    pub async fn get_records(&self, hostname: &str, interfaces: &[InterfaceAddress]) -> Vec<ResourceRecord> {
        let state = self.state.lock().await;
        let fqdn = state.fqdn.clone();
        drop(state);

        let type_label = self.type_label();
        let host = if self.host.is_empty() { format!("{}.{}", hostname, LOCAL_TLD) } else { self.host.clone() };
        let mut records = Vec::new();

        records.push(ResourceRecord::ptr(&type_label, &fqdn, self.ttl));
        records.push(ResourceRecord::srv(&fqdn, &host, self.port, self.ttl));
        records.push(ResourceRecord::txt(&fqdn, txt::encode(&self.txt), self.ttl));
        records.push(ResourceRecord::ptr(Self::service_enumeration_ptr_name(), &type_label, self.ttl));

        for sub in &self.subtypes {
            let sub_name = format!("_{}._sub.{}", sub, type_label);
            records.push(ResourceRecord::ptr(sub_name, &fqdn, self.ttl));
        }

        for iface in interfaces.iter().filter(|i| i.is_eligible()) {
            match iface.address {
                std::net::IpAddr::V4(addr) => records.push(ResourceRecord::a(&host, addr, self.ttl)),
                std::net::IpAddr::V6(addr) => {
                    if !self.disable_ipv6 {
                        records.push(ResourceRecord::aaaa(&host, addr, self.ttl));
                    }
                }
            }
        }

        records
    }

    /// Build a TTL=0 ("goodbye") copy of the same record set.
    pub async fn get_goodbye_records(&self, hostname: &str, interfaces: &[InterfaceAddress]) -> Vec<ResourceRecord> {
        self.get_records(hostname, interfaces).await.into_iter().map(|mut r| {
            r.ttl = 0;
            r
        }).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::InterfaceAddress;
    use std::net::IpAddr;

    fn iface(addr: &str, internal: bool) -> InterfaceAddress {
        InterfaceAddress { address: addr.parse::<IpAddr>().unwrap(), mac: Some([1, 2, 3, 4, 5, 6]), internal }
    }

    #[test]
    fn rejects_out_of_range_ports() {
        assert!(Service::new(ServiceOptions::new("http", "tcp", "Foo", 0)).is_err());
        assert!(Service::new(ServiceOptions::new("http", "tcp", "Foo", 65536)).is_err());
        assert!(Service::new(ServiceOptions::new("http", "tcp", "Foo", 1)).is_ok());
    }

    #[tokio::test]
    async fn sanitizes_dots_in_name() {
        let svc = Service::new(ServiceOptions::new("http", "tcp", "my.service.name", 80)).unwrap();
        assert_eq!(svc.name().await, "my-service-name");
    }

    #[tokio::test]
    async fn s1_minimal_service_record_order_and_ttl() {
        let svc = Service::new(ServiceOptions::new("http", "tcp", "Foo Bar", 3000)).unwrap();
        let records = svc.get_records("myhost", &[]).await;
        assert_eq!(records[0], ResourceRecord::ptr("_http._tcp.local", "Foo Bar._http._tcp.local", 28800));
        assert_eq!(records[1], ResourceRecord::srv("Foo Bar._http._tcp.local", "myhost.local", 3000, 28800));
        assert_eq!(records[2], ResourceRecord::txt("Foo Bar._http._tcp.local", vec![], 28800));
        assert_eq!(
            records[3],
            ResourceRecord::ptr("_services._dns-sd._udp.local", "_http._tcp.local", 28800)
        );
        assert!(records.iter().all(|r| r.ttl == 28800));
    }

    #[tokio::test]
    async fn s2_ttl_txt_and_subtype_ptrs() {
        let mut opts = ServiceOptions::new("http", "tcp", "Foo", 3000);
        opts.ttl = 120;
        opts.txt = vec![("foo".to_string(), TxtValue::from("bar"))];
        opts.subtypes = vec!["foo".to_string(), "bar".to_string()];
        let svc = Service::new(opts).unwrap();
        let records = svc.get_records("myhost", &[]).await;

        let txt_rec = records.iter().find(|r| r.record_type() == crate::record::RecordType::Txt).unwrap();
        match &txt_rec.data {
            crate::record::RecordData::Txt { strings } => assert_eq!(strings, &vec![b"foo=bar".to_vec()]),
            _ => panic!("wrong variant"),
        }

        let sub_ptrs: Vec<&ResourceRecord> = records
            .iter()
            .filter(|r| r.record_type() == crate::record::RecordType::Ptr && r.name.contains("._sub."))
            .collect();
        assert_eq!(sub_ptrs.len(), 2);
        assert!(sub_ptrs.iter().any(|r| r.name == "_foo._sub._http._tcp.local"));
        assert!(sub_ptrs.iter().any(|r| r.name == "_bar._sub._http._tcp.local"));
        assert!(records.iter().all(|r| r.ttl == 120));
    }

    #[tokio::test]
    async fn skips_internal_and_honors_disable_ipv6() {
        let mut opts = ServiceOptions::new("http", "tcp", "Foo", 3000);
        opts.disable_ipv6 = true;
        let svc = Service::new(opts).unwrap();
        let interfaces = vec![
            iface("127.0.0.1", true),
            iface("192.168.1.5", false),
            iface("fe80::1", false),
        ];
        let records = svc.get_records("myhost", &interfaces).await;
        let a_count = records.iter().filter(|r| r.record_type() == crate::record::RecordType::A).count();
        let aaaa_count = records.iter().filter(|r| r.record_type() == crate::record::RecordType::Aaaa).count();
        assert_eq!(a_count, 1);
        assert_eq!(aaaa_count, 0);
    }

    #[tokio::test]
    async fn rename_recomputes_fqdn_up_to_ten_attempts() {
        let svc = Service::new(ServiceOptions::new("test", "tcp", "ConflictService", 1234)).unwrap();
        let renamed = svc.try_rename_for_conflict(1, "ConflictService").await.unwrap();
        assert_eq!(renamed, "ConflictService (2)");
        assert_eq!(svc.fqdn().await, "ConflictService (2)._test._tcp.local");
        let renamed = svc.try_rename_for_conflict(10, "ConflictService").await.unwrap();
        assert_eq!(renamed, "ConflictService (11)");
        assert!(svc.try_rename_for_conflict(11, "ConflictService").await.is_none());
    }
}
