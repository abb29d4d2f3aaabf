//! Authoritative record table and inbound-query answering.

use std::collections::HashMap;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;

use crate::record::{RecordType, ResourceRecord};
use crate::transport::Transport;
use crate::wire::{self, Question};
use std::sync::Arc;

/// Emitted after each attempted transmit, per spec §4.D ("Emits
/// `responded(packet, error?)`").
#[derive(Debug, Clone)]
pub struct Responded {
    pub answers: Vec<ResourceRecord>,
    pub additionals: Vec<ResourceRecord>,
    pub error: Option<String>,
}

fn same_record_excluding_ttl(a: &ResourceRecord, b: &ResourceRecord) -> bool {
    a.name == b.name && a.data == b.data
}

fn first_label(name: &str) -> &str {
    name.split('.').next().unwrap_or(name)
}

/// True if `qname` matches `record_name` under the §4.D "loose" rule:
/// a dotted qname compares the whole name case-insensitively; an undotted
/// one compares only the record's first label.
fn loose_name_match(qname: &str, record_name: &str) -> bool {
    if qname.contains('.') {
        ResourceRecord::name_eq_ci(qname, record_name)
    } else {
        first_label(record_name).eq_ignore_ascii_case(qname)
    }
}

/// Holds the authoritative record table and answers inbound mDNS queries.
pub struct Responder {
    table: Mutex<HashMap<RecordType, Vec<ResourceRecord>>>,
    transport: Arc<dyn Transport>,
    responded_tx: UnboundedSender<Responded>,
}

impl Responder {
    pub fn new(transport: Arc<dyn Transport>) -> (Arc<Self>, UnboundedReceiver<Responded>) {
        let (responded_tx, responded_rx) = mpsc::unbounded_channel();
        (Arc::new(Responder { table: Mutex::new(HashMap::new()), transport, responded_tx }), responded_rx)
    }

    /// Register records, skipping any whose `(type, name, data)` triple
    /// already exists (invariant 4: registering twice is idempotent).
    pub async fn register(&self, records: &[ResourceRecord]) {
        let mut table = self.table.lock().await;
        for rr in records {
            let bucket = table.entry(rr.record_type()).or_default();
            if !bucket.iter().any(|existing| same_record_excluding_ttl(existing, rr)) {
                bucket.push(rr.clone());
            }
        }
    }

    /// Remove every record whose name matches (case-insensitive, full name)
    /// one of `records`' names, from that record's type bucket. Buckets left
    /// empty are dropped.
    pub async fn unregister(&self, records: &[ResourceRecord]) {
        let mut table = self.table.lock().await;
        for rr in records {
            if let Some(bucket) = table.get_mut(&rr.record_type()) {
                bucket.retain(|existing| !ResourceRecord::name_eq_ci(&existing.name, &rr.name));
                if bucket.is_empty() {
                    table.remove(&rr.record_type());
                }
            }
        }
    }

    async fn match_records(&self, qtype: u16, qname: &str) -> Vec<ResourceRecord> {
        let table = self.table.lock().await;
        let mut out = Vec::new();
        if qtype == wire::QTYPE_ANY {
            for bucket in table.values() {
                out.extend(bucket.iter().filter(|r| loose_name_match(qname, &r.name)).cloned());
            }
        } else if let Some(rtype) = RecordType::from_wire_type(qtype) {
            if let Some(bucket) = table.get(&rtype) {
                out.extend(bucket.iter().filter(|r| loose_name_match(qname, &r.name)).cloned());
            }
        }
        out
    }

    async fn additionals_for(&self, answers: &[ResourceRecord]) -> Vec<ResourceRecord> {
        let table = self.table.lock().await;
        let mut additionals = Vec::new();

        let ptr_targets: Vec<&str> =
            answers.iter().filter_map(|r| match &r.data {
                crate::record::RecordData::Ptr { target } => Some(target.as_str()),
                _ => None,
            }).collect();

        for target in &ptr_targets {
            for rtype in [RecordType::Srv, RecordType::Txt] {
                if let Some(bucket) = table.get(&rtype) {
                    additionals.extend(
                        bucket.iter().filter(|r| ResourceRecord::name_eq_ci(&r.name, target)).cloned(),
                    );
                }
            }
        }

        let srv_targets: Vec<String> = additionals
            .iter()
            .filter_map(|r| match &r.data {
                crate::record::RecordData::Srv { target, .. } => Some(target.clone()),
                _ => None,
            })
            .collect();

        for target in &srv_targets {
            for rtype in [RecordType::A, RecordType::Aaaa] {
                if let Some(bucket) = table.get(&rtype) {
                    additionals.extend(
                        bucket.iter().filter(|r| ResourceRecord::name_eq_ci(&r.name, target)).cloned(),
                    );
                }
            }
        }

        additionals
    }

    /// Answer each question in an inbound query, one response packet per
    /// question that has matches (questions with no matches are ignored, not
    /// answered with an empty packet).
    pub async fn respond(&self, questions: &[Question]) {
        for q in questions {
            let answers = self.match_records(q.qtype, &q.name).await;
            if answers.is_empty() {
                continue;
            }
            let additionals =
                if q.qtype == wire::QTYPE_ANY { Vec::new() } else { self.additionals_for(&answers).await };

            let error = self.transport.respond(&answers, &additionals).err().map(|e| e.to_string());
            let _ = self.responded_tx.send(Responded { answers, additionals, error });
        }
    }
}
