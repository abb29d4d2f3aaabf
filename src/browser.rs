//! Active PTR queries, response ingestion, and TTL-based service lifecycle
//! (spec §4.H).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use regex::Regex;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::discovered::{self, DiscoveredService};
use crate::record::{RecordData, ResourceRecord};
use crate::transport::Transport;
use crate::wire::{self, InboundResponse};

/// A name/value matcher: exact string (case-insensitive) or regex.
#[derive(Debug, Clone)]
pub enum NameMatch {
    Exact(String),
    Regex(Regex),
}

impl NameMatch {
    fn matches(&self, value: &str) -> bool {
        match self {
            NameMatch::Exact(s) => s.eq_ignore_ascii_case(value),
            NameMatch::Regex(re) => re.is_match(value),
        }
    }
}

/// Browse filter (spec §4.H). `None` at the [`Browser`] level means "accept
/// everything" and queries the DNS-SD wildcard name.
#[derive(Debug, Clone)]
pub struct Filter {
    pub protocol: String,
    pub service_type: String,
    pub subtypes: Vec<String>,
    pub name: Option<NameMatch>,
    pub txt: Vec<(String, NameMatch)>,
}

fn matches_filter(svc: &DiscoveredService, filter: &Filter) -> bool {
    if !svc.protocol.eq_ignore_ascii_case(&filter.protocol) {
        return false;
    }
    if !svc.service_type.eq_ignore_ascii_case(&filter.service_type) {
        return false;
    }
    if !filter
        .subtypes
        .iter()
        .all(|want| svc.subtypes.iter().any(|have| have.eq_ignore_ascii_case(want)))
    {
        return false;
    }
    if let Some(name_filter) = &filter.name {
        if !name_filter.matches(&svc.name) {
            return false;
        }
    }
    for (key, value_filter) in &filter.txt {
        let found = svc
            .txt
            .as_ref()
            .and_then(|pairs| pairs.iter().find(|(k, _)| k.eq_ignore_ascii_case(key)));
        match found {
            Some((_, value)) if value_filter.matches(value) => {}
            _ => return false,
        }
    }
    true
}

fn query_names(filter: &Option<Filter>) -> Vec<String> {
    let Some(filter) = filter else {
        return vec!["_services._dns-sd._udp.local".to_string()];
    };
    let base: Vec<String> = if filter.subtypes.is_empty() {
        vec![format!("_{}._{}.local", filter.service_type, filter.protocol)]
    } else {
        filter
            .subtypes
            .iter()
            .map(|s| format!("_{}._sub._{}._{}.local", s, filter.service_type, filter.protocol))
            .collect()
    };
    match &filter.name {
        Some(NameMatch::Exact(n)) => base.iter().map(|b| format!("{}.{}", n, b)).collect(),
        _ => base,
    }
}

/// Events the browser reports for known services (spec §9 "Browser: up|down|update").
#[derive(Debug, Clone)]
pub enum BrowserEvent {
    Up(DiscoveredService),
    Update(DiscoveredService),
    Down(DiscoveredService),
}

struct Entry {
    service: DiscoveredService,
    ttl_cancel: CancellationToken,
}

/// One browse session: issues the initial PTR queries, ingests responses,
/// and tracks the known set with per-service TTL timers.
pub struct Browser {
    filter: Option<Filter>,
    transport: Arc<dyn Transport>,
    query_names: Vec<String>,
    known: Mutex<HashMap<String, Entry>>,
    events_tx: mpsc::UnboundedSender<BrowserEvent>,
    cancel: CancellationToken,
}

impl Browser {
    pub fn start(
        filter: Option<Filter>,
        transport: Arc<dyn Transport>,
        responses: broadcast::Receiver<InboundResponse>,
        parent_cancel: &CancellationToken,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<BrowserEvent>) {
        let names = query_names(&filter);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let browser = Arc::new(Browser {
            filter,
            transport: transport.clone(),
            query_names: names.clone(),
            known: Mutex::new(HashMap::new()),
            events_tx,
            cancel: parent_cancel.child_token(),
        });

        for name in &names {
            if let Err(e) = transport.query(name, wire::TYPE_PTR) {
                log::warn!("mdnssd: initial browse query for {} failed: {}", name, e);
            }
        }

        let task_self = browser.clone();
        tokio::spawn(async move {
            task_self.run(responses).await;
        });
        (browser, events_rx)
    }

    async fn run(self: Arc<Self>, mut responses: broadcast::Receiver<InboundResponse>) {
        loop {
            tokio::select! {
                received = responses.recv() => {
                    match received {
                        Ok(resp) => self.handle_response(&resp).await,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
                _ = self.cancel.cancelled() => return,
            }
        }
    }

    async fn handle_response(self: &Arc<Self>, resp: &InboundResponse) {
        let raw: Vec<&wire::RawRecord> = resp.message.answers.iter().chain(resp.message.additionals.iter()).collect();

        // Goodbye sweep runs before extraction on the same packet.
        for r in &raw {
            if r.rtype == wire::TYPE_PTR && r.ttl == 0 {
                if let Ok(ResourceRecord { data: RecordData::Ptr { target }, .. }) = ResourceRecord::from_raw(r) {
                    self.remove_service(&target).await;
                }
            }
        }

        let typed: Vec<ResourceRecord> = raw.iter().filter_map(|r| ResourceRecord::from_raw(r).ok()).collect();
        let now = Instant::now();
        let found = discovered::extract(&typed, resp.referer.clone(), now);

        for svc in found {
            let already_known = self.known.lock().await.contains_key(&svc.fqdn);
            if already_known {
                self.update_service(svc).await;
            } else {
                self.add_service(svc).await;
            }
        }
    }

    fn arm_ttl_timer(self: &Arc<Self>, fqdn: String, ttl_secs: u32) -> CancellationToken {
        let cancel = CancellationToken::new();
        let child = cancel.clone();
        let browser = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(ttl_secs as u64)) => {
                    browser.expire_if_stale(&fqdn).await;
                }
                _ = child.cancelled() => {}
            }
        });
        cancel
    }

    async fn expire_if_stale(self: &Arc<Self>, fqdn: &str) {
        let is_expired = {
            let known = self.known.lock().await;
            known.get(fqdn).is_some_and(|e| e.service.expired_at(Instant::now()))
        };
        if is_expired {
            self.remove_service(fqdn).await;
        }
    }

    async fn add_service(self: &Arc<Self>, svc: DiscoveredService) {
        if let Some(filter) = &self.filter {
            if !matches_filter(&svc, filter) {
                return;
            }
        }
        let fqdn = svc.fqdn.clone();
        let ttl = svc.ttl.unwrap_or(0);
        let ttl_cancel = self.arm_ttl_timer(fqdn.clone(), ttl);
        self.known.lock().await.insert(fqdn, Entry { service: svc.clone(), ttl_cancel });
        let _ = self.events_tx.send(BrowserEvent::Up(svc));
    }

    async fn update_service(self: &Arc<Self>, svc: DiscoveredService) {
        let still_matches = self.filter.as_ref().map(|f| matches_filter(&svc, f)).unwrap_or(true);
        if !still_matches {
            self.remove_service(&svc.fqdn).await;
            return;
        }
        let fqdn = svc.fqdn.clone();
        let ttl = svc.ttl.unwrap_or(0);
        let ttl_cancel = self.arm_ttl_timer(fqdn.clone(), ttl);
        let previous = self.known.lock().await.insert(fqdn, Entry { service: svc.clone(), ttl_cancel });
        if let Some(previous) = previous {
            previous.ttl_cancel.cancel();
        }
        let _ = self.events_tx.send(BrowserEvent::Update(svc));
    }

    async fn remove_service(self: &Arc<Self>, fqdn: &str) {
        let removed = self.known.lock().await.remove(fqdn);
        if let Some(entry) = removed {
            entry.ttl_cancel.cancel();
            let _ = self.events_tx.send(BrowserEvent::Down(entry.service));
        }
    }

    /// Re-issue the PTR queries for the current query names.
    pub fn update(&self) -> Result<()> {
        for name in &self.query_names {
            self.transport.query(name, wire::TYPE_PTR)?;
        }
        Ok(())
    }

    /// Idempotently detach the listener and cancel all TTL timers.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let mut known = self.known.lock().await;
        for (_, entry) in known.drain() {
            entry.ttl_cancel.cancel();
        }
    }

    /// Resolve with the first matching service, or `None` after `timeout`.
    /// Whichever fires first stops the browser.
    pub async fn find_one(self: Arc<Self>, timeout: Duration, mut events: mpsc::UnboundedReceiver<BrowserEvent>) -> Option<DiscoveredService> {
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let result = loop {
            tokio::select! {
                received = events.recv() => match received {
                    Some(BrowserEvent::Up(svc)) => break Some(svc),
                    Some(_) => continue,
                    None => break None,
                },
                _ = &mut deadline => break None,
            }
        };
        self.stop().await;
        result
    }
}
