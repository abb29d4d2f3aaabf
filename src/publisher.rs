//! Probe / announce / re-announce / goodbye state machine (spec §4.F).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::host::{HostResolver, InterfaceLister};
use crate::record::{RecordType, ResourceRecord};
use crate::responder::Responder;
use crate::service::Service;
use crate::transport::Transport;
use crate::wire::{self, InboundResponse};

const PROBE_INTERVAL: Duration = Duration::from_millis(250);
const PROBE_JITTER_MS: u64 = 250;
const INITIAL_ANNOUNCE_DELAY_MS: u64 = 1000;
const ANNOUNCE_BACKOFF_MULTIPLIER: u64 = 3;
const MAX_ANNOUNCE_DELAY_MS: u64 = 3_600_000;

/// Events a `Service` publication reports upward (spec §9: `Service: up|down`).
#[derive(Debug, Clone)]
pub enum ServiceEvent {
    Up,
    Down { reason: Option<String> },
}

/// Drives one [`Service`] through probe/announce/goodbye. Owns no
/// registry reference of its own — `on_stop` is the capability handle the
/// top-level `Mdns` passes in so it can keep its published-set bookkeeping in
/// sync without the service holding a cycle back to it (spec §9).
pub struct Publisher {
    service: Arc<Service>,
    responder: Arc<Responder>,
    transport: Arc<dyn Transport>,
    host_resolver: Arc<dyn HostResolver>,
    interfaces: Arc<dyn InterfaceLister>,
    responses: broadcast::Sender<InboundResponse>,
    cancel: CancellationToken,
    events_tx: mpsc::UnboundedSender<ServiceEvent>,
    on_stop: Box<dyn Fn() + Send + Sync>,
    running: AtomicBool,
}

enum ProbeOutcome {
    Unique,
    Aborted,
    ConflictFatal,
}

impl Publisher {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        service: Arc<Service>,
        responder: Arc<Responder>,
        transport: Arc<dyn Transport>,
        host_resolver: Arc<dyn HostResolver>,
        interfaces: Arc<dyn InterfaceLister>,
        responses: broadcast::Sender<InboundResponse>,
        parent_cancel: &CancellationToken,
        on_stop: Box<dyn Fn() + Send + Sync>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ServiceEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let publisher = Arc::new(Publisher {
            service,
            responder,
            transport,
            host_resolver,
            interfaces,
            responses,
            cancel: parent_cancel.child_token(),
            events_tx,
            on_stop,
            running: AtomicBool::new(true),
        });
        let task_self = publisher.clone();
        tokio::spawn(async move {
            task_self.run().await;
        });
        (publisher, events_rx)
    }

    async fn run(self: Arc<Self>) {
        self.service.mark_started().await;

        if self.service.probe {
            match self.probe_loop().await {
                ProbeOutcome::Unique => {}
                ProbeOutcome::Aborted => return,
                ProbeOutcome::ConflictFatal => {
                    let _ = self.events_tx.send(ServiceEvent::Down {
                        reason: Some("NameConflict: probe failed after maximum rename attempts".into()),
                    });
                    (self.on_stop)();
                    return;
                }
            }
        }

        if self.service.is_destroyed().await {
            return;
        }

        self.announce_loop().await;
    }

    async fn probe_loop(&self) -> ProbeOutcome {
        let original_name = self.service.name().await;
        let mut renames: u32 = 0;

        loop {
            if self.service.is_destroyed().await {
                return ProbeOutcome::Aborted;
            }
            let fqdn = self.service.fqdn().await;
            match self.probe_once(&fqdn).await {
                Ok(false) => return ProbeOutcome::Unique,
                Ok(true) => {
                    if !self.service.probe_auto_resolve {
                        return ProbeOutcome::ConflictFatal;
                    }
                    renames += 1;
                    if self.service.try_rename_for_conflict(renames, &original_name).await.is_none() {
                        return ProbeOutcome::ConflictFatal;
                    }
                }
                Err(_aborted) => return ProbeOutcome::Aborted,
            }
        }
    }

    /// Run one probe round for `fqdn`. Returns `Ok(true)` on conflict,
    /// `Ok(false)` if unique, `Err(())` if the publisher was stopped mid-probe.
    async fn probe_once(&self, fqdn: &str) -> Result<bool, ()> {
        let mut rx = self.responses.subscribe();

        let jitter_ms = rand::thread_rng().gen_range(0..=PROBE_JITTER_MS);
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(jitter_ms)) => {}
            _ = self.cancel.cancelled() => return Err(()),
        }
        // Responses arriving before the first probe is sent are ignored.
        while rx.try_recv().is_ok() {}

        for probe_index in 0..3u8 {
            if self.transport.query(fqdn, wire::QTYPE_ANY).is_err() {
                log::warn!("mdnssd: probe send failed for {}", fqdn);
            }

            let deadline = tokio::time::sleep(PROBE_INTERVAL);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    _ = &mut deadline => break,
                    received = rx.recv() => {
                        match received {
                            Ok(resp) if response_names_fqdn(&resp, fqdn) => return Ok(true),
                            Ok(_) => continue,
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(broadcast::error::RecvError::Closed) => return Err(()),
                        }
                    }
                    _ = self.cancel.cancelled() => return Err(()),
                }
            }
            let _ = probe_index;
        }
        Ok(false)
    }

    async fn build_records(&self) -> Result<Vec<ResourceRecord>> {
        let hostname = self.host_resolver.hostname()?;
        let interfaces = self.interfaces.local_interfaces()?;
        Ok(self.service.get_records(&hostname, &interfaces).await)
    }

    fn split_answers_additionals(records: Vec<ResourceRecord>) -> (Vec<ResourceRecord>, Vec<ResourceRecord>) {
        records.into_iter().partition(|r| r.record_type() == RecordType::Ptr)
    }

    async fn transmit(&self, records: Vec<ResourceRecord>) {
        self.responder.register(&records).await;
        let (answers, additionals) = Self::split_answers_additionals(records);
        if let Err(e) = self.transport.respond(&answers, &additionals) {
            log::warn!("mdnssd: announce transmit failed: {}", e);
        }
    }

    async fn announce_loop(&self) {
        let records = match self.build_records().await {
            Ok(r) => r,
            Err(e) => {
                log::warn!("mdnssd: failed to build records for announce: {}", e);
                return;
            }
        };
        self.transmit(records).await;
        self.service.mark_published().await;
        let _ = self.events_tx.send(ServiceEvent::Up);

        let mut delay_ms = INITIAL_ANNOUNCE_DELAY_MS;
        loop {
            if delay_ms >= MAX_ANNOUNCE_DELAY_MS {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                _ = self.cancel.cancelled() => return,
            }
            if self.service.is_destroyed().await {
                return;
            }
            match self.build_records().await {
                Ok(records) => self.transmit(records).await,
                Err(e) => log::warn!("mdnssd: failed to rebuild records for re-announce: {}", e),
            }
            delay_ms = delay_ms.saturating_mul(ANNOUNCE_BACKOFF_MULTIPLIER);
        }
    }

    /// Stop the publisher. If the service had been published, sends a
    /// goodbye (ttl=0) and emits exactly one `Down`; otherwise aborts
    /// whatever phase is in flight with no further events.
    pub async fn stop(&self) -> Result<()> {
        self.cancel.cancel();
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        if self.service.is_published().await {
            let result = self.send_goodbye().await;
            self.service.mark_unpublished().await;
            let _ = self.events_tx.send(ServiceEvent::Down { reason: None });
            (self.on_stop)();
            return result;
        }
        (self.on_stop)();
        Ok(())
    }

    async fn send_goodbye(&self) -> Result<()> {
        let hostname = self.host_resolver.hostname()?;
        let interfaces = self.interfaces.local_interfaces()?;
        let records = self.service.get_goodbye_records(&hostname, &interfaces).await;
        self.responder.unregister(&records).await;
        let (answers, additionals) = Self::split_answers_additionals(records);
        self.transport.respond(&answers, &additionals)
    }

    /// Destroy: mark the service destroyed and abort any in-flight phase.
    /// No goodbye is sent (spec §9 open question, preserved verbatim).
    pub async fn destroy(&self) {
        self.cancel.cancel();
        self.service.mark_destroyed().await;
        if self.running.swap(false, Ordering::SeqCst) {
            (self.on_stop)();
        }
    }
}

fn response_names_fqdn(resp: &InboundResponse, fqdn: &str) -> bool {
    resp.message
        .answers
        .iter()
        .chain(resp.message.additionals.iter())
        .any(|r| ResourceRecord::name_eq_ci(&r.name, fqdn))
}
