//! Multicast DNS Service Discovery (mDNS/DNS-SD, RFC 6762/6763).
//!
//! [`Mdns`] is the top-level handle: it owns one transport and one
//! [`Responder`] record table, starts a [`Publisher`] session per advertised
//! [`Service`], and hands out independent [`Browser`] sessions.

pub mod browser;
pub mod discovered;
pub mod host;
pub mod publisher;
pub mod record;
pub mod responder;
pub mod service;
pub mod service_type;
pub mod transport;
pub mod txt;
pub mod wire;

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use browser::{Browser, BrowserEvent, Filter};
use host::{HostResolver, IfAddrsInterfaceLister, InterfaceLister, SystemHostResolver};
use publisher::{Publisher, ServiceEvent};
use responder::Responder;
use service::{Service, ServiceOptions};
use transport::{Config as TransportConfig, Transport, TransportEvent, UdpTransport};

const RESPONSE_BROADCAST_CAPACITY: usize = 256;

/// Top-level configuration (spec §6's options table).
#[derive(Debug, Clone, Default)]
pub struct MdnsConfig {
    pub transport: TransportConfig,
}

/// A published service handle: the [`Service`] plus the [`Publisher`] driving
/// it, returned from [`Mdns::publish`].
pub struct Published {
    service: Arc<Service>,
    publisher: Arc<Publisher>,
    events: Mutex<mpsc::UnboundedReceiver<ServiceEvent>>,
}

impl Published {
    pub fn service(&self) -> &Arc<Service> {
        &self.service
    }

    /// Wait for the next up/down transition reported by the publisher.
    pub async fn next_event(&self) -> Option<ServiceEvent> {
        self.events.lock().await.recv().await
    }

    /// Stop this service: sends a goodbye if it had been published.
    pub async fn stop(&self) -> Result<()> {
        self.publisher.stop().await
    }

    pub async fn destroy(&self) {
        self.publisher.destroy().await
    }
}

/// Owns the shared transport, the authoritative record table, the set of
/// started publishers, and the process-hostname/interface collaborators.
/// Services hold no reference back to this handle (spec §3 "Ownership"):
/// `Publisher::spawn` takes an `on_stop` closure instead, so the published
/// set can be kept in sync without a cycle.
pub struct Mdns {
    transport: Arc<dyn Transport>,
    responder: Arc<Responder>,
    host_resolver: Arc<dyn HostResolver>,
    interfaces: Arc<dyn InterfaceLister>,
    responses_tx: broadcast::Sender<wire::InboundResponse>,
    published: Mutex<Vec<(Arc<Service>, Arc<Publisher>)>>,
    cancel: CancellationToken,
}

impl Mdns {
    pub async fn new(config: MdnsConfig) -> Result<Arc<Self>> {
        let (transport, mut transport_events) = UdpTransport::new(config.transport).await?;
        let (responder, mut responded_rx) = Responder::new(transport.clone());
        let (responses_tx, _) = broadcast::channel(RESPONSE_BROADCAST_CAPACITY);
        let cancel = CancellationToken::new();

        let mdns = Arc::new(Mdns {
            transport,
            responder,
            host_resolver: Arc::new(SystemHostResolver),
            interfaces: Arc::new(IfAddrsInterfaceLister),
            responses_tx,
            published: Mutex::new(Vec::new()),
            cancel,
        });

        // Drain the Responder's own `responded` stream so it never backs up;
        // callers observe publish/browse state through their own handles.
        tokio::spawn(async move { while responded_rx.recv().await.is_some() {} });

        let dispatch_responder = mdns.responder.clone();
        let dispatch_tx = mdns.responses_tx.clone();
        let dispatch_cancel = mdns.cancel.child_token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = transport_events.recv() => {
                        match event {
                            Some(TransportEvent::Query(q)) => {
                                dispatch_responder.respond(&q.message.questions).await;
                            }
                            Some(TransportEvent::Response(r)) => {
                                let _ = dispatch_tx.send(r);
                            }
                            None => return,
                        }
                    }
                    _ = dispatch_cancel.cancelled() => return,
                }
            }
        });

        Ok(mdns)
    }

    /// Start advertising a service: runs probe (if enabled), then announce,
    /// and keeps re-announcing until stopped or destroyed.
    pub async fn publish(self: &Arc<Self>, options: ServiceOptions) -> Result<Published> {
        let service = Arc::new(Service::new(options)?);
        let mdns = self.clone();
        let service_for_stop = service.clone();
        let (publisher, events) = Publisher::spawn(
            service.clone(),
            self.responder.clone(),
            self.transport.clone(),
            self.host_resolver.clone(),
            self.interfaces.clone(),
            self.responses_tx.clone(),
            &self.cancel,
            Box::new(move || {
                let mdns = mdns.clone();
                let service_for_stop = service_for_stop.clone();
                tokio::spawn(async move {
                    let mut published = mdns.published.lock().await;
                    published.retain(|(svc, _)| !Arc::ptr_eq(svc, &service_for_stop));
                });
            }),
        );

        self.published.lock().await.push((service.clone(), publisher.clone()));

        Ok(Published { service, publisher, events: Mutex::new(events) })
    }

    /// Start a browse session against an optional filter.
    pub fn browse(self: &Arc<Self>, filter: Option<Filter>) -> (Arc<Browser>, mpsc::UnboundedReceiver<BrowserEvent>) {
        Browser::start(filter, self.transport.clone(), self.responses_tx.subscribe(), &self.cancel)
    }

    /// Stop every published service (sends goodbyes for any that are live).
    pub async fn unpublish_all(&self) -> Result<()> {
        let published = self.published.lock().await.clone();
        for (_, publisher) in published.iter() {
            publisher.stop().await?;
        }
        Ok(())
    }

    /// Tear everything down: cancels all sessions, marks every service
    /// destroyed, and shuts down the transport. No goodbyes are sent (spec
    /// §9 open question) — call [`Mdns::unpublish_all`] first for a graceful
    /// exit.
    pub async fn destroy(&self) {
        let published = self.published.lock().await.clone();
        for (_, publisher) in published.iter() {
            publisher.destroy().await;
        }
        self.cancel.cancel();
    }
}
