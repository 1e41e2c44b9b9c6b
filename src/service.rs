//! The relay service: wires the HOP handler into the host, drives the
//! reservation sweep, and owns every in-flight stream task.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use futures::prelude::*;
use libp2p_identity::PeerId;
use tokio::task::JoinSet;

use crate::{
    config::RelayConfig,
    error::Error,
    gater::ConnectionGater,
    hop::HopHandler,
    host::{AddressManager, ConnectionManager, IncomingStream, PeerTagger, ProtocolHandler, Registrar},
    store::ReservationStore,
    HOP_PROTOCOL_NAME,
};

/// The host facilities a [`Relay`] runs against.
pub struct RelayComponents<S> {
    pub connection_manager: Arc<dyn ConnectionManager<S>>,
    pub registrar: Arc<dyn Registrar<S>>,
    pub address_manager: Arc<dyn AddressManager>,
    pub peer_tagger: Arc<dyn PeerTagger>,
}

/// Server side of the circuit relay v2 protocol.
///
/// A value owned by the host: [`Relay::start`] registers the HOP protocol
/// and arms the reservation sweep, [`Relay::stop`] tears everything down
/// again. Both must be called from within a tokio runtime. `stop` is
/// idempotent, and so is `start` while running.
pub struct Relay<S> {
    inner: Arc<Inner<S>>,
}

struct Inner<S> {
    handler: Arc<HopHandler<S>>,
    registrar: Arc<dyn Registrar<S>>,
    // In-flight stream tasks plus the sweep; dropping the set aborts them.
    tasks: Mutex<JoinSet<()>>,
    running: AtomicBool,
}

impl<S> Relay<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Fails on an invalid configuration; the service refuses to exist
    /// rather than to misbehave later.
    pub fn new(
        local_peer_id: PeerId,
        components: RelayComponents<S>,
        gater: ConnectionGater,
        config: RelayConfig,
    ) -> Result<Self, Error> {
        config.validate()?;

        let store = Arc::new(ReservationStore::new(
            config.max_reservations,
            config.reservation_ttl,
        ));

        let handler = Arc::new(HopHandler {
            local_peer_id,
            config,
            store,
            gater: Arc::new(gater),
            connections: components.connection_manager,
            addresses: components.address_manager,
            tagger: components.peer_tagger,
        });

        Ok(Relay {
            inner: Arc::new(Inner {
                handler,
                registrar: components.registrar,
                tasks: Mutex::new(JoinSet::new()),
                running: AtomicBool::new(false),
            }),
        })
    }

    pub fn start(&self) -> Result<(), Error> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let weak = Arc::downgrade(&self.inner);
        let handler: ProtocolHandler<S> = Arc::new(move |incoming: IncomingStream<S>| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if !inner.running.load(Ordering::SeqCst) {
                // Late stream after stop(); dropping it resets it.
                return;
            }
            let hop = inner.handler.clone();
            let mut tasks = inner
                .tasks
                .lock()
                .expect("task set lock not to be poisoned");
            // Reap finished handlers so the set does not grow unbounded.
            while tasks.try_join_next().is_some() {}
            tasks.spawn(async move { hop.handle(incoming).await });
        });
        self.inner.registrar.handle(HOP_PROTOCOL_NAME, handler)?;

        let store = self.inner.handler.store.clone();
        self.inner
            .tasks
            .lock()
            .expect("task set lock not to be poisoned")
            .spawn(async move {
                let mut sweep = tokio::time::interval(Duration::from_secs(1));
                sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    sweep.tick().await;
                    for peer in store.remove_expired() {
                        tracing::debug!(%peer, "reservation expired");
                    }
                }
            });

        tracing::debug!("relay service started");

        Ok(())
    }

    /// Abort every in-flight handler and circuit, unregister the protocol
    /// and drain the store.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }

        self.inner.registrar.unhandle(HOP_PROTOCOL_NAME);
        self.inner
            .tasks
            .lock()
            .expect("task set lock not to be poisoned")
            .abort_all();
        self.inner.handler.store.clear();

        tracing::debug!("relay service stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.inner.handler.local_peer_id
    }

    /// The live reservations, mainly for introspection and tests.
    pub fn reservations(&self) -> &ReservationStore {
        &self.inner.handler.store
    }
}
