use libp2p_identity::PeerId;

type ReservationPredicate = Box<dyn Fn(&PeerId) -> bool + Send + Sync>;
type CircuitPredicate = Box<dyn Fn(&PeerId, &PeerId) -> bool + Send + Sync>;

/// Authorization hooks consulted at the admission and dial points.
///
/// Every predicate is optional; an absent predicate permits. A predicate
/// returning `true` denies, which the protocol surfaces as
/// `PERMISSION_DENIED`. Predicates must be cheap and side-effect free; they
/// are called outside any engine lock but on the handler's task.
#[derive(Default)]
pub struct ConnectionGater {
    /// Consulted before admitting a RESERVE from the given peer.
    pub deny_inbound_relay_reservation: Option<ReservationPredicate>,
    /// Consulted with `(source, target)` before dialing STOP for a CONNECT.
    pub deny_outbound_relayed_connection: Option<CircuitPredicate>,
    /// Consulted with `(source, local)` when accepting an inbound STOP.
    pub deny_inbound_relayed_connection: Option<CircuitPredicate>,
}

impl ConnectionGater {
    /// A gater with no predicates installed, permitting everything.
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub(crate) fn denies_reservation(&self, peer: &PeerId) -> bool {
        self.deny_inbound_relay_reservation
            .as_ref()
            .is_some_and(|deny| deny(peer))
    }

    pub(crate) fn denies_outbound_circuit(&self, src: &PeerId, dst: &PeerId) -> bool {
        self.deny_outbound_relayed_connection
            .as_ref()
            .is_some_and(|deny| deny(src, dst))
    }

    pub(crate) fn denies_inbound_circuit(&self, src: &PeerId, dst: &PeerId) -> bool {
        self.deny_inbound_relayed_connection
            .as_ref()
            .is_some_and(|deny| deny(src, dst))
    }
}

impl std::fmt::Debug for ConnectionGater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionGater")
            .field(
                "deny_inbound_relay_reservation",
                &self.deny_inbound_relay_reservation.is_some(),
            )
            .field(
                "deny_outbound_relayed_connection",
                &self.deny_outbound_relayed_connection.is_some(),
            )
            .field(
                "deny_inbound_relayed_connection",
                &self.deny_inbound_relayed_connection.is_some(),
            )
            .finish()
    }
}
