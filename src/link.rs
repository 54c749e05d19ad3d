//! Duplex point-to-point packet carrier.
//!
//! A `Link` is one endpoint of an ordered, reliable, bidirectional channel
//! between exactly two parties (agent <-> network, process <-> process).
//! Order is preserved per direction; nothing is guaranteed between
//! directions. Dropping either endpoint closes the link: pending `recv`
//! calls fail with `LinkClosed`.

use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};

use crate::error::{Result, SimError};
use crate::packets::Packet;

pub struct Link {
    tx: Sender<Packet>,
    rx: Receiver<Packet>,
}

/// Build both endpoints of a duplex link.
pub fn link_pair() -> (Link, Link) {
    let (a_tx, b_rx) = unbounded();
    let (b_tx, a_rx) = unbounded();
    (Link { tx: a_tx, rx: a_rx }, Link { tx: b_tx, rx: b_rx })
}

impl Link {
    pub fn send(&self, packet: Packet) -> Result<()> {
        self.tx.send(packet).map_err(|_| SimError::LinkClosed)
    }

    /// Block until a packet arrives or the peer hangs up.
    pub fn recv(&self) -> Result<Packet> {
        self.rx.recv().map_err(|_| SimError::LinkClosed)
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Packet> {
        self.rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => SimError::TransactionFailure("recv timeout".into()),
            RecvTimeoutError::Disconnected => SimError::LinkClosed,
        })
    }

    /// A cloneable sender for this endpoint's outbound direction. Channel
    /// senders serialize writes internally, so concurrent holders are safe.
    pub fn sender(&self) -> Sender<Packet> {
        self.tx.clone()
    }

    /// The raw inbound receiver, for readers that `select` over it.
    pub fn receiver(&self) -> Receiver<Packet> {
        self.rx.clone()
    }
}

/// Single-use rendezvous used to park a transactional wait until the
/// dispatcher posts the matching ack.
pub fn rendezvous() -> (Sender<Packet>, Receiver<Packet>) {
    bounded(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packets::{Packet, PacketType, Payload};

    #[test]
    fn test_duplex_delivery() {
        let (a, b) = link_pair();
        a.send(Packet::new("a", "b", PacketType::ControllerMsg, Payload::Empty)).unwrap();
        b.send(Packet::new("b", "a", PacketType::ControllerMsg, Payload::Empty)).unwrap();
        assert_eq!(b.recv().unwrap().sender, "a");
        assert_eq!(a.recv().unwrap().sender, "b");
    }

    #[test]
    fn test_fifo_per_direction() {
        let (a, b) = link_pair();
        for i in 0..10 {
            a.send(
                Packet::new("a", "b", PacketType::ControllerMsg, Payload::Text(i.to_string())),
            )
            .unwrap();
        }
        for i in 0..10 {
            match b.recv().unwrap().payload {
                Payload::Text(s) => assert_eq!(s, i.to_string()),
                other => panic!("unexpected payload {other:?}"),
            }
        }
    }

    #[test]
    fn test_closed_link_errors() {
        let (a, b) = link_pair();
        drop(b);
        assert!(matches!(a.recv(), Err(SimError::LinkClosed)));
        assert!(a.send(Packet::new("a", "b", PacketType::ControllerMsg, Payload::Empty)).is_err());
    }
}
