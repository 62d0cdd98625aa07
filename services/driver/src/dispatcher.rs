//! Inbound packet dispatch.
//!
//! A single worker task drains the bounded packet queue fed by the port
//! read loop and offers each packet to the listeners registered for its
//! type, in registration order. The first listener to return `true` claims
//! the packet; a one-shot listener is removed the moment it claims, before
//! the next packet is dequeued.
//!
//! Unclaimed Error packets are re-offered to the Command listener list so an
//! in-flight command can learn that its reply was an error reply; every
//! other unclaimed packet is logged and dropped.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use stim_protocol::{Packet, PacketType};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A packet handler. Runs synchronously on the dispatch worker and must not
/// block; return `true` to claim the packet.
pub type ListenerFn = Box<dyn FnMut(&Packet) -> bool + Send>;

/// Identity token for a registered listener. Registering the same handler
/// value twice yields two distinct tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no listener registered under that id")]
    NotFound,
}

struct Entry {
    id: ListenerId,
    one_shot: bool,
    handler: ListenerFn,
}

struct Inner {
    table: Mutex<HashMap<PacketType, Vec<Entry>>>,
    next_id: AtomicU64,
}

/// Handle to the listener table and the packet queue. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
    tx: mpsc::Sender<Packet>,
}

impl Dispatcher {
    /// Create the dispatcher and spawn its worker task.
    pub fn start(queue_depth: usize, shutdown: watch::Receiver<bool>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(queue_depth);
        let inner = Arc::new(Inner {
            table: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        });
        let worker_inner = Arc::clone(&inner);
        let task = tokio::spawn(run_worker(worker_inner, rx, shutdown));
        (Dispatcher { inner, tx }, task)
    }

    /// Queue endpoint for the port read loop.
    pub fn sender(&self) -> mpsc::Sender<Packet> {
        self.tx.clone()
    }

    /// Register a listener at the end of the list for `packet_type`.
    /// Registration order is dispatch order.
    pub fn register(
        &self,
        packet_type: PacketType,
        one_shot: bool,
        handler: ListenerFn,
    ) -> ListenerId {
        let id = ListenerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let mut table = self.inner.table.lock().expect("listener table lock");
        table.entry(packet_type).or_default().push(Entry {
            id,
            one_shot,
            handler,
        });
        id
    }

    /// Remove a listener by its identity token.
    pub fn unregister(&self, packet_type: PacketType, id: ListenerId) -> Result<(), DispatchError> {
        let mut table = self.inner.table.lock().expect("listener table lock");
        let Some(list) = table.get_mut(&packet_type) else {
            return Err(DispatchError::NotFound);
        };
        match list.iter().position(|entry| entry.id == id) {
            Some(index) => {
                list.remove(index);
                Ok(())
            }
            None => Err(DispatchError::NotFound),
        }
    }
}

async fn run_worker(
    inner: Arc<Inner>,
    mut rx: mpsc::Receiver<Packet>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            packet = rx.recv() => match packet {
                Some(packet) => dispatch(&inner, &packet),
                None => break,
            }
        }
    }
    debug!("dispatcher worker stopped");
}

fn dispatch(inner: &Inner, packet: &Packet) {
    let mut table = inner.table.lock().expect("listener table lock");
    if offer(&mut table, packet.packet_type(), packet) {
        return;
    }
    match packet.packet_type() {
        // Error replies to a pending command arrive typed Error; give the
        // command listeners a chance before declaring the packet orphaned.
        PacketType::Error => {
            if !offer(&mut table, PacketType::Command, packet) {
                debug!(id = packet.id(), "unclaimed error packet");
            }
        }
        other => {
            debug!(packet_type = ?other, id = packet.id(), "unhandled packet");
        }
    }
}

/// Offer `packet` to the listener list for `packet_type`. Returns true if a
/// listener claimed it. A panicking listener is logged and skipped.
fn offer(
    table: &mut HashMap<PacketType, Vec<Entry>>,
    packet_type: PacketType,
    packet: &Packet,
) -> bool {
    let Some(list) = table.get_mut(&packet_type) else {
        return false;
    };
    let mut claimed = None;
    for (index, entry) in list.iter_mut().enumerate() {
        match catch_unwind(AssertUnwindSafe(|| (entry.handler)(packet))) {
            Ok(true) => {
                claimed = Some(index);
                break;
            }
            Ok(false) => {}
            Err(_) => {
                warn!(packet_type = ?packet_type, "listener panicked; skipping");
            }
        }
    }
    match claimed {
        Some(index) => {
            if list[index].one_shot {
                list.remove(index);
            }
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::{sleep, Duration};

    fn command_packet(id: u8) -> Packet {
        Packet::new(PacketType::Command, id, vec![0x00]).unwrap()
    }

    fn error_packet(id: u8, code: u8) -> Packet {
        Packet::new(PacketType::Error, id, vec![code]).unwrap()
    }

    async fn settle() {
        sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn listeners_fire_in_registration_order_and_first_claim_wins() {
        let (_stop_tx, stop_rx) = watch::channel(false);
        let (dispatcher, _task) = Dispatcher::start(8, stop_rx);
        let order = Arc::new(Mutex::new(Vec::new()));

        for (name, claims) in [("a", false), ("b", true), ("c", true)] {
            let order = Arc::clone(&order);
            dispatcher.register(
                PacketType::Command,
                false,
                Box::new(move |_| {
                    order.lock().unwrap().push(name);
                    claims
                }),
            );
        }

        dispatcher.sender().send(command_packet(1)).await.unwrap();
        settle().await;
        // "c" never runs: "b" claimed first.
        assert_eq!(*order.lock().unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn one_shot_listener_is_removed_after_claiming() {
        let (_stop_tx, stop_rx) = watch::channel(false);
        let (dispatcher, _task) = Dispatcher::start(8, stop_rx);
        let hits = Arc::new(AtomicUsize::new(0));

        let hits_in = Arc::clone(&hits);
        let id = dispatcher.register(
            PacketType::Command,
            true,
            Box::new(move |_| {
                hits_in.fetch_add(1, Ordering::SeqCst);
                true
            }),
        );

        dispatcher.sender().send(command_packet(1)).await.unwrap();
        dispatcher.sender().send(command_packet(2)).await.unwrap();
        settle().await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(matches!(
            dispatcher.unregister(PacketType::Command, id),
            Err(DispatchError::NotFound)
        ));
    }

    #[tokio::test]
    async fn unclaimed_error_packet_reaches_command_listeners() {
        let (_stop_tx, stop_rx) = watch::channel(false);
        let (dispatcher, _task) = Dispatcher::start(8, stop_rx);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_in = Arc::clone(&seen);
        dispatcher.register(
            PacketType::Command,
            false,
            Box::new(move |p| {
                seen_in
                    .lock()
                    .unwrap()
                    .push((p.packet_type(), p.id(), p.payload()[0]));
                true
            }),
        );

        dispatcher.sender().send(error_packet(9, 5)).await.unwrap();
        settle().await;
        assert_eq!(*seen.lock().unwrap(), vec![(PacketType::Error, 9, 5)]);
    }

    #[tokio::test]
    async fn panicking_listener_does_not_stop_dispatch() {
        let (_stop_tx, stop_rx) = watch::channel(false);
        let (dispatcher, _task) = Dispatcher::start(8, stop_rx);
        let hits = Arc::new(AtomicUsize::new(0));

        dispatcher.register(
            PacketType::Command,
            false,
            Box::new(|_| panic!("listener bug")),
        );
        let hits_in = Arc::clone(&hits);
        dispatcher.register(
            PacketType::Command,
            false,
            Box::new(move |_| {
                hits_in.fetch_add(1, Ordering::SeqCst);
                true
            }),
        );

        dispatcher.sender().send(command_packet(1)).await.unwrap();
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unregister_removes_only_the_identified_registration() {
        let (_stop_tx, stop_rx) = watch::channel(false);
        let (dispatcher, _task) = Dispatcher::start(8, stop_rx);
        let hits = Arc::new(AtomicUsize::new(0));

        // The same counting behavior registered twice: removal is by
        // identity, not by value.
        let make = |hits: Arc<AtomicUsize>| -> ListenerFn {
            Box::new(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
                false
            })
        };
        let first = dispatcher.register(PacketType::Command, false, make(Arc::clone(&hits)));
        let _second = dispatcher.register(PacketType::Command, false, make(Arc::clone(&hits)));

        dispatcher.unregister(PacketType::Command, first).unwrap();
        dispatcher.sender().send(command_packet(1)).await.unwrap();
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
