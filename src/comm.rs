//! Message-passing communicator abstraction (spec §1, §5, §6).
//!
//! The spec treats the inter-communicator as an external collaborator:
//! point-to-point send/recv, non-blocking probe, and collective
//! barrier/broadcast, plus the notion of a "local" group (ranks of one
//! role talking to each other) versus an inter-communicator (ranks of
//! one role talking to the other). We model both with the same trait —
//! `rank()`/`size()` describe the caller's own group, `remote_size()`
//! the group addressed by `send`/`recv`'s `dest`/`source` indices, which
//! for a local-group instance is the same group.
//!
//! Grounded on the teacher's `ws/system.rs` (an async `select!` loop
//! driving a socket) and `session.rs` (shared mutable state behind
//! `tokio::sync::Mutex`), generalized from one socket to an arbitrary
//! rank-addressed mailbox array — the production system would back this
//! trait with real MPI; tests and the co-located demo (§5, SUPPLEMENTED
//! FEATURES item 5) back it with in-process channels instead.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::error::{LowFiveError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    Producer,
    Consumer,
    /// Used for intra-group broadcast/ready signaling; never crosses the
    /// producer/consumer boundary.
    Local,
}

#[async_trait]
pub trait Communicator: Send + Sync {
    fn rank(&self) -> usize;
    /// Size of the caller's own group.
    fn size(&self) -> usize;
    /// Size of the group addressed by `send`'s `dest` / `recv`'s `source`.
    fn remote_size(&self) -> usize;

    async fn send(&self, dest: usize, tag: Tag, payload: Vec<u8>) -> Result<()>;
    async fn recv(&self, source: usize, tag: Tag) -> Result<Vec<u8>>;
    /// Non-blocking: `Some(source)` if a message tagged `tag` is already
    /// queued, without consuming it.
    async fn probe_any(&self, tag: Tag) -> Option<usize>;
    /// Blocking receive from whichever source sent first (used after
    /// `probe_any` indicated readiness, or to wait for the next arrival).
    async fn recv_any(&self, tag: Tag) -> Result<(usize, Vec<u8>)>;
    async fn barrier(&self);
    /// `root` passes `Some(payload)`; every other rank passes `None`. All
    /// ranks return the broadcast bytes.
    async fn broadcast(&self, root: usize, payload: Option<Vec<u8>>) -> Vec<u8>;
}

struct Envelope {
    from: usize,
    tag: Tag,
    payload: Vec<u8>,
}

struct Mailbox {
    queue: Mutex<VecDeque<Envelope>>,
    notify: Notify,
}

impl Mailbox {
    fn new() -> Self {
        Mailbox { queue: Mutex::new(VecDeque::new()), notify: Notify::new() }
    }

    fn push(&self, env: Envelope) {
        self.queue.lock().unwrap().push_back(env);
        self.notify.notify_waiters();
    }
}

/// One rank's endpoint into a mailbox-array communicator. `own` is the
/// array this rank reads from (indexed by `rank`); `remote` is the array
/// `send` writes into (indexed by the peer group's rank).
pub struct ChannelComm {
    rank: usize,
    own: Arc<Vec<Arc<Mailbox>>>,
    remote: Arc<Vec<Arc<Mailbox>>>,
    barrier: Arc<tokio::sync::Barrier>,
}

impl ChannelComm {
    /// Build a fully-connected group of `size` ranks that can message
    /// each other and share one barrier/broadcast (spec §4.F "intra-
    /// communicator barrier").
    pub fn local_group(size: usize) -> Vec<Arc<ChannelComm>> {
        let mailboxes: Arc<Vec<Arc<Mailbox>>> =
            Arc::new((0..size).map(|_| Arc::new(Mailbox::new())).collect());
        let barrier = Arc::new(tokio::sync::Barrier::new(size.max(1)));
        (0..size)
            .map(|rank| {
                Arc::new(ChannelComm {
                    rank,
                    own: mailboxes.clone(),
                    remote: mailboxes.clone(),
                    barrier: barrier.clone(),
                })
            })
            .collect()
    }

    /// Build the two disjoint groups of a producer/consumer
    /// inter-communicator (spec §1, §4.F/G): producer ranks address
    /// consumer ranks by index and vice versa.
    pub fn intercomm(
        producer_size: usize,
        consumer_size: usize,
    ) -> (Vec<Arc<ChannelComm>>, Vec<Arc<ChannelComm>>) {
        let producer_boxes: Arc<Vec<Arc<Mailbox>>> =
            Arc::new((0..producer_size).map(|_| Arc::new(Mailbox::new())).collect());
        let consumer_boxes: Arc<Vec<Arc<Mailbox>>> =
            Arc::new((0..consumer_size).map(|_| Arc::new(Mailbox::new())).collect());
        let producer_barrier = Arc::new(tokio::sync::Barrier::new(producer_size.max(1)));
        let consumer_barrier = Arc::new(tokio::sync::Barrier::new(consumer_size.max(1)));

        let producers = (0..producer_size)
            .map(|rank| {
                Arc::new(ChannelComm {
                    rank,
                    own: producer_boxes.clone(),
                    remote: consumer_boxes.clone(),
                    barrier: producer_barrier.clone(),
                })
            })
            .collect();
        let consumers = (0..consumer_size)
            .map(|rank| {
                Arc::new(ChannelComm {
                    rank,
                    own: consumer_boxes.clone(),
                    remote: producer_boxes.clone(),
                    barrier: consumer_barrier.clone(),
                })
            })
            .collect();
        (producers, consumers)
    }
}

#[async_trait]
impl Communicator for ChannelComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.own.len()
    }

    fn remote_size(&self) -> usize {
        self.remote.len()
    }

    async fn send(&self, dest: usize, tag: Tag, payload: Vec<u8>) -> Result<()> {
        let mailbox = self.remote.get(dest).ok_or_else(|| {
            LowFiveError::protocol(format!("send: no such destination rank {dest}"))
        })?;
        mailbox.push(Envelope { from: self.rank, tag, payload });
        Ok(())
    }

    async fn recv(&self, source: usize, tag: Tag) -> Result<Vec<u8>> {
        let mailbox = &self.own[self.rank];
        loop {
            let notified = mailbox.notify.notified();
            {
                let mut q = mailbox.queue.lock().unwrap();
                if let Some(pos) = q.iter().position(|e| e.from == source && e.tag == tag) {
                    return Ok(q.remove(pos).unwrap().payload);
                }
            }
            notified.await;
        }
    }

    async fn probe_any(&self, tag: Tag) -> Option<usize> {
        let mailbox = &self.own[self.rank];
        let q = mailbox.queue.lock().unwrap();
        q.iter().find(|e| e.tag == tag).map(|e| e.from)
    }

    async fn recv_any(&self, tag: Tag) -> Result<(usize, Vec<u8>)> {
        let mailbox = &self.own[self.rank];
        loop {
            let notified = mailbox.notify.notified();
            {
                let mut q = mailbox.queue.lock().unwrap();
                if let Some(pos) = q.iter().position(|e| e.tag == tag) {
                    let env = q.remove(pos).unwrap();
                    return Ok((env.from, env.payload));
                }
            }
            notified.await;
        }
    }

    async fn barrier(&self) {
        self.barrier.wait().await;
    }

    async fn broadcast(&self, root: usize, payload: Option<Vec<u8>>) -> Vec<u8> {
        let bytes = if self.rank == root {
            let bytes = payload.expect("broadcast root must supply a payload");
            for dest in 0..self.own.len() {
                if dest != self.rank {
                    let _ = self.send(dest, Tag::Local, bytes.clone()).await;
                }
            }
            bytes
        } else {
            self.recv(root, Tag::Local).await.expect("broadcast recv from root")
        };
        self.barrier().await;
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_group_send_recv() {
        let group = ChannelComm::local_group(3);
        group[0].send(2, Tag::Local, b"hi".to_vec()).await.unwrap();
        let got = group[2].recv(0, Tag::Local).await.unwrap();
        assert_eq!(got, b"hi");
    }

    #[tokio::test]
    async fn local_group_barrier_releases_all() {
        let group = ChannelComm::local_group(3);
        let handles: Vec<_> = group
            .into_iter()
            .map(|c| tokio::spawn(async move { c.barrier().await }))
            .collect();
        for h in handles {
            h.await.unwrap();
        }
    }

    #[tokio::test]
    async fn broadcast_delivers_to_non_root() {
        let group = ChannelComm::local_group(2);
        let root = group[0].clone();
        let other = group[1].clone();
        let (a, b) = tokio::join!(
            root.broadcast(0, Some(b"payload".to_vec())),
            other.broadcast(0, None),
        );
        assert_eq!(a, b"payload");
        assert_eq!(b, b"payload");
    }

    #[tokio::test]
    async fn intercomm_routes_between_groups() {
        let (producers, consumers) = ChannelComm::intercomm(2, 3);
        producers[1].send(2, Tag::Consumer, b"ping".to_vec()).await.unwrap();
        let got = consumers[2].recv(1, Tag::Consumer).await.unwrap();
        assert_eq!(got, b"ping");
        assert_eq!(producers[0].remote_size(), 3);
        assert_eq!(consumers[0].remote_size(), 2);
    }

    #[tokio::test]
    async fn probe_any_then_recv_any() {
        let group = ChannelComm::local_group(2);
        group[1].send(0, Tag::Local, b"x".to_vec()).await.unwrap();
        let src = group[0].probe_any(Tag::Local).await;
        assert_eq!(src, Some(1));
        let (from, payload) = group[0].recv_any(Tag::Local).await.unwrap();
        assert_eq!(from, 1);
        assert_eq!(payload, b"x");
    }
}
