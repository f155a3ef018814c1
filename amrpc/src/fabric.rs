//! The transport seam: active-message sends, one-sided memory access, and
//! the in-process mesh used to run a multi-rank job inside one process.
//!
//! [`Fabric`] is what a conduit must provide; everything above it is
//! transport-agnostic. [`MeshFabric`] joins N ranks with mpsc channels and
//! backs one-sided operations with process-local segments, completing
//! handles after a configurable number of polls so the completion queue
//! sees realistic not-ready-yet answers.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::handle_queue::NetHandle;

/// One participating process in the job.
pub type Rank = u32;

/// Callback run when a send or put handle completes.
pub type SendDone = Box<dyn FnOnce()>;

/// Callback run with the fetched bytes when a get handle completes.
pub type GetDone = Box<dyn FnOnce(Vec<u8>)>;

/// A rank's exposed one-sided memory region.
///
/// Remote ranks address it by offset. Like real RMA, concurrent one-sided
/// access is not serialized here; callers order conflicting accesses
/// through the messaging protocol.
pub struct Segment {
    buf: UnsafeCell<Box<[u8]>>,
    len: usize,
}

// One-sided semantics: the fabric copies raw bytes in and out without
// locking, exactly as a NIC would DMA into a registered region.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    pub fn new(len: usize) -> Arc<Self> {
        Arc::new(Self {
            buf: UnsafeCell::new(vec![0u8; len].into_boxed_slice()),
            len,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        if offset.checked_add(len).map_or(true, |end| end > self.len) {
            return Err(Error::SegmentOutOfBounds {
                offset,
                len,
                segment: self.len,
            });
        }
        Ok(())
    }

    /// Copy `bytes` into the segment at `offset`.
    pub fn write(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        self.check(offset, bytes.len())?;
        unsafe {
            ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                (*self.buf.get()).as_mut_ptr().add(offset),
                bytes.len(),
            );
        }
        Ok(())
    }

    /// Copy `len` bytes out of the segment at `offset`.
    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        self.check(offset, len)?;
        let mut out = vec![0u8; len];
        unsafe {
            ptr::copy_nonoverlapping((*self.buf.get()).as_ptr().add(offset), out.as_mut_ptr(), len);
        }
        Ok(out)
    }
}

/// What a conduit provides to the runtime.
///
/// One `Fabric` value is one rank's endpoint. All methods take `&self`;
/// the endpoint is shared across the rank's personas behind an `Arc`.
pub trait Fabric: Send + Sync {
    /// This endpoint's rank.
    fn rank(&self) -> Rank;

    /// Number of ranks in the job.
    fn num_ranks(&self) -> usize;

    /// Whether `peer` shares a memory domain with this rank, selecting
    /// the local eager cutover.
    fn is_local(&self, peer: Rank) -> bool;

    /// Largest payload one active message can carry.
    fn max_am_payload(&self) -> usize;

    /// This rank's one-sided segment.
    fn segment(&self) -> Arc<Segment>;

    /// Post an active-message frame. The handle completes when the frame
    /// buffer has been handed off.
    fn send_am(&self, dest: Rank, frame: Vec<u8>, on_done: SendDone) -> Result<Box<dyn NetHandle>>;

    /// Post a one-sided write into `dest`'s segment. Completion means the
    /// bytes are visible there; the destination takes no part.
    fn rma_put(
        &self,
        dest: Rank,
        dst_offset: usize,
        bytes: Vec<u8>,
        on_done: SendDone,
    ) -> Result<Box<dyn NetHandle>>;

    /// Post a one-sided read from `src`'s segment. The handle's callback
    /// receives the fetched bytes.
    fn rma_get(
        &self,
        src: Rank,
        src_offset: usize,
        len: usize,
        on_done: GetDone,
    ) -> Result<Box<dyn NetHandle>>;

    /// Drain up to `max` delivered frames, with their source ranks.
    /// Returns empty when another thread is already draining.
    fn poll(&self, max: usize) -> Vec<(Rank, Vec<u8>)>;
}

/// Mesh construction knobs.
#[derive(Debug, Clone)]
pub struct MeshOptions {
    /// Bytes of one-sided memory per rank.
    /// Default: 1 MiB
    pub segment_size: usize,
    /// Polls a handle reports not-ready before completing.
    /// Default: 2
    pub completion_delay: usize,
    /// Largest payload one frame can carry.
    /// Default: 4096
    pub max_am_payload: usize,
}

impl Default for MeshOptions {
    fn default() -> Self {
        Self {
            segment_size: 1 << 20,
            completion_delay: 2,
            max_am_payload: 4096,
        }
    }
}

impl MeshOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_segment_size(mut self, segment_size: usize) -> Self {
        self.segment_size = segment_size;
        self
    }

    pub fn with_completion_delay(mut self, completion_delay: usize) -> Self {
        self.completion_delay = completion_delay;
        self
    }

    pub fn with_max_am_payload(mut self, max_am_payload: usize) -> Self {
        self.max_am_payload = max_am_payload;
        self
    }
}

struct MeshMsg {
    from: Rank,
    frame: Vec<u8>,
}

/// An in-process N-rank fabric over mpsc channels.
pub struct MeshFabric {
    rank: Rank,
    peers: Vec<Sender<MeshMsg>>,
    inbox: Mutex<Receiver<MeshMsg>>,
    segments: Vec<Arc<Segment>>,
    delay: usize,
    max_am_payload: usize,
}

impl MeshFabric {
    /// Build a fully connected mesh of `n` ranks. Endpoint `i` of the
    /// returned vector belongs to rank `i`.
    pub fn create_mesh(n: usize, opts: MeshOptions) -> Vec<MeshFabric> {
        assert!(n > 0, "a mesh needs at least one rank");
        let mut senders = Vec::with_capacity(n);
        let mut receivers = Vec::with_capacity(n);
        for _ in 0..n {
            let (tx, rx) = mpsc::channel();
            senders.push(tx);
            receivers.push(rx);
        }
        let segments: Vec<_> = (0..n).map(|_| Segment::new(opts.segment_size)).collect();
        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, rx)| MeshFabric {
                rank: rank as Rank,
                peers: senders.clone(),
                inbox: Mutex::new(rx),
                segments: segments.clone(),
                delay: opts.completion_delay,
                max_am_payload: opts.max_am_payload,
            })
            .collect()
    }

    fn peer(&self, rank: Rank) -> Result<&Sender<MeshMsg>> {
        self.peers
            .get(rank as usize)
            .ok_or(Error::InvalidRank(rank))
    }

    fn segment_of(&self, rank: Rank) -> Result<&Arc<Segment>> {
        self.segments
            .get(rank as usize)
            .ok_or(Error::InvalidRank(rank))
    }
}

impl Fabric for MeshFabric {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn num_ranks(&self) -> usize {
        self.peers.len()
    }

    fn is_local(&self, peer: Rank) -> bool {
        // Each mesh rank models its own node, so only loopback is local.
        peer == self.rank
    }

    fn max_am_payload(&self) -> usize {
        self.max_am_payload
    }

    fn segment(&self) -> Arc<Segment> {
        Arc::clone(&self.segments[self.rank as usize])
    }

    fn send_am(&self, dest: Rank, frame: Vec<u8>, on_done: SendDone) -> Result<Box<dyn NetHandle>> {
        let sender = self.peer(dest)?;
        sender
            .send(MeshMsg {
                from: self.rank,
                frame,
            })
            .map_err(|_| Error::ShutDown)?;
        Ok(Box::new(MeshHandle {
            remaining: self.delay,
            op: HandleOp::Send {
                on_done: Some(on_done),
            },
        }))
    }

    fn rma_put(
        &self,
        dest: Rank,
        dst_offset: usize,
        bytes: Vec<u8>,
        on_done: SendDone,
    ) -> Result<Box<dyn NetHandle>> {
        let segment = self.segment_of(dest)?;
        segment.check(dst_offset, bytes.len())?;
        Ok(Box::new(MeshHandle {
            remaining: self.delay,
            op: HandleOp::Put {
                segment: Arc::clone(segment),
                offset: dst_offset,
                bytes,
                on_done: Some(on_done),
            },
        }))
    }

    fn rma_get(
        &self,
        src: Rank,
        src_offset: usize,
        len: usize,
        on_done: GetDone,
    ) -> Result<Box<dyn NetHandle>> {
        let segment = self.segment_of(src)?;
        segment.check(src_offset, len)?;
        Ok(Box::new(MeshHandle {
            remaining: self.delay,
            op: HandleOp::Get {
                segment: Arc::clone(segment),
                offset: src_offset,
                len,
                on_done: Some(on_done),
            },
        }))
    }

    fn poll(&self, max: usize) -> Vec<(Rank, Vec<u8>)> {
        let Ok(inbox) = self.inbox.try_lock() else {
            return Vec::new();
        };
        let mut out = Vec::new();
        while out.len() < max {
            match inbox.try_recv() {
                Ok(msg) => out.push((msg.from, msg.frame)),
                Err(_) => break,
            }
        }
        out
    }
}

enum HandleOp {
    Send {
        on_done: Option<SendDone>,
    },
    Put {
        segment: Arc<Segment>,
        offset: usize,
        bytes: Vec<u8>,
        on_done: Option<SendDone>,
    },
    Get {
        segment: Arc<Segment>,
        offset: usize,
        len: usize,
        on_done: Option<GetDone>,
    },
}

/// A posted mesh operation. Reports not-ready for `remaining` polls, then
/// performs its effect in `complete`.
struct MeshHandle {
    remaining: usize,
    op: HandleOp,
}

impl NetHandle for MeshHandle {
    fn is_ready(&mut self) -> bool {
        if self.remaining == 0 {
            true
        } else {
            self.remaining -= 1;
            false
        }
    }

    fn complete(mut self: Box<Self>) {
        match &mut self.op {
            HandleOp::Send { on_done } => {
                if let Some(f) = on_done.take() {
                    f();
                }
            }
            HandleOp::Put {
                segment,
                offset,
                bytes,
                on_done,
            } => {
                // Bounds were checked at post time.
                if let Err(e) = segment.write(*offset, bytes) {
                    unreachable!("put bounds changed after post: {}", e);
                }
                if let Some(f) = on_done.take() {
                    f();
                }
            }
            HandleOp::Get {
                segment,
                offset,
                len,
                on_done,
            } => {
                let bytes = match segment.read(*offset, *len) {
                    Ok(bytes) => bytes,
                    Err(e) => unreachable!("get bounds changed after post: {}", e),
                };
                if let Some(f) = on_done.take() {
                    f(bytes);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive(handle: &mut Box<dyn NetHandle>) -> usize {
        let mut polls = 0;
        while !handle.is_ready() {
            polls += 1;
        }
        polls
    }

    #[test]
    fn mesh_delivers_frames_with_source_rank() {
        let mesh = MeshFabric::create_mesh(3, MeshOptions::default());
        let h = mesh[0]
            .send_am(2, vec![1, 2, 3], Box::new(|| {}))
            .unwrap();
        drop(h);
        let got = mesh[2].poll(16);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, 0);
        assert_eq!(got[0].1, vec![1, 2, 3]);
        assert!(mesh[1].poll(16).is_empty());
    }

    #[test]
    fn poll_respects_budget() {
        let mesh = MeshFabric::create_mesh(2, MeshOptions::default());
        for i in 0..5u8 {
            mesh[0].send_am(1, vec![i], Box::new(|| {})).unwrap();
        }
        assert_eq!(mesh[1].poll(3).len(), 3);
        assert_eq!(mesh[1].poll(16).len(), 2);
    }

    #[test]
    fn handles_complete_after_the_configured_delay() {
        let mesh = MeshFabric::create_mesh(2, MeshOptions::default().with_completion_delay(3));
        let mut h = mesh[0].send_am(1, vec![0], Box::new(|| {})).unwrap();
        assert_eq!(drive(&mut h), 3);
        h.complete();
    }

    #[test]
    fn put_lands_only_at_completion() {
        let mesh = MeshFabric::create_mesh(2, MeshOptions::default().with_segment_size(64));
        let mut h = mesh[0]
            .rma_put(1, 8, vec![7, 8, 9], Box::new(|| {}))
            .unwrap();
        let target = mesh[1].segment();
        assert_eq!(target.read(8, 3).unwrap(), vec![0, 0, 0]);
        drive(&mut h);
        h.complete();
        assert_eq!(target.read(8, 3).unwrap(), vec![7, 8, 9]);
    }

    #[test]
    fn get_fetches_remote_bytes() {
        let mesh = MeshFabric::create_mesh(2, MeshOptions::default().with_segment_size(64));
        mesh[1].segment().write(4, &[5, 6]).unwrap();
        let fetched = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let sink = std::rc::Rc::clone(&fetched);
        let mut h = mesh[0]
            .rma_get(1, 4, 2, Box::new(move |bytes| *sink.borrow_mut() = bytes))
            .unwrap();
        drive(&mut h);
        h.complete();
        assert_eq!(*fetched.borrow(), vec![5, 6]);
    }

    #[test]
    fn out_of_bounds_rejected_at_post() {
        let mesh = MeshFabric::create_mesh(2, MeshOptions::default().with_segment_size(16));
        // Handles are opaque, so drop the Ok side before unwrapping.
        let err = mesh[0]
            .rma_put(1, 12, vec![0; 8], Box::new(|| {}))
            .map(|_| ())
            .unwrap_err();
        assert!(matches!(err, Error::SegmentOutOfBounds { .. }));
        let err = mesh[0]
            .rma_get(1, 20, 1, Box::new(|_| {}))
            .map(|_| ())
            .unwrap_err();
        assert!(matches!(err, Error::SegmentOutOfBounds { .. }));
    }

    #[test]
    fn invalid_rank_rejected() {
        let mesh = MeshFabric::create_mesh(2, MeshOptions::default());
        let err = mesh[0]
            .send_am(5, vec![0], Box::new(|| {}))
            .map(|_| ())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRank(5)));
    }

    #[test]
    fn only_loopback_is_local() {
        let mesh = MeshFabric::create_mesh(2, MeshOptions::default());
        assert!(mesh[0].is_local(0));
        assert!(!mesh[0].is_local(1));
    }
}
