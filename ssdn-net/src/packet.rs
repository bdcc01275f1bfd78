//! Packet arena for the overlay data plane
//!
//! Every buffer is allocated once when its pool is built and then circulates
//! between the pool's free list and the output queues of taps, tuns and peer
//! links. A [`PacketBuffer`] always knows which pool owns it and returns
//! itself there when dropped, so no consumer needs to know where a buffer
//! came from in order to release it.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;
use tokio::sync::{Notify, mpsc};

/// Largest payload a single overlay frame can carry (15-bit length field).
pub const MAX_PACKET_SIZE: usize = 0x7FFF;

/// Fixed Ethernet header offset; frames are assumed to carry no 802.1Q tag.
pub const ETHERNET_HEADER_SIZE: usize = 14;

/// Default depth of per-link pools and output queues.
pub const TAP_QUEUE_SIZE: usize = 1024;

/// Fixed pool of reusable packet buffers.
///
/// The free list is a lock-free queue; waiters blocked in [`acquire`] are
/// woken whenever a buffer comes back.
///
/// [`acquire`]: PacketPool::acquire
pub struct PacketPool {
    free: ArrayQueue<Box<[u8]>>,
    notify: Notify,
    capacity: usize,
    buffer_size: usize,
}

impl PacketPool {
    /// Allocate `count` buffers of `size` bytes and pre-load them into the
    /// free list.
    pub fn new(count: usize, size: usize) -> Arc<Self> {
        let free = ArrayQueue::new(count.max(1));
        for _ in 0..count {
            // push only fails when full, which cannot happen here
            let _ = free.push(vec![0u8; size].into_boxed_slice());
        }

        Arc::new(Self {
            free,
            notify: Notify::new(),
            capacity: count,
            buffer_size: size,
        })
    }

    /// Take a buffer without waiting.
    pub fn try_acquire(self: &Arc<Self>) -> Option<PacketBuffer> {
        self.free.pop().map(|data| PacketBuffer {
            pool: Arc::clone(self),
            data,
            len: 0,
        })
    }

    /// Take a buffer, waiting for one to be returned if the pool is empty.
    pub async fn acquire(self: &Arc<Self>) -> PacketBuffer {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(buffer) = self.try_acquire() {
                return buffer;
            }
            notified.await;
        }
    }

    /// Number of buffers currently sitting in the free list.
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Total number of buffers owned by this pool.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Size in bytes of every buffer in this pool.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn release(&self, data: Box<[u8]>) {
        if self.free.push(data).is_err() {
            tracing::error!("Packet pool overflow; buffer discarded");
            return;
        }
        self.notify.notify_one();
    }
}

impl fmt::Debug for PacketPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketPool")
            .field("available", &self.available())
            .field("capacity", &self.capacity)
            .field("buffer_size", &self.buffer_size)
            .finish()
    }
}

/// A borrowed packet buffer.
///
/// Exactly one task holds a given buffer at a time. Dropping it pushes the
/// storage back onto the free list of the pool it was taken from.
pub struct PacketBuffer {
    pool: Arc<PacketPool>,
    data: Box<[u8]>,
    len: usize,
}

impl PacketBuffer {
    /// Number of valid bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Set the number of valid bytes, clamped to the buffer capacity.
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.data.len());
    }

    /// Full size of the underlying storage.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// The whole storage, regardless of the current length.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// The pool this buffer returns to.
    pub fn pool(&self) -> &Arc<PacketPool> {
        &self.pool
    }
}

impl Deref for PacketBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

impl DerefMut for PacketBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        let len = self.len;
        &mut self.data[..len]
    }
}

impl Drop for PacketBuffer {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.data);
        self.pool.release(data);
    }
}

impl fmt::Debug for PacketBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketBuffer")
            .field("len", &self.len)
            .field("capacity", &self.data.len())
            .finish()
    }
}

/// Sending half of an output queue attached to a tap, tun or peer link.
#[derive(Clone, Debug)]
pub struct PacketQueue {
    tx: mpsc::Sender<PacketBuffer>,
}

/// Receiving half of an output queue, serviced by a single writer task.
#[derive(Debug)]
pub struct QueueReceiver {
    rx: mpsc::Receiver<PacketBuffer>,
}

/// Create a bounded output queue.
pub fn packet_queue(depth: usize) -> (PacketQueue, QueueReceiver) {
    let (tx, rx) = mpsc::channel(depth.max(1));
    (PacketQueue { tx }, QueueReceiver { rx })
}

impl PacketQueue {
    /// Enqueue a packet, waiting while the queue is full.
    ///
    /// Returns false if the consumer is gone; the packet has then already
    /// been returned to its pool.
    pub async fn send(&self, packet: PacketBuffer) -> bool {
        self.tx.send(packet).await.is_ok()
    }

    /// Enqueue a packet without waiting; a full or closed queue drops it.
    pub fn try_send(&self, packet: PacketBuffer) -> bool {
        self.tx.try_send(packet).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Whether both handles feed the same queue.
    pub fn same_queue(&self, other: &PacketQueue) -> bool {
        self.tx.same_channel(&other.tx)
    }
}

impl QueueReceiver {
    /// Next queued packet, or `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<PacketBuffer> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<PacketBuffer> {
        self.rx.try_recv().ok()
    }

    /// Number of packets waiting in the queue.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
