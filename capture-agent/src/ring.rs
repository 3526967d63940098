//! Lock-Free Frame Ring
//!
//! Fixed allocation at startup, power-of-two capacity, single producer /
//! single consumer. Head and tail advance with acquire/release ordering;
//! the producer never overwrites an unread slot, so a full ring drops the
//! incoming frame instead.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

pub struct FrameRing<T> {
    slots: Box<[Mutex<Option<T>>]>,
    mask: usize,

    /// Write position (producer thread).
    write_pos: AtomicUsize,

    /// Read position (consumer task).
    read_pos: AtomicUsize,

    /// Frames refused because the ring was full.
    dropped: AtomicU64,

    /// Wakes the consumer when data arrives.
    data_available: Notify,
}

impl<T> FrameRing<T> {
    /// Capacity must be a power of two so positions can wrap by masking.
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity.is_power_of_two() && capacity > 0,
            "ring capacity must be a power of two, got {capacity}"
        );
        let slots: Vec<Mutex<Option<T>>> = (0..capacity).map(|_| Mutex::new(None)).collect();
        Self {
            slots: slots.into_boxed_slice(),
            mask: capacity - 1,
            write_pos: AtomicUsize::new(0),
            read_pos: AtomicUsize::new(0),
            dropped: AtomicU64::new(0),
            data_available: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        let write = self.write_pos.load(Ordering::Acquire);
        let read = self.read_pos.load(Ordering::Acquire);
        write.wrapping_sub(read)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Non-blocking push. Returns false (and counts a drop) when full.
    pub fn try_push(&self, item: T) -> bool {
        if self.is_full() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let write = self.write_pos.load(Ordering::Acquire);
        {
            let mut slot = self.slots[write & self.mask].lock();
            *slot = Some(item);
        }
        self.write_pos.store(write.wrapping_add(1), Ordering::Release);
        self.data_available.notify_one();
        true
    }

    /// Non-blocking pop. Returns None when empty.
    pub fn try_pop(&self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let read = self.read_pos.load(Ordering::Acquire);
        let item = {
            let mut slot = self.slots[read & self.mask].lock();
            slot.take()?
        };
        self.read_pos.store(read.wrapping_add(1), Ordering::Release);
        Some(item)
    }

    /// Blocking pop (async). Waits for the producer.
    pub async fn pop(&self) -> T {
        loop {
            if let Some(item) = self.try_pop() {
                return item;
            }
            let notified = self.data_available.notified();
            // Re-check after registering, so a push between the first
            // check and here cannot be missed.
            if let Some(item) = self.try_pop() {
                return item;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_preserved() {
        let ring: FrameRing<u32> = FrameRing::new(8);
        for i in 0..5 {
            assert!(ring.try_push(i));
        }
        for i in 0..5 {
            assert_eq!(ring.try_pop(), Some(i));
        }
        assert_eq!(ring.try_pop(), None);
    }

    #[test]
    fn fifth_push_into_four_slot_ring_drops() {
        let ring: FrameRing<u32> = FrameRing::new(4);
        for i in 0..4 {
            assert!(ring.try_push(i));
        }
        assert!(!ring.try_push(4));
        assert_eq!(ring.dropped(), 1);

        // Consumer still sees the first four, in order.
        for i in 0..4 {
            assert_eq!(ring.try_pop(), Some(i));
        }
        assert!(ring.is_empty());
    }

    #[test]
    fn wraps_around_capacity() {
        let ring: FrameRing<u32> = FrameRing::new(4);
        for round in 0..10u32 {
            assert!(ring.try_push(round));
            assert_eq!(ring.try_pop(), Some(round));
        }
        assert_eq!(ring.dropped(), 0);
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn rejects_non_power_of_two() {
        let _ring: FrameRing<u32> = FrameRing::new(6);
    }

    #[tokio::test]
    async fn async_pop_wakes_on_push() {
        use std::sync::Arc;
        let ring: Arc<FrameRing<u32>> = Arc::new(FrameRing::new(4));

        let consumer = {
            let ring = ring.clone();
            tokio::spawn(async move { ring.pop().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(ring.try_push(99));
        assert_eq!(consumer.await.unwrap(), 99);
    }
}
