//! # Frame Buffer Pool Module
//!
//! Tracks the set of mapped capture buffers and which side currently owns each of them. A
//! buffer is owned either by the application, by the kernel waiting to be filled, or by the
//! kernel having been filled and handed back. Ownership strictly alternates, a buffer's bytes
//! are only readable while it is [`BufferState::FilledByKernel`].

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use std::io;

use log::{debug, warn};

use crate::error::{Error, Result};

// -----------------------------------------------------------------------------------------------
// CONSTANTS
// -----------------------------------------------------------------------------------------------

/// Smallest usable pool, one buffer is always in flight while another is being read.
pub const MIN_BUFFERS: usize = 2;

// -----------------------------------------------------------------------------------------------
// TRAITS
// -----------------------------------------------------------------------------------------------

/// A region of memory shared with the capture driver.
pub trait MappedRegion {
    fn as_slice(&self) -> &[u8];

    /// Release the mapping, called at most once.
    fn unmap(&mut self) -> io::Result<()>;
}

// -----------------------------------------------------------------------------------------------
// ENUMERATIONS
// -----------------------------------------------------------------------------------------------

/// Who owns a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Held by the application, not queued
    FreeInApp,

    /// Queued to the kernel, waiting to be filled
    QueuedToKernel,

    /// Filled by the kernel and dequeued, contents readable
    FilledByKernel,
}

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

/// Number of buffers in each ownership state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StateCounts {
    pub free: usize,
    pub queued: usize,
    pub filled: usize,
}

/// Heap backed region, used by synthetic capture sources.
#[derive(Debug, Clone)]
pub struct HeapRegion {
    data: Vec<u8>,
}

struct Slot<R> {
    region: R,
    state: BufferState,
}

/// The full set of mapped capture buffers.
pub struct FrameBufferPool<R: MappedRegion> {
    slots: Vec<Slot<R>>,
    released: bool,
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl StateCounts {
    pub fn total(&self) -> usize {
        self.free + self.queued + self.filled
    }
}

impl HeapRegion {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl MappedRegion for HeapRegion {
    fn as_slice(&self) -> &[u8] {
        &self.data
    }

    fn unmap(&mut self) -> io::Result<()> {
        self.data = Vec::new();
        Ok(())
    }
}

impl<R: MappedRegion> FrameBufferPool<R> {
    /// Map `count` buffers using `map`.
    ///
    /// Either every buffer is mapped or none is: if any mapping fails the regions already
    /// mapped are unmapped before the error is returned. All buffers start
    /// [`BufferState::FreeInApp`].
    pub fn allocate<F>(count: usize, mut map: F) -> Result<Self>
    where
        F: FnMut(usize) -> io::Result<R>,
    {
        if count < MIN_BUFFERS {
            return Err(Error::AllocationError(format!(
                "{} buffers available, at least {} required",
                count, MIN_BUFFERS
            )));
        }

        let mut slots: Vec<Slot<R>> = Vec::with_capacity(count);

        for index in 0..count {
            match map(index) {
                Ok(region) => slots.push(Slot {
                    region,
                    state: BufferState::FreeInApp,
                }),
                Err(e) => {
                    for slot in slots.iter_mut() {
                        if let Err(ue) = slot.region.unmap() {
                            warn!("Failed to unmap buffer during allocation rollback: {}", ue);
                        }
                    }
                    return Err(Error::AllocationError(format!(
                        "mapping buffer {} failed: {}",
                        index, e
                    )));
                }
            }
        }

        debug!("Allocated a pool of {} buffers", count);

        Ok(Self {
            slots,
            released: false,
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    pub fn state(&self, index: usize) -> Option<BufferState> {
        self.slots.get(index).map(|s| s.state)
    }

    /// Count buffers by state, the counts always sum to [`FrameBufferPool::len`].
    pub fn counts(&self) -> StateCounts {
        self.slots
            .iter()
            .fold(StateCounts::default(), |mut c, slot| {
                match slot.state {
                    BufferState::FreeInApp => c.free += 1,
                    BufferState::QueuedToKernel => c.queued += 1,
                    BufferState::FilledByKernel => c.filled += 1,
                }
                c
            })
    }

    pub fn free_indices(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state == BufferState::FreeInApp)
            .map(|(i, _)| i)
            .collect()
    }

    /// FreeInApp -> QueuedToKernel
    pub fn mark_queued(&mut self, index: usize) -> Result<()> {
        self.transition(index, BufferState::FreeInApp, BufferState::QueuedToKernel)
    }

    /// QueuedToKernel -> FilledByKernel
    pub fn mark_filled(&mut self, index: usize) -> Result<()> {
        self.transition(index, BufferState::QueuedToKernel, BufferState::FilledByKernel)
    }

    /// FilledByKernel -> FreeInApp
    pub fn mark_consumed(&mut self, index: usize) -> Result<()> {
        self.transition(index, BufferState::FilledByKernel, BufferState::FreeInApp)
    }

    /// Return every buffer to the application, used once streaming is off.
    pub fn reclaim_all(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.state = BufferState::FreeInApp;
        }
    }

    /// Contents of a filled buffer.
    pub fn data(&self, index: usize) -> Result<&[u8]> {
        self.expect_state(index, BufferState::FilledByKernel)?;

        Ok(self.slots[index].region.as_slice())
    }

    /// Unmap every buffer. Calling this again is a no-op.
    pub fn release(&mut self) {
        if self.released {
            return;
        }

        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Err(e) = slot.region.unmap() {
                warn!("Failed to unmap buffer {}: {}", index, e);
            }
        }
        self.released = true;

        debug!("Released pool of {} buffers", self.slots.len());
    }

    fn expect_state(&self, index: usize, expected: BufferState) -> Result<()> {
        if self.released {
            return Err(Error::AllocationError(String::from("pool has been released")));
        }

        let actual = self
            .state(index)
            .ok_or_else(|| Error::AllocationError(format!("no buffer with index {}", index)))?;

        if actual != expected {
            return Err(Error::BufferStateError {
                index,
                expected,
                actual,
            });
        }

        Ok(())
    }

    fn transition(&mut self, index: usize, from: BufferState, to: BufferState) -> Result<()> {
        self.expect_state(index, from)?;
        self.slots[index].state = to;

        Ok(())
    }
}

impl<R: MappedRegion> Drop for FrameBufferPool<R> {
    fn drop(&mut self) {
        self.release();
    }
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {

    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    struct CountedRegion {
        unmaps: Rc<Cell<usize>>,
    }

    impl MappedRegion for CountedRegion {
        fn as_slice(&self) -> &[u8] {
            &[]
        }

        fn unmap(&mut self) -> io::Result<()> {
            self.unmaps.set(self.unmaps.get() + 1);
            Ok(())
        }
    }

    fn heap_pool(count: usize) -> FrameBufferPool<HeapRegion> {
        FrameBufferPool::allocate(count, |i| Ok(HeapRegion::new(vec![i as u8; 8]))).unwrap()
    }

    #[test]
    fn test_allocate_rollback() {
        let unmaps = Rc::new(Cell::new(0));
        let u = unmaps.clone();

        let result = FrameBufferPool::allocate(4, move |i| {
            if i == 2 {
                Err(io::Error::from(io::ErrorKind::Other))
            } else {
                Ok(CountedRegion { unmaps: u.clone() })
            }
        });

        assert!(matches!(result, Err(Error::AllocationError(_))));
        assert_eq!(unmaps.get(), 2);
    }

    #[test]
    fn test_allocate_too_few() {
        assert!(FrameBufferPool::allocate(1, |_| Ok(HeapRegion::new(vec![]))).is_err());
    }

    #[test]
    fn test_release_idempotent() {
        let unmaps = Rc::new(Cell::new(0));
        let u = unmaps.clone();
        let mut pool =
            FrameBufferPool::allocate(3, move |_| Ok(CountedRegion { unmaps: u.clone() }))
                .unwrap();

        pool.release();
        pool.release();
        drop(pool);

        assert_eq!(unmaps.get(), 3);
    }

    #[test]
    fn test_state_cycle_keeps_counts() {
        let mut pool = heap_pool(4);
        let n = pool.len();
        assert_eq!(pool.counts(), StateCounts { free: 4, queued: 0, filled: 0 });

        for i in 0..n {
            pool.mark_queued(i).unwrap();
            assert_eq!(pool.counts().total(), n);
        }

        pool.mark_filled(1).unwrap();
        assert_eq!(pool.counts(), StateCounts { free: 0, queued: 3, filled: 1 });
        assert_eq!(pool.data(1).unwrap(), &[1u8; 8][..]);

        pool.mark_consumed(1).unwrap();
        assert_eq!(pool.counts().total(), n);
        pool.mark_queued(1).unwrap();
        assert_eq!(pool.counts(), StateCounts { free: 0, queued: 4, filled: 0 });
    }

    #[test]
    fn test_invalid_transitions() {
        let mut pool = heap_pool(2);

        assert!(matches!(
            pool.mark_filled(0),
            Err(Error::BufferStateError { index: 0, .. })
        ));
        assert!(pool.data(0).is_err());
        assert!(pool.mark_consumed(0).is_err());

        pool.mark_queued(0).unwrap();
        assert!(pool.mark_queued(0).is_err());
        assert!(pool.mark_queued(7).is_err());
    }

    #[test]
    fn test_reclaim_all() {
        let mut pool = heap_pool(3);
        pool.mark_queued(0).unwrap();
        pool.mark_queued(1).unwrap();
        pool.mark_filled(1).unwrap();

        pool.reclaim_all();
        assert_eq!(pool.free_indices(), vec![0, 1, 2]);
    }
}
