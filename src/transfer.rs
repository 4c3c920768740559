//! Transfer batch pooling.
//!
//! A [`TransferBatchPool`] owns a fixed number of slots, each holding the
//! device objects of one upload batch. [`TransferBatchPool::acquire`] moves a
//! slot out of the pool into a [`TransferBatch`]; the batch is returned to
//! the pool by [`TransferBatchPool::wait`]. A batch that is dropped instead
//! of waited on permanently leaks its slot.
use ash::vk;
use parking_lot::RwLock;
use std::{
    fmt, mem,
    num::NonZeroU32,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
use thiserror::Error;

pub mod vulkan;

/// Deferred recording work appended to a [`TransferBatch`].
pub type TransferFragment<R> = Box<dyn FnOnce(&mut R) + Send>;

/// Errors of transfer batch operations.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    /// Every batch is in use.
    #[error("no transfer batch available")]
    NoBatchAvailable,
    /// The device was lost.
    #[error("device lost")]
    DeviceLost,
    /// The batch is already in flight and has to be waited on first.
    #[error("transfer batch already submitted")]
    AlreadySubmitted,
    /// The batch was acquired from a different pool.
    #[error("transfer batch belongs to another pool")]
    ForeignBatch,
    /// Vulkan error.
    #[error("vulkan error: {0}")]
    Vulkan(vk::Result),
}

impl From<vk::Result> for TransferError {
    fn from(err: vk::Result) -> Self {
        match err {
            vk::Result::ERROR_DEVICE_LOST => TransferError::DeviceLost,
            err => TransferError::Vulkan(err),
        }
    }
}

/// Errors of [`TransferBatchPool::wait`].
#[derive(Error)]
pub enum WaitError<B: TransferBackend> {
    /// The batch did not complete in time. It remains acquired and has to be
    /// waited on again.
    #[error("timed out waiting for transfer batch {0}")]
    Timeout(TransferBatch<B>),
    /// The batch was acquired from a different pool. It is handed back
    /// untouched and has to be waited on through its own pool.
    #[error("transfer batch {0} belongs to another pool")]
    Foreign(TransferBatch<B>),
    /// Waiting failed. The batch was returned to the pool regardless.
    #[error(transparent)]
    Transfer(#[from] TransferError),
}

impl<B: TransferBackend> fmt::Debug for WaitError<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitError::Timeout(batch) => f.debug_tuple("Timeout").field(batch).finish(),
            WaitError::Foreign(batch) => f.debug_tuple("Foreign").field(batch).finish(),
            WaitError::Transfer(err) => f.debug_tuple("Transfer").field(err).finish(),
        }
    }
}

/// Device side of a [`TransferBatchPool`].
pub trait TransferBackend {
    /// Device objects of one batch.
    type Slot: Send;
    /// Handed to every [`TransferFragment`] while a batch is recorded.
    type Recorder;

    /// Creates the objects of slot `index`.
    fn create_slot(&self, index: usize) -> Result<Self::Slot, TransferError>;

    /// Destroys a slot.
    ///
    /// # Safety
    /// The device must no longer use the slot.
    unsafe fn destroy_slot(&self, slot: Self::Slot);

    /// Records `fragments` in order and submits them. Reports device loss.
    fn submit(
        &self,
        slot: &mut Self::Slot,
        label: &str,
        fragments: Vec<TransferFragment<Self::Recorder>>,
    ) -> Result<(), TransferError>;

    /// Blocks up to `timeout` for the last submission of `slot`. Returns
    /// whether it completed.
    fn wait(&self, slot: &Self::Slot, timeout: Duration) -> Result<bool, TransferError>;

    /// Returns whether the last submission of `slot` completed, without
    /// blocking.
    fn poll(&self, slot: &Self::Slot) -> Result<bool, TransferError>;
}

/// Identifier of an acquired batch. Never zero; wraps around to 1.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BatchId(NonZeroU32);

impl BatchId {
    /// The raw identifier.
    #[inline]
    pub fn get(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct PoolId(u64);

impl PoolId {
    fn next() -> PoolId {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        PoolId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum BatchState {
    Recording,
    Submitted,
    Failed(TransferError),
}

/// An acquired transfer batch, exclusively owned by the caller.
pub struct TransferBatch<B: TransferBackend> {
    pool: PoolId,
    index: usize,
    id: BatchId,
    label: String,
    fragments: Vec<TransferFragment<B::Recorder>>,
    state: BatchState,
    slot: B::Slot,
}

impl<B: TransferBackend> TransferBatch<B> {
    /// Identifier assigned on acquisition.
    #[inline]
    pub fn id(&self) -> BatchId {
        self.id
    }

    /// Debug label given on acquisition.
    #[inline]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Returns true if no work is pending.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Returns true once the batch was submitted successfully.
    #[inline]
    pub fn is_submitted(&self) -> bool {
        self.state == BatchState::Submitted
    }

    /// Appends work, recorded in order on submission.
    #[inline]
    pub fn push(&mut self, fragment: impl FnOnce(&mut B::Recorder) + Send + 'static) {
        self.fragments.push(Box::new(fragment));
    }
}

impl<B: TransferBackend> fmt::Debug for TransferBatch<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferBatch")
            .field("id", &self.id)
            .field("pool", &self.pool.0)
            .field("label", &self.label)
            .field("slot", &self.index)
            .field("pending", &self.fragments.len())
            .field("state", &self.state)
            .finish()
    }
}

impl<B: TransferBackend> fmt::Display for TransferBatch<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.label.is_empty() {
            write!(f, "{}", self.id)
        } else {
            write!(f, "{} ({})", self.id, self.label)
        }
    }
}

struct PoolState<S> {
    slots: Vec<Option<S>>,
    free: Vec<usize>,
    last_id: u32,
}

impl<S> PoolState<S> {
    fn next_id(&mut self) -> BatchId {
        self.last_id = self.last_id.checked_add(1).unwrap_or(1);
        BatchId(NonZeroU32::new(self.last_id).unwrap_or(NonZeroU32::MIN))
    }
}

/// Fixed size pool of transfer batches.
pub struct TransferBatchPool<B: TransferBackend> {
    id: PoolId,
    backend: B,
    capacity: usize,
    state: RwLock<PoolState<B::Slot>>,
}

impl<B: TransferBackend> TransferBatchPool<B> {
    /// Creates `capacity` slots up front. Slots created before a failure are
    /// destroyed again.
    pub fn new(backend: B, capacity: usize) -> Result<Self, TransferError> {
        let mut slots = Vec::with_capacity(capacity);
        for index in 0..capacity {
            match backend.create_slot(index) {
                Ok(slot) => slots.push(Some(slot)),
                Err(err) => {
                    for slot in slots.into_iter().flatten() {
                        unsafe { backend.destroy_slot(slot) };
                    }

                    return Err(err);
                }
            }
        }

        log::debug!("created {capacity} transfer batches");
        Ok(TransferBatchPool {
            id: PoolId::next(),
            backend,
            capacity,
            state: RwLock::new(PoolState {
                slots,
                // popped from the back, so slot 0 goes first
                free: (0..capacity).rev().collect(),
                last_id: 0,
            }),
        })
    }

    /// The device side of the pool.
    #[inline]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Number of batches the pool was created with.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of batches ready to be acquired.
    #[inline]
    pub fn free_count(&self) -> usize {
        self.state.read().free.len()
    }

    /// Number of batches currently owned by callers.
    #[inline]
    pub fn outstanding(&self) -> usize {
        self.capacity - self.free_count()
    }

    /// Takes a free batch. Never blocks and never grows the pool.
    pub fn acquire(&self, label: impl Into<String>) -> Result<TransferBatch<B>, TransferError> {
        let mut state = self.state.write();
        let index = state.free.pop().ok_or(TransferError::NoBatchAvailable)?;
        let Some(slot) = state.slots[index].take() else {
            state.free.push(index);
            return Err(TransferError::NoBatchAvailable);
        };
        let id = state.next_id();
        drop(state);

        Ok(TransferBatch {
            pool: self.id,
            index,
            id,
            label: label.into(),
            fragments: Vec::new(),
            state: BatchState::Recording,
            slot,
        })
    }

    /// Records the pending work of `batch` and submits it to the transfer
    /// queue. On failure the batch stays acquired; waiting on it releases it
    /// and returns the failure.
    ///
    /// A batch is submitted at most once per acquisition. Submitting it again
    /// while in flight, or through another pool, is rejected without touching
    /// the batch.
    pub fn submit(&self, batch: &mut TransferBatch<B>) -> Result<(), TransferError> {
        if batch.pool != self.id {
            return Err(TransferError::ForeignBatch);
        }
        if batch.state == BatchState::Submitted {
            return Err(TransferError::AlreadySubmitted);
        }

        let fragments = mem::take(&mut batch.fragments);
        match self.backend.submit(&mut batch.slot, &batch.label, fragments) {
            Ok(()) => {
                batch.state = BatchState::Submitted;
                Ok(())
            }
            Err(err) => {
                log::warn!("submitting transfer batch {batch} failed: {err}");
                batch.state = BatchState::Failed(err);
                Err(err)
            }
        }
    }

    /// Waits up to `timeout` for `batch` to complete. A zero timeout polls
    /// once without blocking.
    ///
    /// Every outcome except [`WaitError::Timeout`] and [`WaitError::Foreign`]
    /// returns the batch to the pool. Waiting on a batch that was never
    /// submitted times out immediately.
    pub fn wait(&self, batch: TransferBatch<B>, timeout: Duration) -> Result<(), WaitError<B>> {
        if batch.pool != self.id {
            return Err(WaitError::Foreign(batch));
        }

        let result = match batch.state {
            BatchState::Recording => return Err(WaitError::Timeout(batch)),
            BatchState::Failed(err) => Err(err),
            BatchState::Submitted if timeout.is_zero() => self.backend.poll(&batch.slot),
            BatchState::Submitted => self.backend.wait(&batch.slot, timeout),
        };

        match result {
            Ok(false) => Err(WaitError::Timeout(batch)),
            Ok(true) => {
                self.release(batch);
                Ok(())
            }
            Err(err) => {
                self.release(batch);
                Err(WaitError::Transfer(err))
            }
        }
    }

    fn release(&self, batch: TransferBatch<B>) {
        let TransferBatch { id, index, slot, .. } = batch;
        let mut state = self.state.write();
        match state.slots.get_mut(index) {
            Some(entry) => {
                debug_assert!(entry.is_none(), "batch released twice");
                *entry = Some(slot);
                state.free.push(index);
            }
            // the pool was destroyed while the batch was out
            None => log::warn!("leaking transfer batch {id} of a destroyed pool"),
        }
    }

    /// Destroys every batch in the pool. Batches still held by callers are
    /// leaked.
    ///
    /// # Safety
    /// The device must no longer use any batch of this pool.
    pub unsafe fn destroy(&mut self) {
        let state = self.state.get_mut();
        let outstanding = self.capacity - state.free.len();
        if outstanding > 0 && !state.slots.is_empty() {
            log::warn!("destroying transfer pool with {outstanding} batches outstanding");
        }

        state.free.clear();
        for slot in state.slots.drain(..).flatten() {
            self.backend.destroy_slot(slot);
        }
    }
}

impl<B: TransferBackend> Drop for TransferBatchPool<B> {
    fn drop(&mut self) {
        unsafe { self.destroy() };
    }
}

impl<B: TransferBackend> fmt::Debug for TransferBatchPool<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferBatchPool")
            .field("capacity", &self.capacity)
            .field("free", &self.free_count())
            .finish_non_exhaustive()
    }
}
