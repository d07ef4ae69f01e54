//! Test doubles for the memory core.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::backend::{EventCompleter, EventHandle, ExecutionBackend, Submission};
use crate::device::{DeviceId, DeviceInfo, DeviceKind, DeviceSet};
use crate::error::{HetmemError, Result};
use crate::memory::{DeviceBuffer, DeviceMemory, DevicePtr};
use crate::operation::OperationId;

/// Backend that records submissions and completes them on request.
#[derive(Default)]
pub struct ManualBackend {
    pending: Mutex<Vec<(OperationId, EventCompleter)>>,
    submissions: Mutex<Vec<(OperationId, &'static str, usize)>>,
}

impl ManualBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submission_count(&self) -> usize {
        self.submissions.lock().len()
    }

    pub fn predecessor_count(&self, op: OperationId) -> Option<usize> {
        self.submissions
            .lock()
            .iter()
            .find(|(id, _, _)| *id == op)
            .map(|(_, _, n)| *n)
    }

    pub fn labels(&self) -> Vec<&'static str> {
        self.submissions.lock().iter().map(|(_, l, _)| *l).collect()
    }

    pub fn complete_all(&self) {
        for (_, completer) in self.pending.lock().drain(..) {
            completer.complete();
        }
    }
}

#[async_trait]
impl ExecutionBackend for ManualBackend {
    fn name(&self) -> &str {
        "manual"
    }

    fn submit(&self, submission: Submission) -> Result<EventHandle> {
        let (event, completer) = EventHandle::pair();
        self.submissions.lock().push((
            submission.operation,
            submission.work.label(),
            submission.predecessors.len(),
        ));
        self.pending.lock().push((submission.operation, completer));
        Ok(event)
    }
}

/// Heap-backed allocator with a byte budget.
pub struct TestMemory {
    capacity: usize,
    used: Arc<AtomicUsize>,
}

impl TestMemory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            used: Arc::new(AtomicUsize::new(0)),
        }
    }
}

struct TestBuffer {
    data: Option<Box<[u8]>>,
    used: Arc<AtomicUsize>,
}

impl DeviceBuffer for TestBuffer {
    fn size(&self) -> usize {
        self.data.as_ref().map(|d| d.len()).unwrap_or(0)
    }

    fn device_ptr(&self) -> DevicePtr {
        self.data
            .as_ref()
            .map(|d| DevicePtr::new(d.as_ptr() as usize))
            .unwrap_or(DevicePtr::NULL)
    }

    fn into_raw(mut self: Box<Self>) -> DevicePtr {
        match self.data.take() {
            Some(data) => DevicePtr::from_raw(Box::leak(data).as_mut_ptr()),
            None => DevicePtr::NULL,
        }
    }
}

impl Drop for TestBuffer {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            self.used.fetch_sub(data.len(), Ordering::Relaxed);
        }
    }
}

impl DeviceMemory for TestMemory {
    fn allocate_aligned(&self, size: usize, _alignment: usize) -> Result<Box<dyn DeviceBuffer>> {
        let used = self.used.load(Ordering::Relaxed);
        if used + size > self.capacity {
            return Err(HetmemError::AllocationFailure {
                device: DeviceId::new(u32::MAX),
                size,
                reason: "test memory exhausted".to_string(),
            });
        }
        self.used.fetch_add(size, Ordering::Relaxed);
        Ok(Box::new(TestBuffer {
            data: Some(vec![0u8; size].into_boxed_slice()),
            used: Arc::clone(&self.used),
        }))
    }

    fn total_memory(&self) -> usize {
        self.capacity
    }

    fn free_memory(&self) -> usize {
        self.capacity - self.used.load(Ordering::Relaxed)
    }
}

/// Host plus `gpus` simulated GPUs, each with `capacity` bytes.
pub fn device_set(gpus: usize, capacity: usize) -> DeviceSet {
    let mut builder = DeviceSet::builder().device(
        DeviceInfo::new("host", DeviceKind::Host),
        Arc::new(TestMemory::new(capacity)),
    );
    for i in 0..gpus {
        builder = builder.device(
            DeviceInfo::new(format!("gpu{}", i), DeviceKind::Gpu),
            Arc::new(TestMemory::new(capacity)),
        );
    }
    match builder.build() {
        Ok(set) => set,
        Err(e) => panic!("test device set: {}", e),
    }
}
