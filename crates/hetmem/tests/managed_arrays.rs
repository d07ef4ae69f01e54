//! Integration tests for allocation, validity and dependency tracking.

mod common;

use std::collections::BTreeMap;
use std::sync::{mpsc, Arc, Barrier};
use std::time::Duration;

use common::{GPU0, GPU1};
use hetmem::prelude::*;

const LEN: usize = 256;

fn ids(ops: &[Operation]) -> Vec<OperationId> {
    ops.iter().map(Operation::id).collect()
}

/// Allocations appear lazily, once per distinct device.
#[tokio::test]
async fn test_one_allocation_per_device() {
    let runtime = common::runtime(2);
    let array = runtime
        .create_array(
            ArrayDesc::new::<f32>([LEN]),
            BehaviorPolicy::async_buffer(),
            ArraySeed::Uninit,
        )
        .unwrap();
    assert!(runtime.allocations(&array).unwrap().is_empty());

    let requests = [
        (GPU0, AccessMode::Write),
        (GPU0, AccessMode::Read),
        (HOST_DEVICE, AccessMode::Read),
        (GPU0, AccessMode::ReadWrite),
        (GPU1, AccessMode::Read),
        (HOST_DEVICE, AccessMode::Write),
    ];
    let mut last = None;
    for (device, mode) in requests {
        let grant = runtime.request_access(&array, device, mode).unwrap();
        assert_eq!(
            runtime.extract_pointer(&array, device).unwrap(),
            Some(grant.pointer)
        );
        runtime.submit(&grant.operation, common::noop()).unwrap();
        last = Some(grant.operation);
    }
    runtime.wait(&last.unwrap()).await.unwrap();

    let allocations = runtime.allocations(&array).unwrap();
    assert_eq!(allocations.len(), 3);
    assert!(allocations
        .iter()
        .all(|a| a.ownership == Ownership::Owned && a.size == LEN * 4));
    assert_eq!(runtime.stats().allocations, 3);
}

/// After a write on D, reading on D needs nothing; reading elsewhere
/// migrates exactly once, from D.
#[tokio::test]
async fn test_write_then_read_migrates_once() {
    let runtime = common::runtime(2);
    let array = runtime
        .create_array(
            ArrayDesc::new::<f32>([LEN]),
            BehaviorPolicy::async_buffer(),
            ArraySeed::Uninit,
        )
        .unwrap();
    let values = common::ramp(LEN, 2.0);

    let write = runtime
        .request_access(&array, GPU0, AccessMode::Write)
        .unwrap();
    assert!(write.transfer.is_none());
    runtime
        .submit(&write.operation, common::fill(write.pointer, values.clone()))
        .unwrap();
    runtime.wait(&write.operation).await.unwrap();

    let local = runtime.request_access(&array, GPU0, AccessMode::Read).unwrap();
    assert!(local.transfer.is_none());
    assert_eq!(runtime.stats().migrations, 0);

    let remote = runtime.request_access(&array, GPU1, AccessMode::Read).unwrap();
    let migration = remote.transfer.clone().expect("migration queued");
    assert_eq!(migration.kind(), OperationKind::Migration);
    assert_eq!(migration.device(), GPU1);
    assert_eq!(ids(&remote.predecessors), vec![migration.id()]);
    assert_eq!(runtime.stats().migrations, 1);

    let (tx, rx) = mpsc::channel();
    runtime.submit(&local.operation, common::noop()).unwrap();
    runtime
        .submit(&remote.operation, common::capture(remote.pointer, LEN, tx))
        .unwrap();
    runtime.wait(&remote.operation).await.unwrap();
    assert_eq!(rx.recv().unwrap(), values);
    assert!(migration.is_complete());

    let expected = BTreeMap::from([(GPU0, true), (GPU1, true)]);
    assert_eq!(runtime.validity(&array).unwrap(), expected);

    // Both copies are current now; another read queues nothing.
    let again = runtime.request_access(&array, GPU1, AccessMode::Read).unwrap();
    assert!(again.transfer.is_none());
    runtime.discard(&again.operation).unwrap();
    assert_eq!(runtime.stats().migrations, 1);
}

/// Host seed data is uploaded to the first device that reads it.
#[tokio::test]
async fn test_seed_uploaded_on_first_read() {
    let runtime = common::runtime(1);
    let values = common::ramp(LEN, 0.5);
    let array = runtime
        .create_array(
            ArrayDesc::new::<f32>([LEN]),
            BehaviorPolicy::sync_buffer(),
            ArraySeed::from_slice(values.as_slice()),
        )
        .unwrap();

    let read = runtime.request_access(&array, GPU0, AccessMode::Read).unwrap();
    let upload = read.transfer.clone().expect("upload queued");
    assert_eq!(upload.kind(), OperationKind::Upload);

    let (tx, rx) = mpsc::channel();
    runtime
        .submit(&read.operation, common::capture(read.pointer, LEN, tx))
        .unwrap();
    runtime.wait(&read.operation).await.unwrap();
    assert_eq!(rx.recv().unwrap(), values);

    let stats = runtime.stats();
    assert_eq!(stats.uploads, 1);
    assert_eq!(stats.migrations, 0);
    runtime.release(array).await.unwrap();
}

/// A write followed by a read on the same device depends only on the write;
/// a read followed by a write depends on the read.
#[tokio::test]
async fn test_dependency_edges() {
    let runtime = common::runtime(1);
    let array = runtime
        .create_array(
            ArrayDesc::new::<f32>([LEN]),
            BehaviorPolicy::async_buffer(),
            ArraySeed::Uninit,
        )
        .unwrap();

    let write = runtime
        .request_access(&array, HOST_DEVICE, AccessMode::Write)
        .unwrap();
    let read = runtime
        .request_access(&array, HOST_DEVICE, AccessMode::Read)
        .unwrap();
    assert!(write.predecessors.is_empty());
    assert_eq!(ids(&read.predecessors), vec![write.operation.id()]);
    assert!(read.transfer.is_none());

    let overwrite = runtime
        .request_access(&array, HOST_DEVICE, AccessMode::Write)
        .unwrap();
    assert_eq!(
        ids(&overwrite.predecessors),
        vec![write.operation.id(), read.operation.id()]
    );

    // Submission must follow the recorded order.
    let err = runtime
        .submit(&overwrite.operation, common::noop())
        .unwrap_err();
    assert!(matches!(err, HetmemError::PredecessorNotSubmitted { .. }));

    runtime.submit(&write.operation, common::noop()).unwrap();
    runtime.submit(&read.operation, common::noop()).unwrap();
    runtime.submit(&overwrite.operation, common::noop()).unwrap();
    runtime.wait(&overwrite.operation).await.unwrap();
    assert!(write.operation.is_complete());
    assert!(read.operation.is_complete());
}

/// Two reads on the same device are never ordered against each other.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_reads_unordered() {
    let runtime = Arc::new(common::runtime(1));
    let array = runtime
        .create_array(
            ArrayDesc::new::<f32>([LEN]),
            BehaviorPolicy::async_buffer(),
            ArraySeed::Uninit,
        )
        .unwrap();

    let write = runtime
        .request_access(&array, GPU0, AccessMode::Write)
        .unwrap();
    let first = runtime.request_access(&array, GPU0, AccessMode::Read).unwrap();
    let second = runtime.request_access(&array, GPU0, AccessMode::Read).unwrap();
    assert_eq!(ids(&first.predecessors), vec![write.operation.id()]);
    assert_eq!(ids(&second.predecessors), vec![write.operation.id()]);
    runtime
        .submit(&write.operation, common::fill(write.pointer, common::ramp(LEN, 1.0)))
        .unwrap();

    // Each read blocks until the other one is running too.
    let barrier = Arc::new(Barrier::new(2));
    let tasks: Vec<_> = [first.operation.clone(), second.operation.clone()]
        .into_iter()
        .map(|op| {
            let runtime = Arc::clone(&runtime);
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                runtime.submit(
                    &op,
                    Work::kernel(move || {
                        barrier.wait();
                        Ok(())
                    }),
                )?;
                runtime.wait(&op).await
            })
        })
        .collect();

    for task in tasks {
        tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .expect("reads were serialized")
            .unwrap()
            .unwrap();
    }
}

/// An operation can access several arrays; each array orders it separately.
#[tokio::test]
async fn test_multi_array_operation() {
    let runtime = common::runtime(1);
    let input = runtime
        .create_array(
            ArrayDesc::new::<f32>([LEN]),
            BehaviorPolicy::async_buffer(),
            ArraySeed::from_slice(common::ramp(LEN, 1.0).as_slice()),
        )
        .unwrap();
    let output = runtime
        .create_array(
            ArrayDesc::new::<f32>([LEN]),
            BehaviorPolicy::async_buffer(),
            ArraySeed::Uninit,
        )
        .unwrap();

    let read = runtime.request_access(&input, GPU0, AccessMode::Read).unwrap();
    let write = runtime
        .request_access_in(&read.operation, &output, AccessMode::Write)
        .unwrap();
    assert_eq!(write.device, GPU0);
    assert_eq!(read.operation.accesses().len(), 2);

    let (src, dst) = (read.pointer, write.pointer);
    runtime
        .submit(
            &read.operation,
            Work::kernel(move || {
                // SAFETY: both arrays hold LEN floats on GPU0.
                unsafe {
                    let input = std::slice::from_raw_parts(src.as_ptr::<f32>(), LEN);
                    let output = std::slice::from_raw_parts_mut(dst.as_mut_ptr::<f32>(), LEN);
                    for (o, i) in output.iter_mut().zip(input) {
                        *o = i * 3.0;
                    }
                }
                Ok(())
            }),
        )
        .unwrap();

    let check = runtime
        .request_access(&output, HOST_DEVICE, AccessMode::Read)
        .unwrap();
    let (tx, rx) = mpsc::channel();
    runtime
        .submit(&check.operation, common::capture(check.pointer, LEN, tx))
        .unwrap();
    runtime.wait(&check.operation).await.unwrap();
    assert_eq!(rx.recv().unwrap(), common::ramp(LEN, 3.0));
}

/// A failed allocation on one device leaves every other device untouched.
#[tokio::test]
async fn test_allocation_failure_is_isolated() {
    common::init_tracing();
    let runtime = HostRuntime::builder()
        .gpus(2)
        .capacity(4096)
        .build()
        .unwrap();
    let small = runtime
        .create_array(
            ArrayDesc::bytes(1024),
            BehaviorPolicy::async_buffer(),
            ArraySeed::Uninit,
        )
        .unwrap();
    let big = runtime
        .create_array(
            ArrayDesc::bytes(8192),
            BehaviorPolicy::async_buffer(),
            ArraySeed::Uninit,
        )
        .unwrap();

    let write = runtime
        .request_access(&small, GPU0, AccessMode::Write)
        .unwrap();
    runtime.submit(&write.operation, common::noop()).unwrap();
    runtime.wait(&write.operation).await.unwrap();
    let before = runtime.validity(&small).unwrap();

    match runtime.request_access(&big, GPU1, AccessMode::Write) {
        Err(HetmemError::AllocationFailure { device, .. }) => assert_eq!(device, GPU1),
        other => panic!("expected allocation failure, got {:?}", other),
    }
    assert!(runtime.allocations(&big).unwrap().is_empty());
    assert_eq!(runtime.validity(&small).unwrap(), before);

    // GPU1 still serves arrays that fit.
    let read = runtime.request_access(&small, GPU1, AccessMode::Read).unwrap();
    assert!(read.transfer.is_some());
    runtime.submit(&read.operation, common::noop()).unwrap();
    runtime.wait(&read.operation).await.unwrap();
    assert_eq!(runtime.stats().allocations, 2);
}

/// Embedding, writing and extracting keeps the caller's address.
#[tokio::test]
async fn test_embed_write_extract_round_trip() {
    let runtime = common::runtime(1);
    let array = runtime
        .create_array(
            ArrayDesc::new::<f32>([LEN]),
            BehaviorPolicy::sync_buffer(),
            ArraySeed::Uninit,
        )
        .unwrap();
    let mut storage = vec![0f32; LEN];
    let ptr = DevicePtr::from_raw(storage.as_mut_ptr());

    // SAFETY: storage holds LEN floats and outlives the array.
    unsafe { runtime.embed_pointer(&array, GPU0, ptr, false) }.unwrap();
    let write = runtime
        .request_access(&array, GPU0, AccessMode::Write)
        .unwrap();
    assert_eq!(write.pointer, ptr);
    runtime
        .submit(&write.operation, common::fill(write.pointer, common::ramp(LEN, 4.0)))
        .unwrap();
    runtime.wait(&write.operation).await.unwrap();

    assert_eq!(runtime.extract_pointer(&array, GPU0).unwrap(), Some(ptr));
    let allocations = runtime.allocations(&array).unwrap();
    assert_eq!(allocations.len(), 1);
    assert_eq!(allocations[0].ownership, Ownership::External);
    assert_eq!(runtime.stats().allocations, 0);
    assert_eq!(storage, common::ramp(LEN, 4.0));

    // A second pointer on the same device conflicts and changes nothing.
    let mut other = vec![0f32; LEN];
    let err = unsafe {
        runtime.embed_pointer(&array, GPU0, DevicePtr::from_raw(other.as_mut_ptr()), true)
    }
    .unwrap_err();
    assert!(matches!(err, HetmemError::AllocationConflict { .. }));
    assert_eq!(runtime.allocations(&array).unwrap(), allocations);

    runtime.release(array).await.unwrap();
}

/// Disowning twice, or forcing the same update twice, changes nothing the
/// second time.
#[tokio::test]
async fn test_disown_and_force_update_are_idempotent() {
    let runtime = common::runtime(1);
    let array = runtime
        .create_array(
            ArrayDesc::new::<f32>([LEN]),
            BehaviorPolicy::sync_buffer(),
            ArraySeed::Uninit,
        )
        .unwrap();
    let write = runtime
        .request_access(&array, GPU0, AccessMode::Write)
        .unwrap();
    runtime
        .submit(&write.operation, common::fill(write.pointer, common::ramp(LEN, 1.0)))
        .unwrap();
    runtime.wait(&write.operation).await.unwrap();

    let update = runtime
        .force_update(&array, HOST_DEVICE, AccessMode::Read)
        .unwrap();
    runtime.wait(&update).await.unwrap();
    let validity = runtime.validity(&array).unwrap();
    let stats = runtime.stats();
    assert_eq!(validity.get(&HOST_DEVICE), Some(&true));
    assert_eq!(stats.migrations, 1);

    let update = runtime
        .force_update(&array, HOST_DEVICE, AccessMode::Read)
        .unwrap();
    runtime.wait(&update).await.unwrap();
    assert_eq!(runtime.validity(&array).unwrap(), validity);
    assert_eq!(runtime.stats().migrations, stats.migrations);

    runtime.disown(&array, GPU0).unwrap();
    let allocations = runtime.allocations(&array).unwrap();
    let usage = runtime.stats().current_bytes;
    runtime.disown(&array, GPU0).unwrap();
    assert_eq!(runtime.allocations(&array).unwrap(), allocations);
    assert_eq!(runtime.stats().current_bytes, usage);
    assert_eq!(runtime.stats().current_bytes, (LEN * 4) as u64);

    // The disowned block is the caller's now; read it before leaking it.
    let gpu_ptr = runtime.extract_pointer(&array, GPU0).unwrap().unwrap();
    assert_eq!(unsafe { common::read_f32(gpu_ptr, LEN) }, common::ramp(LEN, 1.0));
    runtime.release(array).await.unwrap();
}

/// Discarding an unsubmitted write restores the validity from before it.
#[tokio::test]
async fn test_discard_restores_validity() {
    let runtime = common::runtime(2);
    let array = runtime
        .create_array(
            ArrayDesc::new::<f32>([LEN]),
            BehaviorPolicy::async_buffer(),
            ArraySeed::Uninit,
        )
        .unwrap();
    let write = runtime
        .request_access(&array, GPU0, AccessMode::Write)
        .unwrap();
    runtime.submit(&write.operation, common::noop()).unwrap();
    runtime.wait(&write.operation).await.unwrap();

    let stray = runtime
        .request_access(&array, GPU1, AccessMode::Write)
        .unwrap();
    assert_eq!(runtime.validity(&array).unwrap().get(&GPU0), Some(&false));

    runtime.discard(&stray.operation).unwrap();
    let validity = runtime.validity(&array).unwrap();
    assert_eq!(validity.get(&GPU0), Some(&true));
    assert_eq!(validity.get(&GPU1), Some(&false));
    assert!(matches!(
        runtime.wait(&stray.operation).await,
        Err(HetmemError::NotSubmitted(_))
    ));
    assert_eq!(runtime.stats().operations_discarded, 1);

    // The next reader on GPU1 migrates from GPU0 again.
    let read = runtime.request_access(&array, GPU1, AccessMode::Read).unwrap();
    assert!(read.transfer.is_some());
    runtime.submit(&read.operation, common::noop()).unwrap();
    runtime.wait(&read.operation).await.unwrap();
}

/// Untracked work runs after its declared predecessors and composes with
/// explicit validity updates.
#[tokio::test]
async fn test_untracked_work_orders_after_predecessors() {
    let runtime = common::runtime(1);
    let array = runtime
        .create_array(
            ArrayDesc::new::<f32>([LEN]),
            BehaviorPolicy::async_buffer(),
            ArraySeed::Uninit,
        )
        .unwrap();
    let values = common::ramp(LEN, 5.0);

    let write = runtime
        .request_access(&array, GPU0, AccessMode::Write)
        .unwrap();
    let (gate, gate_rx) = mpsc::channel();
    runtime
        .submit(
            &write.operation,
            common::gated_fill(write.pointer, values.clone(), gate_rx),
        )
        .unwrap();

    let (tx, rx) = mpsc::channel();
    let ptr = write.pointer;
    let untracked = runtime
        .submit_untracked(
            GPU0,
            vec![ptr],
            &[write.operation.clone()],
            common::capture(ptr, LEN, tx),
        )
        .unwrap();
    assert_eq!(untracked.kind(), OperationKind::Untracked);
    assert_eq!(untracked.predecessors(), vec![write.operation.id()]);

    gate.send(()).unwrap();
    runtime.wait(&untracked).await.unwrap();
    assert_eq!(rx.recv().unwrap(), values);

    // Overwrite behind the runtime's back, then tell it.
    let doubled = common::ramp(LEN, 10.0);
    let raw = runtime
        .submit_untracked(GPU0, vec![ptr], &[], common::fill(ptr, doubled.clone()))
        .unwrap();
    runtime.wait(&raw).await.unwrap();
    let update = runtime
        .force_update(&array, GPU0, AccessMode::Write)
        .unwrap();
    runtime.wait(&update).await.unwrap();

    let read = runtime
        .request_access(&array, HOST_DEVICE, AccessMode::Read)
        .unwrap();
    assert!(read.transfer.is_some());
    let (tx, rx) = mpsc::channel();
    runtime
        .submit(&read.operation, common::capture(read.pointer, LEN, tx))
        .unwrap();
    runtime.wait(&read.operation).await.unwrap();
    assert_eq!(rx.recv().unwrap(), doubled);

    // Predecessors must already be submitted.
    let pending = runtime
        .request_access(&array, GPU0, AccessMode::Write)
        .unwrap();
    let err = runtime
        .submit_untracked(GPU0, vec![ptr], &[pending.operation.clone()], common::noop())
        .unwrap_err();
    assert!(matches!(
        err,
        HetmemError::PredecessorNotSubmitted { predecessor, .. } if predecessor == pending.operation.id()
    ));
    assert_eq!(pending.operation.dependents(), 0);
    runtime.discard(&pending.operation).unwrap();
}

/// A failing kernel fails the migration reading its output and the reader.
#[tokio::test]
async fn test_kernel_failure_propagates() {
    let runtime = common::runtime(2);
    let array = runtime
        .create_array(
            ArrayDesc::new::<f32>([LEN]),
            BehaviorPolicy::async_buffer(),
            ArraySeed::Uninit,
        )
        .unwrap();
    let write = runtime
        .request_access(&array, GPU0, AccessMode::Write)
        .unwrap();
    let read = runtime.request_access(&array, GPU1, AccessMode::Read).unwrap();

    runtime
        .submit(
            &write.operation,
            Work::kernel(|| Err(HetmemError::KernelFailed("bad launch".to_string()))),
        )
        .unwrap();
    runtime.submit(&read.operation, common::noop()).unwrap();

    assert!(runtime.wait(&write.operation).await.is_err());
    assert!(runtime.wait(&read.operation).await.is_err());
    assert_eq!(write.operation.state(), OperationState::Failed);
    assert_eq!(
        read.transfer.map(|t| t.state()),
        Some(OperationState::Failed)
    );
}

/// Ids of the array's in-flight operations.
#[tokio::test]
async fn test_outstanding_operations() {
    let runtime = common::runtime(1);
    let array = runtime
        .create_array(
            ArrayDesc::new::<f32>([LEN]),
            BehaviorPolicy::async_buffer(),
            ArraySeed::Uninit,
        )
        .unwrap();
    let write = runtime
        .request_access(&array, GPU0, AccessMode::Write)
        .unwrap();
    assert_eq!(
        runtime.outstanding(&array).unwrap(),
        vec![write.operation.id()]
    );
    runtime.submit(&write.operation, common::noop()).unwrap();
    runtime.wait(&write.operation).await.unwrap();
    assert!(runtime.outstanding(&array).unwrap().is_empty());
}
