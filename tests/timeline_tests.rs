//! Timeline semaphore tests
//!
//! Tests for:
//! - Strict ticket order across concurrent CPU producers
//! - Poll / wait agreement on a fixed target
//! - Mixed CPU promises and GPU signals on one timeline

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;

use cinder::TimelineSemaphore;
use cinder::cinder_core::PipelineStage;
use cinder_dev_utils::{MockBackend, init_test_logger};

fn semaphore(name: &str) -> (Arc<MockBackend>, TimelineSemaphore) {
    init_test_logger();
    let backend = Arc::new(MockBackend::new());
    let sem = TimelineSemaphore::new(backend.clone(), name).unwrap();
    (backend, sem)
}

// ============================================================================
// Ordering
// ============================================================================

#[test]
fn concurrent_signals_advance_in_ticket_order() {
    const N: u64 = 8;
    let (backend, sem) = semaphore("ordered");

    let promises: Vec<_> = (0..N).map(|_| sem.promise()).collect();
    let barrier = Arc::new(Barrier::new(N as usize));
    // later tickets start first
    let producers: Vec<_> = promises
        .into_iter()
        .rev()
        .map(|promise| {
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                barrier.wait();
                promise.signal();
            })
        })
        .collect();
    for p in producers {
        p.join().unwrap();
    }

    assert_eq!(backend.signal_history(sem.handle()), (1..=N).collect::<Vec<_>>());
    assert_eq!(sem.value(), N);
    assert_eq!(sem.observed_value(), N);
}

#[test]
fn signal_blocks_on_previous_ticket() {
    let (_backend, sem) = semaphore("blocking");
    let first = sem.promise();
    let second = sem.promise();

    let done = Arc::new(AtomicBool::new(false));
    let late = {
        let done = done.clone();
        std::thread::spawn(move || {
            second.signal();
            done.store(true, Ordering::SeqCst);
        })
    };

    std::thread::sleep(Duration::from_millis(30));
    assert!(!done.load(Ordering::SeqCst));
    first.signal();
    late.join().unwrap();
    assert!(done.load(Ordering::SeqCst));
    assert_eq!(sem.value(), 2);
}

#[test]
#[should_panic(expected = "no pending CPU signal promise")]
fn signalling_a_reached_ticket_is_fatal() {
    let (backend, sem) = semaphore("reached");
    let promise = sem.promise();
    // something else already pushed the counter past the ticket
    backend.set_semaphore_value(sem.handle(), 1);
    let _ = sem.value();
    promise.signal();
}

// ============================================================================
// Waiters
// ============================================================================

#[test]
fn poll_agrees_with_wait() {
    let (_backend, sem) = semaphore("poll");
    let promise = sem.promise();
    let waiter = sem.waiter_for_pending_value();
    assert!(!waiter.poll());

    let producer = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        promise.signal();
    });
    waiter.wait();
    assert!(waiter.poll());
    producer.join().unwrap();
    assert!(waiter.poll());
}

#[test]
fn later_tickets_do_not_move_a_waiter() {
    let (_backend, sem) = semaphore("fixed");
    let a = sem.promise();
    let waiter = sem.waiter_for_pending_value();
    let b = sem.promise();
    let c = sem.promise();

    a.signal();
    assert!(waiter.poll());
    assert_eq!(waiter.value(), 1);
    assert_eq!(sem.waiter_for_pending_value().value(), 3);

    b.signal();
    c.signal();
}

#[test]
fn gpu_and_cpu_tickets_share_one_timeline() {
    let (backend, sem) = semaphore("mixed");
    backend.set_auto_complete(false);

    let gpu = sem.signal_info(PipelineStage::ALL);
    let cpu = sem.promise();
    assert_eq!((gpu.value(), cpu.value()), (1, 2));
    let gpu_value = gpu.value();
    gpu.submitted();

    let producer = std::thread::spawn(move || cpu.signal());
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(sem.value(), 0);

    // the GPU reaches its ticket, which unblocks the CPU promise
    backend.set_semaphore_value(sem.handle(), gpu_value);
    producer.join().unwrap();
    assert_eq!(backend.signal_history(sem.handle()), vec![1, 2]);
    sem.wait();
}
