
use serde_json::json;
use std::sync::{Arc, Barrier};
use std::thread;

use jobhive::job::{JobId, JobState, LastError};
use jobhive::jobs::{DUMMY_JOB, ERROR_JOB};
use jobhive::store::{QueueStore, RunningBy};
use jobhive::QueueError;
use test_harness::{at, TestQueue, HOSTNAME};

const CONTENDERS: usize = 8;

#[test]
fn test_exactly_one_parallel_lock_succeeds() {
    let q = TestQueue::new();
    let id = q.enqueue(DUMMY_JOB, json!({}));
    let barrier = Arc::new(Barrier::new(CONTENDERS));

    let handles: Vec<_> = (0..CONTENDERS)
        .map(|i| {
            // every contender has its own connection to the same file
            let store = q.reopen();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                store.lock(id, &format!("w{}", i), at(0)).unwrap()
            })
        })
        .collect();

    let winners: Vec<usize> = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .enumerate()
        .filter(|(_, won)| *won)
        .map(|(i, _)| i)
        .collect();

    assert_eq!(winners.len(), 1);
    let holder = q.store.lock_holder(id).unwrap().unwrap();
    assert_eq!(holder, format!("w{}", winners[0]));
}

#[test]
fn test_parallel_dispatch_runs_a_job_once() {
    let q = TestQueue::new();
    let id = q.enqueue(DUMMY_JOB, json!({}));
    let barrier = Arc::new(Barrier::new(CONTENDERS));

    let handles: Vec<_> = (0..CONTENDERS)
        .map(|i| {
            let store = q.reopen();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let worker = format!("w{}", i);
                barrier.wait();
                if !store.lock(id, &worker, at(0)).unwrap() {
                    return false;
                }
                store
                    .mark_running(
                        id,
                        RunningBy {
                            worker: &worker,
                            hostname: HOSTNAME,
                        },
                        at(0),
                    )
                    .unwrap();
                true
            })
        })
        .collect();

    let started = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|started| *started)
        .count();

    assert_eq!(started, 1);
    let doc = q.doc(id);
    assert_eq!(doc.state(), JobState::Running);
    assert_eq!(doc.trial(), 1);
}

#[test]
fn test_lock_is_free_again_after_unlock() {
    let q = TestQueue::new();
    let id = q.enqueue(DUMMY_JOB, json!({}));
    let other = q.reopen();

    assert!(q.store.lock(id, "w1", at(0)).unwrap());
    assert!(!other.lock(id, "w2", at(0)).unwrap());
    assert!(q.store.unlock(id).unwrap());
    assert!(!q.store.unlock(id).unwrap());
    assert!(other.lock(id, "w2", at(1)).unwrap());
}

fn mark_running(store: &QueueStore, id: JobId, worker: &str, secs: i64) -> jobhive::Result<JobState> {
    store
        .mark_running(
            id,
            RunningBy {
                worker,
                hostname: HOSTNAME,
            },
            at(secs),
        )
        .map(|doc| doc.state())
}

#[test]
fn test_job_removed_after_selection_is_not_started() {
    let q = TestQueue::new();
    let id = q.enqueue(DUMMY_JOB, json!({}));
    let candidate = q
        .store
        .next_candidate(HOSTNAME, "w1", None, None, at(0))
        .unwrap()
        .unwrap();
    assert_eq!(candidate.id, id);

    // a user flags the job between selection and lock
    assert!(q.reopen().remove(id, at(0)).unwrap());

    assert!(q.store.lock(id, "w1", at(0)).unwrap());
    assert!(matches!(
        mark_running(&q.store, id, "w1", 0),
        Err(QueueError::Conflict(_))
    ));
    let doc = q.doc(id);
    assert_eq!(doc.state(), JobState::Pending);
    assert_eq!(doc.trial(), 0);
}

#[test]
fn test_job_killed_while_running_is_not_restarted() {
    let q = TestQueue::new();
    let id = q.enqueue(ERROR_JOB, json!({"attempts": 3, "error_time": 1}));
    q.start(id, "w1", at(0));
    assert!(q.store.kill(id, at(1)).unwrap());
    q.store
        .set_failed(id, LastError::new("JobFailed: x", at(2)), at(2))
        .unwrap();
    assert_eq!(q.doc(id).state(), JobState::Failed);

    assert!(q.store.lock(id, "w2", at(10)).unwrap());
    assert!(matches!(
        mark_running(&q.store, id, "w2", 10),
        Err(QueueError::Conflict(_))
    ));
}

#[test]
fn test_job_failed_by_another_worker_waits_for_error_time() {
    let q = TestQueue::new();
    let id = q.enqueue(ERROR_JOB, json!({"attempts": 2, "error_time": 600}));
    let worker_b = q.reopen();

    // worker A selected the job, worker B ran and failed it in the meantime
    assert!(q
        .store
        .next_candidate(HOSTNAME, "w1", None, None, at(0))
        .unwrap()
        .is_some());
    assert!(worker_b.lock(id, "w2", at(0)).unwrap());
    mark_running(&worker_b, id, "w2", 0).unwrap();
    worker_b
        .set_failed(id, LastError::new("JobFailed: x", at(1)), at(1))
        .unwrap();

    assert!(q.store.lock(id, "w1", at(1)).unwrap());
    assert!(matches!(
        mark_running(&q.store, id, "w1", 1),
        Err(QueueError::Conflict(_))
    ));
    assert!(q.store.unlock(id).unwrap());

    assert!(q.store.lock(id, "w1", at(601)).unwrap());
    assert_eq!(mark_running(&q.store, id, "w1", 601).unwrap(), JobState::Running);
    assert_eq!(q.doc(id).trial(), 2);
}

#[test]
fn test_job_without_attempts_is_not_started() {
    let q = TestQueue::new();
    let id = q.enqueue(ERROR_JOB, json!({}));
    q.start(id, "w1", at(0));
    q.store
        .set_failed(id, LastError::new("JobFailed: x", at(1)), at(1))
        .unwrap();
    assert_eq!(q.doc(id).attempts_left(), 0);

    assert!(q.store.lock(id, "w1", at(2)).unwrap());
    assert!(matches!(
        mark_running(&q.store, id, "w1", 2),
        Err(QueueError::Conflict(_))
    ));
}
