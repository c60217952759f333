
use serde_json::json;

use jobhive::job::{JobId, JobState, LastError};
use jobhive::jobs::{DEFER_JOB, DUMMY_JOB, ERROR_JOB};
use jobhive::store::{JobFilter, ListOptions};
use jobhive::QueueError;
use test_harness::{at, t0, TestQueue};

// =============================================================================
// Enqueue
// =============================================================================

#[test]
fn test_enqueue_assigns_increasing_ids() {
    let q = TestQueue::new();

    let a = q.enqueue(DUMMY_JOB, json!({"sleep": 1}));
    let b = q.enqueue(DUMMY_JOB, json!({"sleep": 2}));

    assert!(b > a);
    let doc = q.doc(a);
    assert_eq!(doc.state(), JobState::Pending);
    assert_eq!(doc.trial(), 0);
    assert_eq!(doc.attempts_left(), 1);
    assert_eq!(doc.enqueued().username, "tester");
    assert_eq!(doc.args().get("sleep"), Some(&json!(1)));
}

#[test]
fn test_duplicate_enqueue_is_rejected() {
    let q = TestQueue::new();
    q.enqueue(DUMMY_JOB, json!({"sleep": 1}));

    let err = q
        .try_enqueue(DUMMY_JOB, json!({"sleep": 1}), t0())
        .unwrap_err();
    assert!(matches!(err, QueueError::JobExists { .. }));

    // argument order does not matter for identity
    let a = q.enqueue(DUMMY_JOB, json!({"x": 1, "y": 2}));
    let err = q
        .try_enqueue(DUMMY_JOB, json!({"y": 2, "x": 1}), t0())
        .unwrap_err();
    assert!(matches!(err, QueueError::JobExists { .. }));
    assert!(q.store.load(a).unwrap().is_some());
}

#[test]
fn test_finished_job_can_be_enqueued_again() {
    let q = TestQueue::new();
    let id = q.enqueue(DUMMY_JOB, json!({"sleep": 1}));
    q.start(id, "w1", at(0));
    q.store.set_complete(id, at(1)).unwrap();

    let again = q.enqueue(DUMMY_JOB, json!({"sleep": 1}));
    assert!(again > id);
}

#[test]
fn test_enqueue_properties_and_validation() {
    let q = TestQueue::new();

    let id = q.enqueue(DUMMY_JOB, json!({"priority": 7, "attempts": 3, "args": {"sleep": 0}}));
    let doc = q.doc(id);
    assert_eq!(doc.priority(), 7);
    assert_eq!(doc.attempts(), 3);
    assert_eq!(doc.attempts_left(), 3);
    assert_eq!(doc.args().get("sleep"), Some(&json!(0)));
    assert!(doc.args().get("priority").is_none());

    // only enqueue properties may be set
    let err = q.try_enqueue(DUMMY_JOB, json!({"schedule": "* * * * *"}), t0()).unwrap_err();
    assert!(matches!(err, QueueError::Validation(_)));

    let err = q.try_enqueue(DUMMY_JOB, json!({"attempts": 0}), t0()).unwrap_err();
    assert!(matches!(err, QueueError::Validation(_)));

    let err = q.try_enqueue("no.such.Job", json!({}), t0()).unwrap_err();
    assert!(matches!(err, QueueError::Validation(_)));
}

#[test]
fn test_config_sections_feed_the_defaults() {
    let mut q = TestQueue::new();
    q.config.job.attempts = Some(4);
    q.config.jobs.insert(
        DUMMY_JOB.to_string(),
        jobhive::job::JobOverrides {
            priority: Some(3),
            ..Default::default()
        },
    );

    let id = q.enqueue(DUMMY_JOB, json!({}));
    let doc = q.doc(id);
    assert_eq!(doc.attempts(), 4);
    assert_eq!(doc.priority(), 3);

    // enqueue parameters win over config
    let id = q.enqueue(DUMMY_JOB, json!({"priority": 9, "n": 1}));
    assert_eq!(q.doc(id).priority(), 9);
}

// =============================================================================
// Kill and remove
// =============================================================================

#[test]
fn test_kill_only_applies_to_running_jobs() {
    let q = TestQueue::new();
    let id = q.enqueue(DUMMY_JOB, json!({}));

    assert!(!q.store.kill(id, at(0)).unwrap());
    assert!(q.doc(id).killed_at().is_none());

    q.start(id, "w1", at(1));
    assert!(q.store.kill(id, at(2)).unwrap());
    assert!(!q.store.kill(id, at(3)).unwrap());
    assert_eq!(q.doc(id).killed_at(), Some(at(2)));

    assert!(matches!(
        q.store.kill(JobId(999), at(0)),
        Err(QueueError::JobNotFound(_))
    ));
}

#[test]
fn test_remove_flags_once_and_hides_the_job() {
    let q = TestQueue::new();
    let id = q.enqueue(DUMMY_JOB, json!({}));

    assert!(q.store.remove(id, at(0)).unwrap());
    assert!(!q.store.remove(id, at(1)).unwrap());
    assert_eq!(q.doc(id).removed_at(), Some(at(0)));

    assert!(q
        .store
        .next_candidate(test_harness::HOSTNAME, "w1", None, None, at(2))
        .unwrap()
        .is_none());
    assert_eq!(q.store.removed_jobs().unwrap().len(), 1);
}

// =============================================================================
// Restart
// =============================================================================

#[test]
fn test_restart_waiting_job_keeps_id() {
    let q = TestQueue::new();
    let id = q.enqueue(ERROR_JOB, json!({"attempts": 2}));
    q.start(id, "w1", at(0));

    let state = q
        .store
        .set_failed(id, LastError::new("JobFailed: boom", at(1)), at(1))
        .unwrap();
    assert_eq!(state, JobState::Failed);
    assert_eq!(q.doc(id).query_at(), Some(at(601)));

    assert_eq!(q.store.restart(id, at(2)).unwrap(), id);
    let doc = q.doc(id);
    assert_eq!(doc.state(), JobState::Failed);
    assert!(doc.query_at().is_none());
    assert!(q
        .store
        .next_candidate(test_harness::HOSTNAME, "w1", None, None, at(2))
        .unwrap()
        .is_some());
}

#[test]
fn test_restart_stopped_job_links_a_new_job() {
    let q = TestQueue::new();
    let id = q.enqueue(ERROR_JOB, json!({"message": "nope"}));
    q.start(id, "w1", at(0));
    q.store
        .set_failed(id, LastError::new("JobFailed: nope", at(1)), at(1))
        .unwrap();
    assert_eq!(q.doc(id).state(), JobState::Error);

    let new_id = q.store.restart(id, at(2)).unwrap();
    assert_ne!(new_id, id);

    // the original moved to the journal with a forward link
    assert!(q.store.load(id).unwrap().is_none());
    let original = q.store.journal_entry(id).unwrap().unwrap();
    assert_eq!(original.state(), JobState::Error);
    assert_eq!(original.enqueued().child_id, Some(new_id));
    assert!(q.store.lock_holder(id).unwrap().is_none());

    let restarted = q.doc(new_id);
    assert_eq!(restarted.state(), JobState::Pending);
    assert_eq!(restarted.enqueued().parent_id, Some(id));
    assert_eq!(restarted.args(), original.args());
    assert_eq!(restarted.attempts_left(), 1);
    assert_eq!(restarted.trial(), 0);

    // host and user of the original enqueue are carried forward
    let enqueued = restarted.enqueued();
    assert_eq!(enqueued.at, at(2));
    assert_eq!(enqueued.hostname, test_harness::HOSTNAME);
    assert_eq!(enqueued.username, "tester");
}

#[test]
fn test_restart_inactive_job_from_journal() {
    let q = TestQueue::new();
    let id = q.enqueue(DEFER_JOB, json!({"defer_max": 1}));
    q.start(id, "w1", at(0));
    assert_eq!(
        q.store.set_deferred(id, "later", at(1)).unwrap(),
        JobState::Inactive
    );
    assert!(q.store.load(id).unwrap().is_none());

    let new_id = q.store.restart(id, at(2)).unwrap();
    assert_eq!(q.doc(new_id).enqueued().parent_id, Some(id));
    assert_eq!(q.doc(new_id).enqueued().username, "tester");
    assert_eq!(q.doc(new_id).defer_max(), 1);
}

#[test]
fn test_restart_rejects_running_and_unknown_jobs() {
    let q = TestQueue::new();
    let id = q.enqueue(DUMMY_JOB, json!({}));
    q.start(id, "w1", at(0));

    assert!(matches!(q.store.restart(id, at(1)), Err(QueueError::Conflict(_))));
    assert!(matches!(
        q.store.restart(JobId(4242), at(1)),
        Err(QueueError::JobNotFound(_))
    ));
}

// =============================================================================
// Outcomes
// =============================================================================

#[test]
fn test_single_attempt_failure_ends_in_error() {
    let q = TestQueue::new();
    let id = q.enqueue(ERROR_JOB, json!({}));
    q.start(id, "w1", at(0));

    let state = q
        .store
        .set_failed(id, LastError::new("JobFailed: expected failure", at(1)), at(1))
        .unwrap();
    assert_eq!(state, JobState::Error);

    let doc = q.doc(id);
    assert_eq!(doc.attempts_left(), 0);
    assert_eq!(doc.trial(), 1);
    assert!(doc.locked().is_none());
    assert_eq!(doc.last_error().unwrap().exception, "JobFailed: expected failure");
    assert!(q.store.lock_holder(id).unwrap().is_none());

    assert!(q.store.remove(id, at(2)).unwrap());
    q.store.remove_and_journal(id, at(3)).unwrap();

    assert!(q.store.load(id).unwrap().is_none());
    let journal = q.store.list_journal(&ListOptions::default()).unwrap();
    assert_eq!(journal.len(), 1);
    assert_eq!(journal[0].id(), id);
    assert_eq!(journal[0].state(), JobState::Error);
}

#[test]
fn test_failures_count_down_attempts() {
    let q = TestQueue::new();
    let id = q.enqueue(ERROR_JOB, json!({"attempts": 3, "error_time": 10}));

    let mut now = 0;
    for expected_left in [2, 1] {
        q.start(id, "w1", at(now));
        let state = q
            .store
            .set_failed(id, LastError::new("JobFailed: x", at(now)), at(now))
            .unwrap();
        assert_eq!(state, JobState::Failed);
        assert_eq!(q.doc(id).attempts_left(), expected_left);
        now += 10;
    }
    q.start(id, "w1", at(now));
    q.store
        .set_failed(id, LastError::new("JobFailed: x", at(now)), at(now))
        .unwrap();
    let doc = q.doc(id);
    assert_eq!(doc.state(), JobState::Error);
    assert_eq!(doc.attempts_left(), 0);
    assert_eq!(doc.trial(), 3);
}

#[test]
fn test_deferring_job_turns_inactive_after_defer_max() {
    let q = TestQueue::new();
    let id = q.enqueue(DEFER_JOB, json!({"defer_time": 5, "defer_max": 20}));

    for t in [0, 5, 10, 15] {
        // not eligible before query_at
        if t > 0 {
            assert!(q
                .store
                .next_candidate(test_harness::HOSTNAME, "w1", None, None, at(t - 1))
                .unwrap()
                .is_none());
        }
        let candidate = q
            .store
            .next_candidate(test_harness::HOSTNAME, "w1", None, None, at(t))
            .unwrap()
            .unwrap();
        assert_eq!(candidate.id, id);

        q.start(id, "w1", at(t));
        let state = q.store.set_deferred(id, "not ready yet", at(t)).unwrap();
        assert_eq!(state, JobState::Deferred, "t={}", t);

        let doc = q.doc(id);
        assert_eq!(doc.attempts_left(), 1);
        assert_eq!(doc.inactive_at(), Some(at(20)));
        assert_eq!(doc.query_at(), Some(at(t + 5)));
    }

    q.start(id, "w1", at(20));
    let state = q.store.set_deferred(id, "not ready yet", at(20)).unwrap();
    assert_eq!(state, JobState::Inactive);

    assert!(q.store.load(id).unwrap().is_none());
    let journaled = q.store.journal_entry(id).unwrap().unwrap();
    assert_eq!(journaled.state(), JobState::Inactive);
    assert_eq!(journaled.trial(), 5);
    assert_eq!(q.store.list_journal(&ListOptions::default()).unwrap().len(), 1);
}

#[test]
fn test_complete_accumulates_runtime_and_journals() {
    let q = TestQueue::new();
    let id = q.enqueue(DUMMY_JOB, json!({}));
    q.start(id, "w1", at(0));
    q.store.progress(id, 0.5, Some("half"), at(2)).unwrap();

    let locked = q.doc(id).locked().cloned().unwrap();
    assert_eq!(locked.heartbeat, at(2));
    assert_eq!(locked.progress.as_deref(), Some("half"));

    let doc = q.store.set_complete(id, at(4)).unwrap();
    assert_eq!(doc.state(), JobState::Complete);
    assert!((doc.runtime() - 4.0).abs() < 1e-9);
    assert_eq!(doc.finished_at(), Some(at(4)));
    assert!(q.store.load(id).unwrap().is_none());
    assert_eq!(q.store.find(id).unwrap().unwrap().state(), JobState::Complete);
}

#[test]
fn test_illegal_transition_is_a_conflict() {
    let q = TestQueue::new();
    let id = q.enqueue(DUMMY_JOB, json!({}));

    assert!(matches!(
        q.store.set_complete(id, at(0)),
        Err(QueueError::Conflict(_))
    ));
    assert_eq!(q.doc(id).state(), JobState::Pending);
}

// =============================================================================
// Reads
// =============================================================================

#[test]
fn test_list_and_count() {
    let q = TestQueue::new();
    let a = q.enqueue(DUMMY_JOB, json!({"n": 1}));
    let b = q.enqueue(DUMMY_JOB, json!({"n": 2}));
    let c = q.enqueue(ERROR_JOB, json!({"n": 3}));
    q.start(b, "w1", at(0));

    let all = q
        .store
        .list(&JobFilter::default(), &ListOptions::default())
        .unwrap();
    assert_eq!(all.iter().map(|d| d.id()).collect::<Vec<_>>(), vec![a, b, c]);

    let newest = q
        .store
        .list(
            &JobFilter::default(),
            &ListOptions {
                descending: true,
                skip: 0,
                limit: Some(2),
            },
        )
        .unwrap();
    assert_eq!(newest.iter().map(|d| d.id()).collect::<Vec<_>>(), vec![c, b]);

    let pending_dummies = q
        .store
        .list(
            &JobFilter {
                state: Some(JobState::Pending),
                name: Some(DUMMY_JOB.to_string()),
            },
            &ListOptions::default(),
        )
        .unwrap();
    assert_eq!(pending_dummies.len(), 1);
    assert_eq!(pending_dummies[0].id(), a);

    let counts = q.store.count_by_state().unwrap();
    assert_eq!(counts.len(), JobState::ALL.len());
    let count = |state| counts.iter().find(|(s, _)| *s == state).unwrap().1;
    assert_eq!(count(JobState::Pending), 2);
    assert_eq!(count(JobState::Running), 1);
    assert_eq!(count(JobState::Error), 0);
}

#[test]
fn test_output_is_appended() {
    let q = TestQueue::new();
    let id = q.enqueue(DUMMY_JOB, json!({}));

    assert!(q.store.output(id).unwrap().is_none());
    q.store.save_output(id, "first\n", "", at(0)).unwrap();
    q.store.save_output(id, "second\n", "warn\n", at(1)).unwrap();

    let output = q.store.output(id).unwrap().unwrap();
    assert_eq!(output.stdout, "first\nsecond\n");
    assert_eq!(output.stderr, "warn\n");
    assert_eq!(output.timestamp, at(1));
}

#[test]
fn test_second_connection_sees_writes() {
    let q = TestQueue::new();
    let id = q.enqueue(DUMMY_JOB, json!({}));

    let other = q.reopen();
    assert_eq!(other.load(id).unwrap().unwrap().state(), JobState::Pending);
    assert!(other.kill(id, at(0)).is_ok());
}

// =============================================================================
// Event log
// =============================================================================

#[test]
fn test_client_requests_and_outcomes_are_logged_with_counts() {
    let q = TestQueue::new();
    let done = q.enqueue(DUMMY_JOB, json!({"n": 1}));
    let killed = q.enqueue(DUMMY_JOB, json!({"n": 2}));

    q.start(done, "w1", at(1));
    q.store.set_complete(done, at(2)).unwrap();
    q.store.remove(done, at(3)).unwrap();

    q.start(killed, "w1", at(4));
    assert!(q.store.kill(killed, at(5)).unwrap());
    q.store.set_killed(killed, at(6)).unwrap();
    let new_id = q.store.restart(killed, at(7)).unwrap();

    let stats = q.store.stats(&ListOptions::default()).unwrap();
    let events: Vec<(&str, Option<JobId>)> =
        stats.iter().map(|r| (r.event.as_str(), r.job_id)).collect();
    assert_eq!(
        events,
        vec![
            ("enqueue_job", Some(done)),
            ("enqueue_job", Some(killed)),
            ("complete_job", Some(done)),
            ("request_remove_job", Some(done)),
            ("request_kill_job", Some(killed)),
            ("kill_job", Some(killed)),
            ("restart_stopped", Some(killed)),
        ]
    );

    // starting a job is not an event
    assert_eq!(stats[1].count(JobState::Pending), 2);
    assert_eq!(stats[2].count(JobState::Complete), 1);
    assert_eq!(stats[2].count(JobState::Running), 0);
    assert_eq!(stats[2].count(JobState::Pending), 1);
    assert_eq!(stats[5].count(JobState::Killed), 1);
    assert_eq!(stats[6].timestamp, at(7));
    assert_eq!(stats[6].count(JobState::Killed), 0);
    assert_eq!(stats[6].count(JobState::Pending), 1);
    assert_eq!(q.doc(new_id).state(), JobState::Pending);

    let latest = q
        .store
        .stats(&ListOptions {
            descending: true,
            skip: 0,
            limit: Some(2),
        })
        .unwrap();
    assert_eq!(latest.len(), 2);
    assert_eq!(latest[0].event, "restart_stopped");
    assert_eq!(latest[1].event, "kill_job");
}

#[test]
fn test_failed_and_deferred_outcomes_are_logged() {
    let q = TestQueue::new();
    let failing = q.enqueue(ERROR_JOB, json!({"attempts": 2}));
    let deferring = q.enqueue(DEFER_JOB, json!({}));

    q.start(failing, "w1", at(0));
    q.store
        .set_failed(failing, LastError::new("JobFailed: x", at(1)), at(1))
        .unwrap();
    q.store.restart(failing, at(2)).unwrap();

    q.start(deferring, "w1", at(3));
    q.store.set_deferred(deferring, "later", at(4)).unwrap();

    let stats = q.store.stats(&ListOptions::default()).unwrap();
    let events: Vec<&str> = stats.iter().map(|r| r.event.as_str()).collect();
    assert_eq!(
        events,
        vec![
            "enqueue_job",
            "enqueue_job",
            "failed_job",
            "restart_waiting",
            "defer_job"
        ]
    );
    assert_eq!(stats[2].count(JobState::Failed), 1);
    assert_eq!(stats[4].count(JobState::Deferred), 1);
}
