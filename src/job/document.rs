use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::str::FromStr;

use crate::error::{QueueError, Result};
use crate::job::property::JobProperties;
use crate::job::state::JobState;

/// Store-assigned job identifier. Strictly increasing, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .parse::<i64>()
            .map(JobId)
            .map_err(|_| QueueError::validation(format!("invalid job id [{}]", s.trim())))
    }
}

/// Who enqueued a job, and when.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enqueued {
    pub at: DateTime<Utc>,
    pub hostname: String,
    pub username: String,
    pub parent_id: Option<JobId>,
    pub child_id: Option<JobId>,
}

/// Origin of an enqueue request. Defaults to the current host and user.
#[derive(Debug, Clone, PartialEq)]
pub struct Origin {
    pub at: DateTime<Utc>,
    pub hostname: String,
    pub username: String,
}

impl Origin {
    pub fn current(at: DateTime<Utc>) -> Self {
        let node = crate::node::NodeInfo::current();
        Self {
            at,
            hostname: node.hostname,
            username: node.username,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockInfo {
    pub worker: String,
    pub hostname: String,
    pub pid: Option<u32>,
    pub at: DateTime<Utc>,
    pub heartbeat: DateTime<Utc>,
    pub progress: Option<String>,
    pub progress_value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastError {
    pub exception: String,
    pub timestamp: DateTime<Utc>,
    pub traceback: Option<String>,
}

impl LastError {
    pub fn new(exception: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            exception: exception.into(),
            timestamp,
            traceback: None,
        }
    }

    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = Some(traceback.into());
        self
    }
}

/// Project of a qualified job name: the segment before the first dot.
pub fn project_of(name: &str) -> &str {
    name.split('.').next().unwrap_or(name)
}

/// SHA-256 hex digest of the canonical (sorted-key) JSON encoding of `args`.
pub fn args_hash(args: &Map<String, Value>) -> String {
    // serde_json::Map is ordered by key unless `preserve_order` is enabled
    let canonical = canonicalize(&Value::Object(args.clone()));
    let encoded = canonical.to_string();
    let digest = Sha256::digest(encoded.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// A validated job ready to be enqueued. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    name: String,
    args: Map<String, Value>,
    args_hash: String,
    props: JobProperties,
    parent_id: Option<JobId>,
}

impl NewJob {
    pub fn new(name: impl Into<String>, args: Map<String, Value>, props: JobProperties) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(QueueError::validation("job name must not be empty"));
        }
        props.validate()?;
        let args_hash = args_hash(&args);
        Ok(Self {
            name,
            args,
            args_hash,
            props,
            parent_id: None,
        })
    }

    /// A fresh job carrying forward the name, args and resolved properties of
    /// a stopped job.
    pub(crate) fn restart_of(doc: &JobDocument) -> Self {
        Self {
            name: doc.name.clone(),
            args: doc.args.clone(),
            args_hash: doc.args_hash.clone(),
            props: doc.properties(),
            parent_id: Some(doc.id),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &Map<String, Value> {
        &self.args
    }

    pub fn args_hash(&self) -> &str {
        &self.args_hash
    }

    pub fn properties(&self) -> &JobProperties {
        &self.props
    }

    pub fn parent_id(&self) -> Option<JobId> {
        self.parent_id
    }
}

/// A job as persisted by the store.
///
/// Every field maps to one serialised property. Fields are only changed by
/// store operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDocument {
    pub(crate) id: JobId,
    pub(crate) name: String,
    pub(crate) args: Map<String, Value>,
    pub(crate) args_hash: String,
    pub(crate) state: JobState,
    pub(crate) priority: i32,
    pub(crate) trial: u32,
    pub(crate) attempts: u32,
    pub(crate) attempts_left: u32,
    pub(crate) force: bool,
    pub(crate) defer_time: u64,
    pub(crate) defer_max: u64,
    pub(crate) error_time: u64,
    pub(crate) wall_time: Option<u64>,
    pub(crate) zombie_time: u64,
    pub(crate) progress_interval: u64,
    pub(crate) nodes: Vec<String>,
    pub(crate) max_parallel: Option<u32>,
    pub(crate) dependency: Vec<String>,
    pub(crate) chain: Vec<String>,
    pub(crate) enqueued: Enqueued,
    pub(crate) started_at: Option<DateTime<Utc>>,
    pub(crate) finished_at: Option<DateTime<Utc>>,
    pub(crate) query_at: Option<DateTime<Utc>>,
    pub(crate) inactive_at: Option<DateTime<Utc>>,
    pub(crate) killed_at: Option<DateTime<Utc>>,
    pub(crate) removed_at: Option<DateTime<Utc>>,
    pub(crate) zombie_at: Option<DateTime<Utc>>,
    pub(crate) wall_at: Option<DateTime<Utc>>,
    pub(crate) locked: Option<LockInfo>,
    pub(crate) last_error: Option<LastError>,
    pub(crate) runtime: f64,
}

impl JobDocument {
    pub(crate) fn from_new(id: JobId, job: &NewJob, origin: &Origin) -> Self {
        let p = &job.props;
        Self {
            id,
            name: job.name.clone(),
            args: job.args.clone(),
            args_hash: job.args_hash.clone(),
            state: JobState::Pending,
            priority: p.priority,
            trial: 0,
            attempts: p.attempts,
            attempts_left: p.attempts,
            force: p.force,
            defer_time: p.defer_time,
            defer_max: p.defer_max,
            error_time: p.error_time,
            wall_time: p.wall_time,
            zombie_time: p.zombie_time,
            progress_interval: p.progress_interval,
            nodes: p.nodes.clone(),
            max_parallel: p.max_parallel,
            dependency: p.dependency.clone(),
            chain: p.chain.clone(),
            enqueued: Enqueued {
                at: origin.at,
                hostname: origin.hostname.clone(),
                username: origin.username.clone(),
                parent_id: job.parent_id,
                child_id: None,
            },
            started_at: None,
            finished_at: None,
            query_at: None,
            inactive_at: None,
            killed_at: None,
            removed_at: None,
            zombie_at: None,
            wall_at: None,
            locked: None,
            last_error: None,
            runtime: 0.0,
        }
    }

    /// The persisted properties. Properties that are never persisted take
    /// their built-in defaults.
    pub fn properties(&self) -> JobProperties {
        JobProperties {
            attempts: self.attempts,
            chain: self.chain.clone(),
            defer_max: self.defer_max,
            defer_time: self.defer_time,
            dependency: self.dependency.clone(),
            error_time: self.error_time,
            force: self.force,
            hidden: false,
            max_parallel: self.max_parallel,
            nodes: self.nodes.clone(),
            priority: self.priority,
            progress_interval: self.progress_interval,
            schedule: None,
            tag: Vec::new(),
            wall_time: self.wall_time,
            zombie_time: self.zombie_time,
        }
    }

    pub(crate) fn transition(&mut self, next: JobState) -> Result<()> {
        self.state.check_transition(next)?;
        self.state = next;
        Ok(())
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &Map<String, Value> {
        &self.args
    }

    pub fn args_hash(&self) -> &str {
        &self.args_hash
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn trial(&self) -> u32 {
        self.trial
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn attempts_left(&self) -> u32 {
        self.attempts_left
    }

    pub fn force(&self) -> bool {
        self.force
    }

    pub fn defer_time(&self) -> u64 {
        self.defer_time
    }

    pub fn defer_max(&self) -> u64 {
        self.defer_max
    }

    pub fn error_time(&self) -> u64 {
        self.error_time
    }

    pub fn wall_time(&self) -> Option<u64> {
        self.wall_time
    }

    pub fn zombie_time(&self) -> u64 {
        self.zombie_time
    }

    pub fn progress_interval(&self) -> u64 {
        self.progress_interval
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn max_parallel(&self) -> Option<u32> {
        self.max_parallel
    }

    pub fn dependency(&self) -> &[String] {
        &self.dependency
    }

    pub fn chain(&self) -> &[String] {
        &self.chain
    }

    pub fn enqueued(&self) -> &Enqueued {
        &self.enqueued
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn query_at(&self) -> Option<DateTime<Utc>> {
        self.query_at
    }

    pub fn inactive_at(&self) -> Option<DateTime<Utc>> {
        self.inactive_at
    }

    pub fn killed_at(&self) -> Option<DateTime<Utc>> {
        self.killed_at
    }

    pub fn removed_at(&self) -> Option<DateTime<Utc>> {
        self.removed_at
    }

    pub fn zombie_at(&self) -> Option<DateTime<Utc>> {
        self.zombie_at
    }

    pub fn wall_at(&self) -> Option<DateTime<Utc>> {
        self.wall_at
    }

    pub fn locked(&self) -> Option<&LockInfo> {
        self.locked.as_ref()
    }

    pub fn last_error(&self) -> Option<&LastError> {
        self.last_error.as_ref()
    }

    pub fn runtime(&self) -> f64 {
        self.runtime
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::property::{serialised_properties, JobOverrides};
    use serde_json::json;
    use std::collections::BTreeSet;

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn new_job(name: &str, a: Value) -> NewJob {
        let props = JobProperties::resolve(&[&JobOverrides::default()]).unwrap();
        NewJob::new(name, args(a), props).unwrap()
    }

    #[test]
    fn args_hash_ignores_key_order() {
        let a = args(json!({"a": 1, "b": {"y": 2, "x": 1}}));
        let b = args(json!({"b": {"x": 1, "y": 2}, "a": 1}));
        assert_eq!(args_hash(&a), args_hash(&b));
        assert_ne!(args_hash(&a), args_hash(&args(json!({"a": 2}))));
        assert_eq!(args_hash(&a).len(), 64);
    }

    #[test]
    fn empty_name_is_rejected() {
        let props = JobProperties::resolve(&[]).unwrap();
        assert!(NewJob::new("  ", Map::new(), props).is_err());
    }

    #[test]
    fn new_document_is_pending_with_all_attempts() {
        let job = new_job("demo.Job", json!({"x": 1}));
        let origin = Origin {
            at: Utc::now(),
            hostname: "host".to_string(),
            username: "me".to_string(),
        };
        let doc = JobDocument::from_new(JobId(7), &job, &origin);
        assert_eq!(doc.state(), JobState::Pending);
        assert_eq!(doc.attempts_left(), doc.attempts());
        assert_eq!(doc.trial(), 0);
        assert_eq!(doc.enqueued().hostname, "host");
        assert_eq!(doc.args_hash(), job.args_hash());
    }

    #[test]
    fn serialised_fields_match_property_table() {
        let job = new_job("demo.Job", json!({}));
        let origin = Origin {
            at: Utc::now(),
            hostname: "h".to_string(),
            username: "u".to_string(),
        };
        let doc = JobDocument::from_new(JobId(1), &job, &origin);
        let value = serde_json::to_value(&doc).unwrap();
        let keys: BTreeSet<&str> = value.as_object().unwrap().keys().map(|k| k.as_str()).collect();
        let expected: BTreeSet<&str> = serialised_properties().collect();
        assert_eq!(keys, expected);
    }

    #[test]
    fn transition_rejects_illegal_edge() {
        let job = new_job("demo.Job", json!({}));
        let origin = Origin {
            at: Utc::now(),
            hostname: "h".to_string(),
            username: "u".to_string(),
        };
        let mut doc = JobDocument::from_new(JobId(1), &job, &origin);
        assert!(doc.transition(JobState::Complete).is_err());
        doc.transition(JobState::Running).unwrap();
        doc.transition(JobState::Complete).unwrap();
        assert!(doc.transition(JobState::Running).is_err());
    }

    #[test]
    fn project_is_first_name_segment() {
        assert_eq!(project_of("jobhive.jobs.DummyJob"), "jobhive");
        assert_eq!(project_of("standalone"), "standalone");
    }

    #[test]
    fn job_id_parses() {
        assert_eq!("42".parse::<JobId>().unwrap(), JobId(42));
        assert!("x".parse::<JobId>().is_err());
    }
}
