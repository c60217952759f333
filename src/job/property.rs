//! Job property table and the defaults cascade.
//!
//! Every job property is classified along four independent axes: whether it
//! can be set when enqueuing, in the configuration, as a type-level constant
//! at registration, and whether it is persisted with the job document.
//! [`PROPERTIES`] is the single source of truth for these axes.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{QueueError, Result};
use crate::scheduler::cron::CronSchedule;

pub const ENQUEUE: u8 = 0b0001;
pub const CONFIG: u8 = 0b0010;
pub const CLASS: u8 = 0b0100;
pub const SERIALISE: u8 = 0b1000;

const ALL_INPUTS: u8 = ENQUEUE | CONFIG | CLASS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertySpec {
    pub name: &'static str,
    axes: u8,
}

impl PropertySpec {
    const fn new(name: &'static str, axes: u8) -> Self {
        Self { name, axes }
    }

    pub fn enqueue(&self) -> bool {
        self.axes & ENQUEUE != 0
    }

    pub fn config(&self) -> bool {
        self.axes & CONFIG != 0
    }

    pub fn class(&self) -> bool {
        self.axes & CLASS != 0
    }

    pub fn serialise(&self) -> bool {
        self.axes & SERIALISE != 0
    }
}

pub const PROPERTIES: &[PropertySpec] = &[
    PropertySpec::new("id", SERIALISE),
    PropertySpec::new("args", ENQUEUE | SERIALISE),
    PropertySpec::new("args_hash", SERIALISE),
    PropertySpec::new("attempts", ALL_INPUTS | SERIALISE),
    PropertySpec::new("attempts_left", SERIALISE),
    PropertySpec::new("author", CLASS),
    PropertySpec::new("chain", ALL_INPUTS | SERIALISE),
    PropertySpec::new("defer_max", ALL_INPUTS | SERIALISE),
    PropertySpec::new("defer_time", ALL_INPUTS | SERIALISE),
    PropertySpec::new("dependency", ALL_INPUTS | SERIALISE),
    PropertySpec::new("enqueued", SERIALISE),
    PropertySpec::new("error_time", ALL_INPUTS | SERIALISE),
    PropertySpec::new("finished_at", SERIALISE),
    PropertySpec::new("force", ALL_INPUTS | SERIALISE),
    PropertySpec::new("hidden", CONFIG | CLASS),
    PropertySpec::new("inactive_at", SERIALISE),
    PropertySpec::new("killed_at", SERIALISE),
    PropertySpec::new("last_error", SERIALISE),
    PropertySpec::new("locked", SERIALISE),
    PropertySpec::new("max_parallel", ALL_INPUTS | SERIALISE),
    PropertySpec::new("name", SERIALISE),
    PropertySpec::new("nodes", ALL_INPUTS | SERIALISE),
    PropertySpec::new("priority", ALL_INPUTS | SERIALISE),
    PropertySpec::new("progress_interval", ALL_INPUTS | SERIALISE),
    PropertySpec::new("query_at", SERIALISE),
    PropertySpec::new("removed_at", SERIALISE),
    PropertySpec::new("runtime", SERIALISE),
    PropertySpec::new("schedule", CONFIG | CLASS),
    PropertySpec::new("started_at", SERIALISE),
    PropertySpec::new("state", SERIALISE),
    PropertySpec::new("tag", CONFIG | CLASS),
    PropertySpec::new("trial", SERIALISE),
    PropertySpec::new("wall_at", SERIALISE),
    PropertySpec::new("wall_time", ALL_INPUTS | SERIALISE),
    PropertySpec::new("zombie_at", SERIALISE),
    PropertySpec::new("zombie_time", ALL_INPUTS | SERIALISE),
];

pub fn property(name: &str) -> Option<&'static PropertySpec> {
    PROPERTIES.iter().find(|p| p.name == name)
}

/// Names of all persisted properties, in table order.
pub fn serialised_properties() -> impl Iterator<Item = &'static str> {
    PROPERTIES.iter().filter(|p| p.serialise()).map(|p| p.name)
}

/// One layer of the defaults cascade. `None` leaves the lower layer in place.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JobOverrides {
    pub attempts: Option<u32>,
    pub chain: Option<Vec<String>>,
    pub defer_max: Option<u64>,
    pub defer_time: Option<u64>,
    pub dependency: Option<Vec<String>>,
    pub error_time: Option<u64>,
    pub force: Option<bool>,
    pub hidden: Option<bool>,
    pub max_parallel: Option<u32>,
    pub nodes: Option<Vec<String>>,
    pub priority: Option<i32>,
    pub progress_interval: Option<u64>,
    pub schedule: Option<String>,
    pub tag: Option<Vec<String>>,
    pub wall_time: Option<u64>,
    pub zombie_time: Option<u64>,
}

macro_rules! overlay {
    ($low:expr, $high:expr, $($field:ident),+ $(,)?) => {
        JobOverrides {
            $($field: $high.$field.clone().or_else(|| $low.$field.clone()),)+
        }
    };
}

impl JobOverrides {
    /// Built-in defaults, the bottom of every cascade.
    pub fn builtin() -> Self {
        Self {
            attempts: Some(1),
            chain: Some(Vec::new()),
            defer_max: Some(60 * 60),
            defer_time: Some(5 * 60),
            dependency: Some(Vec::new()),
            error_time: Some(10 * 60),
            force: Some(false),
            hidden: Some(false),
            max_parallel: None,
            nodes: Some(Vec::new()),
            priority: Some(0),
            progress_interval: Some(5),
            schedule: None,
            tag: Some(Vec::new()),
            wall_time: None,
            zombie_time: Some(30 * 60),
        }
    }

    /// Returns `self` with every field set in `higher` replaced.
    pub fn overlay(&self, higher: &JobOverrides) -> JobOverrides {
        overlay!(
            self,
            higher,
            attempts,
            chain,
            defer_max,
            defer_time,
            dependency,
            error_time,
            force,
            hidden,
            max_parallel,
            nodes,
            priority,
            progress_interval,
            schedule,
            tag,
            wall_time,
            zombie_time,
        )
    }

    /// Splits enqueue parameters into property overrides and job arguments.
    ///
    /// Keys naming an enqueue-settable property become overrides, keys naming
    /// any other property are rejected, everything else is a job argument.
    /// An `args` object is merged into the arguments.
    pub fn from_enqueue_params(params: Map<String, Value>) -> Result<(Self, Map<String, Value>)> {
        let mut props = Map::new();
        let mut args = Map::new();
        for (key, value) in params {
            match property(&key) {
                Some(spec) if spec.name == "args" => match value {
                    Value::Object(extra) => args.extend(extra),
                    Value::Null => {}
                    other => {
                        return Err(QueueError::validation(format!(
                            "[args] expected object, got {}",
                            other
                        )))
                    }
                },
                Some(spec) if spec.enqueue() => {
                    props.insert(key, value);
                }
                Some(spec) => {
                    return Err(QueueError::validation(format!(
                        "property [{}] cannot be set at enqueue time",
                        spec.name
                    )))
                }
                None => {
                    args.insert(key, value);
                }
            }
        }
        let overrides = serde_json::from_value(Value::Object(props))
            .map_err(|e| QueueError::validation(format!("invalid enqueue property: {}", e)))?;
        Ok((overrides, args))
    }
}

/// Fully resolved properties of one job, produced once at enqueue time.
#[derive(Debug, Clone, PartialEq)]
pub struct JobProperties {
    pub attempts: u32,
    pub chain: Vec<String>,
    pub defer_max: u64,
    pub defer_time: u64,
    pub dependency: Vec<String>,
    pub error_time: u64,
    pub force: bool,
    pub hidden: bool,
    pub max_parallel: Option<u32>,
    pub nodes: Vec<String>,
    pub priority: i32,
    pub progress_interval: u64,
    pub schedule: Option<String>,
    pub tag: Vec<String>,
    pub wall_time: Option<u64>,
    pub zombie_time: u64,
}

impl JobProperties {
    /// Applies `layers` (lowest precedence first) on top of the built-in
    /// defaults and validates the result.
    pub fn resolve(layers: &[&JobOverrides]) -> Result<Self> {
        // the built-in layer sets every non-optional field, so no default
        // below ever applies
        let merged = layers
            .iter()
            .fold(JobOverrides::builtin(), |acc, layer| acc.overlay(layer));
        let props = Self {
            attempts: merged.attempts.unwrap_or_default(),
            chain: merged.chain.unwrap_or_default(),
            defer_max: merged.defer_max.unwrap_or_default(),
            defer_time: merged.defer_time.unwrap_or_default(),
            dependency: merged.dependency.unwrap_or_default(),
            error_time: merged.error_time.unwrap_or_default(),
            force: merged.force.unwrap_or_default(),
            hidden: merged.hidden.unwrap_or_default(),
            max_parallel: merged.max_parallel,
            nodes: merged.nodes.unwrap_or_default(),
            priority: merged.priority.unwrap_or_default(),
            progress_interval: merged.progress_interval.unwrap_or_default(),
            schedule: merged.schedule,
            tag: merged.tag.unwrap_or_default(),
            wall_time: merged.wall_time,
            zombie_time: merged.zombie_time.unwrap_or_default(),
        };
        props.validate()?;
        Ok(props)
    }

    pub fn validate(&self) -> Result<()> {
        is_gt0("attempts", self.attempts as u64)?;
        is_gt0("defer_max", self.defer_max)?;
        is_gt0("defer_time", self.defer_time)?;
        is_gt0("error_time", self.error_time)?;
        is_gt0("progress_interval", self.progress_interval)?;
        is_gt0("zombie_time", self.zombie_time)?;
        if let Some(n) = self.max_parallel {
            is_gt0("max_parallel", n as u64)?;
        }
        if let Some(t) = self.wall_time {
            is_gt0("wall_time", t)?;
        }
        for (key, list) in [
            ("nodes", &self.nodes),
            ("chain", &self.chain),
            ("dependency", &self.dependency),
            ("tag", &self.tag),
        ] {
            if list.iter().any(|s| s.trim().is_empty()) {
                return Err(QueueError::validation(format!(
                    "[{}] expected list of non-empty str",
                    key
                )));
            }
        }
        if let Some(schedule) = &self.schedule {
            CronSchedule::parse(schedule).map_err(|e| {
                QueueError::validation(format!("[schedule] invalid cron: {}", e))
            })?;
        }
        Ok(())
    }

    /// The enqueue-settable subset, used to carry a job forward on restart.
    pub fn enqueue_overrides(&self) -> JobOverrides {
        JobOverrides {
            attempts: Some(self.attempts),
            chain: Some(self.chain.clone()),
            defer_max: Some(self.defer_max),
            defer_time: Some(self.defer_time),
            dependency: Some(self.dependency.clone()),
            error_time: Some(self.error_time),
            force: Some(self.force),
            hidden: None,
            max_parallel: self.max_parallel,
            nodes: Some(self.nodes.clone()),
            priority: Some(self.priority),
            progress_interval: Some(self.progress_interval),
            schedule: None,
            tag: None,
            wall_time: self.wall_time,
            zombie_time: Some(self.zombie_time),
        }
    }
}

fn is_gt0(key: &str, value: u64) -> Result<()> {
    if value == 0 {
        return Err(QueueError::validation(format!("[{}] > 0 expected", key)));
    }
    Ok(())
}
