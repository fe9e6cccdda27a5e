//! Support for library configuration options

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Duration;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Files kept in [`Settings::data_dir`]
pub const CACHE_TABLE_FILE: &str = "cache.json";
pub const CACHE_META_FILE: &str = "cache_meta.json";
pub const ALARM_TABLE_FILE: &str = "alarms.json";
pub const ALARM_META_FILE: &str = "alarm_meta.json";

/// How long a snoozed alarm waits before firing again.
/// This is a user preference: feel free to override it when initing this library.
pub static SNOOZE_DURATION: Lazy<Arc<Mutex<Duration>>> = Lazy::new(|| Arc::new(Mutex::new(Duration::minutes(5))));

/// The current value of [`SNOOZE_DURATION`]
pub fn snooze_duration() -> Duration {
    *SNOOZE_DURATION.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Override [`SNOOZE_DURATION`]
pub fn set_snooze_duration(duration: Duration) {
    *SNOOZE_DURATION.lock().unwrap_or_else(PoisonError::into_inner) = duration;
}


/// Settings shared by both managers
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Where tables and meta rows are persisted. `None` keeps everything in memory
    pub data_dir: Option<PathBuf>,
    #[serde(with = "seconds")]
    pub meta_lock_timeout: Duration,
    pub cache: CacheSettings,
    pub alarm: AlarmSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: None,
            meta_lock_timeout: Duration::seconds(5),
            cache: CacheSettings::default(),
            alarm: AlarmSettings::default(),
        }
    }
}

impl Settings {
    /// Settings that persist in `data_dir`
    pub fn in_dir(data_dir: &Path) -> Self {
        Self { data_dir: Some(data_dir.to_path_buf()), ..Self::default() }
    }

    /// Read settings from a JSON file. Missing keys take their default value
    pub fn from_file(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Ok(serde_json::from_reader(file)?)
    }

    pub fn data_file(&self, name: &str) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join(name))
    }
}


/// Window policy and limits of the occurrence cache
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// How far ahead of now the window should reach
    #[serde(with = "seconds")]
    pub look_forward: Duration,
    /// How far behind now the window should reach
    #[serde(with = "seconds")]
    pub look_back: Duration,
    /// Hard cap on the window length
    #[serde(with = "seconds")]
    pub max_size: Duration,
    /// A request closer than this to the end of the window extends it
    #[serde(with = "seconds")]
    pub min_padding_forward: Duration,
    /// A request closer than this to the start of the window extends it
    #[serde(with = "seconds")]
    pub min_padding_back: Duration,
    /// Step used for those extensions
    #[serde(with = "seconds")]
    pub increment: Duration,
    /// Range looked at by "next objects" requests
    #[serde(with = "seconds")]
    pub next_objects_horizon: Duration,
    #[serde(with = "seconds")]
    pub blocking_timeout: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            look_forward: Duration::weeks(10),
            look_back: Duration::weeks(5),
            max_size: Duration::weeks(26),
            min_padding_forward: Duration::weeks(5),
            min_padding_back: Duration::weeks(5),
            increment: Duration::weeks(5),
            next_objects_horizon: Duration::days(7),
            blocking_timeout: Duration::seconds(20),
        }
    }
}


/// Limits of the alarm queue
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlarmSettings {
    /// How far ahead alarm triggers are expanded
    #[serde(with = "seconds")]
    pub lookahead: Duration,
    /// How far back a full rebuild looks for triggers that have just passed
    #[serde(with = "seconds")]
    pub rebuild_lookback: Duration,
    /// Rows whose time to fire is older than this are purged
    #[serde(with = "seconds")]
    pub retention: Duration,
    /// A dismissal this recent moves the start of the trigger search past it
    #[serde(with = "seconds")]
    pub dismissal_grace: Duration,
    /// `None` follows the process-wide [`SNOOZE_DURATION`]
    #[serde(with = "optional_seconds")]
    pub snooze: Option<Duration>,
    #[serde(with = "seconds")]
    pub blocking_timeout: Duration,
}

impl Default for AlarmSettings {
    fn default() -> Self {
        Self {
            lookahead: Duration::days(21),
            rebuild_lookback: Duration::seconds(300),
            retention: Duration::hours(24),
            dismissal_grace: Duration::seconds(30),
            snooze: None,
            blocking_timeout: Duration::seconds(20),
        }
    }
}

impl AlarmSettings {
    pub fn snooze_duration(&self) -> Duration {
        self.snooze.unwrap_or_else(snooze_duration)
    }
}

/// Converts a strictly positive chrono duration into a std one, for timeouts
pub(crate) fn to_std(duration: Duration) -> std::time::Duration {
    duration.to_std().unwrap_or_else(|_| std::time::Duration::from_secs(0))
}


/// Durations are stored as whole seconds in settings files
mod seconds {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(duration.num_seconds())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::seconds(i64::deserialize(deserializer)?))
    }
}

mod optional_seconds {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match duration {
            Some(d) => serializer.serialize_some(&d.num_seconds()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<i64>::deserialize(deserializer)?.map(Duration::seconds))
    }
}
