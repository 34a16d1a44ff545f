//! Key=value configuration.
//!
//! WideFM is configured by a list of `key=value` pairs assembled from an
//! optional config file plus trailing command-line arguments (later entries
//! win). Every component consumes the keys it understands and leaves the
//! rest; whatever survives all components is reported with a warning and
//! otherwise ignored, so a config file can carry keys for several learners
//! at once.
//!
//! # Example
//!
//! ```
//! use widefm_core::KwArgs;
//!
//! let mut kw = KwArgs::from_args(["lr=0.1", "batch_size=64"].iter());
//! let lr: f32 = kw.take_or("lr", 0.01).unwrap();
//! assert_eq!(lr, 0.1);
//! assert_eq!(kw.remaining().len(), 1);
//! ```

use std::path::Path;
use std::str::FromStr;

use tracing::warn;

use crate::error::{CoreError, Result};

/// An ordered list of key=value configuration pairs.
#[derive(Debug, Clone, Default)]
pub struct KwArgs {
    pairs: Vec<(String, String)>,
}

impl KwArgs {
    /// Creates an empty argument list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a config file of `key = value` lines.
    ///
    /// Blank lines and lines starting with `#` are ignored; text after an
    /// inline `#` is treated as a comment.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut kw = Self::new();
        for line in text.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            if let Some((k, v)) = line.split_once('=') {
                kw.push(k.trim(), v.trim());
            } else {
                warn!("ignoring malformed config line: `{}`", line);
            }
        }
        Ok(kw)
    }

    /// Parses `key=value` strings, e.g. trailing command-line arguments.
    pub fn from_args<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut kw = Self::new();
        for arg in args {
            let arg = arg.as_ref();
            if let Some((k, v)) = arg.split_once('=') {
                kw.push(k.trim(), v.trim());
            } else {
                warn!("ignoring malformed argument: `{}`", arg);
            }
        }
        kw
    }

    /// Appends one pair.
    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.pairs.push((key.into(), value.into()));
    }

    /// Appends every pair of `other`; `other`'s values win on later reads.
    pub fn extend(&mut self, other: KwArgs) {
        self.pairs.extend(other.pairs);
    }

    /// Removes every occurrence of `key` and returns the last value.
    pub fn take(&mut self, key: &str) -> Option<String> {
        let mut last = None;
        self.pairs.retain(|(k, v)| {
            if k == key {
                last = Some(v.clone());
                false
            } else {
                true
            }
        });
        last
    }

    /// Removes `key` and parses its last value, or returns `default`.
    ///
    /// Booleans accept `true`/`false` as well as `1`/`0`.
    pub fn take_or<T>(&mut self, key: &str, default: T) -> Result<T>
    where
        T: FromStr + FromKwValue,
    {
        match self.take(key) {
            Some(raw) => T::from_kw_value(key, &raw),
            None => Ok(default),
        }
    }

    /// Removes `key` and parses it, erroring when absent.
    pub fn take_required<T>(&mut self, key: &str) -> Result<T>
    where
        T: FromStr + FromKwValue,
    {
        match self.take(key) {
            Some(raw) => T::from_kw_value(key, &raw),
            None => Err(CoreError::MissingConfig(key.to_string())),
        }
    }

    /// The pairs no component has consumed yet.
    pub fn remaining(&self) -> &[(String, String)] {
        &self.pairs
    }

    /// Logs one warning per unconsumed key.
    pub fn warn_unknown(&self, context: &str) {
        for (k, v) in &self.pairs {
            warn!("unrecognized option for {}: {} = {}", context, k, v);
        }
    }
}

/// Parsing hook that lets booleans accept `0`/`1` besides `FromStr`.
pub trait FromKwValue: Sized {
    /// Parses `raw` for config key `key`.
    fn from_kw_value(key: &str, raw: &str) -> Result<Self>;
}

macro_rules! impl_from_kw_value {
    ($($t:ty => $name:literal),* $(,)?) => {
        $(impl FromKwValue for $t {
            fn from_kw_value(key: &str, raw: &str) -> Result<Self> {
                raw.parse().map_err(|_| CoreError::BadConfigValue {
                    key: key.to_string(),
                    value: raw.to_string(),
                    expected: $name,
                })
            }
        })*
    };
}

impl_from_kw_value!(
    i32 => "an integer",
    i64 => "an integer",
    u32 => "an unsigned integer",
    u64 => "an unsigned integer",
    usize => "an unsigned integer",
    f32 => "a number",
    f64 => "a number",
    String => "a string",
);

impl FromKwValue for bool {
    fn from_kw_value(key: &str, raw: &str) -> Result<Self> {
        match raw {
            "1" => Ok(true),
            "0" => Ok(false),
            _ => raw.parse().map_err(|_| CoreError::BadConfigValue {
                key: key.to_string(),
                value: raw.to_string(),
                expected: "a boolean",
            }),
        }
    }
}
