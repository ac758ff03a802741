//! Moderator values and the code/label codebook
//!
//! The core treats moderators as opaque: a categorical value is a validated
//! level label, a continuous value is a number. Missing values are kept
//! explicit so exclusion can be counted rather than defaulted.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A coded moderator value on one record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ModeratorValue {
    /// Level label of a categorical moderator
    Categorical(String),
    /// Value of a continuous moderator
    Continuous(f64),
    /// Not reported / not codable
    Missing,
}

impl ModeratorValue {
    pub fn categorical(label: impl Into<String>) -> Self {
        Self::Categorical(label.into())
    }

    pub fn is_missing(&self) -> bool {
        match self {
            Self::Missing => true,
            Self::Continuous(x) => !x.is_finite(),
            Self::Categorical(_) => false,
        }
    }

    pub fn as_level(&self) -> Option<&str> {
        match self {
            Self::Categorical(label) => Some(label.as_str()),
            _ => None,
        }
    }

    pub fn as_continuous(&self) -> Option<f64> {
        match *self {
            Self::Continuous(x) if x.is_finite() => Some(x),
            _ => None,
        }
    }
}

impl fmt::Display for ModeratorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Categorical(label) => write!(f, "{label}"),
            Self::Continuous(x) => write!(f, "{x}"),
            Self::Missing => write!(f, "NA"),
        }
    }
}

/// One level of a categorical moderator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelCode {
    pub code: u32,
    pub label: String,
}

/// Declared type of a moderator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ModeratorKind {
    Categorical { levels: Vec<LevelCode> },
    Continuous,
}

/// Code/label mapping for every moderator of a coding scheme
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModeratorCodebook {
    moderators: BTreeMap<String, ModeratorKind>,
}

impl ModeratorCodebook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a categorical moderator from `(code, label)` pairs
    pub fn categorical<S: Into<String>>(
        mut self,
        name: impl Into<String>,
        levels: impl IntoIterator<Item = (u32, S)>,
    ) -> Result<Self> {
        let name = name.into();
        let levels: Vec<LevelCode> = levels
            .into_iter()
            .map(|(code, label)| LevelCode {
                code,
                label: label.into(),
            })
            .collect();
        if levels.is_empty() {
            return Err(Error::Configuration(format!(
                "categorical moderator `{name}` needs at least one level"
            )));
        }
        for (i, a) in levels.iter().enumerate() {
            if levels[i + 1..]
                .iter()
                .any(|b| b.code == a.code || b.label == a.label)
            {
                return Err(Error::Configuration(format!(
                    "moderator `{name}` has a duplicated code or label ({}, {})",
                    a.code, a.label
                )));
            }
        }
        self.moderators
            .insert(name, ModeratorKind::Categorical { levels });
        Ok(self)
    }

    /// Declare a continuous moderator
    pub fn continuous(mut self, name: impl Into<String>) -> Self {
        self.moderators.insert(name.into(), ModeratorKind::Continuous);
        self
    }

    pub fn kind(&self, name: &str) -> Option<&ModeratorKind> {
        self.moderators.get(name)
    }

    /// Map a numeric code to its canonical value
    pub fn decode(&self, name: &str, code: u32) -> Result<ModeratorValue> {
        match self.kind(name) {
            Some(ModeratorKind::Categorical { levels }) => levels
                .iter()
                .find(|l| l.code == code)
                .map(|l| ModeratorValue::Categorical(l.label.clone()))
                .ok_or_else(|| {
                    Error::InvalidInput(format!("code {code} is not a level of `{name}`"))
                }),
            Some(ModeratorKind::Continuous) => Err(Error::InvalidInput(format!(
                "`{name}` is continuous and has no codes"
            ))),
            None => Err(Error::InvalidInput(format!("unknown moderator `{name}`"))),
        }
    }

    /// Check that a value is legal for the declared moderator
    pub fn check(&self, name: &str, value: &ModeratorValue) -> Result<()> {
        match (self.kind(name), value) {
            (None, _) => Err(Error::InvalidInput(format!("unknown moderator `{name}`"))),
            (Some(_), ModeratorValue::Missing) => Ok(()),
            (Some(ModeratorKind::Categorical { levels }), ModeratorValue::Categorical(label)) => {
                if levels.iter().any(|l| &l.label == label) {
                    Ok(())
                } else {
                    Err(Error::InvalidInput(format!(
                        "`{label}` is not a level of `{name}`"
                    )))
                }
            }
            (Some(ModeratorKind::Continuous), ModeratorValue::Continuous(_)) => Ok(()),
            (Some(_), other) => Err(Error::InvalidInput(format!(
                "value {other} has the wrong type for `{name}`"
            ))),
        }
    }

    /// Validate every moderator value in a map
    pub fn check_all(&self, values: &BTreeMap<String, ModeratorValue>) -> Result<()> {
        values.iter().try_for_each(|(name, value)| self.check(name, value))
    }
}
