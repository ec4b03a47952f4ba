//! Stream identifiers.
//!
//! A stream id names a `Group` and, optionally, one `Entity` inside it.
//! Its textual form is `"group-entity"` or just `"group"`. The group is
//! everything before the first `-`, so entities may themselves contain dashes.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Separator between group and entity in the textual form.
const SEPARATOR: char = '-';

/// Identifier of an entity stream or a whole group stream.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId {
    group: String,
    entity: Option<String>,
}

impl StreamId {
    /// Stream of a single entity within a group.
    pub fn new(group: impl Into<String>, entity: impl Into<String>) -> Self {
        let entity = entity.into();
        Self {
            group: group.into(),
            entity: if entity.is_empty() { None } else { Some(entity) },
        }
    }

    /// Merged stream of every entity in `group`.
    pub fn group(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            entity: None,
        }
    }

    /// Parse the textual form.
    pub fn parse(s: &str) -> Result<Self> {
        let (group, entity) = match s.split_once(SEPARATOR) {
            Some((group, entity)) => (group, entity),
            None => (s, ""),
        };

        if group.is_empty() {
            return Err(Error::InvalidStreamId(s.to_string()));
        }

        Ok(Self::new(group, entity))
    }

    pub fn group_name(&self) -> &str {
        &self.group
    }

    pub fn entity(&self) -> Option<&str> {
        self.entity.as_deref()
    }

    /// True when this id addresses one entity's own sequence.
    pub fn is_entity(&self) -> bool {
        self.entity.is_some()
    }

    /// True when both ids belong to the same group.
    pub fn same_group(&self, other: &StreamId) -> bool {
        self.group == other.group
    }

    /// The group-wide stream this id belongs to.
    pub fn to_group(&self) -> StreamId {
        StreamId::group(self.group.clone())
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.entity {
            Some(entity) => write!(f, "{}{}{}", self.group, SEPARATOR, entity),
            None => write!(f, "{}", self.group),
        }
    }
}

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamId({})", self)
    }
}

impl FromStr for StreamId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
