//! Custom image tag patterns.
//!
//! A pattern such as `build-{x}` contains exactly one `{x}`, replaced by a
//! per-entity counter each time a stage produces an image.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::{Error, Result};

/// Custom-tag entity key of pre-CD stages; the entity value is the pipeline id.
pub const ENTITY_PRE_CD: i64 = 3;
/// Custom-tag entity key of post-CD stages.
pub const ENTITY_POST_CD: i64 = 4;

const COUNTER: &str = "{x}";

// Docker tag grammar
static TAG_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.\-]{0,127}$").unwrap());

/// A validated tag pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TagPattern(String);

impl TagPattern {
    pub fn parse(pattern: &str) -> Result<Self> {
        let pattern = pattern.trim();
        if pattern.matches(COUNTER).count() != 1 {
            return Err(Error::InvalidInput(format!(
                "tag pattern {pattern} must contain {{x}} exactly once"
            )));
        }
        // Check the literal parts with a sample counter.
        validate_tag(&pattern.replace(COUNTER, "0"))?;
        Ok(Self(pattern.to_string()))
    }

    /// Render the tag for `counter`. Negative counters are rejected.
    pub fn render(&self, counter: i64) -> Result<String> {
        if counter < 0 {
            return Err(Error::InvalidInput(format!(
                "value of {{x}} cannot be negative: {counter}"
            )));
        }
        let tag = self.0.replace(COUNTER, &counter.to_string());
        validate_tag(&tag)?;
        Ok(tag)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TagPattern {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        TagPattern::parse(&value)
    }
}

impl From<TagPattern> for String {
    fn from(p: TagPattern) -> Self {
        p.0
    }
}

/// Reject tags a registry would refuse.
pub fn validate_tag(tag: &str) -> Result<()> {
    if TAG_REGEX.is_match(tag) {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!("invalid image tag: {tag}")))
    }
}

/// Counter state of a custom tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomTag {
    pub id: i64,
    pub entity_key: i64,
    pub entity_value: String,
    pub tag_pattern: String,
    /// Value `{x}` takes on the next use.
    pub auto_increasing_number: i64,
    pub enabled: bool,
}

/// Result of reserving image paths for a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservedImages {
    pub tag: String,
    pub paths: Vec<String>,
    pub reservation_ids: Vec<crate::ReservationId>,
}
