use std::{fmt, str::FromStr};

use rand::{seq::SliceRandom, Rng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest label a DNS name allows; the id is used as a preview subdomain.
pub const MAX_PROJECT_ID_LEN: usize = 63;

const ADJECTIVES: &[&str] = &[
    "amber", "ancient", "bold", "brave", "breezy", "bright", "calm", "clever", "cosmic", "crisp",
    "curly", "daring", "dusty", "eager", "early", "fancy", "fluffy", "gentle", "giant", "golden",
    "happy", "hidden", "honest", "icy", "jolly", "kind", "lively", "lucky", "mellow", "misty",
    "nimble", "noisy", "patient", "plain", "polite", "proud", "quick", "quiet", "rapid", "rusty",
    "shiny", "silent", "silly", "sleepy", "smooth", "snowy", "sunny", "swift", "tidy", "witty",
];

const NOUNS: &[&str] = &[
    "anchor", "apple", "badger", "beacon", "breeze", "canyon", "cedar", "comet", "coral", "crane",
    "delta", "dolphin", "ember", "falcon", "fern", "forest", "garden", "glacier", "harbor",
    "heron", "island", "jungle", "kettle", "lagoon", "lantern", "meadow", "meteor", "otter",
    "panda", "pebble", "pepper", "planet", "puffin", "quartz", "raven", "reef", "river", "rocket",
    "sparrow", "summit", "thunder", "tiger", "tulip", "valley", "violet", "walrus", "willow",
    "window", "yak", "zephyr",
];

/// Identifier of one deployment.
///
/// Always a valid DNS label (`[a-z0-9-]`, no leading or trailing hyphen, at
/// most 63 bytes), so it can name both the log channel and the preview host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProjectId(String);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProjectIdError {
    #[error("project id must not be empty")]
    Empty,
    #[error("project id is {len} characters long; the limit is 63")]
    TooLong { len: usize },
    #[error("project id contains invalid character {0:?}; use a-z, 0-9 and '-'")]
    InvalidCharacter(char),
    #[error("project id must not start or end with '-'")]
    EdgeHyphen,
}

impl ProjectId {
    /// Validates a caller-supplied id. Surrounding whitespace is trimmed and
    /// ASCII letters are lowercased before validation.
    pub fn parse(raw: &str) -> Result<Self, ProjectIdError> {
        let candidate = raw.trim().to_ascii_lowercase();
        if candidate.is_empty() {
            return Err(ProjectIdError::Empty);
        }
        if candidate.len() > MAX_PROJECT_ID_LEN {
            return Err(ProjectIdError::TooLong {
                len: candidate.len(),
            });
        }
        if let Some(bad) = candidate
            .chars()
            .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-'))
        {
            return Err(ProjectIdError::InvalidCharacter(bad));
        }
        if candidate.starts_with('-') || candidate.ends_with('-') {
            return Err(ProjectIdError::EdgeHyphen);
        }
        Ok(Self(candidate))
    }

    /// Random `adjective-adjective-noun` slug.
    pub fn generate() -> Self {
        Self::generate_with(&mut rand::thread_rng())
    }

    pub fn generate_with<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let mut adjectives = ADJECTIVES.choose_multiple(rng, 2);
        let first = adjectives.next().copied().unwrap_or("quiet");
        let second = adjectives.next().copied().unwrap_or("swift");
        let noun = NOUNS.choose(rng).copied().unwrap_or("harbor");
        Self(format!("{first}-{second}-{noun}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Bus channel the worker for this project publishes its logs to.
    pub fn log_channel(&self) -> String {
        log_relay::log_channel(&self.0)
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ProjectId {
    type Err = ProjectIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ProjectId {
    type Error = ProjectIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ProjectId> for String {
    fn from(value: ProjectId) -> Self {
        value.0
    }
}
