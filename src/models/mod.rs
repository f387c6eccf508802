use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const VILLAGE_COUNT: i32 = 7;

// Mayor rows may be recorded without a polling village
pub const VILLAGE_NOT_APPLICABLE: i32 = 0;

// Reserved candidate numbers, counted but never leading
pub const SPOILED_BALLOT: i32 = 98;
pub const ABSTENTION: i32 = 99;

pub fn is_sentinel(candidate_number: i32) -> bool {
    candidate_number == SPOILED_BALLOT || candidate_number == ABSTENTION
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BallotType {
    Mayor,
    Member,
}

impl BallotType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BallotType::Mayor => "mayor",
            BallotType::Member => "member",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "mayor" => Some(BallotType::Mayor),
            "member" => Some(BallotType::Member),
            _ => None,
        }
    }
}

impl fmt::Display for BallotType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one counter in the store: `(village, ballot, candidate)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VoteKey {
    pub village_number: i32,
    pub ballot_type: BallotType,
    pub candidate_number: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("malformed vote key '{0}'")]
    Format(String),
    #[error("unknown ballot type '{0}'")]
    BallotType(String),
    #[error("village {0} is out of range")]
    Village(i32),
    #[error("candidate {0} is not valid")]
    Candidate(i32),
}

impl VoteKey {
    pub fn new(village_number: i32, ballot_type: BallotType, candidate_number: i32) -> Result<Self, KeyError> {
        let key = Self {
            village_number,
            ballot_type,
            candidate_number,
        };
        key.validate()?;
        Ok(key)
    }

    pub fn mayor(village_number: i32, candidate_number: i32) -> Result<Self, KeyError> {
        Self::new(village_number, BallotType::Mayor, candidate_number)
    }

    pub fn member(village_number: i32, candidate_number: i32) -> Result<Self, KeyError> {
        Self::new(village_number, BallotType::Member, candidate_number)
    }

    fn validate(&self) -> Result<(), KeyError> {
        let lowest_village = match self.ballot_type {
            BallotType::Mayor => VILLAGE_NOT_APPLICABLE,
            BallotType::Member => 1,
        };
        if self.village_number < lowest_village || self.village_number > VILLAGE_COUNT {
            return Err(KeyError::Village(self.village_number));
        }
        if self.candidate_number < 1 {
            return Err(KeyError::Candidate(self.candidate_number));
        }
        Ok(())
    }
}

impl fmt::Display for VoteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.village_number, self.ballot_type, self.candidate_number)
    }
}

// Format: <village>-<ballot>-<candidate>, e.g. "3-member-98"
impl FromStr for VoteKey {
    type Err = KeyError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = raw.trim().split('-').collect();
        if parts.len() != 3 {
            return Err(KeyError::Format(raw.to_string()));
        }
        let village_number = parts[0]
            .parse::<i32>()
            .map_err(|_| KeyError::Format(raw.to_string()))?;
        let ballot_type = BallotType::parse(parts[1]).ok_or_else(|| KeyError::BallotType(parts[1].to_string()))?;
        let candidate_number = parts[2]
            .parse::<i32>()
            .map_err(|_| KeyError::Format(raw.to_string()))?;
        VoteKey::new(village_number, ballot_type, candidate_number)
    }
}

/// One persisted counter. `ballot_type` stays a raw tag so rows written by
/// other clients with unknown tags can still be read and skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRow {
    pub village_number: i32,
    pub ballot_type: String,
    pub candidate_number: i32,
    pub votes: i64,
    pub updated_at: DateTime<Utc>,
}

impl VoteRow {
    pub fn new(key: VoteKey, votes: i64, updated_at: DateTime<Utc>) -> Self {
        Self {
            village_number: key.village_number,
            ballot_type: key.ballot_type.as_str().to_string(),
            candidate_number: key.candidate_number,
            votes,
            updated_at,
        }
    }

    pub fn ballot(&self) -> Option<BallotType> {
        BallotType::parse(&self.ballot_type)
    }

    pub fn key(&self) -> Option<VoteKey> {
        self.ballot().map(|ballot_type| VoteKey {
            village_number: self.village_number,
            ballot_type,
            candidate_number: self.candidate_number,
        })
    }
}
