pub mod standings;

use crate::models::{BallotType, VoteRow};
use serde::Serialize;
use std::collections::BTreeMap;

pub use standings::render_summary;

/// candidate number -> votes
pub type Tally = BTreeMap<i32, i64>;

/// Nested view of a full scan: mayor totals across every village, and each
/// village's member race.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AggregatedResults {
    pub mayor: Tally,
    pub member: BTreeMap<i32, Tally>,
}

#[cfg(test)]
impl AggregatedResults {
    pub fn mayor_votes(&self, candidate_number: i32) -> i64 {
        self.mayor.get(&candidate_number).copied().unwrap_or(0)
    }

    pub fn member_votes(&self, village_number: i32, candidate_number: i32) -> i64 {
        self.member
            .get(&village_number)
            .and_then(|tally| tally.get(&candidate_number))
            .copied()
            .unwrap_or(0)
    }
}

/// Groups a flat row scan by ballot. Duplicate keys are summed; rows with an
/// unknown ballot tag are skipped. Input order does not matter.
pub fn aggregate(rows: &[VoteRow]) -> AggregatedResults {
    let mut results = AggregatedResults::default();

    for row in rows {
        match row.ballot() {
            Some(BallotType::Mayor) => {
                *results.mayor.entry(row.candidate_number).or_insert(0) += row.votes;
            }
            Some(BallotType::Member) => {
                *results
                    .member
                    .entry(row.village_number)
                    .or_default()
                    .entry(row.candidate_number)
                    .or_insert(0) += row.votes;
            }
            None => {}
        }
    }

    results
}
