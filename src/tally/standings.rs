use super::{AggregatedResults, Tally};
use crate::models::{ABSTENTION, SPOILED_BALLOT, is_sentinel};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateShare {
    pub candidate_number: i32,
    // Clamped to zero for display
    pub votes: i64,
    pub percent: f64,
}

/// Display-ready view of one race.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Standing {
    pub candidates: Vec<CandidateShare>,
    pub total_valid: i64,
    pub leader: Option<i32>,
    pub spoiled: i64,
    pub abstained: i64,
}

impl Standing {
    pub fn from_tally(tally: &Tally) -> Self {
        let clamped = |candidate: i32| tally.get(&candidate).copied().unwrap_or(0).max(0);

        let contenders: Vec<(i32, i64)> = tally
            .keys()
            .copied()
            .filter(|candidate| !is_sentinel(*candidate))
            .map(|candidate| (candidate, clamped(candidate)))
            .collect();

        let total_valid: i64 = contenders.iter().map(|(_, votes)| votes).sum();

        // Keys are ascending, so a strict comparison keeps the lowest number on ties
        let mut leader: Option<(i32, i64)> = None;
        for &(candidate, votes) in &contenders {
            if votes > 0 && leader.is_none_or(|(_, best)| votes > best) {
                leader = Some((candidate, votes));
            }
        }

        let candidates = contenders
            .iter()
            .map(|&(candidate_number, votes)| CandidateShare {
                candidate_number,
                votes,
                percent: if total_valid > 0 {
                    votes as f64 * 100.0 / total_valid as f64
                } else {
                    0.0
                },
            })
            .collect();

        Self {
            candidates,
            total_valid,
            leader: leader.map(|(candidate, _)| candidate),
            spoiled: clamped(SPOILED_BALLOT),
            abstained: clamped(ABSTENTION),
        }
    }

    pub fn is_leading(&self, candidate_number: i32) -> bool {
        self.leader == Some(candidate_number)
    }
}

fn render_standing(out: &mut String, standing: &Standing) {
    if standing.candidates.is_empty() {
        out.push_str("  No votes recorded yet.\n");
    }
    for share in &standing.candidates {
        let line = if standing.is_leading(share.candidate_number) {
            format!("  **#{}**: {} votes ({:.1}%) - leading\n", share.candidate_number, share.votes, share.percent)
        } else {
            format!("  #{}: {} votes ({:.1}%)\n", share.candidate_number, share.votes, share.percent)
        };
        out.push_str(&line);
    }
    out.push_str(&format!(
        "  Valid: {}  Spoiled: {}  No vote: {}\n",
        standing.total_valid, standing.spoiled, standing.abstained
    ));
}

/// Plain-text summary of both races, one block per village for members.
pub fn render_summary(results: &AggregatedResults) -> String {
    let mut summary = String::new();

    summary.push_str("Mayor\n");
    render_standing(&mut summary, &Standing::from_tally(&results.mayor));

    for (village_number, tally) in &results.member {
        summary.push_str(&format!("\nMember, village {}\n", village_number));
        render_standing(&mut summary, &Standing::from_tally(tally));
    }

    summary
}
