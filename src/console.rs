use crate::models::BallotType;
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    // "<candidate> <delta>", e.g. "1 +5", "98 -1"
    static ref TAP_RE: Regex = Regex::new(r"^(\d{1,3})\s+([+-]?\d{1,4})$").expect("tap pattern");
    static ref VILLAGE_RE: Regex = Regex::new(r"^v(?:illage)?\s+(\d{1,2})$").expect("village pattern");
    static ref BALLOT_RE: Regex = Regex::new(r"^b(?:allot)?\s+(mayor|member)$").expect("ballot pattern");
}

/// One line typed on the observer console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Tap { candidate_number: i32, delta: i64 },
    SelectVillage(i32),
    SelectBallot(BallotType),
    Status,
    Help,
    Quit,
}

pub const HELP: &str = "\
Commands:
  <candidate> <+/-n>    queue votes, e.g. `1 +1`, `2 +10`, `98 -1`
  v <village>           switch village (1-7)
  b mayor|member        switch ballot
  status                show pending and stored counts
  quit                  flush nothing more and exit";

pub fn parse_line(line: &str) -> Result<ConsoleCommand, String> {
    let line = line.trim().to_ascii_lowercase();

    match line.as_str() {
        "status" | "s" => return Ok(ConsoleCommand::Status),
        "help" | "h" | "?" => return Ok(ConsoleCommand::Help),
        "quit" | "q" | "exit" => return Ok(ConsoleCommand::Quit),
        _ => {}
    }

    if let Some(caps) = TAP_RE.captures(&line) {
        let candidate_number = caps[1]
            .parse::<i32>()
            .map_err(|e| format!("Bad candidate number: {}", e))?;
        let delta = caps[2].parse::<i64>().map_err(|e| format!("Bad vote change: {}", e))?;
        if delta == 0 {
            return Err("A vote change of zero does nothing".to_string());
        }
        return Ok(ConsoleCommand::Tap { candidate_number, delta });
    }

    if let Some(caps) = VILLAGE_RE.captures(&line) {
        let village = caps[1].parse::<i32>().map_err(|e| format!("Bad village number: {}", e))?;
        return Ok(ConsoleCommand::SelectVillage(village));
    }

    if let Some(caps) = BALLOT_RE.captures(&line) {
        return BallotType::parse(&caps[1])
            .map(ConsoleCommand::SelectBallot)
            .ok_or_else(|| format!("Unknown ballot '{}'", &caps[1]));
    }

    Err(format!("Unrecognized command '{}'. Type `help` for the list.", line))
}
