use crate::models::{CandidateRoundResult, ElectionRound, RoundAction};
use log::debug;
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TabulationError {
    #[error("cannot tabulate an election without candidates")]
    NoCandidates,
    #[error("ballot ranks unknown candidate {0}")]
    UnknownCandidate(String),
}

type Tally<'a> = BTreeMap<&'a str, u64>;

/// Runs instant-runoff over full rankings, returning every round, earliest first.
pub fn tabulate(
    candidates: &[String],
    ballots: &[Vec<String>],
) -> Result<Vec<ElectionRound>, TabulationError> {
    tabulate_with_rng(candidates, ballots, &mut rand::thread_rng())
}

/// Same as [`tabulate`], drawing tie-breaks from `rng`.
///
/// Each round counts first choices among the candidates still running. A candidate
/// holding strictly more than half of the live ballots wins. An exact half split
/// between the last two candidates is settled uniformly at random. Otherwise the
/// candidate with the fewest first choices is eliminated (ties go to the smallest
/// business id), struck from every ballot, and the next round is counted.
pub fn tabulate_with_rng<R: Rng>(
    candidates: &[String],
    ballots: &[Vec<String>],
    rng: &mut R,
) -> Result<Vec<ElectionRound>, TabulationError> {
    let mut active: BTreeSet<&str> = candidates.iter().map(String::as_str).collect();
    if active.is_empty() {
        return Err(TabulationError::NoCandidates);
    }

    let mut live: Vec<Vec<&str>> = Vec::with_capacity(ballots.len());
    for ballot in ballots {
        if let Some(unknown) = ballot.iter().find(|id| !active.contains(id.as_str())) {
            return Err(TabulationError::UnknownCandidate(unknown.clone()));
        }
        if !ballot.is_empty() {
            live.push(ballot.iter().map(String::as_str).collect());
        }
    }

    let mut rounds = Vec::new();
    loop {
        // Nobody voted: every candidate is tied at zero.
        if live.is_empty() {
            let pool: Vec<&str> = active.iter().copied().collect();
            let winner = pool[rng.gen_range(0..pool.len())];
            let tally: Tally = pool.iter().map(|id| (*id, 0)).collect();
            rounds.push(final_round(&tally, winner, RoundAction::WonByTiebreak));
            return Ok(rounds);
        }

        let tally = count_first_ranks(&active, &live);
        let total = live.len() as u64;
        let (most_voted, most_votes) = leader(&tally);

        if 2 * most_votes > total {
            debug!("{} wins round {} with {}/{}", most_voted, rounds.len() + 1, most_votes, total);
            rounds.push(final_round(&tally, most_voted, RoundAction::Won));
            return Ok(rounds);
        }

        if 2 * most_votes == total && tally.len() == 2 {
            let tied: Vec<&str> = tally.keys().copied().collect();
            let winner = tied[rng.gen_range(0..tied.len())];
            debug!("{} wins a coin flip at {}/{}", winner, most_votes, total);
            rounds.push(final_round(&tally, winner, RoundAction::WonByTiebreak));
            return Ok(rounds);
        }

        let eliminated = trailing(&tally);
        debug!("Eliminating {} in round {}", eliminated, rounds.len() + 1);
        rounds.push(
            tally
                .iter()
                .map(|(id, votes)| {
                    let action = (*id == eliminated).then_some(RoundAction::Eliminated);
                    (id.to_string(), round_entry(*votes, action))
                })
                .collect(),
        );

        active.remove(eliminated);
        live = live
            .into_iter()
            .filter_map(|ballot| {
                let rest: Vec<&str> = ballot.into_iter().filter(|id| *id != eliminated).collect();
                (!rest.is_empty()).then_some(rest)
            })
            .collect();
    }
}

fn count_first_ranks<'a>(active: &BTreeSet<&'a str>, ballots: &[Vec<&'a str>]) -> Tally<'a> {
    let mut tally: Tally = active.iter().map(|id| (*id, 0)).collect();
    for ballot in ballots {
        if let Some(count) = ballot.first().and_then(|first| tally.get_mut(first)) {
            *count += 1;
        }
    }
    tally
}

fn leader<'a>(tally: &Tally<'a>) -> (&'a str, u64) {
    tally
        .iter()
        .fold(None, |best: Option<(&'a str, u64)>, (id, votes)| match best {
            Some((_, most)) if most >= *votes => best,
            _ => Some((*id, *votes)),
        })
        .unwrap_or(("", 0))
}

fn trailing<'a>(tally: &Tally<'a>) -> &'a str {
    // min_by_key keeps the first minimum, so ties resolve to the smallest id.
    tally
        .iter()
        .min_by_key(|(_, votes)| **votes)
        .map(|(id, _)| *id)
        .unwrap_or("")
}

fn final_round(tally: &Tally<'_>, winner: &str, action: RoundAction) -> ElectionRound {
    tally
        .iter()
        .map(|(id, votes)| {
            let action = (*id == winner).then_some(action);
            (id.to_string(), round_entry(*votes, action))
        })
        .collect()
}

fn round_entry(votes: u64, action: Option<RoundAction>) -> CandidateRoundResult {
    CandidateRoundResult {
        number_of_rank_one_votes: votes,
        round_action: action,
    }
}
