use serenity::model::id::UserId;
use std::collections::HashSet;

/// Resultado de un voto, tal como se le muestra a quien votó.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoteOutcome {
    /// `false` si este usuario ya había votado por la pista actual.
    pub added: bool,
    pub count: usize,
    pub needed: usize,
    /// Se alcanzó el quórum y la pista se saltó.
    pub skipped: bool,
}

/// Votos para saltar la pista que suena ahora.
#[derive(Debug, Default)]
pub struct VoteSkip {
    voters: HashSet<UserId>,
}

impl VoteSkip {
    /// `max(1, ceil(listeners * percent / 100))`
    pub fn needed(listeners: usize, percent: u8) -> usize {
        let percent = usize::from(percent.clamp(1, 100));
        ((listeners * percent).div_ceil(100)).max(1)
    }

    /// Registra un voto e informa si se alcanzó el quórum. No limpia nada;
    /// el reproductor vacía el conjunto cuando cambia la pista.
    pub fn vote(&mut self, user_id: UserId, listeners: usize, percent: u8) -> VoteOutcome {
        let added = self.voters.insert(user_id);
        let count = self.voters.len();
        let needed = Self::needed(listeners, percent);

        VoteOutcome {
            added,
            count,
            needed,
            skipped: count >= needed,
        }
    }

    pub fn clear(&mut self) {
        self.voters.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn needed_rounds_up_with_floor_of_one() {
        assert_eq!(VoteSkip::needed(4, 50), 2);
        assert_eq!(VoteSkip::needed(5, 50), 3);
        assert_eq!(VoteSkip::needed(1, 50), 1);
        assert_eq!(VoteSkip::needed(0, 50), 1);
        assert_eq!(VoteSkip::needed(3, 100), 3);
    }

    #[test]
    fn repeat_votes_do_not_count_twice() {
        let mut votes = VoteSkip::default();
        let first = votes.vote(UserId::new(1), 4, 50);
        let second = votes.vote(UserId::new(1), 4, 50);

        assert!(first.added);
        assert!(!second.added);
        assert_eq!(second.count, 1);
        assert!(!second.skipped);
    }

    #[test]
    fn second_distinct_voter_reaches_quorum() {
        let mut votes = VoteSkip::default();
        votes.vote(UserId::new(1), 4, 50);
        let outcome = votes.vote(UserId::new(2), 4, 50);
        assert_eq!(
            outcome,
            VoteOutcome {
                added: true,
                count: 2,
                needed: 2,
                skipped: true
            }
        );
    }
}
