//! Bot -> replica assignment
//!
//! Rendezvous (highest-random-weight) hashing: every replica scores every bot and
//! the highest score wins. Every replica computes the same answer from the same
//! member list, and a membership change only moves the bots of the replica that
//! joined or left.

use sha2::{Digest, Sha256};
use uuid::Uuid;

fn score(member_id: &str, bot_id: &Uuid) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(member_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(bot_id.as_bytes());
    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}

/// The live member responsible for `bot_id`, or `None` when no member is live.
///
/// `members` must be the sorted live member list; ties (practically impossible)
/// go to the lexicographically smaller id.
pub fn assign<'a>(members: &'a [String], bot_id: &Uuid) -> Option<&'a str> {
    let mut best: Option<(&'a str, u64)> = None;
    for member in members {
        let s = score(member, bot_id);
        match best {
            Some((_, top)) if top >= s => {}
            _ => best = Some((member.as_str(), s)),
        }
    }
    best.map(|(member, _)| member)
}

pub fn owns(members: &[String], self_id: &str, bot_id: &Uuid) -> bool {
    assign(members, bot_id) == Some(self_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn members(n: usize) -> Vec<String> {
        let mut m: Vec<String> = (0..n).map(|i| format!("replica-{}", i)).collect();
        m.sort();
        m
    }

    fn bots(n: usize) -> Vec<Uuid> {
        (0..n).map(|_| Uuid::new_v4()).collect()
    }

    #[test]
    fn test_every_bot_has_exactly_one_owner() {
        let bots = bots(500);
        for n in 1..=7 {
            let members = members(n);
            for bot in &bots {
                let owners = members.iter().filter(|m| owns(&members, m, bot)).count();
                assert_eq!(owners, 1, "bot {} with {} members", bot, n);
            }
        }
    }

    #[test]
    fn test_no_members_means_no_owner() {
        assert_eq!(assign(&[], &Uuid::new_v4()), None);
    }

    #[test]
    fn test_assignment_is_deterministic() {
        let members = members(4);
        let bot = Uuid::new_v4();
        let first = assign(&members, &bot);
        for _ in 0..10 {
            assert_eq!(assign(&members, &bot), first);
        }
    }

    #[test]
    fn test_departure_only_moves_departed_members_bots() {
        let bots = bots(1000);
        let before = members(5);
        let after: Vec<String> = before.iter().filter(|m| *m != "replica-2").cloned().collect();

        for bot in &bots {
            let old = assign(&before, bot).unwrap();
            let new = assign(&after, bot).unwrap();
            if old != "replica-2" {
                assert_eq!(old, new);
            } else {
                assert_ne!(new, "replica-2");
            }
        }
    }

    #[test]
    fn test_churn_keeps_full_coverage() {
        let bots = bots(300);
        let mut live = members(3);
        let churn = [
            ("add", "replica-9"),
            ("remove", "replica-0"),
            ("add", "replica-4"),
            ("remove", "replica-9"),
            ("remove", "replica-1"),
        ];
        for (op, id) in churn {
            match op {
                "add" => live.push(id.to_string()),
                _ => live.retain(|m| m != id),
            }
            live.sort();
            let covered = bots
                .iter()
                .filter(|b| live.iter().any(|m| owns(&live, m, b)))
                .count();
            assert_eq!(covered, bots.len());
        }
    }

    #[test]
    fn test_load_spreads_across_members() {
        let bots = bots(3000);
        let members = members(3);
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for bot in &bots {
            *counts.entry(assign(&members, bot).unwrap()).or_default() += 1;
        }
        for member in &members {
            let c = counts.get(member.as_str()).copied().unwrap_or(0);
            assert!(c > 700 && c < 1300, "{} got {}", member, c);
        }
    }
}
