//! Fingerprint cache and winner bookkeeping

use crate::error::{SchemaError, SchemaResult};
use crate::fingerprint::SchemaFingerprint;
use crate::types::{RecordTypeFamily, SchemaDescriptor};
use std::collections::HashMap;
use tokio::sync::oneshot;

pub(crate) type Waiter = oneshot::Sender<SchemaResult<SchemaDescriptor>>;

/// What the listener path decided for a delivered schema
pub(crate) enum Decision {
    /// Already known (winner or loser); nothing changes
    Duplicate,
    /// Cached; these waiters get the descriptor
    Accepted(Vec<Waiter>),
    /// Lost its family to `winner`; these waiters get a conflict
    Rejected {
        family: RecordTypeFamily,
        winner: SchemaFingerprint,
        waiters: Vec<Waiter>,
    },
}

/// Codec-local view of the registry
///
/// Mutated only by the listener path; request paths read it or park waiters.
#[derive(Default)]
pub(crate) struct Catalog {
    schemas: HashMap<SchemaFingerprint, SchemaDescriptor>,
    winners: HashMap<RecordTypeFamily, SchemaFingerprint>,
    /// Fingerprints that lost their family to the paired winner, never cached
    losers: HashMap<SchemaFingerprint, (RecordTypeFamily, SchemaFingerprint)>,
    waiters: HashMap<SchemaFingerprint, Vec<Waiter>>,
}

impl Catalog {
    pub(crate) fn get(&self, fingerprint: SchemaFingerprint) -> Option<&SchemaDescriptor> {
        self.schemas.get(&fingerprint)
    }

    pub(crate) fn winner_for(&self, family: &RecordTypeFamily) -> Option<SchemaFingerprint> {
        self.winners.get(family).copied()
    }

    pub(crate) fn fingerprints(&self) -> Vec<SchemaFingerprint> {
        let mut fingerprints: Vec<_> = self.schemas.keys().copied().collect();
        fingerprints.sort();
        fingerprints
    }

    pub(crate) fn len(&self) -> usize {
        self.schemas.len()
    }

    /// Conflict error for a fingerprint already known to have lost
    pub(crate) fn conflict_for(&self, fingerprint: SchemaFingerprint) -> Option<SchemaError> {
        self.losers
            .get(&fingerprint)
            .map(|(family, winner)| SchemaError::conflict(family.clone(), *winner, fingerprint))
    }

    /// Reject a proposal that is already known to lose
    pub(crate) fn check_proposed(&self, schema: &SchemaDescriptor) -> SchemaResult<()> {
        let fingerprint = schema.fingerprint();
        if let Some(conflict) = self.conflict_for(fingerprint) {
            return Err(conflict);
        }
        if let Some(family) = schema.family() {
            if let Some(winner) = self.winner_for(family) {
                if winner != fingerprint {
                    return Err(SchemaError::conflict(family.clone(), winner, fingerprint));
                }
            }
        }
        Ok(())
    }

    /// Park a waiter for `fingerprint`, pruning abandoned ones first
    pub(crate) fn park(&mut self, fingerprint: SchemaFingerprint, waiter: Waiter) {
        self.prune_abandoned();
        self.waiters.entry(fingerprint).or_default().push(waiter);
    }

    /// Drop waiters whose receiver is gone, and fingerprints left without any
    pub(crate) fn prune_abandoned(&mut self) {
        self.waiters.retain(|_, waiters| {
            waiters.retain(|w| !w.is_closed());
            !waiters.is_empty()
        });
    }

    pub(crate) fn pending(&self) -> usize {
        self.waiters
            .values()
            .flatten()
            .filter(|w| !w.is_closed())
            .count()
    }

    /// Apply a schema delivered by the registry; the first fingerprint per family wins
    pub(crate) fn admit(&mut self, schema: &SchemaDescriptor) -> Decision {
        let fingerprint = schema.fingerprint();
        if self.schemas.contains_key(&fingerprint) || self.losers.contains_key(&fingerprint) {
            return Decision::Duplicate;
        }

        let waiters = self.waiters.remove(&fingerprint).unwrap_or_default();
        if let Some(family) = schema.family() {
            match self.winners.get(family).copied() {
                Some(winner) if winner != fingerprint => {
                    self.losers.insert(fingerprint, (family.clone(), winner));
                    return Decision::Rejected {
                        family: family.clone(),
                        winner,
                        waiters,
                    };
                }
                Some(_) => {}
                None => {
                    self.winners.insert(family.clone(), fingerprint);
                }
            }
        }

        self.schemas.insert(fingerprint, schema.clone());
        Decision::Accepted(waiters)
    }

    /// Record a loss reported by the registry instead of the listener path
    ///
    /// Only a loss to a cached winner counts; a batch that named one family
    /// twice has no durable winner. Returns the waiters parked on `loser`,
    /// which are owed the conflict.
    pub(crate) fn mark_loser(
        &mut self,
        family: &RecordTypeFamily,
        winner: SchemaFingerprint,
        loser: SchemaFingerprint,
    ) -> Vec<Waiter> {
        if self.schemas.contains_key(&loser) || !self.schemas.contains_key(&winner) {
            return Vec::new();
        }
        self.losers
            .entry(loser)
            .or_insert_with(|| (family.clone(), winner));
        self.waiters.remove(&loser).unwrap_or_default()
    }

    pub(crate) fn is_loser(&self, fingerprint: SchemaFingerprint) -> bool {
        self.losers.contains_key(&fingerprint)
    }

    /// Remove every parked waiter
    pub(crate) fn drain_waiters(&mut self) -> Vec<Waiter> {
        self.waiters.drain().flat_map(|(_, w)| w).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::test_support::record;

    #[test]
    fn test_first_fingerprint_wins() {
        let mut catalog = Catalog::default();
        let long = record("Order", "long");
        let string = record("Order", "string");

        assert!(matches!(catalog.admit(&long), Decision::Accepted(w) if w.is_empty()));
        match catalog.admit(&string) {
            Decision::Rejected { winner, family, .. } => {
                assert_eq!(winner, long.fingerprint());
                assert_eq!(family.as_str(), "test.Order");
            }
            _ => panic!("expected rejection"),
        }

        assert!(matches!(catalog.admit(&string), Decision::Duplicate));
        assert!(matches!(catalog.admit(&long), Decision::Duplicate));
        assert!(catalog.is_loser(string.fingerprint()));
        assert_eq!(catalog.fingerprints(), vec![long.fingerprint()]);
        assert!(catalog.conflict_for(string.fingerprint()).unwrap().is_conflict());
    }

    #[test]
    fn test_check_proposed() {
        let mut catalog = Catalog::default();
        let long = record("Order", "long");
        let string = record("Order", "string");

        assert!(catalog.check_proposed(&string).is_ok());
        catalog.admit(&long);
        assert!(catalog.check_proposed(&long).is_ok());
        assert!(catalog.check_proposed(&string).unwrap_err().is_conflict());
    }

    #[test]
    fn test_rejected_insert_marks_loser() {
        let mut catalog = Catalog::default();
        let long = record("Order", "long");
        let string = record("Order", "string");
        catalog.admit(&long);

        let (tx, _rx) = oneshot::channel();
        catalog.park(string.fingerprint(), tx);

        let family = long.family().unwrap();
        let waiters = catalog.mark_loser(family, long.fingerprint(), string.fingerprint());
        assert_eq!(waiters.len(), 1);
        assert_eq!(catalog.pending(), 0);
        assert!(catalog.is_loser(string.fingerprint()));

        match catalog.conflict_for(string.fingerprint()) {
            Some(SchemaError::Conflict { winner, loser, .. }) => {
                assert_eq!(winner, long.fingerprint());
                assert_eq!(loser, string.fingerprint());
            }
            other => panic!("expected conflict, got {:?}", other),
        }
        // Delivering the loser later changes nothing
        assert!(matches!(catalog.admit(&string), Decision::Duplicate));

        // A cached winner is never turned into a loser
        assert!(catalog
            .mark_loser(family, string.fingerprint(), long.fingerprint())
            .is_empty());
        assert!(!catalog.is_loser(long.fingerprint()));

        // No durable winner, no loss
        let double = record("Order", "double");
        let other = record("Other", "long");
        assert!(catalog
            .mark_loser(other.family().unwrap(), other.fingerprint(), double.fingerprint())
            .is_empty());
        assert!(!catalog.is_loser(double.fingerprint()));
    }

    #[test]
    fn test_abandoned_waiters_pruned_across_fingerprints() {
        let mut catalog = Catalog::default();
        for field_type in ["long", "string", "double"] {
            let (tx, rx) = oneshot::channel();
            catalog.park(record("Gone", field_type).fingerprint(), tx);
            drop(rx);
        }
        // Each park pruned the entries abandoned before it
        assert_eq!(catalog.waiters.len(), 1);

        catalog.prune_abandoned();
        assert!(catalog.waiters.is_empty());

        let (tx, _rx) = oneshot::channel();
        catalog.park(record("Live", "long").fingerprint(), tx);
        assert_eq!(catalog.waiters.len(), 1);
        assert_eq!(catalog.pending(), 1);
    }

    #[test]
    fn test_waiters_are_handed_out_once() {
        let mut catalog = Catalog::default();
        let long = record("Order", "long");

        let (tx, _rx) = oneshot::channel();
        catalog.park(long.fingerprint(), tx);
        let (abandoned, rx) = oneshot::channel();
        drop(rx);
        catalog.park(long.fingerprint(), abandoned);
        assert_eq!(catalog.pending(), 1);

        match catalog.admit(&long) {
            Decision::Accepted(waiters) => assert_eq!(waiters.len(), 2),
            _ => panic!("expected acceptance"),
        }
        assert_eq!(catalog.pending(), 0);
        assert!(catalog.drain_waiters().is_empty());
    }
}
