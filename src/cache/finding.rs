//! Lookup results.

use bytes::Bytes;

/// Why a lookup did or did not produce a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupOutcome {
    /// A live, unbanished entry was found
    Hit,
    /// No entry is stored for the key
    Miss,
    /// The key is banished by an open write transaction
    Banished,
    /// The bucket could not be locked in time
    Busy,
}

// == Finding ==
/// A short-lived lookup result.
///
/// A hit carries a validated copy of the stored payload, taken while the
/// bucket was locked; the bucket itself is released before the finding is
/// returned. Every outcome other than a hit means "consult the source of
/// truth".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    outcome: LookupOutcome,
    value: Option<Bytes>,
}

impl Finding {
    pub(crate) fn hit(value: Bytes) -> Self {
        Self {
            outcome: LookupOutcome::Hit,
            value: Some(value),
        }
    }

    pub(crate) fn miss(outcome: LookupOutcome) -> Self {
        debug_assert!(outcome != LookupOutcome::Hit);
        Self {
            outcome,
            value: None,
        }
    }

    /// True for a hit.
    pub fn found(&self) -> bool {
        self.outcome == LookupOutcome::Hit
    }

    /// What the lookup observed.
    pub fn outcome(&self) -> LookupOutcome {
        self.outcome
    }

    /// The payload of a hit.
    pub fn value(&self) -> Option<&Bytes> {
        self.value.as_ref()
    }

    /// Consumes the finding, keeping the payload of a hit.
    pub fn into_value(self) -> Option<Bytes> {
        self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_carries_value() {
        let finding = Finding::hit(Bytes::from_static(b"doc"));
        assert!(finding.found());
        assert_eq!(finding.value().map(|v| v.as_ref()), Some(&b"doc"[..]));
        assert_eq!(finding.into_value(), Some(Bytes::from_static(b"doc")));
    }

    #[test]
    fn test_non_hits_are_empty() {
        for outcome in [LookupOutcome::Miss, LookupOutcome::Banished, LookupOutcome::Busy] {
            let finding = Finding::miss(outcome);
            assert!(!finding.found());
            assert_eq!(finding.outcome(), outcome);
            assert!(finding.value().is_none());
        }
    }
}
