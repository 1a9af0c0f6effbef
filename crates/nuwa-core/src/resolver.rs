//! Last-writer-wins conflict resolution over whole records

/// Position of a session record in the total order
/// `(revision, updated_at, session_id)`.
///
/// Field order matters: the derived `Ord` is lexicographic over it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Stamp<'a> {
    pub revision: u64,
    pub updated_at: u64,
    pub session_id: &'a str,
}

/// How a record competes against the currently held one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precedence<'a> {
    /// Records with a revision counter
    Lineage(Stamp<'a>),
    /// Documents that only carry their own timestamp
    Timestamp(u64),
}

impl Precedence<'_> {
    fn timestamp(&self) -> u64 {
        match self {
            Precedence::Lineage(stamp) => stamp.updated_at,
            Precedence::Timestamp(ts) => *ts,
        }
    }
}

/// Anything that can be ordered by the resolver
pub trait Stamped {
    fn precedence(&self) -> Precedence<'_>;
}

/// Decides whether an incoming record supersedes the held one
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver;

impl ConflictResolver {
    /// True iff `incoming` should replace `current`.
    ///
    /// Lineage records win on a higher revision, then a strictly later
    /// timestamp, then a greater session id. Timestamp-only documents are
    /// rejected only when strictly older, so equal timestamps are accepted.
    pub fn should_apply<A, B>(incoming: &A, current: &B) -> bool
    where
        A: Stamped + ?Sized,
        B: Stamped + ?Sized,
    {
        match (incoming.precedence(), current.precedence()) {
            (Precedence::Lineage(a), Precedence::Lineage(b)) => a > b,
            (a, b) => a.timestamp() >= b.timestamp(),
        }
    }

    /// Inverse of [`ConflictResolver::should_apply`]
    pub fn is_stale<A, B>(incoming: &A, current: &B) -> bool
    where
        A: Stamped + ?Sized,
        B: Stamped + ?Sized,
    {
        !Self::should_apply(incoming, current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Rec {
        revision: u64,
        updated_at: u64,
        session_id: &'static str,
    }

    impl Stamped for Rec {
        fn precedence(&self) -> Precedence<'_> {
            Precedence::Lineage(Stamp {
                revision: self.revision,
                updated_at: self.updated_at,
                session_id: self.session_id,
            })
        }
    }

    struct Doc(u64);

    impl Stamped for Doc {
        fn precedence(&self) -> Precedence<'_> {
            Precedence::Timestamp(self.0)
        }
    }

    fn rec(revision: u64, updated_at: u64, session_id: &'static str) -> Rec {
        Rec {
            revision,
            updated_at,
            session_id,
        }
    }

    #[test]
    fn test_higher_revision_wins_both_ways() {
        // Revision dominates even a much older timestamp
        let a = rec(2, 9_000, "zzz");
        let b = rec(3, 1_000, "aaa");
        assert!(ConflictResolver::should_apply(&b, &a));
        assert!(!ConflictResolver::should_apply(&a, &b));
    }

    #[test]
    fn test_equal_revision_later_timestamp_wins() {
        let earlier = rec(3, 1_000, "b");
        let later = rec(3, 1_001, "a");
        assert!(ConflictResolver::should_apply(&later, &earlier));
        assert!(!ConflictResolver::should_apply(&earlier, &later));
    }

    #[test]
    fn test_session_id_breaks_full_ties() {
        let a = rec(3, 1_000, "session-a");
        let b = rec(3, 1_000, "session-b");
        assert!(ConflictResolver::should_apply(&b, &a));
        assert!(!ConflictResolver::should_apply(&a, &b));
    }

    #[test]
    fn test_identical_record_is_stale() {
        let a = rec(4, 1_000, "s");
        let b = rec(4, 1_000, "s");
        assert!(ConflictResolver::is_stale(&a, &b));
    }

    #[test]
    fn test_timestamp_only_documents() {
        assert!(ConflictResolver::should_apply(&Doc(10), &Doc(5)));
        assert!(ConflictResolver::should_apply(&Doc(5), &Doc(5)));
        assert!(!ConflictResolver::should_apply(&Doc(4), &Doc(5)));
    }
}
