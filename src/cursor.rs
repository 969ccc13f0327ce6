use crate::error::{CaptureError, CaptureResult};

/// Position of the next unseen update. Advancing is in-memory only; the
/// capture cycle calls [`CursorTracker::mark_persisted`] after the archive
/// write succeeds, or [`CursorTracker::rollback`] when it fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct CursorTracker {
    current: i64,
    persisted: i64,
}

impl CursorTracker {
    pub(crate) fn new(persisted: i64) -> Self {
        Self {
            current: persisted,
            persisted,
        }
    }

    pub(crate) fn current(&self) -> i64 {
        self.current
    }

    pub(crate) fn persisted(&self) -> i64 {
        self.persisted
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.current != self.persisted
    }

    pub(crate) fn advance(&mut self, value: i64) -> CaptureResult<()> {
        if value < self.current {
            return Err(CaptureError::InvariantViolation(format!(
                "cursor would move backwards from {} to {value}",
                self.current
            )));
        }
        self.current = value;
        Ok(())
    }

    /// Accounts for a processed update. Re-delivered updates below the
    /// cursor leave it where it is.
    pub(crate) fn observe(&mut self, update_id: i64) -> CaptureResult<()> {
        let next = update_id.saturating_add(1);
        self.advance(next.max(self.current))
    }

    /// Adopts the value found in storage at the start of a cycle. Storage
    /// behind memory means a cursor write was lost; memory wins because the
    /// collection it covers is already stored.
    pub(crate) fn sync_stored(&mut self, stored: i64) -> bool {
        if stored < self.persisted {
            return false;
        }
        self.persisted = stored;
        self.current = self.current.max(stored);
        true
    }

    pub(crate) fn mark_persisted(&mut self) {
        self.persisted = self.current;
    }

    pub(crate) fn rollback(&mut self) {
        self.current = self.persisted;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_zero() {
        let cursor = CursorTracker::default();
        assert_eq!(cursor.current(), 0);
        assert!(!cursor.is_dirty());
    }

    #[test]
    fn advance_is_monotonic() {
        let mut cursor = CursorTracker::new(5);
        cursor.advance(5).unwrap();
        cursor.advance(9).unwrap();
        let err = cursor.advance(8).unwrap_err();
        assert!(matches!(err, CaptureError::InvariantViolation(_)));
        assert_eq!(cursor.current(), 9);
    }

    #[test]
    fn observe_moves_past_update() {
        let mut cursor = CursorTracker::default();
        cursor.observe(41).unwrap();
        assert_eq!(cursor.current(), 42);
        cursor.observe(10).unwrap();
        assert_eq!(cursor.current(), 42);
    }

    #[test]
    fn advance_stays_in_memory_until_marked() {
        let mut cursor = CursorTracker::new(3);
        cursor.advance(7).unwrap();
        assert!(cursor.is_dirty());
        assert_eq!(cursor.persisted(), 3);
        cursor.rollback();
        assert_eq!(cursor.current(), 3);
        cursor.advance(7).unwrap();
        cursor.mark_persisted();
        assert_eq!(cursor.persisted(), 7);
        assert!(!cursor.is_dirty());
    }

    #[test]
    fn stored_value_never_pulls_cursor_back() {
        let mut cursor = CursorTracker::new(10);
        assert!(!cursor.sync_stored(4));
        assert_eq!(cursor.current(), 10);
        assert!(cursor.sync_stored(15));
        assert_eq!(cursor.current(), 15);
        assert_eq!(cursor.persisted(), 15);
    }
}
