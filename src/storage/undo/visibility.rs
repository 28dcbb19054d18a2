use super::record::UndoRecordHeader;

/// Outcome of resolving a version's undo chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub enum TupleVisibility {
    Visible,
    Invisible,
}

impl TupleVisibility {
    pub fn is_visible(self) -> bool {
        self == TupleVisibility::Visible
    }
}

/// Snapshot test supplied by the host's transaction manager.
pub trait VisibilityOracle {
    /// Returns `true` if the change described by `record` is visible to
    /// the snapshot.
    fn sees(&self, record: &UndoRecordHeader) -> bool;
}

/// Sees every change ever recorded.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllVisible;

impl VisibilityOracle for AllVisible {
    fn sees(&self, _record: &UndoRecordHeader) -> bool {
        true
    }
}

/// Sees every record appended before counter `upto`.
#[derive(Clone, Copy, Debug)]
pub struct CounterSnapshot {
    upto: u64,
}

impl CounterSnapshot {
    pub fn new(upto: u64) -> Self {
        Self { upto }
    }
}

impl VisibilityOracle for CounterSnapshot {
    fn sees(&self, record: &UndoRecordHeader) -> bool {
        record.ptr.counter < self.upto
    }
}

impl<F> VisibilityOracle for F
where
    F: Fn(&UndoRecordHeader) -> bool,
{
    fn sees(&self, record: &UndoRecordHeader) -> bool {
        self(record)
    }
}
