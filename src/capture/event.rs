use std::fmt;

/// Kind of storage operation reported by the capture facility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OpKind {
    Read,
    Write,
}

impl OpKind {
    /// Returns the canonical log label.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
        }
    }

    /// Parses the short (`r`/`w`) or long (`read`/`write`) form.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "r" | "R" | "read" => Some(Self::Read),
            "w" | "W" | "write" => Some(Self::Write),
            _ => None,
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single completed read or write against a dataset of a pool.
///
/// Timestamps are in nanoseconds on the capture facility's clock; only their
/// difference is meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationEvent {
    pub pool_guid: u64,
    pub dataset_guid: u64,
    pub kind: OpKind,
    pub bytes: u64,
    pub start_ns: u64,
    pub end_ns: u64,
}

impl OperationEvent {
    /// Elapsed time of the operation. Clock skew yields zero, not a wrap.
    pub fn elapsed_ns(&self) -> u64 {
        self.end_ns.saturating_sub(self.start_ns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_kind_names() {
        assert_eq!(OpKind::from_name("r"), Some(OpKind::Read));
        assert_eq!(OpKind::from_name("write"), Some(OpKind::Write));
        assert_eq!(OpKind::from_name("x"), None);
        assert_eq!(OpKind::Read.to_string(), "read");
    }

    #[test]
    fn test_elapsed_saturates() {
        let ev = OperationEvent {
            pool_guid: 1,
            dataset_guid: 2,
            kind: OpKind::Read,
            bytes: 512,
            start_ns: 2_000,
            end_ns: 1_000,
        };
        assert_eq!(ev.elapsed_ns(), 0);
    }
}
