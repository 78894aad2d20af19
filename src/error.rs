//! Scheduler Error Types

use thiserror::Error;

/// Errors raised while turning a lazy graph into a kernel schedule.
///
/// Fusion ambiguity (a reduce whose children cannot cleanly group) is never
/// an error: the scheduler resolves it by realizing the reduce. Everything
/// here reflects either caller misuse or an internal invariant breach.
#[derive(Error, Debug)]
pub enum ScheduleError {
    /// The self operand of an augmented assign reads through a
    /// non-contiguous view
    #[error(
        "self operand of augmented assign must be contiguous.\n\
         help: insert a contiguous barrier on the offending view:\n\
            - a += a.T\n\
            + a += a.T.contiguous()"
    )]
    NonContiguousAssign,

    /// The schedule graph did not drain: some items kept a non-zero
    /// in-degree
    #[error("cycle detected in graph, prescheduled {prescheduled} but only scheduled {scheduled}")]
    ScheduleCycle {
        prescheduled: usize,
        scheduled: usize,
    },

    /// Assign target is a view; assigns must write a base buffer
    #[error("assign must be to a base buffer")]
    AssignToView,

    /// Assign target has no backing allocation yet
    #[error("assign target must already be realized to schedule")]
    AssignNotRealized,

    /// Copy source reads through a non-contiguous view
    #[error("can only copy contiguous buffers")]
    CopySourceNotContiguous,

    /// A const buffer carries a value the kernel AST cannot represent
    #[error("cannot create const buffer with value {0}")]
    UnsupportedConst(String),

    /// Copy byte count is not a whole number of destination elements
    #[error("copy of {nbytes} bytes is not a multiple of the {itemsize}-byte destination element")]
    CopyKernelMisaligned { nbytes: i64, itemsize: i64 },

    /// Image dtype fix-up reached a buffer that is already allocated
    #[error("can't fix up image dtype of an allocated buffer")]
    ImageFixupAllocated,

    /// `create_schedule` was asked for a schedule that still depends on
    /// unresolved symbolic variables
    #[error("schedule has {0} unresolved symbolic variables, use create_schedule_with_vars")]
    UnresolvedVariables(usize),
}

/// Convenience alias used throughout the scheduler.
pub type ScheduleResult<T> = Result<T, ScheduleError>;
