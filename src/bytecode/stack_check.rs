use std::ops;

use serde::{Deserialize, Serialize};

/// Net effect of a stretch of code on the (main, return) stacks.
///
/// Loop frames count toward `ret`; the compiler does not distinguish the
/// call stack from the loop-control stack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StackUse {
    pub main: i32,
    pub ret: i32,
}

impl StackUse {
    pub const ZERO: StackUse = StackUse { main: 0, ret: 0 };

    pub const fn new(main: i32, ret: i32) -> Self {
        StackUse { main, ret }
    }
}

impl ops::Add for StackUse {
    type Output = StackUse;

    fn add(self, rhs: StackUse) -> StackUse {
        StackUse::new(self.main + rhs.main, self.ret + rhs.ret)
    }
}

impl ops::AddAssign for StackUse {
    fn add_assign(&mut self, rhs: StackUse) {
        self.main += rhs.main;
        self.ret += rhs.ret;
    }
}

impl std::fmt::Display for StackUse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.main, self.ret)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StackCheckError {
    /// Two exits from one word leave the stacks in different shapes.
    ExitMismatch {
        previous: StackUse,
        current: StackUse,
    },
    /// The two arms of a conditional disagree.
    BranchMismatch { taken: StackUse, other: StackUse },
    /// A FOR body that grows or shrinks the stacks.
    LoopNotNeutral { before: StackUse, after: StackUse },
}

impl std::fmt::Display for StackCheckError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StackCheckError::ExitMismatch { previous, current } => write!(
                f,
                "stack usage must be the same at all word exits, previous = {}, current = {}",
                previous, current
            ),
            StackCheckError::BranchMismatch { taken, other } => write!(
                f,
                "both paths through a conditional must have the same effect on stack sizes, {} vs {}",
                taken, other
            ),
            StackCheckError::LoopNotNeutral { before, after } => write!(
                f,
                "a FOR body must leave the stacks as it found them, {} before vs {} after",
                before, after
            ),
        }
    }
}

impl std::error::Error for StackCheckError {}

/// Records an exit from the current word.
///
/// The first exit fixes the word's contract; later exits must match it.
pub fn check_exit(
    recorded: Option<StackUse>,
    current: StackUse,
) -> Result<StackUse, StackCheckError> {
    match recorded {
        None => Ok(current),
        Some(previous) if previous == current => Ok(previous),
        Some(previous) => Err(StackCheckError::ExitMismatch { previous, current }),
    }
}

/// Merges the two control paths of a conditional.
///
/// `None` marks a path that left the word before reaching the join point.
pub fn join_paths(
    taken: Option<StackUse>,
    other: Option<StackUse>,
) -> Result<Option<StackUse>, StackCheckError> {
    match (taken, other) {
        (Some(a), Some(b)) if a == b => Ok(Some(a)),
        (Some(taken), Some(other)) => Err(StackCheckError::BranchMismatch { taken, other }),
        (Some(a), None) | (None, Some(a)) => Ok(Some(a)),
        (None, None) => Ok(None),
    }
}

/// Checks that a loop body returns the stacks to their shape at loop entry.
pub fn check_loop_body(before: StackUse, after: StackUse) -> Result<(), StackCheckError> {
    if before == after {
        Ok(())
    } else {
        Err(StackCheckError::LoopNotNeutral { before, after })
    }
}
