use serde::{Deserialize, Serialize};

use crate::runtime::runtime_error::{Fault, StackKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackError {
    Underflow,
    Overflow,
}

impl StackError {
    pub fn into_fault(self, stack: StackKind, pc: usize) -> Fault {
        match self {
            StackError::Underflow => Fault::StackUnderflow { stack, pc },
            StackError::Overflow => Fault::StackOverflow { stack, pc },
        }
    }
}

/// A fixed-capacity stack of `f32` slots. The top is the last element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundedStack {
    items: Vec<f32>,
    capacity: usize,
}

impl BoundedStack {
    pub fn new(capacity: usize) -> Self {
        BoundedStack {
            items: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, value: f32) -> Result<(), StackError> {
        if self.items.len() >= self.capacity {
            return Err(StackError::Overflow);
        }
        self.items.push(value);
        Ok(())
    }

    pub fn pop(&mut self) -> Result<f32, StackError> {
        self.items.pop().ok_or(StackError::Underflow)
    }

    /// The item `depth` slots below the top; 0 is the top.
    pub fn peek(&self, depth: usize) -> Result<f32, StackError> {
        self.items
            .len()
            .checked_sub(depth + 1)
            .map(|i| self.items[i])
            .ok_or(StackError::Underflow)
    }

    /// Replaces the contents, bottom first.
    pub fn load(&mut self, items: &[f32]) -> Result<(), StackError> {
        if items.len() > self.capacity {
            return Err(StackError::Overflow);
        }
        self.items.clear();
        self.items.extend_from_slice(items);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bottom first.
    pub fn as_slice(&self) -> &[f32] {
        &self.items
    }
}
