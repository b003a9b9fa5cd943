use crate::{array::Array, error::Result, layout::reorder};
use std::fmt::{self, Debug};

enum OpKind {
    Reorder { src: Array, dst: Array },
    Primitive(Box<dyn FnOnce() -> Result<()> + Send>),
}

/// A unit of work in an [`OpQueue`].
pub struct Op {
    name: &'static str,
    kind: OpKind,
}

impl Op {
    /// A reorder of `src` into the layout of `dst`.
    pub fn reorder(src: Array, dst: Array) -> Self {
        Self {
            name: "reorder",
            kind: OpKind::Reorder { src, dst },
        }
    }
    /// A kernel library primitive.
    pub fn primitive<F>(name: &'static str, f: F) -> Self
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        Self {
            name,
            kind: OpKind::Primitive(Box::new(f)),
        }
    }
    /// The name of the op.
    pub fn name(&self) -> &'static str {
        self.name
    }
    fn run(self) -> Result<()> {
        match self.kind {
            OpKind::Reorder { src, dst } => reorder(&src, &dst),
            OpKind::Primitive(f) => f(),
        }
    }
}

impl Debug for Op {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.kind {
            OpKind::Reorder { src, dst } => f
                .debug_struct("Op")
                .field("name", &self.name)
                .field("src", &src.layout())
                .field("dst", &dst.layout())
                .finish(),
            OpKind::Primitive(_) => f.debug_struct("Op").field("name", &self.name).finish(),
        }
    }
}

/// An ordered list of ops, executed first in first out.
///
/// A queue is owned by a single call. Reorders are pushed ahead of the primitive that consumes
/// their outputs, so one [`OpQueue::execute()`] runs the whole plan.
#[derive(Default, Debug)]
pub struct OpQueue {
    ops: Vec<Op>,
}

impl OpQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }
    /// Appends `op`.
    pub fn push(&mut self, op: Op) {
        self.ops.push(op);
    }
    /// The number of pending ops.
    pub fn len(&self) -> usize {
        self.ops.len()
    }
    /// Whether there are no pending ops.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
    /// Names of pending ops, in order.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.ops.iter().map(Op::name)
    }
    /// Runs all pending ops in order and empties the queue.
    ///
    /// **Errors**
    ///
    /// Stops at the first failing op, remaining ops are discarded.
    pub fn execute(&mut self) -> Result<()> {
        let ops = std::mem::take(&mut self.ops);
        if !ops.is_empty() {
            log::trace!("executing {} ops", ops.len());
        }
        for op in ops {
            log::trace!("{}", op.name);
            op.run()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::state_error;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn fifo() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut queue = OpQueue::new();
        for name in ["a", "b", "c"] {
            let log = log.clone();
            queue.push(Op::primitive(name, move || {
                log.lock().push(name);
                Ok(())
            }));
        }
        assert_eq!(queue.names().collect::<Vec<_>>(), ["a", "b", "c"]);
        queue.execute().unwrap();
        assert!(queue.is_empty());
        assert_eq!(log.lock().as_slice(), ["a", "b", "c"]);
    }

    #[test]
    fn stops_on_error() {
        let ran = Arc::new(Mutex::new(false));
        let mut queue = OpQueue::new();
        queue.push(Op::primitive("fail", || Err(state_error!("fail"))));
        {
            let ran = ran.clone();
            queue.push(Op::primitive("after", move || {
                *ran.lock() = true;
                Ok(())
            }));
        }
        assert!(queue.execute().unwrap_err().is_state());
        assert!(queue.is_empty());
        assert!(!*ran.lock());
    }
}
