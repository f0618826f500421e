//! Operation log for replicated text
//!
//! Every character ever inserted is one element of a single sequence,
//! identified by the logical clock of the operation that created it.
//! Deletions only tombstone elements, so an insert anchored on a deleted
//! character still has a place to go.
//!
//! Integration uses RGA ordering: an insert lands right after its origin,
//! skipping neighbours whose id is greater than its own. Ids are Lamport
//! clocks (`counter` is always above every counter the replica has seen), so
//! the resulting order depends only on the set of operations, never on the
//! order in which they arrived.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::error::{Error, Result};

/// Maximum encoded update size (16MB)
pub const MAX_UPDATE_SIZE: usize = 16 * 1024 * 1024;

/// Identifies one replica (one open copy of a document)
pub type ReplicaId = u64;

/// Logical clock of a single operation
///
/// Ordered by `counter` first, then by `replica` as a tie-break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId {
    pub counter: u64,
    pub replica: ReplicaId,
}

impl OpId {
    pub fn new(counter: u64, replica: ReplicaId) -> Self {
        Self { counter, replica }
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{:x}", self.counter, self.replica)
    }
}

/// A single replicated operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    /// Insert `value` immediately after `origin` (or at the head)
    Insert {
        id: OpId,
        origin: Option<OpId>,
        value: char,
    },
    /// Tombstone the element created by `target`
    Delete { id: OpId, target: OpId },
}

impl Op {
    pub fn id(&self) -> OpId {
        match self {
            Op::Insert { id, .. } | Op::Delete { id, .. } => *id,
        }
    }

    /// The element this operation needs before it can be integrated
    fn dependency(&self) -> Option<OpId> {
        match self {
            Op::Insert { origin, .. } => *origin,
            Op::Delete { target, .. } => Some(*target),
        }
    }
}

/// An immutable batch of operations, the unit of replication
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    pub ops: Vec<Op>,
}

impl Update {
    pub fn new(ops: Vec<Op>) -> Self {
        Self { ops }
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Encode as MessagePack for the wire
    pub fn encode(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Decode a MessagePack payload received from another replica
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_UPDATE_SIZE {
            return Err(Error::UpdateTooLarge {
                size: bytes.len(),
                limit: MAX_UPDATE_SIZE,
            });
        }
        rmp_serde::from_slice(bytes).map_err(|e| Error::MalformedUpdate(e.to_string()))
    }
}

#[derive(Debug, Clone)]
struct Element {
    id: OpId,
    value: char,
    deleted: bool,
}

/// The replicated sequence plus every operation integrated into it
#[derive(Debug, Default)]
pub struct OpLog {
    elements: Vec<Element>,
    /// Integrated operations in causal order
    history: Vec<Op>,
    /// Op id -> index into `history`
    known: HashMap<OpId, usize>,
    /// Operations waiting for their dependency to arrive
    pending: Vec<Op>,
    max_counter: u64,
    visible: usize,
    /// Position of the last touched element; consecutive typing hits it
    hint: usize,
}

impl OpLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Materialized text
    pub fn text(&self) -> String {
        self.elements
            .iter()
            .filter(|e| !e.deleted)
            .map(|e| e.value)
            .collect()
    }

    /// Number of visible characters
    pub fn len(&self) -> usize {
        self.visible
    }

    pub fn is_empty(&self) -> bool {
        self.visible == 0
    }

    pub fn max_counter(&self) -> u64 {
        self.max_counter
    }

    pub fn contains(&self, id: &OpId) -> bool {
        self.known.contains_key(id)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn history(&self) -> &[Op] {
        &self.history
    }

    /// Every integrated operation, suitable for onboarding a fresh replica
    pub fn snapshot(&self) -> Update {
        Update::new(self.history.clone())
    }

    /// Operations created by one replica, in causal order
    pub fn authored_by(&self, replica: ReplicaId) -> Update {
        Update::new(
            self.history
                .iter()
                .filter(|op| op.id().replica == replica)
                .cloned()
                .collect(),
        )
    }

    /// Merge an update of unknown origin and ordering.
    ///
    /// Returns the number of operations that were integrated, including
    /// previously buffered ones that became ready.
    pub fn apply(&mut self, update: &Update) -> Result<usize> {
        let mut integrated = 0;
        for op in &update.ops {
            integrated += self.apply_op(op)?;
        }
        Ok(integrated)
    }

    /// Diff the current text against `new_text` and integrate the resulting
    /// operations. An identical text yields an empty update.
    pub fn local_edit(&mut self, replica: ReplicaId, new_text: &str) -> Result<Update> {
        let current: Vec<(OpId, char)> = self
            .elements
            .iter()
            .filter(|e| !e.deleted)
            .map(|e| (e.id, e.value))
            .collect();
        let target: Vec<char> = new_text.chars().collect();

        let prefix = current
            .iter()
            .zip(&target)
            .take_while(|((_, a), b)| a == *b)
            .count();
        let max_suffix = current.len().min(target.len()) - prefix;
        let suffix = current
            .iter()
            .rev()
            .zip(target.iter().rev())
            .take(max_suffix)
            .take_while(|((_, a), b)| a == *b)
            .count();

        let mut ops = Vec::new();
        for (removed, _) in &current[prefix..current.len() - suffix] {
            let id = self.next_id(replica);
            ops.push(Op::Delete {
                id,
                target: *removed,
            });
        }

        let mut origin = prefix.checked_sub(1).map(|i| current[i].0);
        for value in &target[prefix..target.len() - suffix] {
            let id = self.next_id(replica);
            ops.push(Op::Insert {
                id,
                origin,
                value: *value,
            });
            origin = Some(id);
        }

        for op in &ops {
            self.integrate(op.clone())?;
        }

        Ok(Update::new(ops))
    }

    fn next_id(&mut self, replica: ReplicaId) -> OpId {
        self.max_counter += 1;
        OpId::new(self.max_counter, replica)
    }

    fn apply_op(&mut self, op: &Op) -> Result<usize> {
        let id = op.id();

        if let Some(&index) = self.known.get(&id) {
            if &self.history[index] != op {
                return Err(Error::MergeConflict(format!(
                    "two different operations share id {}",
                    id
                )));
            }
            return Ok(0);
        }

        if self.pending.iter().any(|p| p.id() == id) {
            return Ok(0);
        }

        if !self.is_ready(op) {
            self.pending.push(op.clone());
            return Ok(0);
        }

        self.integrate(op.clone())?;
        Ok(1 + self.drain_pending()?)
    }

    fn is_ready(&self, op: &Op) -> bool {
        match op.dependency() {
            None => true,
            Some(dep) => self
                .known
                .get(&dep)
                .is_some_and(|&i| matches!(self.history[i], Op::Insert { .. })),
        }
    }

    fn drain_pending(&mut self) -> Result<usize> {
        let mut count = 0;
        while let Some(pos) = self.pending.iter().position(|op| self.is_ready(op)) {
            let op = self.pending.swap_remove(pos);
            self.integrate(op)?;
            count += 1;
        }
        Ok(count)
    }

    fn integrate(&mut self, op: Op) -> Result<()> {
        let id = op.id();

        match &op {
            Op::Insert { origin, value, .. } => {
                let mut pos = match origin {
                    Some(origin) => self.position_of(*origin).ok_or_else(|| {
                        Error::MergeConflict(format!("origin {} is not in the sequence", origin))
                    })? + 1,
                    None => 0,
                };
                while pos < self.elements.len() && self.elements[pos].id > id {
                    pos += 1;
                }
                self.elements.insert(
                    pos,
                    Element {
                        id,
                        value: *value,
                        deleted: false,
                    },
                );
                self.visible += 1;
                self.hint = pos;
            }
            Op::Delete { target, .. } => {
                let pos = self.position_of(*target).ok_or_else(|| {
                    Error::MergeConflict(format!("delete target {} is not in the sequence", target))
                })?;
                let element = &mut self.elements[pos];
                if !element.deleted {
                    element.deleted = true;
                    self.visible -= 1;
                }
                self.hint = pos;
            }
        }

        self.max_counter = self.max_counter.max(id.counter);
        self.known.insert(id, self.history.len());
        self.history.push(op);
        Ok(())
    }

    fn position_of(&self, id: OpId) -> Option<usize> {
        for candidate in [self.hint, self.hint + 1] {
            if self.elements.get(candidate).is_some_and(|e| e.id == id) {
                return Some(candidate);
            }
        }
        self.elements.iter().position(|e| e.id == id)
    }
}
