//! Method body arena.
//!
//! A [`Body`] owns its instructions in an arena: every instruction lives in a
//! slot that is never reused within a run, and a separate order vector holds
//! the current program order. Instructions are addressed by [`InstrId`] handle,
//! so removing or inserting instructions never invalidates handles held
//! elsewhere — a removed instruction's slot is tombstoned and any operands
//! still pointing at it simply dangle until reference integrity repair runs.
//!
//! The original byte offset of each slot is retained even after removal, which
//! lets the repair step retarget a dangling branch to the surviving
//! instruction nearest to where its old target used to live.

use serde::{Deserialize, Serialize};

use crate::model::instruction::Instruction;
use crate::model::module::TypeSig;
use crate::Result;

/// Stable handle to an instruction slot inside one [`Body`].
///
/// Handles are only meaningful for the body that issued them. A handle stays
/// valid for the lifetime of the body; after the instruction is removed the
/// handle resolves to nothing but still compares and hashes normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstrId(u32);

impl InstrId {
    /// Returns the slot index this handle refers to.
    #[must_use]
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// A local variable slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Local {
    /// Declared type of the slot.
    pub sig: TypeSig,
}

impl Local {
    /// Creates a local variable slot of the given type.
    #[must_use]
    pub fn new(sig: TypeSig) -> Self {
        Local { sig }
    }
}

/// A protected region of a method body.
///
/// All markers are instruction handles. A handler is well formed when its
/// try-start and handler-start resolve to live instructions and its region
/// ends come after the respective starts in program order; integrity repair
/// drops handlers that cannot be brought back to that shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionHandler {
    /// First instruction of the protected region.
    pub try_start: Option<InstrId>,
    /// First instruction after the protected region.
    pub try_end: Option<InstrId>,
    /// First instruction of the handler.
    pub handler_start: Option<InstrId>,
    /// First instruction after the handler.
    pub handler_end: Option<InstrId>,
    /// First instruction of the filter clause, when present.
    pub filter_start: Option<InstrId>,
    /// Caught exception type; `None` for finally and filter handlers.
    pub catch_type: Option<TypeSig>,
}

impl ExceptionHandler {
    /// Creates a catch handler for `catch_type`.
    #[must_use]
    pub fn try_catch(
        try_start: InstrId,
        try_end: InstrId,
        handler_start: InstrId,
        handler_end: InstrId,
        catch_type: TypeSig,
    ) -> Self {
        ExceptionHandler {
            try_start: Some(try_start),
            try_end: Some(try_end),
            handler_start: Some(handler_start),
            handler_end: Some(handler_end),
            filter_start: None,
            catch_type: Some(catch_type),
        }
    }

    /// Creates a finally handler.
    #[must_use]
    pub fn try_finally(
        try_start: InstrId,
        try_end: InstrId,
        handler_start: InstrId,
        handler_end: InstrId,
    ) -> Self {
        ExceptionHandler {
            try_start: Some(try_start),
            try_end: Some(try_end),
            handler_start: Some(handler_start),
            handler_end: Some(handler_end),
            filter_start: None,
            catch_type: None,
        }
    }

    /// Returns true if this is a finally handler.
    #[must_use]
    pub fn is_finally(&self) -> bool {
        self.catch_type.is_none() && self.filter_start.is_none()
    }

    /// Iterates over every marker handle the handler currently holds.
    pub fn marker_ids(&self) -> impl Iterator<Item = InstrId> + '_ {
        [
            self.try_start,
            self.try_end,
            self.handler_start,
            self.handler_end,
            self.filter_start,
        ]
        .into_iter()
        .flatten()
    }
}

/// An instruction arena plus the program order over it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Body {
    slots: Vec<Option<Instruction>>,
    slot_offsets: Vec<u32>,
    order: Vec<InstrId>,
    next_offset: u32,
    /// Local variable slots, indexed by [`crate::model::Operand::Local`].
    pub locals: Vec<Local>,
    /// Protected regions of this body.
    pub handlers: Vec<ExceptionHandler>,
}

impl Body {
    /// Creates an empty body.
    #[must_use]
    pub fn new() -> Self {
        Body::default()
    }

    /// Number of live instructions in program order.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns true if the body holds no live instructions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Appends an instruction at the end of the program order.
    ///
    /// If the instruction carries no byte offset, a sequential one is
    /// assigned so later nearest-offset repair has something to work with.
    pub fn push(&mut self, mut instruction: Instruction) -> InstrId {
        if instruction.offset == 0 {
            instruction.offset = self.next_offset;
        }
        self.next_offset = self.next_offset.max(instruction.offset.saturating_add(1));

        let id = InstrId(self.slots.len() as u32);
        self.slot_offsets.push(instruction.offset);
        self.slots.push(Some(instruction));
        self.order.push(id);
        id
    }

    /// Inserts an instruction immediately before `anchor` in program order.
    ///
    /// The new instruction inherits the anchor's byte offset.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::MalformedBody`] if `anchor` does not resolve to
    /// a live instruction of this body.
    pub fn insert_before(&mut self, anchor: InstrId, instruction: Instruction) -> Result<InstrId> {
        let position = self
            .position_of(anchor)
            .ok_or_else(|| malformed_body!("insert anchor {:?} is not live", anchor))?;
        Ok(self.insert_at(position, anchor, instruction))
    }

    /// Inserts an instruction immediately after `anchor` in program order.
    ///
    /// The new instruction inherits the anchor's byte offset.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::MalformedBody`] if `anchor` does not resolve to
    /// a live instruction of this body.
    pub fn insert_after(&mut self, anchor: InstrId, instruction: Instruction) -> Result<InstrId> {
        let position = self
            .position_of(anchor)
            .ok_or_else(|| malformed_body!("insert anchor {:?} is not live", anchor))?;
        Ok(self.insert_at(position + 1, anchor, instruction))
    }

    fn insert_at(&mut self, position: usize, anchor: InstrId, mut instruction: Instruction) -> InstrId {
        if instruction.offset == 0 {
            instruction.offset = self.slot_offsets[anchor.index()];
        }

        let id = InstrId(self.slots.len() as u32);
        self.slot_offsets.push(instruction.offset);
        self.slots.push(Some(instruction));
        self.order.insert(position, id);
        id
    }

    /// Removes an instruction, tombstoning its slot.
    ///
    /// Returns the removed instruction, or `None` if the handle was already
    /// dead. Operands elsewhere that still reference the handle are left
    /// dangling; reference integrity repair resolves them.
    pub fn remove(&mut self, id: InstrId) -> Option<Instruction> {
        let slot = self.slots.get_mut(id.index())?;
        let removed = slot.take()?;
        self.order.retain(|entry| *entry != id);
        Some(removed)
    }

    /// Removes the inclusive program-order position range `[start, end]`.
    ///
    /// Positions beyond the current length are clamped. Returns the removed
    /// instructions in program order.
    pub fn remove_range(&mut self, start: usize, end: usize) -> Vec<Instruction> {
        if start >= self.order.len() {
            return Vec::new();
        }
        let end = end.min(self.order.len() - 1);
        let ids: Vec<InstrId> = self.order[start..=end].to_vec();

        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(instruction) = self.remove(id) {
                removed.push(instruction);
            }
        }
        removed
    }

    /// Returns the instruction behind a handle, if it is still live.
    #[must_use]
    pub fn get(&self, id: InstrId) -> Option<&Instruction> {
        self.slots.get(id.index())?.as_ref()
    }

    /// Returns the instruction behind a handle mutably, if it is still live.
    pub fn get_mut(&mut self, id: InstrId) -> Option<&mut Instruction> {
        self.slots.get_mut(id.index())?.as_mut()
    }

    /// Returns true if the handle resolves to a live instruction.
    #[must_use]
    pub fn contains(&self, id: InstrId) -> bool {
        self.slots
            .get(id.index())
            .is_some_and(|slot| slot.is_some())
    }

    /// Returns the current program-order position of a live instruction.
    #[must_use]
    pub fn position_of(&self, id: InstrId) -> Option<usize> {
        self.order.iter().position(|entry| *entry == id)
    }

    /// Returns the handle at a program-order position.
    #[must_use]
    pub fn id_at(&self, position: usize) -> Option<InstrId> {
        self.order.get(position).copied()
    }

    /// Returns the handle of the instruction following `id` in program order.
    #[must_use]
    pub fn next_of(&self, id: InstrId) -> Option<InstrId> {
        let position = self.position_of(id)?;
        self.id_at(position + 1)
    }

    /// Returns the handle of the instruction preceding `id` in program order.
    #[must_use]
    pub fn prev_of(&self, id: InstrId) -> Option<InstrId> {
        let position = self.position_of(id)?;
        position.checked_sub(1).and_then(|p| self.id_at(p))
    }

    /// Handle of the first instruction in program order.
    #[must_use]
    pub fn first_id(&self) -> Option<InstrId> {
        self.order.first().copied()
    }

    /// Handle of the last instruction in program order.
    #[must_use]
    pub fn last_id(&self) -> Option<InstrId> {
        self.order.last().copied()
    }

    /// Byte offset recorded for a slot. Unlike [`Body::get`] this also answers
    /// for tombstoned slots, which is what dangling-reference repair needs.
    #[must_use]
    pub fn recorded_offset(&self, id: InstrId) -> Option<u32> {
        self.slot_offsets.get(id.index()).copied()
    }

    /// Iterates live instructions in program order.
    pub fn iter(&self) -> impl Iterator<Item = (InstrId, &Instruction)> + '_ {
        self.order.iter().filter_map(move |id| {
            self.slots
                .get(id.index())
                .and_then(|slot| slot.as_ref())
                .map(|instruction| (*id, instruction))
        })
    }

    /// Snapshot of the current program order.
    ///
    /// Useful when a sweep removes or inserts while walking: the snapshot is
    /// unaffected by the mutation, and dead handles resolve to `None`.
    #[must_use]
    pub fn ids(&self) -> Vec<InstrId> {
        self.order.clone()
    }
}
