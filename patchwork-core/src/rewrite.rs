//! Instruction-stream edits.
//!
//! Every edit is checked twice before it is committed: the net stack delta
//! of the new region (plus any declared compensation) must equal the delta
//! of the region it replaces, and the whole resulting body must pass
//! `MethodBody::verify`. A rejected edit leaves the body untouched.

use std::collections::{HashMap, HashSet};
use std::ops::Range;
use thiserror::Error;

use crate::body::{BodyError, MethodBody};
use crate::instruction::{region_delta, InstrId, Instruction, Opcode, Operand};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RewriteError {
    #[error("pattern '{pattern}' matched nothing")]
    PatternNotFound { pattern: String },

    #[error("pattern '{pattern}' is ambiguous: matches at {first} and {second}")]
    AmbiguousMatch {
        pattern: String,
        first: usize,
        second: usize,
    },

    #[error("range {start}..{end} is outside the body ({len} instructions)")]
    RangeOutOfBounds { start: usize, end: usize, len: usize },

    #[error("edit changes the stack delta: replaced region {expected:+}, new region {actual:+}")]
    ImbalancedEdit { expected: i64, actual: i64 },

    #[error("branch {from} would target removed instruction {to}")]
    DanglingTarget { from: InstrId, to: InstrId },

    #[error("remap source {0} is not inside the replaced range")]
    InvalidRemap(InstrId),

    #[error("anchor {0} is not in the edited body")]
    InvalidAnchor(InstrId),

    #[error("instruction {0} is not a conditional branch")]
    NotConditional(InstrId),

    #[error("edited body fails verification: {0}")]
    Verify(BodyError),
}

impl RewriteError {
    /// Misses caused by the host's code having moved, as opposed to a
    /// faulty rewrite.
    pub fn is_pattern_miss(&self) -> bool {
        matches!(
            self,
            RewriteError::PatternNotFound { .. } | RewriteError::AmbiguousMatch { .. }
        )
    }
}

impl From<BodyError> for RewriteError {
    fn from(err: BodyError) -> Self {
        match err {
            BodyError::DanglingTarget { from, to } => RewriteError::DanglingTarget { from, to },
            other => RewriteError::Verify(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Before,
    After,
}

/// Instructions placed next to `anchor` to offset a deliberate change in
/// the edited region's stack delta.
#[derive(Debug, Clone)]
pub struct Compensation {
    anchor: InstrId,
    placement: Placement,
    instrs: Vec<Instruction>,
}

/// A splice of `range` with `replacement`, plus optional branch remaps and
/// compensation blocks.
#[derive(Debug, Clone)]
pub struct Edit {
    range: Range<usize>,
    replacement: Vec<Instruction>,
    remaps: Vec<(InstrId, InstrId)>,
    compensation: Vec<Compensation>,
}

impl Edit {
    pub fn replace(range: Range<usize>, replacement: Vec<Instruction>) -> Self {
        Edit {
            range,
            replacement,
            remaps: Vec::new(),
            compensation: Vec::new(),
        }
    }

    pub fn insert(at: usize, instrs: Vec<Instruction>) -> Self {
        Self::replace(at..at, instrs)
    }

    /// Branches to the removed instruction `old` are redirected to `new`.
    pub fn remap(mut self, old: InstrId, new: InstrId) -> Self {
        self.remaps.push((old, new));
        self
    }

    pub fn compensate(
        mut self,
        anchor: InstrId,
        placement: Placement,
        instrs: Vec<Instruction>,
    ) -> Self {
        self.compensation.push(Compensation {
            anchor,
            placement,
            instrs,
        });
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EditSummary {
    pub removed: usize,
    pub inserted: usize,
    pub delta: i64,
}

/// Applies `edit` to `body` if, and only if, the result is balanced and
/// structurally valid.
pub fn apply(body: &mut MethodBody, edit: Edit) -> Result<EditSummary, RewriteError> {
    let len = body.len();
    let Range { start, end } = edit.range;
    if start > end || end > len {
        return Err(RewriteError::RangeOutOfBounds { start, end, len });
    }

    let returns_value = body.returns_value();
    let removed = &body.instructions()[start..end];
    let removed_ids: HashSet<InstrId> = removed.iter().map(|i| i.id).collect();

    let expected = region_delta(removed, returns_value);
    let actual = region_delta(&edit.replacement, returns_value)
        + edit
            .compensation
            .iter()
            .map(|c| region_delta(&c.instrs, returns_value))
            .sum::<i64>();
    if expected != actual {
        return Err(RewriteError::ImbalancedEdit { expected, actual });
    }

    let mut remap = HashMap::new();
    for &(old, new) in &edit.remaps {
        if !removed_ids.contains(&old) {
            return Err(RewriteError::InvalidRemap(old));
        }
        remap.insert(old, new);
    }

    let mut candidate = body.clone();
    let inserted = edit.replacement.len()
        + edit.compensation.iter().map(|c| c.instrs.len()).sum::<usize>();
    candidate
        .instructions_mut()
        .splice(start..end, edit.replacement);

    for comp in edit.compensation {
        let pos = candidate
            .position_of(comp.anchor)
            .ok_or(RewriteError::InvalidAnchor(comp.anchor))?;
        let at = match comp.placement {
            Placement::Before => pos,
            Placement::After => pos + 1,
        };
        candidate.instructions_mut().splice(at..at, comp.instrs);
    }

    if !remap.is_empty() {
        for instr in candidate.instructions_mut().iter_mut() {
            if let Operand::Target(t) = &mut instr.operand {
                if let Some(new) = remap.get(t) {
                    *t = *new;
                }
            }
        }
    }

    candidate.verify()?;
    *body = candidate;

    Ok(EditSummary {
        removed: end - start,
        inserted,
        delta: actual,
    })
}

/// Substitutes `range` with `replacement`. Branches into the removed range
/// must be remapped through [`Edit::remap`]; this shorthand declares none.
pub fn replace(
    body: &mut MethodBody,
    range: Range<usize>,
    replacement: Vec<Instruction>,
) -> Result<EditSummary, RewriteError> {
    apply(body, Edit::replace(range, replacement))
}

pub fn insert(
    body: &mut MethodBody,
    at: usize,
    instrs: Vec<Instruction>,
) -> Result<EditSummary, RewriteError> {
    apply(body, Edit::insert(at, instrs))
}

/// Turns `range` into `Nop`s that keep the original ids, so branches into
/// the range stay valid.
pub fn nop_out(body: &mut MethodBody, range: Range<usize>) -> Result<EditSummary, RewriteError> {
    let len = body.len();
    if range.start > range.end || range.end > len {
        return Err(RewriteError::RangeOutOfBounds {
            start: range.start,
            end: range.end,
            len,
        });
    }
    let nops = body.instructions()[range.clone()]
        .iter()
        .map(|i| Instruction::nop().with_id(i.id))
        .collect();
    apply(body, Edit::replace(range, nops))
}

/// Makes the conditional branch `at` unconditional: always taken, or never
/// taken. The condition value is still popped, and the branch's id moves to
/// that pop so incoming branches keep their target.
pub fn force_branch(
    body: &mut MethodBody,
    at: InstrId,
    taken: bool,
) -> Result<EditSummary, RewriteError> {
    let pos = body
        .position_of(at)
        .ok_or(RewriteError::InvalidAnchor(at))?;
    let instr = &body.instructions()[pos];
    if !instr.opcode.is_conditional_branch() {
        return Err(RewriteError::NotConditional(at));
    }
    let target = instr.target().ok_or(RewriteError::NotConditional(at))?;

    let mut replacement = vec![Instruction::new(Opcode::Pop, Operand::None).with_id(at)];
    if taken {
        replacement.push(Instruction::branch(target));
    }
    apply(body, Edit::replace(pos..pos + 1, replacement))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::{Constant, FieldRef, MethodRef};
    use crate::pattern::{find, Matcher, Pattern};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn field_f() -> FieldRef {
        FieldRef::new("World", "gravity").static_field()
    }

    fn method_m() -> MethodRef {
        MethodRef::new("Physics", "SetGravity")
            .with_params(&["float"])
            .static_method()
    }

    /// [LoadField(F), Call(M), Return]
    fn simple_body() -> MethodBody {
        MethodBody::new(
            MethodRef::new("Physics", "Reset").static_method(),
            vec![
                Instruction::load_field(field_f()),
                Instruction::call(method_m()),
                Instruction::ret(),
            ],
        )
    }

    #[test]
    fn balanced_replace_succeeds() {
        let mut body = simple_body();
        let p = Pattern::new("load F").then(Matcher::loads_field("World", "gravity"));
        let range = find(&body, &p).unwrap();

        replace(&mut body, range, vec![Instruction::load_int(0)]).unwrap();

        let ops: Vec<Opcode> = body.instructions().iter().map(|i| i.opcode).collect();
        assert_eq!(ops, vec![Opcode::LoadConst, Opcode::Call, Opcode::Return]);
        assert_eq!(
            body.instructions()[0].operand,
            Operand::Const(Constant::Int(0))
        );
    }

    #[test]
    fn imbalanced_replace_is_rejected_and_body_untouched() {
        let mut body = simple_body();
        let before = body.clone();
        let err = replace(
            &mut body,
            0..1,
            vec![Instruction::load_int(0), Instruction::load_int(0)],
        )
        .unwrap_err();

        assert_eq!(
            err,
            RewriteError::ImbalancedEdit {
                expected: 1,
                actual: 2
            }
        );
        assert_eq!(body, before);
    }

    #[test]
    fn compensation_allows_declared_delta_change() {
        let mut body = simple_body();
        let call_id = body.instructions()[1].id;
        let edit = Edit::replace(
            0..1,
            vec![Instruction::load_int(0), Instruction::load_int(0)],
        )
        .compensate(call_id, Placement::Before, vec![Instruction::pop()]);

        let summary = apply(&mut body, edit).unwrap();
        assert_eq!(summary.delta, 1);
        assert_eq!(body.len(), 5);
        assert_eq!(body.instructions()[2].opcode, Opcode::Pop);
    }

    fn branchy_body() -> (MethodBody, InstrId) {
        // if (flag) { SetGravity(1) } ; return
        let ret = Instruction::ret();
        let skip = Instruction::load_int(1);
        let skip_id = skip.id;
        let body = MethodBody::new(
            MethodRef::new("Physics", "Apply").with_params(&["bool"]),
            vec![
                Instruction::load_arg(1),
                Instruction::branch_if_false(ret.id),
                skip,
                Instruction::call(method_m()),
                ret,
            ],
        );
        (body, skip_id)
    }

    #[test]
    fn removing_a_branch_target_requires_remap() {
        let ret = Instruction::ret();
        let ret_id = ret.id;
        let mut body = MethodBody::new(
            MethodRef::new("Physics", "Apply").with_params(&["bool"]),
            vec![
                Instruction::load_arg(1),
                Instruction::branch_if_false(ret_id),
                Instruction::nop(),
                ret,
            ],
        );

        let new_ret = Instruction::ret();
        let new_id = new_ret.id;
        let err = replace(&mut body, 3..4, vec![new_ret.clone()]).unwrap_err();
        assert_eq!(
            err,
            RewriteError::DanglingTarget {
                from: body.instructions()[1].id,
                to: ret_id
            }
        );

        apply(&mut body, Edit::replace(3..4, vec![new_ret]).remap(ret_id, new_id)).unwrap();
        assert_eq!(body.instructions()[1].target(), Some(new_id));
    }

    #[test]
    fn remap_source_must_be_removed() {
        let (mut body, skip_id) = branchy_body();
        let edit = Edit::replace(0..0, vec![]).remap(skip_id, skip_id);
        assert_eq!(apply(&mut body, edit), Err(RewriteError::InvalidRemap(skip_id)));
    }

    #[test]
    fn insert_keeps_targets() {
        let (mut body, _) = branchy_body();
        let target_before = body.instructions()[1].target();
        insert(
            &mut body,
            2,
            vec![Instruction::load_int(7), Instruction::pop()],
        )
        .unwrap();
        assert_eq!(body.instructions()[1].target(), target_before);
        assert_eq!(body.len(), 7);
    }

    #[test]
    fn insert_that_unbalances_is_rejected() {
        let (mut body, _) = branchy_body();
        let err = insert(&mut body, 2, vec![Instruction::load_int(7)]).unwrap_err();
        assert!(matches!(err, RewriteError::ImbalancedEdit { expected: 0, actual: 1 }));
    }

    #[test]
    fn nop_out_preserves_identity() {
        let (mut body, skip_id) = branchy_body();
        let ids: Vec<InstrId> = body.instructions().iter().map(|i| i.id).collect();
        nop_out(&mut body, 2..4).unwrap();
        let after: Vec<InstrId> = body.instructions().iter().map(|i| i.id).collect();
        assert_eq!(ids, after);
        assert_eq!(body.get(skip_id).map(|i| i.opcode), Some(Opcode::Nop));
    }

    #[test]
    fn nop_out_of_unbalanced_region_is_rejected() {
        let (mut body, _) = branchy_body();
        // ldarg alone pushes one value
        assert!(matches!(
            nop_out(&mut body, 0..1),
            Err(RewriteError::ImbalancedEdit { expected: 1, actual: 0 })
        ));
        nop_out(&mut body, 0..2).unwrap();
    }

    #[test]
    fn force_branch_variants() {
        let (mut body, _) = branchy_body();
        let br = body.instructions()[1].id;
        let mut never = body.clone();

        force_branch(&mut body, br, true).unwrap();
        assert_eq!(body.instructions()[1].opcode, Opcode::Pop);
        assert_eq!(body.instructions()[1].id, br);
        assert_eq!(body.instructions()[2].opcode, Opcode::Branch);

        force_branch(&mut never, br, false).unwrap();
        assert_eq!(never.len(), 5);
        assert_eq!(never.instructions()[1].opcode, Opcode::Pop);

        let first = never.instructions()[0].id;
        assert_eq!(
            force_branch(&mut never, first, true),
            Err(RewriteError::NotConditional(first))
        );
    }

    #[test]
    fn out_of_bounds_range() {
        let mut body = simple_body();
        assert!(matches!(
            replace(&mut body, 2..9, vec![]),
            Err(RewriteError::RangeOutOfBounds { len: 3, .. })
        ));
    }

    /// A random block whose net stack effect is zero and which never dips
    /// below its entry depth.
    fn balanced_block(rng: &mut StdRng) -> Vec<Instruction> {
        let mut out = Vec::new();
        let mut depth = 0u32;
        for _ in 0..rng.gen_range(1..12) {
            match rng.gen_range(0..5) {
                0 => {
                    out.push(Instruction::load_int(rng.gen_range(-5..5)));
                    depth += 1;
                }
                1 if depth >= 2 => {
                    out.push(Instruction::op(Opcode::Add));
                    depth -= 1;
                }
                2 if depth >= 1 => {
                    out.push(Instruction::op(Opcode::Neg));
                }
                3 if depth >= 1 => {
                    out.push(Instruction::dup());
                    depth += 1;
                }
                _ => out.push(Instruction::nop()),
            }
        }
        for _ in 0..depth {
            out.push(Instruction::pop());
        }
        out
    }

    #[test]
    fn random_balanced_edits_preserve_deltas() {
        let mut rng = StdRng::seed_from_u64(0x5EED);
        let shipped_delta = region_delta(branchy_body().0.instructions(), false);
        for _ in 0..200 {
            let (mut body, _) = branchy_body();
            let original_profile = body.verify().unwrap();
            let ret_depth_before = original_profile.entry_depths[4];

            // only positions where the entry depth is known
            let at = rng.gen_range(0..=4);
            let block = balanced_block(&mut rng);
            let block_len = block.len();
            assert_eq!(region_delta(&block, false), 0);
            insert(&mut body, at, block).unwrap();

            // swap the inserted region for another balanced block
            let swap = balanced_block(&mut rng);
            let swap_len = swap.len();
            replace(&mut body, at..at + block_len, swap).unwrap();
            assert_eq!(body.len(), 5 + swap_len);

            // blank a random balanced prefix of it
            let blank = rng.gen_range(0..=swap_len);
            if region_delta(&body.instructions()[at..at + blank], false) == 0 {
                nop_out(&mut body, at..at + blank).unwrap();
            } else {
                assert!(matches!(
                    nop_out(&mut body, at..at + blank),
                    Err(RewriteError::ImbalancedEdit { .. })
                ));
            }

            let profile = body.verify().unwrap();
            let ret_pos = body
                .instructions()
                .iter()
                .rposition(|i| i.opcode == Opcode::Return)
                .unwrap();
            assert_eq!(profile.entry_depths[ret_pos], ret_depth_before);
            assert_eq!(region_delta(body.instructions(), false), shipped_delta);

            let raw = body.to_raw().unwrap();
            let reread = MethodBody::from_raw(body.signature().clone(), &raw).unwrap();
            assert_eq!(reread.verify().unwrap().entry_depths, profile.entry_depths);
        }
    }
}
