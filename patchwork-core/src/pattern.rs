//! Instruction-stream pattern matching.
//!
//! A pattern is a list of per-instruction matchers, optionally separated by
//! bounded gaps. Matching is leftmost-first and, for a given start, picks the
//! shortest match, so the same pattern on the same body always yields the
//! same range.

use std::collections::BTreeSet;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use crate::body::MethodBody;
use crate::instruction::{Constant, InstrId, Instruction, Opcode, Operand};
use crate::rewrite::RewriteError;

/// Largest gap a pattern may declare. Larger requests are clamped so that
/// matching stays bounded on pathological bodies.
pub const MAX_GAP: usize = 64;

type Predicate = Arc<dyn Fn(&Instruction) -> bool + Send + Sync>;

/// Predicate over a single instruction, with a description for reports.
#[derive(Clone)]
pub struct Matcher {
    desc: String,
    pred: Predicate,
}

impl Matcher {
    pub fn custom<F>(desc: &str, pred: F) -> Self
    where
        F: Fn(&Instruction) -> bool + Send + Sync + 'static,
    {
        Matcher {
            desc: desc.to_string(),
            pred: Arc::new(pred),
        }
    }

    pub fn any() -> Self {
        Self::custom("any", |_| true)
    }

    pub fn opcode(opcode: Opcode) -> Self {
        Self::custom(&opcode.to_string(), move |i| i.opcode == opcode)
    }

    /// Exact opcode and operand.
    pub fn exact(opcode: Opcode, operand: Operand) -> Self {
        let desc = format!("{}", Instruction::new(opcode, operand.clone()));
        Self::custom(&desc, move |i| i.opcode == opcode && i.operand == operand)
    }

    pub fn loads_field(declaring_type: &str, name: &str) -> Self {
        let ty = declaring_type.to_string();
        let n = name.to_string();
        Self::custom(&format!("ldfld {}::{}", ty, n), move |i| {
            i.opcode == Opcode::LoadField
                && i.field()
                    .map_or(false, |f| f.declaring_type == ty && f.name == n)
        })
    }

    pub fn stores_field(declaring_type: &str, name: &str) -> Self {
        let ty = declaring_type.to_string();
        let n = name.to_string();
        Self::custom(&format!("stfld {}::{}", ty, n), move |i| {
            i.opcode == Opcode::StoreField
                && i.field()
                    .map_or(false, |f| f.declaring_type == ty && f.name == n)
        })
    }

    pub fn calls(declaring_type: &str, name: &str) -> Self {
        let ty = declaring_type.to_string();
        let n = name.to_string();
        Self::custom(&format!("call {}::{}", ty, n), move |i| {
            i.opcode == Opcode::Call
                && i.method()
                    .map_or(false, |m| m.declaring_type == ty && m.name == n)
        })
    }

    pub fn load_int(value: i64) -> Self {
        Self::exact(Opcode::LoadConst, Operand::Const(Constant::Int(value)))
    }

    pub fn branch() -> Self {
        Self::custom("branch", |i| i.opcode.is_branch())
    }

    pub fn matches(&self, instr: &Instruction) -> bool {
        (self.pred)(instr)
    }
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Matcher({})", self.desc)
    }
}

#[derive(Debug, Clone)]
enum Step {
    Match(Matcher),
    /// Skip between 0 and `max` instructions.
    Gap { max: usize },
}

#[derive(Debug, Clone)]
pub struct Pattern {
    name: String,
    steps: Vec<Step>,
}

impl Pattern {
    pub fn new(name: &str) -> Self {
        Pattern {
            name: name.to_string(),
            steps: Vec::new(),
        }
    }

    pub fn then(mut self, matcher: Matcher) -> Self {
        self.steps.push(Step::Match(matcher));
        self
    }

    /// Allows up to `max` unrelated instructions before the next matcher.
    pub fn skip_up_to(mut self, max: usize) -> Self {
        self.steps.push(Step::Gap {
            max: max.min(MAX_GAP),
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn is_empty(&self) -> bool {
        !self.steps.iter().any(|s| matches!(s, Step::Match(_)))
    }

    /// Shortest match starting exactly at `start`, as an end position.
    ///
    /// Tracks the set of positions reachable after each step instead of
    /// backtracking, so the cost is bounded by steps x body length x gap.
    fn match_at(&self, instrs: &[Instruction], start: usize) -> Option<usize> {
        let mut frontier: BTreeSet<usize> = BTreeSet::new();
        frontier.insert(start);

        // leading gaps are not part of the match
        let steps = self
            .steps
            .iter()
            .skip_while(|s| matches!(s, Step::Gap { .. }));
        for step in steps {
            let mut next = BTreeSet::new();
            match step {
                Step::Match(m) => {
                    for &pos in &frontier {
                        if pos < instrs.len() && m.matches(&instrs[pos]) {
                            next.insert(pos + 1);
                        }
                    }
                }
                Step::Gap { max } => {
                    for &pos in &frontier {
                        let last = (pos + max).min(instrs.len());
                        next.extend(pos..=last);
                    }
                }
            }
            if next.is_empty() {
                return None;
            }
            frontier = next;
        }

        frontier.into_iter().next()
    }

    fn find_from(&self, instrs: &[Instruction], from: usize) -> Option<Range<usize>> {
        if self.is_empty() {
            return None;
        }
        (from..instrs.len()).find_map(|start| self.match_at(instrs, start).map(|end| start..end))
    }

    fn all_from(&self, instrs: &[Instruction], mut from: usize) -> Vec<Range<usize>> {
        let mut out = Vec::new();
        while let Some(range) = self.find_from(instrs, from) {
            from = range.end.max(range.start + 1);
            out.push(range);
        }
        out
    }

    fn single(&self, matches: Vec<Range<usize>>) -> Result<Range<usize>, RewriteError> {
        let mut matches = matches.into_iter();
        match (matches.next(), matches.next()) {
            (Some(range), None) => Ok(range),
            (None, _) => Err(RewriteError::PatternNotFound {
                pattern: self.name.clone(),
            }),
            (Some(first), Some(second)) => Err(RewriteError::AmbiguousMatch {
                pattern: self.name.clone(),
                first: first.start,
                second: second.start,
            }),
        }
    }
}

/// Leftmost match of `pattern` in `body`. `None` is the expected outcome
/// when a host update moved or removed the targeted code.
pub fn find(body: &MethodBody, pattern: &Pattern) -> Option<Range<usize>> {
    pattern.find_from(body.instructions(), 0)
}

/// Leftmost match that starts strictly after the instruction `anchor`.
pub fn find_after(body: &MethodBody, pattern: &Pattern, anchor: InstrId) -> Option<Range<usize>> {
    let pos = body.position_of(anchor)?;
    pattern.find_from(body.instructions(), pos + 1)
}

/// Every non-overlapping match, leftmost first.
pub fn find_all(body: &MethodBody, pattern: &Pattern) -> Vec<Range<usize>> {
    pattern.all_from(body.instructions(), 0)
}

/// The single site matching `pattern`. A pattern that matches in more than
/// one place is refused rather than resolved to its first hit.
pub fn find_unique(body: &MethodBody, pattern: &Pattern) -> Result<Range<usize>, RewriteError> {
    pattern.single(pattern.all_from(body.instructions(), 0))
}

/// [`find_unique`] restricted to the code after the instruction `anchor`.
pub fn find_unique_after(
    body: &MethodBody,
    pattern: &Pattern,
    anchor: InstrId,
) -> Result<Range<usize>, RewriteError> {
    let pos = body
        .position_of(anchor)
        .ok_or(RewriteError::InvalidAnchor(anchor))?;
    pattern.single(pattern.all_from(body.instructions(), pos + 1))
}

/// `find`, but turns a miss into the error a rewrite function returns.
pub fn expect(body: &MethodBody, pattern: &Pattern) -> Result<Range<usize>, RewriteError> {
    find(body, pattern).ok_or_else(|| RewriteError::PatternNotFound {
        pattern: pattern.name().to_string(),
    })
}
