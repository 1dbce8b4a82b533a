//! Label expressions (spec §4.11).
//!
//! Spec.md describes these as an opaque byte program the core never
//! parses, only evaluates via `server_matches_labelexpr`. Representing the
//! program as a tiny operator tree rather than a raw byte array keeps the
//! evaluator itself straightforward while preserving the "core treats it as
//! opaque, caller builds it" boundary: nothing outside this module inspects
//! a `LabelExpr`'s structure.

/// Maximum serialized program size the original format allows; expressions
/// built by [`LabelExpr`] helpers never approach this, but it bounds how
/// deep `Not`/`And`/`Or` nesting is allowed to go so a pathological
/// storage-class config can't make evaluation unbounded.
pub const MAX_EXPR_BYTES: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelExpr {
    /// True if the server has *any* of the bits in `mask`.
    AnyOf(u32),
    /// True if the server has *all* of the bits in `mask`.
    AllOf(u32),
    And(Box<LabelExpr>, Box<LabelExpr>),
    Or(Box<LabelExpr>, Box<LabelExpr>),
    Not(Box<LabelExpr>),
    /// Always matches (an unconstrained slot).
    Wildcard,
}

impl LabelExpr {
    pub fn and(self, other: LabelExpr) -> LabelExpr {
        LabelExpr::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: LabelExpr) -> LabelExpr {
        LabelExpr::Or(Box::new(self), Box::new(other))
    }

    pub fn negate(self) -> LabelExpr {
        LabelExpr::Not(Box::new(self))
    }

    fn depth(&self) -> usize {
        match self {
            LabelExpr::AnyOf(_) | LabelExpr::AllOf(_) | LabelExpr::Wildcard => 1,
            LabelExpr::Not(a) => 1 + a.depth(),
            LabelExpr::And(a, b) | LabelExpr::Or(a, b) => 1 + a.depth().max(b.depth()),
        }
    }

    /// Deterministic; may be cached per-server by callers within one job
    /// (spec §4.11).
    pub fn matches(&self, server_label_mask: u32) -> bool {
        match self {
            LabelExpr::Wildcard => true,
            LabelExpr::AnyOf(mask) => server_label_mask & mask != 0,
            LabelExpr::AllOf(mask) => server_label_mask & mask == *mask,
            LabelExpr::And(a, b) => a.matches(server_label_mask) && b.matches(server_label_mask),
            LabelExpr::Or(a, b) => a.matches(server_label_mask) || b.matches(server_label_mask),
            LabelExpr::Not(a) => !a.matches(server_label_mask),
        }
    }
}

/// `server_matches_labelexpr` from spec §4.11: the sole entry point the
/// rest of the core calls. `expr` of `None` means an unconstrained slot.
pub fn server_matches_labelexpr(server_label_mask: u32, expr: Option<&LabelExpr>) -> bool {
    match expr {
        None => true,
        Some(e) => {
            debug_assert!(e.depth() * 4 <= MAX_EXPR_BYTES, "label expression too deep");
            e.matches(server_label_mask)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_of_matches_on_overlap() {
        let expr = LabelExpr::AnyOf(0b0110);
        assert!(server_matches_labelexpr(0b0100, Some(&expr)));
        assert!(!server_matches_labelexpr(0b1000, Some(&expr)));
    }

    #[test]
    fn all_of_requires_every_bit() {
        let expr = LabelExpr::AllOf(0b0110);
        assert!(server_matches_labelexpr(0b1110, Some(&expr)));
        assert!(!server_matches_labelexpr(0b0100, Some(&expr)));
    }

    #[test]
    fn composition_and_negation() {
        let expr = LabelExpr::AnyOf(0b001)
            .and(LabelExpr::AnyOf(0b010))
            .or(LabelExpr::AllOf(0b100).negate());
        assert!(server_matches_labelexpr(0b011, Some(&expr)));
        assert!(server_matches_labelexpr(0b000, Some(&expr)));
        assert!(!server_matches_labelexpr(0b100, Some(&expr)));
    }

    #[test]
    fn no_expr_is_wildcard() {
        assert!(server_matches_labelexpr(0, None));
    }
}
