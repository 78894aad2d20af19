//! # Pattern Rewrite Engine
//!
//! Structural patterns over [`UOp`] DAGs with a bottom-up fixpoint
//! rewriter. A rule pairs a [`UPat`] with a function over the pattern's
//! named captures; the function returns a replacement node or `None` to
//! decline. [`graph_rewrite`] rebuilds the DAG sources-first and applies
//! the first matching rule at every node until nothing changes, using
//! structural equality as the termination check.

use std::collections::HashMap;

use crate::uop::{UOp, UOpKind};

/// A structural pattern: a set of accepted op kinds (empty = any), an
/// optional exact-arity source pattern list, and an optional capture name.
#[derive(Debug, Clone, Default)]
pub struct UPat {
    pub ops: Vec<UOpKind>,
    pub src: Option<Vec<UPat>>,
    pub name: Option<&'static str>,
}

impl UPat {
    /// Match any node
    pub fn any() -> UPat {
        UPat::default()
    }

    pub fn op(op: UOpKind) -> UPat {
        UPat {
            ops: vec![op],
            ..UPat::default()
        }
    }

    pub fn ops(ops: &[UOpKind]) -> UPat {
        UPat {
            ops: ops.to_vec(),
            ..UPat::default()
        }
    }

    pub fn named(mut self, name: &'static str) -> UPat {
        self.name = Some(name);
        self
    }

    pub fn with_src(mut self, src: Vec<UPat>) -> UPat {
        self.src = Some(src);
        self
    }

    fn matches(&self, node: &UOp, captures: &mut Captures) -> bool {
        if !self.ops.is_empty() && !self.ops.contains(&node.op) {
            return false;
        }
        if let Some(src_pats) = &self.src {
            if src_pats.len() != node.src.len() {
                return false;
            }
            for (pat, child) in src_pats.iter().zip(&node.src) {
                if !pat.matches(child, captures) {
                    return false;
                }
            }
        }
        if let Some(name) = self.name {
            captures.insert(name, node.clone());
        }
        true
    }
}

/// Named captures of a successful match
pub type Captures = HashMap<&'static str, UOp>;

type RewriteFn = Box<dyn Fn(&Captures) -> Option<UOp>>;

/// An ordered list of rewrite rules. Earlier rules win.
pub struct PatternMatcher {
    rules: Vec<(UPat, RewriteFn)>,
}

impl PatternMatcher {
    pub fn new() -> PatternMatcher {
        PatternMatcher { rules: Vec::new() }
    }

    pub fn rule(
        mut self,
        pat: UPat,
        f: impl Fn(&Captures) -> Option<UOp> + 'static,
    ) -> PatternMatcher {
        self.rules.push((pat, Box::new(f)));
        self
    }

    /// Apply the first rule that matches and rewrites `node`
    fn rewrite_once(&self, node: &UOp) -> Option<UOp> {
        for (pat, f) in &self.rules {
            let mut captures = Captures::new();
            if pat.matches(node, &mut captures) {
                if let Some(ret) = f(&captures) {
                    if &ret != node {
                        return Some(ret);
                    }
                }
            }
        }
        None
    }
}

impl Default for PatternMatcher {
    fn default() -> Self {
        PatternMatcher::new()
    }
}

/// Rewrite a DAG bottom-up to fixpoint.
///
/// Sources are rewritten before their consumers; a rewritten node is
/// itself re-run through source rewriting and the rule list until no rule
/// fires. Shared subtrees are rewritten once via the memo table.
pub fn graph_rewrite(root: &UOp, matcher: &PatternMatcher) -> UOp {
    let mut memo: HashMap<UOp, UOp> = HashMap::new();
    rewrite_node(root, matcher, &mut memo)
}

fn rewrite_node(node: &UOp, matcher: &PatternMatcher, memo: &mut HashMap<UOp, UOp>) -> UOp {
    if let Some(done) = memo.get(node) {
        return done.clone();
    }
    let mut current = node.clone();
    loop {
        let new_src: Vec<UOp> = current
            .src
            .iter()
            .map(|s| rewrite_node(s, matcher, memo))
            .collect();
        if new_src != current.src {
            current = UOp::new(current.op, current.dtype.clone(), new_src, current.arg.clone());
        }
        match matcher.rewrite_once(&current) {
            Some(next) => current = next,
            None => break,
        }
    }
    memo.insert(node.clone(), current.clone());
    current
}
