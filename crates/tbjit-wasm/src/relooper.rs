//! Structured control-flow reconstruction.
//!
//! Wasm only has nested `block`/`loop`/`if`, so an arbitrary jump graph is rewritten into a tree
//! of three shapes:
//!
//! - `Simple`: one block that cannot reach itself, followed by whatever comes next.
//! - `Loop`: every block that can get back to one of the entries, wrapped in a wasm `loop`.
//! - `Multiple`: entries whose reachable sets are disjoint from each other's, selected at run time
//!   by testing the label variable.
//!
//! Each edge is classified exactly once, by the outermost shape it crosses. Edges into the shape
//! that directly follows a `Simple` are [`Flow::Direct`]. Edges back to a loop's entries are
//! [`Flow::Continue`]. Edges out of a loop or a multiple are [`Flow::Break`].
//!
//! Every branch assigns the target's label before it transfers, so a `Multiple` (or a loop
//! re-entered through `Continue`) always knows which entry was meant. Blocks that nothing reaches
//! become extra entries of the root region and are emitted like everything else.

use std::collections::{BTreeMap, BTreeSet};

pub type ShapeId = u32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    /// Fall out of the current block into the shape that follows it.
    Direct,
    /// Leave the `block` wrapping shape `id`.
    Break(ShapeId),
    /// Restart the `loop` of shape `id`.
    Continue(ShapeId),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Shape<Id> {
    Simple {
        block: Id,
        next: Option<Box<Shape<Id>>>,
    },
    Loop {
        id: ShapeId,
        inner: Box<Shape<Id>>,
        next: Option<Box<Shape<Id>>>,
    },
    Multiple {
        id: ShapeId,
        handled: Vec<(Id, Shape<Id>)>,
        next: Option<Box<Shape<Id>>>,
    },
}

/// Structured tree handed to the emitter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Node<Id> {
    /// A basic block's code, including its branch.
    Basic(Id),
    /// `block ... end`; `Flow::Break(id)` jumps to its end.
    Block { id: ShapeId, body: Vec<Node<Id>> },
    /// `loop ... end`; `Flow::Continue(id)` jumps to its start.
    Loop { id: ShapeId, body: Vec<Node<Id>> },
    /// Run the arm whose entry matches the current label.
    Dispatch { arms: Vec<(Id, Vec<Node<Id>>)> },
}

#[derive(Clone, Debug)]
pub struct Structured<Id> {
    pub root: Shape<Id>,
    pub body: Vec<Node<Id>>,
    flows: BTreeMap<(Id, Id), Flow>,
}

impl<Id: Copy + Ord> Structured<Id> {
    /// How the edge `from -> to` is taken. `None` if the graph has no such edge.
    pub fn flow(&self, from: Id, to: Id) -> Option<Flow> {
        self.flows.get(&(from, to)).copied()
    }
}

/// Reconstruct structured control flow for the graph `succs`, entered at `entry`.
///
/// Every block must appear as a key of `succs`, with an empty list if it has no successors.
pub fn reloop<Id: Copy + Ord>(entry: Id, succs: &BTreeMap<Id, Vec<Id>>) -> Structured<Id> {
    let mut relooper = Relooper {
        succs: succs
            .iter()
            .map(|(&b, ts)| (b, ts.iter().copied().collect()))
            .collect(),
        flows: BTreeMap::new(),
        next_id: 0,
    };

    let region: BTreeSet<Id> = succs.keys().copied().collect();
    let mut entries = BTreeSet::from([entry]);
    let mut reached = relooper.reach(&entries, &region);
    for &b in &region {
        if !reached.contains(&b) {
            entries.insert(b);
            reached = relooper.reach(&entries, &region);
        }
    }

    let root = relooper.shape(entries, region);
    let body = lower(&root);
    Structured {
        root,
        body,
        flows: relooper.flows,
    }
}

struct Relooper<Id> {
    /// Edges not yet classified.
    succs: BTreeMap<Id, BTreeSet<Id>>,
    flows: BTreeMap<(Id, Id), Flow>,
    next_id: ShapeId,
}

impl<Id: Copy + Ord> Relooper<Id> {
    fn fresh(&mut self) -> ShapeId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn succs_in(&self, block: Id, region: &BTreeSet<Id>) -> Vec<Id> {
        self.succs
            .get(&block)
            .map(|ts| ts.iter().copied().filter(|t| region.contains(t)).collect())
            .unwrap_or_default()
    }

    fn classify(&mut self, from: Id, to: Id, flow: Flow) {
        if let Some(ts) = self.succs.get_mut(&from) {
            if ts.remove(&to) {
                self.flows.insert((from, to), flow);
            }
        }
    }

    /// `from` plus everything reachable from it inside `region` over unclassified edges.
    fn reach(&self, from: &BTreeSet<Id>, region: &BTreeSet<Id>) -> BTreeSet<Id> {
        let mut seen: BTreeSet<Id> = from.iter().copied().filter(|b| region.contains(b)).collect();
        let mut work: Vec<Id> = seen.iter().copied().collect();
        while let Some(b) = work.pop() {
            for t in self.succs_in(b, region) {
                if seen.insert(t) {
                    work.push(t);
                }
            }
        }
        seen
    }

    fn reaches_any(&self, block: Id, targets: &BTreeSet<Id>, region: &BTreeSet<Id>) -> bool {
        let start: BTreeSet<Id> = self.succs_in(block, region).into_iter().collect();
        self.reach(&start, region)
            .iter()
            .any(|b| targets.contains(b))
    }

    fn calculate(&mut self, entries: BTreeSet<Id>, region: BTreeSet<Id>) -> Option<Box<Shape<Id>>> {
        if entries.is_empty() {
            return None;
        }
        Some(Box::new(self.shape(entries, region)))
    }

    /// `entries` must be non-empty, and every block of `region` reachable from them.
    fn shape(&mut self, entries: BTreeSet<Id>, region: BTreeSet<Id>) -> Shape<Id> {
        if let (1, Some(&entry)) = (entries.len(), entries.first()) {
            if !self.reaches_any(entry, &entries, &region) {
                return self.simple(entry, region);
            }
            return self.make_loop(entries, region);
        }
        match self.make_multiple(&entries, &region) {
            Some(shape) => shape,
            None => self.make_loop(entries, region),
        }
    }

    fn simple(&mut self, block: Id, mut region: BTreeSet<Id>) -> Shape<Id> {
        region.remove(&block);
        let next_entries: BTreeSet<Id> = self.succs_in(block, &region).into_iter().collect();
        for &t in &next_entries {
            self.classify(block, t, Flow::Direct);
        }
        Shape::Simple {
            block,
            next: self.calculate(next_entries, region),
        }
    }

    fn make_loop(&mut self, entries: BTreeSet<Id>, region: BTreeSet<Id>) -> Shape<Id> {
        let id = self.fresh();
        let body: BTreeSet<Id> = self
            .reach(&entries, &region)
            .into_iter()
            .filter(|&b| entries.contains(&b) || self.reaches_any(b, &entries, &region))
            .collect();

        let mut next_entries = BTreeSet::new();
        for &b in &body {
            for t in self.succs_in(b, &region) {
                if entries.contains(&t) {
                    self.classify(b, t, Flow::Continue(id));
                } else if !body.contains(&t) {
                    self.classify(b, t, Flow::Break(id));
                    next_entries.insert(t);
                }
            }
        }

        let rest: BTreeSet<Id> = region.difference(&body).copied().collect();
        let inner = Box::new(self.shape(entries, body));
        Shape::Loop {
            id,
            inner,
            next: self.calculate(next_entries, rest),
        }
    }

    fn make_multiple(&mut self, entries: &BTreeSet<Id>, region: &BTreeSet<Id>) -> Option<Shape<Id>> {
        let reaches: BTreeMap<Id, BTreeSet<Id>> = entries
            .iter()
            .map(|&e| (e, self.reach(&BTreeSet::from([e]), region)))
            .collect();
        let reached_by_other = |e: Id, b: Id| {
            reaches
                .iter()
                .any(|(&other, reach)| other != e && reach.contains(&b))
        };

        let groups: Vec<(Id, BTreeSet<Id>)> = entries
            .iter()
            .filter(|&&e| !reached_by_other(e, e))
            .map(|&e| {
                let group = reaches[&e]
                    .iter()
                    .copied()
                    .filter(|&b| !reached_by_other(e, b))
                    .collect();
                (e, group)
            })
            .collect();
        if groups.is_empty() {
            return None;
        }

        let id = self.fresh();
        let mut next_entries: BTreeSet<Id> = entries
            .iter()
            .copied()
            .filter(|e| !groups.iter().any(|(g, _)| g == e))
            .collect();
        let mut rest = region.clone();
        for (_, group) in &groups {
            for &b in group {
                rest.remove(&b);
                for t in self.succs_in(b, region) {
                    if !group.contains(&t) {
                        self.classify(b, t, Flow::Break(id));
                        next_entries.insert(t);
                    }
                }
            }
        }

        let handled = groups
            .into_iter()
            .map(|(e, group)| (e, self.shape(BTreeSet::from([e]), group)))
            .collect();
        Some(Shape::Multiple {
            id,
            handled,
            next: self.calculate(next_entries, rest),
        })
    }
}

fn lower<Id: Copy>(shape: &Shape<Id>) -> Vec<Node<Id>> {
    let mut out = Vec::new();
    let mut cur = Some(shape);
    while let Some(shape) = cur {
        cur = match shape {
            Shape::Simple { block, next } => {
                out.push(Node::Basic(*block));
                next.as_deref()
            }
            Shape::Loop { id, inner, next } => {
                out.push(Node::Block {
                    id: *id,
                    body: vec![Node::Loop {
                        id: *id,
                        body: lower(inner),
                    }],
                });
                next.as_deref()
            }
            Shape::Multiple { id, handled, next } => {
                let arms = handled.iter().map(|(e, s)| (*e, lower(s))).collect();
                out.push(Node::Block {
                    id: *id,
                    body: vec![Node::Dispatch { arms }],
                });
                next.as_deref()
            }
        };
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(u32, &[u32])]) -> BTreeMap<u32, Vec<u32>> {
        edges.iter().map(|(b, ts)| (*b, ts.to_vec())).collect()
    }

    #[test]
    fn straight_line_is_a_chain_of_simples() {
        let s = reloop(0, &graph(&[(0, &[1]), (1, &[2]), (2, &[])]));
        assert_eq!(s.body, vec![Node::Basic(0), Node::Basic(1), Node::Basic(2)]);
        assert_eq!(s.flow(0, 1), Some(Flow::Direct));
        assert_eq!(s.flow(1, 2), Some(Flow::Direct));
    }

    #[test]
    fn self_loop_becomes_continue() {
        let s = reloop(0, &graph(&[(0, &[0, 1]), (1, &[])]));
        assert_eq!(
            s.body,
            vec![
                Node::Block {
                    id: 0,
                    body: vec![Node::Loop {
                        id: 0,
                        body: vec![Node::Basic(0)]
                    }]
                },
                Node::Basic(1),
            ]
        );
        assert_eq!(s.flow(0, 0), Some(Flow::Continue(0)));
        assert_eq!(s.flow(0, 1), Some(Flow::Break(0)));
    }

    #[test]
    fn diamond_dispatches_on_label_then_joins() {
        let s = reloop(
            0,
            &graph(&[(0, &[1, 2]), (1, &[3]), (2, &[3]), (3, &[])]),
        );
        assert_eq!(
            s.body,
            vec![
                Node::Basic(0),
                Node::Block {
                    id: 0,
                    body: vec![Node::Dispatch {
                        arms: vec![(1, vec![Node::Basic(1)]), (2, vec![Node::Basic(2)])]
                    }]
                },
                Node::Basic(3),
            ]
        );
        assert_eq!(s.flow(1, 3), Some(Flow::Break(0)));
        assert_eq!(s.flow(2, 3), Some(Flow::Break(0)));
    }

    #[test]
    fn irreducible_pair_is_a_loop_over_a_multiple() {
        // 0 enters the 1 <-> 2 cycle at either node.
        let s = reloop(0, &graph(&[(0, &[1, 2]), (1, &[2, 3]), (2, &[1]), (3, &[])]));
        let Shape::Simple { next: Some(next), .. } = &s.root else {
            panic!("expected simple root: {:?}", s.root);
        };
        let Shape::Loop { id, inner, .. } = next.as_ref() else {
            panic!("expected loop: {next:?}");
        };
        assert!(matches!(inner.as_ref(), Shape::Multiple { handled, .. } if handled.len() == 2));
        assert_eq!(s.flow(1, 2), Some(Flow::Continue(*id)));
        assert_eq!(s.flow(2, 1), Some(Flow::Continue(*id)));
        assert_eq!(s.flow(1, 3), Some(Flow::Break(*id)));
    }

    #[test]
    fn unreachable_blocks_become_extra_entries() {
        let s = reloop(0, &graph(&[(0, &[]), (1, &[2]), (2, &[])]));
        let mut seen = Vec::new();
        fn walk(nodes: &[Node<u32>], seen: &mut Vec<u32>) {
            for n in nodes {
                match n {
                    Node::Basic(b) => seen.push(*b),
                    Node::Block { body, .. } | Node::Loop { body, .. } => walk(body, seen),
                    Node::Dispatch { arms } => arms.iter().for_each(|(_, b)| walk(b, seen)),
                }
            }
        }
        walk(&s.body, &mut seen);
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2]);
        assert_eq!(s.flow(1, 2), Some(Flow::Direct));
    }
}
