//! Chain simplifier.
//!
//! Normalizes a combinator chain before translation: fuses adjacent
//! `Select`/`SelectMany` pairs, merges and hoists `Where` clauses, beta
//! reduces inline lambda applications, and folds constant tuple subscripts.
//! The translator can then assume at most one `SelectMany` depth between any
//! two combinators and never sees an `Invoke`.

use std::collections::HashMap;

use thiserror::Error;

use crate::ast::{AggregateInit, BoolOpKind, Lambda, Literal, Node, NodeId, Query};
use crate::names::NameGen;

#[derive(Debug, Error)]
pub enum SimplifyError {
    /// The tree is not a well-formed query chain.
    #[error("malformed query: {0}")]
    QueryShape(String),

    /// Valid query, but a shape this compiler does not lower.
    #[error("unsupported query structure: {0}")]
    UnsupportedStructure(String),
}

/// Simplify the subtree rooted at `root`, returning the new root.
pub fn simplify(
    q: &mut Query,
    root: NodeId,
    names: &mut NameGen,
) -> Result<NodeId, SimplifyError> {
    Simplifier { q, names }.visit(root)
}

struct Simplifier<'a> {
    q: &'a mut Query,
    names: &'a mut NameGen,
}

impl Simplifier<'_> {
    fn visit(&mut self, id: NodeId) -> Result<NodeId, SimplifyError> {
        let node = self.q.node(id).clone();
        match node {
            Node::Source | Node::Name { .. } | Node::Literal { .. } => Ok(id),

            Node::Select { source, selector } => {
                let source = self.visit(source)?;
                let selector = self.visit_lambda(&selector)?;
                self.visit_select(source, selector)
            }
            Node::SelectMany { source, selector } => {
                let source = self.visit(source)?;
                let selector = self.visit_lambda(&selector)?;
                self.visit_select_many(source, selector)
            }
            Node::Where { source, predicate } => {
                let source = self.visit(source)?;
                let predicate = self.visit_lambda(&predicate)?;
                self.visit_where(source, predicate)
            }
            Node::First { source } => {
                let source = self.visit(source)?;
                Ok(self.q.push(Node::First { source }))
            }
            Node::Aggregate { source, init, accumulator } => {
                let source = self.visit(source)?;
                let init = match init {
                    AggregateInit::FirstItem => AggregateInit::FirstItem,
                    AggregateInit::Seed(seed) => AggregateInit::Seed(self.visit(seed)?),
                    AggregateInit::SeedFunc(f) => {
                        AggregateInit::SeedFunc(self.visit_lambda(&f)?)
                    }
                };
                let accumulator = self.visit_lambda(&accumulator)?;
                Ok(self.q.push(Node::Aggregate { source, init, accumulator }))
            }
            Node::ResultProjection { source, columns } => {
                let source = self.visit(source)?;
                Ok(self.q.push(Node::ResultProjection { source, columns }))
            }

            Node::MethodCall { object, method, args } => {
                let object = self.visit(object)?;
                let args = args
                    .iter()
                    .map(|a| self.visit(*a))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(self.q.push(Node::MethodCall { object, method, args }))
            }
            Node::Invoke { callee, args } => {
                let reduced = self.beta(&callee, &args)?;
                self.visit(reduced)
            }
            Node::BinaryOp { op, left, right } => {
                let left = self.visit(left)?;
                let right = self.visit(right)?;
                Ok(self.q.push(Node::BinaryOp { op, left, right }))
            }
            Node::Compare { op, left, right } => {
                let left = self.visit(left)?;
                let right = self.visit(right)?;
                Ok(self.q.push(Node::Compare { op, left, right }))
            }
            Node::BoolOp { op, operands } => {
                let operands = operands
                    .iter()
                    .map(|o| self.visit(*o))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(self.q.push(Node::BoolOp { op, operands }))
            }
            Node::Conditional { test, then_expr, else_expr } => {
                let test = self.visit(test)?;
                let then_expr = self.visit(then_expr)?;
                let else_expr = self.visit(else_expr)?;
                Ok(self.q.push(Node::Conditional { test, then_expr, else_expr }))
            }
            Node::Tuple { elements } => {
                let elements = elements
                    .iter()
                    .map(|e| self.visit(*e))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(self.q.push(Node::Tuple { elements }))
            }
            Node::Subscript { value, index } => {
                let value = self.visit(value)?;
                let index = self.visit(index)?;
                self.visit_subscript(value, index)
            }
        }
    }

    // seq.Select(f).Select(g)     => seq.Select(g o f)
    // seq.SelectMany(f).Select(g) => seq.SelectMany(x: f(x).Select(g))
    // seq.Select(x: x)            => seq
    fn visit_select(
        &mut self,
        source: NodeId,
        selector: Lambda,
    ) -> Result<NodeId, SimplifyError> {
        if self.is_identity(&selector) {
            return Ok(source);
        }
        match self.q.node(source).clone() {
            Node::Select { source: inner, selector: f } => {
                let fused = self.convolute(&selector, &f)?;
                let rewritten = self.q.push(Node::Select { source: inner, selector: fused });
                self.visit(rewritten)
            }
            Node::SelectMany { source: inner, selector: f } => {
                let param = self.names.fresh("arg_");
                let item = self.q.name(&param);
                let applied = self.beta(&f, &[item])?;
                let body = self.q.push(Node::Select { source: applied, selector });
                let rewritten = self.q.push(Node::SelectMany {
                    source: inner,
                    selector: Lambda::new(param, body),
                });
                self.visit(rewritten)
            }
            _ => Ok(self.q.push(Node::Select { source, selector })),
        }
    }

    // seq.Select(f).SelectMany(g)     => seq.SelectMany(g o f)
    // seq.SelectMany(f).SelectMany(g) => unsupported (needs a 3-deep loop)
    fn visit_select_many(
        &mut self,
        source: NodeId,
        selector: Lambda,
    ) -> Result<NodeId, SimplifyError> {
        match self.q.node(source).clone() {
            Node::Select { source: inner, selector: f } => {
                let fused = self.convolute(&selector, &f)?;
                let rewritten =
                    self.q.push(Node::SelectMany { source: inner, selector: fused });
                self.visit(rewritten)
            }
            Node::SelectMany { .. } => Err(SimplifyError::UnsupportedStructure(
                "SelectMany applied to the result of a SelectMany".to_string(),
            )),
            _ => Ok(self.q.push(Node::SelectMany { source, selector })),
        }
    }

    // seq.Where(p).Where(q)     => seq.Where(x: p(x) and q(x))
    // seq.Select(f).Where(p)    => seq.Where(x: p(f(x))).Select(f)
    // seq.SelectMany(f).Where(p)=> seq.SelectMany(x: f(x).Where(p))
    // seq.Where(x: true)        => seq
    fn visit_where(
        &mut self,
        source: NodeId,
        predicate: Lambda,
    ) -> Result<NodeId, SimplifyError> {
        if let Node::Literal { value: Literal::Bool(true) } = self.q.node(predicate.body) {
            return Ok(source);
        }
        match self.q.node(source).clone() {
            Node::Where { source: inner, predicate: p } => {
                let param = self.names.fresh("arg_");
                let item_a = self.q.name(&param);
                let lhs = self.beta(&p, &[item_a])?;
                let item_b = self.q.name(&param);
                let rhs = self.beta(&predicate, &[item_b])?;
                let body = self.q.push(Node::BoolOp {
                    op: BoolOpKind::And,
                    operands: vec![lhs, rhs],
                });
                let rewritten = self.q.push(Node::Where {
                    source: inner,
                    predicate: Lambda::new(param, body),
                });
                self.visit(rewritten)
            }
            Node::Select { source: inner, selector: f } => {
                let param = self.names.fresh("arg_");
                let item = self.q.name(&param);
                let projected = self.beta(&f, &[item])?;
                let body = self.beta(&predicate, &[projected])?;
                let hoisted = self.q.push(Node::Where {
                    source: inner,
                    predicate: Lambda::new(param, body),
                });
                let rewritten = self.q.push(Node::Select { source: hoisted, selector: f });
                self.visit(rewritten)
            }
            Node::SelectMany { source: inner, selector: f } => {
                let param = self.names.fresh("arg_");
                let item = self.q.name(&param);
                let applied = self.beta(&f, &[item])?;
                let body = self.q.push(Node::Where { source: applied, predicate });
                let rewritten = self.q.push(Node::SelectMany {
                    source: inner,
                    selector: Lambda::new(param, body),
                });
                self.visit(rewritten)
            }
            _ => Ok(self.q.push(Node::Where { source, predicate })),
        }
    }

    // (a, b, c)[1]     => b
    // seq.First()[i]   => seq.Select(x: x[i]).First()
    fn visit_subscript(
        &mut self,
        value: NodeId,
        index: NodeId,
    ) -> Result<NodeId, SimplifyError> {
        if let (Node::Tuple { elements }, Node::Literal { value: Literal::Int(i) }) =
            (self.q.node(value), self.q.node(index))
        {
            let i = *i;
            if i < 0 || i as usize >= elements.len() {
                return Err(SimplifyError::QueryShape(format!(
                    "tuple subscript {i} out of range for {} elements",
                    elements.len()
                )));
            }
            return Ok(elements[i as usize]);
        }
        if let Node::First { source } = self.q.node(value).clone() {
            let param = self.names.fresh("arg_");
            let item = self.q.name(&param);
            let body = self.q.push(Node::Subscript { value: item, index });
            let select = self.q.push(Node::Select {
                source,
                selector: Lambda::new(param, body),
            });
            let select = self.visit(select)?;
            return Ok(self.q.push(Node::First { source: select }));
        }
        Ok(self.q.push(Node::Subscript { value, index }))
    }

    fn visit_lambda(&mut self, lambda: &Lambda) -> Result<Lambda, SimplifyError> {
        Ok(Lambda {
            params: lambda.params.clone(),
            body: self.visit(lambda.body)?,
        })
    }

    /// Apply `lambda` to `args`, producing a fresh copy of the body with the
    /// parameters substituted.
    fn beta(&mut self, lambda: &Lambda, args: &[NodeId]) -> Result<NodeId, SimplifyError> {
        if lambda.params.len() != args.len() {
            return Err(SimplifyError::QueryShape(format!(
                "lambda of {} parameters applied to {} arguments",
                lambda.params.len(),
                args.len()
            )));
        }
        let bindings: HashMap<String, NodeId> = lambda
            .params
            .iter()
            .cloned()
            .zip(args.iter().copied())
            .collect();
        Ok(self.q.substitute(lambda.body, &bindings))
    }

    /// Compose two single-argument lambdas into `x: outer(inner(x))`.
    fn convolute(&mut self, outer: &Lambda, inner: &Lambda) -> Result<Lambda, SimplifyError> {
        let param = self.names.fresh("arg_");
        let item = self.q.name(&param);
        let inner_applied = self.beta(inner, &[item])?;
        let body = self.beta(outer, &[inner_applied])?;
        Ok(Lambda::new(param, body))
    }

    fn is_identity(&self, lambda: &Lambda) -> bool {
        if lambda.params.len() != 1 {
            return false;
        }
        matches!(self.q.node(lambda.body), Node::Name { id } if *id == lambda.params[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{BinOp, CmpOp};

    fn simp(q: &mut Query, root: NodeId) -> String {
        let mut names = NameGen::new();
        let out = simplify(q, root, &mut names).expect("query should simplify");
        q.render(out)
    }

    #[test]
    fn test_select_select_fuses() {
        let mut q = Query::new();
        let src = q.source();
        let x = q.name("x");
        let one = q.int(1);
        let b1 = q.binary(BinOp::Add, x, one);
        let s1 = q.select(src, "x", b1);
        let y = q.name("y");
        let two = q.int(2);
        let b2 = q.binary(BinOp::Mul, y, two);
        let s2 = q.select(s1, "y", b2);

        assert_eq!(simp(&mut q, s2), "source.Select(arg_0: ((arg_0 + 1) * 2))");
    }

    #[test]
    fn test_select_after_selectmany_distributes() {
        let mut q = Query::new();
        let src = q.source();
        let e = q.name("e");
        let jets = q.method(e, "Jets", &[]);
        let sm = q.select_many(src, "e", jets);
        let j = q.name("j");
        let pt = q.method(j, "pt", &[]);
        let sel = q.select(sm, "j", pt);

        assert_eq!(
            simp(&mut q, sel),
            "source.SelectMany(arg_0: arg_0.Jets().Select(j: j.pt()))"
        );
    }

    #[test]
    fn test_selectmany_after_select_fuses() {
        let mut q = Query::new();
        let src = q.source();
        let e = q.name("e");
        let jets = q.method(e, "Jets", &[]);
        let sel = q.select(src, "e", jets);
        let js = q.name("js");
        let sm = q.select_many(sel, "js", js);

        assert_eq!(simp(&mut q, sm), "source.SelectMany(arg_0: arg_0.Jets())");
    }

    #[test]
    fn test_selectmany_of_selectmany_is_unsupported() {
        let mut q = Query::new();
        let src = q.source();
        let e = q.name("e");
        let jets = q.method(e, "Jets", &[]);
        let sm1 = q.select_many(src, "e", jets);
        let j = q.name("j");
        let tracks = q.method(j, "Tracks", &[]);
        let sm2 = q.select_many(sm1, "j", tracks);

        let mut names = NameGen::new();
        let err = simplify(&mut q, sm2, &mut names).unwrap_err();
        assert!(matches!(err, SimplifyError::UnsupportedStructure(_)));
    }

    #[test]
    fn test_where_where_merges_with_and() {
        let mut q = Query::new();
        let src = q.source();
        let x = q.name("x");
        let one = q.int(1);
        let p1 = q.compare(CmpOp::Gt, x, one);
        let w1 = q.filter(src, "x", p1);
        let y = q.name("y");
        let five = q.int(5);
        let p2 = q.compare(CmpOp::Lt, y, five);
        let w2 = q.filter(w1, "y", p2);

        assert_eq!(
            simp(&mut q, w2),
            "source.Where(arg_0: ((arg_0 > 1) and (arg_0 < 5)))"
        );
    }

    #[test]
    fn test_where_hoists_above_select() {
        let mut q = Query::new();
        let src = q.source();
        let j = q.name("j");
        let pt = q.method(j, "pt", &[]);
        let sel = q.select(src, "j", pt);
        let p = q.name("p");
        let thirty = q.int(30);
        let pred = q.compare(CmpOp::Gt, p, thirty);
        let w = q.filter(sel, "p", pred);

        assert_eq!(
            simp(&mut q, w),
            "source.Where(arg_0: (arg_0.pt() > 30)).Select(j: j.pt())"
        );
    }

    #[test]
    fn test_where_pushes_into_selectmany() {
        let mut q = Query::new();
        let src = q.source();
        let e = q.name("e");
        let jets = q.method(e, "Jets", &[]);
        let sm = q.select_many(src, "e", jets);
        let j = q.name("j");
        let thirty = q.int(30);
        let jpt = q.method(j, "pt", &[]);
        let pred = q.compare(CmpOp::Gt, jpt, thirty);
        let w = q.filter(sm, "j", pred);

        assert_eq!(
            simp(&mut q, w),
            "source.SelectMany(arg_0: arg_0.Jets().Where(j: (j.pt() > 30)))"
        );
    }

    #[test]
    fn test_identity_select_is_removed() {
        let mut q = Query::new();
        let src = q.source();
        let e = q.name("e");
        let jets = q.method(e, "Jets", &[]);
        let sm = q.select_many(src, "e", jets);
        let x = q.name("x");
        let sel = q.select(sm, "x", x);

        assert_eq!(simp(&mut q, sel), "source.SelectMany(e: e.Jets())");
    }

    #[test]
    fn test_always_true_where_is_removed() {
        let mut q = Query::new();
        let src = q.source();
        let e = q.name("e");
        let jets = q.method(e, "Jets", &[]);
        let sm = q.select_many(src, "e", jets);
        let t = q.boolean(true);
        let w = q.filter(sm, "x", t);

        assert_eq!(simp(&mut q, w), "source.SelectMany(e: e.Jets())");
    }

    #[test]
    fn test_constant_tuple_subscript_folds() {
        let mut q = Query::new();
        let a = q.int(10);
        let b = q.int(20);
        let tup = q.tuple(&[a, b]);
        let idx = q.int(1);
        let sub = q.subscript(tup, idx);

        assert_eq!(simp(&mut q, sub), "20");
    }

    #[test]
    fn test_tuple_subscript_out_of_range_errors() {
        let mut q = Query::new();
        let a = q.int(10);
        let tup = q.tuple(&[a]);
        let idx = q.int(3);
        let sub = q.subscript(tup, idx);

        let mut names = NameGen::new();
        let err = simplify(&mut q, sub, &mut names).unwrap_err();
        assert!(matches!(err, SimplifyError::QueryShape(_)));
    }

    #[test]
    fn test_subscript_of_first_pushes_inside() {
        let mut q = Query::new();
        let src = q.source();
        let first = q.first(src);
        let idx = q.int(0);
        let sub = q.subscript(first, idx);

        assert_eq!(simp(&mut q, sub), "source.Select(arg_0: arg_0[0]).First()");
    }

    #[test]
    fn test_invoke_beta_reduces() {
        let mut q = Query::new();
        let x = q.name("x");
        let one = q.int(1);
        let body = q.binary(BinOp::Add, x, one);
        let five = q.int(5);
        let inv = q.push(Node::Invoke {
            callee: Lambda::new("x", body),
            args: vec![five],
        });

        assert_eq!(simp(&mut q, inv), "(5 + 1)");
    }

    #[test]
    fn test_simplified_output_is_a_fixed_point() {
        // A chain that exercises filter pushing and selector distribution;
        // running the simplifier over its own output changes nothing.
        let mut q = Query::new();
        let src = q.source();
        let e = q.name("e");
        let jets = q.method(e, "Jets", &[]);
        let sm = q.select_many(src, "e", jets);
        let j = q.name("j");
        let pt = q.method(j, "pt", &[]);
        let thirty = q.int(30);
        let cut = q.compare(CmpOp::Gt, pt, thirty);
        let w = q.filter(sm, "j", cut);
        let k = q.name("k");
        let kpt = q.method(k, "pt", &[]);
        let sel = q.select(w, "k", kpt);

        let mut names = NameGen::new();
        let once = simplify(&mut q, sel, &mut names).expect("query should simplify");
        let rendered = q.render(once);

        let mut names = NameGen::new();
        let twice = simplify(&mut q, once, &mut names).expect("output should re-simplify");
        assert_eq!(q.render(twice), rendered);
    }

    #[test]
    fn test_fusion_cascades_through_tuple_projection() {
        // Select to a tuple, then subscript the First of it: the subscript is
        // pushed inside First, fused into the Select, and folded away.
        let mut q = Query::new();
        let src = q.source();
        let j = q.name("j");
        let pt = q.method(j, "pt", &[]);
        let j2 = q.name("j");
        let eta = q.method(j2, "eta", &[]);
        let tup = q.tuple(&[pt, eta]);
        let sel = q.select(src, "j", tup);
        let first = q.first(sel);
        let idx = q.int(0);
        let sub = q.subscript(first, idx);

        assert_eq!(
            simp(&mut q, sub),
            "source.Select(arg_1: arg_1.pt()).First()"
        );
    }
}
