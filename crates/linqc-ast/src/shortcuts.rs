//! Rewrites of aggregate method shortcuts into explicit `Aggregate` nodes.
//!
//! `Count`, `Sum`, `Max`, and `Min` are surface sugar; lowering them up front
//! means the translator only ever sees the two real accumulation forms.

use crate::ast::{
    AggregateInit, BinOp, CmpOp, Lambda, Literal, Node, NodeId, Query,
};
use crate::names::NameGen;

/// Rebuild the subtree at `root`, replacing zero-argument `Count`, `Sum`,
/// `Max`, and `Min` calls with equivalent `Aggregate` nodes. Returns the new
/// root; untouched shortcuts with arguments are left as method calls.
pub fn rewrite_aggregate_shortcuts(q: &mut Query, root: NodeId, names: &mut NameGen) -> NodeId {
    let node = q.node(root).clone();
    match node {
        Node::MethodCall { object, ref method, ref args }
            if args.is_empty() && is_shortcut(method) =>
        {
            let source = rewrite_aggregate_shortcuts(q, object, names);
            lower_shortcut(q, source, method, names)
        }
        Node::Source | Node::Name { .. } | Node::Literal { .. } => root,
        Node::Select { source, selector } => {
            let source = rewrite_aggregate_shortcuts(q, source, names);
            let selector = rewrite_lambda(q, &selector, names);
            q.push(Node::Select { source, selector })
        }
        Node::SelectMany { source, selector } => {
            let source = rewrite_aggregate_shortcuts(q, source, names);
            let selector = rewrite_lambda(q, &selector, names);
            q.push(Node::SelectMany { source, selector })
        }
        Node::Where { source, predicate } => {
            let source = rewrite_aggregate_shortcuts(q, source, names);
            let predicate = rewrite_lambda(q, &predicate, names);
            q.push(Node::Where { source, predicate })
        }
        Node::First { source } => {
            let source = rewrite_aggregate_shortcuts(q, source, names);
            q.push(Node::First { source })
        }
        Node::Aggregate { source, init, accumulator } => {
            let source = rewrite_aggregate_shortcuts(q, source, names);
            let init = match init {
                AggregateInit::FirstItem => AggregateInit::FirstItem,
                AggregateInit::Seed(seed) => {
                    AggregateInit::Seed(rewrite_aggregate_shortcuts(q, seed, names))
                }
                AggregateInit::SeedFunc(f) => {
                    AggregateInit::SeedFunc(rewrite_lambda(q, &f, names))
                }
            };
            let accumulator = rewrite_lambda(q, &accumulator, names);
            q.push(Node::Aggregate { source, init, accumulator })
        }
        Node::ResultProjection { source, columns } => {
            let source = rewrite_aggregate_shortcuts(q, source, names);
            q.push(Node::ResultProjection { source, columns })
        }
        Node::MethodCall { object, method, args } => {
            let object = rewrite_aggregate_shortcuts(q, object, names);
            let args = args
                .iter()
                .map(|a| rewrite_aggregate_shortcuts(q, *a, names))
                .collect();
            q.push(Node::MethodCall { object, method, args })
        }
        Node::Invoke { callee, args } => {
            let callee = rewrite_lambda(q, &callee, names);
            let args = args
                .iter()
                .map(|a| rewrite_aggregate_shortcuts(q, *a, names))
                .collect();
            q.push(Node::Invoke { callee, args })
        }
        Node::BinaryOp { op, left, right } => {
            let left = rewrite_aggregate_shortcuts(q, left, names);
            let right = rewrite_aggregate_shortcuts(q, right, names);
            q.push(Node::BinaryOp { op, left, right })
        }
        Node::Compare { op, left, right } => {
            let left = rewrite_aggregate_shortcuts(q, left, names);
            let right = rewrite_aggregate_shortcuts(q, right, names);
            q.push(Node::Compare { op, left, right })
        }
        Node::BoolOp { op, operands } => {
            let operands = operands
                .iter()
                .map(|o| rewrite_aggregate_shortcuts(q, *o, names))
                .collect();
            q.push(Node::BoolOp { op, operands })
        }
        Node::Conditional { test, then_expr, else_expr } => {
            let test = rewrite_aggregate_shortcuts(q, test, names);
            let then_expr = rewrite_aggregate_shortcuts(q, then_expr, names);
            let else_expr = rewrite_aggregate_shortcuts(q, else_expr, names);
            q.push(Node::Conditional { test, then_expr, else_expr })
        }
        Node::Tuple { elements } => {
            let elements = elements
                .iter()
                .map(|e| rewrite_aggregate_shortcuts(q, *e, names))
                .collect();
            q.push(Node::Tuple { elements })
        }
        Node::Subscript { value, index } => {
            let value = rewrite_aggregate_shortcuts(q, value, names);
            let index = rewrite_aggregate_shortcuts(q, index, names);
            q.push(Node::Subscript { value, index })
        }
    }
}

fn rewrite_lambda(q: &mut Query, lambda: &Lambda, names: &mut NameGen) -> Lambda {
    Lambda {
        params: lambda.params.clone(),
        body: rewrite_aggregate_shortcuts(q, lambda.body, names),
    }
}

fn is_shortcut(method: &str) -> bool {
    matches!(method, "Count" | "Sum" | "Max" | "Min")
}

fn lower_shortcut(q: &mut Query, source: NodeId, method: &str, names: &mut NameGen) -> NodeId {
    let acc = names.fresh("acc_");
    let item = names.fresh("arg_");
    match method {
        "Count" => {
            let acc_ref = q.name(&acc);
            let one = q.int(1);
            let body = q.binary(BinOp::Add, acc_ref, one);
            let seed = q.push(Node::Literal { value: Literal::Int(0) });
            q.aggregate(source, AggregateInit::Seed(seed), Lambda::new2(acc, item, body))
        }
        "Sum" => {
            let acc_ref = q.name(&acc);
            let item_ref = q.name(&item);
            let body = q.binary(BinOp::Add, acc_ref, item_ref);
            q.aggregate(source, AggregateInit::FirstItem, Lambda::new2(acc, item, body))
        }
        "Max" | "Min" => {
            let op = if method == "Max" { CmpOp::Gt } else { CmpOp::Lt };
            let acc_ref = q.name(&acc);
            let item_ref = q.name(&item);
            let test = q.compare(op, acc_ref, item_ref);
            let acc_ref2 = q.name(&acc);
            let item_ref2 = q.name(&item);
            let body = q.conditional(test, acc_ref2, item_ref2);
            q.aggregate(source, AggregateInit::FirstItem, Lambda::new2(acc, item, body))
        }
        other => unreachable!("not an aggregate shortcut: {other}"),
    }
}
