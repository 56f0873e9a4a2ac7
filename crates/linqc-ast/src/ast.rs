//! AST types for linqc queries
//!
//! The tree is stored in an arena (`Query`) and nodes refer to each other by
//! integer `NodeId`. Nodes are never mutated once pushed; rewrites append new
//! nodes and hand back a new root. All types are deterministically
//! serializable for caching and provenance.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Index of a node in a `Query` arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

/// A single-expression function (selector, predicate, accumulator).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lambda {
    pub params: Vec<String>,
    pub body: NodeId,
}

impl Lambda {
    pub fn new(param: impl Into<String>, body: NodeId) -> Self {
        Self { params: vec![param.into()], body }
    }

    pub fn new2(a: impl Into<String>, b: impl Into<String>, body: NodeId) -> Self {
        Self { params: vec![a.into(), b.into()], body }
    }
}

/// How an `Aggregate` obtains its starting value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AggregateInit {
    /// Seed with the first item, accumulate thereafter.
    FirstItem,
    /// Constant seed expression, accumulate on every item.
    Seed(NodeId),
    /// Seed computed from the first item. Accepted by the AST but rejected by
    /// the translator (no verified semantics upstream).
    SeedFunc(Lambda),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add, Sub, Mul, Div, Mod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    Eq, Ne, Lt, Le, Gt, Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoolOpKind {
    And, Or,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

/// Query tree node. Combinators and expressions share one grammar; selector
/// and predicate bodies are expression subtrees in the same arena.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Node {
    /// Root placeholder for the record stream being queried.
    Source,
    Select { source: NodeId, selector: Lambda },
    SelectMany { source: NodeId, selector: Lambda },
    Where { source: NodeId, predicate: Lambda },
    First { source: NodeId },
    Aggregate { source: NodeId, init: AggregateInit, accumulator: Lambda },
    /// Terminal projection into named output columns.
    ResultProjection { source: NodeId, columns: Vec<String> },

    Name { id: String },
    MethodCall { object: NodeId, method: String, args: Vec<NodeId> },
    /// Inline application of a lambda to arguments; eliminated by the
    /// simplifier via beta reduction.
    Invoke { callee: Lambda, args: Vec<NodeId> },
    BinaryOp { op: BinOp, left: NodeId, right: NodeId },
    Compare { op: CmpOp, left: NodeId, right: NodeId },
    BoolOp { op: BoolOpKind, operands: Vec<NodeId> },
    Conditional { test: NodeId, then_expr: NodeId, else_expr: NodeId },
    Literal { value: Literal },
    Tuple { elements: Vec<NodeId> },
    Subscript { value: NodeId, index: NodeId },
}

/// Arena holding one query tree (plus any rewritten generations of it).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Query {
    nodes: Vec<Node>,
}

impl Query {
    pub fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    pub fn push(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    // ---- builder helpers ----

    pub fn source(&mut self) -> NodeId {
        self.push(Node::Source)
    }

    pub fn name(&mut self, id: impl Into<String>) -> NodeId {
        self.push(Node::Name { id: id.into() })
    }

    pub fn int(&mut self, v: i64) -> NodeId {
        self.push(Node::Literal { value: Literal::Int(v) })
    }

    pub fn float(&mut self, v: f64) -> NodeId {
        self.push(Node::Literal { value: Literal::Float(v) })
    }

    pub fn boolean(&mut self, v: bool) -> NodeId {
        self.push(Node::Literal { value: Literal::Bool(v) })
    }

    pub fn string(&mut self, v: impl Into<String>) -> NodeId {
        self.push(Node::Literal { value: Literal::Str(v.into()) })
    }

    pub fn select(&mut self, source: NodeId, param: &str, body: NodeId) -> NodeId {
        let selector = Lambda::new(param, body);
        self.push(Node::Select { source, selector })
    }

    pub fn select_many(&mut self, source: NodeId, param: &str, body: NodeId) -> NodeId {
        let selector = Lambda::new(param, body);
        self.push(Node::SelectMany { source, selector })
    }

    pub fn filter(&mut self, source: NodeId, param: &str, body: NodeId) -> NodeId {
        let predicate = Lambda::new(param, body);
        self.push(Node::Where { source, predicate })
    }

    pub fn first(&mut self, source: NodeId) -> NodeId {
        self.push(Node::First { source })
    }

    pub fn aggregate(&mut self, source: NodeId, init: AggregateInit, acc: Lambda) -> NodeId {
        self.push(Node::Aggregate { source, init, accumulator: acc })
    }

    pub fn project(&mut self, source: NodeId, columns: &[&str]) -> NodeId {
        let columns = columns.iter().map(|c| c.to_string()).collect();
        self.push(Node::ResultProjection { source, columns })
    }

    pub fn method(&mut self, object: NodeId, method: impl Into<String>, args: &[NodeId]) -> NodeId {
        self.push(Node::MethodCall { object, method: method.into(), args: args.to_vec() })
    }

    pub fn binary(&mut self, op: BinOp, left: NodeId, right: NodeId) -> NodeId {
        self.push(Node::BinaryOp { op, left, right })
    }

    pub fn compare(&mut self, op: CmpOp, left: NodeId, right: NodeId) -> NodeId {
        self.push(Node::Compare { op, left, right })
    }

    pub fn bool_op(&mut self, op: BoolOpKind, operands: &[NodeId]) -> NodeId {
        self.push(Node::BoolOp { op, operands: operands.to_vec() })
    }

    pub fn conditional(&mut self, test: NodeId, then_expr: NodeId, else_expr: NodeId) -> NodeId {
        self.push(Node::Conditional { test, then_expr, else_expr })
    }

    pub fn tuple(&mut self, elements: &[NodeId]) -> NodeId {
        self.push(Node::Tuple { elements: elements.to_vec() })
    }

    pub fn subscript(&mut self, value: NodeId, index: NodeId) -> NodeId {
        self.push(Node::Subscript { value, index })
    }

    // ---- structural helpers ----

    /// Deep-copy the subtree rooted at `id`, returning a root with fresh ids.
    /// Rewrites always copy so that no subtree ends up shared between two
    /// contexts (shared ids would also share memoized representations).
    pub fn deep_copy(&mut self, id: NodeId) -> NodeId {
        self.substitute(id, &HashMap::new())
    }

    /// Deep-copy `body`, replacing free `Name` nodes per `bindings`. Bindings
    /// shadowed by an inner lambda parameter of the same name are left alone.
    /// Every substituted occurrence gets its own fresh copy of the bound
    /// subtree.
    pub fn substitute(&mut self, body: NodeId, bindings: &HashMap<String, NodeId>) -> NodeId {
        let node = self.node(body).clone();
        match node {
            Node::Name { ref id } => match bindings.get(id) {
                Some(&replacement) => self.deep_copy(replacement),
                None => self.push(node),
            },
            Node::Source | Node::Literal { .. } => self.push(node),
            Node::Select { source, selector } => {
                let source = self.substitute(source, bindings);
                let selector = self.substitute_lambda(&selector, bindings);
                self.push(Node::Select { source, selector })
            }
            Node::SelectMany { source, selector } => {
                let source = self.substitute(source, bindings);
                let selector = self.substitute_lambda(&selector, bindings);
                self.push(Node::SelectMany { source, selector })
            }
            Node::Where { source, predicate } => {
                let source = self.substitute(source, bindings);
                let predicate = self.substitute_lambda(&predicate, bindings);
                self.push(Node::Where { source, predicate })
            }
            Node::First { source } => {
                let source = self.substitute(source, bindings);
                self.push(Node::First { source })
            }
            Node::Aggregate { source, init, accumulator } => {
                let source = self.substitute(source, bindings);
                let init = match init {
                    AggregateInit::FirstItem => AggregateInit::FirstItem,
                    AggregateInit::Seed(seed) => AggregateInit::Seed(self.substitute(seed, bindings)),
                    AggregateInit::SeedFunc(f) => {
                        AggregateInit::SeedFunc(self.substitute_lambda(&f, bindings))
                    }
                };
                let accumulator = self.substitute_lambda(&accumulator, bindings);
                self.push(Node::Aggregate { source, init, accumulator })
            }
            Node::ResultProjection { source, columns } => {
                let source = self.substitute(source, bindings);
                self.push(Node::ResultProjection { source, columns })
            }
            Node::MethodCall { object, method, args } => {
                let object = self.substitute(object, bindings);
                let args = args.iter().map(|a| self.substitute(*a, bindings)).collect();
                self.push(Node::MethodCall { object, method, args })
            }
            Node::Invoke { callee, args } => {
                let callee = self.substitute_lambda(&callee, bindings);
                let args = args.iter().map(|a| self.substitute(*a, bindings)).collect();
                self.push(Node::Invoke { callee, args })
            }
            Node::BinaryOp { op, left, right } => {
                let left = self.substitute(left, bindings);
                let right = self.substitute(right, bindings);
                self.push(Node::BinaryOp { op, left, right })
            }
            Node::Compare { op, left, right } => {
                let left = self.substitute(left, bindings);
                let right = self.substitute(right, bindings);
                self.push(Node::Compare { op, left, right })
            }
            Node::BoolOp { op, operands } => {
                let operands = operands.iter().map(|o| self.substitute(*o, bindings)).collect();
                self.push(Node::BoolOp { op, operands })
            }
            Node::Conditional { test, then_expr, else_expr } => {
                let test = self.substitute(test, bindings);
                let then_expr = self.substitute(then_expr, bindings);
                let else_expr = self.substitute(else_expr, bindings);
                self.push(Node::Conditional { test, then_expr, else_expr })
            }
            Node::Tuple { elements } => {
                let elements = elements.iter().map(|e| self.substitute(*e, bindings)).collect();
                self.push(Node::Tuple { elements })
            }
            Node::Subscript { value, index } => {
                let value = self.substitute(value, bindings);
                let index = self.substitute(index, bindings);
                self.push(Node::Subscript { value, index })
            }
        }
    }

    fn substitute_lambda(&mut self, lambda: &Lambda, bindings: &HashMap<String, NodeId>) -> Lambda {
        let inner: HashMap<String, NodeId> = bindings
            .iter()
            .filter(|(name, _)| !lambda.params.contains(name))
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        Lambda {
            params: lambda.params.clone(),
            body: self.substitute(lambda.body, &inner),
        }
    }

    /// Copy the subtree rooted at `root` into a fresh arena with nodes in
    /// canonical depth-first order, dropping anything left over from earlier
    /// rewrite generations.
    pub fn compact(&self, root: NodeId) -> (Query, NodeId) {
        let mut out = Query::new();
        let new_root = self.copy_into(root, &mut out);
        (out, new_root)
    }

    fn copy_into(&self, id: NodeId, out: &mut Query) -> NodeId {
        let node = match self.node(id) {
            Node::Source => Node::Source,
            Node::Name { id } => Node::Name { id: id.clone() },
            Node::Literal { value } => Node::Literal { value: value.clone() },
            Node::Select { source, selector } => Node::Select {
                source: self.copy_into(*source, out),
                selector: self.copy_lambda_into(selector, out),
            },
            Node::SelectMany { source, selector } => Node::SelectMany {
                source: self.copy_into(*source, out),
                selector: self.copy_lambda_into(selector, out),
            },
            Node::Where { source, predicate } => Node::Where {
                source: self.copy_into(*source, out),
                predicate: self.copy_lambda_into(predicate, out),
            },
            Node::First { source } => Node::First { source: self.copy_into(*source, out) },
            Node::Aggregate { source, init, accumulator } => Node::Aggregate {
                source: self.copy_into(*source, out),
                init: match init {
                    AggregateInit::FirstItem => AggregateInit::FirstItem,
                    AggregateInit::Seed(seed) => AggregateInit::Seed(self.copy_into(*seed, out)),
                    AggregateInit::SeedFunc(f) => {
                        AggregateInit::SeedFunc(self.copy_lambda_into(f, out))
                    }
                },
                accumulator: self.copy_lambda_into(accumulator, out),
            },
            Node::ResultProjection { source, columns } => Node::ResultProjection {
                source: self.copy_into(*source, out),
                columns: columns.clone(),
            },
            Node::MethodCall { object, method, args } => Node::MethodCall {
                object: self.copy_into(*object, out),
                method: method.clone(),
                args: args.iter().map(|a| self.copy_into(*a, out)).collect(),
            },
            Node::Invoke { callee, args } => Node::Invoke {
                callee: self.copy_lambda_into(callee, out),
                args: args.iter().map(|a| self.copy_into(*a, out)).collect(),
            },
            Node::BinaryOp { op, left, right } => Node::BinaryOp {
                op: *op,
                left: self.copy_into(*left, out),
                right: self.copy_into(*right, out),
            },
            Node::Compare { op, left, right } => Node::Compare {
                op: *op,
                left: self.copy_into(*left, out),
                right: self.copy_into(*right, out),
            },
            Node::BoolOp { op, operands } => Node::BoolOp {
                op: *op,
                operands: operands.iter().map(|o| self.copy_into(*o, out)).collect(),
            },
            Node::Conditional { test, then_expr, else_expr } => Node::Conditional {
                test: self.copy_into(*test, out),
                then_expr: self.copy_into(*then_expr, out),
                else_expr: self.copy_into(*else_expr, out),
            },
            Node::Tuple { elements } => Node::Tuple {
                elements: elements.iter().map(|e| self.copy_into(*e, out)).collect(),
            },
            Node::Subscript { value, index } => Node::Subscript {
                value: self.copy_into(*value, out),
                index: self.copy_into(*index, out),
            },
        };
        out.push(node)
    }

    fn copy_lambda_into(&self, lambda: &Lambda, out: &mut Query) -> Lambda {
        Lambda {
            params: lambda.params.clone(),
            body: self.copy_into(lambda.body, out),
        }
    }

    /// SHA-256 fingerprint of the canonical serialized form of the subtree at
    /// `root`, for deterministic caching of compiled queries.
    pub fn fingerprint(&self, root: NodeId) -> String {
        let (canonical, canonical_root) = self.compact(root);
        let json = serde_json::to_string(&(&canonical.nodes, canonical_root))
            .expect("query AST should always serialize");
        let mut hasher = Sha256::new();
        hasher.update(json.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Compact textual dump of the subtree at `root`, used by tests and
    /// diagnostics.
    pub fn render(&self, root: NodeId) -> String {
        match self.node(root) {
            Node::Source => "source".to_string(),
            Node::Select { source, selector } => {
                format!("{}.Select({})", self.render(*source), self.render_lambda(selector))
            }
            Node::SelectMany { source, selector } => {
                format!("{}.SelectMany({})", self.render(*source), self.render_lambda(selector))
            }
            Node::Where { source, predicate } => {
                format!("{}.Where({})", self.render(*source), self.render_lambda(predicate))
            }
            Node::First { source } => format!("{}.First()", self.render(*source)),
            Node::Aggregate { source, init, accumulator } => {
                let init = match init {
                    AggregateInit::FirstItem => String::new(),
                    AggregateInit::Seed(seed) => format!("{}, ", self.render(*seed)),
                    AggregateInit::SeedFunc(f) => format!("{}, ", self.render_lambda(f)),
                };
                format!(
                    "{}.Aggregate({}{})",
                    self.render(*source),
                    init,
                    self.render_lambda(accumulator)
                )
            }
            Node::ResultProjection { source, columns } => {
                format!("{}.Project({})", self.render(*source), columns.join(", "))
            }
            Node::Name { id } => id.clone(),
            Node::MethodCall { object, method, args } => {
                let args: Vec<String> = args.iter().map(|a| self.render(*a)).collect();
                format!("{}.{}({})", self.render(*object), method, args.join(", "))
            }
            Node::Invoke { callee, args } => {
                let args: Vec<String> = args.iter().map(|a| self.render(*a)).collect();
                format!("({})({})", self.render_lambda(callee), args.join(", "))
            }
            Node::BinaryOp { op, left, right } => {
                let op = match op {
                    BinOp::Add => "+",
                    BinOp::Sub => "-",
                    BinOp::Mul => "*",
                    BinOp::Div => "/",
                    BinOp::Mod => "%",
                };
                format!("({} {} {})", self.render(*left), op, self.render(*right))
            }
            Node::Compare { op, left, right } => {
                let op = match op {
                    CmpOp::Eq => "==",
                    CmpOp::Ne => "!=",
                    CmpOp::Lt => "<",
                    CmpOp::Le => "<=",
                    CmpOp::Gt => ">",
                    CmpOp::Ge => ">=",
                };
                format!("({} {} {})", self.render(*left), op, self.render(*right))
            }
            Node::BoolOp { op, operands } => {
                let op = match op {
                    BoolOpKind::And => " and ",
                    BoolOpKind::Or => " or ",
                };
                let parts: Vec<String> = operands.iter().map(|o| self.render(*o)).collect();
                format!("({})", parts.join(op))
            }
            Node::Conditional { test, then_expr, else_expr } => format!(
                "({} ? {} : {})",
                self.render(*test),
                self.render(*then_expr),
                self.render(*else_expr)
            ),
            Node::Literal { value } => match value {
                Literal::Int(v) => v.to_string(),
                Literal::Float(v) => format!("{v:?}"),
                Literal::Bool(v) => v.to_string(),
                Literal::Str(v) => format!("{v:?}"),
            },
            Node::Tuple { elements } => {
                let parts: Vec<String> = elements.iter().map(|e| self.render(*e)).collect();
                format!("({})", parts.join(", "))
            }
            Node::Subscript { value, index } => {
                format!("{}[{}]", self.render(*value), self.render(*index))
            }
        }
    }

    fn render_lambda(&self, lambda: &Lambda) -> String {
        format!("{}: {}", lambda.params.join(", "), self.render(lambda.body))
    }
}
