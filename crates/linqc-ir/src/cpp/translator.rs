//! Translates a simplified query tree into scope-tracked C++ statements.
//!
//! The walk is post-order over the arena, memoizing one representation per
//! node. Combinators build `Sequence` representations; the final result
//! projection turns whatever representation falls out into per-record output
//! statements plus the one-time booking block.

use std::collections::HashMap;

use thiserror::Error;

use linqc_ast::{
    rewrite_aggregate_shortcuts, simplify, AggregateInit, BinOp, BoolOpKind, CmpOp, Lambda,
    Literal, NameGen, Node, NodeId, Query, SimplifyError,
};
use linqc_registry::{SemanticType, TypeError, TypeRegistry};

use crate::rep::{Rep, Sequence, Value};
use crate::scope::{CodeBuffer, Scope, ScopeError};
use crate::statement::{Statement, VarDecl};

#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("malformed query: {0}")]
    QueryShape(String),

    #[error(transparent)]
    TypeResolution(#[from] TypeError),

    #[error("cannot accumulate values of non-numeric type '{0}'")]
    AccumulationType(String),

    #[error("projection names {expected} columns but the query produces {actual}")]
    ColumnMismatch { expected: usize, actual: usize },

    #[error("unsupported query structure: {0}")]
    UnsupportedStructure(String),

    #[error("internal scope error: {0}")]
    InternalScope(#[from] ScopeError),
}

#[derive(Debug, Error)]
pub enum CompileError {
    #[error(transparent)]
    Simplify(#[from] SimplifyError),

    #[error(transparent)]
    Translate(#[from] TranslateError),
}

/// Describes the record stream the query runs over.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// Name of the record variable in the per-record block.
    pub record_var: String,
    /// Type of the record variable.
    pub record_type: SemanticType,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            record_var: "event".to_string(),
            record_type: SemanticType::pointer_to("Event"),
        }
    }
}

/// One output column and the storage variable that feeds it.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputField {
    pub column: String,
    pub storage: String,
    pub cpp_type: String,
    pub is_array: bool,
}

/// Everything the templating layer needs to assemble a runnable source file.
#[derive(Debug, Clone)]
pub struct GeneratedQuery {
    /// One-time setup statements.
    pub book_code: Vec<String>,
    /// Statements executed once per record.
    pub record_code: Vec<String>,
    /// Variable declarations that persist across records.
    pub declarations: Vec<String>,
    /// Header files required by the generated statements.
    pub includes: Vec<String>,
    pub output_fields: Vec<OutputField>,
}

/// Shortcut rewriting, simplification, and translation in one call.
pub fn compile(
    query: &mut Query,
    root: NodeId,
    registry: &TypeRegistry,
    config: SourceConfig,
) -> Result<GeneratedQuery, CompileError> {
    let mut names = NameGen::new();
    let root = rewrite_aggregate_shortcuts(query, root, &mut names);
    let root = simplify(query, root, &mut names)?;
    let translator = CppTranslator::new(query, registry, config, names);
    Ok(translator.translate(root)?)
}

pub struct CppTranslator<'a> {
    query: &'a Query,
    registry: &'a TypeRegistry,
    config: SourceConfig,
    names: NameGen,
    buf: CodeBuffer,
    memo: HashMap<NodeId, Rep>,
    bindings: HashMap<String, Rep>,
    output_fields: Vec<OutputField>,
}

impl<'a> CppTranslator<'a> {
    pub fn new(
        query: &'a Query,
        registry: &'a TypeRegistry,
        config: SourceConfig,
        names: NameGen,
    ) -> Self {
        Self {
            query,
            registry,
            config,
            names,
            buf: CodeBuffer::new(),
            memo: HashMap::new(),
            bindings: HashMap::new(),
            output_fields: Vec::new(),
        }
    }

    /// Translate a query whose root is a result projection.
    pub fn translate(mut self, root: NodeId) -> Result<GeneratedQuery, TranslateError> {
        let (source, columns) = match self.query.node(root) {
            Node::ResultProjection { source, columns } => (*source, columns.clone()),
            _ => {
                return Err(TranslateError::QueryShape(
                    "query must end in a result projection".to_string(),
                ))
            }
        };
        self.translate_projection(source, &columns)?;

        Ok(GeneratedQuery {
            book_code: self.buf.emit_book_code(),
            record_code: self.buf.emit_record_code(),
            declarations: self.buf.top_level_declarations(),
            includes: self.buf.includes().to_vec(),
            output_fields: self.output_fields,
        })
    }

    fn get_rep(&mut self, id: NodeId) -> Result<Rep, TranslateError> {
        if let Some(rep) = self.memo.get(&id) {
            return Ok(rep.clone());
        }
        let rep = self.compute_rep(id)?;
        self.memo.insert(id, rep.clone());
        Ok(rep)
    }

    fn compute_rep(&mut self, id: NodeId) -> Result<Rep, TranslateError> {
        match self.query.node(id).clone() {
            Node::Source => Ok(self.source_rep()),
            Node::Name { id } => self.bindings.get(&id).cloned().ok_or_else(|| {
                TranslateError::QueryShape(format!("unknown identifier '{id}'"))
            }),
            Node::Literal { value } => Ok(self.literal_rep(&value)),
            Node::MethodCall { object, method, args } => {
                self.method_call_rep(object, &method, &args)
            }
            Node::Invoke { .. } => Err(TranslateError::QueryShape(
                "inline lambda application survived simplification".to_string(),
            )),
            Node::BinaryOp { op, left, right } => self.binary_rep(op, left, right),
            Node::Compare { op, left, right } => self.compare_rep(op, left, right),
            Node::BoolOp { op, operands } => self.bool_op_rep(op, &operands),
            Node::Conditional { test, then_expr, else_expr } => {
                self.conditional_rep(test, then_expr, else_expr)
            }
            Node::Tuple { elements } => {
                let elements = elements
                    .iter()
                    .map(|e| self.get_rep(*e))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Rep::Tuple { elements, scope: self.buf.current_scope() })
            }
            Node::Subscript { value, index } => self.subscript_rep(value, index),
            Node::Select { source, selector } => self.select_rep(source, &selector),
            Node::SelectMany { source, selector } => self.select_many_rep(source, &selector),
            Node::Where { source, predicate } => self.where_rep(source, &predicate),
            Node::First { source } => self.first_rep(source),
            Node::Aggregate { source, init, accumulator } => {
                self.aggregate_rep(source, &init, &accumulator)
            }
            Node::ResultProjection { .. } => Err(TranslateError::QueryShape(
                "result projection is only valid at the root of a query".to_string(),
            )),
        }
    }

    // ---- leaf and expression representations ----

    fn source_rep(&self) -> Rep {
        let record = Value::new(
            self.config.record_var.clone(),
            self.config.record_type.clone(),
            self.buf.record_scope(),
        );
        Rep::Sequence(Sequence {
            iterator: record.clone(),
            value: Box::new(Rep::Value(record)),
            scope: Scope::TopLevel,
        })
    }

    fn literal_rep(&self, value: &Literal) -> Rep {
        let scope = self.buf.current_scope();
        let v = match value {
            Literal::Int(i) => Value::new(i.to_string(), SemanticType::int(), scope),
            Literal::Float(f) => Value::new(format!("{f:?}"), SemanticType::double(), scope),
            Literal::Bool(b) => Value::new(b.to_string(), SemanticType::boolean(), scope),
            Literal::Str(s) => {
                let escaped = s.replace('\\', "\\\\").replace('"', "\\\"");
                Value::new(
                    format!("\"{escaped}\""),
                    SemanticType::terminal("std::string"),
                    scope,
                )
            }
        };
        Rep::Value(v)
    }

    fn method_call_rep(
        &mut self,
        object: NodeId,
        method: &str,
        args: &[NodeId],
    ) -> Result<Rep, TranslateError> {
        let obj = self.get_rep(object)?;
        let receiver = match &obj {
            Rep::Value(v) | Rep::Collection(v) => v.clone(),
            _ => {
                return Err(TranslateError::UnsupportedStructure(format!(
                    "method '{method}' called on a sequence value"
                )))
            }
        };
        let mut rendered = Vec::with_capacity(args.len());
        for arg in args {
            let rep = self.get_rep(*arg)?;
            rendered.push(self.as_value(&rep)?.expr.clone());
        }

        let lookup = self.registry.lookup(&receiver.ty, method)?;
        if lookup.is_guessed() {
            tracing::warn!(
                receiver = %receiver.ty,
                method,
                "method not in registry, guessing a double return type"
            );
        }
        let info = lookup.info().clone();
        if let Some(include) = &info.include {
            self.buf.add_include(include.clone());
        }

        let sep = if receiver.ty.is_pointer() { "->" } else { "." };
        let expr = format!("{}{sep}{method}({})", receiver.expr, rendered.join(", "));
        let value = Value::new(expr, info.return_type.clone(), self.buf.current_scope());
        Ok(match info.return_type {
            SemanticType::Collection { .. } => Rep::Collection(value),
            _ => Rep::Value(value),
        })
    }

    fn binary_rep(
        &mut self,
        op: BinOp,
        left: NodeId,
        right: NodeId,
    ) -> Result<Rep, TranslateError> {
        let l = self.value_rep(left)?;
        let r = self.value_rep(right)?;
        let op_str = match op {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
        };
        let ty = if l.ty == SemanticType::int() && r.ty == SemanticType::int() && op != BinOp::Div
        {
            SemanticType::int()
        } else {
            SemanticType::double()
        };
        let expr = format!("({} {op_str} {})", l.expr, r.expr);
        Ok(Rep::Value(Value::new(expr, ty, self.buf.current_scope())))
    }

    fn compare_rep(
        &mut self,
        op: CmpOp,
        left: NodeId,
        right: NodeId,
    ) -> Result<Rep, TranslateError> {
        let l = self.value_rep(left)?;
        let r = self.value_rep(right)?;
        let op_str = match op {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        };
        let expr = format!("({} {op_str} {})", l.expr, r.expr);
        Ok(Rep::Value(Value::new(expr, SemanticType::boolean(), self.buf.current_scope())))
    }

    /// Boolean operators short-circuit: each operand is evaluated inside the
    /// blocks opened by the ones before it, and the outcome lands in a flag
    /// declared at the entry scope.
    fn bool_op_rep(
        &mut self,
        op: BoolOpKind,
        operands: &[NodeId],
    ) -> Result<Rep, TranslateError> {
        if operands.is_empty() {
            return Err(TranslateError::QueryShape(
                "boolean operator with no operands".to_string(),
            ));
        }
        let entry = self.buf.current_scope();
        let flag = self.names.fresh("flag");
        self.buf.declare_variable(VarDecl {
            cpp_type: "bool".to_string(),
            name: flag.clone(),
            init: Some("false".to_string()),
        });

        match op {
            BoolOpKind::And => {
                for operand in operands {
                    let v = self.value_rep(*operand)?;
                    let body = self.buf.alloc_block();
                    self.buf.add_statement(Statement::IfTest { condition: v.expr, body });
                }
                self.buf.add_statement(Statement::Assign {
                    target: flag.clone(),
                    value: "true".to_string(),
                });
            }
            BoolOpKind::Or => {
                for (i, operand) in operands.iter().enumerate() {
                    if i > 0 {
                        let body = self.buf.alloc_block();
                        self.buf.add_statement(Statement::Else { body });
                    }
                    let v = self.value_rep(*operand)?;
                    let body = self.buf.alloc_block();
                    self.buf.add_statement(Statement::IfTest { condition: v.expr, body });
                    self.buf.add_statement(Statement::Assign {
                        target: flag.clone(),
                        value: "true".to_string(),
                    });
                    self.buf.pop_scope();
                }
            }
        }
        self.buf.set_scope(&entry);
        Ok(Rep::Value(Value::new(flag, SemanticType::boolean(), entry)))
    }

    fn conditional_rep(
        &mut self,
        test: NodeId,
        then_expr: NodeId,
        else_expr: NodeId,
    ) -> Result<Rep, TranslateError> {
        let entry = self.buf.current_scope();
        let test = self.value_rep(test)?;
        let result = self.names.fresh("sel");

        let body = self.buf.alloc_block();
        self.buf.add_statement(Statement::IfTest { condition: test.expr, body });
        let then_v = self.value_rep(then_expr)?;
        self.buf.add_statement(Statement::Assign {
            target: result.clone(),
            value: then_v.expr.clone(),
        });
        self.buf.pop_scope();

        let body = self.buf.alloc_block();
        self.buf.add_statement(Statement::Else { body });
        let else_v = self.value_rep(else_expr)?;
        self.buf.add_statement(Statement::Assign {
            target: result.clone(),
            value: else_v.expr.clone(),
        });
        self.buf.set_scope(&entry);

        let ty = if then_v.ty == else_v.ty { then_v.ty } else { SemanticType::double() };
        self.buf.declare_variable_at(
            &entry,
            VarDecl {
                cpp_type: ty.to_string(),
                name: result.clone(),
                init: ty.default_value(),
            },
        )?;
        Ok(Rep::Value(Value::new(result, ty, entry)))
    }

    fn subscript_rep(&mut self, value: NodeId, index: NodeId) -> Result<Rep, TranslateError> {
        let rep = self.get_rep(value)?;
        let Rep::Tuple { elements, .. } = rep else {
            return Err(TranslateError::UnsupportedStructure(
                "subscript of a non-tuple value".to_string(),
            ));
        };
        let idx = match self.query.node(index) {
            Node::Literal { value: Literal::Int(i) } => *i,
            _ => {
                return Err(TranslateError::QueryShape(
                    "tuple subscript must be a constant integer".to_string(),
                ))
            }
        };
        if idx < 0 || idx as usize >= elements.len() {
            return Err(TranslateError::QueryShape(format!(
                "tuple subscript {idx} out of range for {} elements",
                elements.len()
            )));
        }
        Ok(elements[idx as usize].clone())
    }

    // ---- combinators ----

    fn select_rep(&mut self, source: NodeId, selector: &Lambda) -> Result<Rep, TranslateError> {
        let rep = self.get_rep(source)?;
        let seq = self.as_sequence(rep)?;

        let item = (*seq.value).clone();
        self.buf.set_scope(item.scope());
        let mapped = self.with_bindings(&selector.params, vec![item], |t| {
            t.get_rep(selector.body)
        })?;

        Ok(Rep::Sequence(Sequence {
            iterator: seq.iterator,
            value: Box::new(mapped),
            scope: seq.scope,
        }))
    }

    /// A flattened sequence: the iterator and current value come from the
    /// inner iteration, the creation scope from the outer one.
    fn select_many_rep(
        &mut self,
        source: NodeId,
        selector: &Lambda,
    ) -> Result<Rep, TranslateError> {
        let rep = self.get_rep(source)?;
        let seq = self.as_sequence(rep)?;

        let item = (*seq.value).clone();
        self.buf.set_scope(item.scope());
        let inner = self.with_bindings(&selector.params, vec![item], |t| {
            t.get_rep(selector.body)
        })?;
        let inner_seq = self.as_sequence(inner)?;

        Ok(Rep::Sequence(Sequence {
            iterator: inner_seq.iterator,
            value: inner_seq.value,
            scope: seq.scope,
        }))
    }

    fn where_rep(&mut self, source: NodeId, predicate: &Lambda) -> Result<Rep, TranslateError> {
        let rep = self.get_rep(source)?;
        let seq = self.as_sequence(rep)?;

        let item = (*seq.value).clone();
        self.buf.set_scope(item.scope());
        let test = self.with_bindings(&predicate.params, vec![item], |t| {
            let rep = t.get_rep(predicate.body)?;
            Ok(t.as_value(&rep)?.clone())
        })?;
        let body = self.buf.alloc_block();
        self.buf.add_statement(Statement::IfTest { condition: test.expr, body });
        let inside = self.buf.current_scope();
        let value = seq.value.rescope(inside);

        Ok(Rep::Sequence(Sequence {
            iterator: seq.iterator,
            value: Box::new(value),
            scope: seq.scope,
        }))
    }

    /// The guard flag lives one level outside the loop that drives the
    /// sequence. A value result becomes valid inside the guard; a sequence
    /// result keeps its already-emitted loop, which the guard is spliced
    /// around so only the first outer item drives it.
    fn first_rep(&mut self, source: NodeId) -> Result<Rep, TranslateError> {
        let rep = self.get_rep(source)?;
        let seq = self.as_sequence(rep)?;

        let guard_scope = seq.iterator.scope.up(1).map_err(|_| {
            TranslateError::UnsupportedStructure(
                "First applied directly to the record stream".to_string(),
            )
        })?;
        let guard = self.names.fresh("is_first");
        self.buf.declare_variable_at(
            &guard_scope,
            VarDecl {
                cpp_type: "bool".to_string(),
                name: guard.clone(),
                init: Some("true".to_string()),
            },
        )?;

        match (*seq.value).clone() {
            Rep::Sequence(inner) => {
                let body = self.buf.alloc_block();
                self.buf.add_statement_to(
                    body,
                    Statement::Assign { target: guard.clone(), value: "false".to_string() },
                );
                self.buf.add_statement_below(
                    Statement::IfTest { condition: guard, body },
                    &inner.scope,
                )?;
                let guarded = inner.scope.down(body)?;
                self.buf.set_scope(&guarded);
                Ok(Rep::Sequence(Sequence {
                    iterator: inner.iterator,
                    value: inner.value,
                    scope: guarded,
                }))
            }
            other => {
                self.buf.set_scope(other.scope());
                let body = self.buf.alloc_block();
                self.buf.add_statement(Statement::IfTest { condition: guard.clone(), body });
                self.buf.add_statement(Statement::Assign {
                    target: guard,
                    value: "false".to_string(),
                });
                let inside = self.buf.current_scope();
                Ok(other.rescope(inside))
            }
        }
    }

    fn aggregate_rep(
        &mut self,
        source: NodeId,
        init: &AggregateInit,
        accumulator: &Lambda,
    ) -> Result<Rep, TranslateError> {
        if matches!(init, AggregateInit::SeedFunc(_)) {
            return Err(TranslateError::UnsupportedStructure(
                "aggregate with a seed function".to_string(),
            ));
        }
        let rep = self.get_rep(source)?;
        let seq = self.as_sequence(rep)?;
        let decl_scope = seq.scope.clone();

        // Accumulator variable: seeded forms take the seed's type and value,
        // first-item forms take the item's type and a default.
        let (acc_ty, acc_init) = match init {
            AggregateInit::Seed(seed) => {
                let v = self.value_rep(*seed)?;
                if !v.ty.is_numeric_scalar() {
                    return Err(TranslateError::AccumulationType(v.ty.to_string()));
                }
                (v.ty.clone(), Some(v.expr))
            }
            AggregateInit::FirstItem => {
                let v = self.as_value(&seq.value)?.clone();
                if !v.ty.is_numeric_scalar() {
                    return Err(TranslateError::AccumulationType(v.ty.to_string()));
                }
                (v.ty.clone(), v.ty.default_value())
            }
            AggregateInit::SeedFunc(_) => unreachable!(),
        };

        let acc = self.names.fresh("agg");
        self.buf.declare_variable_at(
            &decl_scope,
            VarDecl { cpp_type: acc_ty.to_string(), name: acc.clone(), init: acc_init },
        )?;

        let item = (*seq.value).clone();
        let item_scope = item.scope().clone();
        let acc_rep = Rep::Value(Value::new(acc.clone(), acc_ty.clone(), item_scope.clone()));

        self.buf.set_scope(&item_scope);
        match init {
            AggregateInit::Seed(_) => {
                let body = self.with_bindings(
                    &accumulator.params,
                    vec![acc_rep, item],
                    |t| {
                        let rep = t.get_rep(accumulator.body)?;
                        Ok(t.as_value(&rep)?.clone())
                    },
                )?;
                self.buf.add_statement(Statement::Assign { target: acc.clone(), value: body.expr });
            }
            AggregateInit::FirstItem => {
                let is_first = self.names.fresh("is_first");
                self.buf.declare_variable_at(
                    &decl_scope,
                    VarDecl {
                        cpp_type: "bool".to_string(),
                        name: is_first.clone(),
                        init: Some("true".to_string()),
                    },
                )?;
                let item_expr = self.as_value(&item)?.expr.clone();

                let body = self.buf.alloc_block();
                self.buf.add_statement(Statement::IfTest {
                    condition: is_first.clone(),
                    body,
                });
                self.buf.add_statement(Statement::Assign {
                    target: is_first,
                    value: "false".to_string(),
                });
                self.buf.add_statement(Statement::Assign {
                    target: acc.clone(),
                    value: item_expr,
                });
                self.buf.pop_scope();

                let body = self.buf.alloc_block();
                self.buf.add_statement(Statement::Else { body });
                let folded = self.with_bindings(
                    &accumulator.params,
                    vec![acc_rep, item],
                    |t| {
                        let rep = t.get_rep(accumulator.body)?;
                        Ok(t.as_value(&rep)?.clone())
                    },
                )?;
                self.buf.add_statement(Statement::Assign {
                    target: acc.clone(),
                    value: folded.expr,
                });
            }
            AggregateInit::SeedFunc(_) => unreachable!(),
        }
        // The accumulated result is only valid once the iteration completes.
        self.buf.set_scope(&decl_scope);

        Ok(Rep::Value(Value::new(acc, acc_ty, decl_scope)))
    }

    // ---- result projection ----

    fn translate_projection(
        &mut self,
        source: NodeId,
        columns: &[String],
    ) -> Result<(), TranslateError> {
        let rep = self.get_rep(source)?;
        let record_scope = self.buf.record_scope();

        // Peel off the implicit per-record stream.
        let per_record = match rep {
            Rep::Sequence(ref s) if self.is_record_iterator(&s.iterator) => (*s.value).clone(),
            other => other,
        };
        let per_record = match per_record {
            Rep::Collection(_) => Rep::Sequence(self.as_sequence(per_record)?),
            other => other,
        };

        // One element representation per output column. A sequence of tuples
        // becomes parallel array columns sharing the iteration.
        let elements: Vec<Rep> = match per_record {
            Rep::Tuple { elements, .. } => elements,
            Rep::Sequence(s) => match (*s.value).clone() {
                Rep::Tuple { elements, .. } => elements
                    .into_iter()
                    .map(|el| {
                        Rep::Sequence(Sequence {
                            iterator: s.iterator.clone(),
                            value: Box::new(el),
                            scope: s.scope.clone(),
                        })
                    })
                    .collect(),
                _ => vec![Rep::Sequence(s)],
            },
            other => vec![other],
        };

        if columns.len() != elements.len() {
            return Err(TranslateError::ColumnMismatch {
                expected: columns.len(),
                actual: elements.len(),
            });
        }

        let mut array_storages = Vec::new();
        for (column, element) in columns.iter().zip(elements) {
            let element = match element {
                Rep::Collection(_) => Rep::Sequence(self.as_sequence(element)?),
                other => other,
            };
            match element {
                Rep::Value(v) => {
                    let storage = self.book_column(column, &v.ty.to_string(), false)?;
                    let fill_scope = Scope::deepest(&v.scope, &record_scope).clone();
                    self.buf.set_scope(&fill_scope);
                    self.buf.add_statement(Statement::Assign {
                        target: storage,
                        value: v.expr,
                    });
                }
                Rep::Sequence(s) => {
                    let v = match (*s.value).clone() {
                        Rep::Value(v) => v,
                        _ => {
                            return Err(TranslateError::UnsupportedStructure(format!(
                                "column '{column}' is more than one level deep"
                            )))
                        }
                    };
                    let storage =
                        self.book_column(column, &format!("std::vector<{}>", v.ty), true)?;
                    let fill_scope = Scope::deepest(&v.scope, &record_scope).clone();
                    self.buf.set_scope(&fill_scope);
                    self.buf.add_statement(Statement::PushBack {
                        collection: storage.clone(),
                        value: v.expr,
                    });
                    array_storages.push(storage);
                }
                Rep::Tuple { .. } => {
                    return Err(TranslateError::UnsupportedStructure(format!(
                        "column '{column}' is a nested tuple"
                    )))
                }
                Rep::Collection(_) => unreachable!(),
            }
        }

        self.buf.set_scope(&record_scope);
        self.buf.add_statement(Statement::CommitRecord);
        for storage in array_storages {
            self.buf.add_statement(Statement::Clear { collection: storage });
        }
        Ok(())
    }

    /// Declare persistent storage for a column, book it, and record the
    /// output field. Returns the storage variable name.
    fn book_column(
        &mut self,
        column: &str,
        cpp_type: &str,
        is_array: bool,
    ) -> Result<String, TranslateError> {
        let storage = format!("_{column}");
        self.buf.declare_variable_at(
            &Scope::TopLevel,
            VarDecl { cpp_type: cpp_type.to_string(), name: storage.clone(), init: None },
        )?;
        self.buf.add_book_statement(Statement::BookField {
            column: column.to_string(),
            storage: storage.clone(),
        });
        self.output_fields.push(OutputField {
            column: column.to_string(),
            storage: storage.clone(),
            cpp_type: cpp_type.to_string(),
            is_array,
        });
        Ok(storage)
    }

    // ---- helpers ----

    /// Open a sequence out of a representation, emitting a loop for a
    /// collection that has not been iterated yet. Leaves the cursor wherever
    /// the sequence's items are valid.
    fn as_sequence(&mut self, rep: Rep) -> Result<Sequence, TranslateError> {
        match rep {
            Rep::Sequence(s) => Ok(s),
            Rep::Collection(c) => {
                let element = match &c.ty {
                    SemanticType::Collection { element, .. } => (**element).clone(),
                    other => {
                        return Err(TranslateError::QueryShape(format!(
                            "cannot iterate a value of type '{other}'"
                        )))
                    }
                };
                let var = self.names.fresh("i_obj");
                let iterable =
                    if c.ty.is_pointer() { format!("*{}", c.expr) } else { c.expr.clone() };
                self.buf.set_scope(&c.scope);
                let body = self.buf.alloc_block();
                self.buf.add_statement(Statement::Loop { var: var.clone(), iterable, body });
                let inside = self.buf.current_scope();
                let iterator = Value::new(var, element, inside);
                Ok(Sequence {
                    iterator: iterator.clone(),
                    value: Box::new(Rep::Value(iterator)),
                    scope: c.scope,
                })
            }
            Rep::Value(v) => Err(TranslateError::QueryShape(format!(
                "cannot iterate a value of type '{}'",
                v.ty
            ))),
            Rep::Tuple { .. } => {
                Err(TranslateError::QueryShape("cannot iterate a tuple".to_string()))
            }
        }
    }

    fn as_value<'r>(&self, rep: &'r Rep) -> Result<&'r Value, TranslateError> {
        match rep {
            Rep::Value(v) | Rep::Collection(v) => Ok(v),
            Rep::Sequence(_) => Err(TranslateError::QueryShape(
                "expected a single value, found a sequence".to_string(),
            )),
            Rep::Tuple { .. } => Err(TranslateError::QueryShape(
                "expected a single value, found a tuple".to_string(),
            )),
        }
    }

    fn value_rep(&mut self, id: NodeId) -> Result<Value, TranslateError> {
        let rep = self.get_rep(id)?;
        Ok(self.as_value(&rep)?.clone())
    }

    fn is_record_iterator(&self, v: &Value) -> bool {
        v.expr == self.config.record_var
    }

    fn with_bindings<T>(
        &mut self,
        params: &[String],
        reps: Vec<Rep>,
        f: impl FnOnce(&mut Self) -> Result<T, TranslateError>,
    ) -> Result<T, TranslateError> {
        if params.len() != reps.len() {
            return Err(TranslateError::QueryShape(format!(
                "lambda of {} parameters applied to {} arguments",
                params.len(),
                reps.len()
            )));
        }
        let mut saved = Vec::with_capacity(params.len());
        for (param, rep) in params.iter().zip(reps) {
            saved.push((param.clone(), self.bindings.insert(param.clone(), rep)));
        }
        let result = f(self);
        for (param, old) in saved {
            match old {
                Some(rep) => {
                    self.bindings.insert(param, rep);
                }
                None => {
                    self.bindings.remove(&param);
                }
            }
        }
        result
    }
}
