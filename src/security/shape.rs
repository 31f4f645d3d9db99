//! Parsed statement shape.
//!
//! One walk over the `sqlparser` AST collects what the classifier and the
//! complexity guard need: the first construct that makes a read unsafe, and
//! the join, set-operation and nesting counts.

use super::complexity::ComplexityProfile;
use sqlparser::ast::{
    Expr, ObjectName, ObjectNamePart, Query, SetExpr, Statement, TableFactor, Visit, Visitor,
};
use std::collections::HashSet;
use std::convert::Infallible;
use std::ops::ControlFlow;

/// Functions rejected wherever they are called.
const FORBIDDEN_FUNCTIONS: &[&str] = &[
    "PG_TERMINATE_BACKEND",
    "PG_CANCEL_BACKEND",
    "PG_RELOAD_CONF",
    "PG_READ_FILE",
    "PG_READ_BINARY_FILE",
    "PG_LS_DIR",
    "PG_STAT_FILE",
    "PG_NOTIFY",
    "SET_CONFIG",
    "SETVAL",
    "NEXTVAL",
    "LO_IMPORT",
    "LO_EXPORT",
    "LO_UNLINK",
    "LO_CREATE",
    "LOAD_FILE",
    "SLEEP",
    "BENCHMARK",
    "SYS_CONTEXT",
    "QUERY_TO_XML",
];

/// Function families rejected by prefix.
const FORBIDDEN_FUNCTION_PREFIXES: &[&str] = &["PG_SLEEP", "PG_ADVISORY_", "DBLINK"];

/// Vendor packages and procedure families, rejected as a call or a qualifier.
const FORBIDDEN_PACKAGE_PREFIXES: &[&str] = &["DBMS_", "UTL_", "XP_", "SP_"];

pub(crate) const CATALOG_NAMES: &[&str] =
    &["SYS", "SYSTEM", "DUAL", "ALL_TABLES", "DBA_TABLES", "USER_TABLES"];

pub(crate) const CATALOG_PREFIXES: &[&str] = &["V$", "GV$", "X$", "PG_", "INFORMATION_SCHEMA"];

pub(crate) fn is_catalog(upper: &str) -> bool {
    CATALOG_NAMES.contains(&upper) || CATALOG_PREFIXES.iter().any(|p| upper.starts_with(p))
}

fn is_forbidden_function(upper: &str) -> bool {
    FORBIDDEN_FUNCTIONS.contains(&upper)
        || FORBIDDEN_FUNCTION_PREFIXES.iter().any(|p| upper.starts_with(p))
}

fn is_package(upper: &str) -> bool {
    FORBIDDEN_PACKAGE_PREFIXES.iter().any(|p| upper.starts_with(p))
}

/// Upper-cased identifier parts of a possibly qualified name.
fn parts(name: &ObjectName) -> Vec<String> {
    name.0
        .iter()
        .filter_map(|part| match part {
            ObjectNamePart::Identifier(ident) => Some(ident.value.to_ascii_uppercase()),
            _ => None,
        })
        .collect()
}

/// What one walk over a statement found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatementShape {
    /// Counts only. `length` is left for the caller, which owns the text.
    pub profile: ComplexityProfile,
    /// First unsafe construct, if any.
    pub violation: Option<String>,
}

pub fn inspect(statement: &Statement) -> StatementShape {
    let mut inspector = ShapeInspector::default();
    let _ = statement.visit(&mut inspector);
    inspector.finish()
}

#[derive(Default)]
struct ShapeInspector {
    statements: usize,
    /// One entry per open query: whether it adds a nesting level.
    frames: Vec<bool>,
    /// Parenthesized set-operation operands, which nest without adding depth.
    operands: HashSet<*const Query>,
    max_depth: usize,
    joins: usize,
    set_operations: usize,
    violation: Option<String>,
}

impl ShapeInspector {
    fn flag(&mut self, what: impl Into<String>) {
        if self.violation.is_none() {
            self.violation = Some(what.into());
        }
    }

    /// Walk one query body. Nested queries are reached by the visitor itself.
    fn walk_body(&mut self, body: &SetExpr) {
        match body {
            SetExpr::Select(select) => {
                if select.into.is_some() {
                    self.flag("SELECT INTO");
                }
                self.joins += select.from.iter().map(|t| t.joins.len()).sum::<usize>();
            }
            SetExpr::SetOperation { left, right, .. } => {
                self.set_operations += 1;
                self.walk_body(left);
                self.walk_body(right);
            }
            SetExpr::Query(operand) => {
                self.operands.insert(&**operand as *const Query);
            }
            SetExpr::Values(_) | SetExpr::Table(_) => {}
            _ => self.flag("data-modifying statement"),
        }
    }

    fn check_function(&mut self, name: &ObjectName) {
        let parts = parts(name);

        if let Some(package) = parts.iter().find(|p| is_package(p)) {
            self.flag(package.clone());
        } else if let Some(last) = parts.last().filter(|p| is_forbidden_function(p)) {
            self.flag(format!("{last}()"));
        }
    }

    fn finish(self) -> StatementShape {
        StatementShape {
            profile: ComplexityProfile {
                length: 0,
                joins: self.joins,
                subquery_depth: self.max_depth.saturating_sub(1),
                unions: self.set_operations,
            },
            violation: self.violation,
        }
    }
}

impl Visitor for ShapeInspector {
    type Break = Infallible;

    fn pre_visit_statement(&mut self, _statement: &Statement) -> ControlFlow<Self::Break> {
        self.statements += 1;
        if self.statements > 1 {
            self.flag("nested statement");
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        let nests = !self.operands.remove(&(query as *const Query));
        self.frames.push(nests);
        let depth = self.frames.iter().filter(|nests| **nests).count();
        self.max_depth = self.max_depth.max(depth);

        if !query.locks.is_empty() {
            self.flag("locking clause");
        }
        self.walk_body(&query.body);
        ControlFlow::Continue(())
    }

    fn post_visit_query(&mut self, _query: &Query) -> ControlFlow<Self::Break> {
        self.frames.pop();
        ControlFlow::Continue(())
    }

    fn pre_visit_relation(&mut self, relation: &ObjectName) -> ControlFlow<Self::Break> {
        for part in parts(relation) {
            if is_catalog(&part) || is_package(&part) {
                self.flag(format!("catalog object {part}"));
            } else if is_forbidden_function(&part) {
                self.flag(format!("{part}()"));
            }
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_table_factor(&mut self, factor: &TableFactor) -> ControlFlow<Self::Break> {
        match factor {
            TableFactor::NestedJoin {
                table_with_joins, ..
            } => self.joins += table_with_joins.joins.len(),
            TableFactor::Function { name, .. } => self.check_function(name),
            _ => {}
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        match expr {
            Expr::Function(function) => self.check_function(&function.name),
            Expr::CompoundIdentifier(idents) => {
                if let Some((_, qualifiers)) = idents.split_last() {
                    for qualifier in qualifiers {
                        let upper = qualifier.value.to_ascii_uppercase();
                        if is_package(&upper) || CATALOG_NAMES.contains(&upper.as_str()) {
                            self.flag(format!("catalog object {upper}"));
                        }
                    }
                }
            }
            _ => {}
        }
        ControlFlow::Continue(())
    }
}
