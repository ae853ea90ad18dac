//! Small traversal seam over the parsed strategy AST.
//!
//! The analyzers consume only a handful of syntactic forms (imports,
//! assignments, calls, branches, names); everything else is walked
//! generically through the helpers here rather than through the full
//! grammar.

use rustpython_parser::{ast, Parse};

use crate::error::SecurityError;

/// Parse one strategy source unit into a statement suite.
///
/// Unparseable source is rejected as a dangerous artifact: obfuscated or
/// truncated submissions routinely fail the parser first.
pub fn parse_strategy(source: &str) -> Result<Vec<ast::Stmt>, SecurityError> {
    ast::Suite::parse(source, "<strategy>").map_err(|e| SecurityError::DangerousPattern {
        reason: format!("unparseable source: {e}"),
    })
}

/// Nested statement blocks directly owned by a statement.
pub fn child_blocks(stmt: &ast::Stmt) -> Vec<&[ast::Stmt]> {
    use ast::Stmt::*;
    match stmt {
        FunctionDef(f) => vec![&f.body],
        AsyncFunctionDef(f) => vec![&f.body],
        ClassDef(c) => vec![&c.body],
        For(f) => vec![&f.body, &f.orelse],
        AsyncFor(f) => vec![&f.body, &f.orelse],
        While(w) => vec![&w.body, &w.orelse],
        If(i) => vec![&i.body, &i.orelse],
        With(w) => vec![&w.body],
        AsyncWith(w) => vec![&w.body],
        Try(t) => {
            let mut blocks: Vec<&[ast::Stmt]> = vec![&t.body];
            for handler in &t.handlers {
                let ast::ExceptHandler::ExceptHandler(h) = handler;
                blocks.push(&h.body);
            }
            blocks.push(&t.orelse);
            blocks.push(&t.finalbody);
            blocks
        }
        TryStar(t) => {
            let mut blocks: Vec<&[ast::Stmt]> = vec![&t.body];
            for handler in &t.handlers {
                let ast::ExceptHandler::ExceptHandler(h) = handler;
                blocks.push(&h.body);
            }
            blocks.push(&t.orelse);
            blocks.push(&t.finalbody);
            blocks
        }
        Match(m) => m.cases.iter().map(|case| case.body.as_slice()).collect(),
        _ => Vec::new(),
    }
}

/// Pre-order walk over a statement list, descending into nested blocks.
pub fn for_each_stmt<'a, F: FnMut(&'a ast::Stmt)>(stmts: &'a [ast::Stmt], f: &mut F) {
    for stmt in stmts {
        f(stmt);
        for block in child_blocks(stmt) {
            for_each_stmt(block, f);
        }
    }
}

/// Expressions directly attached to a statement (tests, targets, values,
/// decorators). Nested statements are not entered; pair with
/// [`for_each_stmt`] for a full sweep.
pub fn immediate_exprs<'a, F: FnMut(&'a ast::Expr)>(stmt: &'a ast::Stmt, f: &mut F) {
    use ast::Stmt::*;
    match stmt {
        FunctionDef(d) => {
            for dec in &d.decorator_list {
                f(dec);
            }
            for arg in d.args.posonlyargs.iter().chain(d.args.args.iter()) {
                if let Some(default) = &arg.default {
                    f(default);
                }
            }
            if let Some(returns) = &d.returns {
                f(returns);
            }
        }
        AsyncFunctionDef(d) => {
            for dec in &d.decorator_list {
                f(dec);
            }
            for arg in d.args.posonlyargs.iter().chain(d.args.args.iter()) {
                if let Some(default) = &arg.default {
                    f(default);
                }
            }
            if let Some(returns) = &d.returns {
                f(returns);
            }
        }
        ClassDef(c) => {
            for base in &c.bases {
                f(base);
            }
            for kw in &c.keywords {
                f(&kw.value);
            }
            for dec in &c.decorator_list {
                f(dec);
            }
        }
        Return(r) => {
            if let Some(value) = &r.value {
                f(value);
            }
        }
        Delete(d) => {
            for target in &d.targets {
                f(target);
            }
        }
        Assign(a) => {
            for target in &a.targets {
                f(target);
            }
            f(&a.value);
        }
        AugAssign(a) => {
            f(&a.target);
            f(&a.value);
        }
        AnnAssign(a) => {
            f(&a.target);
            f(&a.annotation);
            if let Some(value) = &a.value {
                f(value);
            }
        }
        For(s) => {
            f(&s.target);
            f(&s.iter);
        }
        AsyncFor(s) => {
            f(&s.target);
            f(&s.iter);
        }
        While(s) => f(&s.test),
        If(s) => f(&s.test),
        With(s) => {
            for item in &s.items {
                f(&item.context_expr);
                if let Some(vars) = &item.optional_vars {
                    f(vars);
                }
            }
        }
        AsyncWith(s) => {
            for item in &s.items {
                f(&item.context_expr);
                if let Some(vars) = &item.optional_vars {
                    f(vars);
                }
            }
        }
        Match(m) => {
            f(&m.subject);
            for case in &m.cases {
                if let Some(guard) = &case.guard {
                    f(guard);
                }
            }
        }
        Raise(r) => {
            if let Some(exc) = &r.exc {
                f(exc);
            }
            if let Some(cause) = &r.cause {
                f(cause);
            }
        }
        Try(t) => {
            for handler in &t.handlers {
                let ast::ExceptHandler::ExceptHandler(h) = handler;
                if let Some(type_) = &h.type_ {
                    f(type_);
                }
            }
        }
        TryStar(t) => {
            for handler in &t.handlers {
                let ast::ExceptHandler::ExceptHandler(h) = handler;
                if let Some(type_) = &h.type_ {
                    f(type_);
                }
            }
        }
        Assert(a) => {
            f(&a.test);
            if let Some(msg) = &a.msg {
                f(msg);
            }
        }
        Expr(e) => f(&e.value),
        _ => {}
    }
}

/// Pre-order walk over an expression and all of its subexpressions.
pub fn for_each_expr<'a, F: FnMut(&'a ast::Expr)>(expr: &'a ast::Expr, f: &mut F) {
    f(expr);
    use ast::Expr::*;
    match expr {
        BoolOp(e) => {
            for value in &e.values {
                for_each_expr(value, f);
            }
        }
        NamedExpr(e) => {
            for_each_expr(&e.target, f);
            for_each_expr(&e.value, f);
        }
        BinOp(e) => {
            for_each_expr(&e.left, f);
            for_each_expr(&e.right, f);
        }
        UnaryOp(e) => for_each_expr(&e.operand, f),
        Lambda(e) => for_each_expr(&e.body, f),
        IfExp(e) => {
            for_each_expr(&e.test, f);
            for_each_expr(&e.body, f);
            for_each_expr(&e.orelse, f);
        }
        Dict(e) => {
            for key in e.keys.iter().flatten() {
                for_each_expr(key, f);
            }
            for value in &e.values {
                for_each_expr(value, f);
            }
        }
        Set(e) => {
            for elt in &e.elts {
                for_each_expr(elt, f);
            }
        }
        ListComp(e) => {
            for_each_expr(&e.elt, f);
            for gen in &e.generators {
                for_each_comprehension(gen, f);
            }
        }
        SetComp(e) => {
            for_each_expr(&e.elt, f);
            for gen in &e.generators {
                for_each_comprehension(gen, f);
            }
        }
        DictComp(e) => {
            for_each_expr(&e.key, f);
            for_each_expr(&e.value, f);
            for gen in &e.generators {
                for_each_comprehension(gen, f);
            }
        }
        GeneratorExp(e) => {
            for_each_expr(&e.elt, f);
            for gen in &e.generators {
                for_each_comprehension(gen, f);
            }
        }
        Await(e) => for_each_expr(&e.value, f),
        Yield(e) => {
            if let Some(value) = &e.value {
                for_each_expr(value, f);
            }
        }
        YieldFrom(e) => for_each_expr(&e.value, f),
        Compare(e) => {
            for_each_expr(&e.left, f);
            for comparator in &e.comparators {
                for_each_expr(comparator, f);
            }
        }
        Call(e) => {
            for_each_expr(&e.func, f);
            for arg in &e.args {
                for_each_expr(arg, f);
            }
            for kw in &e.keywords {
                for_each_expr(&kw.value, f);
            }
        }
        FormattedValue(e) => {
            for_each_expr(&e.value, f);
            if let Some(spec) = &e.format_spec {
                for_each_expr(spec, f);
            }
        }
        JoinedStr(e) => {
            for value in &e.values {
                for_each_expr(value, f);
            }
        }
        Attribute(e) => for_each_expr(&e.value, f),
        Subscript(e) => {
            for_each_expr(&e.value, f);
            for_each_expr(&e.slice, f);
        }
        Starred(e) => for_each_expr(&e.value, f),
        List(e) => {
            for elt in &e.elts {
                for_each_expr(elt, f);
            }
        }
        Tuple(e) => {
            for elt in &e.elts {
                for_each_expr(elt, f);
            }
        }
        Slice(e) => {
            for part in [&e.lower, &e.upper, &e.step].into_iter().flatten() {
                for_each_expr(part, f);
            }
        }
        Constant(_) | Name(_) => {}
    }
}

fn for_each_comprehension<'a, F: FnMut(&'a ast::Expr)>(gen: &'a ast::Comprehension, f: &mut F) {
    for_each_expr(&gen.target, f);
    for_each_expr(&gen.iter, f);
    for cond in &gen.ifs {
        for_each_expr(cond, f);
    }
}

/// Walk every expression in a statement list: each statement's immediate
/// expressions, deeply, descending into nested blocks.
pub fn for_each_expr_in_stmts<'a, F: FnMut(&'a ast::Expr)>(stmts: &'a [ast::Stmt], f: &mut F) {
    for_each_stmt(stmts, &mut |stmt| {
        immediate_exprs(stmt, &mut |expr| for_each_expr(expr, f));
    });
}

/// Callee name of a call through a bare name: `eval(...)` -> `eval`.
pub fn call_func_name(call: &ast::ExprCall) -> Option<&str> {
    match call.func.as_ref() {
        ast::Expr::Name(name) => Some(name.id.as_str()),
        _ => None,
    }
}

/// Callee attribute of a method-style call: `df.to_csv(...)` -> `to_csv`.
pub fn call_attr_name(call: &ast::ExprCall) -> Option<&str> {
    match call.func.as_ref() {
        ast::Expr::Attribute(attr) => Some(attr.attr.as_str()),
        _ => None,
    }
}

/// Dotted rendering of a name/attribute chain, for log messages:
/// `os.path.join` stays `os.path.join`. Anything else renders opaque.
pub fn dotted_name(expr: &ast::Expr) -> String {
    match expr {
        ast::Expr::Name(name) => name.id.to_string(),
        ast::Expr::Attribute(attr) => {
            format!("{}.{}", dotted_name(&attr.value), attr.attr.as_str())
        }
        _ => "<expr>".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_each_stmt_descends_into_blocks() {
        let suite = parse_strategy(
            r#"
def f(x):
    if x:
        y = 1
    return y
"#,
        )
        .unwrap();
        let mut count = 0;
        for_each_stmt(&suite, &mut |_| count += 1);
        // def, if, assign, return
        assert_eq!(count, 4);
    }

    #[test]
    fn test_for_each_expr_reaches_call_arguments() {
        let suite = parse_strategy("g(h(a), key=b)\n").unwrap();
        let mut names = Vec::new();
        for_each_expr_in_stmts(&suite, &mut |expr| {
            if let ast::Expr::Name(name) = expr {
                names.push(name.id.to_string());
            }
        });
        assert!(names.contains(&"a".to_string()));
        assert!(names.contains(&"b".to_string()));
        assert!(names.contains(&"g".to_string()));
        assert!(names.contains(&"h".to_string()));
    }

    #[test]
    fn test_dotted_name_renders_attribute_chain() {
        let suite = parse_strategy("os.path.join(a, b)\n").unwrap();
        let mut rendered = None;
        for_each_expr_in_stmts(&suite, &mut |expr| {
            if let ast::Expr::Call(call) = expr {
                rendered = Some(dotted_name(&call.func));
            }
        });
        assert_eq!(rendered.as_deref(), Some("os.path.join"));
    }

    #[test]
    fn test_parse_failure_is_dangerous_pattern() {
        let err = parse_strategy("def broken syntax here\n").unwrap_err();
        assert_eq!(err.kind(), "dangerous_pattern");
    }
}
