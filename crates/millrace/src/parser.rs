//! Recursive-descent parser from scanned segments to the AST.
//!
//! Tags are parsed one at a time; block tags pull further segments until
//! their matching end tag. Expression parsing runs over the token stream of
//! a single tag with a nesting-depth guard against pathological inputs.

use ahash::AHashMap;

use crate::{
    ast::{
        AssignSource, BinOpKind, CmpOp, Expr, ExprLoc, Literal, LookupKey, LoopMode, NodeList, PathSeg, Root, Stmt,
        StmtLoc, UnaryOpKind,
    },
    error::{CodeLoc, Exception},
    lexer::{Segment, TagKind, Tok, Token, scan, tokenize},
};

/// Maximum expression nesting depth during parsing, preventing stack
/// overflow on inputs like `((((((x))))))`.
pub(crate) const MAX_NESTING_DEPTH: u16 = 128;

/// Reserved words that open, continue, or close block tags. Custom extension
/// tags may not shadow these.
pub(crate) const RESERVED_TAGS: &[&str] = &[
    "if", "elif", "else", "endif", "for", "endfor", "each", "endeach", "while", "endwhile", "switch", "case",
    "default", "endswitch", "block", "endblock", "macro", "endmacro", "filter", "endfilter", "call", "endcall",
    "raw", "endraw", "verbatim", "endverbatim", "set", "endset", "var", "endvar", "guard", "recover", "endguard",
    "capture", "endcapture", "extends", "include", "import", "from", "do", "option", "extern", "output_command",
    "set_path",
];

/// Parses template source. `custom_tags` maps extension tag names to whether
/// the extension takes a `{% end<name> %}`-terminated body.
pub(crate) fn parse(source: &str, custom_tags: &AHashMap<String, bool>) -> Result<Root, Exception> {
    let segments = scan(source)?;
    let mut parser = Parser { segments, pos: 0, custom_tags };
    let (body, end) = parser.parse_nodes(&[])?;
    debug_assert!(end.is_none(), "top level cannot hit an end tag");
    Ok(Root { body })
}

/// An end tag that terminated a [`Parser::parse_nodes`] run: its keyword,
/// remaining tokens, and position.
struct EndTag {
    word: String,
    tokens: Vec<Token>,
    loc: CodeLoc,
}

struct Parser<'a> {
    segments: Vec<Segment>,
    pos: usize,
    custom_tags: &'a AHashMap<String, bool>,
}

impl Parser<'_> {
    /// Parses statements until one of `stops` appears as a tag keyword, or
    /// until end of input when `stops` is empty.
    fn parse_nodes(&mut self, stops: &[&str]) -> Result<(NodeList, Option<EndTag>), Exception> {
        let mut nodes = NodeList::new();
        while self.pos < self.segments.len() {
            let segment = self.segments[self.pos].clone();
            self.pos += 1;
            match segment {
                Segment::Text(text, loc) => nodes.push(StmtLoc::new(Stmt::TemplateData(text), loc)),
                Segment::Tag { kind: TagKind::Output, content, loc } => {
                    let tokens = tokenize(&content, loc)?;
                    let mut ep = ExprParser::new(tokens, loc);
                    let expr = ep.parse_expression()?;
                    ep.expect_end()?;
                    nodes.push(StmtLoc::new(Stmt::Output(expr), loc));
                }
                Segment::Tag { kind: TagKind::Stmt, content, loc } => {
                    let tokens = tokenize(&content, loc)?;
                    let Some(Token { tok: Tok::Ident(word), .. }) = tokens.first() else {
                        return Err(Exception::syntax("expected a tag name", loc.line, loc.column));
                    };
                    let word = word.clone();
                    if stops.contains(&word.as_str()) {
                        return Ok((nodes, Some(EndTag { word, tokens: tokens[1..].to_vec(), loc })));
                    }
                    let stmt = self.parse_tag(&word, tokens[1..].to_vec(), loc)?;
                    nodes.push(StmtLoc::new(stmt, loc));
                }
            }
        }
        if stops.is_empty() {
            Ok((nodes, None))
        } else {
            Err(Exception::syntax(
                format!("missing closing tag, expected one of: {}", stops.join(", ")),
                1,
                0,
            ))
        }
    }

    /// Like [`Self::parse_nodes`] but requires the terminating tag to be
    /// exactly `end` with no trailing tokens.
    fn parse_body(&mut self, end: &str) -> Result<NodeList, Exception> {
        let (nodes, stop) = self.parse_nodes(&[end])?;
        let stop = stop.expect("parse_nodes only returns None for empty stops");
        expect_no_tokens(&stop)?;
        Ok(nodes)
    }

    fn parse_tag(&mut self, word: &str, tokens: Vec<Token>, loc: CodeLoc) -> Result<Stmt, Exception> {
        match word {
            "if" => self.parse_if(tokens, loc),
            "for" => self.parse_for(tokens, loc, LoopMode::Sequential),
            "each" => self.parse_for(tokens, loc, LoopMode::Concurrent),
            "while" => {
                let cond = parse_full_expr(tokens, loc)?;
                let body = self.parse_body("endwhile")?;
                Ok(Stmt::While { cond, body })
            }
            "switch" => self.parse_switch(tokens, loc),
            "block" => {
                let mut ep = ExprParser::new(tokens, loc);
                let name = ep.expect_ident("block name")?;
                ep.expect_end()?;
                let body = self.parse_body("endblock")?;
                Ok(Stmt::Block { name, body })
            }
            "macro" => self.parse_macro(tokens, loc),
            "call" => {
                let call = parse_full_expr(tokens, loc)?;
                if !matches!(call.expr, Expr::FunCall { .. }) {
                    return Err(Exception::syntax("`call` requires a macro invocation", loc.line, loc.column));
                }
                let body = self.parse_body("endcall")?;
                Ok(Stmt::CallBlock { call, body })
            }
            "filter" => {
                let mut ep = ExprParser::new(tokens, loc);
                let name = ep.expect_ident("filter name")?;
                let args = if ep.accept_op("(") { ep.parse_plain_args()? } else { Vec::new() };
                ep.expect_end()?;
                let body = self.parse_body("endfilter")?;
                Ok(Stmt::FilterBlock { name, args, body })
            }
            "set" => self.parse_assign(tokens, loc, false),
            "var" => self.parse_assign(tokens, loc, true),
            "capture" => {
                // a bare capture block has no binding target; its value is
                // discarded, so it only matters for its handler side effects
                let mut ep = ExprParser::new(tokens, loc);
                let focus = ep.parse_focus_marker()?;
                ep.expect_end()?;
                let body = self.parse_body("endcapture")?;
                Ok(Stmt::Assign {
                    declare: true,
                    targets: Vec::new(),
                    value: AssignSource::Capture { body, focus },
                })
            }
            "guard" => {
                let mut ep = ExprParser::new(tokens, loc);
                ep.accept_op("*");
                ep.expect_end()?;
                let (body, stop) = self.parse_nodes(&["recover", "endguard"])?;
                let stop = stop.expect("stops are non-empty");
                let recover = if stop.word == "recover" {
                    expect_no_tokens(&stop)?;
                    self.parse_body("endguard")?
                } else {
                    expect_no_tokens(&stop)?;
                    NodeList::new()
                };
                Ok(Stmt::Guard { body, recover })
            }
            "extends" => Ok(Stmt::Extends(parse_full_expr(tokens, loc)?)),
            "include" => {
                let mut ep = ExprParser::new(tokens, loc);
                let template = ep.parse_expression()?;
                let ignore_missing = if ep.accept_ident("ignore") {
                    if !ep.accept_ident("missing") {
                        return Err(Exception::syntax("expected `missing` after `ignore`", loc.line, loc.column));
                    }
                    true
                } else {
                    false
                };
                ep.expect_end()?;
                Ok(Stmt::Include { template, ignore_missing })
            }
            "import" => {
                let mut ep = ExprParser::new(tokens, loc);
                let template = ep.parse_expression()?;
                if !ep.accept_ident("as") {
                    return Err(Exception::syntax("expected `as` in import", loc.line, loc.column));
                }
                let target = ep.expect_ident("import alias")?;
                let with_context = ep.parse_context_modifier(false)?;
                ep.expect_end()?;
                Ok(Stmt::Import { template, target, with_context })
            }
            "from" => {
                let mut ep = ExprParser::new(tokens, loc);
                let template = ep.parse_expression()?;
                if !ep.accept_ident("import") {
                    return Err(Exception::syntax("expected `import` in from-import", loc.line, loc.column));
                }
                let mut names = Vec::new();
                loop {
                    let name = ep.expect_ident("imported name")?;
                    let alias = if ep.accept_ident("as") { Some(ep.expect_ident("import alias")?) } else { None };
                    names.push((name, alias));
                    if !ep.accept_op(",") {
                        break;
                    }
                }
                let with_context = ep.parse_context_modifier(false)?;
                ep.expect_end()?;
                Ok(Stmt::FromImport { template, names, with_context })
            }
            "do" => Ok(Stmt::Do(parse_full_expr(tokens, loc)?)),
            "option" => {
                let mut ep = ExprParser::new(tokens, loc);
                let key = ep.expect_ident("option key")?;
                ep.expect_op("=")?;
                let value = ep.expect_str("option value")?;
                ep.expect_end()?;
                Ok(Stmt::Option { key, value })
            }
            "extern" => {
                let mut ep = ExprParser::new(tokens, loc);
                let mut names = vec![ep.expect_ident("extern name")?];
                while ep.accept_op(",") {
                    names.push(ep.expect_ident("extern name")?);
                }
                ep.expect_end()?;
                Ok(Stmt::Extern { names })
            }
            "output_command" => parse_output_command(tokens, loc),
            "set_path" => parse_set_path(tokens, loc),
            custom => {
                let Some(&has_body) = self.custom_tags.get(custom) else {
                    return Err(Exception::syntax(format!("unknown tag `{custom}`"), loc.line, loc.column));
                };
                let mut ep = ExprParser::new(tokens, loc);
                let args = if ep.accept_op("(") { ep.parse_plain_args()? } else { Vec::new() };
                ep.expect_end()?;
                let body = if has_body {
                    Some(self.parse_body(&format!("end{custom}"))?)
                } else {
                    None
                };
                Ok(Stmt::CallExtension { name: custom.to_owned(), args, body })
            }
        }
    }

    fn parse_if(&mut self, tokens: Vec<Token>, loc: CodeLoc) -> Result<Stmt, Exception> {
        let cond = parse_full_expr(tokens, loc)?;
        let (then, stop) = self.parse_nodes(&["elif", "else", "endif"])?;
        let stop = stop.expect("stops are non-empty");
        let otherwise = match stop.word.as_str() {
            "elif" => {
                let nested = self.parse_if(stop.tokens, stop.loc)?;
                Some(vec![StmtLoc::new(nested, stop.loc)])
            }
            "else" => {
                expect_no_tokens(&stop)?;
                Some(self.parse_body("endif")?)
            }
            _ => {
                expect_no_tokens(&stop)?;
                None
            }
        };
        Ok(Stmt::If { cond, then, otherwise })
    }

    fn parse_for(&mut self, tokens: Vec<Token>, loc: CodeLoc, mode: LoopMode) -> Result<Stmt, Exception> {
        let mut ep = ExprParser::new(tokens, loc);
        let limit = if mode == LoopMode::Concurrent && ep.accept_op("(") {
            let n = ep.expect_int("concurrency limit")?;
            ep.expect_op(")")?;
            Some(usize::try_from(n).map_err(|_| Exception::syntax("invalid concurrency limit", loc.line, loc.column))?)
        } else {
            None
        };
        let mut targets = vec![ep.expect_ident("loop variable")?];
        while ep.accept_op(",") {
            targets.push(ep.expect_ident("loop variable")?);
        }
        if !ep.accept_ident("in") {
            return Err(Exception::syntax("expected `in` in loop header", loc.line, loc.column));
        }
        let iter = ep.parse_expression()?;
        ep.expect_end()?;
        let end = if mode == LoopMode::Sequential { "endfor" } else { "endeach" };
        let (body, stop) = self.parse_nodes(&["else", end])?;
        let stop = stop.expect("stops are non-empty");
        let otherwise = if stop.word == "else" {
            expect_no_tokens(&stop)?;
            Some(self.parse_body(end)?)
        } else {
            expect_no_tokens(&stop)?;
            None
        };
        Ok(Stmt::For { mode, limit, targets, iter, body, otherwise })
    }

    fn parse_switch(&mut self, tokens: Vec<Token>, loc: CodeLoc) -> Result<Stmt, Exception> {
        let subject = parse_full_expr(tokens, loc)?;
        // leading text between `switch` and the first `case` must be blank
        let (lead, mut stop_opt) = self.parse_nodes(&["case", "default", "endswitch"])?;
        if lead.iter().any(|n| !matches!(&n.stmt, Stmt::TemplateData(t) if t.trim().is_empty())) {
            return Err(Exception::syntax("content before first `case`", loc.line, loc.column));
        }
        let mut cases: Vec<(Vec<ExprLoc>, NodeList)> = Vec::new();
        let mut default = None;
        loop {
            let stop = stop_opt.expect("stops are non-empty");
            match stop.word.as_str() {
                "case" => {
                    let mut ep = ExprParser::new(stop.tokens, stop.loc);
                    let mut exprs = vec![ep.parse_expression()?];
                    while ep.accept_op(",") {
                        exprs.push(ep.parse_expression()?);
                    }
                    ep.expect_end()?;
                    let (body, next) = self.parse_nodes(&["case", "default", "endswitch"])?;
                    cases.push((exprs, body));
                    stop_opt = next;
                }
                "default" => {
                    expect_no_tokens(&stop)?;
                    let (body, next) = self.parse_nodes(&["case", "default", "endswitch"])?;
                    if default.replace(body).is_some() {
                        return Err(Exception::syntax("multiple `default` arms", stop.loc.line, stop.loc.column));
                    }
                    stop_opt = next;
                }
                _ => {
                    expect_no_tokens(&stop)?;
                    return Ok(Stmt::Switch { subject, cases, default });
                }
            }
        }
    }

    fn parse_macro(&mut self, tokens: Vec<Token>, loc: CodeLoc) -> Result<Stmt, Exception> {
        let mut ep = ExprParser::new(tokens, loc);
        let name = ep.expect_ident("macro name")?;
        let mut params = Vec::new();
        if ep.accept_op("(") {
            if !ep.accept_op(")") {
                loop {
                    let pname = ep.expect_ident("parameter name")?;
                    let default = if ep.accept_op("=") { Some(ep.parse_expression()?) } else { None };
                    params.push((pname, default));
                    if ep.accept_op(")") {
                        break;
                    }
                    ep.expect_op(",")?;
                }
            }
        }
        ep.expect_end()?;
        let body = self.parse_body("endmacro")?;
        Ok(Stmt::Macro { name, params, body })
    }

    fn parse_assign(&mut self, tokens: Vec<Token>, loc: CodeLoc, declare: bool) -> Result<Stmt, Exception> {
        let mut ep = ExprParser::new(tokens, loc);
        let mut targets = vec![ep.expect_ident("assignment target")?];
        while ep.accept_op(",") {
            targets.push(ep.expect_ident("assignment target")?);
        }
        if ep.accept_op("=") {
            let value = ep.parse_expression()?;
            ep.expect_end()?;
            return Ok(Stmt::Assign { declare, targets, value: AssignSource::Expr(value) });
        }
        // capture form: the tag body up to endset/endvar becomes the value
        let focus = ep.parse_focus_marker()?;
        ep.expect_end()?;
        let end = if declare { "endvar" } else { "endset" };
        let body = self.parse_body(end)?;
        Ok(Stmt::Assign { declare, targets, value: AssignSource::Capture { body, focus } })
    }
}

/// Requires an end tag to have no trailing tokens (`{% endif x %}` is an
/// error).
fn expect_no_tokens(stop: &EndTag) -> Result<(), Exception> {
    if stop.tokens.is_empty() {
        Ok(())
    } else {
        Err(Exception::syntax(
            format!("unexpected tokens after `{}`", stop.word),
            stop.loc.line,
            stop.loc.column,
        ))
    }
}

/// Parses a complete expression from a tag's remaining tokens, requiring all
/// tokens to be consumed.
fn parse_full_expr(tokens: Vec<Token>, loc: CodeLoc) -> Result<ExprLoc, Exception> {
    let mut ep = ExprParser::new(tokens, loc);
    let expr = ep.parse_expression()?;
    ep.expect_end()?;
    Ok(expr)
}

/// Parses `output_command HANDLER[.METHOD](PATH_ARRAY, ARGS...)`.
///
/// The callee is either a bare handler symbol (callable-handler form) or
/// exactly `handler.method`. The first argument must be the path array the
/// transpiler emits: string literals for property names, `[]` for the
/// last-element marker, any other expression for dynamic segments.
fn parse_output_command(tokens: Vec<Token>, loc: CodeLoc) -> Result<Stmt, Exception> {
    let call = parse_full_expr(tokens, loc)?;
    let Expr::FunCall { callee, args, kwargs, .. } = call.expr else {
        return Err(Exception::syntax("output_command requires a call", loc.line, loc.column));
    };
    if !kwargs.is_empty() {
        return Err(Exception::syntax("output_command does not take keyword arguments", loc.line, loc.column));
    }
    let (handler, method) = match callee.expr {
        Expr::Symbol(name) => (name, String::new()),
        Expr::LookupVal { target, key: LookupKey::Attr(method) } => {
            let Expr::Symbol(handler) = target.expr else {
                return Err(Exception::syntax("invalid output_command target", loc.line, loc.column));
            };
            (handler, method)
        }
        _ => return Err(Exception::syntax("invalid output_command target", loc.line, loc.column)),
    };
    let mut args = args.into_iter();
    let Some(path_arg) = args.next() else {
        return Err(Exception::syntax("output_command requires a path array", loc.line, loc.column));
    };
    let Expr::Array(segments) = path_arg.expr else {
        return Err(Exception::syntax("output_command path must be an array literal", loc.line, loc.column));
    };
    let path = segments.into_iter().map(path_seg_from_expr).collect();
    Ok(Stmt::OutputCommand { handler, method, path, args: args.collect(), loc })
}

fn path_seg_from_expr(expr: ExprLoc) -> PathSeg {
    match &expr.expr {
        Expr::Literal(Literal::Str(s)) => PathSeg::Key(s.clone()),
        Expr::Array(items) if items.is_empty() => PathSeg::Last,
        _ => PathSeg::Expr(expr),
    }
}

/// Parses `set_path root.a[expr].b = value`. The `= capture` form is not
/// supported and rejected with an explicit error.
fn parse_set_path(tokens: Vec<Token>, loc: CodeLoc) -> Result<Stmt, Exception> {
    let mut ep = ExprParser::new(tokens, loc);
    let root = ep.expect_ident("set_path target")?;
    let mut path = Vec::new();
    loop {
        if ep.accept_op(".") {
            path.push(PathSeg::Key(ep.expect_ident("path segment")?));
        } else if ep.accept_op("[") {
            if ep.accept_op("]") {
                path.push(PathSeg::Last);
            } else {
                let seg = ep.parse_expression()?;
                ep.expect_op("]")?;
                path.push(path_seg_from_expr(seg));
            }
        } else {
            break;
        }
    }
    ep.expect_op("=")?;
    if ep.peek_ident("capture") {
        return Err(Exception::syntax("set_path does not support capture assignment", loc.line, loc.column));
    }
    let value = ep.parse_expression()?;
    ep.expect_end()?;
    Ok(Stmt::SetPath { root, path, value })
}

pub(crate) struct ExprParser {
    tokens: Vec<Token>,
    pos: usize,
    depth: u16,
    tag_loc: CodeLoc,
}

impl ExprParser {
    pub(crate) fn new(tokens: Vec<Token>, tag_loc: CodeLoc) -> Self {
        Self { tokens, pos: 0, depth: 0, tag_loc }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn loc(&self) -> CodeLoc {
        self.peek().map_or(self.tag_loc, |t| t.loc)
    }

    fn err(&self, message: impl Into<String>) -> Exception {
        let loc = self.loc();
        Exception::syntax(message, loc.line, loc.column)
    }

    fn accept_op(&mut self, op: &str) -> bool {
        if matches!(self.peek(), Some(Token { tok: Tok::Op(o), .. }) if *o == op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn peek_op(&self, op: &str) -> bool {
        matches!(self.peek(), Some(Token { tok: Tok::Op(o), .. }) if *o == op)
    }

    fn expect_op(&mut self, op: &str) -> Result<(), Exception> {
        if self.accept_op(op) { Ok(()) } else { Err(self.err(format!("expected `{op}`"))) }
    }

    fn accept_ident(&mut self, word: &str) -> bool {
        if self.peek_ident(word) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn peek_ident(&self, word: &str) -> bool {
        matches!(self.peek(), Some(Token { tok: Tok::Ident(w), .. }) if w == word)
    }

    fn expect_ident(&mut self, what: &str) -> Result<String, Exception> {
        match self.next() {
            Some(Token { tok: Tok::Ident(w), .. }) => Ok(w),
            _ => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.err(format!("expected {what}")))
            }
        }
    }

    fn expect_str(&mut self, what: &str) -> Result<String, Exception> {
        match self.next() {
            Some(Token { tok: Tok::Str(s), .. }) => Ok(s),
            _ => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.err(format!("expected string for {what}")))
            }
        }
    }

    fn expect_int(&mut self, what: &str) -> Result<i64, Exception> {
        match self.next() {
            Some(Token { tok: Tok::Int(i), .. }) => Ok(i),
            _ => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.err(format!("expected integer for {what}")))
            }
        }
    }

    pub(crate) fn expect_end(&self) -> Result<(), Exception> {
        if self.pos == self.tokens.len() {
            Ok(())
        } else {
            Err(self.err("unexpected trailing tokens"))
        }
    }

    /// Optional `:name` focus marker used by capture-form assignments.
    fn parse_focus_marker(&mut self) -> Result<Option<String>, Exception> {
        if self.accept_op(":") { Ok(Some(self.expect_ident("focus name")?)) } else { Ok(None) }
    }

    /// Optional `with context` / `without context` suffix on imports.
    fn parse_context_modifier(&mut self, default: bool) -> Result<bool, Exception> {
        if self.accept_ident("with") {
            if !self.accept_ident("context") {
                return Err(self.err("expected `context` after `with`"));
            }
            Ok(true)
        } else if self.accept_ident("without") {
            if !self.accept_ident("context") {
                return Err(self.err("expected `context` after `without`"));
            }
            Ok(false)
        } else {
            Ok(default)
        }
    }

    fn enter(&mut self) -> Result<(), Exception> {
        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            return Err(self.err("expression is nested too deeply"));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    /// Entry point: `E1 if C else E2` over the boolean-or level.
    pub(crate) fn parse_expression(&mut self) -> Result<ExprLoc, Exception> {
        self.enter()?;
        let result = self.parse_inline_if();
        self.leave();
        result
    }

    fn parse_inline_if(&mut self) -> Result<ExprLoc, Exception> {
        let then = self.parse_or()?;
        if !self.accept_ident("if") {
            return Ok(then);
        }
        let loc = then.loc;
        let cond = self.parse_or()?;
        let otherwise = if self.accept_ident("else") { Some(Box::new(self.parse_inline_if()?)) } else { None };
        Ok(ExprLoc::new(
            Expr::InlineIf { then: Box::new(then), cond: Box::new(cond), otherwise },
            loc,
        ))
    }

    fn parse_or(&mut self) -> Result<ExprLoc, Exception> {
        let mut lhs = self.parse_and()?;
        while self.accept_ident("or") || self.accept_op("||") {
            let rhs = self.parse_and()?;
            let loc = lhs.loc;
            lhs = ExprLoc::new(Expr::BinOp { op: BinOpKind::Or, lhs: Box::new(lhs), rhs: Box::new(rhs) }, loc);
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<ExprLoc, Exception> {
        let mut lhs = self.parse_not()?;
        while self.accept_ident("and") || self.accept_op("&&") {
            let rhs = self.parse_not()?;
            let loc = lhs.loc;
            lhs = ExprLoc::new(Expr::BinOp { op: BinOpKind::And, lhs: Box::new(lhs), rhs: Box::new(rhs) }, loc);
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> Result<ExprLoc, Exception> {
        if self.peek_ident("not") {
            let loc = self.loc();
            self.pos += 1;
            let operand = self.parse_not()?;
            return Ok(ExprLoc::new(Expr::UnaryOp { op: UnaryOpKind::Not, operand: Box::new(operand) }, loc));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<ExprLoc, Exception> {
        let first = self.parse_concat()?;
        let loc = first.loc;

        // `in` / `not in` / `is [not] test`
        if self.accept_ident("in") {
            let rhs = self.parse_concat()?;
            return Ok(ExprLoc::new(Expr::BinOp { op: BinOpKind::In, lhs: Box::new(first), rhs: Box::new(rhs) }, loc));
        }
        if self.peek_ident("not") && matches!(self.tokens.get(self.pos + 1), Some(Token { tok: Tok::Ident(w), .. }) if w == "in")
        {
            self.pos += 2;
            let rhs = self.parse_concat()?;
            return Ok(ExprLoc::new(
                Expr::BinOp { op: BinOpKind::NotIn, lhs: Box::new(first), rhs: Box::new(rhs) },
                loc,
            ));
        }
        if self.accept_ident("is") {
            let negate = self.accept_ident("not");
            let test = self.expect_ident("test name")?;
            let args = if self.accept_op("(") { self.parse_plain_args()? } else { Vec::new() };
            return Ok(ExprLoc::new(Expr::Is { value: Box::new(first), negate, test, args }, loc));
        }

        let mut rest = Vec::new();
        while let Some(op) = self.accept_cmp_op() {
            let operand = self.parse_concat()?;
            rest.push((op, operand));
        }
        if rest.is_empty() {
            Ok(first)
        } else {
            Ok(ExprLoc::new(Expr::Compare { first: Box::new(first), rest }, loc))
        }
    }

    fn accept_cmp_op(&mut self) -> Option<CmpOp> {
        let op = match self.peek() {
            Some(Token { tok: Tok::Op(o), .. }) => match *o {
                "==" | "===" => CmpOp::Eq,
                "!=" | "!==" => CmpOp::Ne,
                "<" => CmpOp::Lt,
                "<=" => CmpOp::Le,
                ">" => CmpOp::Gt,
                ">=" => CmpOp::Ge,
                _ => return None,
            },
            _ => return None,
        };
        self.pos += 1;
        Some(op)
    }

    fn parse_concat(&mut self) -> Result<ExprLoc, Exception> {
        let mut lhs = self.parse_add()?;
        while self.accept_op("~") {
            let rhs = self.parse_add()?;
            let loc = lhs.loc;
            lhs = ExprLoc::new(Expr::BinOp { op: BinOpKind::Concat, lhs: Box::new(lhs), rhs: Box::new(rhs) }, loc);
        }
        Ok(lhs)
    }

    fn parse_add(&mut self) -> Result<ExprLoc, Exception> {
        let mut lhs = self.parse_mul()?;
        loop {
            let op = if self.accept_op("+") {
                BinOpKind::Add
            } else if self.accept_op("-") {
                BinOpKind::Sub
            } else {
                return Ok(lhs);
            };
            let rhs = self.parse_mul()?;
            let loc = lhs.loc;
            lhs = ExprLoc::new(Expr::BinOp { op, lhs: Box::new(lhs), rhs: Box::new(rhs) }, loc);
        }
    }

    fn parse_mul(&mut self) -> Result<ExprLoc, Exception> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = if self.accept_op("*") {
                BinOpKind::Mul
            } else if self.accept_op("//") {
                BinOpKind::FloorDiv
            } else if self.accept_op("/") {
                BinOpKind::Div
            } else if self.accept_op("%") {
                BinOpKind::Mod
            } else {
                return Ok(lhs);
            };
            let rhs = self.parse_unary()?;
            let loc = lhs.loc;
            lhs = ExprLoc::new(Expr::BinOp { op, lhs: Box::new(lhs), rhs: Box::new(rhs) }, loc);
        }
    }

    fn parse_unary(&mut self) -> Result<ExprLoc, Exception> {
        let loc = self.loc();
        if self.accept_op("-") {
            let operand = self.parse_unary()?;
            return Ok(ExprLoc::new(Expr::UnaryOp { op: UnaryOpKind::Neg, operand: Box::new(operand) }, loc));
        }
        if self.accept_op("+") {
            let operand = self.parse_unary()?;
            return Ok(ExprLoc::new(Expr::UnaryOp { op: UnaryOpKind::Pos, operand: Box::new(operand) }, loc));
        }
        self.parse_pow()
    }

    fn parse_pow(&mut self) -> Result<ExprLoc, Exception> {
        let base = self.parse_postfix()?;
        if self.accept_op("**") {
            let exp = self.parse_unary()?;
            let loc = base.loc;
            return Ok(ExprLoc::new(
                Expr::BinOp { op: BinOpKind::Pow, lhs: Box::new(base), rhs: Box::new(exp) },
                loc,
            ));
        }
        Ok(base)
    }

    /// Postfix chain: lookups, calls, sequence markers, filters.
    fn parse_postfix(&mut self) -> Result<ExprLoc, Exception> {
        self.enter()?;
        let mut expr = self.parse_primary()?;
        loop {
            let loc = expr.loc;
            if self.accept_op(".") {
                let name = self.expect_ident("attribute name")?;
                expr = ExprLoc::new(
                    Expr::LookupVal { target: Box::new(expr), key: LookupKey::Attr(name) },
                    loc,
                );
            } else if self.accept_op("[") {
                let key = self.parse_expression()?;
                self.expect_op("]")?;
                expr = ExprLoc::new(
                    Expr::LookupVal { target: Box::new(expr), key: LookupKey::Index(Box::new(key)) },
                    loc,
                );
            } else if self.peek_op("!") {
                // sequence marker: `path!.call()` wraps the prefix,
                // `method!(args)` tags the call itself
                let after = self.tokens.get(self.pos + 1);
                match after {
                    Some(Token { tok: Tok::Op("."), .. }) => {
                        self.pos += 1;
                        expr = ExprLoc::new(Expr::SeqMarker(Box::new(expr)), loc);
                    }
                    Some(Token { tok: Tok::Op("("), .. }) => {
                        self.pos += 2;
                        let (args, kwargs) = self.parse_call_args()?;
                        expr = ExprLoc::new(
                            Expr::FunCall { callee: Box::new(expr), args, kwargs, seq_method: true, lock_key: None },
                            loc,
                        );
                    }
                    _ => break,
                }
            } else if self.accept_op("(") {
                let (args, kwargs) = self.parse_call_args()?;
                expr = ExprLoc::new(
                    Expr::FunCall { callee: Box::new(expr), args, kwargs, seq_method: false, lock_key: None },
                    loc,
                );
            } else if self.accept_op("|") {
                let name = self.expect_ident("filter name")?;
                let (args, kwargs) = if self.accept_op("(") { self.parse_call_args()? } else { (Vec::new(), Vec::new()) };
                expr = ExprLoc::new(
                    Expr::Filter { value: Box::new(expr), name, args, kwargs, is_async: false },
                    loc,
                );
            } else {
                break;
            }
        }
        self.leave();
        Ok(expr)
    }

    /// Call arguments after the opening paren: positional, `kw=value`,
    /// `*spread`, `**kwspread`.
    fn parse_call_args(&mut self) -> Result<(Vec<ExprLoc>, Vec<(String, ExprLoc)>), Exception> {
        let mut args = Vec::new();
        let mut kwargs = Vec::new();
        if self.accept_op(")") {
            return Ok((args, kwargs));
        }
        loop {
            let loc = self.loc();
            if self.accept_op("**") {
                let expr = self.parse_expression()?;
                args.push(ExprLoc::new(Expr::KeywordSpread(Box::new(expr)), loc));
            } else if self.accept_op("*") {
                let expr = self.parse_expression()?;
                args.push(ExprLoc::new(Expr::Spread(Box::new(expr)), loc));
            } else if let Some(Token { tok: Tok::Ident(name), .. }) = self.peek()
                && matches!(self.tokens.get(self.pos + 1), Some(Token { tok: Tok::Op("="), .. }))
            {
                let name = name.clone();
                self.pos += 2;
                let value = self.parse_expression()?;
                kwargs.push((name, value));
            } else {
                args.push(self.parse_expression()?);
            }
            if self.accept_op(")") {
                return Ok((args, kwargs));
            }
            self.expect_op(",")?;
        }
    }

    /// Positional-only argument list after `(`, for filters/tests that take
    /// no keywords.
    fn parse_plain_args(&mut self) -> Result<Vec<ExprLoc>, Exception> {
        let mut args = Vec::new();
        if self.accept_op(")") {
            return Ok(args);
        }
        loop {
            args.push(self.parse_expression()?);
            if self.accept_op(")") {
                return Ok(args);
            }
            self.expect_op(",")?;
        }
    }

    fn parse_primary(&mut self) -> Result<ExprLoc, Exception> {
        let loc = self.loc();
        let Some(token) = self.next() else {
            return Err(self.err("unexpected end of expression"));
        };
        let expr = match token.tok {
            Tok::Int(i) => Expr::Literal(Literal::Int(i)),
            Tok::Float(f) => Expr::Literal(Literal::Float(f)),
            Tok::Str(s) => Expr::Literal(Literal::Str(s)),
            Tok::Ident(word) => match word.as_str() {
                "true" | "True" => Expr::Literal(Literal::Bool(true)),
                "false" | "False" => Expr::Literal(Literal::Bool(false)),
                "null" | "none" | "None" => Expr::Literal(Literal::Null),
                _ => Expr::Symbol(word),
            },
            Tok::Op("(") => {
                let mut items = vec![self.parse_expression()?];
                while self.accept_op(",") {
                    if self.peek_op(")") {
                        break;
                    }
                    items.push(self.parse_expression()?);
                }
                self.expect_op(")")?;
                if items.len() == 1 {
                    return Ok(ExprLoc::new(items.pop().expect("one item").expr, loc));
                }
                Expr::Group(items)
            }
            Tok::Op("[") => {
                let mut items = Vec::new();
                if !self.accept_op("]") {
                    loop {
                        items.push(self.parse_expression()?);
                        if self.accept_op("]") {
                            break;
                        }
                        self.expect_op(",")?;
                    }
                }
                Expr::Array(items)
            }
            Tok::Op("{") => {
                let mut pairs = Vec::new();
                if !self.accept_op("}") {
                    loop {
                        let key = self.parse_dict_key()?;
                        self.expect_op(":")?;
                        let value = self.parse_expression()?;
                        pairs.push((key, value));
                        if self.accept_op("}") {
                            break;
                        }
                        self.expect_op(",")?;
                    }
                }
                Expr::Dict(pairs)
            }
            other => {
                self.pos -= 1;
                return Err(self.err(format!("unexpected token `{other:?}`")));
            }
        };
        Ok(ExprLoc::new(expr, loc))
    }

    /// Dictionary keys may be quoted strings, bare identifiers, or numbers.
    fn parse_dict_key(&mut self) -> Result<ExprLoc, Exception> {
        let loc = self.loc();
        match self.peek().map(|t| t.tok.clone()) {
            Some(Tok::Ident(word)) => {
                self.pos += 1;
                Ok(ExprLoc::new(Expr::Literal(Literal::Str(word)), loc))
            }
            Some(Tok::Int(i)) => {
                self.pos += 1;
                Ok(ExprLoc::new(Expr::Literal(Literal::Str(i.to_string())), loc))
            }
            _ => self.parse_expression(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_one(src: &str) -> Root {
        parse(src, &AHashMap::new()).unwrap()
    }

    #[test]
    fn parses_if_elif_else() {
        let root = parse_one("{% if a %}1{% elif b %}2{% else %}3{% endif %}");
        let Stmt::If { otherwise, .. } = &root.body[0].stmt else { panic!("expected if") };
        let nested = otherwise.as_ref().unwrap();
        assert!(matches!(&nested[0].stmt, Stmt::If { .. }));
    }

    #[test]
    fn parses_sequence_markers() {
        let root = parse_one("{{ s!.op(1) }}{{ s.op!(2) }}");
        let Stmt::Output(first) = &root.body[0].stmt else { panic!("expected output") };
        let Expr::FunCall { callee, seq_method, .. } = &first.expr else { panic!("expected call") };
        assert!(!seq_method);
        let Expr::LookupVal { target, .. } = &callee.expr else { panic!("expected lookup") };
        assert!(matches!(&target.expr, Expr::SeqMarker(_)));

        let Stmt::Output(second) = &root.body[1].stmt else { panic!("expected output") };
        let Expr::FunCall { seq_method, .. } = &second.expr else { panic!("expected call") };
        assert!(seq_method);
    }

    #[test]
    fn parses_output_command_paths() {
        let root = parse_one(r#"{% output_command data.push(["log", []], "entry") %}"#);
        let Stmt::OutputCommand { handler, method, path, args, .. } = &root.body[0].stmt else {
            panic!("expected output_command")
        };
        assert_eq!(handler, "data");
        assert_eq!(method, "push");
        assert!(matches!(&path[0], PathSeg::Key(k) if k == "log"));
        assert!(matches!(&path[1], PathSeg::Last));
        assert_eq!(args.len(), 1);
    }

    #[test]
    fn parses_capture_assignment_with_focus() {
        let root = parse_one("{% var x :data %}body{% endvar %}");
        let Stmt::Assign { declare, targets, value } = &root.body[0].stmt else { panic!("expected assign") };
        assert!(declare);
        assert_eq!(targets, &["x"]);
        let AssignSource::Capture { focus, .. } = value else { panic!("expected capture") };
        assert_eq!(focus.as_deref(), Some("data"));
    }

    #[test]
    fn parses_each_with_limit() {
        let root = parse_one("{% each(4) item in items %}{{ item }}{% endeach %}");
        let Stmt::For { mode, limit, .. } = &root.body[0].stmt else { panic!("expected loop") };
        assert_eq!(*mode, LoopMode::Concurrent);
        assert_eq!(*limit, Some(4));
    }

    #[test]
    fn parses_filter_chains_and_kwargs() {
        let root = parse_one("{{ items | join(', ') | upper }}");
        let Stmt::Output(expr) = &root.body[0].stmt else { panic!("expected output") };
        let Expr::Filter { name, .. } = &expr.expr else { panic!("expected filter") };
        assert_eq!(name, "upper");
    }

    #[test]
    fn set_path_capture_is_rejected() {
        let err = parse("{% set_path user.name = capture %}", &AHashMap::new()).unwrap_err();
        assert!(err.message.contains("capture"));
    }

    #[test]
    fn unknown_tag_errors() {
        let err = parse("{% flarble %}", &AHashMap::new()).unwrap_err();
        assert!(err.message.contains("flarble"));
    }

    #[test]
    fn comparison_chains_keep_operands() {
        let root = parse_one("{% if 1 < x <= 10 %}y{% endif %}");
        let Stmt::If { cond, .. } = &root.body[0].stmt else { panic!("expected if") };
        let Expr::Compare { rest, .. } = &cond.expr else { panic!("expected compare") };
        assert_eq!(rest.len(), 2);
    }
}
