//! The template AST.
//!
//! Nodes carry the source position they were parsed at and, where the `!`
//! sequence marker can appear, the lexical marker bits the sequence analyzer
//! later validates and lowers into lock keys.

use crate::error::CodeLoc;

/// An expression together with its source position.
#[derive(Debug, Clone)]
pub(crate) struct ExprLoc {
    pub expr: Expr,
    pub loc: CodeLoc,
}

impl ExprLoc {
    pub fn new(expr: Expr, loc: CodeLoc) -> Self {
        Self { expr, loc }
    }
}

/// Literal constants.
#[derive(Debug, Clone)]
pub(crate) enum Literal {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Covers plain and template strings; template strings carry no
    /// interpolation in this dialect.
    Str(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnaryOpKind {
    Not,
    Neg,
    Pos,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinOpKind {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
    /// `~` string concatenation.
    Concat,
    And,
    Or,
    In,
    NotIn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// One lookup step in an `a.b` / `a[b]` chain.
#[derive(Debug, Clone)]
pub(crate) enum LookupKey {
    /// Static attribute (`a.b`); also produced for quoted subscripts during
    /// sequence-path normalization.
    Attr(String),
    /// Dynamic subscript (`a[expr]`).
    Index(Box<ExprLoc>),
}

#[derive(Debug, Clone)]
pub(crate) enum Expr {
    Literal(Literal),
    /// A name reference, resolved against frames then the render context.
    Symbol(String),
    /// A parenthesized group; more than one element forms a tuple value.
    Group(Vec<ExprLoc>),
    Array(Vec<ExprLoc>),
    /// Dictionary literal as ordered key/value pairs.
    Dict(Vec<(ExprLoc, ExprLoc)>),
    LookupVal {
        target: Box<ExprLoc>,
        key: LookupKey,
    },
    /// Lexical `!` after a path prefix (`a.b!.c()`), marking object-path
    /// sequencing. Wraps the prefix the lock key is computed from.
    SeqMarker(Box<ExprLoc>),
    FunCall {
        callee: Box<ExprLoc>,
        args: Vec<ExprLoc>,
        kwargs: Vec<(String, ExprLoc)>,
        /// Lexical `!` directly before the argument list (`a.m!(x)`),
        /// marking method-specific sequencing.
        seq_method: bool,
        /// Normalized lock key, filled by the sequence analyzer for any call
        /// guarded by either marker form.
        lock_key: Option<String>,
    },
    Filter {
        value: Box<ExprLoc>,
        name: String,
        args: Vec<ExprLoc>,
        kwargs: Vec<(String, ExprLoc)>,
        /// Set by the compiler when the environment registers the filter as
        /// asynchronous; dispatch then pauses to the host.
        is_async: bool,
    },
    /// `E1 if C else E2`.
    InlineIf {
        then: Box<ExprLoc>,
        cond: Box<ExprLoc>,
        otherwise: Option<Box<ExprLoc>>,
    },
    UnaryOp {
        op: UnaryOpKind,
        operand: Box<ExprLoc>,
    },
    BinOp {
        op: BinOpKind,
        lhs: Box<ExprLoc>,
        rhs: Box<ExprLoc>,
    },
    /// Comparison chain: `a < b <= c` keeps every operand.
    Compare {
        first: Box<ExprLoc>,
        rest: Vec<(CmpOp, ExprLoc)>,
    },
    /// `a is test(args)` / `a is not test`.
    Is {
        value: Box<ExprLoc>,
        negate: bool,
        test: String,
        args: Vec<ExprLoc>,
    },
    /// Splat argument in a call (`*args`).
    Spread(Box<ExprLoc>),
    /// Double-splat argument in a call (`**kwargs`).
    KeywordSpread(Box<ExprLoc>),
}

/// One segment of an output-command path (`@data.a[0][].b`).
#[derive(Debug, Clone)]
pub(crate) enum PathSeg {
    /// Quoted property name.
    Key(String),
    /// `[]` last-element marker.
    Last,
    /// Bare `[expr]` segment, evaluated at command time.
    Expr(ExprLoc),
}

/// How a loop schedules its iterations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopMode {
    /// `for`: iterations run sequentially.
    Sequential,
    /// `each`: concurrent fan-out, optionally bounded by the loop's
    /// concurrency limit.
    Concurrent,
}

/// A statement together with its source position.
#[derive(Debug, Clone)]
pub(crate) struct StmtLoc {
    pub stmt: Stmt,
    pub loc: CodeLoc,
}

impl StmtLoc {
    pub fn new(stmt: Stmt, loc: CodeLoc) -> Self {
        Self { stmt, loc }
    }
}

/// A sequence of statements forming one scope region.
pub(crate) type NodeList = Vec<StmtLoc>;

#[derive(Debug, Clone)]
pub(crate) enum Stmt {
    /// Literal template text between tags.
    TemplateData(String),
    /// `{{ expr }}` output.
    Output(ExprLoc),
    /// `{% do expr %}` — evaluate for effect, discard the value.
    Do(ExprLoc),
    If {
        cond: ExprLoc,
        then: NodeList,
        /// `elif` chains nest here as a single-statement `If`.
        otherwise: Option<NodeList>,
    },
    For {
        mode: LoopMode,
        /// `each(n)` caps in-flight iterations; `None` is unbounded.
        limit: Option<usize>,
        /// Loop targets; two targets over a dict bind key and value.
        targets: Vec<String>,
        iter: ExprLoc,
        body: NodeList,
        /// `{% else %}` arm, rendered when the iterable is empty.
        otherwise: Option<NodeList>,
    },
    While {
        cond: ExprLoc,
        body: NodeList,
    },
    Switch {
        subject: ExprLoc,
        cases: Vec<(Vec<ExprLoc>, NodeList)>,
        default: Option<NodeList>,
    },
    Macro {
        name: String,
        params: Vec<(String, Option<ExprLoc>)>,
        body: NodeList,
    },
    /// `{% call macro(args) %}body{% endcall %}` — binds the body as
    /// `caller` inside the macro.
    CallBlock {
        call: ExprLoc,
        body: NodeList,
    },
    /// `{% filter name(args) %}body{% endfilter %}`.
    FilterBlock {
        name: String,
        args: Vec<ExprLoc>,
        body: NodeList,
    },
    Block {
        name: String,
        body: NodeList,
    },
    Extends(ExprLoc),
    Include {
        template: ExprLoc,
        ignore_missing: bool,
    },
    Import {
        template: ExprLoc,
        target: String,
        with_context: bool,
    },
    FromImport {
        template: ExprLoc,
        names: Vec<(String, Option<String>)>,
        with_context: bool,
    },
    /// Assignment. `declare` distinguishes `var` (binds in the current
    /// frame) from `set` (assigns the nearest declaration).
    Assign {
        declare: bool,
        targets: Vec<String>,
        value: AssignSource,
    },
    /// Path assignment on an existing identifier (`set_path`).
    SetPath {
        root: String,
        path: Vec<PathSeg>,
        value: ExprLoc,
    },
    /// Declares names as context-originating so `!` may root in them.
    Extern {
        names: Vec<String>,
    },
    /// `{% option key="value" %}` render directive.
    Option {
        key: String,
        value: String,
    },
    /// `{% output_command handler.method(path, args...) %}`.
    OutputCommand {
        handler: String,
        method: String,
        path: Vec<PathSeg>,
        args: Vec<ExprLoc>,
        loc: CodeLoc,
    },
    /// `guard * ... recover ... endguard`.
    Guard {
        body: NodeList,
        recover: NodeList,
    },
    /// An environment-registered extension tag, with its parsed arguments
    /// and block body when the extension declares one.
    CallExtension {
        name: String,
        args: Vec<ExprLoc>,
        body: Option<NodeList>,
    },
}

/// What an assignment binds: an expression, or a capture body whose nested
/// render result (optionally focus-projected) becomes the value.
#[derive(Debug, Clone)]
pub(crate) enum AssignSource {
    Expr(ExprLoc),
    Capture {
        body: NodeList,
        focus: Option<String>,
    },
}

/// A macro's runtime shape: name, parameters with defaults, body. Shared by
/// reference from every closure value created for the macro.
#[derive(Debug, Clone)]
pub(crate) struct MacroDef {
    pub name: String,
    pub params: Vec<(String, Option<ExprLoc>)>,
    pub body: NodeList,
}

/// The compiled-from artifact of one parse: the root statement list plus
/// root-level metadata the compiler consumes.
#[derive(Debug, Clone)]
pub(crate) struct Root {
    pub body: NodeList,
}
