//! Script-to-template transpilation.
//!
//! Converts script lines into template tags with stable line numbers: a
//! statement spanning three physical lines emits a tag spanning the same
//! three lines. Classification happens per logical statement after the
//! continuation rules have grouped physical lines.

use crate::{
    error::Exception,
    script::lexer::{LexState, ScriptTok, TokKind, lex_line},
};

/// Block pairs: opener keyword to its required end tag.
const BLOCK_PAIRS: &[(&str, &str)] = &[
    ("for", "endfor"),
    ("each", "endeach"),
    ("while", "endwhile"),
    ("if", "endif"),
    ("switch", "endswitch"),
    ("block", "endblock"),
    ("macro", "endmacro"),
    ("filter", "endfilter"),
    ("call", "endcall"),
    ("raw", "endraw"),
    ("verbatim", "endverbatim"),
    ("set", "endset"),
    ("var", "endvar"),
    ("guard", "endguard"),
    ("capture", "endcapture"),
];

/// Middle tags and the openers they are valid inside.
const MIDDLE_TAGS: &[(&str, &[&str])] = &[
    ("else", &["if", "for", "each"]),
    ("elif", &["if"]),
    ("case", &["switch"]),
    ("default", &["switch"]),
    ("recover", &["guard"]),
];

/// First words that switch a line to tag emission instead of `do`/`set`.
const RESERVED_WORDS: &[&str] = &[
    "if", "elif", "else", "endif", "for", "endfor", "each", "endeach", "while", "endwhile", "switch", "case",
    "default", "endswitch", "block", "endblock", "macro", "endmacro", "filter", "endfilter", "call", "endcall",
    "raw", "endraw", "verbatim", "endverbatim", "set", "endset", "var", "endvar", "guard", "recover", "endguard",
    "capture", "endcapture", "extends", "include", "import", "from", "do", "option", "extern", "print", "revert",
];

/// The operator-to-method table for `@`-command shorthand.
const COMMAND_OPS: &[(&str, &str)] = &[
    ("&&=", "and"),
    ("||=", "or"),
    ("+=", "add"),
    ("-=", "subtract"),
    ("*=", "multiply"),
    ("/=", "divide"),
    ("&=", "bitAnd"),
    ("|=", "bitOr"),
    ("++", "increment"),
    ("--", "decrement"),
    ("=", "set"),
];

/// Characters at a trimmed line end that force continuation onto the next
/// line.
const CONT_END_CHARS: &str = "{([,?:-+=|&.!*/%^<>~";
/// Characters at a line start that continue the previous statement.
const CONT_START_CHARS: &str = "})]{([?:-+=|&.!*/%^<>~";
/// Keywords at a trimmed line end that force continuation.
const CONT_END_WORDS: &[&str] = &["in", "is", "and", "or"];
/// Keywords at a line start that continue an otherwise-complete statement.
/// `else`/`elif` only continue inside open brackets, which is already the
/// forced-continuation case.
const CONT_START_WORDS: &[&str] = &["and", "or", "not", "in", "is"];

#[derive(Debug)]
struct Line {
    no: u32,
    /// The untouched source line, for raw-block passthrough.
    raw: String,
    tokens: Vec<ScriptTok>,
    /// Line ends inside an open block comment or template string.
    open_ended: bool,
}

/// One logical statement: one or more grouped physical lines.
struct Statement {
    first_line: u32,
    line_span: u32,
    /// Code with comments stripped, inner newlines preserved.
    code: String,
    comments: Vec<String>,
}

/// Transpiles script source into an equivalent template string.
///
/// Purely syntactic: no name resolution or sequence validation happens here.
/// Errors carry the offending line number.
pub fn transpile(source: &str) -> Result<String, Exception> {
    let lines = pre_lex(source)?;
    let mut out: Vec<String> = Vec::new();
    let mut stack: Vec<Block> = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        // raw/verbatim bodies pass through untouched
        if let Some(top) = stack.last()
            && (top.opener == "raw" || top.opener == "verbatim")
        {
            let end = format!("end{}", top.opener);
            if lines[i].raw.trim() == end {
                stack.pop();
                out.push(format!("{{%- {end} -%}}"));
            } else {
                out.push(lines[i].raw.clone());
            }
            i += 1;
            continue;
        }

        let start = i;
        let mut code = String::new();
        let mut comments = Vec::new();
        loop {
            let line = &lines[i];
            if !code.is_empty() {
                code.push('\n');
            }
            for tok in &line.tokens {
                match tok.kind {
                    TokKind::Comment => {
                        if !tok.text.is_empty() {
                            comments.push(tok.text.clone());
                        }
                    }
                    TokKind::Code if tok.text.contains(';') => {
                        return Err(Exception::syntax("semicolons are not allowed in script code", line.no, 0));
                    }
                    _ => code.push_str(&tok.text),
                }
            }
            let more = i + 1 < lines.len();
            let forced = line.open_ended || open_bracket_count(&code) > 0 || ends_continuing(&code);
            if forced && more {
                i += 1;
                continue;
            }
            if more && !resets_continuation(&code) && starts_continuing(&lines[i + 1]) {
                i += 1;
                continue;
            }
            break;
        }
        let stmt = Statement {
            first_line: lines[start].no,
            line_span: (i - start + 1) as u32,
            code,
            comments,
        };
        i += 1;
        out.push(emit_statement(&stmt, &mut stack)?);
    }

    if let Some(open) = stack.last() {
        return Err(Exception::syntax(format!("unclosed `{}` block", open.opener), open.line, 0));
    }
    Ok(out.join("\n"))
}

/// An open block on the validation stack. `close_emit` is the tag emitted
/// when the block closes; a `var x = capture` block closes with `endvar`
/// even though the script writes `endcapture`.
struct Block {
    opener: String,
    line: u32,
    close_emit: String,
}

/// Lexes every physical line under the running sticky state.
fn pre_lex(source: &str) -> Result<Vec<Line>, Exception> {
    let mut state = LexState::default();
    let mut lines = Vec::new();
    for (idx, raw) in source.lines().enumerate() {
        let no = (idx + 1) as u32;
        let tokens = lex_line(raw, no, &mut state)?;
        lines.push(Line {
            no,
            raw: raw.to_owned(),
            tokens,
            open_ended: state.in_block_comment || state.in_template_str,
        });
    }
    Ok(lines)
}

/// Net `([{` depth over the code text (strings are already stripped).
fn open_bracket_count(code: &str) -> i32 {
    let mut depth = 0;
    for c in code.chars() {
        match c {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth -= 1,
            _ => {}
        }
    }
    depth
}

/// Whether the trimmed statement end signals continuation: a trailing
/// operator character or a trailing `in`/`is`/`and`/`or` keyword.
fn ends_continuing(code: &str) -> bool {
    let trimmed = code.trim_end();
    let Some(last) = trimmed.chars().last() else {
        return false;
    };
    if CONT_END_CHARS.contains(last) {
        return true;
    }
    let word: String = trimmed.chars().rev().take_while(|c| c.is_alphanumeric() || *c == '_').collect();
    let word: String = word.chars().rev().collect();
    CONT_END_WORDS.contains(&word.as_str()) && trimmed.len() > word.len()
}

/// Whether a line's first significant content continues the previous
/// statement.
fn starts_continuing(line: &Line) -> bool {
    let text: String = line
        .tokens
        .iter()
        .filter(|t| t.kind != TokKind::Comment)
        .map(|t| t.text.as_str())
        .collect();
    let trimmed = text.trim_start();
    let Some(first) = trimmed.chars().next() else {
        return false;
    };
    // a bare `:focus` directive owns its line even though `:` is a
    // continuation starter
    if first == ':' && ident_ok(trimmed[1..].trim()) {
        return false;
    }
    if CONT_START_CHARS.contains(first) {
        return true;
    }
    let word: String = trimmed.chars().take_while(|c| c.is_alphanumeric() || *c == '_').collect();
    CONT_START_WORDS.contains(&word.as_str())
}

/// Whether the statement is a structural tag that resets continuation, so a
/// following `+ 2`-style line is never glued onto `endif`, `else`, and
/// friends. Expression-bearing statements (`var x = 1`, `if a`) still accept
/// continuation lines.
fn resets_continuation(code: &str) -> bool {
    let trimmed = code.trim_start();
    let word: String = trimmed.chars().take_while(|c| c.is_alphanumeric() || *c == '_').collect();
    (word.starts_with("end") && RESERVED_WORDS.contains(&word.as_str()))
        || matches!(word.as_str(), "else" | "recover" | "default" | "raw" | "verbatim" | "capture" | "revert")
}

fn ident_ok(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().is_some_and(|c| c.is_alphabetic() || c == '_') && chars.all(|c| c.is_alphanumeric() || c == '_')
}

/// Emits the template text for one logical statement, padding to its
/// original line span and attaching collected comments after the tag.
fn emit_statement(stmt: &Statement, stack: &mut Vec<Block>) -> Result<String, Exception> {
    let line = stmt.first_line;
    let trimmed = stmt.code.trim();

    if trimmed.starts_with("{%") || trimmed.starts_with("{{") || trimmed.starts_with("{#") {
        return Err(Exception::syntax("template tags are not valid in script source", line, 0));
    }

    let body = if trimmed.is_empty() {
        String::new()
    } else if let Some(rest) = trimmed.strip_prefix(':') {
        let name = rest.trim();
        if !ident_ok(name) {
            return Err(Exception::syntax(format!("invalid focus name `{name}`"), line, 0));
        }
        format!("{{%- option focus=\"{name}\" -%}}")
    } else if trimmed.starts_with('@') {
        emit_command(trimmed, line)?
    } else if trimmed == "revert" || trimmed == "revert()" {
        "{%- output_command _._revert([]) -%}".to_owned()
    } else {
        let first: String = trimmed.chars().take_while(|c| c.is_alphanumeric() || *c == '_').collect();
        match first.as_str() {
            "print" => {
                let expr = trimmed["print".len()..].trim();
                format!("{{{{- {expr} -}}}}")
            }
            "var" | "set" => emit_assign_tag(&trimmed[first.len()..], &first, line, stack)?,
            "capture" => {
                stack.push(Block { opener: "capture".to_owned(), line, close_emit: "endcapture".to_owned() });
                format!("{{%- {trimmed} -%}}")
            }
            word if RESERVED_WORDS.contains(&word) => match track_blocks(word, line, stack)? {
                Some(close) => format!("{{%- {close} -%}}"),
                None => format!("{{%- {trimmed} -%}}"),
            },
            "revert" => {
                return Err(Exception::syntax("`revert` takes no arguments", line, 0));
            }
            _ => {
                if let Some(assign) = classify_assignment(trimmed, line, stack)? {
                    assign
                } else {
                    format!("{{%- do {trimmed} -%}}")
                }
            }
        }
    };

    let mut text = body;
    if !stmt.comments.is_empty() {
        text.push_str(&format!("{{# {} -#}}", stmt.comments.join("; ")));
    }
    // pad to the statement's original line span so template positions map
    // back to script lines
    let have = text.chars().filter(|c| *c == '\n').count() as u32 + 1;
    for _ in have..stmt.line_span {
        text.push('\n');
    }
    Ok(text)
}

/// Applies block open/middle/end validation for a reserved tag keyword.
/// Returns the tag to emit for end tags; `None` passes the statement
/// through unchanged.
fn track_blocks(word: &str, line: u32, stack: &mut Vec<Block>) -> Result<Option<String>, Exception> {
    if let Some((opener, end)) = BLOCK_PAIRS.iter().find(|(o, _)| *o == word) {
        stack.push(Block { opener: (*opener).to_owned(), line, close_emit: (*end).to_owned() });
        return Ok(None);
    }
    if let Some((_, allowed)) = MIDDLE_TAGS.iter().find(|(m, _)| *m == word) {
        match stack.last() {
            Some(top) if allowed.contains(&top.opener.as_str()) => return Ok(None),
            Some(top) => {
                return Err(Exception::syntax(
                    format!("`{word}` is not valid inside `{}`", top.opener),
                    line,
                    0,
                ));
            }
            None => return Err(Exception::syntax(format!("`{word}` outside of any block"), line, 0)),
        }
    }
    if let Some((opener, _)) = BLOCK_PAIRS.iter().find(|(_, e)| *e == word) {
        match stack.pop() {
            Some(top) if top.opener == *opener => return Ok(Some(top.close_emit)),
            Some(top) => {
                return Err(Exception::syntax(
                    format!("`{word}` does not close `{}` opened on line {}", top.opener, top.line),
                    line,
                    0,
                ));
            }
            None => return Err(Exception::syntax(format!("`{word}` without an open block"), line, 0)),
        }
    }
    Ok(None)
}

/// `var`/`set` statements, including the `= capture [:focus]` block form.
/// `rest` is the statement with the leading keyword (if any) stripped;
/// `keyword` is the tag to emit (`var` or `set`).
fn emit_assign_tag(rest: &str, keyword: &str, line: u32, stack: &mut Vec<Block>) -> Result<String, Exception> {
    let rest = rest.trim();
    let end_tag = format!("end{keyword}");
    let Some(eq) = find_top_level_eq(rest) else {
        // no `=`: template-level block form (`set x` ... `endset`), pass
        // through with stack tracking
        stack.push(Block { opener: keyword.to_owned(), line, close_emit: end_tag });
        return Ok(format!("{{%- {keyword} {rest} -%}}"));
    };
    let (targets, value) = rest.split_at(eq);
    let value = value[1..].trim();
    let targets = targets.trim();
    for target in targets.split(',') {
        if !ident_ok(target.trim()) {
            return Err(Exception::syntax(format!("invalid identifier list `{targets}`"), line, 0));
        }
    }
    if value == "capture" || value.starts_with("capture ") || value.starts_with("capture:") {
        let focus = value["capture".len()..].trim();
        let focus_part = if focus.is_empty() {
            String::new()
        } else {
            let Some(name) = focus.strip_prefix(':') else {
                return Err(Exception::syntax(format!("expected `:focus` after capture, found `{focus}`"), line, 0));
            };
            if !ident_ok(name.trim()) {
                return Err(Exception::syntax(format!("invalid focus name `{}`", name.trim()), line, 0));
            }
            format!(" :{}", name.trim())
        };
        stack.push(Block { opener: "capture".to_owned(), line, close_emit: end_tag });
        return Ok(format!("{{%- {keyword} {targets}{focus_part} -%}}"));
    }
    Ok(format!("{{%- {keyword} {targets} = {value} -%}}"))
}

/// `X = EXPR` with an identifier-list left side becomes `set`; a dotted or
/// subscripted left side becomes `set_path`. Returns `None` when the line is
/// not an assignment at all.
fn classify_assignment(code: &str, line: u32, stack: &mut Vec<Block>) -> Result<Option<String>, Exception> {
    let Some(eq) = find_top_level_eq(code) else {
        return Ok(None);
    };
    let (lhs, rhs) = code.split_at(eq);
    let lhs = lhs.trim();
    let rhs = rhs[1..].trim();
    if lhs.is_empty() || rhs.is_empty() {
        return Err(Exception::syntax("malformed assignment", line, 0));
    }
    let is_ident_list = lhs.split(',').all(|t| ident_ok(t.trim()));
    if is_ident_list {
        if rhs == "capture" || rhs.starts_with("capture ") || rhs.starts_with("capture:") {
            return emit_assign_tag(code, "set", line, stack).map(Some);
        }
        return Ok(Some(format!("{{%- set {lhs} = {rhs} -%}}")));
    }
    // dotted/subscripted single target: path assignment
    let root: String = lhs.chars().take_while(|c| c.is_alphanumeric() || *c == '_').collect();
    if ident_ok(&root) && !lhs.contains(',') && (lhs.contains('.') || lhs.contains('[')) {
        if rhs == "capture" || rhs.starts_with("capture ") {
            return Err(Exception::syntax("set_path does not support capture assignment", line, 0));
        }
        return Ok(Some(format!("{{%- set_path {lhs} = {rhs} -%}}")));
    }
    Ok(None)
}

/// Finds a top-level single `=` (not `==`, `!=`, `<=`, `>=`, `=>`, or a
/// compound assignment), outside brackets and strings.
fn find_top_level_eq(code: &str) -> Option<usize> {
    let bytes = code.as_bytes();
    let mut depth = 0;
    let mut in_str: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if let Some(q) = in_str {
            if b == b'\\' {
                i += 2;
                continue;
            }
            if b == q {
                in_str = None;
            }
            i += 1;
            continue;
        }
        match b {
            b'\'' | b'"' | b'`' => in_str = Some(b),
            b'(' | b'[' | b'{' => depth += 1,
            b')' | b']' | b'}' => depth -= 1,
            b'=' if depth == 0 => {
                let prev = i.checked_sub(1).map(|p| bytes[p]);
                let next = bytes.get(i + 1);
                let compound = matches!(prev, Some(b'=' | b'!' | b'<' | b'>' | b'+' | b'-' | b'*' | b'/' | b'&' | b'|' | b'%' | b'^'));
                if !compound && next != Some(&b'=') {
                    return Some(i);
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

/// One parsed segment of an `@`-command path.
enum CmdSeg {
    Key(String),
    Last,
    Expr(String),
}

/// Parses and emits an `@`-command line.
fn emit_command(code: &str, line: u32) -> Result<String, Exception> {
    let rest = &code[1..];
    let mut chars = rest.char_indices().peekable();

    let handler: String = {
        let mut h = String::new();
        while let Some(&(_, c)) = chars.peek() {
            if c.is_alphanumeric() || c == '_' {
                h.push(c);
                chars.next();
            } else {
                break;
            }
        }
        h
    };

    let mut segs: Vec<CmdSeg> = Vec::new();
    loop {
        match chars.peek().copied() {
            Some((_, '.')) => {
                chars.next();
                let mut name = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' {
                        name.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if name.is_empty() {
                    return Err(Exception::syntax("invalid command path", line, 0));
                }
                segs.push(CmdSeg::Key(name));
            }
            Some((idx, '[')) => {
                chars.next();
                let inner_start = idx + 1;
                let mut depth = 1;
                let mut inner_end = None;
                for (j, c) in chars.by_ref() {
                    match c {
                        '[' => depth += 1,
                        ']' => {
                            depth -= 1;
                            if depth == 0 {
                                inner_end = Some(j);
                                break;
                            }
                        }
                        _ => {}
                    }
                }
                let Some(end) = inner_end else {
                    return Err(Exception::syntax("unbalanced `[` in command path", line, 0));
                };
                let inner = rest[inner_start..end].trim();
                if inner.is_empty() {
                    segs.push(CmdSeg::Last);
                } else {
                    segs.push(CmdSeg::Expr(inner.to_owned()));
                }
            }
            _ => break,
        }
    }

    let tail: String = {
        let from = chars.peek().map_or(rest.len(), |&(idx, _)| idx);
        rest[from..].trim().to_owned()
    };

    // call form: `(args)` with nothing after the closing paren
    if tail.starts_with('(') {
        if !tail.ends_with(')') {
            return Err(Exception::syntax("malformed command call", line, 0));
        }
        let args = tail[1..tail.len() - 1].trim().to_owned();
        let method = match segs.pop() {
            Some(CmdSeg::Key(name)) => name,
            Some(_) => return Err(Exception::syntax("invalid command path", line, 0)),
            None => String::new(),
        };
        if handler.is_empty() {
            // `@._revert()` reverts every handler via the `_` pseudo-handler
            if method != "_revert" || !segs.is_empty() || !args.is_empty() {
                return Err(Exception::syntax("invalid command path", line, 0));
            }
            return Ok("{%- output_command _._revert([]) -%}".to_owned());
        }
        if method == "_revert" && !segs.is_empty() {
            return Err(Exception::syntax("_revert is only permitted on the handler root", line, 0));
        }
        if handler == "text" && method.is_empty() && segs.is_empty() {
            return Ok(format!("{{{{- {args} -}}}}"));
        }
        let path = render_path(&segs);
        let target = if method.is_empty() { handler } else { format!("{handler}.{method}") };
        return Ok(if args.is_empty() {
            format!("{{%- output_command {target}({path}) -%}}")
        } else {
            format!("{{%- output_command {target}({path}, {args}) -%}}")
        });
    }

    // operator form
    if handler.is_empty() {
        return Err(Exception::syntax("invalid command path", line, 0));
    }
    if tail.starts_with("==") {
        return Err(Exception::syntax("unknown command operator `==`", line, 0));
    }
    let Some((op, method)) = COMMAND_OPS.iter().find(|(op, _)| tail.starts_with(op)) else {
        if tail.is_empty() {
            return Err(Exception::syntax("command is missing a call or operator", line, 0));
        }
        return Err(Exception::syntax(format!("unknown command operator `{tail}`"), line, 0));
    };
    let value = tail[op.len()..].trim();
    let path = render_path(&segs);
    if *op == "++" || *op == "--" {
        if !value.is_empty() {
            return Err(Exception::syntax(format!("`{op}` takes no value"), line, 0));
        }
        return Ok(format!("{{%- output_command {handler}.{method}({path}) -%}}"));
    }
    if value.is_empty() {
        return Err(Exception::syntax(format!("`{op}` requires a value"), line, 0));
    }
    Ok(format!("{{%- output_command {handler}.{method}({path}, {value}) -%}}"))
}

fn render_path(segs: &[CmdSeg]) -> String {
    let parts: Vec<String> = segs
        .iter()
        .map(|seg| match seg {
            CmdSeg::Key(name) => format!("\"{name}\""),
            CmdSeg::Last => "[]".to_owned(),
            CmdSeg::Expr(text) => text.clone(),
        })
        .collect();
    format!("[{}]", parts.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(src: &str) -> String {
        transpile(src).unwrap()
    }

    #[test]
    fn print_becomes_output_tag() {
        assert_eq!(t("print user.name"), "{{- user.name -}}");
    }

    #[test]
    fn var_and_set_single_line() {
        assert_eq!(t("var x = 1"), "{%- var x = 1 -%}");
        assert_eq!(t("x = 1"), "{%- set x = 1 -%}");
        assert_eq!(t("x, y = pair()"), "{%- set x, y = pair() -%}");
        assert_eq!(t("extern ctx"), "{%- extern ctx -%}");
    }

    #[test]
    fn bare_code_becomes_do() {
        assert_eq!(t("s.push(1)"), "{%- do s.push(1) -%}");
    }

    #[test]
    fn focus_directive() {
        assert_eq!(t(":data"), "{%- option focus=\"data\" -%}");
    }

    #[test]
    fn capture_assignment_opens_block() {
        let out = t("var u = capture :data\n@data.name = user.name\nendcapture");
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "{%- var u :data -%}");
        assert_eq!(lines[1], "{%- output_command data.set([\"name\"], user.name) -%}");
        assert_eq!(lines[2], "{%- endvar -%}");
    }

    #[test]
    fn command_operator_forms() {
        assert_eq!(t("@data.count += 2"), "{%- output_command data.add([\"count\"], 2) -%}");
        assert_eq!(t("@data.count++"), "{%- output_command data.increment([\"count\"]) -%}");
        assert_eq!(t("@data = payload"), "{%- output_command data.set([], payload) -%}");
        assert_eq!(
            t("@data.items[].flag ||= true"),
            "{%- output_command data.or([\"items\", [], \"flag\"], true) -%}"
        );
    }

    #[test]
    fn command_call_forms() {
        assert_eq!(
            t("@data.result.users.set(u)"),
            "{%- output_command data.set([\"result\", \"users\"], u) -%}"
        );
        assert_eq!(t("@text(name)"), "{{- name -}}");
        assert_eq!(t("@logger(\"msg\")"), "{%- output_command logger([], \"msg\") -%}");
        assert_eq!(t("@turtle.pen.down()"), "{%- output_command turtle.down([\"pen\"]) -%}");
    }

    #[test]
    fn revert_shorthands() {
        assert_eq!(t("revert"), "{%- output_command _._revert([]) -%}");
        assert_eq!(t("@._revert()"), "{%- output_command _._revert([]) -%}");
        assert_eq!(t("@text._revert()"), "{%- output_command text._revert([]) -%}");
        let err = transpile("@data.sub._revert()").unwrap_err();
        assert!(err.message.contains("handler root"));
    }

    #[test]
    fn continuation_by_bracket_and_operator() {
        let out = t("var x = foo(\n  1, 2)\nvar y = 1 +\n  2");
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "{%- var x = foo(");
        assert_eq!(lines[1], "  1, 2) -%}");
        assert_eq!(lines[2], "{%- var y = 1 +");
        assert_eq!(lines[3], "  2 -%}");
    }

    #[test]
    fn leading_operator_continues_previous() {
        let out = t("var x = 1\n  + 2");
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "{%- var x = 1");
        assert_eq!(lines[1], "  + 2 -%}");
    }

    #[test]
    fn comments_attach_after_tag() {
        assert_eq!(t("x = 1 // note"), "{%- set x = 1 -%}{# note -#}");
        assert_eq!(t("x = 1 // a\n"), "{%- set x = 1 -%}{# a -#}");
    }

    #[test]
    fn block_mismatch_is_rejected() {
        let err = transpile("if a\nendfor").unwrap_err();
        assert!(err.message.contains("does not close"));
        let err = transpile("for x in xs\nprint x").unwrap_err();
        assert!(err.message.contains("unclosed"));
        let err = transpile("if a\nelse\nendif\nelse").unwrap_err();
        assert!(err.message.contains("outside"));
    }

    #[test]
    fn semicolons_are_rejected() {
        let err = transpile("x = 1; y = 2").unwrap_err();
        assert!(err.message.contains("semicolon"));
    }

    #[test]
    fn reserved_tags_reset_continuation() {
        // `endif` is not glued onto the preceding statement
        let out = t("if a\nprint 1\nendif");
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "{%- if a -%}");
        assert_eq!(lines[1], "{{- 1 -}}");
        assert_eq!(lines[2], "{%- endif -%}");
    }

    #[test]
    fn line_numbers_are_stable() {
        let src = "var a = 1\n\n// standalone\nvar b = foo(\n  2)\nprint a";
        let out = t(src);
        assert_eq!(out.lines().count(), src.lines().count());
        assert_eq!(out.lines().nth(5).unwrap(), "{{- a -}}");
    }
}
