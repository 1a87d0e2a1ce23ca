//! Template-source scanning and tag tokenization.
//!
//! Scanning happens in two layers. The segment scanner splits the source into
//! literal text and `{% %}` / `{{ }}` / `{# #}` tags, applying whitespace
//! control (`{%-`, `-%}`) and extracting `raw`/`verbatim` bodies verbatim.
//! The token lexer then turns a single tag's content into expression tokens
//! with positions for error reporting.

use crate::error::{CodeLoc, Exception};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TagKind {
    /// `{% ... %}`
    Stmt,
    /// `{{ ... }}`
    Output,
}

#[derive(Debug, Clone)]
pub(crate) enum Segment {
    /// Literal template text.
    Text(String, CodeLoc),
    /// A tag's inner content, delimiters stripped.
    Tag {
        kind: TagKind,
        content: String,
        loc: CodeLoc,
    },
}

/// Tracks line/column while walking raw source bytes.
struct Cursor<'a> {
    src: &'a str,
    pos: usize,
    line: u32,
    column: u32,
}

impl<'a> Cursor<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, pos: 0, line: 1, column: 1 }
    }

    fn loc(&self) -> CodeLoc {
        CodeLoc::new(self.line, self.column)
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn starts_with(&self, pat: &str) -> bool {
        self.rest().starts_with(pat)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.rest().chars().next()?;
        self.pos += c.len_utf8();
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn bump_str(&mut self, pat: &str) {
        for _ in pat.chars() {
            self.bump();
        }
    }
}

/// Splits template source into text and tag segments.
///
/// Comment tags are consumed here and never reach the parser. Unterminated
/// tags are syntax errors carrying the opening delimiter's position.
pub(crate) fn scan(source: &str) -> Result<Vec<Segment>, Exception> {
    let mut cur = Cursor::new(source);
    let mut segments = Vec::new();
    let mut text = String::new();
    let mut text_loc = cur.loc();

    while !cur.rest().is_empty() {
        if cur.starts_with("{%") || cur.starts_with("{{") || cur.starts_with("{#") {
            let open: String = cur.rest().chars().take(2).collect();
            let tag_loc = cur.loc();
            cur.bump_str(&open);
            let trim_before = cur.starts_with("-");
            if trim_before {
                cur.bump();
            }
            if trim_before {
                truncate_trailing_ws(&mut text);
            }
            if !text.is_empty() {
                segments.push(Segment::Text(std::mem::take(&mut text), text_loc));
            } else {
                text.clear();
            }

            let close = match open.as_str() {
                "{%" => "%}",
                "{{" => "}}",
                _ => "#}",
            };
            // comments hold prose, not code; quote characters in them must
            // not swallow the closing delimiter
            let track_strings = open != "{#";
            let (content, trim_after) = read_tag_body(&mut cur, close, tag_loc, track_strings)?;
            if trim_after {
                skip_leading_ws(&mut cur);
            }

            if open == "{#" {
                // comments are dropped at scan time
            } else {
                let kind = if open == "{%" { TagKind::Stmt } else { TagKind::Output };
                let content = content.trim().to_owned();
                if kind == TagKind::Stmt {
                    let word = first_word(&content);
                    if word == "raw" || word == "verbatim" {
                        let end = format!("end{word}");
                        let raw = read_raw_block(&mut cur, &end, tag_loc)?;
                        segments.push(Segment::Text(raw, tag_loc));
                        text_loc = cur.loc();
                        continue;
                    }
                }
                segments.push(Segment::Tag { kind, content, loc: tag_loc });
            }
            text_loc = cur.loc();
        } else {
            if text.is_empty() {
                text_loc = cur.loc();
            }
            let c = cur.bump().expect("rest is non-empty");
            text.push(c);
        }
    }
    if !text.is_empty() {
        segments.push(Segment::Text(text, text_loc));
    }
    Ok(segments)
}

/// Reads up to the closing delimiter, honoring quoted strings (when
/// `track_strings` is set) so `%}` inside a string literal does not end the
/// tag. Returns the body and whether the closer carried a `-` trim marker.
fn read_tag_body(
    cur: &mut Cursor<'_>,
    close: &str,
    open_loc: CodeLoc,
    track_strings: bool,
) -> Result<(String, bool), Exception> {
    let mut body = String::new();
    loop {
        if cur.rest().is_empty() {
            return Err(Exception::syntax("unterminated tag", open_loc.line, open_loc.column));
        }
        let trimmed_close = format!("-{close}");
        if cur.starts_with(&trimmed_close) {
            cur.bump_str(&trimmed_close);
            return Ok((body, true));
        }
        if cur.starts_with(close) {
            cur.bump_str(close);
            return Ok((body, false));
        }
        let c = cur.bump().expect("rest is non-empty");
        body.push(c);
        if track_strings && (c == '\'' || c == '"' || c == '`') {
            read_string_into(cur, c, &mut body, open_loc)?;
        }
    }
}

/// Copies a quoted string (after its opening quote) into `body`, including
/// the closing quote, preserving escapes verbatim.
fn read_string_into(cur: &mut Cursor<'_>, quote: char, body: &mut String, open_loc: CodeLoc) -> Result<(), Exception> {
    loop {
        let Some(c) = cur.bump() else {
            return Err(Exception::syntax("unterminated string literal", open_loc.line, open_loc.column));
        };
        body.push(c);
        if c == '\\' {
            if let Some(next) = cur.bump() {
                body.push(next);
            }
        } else if c == quote {
            return Ok(());
        }
    }
}

/// Consumes text up to `{% endraw %}` (or `endverbatim`), returning it
/// unprocessed.
fn read_raw_block(cur: &mut Cursor<'_>, end_tag: &str, open_loc: CodeLoc) -> Result<String, Exception> {
    let mut raw = String::new();
    loop {
        if cur.rest().is_empty() {
            return Err(Exception::syntax(
                format!("missing {{% {end_tag} %}} for raw block"),
                open_loc.line,
                open_loc.column,
            ));
        }
        if cur.starts_with("{%") {
            let save = (cur.pos, cur.line, cur.column);
            cur.bump_str("{%");
            if cur.starts_with("-") {
                cur.bump();
            }
            let mut inner = String::new();
            while !cur.rest().is_empty() && !cur.starts_with("%}") && !cur.starts_with("-%}") {
                inner.push(cur.bump().expect("rest is non-empty"));
            }
            if cur.starts_with("-%}") {
                cur.bump_str("-%}");
            } else if cur.starts_with("%}") {
                cur.bump_str("%}");
            }
            if inner.trim() == end_tag {
                return Ok(raw);
            }
            (cur.pos, cur.line, cur.column) = save;
            raw.push(cur.bump().expect("rest is non-empty"));
        } else {
            raw.push(cur.bump().expect("rest is non-empty"));
        }
    }
}

fn truncate_trailing_ws(text: &mut String) {
    let trimmed = text.trim_end().len();
    text.truncate(trimmed);
}

fn skip_leading_ws(cur: &mut Cursor<'_>) {
    while cur.rest().starts_with(|c: char| c.is_whitespace()) {
        cur.bump();
    }
}

fn first_word(content: &str) -> &str {
    content.split_whitespace().next().unwrap_or("")
}

// --- expression token lexer ---

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Tok {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    /// One of the fixed operator/punctuation spellings.
    Op(&'static str),
}

#[derive(Debug, Clone)]
pub(crate) struct Token {
    pub tok: Tok,
    pub loc: CodeLoc,
}

/// Multi-character operators, longest first so prefixes do not shadow them.
const OPERATORS: &[&str] = &[
    "===", "!==", "**", "//", "==", "!=", "<=", ">=", "&&", "||", "+", "-", "*", "/", "%", "~", "<", ">", "(", ")",
    "[", "]", "{", "}", ",", ":", ".", "|", "=", "!", "?",
];

/// Tokenizes one tag's content. `start` is the position of the tag opener so
/// token positions line up with the enclosing template.
pub(crate) fn tokenize(content: &str, start: CodeLoc) -> Result<Vec<Token>, Exception> {
    let mut tokens = Vec::new();
    let mut line = start.line;
    // +2 skips the `{%`/`{{` delimiter so columns point into the source
    let mut column = start.column + 2;
    let mut chars = content.char_indices().peekable();

    while let Some(&(idx, c)) = chars.peek() {
        let loc = CodeLoc::new(line, column);
        if c == '\n' {
            chars.next();
            line += 1;
            column = 1;
            continue;
        }
        if c.is_whitespace() {
            chars.next();
            column += 1;
            continue;
        }
        if c == '\'' || c == '"' || c == '`' {
            chars.next();
            column += 1;
            let mut s = String::new();
            let mut closed = false;
            while let Some((_, sc)) = chars.next() {
                column += 1;
                if sc == '\n' {
                    line += 1;
                    column = 1;
                }
                if sc == '\\' {
                    if let Some((_, esc)) = chars.next() {
                        column += 1;
                        s.push(unescape(esc));
                    }
                } else if sc == c {
                    closed = true;
                    break;
                } else {
                    s.push(sc);
                }
            }
            if !closed {
                return Err(Exception::syntax("unterminated string literal", loc.line, loc.column));
            }
            tokens.push(Token { tok: Tok::Str(s), loc });
            continue;
        }
        if c.is_ascii_digit() {
            let rest = &content[idx..];
            let end = rest
                .char_indices()
                .find(|(_, d)| !(d.is_ascii_digit() || *d == '.' || *d == '_'))
                .map_or(rest.len(), |(i, _)| i);
            let mut num = &rest[..end];
            // `1.` followed by an attr (`1.abs`) is not supported; a single
            // dot participates in the number only when digits follow it
            if num.ends_with('.') {
                num = &num[..num.len() - 1];
            }
            let cleaned: String = num.chars().filter(|d| *d != '_').collect();
            let tok = if cleaned.contains('.') {
                Tok::Float(
                    cleaned
                        .parse()
                        .map_err(|_| Exception::syntax(format!("invalid number literal `{num}`"), loc.line, loc.column))?,
                )
            } else {
                Tok::Int(
                    cleaned
                        .parse()
                        .map_err(|_| Exception::syntax(format!("invalid number literal `{num}`"), loc.line, loc.column))?,
                )
            };
            for _ in num.chars() {
                chars.next();
                column += 1;
            }
            tokens.push(Token { tok, loc });
            continue;
        }
        if c.is_alphabetic() || c == '_' || c == '$' || c == '@' {
            let rest = &content[idx..];
            let end = rest
                .char_indices()
                .find(|(_, d)| !(d.is_alphanumeric() || *d == '_' || *d == '$' || *d == '@'))
                .map_or(rest.len(), |(i, _)| i);
            let ident = &rest[..end];
            for _ in ident.chars() {
                chars.next();
                column += 1;
            }
            tokens.push(Token { tok: Tok::Ident(ident.to_owned()), loc });
            continue;
        }
        let rest = &content[idx..];
        let Some(op) = OPERATORS.iter().find(|op| rest.starts_with(**op)) else {
            return Err(Exception::syntax(format!("unexpected character `{c}`"), loc.line, loc.column));
        };
        for _ in op.chars() {
            chars.next();
            column += 1;
        }
        tokens.push(Token { tok: Tok::Op(op), loc });
    }
    Ok(tokens)
}

fn unescape(c: char) -> char {
    match c {
        'n' => '\n',
        't' => '\t',
        'r' => '\r',
        '0' => '\0',
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag_contents(src: &str) -> Vec<String> {
        scan(src)
            .unwrap()
            .into_iter()
            .filter_map(|s| match s {
                Segment::Tag { content, .. } => Some(content),
                Segment::Text(..) => None,
            })
            .collect()
    }

    #[test]
    fn splits_text_and_tags() {
        let segs = scan("a{{ x }}b{% if y %}c{% endif %}").unwrap();
        assert_eq!(segs.len(), 6);
        assert!(matches!(&segs[0], Segment::Text(t, _) if t == "a"));
        assert!(matches!(&segs[1], Segment::Tag { kind: TagKind::Output, content, .. } if content == "x"));
        assert!(matches!(&segs[3], Segment::Tag { kind: TagKind::Stmt, content, .. } if content == "if y"));
    }

    #[test]
    fn whitespace_control_trims_both_sides() {
        let segs = scan("a  {%- if y -%}  b{% endif %}").unwrap();
        assert!(matches!(&segs[0], Segment::Text(t, _) if t == "a"));
        assert!(matches!(&segs[2], Segment::Text(t, _) if t == "b"));
    }

    #[test]
    fn comments_are_dropped() {
        let segs = scan("a{# note #}b").unwrap();
        assert_eq!(segs.len(), 2);
    }

    #[test]
    fn raw_blocks_pass_through() {
        let segs = scan("{% raw %}{{ not a tag }}{% endraw %}!").unwrap();
        assert!(matches!(&segs[0], Segment::Text(t, _) if t == "{{ not a tag }}"));
        assert!(matches!(&segs[1], Segment::Text(t, _) if t == "!"));
    }

    #[test]
    fn close_delim_inside_string_is_ignored() {
        assert_eq!(tag_contents(r#"{{ "%}" }}"#), [r#""%}""#]);
    }

    #[test]
    fn tokenizes_expressions_with_positions() {
        let toks = tokenize("a.b!(1, 'x') // 2", CodeLoc::new(3, 1)).unwrap();
        let spellings: Vec<String> = toks
            .iter()
            .map(|t| match &t.tok {
                Tok::Ident(s) => s.clone(),
                Tok::Int(i) => i.to_string(),
                Tok::Float(f) => f.to_string(),
                Tok::Str(s) => format!("'{s}'"),
                Tok::Op(o) => (*o).to_owned(),
            })
            .collect();
        assert_eq!(spellings, ["a", ".", "b", "!", "(", "1", ",", "'x'", ")", "//", "2"]);
        assert_eq!(toks[0].loc.line, 3);
    }

    #[test]
    fn unterminated_tag_errors() {
        let err = scan("x{{ y").unwrap_err();
        assert!(err.message.contains("unterminated"));
    }
}
