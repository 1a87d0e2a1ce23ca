//! Line tokenizer for the script surface.
//!
//! Each physical line is tokenized independently against a sticky state that
//! survives across lines: an open `/* */` comment or an open backtick
//! template string continues on the next line. The tokenizer distinguishes
//! code, string literals, regex literals, and comments; the transpiler's
//! continuation and classification rules operate on the resulting tokens.

use crate::error::Exception;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TokKind {
    /// Plain code text (identifiers, operators, brackets, whitespace).
    Code,
    /// A complete string literal, quotes included.
    Str,
    /// A regex literal, slashes and flags included.
    Regex,
    /// A `//` or `/* */` comment, markers stripped.
    Comment,
}

#[derive(Debug, Clone)]
pub(crate) struct ScriptTok {
    pub kind: TokKind,
    pub text: String,
}

impl ScriptTok {
    fn new(kind: TokKind, text: impl Into<String>) -> Self {
        Self { kind, text: text.into() }
    }
}

/// Sticky tokenizer state carried from one line to the next.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct LexState {
    /// Inside a `/* */` comment that has not closed yet.
    pub in_block_comment: bool,
    /// Inside a backtick template string that has not closed yet.
    pub in_template_str: bool,
}

/// Tokenizes one line under the sticky `state`, updating it for the next
/// line.
pub(crate) fn lex_line(line: &str, line_no: u32, state: &mut LexState) -> Result<Vec<ScriptTok>, Exception> {
    let mut tokens = Vec::new();
    let mut chars = line.char_indices().peekable();
    let mut code = String::new();

    if state.in_block_comment {
        let mut comment = String::new();
        let mut closed = false;
        while let Some((_, c)) = chars.next() {
            if c == '*' && matches!(chars.peek(), Some((_, '/'))) {
                chars.next();
                closed = true;
                break;
            }
            comment.push(c);
        }
        tokens.push(ScriptTok::new(TokKind::Comment, comment.trim().to_owned()));
        if !closed {
            return Ok(tokens);
        }
        state.in_block_comment = false;
    } else if state.in_template_str {
        let mut s = String::new();
        let mut closed = false;
        while let Some((_, c)) = chars.next() {
            s.push(c);
            if c == '\\' {
                if let Some((_, esc)) = chars.next() {
                    s.push(esc);
                }
            } else if c == '`' {
                closed = true;
                break;
            }
        }
        // re-attach the newline the line split swallowed
        tokens.push(ScriptTok::new(TokKind::Str, format!("\n{s}")));
        if !closed {
            state.in_template_str = true;
            return Ok(tokens);
        }
        state.in_template_str = false;
    }

    while let Some((_, c)) = chars.next() {
        match c {
            '\'' | '"' => {
                flush_code(&mut tokens, &mut code);
                let mut s = String::new();
                s.push(c);
                let mut closed = false;
                while let Some((_, sc)) = chars.next() {
                    s.push(sc);
                    if sc == '\\' {
                        if let Some((_, esc)) = chars.next() {
                            s.push(esc);
                        }
                    } else if sc == c {
                        closed = true;
                        break;
                    }
                }
                if !closed {
                    return Err(Exception::syntax("unterminated string literal", line_no, 0));
                }
                tokens.push(ScriptTok::new(TokKind::Str, s));
            }
            '`' => {
                flush_code(&mut tokens, &mut code);
                let mut s = String::from('`');
                let mut closed = false;
                while let Some((_, sc)) = chars.next() {
                    s.push(sc);
                    if sc == '\\' {
                        if let Some((_, esc)) = chars.next() {
                            s.push(esc);
                        }
                    } else if sc == '`' {
                        closed = true;
                        break;
                    }
                }
                tokens.push(ScriptTok::new(TokKind::Str, s));
                if !closed {
                    state.in_template_str = true;
                    return Ok(tokens);
                }
            }
            '/' => match chars.peek() {
                Some((_, '/')) => {
                    chars.next();
                    let comment: String = chars.by_ref().map(|(_, cc)| cc).collect();
                    flush_code(&mut tokens, &mut code);
                    tokens.push(ScriptTok::new(TokKind::Comment, comment.trim().to_owned()));
                }
                Some((_, '*')) => {
                    chars.next();
                    flush_code(&mut tokens, &mut code);
                    let mut comment = String::new();
                    let mut closed = false;
                    while let Some((_, cc)) = chars.next() {
                        if cc == '*' && matches!(chars.peek(), Some((_, '/'))) {
                            chars.next();
                            closed = true;
                            break;
                        }
                        comment.push(cc);
                    }
                    tokens.push(ScriptTok::new(TokKind::Comment, comment.trim().to_owned()));
                    if !closed {
                        state.in_block_comment = true;
                        return Ok(tokens);
                    }
                }
                _ if regex_can_start(&tokens, &code) => {
                    let mut r = String::from('/');
                    let mut closed = false;
                    let mut in_class = false;
                    while let Some((_, rc)) = chars.next() {
                        r.push(rc);
                        match rc {
                            '\\' => {
                                if let Some((_, esc)) = chars.next() {
                                    r.push(esc);
                                }
                            }
                            '[' => in_class = true,
                            ']' => in_class = false,
                            '/' if !in_class => {
                                closed = true;
                                break;
                            }
                            _ => {}
                        }
                    }
                    if !closed {
                        return Err(Exception::syntax("unterminated regex literal", line_no, 0));
                    }
                    while let Some(&(_, fc)) = chars.peek() {
                        if fc.is_ascii_alphabetic() {
                            r.push(fc);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    flush_code(&mut tokens, &mut code);
                    tokens.push(ScriptTok::new(TokKind::Regex, r));
                }
                _ => code.push('/'),
            },
            _ => code.push(c),
        }
    }
    flush_code(&mut tokens, &mut code);
    Ok(tokens)
}

fn flush_code(tokens: &mut Vec<ScriptTok>, code: &mut String) {
    if !code.is_empty() {
        tokens.push(ScriptTok::new(TokKind::Code, std::mem::take(code)));
    }
}

/// A `/` starts a regex when the preceding significant character cannot end
/// an expression (operator, opening bracket, comma, keyword boundary, or
/// start of line); otherwise it is division.
fn regex_can_start(tokens: &[ScriptTok], pending_code: &str) -> bool {
    let before = if pending_code.trim_end().is_empty() {
        tokens
            .iter()
            .rev()
            .find(|t| t.kind != TokKind::Comment)
            .map(|t| match t.kind {
                TokKind::Code => t.text.trim_end().to_owned(),
                _ => "x".to_owned(), // literals end an expression
            })
            .unwrap_or_default()
    } else {
        pending_code.trim_end().to_owned()
    };
    let Some(last) = before.chars().last() else {
        return true;
    };
    if "=([{,;:!?&|+-*%^<>~".contains(last) {
        return true;
    }
    // `return /re/`, `in /re/` and similar keyword positions
    let word: String = before.chars().rev().take_while(|c| c.is_alphanumeric() || *c == '_').collect();
    let word: String = word.chars().rev().collect();
    matches!(word.as_str(), "return" | "in" | "not" | "and" | "or" | "is" | "if" | "elif" | "while" | "case" | "do")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(line: &str) -> Vec<ScriptTok> {
        let mut state = LexState::default();
        lex_line(line, 1, &mut state).unwrap()
    }

    #[test]
    fn splits_code_and_strings() {
        let toks = lex(r#"var x = "a // b" + 'c'"#);
        let kinds: Vec<TokKind> = toks.iter().map(|t| t.kind).collect();
        assert_eq!(kinds, [TokKind::Code, TokKind::Str, TokKind::Code, TokKind::Str]);
        assert_eq!(toks[1].text, r#""a // b""#);
    }

    #[test]
    fn line_comment_reaches_end_of_line() {
        let toks = lex("x = 1 // trailing note");
        assert_eq!(toks.last().unwrap().kind, TokKind::Comment);
        assert_eq!(toks.last().unwrap().text, "trailing note");
    }

    #[test]
    fn block_comment_sticks_across_lines() {
        let mut state = LexState::default();
        let first = lex_line("x = 1 /* begins", 1, &mut state).unwrap();
        assert!(state.in_block_comment);
        assert_eq!(first.last().unwrap().kind, TokKind::Comment);
        let second = lex_line("still comment */ + 2", 2, &mut state).unwrap();
        assert!(!state.in_block_comment);
        assert_eq!(second[0].kind, TokKind::Comment);
        assert_eq!(second[1].text.trim(), "+ 2");
    }

    #[test]
    fn regex_after_operator_not_after_value() {
        let toks = lex("x = /ab+c/gi");
        assert!(toks.iter().any(|t| t.kind == TokKind::Regex && t.text == "/ab+c/gi"));
        let toks = lex("x = a / b / c");
        assert!(toks.iter().all(|t| t.kind != TokKind::Regex));
    }

    #[test]
    fn template_string_sticks_across_lines() {
        let mut state = LexState::default();
        lex_line("var x = `first", 1, &mut state).unwrap();
        assert!(state.in_template_str);
        let second = lex_line("second`", 2, &mut state).unwrap();
        assert!(!state.in_template_str);
        assert_eq!(second[0].kind, TokKind::Str);
    }
}
