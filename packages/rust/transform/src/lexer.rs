//! Tokenizer for transform expressions.

/// A lexical token.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    // Punctuation
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Colon,
    Dot,
    Ellipsis,
    Question,
    QuestionDot,
    Arrow,
    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    EqEq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    AndAnd,
    OrOr,
    Nullish,
}

impl Token {
    /// Human-readable form used in error messages.
    pub fn describe(&self) -> String {
        match self {
            Token::Ident(name) => format!("identifier '{name}'"),
            Token::Number(n) => format!("number {n}"),
            Token::Str(s) => format!("string {s:?}"),
            other => format!("'{}'", other.symbol()),
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            Token::LParen => "(",
            Token::RParen => ")",
            Token::LBrace => "{",
            Token::RBrace => "}",
            Token::LBracket => "[",
            Token::RBracket => "]",
            Token::Comma => ",",
            Token::Colon => ":",
            Token::Dot => ".",
            Token::Ellipsis => "...",
            Token::Question => "?",
            Token::QuestionDot => "?.",
            Token::Arrow => "=>",
            Token::Plus => "+",
            Token::Minus => "-",
            Token::Star => "*",
            Token::Slash => "/",
            Token::Percent => "%",
            Token::Bang => "!",
            Token::EqEq => "==",
            Token::NotEq => "!=",
            Token::Lt => "<",
            Token::LtEq => "<=",
            Token::Gt => ">",
            Token::GtEq => ">=",
            Token::AndAnd => "&&",
            Token::OrOr => "||",
            Token::Nullish => "??",
            Token::Ident(_) | Token::Number(_) | Token::Str(_) => "",
        }
    }
}

/// A token with the byte offset it starts at.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub offset: usize,
}

/// Split `source` into tokens.
pub fn tokenize(source: &str) -> Result<Vec<Spanned>, String> {
    let chars: Vec<(usize, char)> = source.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (offset, c) = chars[i];

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        // Line and block comments.
        if c == '/' && next_is(&chars, i, '/') {
            while i < chars.len() && chars[i].1 != '\n' {
                i += 1;
            }
            continue;
        }
        if c == '/' && next_is(&chars, i, '*') {
            i += 2;
            loop {
                if i + 1 >= chars.len() {
                    return Err(format!("unterminated comment at offset {offset}"));
                }
                if chars[i].1 == '*' && chars[i + 1].1 == '/' {
                    i += 2;
                    break;
                }
                i += 1;
            }
            continue;
        }

        if c.is_ascii_alphabetic() || c == '_' || c == '$' {
            let start = i;
            while i < chars.len() && (chars[i].1.is_ascii_alphanumeric() || matches!(chars[i].1, '_' | '$')) {
                i += 1;
            }
            let ident: String = chars[start..i].iter().map(|(_, c)| c).collect();
            tokens.push(Spanned { token: Token::Ident(ident), offset });
            continue;
        }

        if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(|(_, d)| d.is_ascii_digit())) {
            let start = i;
            while i < chars.len() && (chars[i].1.is_ascii_digit() || chars[i].1 == '.') {
                i += 1;
            }
            let text: String = chars[start..i].iter().map(|(_, c)| c).collect();
            let n = text
                .parse::<f64>()
                .map_err(|_| format!("invalid number '{text}' at offset {offset}"))?;
            tokens.push(Spanned { token: Token::Number(n), offset });
            continue;
        }

        if c == '"' || c == '\'' {
            let (s, next) = read_string(&chars, i, c)?;
            tokens.push(Spanned { token: Token::Str(s), offset });
            i = next;
            continue;
        }

        let (token, width) = match c {
            '(' => (Token::LParen, 1),
            ')' => (Token::RParen, 1),
            '{' => (Token::LBrace, 1),
            '}' => (Token::RBrace, 1),
            '[' => (Token::LBracket, 1),
            ']' => (Token::RBracket, 1),
            ',' => (Token::Comma, 1),
            ':' => (Token::Colon, 1),
            ';' => {
                // A trailing semicolon after the expression is tolerated.
                i += 1;
                continue;
            }
            '.' if next_is(&chars, i, '.') && chars.get(i + 2).is_some_and(|(_, c)| *c == '.') => {
                (Token::Ellipsis, 3)
            }
            '.' => (Token::Dot, 1),
            '?' if next_is(&chars, i, '?') => (Token::Nullish, 2),
            // `a?.5:1` is a ternary, not optional chaining.
            '?' if next_is(&chars, i, '.')
                && !chars.get(i + 2).is_some_and(|(_, c)| c.is_ascii_digit()) =>
            {
                (Token::QuestionDot, 2)
            }
            '?' => (Token::Question, 1),
            '=' if next_is(&chars, i, '>') => (Token::Arrow, 2),
            '=' if next_is(&chars, i, '=') => {
                let width = if chars.get(i + 2).is_some_and(|(_, c)| *c == '=') { 3 } else { 2 };
                (Token::EqEq, width)
            }
            '!' if next_is(&chars, i, '=') => {
                let width = if chars.get(i + 2).is_some_and(|(_, c)| *c == '=') { 3 } else { 2 };
                (Token::NotEq, width)
            }
            '!' => (Token::Bang, 1),
            '<' if next_is(&chars, i, '=') => (Token::LtEq, 2),
            '<' => (Token::Lt, 1),
            '>' if next_is(&chars, i, '=') => (Token::GtEq, 2),
            '>' => (Token::Gt, 1),
            '&' if next_is(&chars, i, '&') => (Token::AndAnd, 2),
            '|' if next_is(&chars, i, '|') => (Token::OrOr, 2),
            '+' => (Token::Plus, 1),
            '-' => (Token::Minus, 1),
            '*' => (Token::Star, 1),
            '/' => (Token::Slash, 1),
            '%' => (Token::Percent, 1),
            other => return Err(format!("unexpected character '{other}' at offset {offset}")),
        };
        tokens.push(Spanned { token, offset });
        i += width;
    }

    Ok(tokens)
}

fn next_is(chars: &[(usize, char)], i: usize, expected: char) -> bool {
    chars.get(i + 1).is_some_and(|(_, c)| *c == expected)
}

/// Read a quoted string starting at `chars[start]`; returns it and the index after the closing quote.
fn read_string(chars: &[(usize, char)], start: usize, quote: char) -> Result<(String, usize), String> {
    let offset = chars[start].0;
    let mut out = String::new();
    let mut i = start + 1;

    while i < chars.len() {
        let c = chars[i].1;
        if c == quote {
            return Ok((out, i + 1));
        }
        if c == '\\' {
            i += 1;
            let Some(&(_, escaped)) = chars.get(i) else {
                break;
            };
            out.push(match escaped {
                'n' => '\n',
                't' => '\t',
                'r' => '\r',
                '0' => '\0',
                other => other,
            });
        } else {
            out.push(c);
        }
        i += 1;
    }

    Err(format!("unterminated string starting at offset {offset}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Token> {
        tokenize(source).unwrap().into_iter().map(|s| s.token).collect()
    }

    #[test]
    fn tokenizes_arrow_function() {
        assert_eq!(
            kinds("({ item }) => item?.title ?? 'none'"),
            vec![
                Token::LParen,
                Token::LBrace,
                Token::Ident("item".into()),
                Token::RBrace,
                Token::RParen,
                Token::Arrow,
                Token::Ident("item".into()),
                Token::QuestionDot,
                Token::Ident("title".into()),
                Token::Nullish,
                Token::Str("none".into()),
            ]
        );
    }

    #[test]
    fn strict_equality_folds_to_equality() {
        assert_eq!(kinds("a === b"), kinds("a == b"));
        assert_eq!(kinds("a !== b"), kinds("a != b"));
    }

    #[test]
    fn ternary_with_decimal_is_not_optional_chain() {
        assert_eq!(
            kinds("a?.5:1"),
            vec![
                Token::Ident("a".into()),
                Token::Question,
                Token::Number(0.5),
                Token::Colon,
                Token::Number(1.0),
            ]
        );
    }

    #[test]
    fn reads_escapes_and_comments() {
        assert_eq!(
            kinds("'it\\'s' // trailing\n/* block */ \"a\\nb\""),
            vec![Token::Str("it's".into()), Token::Str("a\nb".into())]
        );
    }

    #[test]
    fn reports_bad_input() {
        assert!(tokenize("'open").unwrap_err().contains("unterminated string"));
        assert!(tokenize("a # b").unwrap_err().contains("unexpected character '#'"));
        assert!(tokenize("/* never closed").is_err());
    }
}
