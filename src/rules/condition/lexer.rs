//! Tokenizer for rule conditions.

use crate::error::ConditionError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TokenKind {
    Identifier(String),
    /// Backtick-quoted column name.
    QuotedIdentifier(String),
    Number(String),
    Str(String),
    True,
    False,
    Null,
    And,
    Or,
    Not,
    Is,
    In,
    Between,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Eq,
    NotEq,
    Lt,
    Lte,
    Gt,
    Gte,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Token {
    pub kind: TokenKind,
    /// Byte offset of the token start in the source text.
    pub offset: usize,
}

fn syntax(offset: usize, message: impl Into<String>) -> ConditionError {
    ConditionError::Syntax {
        offset,
        message: message.into(),
    }
}

pub(crate) fn tokenize(source: &str) -> Result<Vec<Token>, ConditionError> {
    let chars: Vec<(usize, char)> = source.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0usize;

    while i < chars.len() {
        let (offset, ch) = chars[i];

        if ch.is_whitespace() {
            i += 1;
            continue;
        }

        if ch == '\'' || ch == '"' || ch == '`' {
            let quote = ch;
            i += 1;
            let mut literal = String::new();
            let mut terminated = false;
            while i < chars.len() {
                let c = chars[i].1;
                if c == '\\' {
                    match chars.get(i + 1) {
                        Some((_, escaped)) => {
                            literal.push(*escaped);
                            i += 2;
                            continue;
                        }
                        None => return Err(syntax(chars[i].0, "unterminated escape sequence")),
                    }
                }
                if c == quote {
                    i += 1;
                    terminated = true;
                    break;
                }
                literal.push(c);
                i += 1;
            }
            if !terminated {
                return Err(syntax(offset, "unterminated quoted text"));
            }
            let kind = if quote == '`' {
                TokenKind::QuotedIdentifier(literal)
            } else {
                TokenKind::Str(literal)
            };
            tokens.push(Token { kind, offset });
            continue;
        }

        if ch.is_alphabetic() || ch == '_' {
            let start = i;
            while i < chars.len() && (chars[i].1.is_alphanumeric() || chars[i].1 == '_') {
                i += 1;
            }
            let end = chars.get(i).map(|(o, _)| *o).unwrap_or(source.len());
            let word = &source[chars[start].0..end];
            let kind = match word.to_ascii_lowercase().as_str() {
                "and" => TokenKind::And,
                "or" => TokenKind::Or,
                "not" => TokenKind::Not,
                "is" => TokenKind::Is,
                "in" => TokenKind::In,
                "between" => TokenKind::Between,
                "true" => TokenKind::True,
                "false" => TokenKind::False,
                "null" | "none" => TokenKind::Null,
                _ => TokenKind::Identifier(word.to_string()),
            };
            tokens.push(Token { kind, offset });
            continue;
        }

        if ch.is_ascii_digit()
            || (ch == '.' && chars.get(i + 1).is_some_and(|(_, c)| c.is_ascii_digit()))
        {
            let start = i;
            let mut seen_dot = false;
            let mut seen_exp = false;
            while i < chars.len() {
                let c = chars[i].1;
                if c.is_ascii_digit() {
                    i += 1;
                } else if c == '.' && !seen_dot && !seen_exp {
                    seen_dot = true;
                    i += 1;
                } else if (c == 'e' || c == 'E') && !seen_exp {
                    seen_exp = true;
                    i += 1;
                    if chars.get(i).is_some_and(|(_, s)| *s == '+' || *s == '-') {
                        i += 1;
                    }
                } else {
                    break;
                }
            }
            let end = chars.get(i).map(|(o, _)| *o).unwrap_or(source.len());
            tokens.push(Token {
                kind: TokenKind::Number(source[chars[start].0..end].to_string()),
                offset,
            });
            continue;
        }

        let next = chars.get(i + 1).map(|(_, c)| *c);
        let (kind, width) = match (ch, next) {
            ('(', _) => (TokenKind::LParen, 1),
            (')', _) => (TokenKind::RParen, 1),
            ('[', _) => (TokenKind::LBracket, 1),
            (']', _) => (TokenKind::RBracket, 1),
            (',', _) => (TokenKind::Comma, 1),
            ('+', _) => (TokenKind::Plus, 1),
            ('-', _) => (TokenKind::Minus, 1),
            ('*', _) => (TokenKind::Star, 1),
            ('/', _) => (TokenKind::Slash, 1),
            ('%', _) => (TokenKind::Percent, 1),
            ('=', Some('=')) => (TokenKind::Eq, 2),
            ('=', _) => (TokenKind::Eq, 1),
            ('!', Some('=')) => (TokenKind::NotEq, 2),
            ('!', _) => (TokenKind::Not, 1),
            ('<', Some('=')) => (TokenKind::Lte, 2),
            ('<', Some('>')) => (TokenKind::NotEq, 2),
            ('<', _) => (TokenKind::Lt, 1),
            ('>', Some('=')) => (TokenKind::Gte, 2),
            ('>', _) => (TokenKind::Gt, 1),
            ('&', Some('&')) => (TokenKind::And, 2),
            ('|', Some('|')) => (TokenKind::Or, 2),
            _ => return Err(syntax(offset, format!("unexpected character '{}'", ch))),
        };
        tokens.push(Token { kind, offset });
        i += width;
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        tokenize(src).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_tokenize_comparison() {
        assert_eq!(
            kinds("age >= -5"),
            vec![
                TokenKind::Identifier("age".into()),
                TokenKind::Gte,
                TokenKind::Minus,
                TokenKind::Number("5".into()),
            ]
        );
    }

    #[test]
    fn test_tokenize_keywords_case_insensitive() {
        assert_eq!(
            kinds("x IS NOT NULL && y"),
            vec![
                TokenKind::Identifier("x".into()),
                TokenKind::Is,
                TokenKind::Not,
                TokenKind::Null,
                TokenKind::And,
                TokenKind::Identifier("y".into()),
            ]
        );
    }

    #[test]
    fn test_tokenize_quotes() {
        assert_eq!(
            kinds(r#"`first name` == 'O\'Neil'"#),
            vec![
                TokenKind::QuotedIdentifier("first name".into()),
                TokenKind::Eq,
                TokenKind::Str("O'Neil".into()),
            ]
        );
    }

    #[test]
    fn test_tokenize_scientific_number() {
        assert_eq!(kinds("1.5e3"), vec![TokenKind::Number("1.5e3".into())]);
    }

    #[test]
    fn test_unterminated_string() {
        let err = tokenize("name == 'abc").unwrap_err();
        assert!(matches!(err, ConditionError::Syntax { offset: 8, .. }));
    }

    #[test]
    fn test_rejects_host_syntax() {
        assert!(tokenize("__import__('os').system('rm')").is_err());
        assert!(tokenize("a; b").is_err());
        assert!(tokenize("x @ y").is_err());
    }
}
