//! Positional command matching against `scanf`-like templates such as
//! `put %s %s` or `sector $%x`.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Placeholder {
    /// `%s`
    StringToken,
    /// `%d`, base 10 with optional sign.
    IntToken,
    /// `%x`, base 16.
    HexToken,
}

impl Placeholder {
    fn from_code(code: char) -> Option<Self> {
        match code {
            's' => Some(Self::StringToken),
            'd' => Some(Self::IntToken),
            'x' => Some(Self::HexToken),
            _ => None,
        }
    }

    fn convert(self, token: &str) -> Option<Value> {
        match self {
            Self::StringToken => Some(Value::Text(token.to_string())),
            Self::IntToken => token.parse().ok().map(Value::Int),
            Self::HexToken => i64::from_str_radix(token, 16).ok().map(Value::Int),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    Text(String),
    Int(i64),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParsedCommand {
    /// Placeholders filled, counted from the left.
    pub count: usize,
    pub values: Vec<Value>,
}

impl ParsedCommand {
    pub fn text(&self, idx: usize) -> Option<&str> {
        match self.values.get(idx) {
            Some(Value::Text(text)) => Some(text),
            _ => None,
        }
    }

    pub fn int(&self, idx: usize) -> Option<i64> {
        match self.values.get(idx) {
            Some(Value::Int(value)) => Some(*value),
            _ => None,
        }
    }
}

enum TemplateWord<'a> {
    Literal(&'a str),
    Slot {
        prefix: &'a str,
        placeholder: Placeholder,
    },
}

fn template_word(word: &str) -> TemplateWord<'_> {
    if let Some(at) = word.rfind('%') {
        let mut rest = word[at + 1..].chars();
        if let (Some(code), None) = (rest.next(), rest.next()) {
            if let Some(placeholder) = Placeholder::from_code(code) {
                return TemplateWord::Slot {
                    prefix: &word[..at],
                    placeholder,
                };
            }
        }
    }
    TemplateWord::Literal(word)
}

/// Splits on whitespace; a token opening with `"` runs to the next `"` (or
/// end of line) and loses its quotes.
pub fn tokenize(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        let mut token = String::new();
        if c == '"' {
            chars.next();
            for c in chars.by_ref() {
                if c == '"' {
                    break;
                }
                token.push(c);
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                token.push(c);
                chars.next();
            }
        }
        tokens.push(token);
    }
    tokens
}

/// Matches `input` against `template` word by word and stops at the first
/// literal mismatch, missing token or unparsable number. Trailing input
/// beyond the template is ignored.
pub fn parse_command(input: &str, template: &str) -> ParsedCommand {
    let tokens = tokenize(input);
    let mut parsed = ParsedCommand::default();
    for (idx, word) in template.split_whitespace().enumerate() {
        let Some(token) = tokens.get(idx) else {
            break;
        };
        match template_word(word) {
            TemplateWord::Literal(literal) => {
                if token != literal {
                    break;
                }
            }
            TemplateWord::Slot {
                prefix,
                placeholder,
            } => {
                let Some(value) = token
                    .strip_prefix(prefix)
                    .and_then(|rest| placeholder.convert(rest))
                else {
                    break;
                };
                parsed.values.push(value);
                parsed.count += 1;
            }
        }
    }
    parsed
}

/// Number of placeholders in a template.
pub fn placeholder_count(template: &str) -> usize {
    template
        .split_whitespace()
        .filter(|word| matches!(template_word(word), TemplateWord::Slot { .. }))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(parsed: &ParsedCommand) -> Vec<&str> {
        (0..parsed.count).filter_map(|i| parsed.text(i)).collect()
    }

    #[test]
    fn put_with_two_names() {
        let parsed = parse_command("put test.d81 TEST.D81", "put %s %s");
        assert_eq!(parsed.count, 2);
        assert_eq!(texts(&parsed), ["test.d81", "TEST.D81"]);
    }

    #[test]
    fn quoted_token_keeps_spaces() {
        let parsed = parse_command("put \"my test file.d81\" TEST.D81", "put %s %s");
        assert_eq!(parsed.count, 2);
        assert_eq!(texts(&parsed), ["my test file.d81", "TEST.D81"]);
    }

    #[test]
    fn decimal_sector() {
        let parsed = parse_command("sector 123", "sector %d");
        assert_eq!(parsed.count, 1);
        assert_eq!(parsed.int(0), Some(123));
        assert_eq!(parse_command("clustermap -4", "clustermap %d").int(0), Some(-4));
    }

    #[test]
    fn short_input_fills_what_it_can() {
        let parsed = parse_command("get TEST.D81", "get %s %s");
        assert_eq!(parsed.count, 1);
        assert_eq!(parsed.text(0), Some("TEST.D81"));
        assert_eq!(parse_command("get", "get %s").count, 0);
    }

    #[test]
    fn hex_with_literal_prefix() {
        let parsed = parse_command("sector $1f", "sector $%x");
        assert_eq!(parsed.int(0), Some(0x1f));
        assert_eq!(parse_command("sector 31", "sector $%x").count, 0);
        assert_eq!(parse_command("sector $zz", "sector $%x").count, 0);
    }

    #[test]
    fn literal_mismatch_stops_at_zero() {
        assert_eq!(parse_command("put a b", "get %s %s"), ParsedCommand::default());
        assert_eq!(parse_command("sector 12", "sectors %d").count, 0);
    }

    #[test]
    fn bad_number_stops_the_count() {
        let parsed = parse_command("clustermap 10 many", "clustermap %d %d");
        assert_eq!(parsed.count, 1);
        assert_eq!(parsed.values, vec![Value::Int(10)]);
    }

    #[test]
    fn extra_tokens_are_ignored() {
        let parsed = parse_command("del A.PRG B.PRG", "del %s");
        assert_eq!(parsed.count, 1);
        assert_eq!(parsed.text(0), Some("A.PRG"));
    }

    #[test]
    fn tokenizer_handles_quotes() {
        assert_eq!(tokenize("  a   b\t"), ["a", "b"]);
        assert_eq!(tokenize("\"\" x"), ["", "x"]);
        assert_eq!(tokenize("put \"open ended"), ["put", "open ended"]);
        assert_eq!(tokenize("a\"b c"), ["a\"b", "c"]);
    }

    #[test]
    fn count_never_exceeds_placeholders() {
        for (input, template) in [
            ("put a b c d", "put %s %s"),
            ("rename x y", "rename %s %s"),
            ("dir", "dir"),
            ("sector $10 20", "sector $%x"),
        ] {
            let parsed = parse_command(input, template);
            assert!(parsed.count <= placeholder_count(template), "{input}");
            assert_eq!(parsed.count, parsed.values.len());
        }
        assert_eq!(placeholder_count("sector $%x"), 1);
        assert_eq!(placeholder_count("put %s %s"), 2);
    }
}
