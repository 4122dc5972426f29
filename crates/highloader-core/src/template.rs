//! Payload templates: literal text with `{{ directive args... }}` actions
//! evaluated at expansion time.
//!
//! Supported directives:
//! - `randNum MIN MAX`: uniform integer in the closed range `[MIN, MAX]`
//! - `randStr LEN`: random alphanumeric string of `LEN` characters
//! - `now`: current UTC time in RFC 3339 form
//! - `unixMillis`: milliseconds since the Unix epoch
//!
//! Arity and range are checked at evaluation time, unknown directives and
//! malformed literals at parse time.

use crate::error::TemplateError;
use rand::distributions::Alphanumeric;
use rand::Rng;

const OPEN: &str = "{{";
const CLOSE: &str = "}}";
const MAX_RANDOM_STRING_LEN: i64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Directive {
    RandNum,
    RandStr,
    Now,
    UnixMillis,
}

impl Directive {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "randNum" => Some(Directive::RandNum),
            "randStr" => Some(Directive::RandStr),
            "now" => Some(Directive::Now),
            "unixMillis" => Some(Directive::UnixMillis),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Directive::RandNum => "randNum",
            Directive::RandStr => "randStr",
            Directive::Now => "now",
            Directive::UnixMillis => "unixMillis",
        }
    }

    fn arity(self) -> usize {
        match self {
            Directive::RandNum => 2,
            Directive::RandStr => 1,
            Directive::Now | Directive::UnixMillis => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Action { directive: Directive, args: Vec<i64> },
}

/// A parsed template. Rendering never mutates it, so one parse can be
/// rendered from many tasks at once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut rest = source;
        let mut offset = 0usize;

        while let Some(start) = rest.find(OPEN) {
            if start > 0 {
                segments.push(Segment::Literal(rest[..start].to_string()));
            }
            let action_offset = offset + start;
            let body_start = start + OPEN.len();
            let Some(body_len) = rest[body_start..].find(CLOSE) else {
                return Err(TemplateError::Syntax {
                    offset: action_offset,
                    message: "unclosed action".to_string(),
                });
            };

            let body = &rest[body_start..body_start + body_len];
            segments.push(parse_action(body, action_offset)?);

            let consumed = body_start + body_len + CLOSE.len();
            rest = &rest[consumed..];
            offset += consumed;
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        Ok(Self { segments })
    }

    pub fn render(&self) -> Result<String, TemplateError> {
        let mut out = String::new();
        let mut rng = rand::thread_rng();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Action { directive, args } => {
                    out.push_str(&evaluate(*directive, args, &mut rng)?);
                }
            }
        }
        Ok(out)
    }

    /// True when rendering always yields the same text.
    pub fn is_static(&self) -> bool {
        self.segments
            .iter()
            .all(|s| matches!(s, Segment::Literal(_)))
    }
}

/// Parse and render `source` in one step. Each call is an independent
/// evaluation.
pub fn expand(source: &str) -> Result<String, TemplateError> {
    Template::parse(source)?.render()
}

fn parse_action(body: &str, offset: usize) -> Result<Segment, TemplateError> {
    let mut tokens = body.split_whitespace();
    let Some(name) = tokens.next() else {
        return Err(TemplateError::Syntax {
            offset,
            message: "missing value for command".to_string(),
        });
    };

    let directive = Directive::parse(name).ok_or_else(|| TemplateError::Syntax {
        offset,
        message: format!("function {name:?} not defined"),
    })?;

    let args = tokens
        .map(|token| {
            token.parse::<i64>().map_err(|_| TemplateError::Syntax {
                offset,
                message: format!("bad number syntax: {token:?}"),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Segment::Action { directive, args })
}

fn evaluate(directive: Directive, args: &[i64], rng: &mut impl Rng) -> Result<String, TemplateError> {
    let eval_error = |message: String| TemplateError::Eval {
        directive: directive.name().to_string(),
        message,
    };

    if args.len() != directive.arity() {
        return Err(eval_error(format!(
            "wrong number of args: want {} got {}",
            directive.arity(),
            args.len()
        )));
    }

    match directive {
        Directive::RandNum => {
            let (min, max) = (args[0], args[1]);
            if min > max {
                return Err(eval_error(format!("min {min} is greater than max {max}")));
            }
            Ok(rng.gen_range(min..=max).to_string())
        }
        Directive::RandStr => {
            let len = args[0];
            if !(0..=MAX_RANDOM_STRING_LEN).contains(&len) {
                return Err(eval_error(format!(
                    "length {len} outside 0..={MAX_RANDOM_STRING_LEN}"
                )));
            }
            Ok(rng
                .sample_iter(&Alphanumeric)
                .take(len as usize)
                .map(char::from)
                .collect())
        }
        Directive::Now => Ok(chrono::Utc::now().to_rfc3339()),
        Directive::UnixMillis => Ok(chrono::Utc::now().timestamp_millis().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_rand_num_in_range() {
        let num: i64 = expand("{{randNum 50 100}}").unwrap().parse().unwrap();
        assert!((50..=100).contains(&num), "num: {}", num);
    }

    #[test]
    fn test_rand_num_spread() {
        let template = Template::parse("{{randNum 1 1000}}").unwrap();
        let mut seen = BTreeSet::new();
        for _ in 0..1000 {
            let v: i64 = template.render().unwrap().parse().unwrap();
            assert!((1..=1000).contains(&v));
            seen.insert(v);
        }
        // A uniform draw over 1000 values hits roughly 632 distinct ones.
        assert!(seen.len() > 400, "distinct values: {}", seen.len());
    }

    #[test]
    fn test_rand_num_covers_closed_range() {
        let mut seen = BTreeSet::new();
        for _ in 0..1000 {
            seen.insert(expand("{{randNum 1 3}}").unwrap());
        }
        let expected: BTreeSet<String> = ["1", "2", "3"].iter().map(|s| s.to_string()).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_rand_num_degenerate_and_negative() {
        assert_eq!(expand("{{randNum 7 7}}").unwrap(), "7");
        let v: i64 = expand("{{ randNum -5 -1 }}").unwrap().parse().unwrap();
        assert!((-5..=-1).contains(&v));
    }

    #[test]
    fn test_literal_passthrough() {
        let json = r#"{"text":"hi","nested":{"n":1},"closing":"}}"}"#;
        assert_eq!(expand(json).unwrap(), json);
        assert_eq!(expand("").unwrap(), "");
        assert!(Template::parse(json).unwrap().is_static());
    }

    #[test]
    fn test_mixed_template() {
        let out = expand(r#"{"text":"hi-{{randNum 1 3}}"}"#).unwrap();
        assert!(
            [r#"{"text":"hi-1"}"#, r#"{"text":"hi-2"}"#, r#"{"text":"hi-3"}"#].contains(&out.as_str()),
            "out: {}",
            out
        );
        assert!(!Template::parse("{{now}}").unwrap().is_static());
    }

    #[test]
    fn test_rand_str_and_clock_directives() {
        let s = expand("{{randStr 12}}").unwrap();
        assert_eq!(s.len(), 12);
        assert!(s.chars().all(|c| c.is_ascii_alphanumeric()));

        let now = expand("{{now}}").unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(&now).is_ok(), "now: {}", now);

        let millis: i64 = expand("{{unixMillis}}").unwrap().parse().unwrap();
        assert!(millis > 1_600_000_000_000);
    }

    #[test]
    fn test_missing_arguments_is_eval_error() {
        let err = expand(r#"{"text":"{{randNum}}"}"#).unwrap_err();
        assert!(matches!(err, TemplateError::Eval { .. }), "got {err:?}");

        let err = expand("{{randNum 1 2 3}}").unwrap_err();
        assert!(matches!(err, TemplateError::Eval { .. }), "got {err:?}");
    }

    #[test]
    fn test_inverted_range_is_eval_error() {
        let err = expand("{{randNum 10 1}}").unwrap_err();
        assert!(matches!(err, TemplateError::Eval { .. }), "got {err:?}");
    }

    #[test]
    fn test_syntax_errors() {
        let cases = [
            ("{{randNum 1 2", 0),
            ("abc{{}}", 3),
            ("{{nope 1}}", 0),
            ("x{{randNum one 2}}", 1),
        ];
        for (source, offset) in cases {
            match Template::parse(source) {
                Err(TemplateError::Syntax { offset: got, .. }) => {
                    assert_eq!(got, offset, "source: {source}")
                }
                other => panic!("expected syntax error for {source:?}, got {other:?}"),
            }
        }
    }
}
