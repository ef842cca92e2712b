//! # Select Query Parser
//!
//! Parses the query subset understood by [`super::MemoryGraph`]:
//! ```text
//! SELECT ?sensor ?room [FROM site1, site2] WHERE {
//!     ?sensor rdf:type brick:Zone_Temperature_Sensor .
//!     ?sensor bf:isLocatedIn ?room
//! };
//! ```
//! Terms are `?vars`, `prefix:local` names, `<namespace#value>` URIs, or
//! `"literals"`. `a` abbreviates `rdf:type`.

use sluice_core::query::BRICK_FRAME_NS;
use sluice_core::{SelectQuery, StoreError, Term, TriplePattern, Uri};
use std::collections::HashMap;

pub type Prefixes = HashMap<String, String>;

pub const RDF_NS: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns";
pub const BRICK_NS: &str = "https://brickschema.org/schema/1.0.3/Brick";

pub fn default_prefixes() -> Prefixes {
    [
        ("rdf", RDF_NS),
        ("rdfs", "http://www.w3.org/2000/01/rdf-schema"),
        ("owl", "http://www.w3.org/2002/07/owl"),
        ("brick", BRICK_NS),
        ("bf", BRICK_FRAME_NS),
    ]
    .into_iter()
    .map(|(p, ns)| (p.to_string(), ns.to_string()))
    .collect()
}

fn invalid(msg: impl Into<String>) -> StoreError {
    StoreError::Parse(msg.into())
}

/// Parse `input` into a query pinned to `version`.
pub fn parse(input: &str, prefixes: &Prefixes, version: u64) -> Result<SelectQuery, StoreError> {
    let input = input.trim().trim_end_matches(';').trim_end();
    let body = strip_keyword_prefix(input, "SELECT")
        .ok_or_else(|| invalid("query must start with SELECT"))?;

    let open = body.find('{').ok_or_else(|| invalid("missing '{' after WHERE"))?;
    let close = body
        .rfind('}')
        .filter(|&pos| pos > open)
        .ok_or_else(|| invalid("missing closing '}'"))?;
    if !body[close + 1..].trim().is_empty() {
        return Err(invalid("unexpected text after '}'"));
    }

    let head = strip_keyword_suffix(body[..open].trim_end(), "WHERE")
        .ok_or_else(|| invalid("missing WHERE clause"))?;
    let (vars, graphs) = parse_projection(head)?;
    let patterns = parse_patterns(&body[open + 1..close], prefixes)?;

    for var in &vars {
        if !patterns.iter().any(|p| mentions(p, var)) {
            return Err(invalid(format!("variable {} is not used in WHERE", var)));
        }
    }

    Ok(SelectQuery {
        vars,
        patterns,
        graphs,
        version,
    })
}

/// `text` without a leading ASCII `keyword`, matched case-insensitively.
fn strip_keyword_prefix<'a>(text: &'a str, keyword: &str) -> Option<&'a str> {
    text.get(..keyword.len())
        .filter(|head| head.eq_ignore_ascii_case(keyword))
        .and_then(|_| text.get(keyword.len()..))
}

fn strip_keyword_suffix<'a>(text: &'a str, keyword: &str) -> Option<&'a str> {
    let split = text.len().checked_sub(keyword.len())?;
    text.get(split..)
        .filter(|tail| tail.eq_ignore_ascii_case(keyword))
        .and_then(|_| text.get(..split))
}

fn parse_projection(head: &str) -> Result<(Vec<String>, Vec<String>), StoreError> {
    let mut vars = Vec::new();
    let mut graphs = Vec::new();
    let mut in_from = false;

    for token in head
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|t| !t.is_empty())
    {
        if token.eq_ignore_ascii_case("FROM") {
            in_from = true;
        } else if in_from {
            graphs.push(token.to_string());
        } else if token.len() > 1 && token.starts_with('?') {
            vars.push(token.to_string());
        } else {
            return Err(invalid(format!("unexpected '{}' in projection", token)));
        }
    }

    if vars.is_empty() {
        return Err(invalid("SELECT needs at least one variable"));
    }
    Ok((vars, graphs))
}

fn parse_patterns(body: &str, prefixes: &Prefixes) -> Result<Vec<TriplePattern>, StoreError> {
    let mut patterns = Vec::new();
    let mut terms = Vec::with_capacity(3);

    for token in tokenize(body)? {
        if token == "." {
            if !terms.is_empty() {
                return Err(invalid("incomplete triple pattern"));
            }
            continue;
        }
        terms.push(parse_term(&token, prefixes)?);
        if terms.len() == 3 {
            let object = terms.pop();
            let predicate = terms.pop();
            let subject = terms.pop();
            if let (Some(subject), Some(predicate), Some(object)) = (subject, predicate, object) {
                patterns.push(TriplePattern {
                    subject,
                    predicate,
                    object,
                });
            }
        }
    }

    if !terms.is_empty() {
        return Err(invalid("incomplete triple pattern"));
    }
    if patterns.is_empty() {
        return Err(invalid("WHERE clause has no patterns"));
    }
    Ok(patterns)
}

fn tokenize(body: &str) -> Result<Vec<String>, StoreError> {
    let mut tokens = Vec::new();
    let mut chars = body.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        match c {
            '.' => {
                chars.next();
                tokens.push(".".to_string());
            }
            '"' | '<' => {
                let closing = if c == '"' { '"' } else { '>' };
                let mut token = String::new();
                token.push(c);
                chars.next();
                loop {
                    match chars.next() {
                        Some(ch) if ch == closing => {
                            token.push(ch);
                            break;
                        }
                        Some(ch) => token.push(ch),
                        None => return Err(invalid(format!("unterminated {}", token))),
                    }
                }
                tokens.push(token);
            }
            _ => {
                let mut token = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_whitespace() || ch == '"' || ch == '<' {
                        break;
                    }
                    token.push(ch);
                    chars.next();
                }
                // A trailing '.' terminates the pattern.
                let mut dots = 0;
                while token.ends_with('.') {
                    token.pop();
                    dots += 1;
                }
                if !token.is_empty() {
                    tokens.push(token);
                }
                tokens.extend(std::iter::repeat(".".to_string()).take(dots));
            }
        }
    }
    Ok(tokens)
}

/// Parse one term. Also used for the triples of graph fixtures.
pub fn parse_term(token: &str, prefixes: &Prefixes) -> Result<Term, StoreError> {
    if let Some(name) = token.strip_prefix('?') {
        if name.is_empty() {
            return Err(invalid("empty variable name"));
        }
        return Ok(Term::Var(token.to_string()));
    }
    if let Some(literal) = token.strip_prefix('"').and_then(|t| t.strip_suffix('"')) {
        return Ok(Term::Uri(Uri::literal(literal)));
    }
    if let Some(full) = token.strip_prefix('<').and_then(|t| t.strip_suffix('>')) {
        let (namespace, value) = full
            .rsplit_once('#')
            .or_else(|| full.rsplit_once('/'))
            .ok_or_else(|| invalid(format!("malformed URI <{}>", full)))?;
        return Ok(Term::Uri(Uri::new(namespace, value)));
    }
    if token == "a" {
        return Ok(Term::Uri(Uri::new(RDF_NS, "type")));
    }
    match token.split_once(':') {
        Some((prefix, local)) => prefixes
            .get(prefix)
            .map(|ns| Term::Uri(Uri::new(ns.as_str(), local)))
            .ok_or_else(|| invalid(format!("unknown prefix '{}'", prefix))),
        None => Err(invalid(format!("unrecognized term '{}'", token))),
    }
}

fn mentions(pattern: &TriplePattern, var: &str) -> bool {
    [&pattern.subject, &pattern.predicate, &pattern.object]
        .into_iter()
        .any(|term| matches!(term, Term::Var(name) if name == var))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(input: &str) -> Result<SelectQuery, StoreError> {
        parse(input, &default_prefixes(), 7)
    }

    #[test]
    fn test_bootstrap_query() {
        let q = p(sluice_core::store::BOOTSTRAP_QUERY).unwrap();
        assert_eq!(q.vars, vec!["?c"]);
        assert_eq!(q.version, 7);
        assert!(q.graphs.is_empty());
        assert_eq!(q.patterns.len(), 1);
        assert_eq!(q.patterns[0].predicate, Term::Uri(Uri::new(RDF_NS, "type")));
        assert_eq!(q.patterns[0].object, Term::Uri(Uri::new(BRICK_NS, "Class")));
    }

    #[test]
    fn test_multiple_patterns_and_graphs() {
        let q = p("select ?s ?r from ciee, soda where { ?s a brick:Sensor . ?s bf:isLocatedIn ?r. }")
            .unwrap();
        assert_eq!(q.vars, vec!["?s", "?r"]);
        assert_eq!(q.graphs, vec!["ciee", "soda"]);
        assert_eq!(q.patterns.len(), 2);
        assert_eq!(
            q.patterns[1].predicate,
            Term::Uri(Uri::new(BRICK_FRAME_NS, "isLocatedIn"))
        );
        assert_eq!(q.patterns[1].object, Term::Var("?r".into()));
    }

    #[test]
    fn test_literal_and_full_uri_terms() {
        let q = p(r#"SELECT ?s WHERE { ?s <http://example.com/ns#label> "Room 1.2" }"#).unwrap();
        assert_eq!(
            q.patterns[0].predicate,
            Term::Uri(Uri::new("http://example.com/ns", "label"))
        );
        assert_eq!(q.patterns[0].object, Term::Uri(Uri::literal("Room 1.2")));
    }

    #[test]
    fn test_rejects_malformed_queries() {
        assert!(p("").is_err());
        assert!(p("SELECT WHERE { ?s a brick:Sensor }").is_err());
        assert!(p("SELECT ?s { ?s a brick:Sensor }").is_err());
        assert!(p("SELECT ?s WHERE { ?s a }").is_err());
        assert!(p("SELECT ?s WHERE { ?s a brick:Sensor").is_err());
        assert!(p("SELECT ?s WHERE { ?s nope:x ?o }").is_err());
        assert!(p("SELECT ?x WHERE { ?s a brick:Sensor }").is_err());
        assert!(p(r#"SELECT ?s WHERE { ?s a "open }"#).is_err());
    }

    #[test]
    fn test_non_ascii_text_is_a_parse_error() {
        assert!(matches!(p("aééé WHERE { ?s a brick:X }"), Err(StoreError::Parse(_))));
        assert!(matches!(p("SELECT ?s ééé { ?s a brick:X }"), Err(StoreError::Parse(_))));
        assert!(matches!(p("SELECTé ?s WHERE { ?s a brick:X }"), Err(StoreError::Parse(_))));
        assert!(matches!(p("é"), Err(StoreError::Parse(_))));
    }

    #[test]
    fn test_non_ascii_literal_is_kept() {
        let q = p(r#"SELECT ?s WHERE { ?s bf:label "Salle à manger" }"#).unwrap();
        assert_eq!(q.patterns[0].object, Term::Uri(Uri::literal("Salle à manger")));
    }

    #[test]
    fn test_parse_error_kind() {
        assert!(matches!(p("DELETE everything"), Err(StoreError::Parse(_))));
    }
}
