//! Prompt template extraction, matching, and rendering.
//!
//! Discovery groups observed prompt texts by common structure and emits
//! templates with `{var_N}` placeholders. The extraction algorithm
//! itself sits behind [`TemplateExtractor`] so deployments can swap in a
//! smarter one; the anchor-based reference implementation here covers
//! the common case of fixed scaffolding around interpolated values.
//!
//! Required law: `match_template(render_template(T, V)) == V` for
//! templates produced by the extractor.

use std::collections::BTreeMap;

/// Variables captured when a text matches a template.
pub type Variables = BTreeMap<String, String>;

/// A discovered template plus the texts it matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedTemplate {
    /// Template text with `{var_N}` placeholders.
    pub text: String,
    /// `(input index, captured variables)` for each matched input.
    pub matches: Vec<(usize, Variables)>,
}

/// Seam for the grouping algorithm.
pub trait TemplateExtractor: Send + Sync {
    /// Group `texts` into templates. Inputs that match no group are
    /// simply absent from every `matches` list.
    fn extract(&self, texts: &[&str]) -> Vec<ExtractedTemplate>;
}

/// Reference extractor: tokenizes into word / separator runs, groups
/// texts sharing the same separator skeleton, and turns the columns
/// where texts disagree into variables.
#[derive(Debug, Clone)]
pub struct AnchorExtractor {
    /// Minimum group size before a template is emitted.
    pub min_group_size: usize,
}

impl Default for AnchorExtractor {
    fn default() -> Self {
        Self { min_group_size: 2 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Token {
    Word(String),
    Separator(String),
}

fn tokenize(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut current_is_word: Option<bool> = None;

    for ch in text.chars() {
        let is_word = ch.is_alphanumeric() || ch == '_';
        match current_is_word {
            Some(prev) if prev == is_word => current.push(ch),
            _ => {
                if let Some(prev) = current_is_word {
                    let token = std::mem::take(&mut current);
                    tokens.push(if prev {
                        Token::Word(token)
                    } else {
                        Token::Separator(token)
                    });
                }
                current.push(ch);
                current_is_word = Some(is_word);
            }
        }
    }
    if let Some(prev) = current_is_word {
        tokens.push(if prev {
            Token::Word(current)
        } else {
            Token::Separator(current)
        });
    }
    tokens
}

/// The separator skeleton plus token count; texts sharing it are
/// candidates for the same template.
fn shape_key(tokens: &[Token]) -> String {
    let mut key = format!("{}|", tokens.len());
    for token in tokens {
        match token {
            Token::Word(_) => key.push('w'),
            Token::Separator(s) => {
                key.push('[');
                key.push_str(s);
                key.push(']');
            }
        }
    }
    key
}

impl TemplateExtractor for AnchorExtractor {
    fn extract(&self, texts: &[&str]) -> Vec<ExtractedTemplate> {
        let tokenized: Vec<Vec<Token>> = texts.iter().map(|t| tokenize(t)).collect();

        // Group input indexes by shape.
        let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (idx, tokens) in tokenized.iter().enumerate() {
            if tokens.is_empty() {
                continue;
            }
            groups.entry(shape_key(tokens)).or_default().push(idx);
        }

        let mut templates = Vec::new();
        for indexes in groups.values() {
            if indexes.len() < self.min_group_size {
                continue;
            }
            let width = tokenized[indexes[0]].len();

            // A column is an anchor when every text in the group agrees on it.
            let mut is_anchor = vec![true; width];
            let first = &tokenized[indexes[0]];
            for &idx in &indexes[1..] {
                for (col, token) in tokenized[idx].iter().enumerate() {
                    if token != &first[col] {
                        is_anchor[col] = false;
                    }
                }
            }

            // Without at least one anchored word the group is just noise
            // of the same shape, not a template.
            let anchored_words = first
                .iter()
                .zip(&is_anchor)
                .filter(|(t, &a)| a && matches!(t, Token::Word(_)))
                .count();
            if anchored_words == 0 {
                continue;
            }

            let mut template_text = String::new();
            let mut var_columns = Vec::new();
            for (col, token) in first.iter().enumerate() {
                if is_anchor[col] {
                    match token {
                        Token::Word(w) => template_text.push_str(w),
                        Token::Separator(s) => template_text.push_str(s),
                    }
                } else {
                    let var_name = format!("var_{}", var_columns.len());
                    template_text.push('{');
                    template_text.push_str(&var_name);
                    template_text.push('}');
                    var_columns.push((col, var_name));
                }
            }

            let matches = indexes
                .iter()
                .map(|&idx| {
                    let vars = var_columns
                        .iter()
                        .map(|(col, name)| {
                            let value = match &tokenized[idx][*col] {
                                Token::Word(w) => w.clone(),
                                Token::Separator(s) => s.clone(),
                            };
                            (name.clone(), value)
                        })
                        .collect();
                    (idx, vars)
                })
                .collect();

            templates.push(ExtractedTemplate {
                text: template_text,
                matches,
            });
        }
        templates
    }
}

/// Split a template into literal and placeholder segments.
fn segments(template: &str) -> Vec<Segment> {
    let mut out = Vec::new();
    let mut literal = String::new();
    let mut chars = template.char_indices().peekable();

    while let Some((start, ch)) = chars.next() {
        if ch == '{' {
            // Scan ahead for a well-formed `{name}` placeholder.
            let rest = &template[start + 1..];
            if let Some(end) = rest.find('}') {
                let name = &rest[..end];
                if !name.is_empty()
                    && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                {
                    if !literal.is_empty() {
                        out.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    out.push(Segment::Placeholder(name.to_string()));
                    // Skip past the placeholder body and closing brace.
                    for _ in 0..=end {
                        chars.next();
                    }
                    continue;
                }
            }
        }
        literal.push(ch);
    }
    if !literal.is_empty() {
        out.push(Segment::Literal(literal));
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder(String),
}

/// Match `text` against `template`, recovering placeholder values.
///
/// Literals must appear in order; a placeholder captures everything up
/// to the next literal (or end of text). Returns `None` when the text
/// does not fit the template.
#[must_use]
pub fn match_template(template: &str, text: &str) -> Option<Variables> {
    let segs = segments(template);
    let mut vars = Variables::new();
    let mut pos = 0usize;
    let mut pending_var: Option<String> = None;

    for seg in &segs {
        match seg {
            Segment::Literal(lit) => {
                let found = text[pos..].find(lit.as_str())?;
                if let Some(name) = pending_var.take() {
                    vars.insert(name, text[pos..pos + found].to_string());
                } else if found != 0 {
                    // Literal must be flush against the previous segment.
                    return None;
                }
                pos += found + lit.len();
            }
            Segment::Placeholder(name) => {
                if pending_var.is_some() {
                    // Two placeholders with no separating literal cannot
                    // be matched unambiguously.
                    return None;
                }
                pending_var = Some(name.clone());
            }
        }
    }

    if let Some(name) = pending_var.take() {
        vars.insert(name, text[pos..].to_string());
    } else if pos != text.len() {
        return None;
    }
    Some(vars)
}

/// Render a template by substituting known placeholders. Unknown
/// placeholders are left intact so a partial variable map degrades
/// gracefully instead of erroring mid-replay.
#[must_use]
pub fn render_template(template: &str, vars: &Variables) -> String {
    let mut out = String::with_capacity(template.len());
    for seg in segments(template) {
        match seg {
            Segment::Literal(lit) => out.push_str(&lit),
            Segment::Placeholder(name) => match vars.get(&name) {
                Some(value) => out.push_str(value),
                None => {
                    out.push('{');
                    out.push_str(&name);
                    out.push('}');
                }
            },
        }
    }
    out
}

/// Render with a JSON map of variables, stringifying non-string values.
/// Used when formatting a candidate prompt with a span's `input_params`.
#[must_use]
pub fn render_with_json(template: &str, params: &serde_json::Map<String, serde_json::Value>) -> String {
    let vars: Variables = params
        .iter()
        .map(|(k, v)| {
            let rendered = match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), rendered)
        })
        .collect();
    render_template(template, &vars)
}
