//! Compiled path expressions.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;

use regex::{Captures, Regex, RegexBuilder};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::PathExpressionError;

use super::parser::{
    full_match_regex, path_body_regex, rooted_body_regex, split_criteria, PathAst, PathParser, Separator, SnsConstraint, StepNode,
};

/// One piece of a select template used for `$n` substitution.
#[derive(Debug, Clone, PartialEq, Eq)]
enum TemplatePart {
    Literal(String),
    Group(usize),
}

/// A compiled routing rule.
///
/// The text has the form `select[criteria]`. The criteria decides whether a
/// changed path matches; the select path decides which node receives the
/// output. Without a criteria the select path is the criteria too, and the
/// output node is the changed node itself.
///
/// | Syntax        | Meaning                                                   |
/// |---------------|-----------------------------------------------------------|
/// | `/a`          | child step named `a` (names compare case-insensitively)   |
/// | `//`          | zero or more intermediate steps                           |
/// | `*`           | any single name                                           |
/// | `(a\|b\|)`    | alternation; an empty branch makes the step optional      |
/// | `a[]`         | `a` without a same-name-sibling index                     |
/// | `a[*]`        | `a` with some index                                       |
/// | `a[1,3]`      | `a[1]` or `a[3]`; listing `0` also allows no index        |
/// | `@p`          | the property `p` of the preceding node                    |
/// | `$n`          | text captured by the n-th criteria group (select only)    |
///
/// # Examples
///
/// ```
/// use sequencing::PathExpression;
///
/// let expr = PathExpression::compile("/a//d[@title]").unwrap();
/// assert_eq!(expr.matches("/a/x/d/@title").as_deref(), Some("/a/x/d"));
///
/// let expr = PathExpression::compile("/out/$1[/src/(x/y)]").unwrap();
/// assert_eq!(expr.matches("/src/x/y").as_deref(), Some("/out/x/y"));
/// assert_eq!(expr.matches("/src/x/z"), None);
/// ```
#[derive(Debug, Clone)]
pub struct PathExpression {
    text: String,
    select_text: String,
    criteria_text: Option<String>,
    criteria: Regex,
    select: Regex,
    criteria_is_select: bool,
    criteria_is_absolute: bool,
    template: Option<Vec<TemplatePart>>,
    matches_anything: bool,
}

impl PathExpression {
    /// Compiles an expression.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPathExpression` when the text is blank or does not
    /// conform to the grammar.
    pub fn compile(text: impl Into<String>) -> Result<Self, PathExpressionError> {
        let text = text.into();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(PathExpressionError::invalid(&text, "path expression may not be blank"));
        }

        let (select_text, criteria_text) = split_criteria(&text, trimmed)?;
        let select_ast = PathParser::new(&text, select_text, true).parse()?;

        let Some(criteria_text) = criteria_text else {
            if select_ast.max_reference().is_some() {
                return Err(PathExpressionError::invalid(&text, "'$' references require an absolute criteria"));
            }
            let criteria = build_regex(&text, &full_match_regex(&select_ast))?;
            return Ok(Self {
                matches_anything: accepts_every_path(&select_ast),
                select_text: select_text.trim().to_string(),
                select: criteria.clone(),
                criteria,
                text,
                criteria_text: None,
                criteria_is_select: true,
                criteria_is_absolute: true,
                template: None,
            });
        };

        let criteria_ast = PathParser::new(&text, criteria_text, false).parse()?;
        let criteria_is_absolute = criteria_ast.is_absolute();

        let (criteria, select, template) = if criteria_is_absolute {
            if let Some(max) = select_ast.max_reference() {
                let groups = criteria_ast.group_count();
                if max > groups {
                    return Err(PathExpressionError::invalid(
                        &text,
                        format!("select references ${max} but the criteria has {groups} group(s)"),
                    ));
                }
            }
            let criteria = build_regex(&text, &full_match_regex(&criteria_ast))?;
            let select = build_regex(&text, &format!("^(?P<select>{})/", rooted_body_regex(&select_ast)))?;
            (criteria, select, select_template(&select_ast))
        } else {
            if select_ast.max_reference().is_some() {
                return Err(PathExpressionError::invalid(&text, "'$' references require an absolute criteria"));
            }
            let anchored = select_ast.join(&criteria_ast);
            let criteria = build_regex(&text, &full_match_regex(&anchored))?;
            let select = build_regex(&text, &anchored_select_regex(&select_ast, &anchored))?;
            (criteria, select, None)
        };

        Ok(Self {
            select_text: select_text.trim().to_string(),
            criteria_text: Some(criteria_text.to_string()),
            text,
            criteria,
            select,
            criteria_is_select: false,
            criteria_is_absolute,
            template,
            matches_anything: false,
        })
    }

    /// The expression that matches every path, `//`.
    #[must_use]
    pub fn all() -> &'static PathExpression {
        static ALL: OnceLock<PathExpression> = OnceLock::new();
        ALL.get_or_init(|| PathExpression::compile("//").expect("'//' is a valid path expression"))
    }

    /// The text this expression was compiled from.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// The select portion of the text.
    #[must_use]
    pub fn select_text(&self) -> &str {
        &self.select_text
    }

    /// The criteria portion of the text, if one was given.
    #[must_use]
    pub fn criteria_text(&self) -> Option<&str> {
        self.criteria_text.as_deref()
    }

    /// Whether the criteria is evaluated independently of the select path.
    #[must_use]
    pub const fn criteria_is_absolute(&self) -> bool {
        self.criteria_is_absolute
    }

    /// True when every path, the root included, satisfies this expression.
    #[must_use]
    pub const fn matches_anything(&self) -> bool {
        self.matches_anything
    }

    /// Matches a changed node's absolute path.
    ///
    /// Returns the absolute path of the node that should receive output, or
    /// `None` when the path does not satisfy the expression.
    #[must_use]
    pub fn matches(&self, absolute_path: &str) -> Option<String> {
        let input = absolute_path.trim();
        let normalized = format!("{}/", input.trim_end_matches('/'));

        let criteria = self.criteria.captures(&normalized)?;
        if self.criteria_is_select {
            return Some(strip_trailing(input));
        }
        if let Some(selected) = self.select.captures(&normalized).and_then(|c| c.name("select")) {
            return Some(strip_trailing(selected.as_str()));
        }
        if self.criteria_is_absolute {
            return self.substitute(&criteria);
        }
        None
    }

    /// True when [`matches`](Self::matches) would return a path.
    #[must_use]
    pub fn is_match(&self, absolute_path: &str) -> bool {
        self.matches(absolute_path).is_some()
    }

    fn substitute(&self, captures: &Captures<'_>) -> Option<String> {
        let template = self.template.as_ref()?;
        let mut out = String::new();
        for part in template {
            out.push('/');
            match part {
                TemplatePart::Literal(text) => out.push_str(text),
                TemplatePart::Group(n) => {
                    out.push_str(captures.get(*n).map_or("", |m| m.as_str()));
                }
            }
        }
        Some(normalize_output(&out))
    }
}

fn build_regex(expression: &str, pattern: &str) -> Result<Regex, PathExpressionError> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|e| PathExpressionError::invalid(expression, format!("unable to compile pattern: {e}")))
}

/// Select regex for a relative criteria: the anchored path with the select
/// steps wrapped in the `select` group, so the selected prefix is the one the
/// criteria actually matched.
fn anchored_select_regex(select: &PathAst, anchored: &PathAst) -> String {
    let mut head = anchored.clone();
    let mut tail_steps = head.steps.split_off(select.steps.len());
    head.trailing_descendant = false;

    let mut head_regex = rooted_body_regex(&head);
    if select.trailing_descendant {
        head_regex.push_str(r"(?:/[^/]+)*?");
        if let Some(first) = tail_steps.first_mut() {
            first.sep = Separator::Child;
        }
    }
    let tail = PathAst {
        leading_slash: false,
        steps: tail_steps,
        trailing_descendant: anchored.trailing_descendant,
    };
    format!("^(?P<select>{head_regex}){}/$", path_body_regex(&tail))
}

/// A select path usable for substitution: literal names, exact indexes and
/// `$n` references joined by `/`.
fn select_template(select: &PathAst) -> Option<Vec<TemplatePart>> {
    if select.trailing_descendant {
        return None;
    }
    let mut parts = Vec::with_capacity(select.steps.len());
    for (i, step) in select.steps.iter().enumerate() {
        let leading_ok = matches!(step.sep, Separator::Child) || (i == 0 && step.sep == Separator::None);
        if !leading_ok {
            return None;
        }
        let index = match &step.sns {
            None | Some(SnsConstraint::Forbidden) => String::new(),
            Some(SnsConstraint::OneOf { indexes, optional: false }) if indexes.len() == 1 => {
                format!("[{}]", indexes[0])
            }
            Some(_) => return None,
        };
        match &step.node {
            StepNode::Name(name) => parts.push(TemplatePart::Literal(format!("{name}{index}"))),
            StepNode::Reference(n) if index.is_empty() => parts.push(TemplatePart::Group(*n)),
            _ => return None,
        }
    }
    Some(parts)
}

/// Only a bare descendant separator accepts the root as well as every other
/// path; `*` and `//*` need at least one step.
fn accepts_every_path(select: &PathAst) -> bool {
    select.steps.is_empty() && select.trailing_descendant
}

fn strip_trailing(path: &str) -> String {
    let stripped = path.trim_end_matches('/');
    if stripped.is_empty() {
        "/".to_string()
    } else {
        stripped.to_string()
    }
}

fn normalize_output(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for c in path.chars() {
        if c == '/' && out.ends_with('/') {
            continue;
        }
        out.push(c);
    }
    strip_trailing(&out)
}

impl PartialEq for PathExpression {
    fn eq(&self, other: &Self) -> bool {
        self.text.trim() == other.text.trim()
    }
}

impl Eq for PathExpression {}

impl Hash for PathExpression {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.text.trim().hash(state);
    }
}

impl fmt::Display for PathExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl std::str::FromStr for PathExpression {
    type Err = PathExpressionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::compile(s)
    }
}

impl Serialize for PathExpression {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.text)
    }
}

impl<'de> Deserialize<'de> for PathExpression {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::compile(text).map_err(serde::de::Error::custom)
    }
}
