//! Parser for the path-expression mini-language.
//!
//! Expression text is split into a select path and an optional criteria path,
//! each parsed into a small AST. The AST is then lowered to `regex` pattern
//! text by the `*_regex` functions at the bottom of this module.

use crate::error::PathExpressionError;

/// Separator preceding a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Separator {
    /// First step of a relative path or group branch.
    None,
    /// `/`: exactly one step.
    Child,
    /// `//`: zero or more intermediate steps.
    Descendant,
}

/// Same-name-sibling index constraint attached to a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SnsConstraint {
    /// `[]`: the node must not carry an index.
    Forbidden,
    /// `[*]`: the node must carry some index.
    Required,
    /// `[n1,n2,...]`: one of the listed indexes; `optional` when `0` was listed.
    OneOf { indexes: Vec<u32>, optional: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StepNode {
    Name(String),
    Wildcard,
    /// Name containing `*`, each matching any run of name characters.
    Glob(String),
    /// Capturing group; `index` is the 1-based position of its opening parenthesis.
    Group {
        index: usize,
        branches: Vec<PathAst>,
        optional: bool,
    },
    /// `$n` reference to a criteria group, only legal in a select template.
    Reference(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Step {
    pub sep: Separator,
    pub node: StepNode,
    pub sns: Option<SnsConstraint>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct PathAst {
    /// Text began with at least one `/`.
    pub leading_slash: bool,
    pub steps: Vec<Step>,
    /// Text ended with `//`.
    pub trailing_descendant: bool,
}

impl PathAst {
    /// True when the path is anchored at the root.
    ///
    /// A path that starts with a group is absolute when every branch of that
    /// group is.
    pub fn is_absolute(&self) -> bool {
        if self.leading_slash {
            return true;
        }
        match self.steps.first() {
            Some(Step {
                node: StepNode::Group { branches, .. },
                ..
            }) => !branches.is_empty() && branches.iter().all(PathAst::is_absolute),
            _ => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty() && !self.leading_slash && !self.trailing_descendant
    }

    pub fn group_count(&self) -> usize {
        self.steps
            .iter()
            .map(|step| match &step.node {
                StepNode::Group { branches, .. } => {
                    1 + branches.iter().map(PathAst::group_count).sum::<usize>()
                }
                _ => 0,
            })
            .sum()
    }

    pub fn max_reference(&self) -> Option<usize> {
        self.steps
            .iter()
            .filter_map(|step| match &step.node {
                StepNode::Reference(n) => Some(*n),
                StepNode::Group { branches, .. } => {
                    branches.iter().filter_map(PathAst::max_reference).max()
                }
                _ => None,
            })
            .max()
    }

    /// Appends a relative path below this one, as used to anchor a relative criteria.
    pub fn join(&self, relative: &PathAst) -> PathAst {
        let mut joined = self.clone();
        let first_sep = if self.trailing_descendant {
            Separator::Descendant
        } else {
            Separator::Child
        };
        joined.trailing_descendant = relative.trailing_descendant;
        for (i, step) in relative.steps.iter().enumerate() {
            let mut step = step.clone();
            if i == 0 {
                step.sep = match step.sep {
                    Separator::None | Separator::Child => first_sep,
                    Separator::Descendant => Separator::Descendant,
                };
            }
            joined.steps.push(step);
        }
        if relative.steps.is_empty() && self.trailing_descendant {
            joined.trailing_descendant = true;
        }
        joined
    }
}

/// Splits `text` into its select text and optional criteria text.
///
/// The criteria is the final top-level bracket group, provided its contents
/// are not a same-name-sibling constraint.
pub(crate) fn split_criteria<'a>(
    expression: &str,
    text: &'a str,
) -> Result<(&'a str, Option<&'a str>), PathExpressionError> {
    if !text.ends_with(']') {
        return Ok((text, None));
    }
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut open = None;
    for i in (0..bytes.len()).rev() {
        match bytes[i] {
            b']' => depth += 1,
            b'[' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| PathExpressionError::invalid(expression, "unbalanced '['"))?;
                if depth == 0 {
                    open = Some(i);
                    break;
                }
            }
            _ => {}
        }
    }
    let open = open.ok_or_else(|| PathExpressionError::invalid(expression, "unbalanced ']'"))?;
    let content = &text[open + 1..text.len() - 1];
    if is_sns_text(content) {
        return Ok((text, None));
    }
    let select = &text[..open];
    if select.trim().is_empty() {
        return Err(PathExpressionError::invalid(expression, "missing select path before criteria"));
    }
    let criteria = content.trim();
    if criteria.is_empty() {
        return Err(PathExpressionError::invalid(expression, "criteria may not be blank"));
    }
    Ok((select, Some(criteria)))
}

fn is_sns_text(content: &str) -> bool {
    let content = content.trim();
    content.is_empty()
        || content == "*"
        || content
            .split(',')
            .all(|part| !part.trim().is_empty() && part.trim().bytes().all(|b| b.is_ascii_digit()))
}

const RESERVED: &[char] = &['/', '[', ']', '(', ')', '|', '*', '$'];

/// Recursive-descent parser over one path text.
pub(crate) struct PathParser<'a> {
    expression: &'a str,
    chars: Vec<char>,
    pos: usize,
    next_group: usize,
    allow_references: bool,
}

impl<'a> PathParser<'a> {
    /// `expression` is the full text, used only for error messages.
    pub fn new(expression: &'a str, text: &str, allow_references: bool) -> Self {
        Self {
            expression,
            chars: text.trim().chars().collect(),
            pos: 0,
            next_group: 0,
            allow_references,
        }
    }

    pub fn parse(mut self) -> Result<PathAst, PathExpressionError> {
        let path = self.parse_path(0)?;
        if self.pos < self.chars.len() {
            return Err(self.error(format!("unexpected '{}'", self.chars[self.pos])));
        }
        if path.is_empty() {
            return Err(self.error("path may not be empty"));
        }
        Ok(path)
    }

    fn error(&self, reason: impl Into<String>) -> PathExpressionError {
        PathExpressionError::invalid(self.expression, reason)
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn at_path_end(&self, depth: usize) -> bool {
        match self.peek() {
            None => true,
            Some('|' | ')') => depth > 0,
            Some(_) => false,
        }
    }

    fn count_slashes(&mut self) -> usize {
        let start = self.pos;
        while self.peek() == Some('/') {
            self.pos += 1;
        }
        self.pos - start
    }

    fn parse_path(&mut self, depth: usize) -> Result<PathAst, PathExpressionError> {
        let mut path = PathAst::default();
        loop {
            let slashes = self.count_slashes();
            if path.steps.is_empty() && slashes > 0 {
                path.leading_slash = true;
            }
            if self.at_path_end(depth) {
                if slashes >= 2 {
                    path.trailing_descendant = true;
                }
                return Ok(path);
            }
            let sep = match slashes {
                0 if path.steps.is_empty() => Separator::None,
                0 => return Err(self.error(format!("expected '/' before '{}'", self.chars[self.pos]))),
                1 => Separator::Child,
                _ => Separator::Descendant,
            };
            let step = self.parse_step(sep, depth)?;
            path.steps.push(step);
        }
    }

    fn parse_step(&mut self, sep: Separator, depth: usize) -> Result<Step, PathExpressionError> {
        let node = match self.peek() {
            Some('(') => self.parse_group(depth)?,
            Some('$') => self.parse_reference()?,
            Some(c) if c.is_whitespace() => return Err(self.error("whitespace is not allowed in a path")),
            Some(c) if c != '*' && RESERVED.contains(&c) => return Err(self.error(format!("unexpected '{c}'"))),
            Some(_) => {
                let name = self.parse_name();
                if name == "*" {
                    StepNode::Wildcard
                } else if name.contains('*') {
                    StepNode::Glob(name)
                } else {
                    StepNode::Name(name)
                }
            }
            None => return Err(self.error("unexpected end of expression")),
        };
        let sns = if self.peek() == Some('[') {
            Some(self.parse_sns()?)
        } else {
            None
        };
        if self.peek() == Some('[') {
            return Err(self.error("only one index constraint is allowed per step"));
        }
        match self.peek() {
            None | Some('/' | '|' | ')') => {}
            Some(c) => return Err(self.error(format!("unexpected '{c}' after step"))),
        }

        // An index constraint on a group applies to the last step of each branch.
        if let (Some(constraint), StepNode::Group { branches, index, optional }) = (&sns, &node) {
            let mut branches = branches.clone();
            for branch in &mut branches {
                if let Some(last) = branch.steps.last_mut() {
                    if last.sns.is_none() {
                        last.sns = Some(constraint.clone());
                    }
                }
            }
            return Ok(Step {
                sep,
                node: StepNode::Group {
                    index: *index,
                    branches,
                    optional: *optional,
                },
                sns: None,
            });
        }
        Ok(Step { sep, node, sns })
    }

    fn parse_name(&mut self) -> String {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if (c != '*' && RESERVED.contains(&c)) || c.is_whitespace() {
                break;
            }
            self.pos += 1;
        }
        self.chars[start..self.pos].iter().collect()
    }

    fn parse_reference(&mut self) -> Result<StepNode, PathExpressionError> {
        if !self.allow_references {
            return Err(self.error("'$' references are only allowed in the select path"));
        }
        self.pos += 1;
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
        }
        let digits: String = self.chars[start..self.pos].iter().collect();
        match digits.parse::<usize>() {
            Ok(n) if n >= 1 => Ok(StepNode::Reference(n)),
            _ => Err(self.error("'$' must be followed by a group number starting at 1")),
        }
    }

    fn parse_group(&mut self, depth: usize) -> Result<StepNode, PathExpressionError> {
        self.pos += 1;
        self.next_group += 1;
        let index = self.next_group;
        let mut raw = Vec::new();
        loop {
            raw.push(self.parse_path(depth + 1)?);
            match self.peek() {
                Some('|') => self.pos += 1,
                Some(')') => {
                    self.pos += 1;
                    break;
                }
                _ => return Err(self.error("unbalanced '('")),
            }
        }

        // Leading or trailing empty branches make the group optional; empty
        // branches in between are simply collapsed.
        let optional = raw.first().is_some_and(PathAst::is_empty) || raw.last().is_some_and(PathAst::is_empty);
        let branches: Vec<PathAst> = raw.into_iter().filter(|b| !b.is_empty()).collect();
        if branches.is_empty() {
            return Err(self.error("group must contain at least one non-empty branch"));
        }
        let absolute = branches.iter().filter(|b| b.is_absolute()).count();
        if absolute != 0 && absolute != branches.len() {
            return Err(self.error("group branches must be all absolute or all relative"));
        }
        Ok(StepNode::Group {
            index,
            branches,
            optional,
        })
    }

    fn parse_sns(&mut self) -> Result<SnsConstraint, PathExpressionError> {
        self.pos += 1;
        let start = self.pos;
        while self.peek().is_some_and(|c| c != ']') {
            self.pos += 1;
        }
        if self.peek() != Some(']') {
            return Err(self.error("unbalanced '['"));
        }
        let content: String = self.chars[start..self.pos].iter().collect();
        self.pos += 1;
        parse_sns_content(&content).ok_or_else(|| {
            self.error(format!("'[{content}]' is not a same-name-sibling index constraint"))
        })
    }
}

/// Parses the contents of `[...]` following a step.
pub(crate) fn parse_sns_content(content: &str) -> Option<SnsConstraint> {
    let content = content.trim();
    if content.is_empty() {
        return Some(SnsConstraint::Forbidden);
    }
    if content == "*" {
        return Some(SnsConstraint::Required);
    }
    let mut indexes = Vec::new();
    let mut optional = false;
    for part in content.split(',') {
        let n: u32 = part.trim().parse().ok()?;
        if n == 0 {
            optional = true;
        }
        if !indexes.contains(&n) {
            indexes.push(n);
        }
    }
    Some(SnsConstraint::OneOf { indexes, optional })
}

/// Regex for any single node name (without its index).
const ANY_NAME: &str = r"[^/\[]+";
/// Regex for "zero or more intermediate steps", excluding the final separator.
const ANY_DEPTH: &str = r"(?:/[^/]+)*?";

/// Regex fragment for an index constraint.
pub(crate) fn sns_regex(sns: Option<&SnsConstraint>) -> String {
    match sns {
        None => r"(?:\[\d+\])?".to_string(),
        Some(SnsConstraint::Forbidden) => String::new(),
        Some(SnsConstraint::Required) => r"\[\d+\]".to_string(),
        Some(SnsConstraint::OneOf { indexes, optional }) => {
            let alternatives = indexes.iter().map(u32::to_string).collect::<Vec<_>>().join("|");
            let required = if indexes.len() == 1 {
                format!(r"\[{alternatives}\]")
            } else {
                format!(r"\[(?:{alternatives})\]")
            };
            if *optional {
                format!("(?:{required})?")
            } else {
                required
            }
        }
    }
}

/// Regex fragment for a separator; `consumed` strips the leading `/` that an
/// optional first step has already absorbed.
pub(crate) fn separator_regex(sep: Separator, consumed: bool) -> String {
    match (sep, consumed) {
        (Separator::None, _) | (Separator::Child, true) => String::new(),
        (Separator::Child, false) => "/".to_string(),
        (Separator::Descendant, false) => format!("{ANY_DEPTH}/"),
        (Separator::Descendant, true) => r"(?:[^/]+/)*?".to_string(),
    }
}

fn node_regex(step: &Step) -> String {
    let name = match &step.node {
        StepNode::Name(name) => regex::escape(name),
        StepNode::Wildcard => ANY_NAME.to_string(),
        StepNode::Glob(glob) => glob.split('*').map(regex::escape).collect::<Vec<_>>().join(r"[^/\[]*"),
        StepNode::Reference(n) => regex::escape(&format!("${n}")),
        StepNode::Group { branches, .. } => {
            let alternatives: Vec<String> = branches.iter().map(path_body_regex).collect();
            return format!("({})", alternatives.join("|"));
        }
    };
    format!("{name}{}", sns_regex(step.sns.as_ref()))
}

fn is_optional(step: &Step) -> bool {
    matches!(step.node, StepNode::Group { optional: true, .. })
}

fn has_relative_branches(step: &Step) -> bool {
    matches!(&step.node, StepNode::Group { branches, .. } if !branches.iter().any(PathAst::is_absolute))
}

/// Lowers a path to regex text without anchors or the final separator.
pub(crate) fn path_body_regex(path: &PathAst) -> String {
    let mut out = String::new();
    let mut consumed = false;
    let count = path.steps.len();
    for (i, step) in path.steps.iter().enumerate() {
        let node = node_regex(step);
        if is_optional(step) {
            match step.sep {
                Separator::Child => out.push_str(&format!("(?:/{node})?")),
                Separator::Descendant => out.push_str(&format!("{ANY_DEPTH}(?:/{node})?")),
                Separator::None if i + 1 < count && has_relative_branches(step) => {
                    out.push_str(&format!("(?:{node}/)?"));
                    consumed = true;
                    continue;
                }
                Separator::None => out.push_str(&format!("(?:{node})?")),
            }
        } else {
            out.push_str(&separator_regex(step.sep, consumed));
            out.push_str(&node);
        }
        consumed = false;
    }
    if path.trailing_descendant {
        out.push_str("(?:/[^/]+)*");
    }
    out
}

/// Lowers a top-level path; relative paths may start at any depth.
pub(crate) fn rooted_body_regex(path: &PathAst) -> String {
    if path.is_absolute() {
        return path_body_regex(path);
    }
    let mut rooted = path.clone();
    if let Some(first) = rooted.steps.first_mut() {
        first.sep = Separator::Descendant;
    }
    path_body_regex(&rooted)
}

/// Full anchored regex text matching a normalised (slash-terminated) path.
pub(crate) fn full_match_regex(path: &PathAst) -> String {
    format!("^{}/$", rooted_body_regex(path))
}
