//! Comment templates with `~~{Name}` placeholders.
//!
//! Placeholder names form a closed set ([`ContextField`]); a template that
//! mentions any other name is rejected when it is registered, so rendering
//! can only fail when the caller's [`CommentContext`] lacks a value.
//!
//! Rendering repeatedly replaces the leftmost placeholder and rescans the
//! whole text. Values therefore must not contain `~~{`; such values are
//! rejected instead of being substituted.

use std::collections::{BTreeMap, HashMap};

use thiserror::Error;

/// Opening marker of a placeholder token.
pub const PLACEHOLDER_OPEN: &str = "~~{";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("comment template '{0}' does not exist")]
    TemplateNotFound(String),

    #[error("comment template identifier '{0}' is already registered")]
    DuplicateIdentifier(String),

    #[error("unknown template variable '{0}'")]
    UnknownVariable(String),

    #[error("value for template variable '{name}' contains a placeholder marker")]
    PlaceholderInValue { name: String },
}

/// Names a template may substitute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ContextField {
    PrId,
    Branch,
    SourceRepoFullName,
    PrRepoAccount,
    PrRepoName,
    PrAuthor,
    BotLoginUsername,
    LinkDomain,
    AssignedPort,
    ErrorMessage,
    IdleHours,
}

impl ContextField {
    pub const ALL: [ContextField; 11] = [
        Self::PrId,
        Self::Branch,
        Self::SourceRepoFullName,
        Self::PrRepoAccount,
        Self::PrRepoName,
        Self::PrAuthor,
        Self::BotLoginUsername,
        Self::LinkDomain,
        Self::AssignedPort,
        Self::ErrorMessage,
        Self::IdleHours,
    ];

    /// The name used inside `~~{...}`.
    pub fn name(self) -> &'static str {
        match self {
            Self::PrId => "PRID",
            Self::Branch => "Branch",
            Self::SourceRepoFullName => "SourceRepoFullName",
            Self::PrRepoAccount => "PRRepoAccount",
            Self::PrRepoName => "PRRepoName",
            Self::PrAuthor => "PRAuthor",
            Self::BotLoginUsername => "BotLoginUsername",
            Self::LinkDomain => "LinkDomain",
            Self::AssignedPort => "AssignedPort",
            Self::ErrorMessage => "ErrorMessage",
            Self::IdleHours => "IdleHours",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|field| field.name() == name)
    }
}

/// Values available to a render.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommentContext {
    values: BTreeMap<ContextField, String>,
}

impl CommentContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: ContextField, value: impl ToString) -> Self {
        self.insert(field, value);
        self
    }

    pub fn insert(&mut self, field: ContextField, value: impl ToString) {
        self.values.insert(field, value.to_string());
    }

    pub fn get(&self, field: ContextField) -> Option<&str> {
        self.values.get(&field).map(String::as_str)
    }
}

/// A placeholder occurrence: byte range of the whole token and its name.
struct Placeholder<'a> {
    start: usize,
    end: usize,
    name: &'a str,
}

/// Find the leftmost `~~{name}` token. The name runs to the first `}` and
/// may not cross a line break; an unterminated opener is plain text.
fn find_placeholder(text: &str) -> Option<Placeholder<'_>> {
    let mut search_from = 0;
    while let Some(offset) = text[search_from..].find(PLACEHOLDER_OPEN) {
        let start = search_from + offset;
        let name_start = start + PLACEHOLDER_OPEN.len();
        let rest = &text[name_start..];
        match rest.find(|c: char| matches!(c, '}' | '\n' | '\r')) {
            Some(i) if rest[i..].starts_with('}') => {
                return Some(Placeholder {
                    start,
                    end: name_start + i + 1,
                    name: &rest[..i],
                });
            }
            _ => search_from = start + 1,
        }
    }
    None
}

/// Substitute every placeholder in `text` from `context`.
pub fn render(text: &str, context: &CommentContext) -> Result<String, TemplateError> {
    let mut snapshot = text.to_string();

    while let Some(Placeholder { start, end, name }) = find_placeholder(&snapshot) {
        let name = name.to_string();
        let value = ContextField::from_name(&name)
            .and_then(|field| context.get(field))
            .ok_or_else(|| TemplateError::UnknownVariable(name.clone()))?;
        if value.contains(PLACEHOLDER_OPEN) {
            return Err(TemplateError::PlaceholderInValue { name });
        }
        snapshot.replace_range(start..end, value);
    }

    Ok(snapshot)
}

/// Strip leading whitespace from every line, so templates can be written
/// with source indentation that must not reach the rendered markdown.
pub fn normalize_indentation(text: &str) -> String {
    text.split('\n')
        .map(str::trim_start)
        .collect::<Vec<_>>()
        .join("\n")
}

/// A registered template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentTemplate {
    identifier: String,
    text: String,
    fields: Vec<ContextField>,
}

impl CommentTemplate {
    /// Validate `text`, rejecting placeholders outside [`ContextField`].
    pub fn new(identifier: impl Into<String>, text: impl Into<String>) -> Result<Self, TemplateError> {
        let text = text.into();
        let mut fields = Vec::new();
        let mut rest = text.as_str();
        while let Some(placeholder) = find_placeholder(rest) {
            let field = ContextField::from_name(placeholder.name)
                .ok_or_else(|| TemplateError::UnknownVariable(placeholder.name.to_string()))?;
            if !fields.contains(&field) {
                fields.push(field);
            }
            rest = &rest[placeholder.end..];
        }
        Ok(Self {
            identifier: identifier.into(),
            text,
            fields,
        })
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Fields this template reads, in order of first use.
    pub fn fields(&self) -> &[ContextField] {
        &self.fields
    }

    pub fn build_message(&self, context: &CommentContext) -> Result<String, TemplateError> {
        render(&self.text, context)
    }
}

/// Templates keyed by identifier. Filled at startup, read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct TemplateRegistry {
    templates: HashMap<String, CommentTemplate>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        identifier: impl Into<String>,
        text: impl Into<String>,
    ) -> Result<(), TemplateError> {
        let template = CommentTemplate::new(identifier, text)?;
        if self.templates.contains_key(template.identifier()) {
            return Err(TemplateError::DuplicateIdentifier(
                template.identifier().to_string(),
            ));
        }
        self.templates
            .insert(template.identifier().to_string(), template);
        Ok(())
    }

    /// Register a template written with source indentation; leading
    /// whitespace per line and surrounding blank lines are dropped.
    pub fn register_indented(
        &mut self,
        identifier: impl Into<String>,
        text: &str,
    ) -> Result<(), TemplateError> {
        let normalized = normalize_indentation(text);
        self.register(identifier, normalized.trim())
    }

    pub fn get(&self, identifier: &str) -> Option<&CommentTemplate> {
        self.templates.get(identifier)
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.templates.contains_key(identifier)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub fn build_message(
        &self,
        identifier: &str,
        context: &CommentContext,
    ) -> Result<String, TemplateError> {
        self.get(identifier)
            .ok_or_else(|| TemplateError::TemplateNotFound(identifier.to_string()))?
            .build_message(context)
    }
}
