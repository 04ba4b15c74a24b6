//! Story-string template rendering.
//!
//! The story string is the prompt header built from card fields. Templates use
//! a small Handlebars subset:
//!
//! - `{{key}}` inserts a parameter
//! - `{{#if key}}...{{else}}...{{/if}}` renders a branch when the parameter is
//!   non-blank (blocks nest)
//!
//! Placeholders the parameters don't define are kept verbatim so the macro
//! pass that follows can still expand them.

use std::collections::BTreeMap;

/// Named values available to the template.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoryParams {
    values: BTreeMap<String, String>,
}

impl StoryParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a parameter (builder style).
    pub fn set(mut self, key: &str, value: impl Into<String>) -> Self {
        self.values.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    fn is_truthy(&self, key: &str) -> bool {
        self.get(key).is_some_and(|v| !v.trim().is_empty())
    }
}

// ── Parsing ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Text(String),
    Var(String),
    If {
        key: String,
        then: Vec<Node>,
        otherwise: Vec<Node>,
    },
}

struct Frame {
    key: String,
    then: Vec<Node>,
    otherwise: Vec<Node>,
    in_else: bool,
}

impl Frame {
    fn push(&mut self, node: Node) {
        if self.in_else {
            self.otherwise.push(node);
        } else {
            self.then.push(node);
        }
    }

    fn into_node(self) -> Node {
        Node::If {
            key: self.key,
            then: self.then,
            otherwise: self.otherwise,
        }
    }
}

fn parse(template: &str) -> Vec<Node> {
    let mut root = Frame {
        key: String::new(),
        then: Vec::new(),
        otherwise: Vec::new(),
        in_else: false,
    };
    let mut stack: Vec<Frame> = Vec::new();
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        let Some(close) = rest[open..].find("}}").map(|c| open + c) else {
            break;
        };
        if open > 0 {
            stack
                .last_mut()
                .unwrap_or(&mut root)
                .push(Node::Text(rest[..open].to_string()));
        }

        let tag = &rest[open + 2..close];
        let trimmed = tag.trim();
        if let Some(key) = trimmed.strip_prefix("#if ") {
            stack.push(Frame {
                key: key.trim().to_string(),
                then: Vec::new(),
                otherwise: Vec::new(),
                in_else: false,
            });
        } else if trimmed == "else" && !stack.is_empty() {
            if let Some(frame) = stack.last_mut() {
                frame.in_else = true;
            }
        } else if trimmed == "/if" && !stack.is_empty() {
            if let Some(frame) = stack.pop() {
                let node = frame.into_node();
                stack.last_mut().unwrap_or(&mut root).push(node);
            }
        } else {
            stack
                .last_mut()
                .unwrap_or(&mut root)
                .push(Node::Var(tag.to_string()));
        }

        rest = &rest[close + 2..];
    }

    if !rest.is_empty() {
        stack
            .last_mut()
            .unwrap_or(&mut root)
            .push(Node::Text(rest.to_string()));
    }

    // unclosed blocks close at end of input
    while let Some(frame) = stack.pop() {
        let node = frame.into_node();
        stack.last_mut().unwrap_or(&mut root).push(node);
    }

    root.then
}

fn render_nodes(nodes: &[Node], params: &StoryParams, out: &mut String) {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Var(raw) => match params.get(raw.trim()) {
                Some(value) => out.push_str(value),
                None => {
                    out.push_str("{{");
                    out.push_str(raw);
                    out.push_str("}}");
                }
            },
            Node::If {
                key,
                then,
                otherwise,
            } => {
                let branch = if params.is_truthy(key) { then } else { otherwise };
                render_nodes(branch, params, out);
            }
        }
    }
}

// ── Rendering ────────────────────────────────────────────────────────────

/// Render a template against `params`.
pub fn render_template(template: &str, params: &StoryParams) -> String {
    let mut out = String::with_capacity(template.len());
    render_nodes(&parse(template), params, &mut out);
    out
}

/// Render the story string: leading newlines removed, trailing newline ensured.
pub fn render_story_string(template: &str, params: &StoryParams) -> String {
    let rendered = render_template(template, params);
    let mut story = rendered.trim_start_matches(['\r', '\n']).to_string();
    if !story.is_empty() && !story.ends_with('\n') {
        story.push('\n');
    }
    story
}
