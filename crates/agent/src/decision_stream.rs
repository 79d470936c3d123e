//! Incremental parser turning a model's token stream into a PlannerDecision.
//!
//! The parser is a character-level state machine over the top-level decision
//! object. It keeps only the raw text of the value currently being read; as
//! soon as a top-level value closes, that text is parsed once with
//! `serde_json` and reported through [`DecisionStream::feed`]. Nothing is ever
//! re-parsed from the start of the stream.
//!
//! ```text
//! Start ─{─▶ AwaitingKey ─"─▶ InKey ─"─▶ AwaitingColon ─:─▶ AwaitingValue
//!              ▲                                               │
//!              └──────────,────── AfterValue ◀── InValue ◀─────┘
//!                                     │
//!                                     └─}─▶ Closed
//! ```

use metricchat_core::{ClosedField, ContextSnapshot, ParseError, PartialUpdate, PlannerDecision};
use serde_json::Value;
use std::sync::Arc;

/// What kind of top-level value is being scanned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueKind {
    /// Object or array; ends when nesting returns to zero.
    Composite,
    /// A string; ends at the closing quote.
    Text,
    /// Number or literal; ends at the first delimiter.
    Scalar,
}

#[derive(Debug, Clone, PartialEq)]
enum State {
    Start,
    AwaitingKey { first: bool },
    InKey { escaped: bool },
    AwaitingColon,
    AwaitingValue,
    InValue {
        kind: ValueKind,
        depth: usize,
        in_string: bool,
        escaped: bool,
    },
    AfterValue,
    Closed,
    Failed(ParseError),
}

/// One in-progress decision parse.
pub struct DecisionStream {
    state: State,
    context: Option<Arc<ContextSnapshot>>,
    key: String,
    value: String,
    fields: Vec<(String, Value)>,
    /// Characters consumed so far.
    offset: usize,
    tokens: u64,
}

impl DecisionStream {
    /// Start parsing a decision made against `context`.
    pub fn begin(context: Arc<ContextSnapshot>) -> Self {
        Self {
            context: Some(context),
            ..Self::new()
        }
    }

    /// A stream with no associated context snapshot.
    pub fn new() -> Self {
        Self {
            state: State::Start,
            context: None,
            key: String::new(),
            value: String::new(),
            fields: Vec::new(),
            offset: 0,
            tokens: 0,
        }
    }

    pub fn context(&self) -> Option<&Arc<ContextSnapshot>> {
        self.context.as_ref()
    }

    /// Number of tokens fed so far.
    pub fn tokens(&self) -> u64 {
        self.tokens
    }

    /// The stream hit a syntax error; further input is ignored.
    pub fn is_failed(&self) -> bool {
        matches!(self.state, State::Failed(_))
    }

    /// The decision object has closed.
    pub fn is_closed(&self) -> bool {
        matches!(self.state, State::Closed)
    }

    /// Consume one token. Returns the fields that closed within it, if any.
    pub fn feed(&mut self, token: &str) -> Option<PartialUpdate> {
        self.tokens += 1;
        let mut update = PartialUpdate::default();
        for c in token.chars() {
            if self.is_failed() {
                break;
            }
            self.step(c, &mut update);
            self.offset += 1;
        }
        (!update.is_empty()).then_some(update)
    }

    /// End of stream: the complete decision or why there is none.
    pub fn finish(self) -> Result<PlannerDecision, ParseError> {
        match self.state {
            State::Failed(err) => Err(err),
            State::Start => Err(ParseError::Empty),
            State::Closed => PlannerDecision::from_fields(
                self.fields.iter().map(|(name, value)| (name.as_str(), value)),
            ),
            State::InValue { kind, depth, .. } => Err(ParseError::Unterminated {
                depth: 1 + if kind == ValueKind::Composite { depth } else { 0 },
            }),
            _ => Err(ParseError::Unterminated { depth: 1 }),
        }
    }

    fn step(&mut self, c: char, update: &mut PartialUpdate) {
        match self.state.clone() {
            State::Start => match c {
                c if c.is_whitespace() => {}
                '{' => self.state = State::AwaitingKey { first: true },
                _ => self.fail(format!("expected '{{' to open the decision, found {c:?}")),
            },
            State::AwaitingKey { first } => match c {
                c if c.is_whitespace() => {}
                '"' => {
                    self.key.clear();
                    self.state = State::InKey { escaped: false };
                }
                '}' if first => self.state = State::Closed,
                _ => self.fail(format!("expected a field name, found {c:?}")),
            },
            State::InKey { escaped } => {
                if c == '"' && !escaped {
                    self.state = State::AwaitingColon;
                } else {
                    self.key.push(c);
                    self.state = State::InKey {
                        escaped: c == '\\' && !escaped,
                    };
                }
            }
            State::AwaitingColon => match c {
                c if c.is_whitespace() => {}
                ':' => self.state = State::AwaitingValue,
                _ => self.fail(format!("expected ':' after a field name, found {c:?}")),
            },
            State::AwaitingValue => {
                let kind = match c {
                    c if c.is_whitespace() => return,
                    '{' | '[' => ValueKind::Composite,
                    '"' => ValueKind::Text,
                    '-' | '0'..='9' | 't' | 'f' | 'n' => ValueKind::Scalar,
                    _ => return self.fail(format!("expected a value, found {c:?}")),
                };
                self.value.clear();
                self.value.push(c);
                self.state = State::InValue {
                    kind,
                    depth: usize::from(kind == ValueKind::Composite),
                    in_string: kind == ValueKind::Text,
                    escaped: false,
                };
            }
            State::InValue {
                kind,
                depth,
                in_string,
                escaped,
            } => self.scan_value(c, kind, depth, in_string, escaped, update),
            State::AfterValue => match c {
                c if c.is_whitespace() => {}
                ',' => self.state = State::AwaitingKey { first: false },
                '}' => self.state = State::Closed,
                _ => self.fail(format!("expected ',' or '}}' after a value, found {c:?}")),
            },
            State::Closed => {
                if !c.is_whitespace() {
                    self.state = State::Failed(ParseError::TrailingContent {
                        offset: self.offset,
                    });
                }
            }
            State::Failed(_) => {}
        }
    }

    fn scan_value(
        &mut self,
        c: char,
        kind: ValueKind,
        mut depth: usize,
        mut in_string: bool,
        mut escaped: bool,
        update: &mut PartialUpdate,
    ) {
        if kind == ValueKind::Scalar {
            if c.is_whitespace() || c == ',' || c == '}' {
                self.close_value(update);
                // The delimiter belongs to the object, not the scalar.
                if !self.is_failed() {
                    self.step(c, update);
                }
            } else {
                self.value.push(c);
            }
            return;
        }

        self.value.push(c);
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
                if kind == ValueKind::Text {
                    return self.close_value(update);
                }
            }
        } else {
            match c {
                '"' => in_string = true,
                '{' | '[' => depth += 1,
                '}' | ']' => {
                    depth -= 1;
                    if depth == 0 {
                        return self.close_value(update);
                    }
                }
                _ => {}
            }
        }
        self.state = State::InValue {
            kind,
            depth,
            in_string,
            escaped,
        };
    }

    fn close_value(&mut self, update: &mut PartialUpdate) {
        let name = match serde_json::from_str::<String>(&format!("\"{}\"", self.key)) {
            Ok(name) => name,
            Err(e) => return self.fail(format!("invalid field name: {e}")),
        };
        let value = match serde_json::from_str::<Value>(&self.value) {
            Ok(value) => value,
            Err(e) => return self.fail(format!("invalid value for '{name}': {e}")),
        };
        if self.fields.iter().any(|(existing, _)| *existing == name) {
            return self.fail(format!("duplicate field '{name}'"));
        }

        update.fields.push(ClosedField {
            name: name.clone(),
            value: value.clone(),
        });
        self.fields.push((name, value));
        self.value.clear();
        self.state = State::AfterValue;
    }

    fn fail(&mut self, message: String) {
        self.state = State::Failed(ParseError::Syntax {
            offset: self.offset,
            message,
        });
    }
}

impl Default for DecisionStream {
    fn default() -> Self {
        Self::new()
    }
}
