//! The user's request and its decomposition into ordered instructions.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::LazyLock;

use crate::error::RequestError;
use crate::form_state::GoalId;
use crate::types::normalize_label;

const DEFAULT_SCROLL_PX: i32 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollDirection {
    Up,
    Down,
}

/// One thing the user literally asked for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "instruction", rename_all = "snake_case")]
pub enum Instruction {
    Fill {
        field: String,
        text: String,
    },
    Press {
        keys: String,
    },
    Click {
        target: String,
    },
    Select {
        dropdown: String,
        option: String,
    },
    Scroll {
        direction: ScrollDirection,
        amount: i32,
        target: Option<String>,
    },
    Wait {
        seconds: u64,
    },
    /// Understood as text only; cannot be expressed with the primitive vocabulary.
    Freeform {
        text: String,
    },
}

/// Immutable goal of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRequest {
    text: String,
    start_url: Option<String>,
    instructions: Vec<Instruction>,
}

impl UserRequest {
    /// Parse free text such as "Enter the Email ID as a@b.com and press the Enter key."
    pub fn parse(text: &str) -> Result<Self, RequestError> {
        let clauses = split_clauses(text);
        if clauses.is_empty() {
            return Err(RequestError::Empty);
        }

        let mut start_url = None;
        let mut instructions = Vec::new();
        for (index, clause) in clauses.iter().enumerate() {
            if let Some(caps) = NAVIGATE.captures(clause) {
                if index != 0 {
                    return Err(RequestError::NavigationNotFirst(index + 1));
                }
                let url = caps[1].trim_end_matches(['.', ',']).to_string();
                validate_url(&url)?;
                start_url = Some(url);
                continue;
            }
            instructions.push(parse_clause(clause));
        }

        Ok(Self {
            text: text.trim().to_string(),
            start_url,
            instructions,
        })
    }

    /// Build a request from already-structured instructions.
    pub fn from_instructions(
        text: impl Into<String>,
        start_url: Option<String>,
        instructions: Vec<Instruction>,
    ) -> Result<Self, RequestError> {
        if let Some(url) = &start_url {
            validate_url(url)?;
        }
        if start_url.is_none() && instructions.is_empty() {
            return Err(RequestError::Empty);
        }
        Ok(Self {
            text: text.into(),
            start_url,
            instructions,
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn start_url(&self) -> Option<&str> {
        self.start_url.as_deref()
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Goals in request order, one per instruction. A field or dropdown named a second
    /// time gets its own index-keyed goal, so the later value is still entered.
    pub fn goals(&self) -> impl Iterator<Item = GoalId> + '_ {
        let mut seen = HashSet::new();
        self.instructions.iter().enumerate().map(move |(i, instr)| {
            let goal = goal_for(i, instr);
            if seen.insert(goal.clone()) {
                goal
            } else {
                GoalId::new(format!("{}:{}", i, goal))
            }
        })
    }
}

/// The tracked goal an instruction satisfies on its own. Fields and dropdowns are keyed by
/// name so a host-restored `FormState` entry for that field suppresses any further action
/// on it.
fn goal_for(index: usize, instruction: &Instruction) -> GoalId {
    match instruction {
        Instruction::Fill { field, .. } => GoalId::field(field),
        Instruction::Select { dropdown, .. } => GoalId::new(format!("select:{}", normalize_label(dropdown))),
        Instruction::Press { keys } => GoalId::new(format!("{}:press:{}", index, keys)),
        Instruction::Click { target } => {
            GoalId::new(format!("{}:click:{}", index, normalize_label(target)))
        }
        Instruction::Scroll { direction, .. } => {
            GoalId::new(format!("{}:scroll:{:?}", index, direction).to_lowercase())
        }
        Instruction::Wait { seconds } => GoalId::new(format!("{}:wait:{}s", index, seconds)),
        Instruction::Freeform { text } => {
            GoalId::new(format!("{}:freeform:{}", index, normalize_label(text)))
        }
    }
}

fn validate_url(url: &str) -> Result<(), RequestError> {
    let lower = url.to_lowercase();
    if !(lower.starts_with("http://") || lower.starts_with("https://")) {
        return Err(RequestError::InvalidScheme(url.to_string()));
    }
    if lower.contains("console.log") || lower.contains("placeholder") {
        return Err(RequestError::PlaceholderUrl(url.to_string()));
    }
    Ok(())
}

static NUMBERING: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*(?:\d+[.)]|[-*•])\s*").unwrap());

static SEPARATOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\s*,\s*(?:and\s+)?(?:then\s+)?|\s+and\s+then\s+|\s+then\s+|\s+and\s+").unwrap());

static VERB: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:enter|type|fill|input|press|hit|click|tap|select|choose|from|scroll|wait|open|go to|navigate)\b").unwrap()
});

static NAVIGATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:open|go to|navigate to|visit)\b.*?(\S+://\S+|javascript:\S+)").unwrap()
});

static FILL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:enter|type|fill(?:\s+in)?|input)\s+(?:the\s+)?(?:field\s+)?(.+?)\s+(?:as|with|=|-|:)\s+(?:text\s+|value\s+)?(.+)$").unwrap()
});

static FILL_SHORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(?:enter|type|input)\s+(?:the\s+)?(\S+)\s+(.+)$").unwrap());

static PRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:press|hit)\s+(?:the\s+)?(.+?)(?:\s+(?:key|button))?$").unwrap()
});

static SELECT_FROM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:from|in)\s+(?:the\s+)?(.+?)\s+dropdown,?\s+(?:select|choose)\s+(.+)$").unwrap()
});

static SELECT_IN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:select|choose)\s+(.+?)\s+(?:from|in)\s+(?:the\s+)?(.+?)(?:\s+dropdown)?$").unwrap()
});

static CLICK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:click|tap)(?:\s+on)?\s+(?:the\s+)?(.+?)(?:\s+(?:button|link|tab|menu item|icon|option))?(?:\s+(?:on|in|at)\s+the\s+.+)?$").unwrap()
});

static SCROLL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^scroll\s+(up|down)(?:\s+by\s+(\d+)\s*(?:px|pixels)?)?(?:\s+to\s+(?:the\s+)?(.+))?$").unwrap()
});

static WAIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^wait(?:\s+(?:for\s+)?(\d+)\s*(?:s|sec|secs|seconds?)?)?$").unwrap()
});

fn split_clauses(text: &str) -> Vec<String> {
    let mut clauses: Vec<String> = Vec::new();
    for line in text.lines() {
        let line = NUMBERING.replace(line, "");
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let mut pieces: Vec<String> = Vec::new();
        let mut last = 0;
        for sep in SEPARATOR.find_iter(line) {
            let next = &line[sep.end()..];
            if VERB.is_match(next) {
                pieces.push(line[last..sep.start()].to_string());
                last = sep.end();
            }
        }
        pieces.push(line[last..].to_string());

        clauses.extend(
            pieces
                .into_iter()
                .map(|p| p.trim().trim_end_matches(['.', ';']).trim().to_string())
                .filter(|p| !p.is_empty()),
        );
    }
    clauses
}

fn parse_clause(clause: &str) -> Instruction {
    if let Some(caps) = SELECT_FROM.captures(clause) {
        return Instruction::Select {
            dropdown: unquote(&caps[1]),
            option: unquote(&caps[2]),
        };
    }
    if let Some(caps) = SELECT_IN.captures(clause) {
        return Instruction::Select {
            dropdown: unquote(&caps[2]),
            option: unquote(&caps[1]),
        };
    }
    if let Some(caps) = FILL.captures(clause).or_else(|| FILL_SHORT.captures(clause)) {
        return Instruction::Fill {
            field: unquote(&caps[1]),
            text: unquote(&caps[2]),
        };
    }
    if let Some(caps) = PRESS.captures(clause) {
        return Instruction::Press {
            keys: normalize_keys(&caps[1]),
        };
    }
    if let Some(caps) = SCROLL.captures(clause) {
        let direction = if caps[1].eq_ignore_ascii_case("up") {
            ScrollDirection::Up
        } else {
            ScrollDirection::Down
        };
        return Instruction::Scroll {
            direction,
            amount: caps
                .get(2)
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or(DEFAULT_SCROLL_PX),
            target: caps.get(3).map(|m| unquote(m.as_str())),
        };
    }
    if let Some(caps) = WAIT.captures(clause) {
        return Instruction::Wait {
            seconds: caps
                .get(1)
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or(1),
        };
    }
    if let Some(caps) = CLICK.captures(clause) {
        return Instruction::Click {
            target: unquote(&caps[1]),
        };
    }
    Instruction::Freeform {
        text: clause.to_string(),
    }
}

fn unquote(s: &str) -> String {
    s.trim()
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '“' || c == '”')
        .trim()
        .to_string()
}

/// "enter" -> "Enter", "ctrl+shift+t" -> "Control+Shift+t".
pub fn normalize_keys(raw: &str) -> String {
    unquote(raw)
        .split('+')
        .map(|part| {
            let part = part.trim();
            match part.to_lowercase().as_str() {
                "enter" | "return" => "Enter".to_string(),
                "esc" | "escape" => "Escape".to_string(),
                "tab" => "Tab".to_string(),
                "space" | "spacebar" => "Space".to_string(),
                "backspace" => "Backspace".to_string(),
                "delete" | "del" => "Delete".to_string(),
                "ctrl" | "control" => "Control".to_string(),
                "shift" => "Shift".to_string(),
                "alt" | "option" => "Alt".to_string(),
                "cmd" | "meta" | "command" => "Meta".to_string(),
                _ => part.to_string(),
            }
        })
        .collect::<Vec<_>>()
        .join("+")
}
