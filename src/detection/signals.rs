//! Signal extraction from the rolling output window

use crate::interceptor::is_echo;
use crate::patterns::PatternSet;

/// What one look at the output window found
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Observations {
    /// A real-work marker appeared anywhere in the window
    pub real_work: bool,
    /// An active-work marker appeared in the trailing lines
    pub active: bool,
    /// The trailing lines look like an idle input prompt
    pub prompt: bool,
    /// The trailing lines end in an idle duration/countdown glyph
    pub idle_glyph: bool,
    pub completion_phrase: Option<String>,
    pub explicit_error: Option<String>,
}

/// Scan window lines. Lines echoing `task_text` are ignored so a task that
/// mentions "file created" cannot complete itself.
pub fn observe(
    lines: &[&str],
    patterns: &PatternSet,
    task_text: &str,
    tail_lines: usize,
) -> Observations {
    let relevant: Vec<&str> = lines
        .iter()
        .copied()
        .filter(|line| !line.trim().is_empty() && !is_echo(line, task_text))
        .collect();
    let tail = &relevant[relevant.len().saturating_sub(tail_lines)..];

    let mut obs = Observations {
        real_work: relevant.iter().any(|line| patterns.is_real_work(line)),
        active: tail.iter().any(|line| patterns.is_active(line)),
        prompt: tail.iter().any(|line| patterns.is_prompt(line)),
        idle_glyph: tail
            .last()
            .map(|line| patterns.is_idle_glyph(line))
            .unwrap_or(false),
        ..Default::default()
    };

    for line in &relevant {
        if obs.completion_phrase.is_none() {
            obs.completion_phrase = patterns.completion_phrase(line).map(str::to_string);
        }
        if obs.explicit_error.is_none() {
            obs.explicit_error = patterns.explicit_error(line);
        }
    }
    obs
}
