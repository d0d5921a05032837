//! Transition rule matching.
//!
//! After an element finishes, its transition rules are tried in descriptor
//! order against the element's exit status; the first match wins. The `next`
//! attribute is only a fallback for elements that did not fail.

use batchflow_types::model::{ExecutionElement, Transition};
use batchflow_types::status::{ExecutionStatus, ExtendedBatchStatus};

/// Where navigation goes after an element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Navigation {
    /// Continue with the element of this id in the same scope.
    To(String),
    End { exit_status: Option<String> },
    Fail { exit_status: Option<String> },
    Stop {
        exit_status: Option<String>,
        restart: Option<String>,
    },
    /// Nothing matched; the scope finishes with the element's outcome.
    Finish,
}

/// Glob match supporting `*` (any run, possibly empty) and `?` (one char).
pub fn matches_pattern(pattern: &str, value: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let value: Vec<char> = value.chars().collect();
    let (mut p, mut v) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while v < value.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == value[v]) {
            p += 1;
            v += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, v));
            p += 1;
        } else if let Some((star_p, star_v)) = star {
            p = star_p + 1;
            v = star_v + 1;
            star = Some((star_p, star_v + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|c| *c == '*')
}

/// Decide the navigation after `element` finished with `status`.
pub fn navigate(element: &ExecutionElement, status: &ExecutionStatus) -> Navigation {
    let exit_status = status.exit_status.as_deref().unwrap_or_default();

    for transition in element.transitions() {
        if !matches_pattern(transition.on(), exit_status) {
            continue;
        }
        tracing::debug!(
            element = element.id(),
            exit_status,
            on = transition.on(),
            "transition matched"
        );
        return match transition {
            Transition::Next { to, .. } => Navigation::To(to.clone()),
            Transition::End { exit_status, .. } => Navigation::End {
                exit_status: exit_status.clone(),
            },
            Transition::Fail { exit_status, .. } => Navigation::Fail {
                exit_status: exit_status.clone(),
            },
            Transition::Stop {
                exit_status,
                restart,
                ..
            } => Navigation::Stop {
                exit_status: exit_status.clone(),
                restart: restart.clone(),
            },
        };
    }

    if status.extended == ExtendedBatchStatus::ExceptionThrown {
        return Navigation::Finish;
    }
    match element.next() {
        Some(next) => Navigation::To(next.to_string()),
        None => Navigation::Finish,
    }
}
