//! Signal decoding.
//!
//! The format is line-oriented `KEY=value` with no quoting or escaping:
//! - empty (whitespace-only) content selects raw-copy mode
//! - `REPO=`, `PATCH=`, `BRANCH=`, `MESSAGE=` must all be present and non-empty
//! - the first occurrence of a key wins, unknown lines are ignored
//! - everything after the first `=` is the value, including further `=`

use super::types::{Decoded, KEY_BRANCH, KEY_MESSAGE, KEY_PATCH, KEY_REPO, PatchJob};

/// Decoder for signal file content.
#[derive(Debug, Default, Clone, Copy)]
pub struct SignalParser;

impl SignalParser {
    /// Decode raw signal content.
    pub fn parse(&self, content: &str) -> Decoded {
        if content.chars().all(char::is_whitespace) {
            return Decoded::RawCopy;
        }

        let mut repo = None;
        let mut patch = None;
        let mut branch = None;
        let mut message = None;

        for line in content.lines() {
            let line = line.strip_suffix('\r').unwrap_or(line);
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let slot = match key {
                KEY_REPO => &mut repo,
                KEY_PATCH => &mut patch,
                KEY_BRANCH => &mut branch,
                KEY_MESSAGE => &mut message,
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(value.trim().to_string());
            }
        }

        let missing: Vec<&str> = [
            (KEY_REPO, &repo),
            (KEY_PATCH, &patch),
            (KEY_BRANCH, &branch),
            (KEY_MESSAGE, &message),
        ]
        .into_iter()
        .filter(|(_, value)| value.as_deref().is_none_or(str::is_empty))
        .map(|(key, _)| key)
        .collect();

        if !missing.is_empty() {
            return self.invalid(
                format!("missing required field(s): {}", missing.join(", ")),
                content,
            );
        }

        let job = PatchJob {
            repo: repo.unwrap_or_default(),
            patch: patch.unwrap_or_default(),
            branch: branch.unwrap_or_default(),
            message: message.unwrap_or_default(),
        };

        if !is_single_component(&job.repo) {
            return self.invalid(
                format!("REPO must be a plain directory name, got {:?}", job.repo),
                content,
            );
        }

        tracing::debug!(repo = %job.repo, branch = %job.branch, patch = %job.patch, "decoded patch signal");
        Decoded::Patch(job)
    }

    fn invalid(&self, reason: String, content: &str) -> Decoded {
        tracing::debug!(%reason, "decoded invalid signal");
        Decoded::Invalid {
            reason,
            content: content.to_string(),
        }
    }
}

/// `REPO` is joined onto the repository base, so it must not climb out of it.
fn is_single_component(name: &str) -> bool {
    !name.contains('/') && !name.contains('\\') && name != "." && name != ".."
}

/// Convenience function to decode without creating a parser.
pub fn decode(content: &str) -> Decoded {
    SignalParser.parse(content)
}
