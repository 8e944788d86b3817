//! Post-receive hook input: one `<oldrev> <newrev> <refname>` line per ref.

use crate::error::PipelineError;

/// One updated ref from a push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefUpdate {
    pub old: String,
    pub new: String,
    pub refname: String,
}

impl RefUpdate {
    /// An all-zero new revision means the ref was deleted.
    pub fn is_deletion(&self) -> bool {
        self.new.chars().all(|c| c == '0')
    }
}

fn is_revision(value: &str) -> bool {
    matches!(value.len(), 40 | 64) && value.chars().all(|c| c.is_ascii_hexdigit())
}

pub fn parse_hook_input(input: &str) -> Result<Vec<RefUpdate>, PipelineError> {
    let mut updates = Vec::new();
    for (idx, line) in input.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let invalid = |message: &str| PipelineError::HookInput {
            line: idx + 1,
            message: message.to_string(),
        };
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [old, new, refname] = fields.as_slice() else {
            return Err(invalid("expected '<oldrev> <newrev> <refname>'"));
        };
        if !is_revision(old) || !is_revision(new) {
            return Err(invalid("revisions must be full hex object names"));
        }
        if !refname.starts_with("refs/") {
            return Err(invalid("ref names must start with 'refs/'"));
        }
        updates.push(RefUpdate {
            old: old.to_string(),
            new: new.to_string(),
            refname: refname.to_string(),
        });
    }
    Ok(updates)
}

/// The update to deploy: the last one for `deploy_ref` that is not a deletion.
pub fn deploy_target<'a>(updates: &'a [RefUpdate], deploy_ref: &str) -> Option<&'a RefUpdate> {
    updates
        .iter()
        .rev()
        .find(|u| u.refname == deploy_ref && !u.is_deletion())
}

#[cfg(test)]
mod tests {
    use super::*;

    const ZERO: &str = "0000000000000000000000000000000000000000";
    const A: &str = "1111111111111111111111111111111111111111";
    const B: &str = "2222222222222222222222222222222222222222";

    #[test]
    fn parses_update_lines() {
        let input = format!("{ZERO} {A} refs/heads/main\n\n{A} {B} refs/heads/dev\n");
        let updates = parse_hook_input(&input).unwrap();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].new, A);
        assert_eq!(updates[1].refname, "refs/heads/dev");
    }

    #[test]
    fn selects_deploy_branch() {
        let input = format!("{ZERO} {A} refs/heads/dev\n{A} {B} refs/heads/main\n");
        let updates = parse_hook_input(&input).unwrap();
        let target = deploy_target(&updates, "refs/heads/main").unwrap();
        assert_eq!(target.new, B);
        assert!(deploy_target(&updates, "refs/heads/prod").is_none());
    }

    #[test]
    fn ignores_branch_deletion() {
        let input = format!("{A} {ZERO} refs/heads/main\n");
        let updates = parse_hook_input(&input).unwrap();
        assert!(updates[0].is_deletion());
        assert!(deploy_target(&updates, "refs/heads/main").is_none());
    }

    #[test]
    fn malformed_lines_name_the_line() {
        let input = format!("{ZERO} {A} refs/heads/main\n{A} refs/heads/main\n");
        match parse_hook_input(&input).unwrap_err() {
            PipelineError::HookInput { line, .. } => assert_eq!(line, 2),
            other => panic!("expected HookInput, got {other:?}"),
        }
        assert!(parse_hook_input(&format!("{ZERO} xyz refs/heads/main")).is_err());
        assert!(parse_hook_input(&format!("{ZERO} {A} main")).is_err());
    }
}
