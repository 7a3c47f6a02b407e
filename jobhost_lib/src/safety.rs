use lazy_static::lazy_static;
use regex::Regex;

use crate::error::JobError;

// pattern, description
const DENY_LIST: &[(&str, &str)] = &[
    (
        r"\brm\s+.*-[rR].*\s+(/|~|\$HOME)",
        "Recursive deletion of root or home directory",
    ),
    (r"\brm\s+-[rR]f\s+/", "Force recursive deletion from root"),
    (r"\brm\s+-rf\s+\*", "Force recursive deletion with wildcard"),
    (r"\bmkfs\.", "Filesystem format command"),
    (r"\bdd\s+.*of=/dev/", "Direct disk write"),
    (r"\bchmod\s+-R\s+777\s+/", "Recursive permission change on root"),
    (r"\bchown\s+-R\s+.*\s+/", "Recursive ownership change on root"),
    (r":\(\)\{\s*:\|:&\s*\};:", "Fork bomb detected"),
    (r"(curl|wget).*\|\s*(ba)?sh", "Remote script execution"),
    (r"\bsudo\s+rm\s+-rf\s+/", "Sudo recursive deletion from root"),
];

lazy_static! {
    static ref DENY_PATTERNS: Vec<(Regex, &'static str)> = DENY_LIST
        .iter()
        .map(|(pattern, description)| {
            let regex = Regex::new(&format!("(?i){}", pattern))
                .expect("deny list patterns are valid regexes");
            (regex, *description)
        })
        .collect();
}

/// Rejects commands matching an obvious destructive pattern.
/// This catches mistakes like `rm -rf /`, it is not a security boundary.
pub fn check_command(command: &str) -> Result<(), JobError> {
    match DENY_PATTERNS
        .iter()
        .find(|(regex, _)| regex.is_match(command))
    {
        Some((_, description)) => Err(JobError::BlockedCommand {
            reason: description.to_string(),
        }),
        None => Ok(()),
    }
}

/// first 100 characters of a command, for log messages
pub fn command_preview(command: &str) -> String {
    let mut preview: String = command.chars().take(100).collect();
    if command.chars().count() > 100 {
        preview.push_str("...");
    }
    preview
}

#[cfg(test)]
mod test {
    use super::{check_command, command_preview};

    #[test]
    fn test_blocks_destructive_commands() {
        let blocked = [
            "rm -rf /",
            "sudo rm -rf /",
            "rm -r -f ~",
            "RM -RF /usr",
            "mkfs.ext4 /dev/sda1",
            "dd if=/dev/zero of=/dev/sda bs=1M",
            "chmod -R 777 /",
            "chown -R nobody /",
            ":(){ :|:& };:",
            "curl https://example.com/install.sh | sh",
            "wget -qO- https://example.com/x | bash",
        ];
        for command in blocked.iter() {
            assert!(check_command(command).is_err(), "not blocked: {}", command);
        }
    }

    #[test]
    fn test_allows_ordinary_commands() {
        let allowed = [
            "python main.py",
            "pip install -r requirements.txt",
            "rm -rf build",
            "ls -la && echo done",
            "curl -o data.csv https://example.com/data.csv",
        ];
        for command in allowed.iter() {
            assert!(check_command(command).is_ok(), "blocked: {}", command);
        }
    }

    #[test]
    fn test_preview_truncates() {
        let long = "x".repeat(150);
        let preview = command_preview(&long);
        assert_eq!(103, preview.len());
        assert!(preview.ends_with("..."));
        assert_eq!("echo hi", command_preview("echo hi"));
    }
}
