//! Command admission. Everything here is pure: the same string always gets the
//! same answer and nothing is spawned or touched on disk.

use crate::error::ExecError;

/// Programs a command may start with.
pub const ALLOWED_PROGRAMS: &[&str] = &[
    "python3", "python", "node", "npm", "pip", "pip3", "cat", "echo", "ls", "head", "tail",
    "wc", "grep", "sort", "uniq", "cut", "tr", "diff", "awk", "sed", "pwd", "printf", "date",
];

/// Versioned interpreter names such as `python3.12` or `pip3.12`.
pub const ALLOWED_PREFIXES: &[&str] = &["python3.", "pip3."];

/// Rejected anywhere in the command, case-insensitively.
pub const DENIED_SUBSTRINGS: &[&str] = &[
    "sudo", "chmod", "chown", "curl", "wget", "mkfs", "shutdown", "reboot", "killall", "pkill",
    "netcat", "telnet", "docker", "passwd", "iptables", "crontab", "ssh", "scp", "rsync",
    "/etc/", "/proc/", ":(){",
];

/// Rejected when they appear as a whole word. Kept separate because as bare
/// substrings they would match ordinary identifiers (`rm` in `format`).
pub const DENIED_WORDS: &[&str] = &[
    "rm", "dd", "nc", "su", "kill", "mount", "umount", "apt", "apt-get", "yum", "apk", "ftp",
];

const SHELL_SEPARATORS: &[char] = &[';', '&', '|', '(', ')', '`', '$', '<', '>', '"', '\''];

pub fn validate_command(command: &str) -> Result<(), ExecError> {
    let trimmed = command.trim();
    if trimmed.is_empty() {
        return Err(ExecError::BadRequest("command must not be empty".to_owned()));
    }
    if trimmed.contains("..") || trimmed.starts_with('/') {
        return Err(ExecError::forbidden("path traversal is not allowed"));
    }

    let lowered = trimmed.to_lowercase();
    if let Some(token) = DENIED_SUBSTRINGS.iter().find(|token| lowered.contains(**token)) {
        return Err(ExecError::forbidden(format!("`{token}` is not allowed")));
    }
    if let Some(word) = lowered
        .split(|c: char| c.is_whitespace() || SHELL_SEPARATORS.contains(&c))
        .find(|word| DENIED_WORDS.contains(word))
    {
        return Err(ExecError::forbidden(format!("`{word}` is not allowed")));
    }

    let program = trimmed.split_whitespace().next().unwrap_or_default();
    if !is_allowed_program(program) {
        return Err(ExecError::forbidden(format!(
            "`{program}` is not an allowed program"
        )));
    }
    Ok(())
}

fn is_allowed_program(program: &str) -> bool {
    ALLOWED_PROGRAMS.contains(&program)
        || ALLOWED_PREFIXES
            .iter()
            .any(|prefix| program.starts_with(prefix))
}
