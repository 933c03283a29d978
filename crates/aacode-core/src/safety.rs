//! C1 Safety Guard: classifies shell commands before execution and gates
//! path access. Grounded on the teacher's `is_safe_command.rs`/`safety.rs`
//! (whitelist-first classification, per-command special rules) with the
//! exact whitelist/pattern/path-boundary contents resolved from
//! `original_source/utils/safety.py`.

use std::path::{Path, PathBuf};

use regex_lite::Regex;
use serde::{Deserialize, Serialize};

use crate::util::closest_matches;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Safe,
    Warning,
    Dangerous,
    Unknown,
}

/// The guard's verdict on one command. `allowed` already folds in
/// non-interactive confirmation handling (spec.md §4.1): a `warning` is
/// `allowed = true` with `needs_confirmation = true` when running
/// interactively, and `allowed = true` with `needs_confirmation = false`
/// when not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub allowed: bool,
    pub reason: String,
    pub risk_level: RiskLevel,
    pub needs_confirmation: bool,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

impl Decision {
    fn safe(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
            risk_level: RiskLevel::Safe,
            needs_confirmation: false,
            suggestions: Vec::new(),
        }
    }

    fn warning(reason: impl Into<String>, interactive: bool) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
            risk_level: RiskLevel::Warning,
            needs_confirmation: interactive,
            suggestions: Vec::new(),
        }
    }

    fn reject(reason: impl Into<String>, risk_level: RiskLevel) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
            risk_level,
            needs_confirmation: false,
            suggestions: Vec::new(),
        }
    }

    fn unknown(reason: impl Into<String>, suggestions: Vec<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
            risk_level: RiskLevel::Unknown,
            needs_confirmation: false,
            suggestions,
        }
    }
}

/// Dangerous regex patterns checked against the raw command string before
/// any tokenization is attempted (spec.md §4.1 step 2).
fn dangerous_patterns() -> &'static [Regex] {
    use std::sync::OnceLock;
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    #[allow(clippy::expect_used)]
    PATTERNS.get_or_init(|| {
        [
            r"(?i)\bformat\s+",
            r"(?i)\bdd\s+if=",
            r"(?i)\bmkfs(\.\w+)?\b",
            r"(?i)\bshutdown\b",
            r"(?i)\bhalt\b",
            r"(?i)\breboot\b",
            r"(?i)^\s*init\s+\d",
            r"(?i)\biptables\b",
            r"(?i)\bufw\b",
            r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;",
            r"(?i)\bexec\s+/dev/",
            r"(?i)\bchmod\s+[0-7]{3,4}\s+/",
            r"(?i)\bchown\s+[\w.-]*:\S*\s+/",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("static pattern compiles"))
        .collect()
    })
}

/// The ~150-entry command whitelist, grouped by category the way
/// `original_source/utils/safety.py` groups them.
const FILESYSTEM_BASICS: &[&str] = &[
    "ls", "cat", "cd", "pwd", "echo", "head", "tail", "wc", "which", "find", "file", "stat",
    "touch", "mkdir", "cp", "mv", "ln", "basename", "dirname", "realpath", "tree", "du", "df",
];
const PYTHON_ECOSYSTEM: &[&str] = &[
    "python", "pip", "pytest", "poetry", "pipenv", "venv", "virtualenv", "black", "ruff", "flake8",
    "mypy", "tox",
];
const NODE_ECOSYSTEM: &[&str] = &[
    "node", "npm", "yarn", "pnpm", "npx", "tsc", "eslint", "prettier", "jest", "vite", "webpack",
];
const VCS: &[&str] = &[
    "git", "svn", "hg",
];
const NETWORK: &[&str] = &[
    "curl", "wget", "ping", "dig", "nslookup", "ssh", "scp", "rsync", "nc", "telnet",
];
const SEARCH: &[&str] = &["grep", "rg", "ag", "awk", "sed", "sort", "uniq", "cut", "tr", "xargs"];
const SYSTEM_INSPECTORS: &[&str] = &[
    "ps", "top", "htop", "uname", "whoami", "id", "env", "printenv", "uptime", "free", "date",
    "hostname", "lsof", "netstat", "ss",
];
const RISKY_BUT_ALLOWED: &[&str] = &[
    "rm", "sudo", "chmod", "chown", "dd", "format", "mkfs", "shutdown", "halt", "reboot",
    "iptables", "ufw",
];
const PACKAGE_MANAGERS: &[&str] = &[
    "apt", "apt-get", "dpkg", "brew", "yum", "dnf", "pacman", "cargo", "go", "make", "cmake",
    "docker", "docker-compose", "systemctl", "service",
];
const MISC_TOOLS: &[&str] = &[
    "diff", "patch", "tar", "gzip", "gunzip", "zip", "unzip", "md5sum", "sha256sum", "jq", "less",
    "more", "man", "history", "alias", "export", "source", "true", "false", "test", "sleep",
    "kill", "killall", "nohup", "bash", "sh", "zsh",
];

fn whitelist() -> impl Iterator<Item = &'static &'static str> {
    FILESYSTEM_BASICS
        .iter()
        .chain(PYTHON_ECOSYSTEM)
        .chain(NODE_ECOSYSTEM)
        .chain(VCS)
        .chain(NETWORK)
        .chain(SEARCH)
        .chain(SYSTEM_INSPECTORS)
        .chain(RISKY_BUT_ALLOWED)
        .chain(PACKAGE_MANAGERS)
        .chain(MISC_TOOLS)
}

/// Commands that are whitelisted but carry elevated risk and are therefore
/// `warning`-level even though they are recognized.
fn is_medium_risk(cmd: &str) -> bool {
    matches!(
        cmd,
        "pip" | "pip3" | "npm" | "yarn" | "apt" | "apt-get" | "docker" | "docker-compose"
            | "systemctl" | "service"
    )
}

fn is_high_risk(cmd: &str) -> bool {
    RISKY_BUT_ALLOWED.contains(&cmd)
}

/// Strip a path prefix and fold interpreter-version aliases to their
/// canonical name (`python3` -> `python`, `pip3` -> `pip`).
fn normalize_command_name(raw: &str) -> String {
    let base = raw.rsplit('/').next().unwrap_or(raw);
    match base {
        "python3" | "python2" => "python".to_string(),
        "pip3" => "pip".to_string(),
        other => other.to_string(),
    }
}

const ROOT_LEVEL_DENYLIST: &[&str] = &["/", "/etc", "/var", "/usr", "/bin", "/sbin", "/lib"];

fn is_root_level_target(target: &str) -> bool {
    let expanded = if target == "~" || target.starts_with("~/") {
        return true;
    } else {
        target
    };
    if expanded == "/*" {
        return true;
    }
    ROOT_LEVEL_DENYLIST
        .iter()
        .any(|root| expanded == *root || expanded.starts_with(&format!("{root}/")))
}

const SUDO_ALLOWED_SUBCOMMANDS: &[&str] =
    &["apt", "apt-get", "dpkg", "systemctl", "service", "pip", "pip3", "npm", "yarn"];

/// Read-only inspectors: path arguments outside the project root are
/// permitted for these commands (with a warning), since the command cannot
/// mutate what it points at. `original_source/utils/safety.py`'s
/// `readonly_commands` set, resolved per spec.md §4.1 step 6.
const READ_ONLY_INSPECTORS: &[&str] =
    &["ls", "cat", "file", "stat", "head", "tail", "less", "more", "grep", "find", "wc", "diff"];

const READ_ONLY_PATH_ALLOWLIST: &[&str] = &[
    "/tmp",
    "/var/tmp",
    "/usr/share",
    "/usr/local/share",
    "/etc/passwd",
    "/etc/group",
    "/proc/self",
    "/proc/cpuinfo",
    "/proc/meminfo",
];

/// Boundary rule shared with the Context Store (spec.md §4.3). `path` may be
/// absolute or a relative path possibly starting with `..` segments.
pub fn is_safe_path(path: &str, project_root: &Path) -> bool {
    if let Some(rest) = path.strip_prefix("..") {
        let levels = 1 + rest.matches("..").count();
        if levels <= 3 {
            let candidate = project_root.join(path);
            if let Some(grandparent) = project_root.ancestors().nth(3) {
                return candidate.starts_with(grandparent) || normalized_contains(&candidate, grandparent);
            }
            return true;
        }
        return false;
    }

    let candidate = if Path::new(path).is_absolute() {
        PathBuf::from(path)
    } else {
        project_root.join(path)
    };
    let normalized = normalize_lexically(&candidate);

    if normalized.starts_with(project_root) {
        return true;
    }
    READ_ONLY_PATH_ALLOWLIST
        .iter()
        .any(|allowed| normalized.starts_with(Path::new(allowed)))
}

fn normalized_contains(candidate: &Path, ancestor: &Path) -> bool {
    normalize_lexically(candidate).starts_with(normalize_lexically(ancestor))
}

/// Resolve `.`/`..` components without touching the filesystem, the way the
/// teacher's `safety.rs::normalize` does for patch-path checks.
fn normalize_lexically(path: &Path) -> PathBuf {
    use std::path::Component;
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Classify `raw_command` for execution rooted at `project_root`.
pub fn classify_command(raw_command: &str, project_root: &Path, interactive: bool) -> Decision {
    let trimmed = raw_command.trim();
    if trimmed.is_empty() {
        return Decision::reject("empty command", RiskLevel::Dangerous);
    }

    for pattern in dangerous_patterns() {
        if pattern.is_match(trimmed) {
            return Decision::reject(
                format!("command matches a dangerous pattern: {trimmed}"),
                RiskLevel::Dangerous,
            );
        }
    }

    let tokens = match shlex::split(trimmed) {
        Some(tokens) if !tokens.is_empty() => tokens,
        _ => return Decision::reject("command could not be tokenized", RiskLevel::Dangerous),
    };

    let cmd = normalize_command_name(&tokens[0]);

    if !whitelist().any(|w| **w == cmd) {
        let pool: Vec<&str> = whitelist().copied().collect();
        let suggestions = closest_matches(&cmd, pool, 3, 0.6)
            .into_iter()
            .map(str::to_string)
            .collect();
        return Decision::unknown(format!("unrecognized command: {cmd}"), suggestions);
    }

    if let Some(decision) = special_case(&cmd, &tokens, project_root, interactive) {
        return decision;
    }

    let is_read_only_inspector = READ_ONLY_INSPECTORS.contains(&cmd.as_str());
    let mut out_of_root_path_seen = false;
    for token in &tokens[1..] {
        if (token.starts_with('/') || token.contains("..")) && !is_safe_path(token, project_root) {
            if is_read_only_inspector {
                out_of_root_path_seen = true;
                continue;
            }
            return Decision::reject(
                format!("path argument '{token}' resolves outside the allowed boundary"),
                RiskLevel::Dangerous,
            );
        }
    }

    if is_high_risk(&cmd) || is_medium_risk(&cmd) {
        return Decision::warning(format!("'{cmd}' is whitelisted but risk-elevated"), interactive);
    }

    if out_of_root_path_seen {
        return Decision::warning(
            format!("'{cmd}' is a read-only inspector reading outside the project root"),
            interactive,
        );
    }

    Decision::safe(format!("'{cmd}' is a whitelisted command"))
}

fn special_case(
    cmd: &str,
    tokens: &[String],
    project_root: &Path,
    interactive: bool,
) -> Option<Decision> {
    match cmd {
        "rm" => Some(classify_rm(tokens, project_root, interactive)),
        "sudo" => Some(classify_sudo(tokens)),
        "chmod" => Some(classify_chmod(tokens, project_root, interactive)),
        _ => None,
    }
}

fn classify_rm(tokens: &[String], project_root: &Path, interactive: bool) -> Decision {
    let flagged = tokens[1..]
        .iter()
        .any(|t| t.starts_with('-') && (t.contains('r') || t.contains('f')));
    let targets: Vec<&str> = tokens[1..].iter().filter(|t| !t.starts_with('-')).map(String::as_str).collect();

    if !flagged {
        return Decision::safe("rm without -r/-f is always allowed");
    }

    if targets.iter().any(|t| is_root_level_target(t)) {
        return Decision::reject(
            "rm -rf targets a protected root-level path",
            RiskLevel::Dangerous,
        );
    }

    let outside: Vec<&str> = targets
        .iter()
        .filter(|t| !is_safe_path(t, project_root))
        .copied()
        .collect();
    if !outside.is_empty() {
        return Decision::reject(
            format!("rm -rf 不能删除项目目录外的文件: {}", outside.join(", ")),
            RiskLevel::Dangerous,
        );
    }

    Decision::warning("rm -rf inside the project root", interactive)
}

fn classify_sudo(tokens: &[String]) -> Decision {
    match tokens.get(1).map(String::as_str) {
        Some(sub) if SUDO_ALLOWED_SUBCOMMANDS.contains(&sub) => {
            Decision::warning(format!("sudo {sub} is allow-listed"), true)
        }
        Some(sub) => Decision::reject(format!("sudo {sub} is not allow-listed"), RiskLevel::Dangerous),
        None => Decision::reject("sudo with no subcommand", RiskLevel::Dangerous),
    }
}

fn classify_chmod(tokens: &[String], project_root: &Path, interactive: bool) -> Decision {
    let mode_777 = tokens.get(1).map(String::as_str) == Some("777");
    let targets_project = tokens[2..]
        .iter()
        .any(|t| !t.starts_with('-') && is_safe_path(t, project_root));
    if mode_777 && targets_project {
        return Decision::warning("chmod 777 on a project path requires confirmation", interactive);
    }
    Decision::warning("chmod is whitelisted but risk-elevated", interactive)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;

    fn root() -> PathBuf {
        PathBuf::from("/workspace/project")
    }

    #[test]
    fn empty_command_is_dangerous() {
        let d = classify_command("", &root(), false);
        assert!(!d.allowed);
        assert_eq!(d.risk_level, RiskLevel::Dangerous);
    }

    #[test]
    fn known_safe_command_is_safe() {
        let d = classify_command("ls -la", &root(), false);
        assert!(d.allowed);
        assert_eq!(d.risk_level, RiskLevel::Safe);
    }

    #[test]
    fn dangerous_pattern_is_rejected() {
        let d = classify_command("mkfs.ext4 /dev/sda1", &root(), false);
        assert!(!d.allowed);
        assert_eq!(d.risk_level, RiskLevel::Dangerous);
    }

    #[test]
    fn unknown_command_suggests_alternatives() {
        let d = classify_command("lsx -la", &root(), false);
        assert_eq!(d.risk_level, RiskLevel::Unknown);
        assert!(d.suggestions.contains(&"ls".to_string()));
    }

    #[test]
    fn rm_rf_outside_root_is_rejected() {
        let d = classify_command("rm -rf /home/other/project", &root(), false);
        assert!(!d.allowed);
        assert!(d.reason.contains("项目目录外"));
    }

    #[test]
    fn rm_rf_inside_root_is_allowed_noninteractive() {
        let d = classify_command("rm -rf build", &root(), false);
        assert!(d.allowed);
        assert!(!d.needs_confirmation);
    }

    #[test]
    fn rm_rf_inside_root_needs_confirmation_interactive() {
        let d = classify_command("rm -rf build", &root(), true);
        assert!(d.allowed);
        assert!(d.needs_confirmation);
    }

    #[test]
    fn rm_rf_root_level_denylist_rejected_even_inside_root() {
        let d = classify_command("rm -rf /", &root(), false);
        assert!(!d.allowed);
    }

    #[test]
    fn sudo_allowlisted_subcommand_is_warning() {
        let d = classify_command("sudo apt update", &root(), false);
        assert!(d.allowed);
        assert_eq!(d.risk_level, RiskLevel::Warning);
    }

    #[test]
    fn sudo_other_subcommand_is_rejected() {
        let d = classify_command("sudo rm -rf /", &root(), false);
        assert!(!d.allowed);
    }

    #[test]
    fn read_only_inspector_on_out_of_root_path_is_allowed_with_warning() {
        let d = classify_command("cat /etc/shadow", &root(), false);
        assert!(d.allowed);
        assert_eq!(d.risk_level, RiskLevel::Warning);
    }

    #[test]
    fn non_inspector_path_outside_root_is_rejected() {
        let d = classify_command("cp /etc/shadow stolen.txt", &root(), false);
        assert!(!d.allowed);
    }

    #[test]
    fn read_only_allowlisted_path_is_safe() {
        assert!(is_safe_path("/tmp/foo.txt", &root()));
        assert!(is_safe_path("/etc/passwd", &root()));
    }

    #[test]
    fn three_levels_of_parent_traversal_allowed() {
        assert!(is_safe_path("../../../sibling", &root()));
    }

    #[test]
    fn git_log_is_safe() {
        let d = classify_command("git log --oneline", &root(), false);
        assert!(d.allowed);
        assert_eq!(d.risk_level, RiskLevel::Safe);
    }
}
