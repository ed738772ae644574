//! Built-in severity tables.
//!
//! Patterns run against terminal output with escape sequences removed, which
//! includes the shell's echo of what the operator is typing. Keep them
//! anchored on command shapes rather than bare words so ordinary log text
//! does not trip them.

use super::Severity;

/// (tier, pattern, description)
pub(crate) const DEFAULT_RULES: &[(Severity, &str, &str)] = &[
    // ── critical ────────────────────────────────────────────────────
    (
        Severity::Critical,
        r"\brm\s+(?:-[a-zA-Z]*(?:rf|fr)[a-zA-Z]*|-r\s+-f|-f\s+-r|--recursive\s+--force)\s+(?:--no-preserve-root\s+)?/(?:\*|\s|$)",
        "recursive forced deletion of the root filesystem",
    ),
    (
        Severity::Critical,
        r"\bmkfs(?:\.[a-z0-9]+)?\s+(?:-[a-zA-Z]+\s+)*/dev/",
        "filesystem creation on a block device",
    ),
    (
        Severity::Critical,
        r"\bdd\s+[^\n]*\bof=/dev/(?:sd|hd|nvme|xvd|vd|mmcblk)",
        "raw write to a disk device",
    ),
    (
        Severity::Critical,
        r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:",
        "fork bomb",
    ),
    (
        Severity::Critical,
        r">\s*/dev/(?:sd|hd|nvme|xvd|vd)[a-z0-9]*\b",
        "output redirected onto a disk device",
    ),
    (
        Severity::Critical,
        r"\bchmod\s+-[a-zA-Z]*R[a-zA-Z]*\s+(?:0?777|a\+rwx)\s+/(?:\s|$)",
        "recursive world-writable permissions on the root filesystem",
    ),
    (
        Severity::Critical,
        r"\b(?:shred|wipefs)\s+[^\n]*/dev/",
        "wiping a block device",
    ),
    // ── high ────────────────────────────────────────────────────────
    (
        Severity::High,
        r"\b(?:curl|wget)\b[^\n|]*\|\s*(?:sudo\s+)?(?:ba|z|da)?sh\b",
        "remote script piped into a shell",
    ),
    (
        Severity::High,
        r"\b(?:shutdown|poweroff)\s+(?:-[hHrP]\b|now\b|\+\d+)",
        "host shutdown or reboot",
    ),
    (
        Severity::High,
        r"\biptables\s+(?:-F|--flush)\b",
        "firewall rules flushed",
    ),
    (
        Severity::High,
        r"\buserdel\s+\S",
        "user account deletion",
    ),
    (
        Severity::High,
        r"\bhistory\s+-c\b",
        "shell history wiped",
    ),
    (
        Severity::High,
        r"\b(?:nc|ncat|netcat)\b[^\n]*\s-e\s",
        "reverse shell via netcat",
    ),
    (
        Severity::High,
        r"\bcrontab\s+-r\b",
        "all cron jobs removed",
    ),
    (
        Severity::High,
        r"(?i)\bdrop\s+(?:database|table)\b",
        "SQL drop statement",
    ),
    // ── medium ──────────────────────────────────────────────────────
    (
        Severity::Medium,
        r"\bsudo\s+\S",
        "privilege escalation with sudo",
    ),
    (
        Severity::Medium,
        r"\bchmod\s+(?:-[a-zA-Z]+\s+)*0?777\b",
        "world-writable permissions",
    ),
    (
        Severity::Medium,
        r"\bkill\s+-(?:9|KILL)\b",
        "forceful process kill",
    ),
    (
        Severity::Medium,
        r"\bsystemctl\s+(?:stop|disable|mask)\b",
        "service stopped or disabled",
    ),
    (
        Severity::Medium,
        r"\bgit\s+push\b[^\n]*(?:--force\b|\s-f\b)",
        "forced git push",
    ),
    (
        Severity::Medium,
        r"(?i)\b(?:password|passwd|secret|api[_-]?key)\s*[=:]",
        "credential printed to the terminal",
    ),
];
