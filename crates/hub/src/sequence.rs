//! Human-readable record codes ("SESS-0042") drawn from per-kind counters
//! in the `sequences` table.

use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceKind {
    System,
    Zone,
    Program,
    Session,
    Alert,
}

impl SequenceKind {
    #[cfg(test)]
    pub const ALL: [SequenceKind; 5] = [
        Self::System,
        Self::Zone,
        Self::Program,
        Self::Session,
        Self::Alert,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Zone => "zone",
            Self::Program => "program",
            Self::Session => "session",
            Self::Alert => "alert",
        }
    }

    /// Code used when no sequence is configured for this kind.
    pub fn placeholder(&self) -> &'static str {
        match self {
            Self::System => "SYS-NEW",
            Self::Zone => "ZONE-NEW",
            Self::Program => "PROG-NEW",
            Self::Session => "SESS-NEW",
            Self::Alert => "ALERT-NEW",
        }
    }
}

pub fn format_code(prefix: &str, padding: i64, number: i64) -> String {
    let width = padding.max(0) as usize;
    format!("{prefix}{number:0width$}")
}
