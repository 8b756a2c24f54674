//! Translation context shared by every line of a job.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Generation strategy. Drives diversity thresholds and salvage sample counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Conservative,
    Balanced,
    Adventurous,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Mode::Conservative => "conservative",
            Mode::Balanced => "balanced",
            Mode::Adventurous => "adventurous",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Mode {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "conservative" => Ok(Mode::Conservative),
            "balanced" => Ok(Mode::Balanced),
            "adventurous" => Ok(Mode::Adventurous),
            _ => Err(crate::error::Error::InvalidInput(format!("unknown mode: {s}"))),
        }
    }
}

/// Everything the translator needs to know beyond the line itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationContext {
    pub source_language: String,
    pub target_language: String,
    pub mode: Mode,
    /// Poem title, if known.
    pub title: Option<String>,
    /// Free-form guidance from the user (tone, register, audience).
    pub notes: Option<String>,
}

impl TranslationContext {
    pub fn new(
        source_language: impl Into<String>,
        target_language: impl Into<String>,
        mode: Mode,
    ) -> Self {
        Self {
            source_language: source_language.into(),
            target_language: target_language.into(),
            mode,
            title: None,
            notes: None,
        }
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    /// Content hash used to invalidate cached recipes when the context changes.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for part in [
            self.source_language.as_str(),
            self.target_language.as_str(),
            self.title.as_deref().unwrap_or(""),
            self.notes.as_deref().unwrap_or(""),
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        hasher.update(self.mode.to_string().as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        digest[..16].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_tracks_context_changes() {
        let base = TranslationContext::new("es", "en", Mode::Balanced);
        let same = TranslationContext::new("es", "en", Mode::Balanced);
        assert_eq!(base.content_hash(), same.content_hash());

        let noted = base.clone().notes("keep the meter");
        assert_ne!(base.content_hash(), noted.content_hash());

        let bolder = TranslationContext::new("es", "en", Mode::Adventurous);
        assert_ne!(base.content_hash(), bolder.content_hash());
    }

    #[test]
    fn mode_round_trips_through_str() {
        for mode in [Mode::Conservative, Mode::Balanced, Mode::Adventurous] {
            assert_eq!(mode.to_string().parse::<Mode>().unwrap(), mode);
        }
        assert!("wild".parse::<Mode>().is_err());
    }
}
