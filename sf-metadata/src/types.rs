use serde::{Deserialize, Serialize};
use sf_catalog::SeasonDraft;

/// One search hit offered to the operator for selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub external_id: i64,
    pub display_label: String,
    #[serde(default)]
    pub release_date: Option<String>,
    #[serde(default)]
    pub overview: Option<String>,
}

impl Candidate {
    /// Label shown on the selection keyboard, e.g. "Heat (1995)".
    pub fn option_label(&self) -> String {
        match self.release_year() {
            Some(year) => format!("{} ({year})", self.display_label),
            None => self.display_label.clone(),
        }
    }

    pub fn release_year(&self) -> Option<&str> {
        self.release_date
            .as_deref()
            .and_then(|d| d.get(..4))
            .filter(|y| y.chars().all(|c| c.is_ascii_digit()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeasonOutline {
    pub season_number: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub episode_count: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TitleDetails {
    pub external_id: i64,
    pub name: String,
    #[serde(default)]
    pub overview: Option<String>,
    #[serde(default)]
    pub release_date: Option<String>,
    /// Numbered seasons only; specials are never listed.
    #[serde(default)]
    pub seasons: Vec<SeasonOutline>,
    /// Untouched payload, persisted as the title's details.
    #[serde(default)]
    pub raw: serde_json::Value,
}

impl TitleDetails {
    pub fn season_drafts(&self) -> Vec<SeasonDraft> {
        self.seasons
            .iter()
            .map(|s| SeasonDraft {
                season_number: s.season_number,
                name: s.name.clone(),
                episode_count: s.episode_count,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn option_label_includes_year_when_known() {
        let mut candidate = Candidate {
            external_id: 949,
            display_label: "Heat".to_string(),
            release_date: Some("1995-12-15".to_string()),
            overview: None,
        };
        assert_eq!(candidate.option_label(), "Heat (1995)");
        candidate.release_date = Some(String::new());
        assert_eq!(candidate.option_label(), "Heat");
    }
}
