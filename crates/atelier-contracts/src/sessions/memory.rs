use anyhow::Result;

use crate::chat::vocabulary::STYLE_VOCABULARY;

use super::store::SessionStore;

/// Style terms recognized in the request text, in vocabulary order.
pub fn extract_styles(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase();
    STYLE_VOCABULARY
        .iter()
        .filter(|style| lowered.contains(*style))
        .map(|style| style.to_string())
        .collect()
}

/// Folds recognizable style terms from the request text into the session's
/// preference set and persists the session. Returns the newly added styles.
pub fn remember_styles(session: &mut SessionStore, text: &str) -> Result<Vec<String>> {
    let found = extract_styles(text);
    if found.is_empty() {
        return Ok(Vec::new());
    }
    let added = session.add_styles(&found);
    if !added.is_empty() {
        session.save()?;
    }
    Ok(added)
}

/// Instruction clause biasing generation prompts toward remembered styles.
/// Empty when nothing is recorded.
pub fn style_prompt_fragment(styles: &[String]) -> String {
    if styles.is_empty() {
        return String::new();
    }
    format!(
        "Lean into the styles this user has favored before: {}.",
        styles.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_known_styles_only() {
        let styles = extract_styles("a NOIR alley with pastel signs, very tasteful");
        assert_eq!(styles, vec!["noir".to_string(), "pastel".to_string()]);
        assert!(extract_styles("a plain alley").is_empty());
    }

    #[test]
    fn remember_accumulates_across_requests() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let mut session = SessionStore::open(temp.path().join("session.json"));

        remember_styles(&mut session, "something noir please")?;
        remember_styles(&mut session, "now pastel, still noir")?;

        assert_eq!(session.preferred_styles(), ["noir", "pastel"]);
        Ok(())
    }

    #[test]
    fn fragment_lists_styles_or_stays_empty() {
        assert_eq!(style_prompt_fragment(&[]), "");
        let fragment = style_prompt_fragment(&["noir".to_string(), "pastel".to_string()]);
        assert!(fragment.contains("noir, pastel"));
    }
}
