//! Artifact blocks embedded in assistant text.
//!
//! An artifact looks like:
//!
//! ````text
//! :::artifact{identifier="report-v1" type="text/markdown" title="Report"}
//! ```markdown
//! # Report body
//! ```
//! :::
//! ````
//!
//! Attributes come from the opening tag; the content is the first fenced
//! code block inside the artifact.

use regex::Regex;
use troupe_memory::artifact_dedupe_key;

#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    /// The whole block as it appeared, opening tag through closing `:::`.
    pub full_text: String,
    pub identifier: Option<String>,
    pub artifact_type: Option<String>,
    pub title: Option<String>,
    pub content: String,
}

impl Artifact {
    /// Dedupe key for KB upsert: `<conversation>:<stable id>`.
    pub fn dedupe_key(&self, conversation_id: &str) -> String {
        artifact_dedupe_key(
            conversation_id,
            self.identifier.as_deref(),
            self.title.as_deref(),
        )
    }
}

/// Parse every artifact block in the text, in order of appearance.
pub fn extract_artifacts(text: &str) -> Vec<Artifact> {
    let block_re = Regex::new(r"(?s):::artifact\{([^}]*)\}(.*?)(?::::|\z)")
        .expect("artifact block regex");
    let attr_re = Regex::new(r#"(\w+)="([^"]*)""#).expect("artifact attr regex");
    let fence_re = Regex::new(r"(?s)```[a-zA-Z0-9_-]*\n(.*?)```").expect("fence regex");

    let mut artifacts = Vec::new();
    for captures in block_re.captures_iter(text) {
        let whole = captures.get(0).map(|m| m.as_str()).unwrap_or_default();
        let attrs = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
        let body = captures.get(2).map(|m| m.as_str()).unwrap_or_default();

        let mut identifier = None;
        let mut artifact_type = None;
        let mut title = None;
        for attr in attr_re.captures_iter(attrs) {
            let value = attr[2].to_string();
            match &attr[1] {
                "identifier" => identifier = Some(value),
                "type" => artifact_type = Some(value),
                "title" => title = Some(value),
                _ => {}
            }
        }

        let content = fence_re
            .captures(body)
            .map(|fence| fence[1].trim_end_matches('\n').to_string())
            .unwrap_or_else(|| body.trim().to_string());

        artifacts.push(Artifact {
            full_text: whole.to_string(),
            identifier,
            artifact_type,
            title,
            content,
        });
    }

    artifacts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(attrs: &str, inner: &str) -> String {
        format!(":::artifact{{{attrs}}}\n{inner}\n:::")
    }

    #[test]
    fn no_artifacts_in_plain_text() {
        assert!(extract_artifacts("Just a normal reply with ```code``` in it.").is_empty());
    }

    #[test]
    fn parses_attributes_and_content() {
        let text = block(
            r#"identifier="report-v1" type="text/markdown" title="Q3 Report""#,
            "```markdown\n# Q3 Report\n\nRevenue grew.\n```",
        );
        let artifacts = extract_artifacts(&text);
        assert_eq!(artifacts.len(), 1);
        let artifact = &artifacts[0];
        assert_eq!(artifact.identifier.as_deref(), Some("report-v1"));
        assert_eq!(artifact.artifact_type.as_deref(), Some("text/markdown"));
        assert_eq!(artifact.title.as_deref(), Some("Q3 Report"));
        assert_eq!(artifact.content, "# Q3 Report\n\nRevenue grew.");
        assert!(artifact.full_text.starts_with(":::artifact{"));
    }

    #[test]
    fn first_fence_wins() {
        let text = block(
            r#"title="Two Fences""#,
            "```\nfirst fence\n```\nprose\n```\nsecond fence\n```",
        );
        let artifacts = extract_artifacts(&text);
        assert_eq!(artifacts[0].content, "first fence");
    }

    #[test]
    fn multiple_artifacts_in_order() {
        let text = format!(
            "intro\n{}\nmiddle\n{}\n",
            block(r#"identifier="a""#, "```\nA\n```"),
            block(r#"identifier="b""#, "```\nB\n```")
        );
        let artifacts = extract_artifacts(&text);
        assert_eq!(artifacts.len(), 2);
        assert_eq!(artifacts[0].identifier.as_deref(), Some("a"));
        assert_eq!(artifacts[1].identifier.as_deref(), Some("b"));
    }

    #[test]
    fn missing_fence_falls_back_to_body() {
        let text = block(r#"title="Loose""#, "raw body, no fence");
        let artifacts = extract_artifacts(&text);
        assert_eq!(artifacts[0].content, "raw body, no fence");
    }

    #[test]
    fn unterminated_block_parses_to_end() {
        let text = ":::artifact{title=\"Open\"}\n```\ndangling\n```";
        let artifacts = extract_artifacts(text);
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].content, "dangling");
    }

    #[test]
    fn dedupe_key_uses_identifier_then_title() {
        let with_id = extract_artifacts(&block(
            r#"identifier="fixed-id" title="Some Title""#,
            "```\nx\n```",
        ));
        assert_eq!(with_id[0].dedupe_key("c1"), "c1:fixed-id");

        let with_title =
            extract_artifacts(&block(r#"title="Some Title!""#, "```\nx\n```"));
        assert_eq!(with_title[0].dedupe_key("c1"), "c1:some_title");

        let bare = extract_artifacts(&block("", "```\nx\n```"));
        assert_eq!(bare[0].dedupe_key("c1"), "c1:default-artifact");
    }
}
