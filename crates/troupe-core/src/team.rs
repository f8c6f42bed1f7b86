//! Team specification lifecycle: activation phrase detection, recognition
//! of team-related coordinator output, extraction of a normalized team
//! specification (LLM first, regex fallback), and conversion into
//! persistable team agents.

use std::sync::Arc;

use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use troupe_provider::StructuredRequest;
use troupe_schema::{BehavioralLevel, TeamAgent, Tier};

use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::prompts;
use crate::router::LlmRouter;

/// In-band literal the coordinator emits when the user approves a team.
pub const TEAM_CONFIRMED_MARKER: &str = "[TEAM_CONFIRMED]";

/// Remove every occurrence of the confirmation marker from user-visible
/// text, tidying whitespace left behind.
pub fn strip_team_confirmed(text: &str) -> String {
    if !text.contains(TEAM_CONFIRMED_MARKER) {
        return text.to_string();
    }
    text.replace(TEAM_CONFIRMED_MARKER, "")
        .trim_end()
        .to_string()
}

/// Match the activation phrase and pull out the user's name. An activation
/// with no name yields `"User"`.
pub fn detect_activation(text: &str, pattern: &Regex) -> Option<String> {
    let captures = pattern.captures(text.trim_start())?;
    let name = captures
        .get(1)
        .map(|m| m.as_str().trim())
        .unwrap_or_default();
    if name.is_empty() {
        Some("User".to_string())
    } else {
        Some(name.to_string())
    }
}

const TEAM_MARKERS: &[&str] = &[
    "# SUPERHUMAN TEAM:",
    "## SUPERHUMAN SPECIFICATIONS",
    "SUPERHUMAN TEAM:",
    "## TEAM COMPOSITION",
    "### Team Member",
    "| Tier | Role",
];

/// Whether an assistant message plausibly carries (part of) a team
/// specification.
pub fn is_team_related(text: &str) -> bool {
    if text.len() < 100 {
        return false;
    }
    if TEAM_MARKERS.iter().any(|marker| text.contains(marker)) {
        return true;
    }
    // Tab-separated variant of the tier table header.
    Regex::new(r"Tier\t+Role")
        .map(|re| re.is_match(text))
        .unwrap_or(false)
}

const GENERIC_SECTION_HEADERS: &[&str] = &[
    "professional foundation",
    "expertise architecture",
    "operational parameters",
    "excellence framework",
    "quality assurance",
    "project integration",
    "team composition",
    "behavioral science",
    "domain specialist",
    "collaboration protocol",
    "success metrics",
    "deliverables",
];

const HONORIFICS: &[&str] = &["Dr.", "Dr", "Mr.", "Mr", "Ms.", "Ms", "Mrs.", "Mrs", "Prof.", "Prof"];

/// Heuristic for "this section header is a person, not a rubric".
pub fn looks_like_person_name(candidate: &str) -> bool {
    let cleaned = candidate.trim().trim_matches('*').trim();
    let lowered = cleaned.to_lowercase();
    if GENERIC_SECTION_HEADERS
        .iter()
        .any(|header| lowered.contains(header))
    {
        return false;
    }

    let mut tokens: Vec<&str> = cleaned.split_whitespace().collect();
    while let Some(first) = tokens.first() {
        if HONORIFICS.contains(first) {
            tokens.remove(0);
        } else {
            break;
        }
    }

    if tokens.len() < 2 {
        return false;
    }
    if !tokens.iter().all(|token| token.chars().count() >= 2) {
        return false;
    }
    tokens[0]
        .chars()
        .next()
        .map(char::is_uppercase)
        .unwrap_or(false)
}

/// Project complexity as graded by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Complexity {
    #[serde(rename = "LOW")]
    Low,
    #[serde(rename = "MODERATE")]
    #[default]
    Moderate,
    #[serde(rename = "HIGH")]
    High,
    #[serde(rename = "VERY_HIGH")]
    VeryHigh,
}

fn default_tier() -> u8 {
    4
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedMember {
    pub name: String,
    #[serde(default)]
    pub role: String,
    #[serde(default = "default_tier")]
    pub tier: u8,
    #[serde(default)]
    pub expertise: String,
    #[serde(default)]
    pub behavioral_level: BehavioralLevel,
    #[serde(default)]
    pub instructions: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedTeam {
    #[serde(default)]
    pub project_name: String,
    #[serde(default)]
    pub complexity: Complexity,
    #[serde(default)]
    pub team_size: usize,
    #[serde(default)]
    pub members: Vec<ExtractedMember>,
}

/// JSON schema the structured extraction call must satisfy.
pub fn extraction_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "projectName": {"type": "string"},
            "complexity": {"type": "string", "enum": ["LOW", "MODERATE", "HIGH", "VERY_HIGH"]},
            "teamSize": {"type": "integer"},
            "members": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "name": {"type": "string"},
                        "role": {"type": "string"},
                        "tier": {"type": "integer", "enum": [3, 4, 5]},
                        "expertise": {"type": "string"},
                        "behavioralLevel": {
                            "type": "string",
                            "enum": ["NONE", "ENTRY-MODERATE", "MODERATE-EXPERT", "EXPERT"]
                        },
                        "instructions": {"type": "string"}
                    },
                    "required": ["name", "role", "tier"]
                }
            }
        },
        "required": ["projectName", "complexity", "teamSize", "members"]
    })
}

/// Extracts a normalized team specification from coordinator output.
pub struct TeamExtractor {
    router: Arc<LlmRouter>,
    provider_id: String,
    model: String,
    max_chars: usize,
}

impl TeamExtractor {
    pub fn new(
        router: Arc<LlmRouter>,
        provider_id: impl Into<String>,
        model: impl Into<String>,
        max_chars: usize,
    ) -> Self {
        Self {
            router,
            provider_id: provider_id.into(),
            model: model.into(),
            max_chars,
        }
    }

    /// Run the extraction pipeline over team-related assistant messages in
    /// time order. LLM extraction first; pure regex parsing when the LLM
    /// call or its JSON fails.
    pub async fn extract(&self, messages: &[String]) -> CoreResult<ExtractedTeam> {
        if messages.is_empty() {
            return Err(CoreError::TeamExtractionFailed);
        }

        let combined = tail_chars(&messages.join("\n\n---\n\n"), self.max_chars).to_string();

        let mut team = match self.extract_llm(&combined).await {
            Ok(team) if !team.members.is_empty() => {
                let mut team = team;
                validate_and_enhance(&mut team, messages);
                team
            }
            Ok(_) => {
                tracing::warn!("LLM extraction returned no members, falling back to regex");
                extract_team_regex(messages)
            }
            Err(err) => {
                tracing::warn!("LLM extraction failed ({err}), falling back to regex");
                extract_team_regex(messages)
            }
        };

        if team.members.is_empty() {
            return Err(CoreError::TeamExtractionFailed);
        }
        team.team_size = team.members.len();
        Ok(team)
    }

    async fn extract_llm(&self, combined: &str) -> CoreResult<ExtractedTeam> {
        let value = self
            .router
            .parse(
                &self.provider_id,
                StructuredRequest {
                    model: self.model.clone(),
                    schema: extraction_schema(),
                    system: Some(prompts::team_extraction_system()),
                    messages: vec![troupe_provider::LlmMessage::user(combined.to_string())],
                    max_tokens: 8192,
                },
            )
            .await
            .map_err(CoreError::Provider)?;

        serde_json::from_value(value)
            .map_err(|e| CoreError::StructuredParse(format!("team schema mismatch: {e}")))
    }
}

/// Keep the trailing `max_chars` characters, respecting char boundaries.
fn tail_chars(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    let skip = count - max_chars;
    match text.char_indices().nth(skip) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

/// Regex safety pass over an LLM extraction: warn about member names the
/// source mentions that the extraction missed, and replace short
/// instructions with the longer specification block when one exists.
fn validate_and_enhance(team: &mut ExtractedTeam, messages: &[String]) {
    let candidate_re =
        Regex::new(r"(?m)^###\s+((?:[A-Z][a-zA-Z'\-]+)(?:\s+[A-Z][a-zA-Z'\-]+)+)\s*$")
            .expect("candidate name regex");

    let mut source_names: Vec<String> = Vec::new();
    for message in messages {
        for captures in candidate_re.captures_iter(message) {
            let name = captures[1].trim().to_string();
            if looks_like_person_name(&name)
                && !source_names.iter().any(|n| n.eq_ignore_ascii_case(&name))
            {
                source_names.push(name);
            }
        }
    }

    for name in &source_names {
        let extracted = team
            .members
            .iter()
            .any(|m| m.name.eq_ignore_ascii_case(name));
        if !extracted {
            tracing::warn!("source messages mention '{name}' but extraction missed them");
        }
    }

    for member in &mut team.members {
        if member.instructions.len() >= 500 {
            continue;
        }
        if let Some(block) = find_spec_block(messages, &member.name) {
            if block.len() > member.instructions.len() {
                member.instructions = block;
            }
        }
    }
}

/// The longest `### <Name>` block across the source messages, running until
/// the next `### <TitleCase>` heading or any `## ` heading.
fn find_spec_block(messages: &[String], name: &str) -> Option<String> {
    let heading = Regex::new(&format!(
        r"(?m)^###\s+(?:\*\*)?{}(?:\*\*)?\s*$",
        regex::escape(name)
    ))
    .ok()?;
    let boundary = Regex::new(r"(?m)^###\s+[A-Z]|^##\s").expect("block boundary regex");

    let mut best: Option<String> = None;
    for message in messages {
        for found in heading.find_iter(message) {
            let rest = &message[found.end()..];
            let end = boundary
                .find(rest)
                .map(|b| b.start())
                .unwrap_or(rest.len());
            let block = rest[..end].trim().to_string();
            if block.is_empty() {
                continue;
            }
            if best.as_ref().map(|b| block.len() > b.len()).unwrap_or(true) {
                best = Some(block);
            }
        }
    }
    best
}

/// Pure-regex extraction path: tier tables plus specification sections,
/// merged across messages with latest-non-empty field values and longest
/// instructions per member.
pub fn extract_team_regex(messages: &[String]) -> ExtractedTeam {
    let mut team = ExtractedTeam::default();

    for message in messages {
        if team.project_name.is_empty() {
            if let Some(name) = extract_project_name(message) {
                team.project_name = name;
            }
        }
        if let Some(complexity) = extract_complexity(message) {
            team.complexity = complexity;
        }

        for member in extract_table_members(message) {
            merge_member(&mut team.members, member);
        }
        for member in extract_section_members(message) {
            merge_member(&mut team.members, member);
        }
    }

    team.team_size = team.members.len();
    team
}

fn extract_project_name(text: &str) -> Option<String> {
    let re = Regex::new(r"(?m)^#*\s*SUPERHUMAN TEAM:\s*(.+?)\s*$").ok()?;
    re.captures(text)
        .map(|c| c[1].trim().to_string())
        .filter(|s| !s.is_empty())
}

fn extract_complexity(text: &str) -> Option<Complexity> {
    let re = Regex::new(r"(?i)complexity[^\n]*?\b(VERY[_ ]HIGH|HIGH|MODERATE|LOW)\b").ok()?;
    let captured = re.captures(text)?[1].to_uppercase().replace(' ', "_");
    match captured.as_str() {
        "LOW" => Some(Complexity::Low),
        "MODERATE" => Some(Complexity::Moderate),
        "HIGH" => Some(Complexity::High),
        "VERY_HIGH" => Some(Complexity::VeryHigh),
        _ => None,
    }
}

/// Parse markdown tier tables. The header row names the columns; rows with
/// a tier of 3, 4 or 5 and a plausible person name become members.
fn extract_table_members(text: &str) -> Vec<ExtractedMember> {
    let mut members = Vec::new();
    let mut header: Option<Vec<String>> = None;

    for line in text.lines() {
        let trimmed = line.trim();
        if !trimmed.starts_with('|') {
            header = None;
            continue;
        }

        let cells: Vec<String> = trimmed
            .trim_matches('|')
            .split('|')
            .map(|cell| cell.trim().trim_matches('*').trim().to_string())
            .collect();

        if cells.iter().all(|cell| {
            cell.chars().all(|c| c == '-' || c == ':' || c.is_whitespace()) && !cell.is_empty()
        }) {
            continue;
        }

        let lowered: Vec<String> = cells.iter().map(|c| c.to_lowercase()).collect();
        if lowered.iter().any(|c| c.contains("tier")) && lowered.iter().any(|c| c.contains("role"))
        {
            header = Some(lowered);
            continue;
        }

        let Some(columns) = &header else { continue };
        let find_col = |needles: &[&str]| {
            columns
                .iter()
                .position(|c| needles.iter().any(|needle| c.contains(needle)))
        };

        let tier_col = find_col(&["tier"]);
        let role_col = find_col(&["role"]);
        let name_col = find_col(&["name", "member", "specialist"]);
        let expertise_col = find_col(&["expertise", "specialization", "domain"]);
        let behavioral_col = find_col(&["behavioral"]);

        let tier = tier_col
            .and_then(|idx| cells.get(idx))
            .and_then(|cell| cell.chars().find(|c| ('3'..='5').contains(c)))
            .and_then(|c| c.to_digit(10))
            .map(|d| d as u8);
        let Some(tier) = tier else { continue };

        let name = name_col
            .and_then(|idx| cells.get(idx))
            .cloned()
            .unwrap_or_default();
        if !looks_like_person_name(&name) {
            continue;
        }

        members.push(ExtractedMember {
            name,
            role: role_col
                .and_then(|idx| cells.get(idx))
                .cloned()
                .unwrap_or_default(),
            tier,
            expertise: expertise_col
                .and_then(|idx| cells.get(idx))
                .cloned()
                .unwrap_or_default(),
            behavioral_level: behavioral_col
                .and_then(|idx| cells.get(idx))
                .map(|cell| parse_behavioral_level(cell))
                .unwrap_or_default(),
            instructions: String::new(),
        });
    }

    members
}

fn parse_behavioral_level(cell: &str) -> BehavioralLevel {
    let upper = cell.to_uppercase();
    if upper.contains("ENTRY") {
        BehavioralLevel::EntryModerate
    } else if upper.contains("MODERATE-EXPERT") || upper.contains("MODERATE EXPERT") {
        BehavioralLevel::ModerateExpert
    } else if upper.contains("EXPERT") {
        BehavioralLevel::Expert
    } else {
        BehavioralLevel::None
    }
}

/// Parse `### <Person Name>` specification sections into members with
/// full-length instructions.
fn extract_section_members(text: &str) -> Vec<ExtractedMember> {
    let heading_re = Regex::new(r"(?m)^###\s+(.+?)\s*$").expect("heading regex");
    let role_re = Regex::new(r"(?im)^[-*\s]*(?:\*\*)?Role(?:\*\*)?\s*:\s*(.+)$").expect("role regex");
    let expertise_re = Regex::new(r"(?im)^[-*\s]*(?:\*\*)?Expertise(?:\*\*)?\s*:\s*(.+)$")
        .expect("expertise regex");
    let tier_re = Regex::new(r"(?im)^[-*\s]*(?:\*\*)?Tier(?:\*\*)?\s*:\s*([345])").expect("tier regex");

    let mut members = Vec::new();
    let headings: Vec<(usize, usize, String)> = heading_re
        .captures_iter(text)
        .filter_map(|captures| {
            let whole = captures.get(0)?;
            Some((
                whole.start(),
                whole.end(),
                captures[1].trim().trim_matches('*').trim().to_string(),
            ))
        })
        .collect();

    for (idx, (_, body_start, name)) in headings.iter().enumerate() {
        if !looks_like_person_name(name) {
            continue;
        }

        // Block runs to the next heading of any level.
        let body_end = headings
            .get(idx + 1)
            .map(|(next_start, _, _)| *next_start)
            .unwrap_or(text.len());
        let body_end = text[*body_start..body_end]
            .find("\n## ")
            .map(|offset| *body_start + offset)
            .unwrap_or(body_end);
        let block = text[*body_start..body_end].trim().to_string();

        members.push(ExtractedMember {
            name: name.clone(),
            role: role_re
                .captures(&block)
                .map(|c| c[1].trim().to_string())
                .unwrap_or_default(),
            tier: tier_re
                .captures(&block)
                .and_then(|c| c[1].parse().ok())
                .unwrap_or(4),
            expertise: expertise_re
                .captures(&block)
                .map(|c| c[1].trim().to_string())
                .unwrap_or_default(),
            behavioral_level: BehavioralLevel::None,
            instructions: block,
        });
    }

    members
}

/// Merge a newly parsed member into the accumulated list. Later non-empty
/// values win, except instructions where the longest text wins.
fn merge_member(members: &mut Vec<ExtractedMember>, incoming: ExtractedMember) {
    let existing = members
        .iter_mut()
        .find(|m| m.name.eq_ignore_ascii_case(&incoming.name));

    let Some(existing) = existing else {
        members.push(incoming);
        return;
    };

    if !incoming.role.is_empty() {
        existing.role = incoming.role;
    }
    if !incoming.expertise.is_empty() {
        existing.expertise = incoming.expertise;
    }
    if incoming.behavioral_level != BehavioralLevel::None {
        existing.behavioral_level = incoming.behavioral_level;
    }
    if incoming.tier != 4 || existing.tier == 4 {
        existing.tier = incoming.tier;
    }
    if incoming.instructions.len() > existing.instructions.len() {
        existing.instructions = incoming.instructions;
    }
}

/// Lowercased slug with every non-alphanumeric character mapped to `_`,
/// capped at `max_len` characters.
pub fn slugify(source: &str, max_len: usize) -> String {
    source
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .take(max_len)
        .collect()
}

/// Convert an extracted team into persistable agents. Exactly one tier-3
/// Lead survives conversion: a missing Lead promotes the first member,
/// surplus Leads demote to Specialist.
pub fn convert_to_agents(
    conversation_id: &str,
    team: &ExtractedTeam,
    config: &CoreConfig,
) -> Vec<TeamAgent> {
    let timestamp = Utc::now().timestamp_millis();

    let mut agents: Vec<TeamAgent> = team
        .members
        .iter()
        .enumerate()
        .map(|(index, member)| {
            let tier = Tier::try_from(member.tier).unwrap_or(Tier::Specialist);
            let slug_source = if member.role.trim().is_empty() {
                &member.name
            } else {
                &member.role
            };
            let model_ref = match tier {
                Tier::Lead => &config.lead_model,
                Tier::Specialist => &config.specialist_model,
                Tier::Qa => &config.qa_model,
            };
            TeamAgent {
                agent_id: format!(
                    "team_{}_{}_{}_{}",
                    conversation_id,
                    slugify(slug_source, 30),
                    timestamp,
                    index
                ),
                name: member.name.clone(),
                role: member.role.clone(),
                tier,
                expertise: member.expertise.clone(),
                instructions: member.instructions.clone(),
                behavioral_level: member.behavioral_level,
                provider: model_ref.provider.clone(),
                model: model_ref.model.clone(),
                responsibilities: member.expertise.clone(),
            }
        })
        .collect();

    enforce_single_lead(&mut agents, config);
    agents
}

fn enforce_single_lead(agents: &mut [TeamAgent], config: &CoreConfig) {
    let mut seen_lead = false;
    for agent in agents.iter_mut() {
        if agent.tier == Tier::Lead {
            if seen_lead {
                agent.tier = Tier::Specialist;
                agent.provider = config.specialist_model.provider.clone();
                agent.model = config.specialist_model.model.clone();
            }
            seen_lead = true;
        }
    }

    if !seen_lead {
        if let Some(first) = agents.first_mut() {
            first.tier = Tier::Lead;
            first.provider = config.lead_model.provider.clone();
            first.model = config.lead_model.model.clone();
        }
    }
}
