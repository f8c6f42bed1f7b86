//! Prompt templates for the coordinator, the orchestration phases, and the
//! extraction calls.

use troupe_schema::TeamAgent;

use crate::config::CoreConfig;

pub fn coordinator_system_prompt(config: &CoreConfig, user_name: Option<&str>) -> String {
    let mut prompt = format!(
        "You are {}, a meta-agent who designs teams of domain specialists for the \
         user's objective.\n\
         Propose a team as a markdown specification: a `# SUPERHUMAN TEAM: <project>` \
         heading, a `| Tier | Role | Name | Expertise |` table (tier 3 = Lead, \
         4 = Specialist, 5 = QA, exactly one Lead), and one `### <Name>` section per \
         member with their full working instructions.\n\
         Refine the specification with the user. Only when the user explicitly \
         approves the team, include the literal marker [TEAM_CONFIRMED] in your reply.",
        config.coordinator_name
    );
    if let Some(name) = user_name {
        prompt.push_str(&format!("\nAddress the user as {name}."));
    }
    prompt
}

pub fn team_extraction_system() -> String {
    "You extract team specifications from assistant messages. Read the supplied \
     conversation excerpts and produce the single normalized team they describe. \
     Use tier 3 for the Lead, 4 for Specialists, 5 for QA. Copy each member's \
     instructions verbatim and complete; do not summarize them."
        .to_string()
}

pub fn lead_system_prompt(lead: &TeamAgent) -> String {
    format!(
        "You are {}, {}.\n{}\nYou lead this team. Be decisive and concrete.",
        lead.name, lead.role, lead.instructions
    )
}

/// PLAN phase: the Lead decides which specialists run and what each one
/// gets assigned. Indices are 1-based over the tier-4 specialists listed.
pub fn lead_plan_prompt(objective: &str, specialists: &[&TeamAgent]) -> String {
    let roster: Vec<String> = specialists
        .iter()
        .enumerate()
        .map(|(idx, agent)| {
            format!(
                "{}. {} - {} ({})",
                idx + 1,
                agent.name,
                agent.role,
                agent.expertise
            )
        })
        .collect();

    format!(
        "Objective: {objective}\n\nYour specialists:\n{}\n\n\
         Analyze the objective and respond with a single JSON object:\n\
         {{\"analysis\": string, \"selectedSpecialists\": [1-based indices], \
         \"assignments\": {{\"<index>\": \"<assignment>\"}}, \
         \"deliverableOutline\": string}}\n\
         Output only the JSON object.",
        roster.join("\n")
    )
}

pub fn specialist_system_prompt(agent: &TeamAgent) -> String {
    format!(
        "You are {}, {}.\nExpertise: {}\n{}",
        agent.name, agent.role, agent.expertise, agent.instructions
    )
}

pub fn specialist_user_message(objective: &str, assignment: &str) -> String {
    format!("Objective: {objective}\n\nYour Assignment: {assignment}")
}

pub const DEFAULT_ASSIGNMENT: &str = "Contribute your expertise to the objective.";

pub fn synthesis_user_prompt(objective: &str, contributions: &[(String, String)]) -> String {
    let mut sections = String::new();
    for (name, response) in contributions {
        sections.push_str(&format!("## Input from {name}\n{response}\n\n"));
    }
    format!(
        "Objective: {objective}\n\n{sections}\
         Integrate the specialist inputs above into one coherent Markdown \
         deliverable that fulfils the objective. Write the deliverable only, \
         no meta commentary."
    )
}

pub fn qa_system_prompt(qa: &TeamAgent) -> String {
    format!(
        "You are {}, {}.\n{}\nYou review team deliverables before they reach \
         the user. Respond with a single JSON object: \
         {{\"approved\": boolean, \"question\": string?, \"notes\": string?}}. \
         Set approved=false and fill \"question\" only when something needs the \
         user's explicit decision before the deliverable can stand.",
        qa.name, qa.role, qa.instructions
    )
}

pub fn qa_review_prompt(objective: &str, deliverable: &str) -> String {
    format!(
        "Objective: {objective}\n\nDeliverable under review:\n\n{deliverable}\n\n\
         Review the deliverable. Output only the JSON verdict object."
    )
}

pub fn qa_resume_prompt(question: &str, user_reply: &str) -> String {
    format!(
        "You previously paused the review with this question to the user:\n\
         {question}\n\nThe user replied:\n{user_reply}\n\n\
         Resolve the review now. Output only the JSON verdict object, and put a \
         short explanation of the resolution in \"notes\"."
    )
}

pub fn file_analysis_system() -> String {
    "You analyze an uploaded document and design the specialist team best \
     suited to work on it."
        .to_string()
}

pub fn file_analysis_schema(max_roles: usize) -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "documentType": {"type": "string"},
            "roles": {
                "type": "array",
                "maxItems": max_roles,
                "items": {
                    "type": "object",
                    "properties": {
                        "role": {"type": "string"},
                        "name": {"type": "string"},
                        "instructions": {"type": "string"},
                        "responsibilities": {"type": "string"}
                    },
                    "required": ["role", "name"]
                }
            }
        },
        "required": ["documentType", "roles"]
    })
}

pub fn file_analysis_prompt(filename: &str, content: &str) -> String {
    format!(
        "Document: {filename}\n\n{content}\n\n\
         Identify the document type and propose the team roles (at most the \
         schema's limit) needed to work on it. Output only the JSON object."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use troupe_schema::{BehavioralLevel, Tier};

    fn agent(name: &str, role: &str, tier: Tier) -> TeamAgent {
        TeamAgent {
            agent_id: "a".into(),
            name: name.into(),
            role: role.into(),
            tier,
            expertise: "expertise".into(),
            instructions: "instructions".into(),
            behavioral_level: BehavioralLevel::None,
            provider: "anthropic".into(),
            model: "m".into(),
            responsibilities: String::new(),
        }
    }

    #[test]
    fn plan_prompt_is_one_based() {
        let s1 = agent("Ana Ruiz", "Analyst", Tier::Specialist);
        let s2 = agent("Ben Okafor", "Designer", Tier::Specialist);
        let prompt = lead_plan_prompt("launch", &[&s1, &s2]);
        assert!(prompt.contains("1. Ana Ruiz"));
        assert!(prompt.contains("2. Ben Okafor"));
        assert!(prompt.contains("selectedSpecialists"));
    }

    #[test]
    fn specialist_message_shape() {
        let msg = specialist_user_message("launch the product", "own the pricing model");
        assert!(msg.starts_with("Objective: launch the product"));
        assert!(msg.contains("\n\nYour Assignment: own the pricing model"));
    }

    #[test]
    fn coordinator_prompt_mentions_marker_and_user() {
        let config = CoreConfig::default();
        let prompt = coordinator_system_prompt(&config, Some("Alice"));
        assert!(prompt.contains("[TEAM_CONFIRMED]"));
        assert!(prompt.contains("Address the user as Alice."));
    }
}
