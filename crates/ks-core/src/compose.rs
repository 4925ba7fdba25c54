use serde::Serialize;
use tracing::warn;

use crate::collab::Generator;
use crate::error::CoreResult;
use crate::gate::Refusal;
use crate::kernel::KernelProfile;
use crate::pack::ContextPack;

const APHORISM_CHARS: usize = 200;
const PROMPT_CONTEXT_CHARS: usize = 200;
const PROMPT_PASSAGE_CHARS: usize = 300;
const PROMPT_TENSIONS: usize = 5;
const PROMPT_PASSAGES: usize = 8;
const FOOTNOTES_PER_KIND: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComposeMethod {
    Template,
    Generative,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComposeTrace {
    pub method: ComposeMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generator: Option<String>,
    pub poles: Vec<String>,
    pub tensions_used: usize,
    pub chunks_used: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Answer {
    pub text: String,
    pub trace: ComposeTrace,
}

fn truncate_chars(s: &str, n: usize) -> String {
    s.chars().take(n).collect()
}

fn source_or_unknown(source: &str) -> &str {
    if source.trim().is_empty() { "Unknown" } else { source }
}

/// Deterministic answer: aphorism, counsel, edict, footnotes.
pub fn compose_template(pack: &ContextPack) -> String {
    let mut sections: Vec<String> = Vec::new();

    if let Some(first) = pack.tensions.first() {
        let quote = truncate_chars(&first.tension.context_snippet, APHORISM_CHARS);
        sections.push(format!("\"{quote}...\""));
    }

    let mut counsel: Vec<String> = Vec::new();
    if let Some(first) = pack.poles.first() {
        let second = pack.poles.get(1).map_or("alternatives", String::as_str);
        counsel.push(format!("• Weigh {first} vs {second}"));
    }
    if !pack.tensions.is_empty() {
        let avg = pack.tensions.iter().map(|s| s.tension.scar_valence).sum::<f64>()
            / pack.tensions.len() as f64;
        counsel.push(format!("• Remembered cost: {avg:.2}"));
    }
    counsel.push("• Choose what preserves character and the hive".to_string());
    sections.push(counsel.join("\n"));

    match pack.poles.first() {
        Some(pole) => sections.push(format!("Edict: Balance {pole} with wisdom; maintain agency.")),
        None => sections.push("Edict: Act with virtue; preserve your character.".to_string()),
    }

    let footnotes: Vec<String> = pack
        .tensions
        .iter()
        .take(FOOTNOTES_PER_KIND)
        .map(|s| (source_or_unknown(&s.tension.source_label), s.tension.id.as_str()))
        .chain(
            pack.chunks
                .iter()
                .take(FOOTNOTES_PER_KIND)
                .map(|s| (source_or_unknown(&s.chunk.source_label), s.chunk.id.as_str())),
        )
        .enumerate()
        .map(|(i, (source, id))| format!("[{}] {source} — {id}", i + 1))
        .collect();
    if !footnotes.is_empty() {
        sections.push(format!("\n{}", footnotes.join("\n")));
    }

    sections.join("\n\n")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompts {
    pub system: String,
    pub user: String,
}

pub fn build_prompts(profile: &KernelProfile, pack: &ContextPack) -> Prompts {
    let poles = if pack.poles.is_empty() {
        "the question at hand".to_string()
    } else {
        pack.poles.join(", ")
    };
    let mut system = format!(
        "You are {}, responding in first person based on your writings and life experiences.\n",
        profile.display_name()
    );
    if !profile.bio.trim().is_empty() {
        system.push_str(&format!("\nAbout you: {}\n", profile.bio.trim()));
    }
    system.push_str(&format!(
        "\nWrite a thoughtful essay-style answer that:\n\
         1. Explores the tension between the poles: {poles}\n\
         2. Draws from the provided contradictions and memories\n\
         3. Cites sources as [1], [2], etc.\n\
         4. Uses natural, flowing prose with section headers\n\
         5. Closes with a principle or directive\n\n\
         End with the footnotes, one per line: [n] Source — ID\n"
    ));

    let tensions: String = pack
        .tensions
        .iter()
        .take(PROMPT_TENSIONS)
        .enumerate()
        .map(|(i, s)| {
            format!(
                "{}. {} vs {}: {}...\n",
                i + 1,
                s.tension.pole_a,
                s.tension.pole_b,
                truncate_chars(&s.tension.context_snippet, PROMPT_CONTEXT_CHARS)
            )
        })
        .collect();
    let passages: String = pack
        .chunks
        .iter()
        .take(PROMPT_PASSAGES)
        .enumerate()
        .map(|(i, s)| {
            format!(
                "{}. {}... (source: {})\n",
                i + 1,
                truncate_chars(&s.chunk.text, PROMPT_PASSAGE_CHARS),
                source_or_unknown(&s.chunk.source_label)
            )
        })
        .collect();

    let user = format!(
        "Question: {}\n\nContradictions from your life:\n{}\nMemories and passages:\n{}\n\
         Write your answer in essay form, citing sources with [1], [2], etc.",
        pack.query,
        if tensions.is_empty() { "No specific contradictions found.\n" } else { tensions.as_str() },
        if passages.is_empty() { "No specific memories found.\n" } else { passages.as_str() },
    );

    Prompts { system, user }
}

fn trace(pack: &ContextPack, method: ComposeMethod) -> ComposeTrace {
    ComposeTrace {
        method,
        generator: None,
        poles: pack.poles.clone(),
        tensions_used: pack.tensions.len(),
        chunks_used: pack.chunks.len(),
        fallback_reason: None,
    }
}

/// Compose an answer for a pack the gate let through. With a generator,
/// upstream failures fall back to the template and are recorded in the trace.
pub fn compose_answer(
    profile: &KernelProfile,
    pack: &ContextPack,
    generator: Option<&dyn Generator>,
) -> CoreResult<Answer> {
    let Some(generator) = generator else {
        return Ok(Answer {
            text: compose_template(pack),
            trace: trace(pack, ComposeMethod::Template),
        });
    };

    let prompts = build_prompts(profile, pack);
    let fallback_reason = match generator.generate(&prompts.system, &prompts.user) {
        Ok(text) if !text.trim().is_empty() => {
            let mut t = trace(pack, ComposeMethod::Generative);
            t.generator = Some(generator.name().to_string());
            return Ok(Answer { text, trace: t });
        }
        Ok(_) => "generator returned empty text".to_string(),
        Err(e) if e.is_upstream() => e.to_string(),
        Err(e) => return Err(e),
    };

    warn!(generator = generator.name(), reason = %fallback_reason, "generation failed, using template");
    let mut t = trace(pack, ComposeMethod::Template);
    t.generator = Some(generator.name().to_string());
    t.fallback_reason = Some(fallback_reason);
    Ok(Answer {
        text: compose_template(pack),
        trace: t,
    })
}

/// Text shown for a refused query.
pub fn refusal_text(refusal: &Refusal) -> String {
    format!("Ω_clear: {}", refusal.message)
}
