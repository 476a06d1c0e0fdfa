//! Prompt construction for the research loop.
//!
//! Three prompts drive the engine: the sufficiency evaluation, the article
//! quality gate, and the content compressor. Each instructs the model to
//! answer in a JSON shape that the corresponding verdict type parses
//! leniently. The scenario catalog feeds all of them.

use crate::types::EvidenceItem;
use chrono::Local;

/// Domain tags offered to the model when classifying a query or article.
///
/// One line per tag; the tag on the left must match a configurable scenario
/// profile name for routing to take effect (unknown tags fall back to
/// `general`).
pub const SCENARIO_CATALOG: &[(&str, &str)] = &[
    ("general", "general-purpose queries that fit no specific domain"),
    ("technology", "AI, machine learning, deep learning, large models, software systems"),
    ("medical", "healthcare, biotechnology, drug development, clinical practice"),
    ("finance", "digital currency, blockchain, investment, banking"),
    ("education", "online education, academic research, vocational training, edtech"),
    ("entertainment", "film, music, gaming, anime, social media, pop culture"),
    ("ecommerce", "cross-border commerce, livestream selling, digital marketing, supply chains"),
    ("legal", "legal advice, compliance, intellectual property, contract disputes"),
    ("environment", "carbon neutrality, climate change, renewable energy, conservation"),
    ("automotive", "autonomous driving, electric vehicles, smart cockpits, V2X"),
    ("agriculture", "smart farming, precision planting, agricultural drones, traceability"),
    ("energy", "grid-scale storage, smart grids, hydrogen, nuclear technology"),
    ("manufacturing", "industry 4.0, smart factories, 3D printing, robotic automation"),
    ("logistics", "autonomous delivery, smart warehousing, route optimization"),
    ("aerospace", "commercial spaceflight, satellite internet, space exploration"),
    ("fashion", "virtual fashion, sustainable fashion, smart wearables"),
    ("tourism", "smart tourism, VR tours, digitized heritage, short-stay economy"),
    ("sports", "esports, sports technology, sports analytics, wearable devices"),
    ("media", "generated content, virtual hosts, metaverse social, immersive media"),
    ("security", "data privacy, network attack and defense, biometrics, quantum cryptography"),
    ("psychology", "mental-health assessment, AI companions, cognitive therapy, brain-computer interfaces"),
];

/// Whether a tag is one the catalog knows about.
pub fn is_known_scenario(tag: &str) -> bool {
    SCENARIO_CATALOG.iter().any(|(name, _)| *name == tag)
}

/// The catalog rendered as a bulleted list for prompt interpolation.
pub fn scenario_catalog_text() -> String {
    let mut out = String::new();
    for (tag, description) in SCENARIO_CATALOG {
        out.push_str(&format!("- {tag}: {description}\n"));
    }
    out
}

fn current_date() -> String {
    Local::now().format("%Y-%m-%d").to_string()
}

/// Truncate to a character count, marking the cut.
pub(crate) fn clip(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str(" […]");
    out
}

/// Render the evidence list as a numbered digest.
///
/// Indices match the positions the compressor refers to via
/// `original_index`.
pub fn render_evidence_digest(items: &[EvidenceItem], max_chars_per_item: usize) -> String {
    if items.is_empty() {
        return "(no evidence collected yet)".to_string();
    }
    let mut out = String::new();
    for (i, item) in items.iter().enumerate() {
        out.push_str(&format!(
            "[{i}] {title}\nURL: {url}\n{content}\n\n",
            title = item.title,
            url = item.url,
            content = clip(&item.content, max_chars_per_item)
        ));
    }
    out
}

/// Prompt asking whether the collected evidence answers the query, and if
/// not, where to search next. `url_formats` are the scenario's search URL
/// templates, shown to the model so its proposals stay fetchable.
pub fn sufficiency_prompt(query: &str, evidence: &[EvidenceItem], url_formats: &[String]) -> String {
    let formats = if url_formats.is_empty() {
        String::new()
    } else {
        format!(
            "Preferred search URL formats for this scenario (substitute the encoded keywords for {{}}):\n{}\n\n",
            url_formats
                .iter()
                .map(|f| format!("- {f}"))
                .collect::<Vec<_>>()
                .join("\n")
        )
    };
    format!(
        r#"You are a research assistant. Judge whether the evidence collected so far is sufficient to answer the user's query in depth. If it is not, reflect on what is missing and propose concrete, immediately usable search URLs (with the search keywords already encoded into them).

Current date: {date}
User query: {query}

Collected evidence:
{evidence}

{formats}Answer with a single JSON object:
1. "enough": true when the evidence suffices for a thorough answer, false otherwise.
2. "search_urls": when enough is false, an array of search URLs to try next; keep them practical and directly fetchable. Empty array when enough is true.
3. "rationale": your reasoning and conclusion in plain language.
4. "scenario": the research domain this query belongs to, chosen from:
{catalog}
Output only the JSON object."#,
        date = current_date(),
        query = query,
        evidence = render_evidence_digest(evidence, 2_000),
        catalog = scenario_catalog_text(),
    )
}

/// Prompt asking the model to gate one fetched article: accept or reject,
/// with an optional compressed body when the article runs long.
pub fn quality_prompt(query: &str, content: &str, max_words: usize) -> String {
    format!(
        r#"You are a content quality assessor. Evaluate the fetched article below against the user's query and answer with a single JSON object:
1. "accept": true when the article is relevant to the query and substantive, false when it is irrelevant or low quality. When false, stop after filling "reason".
2. "reason": one sentence explaining the verdict.
3. "title": a short title for the article, at most 20 words.
4. "compressed_body": when the article exceeds {max_words} words, a compressed version that keeps the original wording (no added summaries of your own) and fills close to {max_words} words so little meaning is lost. Omit the field when no compression is needed.
5. "scenario": the domain of the article content, chosen from:
{catalog}
Output only the JSON object, no other text.

Current date: {date}
User query: {query}
Article content:
{content}"#,
        max_words = max_words,
        catalog = scenario_catalog_text(),
        date = current_date(),
        query = query,
        content = content,
    )
}

/// Prompt asking the model to compress the evidence list plus one new item
/// under a token target.
pub fn compression_prompt(
    query: &str,
    existing: &[EvidenceItem],
    new_item: &EvidenceItem,
    target_tokens: usize,
) -> String {
    format!(
        r#"You are a research assistant managing a bounded evidence list. Decide how to compress the collected articles so the most relevant information survives.

Current date: {date}
User query: {query}

Collected articles (referenced below by their index):
{existing}
New article (index -1):
URL: {new_url}
Title: {new_title}
{new_content}

You must:
1. Judge each article's relevance to the query.
2. Decide which articles to keep, which to compress, and which to drop.
3. Compress kept articles so the total stays under {target_tokens} tokens.
4. Preserve the most relevant and information-dense material.

Answer with a single JSON object:
{{
  "decisions": {{
    "reasoning": "how you decided",
    "strategy": "the compression strategy you applied"
  }},
  "compressed_results": [
    {{
      "original_index": 0,
      "url": "article url",
      "title": "article title",
      "content": "the kept (possibly compressed) content",
      "compressed": true
    }}
  ]
}}
Use original_index -1 for the new article. Output only the JSON object."#,
        date = current_date(),
        query = query,
        existing = render_evidence_digest(existing, 4_000),
        new_url = new_item.url,
        new_title = new_item.title,
        new_content = clip(&new_item.content, 4_000),
        target_tokens = target_tokens,
    )
}
