// Prompt fragments shared by every caller of the LLM client.
// Task-specific templates live next to the code that renders them.

/// System prompt fragment that enforces markdown-only output.
pub const MARKDOWN_ONLY_SYSTEM: &str = "You are a precise resume editor. \
    You MUST respond with the resume in markdown only. \
    Use '# ' for the candidate name, '## ' for section headings and '- ' for bullets. \
    Do NOT include any commentary before or after the resume. \
    Do NOT include explanations or apologies.";

/// Common instruction appended to all rewriting prompts.
pub const GROUNDING_INSTRUCTION: &str = "\
    CRITICAL: Every statement in your output must be supported by the original resume. \
    Do NOT invent employers, titles, dates, degrees, metrics or technologies. \
    You may reorder, rephrase, emphasize and omit; you may not fabricate.";
