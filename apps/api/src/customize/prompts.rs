/// Prompt for tailoring an extracted resume to one job posting.
pub const CUSTOMIZE_PROMPT_TEMPLATE: &str = r#"Tailor the resume below to the target job.

{grounding_instruction}

Guidelines:
- Lead with the experience and skills most relevant to the job description.
- Mirror the job's terminology where the resume already supports it.
- Keep every bullet to one or two lines; prefer quantified outcomes.
- Keep the candidate's contact details unchanged.

TARGET JOB
Title: {job_title}
Company: {company_name}
Description:
{job_description}

ORIGINAL RESUME
{resume_text}
"#;
