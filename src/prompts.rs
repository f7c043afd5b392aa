//! Prompts for VLM-based homework question extraction.
//!
//! Centralising the prompts keeps the extraction contract (what to keep,
//! what to drop, the JSON shape) in one place, and lets tests inspect the
//! generated text without calling a model.

use crate::config::GradeLevel;

/// Fixed system prompt establishing the assistant's role.
pub const SYSTEM_PROMPT: &str = "You are an expert educational assistant that reads photos of \
homework pages and extracts the question text exactly as written. You never answer the \
question, never add commentary, and always respond with a single JSON object.";

/// Build the user instruction for a page at the given grade level.
///
/// The instruction enumerates what to extract and what to exclude, imposes
/// the single-question policy, and specifies the JSON output contract. The
/// `educationLevel` field must echo `grade`.
pub fn build_user_prompt(grade: GradeLevel) -> String {
    format!(
        r#"Extract the homework question from this image. The student is in {level}.

EXTRACT:
- The complete text of ONE question, exactly as written
- All multiple-choice options, if present (keep their labels, e.g. A), B), C))
- A brief description of any diagram, graph, or figure that is needed to understand the question

EXCLUDE:
- Any student answers, handwritten work, or filled-in responses
- Other questions on the page
- Headers, footers, page numbers, and worksheet titles
- Teacher marks, grades, stamps, and corrections

If multiple questions are visible, extract only the FIRST complete question.

Respond with ONLY a JSON object in exactly this format:
{{
  "questionText": "the extracted question text, or an empty string if extraction failed",
  "confidence": 0.0 to 1.0,
  "noiseFiltered": true if you removed answers or other non-question content, otherwise false,
  "errorMessage": null, or a short explanation if no question could be extracted,
  "educationLevel": "{echo}"
}}"#,
        level = grade.describe(),
        echo = grade.as_str(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_prompt_echoes_grade_level() {
        let p = build_user_prompt(GradeLevel::High);
        assert!(p.contains("high school"));
        assert!(p.contains(r#""educationLevel": "high""#));
    }

    #[test]
    fn user_prompt_states_single_question_policy() {
        let p = build_user_prompt(GradeLevel::Middle);
        assert!(p.contains("only the FIRST complete question"));
    }

    #[test]
    fn user_prompt_lists_exclusions() {
        let p = build_user_prompt(GradeLevel::Elementary);
        for needle in ["student answers", "Other questions", "page numbers", "Teacher marks"] {
            assert!(p.contains(needle), "missing '{needle}'");
        }
    }

    #[test]
    fn user_prompt_names_every_contract_field() {
        let p = build_user_prompt(GradeLevel::Middle);
        for field in [
            "questionText",
            "confidence",
            "noiseFiltered",
            "errorMessage",
            "educationLevel",
        ] {
            assert!(p.contains(field), "missing field '{field}'");
        }
    }
}
