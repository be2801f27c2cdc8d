//! Instruction template sent with every image analysis.
//!
//! The model is asked to answer in markdown with exactly five `### N. Title`
//! sections. [`SECTION_TITLES`] is the single source of those titles; the
//! research step and the tests locate sections through it.

use serde::{Deserialize, Serialize};

pub const SECTION_TITLES: [&str; 5] = [
    "Image Type & Region",
    "Key Findings",
    "Diagnostic Assessment",
    "Patient-Friendly Explanation",
    "Research Context",
];

/// Optional hints about what was imaged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptParams {
    pub modality: Option<String>,
    pub region: Option<String>,
}

impl PromptParams {
    pub fn new(modality: Option<String>, region: Option<String>) -> Self {
        Self { modality, region }
    }
}

/// Formats the header line for section `index` (zero based).
pub fn section_header(index: usize) -> String {
    format!("### {}. {}", index + 1, SECTION_TITLES[index])
}

pub fn build_analysis_prompt(params: &PromptParams) -> String {
    let modality = params.modality.as_deref().and_then(single_line);
    let region = params.region.as_deref().and_then(single_line);

    let opening = match (modality, region) {
        (Some(m), Some(r)) => format!("Analyze the uploaded {} of the {}.", m, r),
        (Some(m), None) => format!("Analyze the uploaded {}.", m),
        (None, Some(r)) => format!("Analyze the uploaded image of the {}.", r),
        (None, None) => "Analyze the patient's medical image.".to_string(),
    };

    let bodies: [&str; 5] = [
        "- Specify the imaging modality (X-ray/MRI/CT/Ultrasound/etc.)
- Identify the anatomical region and patient positioning
- Comment on image quality and technical adequacy",
        "- List the primary observations systematically
- Describe any abnormality precisely: location, size, shape and characteristics
- Include measurements and densities where relevant
- Rate severity: Normal/Mild/Moderate/Severe",
        "- Give the primary diagnosis with a confidence level
- List differential diagnoses in order of likelihood
- Support each diagnosis with evidence observed in the image
- Flag any critical or urgent findings",
        "- Explain the findings in simple, clear language the patient can understand
- Avoid medical jargon or define it when it is unavoidable
- Use a visual analogy if it helps
- Address common patient concerns about these findings",
        "- Summarize recent medical literature about similar cases
- Outline standard treatment protocols
- Mention relevant technological advances
- Include 2-3 key references with links",
    ];

    let mut prompt = String::new();
    prompt.push_str(
        "You are a highly skilled medical imaging expert with extensive knowledge in radiology and diagnostic imaging. ",
    );
    prompt.push_str(&opening);
    prompt.push_str(" Structure your response as follows:\n\n");

    for (index, body) in bodies.iter().enumerate() {
        prompt.push_str(&section_header(index));
        prompt.push('\n');
        prompt.push_str(body);
        prompt.push_str("\n\n");
    }

    prompt.push_str(
        "Format your response using clear markdown headers and bullet points. Be concise yet thorough.\n",
    );
    prompt
}

/// Collapses user-supplied text onto one line so it cannot introduce headers.
fn single_line(value: &str) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    let collapsed = collapsed.trim_start_matches('#').trim().to_string();
    if collapsed.is_empty() { None } else { Some(collapsed) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_count(prompt: &str) -> usize {
        prompt.lines().filter(|l| l.starts_with("### ")).count()
    }

    #[test]
    fn default_prompt_has_five_sections_in_order() {
        let prompt = build_analysis_prompt(&PromptParams::default());
        let headers: Vec<_> = prompt.lines().filter(|l| l.starts_with("### ")).collect();
        assert_eq!(
            headers,
            vec![
                "### 1. Image Type & Region",
                "### 2. Key Findings",
                "### 3. Diagnostic Assessment",
                "### 4. Patient-Friendly Explanation",
                "### 5. Research Context",
            ]
        );
    }

    #[test]
    fn parameters_are_named_in_opening() {
        let params = PromptParams::new(Some("X-ray".into()), Some("Chest".into()));
        let prompt = build_analysis_prompt(&params);
        assert!(prompt.contains("Analyze the uploaded X-ray of the Chest."));
        assert_eq!(header_count(&prompt), 5);
    }

    #[test]
    fn hostile_parameters_cannot_add_headers() {
        let params = PromptParams::new(
            Some("MRI\n### 6. Extra".into()),
            Some("\n\n### Knee\n".into()),
        );
        let prompt = build_analysis_prompt(&params);
        assert_eq!(header_count(&prompt), 5);
        assert!(prompt.contains("Analyze the uploaded MRI ### 6. Extra of the Knee."));
    }

    #[test]
    fn blank_parameters_fall_back_to_generic_opening() {
        let params = PromptParams::new(Some("   ".into()), None);
        let prompt = build_analysis_prompt(&params);
        assert!(prompt.contains("Analyze the patient's medical image."));
    }

    #[test]
    fn prompt_is_deterministic() {
        let params = PromptParams::new(None, Some("Abdomen".into()));
        assert_eq!(build_analysis_prompt(&params), build_analysis_prompt(&params));
    }
}
