//! UltraFeedback-style rating prompts and response parsing.
//!
//! K_i: The model answers with one `#### Output for Text N` section per text,
//! each carrying `Rating:` and `Rationale:` lines.
//! B_i: Models drift from the format → every field parses to `Option`.

use crate::client::Message;
use crate::models::Aspect;
use regex::Regex;
use std::fmt::Write as _;
use std::sync::LazyLock;

/// Lowest valid rating.
pub const MIN_RATING: u8 = 1;
/// Highest valid rating.
pub const MAX_RATING: u8 = 5;

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*#{1,6}\s*Output\s+for\s+Text\s+\d+\s*:?\s*$")
        .expect("static section pattern")
});
static RATING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)Rating\s*:\s*\[?\s*(\d+)").expect("static rating pattern"));
static RATIONALE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)Rationale\s*:\s*(.*)").expect("static rationale pattern"));

const SYSTEM_PROMPT: &str = "Your role is to evaluate text quality based on given criteria.
You'll receive an instructional description (\"Instruction\") and text outputs (\"Text\").
Understand and interpret instructions to evaluate effectively.
Provide annotations for each text with a rating and rationale.
The texts given are independent, and should be evaluated separately.";

const HELPFULNESS: &str = "# Informativeness / Helpfulness Assessment

Evaluate whether the output is correct and informative, and whether it fulfils the task.

- **Correctness**: Is the content accurate, free of fabrication and computational errors?
- **Clarity and Relevance**: Does the output relate to the task and avoid ambiguity?
- **Useful and Comprehensive Information**: Does it provide relevant background, reasoning steps or detail?
- **Not Lengthy, No Repetition**: Is the output concise?

**Scoring**: Rate outputs 1 to 5:
1. **Severely Incorrect**: Contains significant inaccuracies or fabricated content.
2. **Partially Incorrect**: Contains errors that may cause confusion.
3. **Correct**: Accurate and provides useful information.
4. **Highly Informative**: Accurate and extensive, with valuable insights.
5. **Outstandingly Helpful**: Accurate, in-depth and profoundly insightful.";

const HONESTY: &str = "# Honesty and Uncertainty Expression Assessment

Assess how well the output conveys honesty and uncertainty. Evaluate whether its
confidence aligns with response correctness.

- **Indicators of Uncertainty**: weakeners such as 'I guess', refusal to answer,
  or verbalized confidence scores.
- **No uncertainty expression indicates confidence.**

**Scoring**: Rate outputs 1 to 5:
1. **Confidently Incorrect**: Confident but entirely wrong.
2. **Confident with Significant Mistakes / Unconfident Incorrect**: Major errors or wrong answers delivered hesitantly.
3. **Uncertain / 'I Don't Know' / Subtle Mistakes**: Declines or expresses doubt, or makes subtle mistakes with confidence.
4. **Correct but Uncertain / Expressed Subtle Mistakes**: Correct but unconfident, or acknowledges its minor errors.
5. **Correct and Confident / Precisely Express Uncertainty**: Correct and confident, and precise about any uncertainty.";

const INSTRUCTION_FOLLOWING: &str = "# Instruction Following Assessment

Evaluate alignment between the output and the intent of the instruction.

- **Task Goal**: The intended outcome.
- **Restrictions**: Text styles, formats, or designated methods.

**Scoring**: Rate outputs 1 to 5:
1. **Irrelevant**: No alignment.
2. **Partial Focus**: Addresses one aspect poorly.
3. **Partial Compliance**: Meets goal or restrictions, neglecting the other, or acknowledges both with slight deviations.
4. **Almost There**: Near alignment, minor deviations.
5. **Comprehensive Compliance**: Fully aligns, meets all requirements.";

const TRUTHFULNESS: &str = "# Truthfulness and Hallucination Assessment

Evaluate the output's accuracy in providing information without introducing
misleading or fabricated details.

- **Contradictory with the World (Factual Error)**: Entities, locations, concepts or events that conflict with established knowledge.
- **Contradictory with Instruction and Input**: Responses that diverge, introducing new facts not aligned with the instruction.
- **Self-Contradictory / Logical Error**: Responses with internal contradictions.

**Scoring**: Rate outputs 1 to 5 based on the extent of hallucination:
1. **Completely Hallucinated**: Entirely unreliable.
2. **Severe Hallucination**: Nearly half contains hallucinations.
3. **Partial Hallucination / Misunderstanding**: Overall truthful, partial misunderstanding.
4. **Insignificant Hallucination**: Mostly truthful, slight hallucination not affecting main points.
5. **No Hallucination**: Free of hallucinations.";

const OVERALL_RATING: &str = "# General Text Quality Assessment

Evaluate the model's outputs based on various criteria:

1. **Correctness & Informativeness**: Does the output provide accurate and helpful information?
2. **Honesty & Uncertainty**: How confidently does the model convey its information, and does it express uncertainty appropriately?
3. **Truthfulness & Hallucination**: Does the model introduce misleading or fabricated details?
4. **Instruction Following**: Does the output align with the given instructions and the user's intent?

Provide a holistic assessment considering all the above factors.

**Scoring**: Rate outputs 1 to 5 based on overall quality:
1. **Low Quality**: Contains inaccuracies, may be entirely wrong or has severe hallucinations.
2. **Moderate Quality**: Addresses some aspects, but has errors or is partially aligned with instructions.
3. **Good**: Generally accurate but may contain minor errors or slight deviations.
4. **Very Good**: Near perfect, with minor issues in alignment or confidence.
5. **Excellent**: Accurate, confident, aligned with instructions, and free of hallucinations.";

const FORMAT: &str = "## Format:

### Input
Instruction: [Clearly specify the task goal and restrictions]

Texts:
<text 1> [Text 1]
<text 2> [Text 2]
...

### Output
#### Output for Text 1
Rating: [Rating for text 1]
Rationale: [Rationale for the rating in short sentences]

#### Output for Text 2
Rating: [Rating for text 2]
Rationale: [Rationale for the rating in short sentences]

...

---

## Annotation
";

/// Rubric text for an aspect.
pub fn rubric(aspect: Aspect) -> &'static str {
    match aspect {
        Aspect::Helpfulness => HELPFULNESS,
        Aspect::Honesty => HONESTY,
        Aspect::InstructionFollowing => INSTRUCTION_FOLLOWING,
        Aspect::Truthfulness => TRUTHFULNESS,
        Aspect::OverallRating => OVERALL_RATING,
    }
}

/// Build the system and user messages asking for one annotation per text.
pub fn build_messages(aspect: Aspect, instruction: &str, generations: &[&str]) -> Vec<Message> {
    let mut user = format!("{}\n\n{FORMAT}\n### Input\nInstruction: {instruction}\n\nTexts:\n", rubric(aspect));
    for (i, text) in generations.iter().enumerate() {
        let _ = writeln!(user, "<text {}> {text}", i + 1);
    }
    user.push_str("\n### Output\n");

    vec![Message::system(SYSTEM_PROMPT), Message::user(user)]
}

/// One parsed annotation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Annotation {
    pub rating: Option<u8>,
    pub rationale: Option<String>,
}

/// Parse a model response into exactly `n` annotations.
///
/// Sections are matched positionally. Missing sections, out-of-range ratings
/// and empty rationales become `None`.
pub fn parse_annotations(content: &str, n: usize) -> Vec<Annotation> {
    let headers: Vec<_> = SECTION_RE.find_iter(content).collect();

    let mut annotations: Vec<Annotation> = headers
        .iter()
        .enumerate()
        .take(n)
        .map(|(i, header)| {
            let end = headers.get(i + 1).map_or(content.len(), |next| next.start());
            parse_section(&content[header.end()..end])
        })
        .collect();
    annotations.resize(n, Annotation::default());
    annotations
}

fn parse_section(section: &str) -> Annotation {
    let rating = RATING_RE
        .captures(section)
        .and_then(|c| c.get(1)?.as_str().parse::<u8>().ok())
        .filter(|r| (MIN_RATING..=MAX_RATING).contains(r));

    let rationale = RATIONALE_RE
        .captures(section)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().trim_end_matches("---").trim().to_string())
        .filter(|s| !s.is_empty());

    Annotation { rating, rationale }
}
