use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::core::config::Settings;
use crate::schemas::oracle::{
    AssessmentPayload, CriterionPayload, ExtractionPayload, OverallPayload, RevisionPayload,
};
use crate::services::oracle::{
    AssessmentOptions, CriterionScoreSummary, GradingOracle, OracleError,
};
use crate::session::document::EssayDocument;
use crate::session::model::{
    AssessmentLength, AssessmentType, ContextNote, Justification, RubricCriterion,
};

const NO_RUBRIC_SENTINEL: &str = "NO_VALID_RUBRIC";

const EXTRACTION_TEMPERATURE: f64 = 0.1;
const ASSESSMENT_TEMPERATURE: f64 = 0.2;
const REVISION_TEMPERATURE: f64 = 0.2;
const SYNTHESIS_TEMPERATURE: f64 = 0.3;

/// Chat-completions adapter for the grading model. Every operation sends one
/// prompt, cleans the reply down to bare JSON, and retries exactly once on
/// the fallback model when the primary reports overload.
#[derive(Debug, Clone)]
pub(crate) struct AiOracleService {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    fallback_model: String,
    max_tokens: u32,
}

impl AiOracleService {
    pub(crate) fn from_settings(settings: &Settings) -> Result<Self> {
        let timeout = Duration::from_secs(settings.oracle().request_timeout);
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            api_key: settings.oracle().api_key.clone(),
            base_url: settings.oracle().base_url.trim_end_matches('/').to_string(),
            model: settings.oracle().model.clone(),
            fallback_model: settings.oracle().fallback_model.clone(),
            max_tokens: settings.oracle().max_tokens,
        })
    }

    async fn send_chat(
        &self,
        op: &'static str,
        prompt: String,
        temperature: f64,
    ) -> Result<String, OracleError> {
        let timer = Instant::now();
        let result = call_with_fallback(op, &self.model, &self.fallback_model, |model| {
            let prompt = prompt.clone();
            async move { self.call_chat(&model, &prompt, temperature).await }
        })
        .await;

        let elapsed = timer.elapsed().as_secs_f64();
        match &result {
            Ok(_) => {
                metrics::counter!("oracle_calls_total", "op" => op, "status" => "ok").increment(1);
                tracing::info!(op, duration_seconds = elapsed, "Oracle call completed");
            }
            Err(error) => {
                metrics::counter!("oracle_calls_total", "op" => op, "status" => "error")
                    .increment(1);
                tracing::warn!(op, error = %error, duration_seconds = elapsed, "Oracle call failed");
            }
        }

        result
    }

    async fn call_chat(
        &self,
        model: &str,
        prompt: &str,
        temperature: f64,
    ) -> Result<String, OracleError> {
        let url = format!("{}/chat/completions", self.base_url);
        let payload = json!({
            "model": model,
            "messages": [{"role": "user", "content": prompt}],
            "max_completion_tokens": self.max_tokens,
            "temperature": temperature,
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(classify_request_error)?;

        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);

        if !status.is_success() {
            if status == StatusCode::TOO_MANY_REQUESTS
                || status == StatusCode::SERVICE_UNAVAILABLE
                || is_overload_message(&body.to_string())
            {
                return Err(OracleError::Overloaded);
            }
            return Err(OracleError::Transport(format!("API error {status}: {body}")));
        }

        let content = body
            .get("choices")
            .and_then(|choices| choices.get(0))
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(|value| value.as_str())
            .ok_or_else(|| OracleError::BadPayload("missing response content".to_string()))?;

        Ok(content.trim().to_string())
    }
}

#[async_trait]
impl GradingOracle for AiOracleService {
    async fn extract_criteria(
        &self,
        rubric_text: &str,
    ) -> Result<ExtractionPayload, OracleError> {
        let prompt = build_extraction_prompt(rubric_text);
        let reply = self.send_chat("extract_criteria", prompt, EXTRACTION_TEMPERATURE).await?;
        parse_extraction(&reply)
    }

    async fn assess_criterion(
        &self,
        document: &EssayDocument,
        criterion: &RubricCriterion,
        options: &AssessmentOptions,
        context_notes: &[ContextNote],
    ) -> Result<AssessmentPayload, OracleError> {
        let prompt = build_assessment_prompt(document, criterion, options, context_notes);
        let reply = self.send_chat("assess_criterion", prompt, ASSESSMENT_TEMPERATURE).await?;
        parse_object("assess_criterion", &reply)
    }

    async fn revise_score(
        &self,
        document: &EssayDocument,
        criterion: &RubricCriterion,
        original: &Justification,
        edited: &Justification,
        preceding_score: Option<f64>,
    ) -> Result<RevisionPayload, OracleError> {
        let prompt =
            build_revision_prompt(document, criterion, original, edited, preceding_score);
        let reply = self.send_chat("revise_score", prompt, REVISION_TEMPERATURE).await?;
        parse_object("revise_score", &reply)
    }

    async fn synthesize_overall(
        &self,
        document: &EssayDocument,
        summaries: &[CriterionScoreSummary],
        context_notes: &[ContextNote],
    ) -> Result<OverallPayload, OracleError> {
        let prompt = build_synthesis_prompt(document, summaries, context_notes);
        let reply = self.send_chat("synthesize_overall", prompt, SYNTHESIS_TEMPERATURE).await?;
        parse_object("synthesize_overall", &reply)
    }
}

/// One retry, on the fallback model, only for overload. Any failure of the
/// fallback attempt is reported as terminal overload; the underlying error
/// is logged before it is collapsed.
pub(super) async fn call_with_fallback<T, F, Fut>(
    op: &'static str,
    primary: &str,
    fallback: &str,
    mut call: F,
) -> Result<T, OracleError>
where
    F: FnMut(String) -> Fut,
    Fut: std::future::Future<Output = Result<T, OracleError>>,
{
    match call(primary.to_string()).await {
        Ok(value) => Ok(value),
        Err(OracleError::Overloaded) => {
            tracing::warn!(op, fallback_model = fallback, "Primary model overloaded, retrying once on fallback");
            metrics::counter!("oracle_fallback_total", "op" => op).increment(1);
            match call(fallback.to_string()).await {
                Ok(value) => Ok(value),
                Err(error) => {
                    tracing::error!(op, error = %error, "Fallback model also failed");
                    Err(OracleError::Overloaded)
                }
            }
        }
        Err(error) => Err(error),
    }
}

fn classify_request_error(error: reqwest::Error) -> OracleError {
    // A request that never completes is treated like an overloaded backend,
    // so it gets the same single fallback retry.
    if error.is_timeout() {
        return OracleError::Overloaded;
    }
    OracleError::Transport(error.to_string())
}

fn is_overload_message(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    lowered.contains("overloaded") || lowered.contains("unavailable") || lowered.contains("503")
}

fn strip_code_fences(text: &str) -> String {
    let mut cleaned = text.trim().to_string();
    for marker in ["```json", "```javascript", "```js", "```"] {
        cleaned = cleaned.replace(marker, "");
    }
    cleaned.trim().to_string()
}

fn extract_json_slice(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    if end > start {
        Some(&text[start..=end])
    } else {
        None
    }
}

fn parse_extraction(reply: &str) -> Result<ExtractionPayload, OracleError> {
    let cleaned = strip_code_fences(reply);
    if cleaned.eq_ignore_ascii_case(NO_RUBRIC_SENTINEL) {
        return Ok(ExtractionPayload::NotARubric);
    }

    let slice = extract_json_slice(&cleaned, '[', ']')
        .ok_or_else(|| OracleError::BadPayload("no JSON array in response".to_string()))?;
    let entries: Vec<CriterionPayload> = serde_json::from_str(slice)
        .map_err(|err| OracleError::BadPayload(format!("criteria payload: {err}")))?;
    Ok(ExtractionPayload::Criteria(entries))
}

fn parse_object<T: DeserializeOwned>(op: &str, reply: &str) -> Result<T, OracleError> {
    let cleaned = strip_code_fences(reply);
    let slice = extract_json_slice(&cleaned, '{', '}')
        .ok_or_else(|| OracleError::BadPayload(format!("{op}: no JSON object in response")))?;
    serde_json::from_str(slice)
        .map_err(|err| OracleError::BadPayload(format!("{op} payload: {err}")))
}

fn context_block(context_notes: &[ContextNote]) -> String {
    if context_notes.is_empty() {
        return String::new();
    }

    let mut block = String::from("CONTEXT DUMP:\n");
    for note in context_notes {
        block.push_str(&format!("- {}: {}\n", note.title, note.content));
    }
    block.push('\n');
    block
}

fn build_extraction_prompt(rubric_text: &str) -> String {
    format!(
        "If the provided text is not a grading rubric, or you are not confident you can \
         extract meaningful criteria, respond with the string: {NO_RUBRIC_SENTINEL} (no JSON, \
         no explanation).\n\n\
         Analyze the following grading rubric and extract each criterion.\n\
         For each criterion, identify:\n\
         1. The name of the criterion\n\
         2. The possible score range (e.g., 1-5)\n\
         3. The description for each score level\n\n\
         RUBRIC:\n{rubric_text}\n\n\
         FORMAT YOUR RESPONSE AS A VALID JSON ARRAY with objects containing:\n\
         {{\n\
           \"id\": number,\n\
           \"name\": \"criterion name\",\n\
           \"scoreRange\": {{ \"min\": number, \"max\": number }},\n\
           \"levels\": [\n\
             {{ \"score\": number, \"description\": \"description for this score level\" }}\n\
           ]\n\
         }}\n\n\
         DO NOT include any explanatory text before or after the JSON array.\n\
         ONLY return the JSON array and nothing else."
    )
}

fn build_assessment_prompt(
    document: &EssayDocument,
    criterion: &RubricCriterion,
    options: &AssessmentOptions,
    context_notes: &[ContextNote],
) -> String {
    let (justification_instruction, justification_schema) = match options.assessment_type {
        AssessmentType::Bullets => (
            "Present your justification as bullet points. Return the justification as a JSON \
             array of strings, where each string is a bullet point.",
            "\"justification\": [\"bullet point 1\", \"bullet point 2\"],",
        ),
        AssessmentType::Flow => (
            "Present your justification as a coherent paragraph. Return the justification as a \
             single string.",
            "\"justification\": \"Your detailed justification without revealing the exact score\",",
        ),
    };

    let length_instruction = match options.assessment_length {
        AssessmentLength::Short => "Be concise and brief.",
        AssessmentLength::Medium => "Be balanced in detail and length.",
        AssessmentLength::Long => "Be detailed and extended.",
    };

    format!(
        "{context}You are an expert essay grader of a masters level course. Grade the following \
         essay based on a single criterion from a rubric. Your assessment must include specific \
         references to the rubric criterion, quoting or paraphrasing the relevant rubric \
         language as appropriate. Be critical and concise like a masters level professor would \
         be.\n\n\
         CRITERION: {name}\n\
         SCORE RANGE: {min} to {max}\n\n\
         ESSAY:\n{essay}\n\n\
         Provide the following in your response:\n\
         1. A justification for your assessment (without revealing the exact score). \
         {justification_instruction} {length_instruction}\n\
         2. At least 3 specific quotes from the essay that support your assessment\n\
         3. For each evidence quote, indicate which sentences or bullet points from your \
         justification it supports. Return the indexes (starting from 0) as a field \
         \"relatedAssessmentIndexes\" in each evidence object. If the justification is a \
         paragraph, treat each sentence as a unit (split on periods, exclamation marks, or \
         question marks). If it is a list, use each bullet as a unit.\n\
         4. Your numerical score ({min}-{max})\n\n\
         FORMAT YOUR RESPONSE AS A VALID JSON object:\n\
         {{\n\
           {justification_schema}\n\
           \"evidence\": [\n\
             {{\n\
               \"quote\": \"exact quote from essay\",\n\
               \"paragraph\": \"paragraph number or location\",\n\
               \"relatedAssessmentIndexes\": [0]\n\
             }}\n\
           ],\n\
           \"score\": number\n\
         }}\n\n\
         DO NOT include any explanatory text before or after the JSON object.\n\
         ONLY return the JSON object and nothing else.",
        context = context_block(context_notes),
        name = criterion.name,
        min = criterion.score_range.min,
        max = criterion.score_range.max,
        essay = document.text(),
    )
}

fn build_revision_prompt(
    document: &EssayDocument,
    criterion: &RubricCriterion,
    original: &Justification,
    edited: &Justification,
    preceding_score: Option<f64>,
) -> String {
    let score_text =
        preceding_score.map_or_else(|| "not recorded".to_string(), |score| score.to_string());

    format!(
        "You are an expert essay grader. The following is an essay, a rubric criterion, and two \
         versions of the justification for the assessment of this criterion: the original \
         justification (from an AI) and an edited justification (from a human reviewer). The \
         original numerical score was {score_text}.\n\n\
         Please carefully consider the edited justification. If the edits suggest a different \
         score is warranted, revise the score accordingly. Otherwise, keep the original score. \
         Provide a brief rationale for your decision.\n\n\
         ESSAY:\n{essay}\n\n\
         CRITERION: {name}\n\
         SCORE RANGE: {min} to {max}\n\n\
         ORIGINAL JUSTIFICATION:\n{original_text}\n\n\
         EDITED JUSTIFICATION:\n{edited_text}\n\n\
         ORIGINAL SCORE: {score_text}\n\n\
         FORMAT YOUR RESPONSE AS A VALID JSON object:\n\
         {{\n\
           \"revisedScore\": number,\n\
           \"rationale\": \"A brief explanation for your decision\"\n\
         }}\n\n\
         DO NOT include any explanatory text before or after the JSON object.\n\
         ONLY return the JSON object and nothing else.",
        essay = document.text(),
        name = criterion.name,
        min = criterion.score_range.min,
        max = criterion.score_range.max,
        original_text = original.as_text(),
        edited_text = edited.as_text(),
    )
}

fn build_synthesis_prompt(
    document: &EssayDocument,
    summaries: &[CriterionScoreSummary],
    context_notes: &[ContextNote],
) -> String {
    let criteria_text = summaries
        .iter()
        .map(|summary| {
            format!("{}: Score {} out of {}", summary.name, summary.score, summary.max)
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "{context}You are an expert essay grader. Given the following essay and the scores for \
         each criterion, provide an overall assessment. Summarize the essay's strengths and \
         areas for improvement. Then, generate a final grade on a 0-10 scale (with decimals \
         allowed), where the individual criterion scores are on their own scales. The final \
         grade should reflect the average performance across all criteria, converted to a \
         10-point scale.\n\n\
         Present strengths as a coherent paragraph. Present areas for improvement as a coherent \
         paragraph.\n\n\
         ESSAY:\n{essay}\n\n\
         CRITERIA & SCORES:\n{criteria_text}\n\n\
         FORMAT YOUR RESPONSE AS A VALID JSON OBJECT with the following keys:\n\
         {{\n\
           \"strengths\": string,\n\
           \"improvements\": string,\n\
           \"overallGrade\": number,\n\
           \"advice\": string\n\
         }}",
        context = context_block(context_notes),
        essay = document.text(),
    )
}
