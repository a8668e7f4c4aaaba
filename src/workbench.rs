use std::io::Write as _;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};

use crate::core::state::AppState;
use crate::session::model::{AssessmentType, ContextNote, CriterionAssessment, Justification};
use crate::session::{GradingSession, Phase};
use crate::services::oracle::AssessmentOptions;

/// Interactive driver for one grading session: reads commands from stdin,
/// prints state to stdout, and keeps every oracle failure non-fatal.
pub(crate) struct WorkbenchRuntime {
    state: AppState,
    session: GradingSession,
}

impl WorkbenchRuntime {
    pub(crate) fn new(state: AppState) -> Self {
        let options = AssessmentOptions {
            assessment_type: state.settings().grading().assessment_type,
            assessment_length: state.settings().grading().assessment_length,
        };
        let session = GradingSession::new(state.oracle(), state.sink(), options);
        Self { state, session }
    }

    pub(crate) async fn run(&mut self) -> Result<()> {
        self.load_inputs().await?;
        print_help();

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            print!("> ");
            std::io::stdout().flush().context("Failed to flush prompt")?;

            let Some(line) = lines.next_line().await.context("Failed to read command")? else {
                break;
            };
            let command = line.trim().to_string();
            if command.is_empty() {
                continue;
            }
            if command == "quit" || command == "exit" {
                break;
            }

            if let Err(error) = self.dispatch(&command, &mut lines).await {
                println!("error: {error:#}");
            }
        }

        tracing::info!("Workbench session ended");
        Ok(())
    }

    async fn load_inputs(&mut self) -> Result<()> {
        let essay_path = self.state.settings().grading().essay_path.clone();
        let rubric_path = self.state.settings().grading().rubric_path.clone();

        let essay = tokio::fs::read_to_string(&essay_path)
            .await
            .with_context(|| format!("Failed to read essay from {essay_path}"))?;
        self.session.set_document_text(&essay).context("Essay was rejected")?;

        let rubric = tokio::fs::read_to_string(&rubric_path)
            .await
            .with_context(|| format!("Failed to read rubric from {rubric_path}"))?;
        self.session.set_rubric_text(&rubric).context("Rubric was rejected")?;

        if let Some(document) = self.session.document() {
            println!(
                "Loaded essay {} ({} pages) and rubric from {rubric_path}.",
                &document.essay_id()[..12],
                document.page_count()
            );
        }
        Ok(())
    }

    async fn dispatch(
        &mut self,
        command: &str,
        lines: &mut Lines<BufReader<Stdin>>,
    ) -> Result<()> {
        if command == "help" {
            print_help();
            return Ok(());
        }

        if command == "start" {
            self.session.start_grading().await?;
            self.show_current();
            return Ok(());
        }

        if let Some(rest) = command.strip_prefix("context") {
            let Some((title, content)) = rest.split_once('|') else {
                println!("usage: context <title> | <content>");
                return Ok(());
            };
            self.session.add_context_note(ContextNote {
                title: title.trim().to_string(),
                content: content.trim().to_string(),
            })?;
            println!("Context note added ({} total).", self.session.context_notes().len());
            return Ok(());
        }

        if command == "show" {
            self.show_current();
            return Ok(());
        }

        if command == "assess" {
            self.session.assess_current().await?;
            self.show_current();
            return Ok(());
        }

        if let Some(rest) = command.strip_prefix("score") {
            let Ok(score) = rest.trim().parse::<i32>() else {
                println!("usage: score <integer>");
                return Ok(());
            };
            self.session.set_teacher_score(score)?;
            println!("Your score is recorded. Type reveal to compare with the model.");
            return Ok(());
        }

        if command == "reveal" {
            match self.session.reveal_ai_score()? {
                Some(score) => println!("Model score: {score}"),
                None => println!("The model did not produce a score for this criterion."),
            }
            return Ok(());
        }

        if command == "edit" {
            let Some(justification) = self.read_edit(lines).await? else {
                return Ok(());
            };
            self.session.submit_justification_edit(justification).await?;
            println!("Revision resolved.");
            self.show_current();
            return Ok(());
        }

        if command == "next" {
            self.session.advance().await?;
            self.show_current();
            return Ok(());
        }

        if command == "prev" {
            self.session.retreat()?;
            self.show_current();
            return Ok(());
        }

        if command == "finish" {
            self.session.finish().await?;
            self.show_overall();
            return Ok(());
        }

        if let Some(rest) = command.strip_prefix("grade") {
            let Ok(grade) = rest.trim().parse::<f64>() else {
                println!("usage: grade <number from 0 to 10>");
                return Ok(());
            };
            self.session.edit_overall(None, None, None, Some(grade))?;
            println!("Final grade overridden.");
            return Ok(());
        }

        if command == "again" {
            self.session.grade_again()?;
            println!("Ready for another pass over the same essay. Type start.");
            return Ok(());
        }

        if command == "reset" {
            self.session.reset_all()?;
            println!("Everything cleared. Restart the workbench to load new files.");
            return Ok(());
        }

        if command == "metrics" {
            match crate::core::metrics::render() {
                Some(text) => println!("{text}"),
                None => println!("Prometheus recorder is disabled (set PROMETHEUS_ENABLED=1)."),
            }
            return Ok(());
        }

        println!("Unknown command; type help for the list.");
        Ok(())
    }

    async fn read_edit(
        &self,
        lines: &mut Lines<BufReader<Stdin>>,
    ) -> Result<Option<Justification>> {
        match self.session.options().assessment_type {
            AssessmentType::Flow => {
                println!("Enter the replacement paragraph; finish with a single '.' line.")
            }
            AssessmentType::Bullets => {
                println!("Enter one bullet per line; finish with a single '.' line.")
            }
        }

        let mut collected: Vec<String> = Vec::new();
        while let Some(line) = lines.next_line().await.context("Failed to read edit")? {
            if line.trim() == "." {
                let justification = match self.session.options().assessment_type {
                    AssessmentType::Flow => Justification::Prose(collected.join(" ")),
                    AssessmentType::Bullets => Justification::Bullets(collected),
                };
                return Ok(Some(justification));
            }
            collected.push(line.trim().to_string());
        }
        Ok(None)
    }

    fn show_current(&self) {
        match self.session.phase() {
            Phase::Idle => println!("No grading in progress. Type start to begin."),
            Phase::ExtractingCriteria => println!("Extracting criteria from the rubric."),
            Phase::Synthesizing => println!("Synthesizing the overall assessment."),
            Phase::Complete => self.show_overall(),
            Phase::Grading => {
                let Some(criterion) = self.session.current_criterion() else {
                    println!("No criterion is selected.");
                    return;
                };
                println!(
                    "[{}/{}] {} (scores {} to {})",
                    self.session.cursor() + 1,
                    self.session.criteria().len(),
                    criterion.name,
                    criterion.score_range.min,
                    criterion.score_range.max
                );
                for level in &criterion.levels {
                    println!("  {}: {}", level.score, level.description);
                }

                match self.session.current_assessment() {
                    None => println!("Assessment pending; type assess to request it."),
                    Some(assessment) => print_assessment(assessment),
                }
            }
        }
    }

    fn show_overall(&self) {
        let Some(overall) = self.session.overall() else {
            println!("No overall assessment yet.");
            return;
        };
        println!("Scores:");
        for criterion in self.session.criteria() {
            let Some(assessment) = self.session.assessment_for(&criterion.id) else {
                continue;
            };
            let yours = assessment
                .teacher_score
                .map_or_else(|| "-".to_string(), |score| score.to_string());
            let model = assessment
                .current()
                .ai_score
                .map_or_else(|| "-".to_string(), |score| score.to_string());
            println!(
                "  {}: yours {yours}, model {model} (max {})",
                criterion.name, criterion.score_range.max
            );
        }
        println!("Final grade: {}", overall.overall_grade);
        println!("Strengths: {}", overall.strengths);
        println!("Improvements: {}", overall.improvements);
        println!("Advice: {}", overall.advice);
    }
}

fn print_assessment(assessment: &CriterionAssessment) {
    let current = assessment.current();
    println!("Assessment:");
    match &current.justification {
        Justification::Prose(text) => println!("  {text}"),
        Justification::Bullets(items) => {
            for item in items {
                println!("  - {item}");
            }
        }
    }

    if !assessment.evidence.is_empty() {
        println!("Evidence:");
        for evidence in &assessment.evidence {
            let location = if evidence.location.is_empty() {
                String::new()
            } else {
                format!(" ({})", evidence.location)
            };
            println!("  \"{}\"{location}", evidence.quote);
        }
    }

    if let Some(rationale) = current.rationale.as_deref() {
        if !rationale.is_empty() {
            println!("Revision rationale: {rationale}");
        }
    }

    match assessment.teacher_score {
        Some(score) => println!("Your score: {score}"),
        None => println!("Your score: not entered (score <n>)"),
    }
    if assessment.score_revealed {
        match current.ai_score {
            Some(score) => println!("Model score: {score}"),
            None => println!("Model score: none"),
        }
    } else {
        println!("Model score: hidden until you commit your own and type reveal");
    }
}

fn print_help() {
    println!("Commands:");
    println!("  start                 extract criteria and begin grading");
    println!("  context <t> | <c>     add a context note before starting");
    println!("  show                  print the current criterion and assessment");
    println!("  assess                request the assessment if it is missing");
    println!("  score <n>             record your score for this criterion");
    println!("  reveal                show the model's score after yours is in");
    println!("  edit                  rewrite the justification and re-score");
    println!("  next / prev           move between criteria");
    println!("  finish                synthesize the overall assessment");
    println!("  grade <x>             override the final grade (after finish)");
    println!("  again                 grade the same essay again");
    println!("  reset                 clear everything");
    println!("  metrics               dump Prometheus metrics if enabled");
    println!("  quit                  leave the workbench");
}

pub(crate) async fn run(state: AppState) -> Result<()> {
    WorkbenchRuntime::new(state).run().await
}
