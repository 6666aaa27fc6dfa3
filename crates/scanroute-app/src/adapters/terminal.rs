//! Operator conversation over stdin/stdout.

use async_trait::async_trait;
use scanroute_core::{
    Candidate, CandidateChoice, ConfidenceTier, OperatorPrompt, PipelineError, PipelineResult,
    ScanJob,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};
use tokio::sync::Mutex;
use tracing::warn;

/// Interactive prompt reading answers line by line from stdin.
pub struct TerminalPrompt {
    defer_keyword: String,
    input: Mutex<Lines<BufReader<Stdin>>>,
}

impl TerminalPrompt {
    /// Prompt that advertises `defer_keyword` as the way to stage a scan.
    #[must_use]
    pub fn new(defer_keyword: impl Into<String>) -> Self {
        Self {
            defer_keyword: defer_keyword.into(),
            input: Mutex::new(BufReader::new(tokio::io::stdin()).lines()),
        }
    }

    async fn ask(&self, question: &str) -> PipelineResult<Option<String>> {
        let mut input = self.input.lock().await;
        write_out(question).await?;
        let line = input
            .next_line()
            .await
            .map_err(|err| PipelineError::unavailable("prompt.read", err.to_string()))?;
        Ok(line.map(|line| line.trim().to_string()))
    }
}

async fn write_out(text: &str) -> PipelineResult<()> {
    let mut stdout = tokio::io::stdout();
    stdout
        .write_all(text.as_bytes())
        .await
        .map_err(|err| PipelineError::unavailable("prompt.write", err.to_string()))?;
    stdout
        .flush()
        .await
        .map_err(|err| PipelineError::unavailable("prompt.write", err.to_string()))
}

const fn tier_label(tier: ConfidenceTier) -> &'static str {
    match tier {
        ConfidenceTier::Exact => "exact",
        ConfidenceTier::Strong => "strong",
        ConfidenceTier::Weak => "weak",
    }
}

/// Render candidates as a numbered list, one per line.
#[must_use]
pub fn render_candidates(candidates: &[Candidate]) -> String {
    candidates
        .iter()
        .enumerate()
        .map(|(index, candidate)| {
            format!(
                "  [{}] {} ({})\n",
                index + 1,
                candidate.label,
                tier_label(candidate.confidence)
            )
        })
        .collect()
}

/// Interpret an answer to the candidate list.
#[must_use]
pub fn parse_choice(answer: &str, candidates: usize, defer_keyword: &str) -> CandidateChoice {
    let answer = answer.trim();
    if answer.eq_ignore_ascii_case(defer_keyword) {
        return CandidateChoice::Deferred;
    }
    match answer.parse::<usize>() {
        Ok(number) if (1..=candidates).contains(&number) => CandidateChoice::Selected(number - 1),
        _ => CandidateChoice::SearchAgain,
    }
}

#[async_trait]
impl OperatorPrompt for TerminalPrompt {
    async fn prompt_search_term(&self, job: &ScanJob) -> PipelineResult<Option<String>> {
        let question = format!(
            "\nScan {} is ready ({} roll(s)).\nSearch by email, order number or name ('{}' to defer): ",
            job.folder_name(),
            job.rolls.len(),
            self.defer_keyword
        );
        Ok(self.ask(&question).await?.filter(|term| !term.is_empty()))
    }

    async fn present_candidates(
        &self,
        _job: &ScanJob,
        candidates: &[Candidate],
    ) -> PipelineResult<CandidateChoice> {
        let question = format!(
            "{}Pick a number, '{}' to defer, or Enter to search again: ",
            render_candidates(candidates),
            self.defer_keyword
        );
        Ok(self
            .ask(&question)
            .await?
            .map_or(CandidateChoice::SearchAgain, |answer| {
                parse_choice(&answer, candidates.len(), &self.defer_keyword)
            }))
    }

    async fn report_status(&self, message: &str) {
        if let Err(err) = write_out(&format!("→ {message}\n")).await {
            warn!(error = %err, "failed to write operator status");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(number: &str, confidence: ConfidenceTier) -> Candidate {
        Candidate {
            order_id: format!("order-{number}"),
            order_number: number.into(),
            label: format!("#{number} Jeff Example <jeff@example.com>"),
            customer_email: "jeff@example.com".into(),
            customer_id: None,
            customer_root: None,
            confidence,
        }
    }

    #[test]
    fn choices_are_one_based_and_bounded() {
        assert_eq!(parse_choice("1", 2, "stage"), CandidateChoice::Selected(0));
        assert_eq!(parse_choice(" 2 ", 2, "stage"), CandidateChoice::Selected(1));
        assert_eq!(parse_choice("3", 2, "stage"), CandidateChoice::SearchAgain);
        assert_eq!(parse_choice("0", 2, "stage"), CandidateChoice::SearchAgain);
        assert_eq!(parse_choice("STAGE", 2, "stage"), CandidateChoice::Deferred);
        assert_eq!(parse_choice("", 2, "stage"), CandidateChoice::SearchAgain);
    }

    #[test]
    fn candidates_render_numbered_with_tier() {
        let rendered = render_candidates(&[
            candidate("100", ConfidenceTier::Exact),
            candidate("57", ConfidenceTier::Weak),
        ]);
        assert_eq!(
            rendered,
            "  [1] #100 Jeff Example <jeff@example.com> (exact)\n  [2] #57 Jeff Example <jeff@example.com> (weak)\n"
        );
    }
}
