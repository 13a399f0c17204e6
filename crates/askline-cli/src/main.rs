use std::io::{IsTerminal, Write};

use anyhow::Result;
use askline_core::args::CommonArgs;
use askline_core::config::ClientConfig;
use askline_core::{AskError, QueryEngine, Reference, Reply, logging};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

const NO_ANSWER: &str = "No answer received. Please try again.";
const REFS_COMMAND: &str = "$refs";

// ── CLI ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(
    name = "askline",
    version,
    about = "askline: ask a question, get a web-search backed answer"
)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    /// Maximum number of references printed after a one-shot answer
    #[arg(long, value_name = "N", default_value_t = 5)]
    max_refs: usize,

    /// Question to ask; omit for interactive mode
    #[arg(value_name = "QUESTION")]
    question: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.common.log_config());

    let mut config = ClientConfig::load(cli.common.config_path())?;
    cli.common.apply_overrides(&mut config);
    let mut engine = QueryEngine::new(config)?;

    if cli.question.is_empty() {
        interactive(&mut engine).await
    } else {
        let question = cli.question.join(" ");
        one_shot(&mut engine, &question, cli.max_refs).await;
        Ok(())
    }
}

async fn one_shot(engine: &mut QueryEngine, question: &str, max_refs: usize) {
    match engine.ask_answer(question).await {
        Ok(reply) => {
            println!("{}", answer_text(&reply));
            let refs = &reply.answer.references;
            if !reply.answer.is_empty() && !refs.is_empty() {
                println!("\nReferences:");
                for line in reference_lines(refs, max_refs) {
                    println!("{line}");
                }
            }
        }
        Err(err) => println!("{}", error_line(&err)),
    }
}

async fn interactive(engine: &mut QueryEngine) -> Result<()> {
    let tty = std::io::stdin().is_terminal();
    if tty {
        println!("askline v{}", env!("CARGO_PKG_VERSION"));
        println!("Type a question and press Enter. `{REFS_COMMAND}` shows the last references.");
        println!("Press Ctrl+D to quit.\n");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut references: Vec<Reference> = Vec::new();

    loop {
        if tty {
            print!("> ");
            std::io::stdout().flush()?;
        }
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let prompt = line.trim();
        if prompt.is_empty() {
            continue;
        }

        if prompt.contains(REFS_COMMAND) {
            if references.is_empty() {
                println!("No references available from last answer.\n");
            } else {
                println!("\nReferences:");
                for line in reference_lines(&references, references.len()) {
                    println!("{line}");
                }
                println!();
            }
            continue;
        }

        match engine.ask_answer(prompt).await {
            Ok(reply) => {
                println!("{}\n", answer_text(&reply));
                references = reply.answer.references;
            }
            Err(err) => println!("{}\n", error_line(&err)),
        }
    }
    Ok(())
}

fn answer_text(reply: &Reply) -> &str {
    if !reply.answer.is_empty() {
        &reply.answer.text
    } else if let Some(error) = reply.error() {
        error
    } else {
        NO_ANSWER
    }
}

fn reference_lines(refs: &[Reference], max: usize) -> Vec<String> {
    refs.iter()
        .take(max)
        .enumerate()
        .map(|(i, r)| {
            let name = if r.name.is_empty() { "Unknown" } else { &r.name };
            let url = if r.url.is_empty() { "No URL" } else { &r.url };
            format!("[^{}]: {name} - {url}", i + 1)
        })
        .collect()
}

fn error_line(err: &AskError) -> String {
    format!("Error: {err}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use askline_core::{AnswerResult, Fragment};
    use serde_json::json;

    fn reference(name: &str, url: &str) -> Reference {
        Reference {
            name: name.into(),
            url: url.into(),
        }
    }

    #[test]
    fn test_reference_lines_are_numbered_and_capped() {
        let refs: Vec<Reference> = (1..=7)
            .map(|n| reference(&format!("R{n}"), &format!("http://r/{n}")))
            .collect();
        let lines = reference_lines(&refs, 5);
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[0], "[^1]: R1 - http://r/1");
        assert_eq!(lines[4], "[^5]: R5 - http://r/5");
    }

    #[test]
    fn test_reference_placeholders() {
        let lines = reference_lines(&[reference("", "")], 5);
        assert_eq!(lines, vec!["[^1]: Unknown - No URL"]);
    }

    #[test]
    fn test_answer_text_fallbacks() {
        let timed_out = Reply::from_fragments(vec![Fragment::timed_out()]);
        assert_eq!(answer_text(&timed_out), "Timed out.");

        let empty = Reply::from_fragments(vec![Fragment::ack(json!({"status": "done"}))]);
        assert_eq!(answer_text(&empty), NO_ANSWER);

        let answered = Reply {
            fragments: Vec::new(),
            answer: AnswerResult {
                text: "Paris".into(),
                references: Vec::new(),
            },
        };
        assert_eq!(answer_text(&answered), "Paris");
    }

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::parse_from(["askline", "--max-refs", "2", "what", "is", "rust"]);
        assert_eq!(cli.max_refs, 2);
        assert_eq!(cli.question.join(" "), "what is rust");

        let cli = Cli::parse_from(["askline"]);
        assert_eq!(cli.max_refs, 5);
        assert!(cli.question.is_empty());
    }
}
