//! Line-oriented REPL over the same sandbox and ledger as the bot. The
//! principal is `"default"`, so the HTTP budgets apply across the session.

use std::sync::Arc;
use std::time::Duration;

use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;

use evalbot_core::command::format_result;
use evalbot_engine::ledger::HttpBudgetLedger;
use evalbot_engine::sandbox::Sandbox;

use crate::cli::Cli;

const REPL_PRINCIPAL: &str = "default";

pub async fn run_repl(cli: &Cli) -> anyhow::Result<()> {
    let ledger = Arc::new(HttpBudgetLedger::new(cli.http_limits()));
    let limits = cli.sandbox_limits();
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(60))
        .build()?;

    println!(
        "evalbot {} — sandboxed JavaScript, Ctrl+D exits",
        env!("CARGO_PKG_VERSION")
    );

    let mut editor = DefaultEditor::new()?;
    loop {
        match editor.readline("js> ") {
            Ok(line) => {
                let code = line.trim();
                if code.is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(code);

                let sandbox = Sandbox::new(&limits, ledger.clone(), http.clone()).await?;
                let outcome = sandbox.execute(code, REPL_PRINCIPAL).await;
                println!("{}", format_result(&outcome));
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(err) => return Err(err.into()),
        }
    }

    Ok(())
}
