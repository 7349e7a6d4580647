use anyhow::{Context, Result};
use chatlink_core::local::{
    ExcerptSummarizer, InMemoryAccountDirectory, InMemoryConversationLog, ScriptedAgent,
    StaticPlatformDirectory,
};
use chatlink_core::{
    ChannelType, ChatlinkConfig, Clock, Collaborators, DispatchOutcome, InboundEvent,
    MessageDispatcher, RedbConversationLog, ReplyKind, Sweeper, SystemClock,
};
use chatlink_traits::{ConversationLog, PlatformProfile};
use colored::Colorize;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::info;

use crate::cli::ChatArgs;

const QUIT_COMMANDS: &[&str] = &["/quit", "/exit"];

pub async fn run(config_path: Option<&Path>, args: ChatArgs) -> Result<()> {
    let config = ChatlinkConfig::load(config_path)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let (code_tx, mut code_rx) = mpsc::unbounded_channel();
    let accounts = Arc::new(InMemoryAccountDirectory::new().with_outbox(code_tx));
    if let Some(email) = &args.seed_account {
        let account = accounts.add_account(email, None);
        info!("Seeded account {} for {}", account.id, email);
    }

    let platform = Arc::new(StaticPlatformDirectory::new());
    platform.add_profile(
        &args.user,
        PlatformProfile {
            email: args.email.clone(),
            display_name: Some(args.user.clone()),
            locale: None,
        },
    );

    let log: Arc<dyn ConversationLog> = match &args.db_path {
        Some(path) => {
            let db = chatlink_storage::open_database(path)
                .with_context(|| format!("failed to open database {}", path.display()))?;
            Arc::new(RedbConversationLog::new(db, clock.clone())?)
        }
        None => Arc::new(InMemoryConversationLog::new(clock.clone())),
    };

    let dispatcher = MessageDispatcher::new(
        &config,
        Collaborators {
            accounts,
            platform,
            log,
            summarizer: Arc::new(ExcerptSummarizer::new()),
            agent: Arc::new(ScriptedAgent::new()),
        },
        clock,
    )?;

    let sweeper = Sweeper::new(
        dispatcher.sessions(),
        dispatcher.rate_limiter(),
        dispatcher.contexts(),
        config.session.sweep_interval(),
    )
    .start();

    println!(
        "{} chatting as {} in {} (type /quit to leave)",
        "chatlink".bold(),
        args.user.cyan(),
        args.workspace.cyan()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if QUIT_COMMANDS.contains(&line.trim()) {
            break;
        }

        let event = InboundEvent::new(
            ChannelType::Console,
            &args.user,
            &args.workspace,
            uuid::Uuid::new_v4().to_string(),
            line,
        );
        let outcome = dispatcher.dispatch(&event).await;
        print_outcome(&outcome);

        while let Ok((email, code)) = code_rx.try_recv() {
            println!(
                "{} verification code for {}: {}",
                "[mail]".dimmed(),
                email,
                code.bold()
            );
        }
    }

    sweeper.stop().await;
    Ok(())
}

fn print_outcome(outcome: &DispatchOutcome) {
    let Some(reply) = outcome.reply() else {
        return;
    };
    let label = match reply.kind {
        ReplyKind::Answer => "bot".green(),
        ReplyKind::Prompt => "bot".cyan(),
        ReplyKind::Notice => "bot".yellow(),
        ReplyKind::Confirmation => "bot?".magenta(),
        ReplyKind::Error => "bot".red(),
    };
    println!("{} {}", label.bold(), reply.text);
}
