use colored::Colorize;

pub fn handle_error(err: anyhow::Error) -> ! {
    eprintln!("{} {:#}", "Error:".red().bold(), err);

    let msg = err.to_string().to_lowercase();

    if msg.contains("configuration error") {
        eprintln!("\n{}", "Suggestion:".yellow().bold());
        eprintln!("  Inspect the effective configuration with:");
        eprintln!("  {} chatlink config show", "$".dimmed());
    }

    if msg.contains("database") || msg.contains("lock") {
        eprintln!("\n{}", "Suggestion:".yellow().bold());
        eprintln!("  Check that no other chatlink process uses the same --db-path.");
    }

    std::process::exit(1);
}
