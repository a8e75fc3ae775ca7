mod cli;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Command};
use framewright::config::FramewrightConfig;
use framewright::workflow::OrderStatus;
use framewright::{demo, logging, ui};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = FramewrightConfig::load_from(&cli.config)?;
    logging::init(&config.log_level, cli.verbose);

    match cli.command {
        Command::Demo {
            orders,
            failure_rate,
        } => {
            let progress = ui::DemoProgress::start((orders * OrderStatus::PIPELINE.len()) as u64);
            let report = demo::run(&config, orders, failure_rate, &progress).await?;
            progress.finish();

            for (order, history) in report.orders.iter().zip(&report.histories) {
                ui::print_history(order, history);
            }
            ui::print_metrics(&report.metrics);
            println!();
            println!(
                "{}/{} orders picked up, {} transitions failed, {} customers notified",
                report.picked_up(),
                report.orders.len(),
                report.failed_transitions,
                report.notifications_sent
            );
        }
        Command::Profiles => {
            let registry = config.registry();
            let profiles: serde_json::Map<String, serde_json::Value> = registry
                .names()
                .into_iter()
                .filter_map(|name| {
                    let profile = registry.profile(&name)?;
                    Some((name, serde_json::to_value(profile).ok()?))
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&profiles)?);
        }
        Command::Backoff { dependency } => {
            let operation = config.registry().require(&dependency)?;
            ui::print_backoff(&dependency, &operation.retry_policy().schedule());
        }
    }

    Ok(())
}
